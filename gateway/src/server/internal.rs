use anyhow::{Context, Result};
use axum::{Router, middleware, routing::get};
use corral_common::access_log;
use owo_colors::OwoColorize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{app::App, sessions};

/// Cluster-internal surface: health probes plus the worker-facing
/// credential broker, reachable without traversing the public ingress.
/// Auth on the broker route is identical to the public copy; the
/// session-minted identity is what gates it, not the network.
pub async fn run_server(cancel: CancellationToken, port: u16, app_state: App) -> Result<()> {
    let health_router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let app = Router::new()
        .route(
            "/tenants/{tenant}/sessions/{name}/credentials/{provider}",
            get(sessions::worker_credentials),
        )
        .with_state(app_state)
        .layer(middleware::from_fn(access_log::internal));
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            eprintln!(
                "{}",
                format!("❌ Failed to bind server to {}: {}", addr, e).red()
            );
            e
        })
        .context("Failed to bind server")?;
    println!(
        "{}{}",
        "🚀 Starting internal gateway server • port=".green(),
        format!("{}", port).green().dimmed()
    );
    axum::serve(listener, app.merge(health_router))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .context("Failed to start server")?;
    println!("{}", "🛑 Internal server stopped gracefully.".red());
    Ok(())
}
