use anyhow::{Context, Result};
use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use corral_common::{
    access_log,
    args::RateLimiterArgs,
    cors,
    rate_limit::{RateLimiter, middleware::RateLimitLayer},
};
use owo_colors::OwoColorize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{app::App, credentials, flags, sessions};

pub async fn run_server(
    cancel: CancellationToken,
    port: u16,
    app_state: App,
    rate_limit: RateLimiterArgs,
) -> Result<()> {
    let limiter = RateLimiter::new(rate_limit.into());
    let api_router = Router::new()
        .route(
            "/tenants/{tenant}/sessions",
            post(sessions::create).get(sessions::list),
        )
        .route(
            "/tenants/{tenant}/sessions/{name}",
            get(sessions::get).delete(sessions::delete),
        )
        .route(
            "/tenants/{tenant}/sessions/{name}/cancel",
            post(sessions::cancel),
        )
        .route(
            "/tenants/{tenant}/sessions/{name}/approve",
            post(sessions::approve),
        )
        .route(
            "/tenants/{tenant}/sessions/{name}/credentials/{provider}",
            get(sessions::worker_credentials),
        )
        .route("/tenants/{tenant}/flags", get(flags::list))
        .route(
            "/tenants/{tenant}/flags/{flag}/evaluate",
            get(flags::evaluate),
        )
        .route(
            "/tenants/{tenant}/flags/{flag}/override",
            put(flags::put_override).delete(flags::delete_override),
        )
        .route(
            "/auth/integrations/status",
            get(credentials::integrations_status),
        )
        .route(
            "/auth/github-app/install",
            get(credentials::github_app_install),
        )
        .route(
            "/auth/github-app/callback",
            get(credentials::github_app_callback),
        )
        .route("/auth/{provider}/connect", post(credentials::connect))
        .route("/auth/{provider}/status", get(credentials::status))
        .route("/auth/{provider}/disconnect", post(credentials::disconnect))
        .with_state(app_state)
        .layer(middleware::from_fn(corral_common::middleware::create_context))
        .layer(middleware::from_fn(access_log::public))
        .layer(RateLimitLayer::new(limiter))
        .layer(cors::dev());
    let health_router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
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
        "🚀 Starting public gateway server • port=".green(),
        format!("{}", port).green().dimmed()
    );
    axum::serve(listener, api_router.merge(health_router))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .context("Failed to start server")?;
    println!("{}", "🛑 Public server stopped gracefully.".red());
    Ok(())
}
