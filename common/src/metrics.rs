use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::{Router, routing::get};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use owo_colors::OwoColorize;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::net::TcpListener;

use crate::shutdown::shutdown_signal;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static SERVER_STARTED: OnceLock<()> = OnceLock::new();

fn install_recorder_once() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install global metrics recorder")
    })
}

/// Starts the Prometheus scrape endpoint when `METRICS_PORT` is set.
/// Idempotent: repeated calls never start a second server.
pub fn maybe_spawn_metrics_server() {
    let Some(port) = metric_port_env() else {
        return;
    };
    let node_id = node_id_env().unwrap_or_else(|| "unknown".to_string());
    // Exit the whole process when any thread panics; the container
    // runtime restarts us in a clean state.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    if SERVER_STARTED.set(()).is_ok() {
        let _ = install_recorder_once();
        tokio::spawn(run_metrics_server(port, node_id));
    }
}

pub async fn run_metrics_server(port: u16, node_id: String) {
    let handle = install_recorder_once().clone();
    let metrics_route = {
        let handle = handle.clone();
        axum::routing::get(move || async move { handle.render() })
    };
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", metrics_route)
        .layer(axum::middleware::from_fn(move |req: Request, next: Next| {
            record_http_metrics(node_id.clone(), req, next)
        }));
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            eprintln!("🛑 Failed to bind metrics server to {}: {}", addr, e);
            e
        })
        .unwrap();
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    let started = Instant::now();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to serve metrics");
    println!(
        "{} {}",
        "🛑 Metrics server stopped gracefully • uptime was".red(),
        format!("{:.2?}", started.elapsed()).red().dimmed()
    );
}

/// Axum middleware that records request count, latency histogram, and
/// an in-flight gauge. Uses `MatchedPath` to avoid high-cardinality
/// raw URLs.
pub async fn record_http_metrics(node_id: String, req: Request, next: Next) -> axum::response::Response {
    let start = Instant::now();
    let method = req.method().as_str().to_owned();
    let route: String = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_owned())
        .unwrap_or_else(|| "UNKNOWN".to_string());

    let in_flight = gauge!("http_server_in_flight_requests", "method" => method.clone());
    in_flight.increment(1);

    let res = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();
    let status = res.status().as_u16().to_string();

    histogram!(
        "http_server_request_duration_seconds",
        "method" => method.clone(),
        "route"  => route.clone(),
        "status" => status.clone(),
        "node_id" => node_id.clone()
    )
    .record(elapsed);

    counter!(
        "http_server_requests_total",
        "method" => method,
        "route"  => route,
        "status" => status,
        "node_id" => node_id
    )
    .increment(1);

    in_flight.decrement(1);

    res
}

fn metric_port_env() -> Option<u16> {
    std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
}

fn node_id_env() -> Option<String> {
    std::env::var("NODE_ID").ok()
}
