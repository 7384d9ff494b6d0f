#![cfg(feature = "metrics")]

use http_body_util::Full;
use hyper::{Request, Response, body::Bytes, service::service_fn};
use hyper_util::rt::TokioIo;
use owo_colors::OwoColorize;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, TextEncoder, register_histogram_vec,
    register_int_counter_vec,
};

/// Per-controller Prometheus instruments, labelled by object and the
/// action the read phase decided on.
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = register_int_counter_vec!(
            format!("corral_{}_reconciles_total", controller),
            "Total reconciliations per managed resource",
            &["name", "namespace"]
        )
        .expect("register reconcile counter");
        let action_counter = register_int_counter_vec!(
            format!("corral_{}_actions_total", controller),
            "Actions decided by the read phase",
            &["name", "namespace", "action"]
        )
        .expect("register action counter");
        let read_histogram = register_histogram_vec!(
            format!("corral_{}_read_duration_seconds", controller),
            "Duration of the reconcile read phase",
            &["name", "namespace", "action"]
        )
        .expect("register read histogram");
        let write_histogram = register_histogram_vec!(
            format!("corral_{}_write_duration_seconds", controller),
            "Duration of the reconcile write phase",
            &["name", "namespace", "action"]
        )
        .expect("register write histogram");
        Self {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}

fn render() -> Vec<u8> {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::default_registry().gather(), &mut buf) {
        eprintln!("{}", format!("failed to encode metrics: {e}").red());
    }
    buf
}

async fn serve_one(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/metrics" => Response::builder()
            .header("content-type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(render())))
            .unwrap(),
        "/healthz" | "/readyz" => Response::new(Full::new(Bytes::from_static(b"ok"))),
        _ => Response::builder()
            .status(404)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    };
    Ok(response)
}

/// Serves the operator's Prometheus registry when `METRICS_PORT` is
/// set. Plain hyper; nothing here depends on the controller.
pub fn maybe_spawn_metrics_server() {
    let Some(port) = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
    else {
        return;
    };
    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{}", port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                eprintln!(
                    "{}",
                    format!("🛑 Failed to bind metrics server to {}: {}", addr, e).red()
                );
                return;
            }
        };
        println!(
            "{}{}",
            "📈 Starting operator metrics server • port=".green(),
            format!("{}", port).green().dimmed()
        );
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service_fn(serve_one))
                    .await;
            });
        }
    });
}
