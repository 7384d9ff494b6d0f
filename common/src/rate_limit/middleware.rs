use std::{
    future::Future,
    net::IpAddr,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
};
use tower::{Layer, Service};

use crate::{get_source_ip, rate_limit::RateLimiter};

/// Routes that must stay reachable for probes and scrapers even when a
/// client is being limited.
const EXEMPT_PATHS: &[&str] = &["/healthz", "/readyz", "/metrics"];

/// A Tower layer for Axum that rate-limits requests by client IP.
///
/// Behavior:
/// - Health, readiness, and metrics paths always pass through.
/// - The client IP comes from `X-Forwarded-For` (first entry) or
///   `X-Real-IP`; with neither present the request passes through.
/// - Cluster-internal source addresses are not limited.
/// - If denied by the limiter: returns `429 Too Many Requests`.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: RateLimiter,
}

fn is_cluster_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10
                || (o[0] == 192 && o[1] == 168)
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || v4.is_loopback()
        }
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if EXEMPT_PATHS.contains(&req.uri().path()) {
                return inner.call(req).await;
            }

            let Some(ip) = get_source_ip(req.headers()) else {
                // No forwarding headers: direct in-cluster traffic.
                return inner.call(req).await;
            };

            if is_cluster_internal(ip) {
                return inner.call(req).await;
            }

            if !limiter.check(ip).await {
                return Ok(Response::builder()
                    .status(StatusCode::TOO_MANY_REQUESTS)
                    .header("content-type", "application/json")
                    .body(Body::from("{\"error\":\"too many requests\"}"))
                    .unwrap());
            }

            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_are_internal() {
        for ip in ["10.0.0.1", "192.168.1.5", "172.16.0.9", "172.31.255.1", "127.0.0.1"] {
            assert!(is_cluster_internal(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["8.8.8.8", "172.32.0.1", "203.0.113.9"] {
            assert!(!is_cluster_internal(ip.parse().unwrap()), "{ip}");
        }
    }
}
