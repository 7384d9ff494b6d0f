use std::{
    collections::HashMap,
    net::IpAddr,
    ops::Deref,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::args::RateLimiterArgs;

pub mod middleware;

/// Token-bucket ingress limiting keyed by client IP. State is process
/// local: buckets refill continuously at `rps` up to `burst`, and idle
/// entries are purged so the map stays bounded by active clients.
#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Sustained refill rate, tokens per second
    pub rps: f64,
    /// Bucket capacity
    pub burst: u32,
    /// Entries untouched for this long are evicted
    pub idle_evict: Duration,
}

impl From<RateLimiterArgs> for RateLimiterConfig {
    fn from(args: RateLimiterArgs) -> Self {
        Self {
            rps: args.rate_limit_rps,
            burst: args.rate_limit_burst,
            idle_evict: Duration::from_secs(args.rate_limit_idle_evict_seconds),
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rps: 10.0,
            burst: 50,
            idle_evict: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_seen: Instant,
}

/// Refills `bucket` for the time elapsed since it was last touched and
/// tries to take one token. Pure with respect to the passed clock.
fn refill_and_take(bucket: &mut Bucket, now: Instant, rps: f64, burst: f64) -> bool {
    let elapsed = now.saturating_duration_since(bucket.last_seen);
    bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * rps).min(burst);
    bucket.last_seen = now;
    if bucket.tokens >= 1.0 {
        bucket.tokens -= 1.0;
        true
    } else {
        false
    }
}

struct Buckets {
    map: HashMap<IpAddr, Bucket>,
    last_evict: Instant,
}

pub struct RateLimiterInner {
    buckets: Mutex<Buckets>,
    config: RateLimiterConfig,
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

impl Deref for RateLimiter {
    type Target = RateLimiterInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                buckets: Mutex::new(Buckets {
                    map: HashMap::new(),
                    last_evict: Instant::now(),
                }),
                config,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    /// Returns true if the request from `ip` is allowed.
    pub async fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now()).await
    }

    async fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().await;
        if now.saturating_duration_since(buckets.last_evict) > self.config.idle_evict {
            let idle = self.config.idle_evict;
            buckets
                .map
                .retain(|_, b| now.saturating_duration_since(b.last_seen) <= idle);
            buckets.last_evict = now;
        }
        let burst = self.config.burst as f64;
        let bucket = buckets.map.entry(ip).or_insert(Bucket {
            tokens: burst,
            last_seen: now,
        });
        refill_and_take(bucket, now, self.config.rps, burst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(tokens: f64, last_seen: Instant) -> Bucket {
        Bucket { tokens, last_seen }
    }

    #[test]
    fn burst_drains_then_denies() {
        let now = Instant::now();
        let mut b = bucket(3.0, now);
        assert!(refill_and_take(&mut b, now, 1.0, 3.0));
        assert!(refill_and_take(&mut b, now, 1.0, 3.0));
        assert!(refill_and_take(&mut b, now, 1.0, 3.0));
        assert!(!refill_and_take(&mut b, now, 1.0, 3.0));
    }

    #[test]
    fn refill_restores_tokens_at_rps() {
        let start = Instant::now();
        let mut b = bucket(0.0, start);
        assert!(!refill_and_take(&mut b, start, 2.0, 10.0));
        // 1 second at 2 rps = 2 tokens; one is taken.
        assert!(refill_and_take(&mut b, start + Duration::from_secs(1), 2.0, 10.0));
        assert!(refill_and_take(&mut b, start + Duration::from_secs(1), 2.0, 10.0));
        assert!(!refill_and_take(&mut b, start + Duration::from_secs(1), 2.0, 10.0));
    }

    #[test]
    fn refill_never_exceeds_burst() {
        let start = Instant::now();
        let mut b = bucket(0.0, start);
        refill_and_take(&mut b, start + Duration::from_secs(3600), 10.0, 5.0);
        assert!(b.tokens <= 5.0);
    }

    #[tokio::test]
    async fn idle_buckets_are_evicted() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rps: 1.0,
            burst: 1,
            idle_evict: Duration::from_secs(60),
        });
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let start = Instant::now();
        assert!(limiter.check_at(ip, start).await);
        assert!(!limiter.check_at(ip, start).await);
        // Touch far in the future from a different IP to trigger eviction.
        let other: IpAddr = "203.0.113.8".parse().unwrap();
        let later = start + Duration::from_secs(3600);
        assert!(limiter.check_at(other, later).await);
        let buckets = limiter.buckets.lock().await;
        assert!(!buckets.map.contains_key(&ip));
    }
}
