// src/server/ratelimit.rs

//! IP-keyed token bucket gating backend dispatch.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Idle buckets are forgotten after this long.
const BUCKET_TTL: Duration = Duration::from_secs(3600);

/// How often the cleanup pass runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// A token bucket per client IP. Tokens replenish continuously at the
/// configured rate; burst capacity equals one second worth of tokens.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Arc<DashMap<IpAddr, Bucket>>,
    rate: f64,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u32) -> Self {
        let buckets: Arc<DashMap<IpAddr, Bucket>> = Arc::new(DashMap::new());

        let cleanup = Arc::clone(&buckets);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                let now = Instant::now();
                cleanup.retain(|_, b| now.duration_since(b.last_seen) < BUCKET_TTL);
            }
        });

        Self {
            buckets,
            rate: rate_per_sec as f64,
        }
    }

    /// Takes one token for this IP, reporting whether the request may pass.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(ip).or_insert_with(|| Bucket {
            tokens: self.rate,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.rate);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            debug!("rate limit exceeded for {ip}");
            false
        }
    }
}
