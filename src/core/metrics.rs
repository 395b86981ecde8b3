// src/core/metrics.rs

//! Defines and registers Prometheus metrics for proxy monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, HistogramVec, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_histogram_vec,
};

/// Labels shared by every per-response metric.
const HANDLER_LABELS: &[&str] = &["ratelimit", "hit", "code", "method", "schema"];

lazy_static! {
    // --- Handler metrics, one observation per completed request ---
    /// Time to first body byte, in milliseconds.
    pub static ref RESPONSE_TTFB: HistogramVec = register_histogram_vec!(
        "elinproxy_handler_response_ttfb",
        "Response TTFB",
        HANDLER_LABELS
    ).unwrap();
    /// Total response time, in milliseconds.
    pub static ref RESPONSE_TIME: HistogramVec = register_histogram_vec!(
        "elinproxy_handler_response_time",
        "Response time",
        HANDLER_LABELS
    ).unwrap();
    /// Count of responses by status code.
    pub static ref RESPONSE_CODE: CounterVec = register_counter_vec!(
        "elinproxy_handler_response_code",
        "Response code",
        HANDLER_LABELS
    ).unwrap();
    /// Bytes written to clients.
    pub static ref RESPONSE_SIZE: CounterVec = register_counter_vec!(
        "elinproxy_handler_response_size",
        "Response size",
        HANDLER_LABELS
    ).unwrap();

    // --- Cache engine metrics ---
    /// Number of live entries in the in-memory tier.
    pub static ref CACHE_ITEMS: Gauge =
        register_gauge!("elinproxy_cache_items", "Number of live entries in the memory tier.").unwrap();
    /// The total number of successful cache lookups.
    pub static ref CACHE_HITS_TOTAL: Counter =
        register_counter!("elinproxy_cache_hits_total", "Total number of cache hits.").unwrap();
    /// The total number of failed cache lookups.
    pub static ref CACHE_MISSES_TOTAL: Counter =
        register_counter!("elinproxy_cache_misses_total", "Total number of cache misses.").unwrap();
    /// The total number of cache items evicted by the expiration sweeper.
    pub static ref CACHE_EVICTIONS_TOTAL: Counter =
        register_counter!("elinproxy_cache_evictions_total", "Total number of cache keys evicted.").unwrap();
    /// The total number of items migrated from the memory tier to the disk tier.
    pub static ref CACHE_DISK_MIGRATIONS_TOTAL: Counter =
        register_counter!("elinproxy_cache_disk_migrations_total", "Total number of items migrated to disk segments.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
