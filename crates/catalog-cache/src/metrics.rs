//! Cache metrics.
//!
//! Counters are emitted through the `metrics` facade. They are no-ops until
//! the host process installs a recorder (the server installs a Prometheus
//! one).

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_BACKEND_ERRORS_TOTAL: &str = "cache_backend_errors_total";
    pub const CACHE_ORIGIN_FETCHES_TOTAL: &str = "cache_origin_fetches_total";
    pub const CACHE_COALESCED_TOTAL: &str = "cache_coalesced_total";
    pub const CACHE_LOCK_CONTENTION_TOTAL: &str = "cache_lock_contention_total";
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";
}

/// Record a cache hit.
pub fn record_cache_hit(backend: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "backend" => backend).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss(backend: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "backend" => backend).increment(1);
}

/// Record a backend operation that failed and was degraded.
pub fn record_backend_error(operation: &'static str) {
    counter!(names::CACHE_BACKEND_ERRORS_TOTAL, "operation" => operation).increment(1);
}

/// Record an origin fetch. `outcome` is `found`, `not_found` or `error`.
pub fn record_origin_fetch(outcome: &'static str) {
    counter!(names::CACHE_ORIGIN_FETCHES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a caller that joined an in-flight fetch instead of starting one.
pub fn record_coalesced() {
    counter!(names::CACHE_COALESCED_TOTAL).increment(1);
}

/// Record a lock that was already held by someone else.
pub fn record_lock_contention() {
    counter!(names::CACHE_LOCK_CONTENTION_TOTAL).increment(1);
}

/// Record an invalidation. `scope` is `exact` or `pattern`.
pub fn record_invalidation(scope: &'static str, removed: u64) {
    counter!(names::CACHE_INVALIDATIONS_TOTAL, "scope" => scope).increment(removed);
}
