//! Shared metrics — atomic counters for observability.
//!
//! Wrapped in `Arc<Metrics>` and passed to the listener, the request
//! pipeline, and the worker pool. Prometheus exposition text is
//! formatted by hand in the admin module.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared metrics counters, all lock-free via AtomicU64.
#[derive(Default)]
pub struct Metrics {
    // ─── Front-end connections ───────────────────────────────────────────
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,

    // ─── Auth outcomes ───────────────────────────────────────────────────
    pub auth_requests: AtomicU64,
    pub auth_successes: AtomicU64,
    pub auth_failures: AtomicU64,
    pub auth_internal_failures: AtomicU64,
    pub auth_master_logins: AtomicU64,

    // ─── Cache ───────────────────────────────────────────────────────────
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_expired_fallbacks: AtomicU64,

    // ─── Worker pool ─────────────────────────────────────────────────────
    pub worker_requests: AtomicU64,
    pub worker_creates: AtomicU64,
    pub worker_destroys: AtomicU64,
    pub worker_timeouts: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by 1 and return the previous value.
    #[inline]
    pub fn inc(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Decrement a counter by 1.
    #[inline]
    pub fn dec(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }
}
