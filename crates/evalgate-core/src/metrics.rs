//! Global atomic counters for evalgate observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a CLI command).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free atomic counters.
pub struct Metrics {
    calls_issued: AtomicU64,
    retries: AtomicU64,
    transient_failures: AtomicU64,
    abandoned_calls: AtomicU64,
    commits: AtomicU64,
    diagnostics_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            calls_issued: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            abandoned_calls: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            diagnostics_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_calls(&self) {
        self.calls_issued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "calls_issued", "counter incremented");
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    pub fn inc_transient_failures(&self) {
        self.transient_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "transient_failures", "counter incremented");
    }

    pub fn inc_abandoned(&self) {
        self.abandoned_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "abandoned_calls", "counter incremented");
    }

    pub fn inc_commits(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "commits", "counter incremented");
    }

    pub fn inc_diagnostics_failures(&self) {
        self.diagnostics_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "diagnostics_failures", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            calls_issued = self.calls_issued(),
            retries = self.retries(),
            transient_failures = self.transient_failures(),
            abandoned_calls = self.abandoned_calls(),
            commits = self.commits(),
            diagnostics_failures = self.diagnostics_failures(),
        );
    }

    pub fn calls_issued(&self) -> u64 {
        self.calls_issued.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn transient_failures(&self) -> u64 {
        self.transient_failures.load(Ordering::Relaxed)
    }

    pub fn abandoned_calls(&self) -> u64 {
        self.abandoned_calls.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn diagnostics_failures(&self) -> u64 {
        self.diagnostics_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.calls_issued.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.transient_failures.store(0, Ordering::Relaxed);
        self.abandoned_calls.store(0, Ordering::Relaxed);
        self.commits.store(0, Ordering::Relaxed);
        self.diagnostics_failures.store(0, Ordering::Relaxed);
    }
}
