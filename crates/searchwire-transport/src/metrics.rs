//! Transport metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct MetricsSnapshot {
    /// Logical requests started.
    pub requests_total: u64,
    /// Physical attempts sent.
    pub attempts_total: u64,
    /// Attempts beyond the first of a logical request.
    pub retries_total: u64,
    /// Logical requests that ended with a node response.
    pub responses_total: u64,
    /// Responses surfaced as `ResponseError`.
    pub response_errors_total: u64,
    /// Attempts that failed below HTTP.
    pub transport_failures_total: u64,
    /// Logical requests that hit their deadline.
    pub timeouts_total: u64,
    /// Times a connection was marked dead.
    pub marked_dead_total: u64,
    /// Resurrect evaluations.
    pub resurrect_attempts_total: u64,
    /// Resurrect evaluations that brought a node back.
    pub resurrect_successes_total: u64,
    /// Sniffs run.
    pub sniffs_total: u64,
    /// Sniffs that failed.
    pub sniff_failures_total: u64,
}

/// Thread-safe transport metrics collector.
pub struct TransportMetrics {
    requests_total: AtomicU64,
    attempts_total: AtomicU64,
    retries_total: AtomicU64,
    responses_total: AtomicU64,
    response_errors_total: AtomicU64,
    transport_failures_total: AtomicU64,
    timeouts_total: AtomicU64,
    marked_dead_total: AtomicU64,
    resurrect_attempts_total: AtomicU64,
    resurrect_successes_total: AtomicU64,
    sniffs_total: AtomicU64,
    sniff_failures_total: AtomicU64,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// Creates a collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            attempts_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            responses_total: AtomicU64::new(0),
            response_errors_total: AtomicU64::new(0),
            transport_failures_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            marked_dead_total: AtomicU64::new(0),
            resurrect_attempts_total: AtomicU64::new(0),
            resurrect_successes_total: AtomicU64::new(0),
            sniffs_total: AtomicU64::new(0),
            sniff_failures_total: AtomicU64::new(0),
        }
    }

    /// Increments the logical request counter.
    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the attempt counter, and the retry counter for attempts after the first.
    pub fn inc_attempts(&self, attempt: u32) {
        self.attempts_total.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.retries_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increments the responses counter.
    pub fn inc_responses(&self) {
        self.responses_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the response error counter.
    pub fn inc_response_errors(&self) {
        self.response_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the transport failure counter.
    pub fn inc_transport_failures(&self) {
        self.transport_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the deadline timeout counter.
    pub fn inc_timeouts(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the mark-dead counter.
    pub fn inc_marked_dead(&self) {
        self.marked_dead_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the resurrect attempt counter.
    pub fn inc_resurrect_attempts(&self) {
        self.resurrect_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the resurrect success counter.
    pub fn inc_resurrect_successes(&self) {
        self.resurrect_successes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished sniff.
    pub fn record_sniff(&self, success: bool) {
        self.sniffs_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.sniff_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            attempts_total: self.attempts_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            responses_total: self.responses_total.load(Ordering::Relaxed),
            response_errors_total: self.response_errors_total.load(Ordering::Relaxed),
            transport_failures_total: self.transport_failures_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            marked_dead_total: self.marked_dead_total.load(Ordering::Relaxed),
            resurrect_attempts_total: self.resurrect_attempts_total.load(Ordering::Relaxed),
            resurrect_successes_total: self.resurrect_successes_total.load(Ordering::Relaxed),
            sniffs_total: self.sniffs_total.load(Ordering::Relaxed),
            sniff_failures_total: self.sniff_failures_total.load(Ordering::Relaxed),
        }
    }
}
