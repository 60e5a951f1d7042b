//! # Operation Observers
//!
//! Purpose: Let callers count what the client does without coupling the hot
//! path to a metrics backend.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: `ClientMetrics` aggregates events in atomic
//!    counters; recording never allocates.
//! 2. **Fixed Buckets**: Latencies land in a contiguous array of buckets.
//! 3. **Plain Snapshots**: Readers get owned structs, never live references.
//!
//! ## Notes
//! - Every counter uses `Ordering::Relaxed`; fields are independent and only
//!   need eventual consistency.
//! - Misses and CAS conflicts are counted apart from errors; they are normal
//!   cache outcomes.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use memring_common::Status;
use serde::Serialize;

/// Default latency bucket boundaries in microseconds.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 12] =
    [50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000, 500_000];

/// Hooks called by the client. All methods default to no-ops.
pub trait OperationObserver: Send + Sync + Debug {
    /// An operation is about to be dispatched.
    fn on_start(&self, _operation: &'static str) {}

    /// An operation finished with `status`.
    fn on_finish(&self, _operation: &'static str, _status: Status, _latency: Duration) {}

    /// A node was taken out of service.
    fn on_node_failed(&self, _endpoint: &str) {}

    /// A dead node answered a ping and is back in service.
    fn on_node_revived(&self, _endpoint: &str) {}
}

/// Observer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl OperationObserver for NoopObserver {}

/// Snapshot of all client counters at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    /// Transport, protocol and server-side failures.
    pub errors_total: u64,
    /// `KeyNotFound` results.
    pub misses_total: u64,
    /// `KeyExists` results.
    pub conflicts_total: u64,
    pub inflight: u64,
    pub nodes_failed: u64,
    pub nodes_revived: u64,
    pub latency: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencySnapshot {
    pub bounds_us: Vec<u64>,
    /// Bucket counts, overflow bucket last.
    pub buckets: Vec<u64>,
    pub samples: u64,
    pub sum_us: u64,
}

impl LatencySnapshot {
    /// Upper bound of the bucket holding quantile `q` (0.0..=1.0).
    ///
    /// Returns `None` with no samples, `Some(u64::MAX)` for the overflow bucket.
    pub fn quantile_bound_us(&self, q: f64) -> Option<u64> {
        if self.samples == 0 {
            return None;
        }
        let target = ((self.samples as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (index, count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= target {
                return Some(self.bounds_us.get(index).copied().unwrap_or(u64::MAX));
            }
        }
        Some(u64::MAX)
    }
}

/// Thread-safe counters for one client.
#[derive(Debug)]
pub struct ClientMetrics {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    misses_total: AtomicU64,
    conflicts_total: AtomicU64,
    inflight: AtomicU64,
    nodes_failed: AtomicU64,
    nodes_revived: AtomicU64,
    latency: LatencyHistogram,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_US.to_vec())
    }

    /// Bounds must be ascending microseconds.
    pub fn with_latency_buckets(bounds_us: Vec<u64>) -> Self {
        ClientMetrics {
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            misses_total: AtomicU64::new(0),
            conflicts_total: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
            nodes_failed: AtomicU64::new(0),
            nodes_revived: AtomicU64::new(0),
            latency: LatencyHistogram::new(bounds_us),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            misses_total: self.misses_total.load(Ordering::Relaxed),
            conflicts_total: self.conflicts_total.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            nodes_failed: self.nodes_failed.load(Ordering::Relaxed),
            nodes_revived: self.nodes_revived.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

impl OperationObserver for ClientMetrics {
    fn on_start(&self, _operation: &'static str) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    fn on_finish(&self, _operation: &'static str, status: Status, latency: Duration) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        self.latency.record(latency);
        match status {
            Status::NoError => {}
            Status::KeyNotFound => {
                self.misses_total.fetch_add(1, Ordering::Relaxed);
            }
            status if status.is_conflict() => {
                self.conflicts_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_node_failed(&self, _endpoint: &str) {
        self.nodes_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_node_revived(&self, _endpoint: &str) {
        self.nodes_revived.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixed-bucket latency histogram with a linear bucket scan.
#[derive(Debug)]
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// `bounds_us.len() + 1` buckets; the last one is overflow.
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);
        let index = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}
