//! In-process operation metrics.
//!
//! Atomic counters snapshotted on demand; no exporter dependency. The
//! server logs a snapshot periodically and surfaces it in diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for one node's activity.
#[derive(Debug, Default)]
pub struct NodeMetrics {
    checks: AtomicU64,
    expands: AtomicU64,
    lookups: AtomicU64,
    dispatches_forwarded: AtomicU64,
    gc_cycles: AtomicU64,
    gc_rows_removed: AtomicU64,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expand(&self) {
        self.expands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded_dispatch(&self) {
        self.dispatches_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gc_cycle(&self, rows_removed: u64) {
        self.gc_cycles.fetch_add(1, Ordering::Relaxed);
        self.gc_rows_removed.fetch_add(rows_removed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            expands: self.expands.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            dispatches_forwarded: self.dispatches_forwarded.load(Ordering::Relaxed),
            gc_cycles: self.gc_cycles.load(Ordering::Relaxed),
            gc_rows_removed: self.gc_rows_removed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub checks: u64,
    pub expands: u64,
    pub lookups: u64,
    pub dispatches_forwarded: u64,
    pub gc_cycles: u64,
    pub gc_rows_removed: u64,
}

/// Times one operation from construction.
pub struct OpTimer {
    started: Instant,
}

impl OpTimer {
    pub fn new() -> Self {
        Self { started: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

impl Default for OpTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = NodeMetrics::new();
        metrics.record_check();
        metrics.record_check();
        metrics.record_gc_cycle(42);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.checks, 2);
        assert_eq!(snapshot.gc_cycles, 1);
        assert_eq!(snapshot.gc_rows_removed, 42);
        assert_eq!(snapshot.expands, 0);
    }

    #[test]
    fn timer_measures_something() {
        let timer = OpTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.elapsed_ms() >= 1);
    }
}
