//! Stream counters shared between the streaming thread and monitors
//!
//! The transfer completion loop is the only writer while a session runs;
//! any number of monitor threads may read. Every field is an independent
//! atomic, so a [`CounterSnapshot`] is per-field consistent but not a
//! single atomic cut across fields.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-session transfer counters
#[derive(Debug, Default)]
pub struct StreamCounters {
    /// Total payload bytes received since the session started
    bytes_xferred: AtomicU64,
    /// Transfers that completed with data
    successes: AtomicU64,
    /// Transfers that timed out or failed
    failures: AtomicU64,
    /// Bandwidth reports emitted
    bandwidth_reports: AtomicU64,
}

/// Point-in-time copy of [`StreamCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub bytes_xferred: u64,
    pub successes: u64,
    pub failures: u64,
    pub bandwidth_reports: u64,
}

impl StreamCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful transfer of `bytes` bytes
    pub fn record_success(&self, bytes: u64) {
        self.bytes_xferred.fetch_add(bytes, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a timed-out or failed transfer
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bandwidth_report(&self) {
        self.bandwidth_reports.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter (called when a session starts)
    pub fn reset(&self) {
        self.bytes_xferred.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.bandwidth_reports.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_xferred: self.bytes_xferred.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bandwidth_reports: self.bandwidth_reports.load(Ordering::Relaxed),
        }
    }
}
