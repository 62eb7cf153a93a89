//! Global atomic counters for MITS observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    commands_executed: AtomicU64,
    tests_passed: AtomicU64,
    tests_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            commands_executed: AtomicU64::new(0),
            tests_passed: AtomicU64::new(0),
            tests_failed: AtomicU64::new(0),
        }
    }

    /// Count one command completed through a session.
    pub fn inc_commands_executed(&self) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "commands_executed", "counter incremented");
    }

    pub fn inc_tests_passed(&self) {
        self.tests_passed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tests_passed", "counter incremented");
    }

    pub fn inc_tests_failed(&self) {
        self.tests_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tests_failed", "counter incremented");
    }

    /// Count a verdict in the matching counter.
    pub fn record_verdict(&self, passed: bool) {
        if passed {
            self.inc_tests_passed();
        } else {
            self.inc_tests_failed();
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            commands_executed = self.commands_executed(),
            tests_passed = self.tests_passed(),
            tests_failed = self.tests_failed(),
        );
    }

    pub fn commands_executed(&self) -> u64 {
        self.commands_executed.load(Ordering::Relaxed)
    }

    pub fn tests_passed(&self) -> u64 {
        self.tests_passed.load(Ordering::Relaxed)
    }

    pub fn tests_failed(&self) -> u64 {
        self.tests_failed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.commands_executed.store(0, Ordering::Relaxed);
        self.tests_passed.store(0, Ordering::Relaxed);
        self.tests_failed.store(0, Ordering::Relaxed);
    }
}
