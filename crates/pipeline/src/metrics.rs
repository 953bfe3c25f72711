//! Pipeline metrics
//!
//! Atomic counters tracking the event loop and flush path.
//! All operations use relaxed ordering; values are eventually consistent.

use std::sync::atomic::{AtomicU64, Ordering};

/// Internal counters for one pipeline instance
///
/// Safe to read from any thread while the loop is running. These counters
/// complement the injectable [`crate::MetricsHook`]: they are always on and
/// carry no user code.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Items consumed from the input channel
    items_received: AtomicU64,

    /// Flush calls dispatched (any outcome)
    flushes: AtomicU64,

    /// Flush calls that returned an error
    flush_errors: AtomicU64,

    /// Flush calls that panicked and were recovered
    flush_panics: AtomicU64,

    /// Deadline-bounded flushes cut off before completion
    flush_timeouts: AtomicU64,

    /// Errors dropped because the error channel was full
    errors_dropped: AtomicU64,
}

impl PipelineMetrics {
    /// Create a new metrics instance with all counters at zero
    #[inline]
    pub const fn new() -> Self {
        Self {
            items_received: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_errors: AtomicU64::new(0),
            flush_panics: AtomicU64::new(0),
            flush_timeouts: AtomicU64::new(0),
            errors_dropped: AtomicU64::new(0),
        }
    }

    /// Record items consumed from the input channel
    #[inline]
    pub(crate) fn record_received(&self, count: u64) {
        self.items_received.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a dispatched flush call
    #[inline]
    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a flush error
    #[inline]
    pub(crate) fn record_flush_error(&self) {
        self.flush_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a recovered flush panic
    #[inline]
    pub(crate) fn record_flush_panic(&self) {
        self.flush_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a flush cut off by its deadline
    #[inline]
    pub(crate) fn record_flush_timeout(&self) {
        self.flush_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error dropped on a full error channel
    #[inline]
    pub(crate) fn record_error_dropped(&self) {
        self.errors_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_received: self.items_received.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_errors: self.flush_errors.load(Ordering::Relaxed),
            flush_panics: self.flush_panics.load(Ordering::Relaxed),
            flush_timeouts: self.flush_timeouts.load(Ordering::Relaxed),
            errors_dropped: self.errors_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of pipeline metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Items consumed from the input channel
    pub items_received: u64,
    /// Flush calls dispatched
    pub flushes: u64,
    /// Flush calls that returned an error
    pub flush_errors: u64,
    /// Recovered flush panics
    pub flush_panics: u64,
    /// Deadline-bounded flushes cut off
    pub flush_timeouts: u64,
    /// Errors dropped on a full error channel
    pub errors_dropped: u64,
}
