//! Pipeline configuration
//!
//! All fields have defaults tuned for small, frequent batches. Setters are
//! chainable and pure; [`PipelineConfig::validate_or_default`] normalizes
//! zero/invalid fields and is applied by every constructor.

use std::time::Duration;

/// Default input channel capacity
pub const DEFAULT_BUFFER_SIZE: u32 = 100;

/// Default batch size trigger
pub const DEFAULT_FLUSH_SIZE: u32 = 50;

/// Default interval for the time trigger
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Default grace period for the cancel-drain flush when none is configured
pub const DEFAULT_DRAIN_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Configuration for a batching pipeline
///
/// `flush_size` and `flush_interval` are starting values; both can be
/// adjusted at runtime through the pipeline's update methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Capacity of the bounded input channel
    pub buffer_size: u32,

    /// Batch size that triggers a flush
    pub flush_size: u32,

    /// Interval after which a non-empty batch is flushed
    pub flush_interval: Duration,

    /// Flush the pending batch (best effort, bounded) when the run is canceled
    pub drain_on_cancel: bool,

    /// Upper bound for the cancel-drain flush; zero means
    /// [`DEFAULT_DRAIN_GRACE_PERIOD`] is applied when draining is enabled
    pub drain_grace_period: Duration,

    /// Upper bound for the final flush after the input channel closes;
    /// zero disables the bound
    pub final_flush_on_close_timeout: Duration,

    /// Cap on concurrently running flush tasks in concurrent mode;
    /// zero means unlimited
    pub max_concurrent_flushes: u32,

    /// Reserved: allow batch container reuse strategies
    pub use_map_reuse: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_size: DEFAULT_FLUSH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            drain_on_cancel: false,
            drain_grace_period: Duration::ZERO,
            final_flush_on_close_timeout: Duration::ZERO,
            max_concurrent_flushes: 0,
            use_map_reuse: false,
        }
    }
}

impl PipelineConfig {
    /// Create a config with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the input channel capacity
    #[must_use]
    pub fn with_buffer_size(mut self, size: u32) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the batch size trigger
    #[must_use]
    pub fn with_flush_size(mut self, size: u32) -> Self {
        self.flush_size = size;
        self
    }

    /// Set the time trigger interval
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Enable or disable the bounded drain flush on cancellation
    #[must_use]
    pub fn with_drain_on_cancel(mut self, enabled: bool) -> Self {
        self.drain_on_cancel = enabled;
        self
    }

    /// Set the grace period for the cancel-drain flush
    #[must_use]
    pub fn with_drain_grace_period(mut self, period: Duration) -> Self {
        self.drain_grace_period = period;
        self
    }

    /// Set the deadline for the final flush after input-channel close
    #[must_use]
    pub fn with_final_flush_on_close_timeout(mut self, timeout: Duration) -> Self {
        self.final_flush_on_close_timeout = timeout;
        self
    }

    /// Cap the number of concurrently running flush tasks
    #[must_use]
    pub fn with_max_concurrent_flushes(mut self, max: u32) -> Self {
        self.max_concurrent_flushes = max;
        self
    }

    /// Replace zero/invalid fields with their documented defaults
    #[must_use]
    pub fn validate_or_default(mut self) -> Self {
        if self.buffer_size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.flush_size == 0 {
            self.flush_size = DEFAULT_FLUSH_SIZE;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = DEFAULT_FLUSH_INTERVAL;
        }
        if self.drain_on_cancel && self.drain_grace_period.is_zero() {
            self.drain_grace_period = DEFAULT_DRAIN_GRACE_PERIOD;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.buffer_size, 100);
        assert_eq!(config.flush_size, 50);
        assert_eq!(config.flush_interval, Duration::from_millis(50));
        assert!(!config.drain_on_cancel);
        assert_eq!(config.drain_grace_period, Duration::ZERO);
        assert_eq!(config.final_flush_on_close_timeout, Duration::ZERO);
        assert_eq!(config.max_concurrent_flushes, 0);
        assert!(!config.use_map_reuse);
    }

    #[test]
    fn test_builder_setters() {
        let config = PipelineConfig::new()
            .with_buffer_size(4096)
            .with_flush_size(16)
            .with_flush_interval(Duration::from_millis(20))
            .with_drain_on_cancel(true)
            .with_drain_grace_period(Duration::from_millis(200))
            .with_final_flush_on_close_timeout(Duration::from_millis(50))
            .with_max_concurrent_flushes(2);

        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.flush_size, 16);
        assert_eq!(config.flush_interval, Duration::from_millis(20));
        assert!(config.drain_on_cancel);
        assert_eq!(config.drain_grace_period, Duration::from_millis(200));
        assert_eq!(config.final_flush_on_close_timeout, Duration::from_millis(50));
        assert_eq!(config.max_concurrent_flushes, 2);
    }

    #[test]
    fn test_setters_are_pure() {
        let base = PipelineConfig::new();
        let _ = base.clone().with_flush_size(999);
        assert_eq!(base.flush_size, DEFAULT_FLUSH_SIZE);
    }

    #[test]
    fn test_validate_replaces_zero_fields() {
        let config = PipelineConfig {
            buffer_size: 0,
            flush_size: 0,
            flush_interval: Duration::ZERO,
            drain_on_cancel: true,
            drain_grace_period: Duration::ZERO,
            final_flush_on_close_timeout: Duration::ZERO,
            max_concurrent_flushes: 0,
            use_map_reuse: false,
        }
        .validate_or_default();

        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.flush_size, DEFAULT_FLUSH_SIZE);
        assert_eq!(config.flush_interval, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(config.drain_grace_period, DEFAULT_DRAIN_GRACE_PERIOD);
        // Zero stays zero: these mean "disabled" / "unlimited".
        assert_eq!(config.final_flush_on_close_timeout, Duration::ZERO);
        assert_eq!(config.max_concurrent_flushes, 0);
    }

    #[test]
    fn test_validate_keeps_explicit_values() {
        let config = PipelineConfig::new()
            .with_buffer_size(7)
            .with_flush_size(3)
            .with_flush_interval(Duration::from_secs(1))
            .validate_or_default();

        assert_eq!(config.buffer_size, 7);
        assert_eq!(config.flush_size, 3);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_drain_grace_untouched_when_drain_disabled() {
        let config = PipelineConfig::new().validate_or_default();
        assert_eq!(config.drain_grace_period, Duration::ZERO);
    }
}
