//! Pipeline error types
//!
//! Lifecycle errors are returned from the perform entry points; flush errors
//! travel through the error channel and are treated as opaque values.

use std::time::Duration;

use thiserror::Error;

/// Boxed error type returned by user flush functions
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The run exited because its cancellation token fired
    #[error("pipeline context is closed")]
    ContextClosed,

    /// The run exited on cancellation after a best-effort drain flush
    #[error("pipeline context is closed (drain flush performed)")]
    ContextDrained,

    /// A second concurrent start was attempted on the same instance
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// The input channel is closed; no more items can be sent
    #[error("pipeline input channel is closed")]
    ChannelClosed,

    /// The input channel buffer is full (non-blocking send failed)
    #[error("pipeline input channel is full")]
    ChannelFull,

    /// The event loop failed internally (e.g. a recovered panic)
    #[error("perform loop error: {0}")]
    PerformLoop(String),

    /// A user flush function returned an error
    #[error("flush failed: {0}")]
    Flush(#[source] BoxError),

    /// A deadline-bounded flush (final or drain) was cut off
    #[error("flush timed out after {0:?}")]
    FlushTimeout(Duration),
}

impl PipelineError {
    /// True when the run exited because of cancellation, drained or not.
    ///
    /// Holds for both [`PipelineError::ContextClosed`] and
    /// [`PipelineError::ContextDrained`], mirroring a joined error value.
    pub fn is_context_closed(&self) -> bool {
        matches!(self, Self::ContextClosed | Self::ContextDrained)
    }

    /// True when a cancel-triggered drain flush was performed before exit.
    pub fn is_context_drained(&self) -> bool {
        matches!(self, Self::ContextDrained)
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
