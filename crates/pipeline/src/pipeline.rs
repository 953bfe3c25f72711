//! Typed pipeline facades
//!
//! [`Pipeline`] is the public handle around the engine; it is cheap to clone
//! and safe to share between producer tasks. The two batch shapes are
//! exposed as type aliases with their own constructors:
//! [`StandardPipeline`] for ordered batches, [`DeduplicationPipeline`] for
//! keyed last-write-wins batches.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crossfire::MAsyncRx;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::engine::Engine;
use crate::error::{BoxError, PipelineError, Result};
use crate::hooks::{Logger, MetricsHook};
use crate::metrics::MetricsSnapshot;
use crate::processor::{Keyed, KeyedProcessor, OrderedProcessor, Processor};

/// Handle to a batching pipeline
///
/// All methods take `&self`; clones share the same instance. Exactly one
/// event loop can be live per instance at a time (see
/// [`Pipeline::sync_perform`]), but any number of clones may produce into
/// it concurrently.
pub struct Pipeline<P: Processor> {
    engine: Arc<Engine<P>>,
}

/// Pipeline with an insertion-ordered `Vec` batch
pub type StandardPipeline<T> = Pipeline<OrderedProcessor<T>>;

/// Pipeline with a keyed last-write-wins `HashMap` batch
pub type DeduplicationPipeline<T> = Pipeline<KeyedProcessor<T>>;

impl<P: Processor> Clone for Pipeline<P> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<T: Send + 'static> Pipeline<OrderedProcessor<T>> {
    /// Create an ordered pipeline with an explicit configuration
    ///
    /// The flush function receives a cancellation token and one batch; it
    /// must honor the token (and any deadline the engine applies) for
    /// shutdown bounds to hold.
    pub fn new<F, Fut>(config: PipelineConfig, flush: F) -> Self
    where
        F: Fn(CancellationToken, Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        Self {
            engine: Engine::new(config, OrderedProcessor::new(flush)),
        }
    }

    /// Create an ordered pipeline with default configuration
    pub fn with_defaults<F, Fut>(flush: F) -> Self
    where
        F: Fn(CancellationToken, Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        Self::new(PipelineConfig::default(), flush)
    }
}

impl<T: Keyed + Send + 'static> Pipeline<KeyedProcessor<T>> {
    /// Create a deduplicating pipeline with an explicit configuration
    ///
    /// The flush function receives the deduplicated batch as a map from
    /// item key to the latest item consumed with that key.
    pub fn new<F, Fut>(config: PipelineConfig, flush: F) -> Self
    where
        F: Fn(CancellationToken, HashMap<String, T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        Self {
            engine: Engine::new(config, KeyedProcessor::new(flush)),
        }
    }

    /// Create a deduplicating pipeline with default configuration
    pub fn with_defaults<F, Fut>(flush: F) -> Self
    where
        F: Fn(CancellationToken, HashMap<String, T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        Self::new(PipelineConfig::default(), flush)
    }
}

impl<P: Processor> Pipeline<P> {
    /// Get a producer handle to the input channel
    ///
    /// Returns `None` once [`Pipeline::close`] has been called. The input
    /// channel follows the writer-closes convention: it closes when
    /// `close()` has been called and every handle returned here has been
    /// dropped, which makes the event loop perform one final flush of a
    /// non-empty batch and exit cleanly.
    pub fn data_channel(&self) -> Option<mpsc::Sender<P::Item>> {
        self.engine.data_channel()
    }

    /// Drop the pipeline-held producer handle
    pub fn close(&self) {
        self.engine.close();
    }

    /// Send one item, waiting while the input buffer is full
    pub async fn send(&self, item: P::Item) -> Result<()> {
        self.engine.send(item).await
    }

    /// Send one item without waiting; fails fast on a full buffer
    pub fn try_send(&self, item: P::Item) -> Result<()> {
        self.engine.try_send(item)
    }

    /// Get the error receiver; the first call decides the buffer capacity
    ///
    /// Flush errors are forwarded here non-blockingly and dropped on
    /// overflow; the channel is never closed by the pipeline. Stop reading
    /// via your own cancellation signal rather than waiting for the channel
    /// to end.
    pub fn error_channel(&self, size: usize) -> MAsyncRx<PipelineError> {
        self.engine.error_channel(size)
    }

    /// Run the event loop with concurrent flush dispatch until shutdown
    ///
    /// Flushes are spawned as independent tasks, capped by
    /// `max_concurrent_flushes` when configured. No ordering holds across
    /// flushes in this mode.
    pub async fn async_perform(&self, cancel: CancellationToken) -> Result<()> {
        self.engine.async_perform(cancel).await
    }

    /// Run the event loop with serial flush dispatch until shutdown
    ///
    /// Flushes run inline on the loop and never overlap; they occur
    /// strictly in dispatch order.
    pub async fn sync_perform(&self, cancel: CancellationToken) -> Result<()> {
        self.engine.sync_perform(cancel).await
    }

    /// Spawn the loop in concurrent mode; returns `(done, errors)`
    ///
    /// `done` is the completion signal of the run this call is bound to.
    /// If the instance is already running, the live run's signal is
    /// returned and [`PipelineError::AlreadyRunning`] is surfaced through
    /// the error channel.
    pub fn start(&self, cancel: CancellationToken) -> (CancellationToken, MAsyncRx<PipelineError>) {
        self.engine.start(cancel)
    }

    /// Initialize the error buffer and run serially to completion
    pub async fn run(&self, cancel: CancellationToken, error_buffer: usize) -> Result<()> {
        self.engine.run(cancel, error_buffer).await
    }

    /// Completion signal of the current (or next) run
    pub fn done(&self) -> CancellationToken {
        self.engine.done()
    }

    /// Inject a metrics hook; effective once, before the first run
    #[must_use]
    pub fn with_metrics(self, hook: Arc<dyn MetricsHook>) -> Self {
        self.engine.set_metrics_hook(hook);
        self
    }

    /// Inject a logger for panic diagnostics; effective once, before the first run
    #[must_use]
    pub fn with_logger(self, logger: Arc<dyn Logger>) -> Self {
        self.engine.set_logger(logger);
        self
    }

    /// Current flush-size trigger
    pub fn current_flush_size(&self) -> u32 {
        self.engine.current_flush_size()
    }

    /// Current time-trigger interval
    pub fn current_flush_interval(&self) -> Duration {
        self.engine.current_flush_interval()
    }

    /// Update the flush-size trigger; clamped to at least one
    ///
    /// Takes effect on the next appended item.
    pub fn update_flush_size(&self, size: u32) {
        self.engine.update_flush_size(size);
    }

    /// Update the time-trigger interval; clamped to at least one millisecond
    ///
    /// A running loop re-arms its timer immediately.
    pub fn update_flush_interval(&self, interval: Duration) {
        self.engine.update_flush_interval(interval);
    }

    /// Point-in-time snapshot of the instance counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics().snapshot()
    }

    /// The normalized configuration this pipeline was built with
    pub fn config(&self) -> &PipelineConfig {
        self.engine.config()
    }
}

impl<P: Processor> std::fmt::Debug for Pipeline<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("running", &self.engine.is_running())
            .field("flush_size", &self.current_flush_size())
            .field("flush_interval", &self.current_flush_interval())
            .finish()
    }
}
