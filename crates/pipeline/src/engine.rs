//! Pipeline engine - event loop and run lifecycle
//!
//! The engine is the single consumer of the input channel. It coalesces
//! items into a batch, races the flush-size trigger against a resettable
//! interval timer, dispatches flushes serially or as capped concurrent
//! tasks, and drives the three shutdown paths: input-channel close (final
//! flush), cancel without drain, and cancel with a deadline-bounded drain.
//!
//! One engine instance allows at most one live run at a time; the instance
//! can be restarted once a run has exited.

use std::mem;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use crossfire::{MAsyncRx, MAsyncTx, TrySendError};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{sleep, timeout_at, Instant, Sleep};
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::{BoxError, PipelineError, Result};
use crate::hooks::{Logger, MetricsHook};
use crate::metrics::PipelineMetrics;
use crate::processor::Processor;

/// Fallback interval when the dynamic value reads as zero
const FALLBACK_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Smallest accepted dynamic flush interval
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// How flushes are dispatched by the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Flush inline on the loop task; flushes never overlap
    Serial,
    /// Spawn each flush as its own task, optionally capped by a semaphore
    Concurrent,
}

/// Lazily-initialized error channel
///
/// The receiver clone held here keeps the channel connected even when no
/// consumer ever subscribes; unread errors then accumulate up to the buffer
/// capacity and overflow is dropped.
struct ErrorChannel {
    tx: MAsyncTx<PipelineError>,
    rx: MAsyncRx<PipelineError>,
}

/// Shared engine behind every typed pipeline facade
pub(crate) struct Engine<P: Processor> {
    config: PipelineConfig,
    processor: P,

    /// Handle back to the owning `Arc`, used when spawning flush tasks
    weak_self: Weak<Engine<P>>,

    /// Producer side of the input channel; `close()` drops it
    input_tx: Mutex<Option<mpsc::Sender<P::Item>>>,

    /// Consumer side; taken by the active run, returned on exit
    input_rx: Mutex<Option<mpsc::Receiver<P::Item>>>,

    /// Guard against concurrent runs on the same instance
    running: AtomicBool,

    /// Completion signal of the current run
    run_done: Mutex<Option<Arc<CancellationToken>>>,

    /// Error channel; first access fixes the capacity
    error_chan: OnceLock<ErrorChannel>,

    /// Concurrency cap for flush tasks; `None` means unlimited
    flush_sem: Option<Arc<Semaphore>>,

    /// Dynamic flush-size trigger
    flush_size: AtomicU32,

    /// Dynamic flush interval in nanoseconds
    flush_interval_ns: AtomicU64,

    /// Coalescing wake-up to re-arm the interval timer
    nudge: Notify,

    metrics: PipelineMetrics,
    hook: OnceLock<Arc<dyn MetricsHook>>,
    logger: OnceLock<Arc<dyn Logger>>,
}

enum FlushOutcome {
    Completed,
    Failed(BoxError),
    Panicked(String),
    TimedOut,
}

impl<P: Processor> Engine<P> {
    pub(crate) fn new(config: PipelineConfig, processor: P) -> Arc<Self> {
        let config = config.validate_or_default();
        let (input_tx, input_rx) = mpsc::channel(config.buffer_size as usize);

        let flush_sem = (config.max_concurrent_flushes > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_flushes as usize)));

        Arc::new_cyclic(|weak| Self {
            flush_size: AtomicU32::new(config.flush_size),
            flush_interval_ns: AtomicU64::new(config.flush_interval.as_nanos() as u64),
            config,
            processor,
            weak_self: weak.clone(),
            input_tx: Mutex::new(Some(input_tx)),
            input_rx: Mutex::new(Some(input_rx)),
            running: AtomicBool::new(false),
            run_done: Mutex::new(None),
            error_chan: OnceLock::new(),
            flush_sem,
            nudge: Notify::new(),
            metrics: PipelineMetrics::new(),
            hook: OnceLock::new(),
            logger: OnceLock::new(),
        })
    }

    pub(crate) fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_metrics_hook(&self, hook: Arc<dyn MetricsHook>) {
        let _ = self.hook.set(hook);
    }

    pub(crate) fn set_logger(&self, logger: Arc<dyn Logger>) {
        let _ = self.logger.set(logger);
    }

    // ------------------------------------------------------------------
    // Input channel
    // ------------------------------------------------------------------

    /// Get a producer handle, or `None` once the input has been closed
    pub(crate) fn data_channel(&self) -> Option<mpsc::Sender<P::Item>> {
        self.input_tx.lock().clone()
    }

    /// Drop the engine-held producer handle
    ///
    /// The input channel closes once every handle returned by
    /// [`Engine::data_channel`] has been dropped as well.
    pub(crate) fn close(&self) {
        self.input_tx.lock().take();
    }

    /// Send one item, waiting for buffer capacity
    pub(crate) async fn send(&self, item: P::Item) -> Result<()> {
        let sender = self.input_tx.lock().clone();
        match sender {
            Some(tx) => tx
                .send(item)
                .await
                .map_err(|_| PipelineError::ChannelClosed),
            None => Err(PipelineError::ChannelClosed),
        }
    }

    /// Send one item without waiting
    pub(crate) fn try_send(&self, item: P::Item) -> Result<()> {
        let sender = self.input_tx.lock().clone();
        match sender {
            Some(tx) => tx.try_send(item).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => PipelineError::ChannelFull,
                mpsc::error::TrySendError::Closed(_) => PipelineError::ChannelClosed,
            }),
            None => Err(PipelineError::ChannelClosed),
        }
    }

    // ------------------------------------------------------------------
    // Error channel
    // ------------------------------------------------------------------

    /// Get the error receiver, initializing the channel on first access
    ///
    /// The first call (or the first internal send) decides the buffer
    /// capacity: `size` when positive, otherwise a computed default of
    /// `ceil(flush_size / buffer_size)` with a minimum of one. Later calls
    /// ignore `size` and clone the same channel.
    pub(crate) fn error_channel(&self, size: usize) -> MAsyncRx<PipelineError> {
        self.errors(size).rx.clone()
    }

    fn errors(&self, size: usize) -> &ErrorChannel {
        self.error_chan.get_or_init(|| {
            let capacity = if size > 0 {
                size
            } else {
                self.default_error_capacity()
            };
            let (tx, rx) = crossfire::mpmc::bounded_async(capacity);
            ErrorChannel { tx, rx }
        })
    }

    fn default_error_capacity(&self) -> usize {
        let flush_size = self.config.flush_size as usize;
        let buffer_size = (self.config.buffer_size as usize).max(1);
        (flush_size.div_ceil(buffer_size)).max(1)
    }

    /// Forward an error without ever blocking the event loop
    ///
    /// Drops the error (and fires the `error_dropped` hook) when the buffer
    /// is full. The channel is never closed from inside the engine.
    pub(crate) fn safe_error_send(&self, err: PipelineError) {
        let channel = self.errors(0);
        match channel.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) | Err(TrySendError::Disconnected(dropped)) => {
                self.metrics.record_error_dropped();
                self.with_hook(|hook| hook.error_dropped());
                tracing::warn!(error = %dropped, "error channel full, dropping error");
            }
        }
    }

    // ------------------------------------------------------------------
    // Dynamic parameters
    // ------------------------------------------------------------------

    pub(crate) fn current_flush_size(&self) -> u32 {
        self.flush_size.load(Ordering::SeqCst)
    }

    pub(crate) fn update_flush_size(&self, size: u32) {
        self.flush_size.store(size.max(1), Ordering::SeqCst);
    }

    pub(crate) fn current_flush_interval(&self) -> Duration {
        Duration::from_nanos(self.flush_interval_ns.load(Ordering::SeqCst))
    }

    /// Update the interval and nudge the loop so it re-arms immediately
    pub(crate) fn update_flush_interval(&self, interval: Duration) {
        let interval = interval.max(MIN_FLUSH_INTERVAL);
        self.flush_interval_ns
            .store(interval.as_nanos() as u64, Ordering::SeqCst);
        self.nudge.notify_one();
    }

    // ------------------------------------------------------------------
    // Run lifecycle
    // ------------------------------------------------------------------

    /// Completion signal of the current (or next) run
    ///
    /// The returned token is cancelled exactly once, when the run it is
    /// bound to exits. Callers must not cancel it themselves.
    pub(crate) fn done(&self) -> CancellationToken {
        let mut slot = self.run_done.lock();
        match slot.as_ref() {
            Some(token) => token.as_ref().clone(),
            None => {
                let created = Arc::new(CancellationToken::new());
                let done = created.as_ref().clone();
                *slot = Some(created);
                done
            }
        }
    }

    /// Spawn the event loop in concurrent-dispatch mode
    ///
    /// Returns the completion signal of the run this call is bound to and
    /// the error receiver. When the instance is already running, the
    /// existing run's signal is returned and the spawned attempt surfaces
    /// [`PipelineError::AlreadyRunning`] through the error channel.
    pub(crate) fn start(
        &self,
        cancel: CancellationToken,
    ) -> (CancellationToken, MAsyncRx<PipelineError>) {
        let errs = self.error_channel(0);
        let done = self.done();

        if let Some(engine) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                if let Err(err) = engine.async_perform(cancel).await {
                    engine.safe_error_send(err);
                }
            });
        }

        (done, errs)
    }

    /// Initialize the error buffer and run the loop serially to completion
    pub(crate) async fn run(&self, cancel: CancellationToken, error_buffer: usize) -> Result<()> {
        let _ = self.errors(error_buffer);
        self.sync_perform(cancel).await
    }

    /// Run the event loop with concurrent flush dispatch
    pub(crate) async fn async_perform(&self, cancel: CancellationToken) -> Result<()> {
        self.perform(cancel, Dispatch::Concurrent).await
    }

    /// Run the event loop with serial flush dispatch
    pub(crate) async fn sync_perform(&self, cancel: CancellationToken) -> Result<()> {
        self.perform(cancel, Dispatch::Serial).await
    }

    async fn perform(&self, cancel: CancellationToken, mode: Dispatch) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::AlreadyRunning);
        }

        let my_done = {
            let mut slot = self.run_done.lock();
            match slot.as_ref() {
                Some(token) => Arc::clone(token),
                None => {
                    let created = Arc::new(CancellationToken::new());
                    *slot = Some(Arc::clone(&created));
                    created
                }
            }
        };

        let mut rx = match self.input_rx.lock().take() {
            Some(rx) => rx,
            None => {
                self.finish_run(&my_done);
                return Err(PipelineError::PerformLoop(
                    "input receiver unavailable".into(),
                ));
            }
        };

        tracing::info!(
            ?mode,
            buffer_size = self.config.buffer_size,
            flush_size = self.current_flush_size(),
            flush_interval_ms = self.current_flush_interval().as_millis() as u64,
            max_concurrent_flushes = self.config.max_concurrent_flushes,
            "pipeline loop starting"
        );

        let outcome = AssertUnwindSafe(self.run_loop(&cancel, mode, &mut rx))
            .catch_unwind()
            .await;

        self.input_rx.lock().replace(rx);
        self.finish_run(&my_done);

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            items_received = snapshot.items_received,
            flushes = snapshot.flushes,
            flush_errors = snapshot.flush_errors,
            flush_panics = snapshot.flush_panics,
            errors_dropped = snapshot.errors_dropped,
            "pipeline loop stopped"
        );

        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload);
                self.log_recovered_panic(&format!("panic recovered in pipeline loop: {message}"));
                Err(PipelineError::PerformLoop(message))
            }
        }
    }

    /// Restore idle state and fire the completion signal of this run
    ///
    /// Only the slot still holding this run's token is cleared, so a
    /// successor run that already installed its own signal is untouched.
    fn finish_run(&self, my_done: &Arc<CancellationToken>) {
        self.running.store(false, Ordering::SeqCst);
        {
            let mut slot = self.run_done.lock();
            if slot.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, my_done)) {
                *slot = None;
            }
        }
        my_done.cancel();
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    async fn run_loop(
        &self,
        cancel: &CancellationToken,
        mode: Dispatch,
        rx: &mut mpsc::Receiver<P::Item>,
    ) -> Result<()> {
        let mut batch = self.new_batch();

        let timer = sleep(self.next_interval());
        tokio::pin!(timer);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(item) => {
                        self.processor.append(&mut batch, item);
                        self.metrics.record_received(1);
                        if self
                            .processor
                            .is_full(&batch, self.current_flush_size() as usize)
                        {
                            let full = mem::replace(&mut batch, self.new_batch());
                            self.dispatch(cancel.clone(), mode, full).await;
                            reset_timer(timer.as_mut(), self.next_interval());
                        }
                    }
                    None => {
                        if !self.processor.is_empty(&batch) {
                            let deadline = (!self.config.final_flush_on_close_timeout.is_zero())
                                .then(|| Instant::now() + self.config.final_flush_on_close_timeout);
                            self.flush_with_recover(CancellationToken::new(), deadline, batch)
                                .await;
                        }
                        return Ok(());
                    }
                },
                _ = &mut timer => {
                    if !self.processor.is_empty(&batch) {
                        let full = mem::replace(&mut batch, self.new_batch());
                        self.dispatch(cancel.clone(), mode, full).await;
                    }
                    reset_timer(timer.as_mut(), self.next_interval());
                }
                _ = self.nudge.notified() => {
                    reset_timer(timer.as_mut(), self.next_interval());
                }
                _ = cancel.cancelled() => {
                    return self.shutdown_on_cancel(rx, batch).await;
                }
            }
        }
    }

    /// Cancellation exit: bail out immediately, or drain under a deadline
    ///
    /// The drain pulls only items already buffered at the moment of
    /// cancellation (non-blocking receives), flushing synchronously whenever
    /// the batch fills, then flushes the remainder. All drain flushes share
    /// one deadline derived from the grace period and run under a fresh
    /// token, independent of the cancelled run token.
    async fn shutdown_on_cancel(
        &self,
        rx: &mut mpsc::Receiver<P::Item>,
        mut batch: P::Batch,
    ) -> Result<()> {
        if !self.config.drain_on_cancel {
            return Err(PipelineError::ContextClosed);
        }

        let grace = if self.config.drain_grace_period.is_zero() {
            crate::config::DEFAULT_DRAIN_GRACE_PERIOD
        } else {
            self.config.drain_grace_period
        };
        let deadline = Instant::now() + grace;

        loop {
            match rx.try_recv() {
                Ok(item) => {
                    self.processor.append(&mut batch, item);
                    self.metrics.record_received(1);
                    if self
                        .processor
                        .is_full(&batch, self.current_flush_size() as usize)
                    {
                        let full = mem::replace(&mut batch, self.new_batch());
                        self.flush_with_recover(CancellationToken::new(), Some(deadline), full)
                            .await;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        if !self.processor.is_empty(&batch) {
            self.flush_with_recover(CancellationToken::new(), Some(deadline), batch)
                .await;
        }

        Err(PipelineError::ContextDrained)
    }

    fn new_batch(&self) -> P::Batch {
        self.processor
            .init_batch(self.current_flush_size() as usize)
    }

    fn next_interval(&self) -> Duration {
        let interval = self.current_flush_interval();
        if interval.is_zero() {
            FALLBACK_FLUSH_INTERVAL
        } else {
            interval
        }
    }

    // ------------------------------------------------------------------
    // Flush dispatch
    // ------------------------------------------------------------------

    /// Dispatch one batch, inline or as a spawned task
    ///
    /// With a configured concurrency cap, the semaphore permit is acquired
    /// here, before the spawn, so the loop itself backpressures once the cap
    /// is reached. The permit is released when the flush task finishes.
    async fn dispatch(&self, cancel: CancellationToken, mode: Dispatch, batch: P::Batch) {
        if mode == Dispatch::Serial {
            self.flush_with_recover(cancel, None, batch).await;
            return;
        }

        let Some(engine) = self.weak_self.upgrade() else {
            self.flush_with_recover(cancel, None, batch).await;
            return;
        };

        match &self.flush_sem {
            Some(sem) => match Arc::clone(sem).acquire_owned().await {
                Ok(permit) => {
                    tokio::spawn(async move {
                        engine.flush_with_recover(cancel, None, batch).await;
                        drop(permit);
                    });
                }
                Err(_) => {
                    self.flush_with_recover(cancel, None, batch).await;
                }
            },
            None => {
                tokio::spawn(async move {
                    engine.flush_with_recover(cancel, None, batch).await;
                });
            }
        }
    }

    /// Run one flush call with panic recovery, timing and error forwarding
    ///
    /// The metrics hook observes every outcome. A recovered panic is logged
    /// and NOT forwarded as a flush error. A deadline cut-off drops the
    /// in-flight flush future and forwards [`PipelineError::FlushTimeout`].
    async fn flush_with_recover(
        &self,
        cancel: CancellationToken,
        deadline: Option<Instant>,
        batch: P::Batch,
    ) {
        let items = self.processor.len(&batch);
        let start = Instant::now();

        let guarded = AssertUnwindSafe(self.processor.flush(cancel, batch)).catch_unwind();
        let outcome = match deadline {
            Some(at) => match timeout_at(at, guarded).await {
                Ok(caught) => FlushOutcome::from_caught(caught),
                Err(_) => FlushOutcome::TimedOut,
            },
            None => FlushOutcome::from_caught(guarded.await),
        };

        let elapsed = start.elapsed();
        self.metrics.record_flush();
        self.with_hook(|hook| hook.flush(items, elapsed));

        match outcome {
            FlushOutcome::Completed => {
                tracing::trace!(items, elapsed_us = elapsed.as_micros() as u64, "flush completed");
            }
            FlushOutcome::Failed(source) => {
                self.metrics.record_flush_error();
                let err = PipelineError::Flush(source);
                self.with_hook(|hook| hook.error(&err));
                self.safe_error_send(err);
            }
            FlushOutcome::Panicked(message) => {
                self.metrics.record_flush_panic();
                self.log_recovered_panic(&format!("panic recovered in flush: {message}"));
            }
            FlushOutcome::TimedOut => {
                self.metrics.record_flush_timeout();
                tracing::warn!(
                    items,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "flush cut off at deadline"
                );
                let err = PipelineError::FlushTimeout(elapsed);
                self.with_hook(|hook| hook.error(&err));
                self.safe_error_send(err);
            }
        }
    }

    // ------------------------------------------------------------------
    // Hook plumbing
    // ------------------------------------------------------------------

    fn with_hook(&self, f: impl FnOnce(&dyn MetricsHook)) {
        if let Some(hook) = self.hook.get() {
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| f(hook.as_ref())));
        }
    }

    fn log_recovered_panic(&self, message: &str) {
        match self.logger.get() {
            Some(logger) => {
                let _ = std::panic::catch_unwind(AssertUnwindSafe(|| logger.log(message)));
            }
            None => tracing::error!("{message}"),
        }
    }
}

impl FlushOutcome {
    fn from_caught(
        caught: std::result::Result<
            std::result::Result<(), BoxError>,
            Box<dyn std::any::Any + Send>,
        >,
    ) -> Self {
        match caught {
            Ok(Ok(())) => Self::Completed,
            Ok(Err(err)) => Self::Failed(err),
            Err(payload) => Self::Panicked(panic_message(payload)),
        }
    }
}

fn reset_timer(timer: Pin<&mut Sleep>, interval: Duration) {
    timer.reset(Instant::now() + interval);
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
