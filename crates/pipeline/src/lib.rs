//! Batchpipe - in-process batching pipeline
//!
//! Accepts individually produced items, groups them into batches bounded by
//! size OR time, and hands each batch to a user-supplied flush function with
//! well-defined concurrency, cancellation and shutdown semantics.
//!
//! # Architecture
//!
//! ```text
//! [Producers]                [Event loop]                     [Flush]
//!    task ──┐                                              serial: inline
//!    task ──┼──→ mpsc::Sender ──→ batch ──(size | timer)──→ concurrent: spawn
//!    task ──┘                      │                          └─ semaphore cap
//!                                  └──→ errors ──→ error channel (non-blocking)
//! ```
//!
//! # Key Design
//!
//! - **Single consumer**: one event loop per instance owns the live batch
//! - **Two triggers**: flush on batch size or on a resettable interval timer
//! - **Two batch shapes**: ordered `Vec` and keyed last-write-wins `HashMap`
//! - **Three shutdown paths**: input-channel close (final flush), cancel
//!   without drain, cancel with a deadline-bounded drain
//! - **Opaque flush errors**: delivered through a lazily-created,
//!   non-blocking error channel, never through the perform return value
//! - **Dynamic tuning**: flush size and interval are adjustable at runtime
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use batchpipe::{PipelineConfig, StandardPipeline};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = PipelineConfig::new()
//!     .with_flush_size(100)
//!     .with_flush_interval(Duration::from_millis(50));
//!
//! let pipeline = StandardPipeline::new(config, |_cancel, batch: Vec<u64>| async move {
//!     println!("flushing {} items", batch.len());
//!     Ok(())
//! });
//!
//! let cancel = CancellationToken::new();
//! let (done, mut errors) = pipeline.start(cancel.clone());
//!
//! // Producers send items, then close the input to shut down losslessly.
//! let tx = pipeline.data_channel().expect("input open");
//! tokio::spawn(async move {
//!     for i in 0..1000u64 {
//!         let _ = tx.send(i).await;
//!     }
//! });
//! pipeline.close();
//!
//! done.cancelled().await;
//! ```

mod config;
mod engine;
mod error;
mod hooks;
mod metrics;
mod pipeline;
mod processor;

pub use config::{
    PipelineConfig, DEFAULT_BUFFER_SIZE, DEFAULT_DRAIN_GRACE_PERIOD, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_FLUSH_SIZE,
};
pub use error::{BoxError, PipelineError, Result};
pub use hooks::{Logger, MetricsHook};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{DeduplicationPipeline, Pipeline, StandardPipeline};
pub use processor::{Keyed, KeyedProcessor, OrderedProcessor, Processor};

// Re-export key types from dependencies for convenience
pub use crossfire::MAsyncRx;
pub use tokio_util::sync::CancellationToken;
