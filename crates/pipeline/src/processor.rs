//! Batch containers and the processor contract
//!
//! A [`Processor`] owns the batch shape: how items accumulate, how batch
//! size is measured, and how a finished batch is handed to the user's flush
//! function. The event loop is generic over this contract, so the two batch
//! shapes (ordered sequence, keyed map) share one loop implementation.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// Items carried by a deduplicating pipeline must expose a stable key
pub trait Keyed {
    /// Key used for last-write-wins deduplication within a batch
    fn key(&self) -> String;
}

/// Boxed user flush function over a batch shape `B`
type BoxFlushFn<B> =
    Box<dyn Fn(CancellationToken, B) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Contract between the event loop and a batch container
///
/// The loop owns a live batch exclusively between dispatches. Once a batch
/// is handed to `flush`, ownership transfers with it; the loop allocates a
/// fresh container and never touches the dispatched one again.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Item accepted by the pipeline
    type Item: Send + 'static;

    /// Container accumulating items between flushes
    type Batch: Send + 'static;

    /// Allocate an empty container with a capacity hint
    fn init_batch(&self, capacity: usize) -> Self::Batch;

    /// Add one item to the container
    fn append(&self, batch: &mut Self::Batch, item: Self::Item);

    /// Number of elements the container holds
    fn len(&self, batch: &Self::Batch) -> usize;

    /// Whether the container has reached the flush-size trigger
    fn is_full(&self, batch: &Self::Batch, limit: usize) -> bool {
        self.len(batch) >= limit.max(1)
    }

    /// Whether the container holds no elements
    fn is_empty(&self, batch: &Self::Batch) -> bool {
        self.len(batch) == 0
    }

    /// Hand a finished batch to the user's flush function
    async fn flush(&self, cancel: CancellationToken, batch: Self::Batch) -> Result<(), BoxError>;
}

/// Insertion-ordered batch container backed by a `Vec`
pub struct OrderedProcessor<T> {
    flush_fn: BoxFlushFn<Vec<T>>,
}

impl<T: Send + 'static> OrderedProcessor<T> {
    pub(crate) fn new<F, Fut>(flush: F) -> Self
    where
        F: Fn(CancellationToken, Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            flush_fn: Box::new(move |cancel, batch| flush(cancel, batch).boxed()),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Processor for OrderedProcessor<T> {
    type Item = T;
    type Batch = Vec<T>;

    fn init_batch(&self, capacity: usize) -> Vec<T> {
        Vec::with_capacity(capacity)
    }

    fn append(&self, batch: &mut Vec<T>, item: T) {
        batch.push(item);
    }

    fn len(&self, batch: &Vec<T>) -> usize {
        batch.len()
    }

    async fn flush(&self, cancel: CancellationToken, batch: Vec<T>) -> Result<(), BoxError> {
        (self.flush_fn)(cancel, batch).await
    }
}

/// Deduplicating batch container backed by a `HashMap`
///
/// Inserting an item whose key is already present overwrites the prior
/// value (last-write-wins). Iteration order of a flushed batch is
/// unspecified.
pub struct KeyedProcessor<T> {
    flush_fn: BoxFlushFn<HashMap<String, T>>,
}

impl<T: Keyed + Send + 'static> KeyedProcessor<T> {
    pub(crate) fn new<F, Fut>(flush: F) -> Self
    where
        F: Fn(CancellationToken, HashMap<String, T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            flush_fn: Box::new(move |cancel, batch| flush(cancel, batch).boxed()),
        }
    }
}

#[async_trait]
impl<T: Keyed + Send + 'static> Processor for KeyedProcessor<T> {
    type Item = T;
    type Batch = HashMap<String, T>;

    fn init_batch(&self, capacity: usize) -> HashMap<String, T> {
        HashMap::with_capacity(capacity)
    }

    fn append(&self, batch: &mut HashMap<String, T>, item: T) {
        batch.insert(item.key(), item);
    }

    fn len(&self, batch: &HashMap<String, T>) -> usize {
        batch.len()
    }

    async fn flush(
        &self,
        cancel: CancellationToken,
        batch: HashMap<String, T>,
    ) -> Result<(), BoxError> {
        (self.flush_fn)(cancel, batch).await
    }
}
