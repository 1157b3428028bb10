//! Operation handlers and their registry
//!
//! Workers never call functions directly: each dequeued item is dispatched
//! by its op tag to the handler registered under that tag. Handlers receive a
//! [`WorkContext`] through which they enqueue follow-up work.

use crate::config::RetryConfig;
use crate::core::item::{Operation, Priority};
use crate::core::queue::WorkQueue;
use crate::error::{TaskError, TransferError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a successful invocation reports back to the pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkOutcome {
    /// Optional value, for example the destination written
    pub value: Option<String>,
    /// Items this invocation counts as processed
    pub processed: u64,
    /// Items this invocation counts as transferred
    pub transferred: u64,
}

impl WorkOutcome {
    /// Outcome counting `n` processed items
    pub fn processed(n: u64) -> Self {
        Self {
            processed: n,
            ..Self::default()
        }
    }

    /// Set the transferred count
    pub fn with_transferred(mut self, n: u64) -> Self {
        self.transferred = n;
        self
    }

    /// Attach a value
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Result of one handler invocation
pub type WorkResult = Result<WorkOutcome, TaskError>;

/// Everything a handler may touch besides its own arguments
pub struct WorkContext<Op> {
    queue: Arc<WorkQueue<Op>>,
    retry: RetryConfig,
}

impl<Op> Clone for WorkContext<Op> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            retry: self.retry,
        }
    }
}

impl<Op: Operation> WorkContext<Op> {
    /// Context over a shared queue
    pub fn new(queue: Arc<WorkQueue<Op>>, retry: RetryConfig) -> Self {
        Self { queue, retry }
    }

    /// Enqueue follow-up work at its default priority
    ///
    /// Returns false when the item was already outstanding.
    pub fn enqueue(&self, op: Op) -> Result<bool, TaskError> {
        self.queue.push(op).map_err(Self::enqueue_error)
    }

    /// Enqueue follow-up work at an explicit priority
    pub fn enqueue_with_priority(&self, priority: Priority, op: Op) -> Result<bool, TaskError> {
        self.queue.enqueue(priority, op).map_err(Self::enqueue_error)
    }

    fn enqueue_error(err: TransferError) -> TaskError {
        TaskError::invalid_argument(format!("Failed to enqueue follow-up work: {}", err))
    }

    /// Retry defaults configured for this run
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// A retryable error carrying this run's retry defaults
    pub fn transient(&self, message: impl Into<String>) -> TaskError {
        TaskError::transient(message).with_retry(self.retry.retry_max, self.retry.retry_modifier)
    }

    /// Classify an I/O failure, applying this run's retry defaults when it
    /// is worth another attempt
    pub fn io_error(&self, context: impl Into<String>, err: std::io::Error) -> TaskError {
        let classified = TaskError::from_io(context, err);
        if classified.can_retry {
            classified.with_retry(self.retry.retry_max, self.retry.retry_modifier)
        } else {
            classified
        }
    }

    /// Whether the run is being cancelled
    pub fn is_cancelled(&self) -> bool {
        self.queue.is_cancelled()
    }

    /// Token handlers can select on for long transfers
    pub fn cancellation_token(&self) -> CancellationToken {
        self.queue.cancellation_token()
    }
}

/// One kind of work
#[async_trait]
pub trait Handler<Op: Operation>: Send + Sync {
    /// Run a single attempt of `op`
    async fn handle(&self, op: &Op, ctx: &WorkContext<Op>) -> WorkResult;
}

#[async_trait]
impl<Op, F, Fut> Handler<Op> for F
where
    Op: Operation,
    F: Fn(Op, WorkContext<Op>) -> Fut + Send + Sync,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    async fn handle(&self, op: &Op, ctx: &WorkContext<Op>) -> WorkResult {
        (self)(op.clone(), ctx.clone()).await
    }
}

/// Map from op tag to handler
pub struct OperationRegistry<Op> {
    handlers: HashMap<&'static str, Arc<dyn Handler<Op>>>,
}

impl<Op: Operation> Default for OperationRegistry<Op> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Op: Operation> OperationRegistry<Op> {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for the tag
    pub fn register<H>(&mut self, tag: &'static str, handler: H) -> &mut Self
    where
        H: Handler<Op> + 'static,
    {
        self.handlers.insert(tag, Arc::new(handler));
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<H>(mut self, tag: &'static str, handler: H) -> Self
    where
        H: Handler<Op> + 'static,
    {
        self.register(tag, handler);
        self
    }

    /// Whether a handler exists for `tag`
    pub fn contains(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Registered tags, sorted
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.handlers.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Run one attempt of `op` through its handler
    pub async fn dispatch(&self, op: &Op, ctx: &WorkContext<Op>) -> WorkResult {
        match self.handlers.get(op.tag()) {
            Some(handler) => handler.handle(op, ctx).await,
            None => Err(TaskError::invalid_argument(format!(
                "No handler registered for operation '{}'",
                op.tag()
            ))),
        }
    }
}
