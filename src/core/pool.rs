//! Worker pool
//!
//! N identical workers pull leases from the shared queue, dispatch them
//! through the registry, retry retryable failures with linear backoff, and
//! mark every item done exactly once. Cancellation stops a worker at its next
//! suspension point without completing its lease, so the item survives into
//! the saved snapshot.

use crate::config::RetryConfig;
use crate::core::item::{Lease, Operation};
use crate::core::queue::WorkQueue;
use crate::core::registry::{OperationRegistry, WorkContext, WorkOutcome};
use crate::core::retry::{RetryDecision, RetryPolicy};
use crate::error::TaskError;
use crate::progress::ThroughputTracker;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Counters shared by all workers of one run
#[derive(Debug, Default)]
pub struct RunStats {
    processed: AtomicU64,
    transferred: AtomicU64,
    completed: AtomicU64,
    errors: Mutex<Vec<String>>,
}

impl RunStats {
    /// Fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a successful outcome
    pub fn record_outcome(&self, outcome: &WorkOutcome) {
        self.processed.fetch_add(outcome.processed, Ordering::Relaxed);
        self.transferred.fetch_add(outcome.transferred, Ordering::Relaxed);
    }

    /// Record a final failure; it counts as one processed item
    pub fn record_failure(&self, message: String) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.record_error(message);
    }

    /// Record an error message without touching the counters
    pub fn record_error(&self, message: String) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    fn record_completed(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Items processed
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Items copied
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Queue items completed by workers
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Number of final failures
    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Copy of the error messages
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// How a single lease ended
enum ItemEnd {
    Finished(WorkOutcome),
    Failed(TaskError),
    Cancelled,
}

/// Pool of workers bound to one queue and registry
pub struct WorkerPool<Op> {
    queue: Arc<WorkQueue<Op>>,
    registry: Arc<OperationRegistry<Op>>,
    retry: RetryConfig,
    policy: RetryPolicy,
    tracker: Arc<ThroughputTracker>,
    stats: Arc<RunStats>,
    snapshot_due: Option<(Arc<Notify>, u64)>,
}

impl<Op: Operation> WorkerPool<Op> {
    /// Pool with fresh stats and tracker
    pub fn new(
        queue: Arc<WorkQueue<Op>>,
        registry: Arc<OperationRegistry<Op>>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            retry,
            policy: RetryPolicy::from_config(&retry),
            tracker: Arc::new(ThroughputTracker::new()),
            stats: Arc::new(RunStats::new()),
            snapshot_due: None,
        }
    }

    /// Share an existing throughput tracker
    pub fn with_tracker(mut self, tracker: Arc<ThroughputTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Share existing run stats
    pub fn with_stats(mut self, stats: Arc<RunStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Signal `notify` after every `every` completed items
    pub fn with_snapshot_signal(mut self, notify: Arc<Notify>, every: u64) -> Self {
        if every > 0 {
            self.snapshot_due = Some((notify, every));
        }
        self
    }

    /// Run stats
    pub fn stats(&self) -> &Arc<RunStats> {
        &self.stats
    }

    /// Throughput tracker
    pub fn tracker(&self) -> &Arc<ThroughputTracker> {
        &self.tracker
    }

    /// Start `workers` workers; they exit when the queue is sealed and empty
    /// or cancelled
    pub fn spawn(self: &Arc<Self>, workers: usize) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for id in 0..workers.max(1) {
            let pool = Arc::clone(self);
            set.spawn(async move { pool.worker_loop(id).await });
        }
        set
    }

    async fn worker_loop(&self, id: usize) {
        debug!(worker = id, "Worker started");
        while let Some(lease) = self.queue.dequeue().await {
            if !self.process(lease).await {
                break;
            }
        }
        debug!(worker = id, "Worker stopped");
    }

    /// Run one lease to completion; false when cancelled mid-item
    async fn process(&self, lease: Lease<Op>) -> bool {
        match self.run_attempts(lease.op()).await {
            ItemEnd::Finished(outcome) => {
                self.tracker.processed_n(outcome.processed);
                self.stats.record_outcome(&outcome);
            }
            ItemEnd::Failed(err) => {
                if let Some(artifact) = &err.artifact {
                    match tokio::fs::remove_file(artifact).await {
                        Ok(()) => debug!(path = %artifact.display(), "Removed partial output"),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!(path = %artifact.display(), error = %e, "Failed to remove partial output"),
                    }
                }
                let message = err.display_chain();
                error!(op = lease.op().tag(), kind = %err.kind, "{}", message);
                self.tracker.processed();
                self.stats.record_failure(message);
            }
            ItemEnd::Cancelled => {
                debug!(op = ?lease.op(), "Cancelled; item stays queued");
                return false;
            }
        }

        self.queue.task_done(lease);
        let completed = self.stats.record_completed();
        if let Some((notify, every)) = &self.snapshot_due {
            if completed % every == 0 {
                notify.notify_one();
            }
        }
        true
    }

    async fn run_attempts(&self, op: &Op) -> ItemEnd {
        let cancel = self.queue.cancellation_token();
        let ctx = WorkContext::new(Arc::clone(&self.queue), self.retry);
        let mut attempt: u32 = 1;

        loop {
            let call = AssertUnwindSafe(self.registry.dispatch(op, &ctx)).catch_unwind();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ItemEnd::Cancelled,
                result = call => result.unwrap_or_else(|_| {
                    Err(TaskError::invalid_argument(format!("Handler for '{}' panicked", op.tag())))
                }),
            };

            let err = match result {
                Ok(outcome) => return ItemEnd::Finished(outcome),
                Err(err) => err,
            };

            match self.policy.should_retry(&err, attempt) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        op = op.tag(),
                        attempt,
                        max = self.policy.max_attempts(&err),
                        "{}. Retrying in {:?}",
                        err.display_chain(),
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return ItemEnd::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                RetryDecision::GiveUp => return ItemEnd::Failed(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::Priority;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(tag = "tag", content = "args")]
    enum Op {
        Ok(u32),
        Flaky(u32),
        Broken,
        Tree(u32),
        Slow,
    }

    impl Operation for Op {
        fn tag(&self) -> &'static str {
            match self {
                Self::Ok(_) => "ok",
                Self::Flaky(_) => "flaky",
                Self::Broken => "broken",
                Self::Tree(_) => "tree",
                Self::Slow => "slow",
            }
        }

        fn priority(&self) -> Priority {
            match self {
                Self::Tree(_) => 2,
                _ => 1,
            }
        }
    }

    fn retry(max: u32) -> RetryConfig {
        RetryConfig {
            retry_max: max,
            retry_modifier: Duration::from_secs(1),
            max_attempts: 10,
        }
    }

    fn registry(flaky_calls: Arc<AtomicU32>) -> OperationRegistry<Op> {
        OperationRegistry::new()
            .with("ok", |_op: Op, _ctx: WorkContext<Op>| async move {
                Ok::<_, TaskError>(WorkOutcome::processed(1).with_transferred(1))
            })
            .with("flaky", move |op: Op, ctx: WorkContext<Op>| {
                let calls = Arc::clone(&flaky_calls);
                async move {
                    let Op::Flaky(fail_times) = op else { unreachable!() };
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < fail_times {
                        Err(ctx.transient("temporary failure"))
                    } else {
                        Ok(WorkOutcome::processed(1).with_transferred(1))
                    }
                }
            })
            .with("broken", |_op: Op, _ctx: WorkContext<Op>| async move {
                Err::<WorkOutcome, _>(TaskError::invalid_argument("bad id"))
            })
            .with("tree", |op: Op, ctx: WorkContext<Op>| async move {
                let Op::Tree(depth) = op else { unreachable!() };
                if depth > 0 {
                    ctx.enqueue(Op::Tree(depth - 1))?;
                    ctx.enqueue(Op::Ok(depth))?;
                }
                Ok::<_, TaskError>(WorkOutcome::processed(1))
            })
            .with("slow", |_op: Op, _ctx: WorkContext<Op>| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, TaskError>(WorkOutcome::processed(1))
            })
    }

    async fn run(ops: Vec<Op>, retry_cfg: RetryConfig, workers: usize) -> (Arc<WorkQueue<Op>>, Arc<RunStats>) {
        let queue = Arc::new(WorkQueue::new());
        for op in ops {
            queue.push(op).unwrap();
        }
        let registry = Arc::new(registry(Arc::new(AtomicU32::new(0))));
        let pool = Arc::new(WorkerPool::new(Arc::clone(&queue), registry, retry_cfg));
        let mut set = pool.spawn(workers);
        queue.join().await.unwrap();
        queue.seal();
        while set.join_next().await.is_some() {}
        (queue, Arc::clone(pool.stats()))
    }

    #[tokio::test]
    async fn test_tree_expansion_runs_everything_once() {
        let (queue, stats) = run(vec![Op::Tree(4)], retry(3), 4).await;
        // 5 tree nodes plus 4 leaves
        assert_eq!(stats.completed(), 9);
        assert_eq!(stats.processed(), 9);
        assert_eq!(stats.transferred(), 4);
        assert_eq!(stats.error_count(), 0);
        assert_eq!(queue.counts().enqueued_total, queue.counts().completed_total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success_with_linear_backoff() {
        let start = tokio::time::Instant::now();
        let (_queue, stats) = run(vec![Op::Flaky(2)], retry(5), 1).await;

        assert_eq!(stats.transferred(), 1);
        assert_eq!(stats.error_count(), 0);
        // 1s after attempt 1, 2s after attempt 2
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted_records_error() {
        let (_queue, stats) = run(vec![Op::Flaky(10)], retry(3), 1).await;
        assert_eq!(stats.transferred(), 0);
        assert_eq!(stats.processed(), 1);
        assert_eq!(stats.errors(), vec!["temporary failure".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_max_bounds_attempts_and_delays() {
        let calls = Arc::new(AtomicU32::new(0));
        let queue = Arc::new(WorkQueue::new());
        queue.push(Op::Flaky(10)).unwrap();
        let registry = Arc::new(registry(Arc::clone(&calls)));
        let pool = Arc::new(WorkerPool::new(Arc::clone(&queue), registry, retry(3)));

        let start = tokio::time::Instant::now();
        let mut set = pool.spawn(1);
        queue.join().await.unwrap();
        // 1s after attempt 1, 2s after attempt 2, nothing after the last
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        queue.seal();
        while set.join_next().await.is_some() {}

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().error_count(), 1);
        assert_eq!(pool.stats().processed(), 1);
    }

    #[tokio::test]
    async fn test_leaf_children_served_before_container_child() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let on_leaf = Arc::clone(&seen);
        let on_tree = Arc::clone(&seen);
        let registry = OperationRegistry::new()
            .with("ok", move |op: Op, _ctx: WorkContext<Op>| {
                let seen = Arc::clone(&on_leaf);
                async move {
                    seen.lock().unwrap().push(op);
                    Ok::<_, TaskError>(WorkOutcome::processed(1))
                }
            })
            .with("tree", move |op: Op, ctx: WorkContext<Op>| {
                let seen = Arc::clone(&on_tree);
                async move {
                    seen.lock().unwrap().push(op.clone());
                    let Op::Tree(depth) = op else { unreachable!() };
                    if depth > 0 {
                        // Container first, so only priority can put the leaves ahead
                        ctx.enqueue(Op::Tree(depth - 1))?;
                        ctx.enqueue(Op::Ok(depth * 10))?;
                        ctx.enqueue(Op::Ok(depth * 10 + 1))?;
                    }
                    Ok::<_, TaskError>(WorkOutcome::processed(1))
                }
            });

        let queue = Arc::new(WorkQueue::new());
        queue.push(Op::Tree(2)).unwrap();
        let pool = Arc::new(WorkerPool::new(Arc::clone(&queue), Arc::new(registry), retry(3)));
        let mut set = pool.spawn(1);
        queue.join().await.unwrap();
        queue.seal();
        while set.join_next().await.is_some() {}

        let order = seen.lock().unwrap().clone();
        assert_eq!(
            order,
            vec![
                Op::Tree(2),
                Op::Ok(20),
                Op::Ok(21),
                Op::Tree(1),
                Op::Ok(10),
                Op::Ok(11),
                Op::Tree(0),
            ]
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_block_others() {
        let (_queue, stats) = run(vec![Op::Broken, Op::Ok(1), Op::Ok(2)], retry(3), 2).await;
        assert_eq!(stats.processed(), 3);
        assert_eq!(stats.transferred(), 2);
        assert_eq!(stats.error_count(), 1);
    }

    #[tokio::test]
    async fn test_final_failure_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("partial.bin");
        std::fs::write(&partial, b"half").unwrap();

        let queue = Arc::new(WorkQueue::new());
        queue.push(Op::Broken).unwrap();
        let artifact = partial.clone();
        let registry = OperationRegistry::new().with("broken", move |_op: Op, _ctx: WorkContext<Op>| {
            let artifact = artifact.clone();
            async move {
                Err::<WorkOutcome, _>(TaskError::integrity("size mismatch", Some(artifact)))
            }
        });
        let pool = Arc::new(WorkerPool::new(Arc::clone(&queue), Arc::new(registry), retry(3)));
        let mut set = pool.spawn(1);
        queue.join().await.unwrap();
        queue.seal();
        while set.join_next().await.is_some() {}

        assert!(!partial.exists());
        assert_eq!(pool.stats().error_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_leaves_in_flight_item_queued() {
        let queue = Arc::new(WorkQueue::new());
        queue.push(Op::Slow).unwrap();
        let registry = Arc::new(registry(Arc::new(AtomicU32::new(0))));
        let pool = Arc::new(WorkerPool::new(Arc::clone(&queue), registry, retry(3)));
        let mut set = pool.spawn(2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.cancel();
        while set.join_next().await.is_some() {}

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].op, Op::Slow);
        assert_eq!(pool.stats().completed(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_signal_every_n() {
        let queue = Arc::new(WorkQueue::new());
        for i in 0..6 {
            queue.push(Op::Ok(i)).unwrap();
        }
        let notify = Arc::new(Notify::new());
        let registry = Arc::new(registry(Arc::new(AtomicU32::new(0))));
        let pool = Arc::new(
            WorkerPool::new(Arc::clone(&queue), registry, retry(3))
                .with_snapshot_signal(Arc::clone(&notify), 3),
        );
        let mut set = pool.spawn(1);
        queue.join().await.unwrap();
        queue.seal();
        while set.join_next().await.is_some() {}

        // A stored permit means at least one signal fired
        tokio::time::timeout(Duration::from_millis(50), notify.notified())
            .await
            .unwrap();
    }
}
