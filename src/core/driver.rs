//! Task driver
//!
//! Owns one logical task from start to finish: loads or resets its persisted
//! state, seeds or re-hydrates the queue, runs the worker pool, snapshots the
//! queue while work is in progress, and writes the terminal state.

use crate::config::{RetryConfig, SnapshotConfig};
use crate::core::item::Operation;
use crate::core::pool::{RunStats, WorkerPool};
use crate::core::queue::WorkQueue;
use crate::core::registry::OperationRegistry;
use crate::error::{Result, TransferError};
use crate::progress::{ProgressReporter, StatusLine, ThroughputTracker};
use crate::sync::{QueueState, StateStore, TaskIdentity};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const PROGRESS_REFRESH: Duration = Duration::from_millis(250);

/// Outcome of one run
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Task id
    pub task_id: TaskIdentity,
    /// Items processed, failures included
    pub processed: u64,
    /// Items copied
    pub transferred: u64,
    /// Final error messages
    pub errors: Vec<String>,
    /// True when the run was cancelled
    pub aborted: bool,
    /// Whether saved work was picked up instead of the seeds
    pub resumed: bool,
    /// Items left in the saved state
    pub queued_remaining: usize,
    /// Wall-clock time
    pub duration: Duration,
}

impl RunSummary {
    /// Ran to completion without a single error
    pub fn is_success(&self) -> bool {
        !self.aborted && self.errors.is_empty()
    }

    /// Closing line for the run
    pub fn status_message(&self) -> &'static str {
        match (self.aborted, self.errors.is_empty()) {
            (false, true) => "Finished successfully.",
            (false, false) => "Finished with errors.",
            (true, true) => "Aborted.",
            (true, false) => "Aborted with errors.",
        }
    }

    /// Print summary to stdout
    pub fn print_summary(&self) {
        println!();
        println!("Task:            {}", self.task_id);
        println!("Total processed: {}", self.processed);
        println!("Transferred:     {}", self.transferred);
        println!("Errors:          {}", self.errors.len());
        if self.aborted {
            println!("Still queued:    {}", self.queued_remaining);
        }
        println!(
            "Run time:        {}",
            humantime::format_duration(Duration::from_secs(self.duration.as_secs()))
        );

        if !self.errors.is_empty() {
            println!();
            println!("Errors:");
            for (i, err) in self.errors.iter().take(10).enumerate() {
                println!("  {}. {}", i + 1, err);
            }
            if self.errors.len() > 10 {
                println!("  ... and {} more", self.errors.len() - 10);
            }
        }

        println!();
        println!("{}", self.status_message());
    }
}

/// Runs one task against a registry of handlers
pub struct TaskDriver<Op> {
    identity: TaskIdentity,
    store: StateStore,
    registry: Arc<OperationRegistry<Op>>,
    workers: usize,
    retry: RetryConfig,
    snapshot: SnapshotConfig,
    restart: bool,
    cancel: CancellationToken,
    progress: Option<Arc<ProgressReporter>>,
}

impl<Op: Operation> TaskDriver<Op> {
    /// Driver with default retry and snapshot settings and one worker per CPU
    pub fn new(identity: TaskIdentity, store: StateStore, registry: OperationRegistry<Op>) -> Self {
        Self {
            identity,
            store,
            registry: Arc::new(registry),
            workers: num_cpus::get(),
            retry: RetryConfig::default(),
            snapshot: SnapshotConfig::default(),
            restart: false,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Number of concurrent workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Retry defaults and ceiling
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Snapshot cadence
    pub fn snapshot(mut self, snapshot: SnapshotConfig) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Discard any saved state before running
    pub fn restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    /// Cancel the run through an external token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Render a live status line
    pub fn with_progress(mut self, progress: Arc<ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Token that aborts this run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Task id
    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    /// Run the task until the queue drains or the run is cancelled
    ///
    /// `seeds` are only enqueued when there is no resumable state.
    pub async fn run(self, seeds: Vec<Op>) -> Result<RunSummary> {
        let started = Instant::now();
        let mut state: QueueState<Op> = self.store.load(&self.identity, self.restart)?;
        if state.is_finished() {
            return Err(TransferError::AlreadyFinished(self.identity.to_string()));
        }

        let queue = Arc::new(WorkQueue::with_cancellation(self.cancel.clone()));
        let resumed = state.can_resume();
        if resumed {
            info!(
                task = %self.identity,
                queued = state.queued.len(),
                "Continuing existing operation"
            );
            if let Some(progress) = &self.progress {
                progress.set_status(&format!("Resuming {} queued items", state.queued.len()));
            }
            for item in state.queued.drain(..) {
                queue.enqueue(item.priority, item.op)?;
            }
        } else {
            info!(task = %self.identity, seeds = seeds.len(), "Starting new operation");
            for op in seeds {
                queue.push(op)?;
            }
        }

        state.queued = queue.snapshot();
        self.store.set_started(&mut state)?;

        let tracker = Arc::new(ThroughputTracker::new());
        let stats = Arc::new(RunStats::new());
        let snapshot_due = Arc::new(Notify::new());
        tracker.start();

        let pool = Arc::new(
            WorkerPool::new(Arc::clone(&queue), Arc::clone(&self.registry), self.retry)
                .with_tracker(Arc::clone(&tracker))
                .with_stats(Arc::clone(&stats))
                .with_snapshot_signal(Arc::clone(&snapshot_due), self.snapshot.every_items),
        );
        let mut workers = pool.spawn(self.workers);

        let mut snapshot_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.snapshot.interval,
            self.snapshot.interval,
        );
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress_tick = tokio::time::interval(PROGRESS_REFRESH);
        progress_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let joined = loop {
            tokio::select! {
                result = queue.join() => break result,
                _ = snapshot_tick.tick() => self.save_snapshot(&queue, &mut state).await,
                _ = snapshot_due.notified() => self.save_snapshot(&queue, &mut state).await,
                _ = progress_tick.tick(), if self.progress_enabled() => {
                    self.render_progress(&queue, &stats, &tracker);
                }
            }
        };

        let aborted = match joined {
            Ok(()) => false,
            Err(TransferError::Cancelled) => true,
            Err(e) => return Err(e),
        };

        if !aborted {
            queue.seal();
        } else if let Some(progress) = &self.progress {
            progress.set_status("Waiting for workers, then saving queue state");
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Worker panicked");
                    stats.record_error(TransferError::WorkerPanicked(e.to_string()).to_string());
                }
            }
        }

        let queued_remaining = if aborted {
            state.queued = queue.snapshot();
            if !state.queued.is_empty() {
                error!(
                    task = %self.identity,
                    queued = state.queued.len(),
                    "Queued items still present in queue, saving for the next run"
                );
            }
            self.store.save(&mut state)?;
            state.queued.len()
        } else {
            self.store.set_finished(&mut state)?;
            0
        };

        let summary = RunSummary {
            task_id: self.identity.clone(),
            processed: stats.processed(),
            transferred: stats.transferred(),
            errors: stats.errors(),
            aborted,
            resumed,
            queued_remaining,
            duration: started.elapsed(),
        };

        if let Some(progress) = &self.progress {
            if summary.is_success() {
                progress.finish_success(summary.status_message());
            } else {
                progress.finish_error(summary.status_message());
            }
        }
        info!(
            task = %self.identity,
            processed = summary.processed,
            transferred = summary.transferred,
            errors = summary.errors.len(),
            "{}",
            summary.status_message()
        );

        Ok(summary)
    }

    async fn save_snapshot(&self, queue: &WorkQueue<Op>, state: &mut QueueState<Op>) {
        state.queued = queue.snapshot();
        match self.store.save_async(state.clone()).await {
            Ok(saved) => state.updated_at = saved.updated_at,
            Err(e) => warn!(task = %self.identity, error = %e, "Failed to save queue snapshot"),
        }
    }

    fn progress_enabled(&self) -> bool {
        self.progress.as_ref().is_some_and(|p| p.is_enabled())
    }

    fn render_progress(&self, queue: &WorkQueue<Op>, stats: &RunStats, tracker: &ThroughputTracker) {
        let Some(progress) = &self.progress else {
            return;
        };
        let queued = queue.outstanding() as u64;
        progress.update(&StatusLine {
            processed: stats.processed(),
            transferred: stats.transferred(),
            errors: stats.error_count() as u64,
            queued,
            throughput: tracker.stats(queued),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::Priority;
    use crate::core::registry::{WorkContext, WorkOutcome};
    use crate::error::TaskError;
    use crate::sync::QueueStatus;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(tag = "tag", content = "args", rename_all = "snake_case")]
    enum Op {
        Leaf { n: u32 },
        Branch { width: u32 },
        Stall,
        Fail,
    }

    impl Operation for Op {
        fn tag(&self) -> &'static str {
            match self {
                Self::Leaf { .. } => "leaf",
                Self::Branch { .. } => "branch",
                Self::Stall => "stall",
                Self::Fail => "fail",
            }
        }

        fn priority(&self) -> Priority {
            match self {
                Self::Branch { .. } => 3,
                _ => 1,
            }
        }
    }

    fn registry(leaf_calls: Arc<AtomicU32>) -> OperationRegistry<Op> {
        OperationRegistry::new()
            .with("leaf", move |_op: Op, _ctx: WorkContext<Op>| {
                let calls = Arc::clone(&leaf_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TaskError>(WorkOutcome::processed(1).with_transferred(1))
                }
            })
            .with("branch", |op: Op, ctx: WorkContext<Op>| async move {
                let Op::Branch { width } = op else { unreachable!() };
                for n in 0..width {
                    ctx.enqueue(Op::Leaf { n })?;
                }
                ctx.enqueue(Op::Stall)?;
                Ok::<_, TaskError>(WorkOutcome::default())
            })
            .with("stall", |_op: Op, _ctx: WorkContext<Op>| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, TaskError>(WorkOutcome::processed(1))
            })
            .with("fail", |_op: Op, _ctx: WorkContext<Op>| async move {
                Err::<WorkOutcome, _>(TaskError::invalid_argument("Invalid id"))
            })
    }

    fn driver(store: &StateStore, calls: Arc<AtomicU32>) -> TaskDriver<Op> {
        TaskDriver::new(TaskIdentity::new("test", &["a", "b"]), store.clone(), registry(calls))
            .workers(2)
            .retry(RetryConfig {
                retry_max: 2,
                retry_modifier: Duration::from_millis(10),
                max_attempts: 10,
            })
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let seeds = (0..5).map(|n| Op::Leaf { n }).chain([Op::Fail]).collect();
        let summary = driver(&store, Arc::clone(&calls)).run(seeds).await.unwrap();

        assert!(!summary.aborted);
        assert_eq!(summary.processed, 6);
        assert_eq!(summary.transferred, 5);
        assert_eq!(summary.errors, vec!["Invalid id".to_string()]);
        assert_eq!(summary.status_message(), "Finished with errors.");

        let state: QueueState<Op> = store.load(&summary.task_id, false).unwrap();
        assert_eq!(state.status, QueueStatus::Finished);
        assert!(state.queued.is_empty());

        // A finished task refuses to run again until reset
        let err = driver(&store, calls).run(vec![]).await.unwrap_err();
        assert!(matches!(err, TransferError::AlreadyFinished(_)));
    }

    #[tokio::test]
    async fn test_cancel_then_resume() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let first = driver(&store, Arc::clone(&calls));
        let cancel = first.cancellation_token();
        let handle = tokio::spawn(first.run(vec![Op::Branch { width: 3 }]));

        // The stall item keeps the queue busy until cancelled
        while calls.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.status_message(), "Aborted.");
        assert_eq!(summary.queued_remaining, 1);

        let saved: QueueState<Op> = store.load(&summary.task_id, false).unwrap();
        assert!(saved.can_resume());
        assert_eq!(saved.queued[0].op, Op::Stall);

        // Resume with a stall handler that finishes immediately
        let registry = OperationRegistry::new().with("stall", |_op: Op, _ctx: WorkContext<Op>| async move {
            Ok::<_, TaskError>(WorkOutcome::processed(1))
        });
        let resumed = TaskDriver::new(summary.task_id.clone(), store.clone(), registry)
            .workers(1)
            .run(vec![Op::Branch { width: 100 }])
            .await
            .unwrap();

        assert!(resumed.resumed);
        assert!(resumed.is_success());
        assert_eq!(resumed.processed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_restart_discards_finished_state() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        driver(&store, Arc::clone(&calls))
            .run(vec![Op::Leaf { n: 1 }])
            .await
            .unwrap();
        let again = driver(&store, Arc::clone(&calls))
            .restart(true)
            .run(vec![Op::Leaf { n: 1 }])
            .await
            .unwrap();

        assert!(again.is_success());
        assert!(!again.resumed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_snapshot_saved_while_running() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let driver = driver(&store, Arc::clone(&calls)).snapshot(SnapshotConfig {
            interval: Duration::from_millis(20),
            every_items: 0,
        });
        let cancel = driver.cancellation_token();
        let task_id = driver.identity().clone();
        let handle = tokio::spawn(driver.run(vec![Op::Branch { width: 2 }]));

        while calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Mid-run snapshot holds the in-flight stall item
        let mid: QueueState<Op> = store.load(&task_id, false).unwrap();
        assert!(mid.can_resume());
        assert!(mid.queued.iter().any(|item| item.op == Op::Stall));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
