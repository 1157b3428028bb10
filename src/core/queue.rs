//! Priority work queue with dedup and join
//!
//! Items are served lowest priority first and FIFO within a priority. An
//! operation that is already queued or checked out to a worker is never
//! queued a second time. All mutation happens under one short mutex that is
//! never held across an await; waiters are woken through `Notify`.

use crate::core::item::{Lease, Operation, Priority, QueuedItem};
use crate::error::{Result, TransferError};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Heap entry ordered so the smallest (priority, seq) pops first
#[derive(Debug)]
struct Entry<Op> {
    priority: Priority,
    seq: u64,
    op: Op,
}

impl<Op> PartialEq for Entry<Op> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<Op> Eq for Entry<Op> {}

impl<Op> PartialOrd for Entry<Op> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<Op> Ord for Entry<Op> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

#[derive(Debug)]
struct Inner<Op> {
    heap: BinaryHeap<Entry<Op>>,
    queued: HashSet<Op>,
    checked_out: HashMap<Op, (Priority, u64)>,
    next_seq: u64,
    sealed: bool,
    enqueued_total: u64,
    completed_total: u64,
}

impl<Op: Operation> Inner<Op> {
    fn is_drained(&self) -> bool {
        self.heap.is_empty() && self.checked_out.is_empty()
    }

    fn pop(&mut self) -> Option<Lease<Op>> {
        let entry = self.heap.pop()?;
        self.queued.remove(&entry.op);
        self.checked_out
            .insert(entry.op.clone(), (entry.priority, entry.seq));
        Some(Lease {
            priority: entry.priority,
            seq: entry.seq,
            op: entry.op,
        })
    }
}

/// Counters for observability and conservation checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    /// Items waiting to be dequeued
    pub queued: usize,
    /// Items checked out to workers
    pub in_flight: usize,
    /// Items accepted by `enqueue` (after dedup)
    pub enqueued_total: u64,
    /// Items completed through `task_done`
    pub completed_total: u64,
}

/// Async-safe priority queue shared by the driver and all workers
#[derive(Debug)]
pub struct WorkQueue<Op> {
    inner: Mutex<Inner<Op>>,
    available: Notify,
    drained: Notify,
    cancel: CancellationToken,
}

impl<Op: Operation> Default for WorkQueue<Op> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Op: Operation> WorkQueue<Op> {
    /// Create an empty queue with its own cancellation token
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Create an empty queue cancelled by an external token
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                queued: HashSet::new(),
                checked_out: HashMap::new(),
                next_seq: 0,
                sealed: false,
                enqueued_total: 0,
                completed_total: 0,
            }),
            available: Notify::new(),
            drained: Notify::new(),
            cancel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<Op>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an item; returns false when an identical item is already
    /// queued or checked out
    pub fn enqueue(&self, priority: Priority, op: Op) -> Result<bool> {
        {
            let mut inner = self.lock();
            if inner.sealed {
                return Err(TransferError::QueueSealed);
            }
            if inner.queued.contains(&op) || inner.checked_out.contains_key(&op) {
                return Ok(false);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.enqueued_total += 1;
            inner.queued.insert(op.clone());
            inner.heap.push(Entry { priority, seq, op });
        }
        self.available.notify_one();
        Ok(true)
    }

    /// Insert an item at its operation's default priority
    pub fn push(&self, op: Op) -> Result<bool> {
        let priority = op.priority();
        self.enqueue(priority, op)
    }

    /// Take the next item without waiting
    pub fn try_dequeue(&self) -> Option<Lease<Op>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.lock().pop()
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue is cancelled, or once it is sealed and
    /// nothing is left to hand out.
    pub async fn dequeue(&self) -> Option<Lease<Op>> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(lease) = inner.pop() {
                    return Some(lease);
                }
                if inner.sealed {
                    return None;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    /// Mark a checked-out item complete
    pub fn task_done(&self, lease: Lease<Op>) {
        let drained = {
            let mut inner = self.lock();
            if inner.checked_out.remove(&lease.op).is_some() {
                inner.completed_total += 1;
            } else {
                tracing::warn!(op = ?lease.op, "task_done for an item that was not checked out");
            }
            inner.is_drained()
        };
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Wait until nothing is queued and nothing is checked out
    ///
    /// A worker expanding a container enqueues children before completing
    /// its own lease, so the queue never looks drained in between.
    pub async fn join(&self) -> Result<()> {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().is_drained() {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            }
        }
    }

    /// Number of items waiting to be dequeued
    pub fn size(&self) -> usize {
        self.lock().heap.len()
    }

    /// True when at least one item is waiting
    pub fn has_queued(&self) -> bool {
        !self.lock().heap.is_empty()
    }

    /// Items queued plus items checked out
    pub fn outstanding(&self) -> usize {
        let inner = self.lock();
        inner.heap.len() + inner.checked_out.len()
    }

    /// Counters in one consistent read
    pub fn counts(&self) -> QueueCounts {
        let inner = self.lock();
        QueueCounts {
            queued: inner.heap.len(),
            in_flight: inner.checked_out.len(),
            enqueued_total: inner.enqueued_total,
            completed_total: inner.completed_total,
        }
    }

    /// Every outstanding item, checked-out ones included, in service order
    pub fn snapshot(&self) -> Vec<QueuedItem<Op>> {
        let inner = self.lock();
        let mut items: Vec<(Priority, u64, Op)> = inner
            .heap
            .iter()
            .map(|e| (e.priority, e.seq, e.op.clone()))
            .chain(
                inner
                    .checked_out
                    .iter()
                    .map(|(op, (priority, seq))| (*priority, *seq, op.clone())),
            )
            .collect();
        drop(inner);

        items.sort_by_key(|(priority, seq, _)| (*priority, *seq));
        items
            .into_iter()
            .map(|(priority, _, op)| QueuedItem { priority, op })
            .collect()
    }

    /// Refuse further enqueues and release idle workers
    pub fn seal(&self) {
        self.lock().sealed = true;
        self.available.notify_waiters();
    }

    /// Whether the queue has been sealed
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Stop all waiters at their next suspension point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The token this queue observes
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
