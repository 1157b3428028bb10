//! Work item model
//!
//! A work item is a tagged operation carrying only primitive arguments, so it
//! can cross the persistence boundary and be re-dispatched after a restart.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// Service order; lower values are dequeued first
pub type Priority = u32;

/// A schedulable operation
///
/// Implementors are usually enums with one variant per handler, serialized
/// with `#[serde(tag = "tag", content = "args")]` so a snapshot reads as an
/// op tag plus its ordered arguments. Equality defines the dedup key.
pub trait Operation:
    Clone + Eq + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Stable name of the registered handler that runs this item
    fn tag(&self) -> &'static str;

    /// Default priority for this kind of work
    fn priority(&self) -> Priority;
}

/// An operation together with the priority it was enqueued at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedItem<Op> {
    /// Priority the item was enqueued with
    pub priority: Priority,
    /// The operation itself
    pub op: Op,
}

impl<Op: Operation> QueuedItem<Op> {
    /// Wrap an operation at its default priority
    pub fn new(op: Op) -> Self {
        Self {
            priority: op.priority(),
            op,
        }
    }
}

/// A dequeued item checked out to one worker
///
/// Handing the lease back through [`WorkQueue::task_done`](super::WorkQueue::task_done)
/// completes it. A lease that is dropped without completion keeps the item
/// outstanding, so it stays in every later snapshot.
#[derive(Debug)]
pub struct Lease<Op> {
    pub(crate) priority: Priority,
    pub(crate) seq: u64,
    pub(crate) op: Op,
}

impl<Op> Lease<Op> {
    /// The checked-out operation
    pub fn op(&self) -> &Op {
        &self.op
    }

    /// Priority it was queued at
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Position in enqueue order
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}
