//! # TransferQ - Resumable, Prioritized Bulk Transfer
//!
//! TransferQ runs bulk transfers as a persisted work queue drained by a pool
//! of concurrent workers. Walking a tree produces more work (listings yield
//! files and folders), so the frontier lives in a priority queue that is
//! snapshotted to disk; an interrupted run resumes from the snapshot.
//!
//! ## Features
//!
//! - **Priority Scheduling**: Leaf work before containers before listings
//! - **Dedup**: An item already queued or in flight is never queued twice
//! - **Retry with Backoff**: Typed errors carry their own retry budget
//! - **Resumable**: Atomic snapshots keyed by a deterministic task id
//! - **Collision Policies**: skip, update, or update-if-different by hash
//! - **Tree Compare**: report missing and differing items between two trees
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use transferq::core::TaskDriver;
//! use transferq::sync::StateStore;
//! use transferq::transfer::{LocalCopy, LocalCopyOptions};
//!
//! # async fn run() -> transferq::Result<()> {
//! let engine = Arc::new(LocalCopy::new(LocalCopyOptions::default()));
//! let (source, dest, seeds) = engine.plan(Path::new("/data/src"), Path::new("/data/dst")).await?;
//!
//! let store = StateStore::new("/var/lib/transferq")?;
//! let summary = TaskDriver::new(engine.identity(&source, &dest), store, engine.registry())
//!     .workers(8)
//!     .run(seeds)
//!     .await?;
//!
//! summary.print_summary();
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Operations
//!
//! Any serializable enum can drive the engine: implement
//! [`Operation`](core::Operation) for it and register one
//! [`Handler`](core::Handler) per tag.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod error;
pub mod hash;
pub mod progress;
pub mod sync;
pub mod transfer;

// Re-export commonly used types
pub use config::{CollisionMode, EngineConfig, HashAlgorithm};
pub use core::{OperationRegistry, RunSummary, TaskDriver, WorkQueue};
pub use error::{Result, TaskError, TransferError};
pub use progress::ProgressReporter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use transferq::prelude::*;
    //! ```

    pub use crate::config::{CollisionMode, EngineConfig, HashAlgorithm, RetryConfig, SnapshotConfig};
    pub use crate::core::{
        Handler, Operation, OperationRegistry, Priority, RunSummary, TaskDriver, WorkContext,
        WorkOutcome, WorkQueue, WorkResult,
    };
    pub use crate::error::{Result, TaskError, TaskErrorKind, TransferError};
    pub use crate::progress::ProgressReporter;
    pub use crate::sync::{StateStore, TaskIdentity};
    pub use crate::transfer::{CompareOptions, LocalCopy, LocalCopyOptions, LocalOp, TreeCompare};
}
