//! Resumable task state
//!
//! Provides:
//! - Deterministic task identities
//! - Atomic, per-task persistence of the outstanding queue

mod identity;
mod resume;

pub use identity::*;
pub use resume::*;
