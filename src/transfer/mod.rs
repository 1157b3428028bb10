//! Transfer collaborators
//!
//! Operation sets that run on the work-queue engine: a local tree copy and
//! a side-by-side tree comparison.

mod compare;
mod local;

pub use compare::*;
pub use local::*;
