//! Core work-queue engine module
//!
//! Provides the priority queue, the handler registry, the retrying worker
//! pool and the task driver that ties them to persisted state.

mod cache;
mod collision;
mod driver;
mod item;
mod pool;
mod queue;
mod registry;
mod retry;

pub use cache::*;
pub use collision::*;
pub use driver::*;
pub use item::*;
pub use pool::*;
pub use queue::*;
pub use registry::*;
pub use retry::*;
