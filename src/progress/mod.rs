//! Progress reporting module
//!
//! Tracks throughput for a running task and renders its status line.

mod reporter;
mod throughput;

pub use reporter::*;
pub use throughput::*;
