//! Hash computation module
//!
//! Content hashes decide whether same-sized files actually differ.

mod integrity;

pub use integrity::*;
