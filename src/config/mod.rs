//! Configuration module for TransferQ
//!
//! Provides configuration management including CLI arguments,
//! worker sizing, retry defaults and snapshot cadence.

mod settings;

pub use settings::*;
