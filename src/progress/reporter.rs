//! Progress reporter implementation
//!
//! A single indicatif spinner carrying the run's status line:
//! processed, transferred, error and queued counts plus rate and ETA.

use crate::progress::ThroughputStats;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Counts shown on the status line
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatusLine {
    /// Items processed
    pub processed: u64,
    /// Items copied
    pub transferred: u64,
    /// Final failures
    pub errors: u64,
    /// Items still queued or in flight
    pub queued: u64,
    /// Current rate and ETA, once known
    pub throughput: Option<ThroughputStats>,
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Processed: {}, Transferred: {}, Errors: {}, Queued: {}",
            self.processed, self.transferred, self.errors, self.queued
        )?;
        if let Some(stats) = &self.throughput {
            write!(f, ", {}", stats)?;
        }
        Ok(())
    }
}

/// Live status line for a running task
pub struct ProgressReporter {
    status: ProgressBar,
    enabled: AtomicBool,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let status = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} [{elapsed_precise}] {msg}") {
            status.set_style(style);
        }
        status.enable_steady_tick(Duration::from_millis(120));

        Self {
            status,
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a disabled progress reporter (for quiet mode)
    pub fn disabled() -> Self {
        Self {
            status: ProgressBar::hidden(),
            enabled: AtomicBool::new(false),
        }
    }

    /// Replace the status line
    pub fn update(&self, line: &StatusLine) {
        self.status.set_message(line.to_string());
    }

    /// Set a free-form status message
    pub fn set_status(&self, msg: &str) {
        self.status.set_message(msg.to_string());
    }

    /// Last rendered message
    pub fn message(&self) -> String {
        self.status.message()
    }

    /// Finish progress with success message
    pub fn finish_success(&self, message: &str) {
        self.status.finish_with_message(format!("✓ {}", message));
    }

    /// Finish progress with error message
    pub fn finish_error(&self, message: &str) {
        self.status.abandon_with_message(format!("✗ {}", message));
    }

    /// Check if progress is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}
