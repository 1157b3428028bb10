//! Throughput tracking
//!
//! Counts processed items since the run started and derives a rate plus an
//! ETA for the items still outstanding.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Minimum elapsed time before a rate is reported
pub const MIN_RATE_WINDOW: Duration = Duration::from_secs(1);

/// Rate and ETA at one point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputStats {
    /// Items per second since start
    pub rate: f64,
    /// Estimated time until the remaining items are processed
    pub eta: Duration,
}

impl fmt::Display for ThroughputStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let eta = Duration::from_secs(self.eta.as_secs());
        write!(
            f,
            "Rate: {:.2}/s, ETA: {}",
            self.rate,
            humantime::format_duration(eta)
        )
    }
}

/// Thread-safe processed-item counter with a start time
#[derive(Debug, Default)]
pub struct ThroughputTracker {
    started: Mutex<Option<Instant>>,
    processed: AtomicU64,
}

impl ThroughputTracker {
    /// New tracker; not started
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the clock
    pub fn start(&self) {
        self.start_at(Instant::now());
    }

    /// Start the clock at a given instant
    pub fn start_at(&self, at: Instant) {
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    /// Record one processed item
    pub fn processed(&self) {
        self.processed_n(1);
    }

    /// Record `n` processed items
    pub fn processed_n(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    /// Items processed so far
    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Time since `start`, zero if never started
    pub fn elapsed(&self) -> Duration {
        self.started_at()
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn started_at(&self) -> Option<Instant> {
        *self.started.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stats now for `remaining` outstanding items
    pub fn stats(&self, remaining: u64) -> Option<ThroughputStats> {
        self.stats_at(Instant::now(), remaining)
    }

    /// Stats at `now`; `None` before start, while nothing has been
    /// processed yet, or within the first second
    pub fn stats_at(&self, now: Instant, remaining: u64) -> Option<ThroughputStats> {
        let started = self.started_at()?;
        let processed = self.total_processed();
        let elapsed = now.saturating_duration_since(started);
        if processed == 0 || elapsed < MIN_RATE_WINDOW {
            return None;
        }

        let rate = processed as f64 / elapsed.as_secs_f64();
        let eta = Duration::from_secs_f64(remaining as f64 / rate);
        Some(ThroughputStats { rate, eta })
    }
}
