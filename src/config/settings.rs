//! Configuration settings for TransferQ
//!
//! Defines the CLI arguments, the engine configuration derived from them,
//! and the defaults each operation class starts from.

use crate::error::{Result, TransferError, DEFAULT_RETRY_MAX, DEFAULT_RETRY_MODIFIER};
use clap::{Parser, Subcommand, ValueEnum};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TransferQ - resumable, prioritized bulk copy
#[derive(Parser, Debug, Clone)]
#[command(name = "transferq")]
#[command(author = "TransferQ Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resumable, prioritized, concurrent bulk copy")]
#[command(long_about = r#"
TransferQ copies large trees with a pool of concurrent workers and a
persisted work queue. An interrupted run picks up where it stopped the next
time the same command is issued.

Examples:
  transferq copy /data/src /data/dst                       # Copy a tree
  transferq copy /src /dst --on-collision skip             # Never overwrite
  transferq copy /src /dst --exclude '*.tmp' --restart     # Start over
  transferq compare /data/src /data/dst/src                # Verify a copy
  transferq status                                         # Show saved runs
"#)]
pub struct CliArgs {
    /// Directory holding persisted queue states
    #[arg(long, env = "TRANSFERQ_STATE_DIR", value_name = "PATH", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Workers for copy operations (0 = auto-detect)
    #[arg(long, env = "TRANSFERQ_COPY_WORKERS", default_value = "0", value_name = "NUM", global = true)]
    pub copy_workers: usize,

    /// Workers for listing and comparison walks (0 = auto-detect)
    #[arg(long, env = "TRANSFERQ_LIST_WORKERS", default_value = "0", value_name = "NUM", global = true)]
    pub list_workers: usize,

    /// Attempts allowed for a retryable failure
    #[arg(long, default_value_t = DEFAULT_RETRY_MAX, value_name = "NUM", global = true)]
    pub retry_max: u32,

    /// Backoff unit; attempt N waits N times this (e.g. 1s, 500ms)
    #[arg(long, default_value = "1s", value_parser = parse_duration, value_name = "DURATION", global = true)]
    pub retry_modifier: Duration,

    /// Hard ceiling on attempts regardless of what an error allows
    #[arg(long, default_value = "10", value_name = "NUM", global = true)]
    pub max_attempts: u32,

    /// Save the queue at least this often while running
    #[arg(long, default_value = "30s", value_parser = parse_duration, value_name = "DURATION", global = true)]
    pub snapshot_interval: Duration,

    /// Save the queue after this many completed items
    #[arg(long, default_value = "500", value_name = "NUM", global = true)]
    pub snapshot_every: u64,

    /// Show a live status line
    #[arg(short = 'p', long, global = true)]
    pub progress: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Log file path
    #[arg(long, value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Copy a file or directory tree, resuming an interrupted run
    #[command(name = "copy")]
    Copy {
        /// Source file or directory
        source: PathBuf,
        /// Destination directory
        destination: PathBuf,
        /// What to do when the destination item exists
        #[arg(long, value_enum, default_value = "update-if-different")]
        on_collision: CollisionMode,
        /// Name, path or glob to skip (repeatable)
        #[arg(long, value_name = "PATTERN")]
        exclude: Vec<String>,
        /// Copy the contents of SOURCE rather than SOURCE itself
        #[arg(long)]
        only_children: bool,
        /// Discard any saved state and start over
        #[arg(long)]
        restart: bool,
        /// Hash used to compare files of equal size
        #[arg(long, value_enum, default_value = "xxhash3")]
        hash: HashAlgorithm,
        /// Override the copy worker count for this run
        #[arg(short = 'w', long, value_name = "NUM")]
        workers: Option<usize>,
    },

    /// Compare two trees and report missing or differing items
    #[command(name = "compare")]
    Compare {
        /// Source file or directory
        source: PathBuf,
        /// File or directory to compare against
        destination: PathBuf,
        /// Name, path or glob to leave out (repeatable)
        #[arg(long, value_name = "PATTERN")]
        exclude: Vec<String>,
        /// Hash used to compare files of equal size
        #[arg(long, value_enum, default_value = "xxhash3")]
        hash: HashAlgorithm,
        /// Override the listing worker count for this run
        #[arg(short = 'w', long, value_name = "NUM")]
        workers: Option<usize>,
    },

    /// List persisted task states
    #[command(name = "status")]
    Status,

    /// Remove finished or stale task states
    #[command(name = "clean")]
    Clean {
        /// Remove states not updated within this window
        #[arg(long, default_value = "7days", value_parser = parse_duration)]
        max_age: Duration,
        /// Remove only this task's state
        #[arg(long, value_name = "ID")]
        task: Option<String>,
    },
}

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Hash algorithm for content comparison
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// XXHash3 - Ultra fast, non-cryptographic (128-bit)
    #[default]
    #[value(name = "xxhash3")]
    XXHash3,
    /// XXHash64 - Fast, non-cryptographic (64-bit)
    #[value(name = "xxhash64")]
    XXHash64,
    /// BLAKE3 - Fast and cryptographically secure
    #[value(name = "blake3")]
    Blake3,
    /// SHA-256 - Standard cryptographic hash
    #[value(name = "sha256")]
    Sha256,
}

impl HashAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::XXHash3 => "XXHash3",
            Self::XXHash64 => "XXHash64",
            Self::Blake3 => "BLAKE3",
            Self::Sha256 => "SHA-256",
        }
    }
}

/// Policy for destination items that already exist
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionMode {
    /// Leave existing items alone
    #[value(name = "skip")]
    Skip,
    /// Always overwrite existing items
    #[value(name = "update")]
    Update,
    /// Overwrite only when size or content differs
    #[default]
    #[value(name = "update-if-different")]
    UpdateIfDifferent,
}

/// Operation classes that get their own worker count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Tree-to-tree copies
    Copy,
    /// Listing and comparison walks
    List,
}

impl OperationClass {
    /// Short name used in state identities and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::List => "list",
        }
    }
}

/// Worker counts per operation class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Copy workers
    pub copy: usize,
    /// Listing workers
    pub list: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            copy: (cpus * 2).max(2),
            list: (cpus * 2).max(2),
        }
    }
}

impl WorkerConfig {
    /// Worker count for a class, never zero
    pub fn workers_for(&self, class: OperationClass) -> usize {
        let n = match class {
            OperationClass::Copy => self.copy,
            OperationClass::List => self.list,
        };
        n.max(1)
    }
}

/// Retry defaults handed to operations and the ceiling the pool enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts a retryable error allows unless it says otherwise
    pub retry_max: u32,
    /// Backoff unit for retryable errors
    pub retry_modifier: Duration,
    /// Hard upper bound on attempts per item
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_max: DEFAULT_RETRY_MAX,
            retry_modifier: DEFAULT_RETRY_MODIFIER,
            max_attempts: 10,
        }
    }
}

/// How often the live queue is persisted while running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Time-based cadence
    pub interval: Duration,
    /// Completed-item cadence (0 disables)
    pub every_items: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            every_items: 500,
        }
    }
}

/// Ids, names and paths to skip entirely
///
/// Entries containing glob metacharacters are matched as globs, everything
/// else by exact, case-sensitive comparison.
#[derive(Debug, Clone, Default)]
pub struct ExcludeList {
    exact: Vec<String>,
    patterns: Vec<String>,
    globs: Option<GlobSet>,
}

impl ExcludeList {
    /// Build from raw user input
    pub fn new<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exact = Vec::new();
        let mut patterns = Vec::new();
        let mut builder = GlobSetBuilder::new();

        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry.contains(['*', '?', '[', '{']) {
                let glob = Glob::new(entry)
                    .map_err(|e| TransferError::config(format!("Invalid exclude '{}': {}", entry, e)))?;
                builder.add(glob);
                patterns.push(entry.to_string());
            } else {
                exact.push(entry.to_string());
            }
        }

        let globs = if patterns.is_empty() {
            None
        } else {
            Some(
                builder
                    .build()
                    .map_err(|e| TransferError::config(format!("Invalid exclude set: {}", e)))?,
            )
        };

        Ok(Self { exact, patterns, globs })
    }

    /// True when no exclusions are configured
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }

    /// Check whether any candidate value is excluded
    pub fn matches<S: AsRef<str>>(&self, candidates: &[S]) -> bool {
        candidates.iter().any(|candidate| {
            let candidate = candidate.as_ref();
            self.exact.iter().any(|e| e == candidate)
                || self.globs.as_ref().map(|g| g.is_match(candidate)).unwrap_or(false)
        })
    }

    /// Check a path by its name, full path and parent
    pub fn matches_path(&self, path: &Path) -> bool {
        if self.is_empty() {
            return false;
        }
        let mut candidates = vec![path.to_string_lossy().into_owned()];
        if let Some(name) = path.file_name() {
            candidates.push(name.to_string_lossy().into_owned());
        }
        if let Some(parent) = path.parent() {
            candidates.push(parent.to_string_lossy().into_owned());
        }
        self.matches(&candidates)
    }

    /// Human-readable listing for the run header
    pub fn describe(&self) -> String {
        self.exact
            .iter()
            .chain(self.patterns.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where queue states live
    pub state_dir: PathBuf,
    /// Worker counts per class
    pub workers: WorkerConfig,
    /// Retry defaults
    pub retry: RetryConfig,
    /// Snapshot cadence
    pub snapshot: SnapshotConfig,
    /// Collision policy
    pub collision: CollisionMode,
    /// Hash used when sizes match under update-if-different
    pub hash: HashAlgorithm,
    /// Raw exclude entries
    pub excludes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            workers: WorkerConfig::default(),
            retry: RetryConfig::default(),
            snapshot: SnapshotConfig::default(),
            collision: CollisionMode::UpdateIfDifferent,
            hash: HashAlgorithm::XXHash3,
            excludes: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Create config from CLI arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let mut config = Self::default();
        let auto = WorkerConfig::default();

        if let Some(dir) = &args.state_dir {
            config.state_dir = dir.clone();
        }

        config.workers = WorkerConfig {
            copy: if args.copy_workers == 0 { auto.copy } else { args.copy_workers },
            list: if args.list_workers == 0 { auto.list } else { args.list_workers },
        };

        if args.retry_max == 0 {
            return Err(TransferError::config("--retry-max must be at least 1"));
        }
        if args.max_attempts == 0 {
            return Err(TransferError::config("--max-attempts must be at least 1"));
        }
        config.retry = RetryConfig {
            retry_max: args.retry_max,
            retry_modifier: args.retry_modifier,
            max_attempts: args.max_attempts,
        };

        config.snapshot = SnapshotConfig {
            interval: args.snapshot_interval.max(Duration::from_millis(100)),
            every_items: args.snapshot_every,
        };

        match &args.command {
            Commands::Copy {
                on_collision,
                exclude,
                hash,
                workers,
                ..
            } => {
                config.collision = *on_collision;
                config.excludes = exclude.clone();
                config.hash = *hash;
                if let Some(n) = workers {
                    config.workers.copy = (*n).max(1);
                }
            }
            Commands::Compare {
                exclude,
                hash,
                workers,
                ..
            } => {
                config.excludes = exclude.clone();
                config.hash = *hash;
                if let Some(n) = workers {
                    config.workers.list = (*n).max(1);
                }
            }
            Commands::Status | Commands::Clean { .. } => {}
        }

        Ok(config)
    }

    /// Compile the exclude list
    pub fn exclude_list(&self) -> Result<ExcludeList> {
        ExcludeList::new(&self.excludes)
    }
}

/// `$HOME/.transferq/state`, or `./.transferq/state` without a home
pub fn default_state_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".transferq").join("state")
}

/// Parse a human-readable duration ("30s", "1m 30s", "500ms")
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(value.trim()).map_err(|e| format!("Invalid duration '{}': {}", value, e))
}
