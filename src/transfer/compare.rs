//! Tree comparison
//!
//! Walks a source and a destination side by side through the work queue and
//! reports entries that exist on one side only, plus files whose size or
//! content differ. Sizes are compared first and content is hashed only when
//! they agree. Nothing is persisted; a comparison is cheap to rerun.

use super::local::{CHILDREN_PRIORITY, FILE_PRIORITY};
use crate::config::{CollisionMode, ExcludeList, HashAlgorithm, RetryConfig};
use crate::core::{
    CollisionResolver, Handler, Operation, OperationRegistry, Priority, SizeCheck, WorkContext,
    WorkOutcome, WorkQueue, WorkResult, WorkerPool,
};
use crate::error::{IoResultExt, Result, TaskError, TransferError};
use crate::hash::hash_file_async;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Findings listed per category in the printed summary
const SUMMARY_LIMIT: usize = 20;

/// Work items of a tree comparison
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tag", content = "args", rename_all = "snake_case")]
pub enum CompareOp {
    /// Compare two files by size, then content
    CompareFile { source: PathBuf, dest: PathBuf },
    /// Match up the entries of two directories
    CompareDir { source: PathBuf, dest: PathBuf },
}

impl Operation for CompareOp {
    fn tag(&self) -> &'static str {
        match self {
            Self::CompareFile { .. } => "compare_file",
            Self::CompareDir { .. } => "compare_dir",
        }
    }

    fn priority(&self) -> Priority {
        match self {
            Self::CompareFile { .. } => FILE_PRIORITY,
            Self::CompareDir { .. } => CHILDREN_PRIORITY,
        }
    }
}

/// Why two present entries differ
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mismatch {
    /// A file on one side, a folder on the other
    Kind,
    /// Different byte counts
    Size,
    /// Same size, different hash
    Content,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind => write!(f, "TYPE MISMATCH"),
            Self::Size => write!(f, "FILE SIZE MISMATCH"),
            Self::Content => write!(f, "FILE CONTENT MISMATCH"),
        }
    }
}

/// One difference between the trees
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Finding {
    /// `expected` does not exist although `found` does
    Missing { expected: PathBuf, found: PathBuf },
    /// Both exist but differ
    NotEqual {
        source: PathBuf,
        dest: PathBuf,
        reason: Mismatch,
    },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { expected, found } => {
                write!(f, "[-] {} -> {} [NOT FOUND]", found.display(), expected.display())
            }
            Self::NotEqual { source, dest, reason } => {
                write!(f, "[-] {} <-> {} [{}]", source.display(), dest.display(), reason)
            }
        }
    }
}

/// Options for one comparison
#[derive(Debug, Clone, Default)]
pub struct CompareOptions {
    /// Hash used when sizes match
    pub hash: HashAlgorithm,
    /// Entries to leave out on both sides
    pub excludes: ExcludeList,
}

/// Result of a comparison
#[derive(Debug, Clone)]
pub struct CompareSummary {
    /// Canonical source
    pub source: PathBuf,
    /// Canonical destination
    pub destination: PathBuf,
    /// Pairs compared, failures included
    pub compared: u64,
    /// Entries present on one side only
    pub missing: Vec<Finding>,
    /// Entries present on both sides that differ
    pub not_equal: Vec<Finding>,
    /// Final error messages
    pub errors: Vec<String>,
    /// True when the run was cancelled
    pub aborted: bool,
    /// Wall-clock time
    pub duration: Duration,
}

impl CompareSummary {
    /// Complete, identical and error free
    pub fn is_success(&self) -> bool {
        !self.aborted && self.errors.is_empty() && self.missing.is_empty() && self.not_equal.is_empty()
    }

    /// Closing line
    pub fn status_message(&self) -> &'static str {
        if self.aborted {
            "Aborted."
        } else if !self.errors.is_empty() {
            "Finished with errors."
        } else if !self.missing.is_empty() || !self.not_equal.is_empty() {
            "Finished with differences."
        } else {
            "Finished successfully."
        }
    }

    /// Print summary to stdout
    pub fn print_summary(&self) {
        println!();
        println!("Compared {} items.", self.compared);
        println!(
            "Run time: {}",
            humantime::format_duration(Duration::from_secs(self.duration.as_secs()))
        );

        for (label, findings) in [("missing", &self.missing), ("mismatched", &self.not_equal)] {
            if findings.is_empty() {
                continue;
            }
            println!();
            println!("Found {} {} items.", findings.len(), label);
            for finding in findings.iter().take(SUMMARY_LIMIT) {
                println!("  {}", finding);
            }
            if findings.len() > SUMMARY_LIMIT {
                println!("  ... and {} more", findings.len() - SUMMARY_LIMIT);
            }
        }

        if !self.errors.is_empty() {
            println!();
            println!("Errors:");
            for err in &self.errors {
                println!("  - {}", err);
            }
        }

        println!();
        println!("{}", self.status_message());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Dir,
}

/// Comparison engine shared by both handlers
pub struct TreeCompare {
    options: CompareOptions,
    resolver: CollisionResolver,
    findings: Mutex<Vec<Finding>>,
}

impl TreeCompare {
    /// New engine
    pub fn new(options: CompareOptions) -> Self {
        Self {
            options,
            resolver: CollisionResolver::new(CollisionMode::UpdateIfDifferent),
            findings: Mutex::new(Vec::new()),
        }
    }

    /// Canonicalize both endpoints and produce the seed item
    ///
    /// Both must exist and both must be files or both folders.
    pub async fn plan(&self, source: &Path, destination: &Path) -> Result<(PathBuf, PathBuf, CompareOp)> {
        let source = canonical(source).await?;
        let destination = canonical(destination).await?;
        let source_meta = tokio::fs::metadata(&source).await.with_path(&source)?;
        let dest_meta = tokio::fs::metadata(&destination).await.with_path(&destination)?;

        let seed = if source_meta.is_file() && dest_meta.is_file() {
            CompareOp::CompareFile {
                source: source.clone(),
                dest: destination.clone(),
            }
        } else if source_meta.is_dir() && dest_meta.is_dir() {
            CompareOp::CompareDir {
                source: source.clone(),
                dest: destination.clone(),
            }
        } else {
            return Err(TransferError::InvalidArgument(
                "Source and destination must both be files or both be folders".to_string(),
            ));
        };

        Ok((source, destination, seed))
    }

    /// Registry wiring both handlers to this engine
    pub fn registry(self: &Arc<Self>) -> OperationRegistry<CompareOp> {
        OperationRegistry::new()
            .with("compare_file", CompareHandler(Arc::clone(self)))
            .with("compare_dir", CompareHandler(Arc::clone(self)))
    }

    /// Compare `source` with `destination` on `workers` workers
    pub async fn run(
        self: &Arc<Self>,
        source: &Path,
        destination: &Path,
        workers: usize,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Result<CompareSummary> {
        let started = Instant::now();
        let (source, destination, seed) = self.plan(source, destination).await?;
        info!(
            workers,
            excludes = %self.options.excludes.describe(),
            "Comparing {} to {}",
            source.display(),
            destination.display()
        );

        let queue = Arc::new(WorkQueue::with_cancellation(cancel));
        queue.push(seed)?;
        let pool = Arc::new(WorkerPool::new(Arc::clone(&queue), Arc::new(self.registry()), retry));
        let mut set = pool.spawn(workers);

        let aborted = match queue.join().await {
            Ok(()) => false,
            Err(TransferError::Cancelled) => true,
            Err(e) => return Err(e),
        };
        if !aborted {
            queue.seal();
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Worker panicked");
                    pool.stats()
                        .record_error(TransferError::WorkerPanicked(e.to_string()).to_string());
                }
            }
        }

        let mut findings = std::mem::take(&mut *self.findings.lock().unwrap_or_else(PoisonError::into_inner));
        findings.sort();
        let (missing, not_equal): (Vec<_>, Vec<_>) = findings
            .into_iter()
            .partition(|f| matches!(f, Finding::Missing { .. }));

        let summary = CompareSummary {
            source,
            destination,
            compared: pool.stats().processed(),
            missing,
            not_equal,
            errors: pool.stats().errors(),
            aborted,
            duration: started.elapsed(),
        };
        info!(
            compared = summary.compared,
            missing = summary.missing.len(),
            not_equal = summary.not_equal.len(),
            errors = summary.errors.len(),
            "{}",
            summary.status_message()
        );
        Ok(summary)
    }

    fn excluded(&self, path: &Path) -> bool {
        self.options.excludes.matches_path(path)
    }

    fn record(&self, finding: Finding) {
        warn!("{}", finding);
        self.findings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(finding);
    }

    async fn list(dir: &Path, ctx: &WorkContext<CompareOp>) -> std::result::Result<BTreeMap<OsString, EntryKind>, TaskError> {
        let list_error = |e: std::io::Error| {
            ctx.transient(format!("Failed to list folders and files for: {}", dir.display()))
                .with_cause(e)
        };

        let mut entries = tokio::fs::read_dir(dir).await.map_err(list_error)?;
        let mut listed = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
            let file_type = entry.file_type().await.map_err(list_error)?;
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                debug!(path = %entry.path().display(), "Skipping special file");
                continue;
            };
            listed.insert(entry.file_name(), kind);
        }
        Ok(listed)
    }

    async fn compare_dir(&self, source: &Path, dest: &Path, ctx: &WorkContext<CompareOp>) -> WorkResult {
        let (left, right) = tokio::try_join!(Self::list(source, ctx), Self::list(dest, ctx))?;
        let names: BTreeSet<&OsString> = left.keys().chain(right.keys()).collect();

        for name in names {
            let src = source.join(name);
            let dst = dest.join(name);
            if self.excluded(&src) || self.excluded(&dst) {
                debug!(path = %src.display(), "Skipping excluded item");
                continue;
            }

            match (left.get(name), right.get(name)) {
                (Some(_), None) => self.record(Finding::Missing {
                    expected: dst,
                    found: src,
                }),
                (None, Some(_)) => self.record(Finding::Missing {
                    expected: src,
                    found: dst,
                }),
                (Some(EntryKind::Dir), Some(EntryKind::Dir)) => {
                    ctx.enqueue(CompareOp::CompareDir { source: src, dest: dst })?;
                }
                (Some(EntryKind::File), Some(EntryKind::File)) => {
                    ctx.enqueue(CompareOp::CompareFile { source: src, dest: dst })?;
                }
                (Some(_), Some(_)) => self.record(Finding::NotEqual {
                    source: src,
                    dest: dst,
                    reason: Mismatch::Kind,
                }),
                (None, None) => {}
            }
        }

        debug!(source = %source.display(), dest = %dest.display(), "Folders matched up");
        Ok(WorkOutcome::processed(1))
    }

    async fn compare_file(&self, source: &Path, dest: &Path, ctx: &WorkContext<CompareOp>) -> WorkResult {
        let src_meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| ctx.io_error(format!("Failed to read file: {}", source.display()), e))?;
        let dest_meta = tokio::fs::metadata(dest)
            .await
            .map_err(|e| ctx.io_error(format!("Failed to read file: {}", dest.display()), e))?;

        let mismatch = match self.resolver.decide(true, Some(src_meta.len()), Some(dest_meta.len())) {
            SizeCheck::Decided(resolution) => resolution.should_write().then_some(Mismatch::Size),
            SizeCheck::CompareHashes => {
                let (src_hash, dest_hash) = tokio::try_join!(
                    hash_file_async(source, self.options.hash),
                    hash_file_async(dest, self.options.hash)
                )
                .map_err(|e| ctx.transient(format!("Failed to compare '{}': {}", dest.display(), e)))?;
                CollisionResolver::decide_by_hash(&src_hash.hash, &dest_hash.hash)
                    .should_write()
                    .then_some(Mismatch::Content)
            }
        };

        match mismatch {
            Some(reason) => self.record(Finding::NotEqual {
                source: source.to_path_buf(),
                dest: dest.to_path_buf(),
                reason,
            }),
            None => debug!(source = %source.display(), dest = %dest.display(), "Files match"),
        }
        Ok(WorkOutcome::processed(1))
    }
}

async fn canonical(path: &Path) -> Result<PathBuf> {
    match tokio::fs::canonicalize(path).await {
        Ok(path) => Ok(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TransferError::NotFound(path.to_path_buf())),
        Err(e) => Err(TransferError::io(path, e)),
    }
}

struct CompareHandler(Arc<TreeCompare>);

#[async_trait]
impl Handler<CompareOp> for CompareHandler {
    async fn handle(&self, op: &CompareOp, ctx: &WorkContext<CompareOp>) -> WorkResult {
        match op {
            CompareOp::CompareFile { source, dest } => self.0.compare_file(source, dest, ctx).await,
            CompareOp::CompareDir { source, dest } => self.0.compare_dir(source, dest, ctx).await,
        }
    }
}
