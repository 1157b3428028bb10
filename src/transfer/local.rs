//! Local tree copy
//!
//! Three operations cooperate to copy a tree through the work queue:
//!
//! - `copy_file` copies one file into a destination directory
//! - `copy_dir` creates the destination directory and schedules its listing
//! - `queue_children` lists a directory and enqueues a copy per entry
//!
//! Files run before directories and directories before listings, so the
//! frontier stays small while the tree is walked. Every file is written to a
//! hidden sibling first and renamed into place once its size checks out.

use crate::config::{CollisionMode, ExcludeList, HashAlgorithm};
use crate::core::{
    CollisionResolver, Handler, LookupCache, Operation, OperationRegistry, Priority, Resolution,
    SizeCheck, WorkContext, WorkOutcome, WorkResult,
};
use crate::error::{IoResultExt, Result, TaskError, TransferError};
use crate::hash::hash_file_async;
use crate::sync::TaskIdentity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Files are served first
pub const FILE_PRIORITY: Priority = 1;
/// Then directory creation
pub const CONTAINER_PRIORITY: Priority = 2;
/// Listings last
pub const CHILDREN_PRIORITY: Priority = 3;

/// Pending files are flushed to the queue once more than this many build up
const FILE_BATCH: usize = 5;
/// Pending directories are flushed once more than this many build up
const DIR_BATCH: usize = 100;

/// Work items of a local tree copy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tag", content = "args", rename_all = "snake_case")]
pub enum LocalOp {
    /// Copy `source` into `dest_dir`
    CopyFile { source: PathBuf, dest_dir: PathBuf },
    /// Create `dest_parent/<name of source>` and list `source` into it
    CopyDir { source: PathBuf, dest_parent: PathBuf },
    /// Enqueue a copy for every entry of `source` into `dest`
    QueueChildren { source: PathBuf, dest: PathBuf },
}

impl Operation for LocalOp {
    fn tag(&self) -> &'static str {
        match self {
            Self::CopyFile { .. } => "copy_file",
            Self::CopyDir { .. } => "copy_dir",
            Self::QueueChildren { .. } => "queue_children",
        }
    }

    fn priority(&self) -> Priority {
        match self {
            Self::CopyFile { .. } => FILE_PRIORITY,
            Self::CopyDir { .. } => CONTAINER_PRIORITY,
            Self::QueueChildren { .. } => CHILDREN_PRIORITY,
        }
    }
}

/// Options for one tree copy
#[derive(Debug, Clone, Default)]
pub struct LocalCopyOptions {
    /// Policy for existing destination files
    pub collision: CollisionMode,
    /// Hash used when sizes match
    pub hash: HashAlgorithm,
    /// Entries to skip
    pub excludes: ExcludeList,
    /// Copy the contents of the source rather than the source itself
    pub only_children: bool,
}

/// Copy engine shared by the three handlers
pub struct LocalCopy {
    options: LocalCopyOptions,
    resolver: CollisionResolver,
    dirs: LookupCache<PathBuf, bool>,
}

impl LocalCopy {
    /// New engine
    pub fn new(options: LocalCopyOptions) -> Self {
        Self {
            resolver: CollisionResolver::new(options.collision),
            options,
            dirs: LookupCache::new(),
        }
    }

    /// Task identity of copying `source` into `destination`
    ///
    /// Both paths should already be canonical (see [`plan`](Self::plan)).
    pub fn identity(&self, source: &Path, destination: &Path) -> TaskIdentity {
        let source = source.to_string_lossy();
        let destination = destination.to_string_lossy();
        if self.options.only_children {
            TaskIdentity::new("copy", &[&*source, &*destination, "children"])
        } else {
            TaskIdentity::new("copy", &[&*source, &*destination])
        }
    }

    /// Validate the endpoints and produce canonical paths plus seed items
    ///
    /// The destination is a directory; it is created when missing.
    pub async fn plan(&self, source: &Path, destination: &Path) -> Result<(PathBuf, PathBuf, Vec<LocalOp>)> {
        let source = match tokio::fs::canonicalize(source).await {
            Ok(path) => path,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::NotFound(source.to_path_buf()))
            }
            Err(e) => return Err(TransferError::io(source, e)),
        };
        let source_meta = tokio::fs::metadata(&source).await.with_path(&source)?;

        if let Ok(dest_meta) = tokio::fs::metadata(destination).await {
            if !dest_meta.is_dir() {
                return Err(TransferError::InvalidArgument(format!(
                    "Destination '{}' is not a directory",
                    destination.display()
                )));
            }
        }
        tokio::fs::create_dir_all(destination).await.with_path(destination)?;
        let destination = tokio::fs::canonicalize(destination).await.with_path(destination)?;

        if source_meta.is_dir() && destination.starts_with(&source) {
            return Err(TransferError::InvalidArgument(format!(
                "Cannot copy '{}' into itself",
                source.display()
            )));
        }

        let seed = if source_meta.is_file() {
            LocalOp::CopyFile {
                source: source.clone(),
                dest_dir: destination.clone(),
            }
        } else if source_meta.is_dir() && self.options.only_children {
            LocalOp::QueueChildren {
                source: source.clone(),
                dest: destination.clone(),
            }
        } else if source_meta.is_dir() {
            LocalOp::CopyDir {
                source: source.clone(),
                dest_parent: destination.clone(),
            }
        } else {
            return Err(TransferError::InvalidArgument(format!(
                "'{}' is neither a file nor a directory",
                source.display()
            )));
        };

        Ok((source, destination, vec![seed]))
    }

    /// Registry wiring the three handlers to this engine
    pub fn registry(self: &Arc<Self>) -> OperationRegistry<LocalOp> {
        OperationRegistry::new()
            .with("copy_file", CopyFileHandler(Arc::clone(self)))
            .with("copy_dir", CopyDirHandler(Arc::clone(self)))
            .with("queue_children", QueueChildrenHandler(Arc::clone(self)))
    }

    fn excluded(&self, path: &Path) -> bool {
        self.options.excludes.matches_path(path)
    }

    /// Create `dir` once per run; true when it did not exist before
    async fn ensure_dir(&self, dir: &Path, ctx: &WorkContext<LocalOp>) -> std::result::Result<bool, TaskError> {
        self.dirs
            .get_or_try_insert_with(dir.to_path_buf(), || async {
                match tokio::fs::metadata(dir).await {
                    Ok(meta) if meta.is_dir() => Ok(false),
                    Ok(_) => Err(TaskError::invalid_argument(format!(
                        "Destination '{}' exists and is not a directory",
                        dir.display()
                    ))),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tokio::fs::create_dir_all(dir).await.map_err(|e| {
                            ctx.io_error(format!("Failed to create folder: {}", dir.display()), e)
                        })?;
                        Ok::<bool, TaskError>(true)
                    }
                    Err(e) => Err(ctx.io_error(format!("Failed to inspect folder: {}", dir.display()), e)),
                }
            })
            .await
    }

    async fn copy_file(&self, source: &Path, dest_dir: &Path, ctx: &WorkContext<LocalOp>) -> WorkResult {
        let name = source
            .file_name()
            .ok_or_else(|| TaskError::invalid_argument(format!("No file name in '{}'", source.display())))?;
        let dest = dest_dir.join(name);

        if self.excluded(source) || self.excluded(&dest) {
            info!(path = %source.display(), "Skipping excluded file");
            return Ok(WorkOutcome::processed(1));
        }

        let src_meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| ctx.io_error(format!("Failed to read file: {}", source.display()), e))?;
        if !src_meta.is_file() {
            return Err(TaskError::invalid_argument(format!("'{}' is not a file", source.display())));
        }

        let dest_meta = match tokio::fs::metadata(&dest).await {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ctx.io_error(format!("Failed to read destination: {}", dest.display()), e)),
        };
        if dest_meta.as_ref().map(|m| m.is_dir()).unwrap_or(false) {
            return Err(TaskError::invalid_argument(format!(
                "Destination '{}' is a directory",
                dest.display()
            )));
        }

        let resolution = match self.resolver.decide(
            dest_meta.is_some(),
            Some(src_meta.len()),
            dest_meta.as_ref().map(|m| m.len()),
        ) {
            SizeCheck::Decided(resolution) => resolution,
            SizeCheck::CompareHashes => {
                let (src_hash, dest_hash) = tokio::try_join!(
                    hash_file_async(source, self.options.hash),
                    hash_file_async(&dest, self.options.hash)
                )
                .map_err(|e| ctx.transient(format!("Failed to compare '{}': {}", dest.display(), e)))?;
                CollisionResolver::decide_by_hash(&src_hash.hash, &dest_hash.hash)
            }
        };

        if resolution == Resolution::Skip {
            debug!(path = %dest.display(), "Skipping file, destination is up to date");
            return Ok(WorkOutcome::processed(1));
        }

        self.ensure_dir(dest_dir, ctx).await?;

        let partial = dest_dir.join(format!(".{}.partial", name.to_string_lossy()));
        let copied = tokio::fs::copy(source, &partial).await.map_err(|e| {
            ctx.io_error(format!("Failed to copy file: {}", source.display()), e)
                .with_artifact(&partial)
        })?;

        if copied != src_meta.len() {
            return Err(TaskError::integrity(
                format!(
                    "Copied size {} does not match expected size {} for '{}'. Partial file deleted.",
                    copied,
                    src_meta.len(),
                    source.display()
                ),
                Some(partial),
            ));
        }

        tokio::fs::rename(&partial, &dest).await.map_err(|e| {
            ctx.io_error(format!("Failed to move file into place: {}", dest.display()), e)
                .with_artifact(&partial)
        })?;

        debug!(
            from = %source.display(),
            to = %dest.display(),
            overwrite = (resolution == Resolution::Overwrite),
            "Copied file"
        );
        Ok(WorkOutcome::processed(1)
            .with_transferred(1)
            .with_value(dest.to_string_lossy()))
    }

    async fn copy_dir(&self, source: &Path, dest_parent: &Path, ctx: &WorkContext<LocalOp>) -> WorkResult {
        let name = source
            .file_name()
            .ok_or_else(|| TaskError::invalid_argument(format!("No folder name in '{}'", source.display())))?;
        let dest = dest_parent.join(name);

        if self.excluded(source) || self.excluded(&dest) {
            info!(path = %source.display(), "Skipping excluded folder");
            return Ok(WorkOutcome::processed(1));
        }

        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| ctx.io_error(format!("Failed to read folder: {}", source.display()), e))?;
        if !meta.is_dir() {
            return Err(TaskError::invalid_argument(format!("'{}' is not a folder", source.display())));
        }

        let created = self.ensure_dir(&dest, ctx).await?;
        ctx.enqueue(LocalOp::QueueChildren {
            source: source.to_path_buf(),
            dest: dest.clone(),
        })?;

        Ok(WorkOutcome::processed(1)
            .with_transferred(u64::from(created))
            .with_value(dest.to_string_lossy()))
    }

    async fn queue_children(&self, source: &Path, dest: &Path, ctx: &WorkContext<LocalOp>) -> WorkResult {
        let list_error = |e: std::io::Error| {
            ctx.transient(format!("Failed to list folders and files for: {}", source.display()))
                .with_cause(e)
        };

        let mut entries = tokio::fs::read_dir(source).await.map_err(list_error)?;
        let mut files = Vec::new();
        let mut dirs = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(list_error)?;
            if file_type.is_dir() {
                dirs.push(path);
            } else if file_type.is_file() {
                files.push(path);
            } else {
                debug!(path = %path.display(), "Skipping special file");
            }

            if files.len() > FILE_BATCH {
                Self::flush_files(&mut files, dest, ctx)?;
            }
            if dirs.len() > DIR_BATCH {
                Self::flush_dirs(&mut dirs, dest, ctx)?;
            }
        }

        Self::flush_files(&mut files, dest, ctx)?;
        Self::flush_dirs(&mut dirs, dest, ctx)?;
        Ok(WorkOutcome::default())
    }

    fn flush_files(files: &mut Vec<PathBuf>, dest: &Path, ctx: &WorkContext<LocalOp>) -> std::result::Result<(), TaskError> {
        for source in files.drain(..) {
            ctx.enqueue(LocalOp::CopyFile {
                source,
                dest_dir: dest.to_path_buf(),
            })?;
        }
        Ok(())
    }

    fn flush_dirs(dirs: &mut Vec<PathBuf>, dest: &Path, ctx: &WorkContext<LocalOp>) -> std::result::Result<(), TaskError> {
        for source in dirs.drain(..) {
            ctx.enqueue(LocalOp::CopyDir {
                source,
                dest_parent: dest.to_path_buf(),
            })?;
        }
        Ok(())
    }
}

struct CopyFileHandler(Arc<LocalCopy>);

#[async_trait]
impl Handler<LocalOp> for CopyFileHandler {
    async fn handle(&self, op: &LocalOp, ctx: &WorkContext<LocalOp>) -> WorkResult {
        match op {
            LocalOp::CopyFile { source, dest_dir } => self.0.copy_file(source, dest_dir, ctx).await,
            other => Err(TaskError::invalid_argument(format!("copy_file cannot run {:?}", other))),
        }
    }
}

struct CopyDirHandler(Arc<LocalCopy>);

#[async_trait]
impl Handler<LocalOp> for CopyDirHandler {
    async fn handle(&self, op: &LocalOp, ctx: &WorkContext<LocalOp>) -> WorkResult {
        match op {
            LocalOp::CopyDir { source, dest_parent } => self.0.copy_dir(source, dest_parent, ctx).await,
            other => Err(TaskError::invalid_argument(format!("copy_dir cannot run {:?}", other))),
        }
    }
}

struct QueueChildrenHandler(Arc<LocalCopy>);

#[async_trait]
impl Handler<LocalOp> for QueueChildrenHandler {
    async fn handle(&self, op: &LocalOp, ctx: &WorkContext<LocalOp>) -> WorkResult {
        match op {
            LocalOp::QueueChildren { source, dest } => self.0.queue_children(source, dest, ctx).await,
            other => Err(TaskError::invalid_argument(format!("queue_children cannot run {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::core::{TaskDriver, WorkQueue};
    use crate::sync::{QueueState, StateStore};
    use std::time::Duration;
    use tempfile::TempDir;

    fn build_tree(root: &Path) {
        std::fs::create_dir_all(root.join("src/sub/deeper")).unwrap();
        std::fs::write(root.join("src/a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("src/b.tmp"), b"scratch").unwrap();
        std::fs::write(root.join("src/sub/c.txt"), b"charlie").unwrap();
        std::fs::write(root.join("src/sub/deeper/d.txt"), b"delta").unwrap();
        for i in 0..12 {
            std::fs::write(root.join(format!("src/sub/many-{}.txt", i)), format!("{}", i)).unwrap();
        }
    }

    fn context() -> (Arc<WorkQueue<LocalOp>>, WorkContext<LocalOp>) {
        let queue = Arc::new(WorkQueue::new());
        let ctx = WorkContext::new(Arc::clone(&queue), RetryConfig::default());
        (queue, ctx)
    }

    async fn copy_tree(root: &Path, options: LocalCopyOptions) -> crate::core::RunSummary {
        let engine = Arc::new(LocalCopy::new(options));
        let (source, dest, seeds) = engine.plan(&root.join("src"), &root.join("dst")).await.unwrap();
        let store = StateStore::new(root.join("state")).unwrap();
        TaskDriver::new(engine.identity(&source, &dest), store, engine.registry())
            .workers(4)
            .retry(RetryConfig {
                retry_max: 2,
                retry_modifier: Duration::from_millis(5),
                max_attempts: 3,
            })
            .restart(true)
            .run(seeds)
            .await
            .unwrap()
    }

    #[test]
    fn test_priorities_and_wire_shape() {
        let op = LocalOp::CopyDir {
            source: PathBuf::from("/s/d"),
            dest_parent: PathBuf::from("/t"),
        };
        assert_eq!(op.priority(), CONTAINER_PRIORITY);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["tag"], "copy_dir");
        assert_eq!(json["args"]["dest_parent"], "/t");
    }

    #[tokio::test]
    async fn test_copy_whole_tree() {
        let dir = TempDir::new().unwrap();
        build_tree(dir.path());

        let summary = copy_tree(dir.path(), LocalCopyOptions::default()).await;
        assert!(summary.is_success(), "errors: {:?}", summary.errors);

        let dst = dir.path().join("dst/src");
        assert_eq!(std::fs::read(dst.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(dst.join("sub/deeper/d.txt")).unwrap(), b"delta");
        assert_eq!(std::fs::read(dst.join("sub/many-11.txt")).unwrap(), b"11");
        // 16 files plus 3 created folders
        assert_eq!(summary.transferred, 19);
    }

    #[tokio::test]
    async fn test_only_children_with_excludes() {
        let dir = TempDir::new().unwrap();
        build_tree(dir.path());

        let options = LocalCopyOptions {
            excludes: ExcludeList::new(["*.tmp", "deeper"]).unwrap(),
            only_children: true,
            ..Default::default()
        };
        let summary = copy_tree(dir.path(), options).await;
        assert!(summary.is_success());

        let dst = dir.path().join("dst");
        assert!(dst.join("a.txt").exists());
        assert!(!dst.join("b.tmp").exists());
        assert!(dst.join("sub/c.txt").exists());
        assert!(!dst.join("sub/deeper").exists());
        assert!(!dst.join("src").exists());
    }

    #[tokio::test]
    async fn test_second_run_skips_identical_files() {
        let dir = TempDir::new().unwrap();
        build_tree(dir.path());

        copy_tree(dir.path(), LocalCopyOptions::default()).await;
        let again = copy_tree(dir.path(), LocalCopyOptions::default()).await;
        assert!(again.is_success());
        assert_eq!(again.transferred, 0);
    }

    #[tokio::test]
    async fn test_update_if_different_rewrites_changed_content() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(src.join("same-size.txt"), b"abcd").unwrap();
        std::fs::write(dst.join("same-size.txt"), b"wxyz").unwrap();

        let engine = Arc::new(LocalCopy::new(LocalCopyOptions::default()));
        let (_queue, ctx) = context();
        let outcome = engine
            .copy_file(&src.join("same-size.txt"), &dst, &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.transferred, 1);
        assert_eq!(std::fs::read(dst.join("same-size.txt")).unwrap(), b"abcd");
        assert!(!dst.join(".same-size.txt.partial").exists());

        let skip = Arc::new(LocalCopy::new(LocalCopyOptions {
            collision: CollisionMode::Skip,
            ..Default::default()
        }));
        std::fs::write(src.join("same-size.txt"), b"efgh").unwrap();
        let outcome = skip.copy_file(&src.join("same-size.txt"), &dst, &ctx).await.unwrap();
        assert_eq!(outcome.transferred, 0);
        assert_eq!(std::fs::read(dst.join("same-size.txt")).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_missing_source_file_is_not_retryable() {
        let dir = TempDir::new().unwrap();
        let engine = LocalCopy::new(LocalCopyOptions::default());
        let (_queue, ctx) = context();

        let err = engine
            .copy_file(&dir.path().join("ghost.txt"), dir.path(), &ctx)
            .await
            .unwrap_err();
        assert!(!err.can_retry);
    }

    #[tokio::test]
    async fn test_queue_children_batches_everything() {
        let dir = TempDir::new().unwrap();
        build_tree(dir.path());
        let engine = LocalCopy::new(LocalCopyOptions::default());
        let (queue, ctx) = context();

        let sub = dir.path().join("src/sub");
        engine.queue_children(&sub, &dir.path().join("out"), &ctx).await.unwrap();

        let items = queue.snapshot();
        let files = items.iter().filter(|i| i.priority == FILE_PRIORITY).count();
        let dirs = items.iter().filter(|i| i.priority == CONTAINER_PRIORITY).count();
        assert_eq!(files, 13);
        assert_eq!(dirs, 1);
    }

    #[tokio::test]
    async fn test_listing_failure_is_retryable() {
        let dir = TempDir::new().unwrap();
        let engine = LocalCopy::new(LocalCopyOptions::default());
        let (_queue, ctx) = context();

        let err = engine
            .queue_children(&dir.path().join("missing"), dir.path(), &ctx)
            .await
            .unwrap_err();
        assert!(err.can_retry);
        assert!(err.message.starts_with("Failed to list folders and files for"));
    }

    #[tokio::test]
    async fn test_plan_rejects_file_destination() {
        let dir = TempDir::new().unwrap();
        build_tree(dir.path());
        let engine = LocalCopy::new(LocalCopyOptions::default());

        let err = engine
            .plan(&dir.path().join("src"), &dir.path().join("src/a.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)));

        let err = engine
            .plan(&dir.path().join("nowhere"), &dir.path().join("dst"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_identity_is_stable_across_runs() {
        let dir = TempDir::new().unwrap();
        build_tree(dir.path());
        let engine = LocalCopy::new(LocalCopyOptions::default());

        let (s1, d1, _) = engine.plan(&dir.path().join("src"), &dir.path().join("dst")).await.unwrap();
        let (s2, d2, _) = engine
            .plan(&dir.path().join("src/../src"), &dir.path().join("dst"))
            .await
            .unwrap();
        assert_eq!(engine.identity(&s1, &d1), engine.identity(&s2, &d2));

        let children = LocalCopy::new(LocalCopyOptions {
            only_children: true,
            ..Default::default()
        });
        assert_ne!(engine.identity(&s1, &d1), children.identity(&s1, &d1));

        let store = StateStore::new(dir.path().join("state")).unwrap();
        let state: QueueState<LocalOp> = store.load(&engine.identity(&s1, &d1), false).unwrap();
        assert!(state.is_new());
    }
}
