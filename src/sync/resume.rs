//! Persisted queue state
//!
//! One JSON document per task id under the state directory, holding the
//! task status and the ordered outstanding work items. Writes go to a
//! temporary sibling first and are renamed into place, so a crash mid-save
//! leaves the previous snapshot intact.

use crate::core::QueuedItem;
use crate::error::{IoResultExt, Result, TransferError};
use crate::sync::TaskIdentity;
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of a persisted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Nothing has run yet
    New,
    /// Work is in progress or was interrupted
    Started,
    /// Ran to completion; needs an explicit reset to run again
    Finished,
}

/// Snapshot of one task's queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState<Op> {
    /// Task id
    pub id: TaskIdentity,
    /// Task status
    pub status: QueueStatus,
    /// Outstanding items in service order
    pub queued: Vec<QueuedItem<Op>>,
    /// When the state was first created
    pub created_at: DateTime<Utc>,
    /// Last save
    pub updated_at: DateTime<Utc>,
}

impl<Op> QueueState<Op> {
    /// Fresh state with nothing queued
    pub fn new(id: TaskIdentity) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: QueueStatus::New,
            queued: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Started with outstanding work
    pub fn can_resume(&self) -> bool {
        self.status == QueueStatus::Started && !self.queued.is_empty()
    }

    /// Nothing has run yet
    pub fn is_new(&self) -> bool {
        self.status == QueueStatus::New
    }

    /// Ran to completion
    pub fn is_finished(&self) -> bool {
        self.status == QueueStatus::Finished
    }
}

/// Status line for `status` listings, read without knowing the op type
#[derive(Debug, Clone, Deserialize)]
pub struct StateSummary {
    /// Task id
    pub id: TaskIdentity,
    /// Task status
    pub status: QueueStatus,
    /// Number of outstanding items
    #[serde(deserialize_with = "count_items")]
    pub queued: usize,
    /// When the state was first created
    pub created_at: DateTime<Utc>,
    /// Last save
    pub updated_at: DateTime<Utc>,
}

fn count_items<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let items: Vec<IgnoredAny> = Vec::deserialize(deserializer)?;
    Ok(items.len())
}

/// Directory-backed store of queue states
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    /// Open (and create) a state directory
    pub fn new<P: AsRef<Path>>(state_dir: P) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&state_dir).with_path(&state_dir)?;
        Ok(Self { state_dir })
    }

    /// Directory holding the states
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Get state file path
    pub fn state_path(&self, id: &TaskIdentity) -> PathBuf {
        self.state_dir.join(format!("{}.json", id))
    }

    /// Load the state for `id`
    ///
    /// With `reset`, any saved state is discarded. A `Started` state with
    /// outstanding items and a `Finished` state are returned as saved;
    /// anything else yields a fresh `New` state.
    pub fn load<Op: DeserializeOwned>(&self, id: &TaskIdentity, reset: bool) -> Result<QueueState<Op>> {
        if !id.is_valid() {
            return Err(TransferError::InvalidArgument(format!("Invalid task id '{}'", id)));
        }

        if reset {
            self.delete(id)?;
            return Ok(QueueState::new(id.clone()));
        }

        let Some(state) = self.read::<Op>(id)? else {
            return Ok(QueueState::new(id.clone()));
        };

        match state.status {
            QueueStatus::Started if !state.queued.is_empty() => Ok(state),
            QueueStatus::Finished => Ok(state),
            QueueStatus::Started => {
                warn!(task = %id, "Saved state is started but has nothing queued, starting over");
                Ok(QueueState::new(id.clone()))
            }
            QueueStatus::New => Ok(QueueState::new(id.clone())),
        }
    }

    fn read<Op: DeserializeOwned>(&self, id: &TaskIdentity) -> Result<Option<QueueState<Op>>> {
        let path = self.state_path(id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TransferError::io(&path, e)),
        };
        let state = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| TransferError::state(&path, format!("corrupt state file: {}", e)))?;
        Ok(Some(state))
    }

    /// Persist `state` atomically, stamping `updated_at`
    pub fn save<Op: Serialize>(&self, state: &mut QueueState<Op>) -> Result<()> {
        state.updated_at = Utc::now();

        let path = self.state_path(&state.id);
        let temp_path = path.with_extension("tmp");

        let file = File::create(&temp_path).with_path(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, state)
            .map_err(|e| TransferError::state(&temp_path, e.to_string()))?;
        writer.flush().with_path(&temp_path)?;
        let file = writer
            .into_inner()
            .map_err(|e| TransferError::io(&temp_path, e.into_error()))?;
        file.sync_all().with_path(&temp_path)?;

        std::fs::rename(&temp_path, &path).with_path(&path)?;
        debug!(task = %state.id, queued = state.queued.len(), "Saved queue state");
        Ok(())
    }

    /// Persist `state` on the blocking pool and hand it back stamped
    pub async fn save_async<Op>(&self, mut state: QueueState<Op>) -> Result<QueueState<Op>>
    where
        Op: Serialize + Send + 'static,
    {
        let store = self.clone();
        let path = self.state_path(&state.id);
        tokio::task::spawn_blocking(move || {
            store.save(&mut state)?;
            Ok(state)
        })
        .await
        .map_err(|e| TransferError::state(path, format!("save task failed: {}", e)))?
    }

    /// Mark started and save
    pub fn set_started<Op: Serialize>(&self, state: &mut QueueState<Op>) -> Result<()> {
        state.status = QueueStatus::Started;
        self.save(state)
    }

    /// Mark finished, clear the queue and save
    pub fn set_finished<Op: Serialize>(&self, state: &mut QueueState<Op>) -> Result<()> {
        state.status = QueueStatus::Finished;
        state.queued.clear();
        self.save(state)
    }

    /// Return to `New` with nothing queued and save
    pub fn reset<Op: Serialize>(&self, state: &mut QueueState<Op>) -> Result<()> {
        state.status = QueueStatus::New;
        state.queued.clear();
        self.save(state)
    }

    /// Delete the state for `id`, if any
    pub fn delete(&self, id: &TaskIdentity) -> Result<bool> {
        let path = self.state_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TransferError::io(&path, e)),
        }
    }

    /// Summaries of every readable state, most recently updated first
    pub fn list(&self) -> Result<Vec<StateSummary>> {
        let mut states = Vec::new();

        for entry in std::fs::read_dir(&self.state_dir).with_path(&self.state_dir)? {
            let path = entry.with_path(&self.state_dir)?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match Self::read_summary(&path) {
                Ok(summary) => states.push(summary),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable state"),
            }
        }

        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }

    fn read_summary(path: &Path) -> Result<StateSummary> {
        let file = File::open(path).with_path(path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| TransferError::state(path, e.to_string()))
    }

    /// Remove finished states and states idle longer than `max_age`
    pub fn cleanup(&self, max_age: Duration) -> Result<u64> {
        let max_age = chrono::Duration::from_std(max_age).ok();
        let now = Utc::now();
        let mut cleaned = 0;

        for summary in self.list()? {
            let idle = now.signed_duration_since(summary.updated_at);
            let stale = max_age.map(|max| idle > max).unwrap_or(false);
            if summary.status == QueueStatus::Finished || stale {
                if self.delete(&summary.id)? {
                    info!(task = %summary.id, status = ?summary.status, "Removed state");
                    cleaned += 1;
                }
            }
        }

        Ok(cleaned)
    }
}
