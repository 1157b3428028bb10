//! Error types for TransferQ
//!
//! Two layers of errors live here. [`TransferError`] covers failures of the
//! engine itself (persistence, configuration, lifecycle misuse), while
//! [`TaskError`] is the typed per-item error every operation returns, carrying
//! the retry contract the worker pool acts on.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum TransferError {
    /// I/O error during file operations
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File or directory not found
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    /// Invalid argument supplied to an operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Queue state could not be read or written
    #[error("State error for '{path}': {message}")]
    StateError { path: PathBuf, message: String },

    /// The task already ran to completion and needs an explicit reset
    #[error("Task '{0}' already finished; rerun with --restart to start over")]
    AlreadyFinished(String),

    /// Enqueue attempted after the queue was sealed
    #[error("Queue is sealed; no further work can be enqueued")]
    QueueSealed,

    /// Operation cancelled by user
    #[error("Operation cancelled")]
    Cancelled,

    /// Background task failed to join
    #[error("Worker task failed: {0}")]
    WorkerPanicked(String),
}

impl TransferError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a state persistence error
    pub fn state(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::StateError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Get the path associated with this error, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Io { path, .. } | Self::NotFound(path) | Self::StateError { path, .. } => {
                Some(path)
            }
            _ => None,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, TransferError>;

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| TransferError::io(path, e))
    }
}

/// Default number of attempts a retryable task error allows
pub const DEFAULT_RETRY_MAX: u32 = 10;

/// Default backoff unit; attempt `n` waits `n * DEFAULT_RETRY_MODIFIER`
pub const DEFAULT_RETRY_MODIFIER: Duration = Duration::from_secs(1);

/// Classification of a per-item failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// Network blip, rate limit, interrupted I/O
    Transient,
    /// Size or hash mismatch after a transfer
    Integrity,
    /// Bad id or path; nothing was written
    InvalidArgument,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Integrity => write!(f, "integrity"),
            Self::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

/// Typed error returned by a single work item invocation
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TaskError {
    /// Failure class
    pub kind: TaskErrorKind,
    /// Human-readable description
    pub message: String,
    /// Whether the worker may try again
    pub can_retry: bool,
    /// Backoff unit, scaled by the attempt number
    pub retry_modifier: Duration,
    /// Upper bound on attempts for this error
    pub retry_max: u32,
    /// Partial destination output to remove if this error is final
    pub artifact: Option<PathBuf>,
    /// Underlying cause
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TaskError {
    /// Create a retryable error with default retry parameters
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Transient,
            message: message.into(),
            can_retry: true,
            retry_modifier: DEFAULT_RETRY_MODIFIER,
            retry_max: DEFAULT_RETRY_MAX,
            artifact: None,
            cause: None,
        }
    }

    /// Create a non-retryable integrity error for a corrupt transfer
    pub fn integrity(message: impl Into<String>, artifact: Option<PathBuf>) -> Self {
        Self {
            kind: TaskErrorKind::Integrity,
            message: message.into(),
            can_retry: false,
            retry_modifier: Duration::ZERO,
            retry_max: 1,
            artifact,
            cause: None,
        }
    }

    /// Create a non-retryable error for a bad id or path
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::InvalidArgument,
            message: message.into(),
            can_retry: false,
            retry_modifier: Duration::ZERO,
            retry_max: 1,
            artifact: None,
            cause: None,
        }
    }

    /// Classify an I/O error: missing or forbidden paths are permanent,
    /// everything else is worth another attempt
    pub fn from_io(context: impl Into<String>, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let base = match err.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
                Self::invalid_argument(context)
            }
            _ => Self::transient(context),
        };
        base.with_cause(err)
    }

    /// Override the retry budget and backoff unit
    pub fn with_retry(mut self, retry_max: u32, retry_modifier: Duration) -> Self {
        self.retry_max = retry_max;
        self.retry_modifier = retry_modifier;
        self
    }

    /// Attach an underlying cause
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attach a partial destination artifact
    pub fn with_artifact(mut self, artifact: impl Into<PathBuf>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    /// Message followed by the cause chain, for run summaries
    pub fn display_chain(&self) -> String {
        let mut out = self.message.clone();
        let mut source = self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static));
        while let Some(err) = source {
            out.push_str(". ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}

impl From<TransferError> for TaskError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::InvalidArgument(_) | TransferError::NotFound(_) => {
                TaskError::invalid_argument(err.to_string())
            }
            TransferError::Io { path, source } => {
                TaskError::transient(format!("I/O error at '{}'", path.display())).with_cause(source)
            }
            other => TaskError::invalid_argument(other.to_string()),
        }
    }
}
