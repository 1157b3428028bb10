//! Deterministic task identity
//!
//! Two invocations with the same kind, normalized endpoints and suffix map to
//! the same id, so a rerun finds the state left behind by an interrupted run.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

/// Stable id of one logical task, e.g. `copy-3f2a9c0d11b7e845`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskIdentity(String);

impl TaskIdentity {
    /// Derive an id from a kind and its identifying parts
    ///
    /// Parts are hashed verbatim; callers canonicalize local paths before
    /// calling.
    pub fn new<S: AsRef<str>>(kind: &str, parts: &[S]) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(kind.as_bytes());
        for part in parts {
            hasher.update(&[0u8]);
            hasher.update(part.as_ref().as_bytes());
        }
        Self(format!("{}-{:016x}", kind, hasher.digest()))
    }

    /// Wrap an id read back from disk or the command line
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Leading kind component
    pub fn kind(&self) -> &str {
        self.0.rsplit_once('-').map(|(kind, _)| kind).unwrap_or(&self.0)
    }

    /// The id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is usable as a file stem
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = TaskIdentity::new("copy", &["/data/src", "/data/dst"]);
        let b = TaskIdentity::new("copy", &["/data/src", "/data/dst"]);
        assert_eq!(a, b);
        assert_eq!(a.kind(), "copy");
        assert!(a.is_valid());
        assert_eq!(a.as_str().len(), "copy-".len() + 16);
    }

    #[test]
    fn test_whitespace_is_significant() {
        let a = TaskIdentity::new("copy", &["/data/a", "/data/dst"]);
        let b = TaskIdentity::new("copy", &["/data/a ", "/data/dst"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_parts_are_separated() {
        let a = TaskIdentity::new("copy", &["ab", "c"]);
        let b = TaskIdentity::new("copy", &["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_kind_and_suffix_change_identity() {
        let copy = TaskIdentity::new("copy", &["x", "y"]);
        let compare = TaskIdentity::new("compare", &["x", "y"]);
        let suffixed = TaskIdentity::new("copy", &["x", "y", "nightly"]);
        assert_ne!(copy, compare);
        assert_ne!(copy, suffixed);
    }

    #[test]
    fn test_raw_validation() {
        assert!(!TaskIdentity::from_raw("../etc/passwd").is_valid());
        assert!(TaskIdentity::from_raw("compare-00ff").is_valid());
    }
}
