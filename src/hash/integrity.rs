//! Content hashing for collision checks
//!
//! Supports XXHash3 (ultra-fast), XXHash64, BLAKE3 and SHA-256. Hashing is
//! only needed when a destination exists with the same size as its source.

use crate::config::HashAlgorithm;
use crate::error::{IoResultExt, Result, TransferError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Hash result as hex string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashResult {
    /// The hash algorithm used
    pub algorithm: HashAlgorithm,
    /// Hash value as lowercase hex string
    pub hash: String,
    /// File size in bytes
    pub size: u64,
}

impl HashResult {
    /// Create a new hash result
    pub fn new(algorithm: HashAlgorithm, hash: String, size: u64) -> Self {
        Self { algorithm, hash, size }
    }

    /// Same algorithm and same digest
    pub fn verify(&self, other: &HashResult) -> bool {
        self.algorithm == other.algorithm && self.hash == other.hash
    }
}

impl std::fmt::Display for HashResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

/// Unified hasher that supports all algorithms
pub enum Hasher {
    /// XXHash3 128-bit
    XXHash3(xxhash_rust::xxh3::Xxh3),
    /// XXHash64
    XXHash64(xxhash_rust::xxh64::Xxh64),
    /// BLAKE3
    Blake3(blake3::Hasher),
    /// SHA-256
    Sha256(sha2::Sha256),
}

impl Hasher {
    /// Create a new hasher for the given algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::XXHash3 => Self::XXHash3(xxhash_rust::xxh3::Xxh3::new()),
            HashAlgorithm::XXHash64 => Self::XXHash64(xxhash_rust::xxh64::Xxh64::new(0)),
            HashAlgorithm::Blake3 => Self::Blake3(blake3::Hasher::new()),
            HashAlgorithm::Sha256 => {
                use sha2::Digest;
                Self::Sha256(sha2::Sha256::new())
            }
        }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::XXHash3(h) => h.update(data),
            Self::XXHash64(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
            Self::Sha256(h) => {
                use sha2::Digest;
                h.update(data);
            }
        }
    }

    /// Finalize and get the hash as hex string
    pub fn finalize(self) -> String {
        match self {
            Self::XXHash3(h) => format!("{:032x}", h.digest128()),
            Self::XXHash64(h) => format!("{:016x}", h.digest()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
            Self::Sha256(h) => {
                use sha2::Digest;
                hex::encode(h.finalize())
            }
        }
    }
}

/// Compute hash of a file
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<HashResult> {
    hash_file_with_buffer(path, algorithm, 1024 * 1024) // 1MB buffer
}

fn hash_file_with_buffer(
    path: &Path,
    algorithm: HashAlgorithm,
    buffer_size: usize,
) -> Result<HashResult> {
    let file = File::open(path).with_path(path)?;
    let size = file.metadata().with_path(path)?.len();
    let mut reader = BufReader::with_capacity(buffer_size, file);
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let bytes_read = reader.read(&mut buffer).with_path(path)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(HashResult::new(algorithm, hasher.finalize(), size))
}

/// Hash a file on the blocking pool
pub async fn hash_file_async(path: impl Into<PathBuf>, algorithm: HashAlgorithm) -> Result<HashResult> {
    let path = path.into();
    tokio::task::spawn_blocking(move || hash_file(&path, algorithm))
        .await
        .map_err(|e| TransferError::WorkerPanicked(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> HashResult {
        let mut hasher = Hasher::new(algorithm);
        hasher.update(data);
        HashResult::new(algorithm, hasher.finalize(), data.len() as u64)
    }

    #[test]
    fn test_hash_algorithms() {
        let data = b"Hello, World!";

        for algorithm in [
            HashAlgorithm::XXHash3,
            HashAlgorithm::XXHash64,
            HashAlgorithm::Blake3,
            HashAlgorithm::Sha256,
        ] {
            let hash = hash_bytes(data, algorithm);
            assert!(!hash.hash.is_empty());
            assert_eq!(hash.size, data.len() as u64);
            assert_eq!(hash, hash_bytes(data, algorithm));
        }
    }

    #[test]
    fn test_hash_file_matches_memory() {
        let dir = TempDir::new().unwrap();
        let content = b"Test file content for hashing";
        let path = dir.path().join("test.bin");
        std::fs::write(&path, content).unwrap();

        let file_hash = hash_file_with_buffer(&path, HashAlgorithm::Sha256, 7).unwrap();
        let memory_hash = hash_bytes(content, HashAlgorithm::Sha256);
        assert!(file_hash.verify(&memory_hash));
    }

    #[tokio::test]
    async fn test_hash_file_async() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();

        let ha = hash_file_async(&a, HashAlgorithm::XXHash3).await.unwrap();
        let hb = hash_file_async(&b, HashAlgorithm::XXHash3).await.unwrap();
        assert!(ha.verify(&hb));

        std::fs::write(&b, b"other bytes").unwrap();
        let hb = hash_file_async(&b, HashAlgorithm::XXHash3).await.unwrap();
        assert!(!ha.verify(&hb));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = hash_file_async(dir.path().join("nope"), HashAlgorithm::Blake3)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io { .. }));
    }
}
