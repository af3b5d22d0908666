//! Streaming checksum producer
//!
//! Computes hex digests over file content with a configurable algorithm and
//! read buffer. Two shapes are supported: a digest over the entire file, and
//! a digest over at most the first N bytes (the "quick hash" the comparator's
//! prefix gate and the journal shortcut rely on). Both are deterministic: a
//! byte-identical file with the same parameters always yields the same value.
//!
//! The hasher also counts how many prefix and full digests it has computed;
//! the escalation tests use those counters to prove that higher ladder levels
//! never ran when a lower level already produced a verdict.

use crate::error::{BackupError, Result};
use crate::types::HashAlgorithm;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Counters over digest computations, shared across clones of a [`Hasher`]
#[derive(Debug, Default)]
pub struct HasherMetrics {
    prefix_hashes: AtomicU64,
    full_hashes: AtomicU64,
}

impl HasherMetrics {
    /// Number of prefix digests computed so far
    pub fn prefix_hashes(&self) -> u64 {
        self.prefix_hashes.load(Ordering::Relaxed)
    }

    /// Number of full-content digests computed so far
    pub fn full_hashes(&self) -> u64 {
        self.full_hashes.load(Ordering::Relaxed)
    }
}

/// Streaming file hasher
#[derive(Debug, Clone)]
pub struct Hasher {
    algorithm: HashAlgorithm,
    buffer_size: usize,
    metrics: Arc<HasherMetrics>,
}

impl Hasher {
    /// Create a hasher for the given algorithm and read buffer size
    pub fn new(algorithm: HashAlgorithm, buffer_size: usize) -> Self {
        Self {
            algorithm,
            buffer_size: buffer_size.max(1),
            metrics: Arc::new(HasherMetrics::default()),
        }
    }

    /// The configured algorithm
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Shared computation counters
    pub fn metrics(&self) -> Arc<HasherMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Digest the entire file, reading in buffers of the configured size
    pub fn full_hash(&self, path: &Path) -> Result<String> {
        self.metrics.full_hashes.fetch_add(1, Ordering::Relaxed);
        let mut file = File::open(path).map_err(|e| BackupError::hash(path, e))?;
        let mut digest = AnyDigest::new(self.algorithm);
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let read = file.read(&mut buffer).map_err(|e| BackupError::hash(path, e))?;
            if read == 0 {
                break;
            }
            digest.update(&buffer[..read]);
        }

        let hash = digest.finish();
        trace!(path = %path.display(), algorithm = %self.algorithm, "computed full hash");
        Ok(hash)
    }

    /// Digest up to `prefix_bytes` of content
    ///
    /// A file shorter than the prefix hashes what exists, so the value is
    /// defined by the algorithm, the prefix length, and the bytes actually
    /// read.
    pub fn prefix_hash(&self, path: &Path, prefix_bytes: u64) -> Result<String> {
        self.metrics.prefix_hashes.fetch_add(1, Ordering::Relaxed);
        let file = File::open(path).map_err(|e| BackupError::hash(path, e))?;
        let mut limited = file.take(prefix_bytes);
        let mut digest = AnyDigest::new(self.algorithm);
        let mut buffer = vec![0u8; self.buffer_size.min(prefix_bytes.max(1) as usize)];

        loop {
            let read = limited
                .read(&mut buffer)
                .map_err(|e| BackupError::hash(path, e))?;
            if read == 0 {
                break;
            }
            digest.update(&buffer[..read]);
        }

        Ok(digest.finish())
    }
}

/// Runtime-selected digest state
enum AnyDigest {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl AnyDigest {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => AnyDigest::Md5(Md5::new()),
            HashAlgorithm::Sha1 => AnyDigest::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => AnyDigest::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            AnyDigest::Md5(h) => h.update(data),
            AnyDigest::Sha1(h) => h.update(data),
            AnyDigest::Sha256(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            AnyDigest::Md5(h) => hex::encode(h.finalize()),
            AnyDigest::Sha1(h) => hex::encode(h.finalize()),
            AnyDigest::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_full_hash_deterministic() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "a.bin", b"hello, world");
        let hasher = Hasher::new(HashAlgorithm::Sha256, 4);

        let first = hasher.full_hash(&path).unwrap();
        let second = hasher.full_hash(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_algorithms_produce_distinct_digests() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "a.bin", b"same content");

        let md5 = Hasher::new(HashAlgorithm::Md5, 8192).full_hash(&path).unwrap();
        let sha1 = Hasher::new(HashAlgorithm::Sha1, 8192).full_hash(&path).unwrap();
        let sha256 = Hasher::new(HashAlgorithm::Sha256, 8192).full_hash(&path).unwrap();

        assert_eq!(md5.len(), 32);
        assert_eq!(sha1.len(), 40);
        assert_eq!(sha256.len(), 64);
    }

    #[test]
    fn test_prefix_hash_covers_only_prefix() {
        let temp = TempDir::new().unwrap();
        let a = write_file(&temp, "a.bin", b"prefix-SAME-tail-one");
        let b = write_file(&temp, "b.bin", b"prefix-SAME-tail-two");
        let hasher = Hasher::new(HashAlgorithm::Sha256, 4096);

        // Identical first 11 bytes, different tails.
        assert_eq!(
            hasher.prefix_hash(&a, 11).unwrap(),
            hasher.prefix_hash(&b, 11).unwrap()
        );
        assert_ne!(
            hasher.prefix_hash(&a, 20).unwrap(),
            hasher.prefix_hash(&b, 20).unwrap()
        );
    }

    #[test]
    fn test_prefix_hash_short_file() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "short.bin", b"tiny");
        let hasher = Hasher::new(HashAlgorithm::Sha256, 8192);

        // Hashing a prefix longer than the file equals hashing the whole file.
        let prefix = hasher.prefix_hash(&path, 1024).unwrap();
        let full = hasher.full_hash(&path).unwrap();
        assert_eq!(prefix, full);
    }

    #[test]
    fn test_missing_file_is_hash_error() {
        let temp = TempDir::new().unwrap();
        let hasher = Hasher::new(HashAlgorithm::Sha256, 8192);
        let err = hasher.full_hash(&temp.path().join("absent")).unwrap_err();
        assert!(matches!(err, BackupError::HashFailed { .. }));
    }

    #[test]
    fn test_metrics_count_computations() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "a.bin", b"counted");
        let hasher = Hasher::new(HashAlgorithm::Sha256, 8192);
        let metrics = hasher.metrics();

        hasher.prefix_hash(&path, 4).unwrap();
        hasher.prefix_hash(&path, 4).unwrap();
        hasher.full_hash(&path).unwrap();

        assert_eq!(metrics.prefix_hashes(), 2);
        assert_eq!(metrics.full_hashes(), 1);
    }
}
