//! Core data types shared across the backup-butler components
//!
//! The types in this module represent:
//! - **Validation**: [`ValidationLevel`], [`HashAlgorithm`], [`Verdict`] - the
//!   comparison ladder's vocabulary
//! - **Work units**: [`FilePair`], [`DirectoryTask`] - what the scanner emits
//!   and the orchestrator dispatches
//! - **Outcomes**: [`FileOutcome`], [`BackupStats`] - what the journal records
//! - **Identity**: [`FileFingerprint`] - a file's content identity at a point
//!   in time, used for incremental skip decisions
//! - **Observation**: [`ProgressEvent`], [`ProgressSink`] - the event sink the
//!   CLI attaches a progress display to
//!
//! All persisted types serialize with stable key names; the on-disk JSON
//! shapes are owned by the [`journal`](crate::journal) module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Depth of checking requested for a comparison
///
/// Levels form a strict ladder: each level executes every gate of the levels
/// below it and escalates only after those gates report equivalence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Metadata only: size and modification time
    Quick,
    /// Metadata plus a hash over the configured content prefix
    Standard,
    /// Metadata, prefix hash, and a full-content hash
    Deep,
}

impl ValidationLevel {
    /// Parse a level from its configuration spelling
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quick" => Some(ValidationLevel::Quick),
            "standard" => Some(ValidationLevel::Standard),
            "deep" => Some(ValidationLevel::Deep),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValidationLevel::Quick => "quick",
            ValidationLevel::Standard => "standard",
            ValidationLevel::Deep => "deep",
        };
        f.write_str(s)
    }
}

/// Digest algorithm used for prefix and full-content hashing
///
/// The algorithm must match across source and target when comparing; it is
/// part of the journal's configuration snapshot for exactly this reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// MD5 (fast, adequate for change detection)
    Md5,
    /// SHA-1
    Sha1,
    /// SHA-256 (default)
    Sha256,
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        };
        f.write_str(s)
    }
}

/// Physical storage class of one side of the transfer
///
/// Device classes carry the default I/O budgets; explicit configuration
/// overrides them per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Spinning disk: small buffers, few workers, seek-averse
    Hdd,
    /// Solid-state disk: large buffers, many workers
    Ssd,
    /// Network filesystem: very large buffers, moderate workers
    Network,
}

impl DeviceClass {
    /// Default I/O buffer size for this device class
    pub fn default_buffer_size(self) -> usize {
        match self {
            DeviceClass::Hdd => 32 * 1024,
            DeviceClass::Ssd => 256 * 1024,
            DeviceClass::Network => 1024 * 1024,
        }
    }

    /// Default worker count for this device class
    pub fn default_worker_count(self) -> usize {
        match self {
            DeviceClass::Hdd => 4,
            DeviceClass::Ssd => 16,
            DeviceClass::Network => 8,
        }
    }
}

/// The identity of a file's content at a point in time
///
/// Invariant: when `full_hash` is present, `size` and `modified_at` were
/// captured at the same instant; `quick_hash` is always over exactly the
/// configured prefix length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// Root-relative path, `/`-separated
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Last modification time (whole-second granularity on disk)
    pub modified_at: DateTime<Utc>,
    /// Hex digest over the first N configured bytes, if computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_hash: Option<String>,
    /// Hex digest over the entire content, if computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_hash: Option<String>,
}

/// A candidate for comparison: one source path with its target counterpart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
    /// Absolute path on the source side
    pub source_path: PathBuf,
    /// Absolute path on the target side
    pub target_path: PathBuf,
    /// Path relative to the source root, used as the journal key
    pub relative_path: String,
    /// Source size captured by the scanner
    pub source_size: u64,
    /// Source modification time captured by the scanner
    pub source_modified_at: DateTime<Utc>,
}

/// Why a comparison could not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareErrorKind {
    /// Source entry could not be stat'd or opened
    SourceUnreadable,
    /// Target entry exists but could not be read
    TargetUnreadable,
    /// A digest computation failed on either side
    HashFailed,
}

/// The comparator's conclusion about a [`FilePair`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Sides are equivalent at the stated level
    Match(ValidationLevel),
    /// Sides differ; the level states which gate detected it
    Differ(ValidationLevel),
    /// Target does not exist; a copy is required
    Missing,
    /// Target exists but the source does not (target-side scan only)
    Orphan,
    /// Comparison could not complete
    Error {
        /// What kind of failure stopped the ladder
        kind: CompareErrorKind,
        /// Human-readable description
        message: String,
    },
}

impl Verdict {
    /// The highest validation level the comparator actually executed
    pub fn final_level(&self) -> Option<ValidationLevel> {
        match self {
            Verdict::Match(level) | Verdict::Differ(level) => Some(*level),
            _ => None,
        }
    }

    /// Whether this verdict requires a copy to reconcile the pair
    pub fn requires_copy(&self) -> bool {
        matches!(self, Verdict::Differ(_) | Verdict::Missing)
    }

    /// Whether the pair was considered equivalent
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match(_))
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Match(level) => write!(f, "match ({level})"),
            Verdict::Differ(level) => write!(f, "differ ({level})"),
            Verdict::Missing => f.write_str("missing"),
            Verdict::Orphan => f.write_str("orphan"),
            Verdict::Error { message, .. } => write!(f, "error: {message}"),
        }
    }
}

/// What happened to one file during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    /// Bytes were transferred to the target
    Copied,
    /// Sides were equivalent; nothing written
    Skipped,
    /// The file could not be processed
    Failed,
}

impl std::fmt::Display for FileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileAction::Copied => "copied",
            FileAction::Skipped => "skipped",
            FileAction::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Hashes recorded with a file outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeHashes {
    /// Prefix hash, when one was computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_hash: Option<String>,
    /// Full-content hash, when one was computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_hash: Option<String>,
}

impl OutcomeHashes {
    /// True when neither hash was computed
    pub fn is_empty(&self) -> bool {
        self.quick_hash.is_none() && self.full_hash.is_none()
    }
}

/// The journal's per-file record of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    /// Root-relative path
    pub path: String,
    /// Source size in bytes
    pub size: u64,
    /// Source modification time
    pub modified_at: DateTime<Utc>,
    /// What happened
    pub action: FileAction,
    /// The validation level that produced the verdict, when one did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_level: Option<ValidationLevel>,
    /// Fingerprint hashes computed during the decision
    #[serde(default, skip_serializing_if = "OutcomeHashes::is_empty")]
    pub hashes: OutcomeHashes,
    /// One-line failure description, only for `failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate counters for a run or a directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    /// Files that reached a terminal state
    pub total_files: u64,
    /// Files copied
    pub files_copied: u64,
    /// Files skipped as equivalent
    pub files_skipped: u64,
    /// Files that failed
    pub files_failed: u64,
    /// Bytes transferred
    pub bytes_copied: u64,
    /// Bytes skipped
    pub bytes_skipped: u64,
}

impl BackupStats {
    /// Fold one outcome into the counters
    pub fn record(&mut self, action: FileAction, size: u64) {
        self.total_files += 1;
        match action {
            FileAction::Copied => {
                self.files_copied += 1;
                self.bytes_copied += size;
            }
            FileAction::Skipped => {
                self.files_skipped += 1;
                self.bytes_skipped += size;
            }
            FileAction::Failed => self.files_failed += 1,
        }
    }
}

/// An error recorded against a directory during scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    /// Path of the entry that failed
    pub path: String,
    /// What went wrong
    pub message: String,
}

/// The scanner's unit of work: one directory with its immediate file children
///
/// Created by the scanner, consumed once by the orchestrator, terminal after
/// all of its file pairs reach a terminal state.
#[derive(Debug, Clone)]
pub struct DirectoryTask {
    /// Source-relative directory path (`.` for the root)
    pub directory: String,
    /// Candidate pairs, in case-sensitive lexicographic order
    pub pairs: Vec<FilePair>,
    /// Sum of source sizes of the pairs
    pub total_bytes: u64,
    /// Number of pairs
    pub file_count: u64,
    /// Non-fatal errors encountered while enumerating this directory
    pub errors: Vec<ScanError>,
}

/// A file present only on the target side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanEntry {
    /// Target-root-relative path
    pub relative_path: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub modified_at: DateTime<Utc>,
}

/// Running totals across an entire scan
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    /// Directories that produced a task
    pub directories: u64,
    /// Candidate files across all tasks
    pub total_files: u64,
    /// Candidate bytes across all tasks
    pub total_bytes: u64,
    /// Files dropped by exclude patterns
    pub excluded_files: u64,
    /// Directories pruned by include/exclude filtering
    pub excluded_dirs: u64,
    /// Non-fatal errors across the whole scan
    pub errors: Vec<ScanError>,
}

/// Per-directory statistics keyed by source-relative path
pub type DirectoryStatsMap = BTreeMap<String, BackupStats>;

/// Lifecycle events emitted by the orchestrator
///
/// Events arrive from worker threads; sinks must be `Send + Sync` and should
/// return quickly.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Source enumeration began
    ScanStarted,
    /// Source enumeration finished
    ScanCompleted {
        /// Candidate files found
        total_files: u64,
        /// Candidate bytes found
        total_bytes: u64,
    },
    /// A directory's target counterpart has been ensured
    DirectoryStarted {
        /// Source-relative directory
        directory: String,
        /// Files queued for it
        file_count: u64,
    },
    /// One file reached a terminal state
    FileCompleted {
        /// Root-relative path
        path: String,
        /// Terminal action
        action: FileAction,
        /// Source size
        size: u64,
    },
    /// Every file of a directory reached a terminal state
    DirectoryCompleted {
        /// Source-relative directory
        directory: String,
        /// The directory's counters
        stats: BackupStats,
    },
    /// The run finished
    RunCompleted {
        /// Overall counters
        stats: BackupStats,
    },
}

/// Observer attached to a run
pub trait ProgressSink: Send + Sync {
    /// Handle one lifecycle event
    fn on_event(&self, event: &ProgressEvent);
}

/// Sink that discards every event
#[derive(Debug, Default)]
pub struct NoOpSink;

impl ProgressSink for NoOpSink {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Shared cooperative-cancellation flag
///
/// Checked at every copy buffer boundary, between retry attempts, and before
/// each task is started. Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token in the not-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing flag, e.g. one registered with a signal handler
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Format bytes in human-readable form
///
/// Values below 1024 bytes are shown whole; larger values get two decimals
/// and a binary unit.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(ValidationLevel::Quick < ValidationLevel::Standard);
        assert!(ValidationLevel::Standard < ValidationLevel::Deep);
        assert_eq!(ValidationLevel::parse("deep"), Some(ValidationLevel::Deep));
        assert_eq!(ValidationLevel::parse("DEEP"), None);
    }

    #[test]
    fn test_verdict_final_level() {
        assert_eq!(
            Verdict::Differ(ValidationLevel::Quick).final_level(),
            Some(ValidationLevel::Quick)
        );
        assert_eq!(Verdict::Missing.final_level(), None);
        assert!(Verdict::Missing.requires_copy());
        assert!(!Verdict::Match(ValidationLevel::Deep).requires_copy());
    }

    #[test]
    fn test_stats_record() {
        let mut stats = BackupStats::default();
        stats.record(FileAction::Copied, 100);
        stats.record(FileAction::Skipped, 50);
        stats.record(FileAction::Failed, 10);
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.bytes_copied, 100);
        assert_eq!(stats.bytes_skipped, 50);
        assert_eq!(stats.files_failed, 1);
    }

    #[test]
    fn test_device_budgets() {
        assert_eq!(DeviceClass::Hdd.default_buffer_size(), 32 * 1024);
        assert_eq!(DeviceClass::Ssd.default_worker_count(), 16);
        assert_eq!(DeviceClass::Network.default_buffer_size(), 1024 * 1024);
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
    }
}
