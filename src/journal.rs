//! Per-run version journal and rolling fingerprint index
//!
//! The journal owns everything persisted under `<target>/.backup-butler/`:
//!
//! ```text
//! .backup-butler/
//!   index.json              # FingerprintIndex: rel path -> last fingerprint
//!   versions/
//!     <run_id>.json         # one RunRecord per run
//!   integrity_issues.json   # rolling, capped anomaly list
//! ```
//!
//! Run ids are UTC wall-clock timestamps (`YYYYMMDD-HHMMSS`) with a `-<n>`
//! suffix on collision, so lexicographic order is chronological order and
//! "latest" is a directory listing away. Records are independent - no
//! back-pointers - which keeps retention a list-and-delete pass.
//!
//! Both `index.json` and the version files are written via a temp file and
//! rename in the same directory; a crash at any point leaves the prior good
//! state readable. A corrupt index is reported once and replaced with an
//! empty one - losing the index only costs hashing time, never data.
//!
//! `record` may be called from many workers at once: the in-flight run record
//! sits behind a mutex and the fingerprint index behind a read-write lock
//! (comparators read it while workers record).

use crate::config::ConfigSnapshot;
use crate::error::{BackupError, Result};
use crate::types::{BackupStats, DirectoryStatsMap, FileAction, FileFingerprint, FileOutcome};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the journal directory under the target root
pub const JOURNAL_DIR: &str = ".backup-butler";
/// Rolling cap on recorded integrity anomalies
pub const MAX_INTEGRITY_ISSUES: usize = 100;

const VERSIONS_DIR: &str = "versions";
const INDEX_FILE: &str = "index.json";
const ISSUES_FILE: &str = "integrity_issues.json";

/// Terminal (or in-flight) state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run has been started but not completed
    InProgress,
    /// The run finished; individual files may still have failed
    Completed,
    /// The run was aborted or cancelled
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Statistics block of a run record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Overall totals
    pub total: BackupStats,
    /// Per-directory totals, keyed by source-relative directory
    pub directories: DirectoryStatsMap,
}

/// The durable record of a single run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Timestamp-derived, lexicographically sortable id
    pub id: String,
    /// When the run began
    pub started_at: DateTime<Utc>,
    /// When the run finished, once it has
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Run state
    pub status: RunStatus,
    /// The configuration subset that influenced behaviour
    pub config: ConfigSnapshot,
    /// Aggregate statistics
    pub stats: RunStats,
    /// Per-file outcomes in completion order
    pub outcomes: Vec<FileOutcome>,
}

/// Condensed view of a run for history listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run id
    pub id: String,
    /// When the run began
    pub started_at: DateTime<Utc>,
    /// When the run finished
    pub finished_at: Option<DateTime<Utc>>,
    /// Run state
    pub status: RunStatus,
    /// Overall totals
    pub stats: BackupStats,
}

/// One file's entry in the fingerprint index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Id of the run that last recorded this file
    pub last_run_id: String,
    /// Size at recording time
    pub size: u64,
    /// Modification time at recording time
    pub modified_at: DateTime<Utc>,
    /// Prefix hash, when one was computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_hash: Option<String>,
    /// Full-content hash, when one was computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_hash: Option<String>,
}

/// The aggregate, cross-run mapping from relative path to last fingerprint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FingerprintIndex {
    /// When the index was last written
    last_updated: Option<DateTime<Utc>>,
    /// Entries keyed by root-relative path
    files: BTreeMap<String, IndexEntry>,
}

/// A recorded comparison anomaly (content moved under an unchanged mtime)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityIssue {
    /// Root-relative path
    pub path: String,
    /// When the anomaly was observed
    pub detected_at: DateTime<Utc>,
    /// What looked wrong
    pub issues: Vec<String>,
    /// Always `warning` for anomalies
    pub severity: String,
    /// Technical details for investigation
    pub details: String,
}

/// Token identifying an in-flight run
#[derive(Debug, Clone)]
pub struct RunHandle {
    id: String,
    update_index: bool,
}

impl RunHandle {
    /// The run's id
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Persistent journal rooted under the target directory
pub struct Journal {
    root: PathBuf,
    retention: usize,
    index: RwLock<FingerprintIndex>,
    issues: Mutex<Vec<IntegrityIssue>>,
    current: Mutex<Option<RunRecord>>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("root", &self.root)
            .field("retention", &self.retention)
            .field("indexed_files", &self.index.read().files.len())
            .finish()
    }
}

impl Journal {
    /// Open (or initialize) the journal under `target_dir`
    ///
    /// Creates `.backup-butler/versions/` when absent. A corrupt index is
    /// tolerated: it is reported once and replaced by an empty one.
    pub fn open(target_dir: &Path, retention: usize) -> Result<Self> {
        let root = target_dir.join(JOURNAL_DIR);
        fs::create_dir_all(root.join(VERSIONS_DIR))
            .map_err(|e| BackupError::root(target_dir, e))?;

        let index = match Self::load_index(&root) {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "fingerprint index unreadable, starting empty");
                FingerprintIndex::default()
            }
        };
        let issues = Self::load_issues(&root);

        debug!(root = %root.display(), files = index.files.len(), "opened journal");
        Ok(Self {
            root,
            retention: retention.max(1),
            index: RwLock::new(index),
            issues: Mutex::new(issues),
            current: Mutex::new(None),
        })
    }

    fn load_index(root: &Path) -> Result<FingerprintIndex> {
        let path = root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(FingerprintIndex::default());
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| BackupError::JournalCorrupt(format!("{}: {e}", path.display())))
    }

    fn load_issues(root: &Path) -> Vec<IntegrityIssue> {
        let path = root.join(ISSUES_FILE);
        if !path.exists() {
            return Vec::new();
        }
        match fs::read_to_string(&path)
            .map_err(BackupError::from)
            .and_then(|s| serde_json::from_str(&s).map_err(BackupError::from))
        {
            Ok(issues) => issues,
            Err(e) => {
                warn!(error = %e, "integrity issue list unreadable, starting empty");
                Vec::new()
            }
        }
    }

    /// Begin a new run
    ///
    /// Allocates a run id from the UTC wall clock, resolving same-second
    /// collisions with a `-<counter>` suffix, and persists an initial
    /// in-progress record. A dry run records outcomes but leaves the
    /// fingerprint index untouched.
    pub fn start_run(&self, config: ConfigSnapshot, dry_run: bool) -> Result<RunHandle> {
        let id = self.allocate_run_id()?;
        let record = RunRecord {
            id: id.clone(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::InProgress,
            config,
            stats: RunStats::default(),
            outcomes: Vec::new(),
        };

        self.write_run_record(&record)?;
        *self.current.lock() = Some(record);

        info!(run_id = %id, dry_run, "started run");
        Ok(RunHandle {
            id,
            update_index: !dry_run,
        })
    }

    fn allocate_run_id(&self) -> Result<String> {
        let base = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let versions = self.root.join(VERSIONS_DIR);
        if !versions.join(format!("{base}.json")).exists() {
            return Ok(base);
        }
        for counter in 1..u32::MAX {
            let candidate = format!("{base}-{counter}");
            if !versions.join(format!("{candidate}.json")).exists() {
                return Ok(candidate);
            }
        }
        Err(BackupError::internal("run id space exhausted"))
    }

    /// Record one file outcome against the in-flight run
    ///
    /// Updates the per-directory and total statistics; on `copied` or
    /// `skipped` the fingerprint index entry is upserted (unless the run is
    /// a dry run).
    pub fn record(&self, handle: &RunHandle, outcome: FileOutcome) {
        {
            let mut current = self.current.lock();
            let Some(record) = current.as_mut().filter(|r| r.id == handle.id) else {
                warn!(run_id = %handle.id, "record called without a matching run in progress");
                return;
            };
            record.stats.total.record(outcome.action, outcome.size);
            record
                .stats
                .directories
                .entry(directory_key(&outcome.path))
                .or_default()
                .record(outcome.action, outcome.size);
            record.outcomes.push(outcome.clone());
        }

        if handle.update_index && outcome.action != FileAction::Failed {
            let mut index = self.index.write();
            // A metadata-only skip carries no hashes; keep the previously
            // recorded ones as long as the file's identity is unchanged.
            let (quick_hash, full_hash) = match index.files.get(&outcome.path) {
                Some(prior)
                    if prior.size == outcome.size
                        && prior.modified_at.timestamp() == outcome.modified_at.timestamp() =>
                {
                    (
                        outcome.hashes.quick_hash.or_else(|| prior.quick_hash.clone()),
                        outcome.hashes.full_hash.or_else(|| prior.full_hash.clone()),
                    )
                }
                _ => (outcome.hashes.quick_hash, outcome.hashes.full_hash),
            };
            index.files.insert(
                outcome.path.clone(),
                IndexEntry {
                    last_run_id: handle.id.clone(),
                    size: outcome.size,
                    modified_at: outcome.modified_at,
                    quick_hash,
                    full_hash,
                },
            );
        }
    }

    /// Finalize the in-flight run
    ///
    /// Flushes the run record, the fingerprint index, and the integrity
    /// issue list, then enforces the retention window. Always call this,
    /// even on failure, so history stays consistent.
    pub fn complete_run(&self, handle: &RunHandle, status: RunStatus) -> Result<BackupStats> {
        let record = {
            let mut current = self.current.lock();
            let mut record = current
                .take()
                .filter(|r| r.id == handle.id)
                .ok_or_else(|| BackupError::internal("no run in progress to complete"))?;
            record.finished_at = Some(Utc::now());
            record.status = status;
            record
        };

        self.write_run_record(&record)?;
        if handle.update_index {
            self.write_index()?;
        }
        self.write_issues()?;
        self.enforce_retention()?;

        info!(run_id = %record.id, status = %status, files = record.stats.total.total_files, "completed run");
        Ok(record.stats.total)
    }

    /// Summaries of past runs, newest first by run id
    pub fn history(&self) -> Result<Vec<RunSummary>> {
        let versions = self.root.join(VERSIONS_DIR);
        let mut summaries = Vec::new();

        for entry in fs::read_dir(&versions)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<RunRecord>(&content) {
                Ok(record) => summaries.push(RunSummary {
                    id: record.id,
                    started_at: record.started_at,
                    finished_at: record.finished_at,
                    status: record.status,
                    stats: record.stats.total,
                }),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable run record"),
            }
        }

        summaries.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(summaries)
    }

    /// Load a full run record by id
    pub fn run(&self, id: &str) -> Result<RunRecord> {
        let path = self.root.join(VERSIONS_DIR).join(format!("{id}.json"));
        if !path.exists() {
            return Err(BackupError::RunNotFound(id.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| BackupError::JournalCorrupt(format!("{}: {e}", path.display())))
    }

    /// The most recently recorded fingerprint for a relative path
    pub fn fingerprint_of(&self, relative_path: &str) -> Option<FileFingerprint> {
        let index = self.index.read();
        index.files.get(relative_path).map(|entry| FileFingerprint {
            path: relative_path.to_string(),
            size: entry.size,
            modified_at: entry.modified_at,
            quick_hash: entry.quick_hash.clone(),
            full_hash: entry.full_hash.clone(),
        })
    }

    /// Number of fingerprints currently indexed
    pub fn indexed_files(&self) -> usize {
        self.index.read().files.len()
    }

    /// Record a comparison anomaly, keeping the newest 100 entries
    pub fn report_integrity_issue(&self, path: &str, issues: Vec<String>, details: String) {
        warn!(path, ?issues, "integrity anomaly");
        let mut list = self.issues.lock();
        list.push(IntegrityIssue {
            path: path.to_string(),
            detected_at: Utc::now(),
            issues,
            severity: "warning".to_string(),
            details,
        });
        if list.len() > MAX_INTEGRITY_ISSUES {
            let excess = list.len() - MAX_INTEGRITY_ISSUES;
            list.drain(..excess);
        }
    }

    /// Currently recorded anomalies
    pub fn integrity_issues(&self) -> Vec<IntegrityIssue> {
        self.issues.lock().clone()
    }

    fn write_run_record(&self, record: &RunRecord) -> Result<()> {
        let path = self
            .root
            .join(VERSIONS_DIR)
            .join(format!("{}.json", record.id));
        let json = serde_json::to_string_pretty(record)?;
        atomic_write(&path, json.as_bytes())
    }

    fn write_index(&self) -> Result<()> {
        let json = {
            let mut index = self.index.write();
            index.last_updated = Some(Utc::now());
            serde_json::to_string_pretty(&*index)?
        };
        atomic_write(&self.root.join(INDEX_FILE), json.as_bytes())
    }

    fn write_issues(&self) -> Result<()> {
        let issues = self.issues.lock();
        if issues.is_empty() {
            return Ok(());
        }
        let json = serde_json::to_string_pretty(&*issues)?;
        atomic_write(&self.root.join(ISSUES_FILE), json.as_bytes())
    }

    fn enforce_retention(&self) -> Result<()> {
        let versions = self.root.join(VERSIONS_DIR);
        let mut ids: Vec<String> = fs::read_dir(&versions)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json").map(|s| s.to_string())
            })
            .collect();
        ids.sort_by(|a, b| b.cmp(a));

        for id in ids.iter().skip(self.retention) {
            let path = versions.join(format!("{id}.json"));
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to prune old run record");
            } else {
                debug!(run_id = %id, "pruned run record past retention window");
            }
        }
        Ok(())
    }
}

/// Directory component of a relative path, `.` for root-level files
fn directory_key(relative_path: &str) -> String {
    match Path::new(relative_path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            parent.to_string_lossy().to_string()
        }
        _ => ".".to_string(),
    }
}

/// Write via a temp file and rename in the same directory
///
/// A crash at any point leaves either the prior file or the new one, never a
/// half-written state.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;
    use crate::types::{HashAlgorithm, OutcomeHashes, ValidationLevel};
    use tempfile::TempDir;

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            algorithm: HashAlgorithm::Sha256,
            level: ValidationLevel::Standard,
            buffer_size: 4096,
            source_device: crate::types::DeviceClass::Ssd,
            target_device: crate::types::DeviceClass::Ssd,
            folders_to_backup: vec![],
            exclude_patterns: vec![],
            dry_run: false,
        }
    }

    fn outcome(path: &str, action: FileAction, size: u64) -> FileOutcome {
        FileOutcome {
            path: path.to_string(),
            size,
            modified_at: Utc::now(),
            action,
            final_level: Some(ValidationLevel::Standard),
            hashes: OutcomeHashes {
                quick_hash: Some("abcd".to_string()),
                full_hash: None,
            },
            error: None,
        }
    }

    #[test]
    fn test_run_lifecycle_and_index_upsert() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::open(temp.path(), 30).unwrap();

        let run = journal.start_run(snapshot(), false).unwrap();
        journal.record(&run, outcome("a/x.bin", FileAction::Copied, 10));
        journal.record(&run, outcome("a/y.bin", FileAction::Skipped, 20));
        journal.record(&run, outcome("a/z.bin", FileAction::Failed, 0));
        let stats = journal.complete_run(&run, RunStatus::Completed).unwrap();

        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.files_copied, 1);
        assert_eq!(stats.files_failed, 1);

        // Failed outcomes never reach the index.
        assert!(journal.fingerprint_of("a/x.bin").is_some());
        assert!(journal.fingerprint_of("a/y.bin").is_some());
        assert!(journal.fingerprint_of("a/z.bin").is_none());

        // Both files land under the same directory key.
        let record = journal.run(run.id()).unwrap();
        assert_eq!(record.stats.directories.get("a").unwrap().total_files, 3);
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.finished_at.is_some());

        // No temp files survive a flush.
        assert!(temp
            .path()
            .join(JOURNAL_DIR)
            .join("index.json")
            .exists());
        assert!(!temp
            .path()
            .join(JOURNAL_DIR)
            .join("index.json.tmp")
            .exists());
    }

    #[test]
    fn test_index_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let journal = Journal::open(temp.path(), 30).unwrap();
            let run = journal.start_run(snapshot(), false).unwrap();
            journal.record(&run, outcome("kept.bin", FileAction::Copied, 5));
            journal.complete_run(&run, RunStatus::Completed).unwrap();
        }

        let journal = Journal::open(temp.path(), 30).unwrap();
        let fp = journal.fingerprint_of("kept.bin").unwrap();
        assert_eq!(fp.size, 5);
        assert_eq!(fp.quick_hash.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_corrupt_index_starts_empty() {
        let temp = TempDir::new().unwrap();
        let journal_dir = temp.path().join(JOURNAL_DIR);
        fs::create_dir_all(&journal_dir).unwrap();
        fs::write(journal_dir.join(INDEX_FILE), b"{ not json").unwrap();

        let journal = Journal::open(temp.path(), 30).unwrap();
        assert_eq!(journal.indexed_files(), 0);
        assert!(journal.fingerprint_of("anything").is_none());
    }

    #[test]
    fn test_dry_run_leaves_index_untouched() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::open(temp.path(), 30).unwrap();

        let run = journal.start_run(snapshot(), true).unwrap();
        journal.record(&run, outcome("a.bin", FileAction::Copied, 10));
        journal.complete_run(&run, RunStatus::Completed).unwrap();

        assert!(journal.fingerprint_of("a.bin").is_none());
        // The run itself is still in history.
        assert_eq!(journal.history().unwrap().len(), 1);
    }

    #[test]
    fn test_history_newest_first_and_retention() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::open(temp.path(), 2).unwrap();

        for _ in 0..4 {
            let run = journal.start_run(snapshot(), false).unwrap();
            journal.complete_run(&run, RunStatus::Completed).unwrap();
        }

        let history = journal.history().unwrap();
        assert_eq!(history.len(), 2, "retention should keep only 2 records");
        assert!(history[0].id >= history[1].id);
    }

    #[test]
    fn test_same_second_run_ids_get_suffix() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::open(temp.path(), 30).unwrap();

        let first = journal.start_run(snapshot(), false).unwrap();
        journal.complete_run(&first, RunStatus::Completed).unwrap();
        let second = journal.start_run(snapshot(), false).unwrap();
        journal.complete_run(&second, RunStatus::Completed).unwrap();

        assert_ne!(first.id(), second.id());
        // Lexicographic order must still put the later run later.
        assert!(second.id() > first.id());
    }

    #[test]
    fn test_metadata_skip_preserves_recorded_hashes() {
        use chrono::TimeZone;
        let temp = TempDir::new().unwrap();
        let journal = Journal::open(temp.path(), 30).unwrap();
        let mtime = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let outcome_with = |hashes: OutcomeHashes| FileOutcome {
            path: "a.bin".to_string(),
            size: 10,
            modified_at: mtime,
            action: FileAction::Skipped,
            final_level: Some(ValidationLevel::Standard),
            hashes,
            error: None,
        };

        let run = journal.start_run(snapshot(), false).unwrap();
        journal.record(
            &run,
            outcome_with(OutcomeHashes {
                quick_hash: Some("deadbeef".to_string()),
                full_hash: Some("cafe".to_string()),
            }),
        );
        journal.complete_run(&run, RunStatus::Completed).unwrap();

        // A later metadata-only skip carries no hashes.
        let run = journal.start_run(snapshot(), false).unwrap();
        journal.record(&run, outcome_with(OutcomeHashes::default()));
        journal.complete_run(&run, RunStatus::Completed).unwrap();

        let fp = journal.fingerprint_of("a.bin").unwrap();
        assert_eq!(fp.quick_hash.as_deref(), Some("deadbeef"));
        assert_eq!(fp.full_hash.as_deref(), Some("cafe"));
    }

    #[test]
    fn test_integrity_issue_cap() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::open(temp.path(), 30).unwrap();

        for i in 0..(MAX_INTEGRITY_ISSUES + 10) {
            journal.report_integrity_issue(
                &format!("file-{i}"),
                vec!["content changed without modification".to_string()],
                "test".to_string(),
            );
        }

        let issues = journal.integrity_issues();
        assert_eq!(issues.len(), MAX_INTEGRITY_ISSUES);
        // The oldest entries were dropped.
        assert_eq!(issues[0].path, "file-10");
    }

    #[test]
    fn test_directory_key() {
        assert_eq!(directory_key("a/b/c.bin"), "a/b");
        assert_eq!(directory_key("top.bin"), ".");
    }
}
