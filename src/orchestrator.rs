//! Top-level control flow for check, dry-run, and sync
//!
//! The orchestrator binds Scanner -> Comparator -> WorkerPool -> Journal.
//! For a sync run, every file pair walks the same pipeline:
//!
//! ```text
//! StatAndLookup -> Compare -> Match?  -> record skipped
//!                          -> Differ / Missing
//!                               -> EnsureDestDir -> Copy -> VerifyIfDeep
//!                               -> record copied
//! ```
//!
//! Per-file failures are captured into outcomes and never abort the run;
//! only an unreachable root (or cancellation) is fatal. The journal's
//! `complete_run` is attempted even when the body fails so history stays
//! consistent.
//!
//! Concurrency follows the per-side device budgets: the worker count is the
//! minimum of the two sides, and any HDD side degrades the pool to a single
//! worker so copies stay sequential in scan order (one directory at a time,
//! minimizing head seeks). Directory summaries are emitted only after every
//! file of the directory reaches a terminal state, and a directory's target
//! counterpart is ensured before any of its files is dispatched.

use crate::comparator::{Comparator, Comparison};
use crate::config::{BackupConfig, DeletedFilesAction};
use crate::error::{BackupError, Result};
use crate::hasher::{Hasher, HasherMetrics};
use crate::journal::{Journal, RunHandle, RunStatus};
use crate::scanner::{ScanOutcome, Scanner};
use crate::storage::{StorageAccess, TransferMetrics};
use crate::types::{
    BackupStats, CancellationToken, CompareErrorKind, FileAction, FileOutcome, FilePair,
    NoOpSink, OrphanEntry, OutcomeHashes, ProgressEvent, ProgressSink, ValidationLevel, Verdict,
};
use crate::worker::{TaskExecutor, TaskStatus, WorkerPool};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a sync or dry-run operation
#[derive(Debug)]
pub struct RunReport {
    /// The journal id of this run
    pub run_id: String,
    /// Terminal run status
    pub status: RunStatus,
    /// Overall counters
    pub stats: BackupStats,
    /// Failed files with one-line error messages
    pub failures: Vec<(String, String)>,
    /// Files present only in the target
    pub deleted: Vec<OrphanEntry>,
    /// Whether this was a dry run
    pub dry_run: bool,
}

/// One compared pair in a check report
#[derive(Debug)]
pub struct CheckEntry {
    /// Root-relative path
    pub relative_path: String,
    /// The comparator's conclusion
    pub verdict: Verdict,
}

/// Result of a check operation
#[derive(Debug, Default)]
pub struct CheckReport {
    /// Per-file verdicts in scan order, orphans appended last
    pub entries: Vec<CheckEntry>,
    /// Pairs considered equivalent
    pub matched: u64,
    /// Pairs requiring a copy
    pub differing: u64,
    /// Pairs whose target is missing
    pub missing: u64,
    /// Pairs whose comparison failed
    pub errors: u64,
    /// Files present only in the target
    pub orphans: u64,
}

/// Top-level operation driver
pub struct Orchestrator {
    config: BackupConfig,
    storage: StorageAccess,
    hasher: Hasher,
    progress: Arc<dyn ProgressSink>,
}

impl Orchestrator {
    /// Create an orchestrator over a validated configuration
    pub fn new(config: BackupConfig) -> Self {
        let storage = StorageAccess::new(config.read_buffer_size(), config.write_buffer_size());
        let hasher = Hasher::new(config.comparison.algorithm, config.comparison.buffer_size);
        Self {
            config,
            storage,
            hasher,
            progress: Arc::new(NoOpSink),
        }
    }

    /// Attach a progress sink
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Transfer counters, shared with the storage layer
    pub fn transfer_metrics(&self) -> Arc<TransferMetrics> {
        self.storage.metrics()
    }

    /// Hash-computation counters, shared with the hasher
    pub fn hasher_metrics(&self) -> Arc<HasherMetrics> {
        self.hasher.metrics()
    }

    fn scanner(&self) -> Result<Scanner> {
        Scanner::new(
            self.config.source_directory.clone(),
            self.config.target_directory.clone(),
            self.config.folders_to_backup.clone(),
            &self.config.exclude_patterns,
        )
    }

    fn comparator(&self, level: ValidationLevel) -> Comparator {
        Comparator::new(
            self.hasher.clone(),
            level,
            self.config.comparison.buffer_size as u64,
        )
    }

    /// Compare every pair without mutating anything
    ///
    /// Runs the comparator at the configured (or overridden) level and
    /// reports target-only files as orphans. The journal is consulted for
    /// fingerprint shortcuts when it already exists but is never written.
    pub fn check(&self, level_override: Option<ValidationLevel>) -> Result<CheckReport> {
        let level = level_override.unwrap_or(self.config.comparison.level);
        let comparator = self.comparator(level);
        let scanner = self.scanner()?;

        let journal = if self
            .config
            .target_directory
            .join(crate::journal::JOURNAL_DIR)
            .is_dir()
        {
            Some(Journal::open(&self.config.target_directory, self.config.max_versions)?)
        } else {
            None
        };

        self.progress.on_event(&ProgressEvent::ScanStarted);
        let outcome = scanner.scan()?;
        self.progress.on_event(&ProgressEvent::ScanCompleted {
            total_files: outcome.summary.total_files,
            total_bytes: outcome.summary.total_bytes,
        });

        let mut report = CheckReport::default();
        for task in &outcome.tasks {
            for error in &task.errors {
                report.errors += 1;
                report.entries.push(CheckEntry {
                    relative_path: error.path.clone(),
                    verdict: Verdict::Error {
                        kind: CompareErrorKind::SourceUnreadable,
                        message: error.message.clone(),
                    },
                });
            }
            for pair in &task.pairs {
                let comparison = comparator.compare(pair, &self.storage, journal.as_ref());
                match &comparison.verdict {
                    Verdict::Match(_) => report.matched += 1,
                    Verdict::Differ(_) => report.differing += 1,
                    Verdict::Missing => report.missing += 1,
                    Verdict::Error { .. } => report.errors += 1,
                    Verdict::Orphan => {}
                }
                report.entries.push(CheckEntry {
                    relative_path: pair.relative_path.clone(),
                    verdict: comparison.verdict,
                });
            }
        }

        for orphan in scanner.scan_orphans()? {
            report.orphans += 1;
            report.entries.push(CheckEntry {
                relative_path: orphan.relative_path,
                verdict: Verdict::Orphan,
            });
        }

        info!(
            level = %level,
            matched = report.matched,
            differing = report.differing,
            missing = report.missing,
            orphans = report.orphans,
            errors = report.errors,
            "check complete"
        );
        Ok(report)
    }

    /// Mirror the source into the target
    pub fn sync(&self, cancel: &CancellationToken) -> Result<RunReport> {
        self.run_sync(cancel, false)
    }

    /// Walk the full sync pipeline without mutating the target
    pub fn dry_run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        self.run_sync(cancel, true)
    }

    fn run_sync(&self, cancel: &CancellationToken, dry_run: bool) -> Result<RunReport> {
        let level = self.config.comparison.level;

        fs::metadata(&self.config.source_directory)
            .map_err(|e| BackupError::root(&self.config.source_directory, e))?;
        fs::create_dir_all(&self.config.target_directory)
            .map_err(|e| BackupError::root(&self.config.target_directory, e))?;

        let journal = Arc::new(Journal::open(
            &self.config.target_directory,
            self.config.max_versions,
        )?);
        let run = journal.start_run(self.config.snapshot(level, dry_run), dry_run)?;
        let run_id = run.id().to_string();

        let body = self.sync_body(&journal, &run, cancel, dry_run, level);

        let status = match &body {
            Ok(_) if !cancel.is_cancelled() => RunStatus::Completed,
            _ => RunStatus::Failed,
        };
        let stats = journal.complete_run(&run, status)?;
        self.progress.on_event(&ProgressEvent::RunCompleted { stats });

        let (failures, deleted) = body?;
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        Ok(RunReport {
            run_id,
            status,
            stats,
            failures,
            deleted,
            dry_run,
        })
    }

    #[allow(clippy::type_complexity)]
    fn sync_body(
        &self,
        journal: &Arc<Journal>,
        run: &RunHandle,
        cancel: &CancellationToken,
        dry_run: bool,
        level: ValidationLevel,
    ) -> Result<(Vec<(String, String)>, Vec<OrphanEntry>)> {
        self.progress.on_event(&ProgressEvent::ScanStarted);
        let scanner = self.scanner()?;
        let outcome = scanner.scan()?;
        self.progress.on_event(&ProgressEvent::ScanCompleted {
            total_files: outcome.summary.total_files,
            total_bytes: outcome.summary.total_bytes,
        });

        let mut failures = Vec::new();
        let (pairs, mut pending) =
            self.prepare_directories(&outcome, journal, run, dry_run, &mut failures)?;

        let pool = WorkerPool::new(
            self.config.effective_worker_count(),
            self.config.retry_attempts,
            self.config.retry_delay,
        );
        let executor = Arc::new(FileSyncExecutor {
            storage: self.storage.clone(),
            hasher: self.hasher.clone(),
            comparator: self.comparator(level),
            journal: Arc::clone(journal),
            run: run.clone(),
            cancel: cancel.clone(),
            dry_run,
            verify_copies: level == ValidationLevel::Deep || self.config.comparison.verify_copies,
            prefix_bytes: self.config.comparison.buffer_size as u64,
            comparisons: Mutex::new(HashMap::new()),
        });

        let results = pool.execute(pairs, executor, cancel.clone());
        for result in results.iter() {
            let pair = &result.task;
            let action = match result.status {
                TaskStatus::Completed => FileAction::Copied,
                TaskStatus::Skipped => FileAction::Skipped,
                TaskStatus::Failed => FileAction::Failed,
            };

            if action == FileAction::Failed {
                let message = result
                    .error
                    .as_ref()
                    .map(|e| {
                        if e.is_cancelled() {
                            "cancelled".to_string()
                        } else {
                            e.to_string()
                        }
                    })
                    .unwrap_or_else(|| "unknown failure".to_string());
                failures.push((pair.relative_path.clone(), message.clone()));
                journal.record(
                    run,
                    FileOutcome {
                        path: pair.relative_path.clone(),
                        size: pair.source_size,
                        modified_at: pair.source_modified_at,
                        action: FileAction::Failed,
                        final_level: None,
                        hashes: OutcomeHashes::default(),
                        error: Some(message),
                    },
                );
            }

            self.progress.on_event(&ProgressEvent::FileCompleted {
                path: pair.relative_path.clone(),
                action,
                size: pair.source_size,
            });
            self.note_directory_progress(&mut pending, pair, action);
        }

        let deleted = self.handle_deleted_files(&scanner, cancel, dry_run)?;
        Ok((failures, deleted))
    }

    /// Ensure every task's target directory exists (parents first, following
    /// scan order) and flatten the surviving pairs for dispatch
    #[allow(clippy::type_complexity)]
    fn prepare_directories(
        &self,
        outcome: &ScanOutcome,
        journal: &Arc<Journal>,
        run: &RunHandle,
        dry_run: bool,
        failures: &mut Vec<(String, String)>,
    ) -> Result<(Vec<FilePair>, HashMap<String, DirectoryProgress>)> {
        let mut pairs = Vec::new();
        let mut pending = HashMap::new();

        for task in &outcome.tasks {
            for error in &task.errors {
                failures.push((error.path.clone(), error.message.clone()));
                journal.record(
                    run,
                    FileOutcome {
                        path: error.path.clone(),
                        size: 0,
                        modified_at: chrono::Utc::now(),
                        action: FileAction::Failed,
                        final_level: None,
                        hashes: OutcomeHashes::default(),
                        error: Some(error.message.clone()),
                    },
                );
            }
            if task.pairs.is_empty() {
                continue;
            }

            let target_dir = if task.directory == "." {
                self.config.target_directory.clone()
            } else {
                self.config.target_directory.join(&task.directory)
            };
            if !dry_run {
                if let Err(e) = self.storage.ensure_directory(&target_dir) {
                    warn!(directory = %task.directory, error = %e, "cannot ensure target directory");
                    for pair in &task.pairs {
                        failures.push((pair.relative_path.clone(), e.to_string()));
                        journal.record(
                            run,
                            FileOutcome {
                                path: pair.relative_path.clone(),
                                size: pair.source_size,
                                modified_at: pair.source_modified_at,
                                action: FileAction::Failed,
                                final_level: None,
                                hashes: OutcomeHashes::default(),
                                error: Some(e.to_string()),
                            },
                        );
                    }
                    continue;
                }
            }

            self.progress.on_event(&ProgressEvent::DirectoryStarted {
                directory: task.directory.clone(),
                file_count: task.file_count,
            });
            pending.insert(
                task.directory.clone(),
                DirectoryProgress {
                    remaining: task.pairs.len() as u64,
                    stats: BackupStats::default(),
                },
            );
            pairs.extend(task.pairs.iter().cloned());
        }

        Ok((pairs, pending))
    }

    fn note_directory_progress(
        &self,
        pending: &mut HashMap<String, DirectoryProgress>,
        pair: &FilePair,
        action: FileAction,
    ) {
        let directory = parent_directory(&pair.relative_path);
        let Some(progress) = pending.get_mut(&directory) else {
            return;
        };
        progress.stats.record(action, pair.source_size);
        progress.remaining -= 1;
        if progress.remaining == 0 {
            let finished = pending.remove(&directory).map(|p| p.stats).unwrap_or_default();
            self.progress.on_event(&ProgressEvent::DirectoryCompleted {
                directory,
                stats: finished,
            });
        }
    }

    fn handle_deleted_files(
        &self,
        scanner: &Scanner,
        cancel: &CancellationToken,
        dry_run: bool,
    ) -> Result<Vec<OrphanEntry>> {
        let orphans = scanner.scan_orphans()?;
        if orphans.is_empty() || dry_run || cancel.is_cancelled() {
            return Ok(orphans);
        }

        match self.config.deleted_files.action {
            DeletedFilesAction::Report => {
                let report_path = self
                    .config
                    .target_directory
                    .join(crate::journal::JOURNAL_DIR)
                    .join("deleted_files.txt");
                write_deleted_report(&report_path, &orphans)?;
                debug!(count = orphans.len(), path = %report_path.display(), "wrote deleted-files report");
            }
            DeletedFilesAction::Delete => {
                for orphan in &orphans {
                    let path = self.config.target_directory.join(&orphan.relative_path);
                    if let Err(e) = self.storage.remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "cannot delete orphaned file");
                    }
                }
                info!(count = orphans.len(), "deleted orphaned target files");
            }
        }
        Ok(orphans)
    }
}

struct DirectoryProgress {
    remaining: u64,
    stats: BackupStats,
}

/// Per-file pipeline shared by all workers
struct FileSyncExecutor {
    storage: StorageAccess,
    hasher: Hasher,
    comparator: Comparator,
    journal: Arc<Journal>,
    run: RunHandle,
    cancel: CancellationToken,
    dry_run: bool,
    verify_copies: bool,
    prefix_bytes: u64,
    /// Comparison state carried from the skip check into the copy step
    comparisons: Mutex<HashMap<String, Comparison>>,
}

impl FileSyncExecutor {
    fn record(&self, pair: &FilePair, action: FileAction, comparison: &Comparison) {
        let (size, modified_at) = comparison
            .source_stat
            .map(|s| (s.size, s.modified_at))
            .unwrap_or((pair.source_size, pair.source_modified_at));

        self.journal.record(
            &self.run,
            FileOutcome {
                path: pair.relative_path.clone(),
                size,
                modified_at,
                action,
                final_level: comparison.verdict.final_level(),
                hashes: OutcomeHashes {
                    quick_hash: comparison.source_quick_hash.clone(),
                    full_hash: comparison.source_full_hash.clone(),
                },
                error: None,
            },
        );
    }
}

impl TaskExecutor<FilePair> for FileSyncExecutor {
    /// StatAndLookup + Compare: a match finishes the file as skipped
    fn should_skip(&self, pair: &FilePair) -> crate::error::Result<bool> {
        let comparison = self.comparator.compare(pair, &self.storage, Some(self.journal.as_ref()));
        match &comparison.verdict {
            Verdict::Match(_) => {
                self.record(pair, FileAction::Skipped, &comparison);
                Ok(true)
            }
            Verdict::Differ(_) | Verdict::Missing => {
                self.comparisons
                    .lock()
                    .insert(pair.relative_path.clone(), comparison);
                Ok(false)
            }
            Verdict::Error { kind, message } => Err(match kind {
                CompareErrorKind::HashFailed => {
                    BackupError::hash(&pair.source_path, message.clone())
                }
                _ => BackupError::unreadable(&pair.source_path, message.clone()),
            }),
            Verdict::Orphan => Err(BackupError::internal(
                "orphan verdict during source-side sync",
            )),
        }
    }

    /// EnsureDestDir + Copy + VerifyIfDeep + record
    fn execute(&self, pair: &FilePair) -> crate::error::Result<()> {
        let mut comparison = self
            .comparisons
            .lock()
            .get(&pair.relative_path)
            .cloned()
            .ok_or_else(|| BackupError::internal("copy without prior comparison"))?;

        if self.dry_run {
            // Intended action only; the target stays untouched.
            self.record(pair, FileAction::Copied, &comparison);
            self.comparisons.lock().remove(&pair.relative_path);
            return Ok(());
        }

        if let Some(parent) = pair.target_path.parent() {
            self.storage.ensure_directory(parent)?;
        }
        self.storage.copy(&pair.source_path, &pair.target_path, &self.cancel)?;

        if self.verify_copies {
            let expected = match &comparison.source_full_hash {
                Some(hash) => hash.clone(),
                None => {
                    let hash = self.hasher.full_hash(&pair.source_path)?;
                    comparison.source_full_hash = Some(hash.clone());
                    hash
                }
            };
            let actual = self.hasher.full_hash(&pair.target_path)?;
            if expected != actual {
                self.storage.remove_file(&pair.target_path)?;
                return Err(BackupError::VerifyFailed {
                    path: pair.target_path.clone(),
                    expected,
                    actual,
                });
            }
        }

        // The index needs a quick hash for the next run's shortcut.
        if comparison.source_quick_hash.is_none() {
            match self.hasher.prefix_hash(&pair.source_path, self.prefix_bytes) {
                Ok(hash) => comparison.source_quick_hash = Some(hash),
                Err(e) => warn!(path = %pair.relative_path, error = %e, "cannot fingerprint copied file"),
            }
        }

        self.record(pair, FileAction::Copied, &comparison);
        self.comparisons.lock().remove(&pair.relative_path);
        Ok(())
    }
}

/// Directory component of a relative path, `.` for root-level files
fn parent_directory(relative_path: &str) -> String {
    match Path::new(relative_path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().to_string(),
        _ => ".".to_string(),
    }
}

/// Write the deleted-files report: one tab-separated line per entry plus a
/// totals footer
fn write_deleted_report(path: &Path, orphans: &[OrphanEntry]) -> Result<()> {
    let mut content = String::new();
    let mut total_bytes = 0u64;
    for orphan in orphans {
        content.push_str(&format!(
            "{}\t{}\t{}\n",
            orphan.relative_path,
            orphan.size,
            orphan.modified_at.to_rfc3339()
        ));
        total_bytes += orphan.size;
    }
    content.push_str(&format!(
        "total: {} files, {} bytes\n",
        orphans.len(),
        total_bytes
    ));

    let mut file = fs::File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_directory() {
        assert_eq!(parent_directory("a/b/c.bin"), "a/b");
        assert_eq!(parent_directory("top.bin"), ".");
    }

    #[test]
    fn test_deleted_report_format() {
        use chrono::TimeZone;
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("deleted_files.txt");
        let orphans = vec![OrphanEntry {
            relative_path: "a/gone.bin".to_string(),
            size: 42,
            modified_at: chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }];

        write_deleted_report(&path, &orphans).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        let first = lines.next().unwrap();
        assert!(first.starts_with("a/gone.bin\t42\t"));
        assert_eq!(lines.next().unwrap(), "total: 1 files, 42 bytes");
    }
}
