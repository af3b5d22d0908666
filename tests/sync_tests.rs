//! End-to-end tests for the sync engine
//!
//! Exercises the full pipeline - scan, compare, copy, journal - over real
//! temporary trees, covering the first-sync/unchanged-sync/tamper scenarios
//! and the core guarantees: idempotence, mirror correctness, validation-level
//! behaviour, journal atomicity, exclusion, deterministic ordering, bounded
//! concurrency, and cancellation cleanup.

use backup_butler::{
    BackupConfig, CancellationToken, ComparisonConfig, DeletedFilesAction, DeviceClass,
    FileAction, HashAlgorithm, Journal, Orchestrator, RunStatus, ValidationLevel,
};
use filetime::FileTime;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Test harness holding a source tree, a target tree, and a config over them
struct SyncHarness {
    _temp: TempDir,
    source: PathBuf,
    target: PathBuf,
    config: BackupConfig,
}

impl SyncHarness {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let target = temp.path().join("target");
        fs::create_dir_all(&source).unwrap();

        let config = BackupConfig {
            source_directory: source.clone(),
            target_directory: target.clone(),
            folders_to_backup: vec![],
            exclude_patterns: vec![],
            comparison: ComparisonConfig {
                algorithm: HashAlgorithm::Sha256,
                level: ValidationLevel::Standard,
                buffer_size: 4096,
                verify_copies: false,
            },
            storage: storage_sides(DeviceClass::Ssd, DeviceClass::Ssd, Some(4), Some(4)),
            retry_attempts: 2,
            retry_delay: Duration::from_millis(1),
            deleted_files: Default::default(),
            max_versions: 30,
            log_level: "error".to_string(),
        };

        Self {
            _temp: temp,
            source,
            target,
            config,
        }
    }

    fn write(&self, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.source.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn write_with_mtime(&self, rel: &str, content: &[u8], unix_secs: i64) -> PathBuf {
        let path = self.write(rel, content);
        set_mtime(&path, unix_secs);
        path
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.config.clone())
    }

    fn sync(&self) -> backup_butler::RunReport {
        self.orchestrator().sync(&CancellationToken::new()).unwrap()
    }

    fn journal(&self) -> Journal {
        Journal::open(&self.target, self.config.max_versions).unwrap()
    }
}

fn storage_sides(
    source: DeviceClass,
    target: DeviceClass,
    source_threads: Option<usize>,
    target_threads: Option<usize>,
) -> backup_butler::config::StorageConfig {
    backup_butler::config::StorageConfig {
        source: backup_butler::config::StorageSideConfig {
            device: source,
            buffer_size: None,
            max_threads: source_threads,
        },
        target: backup_butler::config::StorageSideConfig {
            device: target,
            buffer_size: None,
            max_threads: target_threads,
        },
    }
}

fn set_mtime(path: &Path, unix_secs: i64) {
    filetime::set_file_mtime(path, FileTime::from_unix_time(unix_secs, 0)).unwrap();
}

/// 1 MiB of deterministic, non-repeating bytes
fn big_content() -> Vec<u8> {
    (0..1_048_576u32).map(|i| (i.wrapping_mul(31).wrapping_add(7) % 251) as u8).collect()
}

const MTIME_A: i64 = 1_704_067_200; // 2024-01-01T00:00:00Z
const MTIME_B: i64 = 1_704_067_201;

#[test]
fn first_sync_copies_everything() {
    let h = SyncHarness::new();
    h.write_with_mtime("a/x.bin", &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], MTIME_A);
    h.write_with_mtime("a/y.bin", &big_content(), MTIME_B);

    let report = h.sync();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.files_copied, 2);
    assert_eq!(report.stats.files_failed, 0);
    assert_eq!(report.stats.bytes_copied, 10 + 1_048_576);

    // Both fingerprints are indexed and the run record is on disk.
    let journal = h.journal();
    assert!(journal.fingerprint_of("a/x.bin").is_some());
    assert!(journal.fingerprint_of("a/y.bin").is_some());
    assert!(h
        .target
        .join(".backup-butler/versions")
        .join(format!("{}.json", report.run_id))
        .exists());
}

#[test]
fn unchanged_second_sync_skips_everything() {
    let h = SyncHarness::new();
    h.write_with_mtime("a/x.bin", &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], MTIME_A);
    h.write_with_mtime("a/y.bin", &big_content(), MTIME_B);

    h.sync();
    let target_x = h.target.join("a/x.bin");
    let mtime_before = fs::metadata(&target_x).unwrap().modified().unwrap();

    let second = h.sync();

    assert_eq!(second.stats.files_copied, 0, "idempotence: nothing to copy");
    assert_eq!(second.stats.files_skipped, 2);
    // No bytes were rewritten.
    assert_eq!(fs::metadata(&target_x).unwrap().modified().unwrap(), mtime_before);
    // The second run still left a record.
    assert_eq!(h.journal().history().unwrap().len(), 2);
}

#[test]
fn mirror_is_byte_identical_with_metadata() {
    let h = SyncHarness::new();
    let src_x = h.write_with_mtime("a/x.bin", b"0123456789", MTIME_A);
    h.write_with_mtime("deep/nested/tree/z.bin", b"zzz", MTIME_B);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&src_x, fs::Permissions::from_mode(0o640)).unwrap();
    }

    let report = h.sync();
    assert_eq!(report.stats.files_failed, 0);

    for rel in ["a/x.bin", "deep/nested/tree/z.bin"] {
        let src = h.source.join(rel);
        let dst = h.target.join(rel);
        assert_eq!(fs::read(&src).unwrap(), fs::read(&dst).unwrap(), "{rel}");

        let src_meta = fs::metadata(&src).unwrap();
        let dst_meta = fs::metadata(&dst).unwrap();
        let src_mtime = FileTime::from_last_modification_time(&src_meta);
        let dst_mtime = FileTime::from_last_modification_time(&dst_meta);
        assert!((src_mtime.unix_seconds() - dst_mtime.unix_seconds()).abs() <= 2);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(
                src_meta.permissions().mode() & 0o777,
                dst_meta.permissions().mode() & 0o777
            );
        }
    }
}

#[test]
fn content_change_with_same_size_and_mtime_needs_standard() {
    let mut h = SyncHarness::new();
    h.write_with_mtime("a/x.bin", b"0123456789", MTIME_A);
    h.sync();

    // Flip byte 0, keep the size, restore the mtime.
    h.write_with_mtime("a/x.bin", b"X123456789", MTIME_A);

    // Quick sees matching metadata and skips - this is the canonical
    // evidence that the validation level matters.
    h.config.comparison.level = ValidationLevel::Quick;
    let report = h.sync();
    assert_eq!(report.stats.files_copied, 0);
    assert_eq!(report.stats.files_skipped, 1);

    // Standard catches the changed prefix.
    h.config.comparison.level = ValidationLevel::Standard;
    let report = h.sync();
    assert_eq!(report.stats.files_copied, 1);

    // Deep agrees once the mirror is repaired.
    h.config.comparison.level = ValidationLevel::Deep;
    let report = h.sync();
    assert_eq!(report.stats.files_copied, 0);
    assert_eq!(fs::read(h.target.join("a/x.bin")).unwrap(), b"X123456789");
}

#[test]
fn size_change_is_detected_at_quick_level() {
    let h = SyncHarness::new();
    h.write_with_mtime("a/x.bin", b"0123456789", MTIME_A);
    h.sync();

    h.write_with_mtime("a/x.bin", b"0123456789!", MTIME_A);
    let report = h.sync();

    assert_eq!(report.stats.files_copied, 1);
    let record = h.journal().run(&report.run_id).unwrap();
    let outcome = record
        .outcomes
        .iter()
        .find(|o| o.path == "a/x.bin" && o.action == FileAction::Copied)
        .unwrap();
    assert_eq!(outcome.final_level, Some(ValidationLevel::Quick));
}

#[test]
fn deleted_target_file_is_recopied() {
    let h = SyncHarness::new();
    h.write_with_mtime("a/x.bin", b"0123456789", MTIME_A);
    h.write_with_mtime("a/y.bin", &big_content(), MTIME_B);
    h.sync();

    fs::remove_file(h.target.join("a/y.bin")).unwrap();
    let report = h.sync();

    assert_eq!(report.stats.files_copied, 1);
    assert_eq!(report.stats.files_skipped, 1);
    assert_eq!(
        fs::read(h.target.join("a/y.bin")).unwrap(),
        big_content()
    );
}

#[test]
fn cancellation_fails_the_run_and_preserves_the_index() {
    let h = SyncHarness::new();
    h.write_with_mtime("a/x.bin", b"0123456789", MTIME_A);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h.orchestrator().sync(&cancel).unwrap_err();
    assert!(err.is_cancelled());

    // The aborted run is journalled as failed and nothing was indexed.
    let journal = h.journal();
    let history = journal.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Failed);
    assert!(journal.fingerprint_of("a/x.bin").is_none());
    assert!(!h.target.join("a/x.bin").exists());
    drop(journal);

    // The next run picks the file up normally.
    let report = h.sync();
    assert_eq!(report.stats.files_copied, 1);
}

#[test]
fn quick_check_computes_no_hashes() {
    let h = SyncHarness::new();
    h.write_with_mtime("a/x.bin", b"0123456789", MTIME_A);
    h.sync();

    let mut config = h.config.clone();
    config.comparison.level = ValidationLevel::Quick;
    let orchestrator = Orchestrator::new(config);
    let metrics = orchestrator.hasher_metrics();

    let report = orchestrator.check(None).unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(metrics.prefix_hashes(), 0, "quick must not hash");
    assert_eq!(metrics.full_hashes(), 0);
}

#[test]
fn check_runs_enumerate_identically() {
    let h = SyncHarness::new();
    h.write("b/two.bin", b"2");
    h.write("a/one.bin", b"1");
    h.write("a/nested/three.bin", b"3");
    h.write("root.bin", b"0");

    let orchestrator = h.orchestrator();
    let first: Vec<String> = orchestrator
        .check(None)
        .unwrap()
        .entries
        .iter()
        .map(|e| e.relative_path.clone())
        .collect();
    let second: Vec<String> = orchestrator
        .check(None)
        .unwrap()
        .entries
        .iter()
        .map(|e| e.relative_path.clone())
        .collect();

    assert_eq!(first, second);
    assert_eq!(
        first,
        vec!["root.bin", "a/one.bin", "a/nested/three.bin", "b/two.bin"]
    );
}

#[test]
fn excluded_paths_never_reach_the_target() {
    let mut h = SyncHarness::new();
    h.write("keep/a.bin", b"a");
    h.write("cache/b.bin", b"b");
    h.write("keep/scratch.tmp", b"t");
    h.config.exclude_patterns = vec!["cache".to_string(), "*.tmp".to_string()];

    let report = h.sync();

    assert_eq!(report.stats.files_copied, 1);
    assert!(h.target.join("keep/a.bin").exists());
    assert!(!h.target.join("cache").exists());
    assert!(!h.target.join("keep/scratch.tmp").exists());
}

#[test]
fn concurrent_copies_respect_the_effective_budget() {
    let mut h = SyncHarness::new();
    for i in 0..24 {
        h.write(&format!("files/f{i:02}.bin"), &vec![i as u8; 16 * 1024]);
    }
    h.config.storage = storage_sides(DeviceClass::Ssd, DeviceClass::Ssd, Some(8), Some(2));
    assert_eq!(h.config.effective_worker_count(), 2);

    let orchestrator = h.orchestrator();
    let metrics = orchestrator.transfer_metrics();
    let report = orchestrator.sync(&CancellationToken::new()).unwrap();

    assert_eq!(report.stats.files_copied, 24);
    assert!(
        metrics.peak_concurrent() <= 2,
        "observed {} concurrent copies",
        metrics.peak_concurrent()
    );
}

#[test]
fn hdd_side_serializes_copies() {
    let mut h = SyncHarness::new();
    for i in 0..8 {
        h.write(&format!("files/f{i}.bin"), &vec![i as u8; 8 * 1024]);
    }
    h.config.storage = storage_sides(DeviceClass::Hdd, DeviceClass::Ssd, None, None);
    assert_eq!(h.config.effective_worker_count(), 1);

    let orchestrator = h.orchestrator();
    let metrics = orchestrator.transfer_metrics();
    orchestrator.sync(&CancellationToken::new()).unwrap();

    assert_eq!(metrics.peak_concurrent(), 1);
}

#[test]
fn unwritable_directory_fails_its_files_but_not_the_run() {
    let h = SyncHarness::new();
    h.write("good/a.bin", b"a");
    h.write("blocked/b.bin", b"b");
    // A file where the target directory should be makes ensure fail.
    fs::create_dir_all(&h.target).unwrap();
    fs::write(h.target.join("blocked"), b"in the way").unwrap();

    let report = h.sync();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.files_copied, 1);
    assert_eq!(report.stats.files_failed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "blocked/b.bin");
    assert!(h.target.join("good/a.bin").exists());
}

#[test]
fn corrupt_index_costs_only_the_optimization() {
    let h = SyncHarness::new();
    h.write_with_mtime("a/x.bin", b"0123456789", MTIME_A);
    h.sync();

    // Wreck the index and leave a stale temp file behind, as a crash would.
    let index = h.target.join(".backup-butler/index.json");
    fs::write(&index, b"{ definitely not json").unwrap();
    fs::write(index.with_extension("json.tmp"), b"partial").unwrap();

    let report = h.sync();

    // The ladder still proves the mirror is intact; no data was lost.
    assert_eq!(report.stats.files_skipped, 1);
    assert_eq!(report.stats.files_failed, 0);

    // The index was rewritten as valid JSON.
    let rewritten = fs::read_to_string(&index).unwrap();
    serde_json::from_str::<serde_json::Value>(&rewritten).unwrap();
}

#[test]
fn dry_run_mutates_nothing() {
    let h = SyncHarness::new();
    h.write_with_mtime("a/x.bin", b"0123456789", MTIME_A);

    let report = h.orchestrator().dry_run(&CancellationToken::new()).unwrap();

    assert!(report.dry_run);
    assert_eq!(report.stats.files_copied, 1, "intended copy is recorded");
    assert!(!h.target.join("a").exists(), "no directory was created");
    // The run is journalled but the index stays empty.
    let journal = h.journal();
    assert_eq!(journal.history().unwrap().len(), 1);
    assert!(journal.fingerprint_of("a/x.bin").is_none());
}

#[test]
fn orphans_are_reported_to_the_deleted_files_list() {
    let h = SyncHarness::new();
    h.write("a/kept.bin", b"k");
    h.sync();

    // A file appears in the target behind our back, then the source moves on.
    fs::write(h.target.join("a/stray.bin"), b"stray").unwrap();
    let report = h.sync();

    assert_eq!(report.deleted.len(), 1);
    assert_eq!(report.deleted[0].relative_path, "a/stray.bin");

    let report_file = h.target.join(".backup-butler/deleted_files.txt");
    let content = fs::read_to_string(&report_file).unwrap();
    assert!(content.starts_with("a/stray.bin\t5\t"));
    assert!(content.trim_end().ends_with("total: 1 files, 5 bytes"));
}

#[test]
fn orphans_are_removed_under_delete_action() {
    let mut h = SyncHarness::new();
    h.write("a/kept.bin", b"k");
    h.config.deleted_files.action = DeletedFilesAction::Delete;
    h.sync();

    fs::write(h.target.join("a/stray.bin"), b"stray").unwrap();
    let report = h.sync();

    assert_eq!(report.deleted.len(), 1);
    assert!(!h.target.join("a/stray.bin").exists());
    assert!(h.target.join("a/kept.bin").exists());
}

#[test]
fn check_reports_verdicts_without_mutating() {
    let h = SyncHarness::new();
    h.write_with_mtime("a/same.bin", b"same", MTIME_A);
    h.write_with_mtime("a/new.bin", b"new", MTIME_A);
    h.sync();
    fs::remove_file(h.target.join("a/new.bin")).unwrap();
    fs::write(h.target.join("a/stray.bin"), b"stray").unwrap();

    let report = h.orchestrator().check(None).unwrap();

    assert_eq!(report.matched, 1);
    assert_eq!(report.missing, 1);
    assert_eq!(report.orphans, 1);
    // check never repairs anything.
    assert!(!h.target.join("a/new.bin").exists());
    assert!(h.target.join("a/stray.bin").exists());
}

#[test]
fn history_lists_newest_first() {
    let h = SyncHarness::new();
    h.write("a/x.bin", b"x");
    h.sync();
    h.sync();
    h.sync();

    let history = h.journal().history().unwrap();
    assert_eq!(history.len(), 3);
    assert!(history[0].id > history[1].id);
    assert!(history[1].id > history[2].id);
}

#[test]
fn deep_sync_verifies_copies() {
    let mut h = SyncHarness::new();
    h.config.comparison.level = ValidationLevel::Deep;
    h.write_with_mtime("a/x.bin", &big_content(), MTIME_A);

    let orchestrator = h.orchestrator();
    let metrics = orchestrator.hasher_metrics();
    let report = orchestrator.sync(&CancellationToken::new()).unwrap();

    assert_eq!(report.stats.files_copied, 1);
    // Post-copy verification hashed both the source and the landed copy.
    assert!(metrics.full_hashes() >= 2);
    assert_eq!(fs::read(h.target.join("a/x.bin")).unwrap(), big_content());
}
