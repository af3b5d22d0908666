//! # backup-butler - incremental directory mirroring with tiered validation
//!
//! A backup engine that mirrors a source directory tree to a target tree with
//! strong integrity guarantees. It is not a deduplicating store or a remote
//! replication engine: it is an incremental, directory-oriented synchronizer
//! with tiered content validation and per-run version journaling.
//!
//! ## Overview
//!
//! Three subsystems carry the interesting behaviour:
//!
//! - **The comparison ladder** ([`comparator`]): for every candidate file
//!   pair, a three-level validation ladder (metadata -> prefix hash ->
//!   full-content hash) decides whether source and target are equivalent.
//!   Escalation is strict: a higher level runs only after every lower level
//!   reports equivalence, and verdicts carry the highest level actually
//!   executed.
//! - **The directory-oriented orchestrator** ([`orchestrator`] with
//!   [`scanner`] and [`worker`]): the source tree is walked in a
//!   deterministic pre-order, work is grouped by directory to respect
//!   physical-storage access patterns, and copies run under per-device
//!   concurrency budgets with retry, backoff, and cooperative cancellation.
//! - **The version journal** ([`journal`]): every run's outcome is persisted
//!   as an independent record, and a rolling fingerprint index remembers each
//!   file's last-seen content identity so later runs can skip unchanged files
//!   without re-hashing the target.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backup_butler::{BackupConfig, CancellationToken, Orchestrator};
//! use std::path::Path;
//!
//! # fn main() -> backup_butler::Result<()> {
//! let config = BackupConfig::load(Path::new("backup-butler.toml"))?;
//! let orchestrator = Orchestrator::new(config);
//!
//! let report = orchestrator.sync(&CancellationToken::new())?;
//! println!(
//!     "copied {} files, skipped {}, {} failed",
//!     report.stats.files_copied, report.stats.files_skipped, report.stats.files_failed
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Persisted state
//!
//! Everything the engine remembers lives under `<target>/.backup-butler/`:
//! `index.json` (the fingerprint index), `versions/<run_id>.json` (one record
//! per run, retained within a configurable window), and
//! `integrity_issues.json` (a capped list of content-moved-under-unchanged-
//! mtime anomalies). All of it is written atomically via temp-file-and-rename
//! so a crash never leaves a half-written state, and a corrupt index costs
//! only hashing time, never data.
//!
//! ## Error Handling
//!
//! Operations return `Result<T, BackupError>`. Per-file failures are captured
//! into journal outcomes and never abort a run; unreachable roots, invalid
//! configuration, and cancellation are fatal and map to a non-zero exit code.

// Public API modules
pub mod comparator;
pub mod config;
pub mod error;
pub mod hasher;
pub mod journal;
pub mod orchestrator;
pub mod scanner;
pub mod storage;
pub mod types;
pub mod worker;

// Re-export main types for convenience
pub use comparator::{Comparator, Comparison, MODTIME_TOLERANCE_SECS};
pub use config::{BackupConfig, ComparisonConfig, ConfigSnapshot, DeletedFilesAction};
pub use error::{BackupError, Result};
pub use hasher::Hasher;
pub use journal::{Journal, RunRecord, RunStatus, RunSummary};
pub use orchestrator::{CheckReport, Orchestrator, RunReport};
pub use scanner::{ScanOutcome, Scanner};
pub use storage::StorageAccess;
pub use types::*;
pub use worker::{TaskExecutor, TaskResult, TaskStatus, WorkerPool};
