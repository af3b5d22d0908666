//! Configuration loading and validation
//!
//! The configuration file is TOML. A minimal file names the two roots;
//! everything else has defaults:
//!
//! ```toml
//! source_directory = "/data/photos"
//! target_directory = "/mnt/backup/photos"
//! exclude_patterns = ["*.tmp", ".DS_Store"]
//!
//! [comparison]
//! algorithm = "sha256"
//! level = "standard"
//! buffer_size = 32768
//!
//! [storage.source]
//! type = "ssd"
//!
//! [storage.target]
//! type = "hdd"
//! max_threads = 2
//! ```
//!
//! The core consumes an already-validated [`BackupConfig`]; [`BackupConfig::load`]
//! performs the validation the rest of the system relies on (algorithm and
//! device-class membership, thread bounds, buffer bounds, source existence).

use crate::error::{BackupError, Result};
use crate::types::{DeviceClass, HashAlgorithm, ValidationLevel};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest accepted comparison buffer (4 KiB)
pub const MIN_BUFFER_SIZE: usize = 4096;
/// Largest accepted comparison buffer (10 MiB)
pub const MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;
/// Upper bound for per-side worker counts
pub const MAX_THREADS_LIMIT: usize = 16;
/// Default number of retained run records
pub const DEFAULT_RETENTION: usize = 30;

/// Validated configuration consumed by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Root of the tree being mirrored
    pub source_directory: PathBuf,
    /// Root the mirror is written to
    pub target_directory: PathBuf,
    /// Top-level folders to include; empty means include all
    #[serde(default)]
    pub folders_to_backup: Vec<String>,
    /// Shell globs matched against root-relative paths
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Comparison ladder settings
    #[serde(default)]
    pub comparison: ComparisonConfig,
    /// Per-side device budgets
    #[serde(default)]
    pub storage: StorageConfig,
    /// Total copy attempts per file (minimum 1)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay between retry attempts, humantime syntax (e.g. "1s")
    #[serde(default = "default_retry_delay", with = "humantime_duration")]
    pub retry_delay: Duration,
    /// What to do about files present only in the target
    #[serde(default)]
    pub deleted_files: DeletedFilesConfig,
    /// Number of run records kept by the journal
    #[serde(default = "default_retention")]
    pub max_versions: usize,
    /// Log level handed to the logging collaborator
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Comparison ladder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonConfig {
    /// Digest algorithm used on both sides
    #[serde(default = "default_algorithm")]
    pub algorithm: HashAlgorithm,
    /// Default validation level
    #[serde(default = "default_level")]
    pub level: ValidationLevel,
    /// Read buffer size; also the prefix length for quick hashes
    #[serde(default = "default_comparison_buffer")]
    pub buffer_size: usize,
    /// Re-hash every copy after it lands, regardless of level
    #[serde(default)]
    pub verify_copies: bool,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            level: default_level(),
            buffer_size: default_comparison_buffer(),
            verify_copies: false,
        }
    }
}

/// Budgets for both sides of the transfer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Source side
    #[serde(default)]
    pub source: StorageSideConfig,
    /// Target side
    #[serde(default)]
    pub target: StorageSideConfig,
}

/// One side's device class with optional overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSideConfig {
    /// Device class (`hdd`, `ssd`, `network`)
    #[serde(rename = "type", default = "default_device")]
    pub device: DeviceClass,
    /// Override for this side's I/O buffer size
    #[serde(default)]
    pub buffer_size: Option<usize>,
    /// Override for this side's worker budget (0 means "use the default")
    #[serde(default)]
    pub max_threads: Option<usize>,
}

impl Default for StorageSideConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            buffer_size: None,
            max_threads: None,
        }
    }
}

impl StorageSideConfig {
    /// Buffer size for this side, falling back to the device default
    pub fn effective_buffer_size(&self) -> usize {
        match self.buffer_size {
            Some(size) if size > 0 => size,
            _ => self.device.default_buffer_size(),
        }
    }

    /// Worker budget for this side, falling back to the device default
    pub fn effective_worker_count(&self) -> usize {
        match self.max_threads {
            Some(count) if count > 0 => count,
            _ => self.device.default_worker_count(),
        }
    }
}

/// Handling of files present only in the target
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeletedFilesConfig {
    /// `report` (default) or `delete`
    #[serde(default)]
    pub action: DeletedFilesAction,
}

/// What to do with target-only files after a sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletedFilesAction {
    /// Write them to `deleted_files.txt`
    #[default]
    Report,
    /// Remove them from the target
    Delete,
}

/// The subset of configuration that influenced a run's behaviour,
/// persisted with each run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Digest algorithm used
    pub algorithm: HashAlgorithm,
    /// Validation level used
    pub level: ValidationLevel,
    /// Prefix length / comparison buffer
    pub buffer_size: usize,
    /// Source device class
    pub source_device: DeviceClass,
    /// Target device class
    pub target_device: DeviceClass,
    /// Included folders (empty = all)
    pub folders_to_backup: Vec<String>,
    /// Exclude patterns in force
    pub exclude_patterns: Vec<String>,
    /// Whether this run mutated the target
    pub dry_run: bool,
}

impl BackupConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| BackupError::config(format!("cannot read {}: {e}", path.display())))?;
        let config: BackupConfig = toml::from_str(&content)
            .map_err(|e| BackupError::config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges and the existence of the source root
    pub fn validate(&self) -> Result<()> {
        if self.source_directory.as_os_str().is_empty() {
            return Err(BackupError::config("source directory is required"));
        }
        if self.target_directory.as_os_str().is_empty() {
            return Err(BackupError::config("target directory is required"));
        }
        if !self.source_directory.is_dir() {
            return Err(BackupError::config(format!(
                "source directory invalid: {}",
                self.source_directory.display()
            )));
        }
        if self.comparison.buffer_size < MIN_BUFFER_SIZE
            || self.comparison.buffer_size > MAX_BUFFER_SIZE
        {
            return Err(BackupError::config(format!(
                "comparison buffer size must be between {MIN_BUFFER_SIZE} and {MAX_BUFFER_SIZE} bytes"
            )));
        }
        for (name, side) in [("source", &self.storage.source), ("target", &self.storage.target)] {
            if let Some(threads) = side.max_threads {
                if threads > MAX_THREADS_LIMIT {
                    return Err(BackupError::config(format!(
                        "{name} max threads must be between 0 and {MAX_THREADS_LIMIT}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The single worker count governing concurrent copies: the slower side
    /// throttles, and an HDD on either side degrades the pool to one worker
    /// to keep copies sequential.
    pub fn effective_worker_count(&self) -> usize {
        if self.has_hdd_side() {
            return 1;
        }
        self.storage
            .source
            .effective_worker_count()
            .min(self.storage.target.effective_worker_count())
            .max(1)
    }

    /// Whether either side is a spinning disk
    pub fn has_hdd_side(&self) -> bool {
        self.storage.source.device == DeviceClass::Hdd
            || self.storage.target.device == DeviceClass::Hdd
    }

    /// Read buffer size: the source side's budget
    pub fn read_buffer_size(&self) -> usize {
        self.storage.source.effective_buffer_size()
    }

    /// Write buffer size: the target side's budget
    pub fn write_buffer_size(&self) -> usize {
        self.storage.target.effective_buffer_size()
    }

    /// Capture the behaviour-relevant subset for the journal
    pub fn snapshot(&self, level: ValidationLevel, dry_run: bool) -> ConfigSnapshot {
        ConfigSnapshot {
            algorithm: self.comparison.algorithm,
            level,
            buffer_size: self.comparison.buffer_size,
            source_device: self.storage.source.device,
            target_device: self.storage.target.device,
            folders_to_backup: self.folders_to_backup.clone(),
            exclude_patterns: self.exclude_patterns.clone(),
            dry_run,
        }
    }
}

fn default_algorithm() -> HashAlgorithm {
    HashAlgorithm::Sha256
}

fn default_level() -> ValidationLevel {
    ValidationLevel::Standard
}

fn default_comparison_buffer() -> usize {
    32 * 1024
}

fn default_device() -> DeviceClass {
    DeviceClass::Hdd
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_retention() -> usize {
    DEFAULT_RETENTION
}

fn default_log_level() -> String {
    "error".to_string()
}

/// Serde adapter for humantime-style duration strings ("1s", "500ms")
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn minimal_config(source: &Path, target: &Path) -> String {
        format!(
            "source_directory = {:?}\ntarget_directory = {:?}\n",
            source.display().to_string(),
            target.display().to_string()
        )
    }

    #[test]
    fn test_defaults() {
        let temp = TempDir::new().unwrap();
        let toml = minimal_config(temp.path(), &temp.path().join("out"));
        let config: BackupConfig = toml::from_str(&toml).unwrap();

        assert_eq!(config.comparison.algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.comparison.level, ValidationLevel::Standard);
        assert_eq!(config.comparison.buffer_size, 32 * 1024);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.deleted_files.action, DeletedFilesAction::Report);
        assert_eq!(config.max_versions, DEFAULT_RETENTION);
        assert_eq!(config.log_level, "error");
    }

    #[test]
    fn test_device_budgets_and_overrides() {
        let temp = TempDir::new().unwrap();
        let toml = format!(
            "{}[storage.source]\ntype = \"ssd\"\n[storage.target]\ntype = \"network\"\nmax_threads = 3\nbuffer_size = 8192\n",
            minimal_config(temp.path(), &temp.path().join("out"))
        );
        let config: BackupConfig = toml::from_str(&toml).unwrap();

        assert_eq!(config.storage.source.effective_buffer_size(), 256 * 1024);
        assert_eq!(config.storage.source.effective_worker_count(), 16);
        assert_eq!(config.storage.target.effective_buffer_size(), 8192);
        assert_eq!(config.storage.target.effective_worker_count(), 3);
        assert_eq!(config.effective_worker_count(), 3);
        assert!(!config.has_hdd_side());
    }

    #[test]
    fn test_hdd_degrades_pool_to_one() {
        let temp = TempDir::new().unwrap();
        let toml = format!(
            "{}[storage.source]\ntype = \"hdd\"\n[storage.target]\ntype = \"ssd\"\n",
            minimal_config(temp.path(), &temp.path().join("out"))
        );
        let config: BackupConfig = toml::from_str(&toml).unwrap();
        assert!(config.has_hdd_side());
        assert_eq!(config.effective_worker_count(), 1);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let temp = TempDir::new().unwrap();
        let base = minimal_config(temp.path(), &temp.path().join("out"));

        let mut config: BackupConfig = toml::from_str(&base).unwrap();
        config.comparison.buffer_size = 100;
        assert!(config.validate().is_err());

        let mut config: BackupConfig = toml::from_str(&base).unwrap();
        config.storage.target.max_threads = Some(64);
        assert!(config.validate().is_err());

        let mut config: BackupConfig = toml::from_str(&base).unwrap();
        config.source_directory = temp.path().join("does-not-exist");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_parsing() {
        let temp = TempDir::new().unwrap();
        let toml = format!(
            "{}retry_delay = \"250ms\"\n",
            minimal_config(temp.path(), &temp.path().join("out"))
        );
        let config: BackupConfig = toml::from_str(&toml).unwrap();
        assert_eq!(config.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("backup-butler.toml");
        fs::write(
            &config_path,
            minimal_config(temp.path(), &temp.path().join("out")),
        )
        .unwrap();

        let config = BackupConfig::load(&config_path).unwrap();
        assert_eq!(config.source_directory, temp.path());
        assert!(BackupConfig::load(&temp.path().join("missing.toml")).is_err());
    }
}
