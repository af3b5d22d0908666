//! Directory traversal and work grouping
//!
//! The scanner walks the source tree and produces [`DirectoryTask`]s: one
//! per directory, containing that directory's candidate file pairs together
//! with aggregate byte and file counts. The emission order is deterministic -
//! parents before children, siblings in case-sensitive lexicographic order,
//! and the same order for files within a directory - so that two scans of an
//! unchanged tree enumerate identical sequences, and so that consumers touch
//! one physical directory at a time.
//!
//! Filtering happens during the walk: when an include-folder list is present
//! only those top-level folders are descended, and exclude globs are matched
//! against root-relative paths (a matching directory prunes its entire
//! subtree; a matching file drops just that file).
//!
//! A stat failure on an individual entry is recorded against the current
//! directory's task and the scan continues; only an unreadable source root is
//! fatal.

use crate::error::{BackupError, Result};
use crate::journal::JOURNAL_DIR;
use crate::types::{DirectoryTask, FilePair, OrphanEntry, ScanError, ScanSummary};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Result of a full source scan
#[derive(Debug)]
pub struct ScanOutcome {
    /// Directory tasks in deterministic pre-order
    pub tasks: Vec<DirectoryTask>,
    /// Running totals across all tasks
    pub summary: ScanSummary,
}

/// Recursive directory scanner with include/exclude filtering
#[derive(Debug)]
pub struct Scanner {
    source_root: PathBuf,
    target_root: PathBuf,
    include_folders: Vec<String>,
    excludes: GlobSet,
}

impl Scanner {
    /// Create a scanner over the given roots and filters
    ///
    /// Invalid glob patterns are a configuration error.
    pub fn new(
        source_root: PathBuf,
        target_root: PathBuf,
        include_folders: Vec<String>,
        exclude_patterns: &[String],
    ) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude_patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| BackupError::config(format!("invalid exclude pattern {pattern:?}: {e}")))?;
            builder.add(glob);
        }
        let excludes = builder
            .build()
            .map_err(|e| BackupError::config(format!("invalid exclude patterns: {e}")))?;

        Ok(Self {
            source_root,
            target_root,
            include_folders,
            excludes,
        })
    }

    /// Walk the source tree and produce directory-grouped work
    pub fn scan(&self) -> Result<ScanOutcome> {
        let root_meta = fs::metadata(&self.source_root)
            .map_err(|e| BackupError::root(&self.source_root, e))?;
        if !root_meta.is_dir() {
            return Err(BackupError::root(&self.source_root, "not a directory"));
        }

        let mut tasks = Vec::new();
        let mut summary = ScanSummary::default();
        self.scan_dir(&self.source_root, Path::new(""), 0, &mut tasks, &mut summary);

        debug!(
            directories = summary.directories,
            files = summary.total_files,
            bytes = summary.total_bytes,
            excluded_files = summary.excluded_files,
            excluded_dirs = summary.excluded_dirs,
            "scan complete"
        );
        Ok(ScanOutcome { tasks, summary })
    }

    fn scan_dir(
        &self,
        dir: &Path,
        rel: &Path,
        depth: usize,
        tasks: &mut Vec<DirectoryTask>,
        summary: &mut ScanSummary,
    ) {
        let read = match fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) => {
                let error = ScanError {
                    path: dir.to_string_lossy().to_string(),
                    message: e.to_string(),
                };
                summary.errors.push(error);
                return;
            }
        };

        let mut names: Vec<std::ffi::OsString> = read
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name())
            .collect();
        names.sort();

        let mut pairs = Vec::new();
        let mut errors = Vec::new();
        let mut subdirs = Vec::new();

        for name in names {
            let path = dir.join(&name);
            let rel_child = rel.join(&name);
            let rel_str = rel_child.to_string_lossy().to_string();

            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    let error = ScanError {
                        path: rel_str,
                        message: e.to_string(),
                    };
                    warn!(path = %path.display(), error = %error.message, "skipping unreadable entry");
                    summary.errors.push(error.clone());
                    errors.push(error);
                    continue;
                }
            };

            if metadata.is_dir() {
                if name.to_string_lossy() == JOURNAL_DIR {
                    continue;
                }
                if depth == 0
                    && !self.include_folders.is_empty()
                    && !self.include_folders.iter().any(|f| name.to_string_lossy() == *f)
                {
                    summary.excluded_dirs += 1;
                    continue;
                }
                if self.excludes.is_match(&rel_child) {
                    summary.excluded_dirs += 1;
                    continue;
                }
                subdirs.push((path, rel_child));
                continue;
            }

            // Top-level files are out of scope when an include list narrows
            // the walk to specific folders.
            if depth == 0 && !self.include_folders.is_empty() {
                summary.excluded_files += 1;
                continue;
            }
            if self.excludes.is_match(&rel_child) {
                summary.excluded_files += 1;
                continue;
            }

            let modified_at = match metadata.modified() {
                Ok(time) => DateTime::<Utc>::from(time),
                Err(e) => {
                    let error = ScanError {
                        path: rel_str,
                        message: e.to_string(),
                    };
                    summary.errors.push(error.clone());
                    errors.push(error);
                    continue;
                }
            };

            pairs.push(FilePair {
                source_path: path,
                target_path: self.target_root.join(&rel_child),
                relative_path: rel_str,
                source_size: metadata.len(),
                source_modified_at: modified_at,
            });
        }

        if !pairs.is_empty() || !errors.is_empty() {
            let total_bytes: u64 = pairs.iter().map(|p| p.source_size).sum();
            let file_count = pairs.len() as u64;
            summary.directories += 1;
            summary.total_files += file_count;
            summary.total_bytes += total_bytes;

            tasks.push(DirectoryTask {
                directory: directory_label(rel),
                pairs,
                total_bytes,
                file_count,
                errors,
            });
        }

        for (path, rel_child) in subdirs {
            self.scan_dir(&path, &rel_child, depth + 1, tasks, summary);
        }
    }

    /// Enumerate files present only on the target side
    ///
    /// The journal directory is ignored, and the same include/exclude
    /// filtering applies as for the forward scan so that out-of-scope files
    /// are never reported as deleted. Entries come back sorted by path.
    pub fn scan_orphans(&self) -> Result<Vec<OrphanEntry>> {
        if !self.target_root.is_dir() {
            return Ok(Vec::new());
        }

        let mut orphans = Vec::new();
        let walker = WalkDir::new(&self.target_root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.file_name().to_string_lossy() != JOURNAL_DIR);

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable target entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.target_root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            if self.excludes.is_match(&rel) {
                continue;
            }
            if !self.include_folders.is_empty() {
                let in_scope = rel
                    .components()
                    .next()
                    .map(|c| {
                        let first = c.as_os_str().to_string_lossy();
                        rel.components().count() > 1
                            && self.include_folders.iter().any(|f| first == *f)
                    })
                    .unwrap_or(false);
                if !in_scope {
                    continue;
                }
            }
            if self.source_root.join(&rel).exists() {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "cannot stat target entry");
                    continue;
                }
            };
            let modified_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            orphans.push(OrphanEntry {
                relative_path: rel.to_string_lossy().to_string(),
                size: metadata.len(),
                modified_at,
            });
        }

        Ok(orphans)
    }
}

fn directory_label(rel: &Path) -> String {
    if rel.as_os_str().is_empty() {
        ".".to_string()
    } else {
        rel.to_string_lossy().to_string()
    }
}
