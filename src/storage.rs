//! Platform-local file I/O primitives
//!
//! `StorageAccess` is the only component that mutates the target tree. It
//! provides stat, streaming reads, directory creation, and a cancellable
//! buffered copy that preserves permission bits and modification time and
//! never leaves a partial destination behind: on any mid-transfer error or
//! cancellation the incomplete file is removed before the error is returned.
//!
//! Reads use the source side's buffer budget, writes the target side's; both
//! come from the per-device configuration. A shared [`TransferMetrics`] gauge
//! tracks in-flight copies so tests can assert the concurrency bound.

use crate::error::{BackupError, Result};
use crate::types::CancellationToken;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace, warn};

/// Result of a stat call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes
    pub size: u64,
    /// Unix permission bits (a synthesized default on non-unix platforms)
    pub mode: u32,
    /// Last modification time
    pub modified_at: DateTime<Utc>,
}

/// Counters over copy activity, shared across clones of a [`StorageAccess`]
#[derive(Debug, Default)]
pub struct TransferMetrics {
    active_copies: AtomicUsize,
    peak_concurrent: AtomicUsize,
    bytes_copied: AtomicU64,
}

impl TransferMetrics {
    /// Copies currently in flight
    pub fn active_copies(&self) -> usize {
        self.active_copies.load(Ordering::SeqCst)
    }

    /// Highest number of copies ever in flight at once
    pub fn peak_concurrent(&self) -> usize {
        self.peak_concurrent.load(Ordering::SeqCst)
    }

    /// Total bytes transferred
    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    fn enter_copy(&self) {
        let active = self.active_copies.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent.fetch_max(active, Ordering::SeqCst);
    }

    fn leave_copy(&self) {
        self.active_copies.fetch_sub(1, Ordering::SeqCst);
    }
}

/// File I/O primitives with per-side buffer budgets
#[derive(Debug, Clone)]
pub struct StorageAccess {
    read_buffer_size: usize,
    write_buffer_size: usize,
    metrics: Arc<TransferMetrics>,
}

impl StorageAccess {
    /// Create a storage accessor with the given read/write buffer sizes
    pub fn new(read_buffer_size: usize, write_buffer_size: usize) -> Self {
        Self {
            read_buffer_size: read_buffer_size.max(1),
            write_buffer_size: write_buffer_size.max(1),
            metrics: Arc::new(TransferMetrics::default()),
        }
    }

    /// Shared transfer counters
    pub fn metrics(&self) -> Arc<TransferMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Stat a path; a missing path is an error
    pub fn stat(&self, path: &Path) -> Result<FileStat> {
        let metadata = fs::metadata(path).map_err(|e| BackupError::unreadable(path, e))?;
        let modified = metadata
            .modified()
            .map_err(|e| BackupError::unreadable(path, e))?;
        Ok(FileStat {
            size: metadata.len(),
            mode: mode_of(&metadata),
            modified_at: DateTime::<Utc>::from(modified),
        })
    }

    /// Stat a path, distinguishing "missing" from real failures
    pub fn try_stat(&self, path: &Path) -> Result<Option<FileStat>> {
        match fs::metadata(path) {
            Ok(metadata) => {
                let modified = metadata
                    .modified()
                    .map_err(|e| BackupError::unreadable(path, e))?;
                Ok(Some(FileStat {
                    size: metadata.len(),
                    mode: mode_of(&metadata),
                    modified_at: DateTime::<Utc>::from(modified),
                }))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackupError::unreadable(path, e)),
        }
    }

    /// Open a file for streaming reads
    pub fn open_read(&self, path: &Path) -> Result<File> {
        File::open(path).map_err(|e| BackupError::unreadable(path, e))
    }

    /// Create `path` and any missing ancestors; idempotent
    pub fn ensure_directory(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    /// Whether the path exists
    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Whether the path is a directory
    pub fn is_directory(&self, path: &Path) -> bool {
        path.is_dir()
    }

    /// Remove a file, ignoring "already gone"
    pub fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream `src` to `dst`, observing the cancellation signal at every
    /// buffer boundary
    ///
    /// After the byte transfer the destination receives the source's
    /// permission bits and modification time. On error or cancellation the
    /// partial destination is removed before returning.
    pub fn copy(&self, src: &Path, dst: &Path, cancel: &CancellationToken) -> Result<u64> {
        let src_stat = self.stat(src)?;
        let mut reader = self.open_read(src)?;

        self.metrics.enter_copy();
        let result = self.copy_bytes(&mut reader, src, dst, cancel);
        self.metrics.leave_copy();

        let written = match result {
            Ok(written) => written,
            Err(e) => {
                self.discard_partial(dst);
                return Err(e);
            }
        };

        if let Err(e) = self.apply_metadata(dst, &src_stat) {
            self.discard_partial(dst);
            return Err(e);
        }

        self.metrics.bytes_copied.fetch_add(written, Ordering::Relaxed);
        debug!(src = %src.display(), dst = %dst.display(), bytes = written, "copied file");
        Ok(written)
    }

    fn copy_bytes(
        &self,
        reader: &mut File,
        src: &Path,
        dst: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let file = File::create(dst).map_err(|e| BackupError::copy(src, dst, e))?;
        let mut writer = BufWriter::with_capacity(self.write_buffer_size, file);
        let mut buffer = vec![0u8; self.read_buffer_size];
        let mut written: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                trace!(dst = %dst.display(), "copy cancelled at buffer boundary");
                return Err(BackupError::Cancelled);
            }

            let read = reader
                .read(&mut buffer)
                .map_err(|e| BackupError::copy(src, dst, e))?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .map_err(|e| BackupError::copy(src, dst, e))?;
            written += read as u64;
        }

        let file = writer
            .into_inner()
            .map_err(|e| BackupError::copy(src, dst, e.into_error()))?;
        file.sync_all().map_err(|e| BackupError::copy(src, dst, e))?;
        Ok(written)
    }

    /// Apply the source's permission bits and modification time to `dst`
    fn apply_metadata(&self, dst: &Path, src_stat: &FileStat) -> Result<()> {
        set_mode(dst, src_stat.mode)?;
        let mtime = FileTime::from_system_time(SystemTime::from(src_stat.modified_at));
        filetime::set_file_mtime(dst, mtime)?;
        Ok(())
    }

    fn discard_partial(&self, dst: &Path) {
        if let Err(e) = fs::remove_file(dst) {
            if e.kind() != ErrorKind::NotFound {
                warn!(dst = %dst.display(), error = %e, "failed to remove partial destination");
            }
        }
    }
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}
