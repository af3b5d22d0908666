//! Three-level validation ladder
//!
//! The comparator decides, for one [`FilePair`], whether source and target
//! are equivalent. Validation runs as a strict ladder:
//!
//! 1. **Existence gate** - a missing target short-circuits to
//!    [`Verdict::Missing`]; an unreadable source stops the comparison.
//! 2. **Metadata gate** (always) - sizes must match and modification times
//!    must agree within the 2-second tolerance. `Quick` stops here.
//! 3. **Prefix gate** (`Standard` and `Deep`) - both sides are hashed over
//!    the configured prefix length.
//! 4. **Full-content gate** (`Deep`) - both sides are hashed in full.
//!
//! A higher gate is entered only after every lower gate reports equivalence,
//! and the verdict always carries the highest level actually executed - so a
//! `Differ(Quick)` means no hash was ever computed for the pair.
//!
//! When the journal holds a fingerprint whose size, modification time, and
//! quick hash all match the current source, and the target's metadata agrees,
//! the comparator returns `Match(Standard)` without re-hashing the target.
//! This trusts the journal: a target mutated behind the journal's back since
//! the recorded run is not detected on that path.
//!
//! The 2-second tolerance absorbs filesystems that round modification times
//! to 1- or 2-second resolution without masking real edits within a session.

use crate::error::Result;
use crate::hasher::Hasher;
use crate::journal::Journal;
use crate::storage::{FileStat, StorageAccess};
use crate::types::{CompareErrorKind, FilePair, ValidationLevel, Verdict};
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

/// Maximum modification-time difference still considered "equal"
pub const MODTIME_TOLERANCE_SECS: i64 = 2;

/// A verdict together with the source hashes computed on the way to it
///
/// The orchestrator reuses these for journal records instead of re-reading
/// the source.
#[derive(Debug, Clone)]
pub struct Comparison {
    /// The conclusion
    pub verdict: Verdict,
    /// Fresh source metadata, when the source was readable
    pub source_stat: Option<FileStat>,
    /// Source prefix hash, when the ladder computed one
    pub source_quick_hash: Option<String>,
    /// Source full hash, when the ladder computed one
    pub source_full_hash: Option<String>,
}

impl Comparison {
    fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            source_stat: None,
            source_quick_hash: None,
            source_full_hash: None,
        }
    }
}

/// Validation ladder over file pairs
#[derive(Debug, Clone)]
pub struct Comparator {
    hasher: Hasher,
    level: ValidationLevel,
    prefix_bytes: u64,
}

impl Comparator {
    /// Create a comparator for the given target level and prefix length
    pub fn new(hasher: Hasher, level: ValidationLevel, prefix_bytes: u64) -> Self {
        Self {
            hasher,
            level,
            prefix_bytes,
        }
    }

    /// The level this comparator escalates to
    pub fn level(&self) -> ValidationLevel {
        self.level
    }

    /// Run the ladder for one pair
    ///
    /// `journal`, when present, enables the fingerprint shortcut and receives
    /// integrity-anomaly reports. Per-file failures surface as
    /// [`Verdict::Error`]; this method itself never fails.
    pub fn compare(
        &self,
        pair: &FilePair,
        storage: &StorageAccess,
        journal: Option<&Journal>,
    ) -> Comparison {
        // Existence gate.
        let source_stat = match storage.stat(&pair.source_path) {
            Ok(stat) => stat,
            Err(e) => {
                return Comparison::new(Verdict::Error {
                    kind: CompareErrorKind::SourceUnreadable,
                    message: e.to_string(),
                })
            }
        };

        let target_stat = match storage.try_stat(&pair.target_path) {
            Ok(Some(stat)) => stat,
            Ok(None) => {
                let mut comparison = Comparison::new(Verdict::Missing);
                comparison.source_stat = Some(source_stat);
                return comparison;
            }
            Err(e) => {
                let mut comparison = Comparison::new(Verdict::Error {
                    kind: CompareErrorKind::TargetUnreadable,
                    message: e.to_string(),
                });
                comparison.source_stat = Some(source_stat);
                return comparison;
            }
        };

        let mut comparison = Comparison::new(Verdict::Match(ValidationLevel::Quick));
        comparison.source_stat = Some(source_stat);

        match self.run_ladder(pair, &source_stat, &target_stat, journal, &mut comparison) {
            Ok(verdict) => comparison.verdict = verdict,
            Err(e) => {
                comparison.verdict = Verdict::Error {
                    kind: CompareErrorKind::HashFailed,
                    message: e.to_string(),
                }
            }
        }

        trace!(
            path = %pair.relative_path,
            verdict = %comparison.verdict,
            level = %self.level,
            "comparison complete"
        );
        comparison
    }

    fn run_ladder(
        &self,
        pair: &FilePair,
        source: &FileStat,
        target: &FileStat,
        journal: Option<&Journal>,
        comparison: &mut Comparison,
    ) -> Result<Verdict> {
        // Metadata gate, always executed.
        if source.size != target.size {
            return Ok(Verdict::Differ(ValidationLevel::Quick));
        }
        if !within_tolerance(source.modified_at, target.modified_at) {
            return Ok(Verdict::Differ(ValidationLevel::Quick));
        }
        if self.level == ValidationLevel::Quick {
            return Ok(Verdict::Match(ValidationLevel::Quick));
        }

        // Journal-assisted shortcut: a recorded fingerprint that still
        // matches the live source lets us skip hashing the target.
        if let Some(journal) = journal {
            if let Some(shortcut) = self.try_journal_shortcut(pair, source, journal, comparison)? {
                return Ok(shortcut);
            }
        }

        // Prefix gate.
        let source_prefix = match &comparison.source_quick_hash {
            Some(hash) => hash.clone(),
            None => {
                let hash = self.hasher.prefix_hash(&pair.source_path, self.prefix_bytes)?;
                comparison.source_quick_hash = Some(hash.clone());
                hash
            }
        };
        let target_prefix = self.hasher.prefix_hash(&pair.target_path, self.prefix_bytes)?;
        if source_prefix != target_prefix {
            return Ok(Verdict::Differ(ValidationLevel::Standard));
        }
        if self.level == ValidationLevel::Standard {
            return Ok(Verdict::Match(ValidationLevel::Standard));
        }

        // Full-content gate.
        let source_full = self.hasher.full_hash(&pair.source_path)?;
        comparison.source_full_hash = Some(source_full.clone());
        if let Some(journal) = journal {
            if let Some(fingerprint) = journal.fingerprint_of(&pair.relative_path) {
                report_anomaly_if_any(journal, pair, source, Some(&source_full), &fingerprint);
            }
        }
        let target_full = self.hasher.full_hash(&pair.target_path)?;
        if source_full != target_full {
            return Ok(Verdict::Differ(ValidationLevel::Deep));
        }
        Ok(Verdict::Match(ValidationLevel::Deep))
    }

    /// Attempt the fingerprint shortcut; `Ok(Some(..))` ends the ladder
    fn try_journal_shortcut(
        &self,
        pair: &FilePair,
        source: &FileStat,
        journal: &Journal,
        comparison: &mut Comparison,
    ) -> Result<Option<Verdict>> {
        let Some(fingerprint) = journal.fingerprint_of(&pair.relative_path) else {
            return Ok(None);
        };
        let Some(recorded_quick) = fingerprint.quick_hash.clone() else {
            return Ok(None);
        };
        if fingerprint.size != source.size
            || !within_tolerance(fingerprint.modified_at, source.modified_at)
        {
            // An unchanged mtime with moved metadata is worth flagging even
            // though the ladder proceeds normally.
            report_anomaly_if_any(journal, pair, source, None, &fingerprint);
            return Ok(None);
        }

        let current_quick = self.hasher.prefix_hash(&pair.source_path, self.prefix_bytes)?;
        comparison.source_quick_hash = Some(current_quick.clone());

        if current_quick == recorded_quick {
            debug!(path = %pair.relative_path, "fingerprint shortcut hit");
            comparison.source_full_hash = fingerprint.full_hash.clone();
            return Ok(Some(Verdict::Match(ValidationLevel::Standard)));
        }

        if source.modified_at.timestamp() == fingerprint.modified_at.timestamp() {
            journal.report_integrity_issue(
                &pair.relative_path,
                vec!["content changed without modification".to_string()],
                format!(
                    "recorded quick hash {} no longer matches",
                    short_hash(&recorded_quick)
                ),
            );
        }
        Ok(None)
    }
}

/// Flag content that moved underneath an unchanged modification time
fn report_anomaly_if_any(
    journal: &Journal,
    pair: &FilePair,
    source: &FileStat,
    source_full_hash: Option<&str>,
    fingerprint: &crate::types::FileFingerprint,
) {
    if source.modified_at.timestamp() != fingerprint.modified_at.timestamp() {
        return;
    }

    let mut issues = Vec::new();
    if source.size != fingerprint.size {
        issues.push("size changed without modification".to_string());
    }
    if let (Some(current), Some(recorded)) = (source_full_hash, fingerprint.full_hash.as_deref()) {
        if current != recorded {
            issues.push("content changed without modification".to_string());
        }
    }

    if !issues.is_empty() {
        journal.report_integrity_issue(
            &pair.relative_path,
            issues,
            format!("recorded size {}, current size {}", fingerprint.size, source.size),
        );
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

/// Whether two timestamps agree within the modtime tolerance
pub fn within_tolerance(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a.timestamp() - b.timestamp()).abs() <= MODTIME_TOLERANCE_SECS
}
