//! Core data types used throughout the checkpoint library
//!
//! This module contains the structures shared across subsystems: snapshot
//! names and their validation rules, operation options, retention rules,
//! and the report types returned by the comparison, restore, verification
//! and pruning verbs. Reports derive `serde` so the external output layer
//! can render them as tables or JSON without reaching into engine state.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{CheckpointError, Result};

/// Characters legal in a snapshot-name suffix.
fn is_suffix_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// A validated snapshot name: `YYYYMMDD_HHMMSS` with an optional
/// `_<suffix>` tail.
///
/// Names sort chronologically because the timestamp is zero-padded and
/// lexicographic order equals creation order. The name is the authoritative
/// record of creation time; directory mtimes are unreliable after copies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotName(String);

impl SnapshotName {
    /// Parse and validate a snapshot name.
    ///
    /// The accepted shape is
    /// `^20\d{2}[01]\d[0-3]\d_[0-2]\d[0-5]\d[0-5]\d(_[A-Za-z0-9._-]+)?$`.
    pub fn parse(name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        let invalid = || CheckpointError::InvalidCheckpointId(name.to_string());

        if bytes.len() < 15 {
            return Err(invalid());
        }
        let digit = |i: usize| bytes[i].is_ascii_digit();
        let in_range = |i: usize, lo: u8, hi: u8| bytes[i] >= lo && bytes[i] <= hi;

        let timestamp_ok = bytes[0] == b'2'
            && bytes[1] == b'0'
            && digit(2)
            && digit(3)
            && in_range(4, b'0', b'1')
            && digit(5)
            && in_range(6, b'0', b'3')
            && digit(7)
            && bytes[8] == b'_'
            && in_range(9, b'0', b'2')
            && digit(10)
            && in_range(11, b'0', b'5')
            && digit(12)
            && in_range(13, b'0', b'5')
            && digit(14);
        if !timestamp_ok {
            return Err(invalid());
        }

        if bytes.len() > 15 {
            if bytes[15] != b'_' || bytes.len() == 16 {
                return Err(invalid());
            }
            if !name[16..].chars().all(is_suffix_char) {
                return Err(invalid());
            }
        }

        Ok(SnapshotName(name.to_string()))
    }

    /// Build a name from a timestamp and an optional raw suffix.
    ///
    /// The suffix is sanitised at ingress: characters outside
    /// `[A-Za-z0-9._-]` are stripped. A suffix that sanitises to nothing is
    /// rejected with `InvalidSuffix`.
    pub fn from_parts(timestamp: &str, suffix: Option<&str>) -> Result<Self> {
        let name = match suffix {
            None => timestamp.to_string(),
            Some(raw) => {
                let clean = sanitize_suffix(raw);
                if clean.is_empty() {
                    return Err(CheckpointError::InvalidSuffix(raw.to_string()));
                }
                format!("{}_{}", timestamp, clean)
            }
        };
        Self::parse(&name)
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `_suffix` tail, if any.
    pub fn suffix(&self) -> Option<&str> {
        if self.0.len() > 16 {
            Some(&self.0[16..])
        } else {
            None
        }
    }

    /// Creation instant recovered from the name.
    ///
    /// `None` only for names that pass the shape check but not calendar
    /// validation (e.g. day 39); the engine never generates such names.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.0[..15], "%Y%m%d_%H%M%S").ok()
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip all characters outside `[A-Za-z0-9._-]` from a raw suffix.
pub fn sanitize_suffix(raw: &str) -> String {
    raw.chars().filter(|c| is_suffix_char(*c)).collect()
}

/// Retention rule for pruning old snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionRule {
    /// Keep the N most recent snapshots
    KeepCount(usize),
    /// Keep snapshots younger than D days (by name timestamp)
    MaxAgeDays(u32),
}

/// Options for snapshot creation.
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Human description recorded under `DESCRIPTION`
    pub description: Option<String>,
    /// Raw suffix; sanitised into the snapshot name
    pub suffix: Option<String>,
    /// User tags appended to the metadata record
    pub tags: Vec<(String, String)>,
    /// Hardlink unchanged files against the most recent prior snapshot
    pub hardlink: bool,
    /// Verify the populated stage against the source before publishing
    pub verify: bool,
    /// Retention rule applied after a successful publish
    pub retain: Option<RetentionRule>,
    /// Seconds to wait on a contended lock
    pub lock_timeout_secs: u64,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            description: None,
            suffix: None,
            tags: Vec::new(),
            hardlink: true,
            verify: false,
            retain: None,
            lock_timeout_secs: 30,
        }
    }
}

/// Which sides a comparison ran against; determines how the `OnlyIn*`
/// classes read in rendered output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareMode {
    /// Snapshot (left) against the live tree (right)
    SnapshotVsLive,
    /// Older snapshot (left) against newer snapshot (right)
    SnapshotVsSnapshot,
}

/// Classification of a single entry in a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryClass {
    /// Present on both sides with identical content
    Identical,
    /// Present on both sides with differing content
    Differs,
    /// Present only on the left side
    OnlyInLeft,
    /// Present only on the right side
    OnlyInRight,
    /// Could not be read on at least one side
    Inaccessible,
}

impl EntryClass {
    /// Human label for this class under the given mode.
    pub fn describe(&self, mode: CompareMode) -> &'static str {
        match (self, mode) {
            (EntryClass::Identical, _) => "identical",
            (EntryClass::Differs, _) => "differs",
            (EntryClass::Inaccessible, _) => "inaccessible",
            (EntryClass::OnlyInLeft, CompareMode::SnapshotVsLive) => "only in snapshot",
            (EntryClass::OnlyInRight, CompareMode::SnapshotVsLive) => "only in live",
            (EntryClass::OnlyInLeft, CompareMode::SnapshotVsSnapshot) => "only in first",
            (EntryClass::OnlyInRight, CompareMode::SnapshotVsSnapshot) => "only in second",
        }
    }
}

/// One classified entry in a comparison report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparedEntry {
    /// Path relative to the compared roots
    pub path: PathBuf,
    /// Outcome of the comparison
    pub class: EntryClass,
}

/// Rendered diff of one differing file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    /// Path relative to the compared roots
    pub path: PathBuf,
    /// Binary files are counted but carry no diff body
    pub is_binary: bool,
    /// Unified diff text, absent for binary files
    pub unified: Option<String>,
}

/// Structured result of a comparison run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareReport {
    /// Left-hand root of the comparison
    pub left: PathBuf,
    /// Right-hand root of the comparison
    pub right: PathBuf,
    /// Which sides were compared
    pub mode: CompareMode,
    /// Every classified entry
    pub entries: Vec<ComparedEntry>,
    /// Unified diffs of differing files (detailed runs only)
    pub diffs: Vec<FileDiff>,
    /// Per-file errors that did not abort the scan
    pub errors: Vec<String>,
}

impl CompareReport {
    /// Count entries with the given class.
    pub fn count(&self, class: EntryClass) -> usize {
        self.entries.iter().filter(|e| e.class == class).count()
    }

    /// Whether both sides matched completely.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
            && self
                .entries
                .iter()
                .all(|e| e.class == EntryClass::Identical)
    }

    /// One-line totals summary.
    pub fn summary(&self) -> String {
        format!(
            "{} identical, {} differ, {} {}, {} {}, {} inaccessible, {} errors",
            self.count(EntryClass::Identical),
            self.count(EntryClass::Differs),
            self.count(EntryClass::OnlyInLeft),
            EntryClass::OnlyInLeft.describe(self.mode),
            self.count(EntryClass::OnlyInRight),
            EntryClass::OnlyInRight.describe(self.mode),
            self.count(EntryClass::Inaccessible),
            self.errors.len(),
        )
    }

    /// Machine-readable rendering for the external output layer.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Partial-result status: per-file errors do not abort a scan, but
    /// they do change the verb's outcome.
    pub fn status(&self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(CheckpointError::PartialComparison {
                errors: self.errors.len(),
            })
        }
    }
}

/// Options for restore operations.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Target directory; defaults to the snapshot's recorded `SOURCE`
    pub target: Option<PathBuf>,
    /// Restrict the restore to entries matching these patterns
    pub patterns: Vec<String>,
    /// Enumerate would-be changes without touching the target
    pub dry_run: bool,
    /// Run a live comparison and ask for confirmation first
    pub diff_first: bool,
    /// Delete target entries with no counterpart in the snapshot
    pub full_replace: bool,
    /// Bound on the pre-restore confirmation prompt
    pub confirm_timeout_secs: u64,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            target: None,
            patterns: Vec::new(),
            dry_run: false,
            diff_first: false,
            full_replace: false,
            confirm_timeout_secs: 30,
        }
    }
}

/// Planned or executed action on one restore entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreAction {
    /// Entry did not exist in the target
    Create,
    /// Entry existed and was (or would be) overwritten
    Overwrite,
    /// Entry removed by a full-replace restore
    Delete,
}

/// Result of a restore operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Snapshot the restore read from
    pub snapshot: SnapshotName,
    /// Directory written to
    pub target: PathBuf,
    /// Whether this was a dry run
    pub dry_run: bool,
    /// Actions taken (or planned, for dry runs), per relative path
    pub actions: Vec<(PathBuf, RestoreAction)>,
    /// Bytes written into the target
    pub bytes_written: u64,
    /// Per-file failures: path and error text
    pub failed: Vec<(PathBuf, String)>,
    /// Comparison emitted by a `diff_first` restore
    pub pre_diff: Option<CompareReport>,
}

impl RestoreReport {
    /// Number of entries restored (or planned).
    pub fn files_restored(&self) -> usize {
        self.actions
            .iter()
            .filter(|(_, a)| *a != RestoreAction::Delete)
            .count()
    }

    /// One-line totals summary.
    pub fn summary(&self) -> String {
        format!(
            "{}{} file(s), {} written, {} failed",
            if self.dry_run { "would restore " } else { "restored " },
            self.files_restored(),
            crate::platform::format_bytes(self.bytes_written),
            self.failed.len(),
        )
    }

    /// Machine-readable rendering for the external output layer.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Partial-result status: per-file failures do not abort a restore,
    /// but they do change the verb's outcome.
    pub fn status(&self) -> Result<()> {
        if self.failed.is_empty() {
            Ok(())
        } else {
            Err(CheckpointError::PartialRestore {
                failed: self.failed.len(),
            })
        }
    }
}

/// How a verification pass compared file contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyMode {
    /// Per-file digests (small trees)
    Digest,
    /// `(size, mtime)` tuples (large trees)
    SizeAndMtime,
}

/// Result of verifying a snapshot against its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Snapshot that was verified
    pub snapshot: SnapshotName,
    /// Entries examined across both trees
    pub entries_checked: usize,
    /// Comparison strategy used
    pub mode: VerifyMode,
    /// Mismatched paths with a short reason each
    pub mismatches: Vec<(PathBuf, String)>,
}

impl VerifyReport {
    /// Whether every entry matched.
    pub fn is_valid(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// One-line totals summary.
    pub fn summary(&self) -> String {
        format!(
            "{} entries checked, {} mismatch(es)",
            self.entries_checked,
            self.mismatches.len()
        )
    }
}

/// Result of a retention run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneReport {
    /// Snapshots present before pruning
    pub examined: usize,
    /// Snapshots removed, oldest first
    pub deleted: Vec<SnapshotName>,
}

impl PruneReport {
    /// One-line totals summary.
    pub fn summary(&self) -> String {
        format!("{} snapshot(s) examined, {} removed", self.examined, self.deleted.len())
    }
}
