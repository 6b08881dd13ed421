//! Snapshot comparison engine
//!
//! Two modes: a snapshot against the live source tree, and one snapshot
//! against another. Every entry reachable on either side is classified;
//! per-file read errors never abort the scan; they land in the report's
//! error list as `Inaccessible` entries, and the report's status becomes
//! `PartialComparison`.
//!
//! Broken symlinks compare by target string, binary files count as
//! differing without a diff body, and the snapshot's own `.metadata`
//! record is invisible to the comparison.

use crate::diff::{self, DiffRenderer};
use crate::error::Result;
use crate::exclude::PatternFilter;
use crate::metadata::METADATA_FILE;
use crate::platform::relative_to;
use crate::types::{CompareMode, CompareReport, ComparedEntry, EntryClass, FileDiff};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

/// What a tree walk learned about one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Symlink,
    Unreadable,
}

/// Comparison engine with a fixed pattern filter and diff strategy.
#[derive(Debug)]
pub struct CompareEngine {
    filter: PatternFilter,
    detailed: bool,
    renderer: DiffRenderer,
}

impl CompareEngine {
    /// Build an engine. A non-empty `patterns` list restricts the
    /// comparison to matching relative paths; `detailed` adds unified
    /// diffs for differing text files.
    pub fn new(patterns: &[String], detailed: bool) -> Result<Self> {
        Ok(Self {
            filter: PatternFilter::new(patterns)?,
            detailed,
            renderer: DiffRenderer::detect(),
        })
    }

    /// Replace the detected diff strategy (used by embedders and tests).
    pub fn with_renderer(mut self, renderer: DiffRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Compare a snapshot against a live directory.
    #[instrument(skip(self))]
    pub fn snapshot_vs_live(&self, snapshot_dir: &Path, live_dir: &Path) -> Result<CompareReport> {
        self.compare_trees(snapshot_dir, live_dir, CompareMode::SnapshotVsLive)
    }

    /// Compare two snapshots. Symmetrical: entries only in the first are
    /// `OnlyInLeft`, entries only in the second `OnlyInRight`.
    #[instrument(skip(self))]
    pub fn snapshot_vs_snapshot(&self, first: &Path, second: &Path) -> Result<CompareReport> {
        self.compare_trees(first, second, CompareMode::SnapshotVsSnapshot)
    }

    fn compare_trees(&self, left: &Path, right: &Path, mode: CompareMode) -> Result<CompareReport> {
        let mut errors = Vec::new();
        let left_entries = scan_tree(left, &self.filter, &mut errors);
        let right_entries = scan_tree(right, &self.filter, &mut errors);

        let mut paths: Vec<&PathBuf> = left_entries.keys().collect();
        for path in right_entries.keys() {
            if !left_entries.contains_key(path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut entries = Vec::with_capacity(paths.len());
        let mut diffs = Vec::new();
        for path in paths {
            let class = match (left_entries.get(path), right_entries.get(path)) {
                (Some(EntryKind::Unreadable), _) | (_, Some(EntryKind::Unreadable)) => {
                    EntryClass::Inaccessible
                }
                (Some(l), Some(r)) => {
                    match classify_pair(left, right, path, *l, *r) {
                        Ok(class) => class,
                        Err(e) => {
                            errors.push(format!("{}: {}", path.display(), e));
                            EntryClass::Inaccessible
                        }
                    }
                }
                (Some(_), None) => EntryClass::OnlyInLeft,
                (None, Some(_)) => EntryClass::OnlyInRight,
                (None, None) => continue,
            };

            if class == EntryClass::Differs && self.detailed {
                match self.render_diff(left, right, path) {
                    Ok(file_diff) => diffs.push(file_diff),
                    Err(e) => errors.push(format!("{}: diff failed: {}", path.display(), e)),
                }
            }
            entries.push(ComparedEntry {
                path: path.clone(),
                class,
            });
        }

        let report = CompareReport {
            left: left.to_path_buf(),
            right: right.to_path_buf(),
            mode,
            entries,
            diffs,
            errors,
        };
        debug!(summary = %report.summary(), "comparison complete");
        Ok(report)
    }

    fn render_diff(&self, left: &Path, right: &Path, rel: &Path) -> Result<FileDiff> {
        let left_path = left.join(rel);
        let right_path = right.join(rel);
        let old = fs::read(&left_path)?;
        let new = fs::read(&right_path)?;

        if diff::is_binary(&old) || diff::is_binary(&new) {
            return Ok(FileDiff {
                path: rel.to_path_buf(),
                is_binary: true,
                unified: None,
            });
        }

        let unified = self.renderer.unified(
            &left_path.display().to_string(),
            &right_path.display().to_string(),
            &left_path,
            &right_path,
            &old,
            &new,
        )?;
        Ok(FileDiff {
            path: rel.to_path_buf(),
            is_binary: false,
            unified: Some(unified),
        })
    }
}

/// Collect the comparable entries (files and symlinks) of one tree.
///
/// Walk errors are recorded, not raised; an unreadable directory yields an
/// `Unreadable` marker so its entries are never reported as missing.
fn scan_tree(
    root: &Path,
    filter: &PatternFilter,
    errors: &mut Vec<String>,
) -> BTreeMap<PathBuf, EntryKind> {
    let mut entries = BTreeMap::new();
    if !root.exists() {
        return entries;
    }
    for entry in WalkDir::new(root).follow_links(false) {
        match entry {
            Ok(entry) => {
                let rel = relative_to(root, entry.path());
                if rel.as_os_str().is_empty() || rel == Path::new(METADATA_FILE) {
                    continue;
                }
                let kind = if entry.file_type().is_symlink() {
                    EntryKind::Symlink
                } else if entry.file_type().is_file() {
                    EntryKind::File
                } else {
                    continue;
                };
                if filter.matches(&rel) {
                    entries.insert(rel, kind);
                }
            }
            Err(e) => {
                let detail = e
                    .path()
                    .map(|p| relative_to(root, p))
                    .unwrap_or_else(|| PathBuf::from("?"));
                warn!(path = %detail.display(), error = %e, "unreadable entry during comparison");
                errors.push(format!("{}: {}", detail.display(), e));
                entries.insert(detail, EntryKind::Unreadable);
            }
        }
    }
    entries
}

/// Compare one path present on both sides.
fn classify_pair(
    left: &Path,
    right: &Path,
    rel: &Path,
    left_kind: EntryKind,
    right_kind: EntryKind,
) -> Result<EntryClass> {
    let left_path = left.join(rel);
    let right_path = right.join(rel);

    match (left_kind, right_kind) {
        (EntryKind::Symlink, EntryKind::Symlink) => {
            // Broken or not, symlinks compare by target string
            let l = fs::read_link(&left_path)?;
            let r = fs::read_link(&right_path)?;
            Ok(if l == r {
                EntryClass::Identical
            } else {
                EntryClass::Differs
            })
        }
        (EntryKind::File, EntryKind::File) => {
            let left_meta = fs::symlink_metadata(&left_path)?;
            let right_meta = fs::symlink_metadata(&right_path)?;
            if left_meta.len() != right_meta.len() {
                return Ok(EntryClass::Differs);
            }
            let l = fs::read(&left_path)?;
            let r = fs::read(&right_path)?;
            Ok(if l == r {
                EntryClass::Identical
            } else {
                EntryClass::Differs
            })
        }
        _ => Ok(EntryClass::Differs),
    }
}
