//! Snapshot restoration
//!
//! Restores mirror a snapshot back into a target directory, preserving
//! modes, ownership and timestamps. The default is a *merge*: entries from
//! the snapshot are added or overwritten, and anything else in the target
//! is left alone. Full-replace mode additionally deletes target entries
//! with no counterpart in the snapshot.
//!
//! A restore is deliberately not atomic with respect to the target; it is
//! interactive and often partial. Individual file failures are collected
//! in the report rather than aborting the run; the report's status is
//! `PartialRestore` when any file failed.

use crate::compare::CompareEngine;
use crate::config::{self, Config};
use crate::error::{CheckpointError, Result};
use crate::exclude::PatternFilter;
use crate::metadata::{self, METADATA_FILE};
use crate::platform::{self, relative_to};
use crate::types::{RestoreAction, RestoreOptions, RestoreReport, SnapshotName};
use filetime::FileTime;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Restore engine bound to one backup root.
#[derive(Debug)]
pub struct RestoreEngine {
    root: PathBuf,
    config: Config,
}

impl RestoreEngine {
    /// Bind an engine to a backup root.
    pub fn new(root: &Path, config: Config) -> Result<Self> {
        Ok(Self {
            root: platform::canonicalize(root)?,
            config,
        })
    }

    /// Restore a snapshot into its target.
    ///
    /// The target defaults to the `SOURCE` recorded in the snapshot's
    /// metadata. Restores do not take the root lock: they only read from
    /// the root, and atomic publishing guarantees they see whole
    /// snapshots.
    #[instrument(skip(self, options), fields(root = %self.root.display()))]
    pub fn restore(&self, name: &SnapshotName, options: &RestoreOptions) -> Result<RestoreReport> {
        let snapshot_dir = self.root.join(name.as_str());
        if !snapshot_dir.is_dir() {
            return Err(CheckpointError::SnapshotNotFound(name.as_str().to_string()));
        }

        let target = self.resolve_target(&snapshot_dir, options)?;
        let filter = PatternFilter::new(&options.patterns)?;

        let pre_diff = if options.diff_first {
            let compare = CompareEngine::new(&options.patterns, false)?;
            let report = compare.snapshot_vs_live(&snapshot_dir, &target)?;
            info!(summary = %report.summary(), "pre-restore comparison");

            let question = format!(
                "Restore {} into {}? ({})",
                name,
                target.display(),
                report.summary()
            );
            let confirmed = config::confirm(
                &question,
                Duration::from_secs(options.confirm_timeout_secs),
                self.config.auto_confirm,
            )?;
            if !confirmed {
                return Err(CheckpointError::Cancelled(
                    "restore declined at confirmation".to_string(),
                ));
            }
            Some(report)
        } else {
            None
        };

        // Plan: what the snapshot provides, and what a full replace kills
        let entries = collect_entries(&snapshot_dir, &filter)?;
        let mut actions: Vec<(PathBuf, RestoreAction)> = Vec::with_capacity(entries.len());
        for rel in entries.keys() {
            let action = if target.join(rel).symlink_metadata().is_ok() {
                RestoreAction::Overwrite
            } else {
                RestoreAction::Create
            };
            actions.push((rel.clone(), action));
        }
        if options.full_replace {
            for rel in collect_entries(&target, &filter)?.keys() {
                if !entries.contains_key(rel) {
                    actions.push((rel.clone(), RestoreAction::Delete));
                }
            }
        }

        let mut report = RestoreReport {
            snapshot: name.clone(),
            target: target.clone(),
            dry_run: options.dry_run,
            actions,
            bytes_written: 0,
            failed: Vec::new(),
            pre_diff,
        };
        if options.dry_run {
            debug!(planned = report.actions.len(), "dry run; target untouched");
            return Ok(report);
        }

        fs::create_dir_all(&target)?;
        let mut restored_dirs: BTreeMap<PathBuf, ()> = BTreeMap::new();
        for (rel, action) in report.actions.clone() {
            let outcome = match action {
                RestoreAction::Delete => remove_entry(&target.join(&rel)),
                _ => self
                    .restore_entry(&snapshot_dir, &target, &rel, entries[&rel])
                    .map(|bytes| {
                        report.bytes_written += bytes;
                        for ancestor in rel.ancestors().skip(1) {
                            if !ancestor.as_os_str().is_empty() {
                                restored_dirs.insert(ancestor.to_path_buf(), ());
                            }
                        }
                    }),
            };
            if let Err(e) = outcome {
                warn!(path = %rel.display(), error = %e, "restore entry failed");
                report.failed.push((rel, e.to_string()));
            }
        }

        // Copy directory modes and mtimes for everything we touched
        for dir in restored_dirs.keys() {
            let src = snapshot_dir.join(dir);
            let dst = target.join(dir);
            if let (Ok(meta), true) = (fs::symlink_metadata(&src), dst.is_dir()) {
                let _ = platform::set_mode(&dst, platform::mode_of(&meta));
                let _ = platform::copy_ownership(&meta, &dst);
                let _ =
                    filetime::set_file_mtime(&dst, FileTime::from_last_modification_time(&meta));
            }
        }

        info!(summary = %report.summary(), "restore finished");
        Ok(report)
    }

    fn resolve_target(&self, snapshot_dir: &Path, options: &RestoreOptions) -> Result<PathBuf> {
        if let Some(target) = &options.target {
            return Ok(target.clone());
        }
        let record = metadata::read(snapshot_dir).map_err(|_| {
            CheckpointError::internal(
                "snapshot has no readable metadata; pass an explicit target".to_string(),
            )
        })?;
        match record.get(metadata::keys::SOURCE) {
            Some(source) if !source.is_empty() => Ok(PathBuf::from(source)),
            _ => Err(CheckpointError::internal(
                "snapshot metadata records no SOURCE; pass an explicit target".to_string(),
            )),
        }
    }

    fn restore_entry(
        &self,
        snapshot_dir: &Path,
        target: &Path,
        rel: &Path,
        kind: EntryKind,
    ) -> Result<u64> {
        let src = snapshot_dir.join(rel);
        let dst = target.join(rel);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        // Overwrite semantics: replace whatever sits at the destination
        remove_entry(&dst)?;

        match kind {
            EntryKind::Symlink => {
                let link_target = fs::read_link(&src)?;
                make_symlink(&link_target, &dst)?;
                let meta = fs::symlink_metadata(&src)?;
                platform::copy_ownership(&meta, &dst)?;
                Ok(0)
            }
            EntryKind::File => {
                let bytes = fs::copy(&src, &dst)?;
                let meta = fs::symlink_metadata(&src)?;
                platform::set_mode(&dst, platform::mode_of(&meta))?;
                platform::copy_ownership(&meta, &dst)?;
                filetime::set_file_mtime(&dst, FileTime::from_last_modification_time(&meta))?;
                Ok(bytes)
            }
        }
    }
}

/// Comparable restore payloads inside a snapshot or target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Symlink,
}

/// Collect restorable entries (files and symlinks) of a tree, filtered.
fn collect_entries(root: &Path, filter: &PatternFilter) -> Result<BTreeMap<PathBuf, EntryKind>> {
    let mut entries = BTreeMap::new();
    if !root.exists() {
        return Ok(entries);
    }
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
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
    Ok(entries)
}

/// Remove a file or symlink if present; directories are left alone.
fn remove_entry(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => {
            fs::remove_file(path)?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)?;
    } else {
        std::os::windows::fs::symlink_file(target, link)?;
    }
    Ok(())
}
