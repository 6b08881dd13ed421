//! Snapshot creation and verification
//!
//! The engine produces immutable, timestamp-named snapshots of a source
//! tree under a backup root. Creation is atomic from the outside: the tree
//! is mirrored into a hidden stage directory (`.tmp.<token>`) and a single
//! rename publishes it under its final name. No observer ever sees a
//! partially-populated snapshot: before the rename the name does not
//! exist, after it the snapshot is complete.
//!
//! When hardlinking is enabled, files unchanged since the most recent prior
//! snapshot are hardlinked to that snapshot's copy instead of duplicated.
//! The identity test is deliberately strict: same size, same modification
//! time, and byte-identical content, cheapest check first.
//!
//! ## Creation pipeline
//!
//! ```text
//! INIT -> LOCKED -> STAGING -> STAGED -> VERIFYING -> PUBLISHED -> DONE
//! ```
//!
//! Every error path funnels through the cleanup coordinator, which removes
//! the stage and releases the lock; terminal states always end at `DONE`
//! with the lock released.

use crate::checksum::ChecksumProvider;
use crate::cleanup;
use crate::config::{self, Config};
use crate::error::{CheckpointError, Result};
use crate::exclude::ExclusionMatcher;
use crate::lock;
use crate::metadata::{self, MetadataRecord, METADATA_FILE};
use crate::platform::{self, relative_to};
use crate::retention;
use crate::types::{SnapshotName, SnapshotOptions, VerifyMode, VerifyReport};
use filetime::FileTime;
use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Prefix of in-progress stage directories inside a backup root.
pub const STAGE_PREFIX: &str = ".tmp.";

/// Trees with more entries than this are verified by `(size, mtime)`
/// instead of per-file digests, to bound verification I/O.
pub const VERIFY_DIGEST_LIMIT: usize = 100;

/// Free-space headroom: a snapshot needs source size plus ten percent.
fn required_space_kb(source_kb: u64) -> u64 {
    source_kb + source_kb / 10
}

/// Snapshot engine bound to one source directory and one backup root.
#[derive(Debug)]
pub struct SnapshotEngine {
    source: PathBuf,
    root: PathBuf,
    matcher: ExclusionMatcher,
    checksum: ChecksumProvider,
    config: Config,
}

impl SnapshotEngine {
    /// Bind an engine to `source` and `root`.
    ///
    /// The source must exist and be a directory; the root is created on
    /// demand (after confirmation when interactive). Both are
    /// canonicalised, and the exclusion matcher is compiled over the
    /// canonical paths so a root nested under the source can never be
    /// snapshotted into itself.
    pub fn new(
        source: &Path,
        root: &Path,
        user_patterns: &[String],
        config: Config,
    ) -> Result<Self> {
        let source = platform::canonicalize(source)
            .map_err(|_| CheckpointError::SourceUnreadable(source.to_path_buf()))?;
        if !source.is_dir() {
            return Err(CheckpointError::SourceUnreadable(source));
        }

        if !root.exists() {
            let question = format!("Backup root {} does not exist. Create it?", root.display());
            if !config::confirm(&question, config::DIR_CREATE_TIMEOUT, config.auto_confirm)? {
                return Err(CheckpointError::Cancelled(
                    "backup root creation declined".to_string(),
                ));
            }
            fs::create_dir_all(root)
                .map_err(|_| CheckpointError::RootUnwritable(root.to_path_buf()))?;
        }
        let root = platform::canonicalize(root)?;

        let matcher = ExclusionMatcher::new(&source, &root, user_patterns)?;
        let checksum = ChecksumProvider::select(config.checksum);
        Ok(Self {
            source,
            root,
            matcher,
            checksum,
            config,
        })
    }

    /// The canonical source directory.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// The canonical backup root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The configuration this engine was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create one snapshot of the source.
    ///
    /// Returns the published snapshot's name. On any failure the stage is
    /// removed and the lock released; the final name never appears.
    #[instrument(skip(self, options), fields(root = %self.root.display()))]
    pub fn create(&self, options: &SnapshotOptions) -> Result<SnapshotName> {
        cleanup::install_signal_handler();

        // Tag keys are validated before any resource is acquired
        let mut record =
            MetadataRecord::for_snapshot(&self.source, options.description.as_deref());
        for (key, value) in &options.tags {
            record.set(key, value)?;
        }

        let guard = lock::acquire(&self.root, options.lock_timeout_secs, false)?;

        let source_kb = platform::tree_size_kb(&self.source, &self.matcher)?;
        let required_kb = required_space_kb(source_kb);
        let available_kb = platform::disk_free_kb(&self.root)?;
        if available_kb < required_kb {
            return Err(CheckpointError::InsufficientSpace {
                required_kb,
                available_kb,
                root: self.root.clone(),
            });
        }

        let name =
            SnapshotName::from_parts(&platform::timestamp_now(), options.suffix.as_deref())?;

        let base = if options.hardlink {
            latest_snapshot(&self.root)?.map(|prior| self.root.join(prior.as_str()))
        } else {
            None
        };

        let token = Uuid::new_v4().simple().to_string();
        let stage = self.root.join(format!("{}{}", STAGE_PREFIX, token));
        fs::create_dir(&stage).map_err(|e| CheckpointError::stage(e.to_string()))?;
        let stage_token = cleanup::register("remove stage", {
            let stage = stage.clone();
            move || {
                let _ = fs::remove_dir_all(&stage);
            }
        });
        debug!(stage = %stage.display(), "staging snapshot");

        let result = self.populate_and_publish(&name, &stage, base.as_deref(), &record, options);
        match result {
            Ok(stats) => {
                cleanup::deregister(stage_token);
                info!(
                    snapshot = %name,
                    files = stats.files,
                    hardlinked = stats.hardlinked,
                    bytes = stats.bytes,
                    "snapshot published"
                );
            }
            Err(e) => {
                cleanup::run_now(stage_token);
                return Err(e);
            }
        }

        if let Some(rule) = options.retain {
            retention::prune_locked(&self.root, rule, true)?;
        }

        guard.release()?;
        Ok(name)
    }

    fn populate_and_publish(
        &self,
        name: &SnapshotName,
        stage: &Path,
        base: Option<&Path>,
        record: &MetadataRecord,
        options: &SnapshotOptions,
    ) -> Result<MirrorStats> {
        let stats = self.mirror_into_stage(stage, base)?;
        metadata::write(stage, record)
            .map_err(|e| CheckpointError::stage(format!("metadata write: {}", e)))?;

        if options.verify {
            let mismatches = self.compare_enumeration(&self.source, stage)?.2;
            if let Some((path, detail)) = mismatches.into_iter().next() {
                return Err(CheckpointError::VerifyMismatch { path, detail });
            }
        }

        let published = self.root.join(name.as_str());
        if published.exists() {
            return Err(CheckpointError::PublishFailed {
                name: name.as_str().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "a snapshot with this name already exists",
                ),
            });
        }
        fs::rename(stage, &published).map_err(|e| CheckpointError::PublishFailed {
            name: name.as_str().to_string(),
            source: e,
        })?;
        Ok(stats)
    }

    /// Mirror the source into the stage with archive semantics.
    fn mirror_into_stage(&self, stage: &Path, base: Option<&Path>) -> Result<MirrorStats> {
        let mut stats = MirrorStats::default();
        let mut deferred_dirs: Vec<(PathBuf, u32, FileTime)> = Vec::new();

        let mut walker = WalkDir::new(&self.source).follow_links(false).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry?;
            let rel = relative_to(&self.source, entry.path());
            if rel.as_os_str().is_empty() {
                continue;
            }
            if self.matcher.is_excluded(&rel, entry.file_type().is_dir()) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let dst = stage.join(&rel);
            let meta = entry.metadata()?;
            let stage_err =
                |e: std::io::Error| CheckpointError::stage(format!("{}: {}", rel.display(), e));

            if entry.file_type().is_dir() {
                fs::create_dir_all(&dst).map_err(stage_err)?;
                platform::copy_ownership(&meta, &dst)?;
                deferred_dirs.push((
                    dst,
                    platform::mode_of(&meta),
                    FileTime::from_last_modification_time(&meta),
                ));
            } else if entry.file_type().is_symlink() {
                let target = fs::read_link(entry.path())?;
                make_symlink(&target, &dst).map_err(stage_err)?;
                platform::copy_ownership(&meta, &dst)?;
                stats.files += 1;
            } else if entry.file_type().is_file() {
                let linked = match base {
                    Some(base_root) => {
                        self.try_hardlink(&base_root.join(&rel), entry.path(), &meta, &dst)?
                    }
                    None => false,
                };
                if linked {
                    stats.hardlinked += 1;
                } else {
                    fs::copy(entry.path(), &dst).map_err(stage_err)?;
                    platform::set_mode(&dst, platform::mode_of(&meta))?;
                    platform::copy_ownership(&meta, &dst)?;
                    filetime::set_file_mtime(&dst, FileTime::from_last_modification_time(&meta))
                        .map_err(stage_err)?;
                    stats.bytes += meta.len();
                }
                stats.files += 1;
            }
        }

        // Directory modes and mtimes last: a read-only mode applied up
        // front would block the children, and populating resets the mtime
        for (dir, mode, mtime) in deferred_dirs {
            platform::set_mode(&dir, mode)?;
            filetime::set_file_mtime(&dir, mtime)
                .map_err(|e| CheckpointError::stage(e.to_string()))?;
        }
        Ok(stats)
    }

    /// Hardlink `dst` against the base snapshot's copy when the source file
    /// is identical to it: same size, same mtime, same bytes.
    fn try_hardlink(
        &self,
        base_file: &Path,
        src: &Path,
        src_meta: &fs::Metadata,
        dst: &Path,
    ) -> Result<bool> {
        let base_meta = match fs::symlink_metadata(base_file) {
            Ok(meta) if meta.is_file() => meta,
            _ => return Ok(false),
        };
        if base_meta.len() != src_meta.len() {
            return Ok(false);
        }
        if FileTime::from_last_modification_time(&base_meta)
            != FileTime::from_last_modification_time(src_meta)
        {
            return Ok(false);
        }
        if !same_content(base_file, src)? {
            return Ok(false);
        }
        match fs::hard_link(base_file, dst) {
            Ok(()) => Ok(true),
            Err(e) => {
                // Cross-device bases cannot be linked; fall back to copying
                warn!(base = %base_file.display(), error = %e, "hardlink failed; copying");
                Ok(false)
            }
        }
    }

    /// Verify a published snapshot against the current source.
    ///
    /// Read-only: no lock is taken. The full mismatch list is returned
    /// rather than aborting on the first difference.
    #[instrument(skip(self))]
    pub fn verify(&self, name: &SnapshotName) -> Result<VerifyReport> {
        let snapshot_dir = self.root.join(name.as_str());
        if !snapshot_dir.is_dir() {
            return Err(CheckpointError::SnapshotNotFound(name.as_str().to_string()));
        }
        let (entries_checked, mode, mismatches) =
            self.compare_enumeration(&self.source, &snapshot_dir)?;
        Ok(VerifyReport {
            snapshot: name.clone(),
            entries_checked,
            mode,
            mismatches,
        })
    }

    /// Enumerate source ∪ counterpart and compare entry by entry.
    ///
    /// Size is always compared first; beyond the digest limit (or in
    /// size-only checksum mode) content comparison degrades to mtime
    /// equality.
    fn compare_enumeration(
        &self,
        source: &Path,
        counterpart: &Path,
    ) -> Result<(usize, VerifyMode, Vec<(PathBuf, String)>)> {
        let source_entries = self.enumerate(source, true)?;
        let counterpart_entries = self.enumerate(counterpart, false)?;
        let union: BTreeSet<_> = source_entries.union(&counterpart_entries).cloned().collect();

        let mode = if union.len() > VERIFY_DIGEST_LIMIT || self.checksum.is_size_only() {
            VerifyMode::SizeAndMtime
        } else {
            VerifyMode::Digest
        };

        let mut mismatches = Vec::new();
        for rel in &union {
            if !source_entries.contains(rel) {
                mismatches.push((rel.clone(), "missing from source".to_string()));
                continue;
            }
            if !counterpart_entries.contains(rel) {
                mismatches.push((rel.clone(), "missing from snapshot".to_string()));
                continue;
            }
            let src = source.join(rel);
            let snap = counterpart.join(rel);
            if let Some(detail) = self.compare_entry(&src, &snap, mode)? {
                mismatches.push((rel.clone(), detail));
            }
        }
        Ok((union.len(), mode, mismatches))
    }

    fn compare_entry(&self, src: &Path, snap: &Path, mode: VerifyMode) -> Result<Option<String>> {
        let src_meta = fs::symlink_metadata(src)?;
        let snap_meta = fs::symlink_metadata(snap)?;

        if src_meta.file_type().is_symlink() != snap_meta.file_type().is_symlink() {
            return Ok(Some("entry type differs".to_string()));
        }
        if src_meta.file_type().is_symlink() {
            return Ok(if fs::read_link(src)? != fs::read_link(snap)? {
                Some("symlink target differs".to_string())
            } else {
                None
            });
        }

        if src_meta.len() != snap_meta.len() {
            return Ok(Some(format!(
                "size differs ({} vs {})",
                src_meta.len(),
                snap_meta.len()
            )));
        }
        match mode {
            VerifyMode::Digest => {
                if self.checksum.digest(src)? != self.checksum.digest(snap)? {
                    return Ok(Some("digest differs".to_string()));
                }
            }
            VerifyMode::SizeAndMtime => {
                if FileTime::from_last_modification_time(&src_meta)
                    != FileTime::from_last_modification_time(&snap_meta)
                {
                    return Ok(Some("mtime differs".to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Collect the relative paths of files and symlinks in one tree.
    fn enumerate(&self, root: &Path, apply_exclusions: bool) -> Result<BTreeSet<PathBuf>> {
        let mut entries = BTreeSet::new();
        let mut walker = WalkDir::new(root).follow_links(false).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry?;
            let rel = relative_to(root, entry.path());
            if rel.as_os_str().is_empty() || rel == Path::new(METADATA_FILE) {
                continue;
            }
            if apply_exclusions && self.matcher.is_excluded(&rel, entry.file_type().is_dir()) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
            if entry.file_type().is_file() || entry.file_type().is_symlink() {
                entries.insert(rel);
            }
        }
        Ok(entries)
    }
}

/// Counters accumulated while mirroring.
#[derive(Debug, Default)]
struct MirrorStats {
    files: usize,
    hardlinked: usize,
    bytes: u64,
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

/// Byte-wise comparison of two files with buffered reads.
///
/// Short reads are handled by comparing whatever both buffers currently
/// hold, so the result does not depend on chunk alignment.
fn same_content(a: &Path, b: &Path) -> Result<bool> {
    let mut fa = BufReader::new(fs::File::open(a)?);
    let mut fb = BufReader::new(fs::File::open(b)?);
    loop {
        let buf_a = fa.fill_buf()?;
        let buf_b = fb.fill_buf()?;
        if buf_a.is_empty() && buf_b.is_empty() {
            return Ok(true);
        }
        let n = buf_a.len().min(buf_b.len());
        if n == 0 || buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
        fa.consume(n);
        fb.consume(n);
    }
}

/// Enumerate the snapshots under a backup root, oldest first.
///
/// A missing root yields an empty list, never an error; entries that do
/// not parse as snapshot names (stages, locks, strays) are skipped.
pub fn list_snapshots(root: &Path) -> Result<Vec<SnapshotName>> {
    let read_dir = match fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(text) = entry.file_name().to_str() {
            if let Ok(name) = SnapshotName::parse(text) {
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Enumerate snapshots with their metadata records, oldest first.
///
/// Snapshots without a readable `.metadata` report `None`.
pub fn list_detailed(root: &Path) -> Result<Vec<(SnapshotName, Option<MetadataRecord>)>> {
    let mut detailed = Vec::new();
    for name in list_snapshots(root)? {
        let record = metadata::read(&root.join(name.as_str())).ok();
        detailed.push((name, record));
    }
    Ok(detailed)
}

/// The most recent snapshot under a root, by name order.
pub fn latest_snapshot(root: &Path) -> Result<Option<SnapshotName>> {
    Ok(list_snapshots(root)?.into_iter().max())
}
