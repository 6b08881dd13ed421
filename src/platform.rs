//! Path and platform introspection layer
//!
//! Everything the engine needs to know about the machine it runs on lives
//! here: path canonicalisation, ownership lookup, free-space probing and
//! timestamp formatting. The rest of the library depends only on these
//! functions, so platform differences stay contained in this module.
//!
//! ## Categories
//!
//! ### Path manipulation
//! - Canonicalisation (absolute, symlinks resolved, idempotent)
//! - Converting absolute paths to source-relative form
//!
//! ### Platform probes
//! - Ownership introspection (uid/gid pair)
//! - Free disk space in kilobytes
//! - Local-time snapshot timestamps
//!
//! ### Data helpers
//! - Tree size measurement honouring exclusions
//! - Human-readable byte formatting
//!
//! All fallible functions return `Result<T, CheckpointError>` and propagate
//! filesystem errors untouched; a disappeared path surfaces the underlying
//! `NotFound` from the standard library.

use crate::error::Result;
use crate::exclude::ExclusionMatcher;
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

/// Canonicalise a path: absolute, with symlinks resolved.
///
/// Idempotent (canonicalising an already-canonical path returns it
/// unchanged) and never produces a trailing slash because the result is
/// component-based, not string-based.
pub fn canonicalize(path: &Path) -> Result<PathBuf> {
    Ok(fs::canonicalize(path)?)
}

/// Owner of a filesystem entry as a `(user, group)` string pair.
///
/// On Unix the numeric uid/gid are rendered as decimal strings; resolving
/// them to account names would require the passwd database, which the
/// engine does not depend on.
#[cfg(unix)]
pub fn owner(path: &Path) -> Result<(String, String)> {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::symlink_metadata(path)?;
    Ok((meta.uid().to_string(), meta.gid().to_string()))
}

/// Owner of a filesystem entry (non-Unix fallback).
#[cfg(not(unix))]
pub fn owner(_path: &Path) -> Result<(String, String)> {
    Ok(("0".to_string(), "0".to_string()))
}

/// Free disk space at `path`, in kilobytes.
pub fn disk_free_kb(path: &Path) -> Result<u64> {
    let bytes = fs2::available_space(path)?;
    Ok(bytes / 1024)
}

/// Current local time formatted as a snapshot timestamp, `YYYYMMDD_HHMMSS`.
pub fn timestamp_now() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Express `target` relative to `base`, or return `target` unchanged when it
/// is not under `base`.
///
/// A lexical strip only: symlinks are deliberately not resolved here so that
/// a link inside the source keeps its own path rather than its target's.
pub fn relative_to(base: &Path, target: &Path) -> PathBuf {
    match target.strip_prefix(base) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => target.to_path_buf(),
    }
}

/// Measure the size of a directory tree in kilobytes, skipping excluded
/// entries.
///
/// Sizes are summed in bytes and rounded up, so a tree of tiny files still
/// reports at least one kilobyte per non-empty file set. Unreadable entries
/// terminate the walk with the underlying error; capacity checks must not
/// silently undercount.
pub fn tree_size_kb(root: &Path, matcher: &ExclusionMatcher) -> Result<u64> {
    let mut bytes: u64 = 0;
    let mut walker = WalkDir::new(root).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry?;
        let rel = relative_to(root, entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        if matcher.is_excluded(&rel, entry.file_type().is_dir()) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        if entry.file_type().is_file() {
            bytes += entry.metadata()?.len();
        }
    }
    let kb = bytes.div_ceil(1024);
    trace!(root = %root.display(), kb, "measured tree size");
    Ok(kb)
}

/// Format bytes in human-readable form using binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Unix permission bits of an entry's metadata.
#[cfg(unix)]
pub fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

/// Permission bits (non-Unix fallback: read-only maps to 0o444).
#[cfg(not(unix))]
pub fn mode_of(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Apply Unix permission bits to a path.
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Apply permission bits (non-Unix fallback: only the readonly flag).
#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Copy ownership from `src` metadata onto `dst`.
///
/// Requires privilege; an `EPERM` from an unprivileged run is swallowed so
/// that snapshots taken by ordinary users still succeed with the invoking
/// user as owner.
#[cfg(unix)]
pub fn copy_ownership(src_meta: &fs::Metadata, dst: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    match std::os::unix::fs::lchown(dst, Some(src_meta.uid()), Some(src_meta.gid())) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Copy ownership (non-Unix no-op).
#[cfg(not(unix))]
pub fn copy_ownership(_src_meta: &fs::Metadata, _dst: &Path) -> Result<()> {
    Ok(())
}

/// Effective uid of the current process; `0` means root.
#[cfg(unix)]
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no failure modes
    unsafe { libc::geteuid() }
}

/// Effective uid (non-Unix: never root).
#[cfg(not(unix))]
pub fn effective_uid() -> u32 {
    u32::MAX
}
