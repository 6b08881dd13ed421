//! # Checkpoint - timestamped directory snapshots
//!
//! A directory-snapshot engine: point-in-time copies of a source tree,
//! named by timestamp, published atomically, deduplicated against the
//! previous snapshot with hardlinks, carrying a per-snapshot metadata
//! record, rotated by retention policy, and mirrored to remote hosts over
//! a hardened ssh transport.
//!
//! ## Overview
//!
//! - Create immutable snapshots (`YYYYMMDD_HHMMSS[_suffix]`) of a source
//!   directory under a backup root
//! - Deduplicate unchanged files against the prior snapshot via hardlinks
//! - Verify snapshots against the live source, by digest or by
//!   size-and-mtime for large trees
//! - Compare snapshots with each other or with the live tree, with
//!   unified diffs of changed files
//! - Restore completely or selectively, with dry-run and pre-restore diff
//! - Prune old snapshots by count or age
//! - Run the same verbs against a remote backup root over ssh/rsync
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use checkpoint::{Config, SnapshotEngine, SnapshotOptions};
//! use std::path::Path;
//!
//! # fn main() -> checkpoint::Result<()> {
//! let engine = SnapshotEngine::new(
//!     Path::new("./project"),
//!     Path::new("/var/backups/project"),
//!     &["*.log".to_string()],
//!     Config::from_env(),
//! )?;
//!
//! let name = engine.create(&SnapshotOptions {
//!     description: Some("before refactor".to_string()),
//!     ..Default::default()
//! })?;
//! println!("published {}", name);
//! # Ok(())
//! # }
//! ```
//!
//! ## Atomic visibility
//!
//! A snapshot in progress lives in a hidden stage (`.tmp.<token>`) inside
//! the backup root and becomes visible in a single rename. Readers of the
//! root therefore see every snapshot either not at all or complete,
//! which is why the read-only verbs (list, compare, restore, metadata)
//! take no lock, while every mutating verb serialises on the
//! `.checkpoint.lock` directory.
//!
//! ## Error handling
//!
//! All operations return [`Result<T>`](Result) with [`CheckpointError`];
//! the error's [`exit_code`](CheckpointError::exit_code) gives the
//! conventional process exit status for command-line front ends. Per-file
//! problems inside comparison and restore never abort the run; they are
//! collected in the returned report, whose `status()` yields the
//! corresponding partial-result error.

// Public API modules
pub mod checksum;
pub mod compare;
pub mod config;
pub mod diff;
pub mod error;
pub mod exclude;
pub mod lock;
pub mod metadata;
pub mod platform;
pub mod remote;
pub mod restore;
pub mod retention;
pub mod snapshot;
pub mod types;

// Internal coordination (exposed for embedders that add finalisers)
pub mod cleanup;

// Re-export main types for convenience
pub use checksum::{ChecksumKind, ChecksumProvider};
pub use compare::CompareEngine;
pub use config::{resolve_backup_root, Config};
pub use diff::DiffRenderer;
pub use error::{CheckpointError, Result};
pub use exclude::{ExclusionMatcher, PatternFilter, DEFAULT_PATTERNS};
pub use lock::{force_release, LockGuard};
pub use metadata::MetadataRecord;
pub use remote::{RemoteConfig, RemoteDispatcher, RemoteSpec};
pub use restore::RestoreEngine;
pub use retention::prune;
pub use snapshot::{latest_snapshot, list_detailed, list_snapshots, SnapshotEngine};
pub use types::*;
