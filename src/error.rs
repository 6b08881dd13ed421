//! Error types for the checkpoint library
//!
//! This module defines all error types that can occur during checkpoint
//! operations. Errors are designed to be informative and actionable,
//! providing clear context about what went wrong, and they carry the exit
//! code a command-line front end should surface for them.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the checkpoint library
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Main error type for all checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error")]
    WalkDir(#[from] walkdir::Error),

    /// Glob pattern compilation error
    #[error("Invalid exclusion pattern: {0}")]
    Pattern(#[from] globset::Error),

    /// Errors during JSON serialization of reports
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot suffix empty after sanitisation
    #[error("Invalid snapshot suffix: {0:?} contains no usable characters")]
    InvalidSuffix(String),

    /// Remote path failed ingress hardening
    #[error("Invalid remote path {path:?}: {reason}")]
    InvalidRemotePath {
        /// The offending path as received
        path: String,
        /// Which rule it violated
        reason: String,
    },

    /// Checkpoint identifier does not match the snapshot naming scheme
    #[error("Invalid checkpoint id: {0:?}")]
    InvalidCheckpointId(String),

    /// Metadata key contains characters outside `[A-Za-z0-9_]`
    #[error("Invalid metadata key: {0:?}")]
    InvalidMetadataKey(String),

    /// Timeout or other numeric option failed to parse as a positive integer
    #[error("Invalid value for {option}: {value:?} (expected a positive integer)")]
    InvalidOptionValue {
        /// Name of the option
        option: &'static str,
        /// Rejected value
        value: String,
    },

    /// A required external tool is not installed
    #[error("Required tool not found: {0}")]
    MissingTool(String),

    /// Source directory missing or not readable
    #[error("Source is not a readable directory: {0:?}")]
    SourceUnreadable(PathBuf),

    /// Backup root cannot be created or written
    #[error("Backup root is not writable: {0:?}")]
    RootUnwritable(PathBuf),

    /// Not enough free space in the backup root for a new snapshot
    #[error("Insufficient space: need {required_kb} KB, {available_kb} KB available in {root:?}")]
    InsufficientSpace {
        /// KB required (source size plus headroom)
        required_kb: u64,
        /// KB actually free
        available_kb: u64,
        /// The probed backup root
        root: PathBuf,
    },

    /// Lock acquisition timed out while another process held the lock
    #[error("Failed to acquire lock on {root:?} (held by pid {held_by:?})")]
    LockTimeout {
        /// Root whose lock was contended
        root: PathBuf,
        /// Pid recorded in the lock at the last attempt, if readable
        held_by: Option<u32>,
    },

    /// The lock no longer names this process; someone force-released it
    #[error("Lock on {root:?} was taken over by another process; refusing to release")]
    LockStolen {
        /// Root whose lock changed hands
        root: PathBuf,
    },

    /// Snapshot not found under the backup root
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Verification detected a mismatch between source and snapshot
    #[error("Verification mismatch at {path:?}: {detail}")]
    VerifyMismatch {
        /// Path that failed the comparison
        path: PathBuf,
        /// What differed (size, digest, mtime, presence)
        detail: String,
    },

    /// A write into the staging directory failed
    #[error("Staging failed: {0}")]
    StageFailed(String),

    /// The stage was complete but the atomic publish rename failed
    #[error("Failed to publish snapshot {name}: {source}")]
    PublishFailed {
        /// Intended snapshot name
        name: String,
        /// Underlying rename error
        source: std::io::Error,
    },

    /// Restore completed but some files could not be written
    #[error("Restore completed with {failed} failed file(s)")]
    PartialRestore {
        /// Number of files that failed
        failed: usize,
    },

    /// Comparison completed but some entries could not be read
    #[error("Comparison completed with {errors} unreadable entries")]
    PartialComparison {
        /// Number of per-file errors collected in the report
        errors: usize,
    },

    /// Remote transport or remote verb failure
    #[error("Remote operation failed: {0}")]
    Remote(String),

    /// Interactive prompt timed out or the operation was interrupted
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CheckpointError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        CheckpointError::Internal(msg.into())
    }

    /// Create a remote error with a custom message
    pub fn remote(msg: impl Into<String>) -> Self {
        CheckpointError::Remote(msg.into())
    }

    /// Create a staging error with a custom message
    pub fn stage(msg: impl Into<String>) -> Self {
        CheckpointError::StageFailed(msg.into())
    }

    /// Exit code a command-line front end should report for this error.
    ///
    /// `0` (success) and `2` (missing argument) belong to the argument
    /// parser; the library maps lock, verification, partial-restore and
    /// invalid-value failures to their dedicated codes and everything else
    /// to the generic `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            CheckpointError::LockTimeout { .. } | CheckpointError::LockStolen { .. } => 3,
            CheckpointError::VerifyMismatch { .. } => 4,
            CheckpointError::PartialRestore { .. } => 5,
            CheckpointError::InvalidSuffix(_)
            | CheckpointError::InvalidCheckpointId(_)
            | CheckpointError::InvalidMetadataKey(_)
            | CheckpointError::InvalidOptionValue { .. } => 22,
            _ => 1,
        }
    }

    /// Check if this error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CheckpointError::LockTimeout { .. } | CheckpointError::Cancelled(_)
        )
    }

    /// Whether the operation finished but with per-file failures
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            CheckpointError::PartialRestore { .. } | CheckpointError::PartialComparison { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            CheckpointError::LockTimeout {
                root: PathBuf::from("/tmp/bak"),
                held_by: Some(42)
            }
            .exit_code(),
            3
        );
        assert_eq!(
            CheckpointError::VerifyMismatch {
                path: PathBuf::from("a.txt"),
                detail: "size".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(CheckpointError::PartialRestore { failed: 1 }.exit_code(), 5);
        assert_eq!(CheckpointError::InvalidSuffix(";;;".into()).exit_code(), 22);
        assert_eq!(CheckpointError::internal("boom").exit_code(), 1);
    }

    #[test]
    fn test_lock_timeout_message() {
        let err = CheckpointError::LockTimeout {
            root: PathBuf::from("/tmp/bak"),
            held_by: None,
        };
        assert!(err.to_string().contains("Failed to acquire lock"));
    }

    #[test]
    fn test_partial_detection() {
        assert!(CheckpointError::PartialRestore { failed: 2 }.is_partial());
        assert!(!CheckpointError::internal("x").is_partial());
    }
}
