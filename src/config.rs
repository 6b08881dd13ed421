//! Engine configuration and environment contracts
//!
//! The engine has no process-wide mutable state: everything an operation
//! needs to know (confirmation policy, checksum selection, remote identity)
//! is carried in an explicit [`Config`] value built once at the edge and
//! threaded through the constructors. Environment ingestion happens only
//! here.

use crate::checksum::ChecksumKind;
use crate::error::{CheckpointError, Result};
use crate::platform;
use std::ffi::OsStr;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Overrides the computed default backup root.
pub const ENV_BACKUP_DIR: &str = "CHECKPOINT_BACKUP_DIR";
/// Non-empty value suppresses interactive prompts (treated as confirm).
pub const ENV_AUTO_CONFIRM: &str = "CHECKPOINT_AUTO_CONFIRM";

/// Prompt deadline when asking whether to create a missing directory.
pub const DIR_CREATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Prompt deadline for the pre-restore confirmation.
pub const RESTORE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);
/// Prompt deadline when asking the user to pick a snapshot.
pub const SNAPSHOT_SELECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Explicit configuration threaded through engine constructors.
#[derive(Debug, Clone)]
pub struct Config {
    /// Suppress prompts and treat every question as confirmed
    pub auto_confirm: bool,
    /// Digest algorithm for verification passes
    pub checksum: ChecksumKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_confirm: false,
            checksum: ChecksumKind::Sha256,
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        let auto_confirm = std::env::var(ENV_AUTO_CONFIRM)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        Self {
            auto_confirm,
            ..Self::default()
        }
    }
}

/// Resolve the backup root for a source directory.
///
/// Priority order: the caller's explicit directory, then
/// `$CHECKPOINT_BACKUP_DIR/<basename>`, then `/var/backups/<basename>` when
/// running as root, and finally `<home>/.checkpoint/<basename>`.
pub fn resolve_backup_root(explicit: Option<&Path>, source: &Path) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }

    let basename = source
        .file_name()
        .unwrap_or_else(|| OsStr::new("source"))
        .to_os_string();

    if let Ok(base) = std::env::var(ENV_BACKUP_DIR) {
        if !base.is_empty() {
            let base = PathBuf::from(base);
            if !base.is_absolute() {
                return Err(CheckpointError::InvalidOptionValue {
                    option: ENV_BACKUP_DIR,
                    value: base.display().to_string(),
                });
            }
            return Ok(base.join(&basename));
        }
    }

    let root = if platform::effective_uid() == 0 {
        PathBuf::from("/var/backups").join(&basename)
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".checkpoint").join(&basename)
    };
    debug!(root = %root.display(), "resolved default backup root");
    Ok(root)
}

/// Ask a yes/no question on the terminal with a hard deadline.
///
/// Auto-confirm answers yes without prompting, as does a non-interactive
/// stdin. A reply must arrive before the deadline; expiry is a
/// [`CheckpointError::Cancelled`], never an unbounded wait.
pub fn confirm(question: &str, timeout: Duration, auto_confirm: bool) -> Result<bool> {
    use std::io::IsTerminal;
    if auto_confirm || !std::io::stdin().is_terminal() {
        return Ok(true);
    }

    let mut stderr = std::io::stderr();
    write!(stderr, "{} [y/N] ", question)?;
    stderr.flush()?;

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut line = String::new();
        let result = std::io::stdin().lock().read_line(&mut line);
        let _ = tx.send(result.map(|_| line));
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(line)) => {
            let answer = line.trim().to_ascii_lowercase();
            Ok(answer == "y" || answer == "yes")
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(CheckpointError::Cancelled(format!(
            "no answer within {}s: {}",
            timeout.as_secs(),
            question
        ))),
    }
}
