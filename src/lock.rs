//! Crash-safe backup-root locking
//!
//! Mutating verbs on a backup root are serialised through a lock directory,
//! `.checkpoint.lock`, created with an atomic `mkdir`. The directory holds
//! two files: `pid`, the decimal process id of the holder, and `timestamp`,
//! the epoch seconds at acquisition. Because directory creation is the
//! mutual-exclusion primitive, acquisition is race-free on any filesystem
//! with atomic `mkdir`.
//!
//! A lock whose `pid` names a process that is no longer running is STALE
//! and reclaimed automatically; a live foreign pid is polled once per
//! second until the timeout budget runs out. A process only ever deletes a
//! lock whose `pid` file it still owns; the one exception is
//! [`force_release`], which exists for operators cleaning up by hand.

use crate::cleanup::{self, CleanupToken};
use crate::error::{CheckpointError, Result};
use chrono::Utc;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Name of the lock directory inside a backup root.
pub const LOCK_DIR_NAME: &str = ".checkpoint.lock";

/// Handle to an acquired lock. Dropping the handle releases the lock on a
/// best-effort basis; call [`LockGuard::release`] for the checked path.
#[derive(Debug)]
pub struct LockGuard {
    root: PathBuf,
    lock_dir: PathBuf,
    pid: u32,
    released: bool,
    cleanup: Option<CleanupToken>,
}

/// Acquire the lock on `root`.
///
/// `timeout_secs` bounds how long a live foreign holder is waited for, in
/// whole-second polls. `force` removes any existing lock before the first
/// attempt, regardless of holder.
#[instrument(skip(root), fields(root = %root.as_ref().display()))]
pub fn acquire(root: impl AsRef<Path>, timeout_secs: u64, force: bool) -> Result<LockGuard> {
    let root = root.as_ref().to_path_buf();
    let lock_dir = root.join(LOCK_DIR_NAME);
    let pid = std::process::id();

    if force {
        debug!("force requested; removing any existing lock");
        remove_lock_dir(&lock_dir)?;
    }

    let mut remaining = timeout_secs;
    loop {
        match fs::create_dir(&lock_dir) {
            Ok(()) => {
                fs::write(lock_dir.join("pid"), pid.to_string())?;
                fs::write(lock_dir.join("timestamp"), Utc::now().timestamp().to_string())?;
                debug!(pid, "lock acquired");

                let cleanup_dir = lock_dir.clone();
                let token = cleanup::register("lock release", move || {
                    release_if_owned(&cleanup_dir, pid);
                });
                return Ok(LockGuard {
                    root,
                    lock_dir,
                    pid,
                    released: false,
                    cleanup: Some(token),
                });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match read_holder_pid(&lock_dir) {
                    Some(holder) if process_alive(holder) => {
                        if remaining == 0 {
                            return Err(CheckpointError::LockTimeout {
                                root,
                                held_by: Some(holder),
                            });
                        }
                        debug!(holder, remaining, "lock held; waiting");
                        thread::sleep(Duration::from_secs(1));
                        remaining -= 1;
                    }
                    holder => {
                        // Absent, malformed or dead pid: the holder crashed
                        warn!(?holder, lock = %lock_dir.display(), "reclaiming stale lock");
                        remove_lock_dir(&lock_dir)?;
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Remove the lock on `root` unconditionally.
pub fn force_release(root: impl AsRef<Path>) -> Result<()> {
    let lock_dir = root.as_ref().join(LOCK_DIR_NAME);
    warn!(lock = %lock_dir.display(), "force-releasing lock");
    remove_lock_dir(&lock_dir)
}

impl LockGuard {
    /// Backup root this guard serialises.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Release the lock, verifying it still names this process.
    ///
    /// Idempotent: releasing an already-released (or externally removed)
    /// lock succeeds. A lock that now carries a different pid was stolen
    /// and is left in place.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if let Some(token) = self.cleanup.take() {
            cleanup::deregister(token);
        }
        match read_holder_pid(&self.lock_dir) {
            Some(holder) if holder == self.pid => {
                remove_lock_dir(&self.lock_dir)?;
                debug!(pid = self.pid, "lock released");
                Ok(())
            }
            None if !self.lock_dir.exists() => Ok(()),
            _ => Err(CheckpointError::LockStolen {
                root: self.root.clone(),
            }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(error = %e, "lock release on drop failed");
        }
    }
}

/// Remove the lock directory only if its `pid` file still names `pid`.
/// Used by the signal-path finaliser, which cannot report errors.
fn release_if_owned(lock_dir: &Path, pid: u32) {
    if read_holder_pid(lock_dir) == Some(pid) {
        let _ = remove_lock_dir(lock_dir);
    }
}

fn read_holder_pid(lock_dir: &Path) -> Option<u32> {
    let text = fs::read_to_string(lock_dir.join("pid")).ok()?;
    text.trim().parse::<u32>().ok()
}

fn remove_lock_dir(lock_dir: &Path) -> Result<()> {
    match fs::remove_dir_all(lock_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether a process with the given pid is currently running.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 probes for existence without delivering anything
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        true
    } else {
        // EPERM means the process exists but belongs to someone else
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap probe available; err on the side of treating locks as live
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let root = TempDir::new().unwrap();
        let guard = acquire(root.path(), 0, false).unwrap();

        let lock_dir = root.path().join(LOCK_DIR_NAME);
        assert!(lock_dir.is_dir());
        let pid: u32 = fs::read_to_string(lock_dir.join("pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(pid, std::process::id());
        assert!(lock_dir.join("timestamp").is_file());

        guard.release().unwrap();
        assert!(!lock_dir.exists());
    }

    #[test]
    fn test_contended_lock_times_out() {
        let root = TempDir::new().unwrap();
        let _held = acquire(root.path(), 0, false).unwrap();

        // Our own pid is alive, so a second acquire waits and times out
        let err = acquire(root.path(), 1, false).unwrap_err();
        assert!(matches!(err, CheckpointError::LockTimeout { .. }));
        assert!(err.to_string().contains("Failed to acquire lock"));
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let root = TempDir::new().unwrap();
        let lock_dir = root.path().join(LOCK_DIR_NAME);
        fs::create_dir(&lock_dir).unwrap();
        fs::write(lock_dir.join("pid"), "999999").unwrap();
        fs::write(lock_dir.join("timestamp"), "0").unwrap();

        let guard = acquire(root.path(), 0, false).unwrap();
        let pid: u32 = fs::read_to_string(lock_dir.join("pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(pid, std::process::id());
        guard.release().unwrap();
    }

    #[test]
    fn test_malformed_pid_reclaimed() {
        let root = TempDir::new().unwrap();
        let lock_dir = root.path().join(LOCK_DIR_NAME);
        fs::create_dir(&lock_dir).unwrap();
        fs::write(lock_dir.join("pid"), "not-a-pid").unwrap();

        let guard = acquire(root.path(), 0, false).unwrap();
        guard.release().unwrap();
        assert!(!lock_dir.exists());
    }

    #[test]
    fn test_force_acquire_evicts_holder() {
        let root = TempDir::new().unwrap();
        let mut held = acquire(root.path(), 0, false).unwrap();
        held.released = true; // simulate losing the lock without releasing

        let guard = acquire(root.path(), 0, true).unwrap();
        guard.release().unwrap();
    }

    #[test]
    fn test_stolen_lock_refused() {
        let root = TempDir::new().unwrap();
        let guard = acquire(root.path(), 0, false).unwrap();

        // Another process overwrites the pid file
        fs::write(root.path().join(LOCK_DIR_NAME).join("pid"), "424242").unwrap();

        let err = guard.release().unwrap_err();
        assert!(matches!(err, CheckpointError::LockStolen { .. }));
        // The foreign lock must survive
        assert!(root.path().join(LOCK_DIR_NAME).is_dir());
    }

    #[test]
    fn test_force_release_unconditional() {
        let root = TempDir::new().unwrap();
        let lock_dir = root.path().join(LOCK_DIR_NAME);
        fs::create_dir(&lock_dir).unwrap();
        fs::write(lock_dir.join("pid"), std::process::id().to_string()).unwrap();

        force_release(root.path()).unwrap();
        assert!(!lock_dir.exists());
        // Releasing an absent lock is fine too
        force_release(root.path()).unwrap();
    }

    #[test]
    fn test_release_idempotent_when_lock_gone() {
        let root = TempDir::new().unwrap();
        let guard = acquire(root.path(), 0, false).unwrap();
        fs::remove_dir_all(root.path().join(LOCK_DIR_NAME)).unwrap();
        guard.release().unwrap();
    }
}
