//! Retention policy: count- and age-based snapshot rotation
//!
//! Snapshots are enumerated and aged by their *names*: the timestamp is
//! authoritative, directory mtimes lie after restores and copies.
//! Deletions are whole-directory removals, oldest first, and the most
//! recent snapshot is never deleted unless the caller explicitly asks for
//! `keep_n(0)` in prune-only mode.

use crate::error::Result;
use crate::lock;
use crate::snapshot::list_snapshots;
use crate::types::{PruneReport, RetentionRule, SnapshotName};
use chrono::{Duration, Utc};
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument};

/// Run retention against a backup root, taking the root lock.
///
/// `prune_only` marks a standalone retention run: it is the only mode in
/// which `KeepCount(0)` may delete the most recent snapshot.
#[instrument(skip(root), fields(root = %root.as_ref().display()))]
pub fn prune(
    root: impl AsRef<Path>,
    rule: RetentionRule,
    prune_only: bool,
    lock_timeout_secs: u64,
) -> Result<PruneReport> {
    let root = root.as_ref();
    let guard = lock::acquire(root, lock_timeout_secs, false)?;
    let keep_latest = !(prune_only && rule == RetentionRule::KeepCount(0));
    let report = prune_locked(root, rule, keep_latest)?;
    guard.release()?;
    Ok(report)
}

/// Retention body, called with the root lock already held (the snapshot
/// engine runs this at the tail of a create).
pub(crate) fn prune_locked(
    root: &Path,
    rule: RetentionRule,
    keep_latest: bool,
) -> Result<PruneReport> {
    let names = list_snapshots(root)?;
    let examined = names.len();
    let mut doomed = select_doomed(&names, rule, keep_latest);
    doomed.sort(); // delete oldest first

    for name in &doomed {
        let dir = root.join(name.as_str());
        debug!(snapshot = %name, "removing expired snapshot");
        fs::remove_dir_all(&dir)?;
    }
    if !doomed.is_empty() {
        info!(removed = doomed.len(), examined, "retention pruned snapshots");
    }
    Ok(PruneReport {
        examined,
        deleted: doomed,
    })
}

/// Pick the snapshots a rule condemns. Pure so the boundary cases are
/// testable without a filesystem, and reused by the remote dispatcher
/// against far-end listings.
pub(crate) fn select_doomed(
    names: &[SnapshotName],
    rule: RetentionRule,
    keep_latest: bool,
) -> Vec<SnapshotName> {
    let latest = names.iter().max().cloned();
    let mut doomed: Vec<SnapshotName> = match rule {
        RetentionRule::KeepCount(n) => {
            let mut descending: Vec<SnapshotName> = names.to_vec();
            descending.sort_by(|a, b| b.cmp(a));
            descending.into_iter().skip(n).collect()
        }
        RetentionRule::MaxAgeDays(days) => {
            let cutoff = Utc::now().naive_utc() - Duration::days(i64::from(days));
            names
                .iter()
                .filter(|name| match name.timestamp() {
                    Some(ts) => ts < cutoff,
                    // Unparseable calendar values are left alone
                    None => false,
                })
                .cloned()
                .collect()
        }
    };
    if keep_latest {
        if let Some(latest) = latest {
            doomed.retain(|name| *name != latest);
        }
    }
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(root: &Path, names: &[&str]) {
        for name in names {
            let dir = root.join(name);
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join("payload"), *name).unwrap();
        }
    }

    #[test]
    fn test_keep_count() {
        let root = TempDir::new().unwrap();
        seed(
            root.path(),
            &[
                "20250101_000000",
                "20250102_000000",
                "20250103_000000",
                "20250104_000000",
                "20250105_000000",
            ],
        );

        let report = prune(root.path(), RetentionRule::KeepCount(3), false, 0).unwrap();
        assert_eq!(report.examined, 5);
        assert_eq!(
            report.deleted.iter().map(|n| n.as_str()).collect::<Vec<_>>(),
            vec!["20250101_000000", "20250102_000000"]
        );

        let remaining = list_snapshots(root.path()).unwrap();
        assert_eq!(
            remaining.iter().map(|n| n.as_str()).collect::<Vec<_>>(),
            vec!["20250103_000000", "20250104_000000", "20250105_000000"]
        );
    }

    #[test]
    fn test_keep_count_larger_than_population() {
        let root = TempDir::new().unwrap();
        seed(root.path(), &["20250101_000000", "20250102_000000"]);
        let report = prune(root.path(), RetentionRule::KeepCount(10), false, 0).unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(list_snapshots(root.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_max_age_by_name_not_mtime() {
        let root = TempDir::new().unwrap();
        let old = Utc::now().naive_utc() - Duration::days(30);
        let fresh = Utc::now().naive_utc() - Duration::days(1);
        let old_name = old.format("%Y%m%d_%H%M%S").to_string();
        let fresh_name = fresh.format("%Y%m%d_%H%M%S").to_string();
        seed(root.path(), &[&old_name, &fresh_name]);

        let report = prune(root.path(), RetentionRule::MaxAgeDays(7), false, 0).unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0].as_str(), old_name);

        let remaining = list_snapshots(root.path()).unwrap();
        assert_eq!(remaining[0].as_str(), fresh_name);
    }

    #[test]
    fn test_latest_survives_aggressive_age_rule() {
        let root = TempDir::new().unwrap();
        let a = (Utc::now().naive_utc() - Duration::days(400))
            .format("%Y%m%d_%H%M%S")
            .to_string();
        let b = (Utc::now().naive_utc() - Duration::days(300))
            .format("%Y%m%d_%H%M%S")
            .to_string();
        seed(root.path(), &[&a, &b]);

        // Both exceed the age bound, but the most recent is spared
        let report = prune(root.path(), RetentionRule::MaxAgeDays(7), false, 0).unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0].as_str(), a);
        assert_eq!(list_snapshots(root.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_keep_zero_requires_prune_only() {
        let root = TempDir::new().unwrap();
        seed(root.path(), &["20250101_000000", "20250102_000000"]);

        // Outside prune-only mode the latest is protected
        prune(root.path(), RetentionRule::KeepCount(0), false, 0).unwrap();
        assert_eq!(list_snapshots(root.path()).unwrap().len(), 1);

        // Prune-only keep_n(0) empties the root
        prune(root.path(), RetentionRule::KeepCount(0), true, 0).unwrap();
        assert!(list_snapshots(root.path()).unwrap().is_empty());
    }

    #[test]
    fn test_prune_ignores_strays() {
        let root = TempDir::new().unwrap();
        seed(root.path(), &["20250101_000000"]);
        fs::create_dir(root.path().join(".tmp.stray")).unwrap();

        prune(root.path(), RetentionRule::KeepCount(1), false, 0).unwrap();
        assert!(root.path().join(".tmp.stray").exists());
    }

    #[test]
    fn test_empty_root() {
        let root = TempDir::new().unwrap();
        let report = prune(root.path(), RetentionRule::KeepCount(3), false, 0).unwrap();
        assert_eq!(report.examined, 0);
        assert!(report.deleted.is_empty());
    }
}
