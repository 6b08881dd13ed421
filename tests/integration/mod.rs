//! End-to-end scenarios for the snapshot engine
//!
//! Exercises the full verb surface against real temporary trees: create,
//! list, verify, compare, restore, retention, locking and the remote
//! ingress hardening.

use checkpoint::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn test_config() -> Config {
    Config {
        auto_confirm: true,
        ..Config::default()
    }
}

/// Deterministic tree generator for multi-file scenarios.
pub struct FileGenerator {
    rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn content(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.rng.gen_range(b'a'..=b'z')).collect()
    }

    /// Populate `root` with `dirs` directories of `files_per_dir` files.
    pub fn populate(&mut self, root: &Path, dirs: usize, files_per_dir: usize) -> Vec<PathBuf> {
        let mut created = Vec::new();
        for d in 0..dirs {
            let dir = root.join(format!("dir_{}", d));
            fs::create_dir_all(&dir).unwrap();
            for f in 0..files_per_dir {
                let path = dir.join(format!("file_{}.txt", f));
                fs::write(&path, self.content(64)).unwrap();
                created.push(path.strip_prefix(root).unwrap().to_path_buf());
            }
        }
        created
    }
}

#[test]
fn test_basic_create_scenario() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    fs::write(src.path().join("a.txt"), "hi").unwrap();
    fs::create_dir(src.path().join("sub")).unwrap();
    fs::write(src.path().join("sub/b.txt"), "yo").unwrap();

    let engine = SnapshotEngine::new(src.path(), root.path(), &[], test_config()).unwrap();
    let name = engine.create(&SnapshotOptions::default()).unwrap();

    // Exactly one snapshot, named by timestamp
    let listed = list_snapshots(root.path()).unwrap();
    assert_eq!(listed, vec![name.clone()]);
    assert_eq!(name.as_str().len(), 15);

    let snap = root.path().join(name.as_str());
    assert_eq!(fs::read_to_string(snap.join("a.txt")).unwrap(), "hi");
    assert_eq!(fs::read_to_string(snap.join("sub/b.txt")).unwrap(), "yo");

    // Metadata records the canonical source
    let record = MetadataRecord::parse(&fs::read_to_string(snap.join(".metadata")).unwrap());
    assert_eq!(record.get("SOURCE"), Some(engine.source().to_str().unwrap()));

    // No transient artefacts remain
    for entry in fs::read_dir(root.path()).unwrap() {
        let file_name = entry.unwrap().file_name();
        assert!(!file_name.to_string_lossy().starts_with(".tmp."));
    }
}

#[test]
fn test_suffix_sanitisation_scenario() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    fs::write(src.path().join("f"), "x").unwrap();

    let engine = SnapshotEngine::new(src.path(), root.path(), &[], test_config()).unwrap();
    let name = engine
        .create(&SnapshotOptions {
            suffix: Some("test/suffix;with*invalid&chars".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert!(name.as_str().ends_with("_testsuffixwithinvalidchars"));
}

#[test]
fn test_concurrent_creators_scenario() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    fs::write(src.path().join("f"), "x").unwrap();

    // One holder takes the lock out-of-band and sits on it
    let guard = checkpoint::lock::acquire(root.path(), 0, false).unwrap();

    let engine = SnapshotEngine::new(src.path(), root.path(), &[], test_config()).unwrap();
    let err = engine
        .create(&SnapshotOptions {
            lock_timeout_secs: 1,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, CheckpointError::LockTimeout { .. }));
    assert!(err.to_string().contains("Failed to acquire lock"));
    assert_eq!(err.exit_code(), 3);
    assert!(list_snapshots(root.path()).unwrap().is_empty());

    // Once the holder releases, creation proceeds
    guard.release().unwrap();
    engine.create(&SnapshotOptions::default()).unwrap();
    assert_eq!(list_snapshots(root.path()).unwrap().len(), 1);
}

#[test]
fn test_parallel_creates_never_corrupt() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let mut generator = FileGenerator::new(7);
    generator.populate(src.path(), 3, 4);

    let src_path = src.path().to_path_buf();
    let root_path = root.path().to_path_buf();
    let spawn = || {
        let src_path = src_path.clone();
        let root_path = root_path.clone();
        std::thread::spawn(move || {
            let engine =
                SnapshotEngine::new(&src_path, &root_path, &[], test_config()).unwrap();
            engine.create(&SnapshotOptions {
                lock_timeout_secs: 5,
                ..Default::default()
            })
        })
    };
    let first = spawn();
    let second = spawn();
    let a = first.join().expect("thread panicked");
    let b = second.join().expect("thread panicked");

    let successes: Vec<&SnapshotName> = [&a, &b].into_iter().flatten().collect();
    assert!(!successes.is_empty());

    // Every published snapshot is complete; no duplicates, no leftovers
    let listed = list_snapshots(root.path()).unwrap();
    assert_eq!(listed.len(), successes.len());
    for name in &listed {
        assert!(root
            .path()
            .join(name.as_str())
            .join("dir_0/file_0.txt")
            .is_file());
    }
    assert!(!root.path().join(".checkpoint.lock").exists());
}

#[test]
fn test_stale_lock_recovery_scenario() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    fs::write(src.path().join("f"), "x").unwrap();

    let lock_dir = root.path().join(".checkpoint.lock");
    fs::create_dir(&lock_dir).unwrap();
    fs::write(lock_dir.join("pid"), "999999").unwrap();
    fs::write(lock_dir.join("timestamp"), "0").unwrap();

    let engine = SnapshotEngine::new(src.path(), root.path(), &[], test_config()).unwrap();
    engine.create(&SnapshotOptions::default()).unwrap();

    assert_eq!(list_snapshots(root.path()).unwrap().len(), 1);
    assert!(!lock_dir.exists());
}

#[test]
fn test_retention_by_count_scenario() {
    let root = TempDir::new().unwrap();
    let names = [
        "20250101_000000",
        "20250102_000000",
        "20250103_000000",
        "20250104_000000",
        "20250105_000000",
    ];
    for name in names {
        let dir = root.path().join(name);
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("payload"), name).unwrap();
    }

    prune(root.path(), RetentionRule::KeepCount(3), false, 0).unwrap();

    let remaining = list_snapshots(root.path()).unwrap();
    assert_eq!(
        remaining.iter().map(|n| n.as_str()).collect::<Vec<_>>(),
        vec!["20250103_000000", "20250104_000000", "20250105_000000"]
    );
}

#[test]
fn test_invalid_remote_path_scenario() {
    let err = RemoteSpec::parse("user@host:/path/../etc/passwd").unwrap_err();
    assert!(err.to_string().contains("cannot contain directory traversal"));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn test_selective_restore_scenario() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    fs::write(src.path().join("a.txt"), "text").unwrap();
    fs::write(src.path().join("app.log"), "log").unwrap();
    fs::write(src.path().join("config.ini"), "ini").unwrap();

    let engine = SnapshotEngine::new(src.path(), root.path(), &[], test_config()).unwrap();
    let name = engine.create(&SnapshotOptions::default()).unwrap();

    let target = TempDir::new().unwrap();
    let restorer = RestoreEngine::new(root.path(), test_config()).unwrap();
    restorer
        .restore(
            &name,
            &RestoreOptions {
                target: Some(target.path().to_path_buf()),
                patterns: vec!["*.txt".to_string()],
                ..Default::default()
            },
        )
        .unwrap();

    let mut entries: Vec<String> = fs::read_dir(target.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    assert_eq!(entries, vec!["a.txt"]);
}

#[test]
fn test_create_compare_restore_cycle() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let mut generator = FileGenerator::new(99);
    let files = generator.populate(src.path(), 2, 3);

    let engine = SnapshotEngine::new(src.path(), root.path(), &[], test_config()).unwrap();
    let name = engine.create(&SnapshotOptions::default()).unwrap();

    // Drift the live tree
    fs::write(src.path().join(&files[0]), "overwritten").unwrap();
    fs::remove_file(src.path().join(&files[1])).unwrap();
    fs::write(src.path().join("fresh.txt"), "new").unwrap();

    let compare = CompareEngine::new(&[], false)
        .unwrap()
        .with_renderer(DiffRenderer::internal());
    let report = compare
        .snapshot_vs_live(&root.path().join(name.as_str()), src.path())
        .unwrap();
    assert_eq!(report.count(EntryClass::Differs), 1);
    assert_eq!(report.count(EntryClass::OnlyInLeft), 1);
    assert_eq!(report.count(EntryClass::OnlyInRight), 1);
    report.status().unwrap();

    // Restoring the snapshot heals the drift (merge keeps fresh.txt)
    let restorer = RestoreEngine::new(root.path(), test_config()).unwrap();
    let result = restorer.restore(&name, &RestoreOptions::default()).unwrap();
    result.status().unwrap();

    let healed = compare
        .snapshot_vs_live(&root.path().join(name.as_str()), src.path())
        .unwrap();
    assert_eq!(healed.count(EntryClass::Differs), 0);
    assert_eq!(healed.count(EntryClass::OnlyInLeft), 0);
    assert_eq!(fs::read_to_string(src.path().join("fresh.txt")).unwrap(), "new");
}

#[test]
fn test_snapshot_vs_snapshot_comparison() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    fs::write(src.path().join("stable.txt"), "same").unwrap();
    fs::write(src.path().join("evolving.txt"), "v1").unwrap();

    let engine = SnapshotEngine::new(src.path(), root.path(), &[], test_config()).unwrap();
    let first = engine.create(&SnapshotOptions::default()).unwrap();

    fs::write(src.path().join("evolving.txt"), "v2-now-longer").unwrap();
    let second = loop {
        match engine.create(&SnapshotOptions::default()) {
            Ok(name) => break name,
            Err(CheckpointError::PublishFailed { .. }) => {
                std::thread::sleep(Duration::from_millis(200))
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    };

    let compare = CompareEngine::new(&[], true)
        .unwrap()
        .with_renderer(DiffRenderer::internal());
    let report = compare
        .snapshot_vs_snapshot(
            &root.path().join(first.as_str()),
            &root.path().join(second.as_str()),
        )
        .unwrap();
    assert_eq!(report.count(EntryClass::Identical), 1);
    assert_eq!(report.count(EntryClass::Differs), 1);
    let diff = &report.diffs[0];
    assert_eq!(diff.path, PathBuf::from("evolving.txt"));
    assert!(diff.unified.as_ref().unwrap().contains("v2-now-longer"));
}

#[test]
fn test_metadata_query_scenario() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    fs::write(src.path().join("f"), "x").unwrap();

    let engine = SnapshotEngine::new(src.path(), root.path(), &[], test_config()).unwrap();
    let tagged = engine
        .create(&SnapshotOptions {
            tags: vec![("RELEASE".to_string(), "1.0".to_string())],
            ..Default::default()
        })
        .unwrap();
    let untagged = loop {
        match engine.create(&SnapshotOptions::default()) {
            Ok(name) => break name,
            Err(CheckpointError::PublishFailed { .. }) => {
                std::thread::sleep(Duration::from_millis(200))
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    };

    let found = checkpoint::metadata::find(root.path(), "RELEASE", "1.0").unwrap();
    assert_eq!(found, vec![tagged.clone()]);

    // Update rewrites a single key
    checkpoint::metadata::update(
        &root.path().join(untagged.as_str()),
        "RELEASE",
        "1.1",
    )
    .unwrap();
    let found = checkpoint::metadata::find(root.path(), "RELEASE", "1.1").unwrap();
    assert_eq!(found, vec![untagged]);
    let _ = latest_snapshot(root.path()).unwrap();
}

#[test]
fn test_verify_detects_tampering() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    fs::write(src.path().join("precious.txt"), "intact").unwrap();

    let engine = SnapshotEngine::new(src.path(), root.path(), &[], test_config()).unwrap();
    let name = engine.create(&SnapshotOptions::default()).unwrap();
    assert!(engine.verify(&name).unwrap().is_valid());

    // Tamper with the published snapshot
    fs::write(
        root.path().join(name.as_str()).join("precious.txt"),
        "mangled",
    )
    .unwrap();
    let report = engine.verify(&name).unwrap();
    assert!(!report.is_valid());
    assert!(report.mismatches[0].1.contains("size") || report.mismatches[0].1.contains("digest"));
}

#[test]
fn test_prune_only_never_snapshots() {
    let root = TempDir::new().unwrap();
    for name in ["20250101_000000", "20250102_000000"] {
        fs::create_dir(root.path().join(name)).unwrap();
    }

    prune(root.path(), RetentionRule::KeepCount(1), true, 0).unwrap();
    let remaining = list_snapshots(root.path()).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].as_str(), "20250102_000000");
}

#[test]
fn test_force_unlock_scenario() {
    let root = TempDir::new().unwrap();
    let lock_dir = root.path().join(".checkpoint.lock");
    fs::create_dir(&lock_dir).unwrap();
    fs::write(lock_dir.join("pid"), std::process::id().to_string()).unwrap();

    force_release(root.path()).unwrap();
    assert!(!lock_dir.exists());
}

#[test]
fn test_hardlinked_history_restores_correctly() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let mut generator = FileGenerator::new(3);
    generator.populate(src.path(), 2, 2);

    let engine = SnapshotEngine::new(src.path(), root.path(), &[], test_config()).unwrap();
    let first = engine.create(&SnapshotOptions::default()).unwrap();
    fs::write(src.path().join("dir_0/file_0.txt"), "changed in v2").unwrap();
    let second = loop {
        match engine.create(&SnapshotOptions::default()) {
            Ok(name) => break name,
            Err(CheckpointError::PublishFailed { .. }) => {
                std::thread::sleep(Duration::from_millis(200))
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    };

    // Restoring the older snapshot yields the pre-change content even
    // though unchanged files are hardlink-shared between the two
    let target = TempDir::new().unwrap();
    let restorer = RestoreEngine::new(root.path(), test_config()).unwrap();
    restorer
        .restore(
            &first,
            &RestoreOptions {
                target: Some(target.path().to_path_buf()),
                ..Default::default()
            },
        )
        .unwrap();
    let restored = fs::read_to_string(target.path().join("dir_0/file_0.txt")).unwrap();
    assert_ne!(restored, "changed in v2");
    assert!(list_snapshots(root.path()).unwrap().contains(&second));
}
