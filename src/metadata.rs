//! Per-snapshot metadata records
//!
//! Every snapshot carries a `.metadata` file: UTF-8 text, one `KEY=VALUE`
//! assignment per line, at most one assignment per key. The reserved keys
//! describe the snapshot's provenance; anything else is a user tag. Writes
//! go through a sibling temp file and a rename, so a reader never observes
//! a half-written record.

use crate::error::{CheckpointError, Result};
use crate::types::SnapshotName;
use chrono::{SecondsFormat, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// File name of the metadata record inside a snapshot.
pub const METADATA_FILE: &str = ".metadata";

/// Reserved metadata keys, written by the snapshot engine.
pub mod keys {
    /// Human description of the snapshot
    pub const DESCRIPTION: &str = "DESCRIPTION";
    /// Creation instant, ISO-8601 UTC
    pub const CREATED: &str = "CREATED";
    /// Hostname of the machine that took the snapshot
    pub const HOST: &str = "HOST";
    /// Operating system identifier
    pub const SYSTEM: &str = "SYSTEM";
    /// Invoking user
    pub const USER: &str = "USER";
    /// Engine version
    pub const VERSION: &str = "VERSION";
    /// Absolute path of the snapshotted source
    pub const SOURCE: &str = "SOURCE";
}

/// Validate a metadata key against `[A-Za-z0-9_]+`.
pub fn validate_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CheckpointError::InvalidMetadataKey(key.to_string()))
    }
}

/// An ordered set of unique `KEY=VALUE` assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    entries: Vec<(String, String)>,
}

impl MetadataRecord {
    /// An empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard record for a fresh snapshot of `source`.
    pub fn for_snapshot(source: &Path, description: Option<&str>) -> Self {
        let mut record = Self::new();
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());

        record.set_unchecked(keys::DESCRIPTION, description.unwrap_or(""));
        record.set_unchecked(
            keys::CREATED,
            &Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        record.set_unchecked(keys::HOST, &host);
        record.set_unchecked(keys::SYSTEM, std::env::consts::OS);
        record.set_unchecked(keys::USER, &user);
        record.set_unchecked(keys::VERSION, env!("CARGO_PKG_VERSION"));
        record.set_unchecked(keys::SOURCE, &source.display().to_string());
        record
    }

    /// Set a key, validating it first. Overwrites any previous assignment.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        self.set_unchecked(key, value);
        Ok(())
    }

    fn set_unchecked(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    /// Look up a key's value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate assignments in record order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the record contains the exact line `KEY=VALUE`.
    pub fn matches(&self, key: &str, value: &str) -> bool {
        self.get(key) == Some(value)
    }

    /// Parse a record from text. Lines without `=` are ignored; a repeated
    /// key keeps its last assignment.
    pub fn parse(text: &str) -> Self {
        let mut record = Self::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once('=') {
                if !key.is_empty() {
                    record.set_unchecked(key, value);
                }
            }
        }
        record
    }

    /// Render the record as `.metadata` text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

/// Write a record into `snapshot_dir/.metadata` atomically.
pub fn write(snapshot_dir: &Path, record: &MetadataRecord) -> Result<()> {
    let target = snapshot_dir.join(METADATA_FILE);
    atomic_write(&target, record.render().as_bytes())?;
    trace!(path = %target.display(), "wrote metadata record");
    Ok(())
}

/// Read the record of a snapshot directory.
pub fn read(snapshot_dir: &Path) -> Result<MetadataRecord> {
    let text = fs::read_to_string(snapshot_dir.join(METADATA_FILE))?;
    Ok(MetadataRecord::parse(&text))
}

/// Render a snapshot's record for display.
pub fn show(snapshot_dir: &Path) -> Result<String> {
    Ok(read(snapshot_dir)?.render())
}

/// Replace or append one key in a snapshot's record.
///
/// Read-modify-atomic-rename; concurrent updaters without the root lock
/// race and the last rename wins.
pub fn update(snapshot_dir: &Path, key: &str, value: &str) -> Result<()> {
    validate_key(key)?;
    let mut record = read(snapshot_dir)?;
    record.set_unchecked(key, value);
    write(snapshot_dir, &record)?;
    debug!(key, snapshot = %snapshot_dir.display(), "updated metadata");
    Ok(())
}

/// Find snapshots under `root` whose record contains the line `KEY=VALUE`.
///
/// Snapshots without a `.metadata` file are skipped silently.
pub fn find(root: &Path, key: &str, value: &str) -> Result<Vec<SnapshotName>> {
    validate_key(key)?;
    let mut matches = Vec::new();
    for name in crate::snapshot::list_snapshots(root)? {
        let dir = root.join(name.as_str());
        let record = match read(&dir) {
            Ok(record) => record,
            Err(CheckpointError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if record.matches(key, value) {
            matches.push(name);
        }
    }
    Ok(matches)
}

/// Write `content` to `path` via a sibling temp file and an atomic rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp: PathBuf = match path.file_name() {
        Some(name) => {
            let mut tmp = name.to_os_string();
            tmp.push(".tmp");
            path.with_file_name(tmp)
        }
        None => return Err(CheckpointError::internal(format!(
            "cannot derive temp name for {:?}",
            path
        ))),
    };
    fs::write(&temp, content)?;
    fs::rename(&temp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("DESCRIPTION").is_ok());
        assert!(validate_key("my_tag_2").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key("dash-ed").is_err());
    }

    #[test]
    fn test_set_overwrites() {
        let mut record = MetadataRecord::new();
        record.set("TAG", "one").unwrap();
        record.set("TAG", "two").unwrap();
        assert_eq!(record.get("TAG"), Some("two"));
        assert_eq!(record.iter().count(), 1);
    }

    #[test]
    fn test_parse_render_round_trip() {
        let text = "DESCRIPTION=nightly\nSOURCE=/tmp/src\nTAG=x\n";
        let record = MetadataRecord::parse(text);
        assert_eq!(record.get("SOURCE"), Some("/tmp/src"));
        assert_eq!(record.render(), text);
    }

    #[test]
    fn test_parse_tolerates_junk_and_duplicates() {
        let record = MetadataRecord::parse("garbage line\nKEY=a\nKEY=b\n=novalue\n");
        assert_eq!(record.get("KEY"), Some("b"));
        assert_eq!(record.iter().count(), 1);
    }

    #[test]
    fn test_value_with_equals_sign() {
        let record = MetadataRecord::parse("NOTE=a=b=c\n");
        assert_eq!(record.get("NOTE"), Some("a=b=c"));
    }

    #[test]
    fn test_write_read_update() {
        let dir = TempDir::new().unwrap();
        let mut record = MetadataRecord::new();
        record.set("DESCRIPTION", "first").unwrap();
        write(dir.path(), &record).unwrap();

        update(dir.path(), "DESCRIPTION", "second").unwrap();
        update(dir.path(), "EXTRA", "tag").unwrap();

        let loaded = read(dir.path()).unwrap();
        assert_eq!(loaded.get("DESCRIPTION"), Some("second"));
        assert_eq!(loaded.get("EXTRA"), Some("tag"));

        // No temp residue
        assert!(!dir.path().join(".metadata.tmp").exists());
    }

    #[test]
    fn test_update_rejects_bad_key() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), &MetadataRecord::new()).unwrap();
        let err = update(dir.path(), "bad key", "v").unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidMetadataKey(_)));
    }

    #[test]
    fn test_for_snapshot_reserved_keys() {
        let record = MetadataRecord::for_snapshot(Path::new("/tmp/src"), Some("demo"));
        assert_eq!(record.get(keys::DESCRIPTION), Some("demo"));
        assert_eq!(record.get(keys::SOURCE), Some("/tmp/src"));
        assert_eq!(record.get(keys::VERSION), Some(env!("CARGO_PKG_VERSION")));
        assert!(record.get(keys::CREATED).unwrap().ends_with('Z'));
        assert!(record.get(keys::HOST).is_some());
        assert!(record.get(keys::SYSTEM).is_some());
        assert!(record.get(keys::USER).is_some());
    }
}
