//! Remote dispatch over a secure shell transport
//!
//! The dispatcher mirrors the local verbs against a `(user, host, path)`
//! target. Every call tunnels through `ssh` in batch mode with
//! `accept-new` host-key checking, the configured identity only, and no
//! agent forwarding; tree streaming rides `rsync` over the same transport
//! with resume semantics.
//!
//! Input hardening runs at ingress, before any transport call: the remote
//! root must match `[A-Za-z0-9_./-]+` and may not contain `..`, checkpoint
//! identifiers must parse as snapshot names, and timeouts must be positive
//! integers. Because the root survives that filter it can be embedded in
//! remote command lines without quoting surprises; free-form values such
//! as metadata text are still shell-quoted.

use crate::error::{CheckpointError, Result};
use crate::exclude::PatternFilter;
use crate::metadata::{self, MetadataRecord};
use crate::platform;
use crate::retention;
use crate::types::{
    CompareMode, CompareReport, ComparedEntry, EntryClass, PruneReport, RestoreAction,
    RestoreOptions, RestoreReport, RetentionRule, SnapshotName, SnapshotOptions, VerifyMode,
    VerifyReport,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Characters legal in a remote root path.
fn is_remote_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-')
}

/// A parsed `user@host:path` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    /// Login user on the far end
    pub user: String,
    /// Remote host name or address
    pub host: String,
    /// Backup root path on the far end
    pub path: String,
}

impl RemoteSpec {
    /// Parse and harden a remote specification.
    ///
    /// This is the ingress filter: any violation is rejected here, before
    /// a transport call can exist.
    pub fn parse(spec: &str) -> Result<Self> {
        let reject = |reason: &str| CheckpointError::InvalidRemotePath {
            path: spec.to_string(),
            reason: reason.to_string(),
        };

        let (user, rest) = spec
            .split_once('@')
            .ok_or_else(|| reject("expected user@host:path"))?;
        let (host, path) = rest
            .split_once(':')
            .ok_or_else(|| reject("expected user@host:path"))?;

        if user.is_empty() || host.is_empty() {
            return Err(reject("user and host must be non-empty"));
        }
        if path.is_empty() {
            return Err(reject("path must be non-empty"));
        }
        if path.contains("..") {
            return Err(reject("path cannot contain directory traversal"));
        }
        if !path.chars().all(is_remote_path_char) {
            return Err(reject("path contains characters outside [A-Za-z0-9_./-]"));
        }

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            path: path.to_string(),
        })
    }

    /// The `user@host` half, as ssh wants it.
    pub fn ssh_target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Transport parameters for remote calls.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Private key the transport is limited to
    pub identity: Option<PathBuf>,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Far-end lock acquisition budget in seconds
    pub lock_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            identity: None,
            connect_timeout_secs: 30,
            lock_timeout_secs: 30,
        }
    }
}

/// Parse a user-supplied timeout value as a positive integer of seconds.
pub fn parse_timeout(option: &'static str, value: &str) -> Result<u64> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(CheckpointError::InvalidOptionValue {
            option,
            value: value.to_string(),
        }),
    }
}

/// Quote a free-form string for a POSIX shell command line.
fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Executes the snapshot verbs against a remote backup root.
#[derive(Debug)]
pub struct RemoteDispatcher {
    spec: RemoteSpec,
    config: RemoteConfig,
}

impl RemoteDispatcher {
    /// Build a dispatcher for a hardened remote spec.
    pub fn new(spec: RemoteSpec, config: RemoteConfig) -> Self {
        Self { spec, config }
    }

    /// The hardened target this dispatcher talks to.
    pub fn spec(&self) -> &RemoteSpec {
        &self.spec
    }

    /// Shared ssh hardening flags, in `-o` form.
    fn ssh_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            "-o".to_string(),
            "ForwardAgent=no".to_string(),
        ];
        if let Some(identity) = &self.config.identity {
            options.push("-o".to_string());
            options.push("IdentitiesOnly=yes".to_string());
            options.push("-i".to_string());
            options.push(identity.display().to_string());
        }
        options
    }

    /// An `ssh` invocation running `script` on the far end.
    fn ssh_command(&self, script: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_options());
        cmd.arg(self.spec.ssh_target());
        cmd.arg(script);
        cmd
    }

    /// The `-e` transport string handed to rsync.
    fn rsync_transport(&self) -> String {
        let mut transport = "ssh".to_string();
        for option in self.ssh_options() {
            transport.push(' ');
            transport.push_str(&option);
        }
        transport
    }

    /// Run a remote script and capture its output.
    fn run_remote(&self, script: &str) -> Result<Output> {
        debug!(host = %self.spec.host, script, "remote call");
        let output = self.ssh_command(script).output().map_err(map_spawn("ssh"))?;
        Ok(output)
    }

    /// Run a remote script that must succeed.
    fn run_remote_checked(&self, verb: &str, script: &str) -> Result<Output> {
        let output = self.run_remote(script)?;
        if !output.status.success() {
            return Err(CheckpointError::remote(format!(
                "{} failed on {}: {}",
                verb,
                self.spec.host,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    /// Probe for the remote root, creating it when asked.
    pub fn probe_root(&self, create: bool) -> Result<bool> {
        let exists = self
            .run_remote(&format!("test -d {}", self.spec.path))?
            .status
            .success();
        if exists {
            return Ok(true);
        }
        if create {
            self.run_remote_checked("probe", &format!("mkdir -p {}", self.spec.path))?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Enumerate the snapshots under the remote root, oldest first.
    ///
    /// An absent root yields an empty list, never an error.
    #[instrument(skip(self), fields(host = %self.spec.host))]
    pub fn list(&self) -> Result<Vec<SnapshotName>> {
        let output = self.run_remote(&format!("ls -1 {} 2>/dev/null", self.spec.path))?;
        let mut names: Vec<SnapshotName> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| SnapshotName::parse(line.trim()).ok())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Enumerate snapshots with their metadata records.
    pub fn list_detailed(&self) -> Result<Vec<(SnapshotName, Option<MetadataRecord>)>> {
        let mut detailed = Vec::new();
        for name in self.list()? {
            let record = self.metadata_show(&name).ok().map(|t| MetadataRecord::parse(&t));
            detailed.push((name, record));
        }
        Ok(detailed)
    }

    /// Create a snapshot of a local source on the far end.
    ///
    /// Mirrors the local pipeline step for step: remote lock, remote
    /// stage, streamed population with resume semantics, remote metadata,
    /// and an atomic far-end rename as the commit point. Hardlink
    /// deduplication against the latest prior snapshot rides rsync's
    /// link-dest mechanism.
    #[instrument(skip(self, source, patterns, options), fields(host = %self.spec.host))]
    pub fn create(
        &self,
        source: &Path,
        patterns: &[String],
        options: &SnapshotOptions,
    ) -> Result<SnapshotName> {
        let source = platform::canonicalize(source)
            .map_err(|_| CheckpointError::SourceUnreadable(source.to_path_buf()))?;
        let mut record = MetadataRecord::for_snapshot(&source, options.description.as_deref());
        for (key, value) in &options.tags {
            record.set(key, value)?;
        }
        let name =
            SnapshotName::from_parts(&platform::timestamp_now(), options.suffix.as_deref())?;

        self.probe_root(true)?;
        self.acquire_remote_lock()?;
        let result = self.create_locked(&source, patterns, options, &name, &record);
        self.release_remote_lock();
        result?;

        if let Some(rule) = options.retain {
            // The lock was released above; retain re-acquires it
            self.retain(rule, false)?;
        }
        info!(snapshot = %name, "remote snapshot published");
        Ok(name)
    }

    fn create_locked(
        &self,
        source: &Path,
        patterns: &[String],
        options: &SnapshotOptions,
        name: &SnapshotName,
        record: &MetadataRecord,
    ) -> Result<()> {
        let root = &self.spec.path;
        let token = Uuid::new_v4().simple().to_string();
        let stage = format!("{}/.tmp.{}", root, token);
        let published = format!("{}/{}", root, name.as_str());

        let base = if options.hardlink {
            self.list()?.into_iter().max()
        } else {
            None
        };

        self.run_remote_checked("stage", &format!("mkdir {}", stage))?;
        let staged = (|| -> Result<()> {
            let mut rsync = Command::new("rsync");
            rsync
                .arg("--archive")
                .arg("--partial")
                .arg("-e")
                .arg(self.rsync_transport());
            for pattern in patterns {
                rsync.arg(format!("--exclude={}", pattern));
            }
            if let Some(base) = &base {
                rsync.arg(format!("--link-dest=../{}", base.as_str()));
            }
            let mut from = source.display().to_string();
            if !from.ends_with('/') {
                from.push('/');
            }
            rsync
                .arg(from)
                .arg(format!("{}:{}/", self.spec.ssh_target(), stage));

            let output = rsync.output().map_err(map_spawn("rsync"))?;
            if !output.status.success() {
                return Err(CheckpointError::remote(format!(
                    "stream to {} failed: {}",
                    self.spec.host,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }

            self.run_remote_checked(
                "metadata",
                &format!(
                    "printf '%s' {} > {}/{}",
                    shell_quote(&record.render()),
                    stage,
                    metadata::METADATA_FILE
                ),
            )?;

            // Far-end rename is the commit point
            self.run_remote_checked(
                "publish",
                &format!("[ ! -e {} ] && mv {} {}", published, stage, published),
            )?;
            Ok(())
        })();

        if staged.is_err() {
            // Best effort: the far end must not keep a half-written stage
            let _ = self.run_remote(&format!("rm -rf {}", stage));
        }
        staged
    }

    /// Verify a remote snapshot against a local source tree.
    ///
    /// Runs an rsync dry-run with checksums; any itemized change is a
    /// mismatch. The entry count is the union of both sides: every local
    /// file plus any snapshot-only entries the dry run would delete.
    #[instrument(skip(self, source), fields(host = %self.spec.host))]
    pub fn verify(&self, name: &SnapshotName, source: &Path) -> Result<VerifyReport> {
        let changes = self.itemized_changes(source, name, &[])?;
        let snapshot_only = changes
            .iter()
            .filter(|(_, class)| *class == EntryClass::OnlyInLeft)
            .count();
        let entries_checked = local_entries(source, &[])?.len() + snapshot_only;
        let mismatches = changes
            .into_iter()
            .map(|(path, class)| {
                let reason = match class {
                    EntryClass::OnlyInRight => "missing from snapshot".to_string(),
                    EntryClass::OnlyInLeft => "missing from source".to_string(),
                    _ => "content differs".to_string(),
                };
                (path, reason)
            })
            .collect::<Vec<_>>();
        Ok(VerifyReport {
            snapshot: name.clone(),
            entries_checked,
            mode: VerifyMode::Digest,
            mismatches,
        })
    }

    /// Compare a remote snapshot against a local live directory.
    ///
    /// rsync reports only the differing paths, so every local entry absent
    /// from the itemized output is classified `Identical`; checksums keep
    /// the classification content-based, matching the local engine.
    #[instrument(skip(self, live_dir, patterns), fields(host = %self.spec.host))]
    pub fn compare(
        &self,
        name: &SnapshotName,
        live_dir: &Path,
        patterns: &[String],
    ) -> Result<CompareReport> {
        let changes = self.itemized_changes(live_dir, name, patterns)?;
        let changed: BTreeSet<PathBuf> = changes.iter().map(|(path, _)| path.clone()).collect();

        let mut entries: Vec<ComparedEntry> = changes
            .into_iter()
            .map(|(path, class)| ComparedEntry { path, class })
            .collect();
        for rel in local_entries(live_dir, patterns)? {
            if !changed.contains(&rel) {
                entries.push(ComparedEntry {
                    path: rel,
                    class: EntryClass::Identical,
                });
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(CompareReport {
            left: PathBuf::from(format!("{}:{}/{}", self.spec.host, self.spec.path, name)),
            right: live_dir.to_path_buf(),
            mode: CompareMode::SnapshotVsLive,
            entries,
            diffs: Vec::new(),
            errors: Vec::new(),
        })
    }

    /// Restore a remote snapshot into a local target directory.
    ///
    /// Every run is itemized, so the report carries the per-file actions
    /// for real restores as well as dry runs. rsync's partial-transfer
    /// exits (23, 24) do not abort: the failures land in `report.failed`
    /// and the report's status becomes `PartialRestore`.
    #[instrument(skip(self, options), fields(host = %self.spec.host))]
    pub fn restore(&self, name: &SnapshotName, options: &RestoreOptions) -> Result<RestoreReport> {
        let target = options
            .target
            .clone()
            .ok_or_else(|| CheckpointError::internal(
                "remote restore requires an explicit target".to_string(),
            ))?;

        let mut rsync = Command::new("rsync");
        rsync
            .arg("--archive")
            .arg("--partial")
            .arg("--itemize-changes")
            .arg("--stats")
            .arg("-e")
            .arg(self.rsync_transport())
            .arg(format!("--exclude={}", metadata::METADATA_FILE));
        if options.dry_run {
            rsync.arg("--dry-run");
        }
        if options.full_replace {
            rsync.arg("--delete");
        }
        for pattern in &options.patterns {
            rsync.arg(format!("--include={}", pattern));
        }
        if !options.patterns.is_empty() {
            rsync.arg("--include=*/").arg("--exclude=*");
        }
        rsync
            .arg(format!(
                "{}:{}/{}/",
                self.spec.ssh_target(),
                self.spec.path,
                name.as_str()
            ))
            .arg(format!("{}/", target.display()));

        let output = rsync.output().map_err(map_spawn("rsync"))?;
        // 23/24: some files could not be transferred or vanished mid-run
        let partial = matches!(output.status.code(), Some(23) | Some(24));
        if !output.status.success() && !partial {
            return Err(CheckpointError::remote(format!(
                "restore from {} failed: {}",
                self.spec.host,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let actions: Vec<(PathBuf, RestoreAction)> = parse_itemized(&stdout)
            .into_iter()
            .map(|(path, class)| (path, action_for_class(class)))
            .collect();
        let mut failed = if partial {
            parse_failures(&String::from_utf8_lossy(&output.stderr))
        } else {
            Vec::new()
        };
        if partial && failed.is_empty() {
            failed.push((
                PathBuf::from("?"),
                format!("rsync exited {:?}", output.status.code()),
            ));
        }
        if !failed.is_empty() {
            warn!(host = %self.spec.host, failures = failed.len(), "restore was partial");
        }

        Ok(RestoreReport {
            snapshot: name.clone(),
            target,
            dry_run: options.dry_run,
            actions,
            bytes_written: if options.dry_run {
                0
            } else {
                parse_stats_bytes(&stdout)
            },
            failed,
            pre_diff: None,
        })
    }

    /// Apply a retention rule on the far end.
    #[instrument(skip(self), fields(host = %self.spec.host))]
    pub fn retain(&self, rule: RetentionRule, prune_only: bool) -> Result<PruneReport> {
        self.acquire_remote_lock()?;
        let result = (|| -> Result<PruneReport> {
            let names = self.list()?;
            let examined = names.len();
            let keep_latest = !(prune_only && rule == RetentionRule::KeepCount(0));
            let mut doomed = retention::select_doomed(&names, rule, keep_latest);
            doomed.sort();
            for name in &doomed {
                self.run_remote_checked(
                    "retain",
                    &format!("rm -rf {}/{}", self.spec.path, name.as_str()),
                )?;
            }
            Ok(PruneReport {
                examined,
                deleted: doomed,
            })
        })();
        self.release_remote_lock();
        result
    }

    /// Fetch a remote snapshot's metadata record text.
    pub fn metadata_show(&self, name: &SnapshotName) -> Result<String> {
        let output = self.run_remote_checked(
            "metadata show",
            &format!("cat {}/{}/{}", self.spec.path, name.as_str(), metadata::METADATA_FILE),
        )?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Update one key in a remote snapshot's metadata record.
    pub fn metadata_update(&self, name: &SnapshotName, key: &str, value: &str) -> Result<()> {
        metadata::validate_key(key)?;
        let mut record = MetadataRecord::parse(&self.metadata_show(name)?);
        record.set(key, value)?;
        let path = format!(
            "{}/{}/{}",
            self.spec.path,
            name.as_str(),
            metadata::METADATA_FILE
        );
        self.run_remote_checked(
            "metadata update",
            &format!(
                "printf '%s' {} > {}.tmp && mv {}.tmp {}",
                shell_quote(&record.render()),
                path,
                path,
                path
            ),
        )?;
        Ok(())
    }

    /// Find remote snapshots whose record contains `KEY=VALUE`.
    pub fn metadata_find(&self, key: &str, value: &str) -> Result<Vec<SnapshotName>> {
        metadata::validate_key(key)?;
        let line = format!("{}={}", key, value);
        let output = self.run_remote(&format!(
            "grep -lx {} {}/*/{} 2>/dev/null",
            shell_quote(&line),
            self.spec.path,
            metadata::METADATA_FILE
        ))?;
        let mut names: Vec<SnapshotName> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|path| {
                Path::new(path)
                    .parent()
                    .and_then(|dir| dir.file_name())
                    .and_then(|os| os.to_str())
                    .and_then(|text| SnapshotName::parse(text).ok())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// The far-end lock protocol; the remote filesystem is the authority.
    fn acquire_remote_lock(&self) -> Result<()> {
        let lock_dir = format!("{}/.checkpoint.lock", self.spec.path);
        let mut remaining = self.config.lock_timeout_secs;
        loop {
            let acquired = self
                .run_remote(&format!(
                    "mkdir {} 2>/dev/null && echo $$ > {}/pid && date +%s > {}/timestamp",
                    lock_dir, lock_dir, lock_dir
                ))?
                .status
                .success();
            if acquired {
                return Ok(());
            }

            let pid_output = self.run_remote(&format!("cat {}/pid 2>/dev/null", lock_dir))?;
            let holder = String::from_utf8_lossy(&pid_output.stdout)
                .trim()
                .parse::<u32>()
                .ok();
            let live = match holder {
                Some(pid) => self
                    .run_remote(&format!("kill -0 {} 2>/dev/null", pid))?
                    .status
                    .success(),
                None => false,
            };
            if live {
                if remaining == 0 {
                    return Err(CheckpointError::LockTimeout {
                        root: PathBuf::from(&self.spec.path),
                        held_by: holder,
                    });
                }
                thread::sleep(Duration::from_secs(1));
                remaining -= 1;
            } else {
                warn!(host = %self.spec.host, ?holder, "reclaiming stale remote lock");
                self.run_remote_checked("lock", &format!("rm -rf {}", lock_dir))?;
            }
        }
    }

    fn release_remote_lock(&self) {
        let lock_dir = format!("{}/.checkpoint.lock", self.spec.path);
        if let Err(e) = self.run_remote(&format!("rm -rf {}", lock_dir)) {
            warn!(host = %self.spec.host, error = %e, "remote lock release failed");
        }
    }

    /// Dry-run rsync between a local tree and a remote snapshot, parsed
    /// into per-path classifications. Checksums keep the comparison
    /// content-based rather than quick-check (size and mtime) based.
    fn itemized_changes(
        &self,
        local: &Path,
        name: &SnapshotName,
        patterns: &[String],
    ) -> Result<Vec<(PathBuf, EntryClass)>> {
        let mut rsync = Command::new("rsync");
        rsync
            .arg("--archive")
            .arg("--dry-run")
            .arg("--itemize-changes")
            .arg("--checksum")
            .arg("--delete")
            .arg("-e")
            .arg(self.rsync_transport())
            .arg(format!("--exclude={}", metadata::METADATA_FILE));
        for pattern in patterns {
            rsync.arg(format!("--include={}", pattern));
        }
        if !patterns.is_empty() {
            rsync.arg("--include=*/").arg("--exclude=*");
        }
        let mut from = local.display().to_string();
        if !from.ends_with('/') {
            from.push('/');
        }
        rsync.arg(from).arg(format!(
            "{}:{}/{}/",
            self.spec.ssh_target(),
            self.spec.path,
            name.as_str()
        ));

        let output = rsync.output().map_err(map_spawn("rsync"))?;
        if !output.status.success() {
            return Err(CheckpointError::remote(format!(
                "comparison stream to {} failed: {}",
                self.spec.host,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_itemized(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn map_spawn(tool: &'static str) -> impl Fn(std::io::Error) -> CheckpointError {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CheckpointError::MissingTool(tool.to_string())
        } else {
            CheckpointError::Io(e)
        }
    }
}

/// Parse `rsync --itemize-changes` output into per-path classes.
///
/// Classes follow the transfer direction: rsync's destination is the left
/// side and its source the right. A `*deleting` line (present only at the
/// destination) is `OnlyInLeft`, a fresh transfer (missing at the
/// destination) `OnlyInRight`, any other transfer `Differs`.
///
/// Only genuine itemize lines are accepted: attribute-only updates
/// (leading `.`), directory noise, and `--stats` summary lines are all
/// skipped, so the parser can run over combined output.
fn parse_itemized(output: &str) -> Vec<(PathBuf, EntryClass)> {
    let mut changes = Vec::new();
    for line in output.lines() {
        let line = line.trim_end();
        if let Some(path) = line.strip_prefix("*deleting") {
            changes.push((PathBuf::from(path.trim()), EntryClass::OnlyInLeft));
            continue;
        }
        let Some((code, path)) = line.split_once(' ') else {
            continue;
        };
        let code = code.as_bytes();
        // Itemize codes are YXcstpoguax: a transfer marker, then the
        // entry type, then attribute flags
        if code.len() < 9 || !matches!(code[0], b'<' | b'>' | b'c' | b'h') {
            continue;
        }
        if !matches!(code[1], b'f' | b'L') {
            continue;
        }
        let path = path.trim();
        if path.is_empty() || path.ends_with('/') {
            continue;
        }
        let class = if code[2..].contains(&b'+') {
            EntryClass::OnlyInRight
        } else {
            EntryClass::Differs
        };
        changes.push((PathBuf::from(path), class));
    }
    changes
}

/// Restore action implied by an itemized class. In a restore the snapshot
/// is rsync's source and the target its destination, so a snapshot-only
/// entry is created, a target-only entry deleted, and the rest overwritten.
fn action_for_class(class: EntryClass) -> RestoreAction {
    match class {
        EntryClass::OnlyInRight => RestoreAction::Create,
        EntryClass::OnlyInLeft => RestoreAction::Delete,
        _ => RestoreAction::Overwrite,
    }
}

/// Collect the comparable local entries (files and symlinks) of a tree,
/// restricted by patterns. The counterpart of the far end's file list.
fn local_entries(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let filter = PatternFilter::new(patterns)?;
    let mut entries = Vec::new();
    if !root.exists() {
        return Ok(entries);
    }
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        let rel = platform::relative_to(root, entry.path());
        if rel.as_os_str().is_empty() || rel == Path::new(metadata::METADATA_FILE) {
            continue;
        }
        if !entry.file_type().is_file() && !entry.file_type().is_symlink() {
            continue;
        }
        if filter.matches(&rel) {
            entries.push(rel);
        }
    }
    Ok(entries)
}

/// Per-file failures reported on rsync's stderr, one entry per diagnostic
/// line, with the quoted path extracted when present.
fn parse_failures(stderr: &str) -> Vec<(PathBuf, String)> {
    stderr
        .lines()
        .filter(|line| {
            line.starts_with("rsync:")
                || line.starts_with("rsync error:")
                || line.starts_with("file has vanished")
        })
        .map(|line| {
            let path = line
                .split('"')
                .nth(1)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("?"));
            (path, line.to_string())
        })
        .collect()
}

/// Transferred byte count from rsync's `--stats` block.
fn parse_stats_bytes(stdout: &str) -> u64 {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("Total transferred file size:"))
        .map(|rest| rest.chars().filter(char::is_ascii_digit).collect::<String>())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}
