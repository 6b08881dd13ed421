//! Exclusion matching for snapshot population
//!
//! Combines the unconditional default patterns, the caller's patterns and
//! the backup root itself (when nested under the source) into one compiled
//! matcher. Patterns use rsync-style glob semantics: a trailing `/`
//! restricts the pattern to directories, a pattern without a slash matches
//! at any depth, and an excluded directory excludes its whole subtree.

use crate::error::Result;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::debug;

/// Patterns excluded from every snapshot, ahead of any user pattern.
///
/// `.gudang/` is the legacy backup directory name; `.tmp.*` and
/// `.checkpoint.lock` are this engine's own transient artefacts, which must
/// never be copied into a snapshot.
pub const DEFAULT_PATTERNS: &[&str] = &[
    ".gudang/",
    "temp/",
    ".temp/",
    "tmp/",
    "*~",
    "~*",
    ".tmp.*",
    ".checkpoint.lock",
];

/// Compiled include/exclude decision for snapshot candidates.
#[derive(Debug)]
pub struct ExclusionMatcher {
    /// Globs applying to entries of any type
    any: GlobSet,
    /// Globs from trailing-slash patterns, directories only
    dir_only: GlobSet,
    /// The combined textual pattern list, for remote parameterisation
    patterns: Vec<String>,
}

impl ExclusionMatcher {
    /// Build a matcher for snapshots of `source` into `backup_root`.
    ///
    /// The default set is prepended to `user_patterns`; if `backup_root`
    /// lies under `source`, its source-relative path is appended as a
    /// directory pattern so the engine can never copy its own output into
    /// itself. Both paths are expected in canonical form.
    pub fn new(source: &Path, backup_root: &Path, user_patterns: &[String]) -> Result<Self> {
        let mut patterns: Vec<String> =
            DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect();
        patterns.extend(user_patterns.iter().cloned());

        if let Ok(rel) = backup_root.strip_prefix(source) {
            if !rel.as_os_str().is_empty() {
                patterns.push(format!("{}/", rel.display()));
            }
        }

        let mut any = GlobSetBuilder::new();
        let mut dir_only = GlobSetBuilder::new();
        for pattern in &patterns {
            let (text, dirs) = match pattern.strip_suffix('/') {
                Some(stripped) => (stripped, true),
                None => (pattern.as_str(), false),
            };
            // Slash-free patterns match at any depth; anchored ones as given.
            let glob_text = if text.contains('/') {
                text.to_string()
            } else {
                format!("**/{}", text)
            };
            let glob = GlobBuilder::new(&glob_text)
                .literal_separator(true)
                .build()?;
            if dirs {
                dir_only.add(glob);
            } else {
                any.add(glob);
            }
        }

        debug!(count = patterns.len(), "compiled exclusion patterns");
        Ok(Self {
            any: any.build()?,
            dir_only: dir_only.build()?,
            patterns,
        })
    }

    /// Decide whether a source-relative path is excluded.
    ///
    /// Ancestors are consulted as well, so querying a file deep inside an
    /// excluded directory yields `true` even when the traversal did not
    /// prune the directory itself.
    pub fn is_excluded(&self, relative: &Path, is_dir: bool) -> bool {
        if self.any.is_match(relative) || (is_dir && self.dir_only.is_match(relative)) {
            return true;
        }
        relative
            .ancestors()
            .skip(1)
            .filter(|a| !a.as_os_str().is_empty())
            .any(|a| self.any.is_match(a) || self.dir_only.is_match(a))
    }

    /// The combined textual patterns, defaults first.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Positive pattern filter used by the comparison and restore engines.
///
/// An empty filter matches everything; a non-empty one matches entries
/// whose relative path (or an ancestor of it) matches any pattern.
#[derive(Debug)]
pub struct PatternFilter {
    globs: GlobSet,
    empty: bool,
}

impl PatternFilter {
    /// Compile a filter from rsync-style patterns.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let text = pattern.strip_suffix('/').unwrap_or(pattern);
            let glob_text = if text.contains('/') {
                text.to_string()
            } else {
                format!("**/{}", text)
            };
            builder.add(
                GlobBuilder::new(&glob_text)
                    .literal_separator(true)
                    .build()?,
            );
        }
        Ok(Self {
            globs: builder.build()?,
            empty: patterns.is_empty(),
        })
    }

    /// Whether a relative path is selected by this filter.
    pub fn matches(&self, relative: &Path) -> bool {
        if self.empty {
            return true;
        }
        relative
            .ancestors()
            .filter(|a| !a.as_os_str().is_empty())
            .any(|a| self.globs.is_match(a))
    }
}
