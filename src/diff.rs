//! Unified diff rendering for the comparison engine
//!
//! Rendering is a strategy chosen once at startup: the richest available
//! external textual-diff tool wins, and when none is installed the engine
//! falls back to its own line-unified diff built on a longest-common-
//! subsequence pass. Binary content is detected up front and never
//! rendered, only counted.

use crate::error::Result;
use std::path::Path;
use std::process::Command;
use tracing::{debug, trace};

/// External tools probed in preference order.
const PREFERRED_TOOLS: &[&str] = &["colordiff", "diff"];

/// Context lines around each change in the internal renderer.
const CONTEXT_LINES: usize = 3;

/// Check if content appears to be binary: a null byte in the first 8 KB.
pub fn is_binary(content: &[u8]) -> bool {
    let check = content.len().min(8192);
    content[..check].contains(&0)
}

/// Diff rendering strategy, fixed at construction.
#[derive(Debug, Clone)]
pub struct DiffRenderer {
    /// Selected external tool; `None` renders internally
    tool: Option<String>,
}

impl DiffRenderer {
    /// Pick the richest available external tool, falling back to the
    /// internal renderer when none answers a version probe.
    pub fn detect() -> Self {
        for tool in PREFERRED_TOOLS {
            let probe = Command::new(tool)
                .arg("--version")
                .output();
            if matches!(probe, Ok(ref out) if out.status.success()) {
                debug!(tool, "selected external diff tool");
                return Self {
                    tool: Some(tool.to_string()),
                };
            }
        }
        debug!("no external diff tool found; using internal renderer");
        Self { tool: None }
    }

    /// A renderer that never shells out.
    pub fn internal() -> Self {
        Self { tool: None }
    }

    /// Render a unified diff of two on-disk files.
    ///
    /// Labels name the sides in the header (conventionally the snapshot
    /// name and `live`, or the two snapshot names).
    pub fn unified(
        &self,
        old_label: &str,
        new_label: &str,
        old_path: &Path,
        new_path: &Path,
        old_content: &[u8],
        new_content: &[u8],
    ) -> Result<String> {
        if let Some(tool) = &self.tool {
            match Command::new(tool)
                .arg("-u")
                .arg(old_path)
                .arg(new_path)
                .output()
            {
                // Exit 0: identical; exit 1: differences; else tool error
                Ok(out) if out.status.code() == Some(0) || out.status.code() == Some(1) => {
                    return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
                }
                Ok(out) => {
                    trace!(tool, status = ?out.status, "external diff failed; falling back");
                }
                Err(err) => {
                    trace!(tool, %err, "external diff unavailable; falling back");
                }
            }
        }
        Ok(render_unified(
            old_label,
            new_label,
            old_content,
            new_content,
        ))
    }
}

/// One edit operation in the line diff.
#[derive(Debug, Clone, Copy)]
enum Op {
    Keep(usize, usize),
    Del(usize),
    Ins(usize),
}

/// Render a unified diff of two text contents with the internal engine.
pub fn render_unified(old_label: &str, new_label: &str, old: &[u8], new: &[u8]) -> String {
    let old_text = String::from_utf8_lossy(old);
    let new_text = String::from_utf8_lossy(new);
    let old_lines: Vec<&str> = old_text.lines().collect();
    let new_lines: Vec<&str> = new_text.lines().collect();

    let ops = diff_ops(&old_lines, &new_lines);
    let hunks = group_hunks(&ops);
    if hunks.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    out.push_str(&format!("--- {}\n+++ {}\n", old_label, new_label));
    for (start, end) in hunks {
        render_hunk(&mut out, &ops[start..end], &old_lines, &new_lines);
    }
    out
}

/// Compute the edit script between two line slices via an LCS table.
fn diff_ops(old: &[&str], new: &[&str]) -> Vec<Op> {
    let m = old.len();
    let n = new.len();
    let mut table = vec![vec![0u32; n + 1]; m + 1];
    for i in (0..m).rev() {
        for j in (0..n).rev() {
            table[i][j] = if old[i] == new[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(m.max(n));
    let (mut i, mut j) = (0, 0);
    while i < m && j < n {
        if old[i] == new[j] {
            ops.push(Op::Keep(i, j));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            ops.push(Op::Del(i));
            i += 1;
        } else {
            ops.push(Op::Ins(j));
            j += 1;
        }
    }
    while i < m {
        ops.push(Op::Del(i));
        i += 1;
    }
    while j < n {
        ops.push(Op::Ins(j));
        j += 1;
    }
    ops
}

/// Group op indices into hunks: each hunk spans from `CONTEXT_LINES` before
/// its first change to `CONTEXT_LINES` after its last, and adjacent groups
/// whose context would overlap are merged.
fn group_hunks(ops: &[Op]) -> Vec<(usize, usize)> {
    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Keep(_, _)))
        .map(|(idx, _)| idx)
        .collect();
    if changes.is_empty() {
        return Vec::new();
    }

    let mut hunks = Vec::new();
    let mut start = changes[0];
    let mut last = changes[0];
    for &pos in &changes[1..] {
        if pos - last > CONTEXT_LINES * 2 {
            hunks.push((start.saturating_sub(CONTEXT_LINES), (last + CONTEXT_LINES + 1).min(ops.len())));
            start = pos;
        }
        last = pos;
    }
    hunks.push((start.saturating_sub(CONTEXT_LINES), (last + CONTEXT_LINES + 1).min(ops.len())));
    hunks
}

fn render_hunk(out: &mut String, ops: &[Op], old_lines: &[&str], new_lines: &[&str]) {
    let mut old_count = 0usize;
    let mut new_count = 0usize;
    let mut old_start = None;
    let mut new_start = None;

    for op in ops {
        match op {
            Op::Keep(i, j) => {
                old_start.get_or_insert(*i);
                new_start.get_or_insert(*j);
                old_count += 1;
                new_count += 1;
            }
            Op::Del(i) => {
                old_start.get_or_insert(*i);
                old_count += 1;
            }
            Op::Ins(j) => {
                new_start.get_or_insert(*j);
                new_count += 1;
            }
        }
    }

    // Unified headers are 1-based; an empty side points at the line before
    let old_header = if old_count == 0 {
        old_start.unwrap_or(0)
    } else {
        old_start.unwrap_or(0) + 1
    };
    let new_header = if new_count == 0 {
        new_start.unwrap_or(0)
    } else {
        new_start.unwrap_or(0) + 1
    };

    out.push_str(&format!(
        "@@ -{},{} +{},{} @@\n",
        old_header, old_count, new_header, new_count
    ));
    for op in ops {
        match op {
            Op::Keep(i, _) => {
                out.push(' ');
                out.push_str(old_lines[*i]);
            }
            Op::Del(i) => {
                out.push('-');
                out.push_str(old_lines[*i]);
            }
            Op::Ins(j) => {
                out.push('+');
                out.push_str(new_lines[*j]);
            }
        }
        out.push('\n');
    }
}
