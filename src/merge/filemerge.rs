//! Content merging: premerge, marker merge, retry protocol, driver.
//!
//! [`premerge`] handles the cheap cases without touching line diffs:
//! identical sides, or one side unchanged from the base. When those
//! fail, [`merge_lines`] runs a line-level three-way merge anchored on
//! lines common to all three versions; overlapping edits become
//! conflict marker blocks.
//!
//! Resolution attempts are retryable. The tool layer can discover that
//! the working file changed underneath it (the staged hash no longer
//! matches) and ask for the same step to be re-run with fresh inputs.
//! That protocol is an explicit outcome enum consumed by
//! [`resolve_with_retry`] in a bounded loop — never an unbounded
//! exception ladder. The retry cap comes from configuration.
//!
//! An optional external merge driver can claim files before per-file
//! resolution starts and gets a conclude hook once nothing is left
//! unresolved.

use std::fmt;
use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Marker labels for the two sides of a conflict block.
#[derive(Clone, Copy, Debug)]
pub struct MergeLabels<'a> {
    pub local: &'a str,
    pub other: &'a str,
}

impl Default for MergeLabels<'_> {
    fn default() -> Self {
        Self { local: "local", other: "other" }
    }
}

// ---------------------------------------------------------------------------
// Premerge
// ---------------------------------------------------------------------------

/// Result of a premerge attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Premerged {
    /// Merged cleanly; here is the content.
    Clean(Vec<u8>),
    /// Overlapping edits remain; a full merge must run.
    Conflicted,
}

/// Cheap three-way resolution: sentinel equality first, then a
/// marker-free line merge. Returns [`Premerged::Conflicted`] rather
/// than emitting markers — the caller decides how to surface conflicts.
#[must_use]
pub fn premerge(base: &[u8], local: &[u8], other: &[u8]) -> Premerged {
    if local == other {
        return Premerged::Clean(local.to_vec());
    }
    if local == base {
        return Premerged::Clean(other.to_vec());
    }
    if other == base {
        return Premerged::Clean(local.to_vec());
    }
    let (merged, conflicts) = merge_lines(base, local, other, MergeLabels::default());
    if conflicts == 0 {
        Premerged::Clean(merged)
    } else {
        Premerged::Conflicted
    }
}

// ---------------------------------------------------------------------------
// Line-level three-way merge
// ---------------------------------------------------------------------------

/// Cap on the LCS table size. Beyond this the merge degrades to a
/// single whole-file conflict block instead of risking quadratic blowup.
const MAX_LCS_CELLS: usize = 4_000_000;

/// Merge `local` and `other` against `base` line by line.
///
/// Returns the merged bytes and the number of conflict blocks emitted.
/// Zero conflicts means the result is clean and final.
#[must_use]
pub fn merge_lines(
    base: &[u8],
    local: &[u8],
    other: &[u8],
    labels: MergeLabels<'_>,
) -> (Vec<u8>, usize) {
    let base_lines = split_lines(base);
    let local_lines = split_lines(local);
    let other_lines = split_lines(other);

    if base_lines.len() * local_lines.len() > MAX_LCS_CELLS
        || base_lines.len() * other_lines.len() > MAX_LCS_CELLS
    {
        warn!("file too large for line merge, emitting whole-file conflict");
        let mut out = Vec::new();
        emit_conflict(&mut out, &local_lines, &other_lines, labels);
        return (out, 1);
    }

    // Anchor on base lines that survive unchanged into both sides.
    let local_match = lcs_matches(&base_lines, &local_lines);
    let other_match = lcs_matches(&base_lines, &other_lines);

    let mut anchors: Vec<(usize, usize, usize)> = Vec::new();
    for (bi, li) in &local_match {
        if let Some(oi) = other_match.iter().find(|(b, _)| b == bi).map(|(_, o)| *o) {
            anchors.push((*bi, *li, oi));
        }
    }

    let mut out = Vec::new();
    let mut conflicts = 0;
    let (mut b, mut l, mut o) = (0usize, 0usize, 0usize);

    for (ab, al, ao) in anchors.into_iter().chain(std::iter::once((
        base_lines.len(),
        local_lines.len(),
        other_lines.len(),
    ))) {
        // Changed region before the anchor.
        let base_chunk = &base_lines[b..ab];
        let local_chunk = &local_lines[l..al];
        let other_chunk = &other_lines[o..ao];
        conflicts += emit_region(&mut out, base_chunk, local_chunk, other_chunk, labels);

        // The anchor line itself (absent for the synthetic final anchor).
        if ab < base_lines.len() {
            out.extend_from_slice(base_lines[ab]);
        }
        b = ab + 1;
        l = al + 1;
        o = ao + 1;
    }

    (out, conflicts)
}

/// Resolve one changed region; returns the number of conflicts emitted.
fn emit_region(
    out: &mut Vec<u8>,
    base: &[&[u8]],
    local: &[&[u8]],
    other: &[&[u8]],
    labels: MergeLabels<'_>,
) -> usize {
    if chunks_equal(local, other) {
        for line in local {
            out.extend_from_slice(line);
        }
        0
    } else if chunks_equal(local, base) {
        for line in other {
            out.extend_from_slice(line);
        }
        0
    } else if chunks_equal(other, base) {
        for line in local {
            out.extend_from_slice(line);
        }
        0
    } else {
        emit_conflict(out, local, other, labels);
        1
    }
}

fn emit_conflict(out: &mut Vec<u8>, local: &[&[u8]], other: &[&[u8]], labels: MergeLabels<'_>) {
    out.extend_from_slice(format!("<<<<<<< {}\n", labels.local).as_bytes());
    for line in local {
        out.extend_from_slice(line);
    }
    out.extend_from_slice(b"=======\n");
    for line in other {
        out.extend_from_slice(line);
    }
    out.extend_from_slice(format!(">>>>>>> {}\n", labels.other).as_bytes());
}

fn chunks_equal(a: &[&[u8]], b: &[&[u8]]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

/// Split into lines, each keeping its trailing newline if present.
fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if byte == b'\n' {
            lines.push(&bytes[start..=i]);
            start = i + 1;
        }
    }
    if start < bytes.len() {
        lines.push(&bytes[start..]);
    }
    lines
}

/// Longest common subsequence as matched index pairs, strictly
/// increasing on both sides.
fn lcs_matches(a: &[&[u8]], b: &[&[u8]]) -> Vec<(usize, usize)> {
    let n = a.len();
    let m = b.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if a[i] == b[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }

    let mut matches = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            matches.push((i, j));
            i += 1;
            j += 1;
        } else if table[idx(i + 1, j)] >= table[idx(i, j + 1)] {
            i += 1;
        } else {
            j += 1;
        }
    }
    matches
}

// ---------------------------------------------------------------------------
// Retry protocol
// ---------------------------------------------------------------------------

/// One resolution attempt's report back to the retry loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptResult {
    /// The file is resolved.
    Applied,
    /// The file remains conflicted; markers were left for the user.
    Unresolved,
    /// Inputs went stale (the working file changed underneath); re-run
    /// the same step with refreshed inputs.
    Retry,
    /// The attempt failed outright.
    Failed(String),
}

/// Final outcome of a bounded resolve loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolveOutcome {
    Applied,
    Unresolved,
    Failed(String),
}

/// Run `attempt` up to `1 + retry_cap` times, re-invoking on
/// [`AttemptResult::Retry`]. Exhausting the cap is a per-file failure,
/// not a hang.
pub fn resolve_with_retry<F>(retry_cap: u32, mut attempt: F) -> ResolveOutcome
where
    F: FnMut() -> AttemptResult,
{
    for round in 0..=retry_cap {
        match attempt() {
            AttemptResult::Applied => return ResolveOutcome::Applied,
            AttemptResult::Unresolved => return ResolveOutcome::Unresolved,
            AttemptResult::Failed(reason) => return ResolveOutcome::Failed(reason),
            AttemptResult::Retry => {
                debug!(round, "resolve inputs went stale, retrying");
            }
        }
    }
    ResolveOutcome::Failed(format!("gave up after {retry_cap} stale-input retries"))
}

// ---------------------------------------------------------------------------
// Merge driver
// ---------------------------------------------------------------------------

/// An external script that can claim conflicted files.
///
/// The command runs through `sh -c` from the repository root. Commands
/// come from repo configuration, which the project owner controls —
/// the same trust model as hooks and Makefiles.
///
/// Protocol:
/// - preprocess: invoked with `ESTUARY_DRIVER_PHASE=preprocess` and the
///   conflicted paths as arguments; every path it prints on stdout
///   (one per line) is marked driver-resolved.
/// - conclude: invoked with `ESTUARY_DRIVER_PHASE=conclude` once no
///   unresolved files remain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeDriver {
    command: String,
}

impl MergeDriver {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }

    /// The configured command line, used as the driver's identity in
    /// merge state.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.command
    }

    /// Run the preprocess hook; returns the paths the driver claimed.
    pub fn preprocess(&self, root: &Path, conflicted: &[String]) -> Result<Vec<String>, DriverError> {
        let output = self.run(root, "preprocess", conflicted)?;
        let claimed: Vec<String> = String::from_utf8_lossy(&output)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        debug!(claimed = claimed.len(), "merge driver preprocess finished");
        Ok(claimed)
    }

    /// Run the conclude hook.
    pub fn conclude(&self, root: &Path) -> Result<(), DriverError> {
        self.run(root, "conclude", &[])?;
        Ok(())
    }

    fn run(&self, root: &Path, phase: &str, args: &[String]) -> Result<Vec<u8>, DriverError> {
        let mut shell_cmd = self.command.clone();
        for arg in args {
            shell_cmd.push(' ');
            shell_cmd.push_str(&shell_quote(arg));
        }
        let output = Command::new("sh")
            .args(["-c", &shell_cmd])
            .env("ESTUARY_DRIVER_PHASE", phase)
            .current_dir(root)
            .output()
            .map_err(|e| DriverError::Spawn { command: self.command.clone(), detail: e.to_string() })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(DriverError::Failed {
                command: self.command.clone(),
                phase: phase.to_owned(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Errors from the external merge driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverError {
    /// The driver process could not be spawned.
    Spawn { command: String, detail: String },
    /// The driver exited non-zero.
    Failed {
        command: String,
        phase: String,
        exit_code: Option<i32>,
        stderr: String,
    },
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { command, detail } => {
                write!(f, "failed to spawn merge driver `{command}`: {detail}")
            }
            Self::Failed { command, phase, exit_code, stderr } => {
                write!(f, "merge driver `{command}` {phase} failed")?;
                if let Some(code) = exit_code {
                    write!(f, " (exit {code})")?;
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for DriverError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
