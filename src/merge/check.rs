//! Pre-apply safety checks: untracked files, path collisions, case folds.
//!
//! The planner's `create`-family actions are provisional: before the
//! applier may write anything, this module cross-references them
//! against what is actually on disk.
//!
//! - [`check_unknown_files`] probes every would-be-created path for an
//!   untracked file with different content (and for target directories
//!   holding untracked files), classifies hits into ignored/unknown
//!   sets via the configured glob patterns, applies the per-set
//!   `abort`/`warn`/`ignore` policy, and rewrites `c`/`cm` actions into
//!   real `g`/`m` actions. Under `force` a looser table applies:
//!   identical content becomes a plain get; differing content becomes
//!   a forced merge (policy `abort`) or a backed-up overwrite (the
//!   displaced file is renamed to `<path>.orig` before the write).
//! - [`check_path_conflicts`] finds file/directory name collisions and
//!   plans the move-aside renames.
//! - [`check_case_collisions`] aborts when the planned result would
//!   put two paths differing only by case on a case-insensitive disk.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use glob::Pattern;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::manifest::{Manifest, NodeId};
use crate::merge::action::{Action, ActionKind, ActionSet, MergeArgs};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// What to do when an untracked file is in the way.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Refuse to proceed, naming the files.
    #[default]
    Abort,
    /// Proceed, warning per file.
    Warn,
    /// Proceed silently.
    Ignore,
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => write!(f, "abort"),
            Self::Warn => write!(f, "warn"),
            Self::Ignore => write!(f, "ignore"),
        }
    }
}

/// Compiled ignore patterns splitting untracked files into the
/// "ignored" and "unknown" sets, each with its own policy.
#[derive(Clone, Debug, Default)]
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    /// Compile glob patterns; invalid ones are skipped with a warning.
    #[must_use]
    pub fn new(globs: &[String]) -> Self {
        let patterns = globs
            .iter()
            .filter_map(|g| match Pattern::new(g) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(pattern = %g, error = %e, "ignoring bad ignore pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    #[must_use]
    pub fn is_ignored(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }
}

// ---------------------------------------------------------------------------
// Working-directory probe
// ---------------------------------------------------------------------------

/// The checker's read-only view of the working directory. The repo
/// layer implements this over the real filesystem; tests implement it
/// over fixtures.
pub trait WorkingDirProbe {
    /// A file (not directory) exists at the path.
    fn is_file(&self, path: &str) -> bool;
    /// A directory exists at the path.
    fn is_dir(&self, path: &str) -> bool;
    /// The path is tracked in the dirstate.
    fn is_tracked(&self, path: &str) -> bool;
    /// The directory contains at least one untracked file.
    fn dir_has_untracked(&self, dir: &str) -> bool;
    /// Read the file's bytes.
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// check_unknown_files
// ---------------------------------------------------------------------------

/// Options for the unknown-file check.
#[derive(Clone, Copy, Debug, Default)]
pub struct CheckOptions {
    pub force: bool,
    pub unknown_policy: CollisionPolicy,
    pub ignored_policy: CollisionPolicy,
}

/// What the checks produced besides the rewritten actions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Human-facing warnings emitted under the `warn` policy.
    pub warnings: Vec<String>,
    /// Paths whose on-disk file must be renamed to `<path>.orig` before
    /// the applier overwrites them.
    pub backups: BTreeSet<String>,
}

/// Probe planned creations against untracked on-disk state and rewrite
/// the provisional `c`/`cm` actions.
///
/// `remote` is the manifest being moved to (resolves `dg` source
/// nodes). `remote_content(path, node)` fetches the content the action
/// would write, for the byte comparison. The content-id fast path
/// applies first: when the untracked file's digest equals the incoming
/// node, no byte fetch is needed.
pub fn check_unknown_files<F>(
    actions: &mut ActionSet,
    opts: CheckOptions,
    ignore: &IgnoreRules,
    probe: &dyn WorkingDirProbe,
    remote: &Manifest,
    remote_content: F,
) -> Result<CheckOutcome, CheckError>
where
    F: Fn(&str, &NodeId) -> std::io::Result<Vec<u8>>,
{
    let mut outcome = CheckOutcome::default();
    let mut ignored_conflicts = Vec::new();
    let mut unknown_conflicts = Vec::new();
    let mut rewrites: Vec<Action> = Vec::new();

    for action in actions.iter() {
        let (node, flag, target) = match &action.kind {
            ActionKind::Create { node, flag } => (node.clone(), *flag, action.path.clone()),
            ActionKind::CreateMerge { node, flag, .. } => (node.clone(), *flag, action.path.clone()),
            ActionKind::DirGet { source, .. } => {
                // Directory-get creates a file too; probe but never
                // rewrite the kind. The incoming content lives at the
                // source path in the remote manifest.
                let node = remote.get(source).map_or_else(NodeId::null, |n| n.id.clone());
                let probe_result =
                    blocking_untracked(&action.path, probe, &|_, n| remote_content(source, n), &node);
                if probe_result == Some(true) {
                    record_conflict(
                        &action.path,
                        ignore,
                        &mut ignored_conflicts,
                        &mut unknown_conflicts,
                    );
                }
                continue;
            }
            _ => continue,
        };

        let in_the_way = blocking_untracked(&target, probe, &|p, n| remote_content(p, n), &node);

        if opts.force {
            // The force decision table.
            match &action.kind {
                ActionKind::Create { .. } => match in_the_way {
                    None | Some(false) => {
                        // Absent, or present with identical content.
                        rewrites.push(Action::new(
                            target,
                            ActionKind::Get { node, flag },
                            action.reason.clone(),
                        ));
                    }
                    Some(true) => {
                        if opts.unknown_policy == CollisionPolicy::Abort {
                            // Under force even the abort policy keeps
                            // going, but through a merge so the local
                            // bytes survive in conflict markers.
                            rewrites.push(Action::new(
                                target.clone(),
                                ActionKind::Merge(MergeArgs {
                                    local_path: target.clone(),
                                    other_path: target.clone(),
                                    ancestor_path: None,
                                    is_move: false,
                                    ancestor_node: NodeId::null(),
                                }),
                                "remote differs from untracked local file",
                            ));
                        } else {
                            outcome.backups.insert(target.clone());
                            outcome
                                .warnings
                                .push(format!("{target}: replacing untracked file (backed up)"));
                            rewrites.push(Action::new(
                                target,
                                ActionKind::Get { node, flag },
                                action.reason.clone(),
                            ));
                        }
                    }
                },
                ActionKind::CreateMerge { .. } => match in_the_way {
                    Some(true) => {
                        rewrites.push(Action::new(
                            target.clone(),
                            ActionKind::Merge(MergeArgs {
                                local_path: target.clone(),
                                other_path: target.clone(),
                                ancestor_path: None,
                                is_move: false,
                                ancestor_node: NodeId::null(),
                            }),
                            "remote differs from untracked local file",
                        ));
                    }
                    None | Some(false) => {
                        rewrites.push(Action::new(
                            target,
                            ActionKind::Get { node, flag },
                            action.reason.clone(),
                        ));
                    }
                },
                _ => unreachable!("only create kinds reach the force table"),
            }
        } else {
            if in_the_way == Some(true) {
                record_conflict(&target, ignore, &mut ignored_conflicts, &mut unknown_conflicts);
            }
            rewrites.push(Action::new(
                target,
                ActionKind::Get { node, flag },
                action.reason.clone(),
            ));
        }
    }

    if !opts.force {
        apply_policy(opts.ignored_policy, "ignored", &ignored_conflicts, &mut outcome)?;
        apply_policy(opts.unknown_policy, "untracked", &unknown_conflicts, &mut outcome)?;
    }

    for action in rewrites {
        actions.insert(action);
    }
    Ok(outcome)
}

/// Is there an untracked file in the way, and does it differ?
///
/// `None` — nothing relevant on disk. `Some(false)` — untracked file
/// with identical content. `Some(true)` — untracked file with different
/// content, or a directory holding untracked files.
fn blocking_untracked(
    path: &str,
    probe: &dyn WorkingDirProbe,
    remote_content: &dyn Fn(&str, &NodeId) -> std::io::Result<Vec<u8>>,
    node: &NodeId,
) -> Option<bool> {
    if probe.is_dir(path) {
        return probe.dir_has_untracked(path).then_some(true);
    }
    if !probe.is_file(path) || probe.is_tracked(path) {
        return None;
    }
    let Ok(on_disk) = probe.read(path) else {
        // Unreadable counts as different; overwriting it silently
        // would destroy data we could not even inspect.
        return Some(true);
    };
    // Content-id fast path.
    if !node.is_sentinel() && NodeId::from_content(&on_disk) == *node {
        return Some(false);
    }
    match remote_content(path, node) {
        Ok(incoming) => Some(incoming != on_disk),
        Err(_) => Some(true),
    }
}

fn record_conflict(
    path: &str,
    ignore: &IgnoreRules,
    ignored: &mut Vec<String>,
    unknown: &mut Vec<String>,
) {
    if ignore.is_ignored(path) {
        ignored.push(path.to_owned());
    } else {
        unknown.push(path.to_owned());
    }
}

fn apply_policy(
    policy: CollisionPolicy,
    label: &str,
    conflicts: &[String],
    outcome: &mut CheckOutcome,
) -> Result<(), CheckError> {
    if conflicts.is_empty() {
        return Ok(());
    }
    match policy {
        CollisionPolicy::Abort => Err(CheckError::UntrackedConflicts {
            files: conflicts.to_vec(),
        }),
        CollisionPolicy::Warn => {
            for path in conflicts {
                warn!(%path, set = label, "untracked file in the way, will be overwritten");
                outcome
                    .warnings
                    .push(format!("{path}: {label} file differs from the incoming version"));
            }
            Ok(())
        }
        CollisionPolicy::Ignore => {
            debug!(count = conflicts.len(), set = label, "overwriting differing untracked files");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// check_path_conflicts
// ---------------------------------------------------------------------------

/// Find file/directory collisions between planned creations and local
/// state, and plan the move-aside renames.
///
/// A created path `a/b/c` collides when some prefix (`a` or `a/b`) is a
/// file that will still exist after the merge — tracked and not being
/// removed, or untracked on disk. The colliding file is marked with a
/// `p` action and renamed to a free `<path>~<n>` name via a `pr`
/// action; the creation itself proceeds untouched.
pub fn check_path_conflicts(
    actions: &mut ActionSet,
    local: &Manifest,
    probe: &dyn WorkingDirProbe,
) {
    // Local files that survive the planned actions.
    let mut remaining: BTreeSet<String> = local.paths().cloned().collect();
    for action in actions.iter() {
        match &action.kind {
            ActionKind::Remove | ActionKind::RemoveGet { .. } => {
                remaining.remove(&action.path);
            }
            ActionKind::Merge(args) if args.is_move => {
                remaining.remove(&args.local_path);
            }
            ActionKind::DirMoveLocal { source, .. } => {
                remaining.remove(source);
            }
            _ => {}
        }
    }

    let created: Vec<String> = actions
        .iter()
        .filter(|a| a.kind.creates_file())
        .map(|a| a.path.clone())
        .collect();

    // The conflict marker lands on the blocking local file (which gets
    // renamed aside); the creating action itself is left untouched.
    let mut new_actions: Vec<Action> = Vec::new();
    for path in &created {
        for prefix in path_prefixes(path) {
            let collides = remaining.contains(prefix)
                || (!probe.is_tracked(prefix) && probe.is_file(prefix));
            if collides && !actions.contains(prefix) {
                let aside = free_name(prefix, probe);
                debug!(created = %path, blocking = prefix, %aside, "path conflict");
                new_actions.push(Action::new(
                    prefix,
                    ActionKind::PathConflict { other: path.clone() },
                    "path conflict",
                ));
                new_actions.push(Action::new(
                    aside,
                    ActionKind::PathConflictResolve { source: prefix.to_owned() },
                    "path conflict rename",
                ));
                break;
            }
        }
    }

    for action in new_actions {
        actions.insert(action);
    }
}

/// Proper directory prefixes of a path: `a/b/c` → `a`, `a/b`.
fn path_prefixes(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .filter(|&(_, c)| c == '/')
        .map(move |(i, _)| &path[..i])
}

/// First free `<path>~<n>` name.
fn free_name(path: &str, probe: &dyn WorkingDirProbe) -> String {
    for n in 1u32.. {
        let candidate = format!("{path}~{n}");
        if !probe.is_file(&candidate) && !probe.is_dir(&candidate) && !probe.is_tracked(&candidate) {
            return candidate;
        }
    }
    unreachable!("some suffix is always free")
}

// ---------------------------------------------------------------------------
// check_case_collisions
// ---------------------------------------------------------------------------

/// Abort when the planned final tree contains two paths that differ
/// only by case. Run this when the working copy sits on a
/// case-insensitive filesystem.
pub fn check_case_collisions(actions: &ActionSet, local: &Manifest) -> Result<(), CheckError> {
    let mut folded: BTreeMap<String, String> = BTreeMap::new();

    let mut final_paths: BTreeSet<String> = local.paths().cloned().collect();
    for action in actions.iter() {
        match &action.kind {
            ActionKind::Remove | ActionKind::RemoveGet { .. } | ActionKind::Forget => {
                final_paths.remove(&action.path);
            }
            _ if action.kind.creates_file() || action.kind.is_merge_like() => {
                final_paths.insert(action.path.clone());
            }
            _ => {}
        }
    }
    // RemoveGet both removes and re-creates its own path.
    for action in actions.iter() {
        if matches!(action.kind, ActionKind::RemoveGet { .. }) {
            final_paths.insert(action.path.clone());
        }
    }

    for path in final_paths {
        let lower = path.to_lowercase();
        if let Some(existing) = folded.get(&lower) {
            if *existing != path {
                return Err(CheckError::CaseCollision {
                    a: existing.clone(),
                    b: path,
                });
            }
        } else {
            folded.insert(lower, path);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors the checks can raise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckError {
    /// Untracked files would be overwritten under the abort policy.
    UntrackedConflicts { files: Vec<String> },
    /// Two result paths differ only by case.
    CaseCollision { a: String, b: String },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UntrackedConflicts { files } => {
                write!(f, "{} untracked file(s) differ from the files they would become:", files.len())?;
                for file in files {
                    write!(f, "\n  - {file}")?;
                }
                write!(f, "\n  To fix: move or delete the files, or rerun with --force to back them up.")
            }
            Self::CaseCollision { a, b } => write!(
                f,
                "case-folding collision between '{a}' and '{b}'\n  The working copy filesystem cannot hold both."
            ),
        }
    }
}

impl std::error::Error for CheckError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
