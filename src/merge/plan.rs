//! The merge planner: classify every changed path into an action.
//!
//! [`manifest_merge`] runs the single-ancestor algorithm: diff the
//! local and remote manifests (optionally restricted to the paths the
//! ancestor-vs-remote diff and the copy maps make relevant), then walk
//! each entry through a fixed classification chain. The direction
//! convention matters and is tested: local differs from ancestor while
//! remote equals ancestor means `keep` (remote unchanged); local equals
//! ancestor while remote differs means `get` (remote is newer).
//!
//! Two follow-up passes live here as well:
//! - [`resolve_trivial`] downgrades change/delete conflicts whose
//!   changed side is byte-identical to the ancestor,
//! - [`forget_removed`] synthesizes `forget` actions for working-copy
//!   files already marked removed or missing from disk, which plain
//!   filesystem state cannot express otherwise.
//!
//! Multi-ancestor planning runs this per ancestor and feeds the results
//! to the bid auction in [`crate::merge::bid`].

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::manifest::{diff_with, FileFlag, Manifest, Matcher, NodeId};
use crate::merge::action::{Action, ActionKind, ActionSet, MergeArgs};

// ---------------------------------------------------------------------------
// Copy detection output
// ---------------------------------------------------------------------------

/// Output of the copy/rename detection oracle for one (local, remote,
/// ancestor) triple. The planner consumes it read-only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyDetection {
    /// Rename/copy records: destination path → source path.
    pub copy: BTreeMap<String, String>,
    /// Files caught inside a directory the other side renamed:
    /// old path → new path.
    pub move_with_dir: BTreeMap<String, String>,
    /// Renamed directory prefixes: old directory → new directory.
    pub dir_move: BTreeMap<String, String>,
    /// Divergent renames: one source renamed to several destinations.
    pub divergent: BTreeMap<String, Vec<String>>,
    /// Renames whose source the other side deleted: source → destinations.
    pub rename_delete: BTreeMap<String, Vec<String>>,
}

impl CopyDetection {
    /// The set of copy sources, i.e. paths consumed by a rename whose
    /// destination is handled on the other side of the diff.
    #[must_use]
    pub fn sources(&self) -> BTreeSet<&str> {
        self.copy.values().map(String::as_str).collect()
    }

    /// Destination directory → source directory, derived from
    /// [`CopyDetection::dir_move`].
    #[must_use]
    pub fn reverse_dir_move(&self) -> BTreeMap<String, String> {
        self.dir_move
            .iter()
            .map(|(src, dst)| (dst.clone(), src.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Options + outcome
// ---------------------------------------------------------------------------

/// Switches controlling a planning run.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlanOptions {
    /// Branch merge (two parents kept) rather than a linear update.
    pub branchmerge: bool,
    /// Merge into dirty/unrelated state is permitted.
    pub force: bool,
    /// Auto-resolve change/delete conflicts in the remote's favor.
    pub acceptremote: bool,
}

/// What the planner hands back: actions plus the rename warnings the
/// oracle raised, which the orchestrator reports to the user.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlanOutcome {
    pub actions: ActionSet,
    pub divergent: BTreeMap<String, Vec<String>>,
    pub rename_delete: BTreeMap<String, Vec<String>>,
}

// ---------------------------------------------------------------------------
// manifest_merge
// ---------------------------------------------------------------------------

/// Plan the reconciliation of `local` and `remote` against `ancestor`.
///
/// `differs(path)` resolves content comparison for working-sentinel
/// node ids (see [`crate::manifest::diff_with`]). `restrict` enables
/// the relevant-file diff restriction; it is an optimization only and
/// must be disabled for multi-ancestor bidding so every ancestor sees
/// the full diff.
pub fn manifest_merge<F>(
    local: &Manifest,
    remote: &Manifest,
    ancestor: &Manifest,
    copies: &CopyDetection,
    opts: PlanOptions,
    restrict: bool,
    differs: F,
) -> PlanOutcome
where
    F: Fn(&str) -> bool,
{
    let matcher = if restrict && ancestor != local && ancestor != remote {
        // Only paths the remote touched since the ancestor (plus both
        // ends of every copy record) can produce a non-keep action, so
        // the local-vs-remote diff can be narrowed to them.
        let base_diff = diff_with(ancestor, remote, &Matcher::All, |_| true);
        let mut relevant: BTreeSet<String> = base_diff.entries.keys().cloned().collect();
        for (dst, src) in &copies.copy {
            relevant.insert(dst.clone());
            relevant.insert(src.clone());
        }
        for (old, new) in &copies.move_with_dir {
            relevant.insert(old.clone());
            relevant.insert(new.clone());
        }
        Matcher::Files(relevant)
    } else {
        Matcher::All
    };

    let d = diff_with(local, remote, &matcher, &differs);
    debug!(entries = d.len(), restricted = !matcher.is_all(), "manifest diff ready");

    let copied_sources = copies.sources();
    let mut actions = ActionSet::new();

    for (f, (n1, n2)) in d.iter() {
        match (n1, n2) {
            (Some(l), Some(r)) => {
                plan_both(&mut actions, f, &l.id, l.flag, &r.id, r.flag, ancestor, copies);
            }
            (Some(l), None) => {
                plan_local_only(
                    &mut actions,
                    f,
                    &l.id,
                    l.flag,
                    remote,
                    ancestor,
                    copies,
                    &copied_sources,
                    opts,
                );
            }
            (None, Some(r)) => {
                plan_remote_only(
                    &mut actions,
                    f,
                    &r.id,
                    r.flag,
                    local,
                    remote,
                    ancestor,
                    copies,
                    &copied_sources,
                    opts,
                );
            }
            (None, None) => unreachable!("diff never emits a path absent on both sides"),
        }
    }

    PlanOutcome {
        actions,
        divergent: copies.divergent.clone(),
        rename_delete: copies.rename_delete.clone(),
    }
}

/// Path present on both sides.
#[allow(clippy::too_many_arguments)]
fn plan_both(
    actions: &mut ActionSet,
    f: &str,
    n1: &NodeId,
    fl1: FileFlag,
    n2: &NodeId,
    fl2: FileFlag,
    ancestor: &Manifest,
    copies: &CopyDetection,
) {
    let Some(anc) = ancestor.get(f) else {
        // Created on both sides independently.
        if let Some(src) = copies.copy.get(f) {
            let anode = ancestor.get(src).map_or_else(NodeId::null, |n| n.id.clone());
            actions.insert(Action::new(
                f,
                ActionKind::Merge(MergeArgs {
                    local_path: f.to_owned(),
                    other_path: f.to_owned(),
                    ancestor_path: Some(src.clone()),
                    is_move: false,
                    ancestor_node: anode,
                }),
                format!("both renamed from {src}"),
            ));
        } else {
            actions.insert(Action::new(
                f,
                ActionKind::Merge(MergeArgs {
                    local_path: f.to_owned(),
                    other_path: f.to_owned(),
                    ancestor_path: None,
                    is_move: false,
                    ancestor_node: NodeId::null(),
                }),
                "both created",
            ));
        }
        return;
    };

    let a = &anc.id;
    let fla = anc.flag;
    // Flag-only shortcuts are unsafe when a symlink is involved on any
    // of the three sides.
    let no_symlink =
        fl1 != FileFlag::Symlink && fl2 != FileFlag::Symlink && fla != FileFlag::Symlink;

    if n2 == a && fl2 == fla {
        actions.insert(Action::new(f, ActionKind::Keep, "remote unchanged"));
    } else if n1 == a && fl1 == fla {
        // Local unchanged — take the remote side.
        if n1 == n2 {
            // Content already equal; only the flag moved.
            actions.insert(Action::new(f, ActionKind::Exec { flag: fl2 }, "update permissions"));
        } else if fl1.needs_remove_before_write(fl2) {
            actions.insert(Action::new(
                f,
                ActionKind::RemoveGet { node: n2.clone(), flag: fl2 },
                "remote is newer, replace file kind",
            ));
        } else {
            actions.insert(Action::new(
                f,
                ActionKind::Get { node: n2.clone(), flag: fl2 },
                "remote is newer",
            ));
        }
    } else if no_symlink && n2 == a {
        // Remote changed only the executable bit.
        actions.insert(Action::new(f, ActionKind::Exec { flag: fl2 }, "update permissions"));
    } else if no_symlink && n1 == a {
        // Local changed only the executable bit; keep that choice while
        // taking the remote content.
        actions.insert(Action::new(
            f,
            ActionKind::Get { node: n2.clone(), flag: fl1 },
            "remote is newer",
        ));
    } else {
        actions.insert(Action::new(
            f,
            ActionKind::Merge(MergeArgs::same_path(f, a.clone())),
            "versions differ",
        ));
    }
}

/// Path present only on the local side.
#[allow(clippy::too_many_arguments)]
fn plan_local_only(
    actions: &mut ActionSet,
    f: &str,
    n1: &NodeId,
    fl1: FileFlag,
    remote: &Manifest,
    ancestor: &Manifest,
    copies: &CopyDetection,
    copied_sources: &BTreeSet<&str>,
    opts: PlanOptions,
) {
    if copied_sources.contains(f) {
        // A rename destination on the remote side owns this path.
        return;
    }

    if let Some(dest) = copies.move_with_dir.get(f) {
        // The remote renamed the directory this file lives in.
        if remote.contains(dest) {
            actions.insert(Action::new(
                dest,
                ActionKind::Merge(MergeArgs {
                    local_path: f.to_owned(),
                    other_path: dest.clone(),
                    ancestor_path: None,
                    is_move: true,
                    ancestor_node: NodeId::null(),
                }),
                "remote directory rename, both created",
            ));
        } else {
            actions.insert(Action::new(
                dest,
                ActionKind::DirMoveLocal { source: f.to_owned(), flag: fl1 },
                format!("remote directory rename - move from {f}"),
            ));
        }
        return;
    }

    if let Some(src) = copies.copy.get(f) {
        if remote.contains(src) {
            let anode = ancestor.get(src).map_or_else(NodeId::null, |n| n.id.clone());
            actions.insert(Action::new(
                f,
                ActionKind::Merge(MergeArgs {
                    local_path: f.to_owned(),
                    other_path: src.clone(),
                    ancestor_path: Some(src.clone()),
                    is_move: false,
                    ancestor_node: anode,
                }),
                format!("local copied/moved from {src}"),
            ));
        }
        // Otherwise the oracle already flagged the rename as divergent
        // or rename+delete; the warning maps carry it.
        return;
    }

    if let Some(anc) = ancestor.get(f) {
        // Present in the ancestor, gone on the remote.
        if n1.is_added() {
            // A working-copy-only entry: forget it rather than deleting
            // a file the repository never owned.
            actions.insert(Action::new(f, ActionKind::Forget, "remote deleted"));
        } else if *n1 != anc.id {
            if opts.acceptremote {
                actions.insert(Action::new(f, ActionKind::Remove, "remote delete"));
            } else {
                actions.insert(Action::new(
                    f,
                    ActionKind::ChangedDeleted(MergeArgs {
                        local_path: f.to_owned(),
                        other_path: f.to_owned(),
                        ancestor_path: Some(f.to_owned()),
                        is_move: false,
                        ancestor_node: anc.id.clone(),
                    }),
                    "prompt changed/deleted",
                ));
            }
        } else {
            actions.insert(Action::new(f, ActionKind::Remove, "other deleted"));
        }
    }
    // Created locally and unknown to both ancestor and remote: the file
    // simply stays; no action.
}

/// Path present only on the remote side.
#[allow(clippy::too_many_arguments)]
fn plan_remote_only(
    actions: &mut ActionSet,
    f: &str,
    n2: &NodeId,
    fl2: FileFlag,
    local: &Manifest,
    remote: &Manifest,
    ancestor: &Manifest,
    copies: &CopyDetection,
    copied_sources: &BTreeSet<&str>,
    opts: PlanOptions,
) {
    if copied_sources.contains(f) {
        // A rename destination on the local side owns this path.
        return;
    }

    if let Some(dest) = copies.move_with_dir.get(f) {
        // The local side renamed the directory this remote file lives
        // in; respect the move and land the file at the renamed path.
        if local.contains(dest) {
            actions.insert(Action::new(
                dest,
                ActionKind::Merge(MergeArgs {
                    local_path: dest.clone(),
                    other_path: f.to_owned(),
                    ancestor_path: None,
                    is_move: false,
                    ancestor_node: NodeId::null(),
                }),
                "local directory rename, both created",
            ));
        } else {
            actions.insert(Action::new(
                dest,
                ActionKind::DirGet { source: f.to_owned(), flag: fl2 },
                format!("local directory rename - get from {f}"),
            ));
        }
        return;
    }

    if let Some(src) = copies.copy.get(f) {
        let anode = ancestor.get(src).map_or_else(NodeId::null, |n| n.id.clone());
        if remote.contains(src) {
            actions.insert(Action::new(
                f,
                ActionKind::Merge(MergeArgs {
                    local_path: src.clone(),
                    other_path: f.to_owned(),
                    ancestor_path: Some(src.clone()),
                    is_move: false,
                    ancestor_node: anode,
                }),
                format!("remote copied from {src}"),
            ));
        } else {
            actions.insert(Action::new(
                f,
                ActionKind::Merge(MergeArgs {
                    local_path: src.clone(),
                    other_path: f.to_owned(),
                    ancestor_path: Some(src.clone()),
                    is_move: true,
                    ancestor_node: anode,
                }),
                format!("remote moved from {src}"),
            ));
        }
        return;
    }

    match ancestor.get(f) {
        None => {
            // Remote created a file the local side never had. The
            // decision table: only a forced branch merge needs the
            // get-or-merge probe; everything else is a plain create.
            if opts.force && opts.branchmerge {
                actions.insert(Action::new(
                    f,
                    ActionKind::CreateMerge {
                        node: n2.clone(),
                        flag: fl2,
                        ancestor_node: NodeId::null(),
                    },
                    "remote created, get or merge",
                ));
            } else {
                actions.insert(Action::new(
                    f,
                    ActionKind::Create { node: n2.clone(), flag: fl2 },
                    "remote created",
                ));
            }
        }
        Some(anc) if *n2 != anc.id => {
            // Locally deleted, remotely changed.
            if opts.acceptremote {
                actions.insert(Action::new(
                    f,
                    ActionKind::Create { node: n2.clone(), flag: fl2 },
                    "remote recreating",
                ));
            } else {
                actions.insert(Action::new(
                    f,
                    ActionKind::DeletedChanged(MergeArgs {
                        local_path: f.to_owned(),
                        other_path: f.to_owned(),
                        ancestor_path: Some(f.to_owned()),
                        is_move: false,
                        ancestor_node: anc.id.clone(),
                    }),
                    "prompt deleted/changed",
                ));
            }
        }
        // Locally deleted, remote unchanged since the ancestor: the
        // deletion wins silently.
        Some(_) => {}
    }
}

// ---------------------------------------------------------------------------
// Trivial-conflict downgrade
// ---------------------------------------------------------------------------

/// Downgrade change/delete conflicts whose "changed" side did not
/// actually change content relative to the ancestor:
///
/// - `cd` where the local bytes equal the ancestor bytes becomes a
///   plain `remove` — deleting content the user never touched needs no
///   prompt;
/// - `dc` where the remote bytes equal the ancestor bytes is dropped
///   entirely — the local deletion stands.
///
/// `local_eq_ancestor(path, ancestor_node)` and
/// `remote_eq_ancestor(path, ancestor_node)` perform the byte
/// comparisons; the planner does not own file or store I/O.
pub fn resolve_trivial<L, R>(actions: &mut ActionSet, local_eq_ancestor: L, remote_eq_ancestor: R)
where
    L: Fn(&str, &NodeId) -> bool,
    R: Fn(&str, &NodeId) -> bool,
{
    let mut downgrade = Vec::new();
    let mut dropped = Vec::new();

    for action in actions.iter() {
        match &action.kind {
            ActionKind::ChangedDeleted(args) => {
                if local_eq_ancestor(&action.path, &args.ancestor_node) {
                    downgrade.push(action.path.clone());
                }
            }
            ActionKind::DeletedChanged(args) => {
                if remote_eq_ancestor(&action.path, &args.ancestor_node) {
                    dropped.push(action.path.clone());
                }
            }
            _ => {}
        }
    }

    for path in downgrade {
        debug!(%path, "change/delete conflict is trivial, downgrading to remove");
        actions.insert(Action::new(path, ActionKind::Remove, "prompt same"));
    }
    for path in dropped {
        debug!(%path, "delete/change conflict is trivial, keeping local deletion");
        actions.remove(&path);
    }
}

// ---------------------------------------------------------------------------
// Forgotten-file pass
// ---------------------------------------------------------------------------

/// Synthesize actions for working-copy files that are pending removal
/// and absent from the merge target. Only meaningful against the real
/// working copy — in-memory contexts have no "missing from disk" state.
///
/// `removed` are paths marked removed in the dirstate; `deleted` are
/// tracked paths missing from disk. Files still present in `remote`
/// are left to the normal planner flow.
#[must_use]
pub fn forget_removed(
    removed: &[String],
    deleted: &[String],
    remote: &Manifest,
    branchmerge: bool,
) -> Vec<Action> {
    let mut out = Vec::new();

    // Branch merges turn missing-from-disk files into real removals so
    // the merge commit records the deletion; linear updates only forget.
    let deleted_kind = if branchmerge { ActionKind::Remove } else { ActionKind::Forget };
    for f in deleted {
        if !remote.contains(f) {
            out.push(Action::new(f.clone(), deleted_kind.clone(), "forget deleted"));
        }
    }
    if !branchmerge {
        for f in removed {
            if !remote.contains(f) {
                out.push(Action::new(f.clone(), ActionKind::Forget, "forget removed"));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
