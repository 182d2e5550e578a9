//! Top-level orchestration: update, merge, graft, resume, resolve.
//!
//! Each operation walks the same state machine —
//! `idle → checking → calculating → applying → recording → idle` —
//! under the working-copy lock, with precondition failures short-
//! circuiting to `aborted` before any mutation. The general path runs
//! the full planner → checker → applier → recorder pipeline; clean
//! checkouts can take the native bulk path instead.
//!
//! A resumability marker (`updatestate.json`) records the in-flight
//! target for the whole apply phase. On the next invocation its
//! presence forces the user through [`continue_op`] or [`abort_op`].

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::UpdateCheck;
use crate::dirstate::{record_actions, EntryStatus};
use crate::error::EstuaryError;
use crate::manifest::{FileFlag, Manifest, NodeId};
use crate::merge::apply::{
    apply_actions, resolve_one, ApplyOptions, ApplyStats, DiskTarget, WriteTarget,
};
use crate::merge::bid::merge_plan_outcomes;
use crate::merge::check::{
    check_case_collisions, check_path_conflicts, check_unknown_files, CheckOptions, CheckOutcome,
    IgnoreRules,
};
use crate::merge::filemerge::{MergeDriver, ResolveOutcome};
use crate::merge::plan::{forget_removed, manifest_merge, resolve_trivial, PlanOptions};
use crate::merge::state::{ConflictKind, ConflictState, MergeState, QueuedAction};
use crate::repo::Repo;
use crate::store::{CommitGraph, ContentStore, CopyTracker, RecordedCopies};

// ---------------------------------------------------------------------------
// OpPhase
// ---------------------------------------------------------------------------

/// Phases of one orchestrated operation. Strictly forward; `Aborted`
/// is reachable from `Checking` only (later phases recover through the
/// marker instead of aborting in place).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpPhase {
    Idle,
    Checking,
    Calculating,
    Applying,
    Recording,
    Aborted,
}

impl OpPhase {
    #[must_use]
    pub const fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Idle => &[Self::Checking],
            Self::Checking => &[Self::Calculating, Self::Aborted],
            Self::Calculating => &[Self::Applying],
            Self::Applying => &[Self::Recording],
            Self::Recording => &[Self::Idle],
            Self::Aborted => &[],
        }
    }

    /// Advance, panicking in debug builds on a broken sequence.
    pub fn advance(&mut self, next: Self) {
        debug_assert!(
            self.valid_transitions().contains(&next),
            "invalid phase transition {self} → {next}"
        );
        debug!(from = %self, to = %next, "phase transition");
        *self = next;
    }
}

impl fmt::Display for OpPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Calculating => "calculating",
            Self::Applying => "applying",
            Self::Recording => "recording",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Resumability marker
// ---------------------------------------------------------------------------

const UPDATE_STATE_VERSION: u32 = 1;

/// The on-disk marker naming the in-flight target revision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMarker {
    version: u32,
    pub target: NodeId,
    pub branchmerge: bool,
}

impl UpdateMarker {
    #[must_use]
    pub fn path(meta_dir: &Path) -> PathBuf {
        meta_dir.join("updatestate.json")
    }

    pub fn write(meta_dir: &Path, target: &NodeId, branchmerge: bool) -> Result<(), EstuaryError> {
        let marker = Self {
            version: UPDATE_STATE_VERSION,
            target: target.clone(),
            branchmerge,
        };
        let json = serde_json::to_string_pretty(&marker)
            .map_err(|e| EstuaryError::Io(std::io::Error::other(e)))?;
        fs::write(Self::path(meta_dir), json)?;
        Ok(())
    }

    pub fn read(meta_dir: &Path) -> Result<Option<Self>, EstuaryError> {
        let path = Self::path(meta_dir);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let marker: Self =
            serde_json::from_str(&contents).map_err(|e| EstuaryError::Io(std::io::Error::other(e)))?;
        Ok(Some(marker))
    }

    pub fn clear(meta_dir: &Path) -> Result<(), EstuaryError> {
        match fs::remove_file(Self::path(meta_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// update
// ---------------------------------------------------------------------------

/// Options for [`update`].
#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateOptions {
    /// Discard conflicting local state instead of aborting.
    pub force: bool,
    /// Dirty-working-copy rule; `None` uses the configured default.
    pub check: Option<UpdateCheck>,
}

/// Move the working copy to `target` (goto/checkout).
pub fn update(
    repo: &mut Repo,
    target: &NodeId,
    opts: UpdateOptions,
) -> Result<ApplyStats, EstuaryError> {
    let mut phase = OpPhase::Idle;
    phase.advance(OpPhase::Checking);
    let _wc_lock = repo.lock_working_copy()?;

    if let Some(marker) = UpdateMarker::read(repo.meta_dir())? {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::InterruptedUpdate { target: marker.target });
    }
    if !repo.commits.exists(target) {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::UnknownRevision { node: target.clone() });
    }

    let ms_path = MergeState::default_path(repo.meta_dir());
    let ms = MergeState::load(ms_path.clone())?;
    if ms.unresolved_count() > 0 {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::UnresolvedMerge {
            files: ms.unresolved().cloned().collect(),
        });
    }

    let (p1, p2) = repo.dirstate.parents();
    if !p2.is_null() && !opts.force {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::OutstandingMergeParents);
    }

    let status = repo.working_status()?;
    let check = opts.check.unwrap_or(repo.config.update.default_check);
    if status.is_dirty() && !opts.force && check == UpdateCheck::Linear {
        let linear = repo.commits.is_ancestor(&p1, target)? || repo.commits.is_ancestor(target, &p1)?;
        if !linear {
            phase.advance(OpPhase::Aborted);
            return Err(EstuaryError::UncommittedChanges {
                detail: "non-linear update would merge them across branches".to_owned(),
            });
        }
    }

    // Initial checkout from the null revision implies force: there is
    // nothing local to conflict with, so unknown-file and conflict
    // detection are skipped entirely.
    let initial = p1.is_null();
    let native = repo.config.update.native_checkout || initial;
    if native && (initial || (!status.is_dirty() && status.unknown.is_empty())) {
        phase.advance(OpPhase::Calculating);
        let stats = native_checkout(repo, target)?;
        phase.advance(OpPhase::Applying);
        phase.advance(OpPhase::Recording);
        phase.advance(OpPhase::Idle);
        return Ok(stats);
    }

    run_pipeline(
        repo,
        &mut phase,
        target,
        PipelineKind::Update { check, force: opts.force },
    )
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

/// Options for [`merge`].
#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    /// Merge despite a dirty working copy.
    pub force: bool,
    /// Override the computed ancestor.
    pub ancestor: Option<NodeId>,
    /// Allow merging with a descendant (graft-style fast-forwardish
    /// merges); otherwise that is an error pointing at `update`.
    pub mergeancestor: bool,
}

/// Merge `target` into the working copy (two-parent result).
pub fn merge(
    repo: &mut Repo,
    target: &NodeId,
    opts: MergeOptions,
) -> Result<ApplyStats, EstuaryError> {
    let mut phase = OpPhase::Idle;
    phase.advance(OpPhase::Checking);
    let _wc_lock = repo.lock_working_copy()?;

    if let Some(marker) = UpdateMarker::read(repo.meta_dir())? {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::InterruptedUpdate { target: marker.target });
    }
    if !repo.commits.exists(target) {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::UnknownRevision { node: target.clone() });
    }

    let ms = MergeState::load(MergeState::default_path(repo.meta_dir()))?;
    if ms.unresolved_count() > 0 {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::UnresolvedMerge {
            files: ms.unresolved().cloned().collect(),
        });
    }

    let (p1, p2) = repo.dirstate.parents();
    if !p2.is_null() {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::OutstandingMergeParents);
    }
    if repo.commits.is_ancestor(target, &p1)? {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::MergeWithAncestor);
    }
    if repo.commits.is_ancestor(&p1, target)? && !opts.mergeancestor {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::MergeWithDescendant);
    }
    let status = repo.working_status()?;
    if status.is_dirty() && !opts.force {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::UncommittedChanges {
            detail: "outstanding changes would be folded into the merge".to_owned(),
        });
    }

    run_pipeline(
        repo,
        &mut phase,
        target,
        PipelineKind::Merge { force: opts.force, ancestor: opts.ancestor, acceptremote: false },
    )
}

// ---------------------------------------------------------------------------
// graft
// ---------------------------------------------------------------------------

/// Options for [`graft`].
#[derive(Clone, Debug, Default)]
pub struct GraftOptions {
    /// Explicit merge base; defaults to the commit's first parent.
    pub base: Option<NodeId>,
    /// Keep the grafted commit's first parent as the second working-
    /// copy parent.
    pub keepparent: bool,
}

/// Copy one commit's changes onto the working copy: a forced merge
/// against the commit's designated base, followed by a parent rewrite
/// and copy-record duplication.
pub fn graft(
    repo: &mut Repo,
    commit: &NodeId,
    opts: GraftOptions,
) -> Result<ApplyStats, EstuaryError> {
    let mut phase = OpPhase::Idle;
    phase.advance(OpPhase::Checking);
    let _wc_lock = repo.lock_working_copy()?;

    if !repo.commits.exists(commit) {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::UnknownRevision { node: commit.clone() });
    }
    let ms = MergeState::load(MergeState::default_path(repo.meta_dir()))?;
    if ms.unresolved_count() > 0 {
        phase.advance(OpPhase::Aborted);
        return Err(EstuaryError::UnresolvedMerge {
            files: ms.unresolved().cloned().collect(),
        });
    }
    let commit_parents = repo.commits.parents(commit)?;
    let base = match &opts.base {
        Some(base) => base.clone(),
        None => commit_parents.first().cloned().unwrap_or_else(NodeId::null),
    };

    let (p1, _) = repo.dirstate.parents();
    let stats = run_pipeline(
        repo,
        &mut phase,
        commit,
        PipelineKind::Merge { force: true, ancestor: Some(base), acceptremote: false },
    )?;

    // Back to a single-parent working copy: the graft result will be
    // committed as a child of the original parent, optionally keeping
    // the grafted commit's parent for provenance.
    let p2 = if opts.keepparent {
        commit_parents.first().cloned().unwrap_or_else(NodeId::null)
    } else {
        NodeId::null()
    };
    repo.dirstate.set_parents(p1, p2);

    // Duplicate the grafted commit's copy records.
    for (dst, src) in repo.commits.copies(commit)? {
        if repo.dirstate.entry(&dst).is_some() {
            repo.dirstate.set_copy(&src, &dst);
        }
    }
    repo.dirstate.save()?;
    Ok(stats)
}

// ---------------------------------------------------------------------------
// The shared pipeline
// ---------------------------------------------------------------------------

enum PipelineKind {
    Update { check: UpdateCheck, force: bool },
    Merge { force: bool, ancestor: Option<NodeId>, acceptremote: bool },
}

fn run_pipeline(
    repo: &mut Repo,
    phase: &mut OpPhase,
    target: &NodeId,
    kind: PipelineKind,
) -> Result<ApplyStats, EstuaryError> {
    phase.advance(OpPhase::Calculating);

    let (p1, _) = repo.dirstate.parents();
    let local = repo.working_manifest()?;
    let remote = repo.commits.manifest(target)?;

    // For a forced (clean) update the working copy itself plays the
    // ancestor: nothing counts as locally changed, so the target wins
    // every file. Otherwise the ancestor is the wc parent (linear
    // update) or the computed common ancestor(s) (branch merge).
    let (branchmerge, force, acceptremote, overwrite) = match &kind {
        PipelineKind::Update { force, .. } => (false, *force, false, *force),
        PipelineKind::Merge { force, acceptremote, .. } => (true, *force, *acceptremote, false),
    };
    let ancestors: Vec<(NodeId, Manifest)> = if overwrite {
        vec![(p1.clone(), local.clone())]
    } else {
        match &kind {
            PipelineKind::Update { .. } => vec![(p1.clone(), repo.commits.manifest(&p1)?)],
            PipelineKind::Merge { ancestor, .. } => {
                let mut nodes = match ancestor {
                    Some(node) => vec![node.clone()],
                    None => repo.commits.common_ancestors(&p1, target)?,
                };
                if nodes.is_empty() {
                    // Unrelated histories: merge against the empty tree.
                    nodes.push(NodeId::null());
                }
                let mut pairs = Vec::new();
                for node in nodes {
                    let manifest = repo.commits.manifest(&node)?;
                    pairs.push((node, manifest));
                }
                pairs
            }
        }
    };
    let plan_opts = PlanOptions { branchmerge, force, acceptremote };

    // Plan per ancestor; more than one triggers the bid auction, and
    // each bid must see the full, unrestricted diff.
    let restrict = ancestors.len() == 1;
    let local_copies = repo.local_copies();
    let mut bids = Vec::new();
    for (ancestor_node, ancestor) in &ancestors {
        let copies = if overwrite {
            Default::default()
        } else {
            let remote_copies = collect_copies_between(&repo.commits, target, ancestor_node)?;
            RecordedCopies.detect(&local, &remote, ancestor, &local_copies, &remote_copies)
        };
        let outcome = manifest_merge(
            &local,
            &remote,
            ancestor,
            &copies,
            plan_opts,
            restrict,
            |path| match remote.get(path) {
                Some(node) => repo.working_file_differs(path, node),
                None => true,
            },
        );
        bids.push(outcome);
    }
    let mut outcome = merge_plan_outcomes(bids);

    for (src, dsts) in &outcome.divergent {
        warn!(source = %src, destinations = ?dsts, "divergent renames, using neither");
    }
    for (src, dsts) in &outcome.rename_delete {
        warn!(source = %src, destinations = ?dsts, "file renamed on one side, deleted on the other");
    }

    // Trivial-conflict downgrade, then the forgotten-file pass (the
    // working copy is the local side here, so both always apply).
    resolve_trivial(
        &mut outcome.actions,
        |path, anode| match (repo.read_working_file(path), anode.is_null()) {
            (Ok(bytes), false) => NodeId::from_content(&bytes) == *anode,
            _ => false,
        },
        |path, anode| match remote.get(path) {
            Some(node) if !anode.is_null() => {
                match (
                    repo.store.get(path, &node.id),
                    repo.store.get(path, anode),
                ) {
                    (Ok(remote_bytes), Ok(ancestor_bytes)) => remote_bytes == ancestor_bytes,
                    _ => false,
                }
            }
            _ => false,
        },
    );

    let status = repo.working_status()?;
    for action in forget_removed(&status.removed, &status.deleted, &remote, branchmerge) {
        if !outcome.actions.contains(&action.path) {
            outcome.actions.insert(action);
        }
    }

    // Dirty merges cannot be allowed under the noconflict rule.
    if let PipelineKind::Update { check: UpdateCheck::NoConflict, force: false } = &kind {
        if status.is_dirty() && outcome.actions.iter().any(|a| a.kind.is_merge_like()) {
            *phase = OpPhase::Aborted;
            return Err(EstuaryError::UncommittedChanges {
                detail: "the update would create merge conflicts".to_owned(),
            });
        }
    }

    // Checks: case folding, untracked files, path conflicts.
    if repo.config.merge.check_case_collisions {
        check_case_collisions(&outcome.actions, &local)?;
    }
    let ignore = IgnoreRules::new(&repo.config.merge.ignore);
    let check_opts = CheckOptions {
        force,
        unknown_policy: repo.config.merge.unknown_policy,
        ignored_policy: repo.config.merge.ignored_policy,
    };
    let check_outcome: CheckOutcome = {
        let probe = repo.probe();
        let mut actions = std::mem::take(&mut outcome.actions);
        let result =
            check_unknown_files(&mut actions, check_opts, &ignore, &probe, &remote, |path, node| {
                repo.store
                    .get(path, node)
                    .map_err(|e| std::io::Error::other(e.to_string()))
            });
        check_path_conflicts(&mut actions, &local, &probe);
        outcome.actions = actions;
        result?
    };

    info!(
        target = %target.short(),
        branchmerge,
        actions = outcome.actions.len(),
        "plan ready: {:?}",
        outcome.actions.counts()
    );

    // Everything from here mutates: drop the marker first so a crash
    // is resumable.
    UpdateMarker::write(repo.meta_dir(), target, branchmerge)?;
    phase.advance(OpPhase::Applying);

    let driver = repo.config.merge.driver.clone().map(MergeDriver::new);
    let mut ms = MergeState::start(
        MergeState::default_path(repo.meta_dir()),
        p1.clone(),
        target.clone(),
        driver.as_ref().map(|d| d.identity().to_owned()),
    );
    let apply_opts = ApplyOptions {
        remove_workers: repo.config.workers.remove_workers,
        write_workers: repo.config.workers.write_workers,
        premerge_retries: repo.config.merge.premerge_retries,
        local_label: "working copy".to_owned(),
        other_label: format!("destination {}", target.short()),
    };
    let target_dir = DiskTarget::new(repo.root().to_owned());
    let apply_outcome = apply_actions(
        &outcome.actions,
        &target_dir,
        &repo.store,
        &remote,
        &mut ms,
        driver.as_ref(),
        repo.root(),
        &apply_opts,
        &check_outcome,
    )?;
    for warning in &apply_outcome.warnings {
        warn!("{warning}");
    }

    phase.advance(OpPhase::Recording);
    let mut recorded = outcome.actions;
    for action in apply_outcome.extra_actions {
        recorded.insert(action);
    }
    record_actions(repo.dirstate.as_mut(), &recorded, branchmerge);
    if branchmerge {
        repo.dirstate.set_parents(p1, target.clone());
    } else {
        repo.dirstate.set_parents(target.clone(), NodeId::null());
    }
    repo.dirstate.save()?;

    // A completed merge with no conflicts has nothing left to resume;
    // conflicted merges keep the state for `resolve`.
    if apply_outcome.stats.unresolved == 0 && ms.active() && !branchmerge {
        ms.reset()?;
    }
    UpdateMarker::clear(repo.meta_dir())?;
    phase.advance(OpPhase::Idle);

    info!(%apply_outcome.stats, "operation finished");
    Ok(apply_outcome.stats)
}

/// Union of copy records on commits between `ancestor` (exclusive) and
/// `node` (inclusive), nearer commits overriding farther ones.
fn collect_copies_between(
    graph: &dyn CommitGraph,
    node: &NodeId,
    ancestor: &NodeId,
) -> Result<BTreeMap<String, String>, EstuaryError> {
    let mut chain = Vec::new();
    let mut queue = std::collections::VecDeque::from([node.clone()]);
    let mut seen = std::collections::BTreeSet::new();
    while let Some(current) = queue.pop_front() {
        if current.is_null() || current == *ancestor || !seen.insert(current.clone()) {
            continue;
        }
        chain.push(current.clone());
        for parent in graph.parents(&current)? {
            queue.push_back(parent);
        }
    }

    let mut copies = BTreeMap::new();
    // Farthest first, so records on nearer commits win.
    for commit in chain.iter().rev() {
        copies.extend(graph.copies(commit)?);
    }
    Ok(copies)
}

// ---------------------------------------------------------------------------
// Native checkout
// ---------------------------------------------------------------------------

/// Bulk checkout for clean working copies: write every file of the
/// target manifest, remove everything else tracked, no per-path
/// planning. The caller guarantees there is nothing dirty to lose.
fn native_checkout(repo: &mut Repo, target: &NodeId) -> Result<ApplyStats, EstuaryError> {
    info!(target = %target.short(), "native checkout");
    let remote = repo.commits.manifest(target)?;
    let disk = DiskTarget::new(repo.root().to_owned());

    let mut stats = ApplyStats::default();

    // Drop tracked files that the target does not have.
    for path in crate::repo::tracked(repo) {
        if !remote.contains(&path) {
            disk.remove_file(&path)
                .map_err(|e| EstuaryError::Io(std::io::Error::other(format!("{path}: {e}"))))?;
            repo.dirstate.drop_entry(&path);
            stats.removed += 1;
        }
    }

    // Prefetch then write the whole tree.
    let wants: Vec<(String, NodeId)> =
        remote.iter().map(|(p, n)| (p.clone(), n.id.clone())).collect();
    repo.store.prefetch(&wants)?;
    for (path, node) in remote.iter() {
        let bytes = repo.store.get(path, &node.id)?;
        disk.write_file(path, &bytes, node.flag)
            .map_err(|e| EstuaryError::Io(std::io::Error::other(format!("{path}: {e}"))))?;
        repo.dirstate.set_status(path, EntryStatus::Normal);
        stats.updated += 1;
    }

    repo.dirstate.set_parents(target.clone(), NodeId::null());
    repo.dirstate.save()?;
    Ok(stats)
}

// ---------------------------------------------------------------------------
// continue / abort
// ---------------------------------------------------------------------------

/// Resume an interrupted operation: re-run resolution for everything
/// still unresolved, clearing the marker once nothing is left.
pub fn continue_op(repo: &mut Repo) -> Result<ApplyStats, EstuaryError> {
    let _wc_lock = repo.lock_working_copy()?;

    let marker = UpdateMarker::read(repo.meta_dir())?;
    let mut ms = MergeState::load(MergeState::default_path(repo.meta_dir()))?;
    if marker.is_none() && !ms.active() {
        return Err(EstuaryError::NothingToResume);
    }

    // The driver must be the one that started this merge.
    let configured = repo.config.merge.driver.clone();
    if let (Some(recorded), configured) = (ms.driver().map(ToOwned::to_owned), configured.as_deref())
    {
        if configured != Some(recorded.as_str()) {
            return Err(EstuaryError::DriverChanged {
                recorded,
                configured: configured.unwrap_or("<none>").to_owned(),
            });
        }
    }

    let disk = DiskTarget::new(repo.root().to_owned());
    let apply_opts = ApplyOptions {
        premerge_retries: repo.config.merge.premerge_retries,
        ..Default::default()
    };
    let mut stats = ApplyStats::default();
    let pending: Vec<String> = ms
        .entries()
        .filter(|(_, e)| e.state == ConflictState::Unresolved && e.kind == ConflictKind::Content)
        .map(|(p, _)| p.clone())
        .collect();
    for path in pending {
        match resolve_one(&path, &disk, &repo.store, &mut ms, &apply_opts)? {
            ResolveOutcome::Applied => stats.merged += 1,
            ResolveOutcome::Unresolved => {}
            ResolveOutcome::Failed(reason) => {
                warn!(%path, %reason, "resolution failed");
            }
        }
    }
    ms.commit()?;
    stats.unresolved = ms.unresolved_count();

    if stats.unresolved == 0 {
        UpdateMarker::clear(repo.meta_dir())?;
    }
    Ok(stats)
}

/// Abort an interrupted or conflicted operation: force the working
/// copy back to the first parent and discard merge state.
pub fn abort_op(repo: &mut Repo) -> Result<ApplyStats, EstuaryError> {
    {
        let _wc_lock = repo.lock_working_copy()?;
        let marker = UpdateMarker::read(repo.meta_dir())?;
        let mut ms = MergeState::load(MergeState::default_path(repo.meta_dir()))?;
        if marker.is_none() && !ms.active() {
            return Err(EstuaryError::NothingToResume);
        }
        ms.reset()?;
        UpdateMarker::clear(repo.meta_dir())?;
        let (p1, _) = repo.dirstate.parents();
        repo.dirstate.set_parents(p1, NodeId::null());
        repo.dirstate.save()?;
    }
    // Rebuild the working copy at the first parent, overwriting the
    // half-applied state.
    let (p1, _) = repo.dirstate.parents();
    update(repo, &p1, UpdateOptions { force: true, check: Some(UpdateCheck::None) })
}

// ---------------------------------------------------------------------------
// resolve
// ---------------------------------------------------------------------------

/// How to settle a recorded conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveChoice {
    /// Trust the file as it stands on disk.
    Mark,
    /// Keep the local side of a change/delete conflict.
    TakeLocal,
    /// Take the other side of a change/delete conflict.
    TakeOther,
    /// Re-run the automatic merge machinery.
    Rerun,
}

/// Settle conflicts recorded in merge state for the given paths (all
/// unresolved paths when `paths` is empty). Returns the number still
/// unresolved.
pub fn resolve(
    repo: &mut Repo,
    paths: &[String],
    choice: ResolveChoice,
) -> Result<usize, EstuaryError> {
    let _wc_lock = repo.lock_working_copy()?;
    let mut ms = MergeState::load(MergeState::default_path(repo.meta_dir()))?;

    let selected: Vec<String> = if paths.is_empty() {
        ms.unresolved().cloned().collect()
    } else {
        paths.to_vec()
    };

    let disk = DiskTarget::new(repo.root().to_owned());
    for path in &selected {
        let Some(entry) = ms.entry(path).cloned() else {
            warn!(%path, "no conflict recorded for path");
            continue;
        };
        if entry.state.is_settled() {
            continue;
        }

        match (choice, entry.kind) {
            (ResolveChoice::Mark, ConflictKind::Path) => {
                ms.mark(path, ConflictState::PathResolved)?;
            }
            (ResolveChoice::Mark, _) => {
                ms.mark(path, ConflictState::Resolved)?;
            }
            (ResolveChoice::Rerun, ConflictKind::Content) => {
                let apply_opts = ApplyOptions {
                    premerge_retries: repo.config.merge.premerge_retries,
                    ..Default::default()
                };
                resolve_one(path, &disk, &repo.store, &mut ms, &apply_opts)?;
            }
            (ResolveChoice::TakeLocal, ConflictKind::ChangeDelete) => {
                // The local file stays; re-add it for the recorder.
                let flag = FileFlag::from_code(&entry.flags);
                ms.queue(QueuedAction::AddModified { path: path.clone(), flag });
                repo.dirstate.set_status(path, EntryStatus::Added);
                ms.mark(path, ConflictState::Resolved)?;
            }
            (ResolveChoice::TakeOther, ConflictKind::ChangeDelete) => {
                // The remote deletion wins.
                disk.remove_file(path)
                    .map_err(|e| EstuaryError::Io(std::io::Error::other(format!("{path}: {e}"))))?;
                repo.dirstate.drop_entry(path);
                ms.queue(QueuedAction::Remove { path: path.clone() });
                ms.mark(path, ConflictState::Resolved)?;
            }
            (ResolveChoice::TakeLocal, ConflictKind::DeleteChange) => {
                // The local deletion stands.
                ms.queue(QueuedAction::Remove { path: path.clone() });
                ms.mark(path, ConflictState::Resolved)?;
            }
            (ResolveChoice::TakeOther, ConflictKind::DeleteChange) => {
                let bytes = repo.store.get(&entry.other_path, &entry.other_node)?;
                let flag = FileFlag::from_code(&entry.flags);
                disk.write_file(path, &bytes, flag)
                    .map_err(|e| EstuaryError::Io(std::io::Error::other(format!("{path}: {e}"))))?;
                repo.dirstate.set_status(path, EntryStatus::Normal);
                ms.queue(QueuedAction::Get {
                    path: path.clone(),
                    node: entry.other_node.clone(),
                    flag,
                });
                ms.mark(path, ConflictState::Resolved)?;
            }
            (choice, kind) => {
                warn!(%path, ?choice, ?kind, "resolution choice does not apply to this conflict");
            }
        }
    }

    ms.commit()?;
    repo.dirstate.save()?;
    let unresolved = ms.unresolved_count();
    if unresolved == 0 {
        UpdateMarker::clear(repo.meta_dir())?;
    }
    Ok(unresolved)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_machine_happy_path() {
        let mut phase = OpPhase::Idle;
        phase.advance(OpPhase::Checking);
        phase.advance(OpPhase::Calculating);
        phase.advance(OpPhase::Applying);
        phase.advance(OpPhase::Recording);
        phase.advance(OpPhase::Idle);
        assert_eq!(phase, OpPhase::Idle);
    }

    #[test]
    fn aborted_only_from_checking() {
        assert!(OpPhase::Checking.valid_transitions().contains(&OpPhase::Aborted));
        assert!(!OpPhase::Applying.valid_transitions().contains(&OpPhase::Aborted));
        assert!(OpPhase::Aborted.valid_transitions().is_empty());
    }

    #[test]
    fn marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let target = NodeId::from_content(b"target");
        UpdateMarker::write(dir.path(), &target, true).unwrap();

        let marker = UpdateMarker::read(dir.path()).unwrap().unwrap();
        assert_eq!(marker.target, target);
        assert!(marker.branchmerge);

        UpdateMarker::clear(dir.path()).unwrap();
        assert!(UpdateMarker::read(dir.path()).unwrap().is_none());
        // Clearing twice is fine.
        UpdateMarker::clear(dir.path()).unwrap();
    }
}
