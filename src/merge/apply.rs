//! The action applier: execute a planned action set.
//!
//! Ordering is significant and fixed:
//!
//! 1.  register every merge-like action in merge state (and stage the
//!     local content into the store) before any filesystem mutation;
//!     for moves, delete the renamed-away source only after staging;
//! 2.  report path conflicts (and record them as path-unresolved);
//! 3.  remove files — parallel worker pool, failures retried serially;
//! 4.  move path-conflict losers aside, before any get can clobber;
//! 5.  write incoming files — parallel pool over prefetched content,
//!     with a serial fix-up pass that materializes symlinks;
//! 6.  log metadata-only actions (forget / re-add / keep);
//! 7.  perform directory moves;
//! 8.  apply flag-only updates;
//! 9.  run the merge driver's preprocess hook (refusing drivers for
//!     in-memory targets);
//! 10. premerge, then full marker merge, for every pending conflict;
//! 11. commit merge state and, with nothing left unresolved, run the
//!     driver's conclude hook;
//! 12. fold merge-state-queued extra actions into the result,
//!     de-duplicated against the pending merge actions.
//!
//! Individual remove/write failures are warnings, not aborts: the
//! apply is not atomic, and recovery from a hard crash goes through
//! merge state plus the orchestrator's resumability marker.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::manifest::{FileFlag, Manifest, NodeId};
use crate::merge::action::{Action, ActionKind, ActionSet};
use crate::merge::check::CheckOutcome;
use crate::merge::filemerge::{
    merge_lines, premerge, resolve_with_retry, AttemptResult, MergeDriver, MergeLabels, Premerged,
    ResolveOutcome,
};
use crate::merge::state::{ConflictKind, ConflictState, MergeState, QueuedAction};
use crate::store::{ContentStore, StoreError};

// ---------------------------------------------------------------------------
// WriteTarget
// ---------------------------------------------------------------------------

/// Where applied actions land: the real working directory, or an
/// in-memory overlay for merges that must not touch disk. `Sync`
/// because the worker pools call it concurrently.
pub trait WriteTarget: Sync {
    fn write_file(&self, path: &str, bytes: &[u8], flag: FileFlag) -> io::Result<()>;
    fn remove_file(&self, path: &str) -> io::Result<()>;
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;
    fn set_flag(&self, path: &str, flag: FileFlag) -> io::Result<()>;
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;
    fn exists(&self, path: &str) -> bool;
    /// In-memory targets get no worker pools and no merge driver.
    fn is_in_memory(&self) -> bool {
        false
    }
}

/// The real working directory.
#[derive(Debug)]
pub struct DiskTarget {
    root: std::path::PathBuf,
}

impl DiskTarget {
    #[must_use]
    pub fn new(root: std::path::PathBuf) -> Self {
        Self { root }
    }

    fn abs(&self, path: &str) -> std::path::PathBuf {
        self.root.join(path)
    }
}

impl WriteTarget for DiskTarget {
    fn write_file(&self, path: &str, bytes: &[u8], flag: FileFlag) -> io::Result<()> {
        let abs = self.abs(path);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Never write through an existing symlink.
        if abs.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
            std::fs::remove_file(&abs)?;
        }
        match flag {
            FileFlag::Symlink => {
                #[cfg(unix)]
                {
                    let target = String::from_utf8_lossy(bytes).into_owned();
                    std::os::unix::fs::symlink(target, &abs)?;
                }
                #[cfg(not(unix))]
                {
                    std::fs::write(&abs, bytes)?;
                }
            }
            _ => {
                std::fs::write(&abs, bytes)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt as _;
                    let mode = if flag == FileFlag::Executable { 0o755 } else { 0o644 };
                    std::fs::set_permissions(&abs, std::fs::Permissions::from_mode(mode))?;
                }
            }
        }
        Ok(())
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        let abs = self.abs(path);
        match std::fs::remove_file(&abs) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }
        // Prune now-empty parent directories, stopping at the root.
        let mut dir = abs.parent();
        while let Some(d) = dir {
            if d == self.root || std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let to_abs = self.abs(to);
        if let Some(parent) = to_abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(self.abs(from), to_abs)
    }

    fn set_flag(&self, path: &str, flag: FileFlag) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mode = if flag == FileFlag::Executable { 0o755 } else { 0o644 };
            std::fs::set_permissions(self.abs(path), std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        {
            let _ = (path, flag);
        }
        Ok(())
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let abs = self.abs(path);
        let meta = abs.symlink_metadata()?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&abs)?;
            return Ok(target.to_string_lossy().into_owned().into_bytes());
        }
        std::fs::read(abs)
    }

    fn exists(&self, path: &str) -> bool {
        self.abs(path).symlink_metadata().is_ok()
    }
}

/// An in-memory overlay target for merges that must not touch disk.
#[derive(Debug, Default)]
pub struct MemTarget {
    files: Mutex<std::collections::BTreeMap<String, (Vec<u8>, FileFlag)>>,
}

impl MemTarget {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the overlay contents.
    #[must_use]
    pub fn files(&self) -> std::collections::BTreeMap<String, (Vec<u8>, FileFlag)> {
        self.files.lock().expect("mem target lock poisoned").clone()
    }

    /// Seed a file (test and orchestration setup).
    pub fn seed(&self, path: &str, bytes: &[u8], flag: FileFlag) {
        self.files
            .lock()
            .expect("mem target lock poisoned")
            .insert(path.to_owned(), (bytes.to_vec(), flag));
    }
}

impl WriteTarget for MemTarget {
    fn write_file(&self, path: &str, bytes: &[u8], flag: FileFlag) -> io::Result<()> {
        self.seed(path, bytes, flag);
        Ok(())
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        self.files.lock().expect("mem target lock poisoned").remove(path);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let mut files = self.files.lock().expect("mem target lock poisoned");
        match files.remove(from) {
            Some(entry) => {
                files.insert(to.to_owned(), entry);
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn set_flag(&self, path: &str, flag: FileFlag) -> io::Result<()> {
        let mut files = self.files.lock().expect("mem target lock poisoned");
        match files.get_mut(path) {
            Some(entry) => {
                entry.1 = flag;
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        self.files
            .lock()
            .expect("mem target lock poisoned")
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn exists(&self, path: &str) -> bool {
        self.files.lock().expect("mem target lock poisoned").contains_key(path)
    }

    fn is_in_memory(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Options, stats, outcome
// ---------------------------------------------------------------------------

/// Knobs for one apply run.
#[derive(Clone, Debug)]
pub struct ApplyOptions {
    /// Worker count for the remove pool; 0 runs serial.
    pub remove_workers: usize,
    /// Worker count for the write pool; 0 runs serial.
    pub write_workers: usize,
    /// Retry cap for stale-input resolve retries.
    pub premerge_retries: u32,
    /// Conflict marker labels.
    pub local_label: String,
    pub other_label: String,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            remove_workers: 0,
            write_workers: 0,
            premerge_retries: 3,
            local_label: "working copy".to_owned(),
            other_label: "merge rev".to_owned(),
        }
    }
}

/// Counters reported back to the orchestrator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub updated: usize,
    pub merged: usize,
    pub removed: usize,
    pub unresolved: usize,
}

impl fmt::Display for ApplyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files updated, {} files merged, {} files removed, {} files unresolved",
            self.updated, self.merged, self.removed, self.unresolved
        )
    }
}

/// The applier's full result: counters, per-path warnings, and the
/// extra actions contributed by merge state (already executed; the
/// recorder still needs to see them).
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub stats: ApplyStats,
    pub warnings: Vec<String>,
    pub extra_actions: ActionSet,
}

// ---------------------------------------------------------------------------
// apply_actions
// ---------------------------------------------------------------------------

/// Execute the planned actions against `target`.
///
/// `remote` is the manifest being moved to (content lookups for gets
/// and merges). `backups` comes from the checker: paths whose on-disk
/// file is renamed to `<path>.orig` before being overwritten.
#[allow(clippy::too_many_arguments)]
pub fn apply_actions(
    actions: &ActionSet,
    target: &dyn WriteTarget,
    store: &dyn ContentStore,
    remote: &Manifest,
    ms: &mut MergeState,
    driver: Option<&MergeDriver>,
    repo_root: &Path,
    opts: &ApplyOptions,
    check: &CheckOutcome,
) -> Result<ApplyOutcome, ApplyError> {
    let mut outcome = ApplyOutcome::default();

    // Step 1: record merge-like actions before any mutation.
    for action in actions.iter().filter(|a| a.kind.is_merge_like()) {
        register_conflict(action, target, store, remote, ms)?;
    }
    ms.commit()?;

    // Step 2: path-conflict reports.
    for action in actions.of_code("p") {
        if let ActionKind::PathConflict { other } = &action.kind {
            let message = format!(
                "{}: path conflict - a file or link has the same name as a directory ({other})",
                action.path
            );
            warn!(path = %action.path, blocking = %other, "path conflict");
            outcome.warnings.push(message);
            ms.add_path_conflict(&action.path, action.path.clone(), other.clone());
        }
    }
    ms.commit()?;

    // Step 3: removes.
    let removals: Vec<&Action> = actions.of_code("r").collect();
    let remove_failures = run_pool(
        &removals,
        effective_workers(opts.remove_workers, target),
        |action| target.remove_file(&action.path),
    );
    retry_serially(remove_failures, &mut outcome.warnings, |action| {
        target.remove_file(&action.path)
    });
    outcome.stats.removed = removals.len();

    // Step 4: path-conflict renames, before any get can clobber.
    for action in actions.of_code("pr") {
        if let ActionKind::PathConflictResolve { source } = &action.kind {
            if target.exists(source) {
                debug!(from = %source, to = %action.path, "moving path-conflict loser aside");
                target
                    .rename(source, &action.path)
                    .map_err(|e| ApplyError::Io(format!("rename {source}: {e}")))?;
            }
        }
    }

    // Step 5: gets. Prefetch in one batch, then write in parallel,
    // leaving symlinks for the serial fix-up pass.
    let gets: Vec<(&Action, String, NodeId, FileFlag)> = actions
        .iter()
        .filter_map(|action| match &action.kind {
            ActionKind::Get { node, flag } | ActionKind::RemoveGet { node, flag } => {
                Some((action, action.path.clone(), node.clone(), *flag))
            }
            ActionKind::DirGet { source, flag } => {
                let node = remote.get(source).map(|n| n.id.clone())?;
                Some((action, source.clone(), node, *flag))
            }
            _ => None,
        })
        .collect();
    let get_count = gets.len();

    let wants: Vec<(String, NodeId)> =
        gets.iter().map(|(_, src, node, _)| (src.clone(), node.clone())).collect();
    store.prefetch(&wants)?;

    let (symlinks, regulars): (Vec<_>, Vec<_>) =
        gets.into_iter().partition(|(_, _, _, flag)| *flag == FileFlag::Symlink);

    let write_one = |item: &(&Action, String, NodeId, FileFlag)| -> io::Result<()> {
        let (action, src, node, flag) = item;
        write_incoming(action, src, node, *flag, target, store, &check.backups)
    };
    let write_failures =
        run_pool(&regulars, effective_workers(opts.write_workers, target), write_one);
    retry_serially(write_failures, &mut outcome.warnings, write_one);

    // Symlink fix-up pass: materialize links serially after bulk write.
    for item in &symlinks {
        if let Err(e) = write_one(item) {
            outcome.warnings.push(format!("{}: {e}", item.0.path));
        }
    }
    outcome.stats.updated += get_count;

    // Step 6: metadata-only actions, logged not executed.
    for action in actions.of_code("f") {
        debug!(path = %action.path, reason = %action.reason, "forget");
    }
    for action in actions.of_code("a").chain(actions.of_code("am")) {
        debug!(path = %action.path, reason = %action.reason, "re-add");
        outcome.stats.updated += 1;
    }
    for action in actions.of_code("k") {
        debug!(path = %action.path, "keep");
    }

    // Step 7: directory moves, preserving flags.
    for action in actions.of_code("dm") {
        if let ActionKind::DirMoveLocal { source, flag } = &action.kind {
            debug!(from = %source, to = %action.path, "directory move");
            let bytes = target
                .read_file(source)
                .map_err(|e| ApplyError::Io(format!("read {source}: {e}")))?;
            target
                .write_file(&action.path, &bytes, *flag)
                .map_err(|e| ApplyError::Io(format!("write {}: {e}", action.path)))?;
            target
                .remove_file(source)
                .map_err(|e| ApplyError::Io(format!("remove {source}: {e}")))?;
            outcome.stats.updated += 1;
        }
    }

    // Step 8: flag-only updates.
    for action in actions.of_code("e") {
        if let ActionKind::Exec { flag } = &action.kind {
            if let Err(e) = target.set_flag(&action.path, *flag) {
                outcome.warnings.push(format!("{}: {e}", action.path));
            } else {
                outcome.stats.updated += 1;
            }
        }
    }

    // Step 9: driver preprocess.
    let pending: Vec<String> = ms
        .entries()
        .filter(|(_, e)| e.state == ConflictState::Unresolved)
        .map(|(p, _)| p.clone())
        .collect();
    if let Some(driver) = driver {
        if !pending.is_empty() {
            if target.is_in_memory() {
                return Err(ApplyError::DriverInMemory);
            }
            for path in driver.preprocess(repo_root, &pending)? {
                if ms.entry(&path).is_some() {
                    ms.mark(&path, ConflictState::DriverResolved)?;
                } else {
                    outcome.warnings.push(format!("{path}: driver claimed an unknown path"));
                }
            }
            ms.commit()?;
        }
    }

    // Step 10: premerge, then full merge, per remaining conflict.
    let still_pending: Vec<String> = ms
        .entries()
        .filter(|(_, e)| e.state == ConflictState::Unresolved && e.kind == ConflictKind::Content)
        .map(|(p, _)| p.clone())
        .collect();
    for path in still_pending {
        match resolve_one(&path, target, store, ms, opts)? {
            ResolveOutcome::Applied => outcome.stats.merged += 1,
            ResolveOutcome::Unresolved => {}
            ResolveOutcome::Failed(reason) => {
                return Err(ApplyError::MergeFailed { path, reason });
            }
        }
    }

    // Step 11: commit and conclude.
    ms.commit()?;
    outcome.stats.unresolved = ms.unresolved_count();
    if let Some(driver) = driver {
        if outcome.stats.unresolved == 0 && !pending.is_empty() {
            driver.conclude(repo_root)?;
        }
    }

    // Step 12: merge-state-contributed extra actions, de-duplicated
    // against paths that already carry a merge action.
    let merge_paths: BTreeSet<String> =
        actions.iter().filter(|a| a.kind.is_merge_like()).map(|a| a.path.clone()).collect();
    for queued in ms.take_queued() {
        if merge_paths.contains(queued.path()) {
            debug!(path = queued.path(), "skipping queued action shadowed by a merge");
            continue;
        }
        let action = run_queued(&queued, target, store, &mut outcome)?;
        outcome.extra_actions.insert(action);
    }
    ms.commit()?;

    outcome.warnings.extend(check.warnings.iter().cloned());
    debug!(%outcome.stats, "apply finished");
    Ok(outcome)
}

/// How many workers to actually use for this target.
fn effective_workers(configured: usize, target: &dyn WriteTarget) -> usize {
    if target.is_in_memory() { 0 } else { configured }
}

/// Run `op` over `items`, parallel when `workers > 1`. Returns the
/// failed items with their errors.
fn run_pool<'a, T: Sync>(
    items: &'a [T],
    workers: usize,
    op: impl Fn(&'a T) -> io::Result<()> + Sync,
) -> Vec<(&'a T, io::Error)> {
    if workers > 1 && items.len() > 1 {
        use rayon::prelude::*;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .expect("worker pool construction cannot fail with positive thread count");
        pool.install(|| {
            items
                .par_iter()
                .filter_map(|item| op(item).err().map(|e| (item, e)))
                .collect()
        })
    } else {
        items
            .iter()
            .filter_map(|item| op(item).err().map(|e| (item, e)))
            .collect()
    }
}

/// Retry failed items once on the calling thread; persistent failures
/// become warnings naming the path.
fn retry_serially<'a, T>(
    failures: Vec<(&'a T, io::Error)>,
    warnings: &mut Vec<String>,
    op: impl Fn(&'a T) -> io::Result<()>,
) where
    T: HasPath,
{
    for (item, first_err) in failures {
        debug!(path = item.action_path(), error = %first_err, "worker failure, retrying serially");
        if let Err(e) = op(item) {
            warn!(path = item.action_path(), error = %e, "giving up on path");
            warnings.push(format!("{}: {e}", item.action_path()));
        }
    }
}

/// Anything with an action path, for failure reporting.
trait HasPath {
    fn action_path(&self) -> &str;
}

impl HasPath for &Action {
    fn action_path(&self) -> &str {
        &self.path
    }
}

impl HasPath for (&Action, String, NodeId, FileFlag) {
    fn action_path(&self) -> &str {
        &self.0.path
    }
}

/// Write one incoming file, honoring backups and remove-before-write.
fn write_incoming(
    action: &Action,
    source_path: &str,
    node: &NodeId,
    flag: FileFlag,
    target: &dyn WriteTarget,
    store: &dyn ContentStore,
    backups: &BTreeSet<String>,
) -> io::Result<()> {
    let bytes = store
        .get(source_path, node)
        .map_err(|e| io::Error::other(e.to_string()))?;
    if backups.contains(&action.path) && target.exists(&action.path) {
        let backup = format!("{}.orig", action.path);
        debug!(path = %action.path, %backup, "backing up untracked file");
        target.rename(&action.path, &backup)?;
    }
    if matches!(action.kind, ActionKind::RemoveGet { .. }) {
        target.remove_file(&action.path)?;
    }
    target.write_file(&action.path, &bytes, flag)
}

/// Step 1 helper: stage the local side and create the merge record.
fn register_conflict(
    action: &Action,
    target: &dyn WriteTarget,
    store: &dyn ContentStore,
    remote: &Manifest,
    ms: &mut MergeState,
) -> Result<(), ApplyError> {
    let (args, kind) = match &action.kind {
        ActionKind::Merge(args) => (args, ConflictKind::Content),
        ActionKind::ChangedDeleted(args) => (args, ConflictKind::ChangeDelete),
        ActionKind::DeletedChanged(args) => (args, ConflictKind::DeleteChange),
        _ => unreachable!("only merge-like actions are registered"),
    };

    // Stage the local content so resolution survives the source file
    // disappearing (moves) and the working file changing underneath.
    let local_bytes = target.read_file(&args.local_path).unwrap_or_default();
    let staged = store.put(&args.local_path, &local_bytes)?;

    let other_node = remote
        .get(&args.other_path)
        .map_or_else(NodeId::null, |n| n.id.clone());
    let flag = remote.flag(&args.other_path);

    ms.add(
        &action.path,
        kind,
        staged.as_str().to_owned(),
        args.local_path.clone(),
        staged,
        args.ancestor_path.clone(),
        args.ancestor_node.clone(),
        args.other_path.clone(),
        other_node,
        flag,
    );

    // A move's source is only safe to delete once its content is
    // captured above.
    if args.is_move && args.local_path != action.path && target.exists(&args.local_path) {
        debug!(path = %args.local_path, "removing moved-away merge source");
        target
            .remove_file(&args.local_path)
            .map_err(|e| ApplyError::Io(format!("remove {}: {e}", args.local_path)))?;
    }
    Ok(())
}

/// Premerge then marker merge for one recorded conflict, inside the
/// bounded retry loop. Also the re-entry point for `resolve --rerun`
/// and `continue` after an interruption.
pub fn resolve_one(
    path: &str,
    target: &dyn WriteTarget,
    store: &dyn ContentStore,
    ms: &mut MergeState,
    opts: &ApplyOptions,
) -> Result<ResolveOutcome, ApplyError> {
    let entry = ms.entry(path).expect("caller filtered to known entries").clone();

    let base = if entry.ancestor_node.is_null() {
        Vec::new()
    } else {
        let ancestor_path = entry.ancestor_path.as_deref().unwrap_or(path);
        store.get(ancestor_path, &entry.ancestor_node)?
    };
    let other = if entry.other_node.is_null() {
        Vec::new()
    } else {
        store.get(&entry.other_path, &entry.other_node)?
    };
    let flag = FileFlag::from_code(&entry.flags);
    let labels = MergeLabels { local: &opts.local_label, other: &opts.other_label };

    // Merging always starts from the staged local copy, never the
    // working file — re-running resolution over a marker-filled file
    // must stay idempotent.
    let local = store.get(&entry.local_path, &entry.local_node)?;

    let outcome = resolve_with_retry(opts.premerge_retries, || {
        // Snapshot the working file so a concurrent change between
        // computing the merge and writing it triggers a clean retry
        // instead of a silent clobber.
        let before = target.read_file(path).ok();

        let (merged, conflicts) = match premerge(&base, &local, &other) {
            Premerged::Clean(merged) => (merged, 0),
            Premerged::Conflicted => merge_lines(&base, &local, &other, labels),
        };

        if target.read_file(path).ok() != before {
            debug!(%path, "working file changed underneath the merge");
            return AttemptResult::Retry;
        }
        if let Err(e) = target.write_file(path, &merged, flag) {
            return AttemptResult::Failed(e.to_string());
        }
        if conflicts == 0 { AttemptResult::Applied } else { AttemptResult::Unresolved }
    });

    if outcome == ResolveOutcome::Applied {
        ms.mark(path, ConflictState::Resolved)?;
    }
    Ok(outcome)
}

/// Step 12 helper: execute one queued extra action and return its
/// recordable form.
fn run_queued(
    queued: &QueuedAction,
    target: &dyn WriteTarget,
    store: &dyn ContentStore,
    outcome: &mut ApplyOutcome,
) -> Result<Action, ApplyError> {
    Ok(match queued {
        QueuedAction::Remove { path } => {
            if let Err(e) = target.remove_file(path) {
                outcome.warnings.push(format!("{path}: {e}"));
            } else {
                outcome.stats.removed += 1;
            }
            Action::new(path.clone(), ActionKind::Remove, "merge state follow-up")
        }
        QueuedAction::Get { path, node, flag } => {
            let bytes = store.get(path, node)?;
            target
                .write_file(path, &bytes, *flag)
                .map_err(|e| ApplyError::Io(format!("write {path}: {e}")))?;
            outcome.stats.updated += 1;
            Action::new(
                path.clone(),
                ActionKind::Get { node: node.clone(), flag: *flag },
                "merge state follow-up",
            )
        }
        QueuedAction::Add { path, flag } => {
            Action::new(path.clone(), ActionKind::Add { flag: *flag }, "merge state follow-up")
        }
        QueuedAction::AddModified { path, flag } => Action::new(
            path.clone(),
            ActionKind::AddModified { flag: *flag },
            "merge state follow-up",
        ),
        QueuedAction::Forget { path } => {
            Action::new(path.clone(), ActionKind::Forget, "merge state follow-up")
        }
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that abort an apply run. Per-path remove/write failures are
/// warnings, not errors — see the module docs.
#[derive(Debug)]
pub enum ApplyError {
    /// A merge driver is configured but the target is in-memory.
    DriverInMemory,
    /// Content merge failed outright for one path.
    MergeFailed { path: String, reason: String },
    /// Store access failed.
    Store(StoreError),
    /// Merge-state access failed.
    MergeState(crate::merge::state::MergeStateError),
    /// Driver hook failed.
    Driver(crate::merge::filemerge::DriverError),
    /// Non-recoverable I/O (outside the worker pools).
    Io(String),
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DriverInMemory => write!(
                f,
                "a merge driver is configured but this merge runs in memory; rerun against the working copy"
            ),
            Self::MergeFailed { path, reason } => write!(f, "merging {path} failed: {reason}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::MergeState(e) => write!(f, "{e}"),
            Self::Driver(e) => write!(f, "{e}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for ApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::MergeState(e) => Some(e),
            Self::Driver(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for ApplyError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<crate::merge::state::MergeStateError> for ApplyError {
    fn from(e: crate::merge::state::MergeStateError) -> Self {
        Self::MergeState(e)
    }
}

impl From<crate::merge::filemerge::DriverError> for ApplyError {
    fn from(e: crate::merge::filemerge::DriverError) -> Self {
        Self::Driver(e)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileNode;
    use crate::merge::action::MergeArgs;
    use crate::store::FsStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        target: DiskTarget,
        store: FsStore,
        ms: MergeState,
        root: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let meta = root.join(".estuary");
        std::fs::create_dir_all(&meta).unwrap();
        let target = DiskTarget::new(root.clone());
        let store = FsStore::new(meta.join("store"));
        let ms = MergeState::start(
            MergeState::default_path(&meta),
            NodeId::from_content(b"p1"),
            NodeId::from_content(b"p2"),
            None,
        );
        Fixture { _dir: dir, target, store, ms, root }
    }

    fn apply(
        fx: &mut Fixture,
        actions: &ActionSet,
        remote: &Manifest,
    ) -> ApplyOutcome {
        apply_actions(
            actions,
            &fx.target,
            &fx.store,
            remote,
            &mut fx.ms,
            None,
            &fx.root,
            &ApplyOptions::default(),
            &CheckOutcome::default(),
        )
        .unwrap()
    }

    fn remote_with(store: &FsStore, files: &[(&str, &str)]) -> Manifest {
        files
            .iter()
            .map(|(p, c)| {
                let node = store.put(p, c.as_bytes()).unwrap();
                ((*p).to_owned(), FileNode::regular(node))
            })
            .collect()
    }

    // -- gets and removes --

    #[test]
    fn get_writes_file_from_store() {
        let mut fx = fixture();
        let remote = remote_with(&fx.store, &[("a.txt", "incoming")]);
        let node = remote.get("a.txt").unwrap().id.clone();
        let actions: ActionSet = [Action::new(
            "a.txt",
            ActionKind::Get { node, flag: FileFlag::None },
            "remote is newer",
        )]
        .into_iter()
        .collect();

        let out = apply(&mut fx, &actions, &remote);
        assert_eq!(out.stats.updated, 1);
        assert_eq!(std::fs::read(fx.root.join("a.txt")).unwrap(), b"incoming");
    }

    #[test]
    fn remove_deletes_and_prunes_empty_dirs() {
        let mut fx = fixture();
        std::fs::create_dir_all(fx.root.join("deep/nested")).unwrap();
        std::fs::write(fx.root.join("deep/nested/f.txt"), "x").unwrap();
        let actions: ActionSet =
            [Action::new("deep/nested/f.txt", ActionKind::Remove, "other deleted")]
                .into_iter()
                .collect();

        let out = apply(&mut fx, &actions, &Manifest::new());
        assert_eq!(out.stats.removed, 1);
        assert!(!fx.root.join("deep/nested/f.txt").exists());
        assert!(!fx.root.join("deep").exists(), "empty parents pruned");
    }

    #[test]
    fn missing_remove_is_not_an_error() {
        let mut fx = fixture();
        let actions: ActionSet =
            [Action::new("never-existed", ActionKind::Remove, "other deleted")]
                .into_iter()
                .collect();
        let out = apply(&mut fx, &actions, &Manifest::new());
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn parallel_removes_match_serial() {
        let mut fx = fixture();
        let mut actions = ActionSet::new();
        for i in 0..20 {
            let path = format!("f{i}.txt");
            std::fs::write(fx.root.join(&path), "x").unwrap();
            actions.insert(Action::new(path, ActionKind::Remove, "other deleted"));
        }
        let opts = ApplyOptions { remove_workers: 4, ..Default::default() };
        let out = apply_actions(
            &actions,
            &fx.target,
            &fx.store,
            &Manifest::new(),
            &mut fx.ms,
            None,
            &fx.root,
            &opts,
            &CheckOutcome::default(),
        )
        .unwrap();
        assert_eq!(out.stats.removed, 20);
        for i in 0..20 {
            assert!(!fx.root.join(format!("f{i}.txt")).exists());
        }
    }

    // -- merges --

    fn merge_action(path: &str, ancestor_node: NodeId) -> Action {
        Action::new(path, ActionKind::Merge(MergeArgs::same_path(path, ancestor_node)), "versions differ")
    }

    #[test]
    fn clean_premerge_resolves_and_writes() {
        let mut fx = fixture();
        let base_node = fx.store.put("f.txt", b"one\ntwo\nthree\n").unwrap();
        std::fs::write(fx.root.join("f.txt"), b"ONE\ntwo\nthree\n").unwrap();
        let remote = remote_with(&fx.store, &[("f.txt", "one\ntwo\nTHREE\n")]);
        let actions: ActionSet = [merge_action("f.txt", base_node)].into_iter().collect();

        let out = apply(&mut fx, &actions, &remote);
        assert_eq!(out.stats.merged, 1);
        assert_eq!(out.stats.unresolved, 0);
        assert_eq!(std::fs::read(fx.root.join("f.txt")).unwrap(), b"ONE\ntwo\nTHREE\n");
        assert_eq!(fx.ms.entry("f.txt").unwrap().state, ConflictState::Resolved);
    }

    #[test]
    fn conflicting_merge_leaves_markers_and_unresolved_entry() {
        let mut fx = fixture();
        let base_node = fx.store.put("f.txt", b"line\n").unwrap();
        std::fs::write(fx.root.join("f.txt"), b"local line\n").unwrap();
        let remote = remote_with(&fx.store, &[("f.txt", "other line\n")]);
        let actions: ActionSet = [merge_action("f.txt", base_node)].into_iter().collect();

        let out = apply(&mut fx, &actions, &remote);
        assert_eq!(out.stats.unresolved, 1);
        let merged = std::fs::read_to_string(fx.root.join("f.txt")).unwrap();
        assert!(merged.contains("<<<<<<<"));
        assert!(merged.contains("local line"));
        assert!(merged.contains("other line"));
        assert_eq!(fx.ms.entry("f.txt").unwrap().state, ConflictState::Unresolved);
    }

    #[test]
    fn move_source_removed_after_staging() {
        let mut fx = fixture();
        std::fs::write(fx.root.join("old.rs"), b"body\n").unwrap();
        let anode = fx.store.put("old.rs", b"body\n").unwrap();
        let remote = remote_with(&fx.store, &[("new.rs", "body\nmore\n")]);
        let actions: ActionSet = [Action::new(
            "new.rs",
            ActionKind::Merge(MergeArgs {
                local_path: "old.rs".into(),
                other_path: "new.rs".into(),
                ancestor_path: Some("old.rs".into()),
                is_move: true,
                ancestor_node: anode,
            }),
            "remote moved from old.rs",
        )]
        .into_iter()
        .collect();

        let out = apply(&mut fx, &actions, &remote);
        assert!(!fx.root.join("old.rs").exists(), "move source deleted");
        assert_eq!(out.stats.merged, 1);
        assert_eq!(std::fs::read(fx.root.join("new.rs")).unwrap(), b"body\nmore\n");
    }

    #[test]
    fn change_delete_conflict_is_registered_not_resolved() {
        let mut fx = fixture();
        std::fs::write(fx.root.join("f.txt"), b"locally changed\n").unwrap();
        let anode = fx.store.put("f.txt", b"base\n").unwrap();
        let actions: ActionSet = [Action::new(
            "f.txt",
            ActionKind::ChangedDeleted(MergeArgs::same_path("f.txt", anode)),
            "prompt changed/deleted",
        )]
        .into_iter()
        .collect();

        let out = apply(&mut fx, &actions, &Manifest::new());
        assert_eq!(out.stats.unresolved, 1);
        // The local file is untouched until the user resolves.
        assert_eq!(std::fs::read(fx.root.join("f.txt")).unwrap(), b"locally changed\n");
        assert_eq!(fx.ms.entry("f.txt").unwrap().kind, ConflictKind::ChangeDelete);
    }

    // -- path conflicts --

    #[test]
    fn path_conflict_rename_moves_loser_aside() {
        let mut fx = fixture();
        std::fs::write(fx.root.join("a"), b"blocking file\n").unwrap();
        let remote = remote_with(&fx.store, &[("a/b", "nested\n")]);
        let node = remote.get("a/b").unwrap().id.clone();
        let actions: ActionSet = [
            Action::new("a", ActionKind::PathConflict { other: "a/b".into() }, "path conflict"),
            Action::new(
                "a~1",
                ActionKind::PathConflictResolve { source: "a".into() },
                "path conflict rename",
            ),
            Action::new("a/b", ActionKind::Get { node, flag: FileFlag::None }, "remote created"),
        ]
        .into_iter()
        .collect();

        let out = apply(&mut fx, &actions, &remote);
        assert_eq!(std::fs::read(fx.root.join("a~1")).unwrap(), b"blocking file\n");
        assert_eq!(std::fs::read(fx.root.join("a/b")).unwrap(), b"nested\n");
        assert_eq!(out.warnings.len(), 1, "the conflict is reported");
        assert_eq!(
            fx.ms.entry("a").unwrap().state,
            ConflictState::PathUnresolved,
            "recorded for later `resolve`"
        );
        assert_eq!(out.stats.unresolved, 1);
    }

    // -- backups --

    #[test]
    fn backup_set_renames_before_overwrite() {
        let mut fx = fixture();
        std::fs::write(fx.root.join("u.txt"), b"untracked bytes\n").unwrap();
        let remote = remote_with(&fx.store, &[("u.txt", "incoming\n")]);
        let node = remote.get("u.txt").unwrap().id.clone();
        let actions: ActionSet = [Action::new(
            "u.txt",
            ActionKind::Get { node, flag: FileFlag::None },
            "remote created",
        )]
        .into_iter()
        .collect();
        let check = CheckOutcome {
            warnings: Vec::new(),
            backups: ["u.txt".to_owned()].into(),
        };

        apply_actions(
            &actions,
            &fx.target,
            &fx.store,
            &remote,
            &mut fx.ms,
            None,
            &fx.root,
            &ApplyOptions::default(),
            &check,
        )
        .unwrap();
        assert_eq!(std::fs::read(fx.root.join("u.txt.orig")).unwrap(), b"untracked bytes\n");
        assert_eq!(std::fs::read(fx.root.join("u.txt")).unwrap(), b"incoming\n");
    }

    // -- directory moves and flags --

    #[test]
    fn dir_move_relocates_local_file() {
        let mut fx = fixture();
        std::fs::create_dir_all(fx.root.join("dir")).unwrap();
        std::fs::write(fx.root.join("dir/f.rs"), b"content\n").unwrap();
        let actions: ActionSet = [Action::new(
            "lib/f.rs",
            ActionKind::DirMoveLocal { source: "dir/f.rs".into(), flag: FileFlag::None },
            "remote directory rename - move from dir/f.rs",
        )]
        .into_iter()
        .collect();

        apply(&mut fx, &actions, &Manifest::new());
        assert!(!fx.root.join("dir/f.rs").exists());
        assert_eq!(std::fs::read(fx.root.join("lib/f.rs")).unwrap(), b"content\n");
    }

    #[cfg(unix)]
    #[test]
    fn exec_action_flips_permissions() {
        use std::os::unix::fs::PermissionsExt as _;
        let mut fx = fixture();
        std::fs::write(fx.root.join("run.sh"), b"#!/bin/sh\n").unwrap();
        let actions: ActionSet = [Action::new(
            "run.sh",
            ActionKind::Exec { flag: FileFlag::Executable },
            "update permissions",
        )]
        .into_iter()
        .collect();

        apply(&mut fx, &actions, &Manifest::new());
        let mode = std::fs::metadata(fx.root.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "executable bits set");
    }

    // -- driver --

    #[test]
    fn driver_claims_files_and_concludes() {
        let mut fx = fixture();
        let base_node = fx.store.put("gen.lock", b"base\n").unwrap();
        std::fs::write(fx.root.join("gen.lock"), b"local\n").unwrap();
        std::fs::write(fx.root.join("other.rs"), b"local2\n").unwrap();
        let base2 = fx.store.put("other.rs", b"base2\n").unwrap();
        let remote = remote_with(&fx.store, &[("gen.lock", "remote\n"), ("other.rs", "base2\n")]);
        let actions: ActionSet = [
            merge_action("gen.lock", base_node),
            merge_action("other.rs", base2),
        ]
        .into_iter()
        .collect();

        let driver = MergeDriver::new("printf 'gen.lock\\n' #");
        let out = apply_actions(
            &actions,
            &fx.target,
            &fx.store,
            &remote,
            &mut fx.ms,
            Some(&driver),
            &fx.root,
            &ApplyOptions::default(),
            &CheckOutcome::default(),
        )
        .unwrap();
        assert_eq!(fx.ms.entry("gen.lock").unwrap().state, ConflictState::DriverResolved);
        // other.rs premerges cleanly (other == base), so nothing is
        // left unresolved and conclude ran.
        assert_eq!(out.stats.unresolved, 0);
    }

    #[test]
    fn driver_with_in_memory_target_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join(".estuary");
        std::fs::create_dir_all(&meta).unwrap();
        let store = FsStore::new(meta.join("store"));
        let target = MemTarget::new();
        target.seed("f.txt", b"local\n", FileFlag::None);
        let base_node = store.put("f.txt", b"base\n").unwrap();
        let remote = remote_with(&store, &[("f.txt", "remote\n")]);
        let mut ms = MergeState::start(
            MergeState::default_path(&meta),
            NodeId::from_content(b"p1"),
            NodeId::from_content(b"p2"),
            Some("true".to_owned()),
        );
        let actions: ActionSet = [merge_action("f.txt", base_node)].into_iter().collect();

        let driver = MergeDriver::new("true");
        let err = apply_actions(
            &actions,
            &target,
            &store,
            &remote,
            &mut ms,
            Some(&driver),
            dir.path(),
            &ApplyOptions::default(),
            &CheckOutcome::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::DriverInMemory));
    }

    // -- queued extras --

    #[test]
    fn queued_actions_execute_and_dedupe_against_merges() {
        let mut fx = fixture();
        let base_node = fx.store.put("conflicted", b"base\n").unwrap();
        std::fs::write(fx.root.join("conflicted"), b"local\n").unwrap();
        std::fs::write(fx.root.join("stale.txt"), b"bye\n").unwrap();
        let remote = remote_with(&fx.store, &[("conflicted", "remote\n")]);

        fx.ms.queue(QueuedAction::Remove { path: "stale.txt".into() });
        // Shadowed by the pending merge on the same path: must be skipped.
        fx.ms.queue(QueuedAction::Remove { path: "conflicted".into() });

        let actions: ActionSet = [merge_action("conflicted", base_node)].into_iter().collect();
        let out = apply(&mut fx, &actions, &remote);

        assert!(!fx.root.join("stale.txt").exists());
        assert!(fx.root.join("conflicted").exists(), "merge path not double-processed");
        assert_eq!(out.extra_actions.len(), 1);
        assert!(out.extra_actions.contains("stale.txt"));
    }

    // -- in-memory target --

    #[test]
    fn mem_target_apply_touches_no_disk() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join(".estuary");
        std::fs::create_dir_all(&meta).unwrap();
        let store = FsStore::new(meta.join("store"));
        let target = MemTarget::new();
        let remote = remote_with(&store, &[("a.txt", "incoming")]);
        let node = remote.get("a.txt").unwrap().id.clone();
        let mut ms = MergeState::start(
            MergeState::default_path(&meta),
            NodeId::from_content(b"p1"),
            NodeId::from_content(b"p2"),
            None,
        );
        let actions: ActionSet = [Action::new(
            "a.txt",
            ActionKind::Get { node, flag: FileFlag::None },
            "remote is newer",
        )]
        .into_iter()
        .collect();

        apply_actions(
            &actions,
            &target,
            &store,
            &remote,
            &mut ms,
            None,
            dir.path(),
            &ApplyOptions::default(),
            &CheckOutcome::default(),
        )
        .unwrap();
        assert_eq!(target.files()["a.txt"].0, b"incoming");
        assert!(!dir.path().join("a.txt").exists());
    }
}
