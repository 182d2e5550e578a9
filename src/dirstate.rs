//! Working-copy tracking: the dirstate and the action recorder.
//!
//! The dirstate owns per-path status (`normal`/`added`/`removed`/
//! `merged`), copy linkage, and the working copy's one or two parent
//! pointers. Parents and entries are written atomically together — a
//! reader never sees parents from one update and statuses from another.
//!
//! [`DirstateBackend`] is the capability seam: the engine programs
//! against the trait and a backend is chosen at construction time.
//! [`FlatDirstate`] is the flat JSON table backend; a tree-structured
//! backend would implement the same trait.
//!
//! [`record_actions`] is the Dirstate Recorder: a pure metadata pass
//! over applied actions, in the same fixed kind order the applier used.
//! Branch merges mark merged and fetched files `merged` so the commit
//! keeps two-parent provenance; linear updates instead make the result
//! look like a clean checkout (`normal`), with copy sources dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::manifest::NodeId;
use crate::merge::action::{ActionKind, ActionSet};

const DIRSTATE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Entry types
// ---------------------------------------------------------------------------

/// Tracking status of one path. Untracked paths simply have no entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Tracked and believed clean relative to the first parent.
    Normal,
    /// Scheduled for addition.
    Added,
    /// Scheduled for removal.
    Removed,
    /// Result of a branch merge; both parents are relevant.
    Merged,
}

impl EntryStatus {
    /// Single-character code used in status displays.
    #[must_use]
    pub const fn code(self) -> char {
        match self {
            Self::Normal => 'n',
            Self::Added => 'a',
            Self::Removed => 'r',
            Self::Merged => 'm',
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One tracked path's record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirstateEntry {
    pub status: EntryStatus,
    /// Where this path was copied/renamed from, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_source: Option<String>,
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Capability interface over dirstate storage. Selected at repository
/// construction; the engine never down-casts.
pub trait DirstateBackend {
    fn entry(&self, path: &str) -> Option<&DirstateEntry>;

    /// Set or replace a path's status, keeping any copy source.
    fn set_status(&mut self, path: &str, status: EntryStatus);

    /// Remove the entry entirely (the path becomes untracked).
    fn drop_entry(&mut self, path: &str);

    /// Record that `dest` was copied/renamed from `source`.
    fn set_copy(&mut self, source: &str, dest: &str);

    fn copy_source(&self, path: &str) -> Option<&str>;

    /// Working-copy parent pointers. The second is [`NodeId::null`]
    /// outside an uncommitted merge.
    fn parents(&self) -> (NodeId, NodeId);

    fn set_parents(&mut self, p1: NodeId, p2: NodeId);

    /// All entries, path-ordered.
    fn entries(&self) -> Vec<(String, DirstateEntry)>;

    /// Persist pending changes.
    fn save(&mut self) -> Result<(), DirstateError>;

    /// True when any entry or the parents changed since the last save.
    fn is_dirty(&self) -> bool;
}

/// Tracked paths (everything except `removed`).
pub fn tracked_paths(ds: &dyn DirstateBackend) -> Vec<String> {
    ds.entries()
        .into_iter()
        .filter(|(_, e)| e.status != EntryStatus::Removed)
        .map(|(p, _)| p)
        .collect()
}

// ---------------------------------------------------------------------------
// FlatDirstate
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DirstateFile {
    version: u32,
    parents: (NodeId, NodeId),
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    entries: BTreeMap<String, DirstateEntry>,
}

/// The flat JSON dirstate backend.
#[derive(Debug)]
pub struct FlatDirstate {
    path: PathBuf,
    parents: (NodeId, NodeId),
    entries: BTreeMap<String, DirstateEntry>,
    dirty: bool,
}

impl FlatDirstate {
    /// Default location under the repo's metadata directory.
    #[must_use]
    pub fn default_path(meta_dir: &Path) -> PathBuf {
        meta_dir.join("dirstate.json")
    }

    /// Load from disk; a missing file is an empty dirstate parented at
    /// the null revision.
    pub fn load(path: PathBuf) -> Result<Self, DirstateError> {
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    parents: (NodeId::null(), NodeId::null()),
                    entries: BTreeMap::new(),
                    dirty: false,
                });
            }
            Err(e) => return Err(DirstateError::Io(format!("read {}: {e}", path.display()))),
        };
        let file: DirstateFile = serde_json::from_str(&contents)
            .map_err(|e| DirstateError::Corrupt { path: path.clone(), detail: e.to_string() })?;
        if file.version != DIRSTATE_VERSION {
            return Err(DirstateError::Corrupt {
                path,
                detail: format!(
                    "unsupported dirstate version {} (expected {DIRSTATE_VERSION})",
                    file.version
                ),
            });
        }
        Ok(Self {
            path,
            parents: file.parents,
            entries: file.entries,
            dirty: false,
        })
    }
}

impl DirstateBackend for FlatDirstate {
    fn entry(&self, path: &str) -> Option<&DirstateEntry> {
        self.entries.get(path)
    }

    fn set_status(&mut self, path: &str, status: EntryStatus) {
        match self.entries.get_mut(path) {
            Some(entry) => entry.status = status,
            None => {
                self.entries
                    .insert(path.to_owned(), DirstateEntry { status, copy_source: None });
            }
        }
        self.dirty = true;
    }

    fn drop_entry(&mut self, path: &str) {
        if self.entries.remove(path).is_some() {
            self.dirty = true;
        }
    }

    fn set_copy(&mut self, source: &str, dest: &str) {
        let entry = self
            .entries
            .entry(dest.to_owned())
            .or_insert(DirstateEntry { status: EntryStatus::Added, copy_source: None });
        entry.copy_source = Some(source.to_owned());
        self.dirty = true;
    }

    fn copy_source(&self, path: &str) -> Option<&str> {
        self.entries.get(path).and_then(|e| e.copy_source.as_deref())
    }

    fn parents(&self) -> (NodeId, NodeId) {
        self.parents.clone()
    }

    fn set_parents(&mut self, p1: NodeId, p2: NodeId) {
        self.parents = (p1, p2);
        self.dirty = true;
    }

    fn entries(&self) -> Vec<(String, DirstateEntry)> {
        self.entries.iter().map(|(p, e)| (p.clone(), e.clone())).collect()
    }

    fn save(&mut self) -> Result<(), DirstateError> {
        if !self.dirty {
            return Ok(());
        }
        let file = DirstateFile {
            version: DIRSTATE_VERSION,
            parents: self.parents.clone(),
            entries: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| DirstateError::Serialize(e.to_string()))?;

        let dir = self.path.parent().ok_or_else(|| {
            DirstateError::Io(format!("no parent directory for {}", self.path.display()))
        })?;
        fs::create_dir_all(dir)
            .map_err(|e| DirstateError::Io(format!("create dir {}: {e}", dir.display())))?;
        let tmp_path = dir.join(".dirstate.tmp");
        let mut f = fs::File::create(&tmp_path)
            .map_err(|e| DirstateError::Io(format!("create {}: {e}", tmp_path.display())))?;
        f.write_all(json.as_bytes())
            .map_err(|e| DirstateError::Io(format!("write {}: {e}", tmp_path.display())))?;
        f.sync_all()
            .map_err(|e| DirstateError::Io(format!("fsync {}: {e}", tmp_path.display())))?;
        drop(f);
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            DirstateError::Io(format!("rename {} → {}: {e}", tmp_path.display(), self.path.display()))
        })?;

        self.dirty = false;
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Record applied actions into the dirstate.
///
/// Kind order matches the applier's execution order. Branch-merge mode
/// preserves two-parent provenance (`merged` markers, copy links);
/// linear-update mode rewrites history as if the file had always had
/// its new content.
pub fn record_actions(ds: &mut dyn DirstateBackend, actions: &ActionSet, branchmerge: bool) {
    debug!(count = actions.len(), branchmerge, "recording actions into dirstate");

    // Removes first: later kinds may re-create the same paths.
    for action in actions.of_code("r") {
        if branchmerge {
            ds.set_status(&action.path, EntryStatus::Removed);
        } else {
            ds.drop_entry(&action.path);
        }
    }

    for action in actions.of_code("f") {
        ds.drop_entry(&action.path);
    }

    // Path-conflict renames: the aside copy is a tracked add linked to
    // the original, which becomes a removal.
    for action in actions.of_code("pr") {
        if let ActionKind::PathConflictResolve { source } = &action.kind {
            let orig = ds.copy_source(source).map(ToOwned::to_owned).unwrap_or_else(|| source.clone());
            ds.set_status(&action.path, EntryStatus::Added);
            ds.set_copy(&orig, &action.path);
            if orig == *source {
                ds.set_status(source, EntryStatus::Removed);
            } else {
                ds.drop_entry(source);
            }
        }
    }

    for action in actions.of_code("a") {
        ds.set_status(&action.path, EntryStatus::Added);
    }

    for action in actions.of_code("am") {
        if branchmerge {
            ds.set_status(&action.path, EntryStatus::Normal);
        } else {
            ds.set_status(&action.path, EntryStatus::Added);
        }
    }

    for action in actions.of_code("e") {
        ds.set_status(&action.path, EntryStatus::Normal);
    }

    // keep: nothing to record.

    for action in actions.of_code("g").chain(actions.of_code("rg")) {
        if branchmerge {
            // Content came from the other parent; the merged marker
            // keeps that provenance for the coming commit.
            ds.set_status(&action.path, EntryStatus::Merged);
        } else {
            ds.set_status(&action.path, EntryStatus::Normal);
        }
    }

    for action in actions.iter().filter(|a| a.kind.is_merge_like()) {
        let args = match &action.kind {
            ActionKind::Merge(args)
            | ActionKind::ChangedDeleted(args)
            | ActionKind::DeletedChanged(args) => args,
            _ => unreachable!(),
        };
        if branchmerge {
            ds.set_status(&action.path, EntryStatus::Merged);
            if args.local_path != args.other_path {
                // Copy or rename: link provenance, drop the move source.
                if args.is_move {
                    ds.set_status(&args.local_path, EntryStatus::Removed);
                }
                if args.local_path != action.path {
                    ds.set_copy(&args.local_path, &action.path);
                } else {
                    ds.set_copy(&args.other_path, &action.path);
                }
            }
        } else {
            // A linear update merged a locally modified file; make it
            // look like a plain checkout of the result.
            if args.other_path == action.path {
                ds.set_status(&action.path, EntryStatus::Normal);
            }
            if args.is_move {
                ds.drop_entry(&args.local_path);
            }
        }
    }

    for action in actions.of_code("dm") {
        if let ActionKind::DirMoveLocal { source, .. } = &action.kind {
            if branchmerge {
                ds.set_status(&action.path, EntryStatus::Added);
                ds.set_status(source, EntryStatus::Removed);
                ds.set_copy(source, &action.path);
            } else {
                ds.set_status(&action.path, EntryStatus::Normal);
                ds.drop_entry(source);
            }
        }
    }

    for action in actions.of_code("dg") {
        if let ActionKind::DirGet { source, .. } = &action.kind {
            if branchmerge {
                ds.set_status(&action.path, EntryStatus::Added);
                ds.set_copy(source, &action.path);
            } else {
                ds.set_status(&action.path, EntryStatus::Normal);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from dirstate persistence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirstateError {
    /// The dirstate file is malformed or from an unknown version.
    Corrupt { path: PathBuf, detail: String },
    /// Serialization error.
    Serialize(String),
    /// I/O error.
    Io(String),
}

impl fmt::Display for DirstateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { path, detail } => write!(
                f,
                "dirstate file {} is corrupt: {detail}\n  To fix: rebuild the working copy with `estuary update --force <rev>`.",
                path.display()
            ),
            Self::Serialize(msg) => write!(f, "dirstate serialize error: {msg}"),
            Self::Io(msg) => write!(f, "dirstate I/O error: {msg}"),
        }
    }
}

impl std::error::Error for DirstateError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
