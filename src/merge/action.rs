//! Merge actions: the planner's output, the applier's input.
//!
//! Every changed path gets exactly one [`Action`]. The kind decides
//! what the applier does; the reason string is for humans and logs.
//! Kinds carry their own arguments as enum payloads, and each kind has
//! a stable short code used for log lines and as the grouping key in
//! the multi-ancestor bid auction.

use std::collections::BTreeMap;
use std::fmt;

use crate::manifest::{FileFlag, NodeId};

// ---------------------------------------------------------------------------
// MergeArgs
// ---------------------------------------------------------------------------

/// Arguments shared by the merge-like kinds (`m`, `cd`, `dc`): the two
/// side paths, the ancestor path, whether the local side is a move
/// (source must be deleted after the merge snapshot is taken), and the
/// ancestor node used to fetch base content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeArgs {
    /// Path of the local version.
    pub local_path: String,
    /// Path of the other (remote) version.
    pub other_path: String,
    /// Path of the ancestor version, `None` when both sides created the
    /// file with no common base.
    pub ancestor_path: Option<String>,
    /// The local side renamed the file here; remove `local_path` once
    /// merge state has captured its content.
    pub is_move: bool,
    /// Ancestor content id ([`NodeId::null`] when no base exists).
    pub ancestor_node: NodeId,
}

impl MergeArgs {
    /// Plain both-sides-changed merge of a single path.
    #[must_use]
    pub fn same_path(path: &str, ancestor_node: NodeId) -> Self {
        Self {
            local_path: path.to_owned(),
            other_path: path.to_owned(),
            ancestor_path: Some(path.to_owned()),
            is_move: false,
            ancestor_node,
        }
    }
}

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

/// What the applier should do to one path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// Keep the local version untouched.
    Keep,
    /// Fetch the remote version.
    Get { node: NodeId, flag: FileFlag },
    /// Delete the local file.
    Remove,
    /// Delete the local file, then fetch the remote version. Used when
    /// the flag flips between symlink and regular file.
    RemoveGet { node: NodeId, flag: FileFlag },
    /// Update only the mode flag; content is already right.
    Exec { flag: FileFlag },
    /// Three-way content merge.
    Merge(MergeArgs),
    /// Local directory rename: physically move the local file at
    /// `source` to this path.
    DirMoveLocal { source: String, flag: FileFlag },
    /// Local directory rename: fetch the remote file `source` at this
    /// (renamed) path.
    DirGet { source: String, flag: FileFlag },
    /// Re-add a file the remote deleted but we keep (metadata only).
    Add { flag: FileFlag },
    /// Re-add, marking content as locally modified (metadata only).
    AddModified { flag: FileFlag },
    /// Stop tracking without deleting the file.
    Forget,
    /// Remote created a file the local side never had. The checker
    /// rewrites this to `Get` or `Merge` after probing untracked files.
    Create { node: NodeId, flag: FileFlag },
    /// Remote created a file under `force` during a branch merge: get
    /// when the local untracked copy matches, merge when it differs.
    /// Rewritten by the checker like `Create`.
    CreateMerge { node: NodeId, flag: FileFlag, ancestor_node: NodeId },
    /// Report a path conflict (file vs. directory); no filesystem work.
    PathConflict { other: String },
    /// Resolve a path conflict by renaming the local file `source` out
    /// of the way before any get touches this path.
    PathConflictResolve { source: String },
    /// Local changed, remote deleted — a change/delete conflict.
    ChangedDeleted(MergeArgs),
    /// Local deleted, remote changed — a delete/change conflict.
    DeletedChanged(MergeArgs),
}

impl ActionKind {
    /// Stable short code: log key and bid-auction grouping key.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Keep => "k",
            Self::Get { .. } => "g",
            Self::Remove => "r",
            Self::RemoveGet { .. } => "rg",
            Self::Exec { .. } => "e",
            Self::Merge(_) => "m",
            Self::DirMoveLocal { .. } => "dm",
            Self::DirGet { .. } => "dg",
            Self::Add { .. } => "a",
            Self::AddModified { .. } => "am",
            Self::Forget => "f",
            Self::Create { .. } => "c",
            Self::CreateMerge { .. } => "cm",
            Self::PathConflict { .. } => "p",
            Self::PathConflictResolve { .. } => "pr",
            Self::ChangedDeleted(_) => "cd",
            Self::DeletedChanged(_) => "dc",
        }
    }

    /// Kinds that register an entry in merge state before any
    /// filesystem mutation.
    #[must_use]
    pub const fn is_merge_like(&self) -> bool {
        matches!(self, Self::Merge(_) | Self::ChangedDeleted(_) | Self::DeletedChanged(_))
    }

    /// Kinds that create a file at the action path.
    #[must_use]
    pub const fn creates_file(&self) -> bool {
        matches!(
            self,
            Self::Get { .. }
                | Self::RemoveGet { .. }
                | Self::Create { .. }
                | Self::CreateMerge { .. }
                | Self::DirGet { .. }
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// Action + ActionSet
// ---------------------------------------------------------------------------

/// One planned operation on one path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub path: String,
    pub kind: ActionKind,
    /// Why the planner chose this kind, e.g. `"remote is newer"`.
    pub reason: String,
}

impl Action {
    #[must_use]
    pub fn new(path: impl Into<String>, kind: ActionKind, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.path, self.reason, self.kind.code())
    }
}

/// The planner's full output: at most one action per path, ordered by
/// path for deterministic application and display.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionSet {
    actions: BTreeMap<String, Action>,
}

impl ActionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an action, replacing any previous action for the path.
    pub fn insert(&mut self, action: Action) {
        self.actions.insert(action.path.clone(), action);
    }

    pub fn remove(&mut self, path: &str) -> Option<Action> {
        self.actions.remove(path)
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Action> {
        self.actions.get(path)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.actions.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.values()
    }

    /// Actions of one kind code, in path order.
    pub fn of_code<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a Action> + 'a {
        self.actions.values().filter(move |a| a.kind.code() == code)
    }

    /// Paths in order (useful for assertions and logs).
    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.actions.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Count per action code, for summary logging.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for action in self.actions.values() {
            *counts.entry(action.kind.code()).or_insert(0) += 1;
        }
        counts
    }
}

impl IntoIterator for ActionSet {
    type Item = Action;
    type IntoIter = std::collections::btree_map::IntoValues<String, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.into_values()
    }
}

impl FromIterator<Action> for ActionSet {
    fn from_iter<T: IntoIterator<Item = Action>>(iter: T) -> Self {
        let mut set = Self::new();
        for action in iter {
            set.insert(action);
        }
        set
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
