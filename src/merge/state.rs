//! Durable per-file merge state.
//!
//! Every conflict the applier registers gets a [`ConflictEntry`] here
//! *before* any filesystem mutation, so an interrupted merge is always
//! resumable from a consistent record. The state is persisted to
//! `.estuary/merge-state.json` as human-readable JSON; every write is
//! atomic (write-to-temp + fsync + rename) so a crash never corrupts
//! the file.
//!
//! # Entry lifecycle
//!
//! ```text
//! unresolved ──→ resolved            (content conflict settled)
//! unresolved ──→ driver-resolved     (an external driver claimed it)
//! path-unresolved ──→ path-resolved  (name conflict renamed aside)
//! ```
//!
//! `commit()` persists all entries transactionally and is idempotent:
//! a dirty flag gates the write, so calling it twice in a row does one
//! write. `reset()` discards everything — a new merge begins, or the
//! old one is cancelled.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::manifest::{FileFlag, NodeId};

const MERGE_STATE_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// ConflictState
// ---------------------------------------------------------------------------

/// Resolution state of one conflicted path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictState {
    /// Content conflict awaiting resolution.
    Unresolved,
    /// Content conflict settled — terminal.
    Resolved,
    /// Name/path conflict awaiting a rename.
    PathUnresolved,
    /// Name/path conflict renamed aside — terminal.
    PathResolved,
    /// An external merge driver claimed the file — terminal.
    DriverResolved,
}

impl ConflictState {
    /// Valid next states.
    #[must_use]
    pub const fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Unresolved => &[Self::Resolved, Self::DriverResolved],
            Self::PathUnresolved => &[Self::PathResolved],
            Self::Resolved | Self::PathResolved | Self::DriverResolved => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// True when no further resolution work is needed.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Resolved | Self::PathResolved | Self::DriverResolved)
    }
}

impl fmt::Display for ConflictState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unresolved => "unresolved",
            Self::Resolved => "resolved",
            Self::PathUnresolved => "path-unresolved",
            Self::PathResolved => "path-resolved",
            Self::DriverResolved => "driver-resolved",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// ConflictEntry
// ---------------------------------------------------------------------------

/// What flavor of conflict an entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Both sides changed the content.
    Content,
    /// Local changed, remote deleted.
    ChangeDelete,
    /// Local deleted, remote changed.
    DeleteChange,
    /// Two names collide on one working-copy path.
    Path,
}

/// One conflicted path's full record: enough to re-run resolution after
/// a crash without consulting anything but the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub state: ConflictState,
    pub kind: ConflictKind,
    /// Hash of the locally-staged version at registration time. Used to
    /// detect that the working file changed underneath a resolve
    /// attempt (the retry protocol).
    pub local_hash: String,
    pub local_path: String,
    pub local_node: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestor_path: Option<String>,
    pub ancestor_node: NodeId,
    pub other_path: String,
    pub other_node: NodeId,
    /// Flag code string for the merged result (see [`FileFlag::code`]).
    pub flags: String,
}

// ---------------------------------------------------------------------------
// Queued extra actions
// ---------------------------------------------------------------------------

/// Follow-up work contributed by conflict resolution or a merge driver,
/// merged into the applier's result sets after resolution (with
/// de-duplication against the pending merge actions).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum QueuedAction {
    Remove { path: String },
    Get { path: String, node: NodeId, flag: FileFlag },
    Add { path: String, flag: FileFlag },
    AddModified { path: String, flag: FileFlag },
    Forget { path: String },
}

impl QueuedAction {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Remove { path }
            | Self::Get { path, .. }
            | Self::Add { path, .. }
            | Self::AddModified { path, .. }
            | Self::Forget { path } => path,
        }
    }
}

// ---------------------------------------------------------------------------
// MergeState
// ---------------------------------------------------------------------------

/// The persisted merge-state file payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct MergeStateFile {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    local: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    other: Option<NodeId>,
    /// Identity of the configured merge driver when the merge started.
    /// A different configured driver on resume is an abort condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    driver: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    entries: BTreeMap<String, ConflictEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    queued: Vec<QueuedAction>,
}

/// In-memory handle over the merge-state file.
#[derive(Debug)]
pub struct MergeState {
    path: PathBuf,
    local: Option<NodeId>,
    other: Option<NodeId>,
    driver: Option<String>,
    entries: BTreeMap<String, ConflictEntry>,
    queued: Vec<QueuedAction>,
    dirty: bool,
}

impl MergeState {
    /// Default location under the repo's metadata directory.
    #[must_use]
    pub fn default_path(meta_dir: &Path) -> PathBuf {
        meta_dir.join("merge-state.json")
    }

    /// Begin a fresh merge between `local` and `other`, discarding any
    /// previous record.
    #[must_use]
    pub fn start(path: PathBuf, local: NodeId, other: NodeId, driver: Option<String>) -> Self {
        Self {
            path,
            local: Some(local),
            other: Some(other),
            driver,
            entries: BTreeMap::new(),
            queued: Vec::new(),
            dirty: true,
        }
    }

    /// Load the merge state from disk. A missing file is an empty,
    /// inactive state, not an error.
    pub fn load(path: PathBuf) -> Result<Self, MergeStateError> {
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    local: None,
                    other: None,
                    driver: None,
                    entries: BTreeMap::new(),
                    queued: Vec::new(),
                    dirty: false,
                });
            }
            Err(e) => return Err(MergeStateError::Io(format!("read {}: {e}", path.display()))),
        };
        let file: MergeStateFile = serde_json::from_str(&contents)
            .map_err(|e| MergeStateError::Corrupt { path: path.clone(), detail: e.to_string() })?;
        if file.version != MERGE_STATE_VERSION {
            return Err(MergeStateError::Corrupt {
                path,
                detail: format!(
                    "unsupported merge-state version {} (expected {MERGE_STATE_VERSION})",
                    file.version
                ),
            });
        }
        Ok(Self {
            path,
            local: file.local,
            other: file.other,
            driver: file.driver,
            entries: file.entries,
            queued: file.queued,
            dirty: false,
        })
    }

    /// True when a merge is recorded (resumable or awaiting resolution).
    #[must_use]
    pub fn active(&self) -> bool {
        self.local.is_some() || !self.entries.is_empty()
    }

    #[must_use]
    pub fn local(&self) -> Option<&NodeId> {
        self.local.as_ref()
    }

    #[must_use]
    pub fn other(&self) -> Option<&NodeId> {
        self.other.as_ref()
    }

    #[must_use]
    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    /// Register a content-ish conflict as unresolved.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        path: &str,
        kind: ConflictKind,
        local_hash: String,
        local_path: String,
        local_node: NodeId,
        ancestor_path: Option<String>,
        ancestor_node: NodeId,
        other_path: String,
        other_node: NodeId,
        flags: FileFlag,
    ) {
        self.entries.insert(
            path.to_owned(),
            ConflictEntry {
                state: ConflictState::Unresolved,
                kind,
                local_hash,
                local_path,
                local_node,
                ancestor_path,
                ancestor_node,
                other_path,
                other_node,
                flags: flags.code().to_owned(),
            },
        );
        self.dirty = true;
    }

    /// Register a path (name) conflict.
    pub fn add_path_conflict(&mut self, path: &str, local_path: String, other_path: String) {
        self.entries.insert(
            path.to_owned(),
            ConflictEntry {
                state: ConflictState::PathUnresolved,
                kind: ConflictKind::Path,
                local_hash: String::new(),
                local_path,
                local_node: NodeId::null(),
                ancestor_path: None,
                ancestor_node: NodeId::null(),
                other_path,
                other_node: NodeId::null(),
                flags: String::new(),
            },
        );
        self.dirty = true;
    }

    /// Transition an entry's state.
    pub fn mark(&mut self, path: &str, next: ConflictState) -> Result<(), MergeStateError> {
        let entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| MergeStateError::UnknownPath(path.to_owned()))?;
        if !entry.state.can_transition_to(next) {
            return Err(MergeStateError::InvalidTransition { from: entry.state, to: next });
        }
        entry.state = next;
        self.dirty = true;
        Ok(())
    }

    #[must_use]
    pub fn entry(&self, path: &str) -> Option<&ConflictEntry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &ConflictEntry)> {
        self.entries.iter()
    }

    /// Paths still needing work, in order.
    pub fn unresolved(&self) -> impl Iterator<Item = &String> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.state.is_settled())
            .map(|(p, _)| p)
    }

    #[must_use]
    pub fn unresolved_count(&self) -> usize {
        self.unresolved().count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a follow-up action contributed by resolution or a driver.
    pub fn queue(&mut self, action: QueuedAction) {
        self.queued.push(action);
        self.dirty = true;
    }

    /// Drain the queued follow-up actions.
    pub fn take_queued(&mut self) -> Vec<QueuedAction> {
        if self.queued.is_empty() {
            return Vec::new();
        }
        self.dirty = true;
        std::mem::take(&mut self.queued)
    }

    /// Discard all entries and delete the on-disk record: a new merge
    /// begins, or the current one is cancelled.
    pub fn reset(&mut self) -> Result<(), MergeStateError> {
        self.local = None;
        self.other = None;
        self.driver = None;
        self.entries.clear();
        self.queued.clear();
        self.dirty = false;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MergeStateError::Io(format!("remove {}: {e}", self.path.display()))),
        }
    }

    /// Persist all entries. Idempotent: no write happens unless
    /// something changed since the last commit.
    pub fn commit(&mut self) -> Result<(), MergeStateError> {
        if !self.dirty {
            return Ok(());
        }
        let file = MergeStateFile {
            version: MERGE_STATE_VERSION,
            local: self.local.clone(),
            other: self.other.clone(),
            driver: self.driver.clone(),
            entries: self.entries.clone(),
            queued: self.queued.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| MergeStateError::Serialize(e.to_string()))?;
        write_atomic(&self.path, json.as_bytes())?;
        self.dirty = false;
        Ok(())
    }
}

/// Atomic write: temp file in the same directory, fsync, rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), MergeStateError> {
    let dir = path
        .parent()
        .ok_or_else(|| MergeStateError::Io(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(dir)
        .map_err(|e| MergeStateError::Io(format!("create dir {}: {e}", dir.display())))?;

    let tmp_path = dir.join(".merge-state.tmp");
    let mut file = fs::File::create(&tmp_path)
        .map_err(|e| MergeStateError::Io(format!("create {}: {e}", tmp_path.display())))?;
    file.write_all(bytes)
        .map_err(|e| MergeStateError::Io(format!("write {}: {e}", tmp_path.display())))?;
    file.sync_all()
        .map_err(|e| MergeStateError::Io(format!("fsync {}: {e}", tmp_path.display())))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| {
        MergeStateError::Io(format!("rename {} → {}: {e}", tmp_path.display(), path.display()))
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors related to merge-state operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeStateError {
    /// Invalid entry state transition.
    InvalidTransition { from: ConflictState, to: ConflictState },
    /// No entry recorded for the path.
    UnknownPath(String),
    /// The merge-state file is malformed or from an unknown version.
    Corrupt { path: PathBuf, detail: String },
    /// Serialization error.
    Serialize(String),
    /// I/O error.
    Io(String),
}

impl fmt::Display for MergeStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid conflict state transition: {from} → {to}")
            }
            Self::UnknownPath(path) => write!(f, "no merge record for path: {path}"),
            Self::Corrupt { path, detail } => write!(
                f,
                "merge-state file {} is corrupt: {detail}\n  To fix: run `estuary abort` to discard the merge, or restore the file from backup.",
                path.display()
            ),
            Self::Serialize(msg) => write!(f, "merge-state serialize error: {msg}"),
            Self::Io(msg) => write!(f, "merge-state I/O error: {msg}"),
        }
    }
}

impl std::error::Error for MergeStateError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(seed: &str) -> NodeId {
        NodeId::from_content(seed.as_bytes())
    }

    fn add_content_conflict(ms: &mut MergeState, path: &str) {
        ms.add(
            path,
            ConflictKind::Content,
            nid("staged local").as_str().to_owned(),
            path.to_owned(),
            nid("local"),
            Some(path.to_owned()),
            nid("ancestor"),
            path.to_owned(),
            nid("other"),
            FileFlag::None,
        );
    }

    fn fresh(dir: &Path) -> MergeState {
        MergeState::start(MergeState::default_path(dir), nid("p1"), nid("p2"), None)
    }

    // -- state machine --

    #[test]
    fn transitions_follow_the_table() {
        assert!(ConflictState::Unresolved.can_transition_to(ConflictState::Resolved));
        assert!(ConflictState::Unresolved.can_transition_to(ConflictState::DriverResolved));
        assert!(ConflictState::PathUnresolved.can_transition_to(ConflictState::PathResolved));

        assert!(!ConflictState::Unresolved.can_transition_to(ConflictState::PathResolved));
        assert!(!ConflictState::Resolved.can_transition_to(ConflictState::Unresolved));
        assert!(!ConflictState::DriverResolved.can_transition_to(ConflictState::Resolved));
        assert!(!ConflictState::PathResolved.can_transition_to(ConflictState::PathUnresolved));
    }

    #[test]
    fn settled_states() {
        assert!(ConflictState::Resolved.is_settled());
        assert!(ConflictState::PathResolved.is_settled());
        assert!(ConflictState::DriverResolved.is_settled());
        assert!(!ConflictState::Unresolved.is_settled());
        assert!(!ConflictState::PathUnresolved.is_settled());
    }

    #[test]
    fn add_starts_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let mut ms = fresh(dir.path());
        add_content_conflict(&mut ms, "f.txt");
        assert_eq!(ms.entry("f.txt").unwrap().state, ConflictState::Unresolved);
        assert_eq!(ms.unresolved_count(), 1);
    }

    #[test]
    fn mark_enforces_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut ms = fresh(dir.path());
        add_content_conflict(&mut ms, "f.txt");

        ms.mark("f.txt", ConflictState::Resolved).unwrap();
        assert_eq!(ms.unresolved_count(), 0);

        let err = ms.mark("f.txt", ConflictState::Unresolved).unwrap_err();
        assert!(matches!(err, MergeStateError::InvalidTransition { .. }));
    }

    #[test]
    fn mark_unknown_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut ms = fresh(dir.path());
        let err = ms.mark("ghost", ConflictState::Resolved).unwrap_err();
        assert!(matches!(err, MergeStateError::UnknownPath(_)));
    }

    #[test]
    fn path_conflict_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut ms = fresh(dir.path());
        ms.add_path_conflict("dir/file", "dir/file".into(), "dir".into());
        assert_eq!(ms.entry("dir/file").unwrap().state, ConflictState::PathUnresolved);
        ms.mark("dir/file", ConflictState::PathResolved).unwrap();
        assert_eq!(ms.unresolved_count(), 0);
    }

    // -- persistence --

    #[test]
    fn round_trip_mixed_states() {
        let dir = tempfile::tempdir().unwrap();
        let mut ms = fresh(dir.path());
        add_content_conflict(&mut ms, "unresolved.txt");
        add_content_conflict(&mut ms, "resolved.txt");
        ms.mark("resolved.txt", ConflictState::Resolved).unwrap();
        add_content_conflict(&mut ms, "driver.txt");
        ms.mark("driver.txt", ConflictState::DriverResolved).unwrap();
        ms.commit().unwrap();

        let loaded = MergeState::load(MergeState::default_path(dir.path())).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.entry("unresolved.txt"), ms.entry("unresolved.txt"));
        assert_eq!(loaded.entry("resolved.txt"), ms.entry("resolved.txt"));
        assert_eq!(loaded.entry("driver.txt"), ms.entry("driver.txt"));
        assert_eq!(loaded.local(), ms.local());
        assert_eq!(loaded.other(), ms.other());
    }

    #[test]
    fn round_trip_preserves_filenodes_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut ms = fresh(dir.path());
        ms.add(
            "renamed.rs",
            ConflictKind::Content,
            nid("staged").as_str().to_owned(),
            "renamed.rs".to_owned(),
            nid("l"),
            Some("orig.rs".to_owned()),
            nid("a"),
            "orig.rs".to_owned(),
            nid("o"),
            FileFlag::Executable,
        );
        ms.commit().unwrap();

        let loaded = MergeState::load(MergeState::default_path(dir.path())).unwrap();
        let entry = loaded.entry("renamed.rs").unwrap();
        assert_eq!(entry.local_node, nid("l"));
        assert_eq!(entry.ancestor_node, nid("a"));
        assert_eq!(entry.other_node, nid("o"));
        assert_eq!(entry.ancestor_path.as_deref(), Some("orig.rs"));
        assert_eq!(entry.flags, "x");
    }

    #[test]
    fn commit_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = MergeState::default_path(dir.path());
        let mut ms = fresh(dir.path());
        add_content_conflict(&mut ms, "f");
        ms.commit().unwrap();

        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        // Nothing changed: the dirty flag suppresses the write.
        ms.commit().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn load_missing_file_is_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let ms = MergeState::load(MergeState::default_path(dir.path())).unwrap();
        assert!(!ms.active());
        assert!(ms.is_empty());
    }

    #[test]
    fn load_corrupt_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = MergeState::default_path(dir.path());
        fs::write(&path, "not json at all").unwrap();
        let err = MergeState::load(path).unwrap_err();
        assert!(matches!(err, MergeStateError::Corrupt { .. }));
    }

    #[test]
    fn load_unknown_version_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = MergeState::default_path(dir.path());
        fs::write(&path, r#"{"version": 99}"#).unwrap();
        let err = MergeState::load(path).unwrap_err();
        assert!(matches!(err, MergeStateError::Corrupt { .. }));
    }

    #[test]
    fn reset_clears_entries_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = MergeState::default_path(dir.path());
        let mut ms = fresh(dir.path());
        add_content_conflict(&mut ms, "f");
        ms.commit().unwrap();
        assert!(path.exists());

        ms.reset().unwrap();
        assert!(!ms.active());
        assert!(!path.exists());
        // Idempotent.
        ms.reset().unwrap();
    }

    #[test]
    fn driver_identity_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut ms = MergeState::start(
            MergeState::default_path(dir.path()),
            nid("p1"),
            nid("p2"),
            Some("scripts/merge-driver.sh".to_owned()),
        );
        add_content_conflict(&mut ms, "f");
        ms.commit().unwrap();

        let loaded = MergeState::load(MergeState::default_path(dir.path())).unwrap();
        assert_eq!(loaded.driver(), Some("scripts/merge-driver.sh"));
    }

    // -- queued actions --

    #[test]
    fn queued_actions_round_trip_and_drain() {
        let dir = tempfile::tempdir().unwrap();
        let mut ms = fresh(dir.path());
        ms.queue(QueuedAction::Remove { path: "gone".into() });
        ms.queue(QueuedAction::Get { path: "want".into(), node: nid("v"), flag: FileFlag::None });
        ms.queue(QueuedAction::Add { path: "kept".into(), flag: FileFlag::None });
        ms.commit().unwrap();

        let mut loaded = MergeState::load(MergeState::default_path(dir.path())).unwrap();
        let queued = loaded.take_queued();
        assert_eq!(queued.len(), 3);
        assert_eq!(queued[0].path(), "gone");
        assert!(loaded.take_queued().is_empty(), "drained");
    }

    #[test]
    fn tmp_file_cleaned_up_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut ms = fresh(dir.path());
        add_content_conflict(&mut ms, "f");
        ms.commit().unwrap();
        assert!(!dir.path().join(".merge-state.tmp").exists());
    }
}
