//! External collaborators: content store, commit graph, copy detection.
//!
//! The engine consumes these through traits — they are oracles, not
//! part of the merge core. Minimal honest implementations live here so
//! the pipeline runs end-to-end:
//!
//! - [`FsStore`] — content-addressed blob store on disk,
//! - [`CommitTable`] — JSON-backed commit graph answering parent,
//!   ancestor, and manifest queries,
//! - [`RecordedCopies`] — copy detection from recorded copy links,
//!   with the all-files-moved directory-rename inference.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::manifest::{Manifest, NodeId};
use crate::merge::plan::CopyDetection;

const COMMITS_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// ContentStore
// ---------------------------------------------------------------------------

/// Content-addressed blob storage: `get`/`put` keyed by [`NodeId`],
/// with a batchable prefetch hint. `Sync` because the applier's write
/// workers read from it concurrently.
pub trait ContentStore: Sync {
    /// Fetch the bytes for a (path, node) pair. The path is advisory —
    /// stores are content-addressed — but kept for error messages and
    /// for stores that shard by path.
    fn get(&self, path: &str, node: &NodeId) -> Result<Vec<u8>, StoreError>;

    /// Store bytes, returning their content id.
    fn put(&self, path: &str, bytes: &[u8]) -> Result<NodeId, StoreError>;

    /// Batched read-ahead hint. The default implementation does
    /// nothing; remote-backed stores use it to coalesce round trips.
    fn prefetch(&self, _wants: &[(String, NodeId)]) -> Result<(), StoreError> {
        Ok(())
    }
}

/// On-disk content-addressed store: blobs at `<root>/<aa>/<rest>`.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn blob_path(&self, node: &NodeId) -> PathBuf {
        let hex = node.as_str();
        self.root.join(&hex[..2]).join(&hex[2..])
    }
}

impl ContentStore for FsStore {
    fn get(&self, path: &str, node: &NodeId) -> Result<Vec<u8>, StoreError> {
        let blob = self.blob_path(node);
        fs::read(&blob).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound { path: path.to_owned(), node: node.clone() }
            } else {
                StoreError::Io(format!("read {}: {e}", blob.display()))
            }
        })
    }

    fn put(&self, _path: &str, bytes: &[u8]) -> Result<NodeId, StoreError> {
        let node = NodeId::from_content(bytes);
        let blob = self.blob_path(&node);
        if blob.exists() {
            return Ok(node);
        }
        let dir = blob.parent().expect("blob path always has a parent");
        fs::create_dir_all(dir)
            .map_err(|e| StoreError::Io(format!("create dir {}: {e}", dir.display())))?;
        let tmp = dir.join(format!(".{}.tmp", node.short()));
        fs::write(&tmp, bytes).map_err(|e| StoreError::Io(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &blob)
            .map_err(|e| StoreError::Io(format!("rename {} → {}: {e}", tmp.display(), blob.display())))?;
        Ok(node)
    }
}

// ---------------------------------------------------------------------------
// CommitGraph
// ---------------------------------------------------------------------------

/// The commit-graph oracle: parent lookup, ancestry queries, and
/// manifest/copy-record access per revision.
pub trait CommitGraph {
    fn exists(&self, node: &NodeId) -> bool;

    fn parents(&self, node: &NodeId) -> Result<Vec<NodeId>, StoreError>;

    /// The manifest of a revision. The null revision has an empty
    /// manifest.
    fn manifest(&self, node: &NodeId) -> Result<Manifest, StoreError>;

    /// Copy records (destination → source) of a revision relative to
    /// its first parent.
    fn copies(&self, node: &NodeId) -> Result<BTreeMap<String, String>, StoreError>;

    /// Greatest common ancestors of two revisions. More than one entry
    /// means the merge is criss-cross and the bid auction applies.
    fn common_ancestors(&self, a: &NodeId, b: &NodeId) -> Result<Vec<NodeId>, StoreError>;

    fn is_ancestor(&self, ancestor: &NodeId, descendant: &NodeId) -> Result<bool, StoreError>;
}

/// One commit's record in the table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub parents: Vec<NodeId>,
    pub manifest: Manifest,
    /// Copy records relative to the first parent.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub copies: BTreeMap<String, String>,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CommitsFile {
    version: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    commits: BTreeMap<NodeId, CommitRecord>,
}

/// JSON-backed commit graph.
#[derive(Debug)]
pub struct CommitTable {
    path: PathBuf,
    commits: BTreeMap<NodeId, CommitRecord>,
}

impl CommitTable {
    #[must_use]
    pub fn default_path(meta_dir: &Path) -> PathBuf {
        meta_dir.join("commits.json")
    }

    pub fn load(path: PathBuf) -> Result<Self, StoreError> {
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self { path, commits: BTreeMap::new() });
            }
            Err(e) => return Err(StoreError::Io(format!("read {}: {e}", path.display()))),
        };
        let file: CommitsFile = serde_json::from_str(&contents)
            .map_err(|e| StoreError::Corrupt { path: path.clone(), detail: e.to_string() })?;
        if file.version != COMMITS_VERSION {
            return Err(StoreError::Corrupt {
                path,
                detail: format!("unsupported commit table version {}", file.version),
            });
        }
        Ok(Self { path, commits: file.commits })
    }

    /// Append a commit; its id is derived from parents, manifest, and
    /// message, so identical inputs always produce the same id.
    pub fn add(&mut self, record: CommitRecord) -> Result<NodeId, StoreError> {
        let mut hasher = Sha256::new();
        for parent in &record.parents {
            hasher.update(parent.as_str().as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(record.manifest.digest().as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(record.message.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(40);
        for b in &digest[..20] {
            use fmt::Write as _;
            let _ = write!(hex, "{b:02x}");
        }
        let node = NodeId::new(&hex).expect("hex digest is a valid node id");

        self.commits.insert(node.clone(), record);
        self.save()?;
        Ok(node)
    }

    fn save(&self) -> Result<(), StoreError> {
        let file = CommitsFile { version: COMMITS_VERSION, commits: self.commits.clone() };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        let dir = self
            .path
            .parent()
            .ok_or_else(|| StoreError::Io(format!("no parent directory for {}", self.path.display())))?;
        fs::create_dir_all(dir)
            .map_err(|e| StoreError::Io(format!("create dir {}: {e}", dir.display())))?;
        let tmp = dir.join(".commits.tmp");
        let mut f = fs::File::create(&tmp)
            .map_err(|e| StoreError::Io(format!("create {}: {e}", tmp.display())))?;
        f.write_all(json.as_bytes())
            .map_err(|e| StoreError::Io(format!("write {}: {e}", tmp.display())))?;
        f.sync_all()
            .map_err(|e| StoreError::Io(format!("fsync {}: {e}", tmp.display())))?;
        drop(f);
        fs::rename(&tmp, &self.path).map_err(|e| {
            StoreError::Io(format!("rename {} → {}: {e}", tmp.display(), self.path.display()))
        })
    }

    fn record(&self, node: &NodeId) -> Result<&CommitRecord, StoreError> {
        self.commits
            .get(node)
            .ok_or_else(|| StoreError::UnknownRevision(node.clone()))
    }

    /// All ancestors of a node including itself.
    fn ancestor_set(&self, node: &NodeId) -> Result<BTreeSet<NodeId>, StoreError> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([node.clone()]);
        while let Some(current) = queue.pop_front() {
            if current.is_null() || !seen.insert(current.clone()) {
                continue;
            }
            for parent in &self.record(&current)?.parents {
                queue.push_back(parent.clone());
            }
        }
        Ok(seen)
    }
}

impl CommitGraph for CommitTable {
    fn exists(&self, node: &NodeId) -> bool {
        node.is_null() || self.commits.contains_key(node)
    }

    fn parents(&self, node: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        if node.is_null() {
            return Ok(Vec::new());
        }
        Ok(self.record(node)?.parents.clone())
    }

    fn manifest(&self, node: &NodeId) -> Result<Manifest, StoreError> {
        if node.is_null() {
            return Ok(Manifest::new());
        }
        Ok(self.record(node)?.manifest.clone())
    }

    fn copies(&self, node: &NodeId) -> Result<BTreeMap<String, String>, StoreError> {
        if node.is_null() {
            return Ok(BTreeMap::new());
        }
        Ok(self.record(node)?.copies.clone())
    }

    fn common_ancestors(&self, a: &NodeId, b: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        let ancestors_a = self.ancestor_set(a)?;
        let ancestors_b = self.ancestor_set(b)?;
        let common: BTreeSet<NodeId> = ancestors_a.intersection(&ancestors_b).cloned().collect();

        // Keep only the maximal elements: drop every common ancestor
        // that is itself an ancestor of another common ancestor.
        let mut best = Vec::new();
        'candidate: for c in &common {
            for d in &common {
                if c != d && self.ancestor_set(d)?.contains(c) {
                    continue 'candidate;
                }
            }
            best.push(c.clone());
        }
        debug!(count = best.len(), "computed common ancestors");
        Ok(best)
    }

    fn is_ancestor(&self, ancestor: &NodeId, descendant: &NodeId) -> Result<bool, StoreError> {
        if ancestor.is_null() {
            return Ok(true);
        }
        Ok(self.ancestor_set(descendant)?.contains(ancestor))
    }
}

// ---------------------------------------------------------------------------
// Copy detection
// ---------------------------------------------------------------------------

/// The copy/rename detection oracle interface.
pub trait CopyTracker {
    /// Build the copy maps for one merge: `local_copies` are the local
    /// side's records (dirstate links or commit records along the local
    /// leg), `remote_copies` the remote leg's.
    fn detect(
        &self,
        local: &Manifest,
        remote: &Manifest,
        ancestor: &Manifest,
        local_copies: &BTreeMap<String, String>,
        remote_copies: &BTreeMap<String, String>,
    ) -> CopyDetection;
}

/// Copy detection from recorded links only (no content-similarity
/// scanning). Directory renames are inferred when every ancestor file
/// under a directory left it for the same destination directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordedCopies;

impl CopyTracker for RecordedCopies {
    fn detect(
        &self,
        local: &Manifest,
        remote: &Manifest,
        ancestor: &Manifest,
        local_copies: &BTreeMap<String, String>,
        remote_copies: &BTreeMap<String, String>,
    ) -> CopyDetection {
        let mut out = CopyDetection::default();

        // Valid records: destination lives on its side, source existed
        // in the ancestor.
        let local_records: BTreeMap<&String, &String> = local_copies
            .iter()
            .filter(|(dst, src)| local.contains(dst) && ancestor.contains(src))
            .collect();
        let remote_records: BTreeMap<&String, &String> = remote_copies
            .iter()
            .filter(|(dst, src)| remote.contains(dst) && ancestor.contains(src))
            .collect();

        // Divergent renames: the two sides renamed one source to
        // different destinations.
        let mut divergent_sources = BTreeSet::new();
        for (ldst, lsrc) in &local_records {
            for (rdst, rsrc) in &remote_records {
                if lsrc == rsrc && ldst != rdst {
                    out.divergent
                        .entry((**lsrc).clone())
                        .or_default()
                        .extend([(**ldst).clone(), (**rdst).clone()]);
                    divergent_sources.insert((**lsrc).clone());
                }
            }
        }

        for (dst, src) in local_records.iter().chain(remote_records.iter()) {
            if divergent_sources.contains(*src) {
                continue;
            }
            let renaming_side_has_src = if local.contains(dst) { local } else { remote };
            let other_side = if std::ptr::eq(renaming_side_has_src, local) { remote } else { local };
            // Rename+delete: the other side deleted the source outright.
            if !other_side.contains(*src) && !other_side.contains(*dst) && !renaming_side_has_src.contains(*src)
            {
                out.rename_delete
                    .entry((**src).clone())
                    .or_default()
                    .push((**dst).clone());
                continue;
            }
            out.copy.insert((**dst).clone(), (**src).clone());
        }

        // Directory renames: every ancestor file under sdir moved to
        // the same ddir on one side.
        let mut dir_candidates: BTreeMap<(String, String), usize> = BTreeMap::new();
        for (dst, src) in &out.copy {
            if let (Some(sdir), Some(ddir)) = (parent_dir(src), parent_dir(dst)) {
                if sdir != ddir && file_name(src) == file_name(dst) {
                    *dir_candidates.entry((sdir.to_owned(), ddir.to_owned())).or_insert(0) += 1;
                }
            }
        }
        for ((sdir, ddir), moved) in dir_candidates {
            let ancestor_files: Vec<&String> = ancestor.paths_under(&sdir).collect();
            if ancestor_files.is_empty() || moved < ancestor_files.len() {
                continue;
            }
            // Which side performed the rename? The one that emptied sdir.
            let renamer_is_local = local.paths_under(&sdir).next().is_none();
            let renamer_is_remote = remote.paths_under(&sdir).next().is_none();
            let other = if renamer_is_local {
                remote
            } else if renamer_is_remote {
                local
            } else {
                continue;
            };

            // Files the other side added under the old directory follow
            // the move.
            for path in other.paths_under(&sdir) {
                if !ancestor.contains(path) {
                    let dest = format!("{ddir}/{}", &path[sdir.len() + 1..]);
                    out.move_with_dir.insert(path.clone(), dest);
                }
            }
            out.dir_move.insert(sdir, ddir);
        }

        debug!(
            copies = out.copy.len(),
            dir_moves = out.dir_move.len(),
            divergent = out.divergent.len(),
            "copy detection finished"
        );
        out
    }
}

fn parent_dir(path: &str) -> Option<&str> {
    path.rfind('/').map(|i| &path[..i])
}

fn file_name(path: &str) -> &str {
    path.rfind('/').map_or(path, |i| &path[i + 1..])
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from store and graph collaborators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// No blob for the (path, node) pair.
    NotFound { path: String, node: NodeId },
    /// A revision id is not in the commit graph.
    UnknownRevision(NodeId),
    /// A persisted store file is malformed.
    Corrupt { path: PathBuf, detail: String },
    /// Serialization error.
    Serialize(String),
    /// I/O error.
    Io(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { path, node } => {
                write!(f, "no content for {path} at node {}", node.short())
            }
            Self::UnknownRevision(node) => write!(f, "unknown revision: {}", node.short()),
            Self::Corrupt { path, detail } => {
                write!(f, "store file {} is corrupt: {detail}", path.display())
            }
            Self::Serialize(msg) => write!(f, "store serialize error: {msg}"),
            Self::Io(msg) => write!(f, "store I/O error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileNode;

    fn manifest(entries: &[(&str, &str)]) -> Manifest {
        entries
            .iter()
            .map(|(p, c)| ((*p).to_owned(), FileNode::regular(NodeId::from_content(c.as_bytes()))))
            .collect()
    }

    // -- FsStore --

    #[test]
    fn fs_store_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("store"));
        let node = store.put("a.txt", b"hello").unwrap();
        assert_eq!(node, NodeId::from_content(b"hello"));
        assert_eq!(store.get("a.txt", &node).unwrap(), b"hello");
    }

    #[test]
    fn fs_store_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("store"));
        let a = store.put("x", b"content").unwrap();
        let b = store.put("y", b"content").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fs_store_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("store"));
        let err = store.get("a.txt", &NodeId::from_content(b"never stored")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    // -- CommitTable --

    fn commit(table: &mut CommitTable, parents: Vec<NodeId>, files: &[(&str, &str)], msg: &str) -> NodeId {
        table
            .add(CommitRecord {
                parents,
                manifest: manifest(files),
                copies: BTreeMap::new(),
                message: msg.to_owned(),
            })
            .unwrap()
    }

    #[test]
    fn commit_graph_answers_parents_and_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = CommitTable::load(CommitTable::default_path(dir.path())).unwrap();
        let root = commit(&mut table, vec![], &[("a", "1")], "root");
        let child = commit(&mut table, vec![root.clone()], &[("a", "2")], "child");

        assert_eq!(table.parents(&child).unwrap(), vec![root.clone()]);
        assert!(table.manifest(&child).unwrap().contains("a"));
        assert!(table.is_ancestor(&root, &child).unwrap());
        assert!(!table.is_ancestor(&child, &root).unwrap());
    }

    #[test]
    fn commit_table_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = CommitTable::default_path(dir.path());
        let mut table = CommitTable::load(path.clone()).unwrap();
        let root = commit(&mut table, vec![], &[("a", "1")], "root");

        let reloaded = CommitTable::load(path).unwrap();
        assert!(reloaded.exists(&root));
    }

    #[test]
    fn common_ancestor_simple_fork() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = CommitTable::load(CommitTable::default_path(dir.path())).unwrap();
        let base = commit(&mut table, vec![], &[("a", "1")], "base");
        let left = commit(&mut table, vec![base.clone()], &[("a", "2")], "left");
        let right = commit(&mut table, vec![base.clone()], &[("a", "3")], "right");

        assert_eq!(table.common_ancestors(&left, &right).unwrap(), vec![base]);
    }

    #[test]
    fn criss_cross_yields_two_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = CommitTable::load(CommitTable::default_path(dir.path())).unwrap();
        let root = commit(&mut table, vec![], &[("a", "0")], "root");
        let x = commit(&mut table, vec![root.clone()], &[("a", "x")], "x");
        let y = commit(&mut table, vec![root.clone()], &[("a", "y")], "y");
        let m1 = commit(&mut table, vec![x.clone(), y.clone()], &[("a", "m1")], "m1");
        let m2 = commit(&mut table, vec![y.clone(), x.clone()], &[("a", "m2")], "m2");

        let mut ancestors = table.common_ancestors(&m1, &m2).unwrap();
        ancestors.sort();
        let mut expected = vec![x, y];
        expected.sort();
        assert_eq!(ancestors, expected);
    }

    #[test]
    fn ancestor_of_a_descendant_is_not_maximal() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = CommitTable::load(CommitTable::default_path(dir.path())).unwrap();
        let a = commit(&mut table, vec![], &[("f", "1")], "a");
        let b = commit(&mut table, vec![a.clone()], &[("f", "2")], "b");
        let left = commit(&mut table, vec![b.clone()], &[("f", "3")], "left");
        let right = commit(&mut table, vec![b.clone()], &[("f", "4")], "right");

        assert_eq!(table.common_ancestors(&left, &right).unwrap(), vec![b]);
    }

    #[test]
    fn null_revision_has_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let table = CommitTable::load(CommitTable::default_path(dir.path())).unwrap();
        assert!(table.manifest(&NodeId::null()).unwrap().is_empty());
        assert!(table.exists(&NodeId::null()));
    }

    // -- RecordedCopies --

    #[test]
    fn local_rename_record_detected() {
        let ancestor = manifest(&[("old.rs", "body")]);
        let local = manifest(&[("new.rs", "body")]);
        let remote = manifest(&[("old.rs", "body")]);
        let local_copies: BTreeMap<String, String> =
            [("new.rs".to_owned(), "old.rs".to_owned())].into();

        let det =
            RecordedCopies.detect(&local, &remote, &ancestor, &local_copies, &BTreeMap::new());
        assert_eq!(det.copy.get("new.rs").map(String::as_str), Some("old.rs"));
    }

    #[test]
    fn divergent_renames_reported_not_copied() {
        let ancestor = manifest(&[("src.rs", "body")]);
        let local = manifest(&[("left.rs", "body")]);
        let remote = manifest(&[("right.rs", "body")]);
        let local_copies: BTreeMap<String, String> =
            [("left.rs".to_owned(), "src.rs".to_owned())].into();
        let remote_copies: BTreeMap<String, String> =
            [("right.rs".to_owned(), "src.rs".to_owned())].into();

        let det = RecordedCopies.detect(&local, &remote, &ancestor, &local_copies, &remote_copies);
        assert!(det.copy.is_empty());
        let dests = det.divergent.get("src.rs").unwrap();
        assert!(dests.contains(&"left.rs".to_owned()));
        assert!(dests.contains(&"right.rs".to_owned()));
    }

    #[test]
    fn directory_rename_inferred_when_all_files_moved() {
        let ancestor = manifest(&[("dir/a.rs", "a"), ("dir/b.rs", "b")]);
        let local = manifest(&[("lib/a.rs", "a"), ("lib/b.rs", "b")]);
        let remote = manifest(&[("dir/a.rs", "a"), ("dir/b.rs", "b"), ("dir/new.rs", "n")]);
        let local_copies: BTreeMap<String, String> = [
            ("lib/a.rs".to_owned(), "dir/a.rs".to_owned()),
            ("lib/b.rs".to_owned(), "dir/b.rs".to_owned()),
        ]
        .into();

        let det =
            RecordedCopies.detect(&local, &remote, &ancestor, &local_copies, &BTreeMap::new());
        assert_eq!(det.dir_move.get("dir").map(String::as_str), Some("lib"));
        assert_eq!(
            det.move_with_dir.get("dir/new.rs").map(String::as_str),
            Some("lib/new.rs"),
            "remote's new file follows the local directory rename"
        );
    }

    #[test]
    fn partial_directory_move_is_not_a_dir_rename() {
        let ancestor = manifest(&[("dir/a.rs", "a"), ("dir/b.rs", "b")]);
        let local = manifest(&[("lib/a.rs", "a"), ("dir/b.rs", "b")]);
        let remote = manifest(&[("dir/a.rs", "a"), ("dir/b.rs", "b")]);
        let local_copies: BTreeMap<String, String> =
            [("lib/a.rs".to_owned(), "dir/a.rs".to_owned())].into();

        let det =
            RecordedCopies.detect(&local, &remote, &ancestor, &local_copies, &BTreeMap::new());
        assert!(det.dir_move.is_empty());
    }
}
