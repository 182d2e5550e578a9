//! The on-disk repository: metadata layout, working-copy scanning,
//! and lock ordering.
//!
//! Layout under `<root>/.estuary/`:
//!
//! ```text
//! config.toml        repository configuration
//! commits.json       commit graph (manifests + copy records)
//! store/             content-addressed blobs
//! dirstate.json      working-copy tracking table
//! merge-state.json   in-progress merge record
//! updatestate.json   resumability marker for interrupted updates
//! wlock / lock       working-copy and store lock files
//! ```
//!
//! [`Repo`] owns the collaborators and enforces lock ordering through
//! its API: [`Repo::lock_store`] demands a held working-copy guard, so
//! taking the store lock first does not compile.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::config::EstuaryConfig;
use crate::dirstate::{tracked_paths, DirstateBackend, EntryStatus, FlatDirstate};
use crate::error::EstuaryError;
use crate::lock::{LockGuard, LockOptions};
use crate::manifest::{FileFlag, FileNode, Manifest, NodeId};
use crate::merge::check::WorkingDirProbe;
use crate::store::{CommitRecord, CommitTable, ContentStore, FsStore};

pub const META_DIR: &str = ".estuary";

// ---------------------------------------------------------------------------
// Repo
// ---------------------------------------------------------------------------

/// An opened repository with a working copy.
pub struct Repo {
    root: PathBuf,
    meta: PathBuf,
    pub config: EstuaryConfig,
    pub store: FsStore,
    pub commits: CommitTable,
    pub dirstate: Box<dyn DirstateBackend>,
}

impl Repo {
    /// Create a fresh repository at `root`.
    pub fn init(root: &Path) -> Result<Self, EstuaryError> {
        let meta = root.join(META_DIR);
        std::fs::create_dir_all(&meta)?;
        Self::open(root)
    }

    /// Open an existing repository.
    pub fn open(root: &Path) -> Result<Self, EstuaryError> {
        let meta = root.join(META_DIR);
        let config = EstuaryConfig::load(&meta)?;
        let store = FsStore::new(meta.join("store"));
        let commits = CommitTable::load(CommitTable::default_path(&meta))?;
        let dirstate: Box<dyn DirstateBackend> =
            Box::new(FlatDirstate::load(FlatDirstate::default_path(&meta))?);
        Ok(Self { root: root.to_owned(), meta, config, store, commits, dirstate })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn meta_dir(&self) -> &Path {
        &self.meta
    }

    fn lock_opts(&self) -> LockOptions {
        LockOptions {
            timeout_secs: self.config.lock.timeout_secs,
            warn_after_secs: self.config.lock.warn_after_secs,
        }
    }

    /// Take the working-copy lock. Hold it for the whole
    /// checking→recording sequence.
    pub fn lock_working_copy(&self) -> Result<LockGuard, EstuaryError> {
        Ok(LockGuard::acquire(&self.meta.join("wlock"), self.lock_opts())?)
    }

    /// Take the store lock. Requires the working-copy lock first; the
    /// parameter is the ordering proof.
    pub fn lock_store(&self, _wc_lock: &LockGuard) -> Result<LockGuard, EstuaryError> {
        Ok(LockGuard::acquire(&self.meta.join("lock"), self.lock_opts())?)
    }

    // -----------------------------------------------------------------------
    // Commit creation (test and tooling entry point)
    // -----------------------------------------------------------------------

    /// Write file contents into the store and append a commit.
    pub fn commit_snapshot(
        &mut self,
        parents: Vec<NodeId>,
        files: &[(&str, &[u8], FileFlag)],
        copies: BTreeMap<String, String>,
        message: &str,
    ) -> Result<NodeId, EstuaryError> {
        let mut manifest = Manifest::new();
        for (path, bytes, flag) in files {
            let node = self.store.put(path, bytes)?;
            manifest.insert(*path, FileNode::new(node, *flag));
        }
        let node = self.commits.add(CommitRecord {
            parents,
            manifest,
            copies,
            message: message.to_owned(),
        })?;
        debug!(commit = %node.short(), "created commit");
        Ok(node)
    }

    // -----------------------------------------------------------------------
    // Working copy
    // -----------------------------------------------------------------------

    fn abs(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Read a working file; symlinks read as their target string.
    pub fn read_working_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let abs = self.abs(path);
        let meta = abs.symlink_metadata()?;
        if meta.file_type().is_symlink() {
            return Ok(std::fs::read_link(&abs)?.to_string_lossy().into_owned().into_bytes());
        }
        std::fs::read(abs)
    }

    fn working_flag(&self, path: &str) -> FileFlag {
        let abs = self.abs(path);
        let Ok(meta) = abs.symlink_metadata() else {
            return FileFlag::None;
        };
        if meta.file_type().is_symlink() {
            return FileFlag::Symlink;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            if meta.permissions().mode() & 0o111 != 0 {
                return FileFlag::Executable;
            }
        }
        FileFlag::None
    }

    /// The working-copy manifest. Clean files keep their parent
    /// filenode so the planner can see "unchanged" by id equality;
    /// modified files get the conflated [`NodeId::working`] sentinel
    /// (content comparison happens through the differ callback), and
    /// added files get [`NodeId::added`].
    pub fn working_manifest(&self) -> Result<Manifest, EstuaryError> {
        use crate::store::CommitGraph as _;
        let (p1, _) = self.dirstate.parents();
        let parent_manifest = self.commits.manifest(&p1)?;

        let mut manifest = Manifest::new();
        for (path, entry) in self.dirstate.entries() {
            if entry.status == EntryStatus::Removed {
                continue;
            }
            let node = match parent_manifest.get(&path) {
                Some(parent_node) if entry.status != EntryStatus::Added => {
                    if self.working_file_differs(&path, parent_node) {
                        FileNode::new(NodeId::working(), self.working_flag(&path))
                    } else {
                        parent_node.clone()
                    }
                }
                _ => FileNode::new(NodeId::added(), self.working_flag(&path)),
            };
            manifest.insert(path.clone(), node);
        }
        Ok(manifest)
    }

    /// True when the working file's content or flag differs from the
    /// given manifest node. Used as the differ callback for
    /// working-sentinel comparisons.
    #[must_use]
    pub fn working_file_differs(&self, path: &str, against: &FileNode) -> bool {
        match self.read_working_file(path) {
            Ok(bytes) => {
                NodeId::from_content(&bytes) != against.id || self.working_flag(path) != against.flag
            }
            Err(_) => true,
        }
    }

    /// Walk the working directory, skipping repository metadata.
    fn walk_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false).into_iter().filter_entry(|e| {
            e.file_name().to_str() != Some(META_DIR)
        }) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() && !entry.file_type().is_symlink() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        files.sort();
        files
    }

    /// Status of the working copy against its first parent.
    pub fn working_status(&self) -> Result<WorkingStatus, EstuaryError> {
        use crate::store::CommitGraph as _;
        let (p1, _) = self.dirstate.parents();
        let parent_manifest = self.commits.manifest(&p1)?;

        let mut status = WorkingStatus::default();
        let mut seen_tracked = std::collections::BTreeSet::new();

        for (path, entry) in self.dirstate.entries() {
            match entry.status {
                EntryStatus::Removed => {
                    status.removed.push(path.clone());
                    seen_tracked.insert(path);
                    continue;
                }
                EntryStatus::Added => {
                    if self.abs(&path).symlink_metadata().is_ok() {
                        status.added.push(path.clone());
                    } else {
                        status.deleted.push(path.clone());
                    }
                }
                EntryStatus::Normal | EntryStatus::Merged => {
                    if self.abs(&path).symlink_metadata().is_err() {
                        status.deleted.push(path.clone());
                    } else {
                        let differs = match parent_manifest.get(&path) {
                            Some(node) => self.working_file_differs(&path, node),
                            None => true,
                        };
                        if differs || entry.status == EntryStatus::Merged {
                            status.modified.push(path.clone());
                        }
                    }
                }
            }
            seen_tracked.insert(path);
        }

        for path in self.walk_files() {
            if !seen_tracked.contains(&path) {
                status.unknown.push(path);
            }
        }
        Ok(status)
    }

    /// The dirstate's copy records (destination → source).
    #[must_use]
    pub fn local_copies(&self) -> BTreeMap<String, String> {
        self.dirstate
            .entries()
            .into_iter()
            .filter_map(|(path, entry)| entry.copy_source.map(|src| (path, src)))
            .collect()
    }

    /// A [`WorkingDirProbe`] view for the checker.
    #[must_use]
    pub fn probe(&self) -> RepoProbe<'_> {
        RepoProbe { repo: self }
    }
}

// ---------------------------------------------------------------------------
// WorkingStatus
// ---------------------------------------------------------------------------

/// Classified working-copy state relative to the first parent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkingStatus {
    /// Tracked, content or flag changed.
    pub modified: Vec<String>,
    /// Scheduled for addition and present on disk.
    pub added: Vec<String>,
    /// Scheduled for removal.
    pub removed: Vec<String>,
    /// Tracked but missing from disk.
    pub deleted: Vec<String>,
    /// On disk but untracked.
    pub unknown: Vec<String>,
}

impl WorkingStatus {
    /// Anything that would be lost by an overwrite.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.modified.is_empty()
            || !self.added.is_empty()
            || !self.removed.is_empty()
            || !self.deleted.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RepoProbe
// ---------------------------------------------------------------------------

/// Checker-facing read-only view of the working directory.
pub struct RepoProbe<'a> {
    repo: &'a Repo,
}

impl WorkingDirProbe for RepoProbe<'_> {
    fn is_file(&self, path: &str) -> bool {
        self.repo
            .abs(path)
            .symlink_metadata()
            .map(|m| m.is_file() || m.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.repo.abs(path).is_dir()
    }

    fn is_tracked(&self, path: &str) -> bool {
        self.repo
            .dirstate
            .entry(path)
            .is_some_and(|e| e.status != EntryStatus::Removed)
    }

    fn dir_has_untracked(&self, dir: &str) -> bool {
        let abs = self.repo.abs(dir);
        for entry in WalkDir::new(&abs).follow_links(false) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.repo.root) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                if !self.is_tracked(&rel) {
                    return true;
                }
            }
        }
        false
    }

    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        self.repo.read_working_file(path)
    }
}

/// Convenience: the set of tracked paths.
#[must_use]
pub fn tracked(repo: &Repo) -> Vec<String> {
    tracked_paths(repo.dirstate.as_ref())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CommitGraph as _;

    fn repo() -> (tempfile::TempDir, Repo) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn init_creates_meta_dir() {
        let (dir, _repo) = repo();
        assert!(dir.path().join(META_DIR).exists());
    }

    #[test]
    fn commit_snapshot_round_trips_through_graph_and_store() {
        let (_dir, mut repo) = repo();
        let node = repo
            .commit_snapshot(vec![], &[("a.txt", b"hello", FileFlag::None)], BTreeMap::new(), "c1")
            .unwrap();
        let manifest = repo.commits.manifest(&node).unwrap();
        let file = manifest.get("a.txt").unwrap();
        assert_eq!(repo.store.get("a.txt", &file.id).unwrap(), b"hello");
    }

    #[test]
    fn working_manifest_mixes_parent_nodes_and_sentinels() {
        let (dir, mut repo) = repo();
        let p1 = repo
            .commit_snapshot(
                vec![],
                &[("clean.txt", b"same", FileFlag::None), ("edit.txt", b"old", FileFlag::None)],
                BTreeMap::new(),
                "base",
            )
            .unwrap();
        repo.dirstate.set_parents(p1.clone(), NodeId::null());
        repo.dirstate.set_status("clean.txt", EntryStatus::Normal);
        repo.dirstate.set_status("edit.txt", EntryStatus::Normal);
        repo.dirstate.set_status("new.txt", EntryStatus::Added);
        repo.dirstate.set_status("gone.txt", EntryStatus::Removed);
        std::fs::write(dir.path().join("clean.txt"), "same").unwrap();
        std::fs::write(dir.path().join("edit.txt"), "changed").unwrap();
        std::fs::write(dir.path().join("new.txt"), "y").unwrap();

        let parent_manifest = repo.commits.manifest(&p1).unwrap();
        let wm = repo.working_manifest().unwrap();
        assert_eq!(
            wm.get("clean.txt"),
            parent_manifest.get("clean.txt"),
            "clean file keeps its parent node"
        );
        assert!(wm.get("edit.txt").unwrap().id.is_working());
        assert!(wm.get("new.txt").unwrap().id.is_added());
        assert!(!wm.contains("gone.txt"));
    }

    #[test]
    fn working_status_classifies() {
        let (dir, mut repo) = repo();
        let p1 = repo
            .commit_snapshot(
                vec![],
                &[("clean.txt", b"same", FileFlag::None), ("edit.txt", b"old", FileFlag::None)],
                BTreeMap::new(),
                "base",
            )
            .unwrap();
        repo.dirstate.set_parents(p1, NodeId::null());
        repo.dirstate.set_status("clean.txt", EntryStatus::Normal);
        repo.dirstate.set_status("edit.txt", EntryStatus::Normal);
        repo.dirstate.set_status("missing.txt", EntryStatus::Normal);
        repo.dirstate.set_status("staged.txt", EntryStatus::Added);

        std::fs::write(dir.path().join("clean.txt"), "same").unwrap();
        std::fs::write(dir.path().join("edit.txt"), "new content").unwrap();
        std::fs::write(dir.path().join("staged.txt"), "added").unwrap();
        std::fs::write(dir.path().join("stray.txt"), "untracked").unwrap();

        let status = repo.working_status().unwrap();
        assert_eq!(status.modified, ["edit.txt"]);
        assert_eq!(status.added, ["staged.txt"]);
        assert_eq!(status.deleted, ["missing.txt"]);
        assert_eq!(status.unknown, ["stray.txt"]);
        assert!(status.is_dirty());
    }

    #[test]
    fn clean_checkout_is_not_dirty() {
        let (dir, mut repo) = repo();
        let p1 = repo
            .commit_snapshot(vec![], &[("f.txt", b"body", FileFlag::None)], BTreeMap::new(), "base")
            .unwrap();
        repo.dirstate.set_parents(p1, NodeId::null());
        repo.dirstate.set_status("f.txt", EntryStatus::Normal);
        std::fs::write(dir.path().join("f.txt"), "body").unwrap();

        let status = repo.working_status().unwrap();
        assert!(!status.is_dirty(), "{status:?}");
        assert_eq!(status.unknown, Vec::<String>::new());
    }

    #[test]
    fn store_lock_requires_working_copy_lock() {
        let (_dir, repo) = repo();
        let wc = repo.lock_working_copy().unwrap();
        let _store = repo.lock_store(&wc).unwrap();
    }

    #[test]
    fn probe_reports_tracked_and_untracked() {
        let (dir, mut repo) = repo();
        std::fs::write(dir.path().join("t.txt"), "x").unwrap();
        std::fs::write(dir.path().join("u.txt"), "y").unwrap();
        repo.dirstate.set_status("t.txt", EntryStatus::Normal);

        let probe = repo.probe();
        assert!(probe.is_tracked("t.txt"));
        assert!(!probe.is_tracked("u.txt"));
        assert!(probe.is_file("u.txt"));
        assert!(!probe.is_file("absent.txt"));
    }
}
