//! Shared fixture: an on-disk repository driven through the public
//! orchestrator API.
#![allow(dead_code)] // each test binary uses a different subset

use std::collections::BTreeMap;
use std::path::Path;

use estuary::config::UpdateCheck;
use estuary::manifest::{FileFlag, NodeId};
use estuary::repo::Repo;
use estuary::update::{update, UpdateOptions};

pub struct TestRepo {
    _dir: tempfile::TempDir,
    pub repo: Repo,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        Self { _dir: dir, repo }
    }

    pub fn root(&self) -> &Path {
        self.repo.root()
    }

    /// Create a commit from literal file contents.
    pub fn commit(&mut self, parents: Vec<NodeId>, files: &[(&str, &str)], message: &str) -> NodeId {
        let files: Vec<(&str, &[u8], FileFlag)> =
            files.iter().map(|(p, c)| (*p, c.as_bytes(), FileFlag::None)).collect();
        self.repo
            .commit_snapshot(parents, &files, BTreeMap::new(), message)
            .unwrap()
    }

    /// Create a commit carrying copy records (destination → source).
    pub fn commit_with_copies(
        &mut self,
        parents: Vec<NodeId>,
        files: &[(&str, &str)],
        copies: &[(&str, &str)],
        message: &str,
    ) -> NodeId {
        let files: Vec<(&str, &[u8], FileFlag)> =
            files.iter().map(|(p, c)| (*p, c.as_bytes(), FileFlag::None)).collect();
        let copies = copies
            .iter()
            .map(|(dst, src)| ((*dst).to_owned(), (*src).to_owned()))
            .collect();
        self.repo.commit_snapshot(parents, &files, copies, message).unwrap()
    }

    /// Move the working copy to a revision (no force).
    pub fn checkout(&mut self, node: &NodeId) {
        update(&mut self.repo, node, UpdateOptions::default()).unwrap();
    }

    /// Move the working copy to a revision, discarding local state.
    pub fn checkout_clean(&mut self, node: &NodeId) {
        update(
            &mut self.repo,
            node,
            UpdateOptions { force: true, check: Some(UpdateCheck::None) },
        )
        .unwrap();
    }

    pub fn write(&self, path: &str, content: &str) {
        let abs = self.root().join(path);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(abs, content).unwrap();
    }

    pub fn read(&self, path: &str) -> String {
        std::fs::read_to_string(self.root().join(path)).unwrap()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.root().join(path).exists()
    }

    pub fn delete(&self, path: &str) {
        std::fs::remove_file(self.root().join(path)).unwrap();
    }

    pub fn parents(&self) -> (NodeId, NodeId) {
        self.repo.dirstate.parents()
    }
}
