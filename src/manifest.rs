//! Manifests: tree snapshots mapping repository paths to file nodes.
//!
//! A [`Manifest`] is an ordered map from repo-relative path to
//! ([`NodeId`], [`FileFlag`]). Committed manifests are immutable;
//! working-copy manifests use sentinel node ids (see [`NodeId::working`]
//! and [`NodeId::added`]) because in-memory file content has no stable
//! identity until committed.
//!
//! [`diff`] compares two manifests under an optional [`Matcher`]
//! restriction. Equality is by node-id + flag; when either side carries
//! the working-copy sentinel, id equality says nothing and the caller's
//! byte-comparison callback decides (see [`diff_with`]).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// A content identifier: 40 lowercase hex characters (first 20 bytes of
/// SHA-256 over the content).
///
/// Three sentinel values are reserved:
/// - [`NodeId::null`] — "no content" (all zeros),
/// - [`NodeId::working`] — uncommitted working-copy content, conflated
///   across all files (all `f`),
/// - [`NodeId::added`] — a file added in the working copy with no
///   committed ancestor (all `a`).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

const NODE_HEX_LEN: usize = 40;

impl NodeId {
    /// Validate and wrap a 40-char lowercase hex string.
    pub fn new(s: &str) -> Result<Self, InvalidNodeId> {
        if s.len() == NODE_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            Ok(Self(s.to_owned()))
        } else {
            Err(InvalidNodeId { raw: s.to_owned() })
        }
    }

    /// Compute the id of a byte string.
    #[must_use]
    pub fn from_content(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut hex = String::with_capacity(NODE_HEX_LEN);
        for b in &digest[..20] {
            use fmt::Write as _;
            let _ = write!(hex, "{b:02x}");
        }
        Self(hex)
    }

    /// The null id — "no content here".
    #[must_use]
    pub fn null() -> Self {
        Self("0".repeat(NODE_HEX_LEN))
    }

    /// The working-copy sentinel. All uncommitted files share it, so two
    /// equal working ids say nothing about content equality.
    #[must_use]
    pub fn working() -> Self {
        Self("f".repeat(NODE_HEX_LEN))
    }

    /// The added-placeholder sentinel for files that exist only in the
    /// working copy.
    #[must_use]
    pub fn added() -> Self {
        Self("a".repeat(NODE_HEX_LEN))
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }

    #[must_use]
    pub fn is_working(&self) -> bool {
        self.0.bytes().all(|b| b == b'f')
    }

    #[must_use]
    pub fn is_added(&self) -> bool {
        self.0.bytes().all(|b| b == b'a')
    }

    /// True if this id is any of the sentinels rather than real content.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.is_null() || self.is_working() || self.is_added()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log output.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

/// A string failed [`NodeId`] validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidNodeId {
    pub raw: String,
}

impl fmt::Display for InvalidNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node id: {:?} (want 40 lowercase hex chars)", self.raw)
    }
}

impl std::error::Error for InvalidNodeId {}

// ---------------------------------------------------------------------------
// FileFlag
// ---------------------------------------------------------------------------

/// Per-file mode flag carried alongside the content id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFlag {
    /// Regular file.
    #[default]
    None,
    /// Regular file with the executable bit.
    Executable,
    /// Symbolic link — the content is the link target.
    Symlink,
    /// Submodule pointer.
    Submodule,
}

impl FileFlag {
    /// One-character code used in merge-state records and logs.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Executable => "x",
            Self::Symlink => "l",
            Self::Submodule => "m",
        }
    }

    /// Parse a one-character flag code.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "x" => Self::Executable,
            "l" => Self::Symlink,
            "m" => Self::Submodule,
            _ => Self::None,
        }
    }

    /// True when switching between this flag and `other` requires the
    /// file to be removed before it is rewritten (symlink vs. regular).
    #[must_use]
    pub fn needs_remove_before_write(self, other: Self) -> bool {
        (self == Self::Symlink) != (other == Self::Symlink)
    }
}

impl fmt::Display for FileFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "regular"),
            Self::Executable => write!(f, "executable"),
            Self::Symlink => write!(f, "symlink"),
            Self::Submodule => write!(f, "submodule"),
        }
    }
}

// ---------------------------------------------------------------------------
// FileNode + Manifest
// ---------------------------------------------------------------------------

/// One manifest entry: content id plus mode flag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub id: NodeId,
    #[serde(default)]
    pub flag: FileFlag,
}

impl FileNode {
    #[must_use]
    pub const fn new(id: NodeId, flag: FileFlag) -> Self {
        Self { id, flag }
    }

    #[must_use]
    pub fn regular(id: NodeId) -> Self {
        Self { id, flag: FileFlag::None }
    }
}

/// A tree snapshot: ordered map from repo-relative path to [`FileNode`].
///
/// Paths are `/`-separated and never begin with `/`. Ordering is
/// lexicographic by path, which makes every iteration deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, FileNode>,
}

impl Manifest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, node: FileNode) {
        self.entries.insert(path.into(), node);
    }

    pub fn remove(&mut self, path: &str) -> Option<FileNode> {
        self.entries.remove(path)
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FileNode> {
        self.entries.get(path)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    #[must_use]
    pub fn flag(&self, path: &str) -> FileFlag {
        self.entries.get(path).map_or(FileFlag::None, |n| n.flag)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileNode)> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Paths under `dir/` (no trailing slash on `dir`).
    pub fn paths_under<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        let prefix = format!("{dir}/");
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| p)
    }

    /// A stable digest over the whole manifest, used as the manifest's
    /// own identity in the commit table.
    #[must_use]
    pub fn digest(&self) -> NodeId {
        let mut hasher = Sha256::new();
        for (path, node) in &self.entries {
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            hasher.update(node.id.as_str().as_bytes());
            hasher.update(node.flag.code().as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(NODE_HEX_LEN);
        for b in &digest[..20] {
            use fmt::Write as _;
            let _ = write!(hex, "{b:02x}");
        }
        NodeId(hex)
    }
}

impl FromIterator<(String, FileNode)> for Manifest {
    fn from_iter<T: IntoIterator<Item = (String, FileNode)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// A path restriction for [`diff`].
///
/// `All` matches everything; `Files` matches an explicit set. The
/// planner builds a `Files` matcher from the ancestor-vs-remote diff
/// plus copy sources, an optimization that must never change which
/// actions come out.
#[derive(Clone, Debug)]
pub enum Matcher {
    All,
    Files(BTreeSet<String>),
}

impl Matcher {
    #[must_use]
    pub fn files<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Files(paths.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::All => true,
            Self::Files(set) => set.contains(path),
        }
    }

    #[must_use]
    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// One side of a diff entry: `None` means the path is absent there.
pub type DiffSide = Option<FileNode>;

/// Flat result of comparing two manifests: path → (side A, side B).
/// Paths equal on both sides are omitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub entries: BTreeMap<String, (DiffSide, DiffSide)>,
}

impl ManifestDiff {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &(DiffSide, DiffSide))> {
        self.entries.iter()
    }
}

/// Diff two manifests under a matcher.
///
/// Neither side may contain working-copy sentinel ids — use
/// [`diff_with`] when one side is a working manifest.
#[must_use]
pub fn diff(a: &Manifest, b: &Manifest, matcher: &Matcher) -> ManifestDiff {
    diff_with(a, b, matcher, |_| true)
}

/// Diff two manifests, resolving working-sentinel comparisons through
/// `differs`.
///
/// `differs(path)` is consulted only when the path exists on both sides
/// with equal flags and at least one side carries [`NodeId::working`];
/// it must return `true` if the actual file content differs from the
/// other side's content. Immutable ids that already differ skip the
/// callback entirely (the fast path the optimization note in the
/// differ contract allows).
pub fn diff_with<F>(a: &Manifest, b: &Manifest, matcher: &Matcher, differs: F) -> ManifestDiff
where
    F: Fn(&str) -> bool,
{
    let mut entries = BTreeMap::new();

    let mut push = |path: &String, na: DiffSide, nb: DiffSide| {
        entries.insert(path.clone(), (na, nb));
    };

    // Walk the union of both key sets in order. BTreeMap iteration keeps
    // the output deterministic.
    let mut ai = a.entries.iter().peekable();
    let mut bi = b.entries.iter().peekable();
    loop {
        match (ai.peek(), bi.peek()) {
            (Some((pa, na)), Some((pb, nb))) => match pa.cmp(pb) {
                std::cmp::Ordering::Less => {
                    if matcher.matches(pa) {
                        push(pa, Some((*na).clone()), None);
                    }
                    ai.next();
                }
                std::cmp::Ordering::Greater => {
                    if matcher.matches(pb) {
                        push(pb, None, Some((*nb).clone()));
                    }
                    bi.next();
                }
                std::cmp::Ordering::Equal => {
                    if matcher.matches(pa) && nodes_differ(pa, na, nb, &differs) {
                        push(pa, Some((*na).clone()), Some((*nb).clone()));
                    }
                    ai.next();
                    bi.next();
                }
            },
            (Some((pa, na)), None) => {
                if matcher.matches(pa) {
                    push(pa, Some((*na).clone()), None);
                }
                ai.next();
            }
            (None, Some((pb, nb))) => {
                if matcher.matches(pb) {
                    push(pb, None, Some((*nb).clone()));
                }
                bi.next();
            }
            (None, None) => break,
        }
    }

    ManifestDiff { entries }
}

fn nodes_differ<F>(path: &str, a: &FileNode, b: &FileNode, differs: &F) -> bool
where
    F: Fn(&str) -> bool,
{
    if a.flag != b.flag {
        return true;
    }
    let conflated = a.id.is_working() || b.id.is_working();
    if conflated {
        // Equal immutable ids can't happen here unless both are the
        // sentinel, so content comparison is the only truth.
        if !a.id.is_working() && !b.id.is_working() {
            return a.id != b.id;
        }
        return differs(path);
    }
    a.id != b.id
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn node(seed: &str) -> FileNode {
        FileNode::regular(NodeId::from_content(seed.as_bytes()))
    }

    fn manifest(entries: &[(&str, &str)]) -> Manifest {
        entries
            .iter()
            .map(|(p, c)| ((*p).to_owned(), node(c)))
            .collect()
    }

    // -- NodeId --

    #[test]
    fn node_id_from_content_is_deterministic() {
        let a = NodeId::from_content(b"hello");
        let b = NodeId::from_content(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 40);
    }

    #[test]
    fn node_id_rejects_bad_input() {
        assert!(NodeId::new("short").is_err());
        assert!(NodeId::new(&"G".repeat(40)).is_err());
        assert!(NodeId::new(&"A".repeat(40)).is_err());
        assert!(NodeId::new(&"a".repeat(40)).is_ok());
    }

    #[test]
    fn node_id_sentinels() {
        assert!(NodeId::null().is_null());
        assert!(NodeId::working().is_working());
        assert!(NodeId::added().is_added());
        assert!(NodeId::working().is_sentinel());
        assert!(!NodeId::from_content(b"x").is_sentinel());
    }

    // -- FileFlag --

    #[test]
    fn flag_codes_roundtrip() {
        for flag in [
            FileFlag::None,
            FileFlag::Executable,
            FileFlag::Symlink,
            FileFlag::Submodule,
        ] {
            assert_eq!(FileFlag::from_code(flag.code()), flag);
        }
    }

    #[test]
    fn symlink_transitions_need_remove() {
        assert!(FileFlag::Symlink.needs_remove_before_write(FileFlag::None));
        assert!(FileFlag::None.needs_remove_before_write(FileFlag::Symlink));
        assert!(!FileFlag::None.needs_remove_before_write(FileFlag::Executable));
    }

    // -- diff --

    #[test]
    fn diff_equal_manifests_is_empty() {
        let m = manifest(&[("a.txt", "1"), ("b.txt", "2")]);
        assert!(diff(&m, &m, &Matcher::All).is_empty());
    }

    #[test]
    fn diff_reports_adds_removes_and_changes() {
        let a = manifest(&[("common", "same"), ("gone", "old"), ("changed", "v1")]);
        let b = manifest(&[("common", "same"), ("new", "fresh"), ("changed", "v2")]);
        let d = diff(&a, &b, &Matcher::All);

        assert_eq!(d.len(), 3);
        let (la, lb) = &d.entries["gone"];
        assert!(la.is_some() && lb.is_none());
        let (na, nb) = &d.entries["new"];
        assert!(na.is_none() && nb.is_some());
        let (ca, cb) = &d.entries["changed"];
        assert_ne!(ca, cb);
    }

    #[test]
    fn diff_flag_only_change_is_reported() {
        let mut a = Manifest::new();
        a.insert("run.sh", FileNode::new(NodeId::from_content(b"#!"), FileFlag::None));
        let mut b = Manifest::new();
        b.insert("run.sh", FileNode::new(NodeId::from_content(b"#!"), FileFlag::Executable));
        let d = diff(&a, &b, &Matcher::All);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn diff_respects_matcher() {
        let a = manifest(&[("keep/x", "1"), ("skip/y", "1")]);
        let b = manifest(&[("keep/x", "2"), ("skip/y", "2")]);
        let d = diff(&a, &b, &Matcher::files(["keep/x"]));
        assert_eq!(d.len(), 1);
        assert!(d.entries.contains_key("keep/x"));
    }

    #[test]
    fn diff_working_sentinel_consults_callback() {
        let mut wc = Manifest::new();
        wc.insert("f.txt", FileNode::regular(NodeId::working()));
        let mut target = Manifest::new();
        target.insert("f.txt", FileNode::regular(NodeId::from_content(b"x")));

        let same = diff_with(&wc, &target, &Matcher::All, |_| false);
        assert!(same.is_empty(), "callback says equal → no diff entry");

        let differ = diff_with(&wc, &target, &Matcher::All, |_| true);
        assert_eq!(differ.len(), 1);
    }

    #[test]
    fn diff_restriction_produces_subset_of_full() {
        let a = manifest(&[("a", "1"), ("b", "1"), ("c", "1")]);
        let b = manifest(&[("a", "2"), ("b", "1"), ("c", "3")]);
        let full = diff(&a, &b, &Matcher::All);
        let restricted = diff(&a, &b, &Matcher::files(["a"]));
        for path in restricted.entries.keys() {
            assert_eq!(full.entries.get(path), restricted.entries.get(path));
        }
    }

    // -- Manifest --

    #[test]
    fn paths_under_lists_only_directory_children() {
        let m = manifest(&[("dir/a", "1"), ("dir/b", "2"), ("dirx", "3"), ("other/c", "4")]);
        let under: Vec<_> = m.paths_under("dir").collect();
        assert_eq!(under, ["dir/a", "dir/b"]);
    }

    #[test]
    fn manifest_digest_changes_with_content() {
        let a = manifest(&[("f", "1")]);
        let b = manifest(&[("f", "2")]);
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), a.digest());
    }
}
