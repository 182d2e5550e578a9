//! Unified error type for the merge/checkout engine.
//!
//! [`EstuaryError`] carries the user-facing abort taxonomy: every
//! variant says what went wrong and what to do next, so callers can
//! print it verbatim. Recoverable per-path I/O never lands here — the
//! applier reports those as warnings.

use std::fmt;

use crate::config::ConfigError;
use crate::dirstate::DirstateError;
use crate::lock::LockError;
use crate::manifest::NodeId;
use crate::merge::apply::ApplyError;
use crate::merge::check::CheckError;
use crate::merge::state::MergeStateError;
use crate::store::StoreError;

// ---------------------------------------------------------------------------
// EstuaryError
// ---------------------------------------------------------------------------

/// Unified error for orchestrated operations.
#[derive(Debug)]
pub enum EstuaryError {
    /// Uncommitted changes block the requested operation.
    UncommittedChanges {
        /// Why the changes block (e.g. "non-linear update").
        detail: String,
    },

    /// A previous merge still has unresolved files.
    UnresolvedMerge {
        files: Vec<String>,
    },

    /// The working copy has two parents; commit or discard first.
    OutstandingMergeParents,

    /// Merging with an ancestor of the working copy is a no-op.
    MergeWithAncestor,

    /// Merging with a descendant: an update is wanted instead.
    MergeWithDescendant,

    /// The target revision does not exist.
    UnknownRevision {
        node: NodeId,
    },

    /// The configured merge driver is not the one that started the
    /// in-progress merge.
    DriverChanged {
        recorded: String,
        configured: String,
    },

    /// No interrupted operation to continue or abort.
    NothingToResume,

    /// An interrupted operation exists; it must be continued or
    /// aborted before anything else runs.
    InterruptedUpdate {
        target: NodeId,
    },

    /// Pre-apply checks refused the plan.
    Check(CheckError),

    /// Lock acquisition failed.
    Lock(LockError),

    /// Persisted merge state is unusable.
    MergeState(MergeStateError),

    /// Persisted dirstate is unusable.
    Dirstate(DirstateError),

    /// Store/commit-graph access failed.
    Store(StoreError),

    /// Applying actions failed.
    Apply(ApplyError),

    /// Configuration problem.
    Config(ConfigError),

    /// An I/O error outside any collaborator.
    Io(std::io::Error),
}

impl fmt::Display for EstuaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UncommittedChanges { detail } => {
                write!(
                    f,
                    "uncommitted changes: {detail}\n  To fix: commit or discard your changes, or rerun with --check none/--force."
                )
            }
            Self::UnresolvedMerge { files } => {
                write!(f, "unresolved merge conflicts in {} file(s):", files.len())?;
                for file in files {
                    write!(f, "\n  - {file}")?;
                }
                write!(f, "\n  To fix: resolve each file, mark it with `estuary resolve`, then retry.")
            }
            Self::OutstandingMergeParents => {
                write!(
                    f,
                    "the working copy has an uncommitted merge.\n  To fix: commit the merge, or discard it with `estuary abort`."
                )
            }
            Self::MergeWithAncestor => {
                write!(f, "merging with an ancestor of the working copy is a no-op")
            }
            Self::MergeWithDescendant => {
                write!(
                    f,
                    "the merge target is a descendant of the working copy.\n  To fix: run `estuary update` instead of merging."
                )
            }
            Self::UnknownRevision { node } => write!(f, "unknown revision: {}", node.short()),
            Self::DriverChanged { recorded, configured } => {
                write!(
                    f,
                    "the merge driver changed since this merge started ('{recorded}' → '{configured}').\n  To fix: restore the original driver configuration, or abort the merge."
                )
            }
            Self::NothingToResume => {
                write!(f, "no interrupted operation to continue or abort")
            }
            Self::InterruptedUpdate { target } => {
                write!(
                    f,
                    "an interrupted update to {} is in progress.\n  To fix: run `estuary continue` to finish it, or `estuary abort` to unwind.",
                    target.short()
                )
            }
            Self::Check(e) => write!(f, "{e}"),
            Self::Lock(e) => write!(f, "{e}"),
            Self::MergeState(e) => write!(f, "{e}"),
            Self::Dirstate(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Apply(e) => write!(f, "{e}"),
            Self::Config(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for EstuaryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Check(e) => Some(e),
            Self::Lock(e) => Some(e),
            Self::MergeState(e) => Some(e),
            Self::Dirstate(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Apply(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<CheckError> for EstuaryError {
    fn from(e: CheckError) -> Self {
        Self::Check(e)
    }
}

impl From<LockError> for EstuaryError {
    fn from(e: LockError) -> Self {
        Self::Lock(e)
    }
}

impl From<MergeStateError> for EstuaryError {
    fn from(e: MergeStateError) -> Self {
        Self::MergeState(e)
    }
}

impl From<DirstateError> for EstuaryError {
    fn from(e: DirstateError) -> Self {
        Self::Dirstate(e)
    }
}

impl From<StoreError> for EstuaryError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ApplyError> for EstuaryError {
    fn from(e: ApplyError) -> Self {
        Self::Apply(e)
    }
}

impl From<ConfigError> for EstuaryError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<std::io::Error> for EstuaryError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uncommitted_changes_is_actionable() {
        let err = EstuaryError::UncommittedChanges { detail: "non-linear update".into() };
        let msg = format!("{err}");
        assert!(msg.contains("non-linear update"));
        assert!(msg.contains("To fix"));
    }

    #[test]
    fn display_unresolved_merge_lists_files() {
        let err = EstuaryError::UnresolvedMerge {
            files: vec!["a.rs".into(), "b.rs".into()],
        };
        let msg = format!("{err}");
        assert!(msg.contains("2 file(s)"));
        assert!(msg.contains("a.rs"));
        assert!(msg.contains("estuary resolve"));
    }

    #[test]
    fn display_driver_changed_names_both() {
        let err = EstuaryError::DriverChanged {
            recorded: "old.sh".into(),
            configured: "new.sh".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("old.sh"));
        assert!(msg.contains("new.sh"));
    }

    #[test]
    fn display_interrupted_update_names_target() {
        let target = NodeId::from_content(b"target");
        let err = EstuaryError::InterruptedUpdate { target: target.clone() };
        let msg = format!("{err}");
        assert!(msg.contains(target.short()));
        assert!(msg.contains("estuary continue"));
        assert!(msg.contains("estuary abort"));
    }

    #[test]
    fn source_chains_through_wrapped_errors() {
        let err = EstuaryError::Lock(LockError::Io("boom".into()));
        assert!(std::error::Error::source(&err).is_some());
        let err = EstuaryError::MergeWithAncestor;
        assert!(std::error::Error::source(&err).is_none());
    }
}
