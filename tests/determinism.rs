//! Property tests for the planner's contract: determinism, one action
//! per path, keep-idempotence, and the diff-restriction equivalence.

use proptest::prelude::*;

use estuary::manifest::{FileNode, Manifest, NodeId};
use estuary::merge::plan::{manifest_merge, CopyDetection, PlanOptions};

/// Small random manifests over a fixed path alphabet so the three
/// sides genuinely overlap.
fn arb_manifest() -> impl Strategy<Value = Manifest> {
    proptest::collection::btree_map("[ab]/[abc]\\.txt", 0u8..4, 0..8).prop_map(|m| {
        m.into_iter()
            .map(|(path, version)| {
                (path, FileNode::regular(NodeId::from_content(&[version])))
            })
            .collect()
    })
}

fn plan(local: &Manifest, remote: &Manifest, ancestor: &Manifest, restrict: bool) -> estuary::merge::plan::PlanOutcome {
    manifest_merge(
        local,
        remote,
        ancestor,
        &CopyDetection::default(),
        PlanOptions::default(),
        restrict,
        |_| true,
    )
}

proptest! {
    /// Same inputs, same plan — every time.
    #[test]
    fn plan_is_deterministic(
        local in arb_manifest(),
        remote in arb_manifest(),
        ancestor in arb_manifest(),
    ) {
        let first = plan(&local, &remote, &ancestor, false);
        let second = plan(&local, &remote, &ancestor, false);
        prop_assert_eq!(first, second);
    }

    /// An already-clean merge (local == remote) plans nothing at all:
    /// the diff is empty, so re-running it has zero side effects.
    #[test]
    fn identical_sides_plan_nothing(
        side in arb_manifest(),
        ancestor in arb_manifest(),
    ) {
        let outcome = plan(&side, &side, &ancestor, false);
        prop_assert!(outcome.actions.is_empty());
    }

    /// The asymmetric diff restriction is an optimization, never a
    /// semantic change: every non-keep action of the full plan appears
    /// identically in the restricted plan, and the restricted plan
    /// invents nothing the full plan lacks.
    #[test]
    fn restriction_preserves_semantics(
        local in arb_manifest(),
        remote in arb_manifest(),
        ancestor in arb_manifest(),
    ) {
        let full = plan(&local, &remote, &ancestor, false);
        let restricted = plan(&local, &remote, &ancestor, true);
        for action in full.actions.iter().filter(|a| a.kind.code() != "k") {
            prop_assert_eq!(restricted.actions.get(&action.path), Some(action));
        }
        for action in restricted.actions.iter() {
            prop_assert_eq!(full.actions.get(&action.path), Some(action));
        }
    }

    /// Completeness: every path in the local/remote diff either gets
    /// exactly one action or falls into one of the two documented
    /// silent classes (local-only creation; local deletion winning
    /// over an unchanged remote).
    #[test]
    fn every_diffed_path_is_accounted_for(
        local in arb_manifest(),
        remote in arb_manifest(),
        ancestor in arb_manifest(),
    ) {
        let diff = estuary::manifest::diff(&local, &remote, &estuary::manifest::Matcher::All);
        let outcome = plan(&local, &remote, &ancestor, false);
        for path in diff.entries.keys() {
            let covered = outcome.actions.contains(path)
                || (local.contains(path) && !ancestor.contains(path) && !remote.contains(path))
                || (!local.contains(path)
                    && ancestor.get(path).map(|n| &n.id) == remote.get(path).map(|n| &n.id));
            prop_assert!(covered, "path {} fell through the planner", path);
        }
    }
}
