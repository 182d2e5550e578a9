//! Multi-ancestor merge: the bid auction.
//!
//! When the ancestor computation yields more than one candidate, the
//! planner runs once per ancestor (with the diff restriction disabled
//! so every bid sees the full picture) and each run submits its actions
//! as bids. [`merge_bids`] resolves each path:
//!
//! 1. unanimous single-kind bids win outright;
//! 2. a `keep` bid wins if present — discarding a static-content
//!    conflict is always harmless;
//! 3. unanimous `get` or remove-then-get bids win even among other
//!    kinds;
//! 4. otherwise the ambiguity is logged and the bid with the
//!    lexicographically smallest action code wins. That order is a
//!    deliberate total order: callers must not depend on anything finer
//!    than "deterministic across runs".
//!
//! [`prune_dir_moves`] runs after the auction: a directory-move action
//! whose source file another bid deleted collapses to the deletion.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::merge::action::{Action, ActionKind, ActionSet};
use crate::merge::plan::PlanOutcome;

/// Resolve per-ancestor plan outcomes into a single outcome.
///
/// The rename warning maps are taken from the bid that produced the
/// fewest of them — an ancestor that explains more renames leaves less
/// to warn about.
#[must_use]
pub fn merge_plan_outcomes(bids: Vec<PlanOutcome>) -> PlanOutcome {
    debug_assert!(!bids.is_empty());
    if bids.len() == 1 {
        let mut only = bids.into_iter().next().expect("non-empty");
        prune_dir_moves(&mut only.actions);
        return only;
    }

    let divergent = bids
        .iter()
        .map(|b| &b.divergent)
        .min_by_key(|d| d.len())
        .cloned()
        .unwrap_or_default();
    let rename_delete = bids
        .iter()
        .map(|b| &b.rename_delete)
        .min_by_key(|d| d.len())
        .cloned()
        .unwrap_or_default();

    let mut actions = merge_bids(bids.into_iter().map(|b| b.actions).collect());
    prune_dir_moves(&mut actions);

    PlanOutcome { actions, divergent, rename_delete }
}

/// Auction the bids: pick exactly one action per path.
#[must_use]
pub fn merge_bids(bids: Vec<ActionSet>) -> ActionSet {
    let ancestor_count = bids.len();
    debug!(ancestors = ancestor_count, "auctioning merge bids");

    // path → action code → bids in submission order.
    let mut by_path: BTreeMap<String, BTreeMap<&'static str, Vec<Action>>> = BTreeMap::new();
    for bid in bids {
        for action in bid {
            by_path
                .entry(action.path.clone())
                .or_default()
                .entry(action.kind.code())
                .or_default()
                .push(action);
        }
    }

    let mut resolved = ActionSet::new();
    for (path, mut codes) in by_path {
        // Unanimous single kind with identical arguments.
        if codes.len() == 1 {
            let (_, candidates) = codes.iter().next().expect("non-empty");
            if candidates.windows(2).all(|w| w[0] == w[1]) {
                resolved.insert(candidates[0].clone());
                continue;
            }
        }

        // A keep bid wins: whatever the other ancestors wanted to do,
        // leaving the local file alone cannot lose data.
        if let Some(keeps) = codes.remove("k") {
            debug!(%path, "bid auction: picking keep");
            resolved.insert(keeps.into_iter().next().expect("non-empty"));
            continue;
        }

        // Unanimous gets win even among other kinds.
        let mut winner = None;
        for code in ["g", "rg"] {
            if let Some(gets) = codes.get(code) {
                if gets.windows(2).all(|w| w[0] == w[1]) {
                    winner = Some(gets[0].clone());
                    break;
                }
            }
        }
        if let Some(action) = winner {
            debug!(%path, code = action.kind.code(), "bid auction: unanimous get");
            resolved.insert(action);
            continue;
        }

        // Genuinely ambiguous. Log every bid, then fall back to the
        // smallest action code — an arbitrary but stable total order.
        for (code, candidates) in &codes {
            for action in candidates {
                warn!(%path, code, reason = %action.reason, "ambiguous merge bid");
            }
        }
        let (code, candidates) = codes.iter().next().expect("non-empty");
        warn!(%path, code, "bid auction: no consensus, picking first by code");
        resolved.insert(candidates[0].clone());
    }

    resolved
}

/// Drop directory-move actions whose source file is being removed: the
/// move and the delete collapse to the delete.
pub fn prune_dir_moves(actions: &mut ActionSet) {
    let doomed: Vec<String> = actions
        .iter()
        .filter_map(|action| match &action.kind {
            ActionKind::DirMoveLocal { source, .. } => {
                match actions.get(source).map(|a| &a.kind) {
                    Some(ActionKind::Remove) => Some(action.path.clone()),
                    _ => None,
                }
            }
            _ => None,
        })
        .collect();
    for path in doomed {
        debug!(%path, "directory move source is deleted, dropping the move");
        actions.remove(&path);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
