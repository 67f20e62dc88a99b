//! Placement records: one assignment of a range to a node, with its own
//! controller-side lifecycle and per-action failure accounting.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::orchestrator::CompletionHandle;
use crate::range::{Action, NodeId, PlacementState};

/// An assignment of a range to a node.
///
/// The owning range holds this record; the range id back-reference lives in
/// the catalog indices, not here. State is only mutated through
/// `Catalog::placement_to_state` / `Catalog::set_desired` so every change is
/// validated and persisted.
#[derive(Debug)]
pub struct Placement {
    pub node: NodeId,
    pub state: PlacementState,
    /// What the orchestrator wants this placement to become. The actuator
    /// turns the delta between `state` and `desired` into node commands.
    pub desired: PlacementState,
    /// Node whose placement this one is taking over, if this placement was
    /// created by a move. Cleared once the replaced placement is gone.
    pub replacing: Option<NodeId>,
    /// Consecutive command failures, indexed by `Action`.
    attempts: [u8; 4],
    /// The most recent error recorded against this placement (a failed
    /// command, a detected invariant violation). Volatile; surfaced through
    /// the debug service.
    pub last_error: Option<Error>,
    /// Operator completion handle for a move targeting this placement.
    /// Resolved when the placement activates.
    pub done: Option<CompletionHandle>,
}

impl Placement {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            state: PlacementState::Pending,
            desired: PlacementState::Pending,
            replacing: None,
            attempts: [0; 4],
            last_error: None,
            done: None,
        }
    }

    pub fn replacement(node: NodeId, replacing: NodeId, done: Option<CompletionHandle>) -> Self {
        Self {
            replacing: Some(replacing),
            done,
            ..Self::new(node)
        }
    }

    pub fn attempts(&self, action: Action) -> u8 {
        self.attempts[action.index()]
    }

    /// Records one failed command. Saturating; Drop is counted too, but the
    /// actuator never stops retrying drops.
    pub fn record_failure(&mut self, action: Action) {
        let slot = &mut self.attempts[action.index()];
        *slot = slot.saturating_add(1);
    }

    /// Whether this placement has exhausted its budget for `action`.
    /// Drop is exempt: giving up on a drop would strand data on the node.
    pub fn failed(&self, action: Action, max_failures: u8) -> bool {
        action != Action::Drop && self.attempts(action) >= max_failures
    }

    /// Persistent form of this placement.
    pub fn record(&self) -> PlacementRecord {
        PlacementRecord {
            node: self.node.clone(),
            state: self.state,
            desired: self.desired,
            replacing: self.replacing.clone(),
        }
    }
}

impl From<PlacementRecord> for Placement {
    fn from(rec: PlacementRecord) -> Self {
        Self {
            node: rec.node,
            state: rec.state,
            desired: rec.desired,
            replacing: rec.replacing,
            attempts: [0; 4],
            last_error: None,
            done: None,
        }
    }
}

/// Serialized placement, as stored by the persister. Failure counters and
/// completion handles are volatile and deliberately absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub node: NodeId,
    pub state: PlacementState,
    pub desired: PlacementState,
    pub replacing: Option<NodeId>,
}
