//! Core catalog types: keys, range metadata, and the range/placement state
//! enums shared across the controller.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::placement::Placement;

/// Range identifier. Monotonic, allocated by the keyspace, never reused.
pub type RangeId = u64;

/// Node identifier as reported by service discovery.
pub type NodeId = String;

/// A key in the partitioned keyspace. Plain bytes, ordered lexicographically.
///
/// The empty key is a sentinel: as a range start it means the minimum key,
/// as a range end it means the maximum key.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub Vec<u8>);

impl Key {
    pub fn unbounded() -> Self {
        Key(Vec::new())
    }

    pub fn is_unbounded(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Key(b)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Identity and bounds of a range: the part of a range that nodes see.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMeta {
    pub id: RangeId,
    pub start: Key,
    pub end: Key,
}

impl RangeMeta {
    /// Whether the half-open interval `[start, end)` covers `key`.
    pub fn contains(&self, key: &Key) -> bool {
        let lower_ok = self.start.is_unbounded() || key >= &self.start;
        let upper_ok = self.end.is_unbounded() || key < &self.end;
        lower_ok && upper_ok
    }

    /// Renders as `[-inf, ccc)`, with sentinels for unbounded ends.
    pub fn interval_string(&self) -> String {
        let start = if self.start.is_unbounded() {
            "-inf".to_string()
        } else {
            String::from_utf8_lossy(self.start.as_bytes()).to_string()
        };
        let end = if self.end.is_unbounded() {
            "+inf".to_string()
        } else {
            String::from_utf8_lossy(self.end.as_bytes()).to_string()
        };
        format!("[{start}, {end})")
    }
}

/// Coarse range lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeState {
    /// Serving (or trying to serve) its interval.
    Active,
    /// Being subsumed by child ranges created from a split or join.
    Subsuming,
    /// Fully replaced by its children. Kept in the catalog as history.
    Obsolete,
}

impl fmt::Display for RangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RangeState::Active => "Active",
            RangeState::Subsuming => "Subsuming",
            RangeState::Obsolete => "Obsolete",
        };
        f.write_str(s)
    }
}

/// Controller-side placement lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementState {
    /// Created; the node has not confirmed preparation yet.
    Pending,
    /// Prepared on the node, holding data, not serving.
    Inactive,
    /// Serving. At most one placement per key may be in this state.
    Active,
    /// The node vanished or forgot the placement; error path to Dropped.
    Missing,
    /// Confirmed gone from the node. Destroyed one tick later.
    Dropped,
    /// Preparation was abandoned after repeated failures. Destroyed one tick
    /// later; no data ever landed on the node.
    GiveUp,
}

impl fmt::Display for PlacementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlacementState::Pending => "Pending",
            PlacementState::Inactive => "Inactive",
            PlacementState::Active => "Active",
            PlacementState::Missing => "Missing",
            PlacementState::Dropped => "Dropped",
            PlacementState::GiveUp => "GiveUp",
        };
        f.write_str(s)
    }
}

/// State of a placement as reported by the node holding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteState {
    Unknown,
    Preparing,
    Inactive,
    Activating,
    Active,
    Deactivating,
    Dropping,
    NotFound,
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteState::Unknown => "Unknown",
            RemoteState::Preparing => "Preparing",
            RemoteState::Inactive => "Inactive",
            RemoteState::Activating => "Activating",
            RemoteState::Active => "Active",
            RemoteState::Deactivating => "Deactivating",
            RemoteState::Dropping => "Dropping",
            RemoteState::NotFound => "NotFound",
        };
        f.write_str(s)
    }
}

/// Node-facing command kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Action {
    Prepare,
    Activate,
    Deactivate,
    Drop,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::Prepare,
        Action::Activate,
        Action::Deactivate,
        Action::Drop,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Action::Prepare => 0,
            Action::Activate => 1,
            Action::Deactivate => 2,
            Action::Drop => 3,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Prepare => "Prepare",
            Action::Activate => "Activate",
            Action::Deactivate => "Deactivate",
            Action::Drop => "Drop",
        };
        f.write_str(s)
    }
}

/// How many placements a range wants in the Active state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    pub min_active: usize,
    pub target_active: usize,
    pub max_active: usize,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self {
            min_active: 1,
            target_active: 1,
            max_active: 1,
        }
    }
}

/// One contiguous key range and its placements.
///
/// Ranges are owned by the keyspace catalog; placements are owned by their
/// range. Back-references are ids resolved through the catalog on access, so
/// there are no reference cycles.
#[derive(Debug)]
pub struct Range {
    pub meta: RangeMeta,
    pub state: RangeState,
    pub placements: Vec<Placement>,
    pub parents: Vec<RangeId>,
    pub children: Vec<RangeId>,
    pub policy: ReplicationPolicy,
    /// Nodes where a placement of this range was abandoned after repeated
    /// failures. Excluded from candidate selection unless the operator
    /// explicitly overrides.
    pub failed_nodes: Vec<NodeId>,
    /// Operator completion handle for a split/join rooted at this range.
    /// Resolved by the coordinator when the range becomes obsolete.
    pub done: Option<crate::orchestrator::CompletionHandle>,
}

impl Range {
    pub fn new(meta: RangeMeta) -> Self {
        Self {
            meta,
            state: RangeState::Active,
            placements: Vec::new(),
            parents: Vec::new(),
            children: Vec::new(),
            policy: ReplicationPolicy::default(),
            failed_nodes: Vec::new(),
            done: None,
        }
    }

    pub fn id(&self) -> RangeId {
        self.meta.id
    }

    /// Whether any placement is in the given controller-side state.
    pub fn has_placement_in(&self, state: PlacementState) -> bool {
        self.placements.iter().any(|p| p.state == state)
    }

    /// Single-line rendering used by logs, the debug service, and tests:
    /// `{1 [-inf, +inf) Active p0=aaa:Active p1=bbb:Pending:replacing(aaa)}`.
    pub fn log_string(&self) -> String {
        let mut out = format!(
            "{{{} {} {}",
            self.meta.id,
            self.meta.interval_string(),
            self.state
        );
        for (i, p) in self.placements.iter().enumerate() {
            out.push_str(&format!(" p{}={}:{}", i, p.node, p.state));
            if let Some(n) = &p.replacing {
                out.push_str(&format!(":replacing({n})"));
            }
        }
        out.push('}');
        out
    }
}
