//! The roster: every storage node we know about, how recently it was seen,
//! and what it reports holding. Also home of placement candidate selection
//! and the probe reconciler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::keyspace::Catalog;
use crate::range::{NodeId, PlacementState, RangeId, RangeMeta, RemoteState};

/// A node's view of one placement it holds, as reported by probes and
/// command responses.
#[derive(Clone, Debug)]
pub struct NodeRangeInfo {
    pub meta: RangeMeta,
    pub state: RemoteState,
    pub keys: u64,
}

/// One known storage node.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub addr: String,
    /// When discovery first announced this node.
    pub init: Instant,
    /// Last sighting in discovery or successful probe.
    pub seen: Instant,
    pub connected: bool,
    pub want_drain: bool,
    /// Placements the node reports holding.
    pub ranges: BTreeMap<RangeId, NodeRangeInfo>,
    /// Reported ranges we have no placement for. Diagnostic only.
    pub unexpected: BTreeMap<RangeId, RangeMeta>,
}

/// Candidate constraint: either any healthy node, or one specific node.
#[derive(Clone, Debug, Default)]
pub struct Constraint {
    pub node: Option<NodeId>,
}

impl Constraint {
    pub const ANY: Constraint = Constraint { node: None };

    pub fn node(id: impl Into<NodeId>) -> Constraint {
        Constraint {
            node: Some(id.into()),
        }
    }

    pub fn opt(id: Option<NodeId>) -> Constraint {
        Constraint { node: id }
    }
}

pub struct Roster {
    nodes: Mutex<BTreeMap<NodeId, Node>>,
    expire_after: Duration,
    generation: AtomicU64,
}

impl Roster {
    pub fn new(expire_after: Duration) -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            expire_after,
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Record one service-discovery sighting. Every appearance refreshes the
    /// liveness window.
    pub fn observe(&self, id: NodeId, addr: String) {
        let mut nodes = self.nodes.lock().unwrap();
        let now = Instant::now();
        nodes
            .entry(id.clone())
            .and_modify(|n| {
                n.seen = now;
                if n.addr != addr {
                    tracing::info!(node = %id, old = %n.addr, new = %addr, "node address changed");
                    n.addr = addr.clone();
                }
            })
            .or_insert_with(|| {
                tracing::info!(node = %id, addr = %addr, "discovered node");
                Node {
                    id,
                    addr,
                    init: now,
                    seen: now,
                    connected: true,
                    want_drain: false,
                    ranges: BTreeMap::new(),
                    unexpected: BTreeMap::new(),
                }
            });
    }

    /// Apply one full discovery generation.
    pub fn observe_all(&self, sightings: impl IntoIterator<Item = (NodeId, String)>) {
        for (id, addr) in sightings {
            self.observe(id, addr);
        }
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    fn is_expired(&self, node: &Node) -> bool {
        node.seen.elapsed() >= self.expire_after
    }

    /// Whether the node exists and has been seen recently enough to trust.
    pub fn is_alive(&self, id: &NodeId) -> bool {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(id).map(|n| !self.is_expired(n)).unwrap_or(false)
    }

    pub fn addr_of(&self, id: &NodeId) -> Option<String> {
        self.nodes.lock().unwrap().get(id).map(|n| n.addr.clone())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    pub fn wants_drain(&self, id: &NodeId) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .get(id)
            .map(|n| n.want_drain)
            .unwrap_or(false)
    }

    pub fn set_drain(&self, id: &NodeId, drain: bool) {
        if let Some(n) = self.nodes.lock().unwrap().get_mut(id) {
            if n.want_drain != drain {
                tracing::info!(node = %id, drain, "node drain flag changed");
                n.want_drain = drain;
            }
        }
    }

    pub fn set_connected(&self, id: &NodeId, connected: bool) {
        if let Some(n) = self.nodes.lock().unwrap().get_mut(id) {
            n.connected = connected;
        }
    }

    /// The node's reported state for one range, if it reports holding it.
    pub fn range_info(&self, id: &NodeId, range: RangeId) -> Option<NodeRangeInfo> {
        self.nodes
            .lock()
            .unwrap()
            .get(id)
            .and_then(|n| n.ranges.get(&range))
            .cloned()
    }

    /// Record a full range info, as returned by a Prepare response or probe.
    pub fn update_range_info(&self, id: &NodeId, info: NodeRangeInfo) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(n) = nodes.get_mut(id) {
            if info.state == RemoteState::NotFound {
                n.ranges.remove(&info.meta.id);
            } else {
                n.ranges.insert(info.meta.id, info);
            }
        }
    }

    /// Record just a remote state change for a range the node already holds.
    /// `NotFound` removes the entry.
    pub fn update_range_state(&self, id: &NodeId, range: RangeId, state: RemoteState) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(n) = nodes.get_mut(id) {
            if state == RemoteState::NotFound {
                n.ranges.remove(&range);
            } else if let Some(info) = n.ranges.get_mut(&range) {
                info.state = state;
            }
        }
    }

    /// Pick the best node for a new placement.
    ///
    /// Healthy means recently seen, reachable, and not draining. Nodes that
    /// already hold a placement of the range are excluded. Ties break by
    /// current placement count (load balance), then node id (determinism).
    pub fn candidate(
        &self,
        cat: &Catalog,
        range: Option<RangeId>,
        constraint: &Constraint,
    ) -> Result<NodeId, Error> {
        let nodes = self.nodes.lock().unwrap();

        let mut excluded: Vec<NodeId> = Vec::new();
        if let Some(id) = range {
            if let Ok(r) = cat.get(id) {
                excluded.extend(r.placements.iter().map(|p| p.node.clone()));
                // Nodes that already failed this range are skipped, unless
                // the operator asks for one by name.
                if constraint.node.is_none() {
                    excluded.extend(r.failed_nodes.iter().cloned());
                }
            }
        }

        let mut eligible: Vec<(usize, &NodeId)> = nodes
            .values()
            .filter(|n| !self.is_expired(n) && n.connected && !n.want_drain)
            .filter(|n| !excluded.contains(&n.id))
            .filter(|n| match &constraint.node {
                Some(want) => &n.id == want,
                None => true,
            })
            .map(|n| (cat.placement_count(&n.id), &n.id))
            .collect();

        eligible.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        eligible
            .first()
            .map(|(_, id)| (*id).clone())
            .ok_or(Error::NoCandidate)
    }

    /// Drop expired nodes that no longer hold any placement.
    pub fn purge_stale(&self, cat: &Catalog) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|id, n| {
            let keep = !self.is_expired(n) || !cat.placements_on(id).is_empty();
            if !keep {
                tracing::info!(node = %id, "dropping expired node");
            }
            keep
        });
    }

    /// Reconcile one probe response against the catalog.
    ///
    /// The reported list replaces the node's observed set. Divergence from
    /// the controller's expectation is either adopted (forward transitions)
    /// or treated as loss (backward transitions force the placement to
    /// Missing). Two nodes serving the same range is an invariant violation:
    /// it is logged at error level and the placement on the reporting node is
    /// forced to Missing.
    pub fn reconcile_probe(&self, cat: &mut Catalog, id: &NodeId, reported: Vec<NodeRangeInfo>) {
        let expected = cat.placements_on(id);

        {
            let mut nodes = self.nodes.lock().unwrap();
            let Some(n) = nodes.get_mut(id) else { return };
            n.seen = Instant::now();
            n.connected = true;
            n.ranges.clear();
            for info in reported {
                if !expected.iter().any(|(rid, _)| *rid == info.meta.id) {
                    tracing::warn!(node = %id, range = info.meta.id, "node reports unexpected range");
                    n.unexpected.insert(info.meta.id, info.meta.clone());
                }
                n.ranges.insert(info.meta.id, info);
            }
        }

        for (rid, idx) in expected {
            let Ok(p) = cat.placement(rid, idx) else {
                continue;
            };
            let (state, desired) = (p.state, p.desired);
            let remote = self.range_info(id, rid).map(|i| i.state);

            use crate::range::{PlacementState as Ps, RemoteState as Ns};
            match (state, remote) {
                // Forward divergence: the node got further than we knew.
                (Ps::Pending, Some(Ns::Inactive)) => {
                    let _ = cat.placement_to_state(rid, idx, Ps::Inactive);
                }
                (Ps::Inactive, Some(Ns::Active)) if desired == Ps::Active => {
                    if self.another_node_serves(rid, id) {
                        let err = Error::InvariantViolated(format!(
                            "range {rid} reported serving on {id} and another node"
                        ));
                        tracing::error!(
                            node = %id,
                            range = rid,
                            error = %err,
                            "forcing placement to missing"
                        );
                        let _ = cat.placement_to_state(rid, idx, Ps::Missing);
                        if let Ok(p) = cat.placement_mut(rid, idx) {
                            p.last_error = Some(err);
                        }
                    } else {
                        let _ = cat.placement_to_state(rid, idx, Ps::Active);
                    }
                }
                // Backward divergence: the node lost ground we relied on.
                (Ps::Active, Some(Ns::Inactive | Ns::NotFound)) if desired == Ps::Active => {
                    tracing::warn!(node = %id, range = rid, "serving placement regressed on node");
                    let _ = cat.placement_to_state(rid, idx, Ps::Missing);
                }
                // Placement vanished entirely. Pending placements may simply
                // not have been conveyed yet; everything else is a loss.
                (s, None) if s != Ps::Pending && s != Ps::Dropped && s != Ps::Missing => {
                    if desired != Ps::Dropped {
                        tracing::warn!(node = %id, range = rid, state = %s, "placement missing from probe");
                        let _ = cat.placement_to_state(rid, idx, Ps::Missing);
                    }
                }
                _ => {}
            }
        }
    }

    fn another_node_serves(&self, range: RangeId, except: &NodeId) -> bool {
        let nodes = self.nodes.lock().unwrap();
        nodes.values().any(|n| {
            &n.id != except
                && n.ranges
                    .get(&range)
                    .map(|i| i.state == RemoteState::Active)
                    .unwrap_or(false)
        })
    }

    /// Snapshot for the debug service.
    pub fn debug_snapshot(&self) -> Vec<(NodeId, String, bool, bool, Vec<NodeRangeInfo>)> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .values()
            .map(|n| {
                (
                    n.id.clone(),
                    n.addr.clone(),
                    self.is_expired(n),
                    n.want_drain,
                    n.ranges.values().cloned().collect(),
                )
            })
            .collect()
    }

    /// Single-line rendering of every node's observed placements, in node id
    /// order: `{aaa [1:Inactive 2:Active]} {bbb []}`.
    pub fn test_string(&self) -> String {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .values()
            .map(|n| {
                let ranges = n
                    .ranges
                    .iter()
                    .map(|(id, info)| format!("{}:{}", id, info.state))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("{{{} [{}]}}", n.id, ranges)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Run the probe cycle: periodically ask every live node for its placement
/// list and reconcile the response into the roster and catalog.
pub fn spawn_probes(
    roster: std::sync::Arc<Roster>,
    ks: std::sync::Arc<crate::keyspace::Keyspace>,
    backend: std::sync::Arc<dyn crate::actuator::Backend>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for node in roster.node_ids() {
                let Some(addr) = roster.addr_of(&node) else {
                    continue;
                };
                match backend.info(&node, &addr).await {
                    Ok(reported) => {
                        let mut cat = ks.lock();
                        roster.reconcile_probe(&mut cat, &node, reported);
                    }
                    Err(e) => {
                        tracing::warn!(node = %node, error = %e, "probe failed");
                        roster.set_connected(&node, false);
                    }
                }
            }
            {
                let cat = ks.lock();
                roster.purge_stale(&cat);
            }
        }
    })
}
