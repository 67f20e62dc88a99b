//! The reconciliation loop.
//!
//! A single-threaded tick drives the cluster from observed state toward
//! desired state. Each tick, under the keyspace lock for its whole duration:
//!
//! 1. apply pending operator joins (first, so their participants are
//!    visible to the rest of the tick)
//! 2. for each in-flight split/join, check completion and tick its
//!    participant ranges under the operation's gates
//! 3. tick every remaining non-obsolete range (applying pending operator
//!    moves and splits as their range comes up)
//! 4. tick each range's placements, destroying the ones that finished
//!
//! Placement ticks never send RPCs; they only write a desired state. The
//! actuator turns desired-state deltas into commands, and command results
//! land in the roster for the next tick to observe.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::Error;
use crate::keyspace::{Catalog, Keyspace};
use crate::operation::{self, Operation};
use crate::placement::Placement;
use crate::range::{Action, Key, NodeId, PlacementState, RangeId, RangeState, RemoteState};
use crate::roster::{Constraint, Roster};

/// One-shot result channel handed to an operator request. The coordinator is
/// the sole resolver: ok on completion, error on rejection or definitive
/// failure. Dropping the handle unresolved closes the channel, which the
/// waiting operator observes as an aborted request.
pub struct CompletionHandle(oneshot::Sender<Result<(), Error>>);

impl CompletionHandle {
    pub fn new() -> (Self, oneshot::Receiver<Result<(), Error>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn resolve(self, result: Result<(), Error>) {
        let _ = self.0.send(result);
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionHandle")
    }
}

/// Operator request: move one range off a node.
#[derive(Debug)]
pub struct OpMove {
    pub range: RangeId,
    /// Source node; defaults to the first active placement.
    pub src: Option<NodeId>,
    /// Destination node; defaults to the best candidate.
    pub dest: Option<NodeId>,
    pub done: Option<CompletionHandle>,
}

/// Operator request: split one range at a key.
#[derive(Debug)]
pub struct OpSplit {
    pub range: RangeId,
    pub key: Key,
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
    pub done: Option<CompletionHandle>,
}

/// Operator request: join two adjacent ranges.
#[derive(Debug)]
pub struct OpJoin {
    pub left: RangeId,
    pub right: RangeId,
    pub dest: Option<NodeId>,
    pub done: Option<CompletionHandle>,
}

#[derive(Clone, Copy, Debug)]
pub struct OrchestratorConfig {
    pub tick_interval: Duration,
    /// Prepare/Activate/Deactivate abort after this many failures. Drop
    /// retries until an operator intervenes.
    pub max_failures: u8,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            max_failures: 3,
        }
    }
}

pub struct Orchestrator {
    ks: Arc<Keyspace>,
    roster: Arc<Roster>,
    cfg: OrchestratorConfig,
    moves: Mutex<Vec<OpMove>>,
    splits: Mutex<BTreeMap<RangeId, OpSplit>>,
    joins: Mutex<Vec<OpJoin>>,
}

impl Orchestrator {
    pub fn new(ks: Arc<Keyspace>, roster: Arc<Roster>, cfg: OrchestratorConfig) -> Self {
        Self {
            ks,
            roster,
            cfg,
            moves: Mutex::new(Vec::new()),
            splits: Mutex::new(BTreeMap::new()),
            joins: Mutex::new(Vec::new()),
        }
    }

    pub fn keyspace(&self) -> Arc<Keyspace> {
        self.ks.clone()
    }

    pub fn roster(&self) -> Arc<Roster> {
        self.roster.clone()
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.cfg
    }

    /// Queue a move, applied on the next tick.
    pub fn request_move(&self, mv: OpMove) {
        self.moves.lock().unwrap().push(mv);
    }

    /// Queue a split. A newer split request for the same range supersedes an
    /// older unapplied one.
    pub fn request_split(&self, sp: OpSplit) {
        let mut splits = self.splits.lock().unwrap();
        if let Some(mut old) = splits.insert(sp.range, sp) {
            if let Some(done) = old.done.take() {
                done.resolve(Err(Error::OperationAborted(
                    "superseded by a newer split request".to_string(),
                )));
            }
        }
    }

    /// Queue a join, applied at the start of the next tick.
    pub fn request_join(&self, join: OpJoin) {
        self.joins.lock().unwrap().push(join);
    }

    /// One reconciliation pass.
    pub fn tick(&self) {
        let mut cat = self.ks.lock();

        // Joins are applied before anything else is ticked, so the joined
        // range exists when its operation is picked up below.
        let joins: Vec<OpJoin> = self.joins.lock().unwrap().drain(..).collect();
        for join in joins {
            self.apply_join(&mut cat, join);
        }

        // Ranges created later in this tick (by splits) wait until the next
        // tick for their first placement tick.
        let snapshot = cat.range_ids();

        let ops = Operation::list(&cat, self.cfg.max_failures);
        let mut visited: BTreeSet<RangeId> = BTreeSet::new();
        for op in &ops {
            op.check_complete(&mut cat);
            for rid in op.ranges() {
                self.tick_range(&mut cat, rid, Some(op));
                visited.insert(rid);
            }
        }

        for rid in snapshot {
            if visited.contains(&rid) {
                continue;
            }
            if let Ok(r) = cat.get(rid) {
                if r.state == RangeState::Obsolete {
                    continue;
                }
            }
            self.tick_range(&mut cat, rid, None);
        }

        // Requests against ranges that don't exist would sit queued forever;
        // bounce them back to the operator instead.
        self.moves.lock().unwrap().retain_mut(|mv| {
            if cat.get(mv.range).is_ok() {
                return true;
            }
            if let Some(done) = mv.done.take() {
                done.resolve(Err(Error::NotFound(format!("range {}", mv.range))));
            }
            false
        });
        self.splits.lock().unwrap().retain(|rid, sp| {
            if cat.get(*rid).is_ok() {
                return true;
            }
            if let Some(done) = sp.done.take() {
                done.resolve(Err(Error::NotFound(format!("range {rid}"))));
            }
            false
        });
    }

    fn tick_range(&self, cat: &mut Catalog, rid: RangeId, op: Option<&Operation>) {
        let state = match cat.get(rid) {
            Ok(r) => r.state,
            Err(_) => return,
        };

        if state == RangeState::Active {
            self.place_missing(cat, rid);

            if let Some(mv) = self.take_move(rid) {
                self.do_move(cat, rid, mv);
            }
            if let Some(sp) = self.splits.lock().unwrap().remove(&rid) {
                self.do_split(cat, rid, sp);
            }
        }

        // Tick every placement, including ones created just above. Destroyed
        // placements are removed after the iteration.
        let count = cat.get(rid).map(|r| r.placements.len()).unwrap_or(0);
        let mut destroy = Vec::new();
        for idx in 0..count {
            if self.tick_placement(cat, rid, idx, op) {
                destroy.push(idx);
            }
        }
        for idx in destroy.into_iter().rev() {
            let (node, abandoned) = match cat.placement(rid, idx) {
                Ok(p) => (
                    p.node.clone(),
                    p.state == PlacementState::GiveUp
                        || p.failed(Action::Activate, self.cfg.max_failures),
                ),
                Err(_) => continue,
            };
            if cat.destroy_placement(rid, idx).is_ok() && abandoned {
                let _ = cat.record_failed_node(rid, node);
            }
        }
    }

    /// Create a placement if the range is below its replication floor.
    fn place_missing(&self, cat: &mut Catalog, rid: RangeId) {
        let wants = match cat.get(rid) {
            Ok(r) => r.placements.len() < r.policy.min_active,
            Err(_) => false,
        };
        if !wants {
            return;
        }
        match self.roster.candidate(cat, Some(rid), &Constraint::ANY) {
            Ok(node) => {
                let _ = cat.add_placement(rid, Placement::new(node));
            }
            Err(e) => {
                tracing::debug!(range = rid, error = %e, "cannot place range");
            }
        }
    }

    fn take_move(&self, rid: RangeId) -> Option<OpMove> {
        let mut moves = self.moves.lock().unwrap();
        let idx = moves.iter().position(|m| m.range == rid)?;
        Some(moves.remove(idx))
    }

    fn do_move(&self, cat: &mut Catalog, rid: RangeId, mut mv: OpMove) {
        let result = (|| -> Result<(), Error> {
            let src = {
                let r = cat.get(rid)?;
                match &mv.src {
                    Some(want) => r
                        .placements
                        .iter()
                        .find(|p| &p.node == want)
                        .map(|p| p.node.clone())
                        .ok_or_else(|| {
                            Error::NotFound(format!("no placement of range {rid} on {want}"))
                        })?,
                    None => r
                        .placements
                        .iter()
                        .find(|p| p.state == PlacementState::Active)
                        .map(|p| p.node.clone())
                        .ok_or_else(|| {
                            Error::NotFound(format!("range {rid} has no active placement"))
                        })?,
                }
            };
            if cat
                .get(rid)?
                .placements
                .iter()
                .any(|p| p.replacing.as_deref() == Some(src.as_str()))
            {
                return Err(Error::OperationAborted(format!(
                    "placement of range {rid} on {src} is already being replaced"
                )));
            }

            let dest = self
                .roster
                .candidate(cat, Some(rid), &Constraint::opt(mv.dest.clone()))?;
            tracing::info!(range = rid, src = %src, dest = %dest, "starting move");
            cat.add_placement(rid, Placement::replacement(dest, src, mv.done.take()))
        })();

        if let Err(e) = result {
            tracing::warn!(range = rid, error = %e, "move rejected");
            if let Some(done) = mv.done.take() {
                done.resolve(Err(e));
            }
        }
    }

    fn do_split(&self, cat: &mut Catalog, rid: RangeId, mut sp: OpSplit) {
        let result = (|| -> Result<(), Error> {
            // Pick both destinations before splitting; once the catalog
            // mutation lands there is no way back.
            let left_node = self
                .roster
                .candidate(cat, None, &Constraint::opt(sp.left.clone()))?;
            let right_node = self
                .roster
                .candidate(cat, None, &Constraint::opt(sp.right.clone()))?;

            let (left, right) = cat.split(rid, &sp.key)?;
            cat.add_placement(left, Placement::new(left_node))?;
            cat.add_placement(right, Placement::new(right_node))?;
            if let Some(done) = sp.done.take() {
                cat.get_mut(rid)?.done = Some(done);
            }
            Ok(())
        })();

        if let Err(e) = result {
            tracing::warn!(range = rid, error = %e, "split rejected");
            if let Some(done) = sp.done.take() {
                done.resolve(Err(e));
            }
        }
    }

    fn apply_join(&self, cat: &mut Catalog, mut join: OpJoin) {
        let result = (|| -> Result<(), Error> {
            // Candidate first: the join itself cannot be aborted afterwards.
            let dest = self
                .roster
                .candidate(cat, None, &Constraint::opt(join.dest.clone()))?;
            let child = cat.join(join.left, join.right)?;
            cat.add_placement(child, Placement::new(dest))?;
            if let Some(done) = join.done.take() {
                cat.get_mut(join.left)?.done = Some(done);
            }
            Ok(())
        })();

        if let Err(e) = result {
            tracing::warn!(left = join.left, right = join.right, error = %e, "join rejected");
            if let Some(done) = join.done.take() {
                done.resolve(Err(e));
            }
        }
    }

    /// Advance one placement. Returns whether it should be destroyed.
    fn tick_placement(
        &self,
        cat: &mut Catalog,
        rid: RangeId,
        idx: usize,
        op: Option<&Operation>,
    ) -> bool {
        use crate::range::{PlacementState as Ps, RemoteState as Ns};

        let (node, state, replacing) = match cat.placement(rid, idx) {
            Ok(p) => (p.node.clone(), p.state, p.replacing.clone()),
            Err(_) => return false,
        };

        // A vanished or expired node takes its placements with it.
        if !self.roster.is_alive(&node)
            && !matches!(state, Ps::Missing | Ps::Dropped | Ps::GiveUp)
        {
            tracing::warn!(range = rid, node = %node, "node gone; placement missing");
            let _ = cat.placement_to_state(rid, idx, Ps::Missing);
            return false;
        }

        // If the placement we were replacing is gone, the annotation is
        // stale bookkeeping.
        if let Some(src) = &replacing {
            let still_there = cat
                .get(rid)
                .map(|r| {
                    r.placements
                        .iter()
                        .enumerate()
                        .any(|(i, q)| i != idx && &q.node == src)
                })
                .unwrap_or(false);
            if !still_there {
                let _ = cat.clear_replacing(rid, idx);
            }
        }

        // A draining node sheds its active placements through ordinary
        // moves; the next tick picks the destination.
        if state == Ps::Active && self.roster.wants_drain(&node) {
            self.request_drain_move(cat, rid, &node);
        }

        let remote = self.roster.range_info(&node, rid).map(|i| i.state);
        let max = self.cfg.max_failures;
        let failed = |cat: &Catalog, action: Action| {
            cat.placement(rid, idx)
                .map(|p| p.failed(action, max))
                .unwrap_or(false)
        };

        match state {
            Ps::Pending => match remote {
                Some(Ns::Preparing) => {
                    let _ = cat.set_desired(rid, idx, Ps::Inactive);
                }
                Some(Ns::Inactive) => {
                    let _ = cat.placement_to_state(rid, idx, Ps::Inactive);
                }
                None | Some(Ns::NotFound) => {
                    if failed(cat, Action::Prepare) {
                        let _ = cat.placement_to_state(rid, idx, Ps::GiveUp);
                    } else {
                        let _ = cat.set_desired(rid, idx, Ps::Inactive);
                    }
                }
                Some(other) => {
                    tracing::warn!(range = rid, node = %node, remote = %other, state = %state, "unexpected remote state");
                    let _ = cat.placement_to_state(rid, idx, Ps::Missing);
                }
            },

            Ps::Inactive => match remote {
                None => {
                    // The node no longer has it. Either we gave up on
                    // activation, or we asked it to drop, or it forgot.
                    if failed(cat, Action::Activate) {
                        return true;
                    }
                    if operation::may_drop(op, cat, rid, idx, max) {
                        let _ = cat.placement_to_state(rid, idx, Ps::Dropped);
                    } else {
                        let _ = cat.placement_to_state(rid, idx, Ps::Missing);
                    }
                }
                Some(Ns::Inactive) => {
                    if operation::may_activate(op, cat, rid, idx, max) {
                        let _ = cat.set_desired(rid, idx, Ps::Active);
                    } else if operation::may_drop(op, cat, rid, idx, max) {
                        let _ = cat.set_desired(rid, idx, Ps::Dropped);
                    }
                }
                Some(Ns::Activating) => {
                    let _ = cat.set_desired(rid, idx, Ps::Active);
                }
                Some(Ns::Dropping) => {
                    let _ = cat.set_desired(rid, idx, Ps::Dropped);
                }
                Some(Ns::Active) => {
                    let _ = cat.placement_to_state(rid, idx, Ps::Active);
                }
                Some(other) => {
                    tracing::warn!(range = rid, node = %node, remote = %other, state = %state, "unexpected remote state");
                    let _ = cat.placement_to_state(rid, idx, Ps::Missing);
                }
            },

            Ps::Active => match remote {
                None | Some(Ns::NotFound) => {
                    tracing::warn!(range = rid, node = %node, "serving placement vanished");
                    let _ = cat.placement_to_state(rid, idx, Ps::Missing);
                }
                Some(Ns::Active) => {
                    if operation::may_deactivate(op, cat, rid, idx, max) {
                        let _ = cat.set_desired(rid, idx, Ps::Inactive);
                    }
                }
                Some(Ns::Deactivating) => {
                    let _ = cat.set_desired(rid, idx, Ps::Inactive);
                }
                Some(Ns::Inactive) => {
                    let _ = cat.placement_to_state(rid, idx, Ps::Inactive);
                }
                Some(other) => {
                    tracing::warn!(range = rid, node = %node, remote = %other, state = %state, "unexpected remote state");
                    let _ = cat.placement_to_state(rid, idx, Ps::Missing);
                }
            },

            // Error path to Dropped without sending any command.
            Ps::Missing => {
                let _ = cat.placement_to_state(rid, idx, Ps::Dropped);
            }

            Ps::Dropped | Ps::GiveUp => return true,
        }

        false
    }

    fn request_drain_move(&self, cat: &Catalog, rid: RangeId, node: &NodeId) {
        let being_replaced = cat
            .get(rid)
            .map(|r| {
                r.placements
                    .iter()
                    .any(|q| q.replacing.as_deref() == Some(node.as_str()))
            })
            .unwrap_or(false);
        if being_replaced {
            return;
        }
        let mut moves = self.moves.lock().unwrap();
        if moves.iter().any(|m| m.range == rid) {
            return;
        }
        tracing::info!(range = rid, node = %node, "draining node; queueing move");
        moves.push(OpMove {
            range: rid,
            src: Some(node.clone()),
            dest: None,
            done: None,
        });
    }
}

/// Run the reconciliation loop until the task is aborted.
pub fn spawn(orch: Arc<Orchestrator>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(orch.cfg.tick_interval);
        loop {
            ticker.tick().await;
            orch.tick();
        }
    })
}
