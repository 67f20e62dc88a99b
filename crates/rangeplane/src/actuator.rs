//! The actuator: turns desired-state deltas on placements into idempotent
//! node commands, and feeds the observed results back into the roster.
//!
//! The orchestrator never sends RPCs; it only annotates placements with a
//! desired state. Each actuator tick scans for placements whose desired
//! state differs from their current state, derives the command, and sends it
//! through the backend. Re-sending the same command is safe and expected:
//! nodes reply with their current state for the range, which is what we
//! trust, never the acknowledgement itself.

pub mod mock;
pub mod rpc;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::error::Error;
use crate::keyspace::Keyspace;
use crate::parents::{parents_payload, ParentInfo};
use crate::range::{Action, NodeId, PlacementState, RangeId, RangeMeta, RemoteState};
use crate::roster::{NodeRangeInfo, Roster};

/// One node-facing command. Commands targeting the same `(node, range)`
/// coalesce: at most one is in flight at a time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Command {
    pub range: RangeId,
    pub node: NodeId,
    pub action: Action,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(R{}, {})", self.action, self.range, self.node)
    }
}

/// Everything a backend needs to realize a command.
#[derive(Clone, Debug)]
pub struct Payload {
    /// host:port of the target node.
    pub addr: String,
    pub meta: RangeMeta,
    /// Ancestry closure; only populated for Prepare.
    pub parents: Vec<ParentInfo>,
}

/// Narrow capability interface over the wire. The orchestrator and tests
/// depend on this trait only; production wires in the gRPC implementation.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Deliver one command and return the node's current state for the range.
    async fn send(&self, cmd: &Command, payload: &Payload) -> anyhow::Result<RemoteState>;

    /// Fetch the node's full placement list, for probing.
    async fn info(&self, node: &NodeId, addr: &str) -> anyhow::Result<Vec<NodeRangeInfo>>;
}

#[derive(Clone, Copy, Debug)]
pub struct ActuatorConfig {
    pub rpc_timeout: Duration,
    /// Prepare moves data and gets a longer deadline than the rest.
    pub prepare_timeout: Duration,
    pub max_failures: u8,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(5),
            prepare_timeout: Duration::from_secs(60),
            max_failures: 3,
        }
    }
}

pub struct Actuator {
    backend: Arc<dyn Backend>,
    cfg: ActuatorConfig,
    inflight: Mutex<BTreeSet<(NodeId, RangeId)>>,
}

/// The command implied by a placement's current/desired state pair, if any.
fn action_for(state: PlacementState, desired: PlacementState) -> Option<Action> {
    use crate::range::PlacementState::*;
    match (state, desired) {
        (Pending, Inactive) => Some(Action::Prepare),
        (Inactive, Active) => Some(Action::Activate),
        (Active, Inactive) => Some(Action::Deactivate),
        (Inactive, Dropped) => Some(Action::Drop),
        _ => None,
    }
}

impl Actuator {
    pub fn new(backend: Arc<dyn Backend>, cfg: ActuatorConfig) -> Self {
        Self {
            backend,
            cfg,
            inflight: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    /// One actuation pass. Collects commands under the keyspace lock, sends
    /// them in parallel with the lock released, then applies results to the
    /// roster and failure counters. Returns how many commands were sent.
    pub async fn tick(&self, ks: &Keyspace, roster: &Roster) -> usize {
        let work = self.collect(ks, roster);
        if work.is_empty() {
            return 0;
        }

        let mut results = Vec::with_capacity(work.len());
        {
            let mut futures = FuturesUnordered::new();
            for (cmd, payload) in &work {
                let timeout = match cmd.action {
                    Action::Prepare => self.cfg.prepare_timeout,
                    _ => self.cfg.rpc_timeout,
                };
                let backend = self.backend.clone();
                futures.push(async move {
                    let res = match tokio::time::timeout(timeout, backend.send(cmd, payload)).await
                    {
                        Ok(res) => res,
                        Err(_) => Err(anyhow::anyhow!("deadline exceeded after {timeout:?}")),
                    };
                    (cmd.clone(), payload.meta.clone(), res)
                });
            }
            while let Some(result) = futures.next().await {
                results.push(result);
            }
        }

        let sent = results.len();
        self.apply(ks, roster, results);
        {
            let mut inflight = self.inflight.lock().unwrap();
            for (cmd, _) in &work {
                inflight.remove(&(cmd.node.clone(), cmd.range));
            }
        }
        sent
    }

    fn collect(&self, ks: &Keyspace, roster: &Roster) -> Vec<(Command, Payload)> {
        let cat = ks.lock();
        let mut inflight = self.inflight.lock().unwrap();
        let mut work = Vec::new();

        for r in cat.ranges() {
            for p in &r.placements {
                let Some(action) = action_for(p.state, p.desired) else {
                    continue;
                };
                // Out of budget: the orchestrator will react, not us.
                if p.failed(action, self.cfg.max_failures) {
                    continue;
                }
                let Some(addr) = roster.addr_of(&p.node) else {
                    continue;
                };
                let key = (p.node.clone(), r.id());
                if !inflight.insert(key) {
                    continue;
                }

                let parents = if action == Action::Prepare {
                    parents_payload(&cat, roster, r.id())
                } else {
                    Vec::new()
                };
                work.push((
                    Command {
                        range: r.id(),
                        node: p.node.clone(),
                        action,
                    },
                    Payload {
                        addr,
                        meta: r.meta.clone(),
                        parents,
                    },
                ));
            }
        }
        work
    }

    fn apply(
        &self,
        ks: &Keyspace,
        roster: &Roster,
        results: Vec<(Command, RangeMeta, anyhow::Result<RemoteState>)>,
    ) {
        let mut cat = ks.lock();
        for (cmd, meta, result) in results {
            match result {
                Ok(state) => {
                    if cmd.action == Action::Prepare {
                        roster.update_range_info(
                            &cmd.node,
                            NodeRangeInfo {
                                meta,
                                state,
                                keys: 0,
                            },
                        );
                    } else {
                        roster.update_range_state(&cmd.node, cmd.range, state);
                    }
                }
                Err(e) => {
                    let err = Error::RpcFailed {
                        action: cmd.action,
                        node: cmd.node.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(command = %cmd, error = %err, "command failed");
                    let placements = cat
                        .get(cmd.range)
                        .map(|r| r.placements.len())
                        .unwrap_or(0);
                    for idx in 0..placements {
                        let Ok(p) = cat.placement_mut(cmd.range, idx) else {
                            continue;
                        };
                        if p.node == cmd.node {
                            p.record_failure(cmd.action);
                            p.last_error = Some(err);
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Run the actuation loop until the task is aborted.
pub fn spawn(
    act: Arc<Actuator>,
    ks: Arc<Keyspace>,
    roster: Arc<Roster>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let sent = act.tick(&ks, &roster).await;
            if sent > 0 {
                tracing::debug!(commands = sent, "actuation pass");
            }
        }
    })
}
