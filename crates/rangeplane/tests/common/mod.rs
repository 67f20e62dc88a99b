//! Shared helpers for orchestrator integration tests: a world builder that
//! seeds a catalog and roster in a known state, plus tick helpers that run
//! the orchestrator and actuator synchronously.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use rangeplane::actuator::mock::MockBackend;
use rangeplane::actuator::{Actuator, ActuatorConfig};
use rangeplane::error::Error;
use rangeplane::keyspace::Keyspace;
use rangeplane::operation::ops_string;
use rangeplane::orchestrator::{
    CompletionHandle, OpJoin, OpMove, OpSplit, Orchestrator, OrchestratorConfig,
};
use rangeplane::persister::{MemoryPersister, RangeRecord};
use rangeplane::placement::PlacementRecord;
use rangeplane::range::{
    Key, PlacementState, RangeId, RangeState, RemoteState, ReplicationPolicy,
};
use rangeplane::roster::{NodeRangeInfo, Roster};

pub const MAX_FAILURES: u8 = 3;

pub struct World {
    pub ks: Arc<Keyspace>,
    pub roster: Arc<Roster>,
    pub orch: Orchestrator,
    pub act: Actuator,
    pub backend: Arc<MockBackend>,
    pub persister: Arc<MemoryPersister>,
}

#[derive(Default)]
pub struct WorldBuilder {
    ranges: Vec<RangeRecord>,
    nodes: Vec<(String, Vec<(RangeId, RemoteState)>)>,
    strict: bool,
    expire_after: Option<Duration>,
}

impl WorldBuilder {
    /// Seed one range. Empty start/end strings mean unbounded.
    pub fn range(mut self, id: RangeId, start: &str, end: &str, placements: &[&str]) -> Self {
        self.ranges.push(RangeRecord {
            id,
            start: key(start),
            end: key(end),
            state: RangeState::Active,
            parents: Vec::new(),
            children: Vec::new(),
            policy: ReplicationPolicy::default(),
            failed_nodes: Vec::new(),
            placements: placements
                .iter()
                .map(|node| PlacementRecord {
                    node: node.to_string(),
                    state: PlacementState::Active,
                    desired: PlacementState::Active,
                    replacing: None,
                })
                .collect(),
        });
        self
    }

    /// Seed one node and what it reports holding.
    pub fn node(mut self, id: &str, holding: &[(RangeId, RemoteState)]) -> Self {
        self.nodes.push((id.to_string(), holding.to_vec()));
        self
    }

    /// Every command must be injected; unexpected traffic fails the send.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn expire_after(mut self, d: Duration) -> Self {
        self.expire_after = Some(d);
        self
    }

    pub fn build(self) -> World {
        let persister = Arc::new(MemoryPersister::seeded(self.ranges.clone()));
        let ks = Arc::new(Keyspace::open(persister.clone()).unwrap());
        let roster = Arc::new(Roster::new(
            self.expire_after.unwrap_or(Duration::from_secs(60)),
        ));

        for (i, (id, holding)) in self.nodes.iter().enumerate() {
            roster.observe(id.clone(), format!("127.0.0.1:{}", 5001 + i));
            for (range, state) in holding {
                let meta = {
                    let cat = ks.lock();
                    cat.get(*range).unwrap().meta.clone()
                };
                roster.update_range_info(
                    id,
                    NodeRangeInfo {
                        meta,
                        state: *state,
                        keys: 0,
                    },
                );
            }
        }

        let backend = MockBackend::new(self.strict);
        let act = Actuator::new(
            backend.clone(),
            ActuatorConfig {
                max_failures: MAX_FAILURES,
                ..ActuatorConfig::default()
            },
        );
        let orch = Orchestrator::new(
            ks.clone(),
            roster.clone(),
            OrchestratorConfig {
                max_failures: MAX_FAILURES,
                ..OrchestratorConfig::default()
            },
        );

        World {
            ks,
            roster,
            orch,
            act,
            backend,
            persister,
        }
    }
}

pub fn world() -> WorldBuilder {
    WorldBuilder::default()
}

fn key(s: &str) -> Key {
    if s.is_empty() {
        Key::unbounded()
    } else {
        Key::from(s)
    }
}

impl World {
    /// One orchestrator tick followed by one actuator tick, like production
    /// runs them, but synchronously.
    pub async fn tick(&self) {
        self.orch.tick();
        self.act.tick(&self.ks, &self.roster).await;
        assert!(
            self.backend.unexpected().is_empty(),
            "unexpected commands: {:?}",
            self.backend.unexpected()
        );
    }

    /// Commands sent by the last tick, sorted and joined.
    pub fn commands(&self) -> String {
        self.backend.take_commands()
    }

    pub fn ks_str(&self) -> String {
        self.ks.lock().log_string()
    }

    pub fn ros_str(&self) -> String {
        self.roster.test_string()
    }

    pub fn ops_str(&self) -> String {
        ops_string(&self.ks.lock(), MAX_FAILURES)
    }

    /// Tick until neither state nor traffic changes, panicking if the system
    /// does not settle.
    pub async fn tick_until_stable(&self) {
        let mut last = (self.ks_str(), self.ros_str());
        for _ in 0..50 {
            self.tick().await;
            let commands = self.commands();
            let now = (self.ks_str(), self.ros_str());
            if commands.is_empty() && now == last {
                return;
            }
            last = now;
        }
        panic!(
            "did not stabilize; ks={} ros={}",
            self.ks_str(),
            self.ros_str()
        );
    }

    /// Tick until the predicate over (keyspace, roster) strings holds,
    /// panicking if it never does. Drains the command log as it goes.
    pub async fn tick_until(&self, pred: impl Fn(&str, &str) -> bool) {
        for _ in 0..50 {
            if pred(&self.ks_str(), &self.ros_str()) {
                return;
            }
            self.tick().await;
            self.commands();
        }
        panic!(
            "condition never held; ks={} ros={}",
            self.ks_str(),
            self.ros_str()
        );
    }

    /// Assert that further ticks produce no commands and no state changes.
    pub async fn require_stable(&self) {
        let before = (self.ks_str(), self.ros_str());
        for _ in 0..2 {
            self.tick().await;
            assert_eq!(self.commands(), "", "stable system sent commands");
            assert_eq!(
                (self.ks_str(), self.ros_str()),
                before,
                "stable system changed state"
            );
        }
    }

    pub fn move_op(
        &self,
        range: RangeId,
        dest: &str,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let (done, rx) = CompletionHandle::new();
        self.orch.request_move(OpMove {
            range,
            src: None,
            dest: Some(dest.to_string()),
            done: Some(done),
        });
        rx
    }

    pub fn split_op(
        &self,
        range: RangeId,
        key_str: &str,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let (done, rx) = CompletionHandle::new();
        self.orch.request_split(OpSplit {
            range,
            key: Key::from(key_str),
            left: None,
            right: None,
            done: Some(done),
        });
        rx
    }

    pub fn join_op(
        &self,
        left: RangeId,
        right: RangeId,
        dest: &str,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let (done, rx) = CompletionHandle::new();
        self.orch.request_join(OpJoin {
            left,
            right,
            dest: Some(dest.to_string()),
            done: Some(done),
        });
        rx
    }
}
