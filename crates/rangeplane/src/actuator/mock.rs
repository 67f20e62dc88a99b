//! Scripted in-process backend for orchestrator tests.
//!
//! Every command is logged. By default a command succeeds and reports the
//! remote state a healthy node would settle in; tests can inject a different
//! response or an outright failure per `(node, range, action)`, and flip the
//! injection later to simulate slow nodes finishing. In strict mode every
//! command must have an injection, so a test fails loudly on unexpected
//! traffic.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Backend, Command, Payload};
use crate::range::{Action, NodeId, RangeId, RemoteState};
use crate::roster::NodeRangeInfo;

/// A scripted response, shared with the test so it can be changed mid-flight.
#[derive(Debug)]
pub struct Inject {
    inner: Mutex<InjectState>,
}

#[derive(Debug)]
struct InjectState {
    success: bool,
    state: Option<RemoteState>,
}

impl Inject {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(InjectState {
                success: true,
                state: None,
            }),
        })
    }

    /// Succeed with the given remote state.
    pub fn respond(self: &Arc<Self>, state: RemoteState) -> Arc<Self> {
        let mut inner = self.inner.lock().unwrap();
        inner.success = true;
        inner.state = Some(state);
        self.clone()
    }

    /// Fail the command with an injected error.
    pub fn fail(self: &Arc<Self>) -> Arc<Self> {
        self.inner.lock().unwrap().success = false;
        self.clone()
    }

    /// Succeed with the default remote state for the action.
    pub fn succeed(self: &Arc<Self>) -> Arc<Self> {
        let mut inner = self.inner.lock().unwrap();
        inner.success = true;
        inner.state = None;
        self.clone()
    }
}

#[derive(Default)]
pub struct MockBackend {
    strict: bool,
    injects: Mutex<BTreeMap<(NodeId, RangeId, Action), Arc<Inject>>>,
    commands: Mutex<Vec<Command>>,
    unexpected: Mutex<Vec<Command>>,
    /// Simulated node-side placement tables, served back by `info`.
    nodes: Mutex<BTreeMap<NodeId, BTreeMap<RangeId, NodeRangeInfo>>>,
}

/// Remote state a healthy node settles in after each action.
fn default_state(action: Action) -> RemoteState {
    match action {
        Action::Prepare => RemoteState::Inactive,
        Action::Activate => RemoteState::Active,
        Action::Deactivate => RemoteState::Inactive,
        Action::Drop => RemoteState::NotFound,
    }
}

impl MockBackend {
    pub fn new(strict: bool) -> Arc<Self> {
        Arc::new(Self {
            strict,
            ..Self::default()
        })
    }

    /// Script the response for one `(node, range, action)`.
    pub fn inject(&self, node: &str, range: RangeId, action: Action) -> Arc<Inject> {
        let inject = Inject::new();
        self.injects
            .lock()
            .unwrap()
            .insert((node.to_string(), range, action), inject.clone());
        inject
    }

    /// Remove an injection, restoring default behavior.
    pub fn uninject(&self, node: &str, range: RangeId, action: Action) {
        self.injects
            .lock()
            .unwrap()
            .remove(&(node.to_string(), range, action));
    }

    /// Commands sent since the last call, rendered sorted and joined:
    /// `"Prepare(R2, bbb), Prepare(R3, bbb)"`. Clears the log.
    pub fn take_commands(&self) -> String {
        let mut commands = self.commands.lock().unwrap();
        let mut taken: Vec<Command> = commands.drain(..).collect();
        taken.sort();
        taken
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Commands that arrived without an injection while strict.
    pub fn unexpected(&self) -> Vec<Command> {
        self.unexpected.lock().unwrap().clone()
    }

    fn apply_to_node(&self, cmd: &Command, payload: &Payload, state: RemoteState) {
        let mut nodes = self.nodes.lock().unwrap();
        let table = nodes.entry(cmd.node.clone()).or_default();
        if state == RemoteState::NotFound {
            table.remove(&cmd.range);
        } else {
            table
                .entry(cmd.range)
                .and_modify(|info| info.state = state)
                .or_insert_with(|| NodeRangeInfo {
                    meta: payload.meta.clone(),
                    state,
                    keys: 0,
                });
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn send(&self, cmd: &Command, payload: &Payload) -> anyhow::Result<RemoteState> {
        self.commands.lock().unwrap().push(cmd.clone());

        let inject = self
            .injects
            .lock()
            .unwrap()
            .get(&(cmd.node.clone(), cmd.range, cmd.action))
            .cloned();

        let state = match inject {
            None if self.strict => {
                self.unexpected.lock().unwrap().push(cmd.clone());
                anyhow::bail!("no injection for command while strict: {cmd}");
            }
            None => default_state(cmd.action),
            Some(inject) => {
                let inner = inject.inner.lock().unwrap();
                if !inner.success {
                    anyhow::bail!("injected error");
                }
                inner.state.unwrap_or_else(|| default_state(cmd.action))
            }
        };

        self.apply_to_node(cmd, payload, state);
        Ok(state)
    }

    async fn info(&self, node: &NodeId, _addr: &str) -> anyhow::Result<Vec<NodeRangeInfo>> {
        let nodes = self.nodes.lock().unwrap();
        Ok(nodes
            .get(node)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }
}
