//! Service discovery: a stream of node sightings fed into the roster.
//!
//! The controller does not care where sightings come from; anything that can
//! produce `(node_id, address)` pairs on demand works. Production deploys
//! usually start from a static seed list; tests use the mock.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::range::NodeId;

/// One node sighting. Every appearance refreshes the node's liveness window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sighting {
    pub node: NodeId,
    pub addr: String,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Produce the current set of known nodes.
    async fn poll(&self) -> anyhow::Result<Vec<Sighting>>;
}

/// Fixed membership parsed from configuration, in the form
/// `aaa@127.0.0.1:5001,bbb@127.0.0.1:5002`.
pub struct StaticDiscovery {
    sightings: Vec<Sighting>,
}

impl StaticDiscovery {
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let mut sightings = Vec::new();
        for part in spec.split(',').filter(|p| !p.trim().is_empty()) {
            let (node, addr) = part
                .trim()
                .split_once('@')
                .ok_or_else(|| anyhow::anyhow!("bad node spec {part:?}, want id@host:port"))?;
            if node.is_empty() || addr.is_empty() {
                anyhow::bail!("bad node spec {part:?}, want id@host:port");
            }
            sightings.push(Sighting {
                node: node.to_string(),
                addr: addr.to_string(),
            });
        }
        if sightings.is_empty() {
            anyhow::bail!("empty node list");
        }
        Ok(Self { sightings })
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn poll(&self) -> anyhow::Result<Vec<Sighting>> {
        Ok(self.sightings.clone())
    }
}

/// Scriptable membership for tests.
#[derive(Default)]
pub struct MockDiscovery {
    sightings: Mutex<Vec<Sighting>>,
}

impl MockDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, sightings: Vec<Sighting>) {
        *self.sightings.lock().unwrap() = sightings;
    }

    pub fn add(&self, node: impl Into<NodeId>, addr: impl Into<String>) {
        self.sightings.lock().unwrap().push(Sighting {
            node: node.into(),
            addr: addr.into(),
        });
    }

    pub fn remove(&self, node: &str) {
        self.sightings.lock().unwrap().retain(|s| s.node != node);
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn poll(&self) -> anyhow::Result<Vec<Sighting>> {
        Ok(self.sightings.lock().unwrap().clone())
    }
}

/// Feed discovery into the roster on an interval. When a previously-seen
/// node disappears from the poll and `drain_on_leave` is set, it is marked
/// draining so its placements move off gracefully instead of waiting for
/// expiry.
pub fn spawn(
    discovery: std::sync::Arc<dyn Discovery>,
    roster: std::sync::Arc<crate::roster::Roster>,
    interval: std::time::Duration,
    drain_on_leave: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match discovery.poll().await {
                Ok(sightings) => {
                    if drain_on_leave {
                        for known in roster.node_ids() {
                            let seen = sightings.iter().any(|s| s.node == known);
                            if !seen && !roster.wants_drain(&known) {
                                tracing::info!(node = %known, "node left discovery; draining");
                                roster.set_drain(&known, true);
                            }
                        }
                    }
                    roster.observe_all(sightings.into_iter().map(|s| (s.node, s.addr)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "discovery poll failed");
                }
            }
        }
    })
}
