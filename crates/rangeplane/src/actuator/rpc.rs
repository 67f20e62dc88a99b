//! gRPC backend: delivers commands to storage nodes over the node control
//! plane, reusing one channel per node address.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tonic::transport::Channel;

use super::{Backend, Command, Payload};
use crate::range::{Action, NodeId, RemoteState};
use crate::roster::NodeRangeInfo;
use crate::wire::{self, pb};

pub struct RpcBackend {
    clients: Mutex<HashMap<String, pb::node_client::NodeClient<Channel>>>,
}

impl RpcBackend {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, addr: &str) -> anyhow::Result<pb::node_client::NodeClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(addr) {
            return Ok(client.clone());
        }
        let client = pb::node_client::NodeClient::connect(format!("http://{addr}")).await?;
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    /// Forget a cached channel after a transport error, so the next attempt
    /// redials instead of reusing a broken connection.
    async fn evict(&self, addr: &str) {
        self.clients.lock().await.remove(addr);
    }
}

impl Default for RpcBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for RpcBackend {
    async fn send(&self, cmd: &Command, payload: &Payload) -> anyhow::Result<RemoteState> {
        let mut client = self.client(&payload.addr).await?;

        let result = match cmd.action {
            Action::Prepare => {
                let request = pb::PrepareRequest {
                    range: Some(wire::meta_to_pb(&payload.meta)),
                    parents: payload.parents.iter().map(wire::parent_to_pb).collect(),
                };
                client.prepare(request).await
            }
            Action::Activate => {
                client
                    .activate(pb::RangeRequest {
                        range_id: cmd.range,
                    })
                    .await
            }
            Action::Deactivate => {
                client
                    .deactivate(pb::RangeRequest {
                        range_id: cmd.range,
                    })
                    .await
            }
            Action::Drop => {
                client
                    .drop(pb::RangeRequest {
                        range_id: cmd.range,
                    })
                    .await
            }
        };

        match result {
            Ok(response) => Ok(wire::remote_state_from_pb(response.into_inner().state())),
            Err(status) => {
                self.evict(&payload.addr).await;
                Err(anyhow::anyhow!("{} on {}: {status}", cmd.action, cmd.node))
            }
        }
    }

    async fn info(&self, node: &NodeId, addr: &str) -> anyhow::Result<Vec<NodeRangeInfo>> {
        let mut client = self.client(addr).await?;
        let response = match client.info(pb::InfoRequest {}).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                self.evict(addr).await;
                anyhow::bail!("info on {node}: {status}");
            }
        };
        Ok(response
            .ranges
            .iter()
            .filter_map(wire::range_info_from_pb)
            .collect())
    }
}
