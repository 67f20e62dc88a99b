//! Operator and debug gRPC services.
//!
//! Operator requests are queued for the next tick and answered when the
//! coordinator resolves the request's completion handle, so a `Move` call
//! returns once the range actually moved (or the request definitively
//! failed).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::error::Error;
use crate::orchestrator::{CompletionHandle, OpJoin, OpMove, OpSplit, Orchestrator};
use crate::range::Key;
use crate::wire::{self, pb};

fn none_if_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

async fn respond(
    rx: oneshot::Receiver<Result<(), Error>>,
) -> Result<Response<pb::OpResponse>, Status> {
    match rx.await {
        Ok(Ok(())) => Ok(Response::new(pb::OpResponse {
            error: String::new(),
        })),
        Ok(Err(e)) => Ok(Response::new(pb::OpResponse {
            error: e.to_string(),
        })),
        // The handle was dropped unresolved; the request went nowhere.
        Err(_) => Err(Status::aborted("operation abandoned")),
    }
}

pub struct OrchestratorService {
    orch: Arc<Orchestrator>,
}

#[tonic::async_trait]
impl pb::orchestrator_server::Orchestrator for OrchestratorService {
    async fn r#move(
        &self,
        request: Request<pb::MoveRequest>,
    ) -> Result<Response<pb::OpResponse>, Status> {
        let request = request.into_inner();
        let (done, rx) = CompletionHandle::new();
        self.orch.request_move(OpMove {
            range: request.range_id,
            src: none_if_empty(request.src),
            dest: none_if_empty(request.dest),
            done: Some(done),
        });
        respond(rx).await
    }

    async fn split(
        &self,
        request: Request<pb::SplitRequest>,
    ) -> Result<Response<pb::OpResponse>, Status> {
        let request = request.into_inner();
        if request.key.is_empty() {
            return Err(Status::invalid_argument("split key must not be empty"));
        }
        let (done, rx) = CompletionHandle::new();
        self.orch.request_split(OpSplit {
            range: request.range_id,
            key: Key::from(request.key),
            left: none_if_empty(request.left_dest),
            right: none_if_empty(request.right_dest),
            done: Some(done),
        });
        respond(rx).await
    }

    async fn join(
        &self,
        request: Request<pb::JoinRequest>,
    ) -> Result<Response<pb::OpResponse>, Status> {
        let request = request.into_inner();
        let (done, rx) = CompletionHandle::new();
        self.orch.request_join(OpJoin {
            left: request.left_id,
            right: request.right_id,
            dest: none_if_empty(request.dest),
            done: Some(done),
        });
        respond(rx).await
    }
}

pub struct DebugService {
    orch: Arc<Orchestrator>,
}

impl DebugService {
    fn range_debug(r: &crate::range::Range) -> pb::RangeDebug {
        pb::RangeDebug {
            meta: Some(wire::meta_to_pb(&r.meta)),
            state: r.state.to_string(),
            parents: r.parents.clone(),
            children: r.children.clone(),
            placements: r
                .placements
                .iter()
                .map(|p| pb::PlacementDebug {
                    node: p.node.clone(),
                    state: p.state.to_string(),
                    desired: p.desired.to_string(),
                    replacing: p.replacing.clone().unwrap_or_default(),
                    error: p
                        .last_error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default(),
                })
                .collect(),
        }
    }

    fn node_debug(
        (node_id, address, expired, draining, ranges): (
            String,
            String,
            bool,
            bool,
            Vec<crate::roster::NodeRangeInfo>,
        ),
    ) -> pb::NodeDebug {
        pb::NodeDebug {
            node_id,
            address,
            expired,
            draining,
            ranges: ranges.iter().map(wire::range_info_to_pb).collect(),
        }
    }
}

#[tonic::async_trait]
impl pb::debug_server::Debug for DebugService {
    async fn ranges_list(
        &self,
        _request: Request<pb::RangesListRequest>,
    ) -> Result<Response<pb::RangesListResponse>, Status> {
        let ks = self.orch.keyspace();
        let cat = ks.lock();
        Ok(Response::new(pb::RangesListResponse {
            ranges: cat.ranges().iter().map(Self::range_debug).collect(),
        }))
    }

    async fn range(
        &self,
        request: Request<pb::RangeRequest>,
    ) -> Result<Response<pb::RangeDebug>, Status> {
        let id = request.into_inner().range_id;
        let ks = self.orch.keyspace();
        let cat = ks.lock();
        let r = cat
            .get(id)
            .map_err(|e| Status::not_found(e.to_string()))?;
        Ok(Response::new(Self::range_debug(r)))
    }

    async fn nodes_list(
        &self,
        _request: Request<pb::NodesListRequest>,
    ) -> Result<Response<pb::NodesListResponse>, Status> {
        let roster = self.orch.roster();
        Ok(Response::new(pb::NodesListResponse {
            nodes: roster
                .debug_snapshot()
                .into_iter()
                .map(Self::node_debug)
                .collect(),
        }))
    }

    async fn node(
        &self,
        request: Request<pb::NodeRequest>,
    ) -> Result<Response<pb::NodeDebug>, Status> {
        let id = request.into_inner().node_id;
        let roster = self.orch.roster();
        roster
            .debug_snapshot()
            .into_iter()
            .find(|(node_id, ..)| node_id == &id)
            .map(|snap| Response::new(Self::node_debug(snap)))
            .ok_or_else(|| Status::not_found(format!("node {id}")))
    }
}

/// Serve the operator and debug services until shutdown resolves.
pub async fn serve(
    addr: SocketAddr,
    orch: Arc<Orchestrator>,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    tracing::info!(%addr, "serving operator control plane");
    Server::builder()
        .add_service(pb::orchestrator_server::OrchestratorServer::new(
            OrchestratorService { orch: orch.clone() },
        ))
        .add_service(pb::debug_server::DebugServer::new(DebugService { orch }))
        .serve_with_shutdown(addr, shutdown)
        .await?;
    Ok(())
}
