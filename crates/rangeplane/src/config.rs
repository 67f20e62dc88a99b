//! CLI options for the controller daemon.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::actuator::ActuatorConfig;
use crate::orchestrator::OrchestratorConfig;

/// CLI options for running the controller.
#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Address for the operator/debug gRPC services.
    #[arg(long, env = "RANGEPLANE_LISTEN_GRPC", default_value = "127.0.0.1:5100")]
    pub listen_grpc: SocketAddr,

    /// Directory for the persistent range catalog.
    #[arg(long, env = "RANGEPLANE_DATA_DIR", default_value = "./rangeplane-data")]
    pub data_dir: String,

    /// Comma-separated storage nodes, like
    /// `aaa@127.0.0.1:5001,bbb@127.0.0.1:5002`.
    #[arg(long, env = "RANGEPLANE_NODES")]
    pub nodes: String,

    /// Reconciliation tick interval (ms).
    #[arg(long, env = "RANGEPLANE_TICK_INTERVAL_MS", default_value_t = 500)]
    pub tick_interval_ms: u64,

    /// Node probe interval (ms).
    #[arg(long, env = "RANGEPLANE_PROBE_INTERVAL_MS", default_value_t = 1000)]
    pub probe_interval_ms: u64,

    /// Discovery poll interval (ms).
    #[arg(long, env = "RANGEPLANE_DISCOVERY_INTERVAL_MS", default_value_t = 2000)]
    pub discovery_interval_ms: u64,

    /// A node unseen for this long is expired; its placements are replaced.
    #[arg(long, env = "RANGEPLANE_NODE_EXPIRE_MS", default_value_t = 60_000)]
    pub node_expire_ms: u64,

    /// Prepare/Activate/Deactivate attempts before giving up on a placement.
    /// Drop always retries.
    #[arg(long, env = "RANGEPLANE_MAX_FAILURES", default_value_t = 3)]
    pub max_failures: u8,

    /// Deadline for Activate/Deactivate/Drop commands (ms).
    #[arg(long, env = "RANGEPLANE_RPC_TIMEOUT_MS", default_value_t = 5_000)]
    pub rpc_timeout_ms: u64,

    /// Deadline for Prepare commands, which move data (ms).
    #[arg(long, env = "RANGEPLANE_PREPARE_TIMEOUT_MS", default_value_t = 60_000)]
    pub prepare_timeout_ms: u64,

    /// Drain nodes that disappear from discovery instead of waiting for
    /// them to expire.
    #[arg(long, env = "RANGEPLANE_DRAIN_BEFORE_SHUTDOWN", default_value_t = false)]
    pub drain_before_shutdown: bool,
}

impl ControllerArgs {
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            max_failures: self.max_failures,
        }
    }

    pub fn actuator(&self) -> ActuatorConfig {
        ActuatorConfig {
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            prepare_timeout: Duration::from_millis(self.prepare_timeout_ms),
            max_failures: self.max_failures,
        }
    }

    pub fn node_expire(&self) -> Duration {
        Duration::from_millis(self.node_expire_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
}
