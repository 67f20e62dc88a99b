// Controller daemon entry point: wires the catalog, roster, orchestrator,
// actuator, discovery, and the operator gRPC services together, then runs
// until interrupted.

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use rangeplane::actuator::{self, rpc::RpcBackend, Actuator};
use rangeplane::config::ControllerArgs;
use rangeplane::discovery::{self, StaticDiscovery};
use rangeplane::keyspace::Keyspace;
use rangeplane::orchestrator::{self, Orchestrator};
use rangeplane::persister::FjallPersister;
use rangeplane::roster::{self, Roster};
use rangeplane::server;

#[derive(Parser, Debug)]
#[command(name = "rangeplane")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller.
    Controller(ControllerArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,h2=warn,hyper=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Controller(args) => run_controller(args).await,
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.data_dir).context("create data dir")?;

    let persister = Arc::new(
        FjallPersister::open(format!("{}/catalog", args.data_dir))
            .context("open catalog store")?,
    );
    let ks = Arc::new(Keyspace::open(persister).context("load keyspace")?);
    let roster = Arc::new(Roster::new(args.node_expire()));

    let disco = Arc::new(StaticDiscovery::parse(&args.nodes).context("parse --nodes")?);
    let backend = Arc::new(RpcBackend::new());
    let act = Arc::new(Actuator::new(backend.clone(), args.actuator()));
    let orch = Arc::new(Orchestrator::new(
        ks.clone(),
        roster.clone(),
        args.orchestrator(),
    ));

    let tasks = vec![
        discovery::spawn(
            disco,
            roster.clone(),
            args.discovery_interval(),
            args.drain_before_shutdown,
        ),
        roster::spawn_probes(
            roster.clone(),
            ks.clone(),
            backend,
            args.probe_interval(),
        ),
        orchestrator::spawn(orch.clone()),
        actuator::spawn(
            act,
            ks,
            roster,
            args.orchestrator().tick_interval,
        ),
    ];

    let result = server::serve(args.listen_grpc, orch, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await;

    for task in tasks {
        task.abort();
    }
    result
}
