// Operator CLI: issue move/split/join requests against a running controller
// and read back the state of ranges and nodes.

use clap::{Parser, Subcommand};

use rangeplane::wire::pb;

#[derive(Parser, Debug)]
#[command(name = "rangectl")]
struct Args {
    /// Controller address (host:port).
    #[arg(long, env = "RANGEPLANE_CONTROLLER", default_value = "127.0.0.1:5100")]
    controller: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Move a range to another node.
    Move {
        range: u64,
        /// Source node; defaults to the active placement.
        #[arg(long)]
        src: Option<String>,
        /// Destination node; defaults to the best candidate.
        #[arg(long)]
        dest: Option<String>,
    },
    /// Split a range at a key.
    Split {
        range: u64,
        key: String,
        #[arg(long)]
        left_dest: Option<String>,
        #[arg(long)]
        right_dest: Option<String>,
    },
    /// Join two adjacent ranges.
    Join {
        left: u64,
        right: u64,
        #[arg(long)]
        dest: Option<String>,
    },
    /// List all ranges.
    Ranges,
    /// Show one range.
    Range { id: u64 },
    /// List all nodes.
    Nodes,
    /// Show one node.
    Node { id: String },
}

fn print_range(r: &pb::RangeDebug) {
    let meta = r.meta.clone().unwrap_or_default();
    let start = render_key(&meta.start, "-inf");
    let end = render_key(&meta.end, "+inf");
    print!("R{} [{start}, {end}) {}", meta.id, r.state);
    if !r.parents.is_empty() {
        print!(
            " parents={}",
            r.parents
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
    }
    println!();
    for p in &r.placements {
        print!("  {} {} (want {})", p.node, p.state, p.desired);
        if !p.replacing.is_empty() {
            print!(" replacing {}", p.replacing);
        }
        if !p.error.is_empty() {
            print!(" [{}]", p.error);
        }
        println!();
    }
}

fn print_node(n: &pb::NodeDebug) {
    let mut flags = Vec::new();
    if n.expired {
        flags.push("expired");
    }
    if n.draining {
        flags.push("draining");
    }
    println!(
        "{} {} {}",
        n.node_id,
        n.address,
        if flags.is_empty() {
            "ok".to_string()
        } else {
            flags.join(",")
        }
    );
    for info in &n.ranges {
        let meta = info.meta.clone().unwrap_or_default();
        println!(
            "  R{} {:?} keys={}",
            meta.id,
            info.state(),
            info.key_count
        );
    }
}

fn render_key(key: &[u8], sentinel: &str) -> String {
    if key.is_empty() {
        sentinel.to_string()
    } else {
        String::from_utf8_lossy(key).to_string()
    }
}

fn check_op(response: pb::OpResponse) -> anyhow::Result<()> {
    if response.error.is_empty() {
        println!("ok");
        Ok(())
    } else {
        anyhow::bail!("{}", response.error)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let endpoint = format!("http://{}", args.controller);

    match args.cmd {
        Command::Move { range, src, dest } => {
            let mut client =
                pb::orchestrator_client::OrchestratorClient::connect(endpoint).await?;
            let response = client
                .r#move(pb::MoveRequest {
                    range_id: range,
                    src: src.unwrap_or_default(),
                    dest: dest.unwrap_or_default(),
                })
                .await?;
            check_op(response.into_inner())
        }
        Command::Split {
            range,
            key,
            left_dest,
            right_dest,
        } => {
            let mut client =
                pb::orchestrator_client::OrchestratorClient::connect(endpoint).await?;
            let response = client
                .split(pb::SplitRequest {
                    range_id: range,
                    key: key.into_bytes(),
                    left_dest: left_dest.unwrap_or_default(),
                    right_dest: right_dest.unwrap_or_default(),
                })
                .await?;
            check_op(response.into_inner())
        }
        Command::Join { left, right, dest } => {
            let mut client =
                pb::orchestrator_client::OrchestratorClient::connect(endpoint).await?;
            let response = client
                .join(pb::JoinRequest {
                    left_id: left,
                    right_id: right,
                    dest: dest.unwrap_or_default(),
                })
                .await?;
            check_op(response.into_inner())
        }
        Command::Ranges => {
            let mut client = pb::debug_client::DebugClient::connect(endpoint).await?;
            let response = client.ranges_list(pb::RangesListRequest {}).await?;
            for r in &response.into_inner().ranges {
                print_range(r);
            }
            Ok(())
        }
        Command::Range { id } => {
            let mut client = pb::debug_client::DebugClient::connect(endpoint).await?;
            let response = client.range(pb::RangeRequest { range_id: id }).await?;
            print_range(&response.into_inner());
            Ok(())
        }
        Command::Nodes => {
            let mut client = pb::debug_client::DebugClient::connect(endpoint).await?;
            let response = client.nodes_list(pb::NodesListRequest {}).await?;
            for n in &response.into_inner().nodes {
                print_node(n);
            }
            Ok(())
        }
        Command::Node { id } => {
            let mut client = pb::debug_client::DebugClient::connect(endpoint).await?;
            let response = client.node(pb::NodeRequest { node_id: id }).await?;
            print_node(&response.into_inner());
            Ok(())
        }
    }
}
