use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use queue_raft::config::NodeConfig;
use queue_raft::gateway::Gateway;
use queue_raft::raft::{InMemoryNetwork, InMemoryStateMachine, NodeStatus, RaftHandle, RaftNode};
use queue_raft::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "queue-raft")]
#[command(version)]
#[command(about = "Raft consensus core for a replicated queue store")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an in-process cluster and replicate demo commands through it
    Local(LocalArgs),
}

#[derive(Parser, Debug)]
struct LocalArgs {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Number of commands to submit
    #[arg(long, default_value = "10")]
    commands: u64,

    /// Persist each node under <DIR>/node-<id> instead of in memory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Uncompacted log length that triggers a snapshot
    #[arg(long, default_value = "1000")]
    compaction_threshold: usize,

    /// Keep the cluster running until SIGINT/SIGTERM
    #[arg(long)]
    keep_running: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct NodeStatusOutput {
    node_id: u64,
    role: String,
    term: u64,
    leader_id: Option<u64>,
    commit_index: u64,
    last_applied: u64,
    last_log_index: u64,
    snapshot_index: u64,
    applied_commands: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Local(local_args) => run_local(local_args).await?,
    }

    Ok(())
}

async fn run_local(args: LocalArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.nodes == 0 {
        return Err("cluster needs at least one node".into());
    }
    let shutdown = install_shutdown_handler()?;
    let network = InMemoryNetwork::new();
    let members: Vec<u64> = (1..=args.nodes).collect();

    let mut handles = Vec::new();
    let mut machines = Vec::new();
    let mut tasks = Vec::new();
    for &node_id in &members {
        let mut config = NodeConfig::new(node_id, members.clone())
            .with_compaction_threshold(args.compaction_threshold);
        if let Some(dir) = &args.data_dir {
            config = config.with_data_dir(dir.join(format!("node-{node_id}")));
        }
        let machine = InMemoryStateMachine::new();
        let (node, handle) =
            RaftNode::open(config, machine.clone(), Arc::new(network.transport(node_id)))?;
        network.register(handle.clone()).await;

        let token = shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = node.run(token).await {
                tracing::error!(node_id, error = %e, "Node exited with error");
            }
        }));
        handles.push(handle);
        machines.push(machine);
    }

    let leader = wait_for_leader(&handles, Duration::from_secs(5)).await?;
    tracing::info!(leader, "Cluster has a leader");

    // Submit through the last node so followers exercise forwarding
    let entry = handles.last().ok_or("no nodes")?.clone();
    let gateway = Gateway::new(
        entry.clone(),
        Arc::new(network.transport(entry.node_id())),
        NodeConfig::default().max_redirects,
    );
    for i in 0..args.commands {
        let payload = format!("enqueue item-{i}").into_bytes();
        let index = gateway.submit(payload).await?;
        tracing::debug!(index, "Command applied");
    }

    // Let followers learn the final commit index
    tokio::time::sleep(Duration::from_millis(200)).await;
    print_status(&handles, &machines, &args.output)?;

    if args.keep_running {
        println!("Cluster running, press Ctrl-C to stop");
        shutdown.cancelled().await;
    }
    shutdown.cancel();
    for task in tasks {
        task.await?;
    }
    Ok(())
}

async fn wait_for_leader(
    handles: &[RaftHandle],
    limit: Duration,
) -> Result<u64, Box<dyn std::error::Error>> {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if let Some(leader) = handles.iter().find(|h| h.is_leader()) {
            let leader = leader.node_id();
            if handles.iter().all(|h| h.leader() == Some(leader)) {
                return Ok(leader);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err("no leader elected".into())
}

fn print_status(
    handles: &[RaftHandle],
    machines: &[InMemoryStateMachine],
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let rows: Vec<NodeStatusOutput> = handles
        .iter()
        .zip(machines)
        .map(|(handle, machine)| {
            let status: NodeStatus = handle.status();
            NodeStatusOutput {
                node_id: status.node_id,
                role: status.role.to_string(),
                term: status.current_term,
                leader_id: status.leader_id,
                commit_index: status.commit_index,
                last_applied: status.last_applied,
                last_log_index: status.last_log_index,
                snapshot_index: status.snapshot_index,
                applied_commands: machine.entries().len(),
            }
        })
        .collect();

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<6} {:<10} {:<6} {:<8} {:<8} {:<8} {:<9} {:<9}",
                "NODE", "ROLE", "TERM", "LEADER", "COMMIT", "APPLIED", "SNAPSHOT", "COMMANDS"
            );
            println!("{}", "-".repeat(72));
            for row in rows {
                let leader = row
                    .leader_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<6} {:<10} {:<6} {:<8} {:<8} {:<8} {:<9} {:<9}",
                    row.node_id,
                    row.role,
                    row.term,
                    leader,
                    row.commit_index,
                    row.last_applied,
                    row.snapshot_index,
                    row.applied_commands
                );
            }
        }
    }
    Ok(())
}
