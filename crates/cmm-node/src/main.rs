mod config;
mod events;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use cmm_protocol::{ClusterEvent, ClusterRuntime, MemberState, ResourceKind, RuntimeChannels, StopReason};
use config::FileConfig;
use events::{emit, EventCluster, EventData, EventStarted};

#[derive(Parser)]
#[command(name = "cmm-node", about = "Run one cluster member and print membership events as JSON lines")]
pub struct Cli {
    /// Node id (positive integer, unique in the cluster).
    #[arg(long)]
    pub id: Option<i32>,

    /// TCP listen address for current-format frames (default 0.0.0.0:7400).
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Address advertised to peers (default: the listen IP, or 127.0.0.1).
    #[arg(long)]
    pub advertise: Option<Ipv4Addr>,

    /// Peer to probe during discovery. Repeatable.
    #[arg(long)]
    pub seed: Vec<SocketAddr>,

    /// UDP broadcast address for discovery and notifications.
    #[arg(long)]
    pub broadcast: Option<SocketAddr>,

    /// Listen address for peers speaking the legacy format.
    #[arg(long)]
    pub legacy_listen: Option<SocketAddr>,

    /// Election priority; highest wins, ties go to the lowest id.
    #[arg(long)]
    pub priority: Option<u32>,

    /// Never become master.
    #[arg(long)]
    pub no_master: bool,

    /// Resource to register once joined, as KIND:NAME (lock, component,
    /// service). Repeatable.
    #[arg(long, value_parser = parse_resource)]
    pub register: Vec<(ResourceKind, String)>,

    /// JSON config file. Flags override its fields.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

fn parse_resource(s: &str) -> Result<(ResourceKind, String), String> {
    let (kind, name) = s
        .split_once(':')
        .ok_or_else(|| format!("expected KIND:NAME, got '{s}'"))?;
    let kind = match kind {
        "lock" => ResourceKind::Lock,
        "component" => ResourceKind::Component,
        "service" => ResourceKind::Service,
        other => return Err(format!("unknown resource kind '{other}'")),
    };
    if name.is_empty() {
        return Err("resource name is empty".into());
    }
    Ok((kind, name.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let config = config::resolve(&cli, file)?;
    let mut pending = cli.register.clone();

    let RuntimeChannels {
        handle,
        mut events,
        mut data,
        mut join,
    } = ClusterRuntime::start(config).await?;
    let node = handle.local_id();

    eprintln!("cmm-node v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Node {node} listening on {}", handle.local_addr());
    eprintln!("Press Ctrl+C to leave, twice to stop immediately.\n");
    emit(&EventStarted::new(node, handle.local_addr()));

    let mut leaving = false;
    let reason = loop {
        tokio::select! {
            Some(event) = events.recv() => {
                emit(&EventCluster::new(node, &event));
                let joined = matches!(
                    event,
                    ClusterEvent::StateChanged { to: MemberState::Member | MemberState::Master, .. }
                );
                if joined {
                    for (kind, name) in pending.drain(..) {
                        handle.register(kind, name).await?;
                    }
                }
            }
            Some(delivered) = data.recv() => emit(&EventData::new(node, &delivered)),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                if leaving {
                    eprintln!("\nStopping without leaving.");
                    handle.shutdown().await;
                } else {
                    eprintln!("\nLeaving the cluster...");
                    leaving = true;
                    handle.leave().await;
                }
            }
            stopped = &mut join => break stopped?,
        }
    };

    while let Ok(event) = events.try_recv() {
        emit(&EventCluster::new(node, &event));
    }
    eprintln!("Node {node} stopped: {reason:?}");
    if reason == StopReason::MasterLost {
        std::process::exit(2);
    }
    Ok(())
}
