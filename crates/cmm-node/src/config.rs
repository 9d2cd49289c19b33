use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use cmm_protocol::types::CAP_MASTER_ELIGIBLE;
use cmm_protocol::{NodeId, NodeInfo, RuntimeConfig};
use cmm_transport::TransportConfig;
use serde::Deserialize;

use crate::Cli;

/// Optional JSON file. Every field overrides the built-in default; CLI
/// flags override the file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub id: Option<i32>,
    pub listen: Option<SocketAddr>,
    pub advertise: Option<Ipv4Addr>,
    pub seeds: Vec<SocketAddr>,
    pub broadcast: Option<SocketAddr>,
    pub legacy_listen: Option<SocketAddr>,
    pub priority: Option<u32>,
    pub master_eligible: Option<bool>,
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub discovery_window_ms: Option<u64>,
    pub election_window_ms: Option<u64>,
    pub retransmit_timeout_ms: Option<u64>,
    pub max_sends: Option<u32>,
    pub read_retries: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

const DEFAULT_LISTEN: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7400));

/// Merge defaults, file and flags into a runtime configuration.
pub fn resolve(cli: &Cli, file: FileConfig) -> anyhow::Result<RuntimeConfig> {
    let id = cli
        .id
        .or(file.id)
        .context("a node id is required (--id or \"id\" in the config file)")?;
    let node = NodeId::new(id);
    if !node.is_node() {
        anyhow::bail!("node id must be positive, got {id}");
    }

    let listen = cli.listen.or(file.listen).unwrap_or(DEFAULT_LISTEN);
    let SocketAddr::V4(listen_v4) = listen else {
        anyhow::bail!("only IPv4 listen addresses are supported, got {listen}");
    };
    let advertise = cli
        .advertise
        .or(file.advertise)
        .unwrap_or_else(|| advertised_ip(*listen_v4.ip()));

    let eligible = if cli.no_master {
        false
    } else {
        file.master_eligible.unwrap_or(true)
    };
    let local = NodeInfo::new(node, SocketAddrV4::new(advertise, listen_v4.port()))
        .with_priority(cli.priority.or(file.priority).unwrap_or(0))
        .with_capabilities(if eligible { CAP_MASTER_ELIGIBLE } else { 0 });

    let mut transport = TransportConfig::new().listen_addr(listen);
    if let Some(broadcast) = cli.broadcast.or(file.broadcast) {
        transport = transport.broadcast_addr(broadcast);
    }
    if let Some(retries) = file.read_retries {
        transport = transport.read_retries(retries);
    }
    let legacy_transport = cli
        .legacy_listen
        .or(file.legacy_listen)
        .map(|addr| TransportConfig::new().listen_addr(addr));

    let seeds = if cli.seed.is_empty() {
        file.seeds
    } else {
        cli.seed.clone()
    };

    let defaults = RuntimeConfig::default();
    let millis = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_millis);
    Ok(RuntimeConfig {
        local,
        seeds,
        heartbeat_interval: millis(file.heartbeat_interval_ms, defaults.heartbeat_interval),
        heartbeat_timeout: millis(file.heartbeat_timeout_ms, defaults.heartbeat_timeout),
        discovery_window: millis(file.discovery_window_ms, defaults.discovery_window),
        election_window: millis(file.election_window_ms, defaults.election_window),
        retransmit_timeout: millis(file.retransmit_timeout_ms, defaults.retransmit_timeout),
        max_sends: file.max_sends.unwrap_or(defaults.max_sends),
        transport,
        legacy_transport,
        ..defaults
    })
}

/// Peers must be able to dial what we advertise; a wildcard listener
/// advertises loopback unless told otherwise.
fn advertised_ip(listen: Ipv4Addr) -> Ipv4Addr {
    if listen.is_unspecified() {
        tracing::warn!("listening on {listen}, advertising 127.0.0.1 (set --advertise)");
        Ipv4Addr::LOCALHOST
    } else {
        listen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("cmm-node").chain(args.iter().copied()))
    }

    #[test]
    fn flags_override_the_file() {
        let file: FileConfig = serde_json::from_str(
            r#"{"id": 4, "priority": 9, "seeds": ["10.0.0.1:7400"], "heartbeat_interval_ms": 250}"#,
        )
        .unwrap();
        let config = resolve(
            &cli(&["--priority", "2", "--listen", "10.0.0.4:7500", "--seed", "10.0.0.2:7400"]),
            file,
        )
        .unwrap();

        assert_eq!(config.local.node, NodeId::new(4));
        assert_eq!(config.local.priority, 2);
        assert_eq!(config.local.socket_addr(), "10.0.0.4:7500".parse().unwrap());
        assert_eq!(config.seeds, vec!["10.0.0.2:7400".parse().unwrap()]);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(20));
    }

    #[test]
    fn id_is_required() {
        let err = resolve(&cli(&[]), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("node id"));
        assert!(resolve(&cli(&["--id", "0"]), FileConfig::default()).is_err());
    }

    #[test]
    fn wildcard_listener_advertises_loopback() {
        let config = resolve(&cli(&["--id", "1"]), FileConfig::default()).unwrap();
        assert_eq!(config.local.address, Ipv4Addr::LOCALHOST);
        assert_eq!(config.local.port, 7400);
        assert_ne!(config.local.capabilities & CAP_MASTER_ELIGIBLE, 0);

        let config = resolve(&cli(&["--id", "1", "--no-master"]), FileConfig::default()).unwrap();
        assert_eq!(config.local.capabilities & CAP_MASTER_ELIGIBLE, 0);
    }

    #[test]
    fn unknown_file_fields_are_rejected() {
        assert!(serde_json::from_str::<FileConfig>(r#"{"idd": 1}"#).is_err());
    }
}
