/// Cluster runtime: drives `MembershipState` with real sockets and a clock.
///
/// The runtime owns the endpoints and all protocol state. It exposes a
/// channel-based API so the application never touches frames or timers:
/// commands go in through a [`ClusterHandle`], membership events and data
/// come out of [`RuntimeChannels`].
mod effect;
mod executor;
mod r#loop;
mod state;
mod transport;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use cmm_transport::{Endpoint, Incoming, TransportConfig};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::context::ClusterContext;
use crate::error::ProtocolError;
use crate::frames::{NodeInfo, ResourceKind};
use crate::membership::ConfigEntries;
use crate::message::Message;
use crate::node_table::{Node, NodeTable, Resource};
use crate::registry;
use crate::types::{NodeId, CAP_MASTER_ELIGIBLE, MAX_SENDS};

pub use effect::{Inbound, Route, RuntimeEffect, Wire};
pub use state::{MemberState, MembershipState};
pub use transport::{NetworkTransport, Transport};

#[cfg(test)]
pub use transport::mock;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the cluster runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// What this node advertises. A port of 0 is filled in from the
    /// bound listener.
    pub local: NodeInfo,
    /// Addresses probed directly during discovery.
    pub seeds: Vec<SocketAddr>,
    /// How often the master heartbeats each member.
    pub heartbeat_interval: Duration,
    /// Silence after which a node counts as failed.
    pub heartbeat_timeout: Duration,
    /// How long discovery waits for a master before electing.
    pub discovery_window: Duration,
    /// How long candidacies are collected.
    pub election_window: Duration,
    /// Base delay before an unacknowledged frame is resent.
    pub retransmit_timeout: Duration,
    /// Total sends of one frame before the peer counts as unreachable.
    pub max_sends: u32,
    pub dedup_capacity: usize,
    /// Endpoint for the current wire format.
    pub transport: TransportConfig,
    /// Second endpoint speaking the legacy format, if any.
    pub legacy_transport: Option<TransportConfig>,
    /// Buffer size of the event and data channels.
    pub channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            local: NodeInfo::new(NodeId::UNKNOWN, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
                .with_capabilities(CAP_MASTER_ELIGIBLE),
            seeds: Vec::new(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(20),
            discovery_window: Duration::from_secs(10),
            election_window: Duration::from_secs(10),
            retransmit_timeout: Duration::from_secs(1),
            max_sends: MAX_SENDS,
            dedup_capacity: crate::membership::DEDUP_CAPACITY,
            transport: TransportConfig::new(),
            legacy_transport: None,
            channel_capacity: 1024,
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands the application sends to the runtime event loop.
pub enum RuntimeCommand {
    /// Leave the cluster cleanly, then stop.
    Leave,
    /// Register a resource with the master on this node's behalf.
    Register { kind: ResourceKind, name: String },
    /// Start a two-phase config change (master only).
    ProposeConfig {
        changes: ConfigEntries,
        reply: oneshot::Sender<Result<u64, ProtocolError>>,
    },
    /// Send application data to a node or `NodeId::BROADCAST`.
    SendData {
        to: NodeId,
        topic: u16,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    /// Query: current state and epoch.
    GetState {
        reply: oneshot::Sender<Option<(MemberState, u64)>>,
    },
    /// Query: committed config version and entries.
    GetConfig {
        reply: oneshot::Sender<(u64, ConfigEntries)>,
    },
    /// Stop without telling anyone.
    Shutdown,
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// Why the runtime stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Left,
    /// The master failed and no successor appeared in time.
    MasterLost,
    Shutdown,
}

/// Application data received from another node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredData {
    pub from: NodeId,
    pub topic: u16,
    pub body: Vec<u8>,
}

/// Membership events the application may want to observe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    StateChanged { from: MemberState, to: MemberState },
    NodeJoined { node: NodeId },
    /// A node disconnected; its resources were released.
    NodeLeft { node: NodeId, released: Vec<Resource> },
    /// A node missed its heartbeats; its resources were released.
    NodeFailed { node: NodeId, released: Vec<Resource> },
    /// `None` when the local master stepped down.
    MasterChanged { master: Option<NodeId>, epoch: u64 },
    MasterLost { master: NodeId },
    ElectionStarted { epoch: u64 },
    ConfigApplied { version: u64 },
    ResourceRegistered { node: NodeId, resource: Resource },
    ResourceRejected { resource: Resource },
    /// A frame to `node` went unacknowledged after every retransmission.
    Unreachable { node: NodeId, frame: &'static str },
    /// Non-fatal runtime error.
    Error { description: String },
    Stopped { reason: StopReason },
}

// ── ClusterHandle (app-facing API) ───────────────────────────────────

/// Handle to communicate with a running cluster runtime.
///
/// Cheap to clone. Membership queries read the shared node table directly;
/// everything else goes through the command channel.
#[derive(Clone)]
pub struct ClusterHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    nodes: Arc<NodeTable>,
    local_addr: SocketAddr,
}

impl ClusterHandle {
    pub fn local_id(&self) -> NodeId {
        self.nodes.local_node_id()
    }

    /// Address the current-format listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn master(&self) -> Option<NodeId> {
        self.nodes.master()
    }

    pub fn master_node(&self) -> Option<Node> {
        self.nodes.master_node()
    }

    pub fn is_alive(&self, node: NodeId) -> bool {
        self.nodes.is_alive(node)
    }

    pub fn alive_nodes(&self) -> Vec<Node> {
        self.nodes.alive_nodes()
    }

    pub fn nodes(&self) -> &Arc<NodeTable> {
        &self.nodes
    }

    /// Current state and epoch; `None` once the runtime has stopped.
    pub async fn state(&self) -> Option<(MemberState, u64)> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(RuntimeCommand::GetState { reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    /// Committed config version and entries.
    pub async fn config(&self) -> (u64, ConfigEntries) {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(RuntimeCommand::GetConfig { reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    /// Propose a config change. Only the master accepts it. Entries with an
    /// empty value are removed.
    pub async fn propose_config(&self, changes: ConfigEntries) -> Result<u64, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCommand::ProposeConfig { changes, reply: tx })
            .await
            .map_err(|_| ProtocolError::RuntimeShutdown)?;
        rx.await.map_err(|_| ProtocolError::RuntimeShutdown)?
    }

    pub async fn register(&self, kind: ResourceKind, name: impl Into<String>) -> Result<(), ProtocolError> {
        self.cmd_tx
            .send(RuntimeCommand::Register {
                kind,
                name: name.into(),
            })
            .await
            .map_err(|_| ProtocolError::RuntimeShutdown)
    }

    pub async fn send_data(&self, to: NodeId, topic: u16, body: Vec<u8>) -> Result<(), ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCommand::SendData {
                to,
                topic,
                body,
                reply: tx,
            })
            .await
            .map_err(|_| ProtocolError::RuntimeShutdown)?;
        rx.await.map_err(|_| ProtocolError::RuntimeShutdown)?
    }

    /// Leave the cluster cleanly. The runtime stops once the master
    /// acknowledges (or the leave times out).
    pub async fn leave(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Leave).await;
    }

    /// Stop immediately.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown).await;
    }
}

// ── RuntimeChannels ──────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct RuntimeChannels {
    pub handle: ClusterHandle,
    /// Membership events.
    pub events: mpsc::Receiver<ClusterEvent>,
    /// Application data addressed to this node.
    pub data: mpsc::Receiver<DeliveredData>,
    /// Resolves when the event loop has exited.
    pub join: tokio::task::JoinHandle<StopReason>,
}

// ── ClusterRuntime ───────────────────────────────────────────────────

/// The cluster runtime: start it and communicate via channels.
pub struct ClusterRuntime;

impl ClusterRuntime {
    /// Bind the endpoints and spawn the event loop.
    pub async fn start(mut config: RuntimeConfig) -> Result<RuntimeChannels, ProtocolError> {
        let local_id = config.local.node;
        if !local_id.is_node() {
            return Err(ProtocolError::UnknownNode { node: local_id });
        }
        registry::verify();

        let ctx = ClusterContext::new(local_id, config.transport.get_pool_size());
        let (current, current_rx) =
            Endpoint::bind(config.transport.clone(), ctx.message_codec(&config.transport)).await?;
        if config.local.port == 0 {
            config.local.port = current.local_addr().port();
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);
        tokio::spawn(forward_incoming(current_rx, Wire::Current, inbound_tx.clone()));

        let legacy = match &config.legacy_transport {
            Some(legacy_config) => {
                let (endpoint, legacy_rx) =
                    Endpoint::bind(legacy_config.clone(), ctx.legacy_codec(legacy_config)).await?;
                tokio::spawn(forward_incoming(legacy_rx, Wire::Legacy, inbound_tx.clone()));
                tracing::info!(addr = %endpoint.local_addr(), "legacy endpoint bound");
                Some(endpoint)
            }
            None => None,
        };
        drop(inbound_tx);

        let local_addr = current.local_addr();
        tracing::info!(node = %local_id, %local_addr, "cluster runtime starting");
        let transport = NetworkTransport::new(current, legacy);
        Ok(Self::spawn_with_transport(transport, inbound_rx, ctx, config, local_addr))
    }

    /// Spawn the event loop over any transport. `start` uses this with the
    /// network endpoints; tests pass a mock.
    pub fn spawn_with_transport<T: Transport + 'static>(
        transport: T,
        inbound_rx: mpsc::Receiver<Inbound>,
        ctx: ClusterContext,
        config: RuntimeConfig,
        local_addr: SocketAddr,
    ) -> RuntimeChannels {
        let (cmd_tx, cmd_rx) = mpsc::channel::<RuntimeCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<ClusterEvent>(config.channel_capacity);
        let (data_tx, data_rx) = mpsc::channel::<DeliveredData>(config.channel_capacity);

        let nodes = Arc::clone(&ctx.nodes);
        let state = MembershipState::new(ctx, config);
        let join = tokio::spawn(r#loop::runtime_loop(
            state, transport, inbound_rx, cmd_rx, event_tx, data_tx,
        ));

        RuntimeChannels {
            handle: ClusterHandle {
                cmd_tx,
                nodes,
                local_addr,
            },
            events: event_rx,
            data: data_rx,
            join,
        }
    }
}

/// Tag frames from one endpoint with their wire format and merge them into
/// the loop's single inbound channel.
async fn forward_incoming(
    mut incoming: mpsc::Receiver<Incoming<Message>>,
    wire: Wire,
    inbound_tx: mpsc::Sender<Inbound>,
) {
    while let Some(Incoming { from, mut message }) = incoming.recv().await {
        message.from_network = true;
        let inbound = Inbound {
            route: Route::new(from, wire),
            message,
        };
        if inbound_tx.send(inbound).await.is_err() {
            break;
        }
    }
}
