//! CMM protocol layer.
//!
//! Frame registry, the current and legacy codecs, the shared node table,
//! and the membership state machine (discovery, election, heartbeats,
//! two-phase config) on top of `cmm-transport`.
//!
//! Wire format: 32-byte big-endian header plus typed payload; the frozen
//! 3-byte legacy format is spoken on a second endpoint when configured.

pub mod codec;
pub mod context;
pub mod error;
pub mod frames;
pub mod legacy;
pub mod membership;
pub mod message;
pub mod node_table;
pub mod payload;
pub mod registry;
pub mod runtime;
pub mod types;

pub use codec::MessageCodec;
pub use context::ClusterContext;
pub use error::{ErrorKind, ProtocolError};
pub use frames::{
    Ack, AckStatus, ConfigCommit, ConfigUpdate, Connect, ConnectResponse, Data, Disconnect,
    Discovery, Election, Heartbeat, NodeChange, NodeInfo, NodeInfoReply, Notification, Register,
    ResourceKind,
};
pub use legacy::{LegacyCodec, LegacyFrame};
pub use membership::{
    elect, Candidate, CommitOutcome, ConfigEntries, ConfigStore, ElectionReason, ElectionResult,
    ElectionRound, HeartbeatTracker, LivenessEvent, LivenessState, StageOutcome,
};
pub use message::{Message, RetransmitStep};
pub use node_table::{MembershipListener, Node, NodeRef, NodeTable, RemovalCause, Resource};
pub use payload::{Payload, WirePayload};
pub use registry::FrameType;
pub use runtime::{
    ClusterEvent, ClusterHandle, ClusterRuntime, DeliveredData, Inbound, MemberState,
    MembershipState, Route, RuntimeChannels, RuntimeConfig, RuntimeEffect, StopReason, Transport,
    Wire,
};
pub use types::{now_ms, FrameIdGenerator, NodeId};
