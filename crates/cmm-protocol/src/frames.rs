//! Payload shapes, one per frame type.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::payload::{put_string, PayloadReader, WirePayload};
use crate::registry::FrameType;
use crate::types::{NodeId, CAP_LEGACY_WIRE};

// ── NodeInfo ─────────────────────────────────────────────────────────────

/// What a node says about itself: identity, reachability, capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: NodeId,
    pub address: Ipv4Addr,
    pub port: u16,
    /// `CAP_*` bits.
    pub capabilities: u32,
    /// Election weight; higher wins.
    pub priority: u32,
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            node: NodeId::UNKNOWN,
            address: Ipv4Addr::UNSPECIFIED,
            port: 0,
            capabilities: 0,
            priority: 0,
        }
    }
}

impl NodeInfo {
    /// Encoded length in bytes.
    pub const WIRE_LEN: usize = 18;

    pub fn new(node: NodeId, addr: SocketAddrV4) -> Self {
        Self {
            node,
            address: *addr.ip(),
            port: addr.port(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities(mut self, capabilities: u32) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }

    pub fn has_capability(&self, bit: u32) -> bool {
        self.capabilities & bit != 0
    }

    pub fn speaks_legacy(&self) -> bool {
        self.has_capability(CAP_LEGACY_WIRE)
    }

    pub(crate) fn put(&self, out: &mut BytesMut) {
        out.put_i32(self.node.get());
        out.put_u32(u32::from(self.address));
        out.put_u16(self.port);
        out.put_u32(self.capabilities);
        out.put_u32(self.priority);
    }

    pub(crate) fn get(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            node: NodeId::new(reader.i32()?),
            address: Ipv4Addr::from(reader.u32()?),
            port: reader.u16()?,
            capabilities: reader.u32()?,
            priority: reader.u32()?,
        })
    }
}

// ── Enumerations carried in payloads ─────────────────────────────────────

/// Outcome carried by an [`Ack`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AckStatus {
    #[default]
    Ok = 0,
    Rejected = 1,
    /// Commit for a version that was never staged, or a heartbeat
    /// advertising a config newer than ours.
    NotStaged = 2,
    /// Request already processed; nothing changed.
    Duplicate = 3,
}

impl AckStatus {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::Rejected),
            2 => Some(Self::NotStaged),
            3 => Some(Self::Duplicate),
            _ => None,
        }
    }
}

/// Membership change announced by a [`Notification`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeChange {
    #[default]
    Joined = 1,
    Left = 2,
    Failed = 3,
    MasterElected = 4,
}

impl NodeChange {
    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Joined),
            2 => Some(Self::Left),
            3 => Some(Self::Failed),
            4 => Some(Self::MasterElected),
            _ => None,
        }
    }
}

/// Kind of resource a node can register with the master.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceKind {
    #[default]
    Lock = 1,
    Component = 2,
    Service = 3,
}

impl ResourceKind {
    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Lock),
            2 => Some(Self::Component),
            3 => Some(Self::Service),
            _ => None,
        }
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────

/// Liveness probe. Sent by the master to every member, and back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Heartbeat {
    pub epoch: u64,
    pub master: NodeId,
    pub config_version: u64,
}

impl WirePayload for Heartbeat {
    const FRAME_TYPE: FrameType = FrameType::Heartbeat;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_u64(self.epoch);
        out.put_i32(self.master.get());
        out.put_u64(self.config_version);
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        self.epoch = reader.u64()?;
        self.master = NodeId::new(reader.i32()?);
        self.config_version = reader.u64()?;
        Ok(())
    }
}

/// Generic response; the header's `request_id` names the acknowledged frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    pub status: AckStatus,
}

impl WirePayload for Ack {
    const FRAME_TYPE: FrameType = FrameType::Ack;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_u8(self.status as u8);
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        let raw = reader.u8()?;
        self.status = AckStatus::from_u8(raw).ok_or_else(|| reader.invalid(format!("ack status {raw}")))?;
        Ok(())
    }
}

/// "Who is out there?" Broadcast at boot and after master loss.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub info: NodeInfo,
}

impl WirePayload for Discovery {
    const FRAME_TYPE: FrameType = FrameType::Discovery;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        self.info.put(out);
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        self.info = NodeInfo::get(reader)?;
        Ok(())
    }
}

/// Reply to [`Discovery`]: the responder's identity and who it thinks is master.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfoReply {
    pub info: NodeInfo,
    pub master: NodeId,
    pub epoch: u64,
}

impl WirePayload for NodeInfoReply {
    const FRAME_TYPE: FrameType = FrameType::NodeInfo;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        self.info.put(out);
        out.put_i32(self.master.get());
        out.put_u64(self.epoch);
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        self.info = NodeInfo::get(reader)?;
        self.master = NodeId::new(reader.i32()?);
        self.epoch = reader.u64()?;
        Ok(())
    }
}

/// A candidacy: "I, or the best node I know, should be master for `epoch`".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Election {
    pub candidate: NodeId,
    pub priority: u32,
    pub epoch: u64,
}

impl WirePayload for Election {
    const FRAME_TYPE: FrameType = FrameType::Election;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_i32(self.candidate.get());
        out.put_u32(self.priority);
        out.put_u64(self.epoch);
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        self.candidate = NodeId::new(reader.i32()?);
        self.priority = reader.u32()?;
        self.epoch = reader.u64()?;
        Ok(())
    }
}

/// Membership change broadcast: join, leave, failure, new master.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    pub node: NodeId,
    pub change: NodeChange,
    pub epoch: u64,
}

impl WirePayload for Notification {
    const FRAME_TYPE: FrameType = FrameType::Notification;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_i32(self.node.get());
        out.put_u8(self.change as u8);
        out.put_u64(self.epoch);
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        self.node = NodeId::new(reader.i32()?);
        let raw = reader.u8()?;
        self.change = NodeChange::from_u8(raw).ok_or_else(|| reader.invalid(format!("node change {raw}")))?;
        self.epoch = reader.u64()?;
        Ok(())
    }
}

/// Attribute a named resource to the sending node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Register {
    pub kind: ResourceKind,
    pub name: String,
}

impl WirePayload for Register {
    const FRAME_TYPE: FrameType = FrameType::Register;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_u8(self.kind as u8);
        put_string(out, &self.name, Self::FRAME_TYPE.label())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        let raw = reader.u8()?;
        self.kind = ResourceKind::from_u8(raw).ok_or_else(|| reader.invalid(format!("resource kind {raw}")))?;
        self.name = reader.string()?;
        Ok(())
    }
}

/// Join request sent to the master.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connect {
    pub info: NodeInfo,
}

impl WirePayload for Connect {
    const FRAME_TYPE: FrameType = FrameType::Connect;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        self.info.put(out);
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        self.info = NodeInfo::get(reader)?;
        Ok(())
    }
}

/// The master's answer to [`Connect`].
///
/// On rejection `master` names the node to retry with, if known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectResponse {
    pub accepted: bool,
    pub master: NodeId,
    pub epoch: u64,
    pub config_version: u64,
    /// Current members, master included.
    pub members: Vec<NodeInfo>,
}

impl WirePayload for ConnectResponse {
    const FRAME_TYPE: FrameType = FrameType::ConnectResponse;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_u8(u8::from(self.accepted));
        out.put_i32(self.master.get());
        out.put_u64(self.epoch);
        out.put_u64(self.config_version);
        let count = u16::try_from(self.members.len()).map_err(|_| {
            ProtocolError::malformed(Self::FRAME_TYPE.label(), "too many members")
        })?;
        out.put_u16(count);
        for member in &self.members {
            member.put(out);
        }
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        self.accepted = reader.bool()?;
        self.master = NodeId::new(reader.i32()?);
        self.epoch = reader.u64()?;
        self.config_version = reader.u64()?;
        let count = reader.u16()? as usize;
        if reader.remaining() < count * NodeInfo::WIRE_LEN {
            return Err(reader.invalid(format!("{count} members declared, {} bytes left", reader.remaining())));
        }
        self.members = (0..count)
            .map(|_| NodeInfo::get(reader))
            .collect::<Result<_, _>>()?;
        Ok(())
    }
}

/// Explicit leave. Sent by the leaving node, or by the master to evict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disconnect {
    pub node: NodeId,
}

impl WirePayload for Disconnect {
    const FRAME_TYPE: FrameType = FrameType::Disconnect;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_i32(self.node.get());
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        self.node = NodeId::new(reader.i32()?);
        Ok(())
    }
}

/// Phase one of a configuration change: stage `entries` under `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub version: u64,
    pub entries: BTreeMap<String, String>,
}

impl WirePayload for ConfigUpdate {
    const FRAME_TYPE: FrameType = FrameType::ConfigUpdate;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let blob = rmp_serde::to_vec(&self.entries)?;
        out.put_u64(self.version);
        out.put_u32(blob.len() as u32);
        out.put_slice(&blob);
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        self.version = reader.u64()?;
        let len = reader.u32()? as usize;
        let blob = reader.bytes(len)?;
        self.entries = rmp_serde::from_slice(blob)?;
        Ok(())
    }
}

/// Phase two: apply the staged `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigCommit {
    pub version: u64,
}

impl WirePayload for ConfigCommit {
    const FRAME_TYPE: FrameType = FrameType::ConfigCommit;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_u64(self.version);
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        self.version = reader.u64()?;
        Ok(())
    }
}

/// Opaque application message between members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Data {
    pub topic: u16,
    pub body: Vec<u8>,
}

impl WirePayload for Data {
    const FRAME_TYPE: FrameType = FrameType::Data;

    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_u16(self.topic);
        out.put_u32(self.body.len() as u32);
        out.put_slice(&self.body);
        Ok(())
    }

    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
        self.topic = reader.u16()?;
        let len = reader.u32()? as usize;
        self.body = reader.bytes(len)?.to_vec();
        Ok(())
    }
}
