//! Legacy compact wire format.
//!
//! ```text
//! ┌────────┬─────────────┬──────┬──────────────────────────────┐
//! │ source │ destination │ type │ extra (fixed length by type) │
//! │ u8     │ u8          │ u8   │ 0 / 1 / 8 / 12 bytes         │
//! └────────┴─────────────┴──────┴──────────────────────────────┘
//! ```
//!
//! Multi-byte fields use native byte order. There is no length field: the
//! extra length is implied by the type code. This layout is frozen; legacy
//! peers cannot be upgraded.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use cmm_transport::{read_fully, write_fully, FrameCodec, ReadPolicy};

use crate::error::{ErrorKind, ProtocolError};
use crate::frames::{Disconnect, Heartbeat, NodeChange, NodeInfo, NodeInfoReply, Notification, Register, ResourceKind};
use crate::message::Message;
use crate::payload::Payload;
use crate::types::{FrameIdGenerator, NodeId};

/// Legacy header length.
pub const LEGACY_HEADER_SIZE: usize = 3;

/// Largest legacy frame (header + NodeInfo body).
pub const LEGACY_MAX_FRAME: usize = LEGACY_HEADER_SIZE + 12;

/// Legacy type codes and their implied body lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LegacyType {
    Register = 1,
    RegisterType = 2,
    NodeInfo = 3,
    NodeChange = 4,
    Heartbeat = 5,
    Disconnect = 6,
}

impl LegacyType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Register),
            2 => Some(Self::RegisterType),
            3 => Some(Self::NodeInfo),
            4 => Some(Self::NodeChange),
            5 => Some(Self::Heartbeat),
            6 => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// Bytes following the 3-byte header.
    pub const fn extra_len(self) -> usize {
        match self {
            LegacyType::Register => 0,
            LegacyType::RegisterType => 1,
            LegacyType::NodeInfo => 12,
            LegacyType::NodeChange => 8,
            LegacyType::Heartbeat => 0,
            LegacyType::Disconnect => 0,
        }
    }
}

/// Body of a legacy frame, field for field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyBody {
    Register,
    RegisterType { kind: u8 },
    NodeInfo { node: i32, address: u32, port: u16, flags: u16 },
    NodeChange { node: i32, cause: i32 },
    Heartbeat,
    Disconnect,
}

impl LegacyBody {
    pub fn legacy_type(&self) -> LegacyType {
        match self {
            LegacyBody::Register => LegacyType::Register,
            LegacyBody::RegisterType { .. } => LegacyType::RegisterType,
            LegacyBody::NodeInfo { .. } => LegacyType::NodeInfo,
            LegacyBody::NodeChange { .. } => LegacyType::NodeChange,
            LegacyBody::Heartbeat => LegacyType::Heartbeat,
            LegacyBody::Disconnect => LegacyType::Disconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyFrame {
    pub source: NodeId,
    pub destination: NodeId,
    pub body: LegacyBody,
}

impl LegacyFrame {
    /// Encoded bytes. Node ids are truncated to their low byte.
    pub fn encode(&self) -> Vec<u8> {
        let kind = self.body.legacy_type();
        let mut out = Vec::with_capacity(LEGACY_HEADER_SIZE + kind.extra_len());
        out.push(self.source.get() as u8);
        out.push(self.destination.get() as u8);
        out.push(kind as u8);
        match self.body {
            LegacyBody::Register | LegacyBody::Heartbeat | LegacyBody::Disconnect => {}
            LegacyBody::RegisterType { kind } => out.push(kind),
            LegacyBody::NodeInfo { node, address, port, flags } => {
                out.extend_from_slice(&node.to_ne_bytes());
                out.extend_from_slice(&address.to_ne_bytes());
                out.extend_from_slice(&port.to_ne_bytes());
                out.extend_from_slice(&flags.to_ne_bytes());
            }
            LegacyBody::NodeChange { node, cause } => {
                out.extend_from_slice(&node.to_ne_bytes());
                out.extend_from_slice(&cause.to_ne_bytes());
            }
        }
        out
    }

    /// Decode a header and a body of exactly the implied length.
    pub fn decode(header: [u8; LEGACY_HEADER_SIZE], extra: &[u8]) -> Result<Self, ProtocolError> {
        let kind = LegacyType::from_code(header[2]).ok_or(ProtocolError::UnknownFrameType {
            code: u32::from(header[2]),
        })?;
        if extra.len() != kind.extra_len() {
            return Err(ProtocolError::malformed(
                "legacy",
                format!("{kind:?} needs {} extra bytes, got {}", kind.extra_len(), extra.len()),
            ));
        }
        let i32_at = |i: usize| i32::from_ne_bytes([extra[i], extra[i + 1], extra[i + 2], extra[i + 3]]);
        let body = match kind {
            LegacyType::Register => LegacyBody::Register,
            LegacyType::RegisterType => LegacyBody::RegisterType { kind: extra[0] },
            LegacyType::NodeInfo => LegacyBody::NodeInfo {
                node: i32_at(0),
                address: u32::from_ne_bytes([extra[4], extra[5], extra[6], extra[7]]),
                port: u16::from_ne_bytes([extra[8], extra[9]]),
                flags: u16::from_ne_bytes([extra[10], extra[11]]),
            },
            LegacyType::NodeChange => LegacyBody::NodeChange {
                node: i32_at(0),
                cause: i32_at(4),
            },
            LegacyType::Heartbeat => LegacyBody::Heartbeat,
            LegacyType::Disconnect => LegacyBody::Disconnect,
        };
        Ok(Self {
            source: signed_node(header[0]),
            destination: signed_node(header[1]),
            body,
        })
    }

    /// Map a current-format message onto the legacy layout, if it has one.
    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        let body = match &msg.payload {
            Payload::Heartbeat(_) => LegacyBody::Heartbeat,
            Payload::Disconnect(_) => LegacyBody::Disconnect,
            Payload::Register(r) => LegacyBody::RegisterType { kind: r.kind as u8 },
            Payload::NodeInfoReply(reply) => legacy_node_info(&reply.info),
            Payload::Discovery(d) => legacy_node_info(&d.info),
            Payload::Connect(c) => legacy_node_info(&c.info),
            Payload::Notification(n) => LegacyBody::NodeChange {
                node: n.node.get(),
                cause: n.change as i32,
            },
            other => {
                return Err(ProtocolError::NoLegacyEquivalent {
                    frame: other.label(),
                })
            }
        };
        Ok(Self {
            source: msg.source,
            destination: msg.destination,
            body,
        })
    }

    /// Lift into a current-format message with a locally assigned frame id.
    ///
    /// Fields the legacy layout does not carry take neutral values: epoch 0,
    /// priority 0, empty resource name.
    pub fn into_message(self, frame_id: u32) -> Result<Message, ProtocolError> {
        let payload: Payload = match self.body {
            LegacyBody::Heartbeat => Heartbeat {
                epoch: 0,
                master: self.source,
                config_version: 0,
            }
            .into(),
            LegacyBody::Disconnect => Disconnect { node: self.source }.into(),
            LegacyBody::Register => Register::default().into(),
            LegacyBody::RegisterType { kind } => Register {
                kind: ResourceKind::from_u8(kind).ok_or_else(|| {
                    ProtocolError::malformed("legacy", format!("resource kind {kind}"))
                })?,
                name: String::new(),
            }
            .into(),
            LegacyBody::NodeInfo { node, address, port, flags } => NodeInfoReply {
                info: NodeInfo {
                    node: NodeId::new(node),
                    address: Ipv4Addr::from(address),
                    port,
                    capabilities: u32::from(flags),
                    priority: 0,
                },
                master: NodeId::UNKNOWN,
                epoch: 0,
            }
            .into(),
            LegacyBody::NodeChange { node, cause } => Notification {
                node: NodeId::new(node),
                change: u8::try_from(cause)
                    .ok()
                    .and_then(NodeChange::from_u8)
                    .ok_or_else(|| ProtocolError::malformed("legacy", format!("node change cause {cause}")))?,
                epoch: 0,
            }
            .into(),
        };
        Ok(Message::new(frame_id, self.source, self.destination, payload))
    }
}

fn legacy_node_info(info: &NodeInfo) -> LegacyBody {
    LegacyBody::NodeInfo {
        node: info.node.get(),
        address: u32::from(info.address),
        port: info.port,
        flags: info.capabilities as u16,
    }
}

/// Legacy node bytes are signed: 0xFF is broadcast, 0xFE is peer.
fn signed_node(raw: u8) -> NodeId {
    NodeId::new(i32::from(raw as i8))
}

// ── Codec ────────────────────────────────────────────────────────────────

/// Frame codec for legacy peers. Speaks [`Message`] on the inside so the
/// runtime handles both formats the same way.
#[derive(Debug, Clone)]
pub struct LegacyCodec {
    frame_ids: Arc<FrameIdGenerator>,
    read_policy: ReadPolicy,
    write_timeout: Duration,
}

impl LegacyCodec {
    pub fn new(frame_ids: Arc<FrameIdGenerator>) -> Self {
        Self {
            frame_ids,
            read_policy: ReadPolicy::default(),
            write_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub async fn read_frame<R>(&self, channel: &mut R) -> Result<LegacyFrame, ProtocolError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut header = [0u8; LEGACY_HEADER_SIZE];
        read_fully(channel, &mut header, self.read_policy).await?;
        let kind = LegacyType::from_code(header[2]).ok_or(ProtocolError::UnknownFrameType {
            code: u32::from(header[2]),
        })?;
        let mut extra = [0u8; LEGACY_MAX_FRAME - LEGACY_HEADER_SIZE];
        let extra = &mut extra[..kind.extra_len()];
        read_fully(channel, extra, self.read_policy).await?;
        LegacyFrame::decode(header, extra)
    }

    pub async fn write_frame<W>(&self, channel: &mut W, frame: &LegacyFrame) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        write_fully(channel, &frame.encode(), self.write_timeout).await?;
        Ok(())
    }
}

#[async_trait]
impl FrameCodec for LegacyCodec {
    type Message = Message;
    type Error = ProtocolError;

    async fn read_message(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Message, ProtocolError> {
        let frame = self.read_frame(reader).await?;
        frame.into_message(self.frame_ids.next_id())
    }

    async fn write_message(
        &self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        let frame = LegacyFrame::from_message(msg)?;
        self.write_frame(writer, &frame).await
    }

    fn is_frame_error(&self, err: &ProtocolError) -> bool {
        err.kind() == ErrorKind::Protocol
    }

    /// An unknown legacy type has no known extra length.
    fn loses_framing(&self, err: &ProtocolError) -> bool {
        err.is_header_rejection() || matches!(err, ProtocolError::UnknownFrameType { .. })
    }
}
