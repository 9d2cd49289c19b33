use cmm_transport::{NodeId, TransportError};

/// Protocol-level errors for CMM.
///
/// Wraps transport errors and adds frame and membership variants.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("unknown frame type: {code}")]
    UnknownFrameType { code: u32 },

    #[error("malformed {frame} payload: {reason}")]
    Malformed { frame: &'static str, reason: String },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("{frame} has no legacy wire equivalent")]
    NoLegacyEquivalent { frame: &'static str },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("not the master (master is {master})")]
    NotMaster { master: NodeId },

    #[error("node {node} is not a cluster member")]
    UnknownNode { node: NodeId },

    #[error("runtime shut down")]
    RuntimeShutdown,
}

/// Coarse classification used by the membership layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The frame is bad; drop it and keep the channel.
    Protocol,
    /// The peer is currently unreachable.
    Transport,
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Transport(e) if e.is_frame_violation() => ErrorKind::Protocol,
            ProtocolError::Transport(_) | ProtocolError::RuntimeShutdown => ErrorKind::Transport,
            _ => ErrorKind::Protocol,
        }
    }

    /// The frame header itself was refused; the size it declared can't be
    /// trusted.
    pub fn is_header_rejection(&self) -> bool {
        matches!(self, ProtocolError::Transport(e) if e.is_frame_violation())
    }

    pub(crate) fn malformed(frame: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            frame,
            reason: reason.into(),
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}
