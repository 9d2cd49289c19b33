//! Frame type registry.
//!
//! A fixed table mapping wire type codes to payload constructors. The set is
//! closed at compile time; an unknown code is a protocol error, never a
//! silent default.

use crate::error::ProtocolError;
use crate::frames::*;
use crate::payload::{Payload, WirePayload};

/// Wire type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum FrameType {
    Heartbeat = 1,
    Ack = 2,
    Discovery = 3,
    NodeInfo = 4,
    Election = 5,
    Notification = 6,
    Register = 7,
    Connect = 8,
    ConnectResponse = 9,
    Disconnect = 10,
    ConfigUpdate = 11,
    ConfigCommit = 12,
    Data = 13,
}

impl FrameType {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn label(self) -> &'static str {
        match self {
            FrameType::Heartbeat => "Heartbeat",
            FrameType::Ack => "Ack",
            FrameType::Discovery => "Discovery",
            FrameType::NodeInfo => "NodeInfo",
            FrameType::Election => "Election",
            FrameType::Notification => "Notification",
            FrameType::Register => "Register",
            FrameType::Connect => "Connect",
            FrameType::ConnectResponse => "ConnectResponse",
            FrameType::Disconnect => "Disconnect",
            FrameType::ConfigUpdate => "ConfigUpdate",
            FrameType::ConfigCommit => "ConfigCommit",
            FrameType::Data => "Data",
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        lookup(code).map(|entry| entry.frame_type)
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One registry row.
#[derive(Debug, Clone, Copy)]
pub struct FrameTypeEntry {
    pub frame_type: FrameType,
    pub label: &'static str,
    pub construct: fn() -> Payload,
}

fn construct<P: WirePayload>() -> Payload {
    P::default().into()
}

const fn entry(frame_type: FrameType, construct: fn() -> Payload) -> FrameTypeEntry {
    FrameTypeEntry {
        frame_type,
        label: frame_type.label(),
        construct,
    }
}

static REGISTRY: [FrameTypeEntry; 13] = [
    entry(FrameType::Heartbeat, construct::<Heartbeat>),
    entry(FrameType::Ack, construct::<Ack>),
    entry(FrameType::Discovery, construct::<Discovery>),
    entry(FrameType::NodeInfo, construct::<NodeInfoReply>),
    entry(FrameType::Election, construct::<Election>),
    entry(FrameType::Notification, construct::<Notification>),
    entry(FrameType::Register, construct::<Register>),
    entry(FrameType::Connect, construct::<Connect>),
    entry(FrameType::ConnectResponse, construct::<ConnectResponse>),
    entry(FrameType::Disconnect, construct::<Disconnect>),
    entry(FrameType::ConfigUpdate, construct::<ConfigUpdate>),
    entry(FrameType::ConfigCommit, construct::<ConfigCommit>),
    entry(FrameType::Data, construct::<Data>),
];

/// All registered frame types, in code order.
pub fn entries() -> &'static [FrameTypeEntry] {
    &REGISTRY
}

/// Linear scan; the table is small and lookups are per frame.
pub fn lookup(code: u32) -> Option<&'static FrameTypeEntry> {
    REGISTRY.iter().find(|entry| entry.frame_type.code() == code)
}

/// Instantiate an empty payload for `code`.
pub fn create_payload(code: u32) -> Result<Payload, ProtocolError> {
    lookup(code)
        .map(|entry| (entry.construct)())
        .ok_or(ProtocolError::UnknownFrameType { code })
}

/// Check every entry builds a payload of its own type and codes are unique.
///
/// # Panics
///
/// On any mismatch. A broken table is a build defect and must stop start-up.
pub fn verify() {
    for (i, entry) in REGISTRY.iter().enumerate() {
        let payload = (entry.construct)();
        assert_eq!(
            payload.frame_type(),
            entry.frame_type,
            "registry entry {} constructs a {} payload",
            entry.label,
            payload.label()
        );
        assert!(
            REGISTRY[i + 1..]
                .iter()
                .all(|other| other.frame_type.code() != entry.frame_type.code()),
            "frame type code {} registered twice",
            entry.frame_type.code()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_consistent() {
        verify();
        assert_eq!(entries().len(), 13);
    }

    #[test]
    fn create_each_type() {
        for entry in entries() {
            let payload = create_payload(entry.frame_type.code()).unwrap();
            assert_eq!(payload.frame_type(), entry.frame_type);
            assert_eq!(payload.label(), entry.label);
        }
    }

    #[test]
    fn unknown_code_is_an_error() {
        assert!(matches!(
            create_payload(0),
            Err(ProtocolError::UnknownFrameType { code: 0 })
        ));
        assert!(matches!(
            create_payload(999),
            Err(ProtocolError::UnknownFrameType { code: 999 })
        ));
        assert_eq!(FrameType::from_code(14), None);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(FrameType::Heartbeat.code(), 1);
        assert_eq!(FrameType::ConnectResponse.code(), 9);
        assert_eq!(FrameType::from_code(11), Some(FrameType::ConfigUpdate));
    }
}
