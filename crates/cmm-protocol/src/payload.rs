//! Typed frame payloads.
//!
//! Every payload is default-constructible: the decoder builds an empty one
//! from the registry and then fills it with [`WirePayload::copy_from`].
//! Integers are big-endian, like the header.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::frames::*;
use crate::registry::FrameType;

/// Binary (de)serialization of one payload kind.
pub trait WirePayload: Default + Clone + PartialEq + std::fmt::Debug + Into<Payload> {
    const FRAME_TYPE: FrameType;

    /// Append the payload bytes to `out`.
    fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Populate `self` from `reader`.
    fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError>;
}

// ── Reader ───────────────────────────────────────────────────────────────

/// Bounds-checked cursor over a received payload.
///
/// Every accessor fails with [`ProtocolError::Malformed`] instead of
/// panicking when the payload is shorter than its type requires.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    frame: &'static str,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8], frame: &'static str) -> Self {
        Self { buf, frame }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::malformed(
                self.frame,
                format!("needs {n} more bytes, {} left", self.buf.remaining()),
            ));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn bool(&mut self) -> Result<bool, ProtocolError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.invalid(format!("bad boolean byte {other}"))),
        }
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// A `u16` length followed by that many UTF-8 bytes.
    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| self.invalid("string is not UTF-8"))
    }

    pub fn invalid(&self, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::malformed(self.frame, reason)
    }
}

/// Append a `u16`-length-prefixed string.
pub(crate) fn put_string(out: &mut BytesMut, s: &str, frame: &'static str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len())
        .map_err(|_| ProtocolError::malformed(frame, format!("string of {} bytes", s.len())))?;
    out.put_u16(len);
    out.put_slice(s.as_bytes());
    Ok(())
}

// ── Payload ──────────────────────────────────────────────────────────────

macro_rules! payloads {
    ($($variant:ident),+ $(,)?) => {
        /// A decoded payload of any registered frame type.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Payload {
            $($variant($variant),)+
        }

        impl Payload {
            pub fn frame_type(&self) -> FrameType {
                match self {
                    $(Payload::$variant(_) => <$variant as WirePayload>::FRAME_TYPE,)+
                }
            }

            pub fn copy_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
                match self {
                    $(Payload::$variant(p) => p.copy_into(out),)+
                }
            }

            pub fn copy_from(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ProtocolError> {
                match self {
                    $(Payload::$variant(p) => p.copy_from(reader),)+
                }
            }
        }

        $(
            impl From<$variant> for Payload {
                fn from(p: $variant) -> Self {
                    Payload::$variant(p)
                }
            }
        )+
    };
}

payloads!(
    Heartbeat,
    Ack,
    Discovery,
    NodeInfoReply,
    Election,
    Notification,
    Register,
    Connect,
    ConnectResponse,
    Disconnect,
    ConfigUpdate,
    ConfigCommit,
    Data,
);

impl Payload {
    pub fn label(&self) -> &'static str {
        self.frame_type().label()
    }

    /// Frames the receiver answers with an [`Ack`].
    pub fn wants_ack(&self) -> bool {
        matches!(
            self,
            Payload::Heartbeat(_)
                | Payload::Register(_)
                | Payload::Disconnect(_)
                | Payload::ConfigUpdate(_)
                | Payload::ConfigCommit(_)
        )
    }
}
