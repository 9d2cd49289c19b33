//! Fixed frame header: eight big-endian 32-bit words.
//!
//! ```text
//! ┌─────────┬──────────┬──────┬──────┬────────┬─────────────┬────────────┬─────────────┐
//! │ version │ frame id │ type │ size │ source │ destination │ request id │ fromNetwork │
//! │ u32     │ u32      │ u32  │ u32  │ i32    │ i32         │ i32        │ u32 (0/1)   │
//! └─────────┴──────────┴──────┴──────┴────────┴─────────────┴────────────┴─────────────┘
//! ```
//!
//! `size` bytes of type-specific payload follow the header.

use crate::{NodeId, TransportError};

/// Header size in bytes (fixed, exactly 32).
pub const HEADER_SIZE: usize = 32;

/// Magic version word. Any other value is rejected; there is no negotiation.
pub const FRAME_VERSION: u32 = 0x434D_0002;

/// Maximum payload size of a single frame.
pub const FRAME_MTU: usize = 4096;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u32,
    /// Sender-unique, monotonically generated frame id.
    pub frame_id: u32,
    /// Frame type code (see the protocol's type registry).
    pub frame_type: u32,
    /// Payload length in bytes, never above [`FRAME_MTU`].
    pub size: u32,
    pub source: NodeId,
    pub destination: NodeId,
    /// Correlates a response with the frame id of its request.
    pub request_id: i32,
    /// True when the frame actually crossed the wire.
    pub from_network: bool,
}

impl FrameHeader {
    /// Encode into the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_SIZE`].
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_SIZE, "header buffer too short");
        buf[0..4].copy_from_slice(&self.version.to_be_bytes());
        buf[4..8].copy_from_slice(&self.frame_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.frame_type.to_be_bytes());
        buf[12..16].copy_from_slice(&self.size.to_be_bytes());
        buf[16..20].copy_from_slice(&self.source.get().to_be_bytes());
        buf[20..24].copy_from_slice(&self.destination.get().to_be_bytes());
        buf[24..28].copy_from_slice(&self.request_id.to_be_bytes());
        buf[28..32].copy_from_slice(&u32::from(self.from_network).to_be_bytes());
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Decode and validate a header.
    ///
    /// Rejects a wrong version word and a declared size above the MTU, so a
    /// corrupt header never leads to a payload read.
    pub fn decode(buf: &[u8]) -> Result<Self, TransportError> {
        if buf.len() < HEADER_SIZE {
            return Err(TransportError::TruncatedHeader {
                need: HEADER_SIZE,
                have: buf.len(),
            });
        }
        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let signed = |i: usize| i32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

        let version = word(0);
        if version != FRAME_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: FRAME_VERSION,
                found: version,
            });
        }

        let size = word(12);
        if size as usize > FRAME_MTU {
            return Err(TransportError::FrameTooLarge {
                size: size as usize,
                max: FRAME_MTU,
            });
        }

        Ok(Self {
            version,
            frame_id: word(4),
            frame_type: word(8),
            size,
            source: NodeId::new(signed(16)),
            destination: NodeId::new(signed(20)),
            request_id: signed(24),
            from_network: word(28) != 0,
        })
    }

    /// Payload length as a `usize`.
    pub fn payload_len(&self) -> usize {
        self.size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FrameHeader {
        FrameHeader {
            version: FRAME_VERSION,
            frame_id: 42,
            frame_type: 3,
            size: 100,
            source: NodeId::new(101),
            destination: NodeId::BROADCAST,
            request_id: -7,
            from_network: true,
        }
    }

    #[test]
    fn layout_is_big_endian_words() {
        let bytes = sample().encode();
        assert_eq!(&bytes[0..4], &[0x43, 0x4D, 0x00, 0x02]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 42]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 100]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 101]);
        assert_eq!(&bytes[20..24], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&bytes[28..32], &[0, 0, 0, 1]);
    }

    #[test]
    fn decode_restores_fields() {
        let header = sample();
        assert_eq!(FrameHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn decode_rejects_altered_version() {
        let mut bytes = sample().encode();
        bytes[3] ^= 0x01;
        let err = FrameHeader::decode(&bytes).unwrap_err();
        assert!(matches!(err, TransportError::VersionMismatch { found: 0x434D_0003, .. }));
    }

    #[test]
    fn decode_rejects_oversize() {
        let mut header = sample();
        header.size = FRAME_MTU as u32 + 1;
        let err = FrameHeader::decode(&header.encode()).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size, .. } if size == FRAME_MTU + 1));
    }

    #[test]
    fn decode_accepts_exact_mtu() {
        let mut header = sample();
        header.size = FRAME_MTU as u32;
        assert_eq!(FrameHeader::decode(&header.encode()).unwrap().payload_len(), FRAME_MTU);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let bytes = sample().encode();
        assert!(matches!(
            FrameHeader::decode(&bytes[..10]),
            Err(TransportError::TruncatedHeader { need: 32, have: 10 })
        ));
    }
}
