use std::net::SocketAddr;

/// Errors returned by the CMM transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed by peer")]
    Closed,

    #[error("read stalled after {retries} retries")]
    ReadTimeout { retries: u32 },

    #[error("write made no progress for {timeout_ms} ms")]
    WriteTimeout { timeout_ms: u64 },

    #[error("frame version mismatch: expected {expected:#010x}, found {found:#010x}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("truncated frame header: {have} of {need} bytes")]
    TruncatedHeader { need: usize, have: usize },

    #[error("endpoint is shut down")]
    Shutdown,

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether the error condemns a single frame rather than the channel.
    ///
    /// Bad version, oversize and truncated headers reject the frame; everything
    /// else means the peer is currently unreachable.
    pub fn is_frame_violation(&self) -> bool {
        matches!(
            self,
            TransportError::VersionMismatch { .. }
                | TransportError::FrameTooLarge { .. }
                | TransportError::TruncatedHeader { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_version_mismatch() {
        let err = TransportError::VersionMismatch {
            expected: 0x434d_0002,
            found: 1,
        };
        assert_eq!(
            err.to_string(),
            "frame version mismatch: expected 0x434d0002, found 0x00000001"
        );
    }

    #[test]
    fn classification() {
        assert!(TransportError::FrameTooLarge { size: 9000, max: 4096 }.is_frame_violation());
        assert!(!TransportError::Closed.is_frame_violation());
        assert!(!TransportError::ReadTimeout { retries: 3 }.is_frame_violation());
    }
}
