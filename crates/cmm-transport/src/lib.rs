//! CMM transport layer.
//!
//! Moves fixed-header binary frames between cluster nodes over TCP
//! (point-to-point) and UDP (broadcast), behind a codec-agnostic API.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use cmm_transport::{Endpoint, FrameCodec, TransportConfig};
//!
//! # async fn example<C: FrameCodec>(codec: C, msg: C::Message) -> Result<(), C::Error> {
//! let (endpoint, mut incoming) = Endpoint::bind(TransportConfig::new(), codec).await?;
//! println!("listening on {}", endpoint.local_addr());
//!
//! endpoint.send_to("10.0.0.2:7400".parse().unwrap(), &msg).await?;
//! if let Some(frame) = incoming.recv().await {
//!     println!("frame from {}", frame.from);
//! }
//! endpoint.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod endpoint;
mod error;
mod header;
mod io;
mod pool;

pub use config::TransportConfig;
pub use endpoint::{Endpoint, FrameCodec, Incoming};
pub use error::TransportError;
pub use header::{FrameHeader, FRAME_MTU, FRAME_VERSION, HEADER_SIZE};
pub use io::{read_fully, skip_bytes, write_fully, ReadPolicy};
pub use pool::{BufferPool, PooledBuffer, BUFFER_POOL_SIZE};

use std::fmt;
use std::str::FromStr;

/// Cluster node identity: a small positive integer.
///
/// Negative values are wire sentinels: [`NodeId::BROADCAST`] (-1),
/// [`NodeId::PEER`] (-2) and [`NodeId::UNKNOWN`] (-3).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeId(i32);

impl NodeId {
    /// Destination meaning "every node in the cluster".
    pub const BROADCAST: NodeId = NodeId(-1);
    /// Destination meaning "whoever is on the other end of this channel".
    pub const PEER: NodeId = NodeId(-2);
    /// Placeholder for a node we cannot name yet (no master known, etc.).
    pub const UNKNOWN: NodeId = NodeId(-3);

    /// Wrap a raw wire value (sentinels included).
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Raw wire value.
    pub const fn get(self) -> i32 {
        self.0
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    pub const fn is_peer(self) -> bool {
        self.0 == Self::PEER.0
    }

    /// True for a real node id (not a sentinel).
    pub const fn is_node(self) -> bool {
        self.0 > 0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BROADCAST => f.write_str("broadcast"),
            Self::PEER => f.write_str("peer"),
            Self::UNKNOWN => f.write_str("unknown"),
            NodeId(raw) => write!(f, "{raw}"),
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl FromStr for NodeId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: i32 = s
            .trim()
            .parse()
            .map_err(|_| TransportError::InvalidNodeId(s.to_string()))?;
        if raw <= 0 {
            return Err(TransportError::InvalidNodeId(s.to_string()));
        }
        Ok(Self(raw))
    }
}
