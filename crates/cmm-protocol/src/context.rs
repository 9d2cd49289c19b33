//! The process-wide pieces, owned once and passed down.
//!
//! One per running node: the frame id counter, the buffer pool shared by
//! both codecs, and the node table. Nothing here is a global.

use std::sync::Arc;

use cmm_transport::{BufferPool, TransportConfig};

use crate::codec::MessageCodec;
use crate::legacy::LegacyCodec;
use crate::node_table::NodeTable;
use crate::types::{FrameIdGenerator, NodeId};

#[derive(Debug, Clone)]
pub struct ClusterContext {
    pub local_id: NodeId,
    pub frame_ids: Arc<FrameIdGenerator>,
    pub pool: Arc<BufferPool>,
    pub nodes: Arc<NodeTable>,
}

impl ClusterContext {
    pub fn new(local_id: NodeId, pool_size: usize) -> Self {
        Self {
            local_id,
            frame_ids: Arc::new(FrameIdGenerator::new()),
            pool: BufferPool::new(pool_size),
            nodes: NodeTable::new(local_id),
        }
    }

    pub fn next_frame_id(&self) -> u32 {
        self.frame_ids.next_id()
    }

    /// Current-format codec sharing this context's pool.
    pub fn message_codec(&self, config: &TransportConfig) -> MessageCodec {
        MessageCodec::from_config(Arc::clone(&self.pool), config)
    }

    /// Legacy codec; decoded legacy frames draw ids from this context.
    pub fn legacy_codec(&self, config: &TransportConfig) -> LegacyCodec {
        LegacyCodec::new(Arc::clone(&self.frame_ids))
            .with_read_policy(config.read_policy())
            .with_write_timeout(config.get_write_timeout())
    }
}
