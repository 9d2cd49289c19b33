use std::sync::atomic::{AtomicU32, Ordering};

pub use cmm_transport::NodeId;

// ── Constants ────────────────────────────────────────────────────────────

/// Heartbeat interval (5 seconds).
pub const HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// A node silent for this long is failed (~4 missed heartbeats).
pub const HEARTBEAT_TIMEOUT_MS: u64 = 20_000;

/// Base retransmit timeout for acknowledged frames.
pub const RETRANSMIT_TIMEOUT_MS: u64 = 1_000;

/// Sends per message before the peer is considered unreachable.
pub const MAX_SENDS: u32 = 5;

/// Capability bit: the node only speaks the 3-byte legacy wire format.
pub const CAP_LEGACY_WIRE: u32 = 1 << 0;

/// Capability bit: the node can hold the master role.
pub const CAP_MASTER_ELIGIBLE: u32 = 1 << 1;

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-process frame id counter.
///
/// Ids are never reused within one process lifetime; 0 is skipped so it
/// can mean "no request" in the `request_id` field.
#[derive(Debug)]
pub struct FrameIdGenerator {
    next: AtomicU32,
}

impl FrameIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first.max(1)),
        }
    }

    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for FrameIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
