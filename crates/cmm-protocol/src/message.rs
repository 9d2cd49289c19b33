//! A frame plus retransmission bookkeeping.
//!
//! Identity is `(frame_id, source)`: two messages with the same pair are
//! equal whatever their timers say, which is how a receiver spots a
//! retransmitted duplicate.

use std::hash::{Hash, Hasher};

use crate::payload::Payload;
use crate::registry::FrameType;
use crate::types::{NodeId, RETRANSMIT_TIMEOUT_MS};

#[derive(Debug, Clone)]
pub struct Message {
    pub frame_id: u32,
    pub source: NodeId,
    pub destination: NodeId,
    /// Frame id of the request this answers, 0 if none.
    pub request_id: i32,
    /// Set by the receiving side; false for locally synthesized messages.
    pub from_network: bool,
    pub payload: Payload,

    // Never transmitted.
    arm_deadline: Option<u64>,
    base_timeout: u64,
    sent_count: u32,
}

impl Message {
    pub fn new(frame_id: u32, source: NodeId, destination: NodeId, payload: impl Into<Payload>) -> Self {
        Self {
            frame_id,
            source,
            destination,
            request_id: 0,
            from_network: false,
            payload: payload.into(),
            arm_deadline: None,
            base_timeout: RETRANSMIT_TIMEOUT_MS,
            sent_count: 0,
        }
    }

    /// Build the response to `self`: addressed back to its source, with
    /// `request_id` naming its frame id.
    pub fn reply(&self, frame_id: u32, source: NodeId, payload: impl Into<Payload>) -> Self {
        let mut reply = Self::new(frame_id, source, self.source, payload);
        reply.request_id = self.frame_id as i32;
        reply
    }

    pub fn with_request_id(mut self, request_id: i32) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_base_timeout(mut self, timeout_ms: u64) -> Self {
        self.base_timeout = timeout_ms;
        self
    }

    pub fn frame_type(&self) -> FrameType {
        self.payload.frame_type()
    }

    pub fn label(&self) -> &'static str {
        self.payload.label()
    }

    /// `request_id` as the frame id it refers to, if any.
    pub fn answers(&self) -> Option<u32> {
        (self.request_id != 0).then_some(self.request_id as u32)
    }

    // ── Retransmission ───────────────────────────────────────────────────

    /// Arm a retransmit deadline `timeout_ms` from `now`.
    pub fn arm(&mut self, timeout_ms: u64, now: u64) {
        self.arm_deadline = Some(now.saturating_add(timeout_ms));
    }

    pub fn disarm(&mut self) {
        self.arm_deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.arm_deadline.is_some()
    }

    /// Milliseconds until the deadline; 0 when expired or never armed.
    pub fn remaining_time(&self, now: u64) -> u64 {
        self.arm_deadline
            .map(|deadline| deadline.saturating_sub(now))
            .unwrap_or(0)
    }

    pub fn has_expired(&self, now: u64) -> bool {
        self.remaining_time(now) == 0
    }

    pub fn deadline(&self) -> Option<u64> {
        self.arm_deadline
    }

    pub fn base_timeout(&self) -> u64 {
        self.base_timeout
    }

    pub fn sent_count(&self) -> u32 {
        self.sent_count
    }

    /// Record one transmission: re-arm for `base_timeout` and count it.
    pub fn mark_sent(&mut self, now: u64) {
        self.arm(self.base_timeout, now);
        self.sent_count += 1;
    }

    /// Resend step for a periodic tick. Past the deadline the frame is
    /// re-armed and counted, and the caller puts it on the wire again.
    /// Either way the caller learns how long until the next deadline.
    pub fn retransmit_if_expired(&mut self, now: u64) -> RetransmitStep {
        if !self.has_expired(now) {
            return RetransmitStep::Wait {
                remaining: self.remaining_time(now),
            };
        }
        self.mark_sent(now);
        tracing::trace!(frame_id = self.frame_id, sent = self.sent_count, "rearmed {}", self.label());
        RetransmitStep::Resend {
            next_in: self.remaining_time(now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitStep {
    /// Write the frame again; the next deadline is `next_in` ms away.
    Resend { next_in: u64 },
    Wait { remaining: u64 },
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.frame_id == other.frame_id && self.source == other.source
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.frame_id.hash(state);
        self.source.hash(state);
    }
}
