//! Outstanding acknowledged frames.
//!
//! Every frame that wants an `Ack` is parked here after its first send. A
//! sweep resends the expired ones and gives up after `max_sends`, at which
//! point the peer counts as unreachable. Abandoning a frame is not a
//! failure verdict; the heartbeat timeout decides that.

use std::collections::BTreeMap;

use crate::message::{Message, RetransmitStep};
use crate::runtime::Route;
use crate::types::{NodeId, MAX_SENDS};

#[derive(Debug, Clone)]
pub struct Outstanding {
    pub message: Message,
    pub route: Route,
    /// Node the frame is for; `NodeId::PEER` when only the address is known.
    pub target: NodeId,
}

#[derive(Debug, Default)]
pub struct Sweep {
    pub resend: Vec<(Route, Message)>,
    pub abandoned: Vec<Outstanding>,
}

#[derive(Debug)]
pub struct RetransmitQueue {
    pending: BTreeMap<u32, Outstanding>,
    max_sends: u32,
}

impl Default for RetransmitQueue {
    fn default() -> Self {
        Self::new(MAX_SENDS)
    }
}

impl RetransmitQueue {
    pub fn new(max_sends: u32) -> Self {
        Self {
            pending: BTreeMap::new(),
            max_sends: max_sends.max(1),
        }
    }

    /// Record the first send of `message` and keep it until acknowledged.
    /// Returns the copy to put on the wire.
    pub fn track(&mut self, mut message: Message, route: Route, target: NodeId, now: u64) -> Message {
        message.mark_sent(now);
        let wire = message.clone();
        self.pending.insert(
            message.frame_id,
            Outstanding {
                message,
                route,
                target,
            },
        );
        wire
    }

    pub fn acknowledge(&mut self, frame_id: u32) -> Option<Outstanding> {
        self.pending.remove(&frame_id)
    }

    pub fn sweep(&mut self, now: u64) -> Sweep {
        let mut sweep = Sweep::default();
        let mut exhausted = Vec::new();
        for (&frame_id, outstanding) in self.pending.iter_mut() {
            let message = &mut outstanding.message;
            if message.has_expired(now) && message.sent_count() >= self.max_sends {
                exhausted.push(frame_id);
            } else if let RetransmitStep::Resend { .. } = message.retransmit_if_expired(now) {
                sweep.resend.push((outstanding.route, message.clone()));
            }
        }
        for frame_id in exhausted {
            if let Some(gone) = self.pending.remove(&frame_id) {
                sweep.abandoned.push(gone);
            }
        }
        sweep
    }

    /// Drop everything addressed to `node`.
    pub fn forget_target(&mut self, node: NodeId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, o| o.target != node);
        before - self.pending.len()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.pending
            .values()
            .filter_map(|o| o.message.deadline())
            .min()
    }

    pub fn get(&self, frame_id: u32) -> Option<&Outstanding> {
        self.pending.get(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::Disconnect;
    use crate::runtime::Wire;

    fn route() -> Route {
        Route::new("127.0.0.1:7402".parse().unwrap(), Wire::Current)
    }

    fn disconnect(frame_id: u32) -> Message {
        Message::new(
            frame_id,
            NodeId::new(1),
            NodeId::new(2),
            Disconnect { node: NodeId::new(1) },
        )
    }

    #[test]
    fn resend_until_abandoned() {
        let mut queue = RetransmitQueue::new(3);
        let wire = queue.track(disconnect(1), route(), NodeId::new(2), 0);
        assert_eq!(wire.sent_count(), 1);
        assert_eq!(queue.next_deadline(), Some(1_000));

        assert!(queue.sweep(999).resend.is_empty());
        assert_eq!(queue.sweep(1_000).resend.len(), 1);
        assert_eq!(queue.sweep(2_000).resend.len(), 1);

        let sweep = queue.sweep(3_000);
        assert!(sweep.resend.is_empty());
        assert_eq!(sweep.abandoned.len(), 1);
        assert_eq!(sweep.abandoned[0].message.sent_count(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn ack_stops_resends() {
        let mut queue = RetransmitQueue::default();
        queue.track(disconnect(1), route(), NodeId::new(2), 0);
        assert!(queue.acknowledge(1).is_some());
        assert!(queue.acknowledge(1).is_none());
        let sweep = queue.sweep(10_000);
        assert!(sweep.resend.is_empty() && sweep.abandoned.is_empty());
    }

    #[test]
    fn forget_target_drops_pending() {
        let mut queue = RetransmitQueue::default();
        queue.track(disconnect(1), route(), NodeId::new(2), 0);
        queue.track(disconnect(2), route(), NodeId::new(3), 0);
        assert_eq!(queue.forget_target(NodeId::new(2)), 1);
        assert_eq!(queue.len(), 1);
        assert!(queue.get(2).is_some());
    }
}
