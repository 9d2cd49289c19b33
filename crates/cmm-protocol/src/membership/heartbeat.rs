/// Liveness of the nodes we watch.
///
/// Pure state machine over an injected clock. The master watches every
/// member; a member watches only its master.
///
/// Two tiers: Stale once more than half the timeout has passed (logged,
/// nothing else), Failed once more than the full timeout has passed. A failed node is dropped from tracking in the same
/// call that reports it, so the failure is reported exactly once.
use std::collections::{HashMap, HashSet};

use crate::types::{NodeId, HEARTBEAT_TIMEOUT_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Alive,
    Stale,
    /// Past the timeout, or never tracked.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    Stale(NodeId),
    Recovered(NodeId),
    Failed(NodeId),
}

#[derive(Debug)]
pub struct HeartbeatTracker {
    /// Last heartbeat per node (Unix ms).
    last_heartbeat: HashMap<NodeId, u64>,
    stale: HashSet<NodeId>,
    stale_threshold: u64,
    fail_threshold: u64,
}

impl Default for HeartbeatTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::with_timeout(HEARTBEAT_TIMEOUT_MS)
    }

    pub fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            last_heartbeat: HashMap::new(),
            stale: HashSet::new(),
            stale_threshold: timeout_ms / 2,
            fail_threshold: timeout_ms,
        }
    }

    pub fn timeout(&self) -> u64 {
        self.fail_threshold
    }

    pub fn record_heartbeat_at(&mut self, node: NodeId, now: u64) {
        self.last_heartbeat.insert(node, now);
    }

    /// Start watching `node` without resetting an existing timestamp.
    pub fn track_at(&mut self, node: NodeId, now: u64) {
        self.last_heartbeat.entry(node).or_insert(now);
    }

    pub fn untrack(&mut self, node: NodeId) {
        self.last_heartbeat.remove(&node);
        self.stale.remove(&node);
    }

    pub fn is_tracked(&self, node: NodeId) -> bool {
        self.last_heartbeat.contains_key(&node)
    }

    pub fn tracked(&self) -> Vec<NodeId> {
        self.last_heartbeat.keys().copied().collect()
    }

    pub fn last_seen(&self, node: NodeId) -> Option<u64> {
        self.last_heartbeat.get(&node).copied()
    }

    pub fn liveness_at(&self, node: NodeId, now: u64) -> LivenessState {
        let Some(&last) = self.last_heartbeat.get(&node) else {
            return LivenessState::Failed;
        };
        let elapsed = now.saturating_sub(last);
        if elapsed > self.fail_threshold {
            LivenessState::Failed
        } else if elapsed > self.stale_threshold {
            LivenessState::Stale
        } else {
            LivenessState::Alive
        }
    }

    /// Check every tracked node. Failed nodes are untracked.
    pub fn check_at(&mut self, now: u64) -> Vec<LivenessEvent> {
        let mut events = Vec::new();
        let mut nodes: Vec<NodeId> = self.last_heartbeat.keys().copied().collect();
        nodes.sort();

        for node in nodes {
            match self.liveness_at(node, now) {
                LivenessState::Failed => {
                    self.untrack(node);
                    events.push(LivenessEvent::Failed(node));
                }
                LivenessState::Stale => {
                    if self.stale.insert(node) {
                        events.push(LivenessEvent::Stale(node));
                    }
                }
                LivenessState::Alive => {
                    if self.stale.remove(&node) {
                        events.push(LivenessEvent::Recovered(node));
                    }
                }
            }
        }
        events
    }

    /// First instant at which a node fails if nothing is heard.
    pub fn next_deadline(&self) -> Option<u64> {
        self.last_heartbeat
            .values()
            .min()
            .map(|last| last.saturating_add(self.fail_threshold).saturating_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: i32) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn liveness_tiers() {
        let mut tracker = HeartbeatTracker::with_timeout(20_000);
        tracker.record_heartbeat_at(n(2), 1_000);
        assert_eq!(tracker.liveness_at(n(2), 5_000), LivenessState::Alive);
        assert_eq!(tracker.liveness_at(n(2), 11_001), LivenessState::Stale);
        assert_eq!(tracker.liveness_at(n(2), 21_000), LivenessState::Failed);
        assert_eq!(tracker.liveness_at(n(9), 0), LivenessState::Failed);
    }

    #[test]
    fn failure_reported_once() {
        let mut tracker = HeartbeatTracker::with_timeout(20_000);
        tracker.record_heartbeat_at(n(2), 0);
        tracker.record_heartbeat_at(n(3), 15_000);

        assert_eq!(tracker.check_at(20_001), vec![LivenessEvent::Failed(n(2))]);
        assert!(!tracker.is_tracked(n(2)));
        assert!(tracker.check_at(20_002).is_empty());
    }

    #[test]
    fn stale_then_recovered() {
        let mut tracker = HeartbeatTracker::with_timeout(20_000);
        tracker.record_heartbeat_at(n(2), 0);
        assert_eq!(tracker.check_at(12_000), vec![LivenessEvent::Stale(n(2))]);
        assert!(tracker.check_at(13_000).is_empty(), "stale reported once");
        tracker.record_heartbeat_at(n(2), 14_000);
        assert_eq!(tracker.check_at(14_500), vec![LivenessEvent::Recovered(n(2))]);
    }

    #[test]
    fn track_does_not_reset() {
        let mut tracker = HeartbeatTracker::new();
        tracker.record_heartbeat_at(n(2), 100);
        tracker.track_at(n(2), 9_000);
        assert_eq!(tracker.last_seen(n(2)), Some(100));
        assert_eq!(tracker.next_deadline(), Some(100 + HEARTBEAT_TIMEOUT_MS + 1));
    }

    #[test]
    fn failure_needs_more_than_the_timeout() {
        let mut tracker = HeartbeatTracker::with_timeout(20_000);
        tracker.record_heartbeat_at(n(2), 0);
        assert_eq!(tracker.liveness_at(n(2), 10_000), LivenessState::Alive);
        assert_eq!(tracker.liveness_at(n(2), 20_000), LivenessState::Stale);
        assert_eq!(tracker.liveness_at(n(2), 20_001), LivenessState::Failed);

        assert_eq!(tracker.check_at(20_000), vec![LivenessEvent::Stale(n(2))]);
        assert!(tracker.is_tracked(n(2)));
        assert_eq!(tracker.next_deadline(), Some(20_001));
        assert_eq!(tracker.check_at(20_001), vec![LivenessEvent::Failed(n(2))]);
    }
}
