/// Duplicate request detection.
///
/// Keyed by `(frame_id, source)`. A retransmitted request is answered with
/// the response recorded for the first copy instead of being processed
/// again. Bounded LRU with a TTL; the TTL bounds the window in which a
/// restarted sender's reused frame ids could collide.
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::message::Message;
use crate::types::{NodeId, HEARTBEAT_TIMEOUT_MS};

/// Default cache capacity.
pub const DEDUP_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Seen {
    at: u64,
    response: Option<Message>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupCheck {
    Fresh,
    /// Seen before; the response sent for it, if any.
    Duplicate(Option<Message>),
}

pub struct DedupCache {
    seen: LruCache<(u32, NodeId), Seen>,
    ttl: u64,
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("len", &self.seen.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEDUP_CAPACITY, HEARTBEAT_TIMEOUT_MS)
    }
}

impl DedupCache {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            seen: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            ttl: ttl_ms,
        }
    }

    /// Look up `msg`, recording it as seen if it is new or expired.
    pub fn check_at(&mut self, msg: &Message, now: u64) -> DedupCheck {
        let key = (msg.frame_id, msg.source);
        if let Some(seen) = self.seen.get(&key) {
            if now.saturating_sub(seen.at) < self.ttl {
                return DedupCheck::Duplicate(seen.response.clone());
            }
        }
        self.seen.put(key, Seen { at: now, response: None });
        DedupCheck::Fresh
    }

    /// Remember the response sent for `request`.
    pub fn record_response(&mut self, request: &Message, response: &Message) {
        if let Some(seen) = self.seen.get_mut(&(request.frame_id, request.source)) {
            seen.response = Some(response.clone());
        }
    }

    pub fn purge_expired(&mut self, now: u64) {
        let expired: Vec<(u32, NodeId)> = self
            .seen
            .iter()
            .filter(|(_, seen)| now.saturating_sub(seen.at) >= self.ttl)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            self.seen.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{Ack, Register, ResourceKind};

    fn register(frame_id: u32, source: i32) -> Message {
        Message::new(
            frame_id,
            NodeId::new(source),
            NodeId::new(1),
            Register {
                kind: ResourceKind::Lock,
                name: "l".into(),
            },
        )
    }

    #[test]
    fn duplicate_returns_cached_response() {
        let mut cache = DedupCache::new(8, 1_000);
        let request = register(5, 2);
        assert_eq!(cache.check_at(&request, 0), DedupCheck::Fresh);
        assert_eq!(cache.check_at(&request, 10), DedupCheck::Duplicate(None));

        let ack = request.reply(77, NodeId::new(1), Ack::default());
        cache.record_response(&request, &ack);
        match cache.check_at(&request, 20) {
            DedupCheck::Duplicate(Some(response)) => assert_eq!(response.frame_id, 77),
            other => panic!("expected cached response, got {other:?}"),
        }
    }

    #[test]
    fn same_frame_id_other_source_is_fresh() {
        let mut cache = DedupCache::new(8, 1_000);
        cache.check_at(&register(5, 2), 0);
        assert_eq!(cache.check_at(&register(5, 3), 0), DedupCheck::Fresh);
    }

    #[test]
    fn entries_expire() {
        let mut cache = DedupCache::new(8, 1_000);
        let request = register(5, 2);
        cache.check_at(&request, 0);
        assert_eq!(cache.check_at(&request, 1_000), DedupCheck::Fresh);

        cache.check_at(&register(6, 2), 1_500);
        cache.purge_expired(2_600);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let mut cache = DedupCache::new(2, 1_000);
        for id in 1..=3 {
            cache.check_at(&register(id, 2), 0);
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.check_at(&register(1, 2), 0), DedupCheck::Fresh, "oldest evicted");
    }
}
