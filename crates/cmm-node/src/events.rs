use std::io::Write;

use cmm_protocol::{ClusterEvent, DeliveredData, NodeId};
use serde::Serialize;

/// Emit a JSONL line to stdout, flushed immediately for piped output.
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub node: NodeId,
    pub listen: String,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(node: NodeId, listen: impl ToString) -> Self {
        Self {
            event: "started",
            node,
            listen: listen.to_string(),
            timestamp: now_iso(),
        }
    }
}

/// A membership event, flattened so the line reads `{"event": "node_joined", ...}`.
#[derive(Serialize)]
pub struct EventCluster<'a> {
    pub node: NodeId,
    pub timestamp: String,
    #[serde(flatten)]
    pub inner: &'a ClusterEvent,
}

impl<'a> EventCluster<'a> {
    pub fn new(node: NodeId, inner: &'a ClusterEvent) -> Self {
        Self {
            node,
            timestamp: now_iso(),
            inner,
        }
    }
}

#[derive(Serialize)]
pub struct EventData {
    pub event: &'static str,
    pub node: NodeId,
    pub from: NodeId,
    pub topic: u16,
    pub size: usize,
    /// Lossy UTF-8 rendering of the body.
    pub text: String,
    pub timestamp: String,
}

impl EventData {
    pub fn new(node: NodeId, data: &DeliveredData) -> Self {
        Self {
            event: "data",
            node,
            from: data.from,
            topic: data.topic,
            size: data.body.len(),
            text: String::from_utf8_lossy(&data.body).into_owned(),
            timestamp: now_iso(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmm_protocol::MemberState;

    #[test]
    fn cluster_events_flatten_their_tag() {
        let event = ClusterEvent::StateChanged {
            from: MemberState::Discovering,
            to: MemberState::Electing,
        };
        let json = serde_json::to_value(EventCluster::new(NodeId::new(3), &event)).unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["node"], 3);
        assert_eq!(json["to"], "electing");
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn data_body_is_rendered_as_text() {
        let data = DeliveredData {
            from: NodeId::new(1),
            topic: 2,
            body: b"hi".to_vec(),
        };
        let json = serde_json::to_value(EventData::new(NodeId::new(3), &data)).unwrap();
        assert_eq!(json["event"], "data");
        assert_eq!(json["text"], "hi");
        assert_eq!(json["size"], 2);
    }
}
