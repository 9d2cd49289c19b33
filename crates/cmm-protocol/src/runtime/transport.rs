use std::net::SocketAddr;

use cmm_transport::Endpoint;

use crate::codec::MessageCodec;
use crate::error::ProtocolError;
use crate::legacy::LegacyCodec;
use crate::message::Message;

use super::effect::{Route, Wire};

/// Network abstraction for the runtime.
///
/// In production: `NetworkTransport` over TCP/UDP endpoints.
/// In tests: `MockTransport`, which records what was sent.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame along `route`.
    async fn send(&self, route: Route, message: &Message) -> Result<(), ProtocolError>;

    /// Send one frame to every current-format node. Returns how many sends
    /// went out.
    async fn broadcast(&self, message: &Message, fanout: &[SocketAddr]) -> usize;

    async fn shutdown(&self);
}

// ── NetworkTransport (production) ───────────────────────────────────

/// The current-format endpoint, plus a legacy one when configured.
pub struct NetworkTransport {
    current: Endpoint<MessageCodec>,
    legacy: Option<Endpoint<LegacyCodec>>,
}

impl NetworkTransport {
    pub fn new(current: Endpoint<MessageCodec>, legacy: Option<Endpoint<LegacyCodec>>) -> Self {
        Self { current, legacy }
    }
}

#[async_trait::async_trait]
impl Transport for NetworkTransport {
    async fn send(&self, route: Route, message: &Message) -> Result<(), ProtocolError> {
        match (route.wire, &self.legacy) {
            (Wire::Current, _) => self.current.send_to(route.address, message).await,
            (Wire::Legacy, Some(legacy)) => legacy.send_to(route.address, message).await,
            (Wire::Legacy, None) => Err(ProtocolError::NoLegacyEquivalent {
                frame: message.label(),
            }),
        }
    }

    async fn broadcast(&self, message: &Message, fanout: &[SocketAddr]) -> usize {
        self.current.broadcast(message, fanout).await
    }

    async fn shutdown(&self) {
        self.current.shutdown().await;
        if let Some(legacy) = &self.legacy {
            legacy.shutdown().await;
        }
    }
}

// ── MockTransport (tests) ───────────────────────────────────────────

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Fake transport that records sends for inspection.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        sent: Arc<Mutex<Vec<(Route, Message)>>>,
        broadcasts: Arc<Mutex<Vec<(Message, Vec<SocketAddr>)>>>,
        fail_sends: Arc<Mutex<bool>>,
        shut_down: Arc<Mutex<bool>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<(Route, Message)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn broadcasts(&self) -> Vec<(Message, Vec<SocketAddr>)> {
            self.broadcasts.lock().unwrap().clone()
        }

        pub fn set_fail_sends(&self, fail: bool) {
            *self.fail_sends.lock().unwrap() = fail;
        }

        pub fn clear_sent(&self) {
            self.sent.lock().unwrap().clear();
            self.broadcasts.lock().unwrap().clear();
        }

        pub fn is_shut_down(&self) -> bool {
            *self.shut_down.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn send(&self, route: Route, message: &Message) -> Result<(), ProtocolError> {
            if *self.fail_sends.lock().unwrap() {
                return Err(cmm_transport::TransportError::Shutdown.into());
            }
            self.sent.lock().unwrap().push((route, message.clone()));
            Ok(())
        }

        async fn broadcast(&self, message: &Message, fanout: &[SocketAddr]) -> usize {
            if *self.fail_sends.lock().unwrap() {
                return 0;
            }
            self.broadcasts
                .lock()
                .unwrap()
                .push((message.clone(), fanout.to_vec()));
            fanout.len().max(1)
        }

        async fn shutdown(&self) {
            *self.shut_down.lock().unwrap() = true;
        }
    }
}
