//! Effect executor: the only place that touches I/O.
//!
//! - SendTo -> transport.send()
//! - SendPinned -> transport.send(), then the pin is released
//! - Broadcast -> transport.broadcast() for current-format nodes, one send
//!   per legacy route
//! - Deliver -> data_tx
//! - Emit -> event_tx
//! - Shutdown -> returned to the loop

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::error::ProtocolError;
use crate::message::Message;

use super::effect::{Route, RuntimeEffect, Wire};
use super::transport::Transport;
use super::{ClusterEvent, DeliveredData, StopReason};

/// Execute a list of effects. Returns the stop reason if one of them asked
/// the runtime to stop; effects after it are still executed.
pub(super) async fn execute_effects<T: Transport>(
    effects: Vec<RuntimeEffect>,
    transport: &T,
    event_tx: &mpsc::Sender<ClusterEvent>,
    data_tx: &mpsc::Sender<DeliveredData>,
) -> Option<StopReason> {
    let mut stop = None;
    for effect in effects {
        match effect {
            RuntimeEffect::SendTo { route, message } => {
                send(transport, route, &message, event_tx).await;
            }
            RuntimeEffect::SendPinned { route, message, pin } => {
                send(transport, route, &message, event_tx).await;
                drop(pin);
            }
            RuntimeEffect::Broadcast { message, fanout } => {
                broadcast(transport, &message, fanout, event_tx).await;
            }
            RuntimeEffect::Deliver(data) => {
                // try_send: never block the loop on a slow consumer
                if data_tx.try_send(data).is_err() {
                    tracing::warn!("data channel full, dropping delivery");
                }
            }
            RuntimeEffect::Emit(event) => {
                let _ = event_tx.try_send(event);
            }
            RuntimeEffect::Shutdown(reason) => {
                stop.get_or_insert(reason);
            }
        }
    }
    stop
}

async fn send<T: Transport>(
    transport: &T,
    route: Route,
    message: &Message,
    event_tx: &mpsc::Sender<ClusterEvent>,
) {
    match transport.send(route, message).await {
        Ok(()) => {}
        Err(ProtocolError::NoLegacyEquivalent { frame }) => {
            tracing::debug!(to = %route.address, "{frame} not sent to legacy node");
        }
        Err(e) => {
            // Retransmission covers frames that want an Ack.
            tracing::warn!(to = %route.address, frame_id = message.frame_id, "{} send failed: {e}", message.label());
            let _ = event_tx.try_send(ClusterEvent::Error {
                description: format!("send {} to {}: {e}", message.label(), route.address),
            });
        }
    }
}

async fn broadcast<T: Transport>(
    transport: &T,
    message: &Message,
    fanout: Vec<Route>,
    event_tx: &mpsc::Sender<ClusterEvent>,
) {
    let (current, legacy): (Vec<Route>, Vec<Route>) =
        fanout.into_iter().partition(|route| route.wire == Wire::Current);

    let addresses: Vec<SocketAddr> = current.iter().map(|route| route.address).collect();
    let delivered = transport.broadcast(message, &addresses).await;
    tracing::trace!(delivered, fanout = addresses.len(), "broadcast {}", message.label());

    for route in legacy {
        send(transport, route, message, event_tx).await;
    }
}
