use std::net::SocketAddr;

use serde::Serialize;

use crate::frames::NodeInfo;
use crate::message::Message;
use crate::node_table::NodeRef;

use super::{ClusterEvent, DeliveredData, StopReason};

/// Which codec a peer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Wire {
    Current,
    /// Frozen 3-byte-header format.
    Legacy,
}

/// Where a frame goes: an address and the codec to use there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub address: SocketAddr,
    pub wire: Wire,
}

impl Route {
    pub fn new(address: SocketAddr, wire: Wire) -> Self {
        Self { address, wire }
    }

    pub fn current(address: SocketAddr) -> Self {
        Self::new(address, Wire::Current)
    }

    /// The advertised address of `info`, in the format it speaks.
    pub fn for_info(info: &NodeInfo) -> Self {
        let wire = if info.speaks_legacy() {
            Wire::Legacy
        } else {
            Wire::Current
        };
        Self::new(info.socket_addr(), wire)
    }
}

/// A frame received from the network, tagged with the channel it came on.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub route: Route,
    pub message: Message,
}

/// Intention produced by the pure logic of `MembershipState`.
///
/// Every `handle_*` / `tick` method returns `Vec<RuntimeEffect>`; the loop
/// executes them through the transport and channels.
#[derive(Debug)]
pub enum RuntimeEffect {
    /// Send one frame to one peer.
    SendTo { route: Route, message: Message },

    /// Send one frame to a member held in the node table until the write
    /// is done.
    SendPinned {
        route: Route,
        message: Message,
        pin: NodeRef,
    },

    /// Send one frame to many peers (UDP broadcast when configured).
    Broadcast { message: Message, fanout: Vec<Route> },

    /// Hand an application payload up.
    Deliver(DeliveredData),

    /// Publish a membership event.
    Emit(ClusterEvent),

    /// Stop the runtime after the preceding effects.
    Shutdown(StopReason),
}
