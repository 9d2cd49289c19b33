//! In-memory cluster: N `MembershipState`s wired through a FIFO queue and a
//! simulated clock. Broadcasts reach every running node, like a UDP
//! broadcast on one segment.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use cmm_protocol::types::CAP_MASTER_ELIGIBLE;
use cmm_protocol::{
    ClusterContext, ClusterEvent, DeliveredData, Inbound, MemberState, MembershipState, Message,
    NodeId, NodeInfo, Route, RuntimeConfig, RuntimeEffect, StopReason,
};

/// Clock resolution of the simulation.
pub const STEP_MS: u64 = 100;

pub struct SimNode {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub state: MembershipState,
    pub started: bool,
    pub crashed: bool,
    pub stopped: Option<StopReason>,
    pub events: Vec<ClusterEvent>,
    pub delivered: Vec<DeliveredData>,
}

impl SimNode {
    pub fn running(&self) -> bool {
        self.started && !self.crashed && self.stopped.is_none()
    }
}

pub struct SimNet {
    pub nodes: Vec<SimNode>,
    pub now: u64,
    queue: VecDeque<(usize, usize, Message)>,
    cut: BTreeSet<(usize, usize)>,
    /// `(from, to, label)` → frames still to drop.
    losses: BTreeMap<(usize, usize, &'static str), usize>,
    pub frames: usize,
}

pub fn info(id: i32, priority: u32) -> NodeInfo {
    NodeInfo::new(
        NodeId::new(id),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, id as u8), 7400),
    )
    .with_priority(priority)
    .with_capabilities(CAP_MASTER_ELIGIBLE)
}

impl SimNet {
    /// One node per `(id, priority)`, none started.
    pub fn new(cluster: &[(i32, u32)]) -> Self {
        Self::with_config(cluster, |_| {})
    }

    pub fn with_config(cluster: &[(i32, u32)], tweak: impl Fn(&mut RuntimeConfig)) -> Self {
        let nodes = cluster
            .iter()
            .map(|&(id, priority)| {
                let mut config = RuntimeConfig {
                    local: info(id, priority),
                    ..RuntimeConfig::default()
                };
                tweak(&mut config);
                let ctx = ClusterContext::new(NodeId::new(id), 2);
                SimNode {
                    id: NodeId::new(id),
                    addr: config.local.socket_addr(),
                    state: MembershipState::new(ctx, config),
                    started: false,
                    crashed: false,
                    stopped: None,
                    events: Vec::new(),
                    delivered: Vec::new(),
                }
            })
            .collect();
        Self {
            nodes,
            now: 0,
            queue: VecDeque::new(),
            cut: BTreeSet::new(),
            losses: BTreeMap::new(),
            frames: 0,
        }
    }

    pub fn index(&self, id: i32) -> usize {
        self.nodes
            .iter()
            .position(|n| n.id == NodeId::new(id))
            .unwrap_or_else(|| panic!("no node {id}"))
    }

    pub fn node(&self, id: i32) -> &SimNode {
        &self.nodes[self.index(id)]
    }

    pub fn node_mut(&mut self, id: i32) -> &mut SimNode {
        let i = self.index(id);
        &mut self.nodes[i]
    }

    pub fn start(&mut self, id: i32) {
        let i = self.index(id);
        self.nodes[i].started = true;
        let effects = self.nodes[i].state.start(self.now);
        self.apply(i, effects);
        self.drain();
    }

    pub fn start_all(&mut self) {
        let ids: Vec<i32> = self.nodes.iter().map(|n| n.id.get()).collect();
        for id in ids {
            self.start(id);
        }
    }

    /// Stop a node without it telling anyone.
    pub fn crash(&mut self, id: i32) {
        let i = self.index(id);
        self.nodes[i].crashed = true;
    }

    /// Drop everything between `a` and `b`, both directions.
    pub fn cut(&mut self, a: i32, b: i32) {
        let (a, b) = (self.index(a), self.index(b));
        self.cut.insert((a, b));
        self.cut.insert((b, a));
    }

    pub fn heal(&mut self) {
        self.cut.clear();
    }

    /// Drop the next `count` frames labelled `label` going from `from` to `to`.
    pub fn lose(&mut self, from: i32, to: i32, label: &'static str, count: usize) {
        let key = (self.index(from), self.index(to), label);
        self.losses.insert(key, count);
    }

    fn take_loss(&mut self, from: usize, to: usize, message: &Message) -> bool {
        match self.losses.get_mut(&(from, to, message.label())) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    /// Run a local operation's effects (leave, propose, send).
    pub fn run(&mut self, id: i32, effects: Vec<RuntimeEffect>) {
        let i = self.index(id);
        self.apply(i, effects);
        self.drain();
    }

    /// Hand `message` to `id` as if it came from `from_addr`.
    pub fn inject(&mut self, id: i32, from_addr: SocketAddr, mut message: Message) {
        let i = self.index(id);
        message.from_network = true;
        let inbound = Inbound {
            route: Route::current(from_addr),
            message,
        };
        let effects = self.nodes[i].state.handle_message(inbound, self.now);
        self.apply(i, effects);
        self.drain();
    }

    fn apply(&mut self, from: usize, effects: Vec<RuntimeEffect>) {
        for effect in effects {
            match effect {
                RuntimeEffect::SendTo { route, message }
                | RuntimeEffect::SendPinned { route, message, .. } => {
                    if let Some(to) = self.nodes.iter().position(|n| n.addr == route.address) {
                        self.queue.push_back((from, to, message));
                    }
                }
                RuntimeEffect::Broadcast { message, .. } => {
                    for to in 0..self.nodes.len() {
                        if to != from {
                            self.queue.push_back((from, to, message.clone()));
                        }
                    }
                }
                RuntimeEffect::Deliver(data) => self.nodes[from].delivered.push(data),
                RuntimeEffect::Emit(event) => self.nodes[from].events.push(event),
                RuntimeEffect::Shutdown(reason) => self.nodes[from].stopped = Some(reason),
            }
        }
    }

    /// Deliver queued frames until the network is quiet.
    pub fn drain(&mut self) {
        let mut budget = 100_000;
        while let Some((from, to, mut message)) = self.queue.pop_front() {
            budget -= 1;
            assert!(budget > 0, "message storm at t={}", self.now);
            // Frames already on the wire still arrive after a clean stop.
            if !self.nodes[to].running() || self.nodes[from].crashed || self.cut.contains(&(from, to)) {
                continue;
            }
            if self.take_loss(from, to, &message) {
                continue;
            }
            self.frames += 1;
            message.from_network = true;
            let inbound = Inbound {
                route: Route::current(self.nodes[from].addr),
                message,
            };
            let effects = self.nodes[to].state.handle_message(inbound, self.now);
            self.apply(to, effects);
        }
    }

    /// Advance the clock by `ms`, ticking every node each step.
    pub fn advance(&mut self, ms: u64) {
        let end = self.now + ms;
        while self.now < end {
            self.now = (self.now + STEP_MS).min(end);
            for i in 0..self.nodes.len() {
                if self.nodes[i].running() {
                    let effects = self.nodes[i].state.tick(self.now);
                    self.apply(i, effects);
                }
            }
            self.drain();
        }
    }

    /// Advance until `done` holds. Returns false on timeout.
    pub fn run_until(&mut self, max_ms: u64, done: impl Fn(&SimNet) -> bool) -> bool {
        let end = self.now + max_ms;
        while self.now < end {
            if done(self) {
                return true;
            }
            self.advance(STEP_MS);
        }
        done(self)
    }

    pub fn masters(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.running() && n.state.state() == MemberState::Master)
            .map(|n| n.id)
            .collect()
    }

    /// Exactly one master, and every other running node is its member.
    pub fn settled(&self) -> bool {
        let masters = self.masters();
        let &[master] = masters.as_slice() else {
            return false;
        };
        self.nodes.iter().filter(|n| n.running()).all(|n| {
            n.id == master
                || (n.state.state() == MemberState::Member && n.state.nodes().master() == Some(master))
        })
    }

    pub fn settle(&mut self) -> NodeId {
        assert!(
            self.run_until(120_000, SimNet::settled),
            "cluster did not settle: {:?}",
            self.nodes
                .iter()
                .map(|n| (n.id, n.state.state()))
                .collect::<Vec<_>>()
        );
        self.masters()[0]
    }

    pub fn events(&self, id: i32) -> &[ClusterEvent] {
        &self.node(id).events
    }
}
