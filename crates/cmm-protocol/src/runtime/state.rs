use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::Serialize;

use crate::context::ClusterContext;
use crate::frames::*;
use crate::legacy::LegacyFrame;
use crate::membership::{
    Candidate, CommitOutcome, ConfigEntries, ConfigStore, DedupCache, DedupCheck, ElectionRound,
    HeartbeatTracker, LivenessEvent, Outstanding, RetransmitQueue, StageOutcome,
};
use crate::message::Message;
use crate::node_table::{NodeTable, RemovalCause, RemoveOutcome, Resource};
use crate::payload::Payload;
use crate::error::ProtocolError;
use crate::types::{NodeId, CAP_LEGACY_WIRE, CAP_MASTER_ELIGIBLE};

use super::effect::{Inbound, Route, RuntimeEffect, Wire};
use super::{ClusterEvent, DeliveredData, RuntimeConfig, StopReason};

/// Where this node stands in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    /// Probing seeds and the broadcast domain for a master.
    Discovering,
    /// Connect sent, waiting for the ConnectResponse.
    Connecting,
    /// Collecting candidacies.
    Electing,
    /// Lost the election; waiting for the winner to announce itself.
    AwaitingMaster,
    /// Registered with a master and heartbeating.
    Member,
    Master,
    /// Disconnect sent, waiting for the master's Ack.
    Leaving,
    Left,
    /// Gave up after losing the master.
    Failed,
}

impl MemberState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MemberState::Left | MemberState::Failed)
    }

    fn seeks_master(self) -> bool {
        matches!(
            self,
            MemberState::Discovering | MemberState::Electing | MemberState::AwaitingMaster
        )
    }
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// A config proposal waiting for member acks.
#[derive(Debug)]
struct Proposal {
    waiting: BTreeSet<NodeId>,
}

/// Complete membership protocol state. Pure logic: no async, no network.
///
/// Every `handle_*` / `tick` method returns `Vec<RuntimeEffect>`. Time is
/// always passed in (Unix ms), so tests drive it with a simulated clock.
pub struct MembershipState {
    ctx: ClusterContext,
    config: RuntimeConfig,
    state: MemberState,
    epoch: u64,

    heartbeats: HeartbeatTracker,
    retransmit: RetransmitQueue,
    dedup: DedupCache,
    store: ConfigStore,
    election: Option<ElectionRound>,
    proposals: BTreeMap<u64, Proposal>,

    /// Every node we have heard describe itself, member or not.
    directory: BTreeMap<NodeId, NodeInfo>,
    connect_target: Option<Route>,
    /// Deadline of the current phase (discovery window, connect, awaiting).
    phase_deadline: Option<u64>,
    next_probe_at: u64,
    next_heartbeat_at: u64,
    next_purge_at: u64,
    master_lost_at: Option<u64>,

    interval: u64,
    timeout: u64,
}

impl MembershipState {
    pub fn new(ctx: ClusterContext, config: RuntimeConfig) -> Self {
        let timeout = ms(config.heartbeat_timeout);
        Self {
            heartbeats: HeartbeatTracker::with_timeout(timeout),
            retransmit: RetransmitQueue::new(config.max_sends),
            dedup: DedupCache::new(config.dedup_capacity, timeout),
            store: ConfigStore::new(),
            election: None,
            proposals: BTreeMap::new(),
            directory: BTreeMap::new(),
            connect_target: None,
            phase_deadline: None,
            next_probe_at: 0,
            next_heartbeat_at: 0,
            next_purge_at: 0,
            master_lost_at: None,
            state: MemberState::Discovering,
            epoch: 0,
            interval: ms(config.heartbeat_interval),
            timeout,
            ctx,
            config,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn local_id(&self) -> NodeId {
        self.ctx.local_id
    }

    pub fn local_info(&self) -> NodeInfo {
        self.config.local
    }

    pub fn state(&self) -> MemberState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.ctx.nodes
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn directory(&self) -> impl Iterator<Item = &NodeInfo> {
        self.directory.values()
    }

    pub fn pending_frames(&self) -> usize {
        self.retransmit.len()
    }

    fn master(&self) -> Option<NodeId> {
        self.ctx.nodes.master()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Enter the cluster: register ourselves locally and start discovery.
    pub fn start(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let local = self.config.local;
        self.ctx.nodes.add_node(local, now);
        self.next_purge_at = now + self.timeout;
        tracing::info!(node = %local.node, addr = %local.socket_addr(), "joining cluster");

        let mut effects = Vec::new();
        self.restart_discovery(now, &mut effects);
        effects
    }

    /// Leave cleanly: tell the master (or, as master, every member).
    pub fn leave(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        match self.state {
            MemberState::Master => {
                let disconnect = Disconnect { node: self.local_id() };
                for (node, route) in self.member_routes() {
                    let message = self.message(node, disconnect.clone());
                    self.push_send(route, message, &mut effects);
                }
                self.finish(StopReason::Left, &mut effects);
            }
            MemberState::Member => match self.master_route() {
                Some((master, route)) => {
                    self.send(route, master, Disconnect { node: self.local_id() }, now, &mut effects);
                    self.set_state(MemberState::Leaving, &mut effects);
                    self.phase_deadline = Some(now + self.interval);
                }
                None => self.finish(StopReason::Left, &mut effects),
            },
            MemberState::Leaving | MemberState::Left | MemberState::Failed => {}
            _ => self.finish(StopReason::Left, &mut effects),
        }
        effects
    }

    /// Register a resource with the master on behalf of this node.
    pub fn register_resource(
        &mut self,
        kind: ResourceKind,
        name: String,
        now: u64,
    ) -> Result<Vec<RuntimeEffect>, ProtocolError> {
        let mut effects = Vec::new();
        match self.state {
            MemberState::Master => {
                let resource = Resource::new(kind, name);
                if self.ctx.nodes.register_resource(self.local_id(), resource.clone()) {
                    effects.push(RuntimeEffect::Emit(ClusterEvent::ResourceRegistered {
                        node: self.local_id(),
                        resource,
                    }));
                } else {
                    effects.push(RuntimeEffect::Emit(ClusterEvent::ResourceRejected { resource }));
                }
                Ok(effects)
            }
            MemberState::Member => {
                let (master, route) = self.master_route().ok_or(ProtocolError::NotMaster {
                    master: NodeId::UNKNOWN,
                })?;
                self.send(route, master, Register { kind, name }, now, &mut effects);
                Ok(effects)
            }
            _ => Err(ProtocolError::NotMaster {
                master: self.master().unwrap_or(NodeId::UNKNOWN),
            }),
        }
    }

    /// Start a two-phase config change. Master only.
    ///
    /// Returns the proposed version. It becomes current once every member
    /// has acknowledged the update (or dropped out).
    pub fn propose_config(
        &mut self,
        changes: ConfigEntries,
        now: u64,
    ) -> Result<(u64, Vec<RuntimeEffect>), ProtocolError> {
        if self.state != MemberState::Master {
            return Err(ProtocolError::NotMaster {
                master: self.master().unwrap_or(NodeId::UNKNOWN),
            });
        }

        let (version, entries) = self.store.propose(&changes);
        self.store.stage(version, entries.clone());
        tracing::info!(version, keys = entries.len(), "proposing config");

        let mut effects = Vec::new();
        let members = self.member_routes();
        if members.is_empty() {
            self.commit_proposal(version, now, &mut effects);
            return Ok((version, effects));
        }

        let update = ConfigUpdate { version, entries };
        let mut waiting = BTreeSet::new();
        for (node, route) in members {
            if route.wire == Wire::Legacy {
                continue;
            }
            waiting.insert(node);
            self.send(route, node, update.clone(), now, &mut effects);
        }
        if waiting.is_empty() {
            self.commit_proposal(version, now, &mut effects);
        } else {
            self.proposals.insert(version, Proposal { waiting });
        }
        Ok((version, effects))
    }

    /// Send application data to one node, or to every member with
    /// `NodeId::BROADCAST`.
    pub fn send_data(
        &mut self,
        to: NodeId,
        topic: u16,
        body: Vec<u8>,
        _now: u64,
    ) -> Result<Vec<RuntimeEffect>, ProtocolError> {
        let data = Data { topic, body };
        let mut effects = Vec::new();
        if to.is_broadcast() {
            let fanout: Vec<Route> = self.member_routes().into_iter().map(|(_, r)| r).collect();
            let message = self.message(NodeId::BROADCAST, data);
            effects.push(RuntimeEffect::Broadcast { message, fanout });
            return Ok(effects);
        }
        let route = self
            .route_for(to)
            .filter(|_| self.ctx.nodes.is_alive(to))
            .ok_or(ProtocolError::UnknownNode { node: to })?;
        let pin = self
            .ctx
            .nodes
            .pin(to)
            .ok_or(ProtocolError::UnknownNode { node: to })?;
        let message = self.message(to, data);
        if !self.skips_legacy(route, &message) {
            effects.push(RuntimeEffect::SendPinned { route, message, pin });
        }
        Ok(effects)
    }

    // ── Incoming frames ──────────────────────────────────────────────────

    /// Process one frame from the network.
    pub fn handle_message(&mut self, inbound: Inbound, now: u64) -> Vec<RuntimeEffect> {
        let Inbound { route, message: msg } = inbound;
        let mut effects = Vec::new();
        if self.state.is_terminal() || msg.source == self.local_id() {
            return effects;
        }
        tracing::debug!(frame_id = msg.frame_id, source = %msg.source, "handling {}", msg.label());

        self.note_alive(msg.source, now);

        let is_request = msg.payload.wants_ack() || matches!(msg.payload, Payload::Connect(_));
        if is_request && route.wire == Wire::Current {
            match self.dedup.check_at(&msg, now) {
                DedupCheck::Fresh => {}
                DedupCheck::Duplicate(Some(response)) => {
                    tracing::debug!(frame_id = msg.frame_id, source = %msg.source, "duplicate, replaying response");
                    self.push_send(route, response, &mut effects);
                    return effects;
                }
                DedupCheck::Duplicate(None) => return effects,
            }
        }

        match msg.payload.clone() {
            Payload::Heartbeat(hb) => self.on_heartbeat(&msg, hb, route, now, &mut effects),
            Payload::Ack(ack) => self.on_ack(&msg, ack, now, &mut effects),
            Payload::Discovery(d) => self.on_discovery(&msg, d, route, now, &mut effects),
            Payload::NodeInfoReply(r) => self.on_node_info(r, route, now, &mut effects),
            Payload::Election(e) => self.on_election(&msg, e, route, now, &mut effects),
            Payload::Notification(n) => self.on_notification(n, route, now, &mut effects),
            Payload::Register(r) => self.on_register(&msg, r, route, &mut effects),
            Payload::Connect(c) => self.on_connect(&msg, c, route, now, &mut effects),
            Payload::ConnectResponse(r) => self.on_connect_response(r, route, now, &mut effects),
            Payload::Disconnect(d) => self.on_disconnect(&msg, d, route, now, &mut effects),
            Payload::ConfigUpdate(u) => self.on_config_update(&msg, u, route, &mut effects),
            Payload::ConfigCommit(c) => self.on_config_commit(&msg, c, route, &mut effects),
            Payload::Data(d) => effects.push(RuntimeEffect::Deliver(DeliveredData {
                from: msg.source,
                topic: d.topic,
                body: d.body,
            })),
        }
        effects
    }

    fn note_alive(&mut self, source: NodeId, now: u64) {
        let watched = match self.state {
            MemberState::Master => self.heartbeats.is_tracked(source),
            MemberState::Member | MemberState::Leaving => self.master() == Some(source),
            _ => false,
        };
        if watched {
            self.heartbeats.record_heartbeat_at(source, now);
        }
    }

    fn on_heartbeat(
        &mut self,
        msg: &Message,
        hb: Heartbeat,
        route: Route,
        now: u64,
        effects: &mut Vec<RuntimeEffect>,
    ) {
        // From a legacy member this is liveness only, already recorded.
        if route.wire == Wire::Legacy && self.state == MemberState::Master {
            return;
        }
        // Legacy heartbeats carry no master field and epoch 0.
        let claimed = if hb.master.is_node() { hb.master } else { msg.source };
        let mut status = self.on_master_claim(claimed, hb.epoch, route, now, effects);
        // Behind on config: the master resends it when it sees NotStaged.
        if status == AckStatus::Ok
            && self.state == MemberState::Member
            && hb.config_version > self.store.version()
        {
            tracing::info!(ours = self.store.version(), theirs = hb.config_version, "config behind the master");
            status = AckStatus::NotStaged;
        }
        self.reply(msg, route, Ack { status }, effects);
    }

    /// Someone says `claimed` is master at `epoch`. Returns how to answer.
    fn on_master_claim(
        &mut self,
        claimed: NodeId,
        epoch: u64,
        route: Route,
        now: u64,
        effects: &mut Vec<RuntimeEffect>,
    ) -> AckStatus {
        let unspecified = epoch == 0;
        match self.state {
            MemberState::Master if claimed != self.local_id() => {
                let priority = self.priority_of(claimed);
                let theirs = (epoch, Candidate::new(claimed, priority));
                let mine = (self.epoch, Candidate::new(self.local_id(), self.config.local.priority));
                if !unspecified && theirs > mine {
                    tracing::warn!(other = %claimed, epoch, "stepping down for a better master");
                    self.ctx.nodes.set_master(None);
                    effects.push(RuntimeEffect::Emit(ClusterEvent::MasterChanged {
                        master: None,
                        epoch: self.epoch,
                    }));
                    self.heartbeats = HeartbeatTracker::with_timeout(self.timeout);
                    let target = self.route_for(claimed).unwrap_or(route);
                    self.connect_to(target, now, effects);
                    AckStatus::Ok
                } else {
                    // Make the other side hear the better claim.
                    let heartbeat = self.heartbeat_payload();
                    self.send(route, claimed, heartbeat, now, effects);
                    AckStatus::Rejected
                }
            }
            MemberState::Member | MemberState::Leaving => {
                if self.master() == Some(claimed) {
                    if !unspecified && epoch > self.epoch {
                        self.epoch = epoch;
                    }
                    AckStatus::Ok
                } else if !unspecified && epoch > self.epoch && self.state == MemberState::Member {
                    tracing::info!(master = %claimed, epoch, "newer master, reconnecting");
                    let target = self.route_for(claimed).unwrap_or(route);
                    self.connect_to(target, now, effects);
                    AckStatus::Ok
                } else {
                    AckStatus::Rejected
                }
            }
            state if state.seeks_master() => {
                let target = self.route_for(claimed).unwrap_or(route);
                self.connect_to(target, now, effects);
                AckStatus::Ok
            }
            _ => AckStatus::Ok,
        }
    }

    fn on_ack(&mut self, msg: &Message, ack: Ack, now: u64, effects: &mut Vec<RuntimeEffect>) {
        let Some(frame_id) = msg.answers() else {
            return;
        };
        let Some(outstanding) = self.retransmit.acknowledge(frame_id) else {
            return;
        };
        match outstanding.message.payload {
            Payload::ConfigUpdate(update) => {
                self.proposal_dropped(update.version, outstanding.target, now, effects);
            }
            Payload::ConfigCommit(_) | Payload::Heartbeat(_)
                if ack.status == AckStatus::NotStaged && self.state == MemberState::Master =>
            {
                self.catch_up(outstanding.target, outstanding.route, now, effects);
            }
            Payload::Disconnect(_) if self.state == MemberState::Leaving => {
                self.finish(StopReason::Left, effects);
            }
            Payload::Register(register) => {
                let resource = Resource::new(register.kind, register.name);
                let event = match ack.status {
                    AckStatus::Ok | AckStatus::Duplicate => ClusterEvent::ResourceRegistered {
                        node: self.local_id(),
                        resource,
                    },
                    _ => ClusterEvent::ResourceRejected { resource },
                };
                effects.push(RuntimeEffect::Emit(event));
            }
            _ => {}
        }
    }

    fn on_discovery(&mut self, msg: &Message, d: Discovery, route: Route, now: u64, effects: &mut Vec<RuntimeEffect>) {
        let info = tag_wire(d.info, route);
        if !info.node.is_node() || info.node == self.local_id() {
            tracing::warn!(node = %info.node, "discovery with invalid node id");
            return;
        }
        self.directory.insert(info.node, info);

        let reply = NodeInfoReply {
            info: self.config.local,
            master: self.master().unwrap_or(NodeId::UNKNOWN),
            epoch: self.epoch,
        };
        // Answer on the advertised address: a broadcast arrives from the UDP socket.
        self.reply(msg, Route::for_info(&info), reply, effects);

        if self.state == MemberState::Master && Route::for_info(&info).wire == Wire::Legacy {
            self.admit(info, now, effects);
        }
    }

    fn on_node_info(&mut self, mut r: NodeInfoReply, route: Route, now: u64, effects: &mut Vec<RuntimeEffect>) {
        if !r.info.node.is_node() || r.info.node == self.local_id() {
            return;
        }
        r.info = tag_wire(r.info, route);
        self.directory.insert(r.info.node, r.info);

        // A legacy peer announces itself with NodeInfo instead of Connect.
        if route.wire == Wire::Legacy && self.state == MemberState::Master {
            self.admit(r.info, now, effects);
            return;
        }

        if self.state.seeks_master() && r.master.is_node() && r.master != self.local_id() {
            // A reply naming the master we are replacing is stale.
            let floor = self.election.as_ref().map_or(self.epoch, ElectionRound::epoch);
            if r.epoch != 0 && r.epoch < floor {
                return;
            }
            let target = self
                .route_for(r.master)
                .unwrap_or_else(|| Route::for_info(&r.info));
            self.connect_to(target, now, effects);
        }
    }

    fn on_election(&mut self, msg: &Message, e: Election, route: Route, now: u64, effects: &mut Vec<RuntimeEffect>) {
        match self.state {
            MemberState::Master | MemberState::Member => {
                // Point the candidate at the master we already have.
                let reply = NodeInfoReply {
                    info: self.config.local,
                    master: self.master().unwrap_or(NodeId::UNKNOWN),
                    epoch: self.epoch,
                };
                let target = self.route_for(msg.source).unwrap_or(route);
                self.reply(msg, target, reply, effects);
            }
            MemberState::Discovering | MemberState::Electing => {
                self.begin_election(now, effects);
                if let Some(round) = self.election.as_mut() {
                    round.raise_epoch(e.epoch);
                    if round.offer(Candidate::new(e.candidate, e.priority)) {
                        tracing::debug!(candidate = %e.candidate, priority = e.priority, epoch = e.epoch, "candidate");
                    }
                }
            }
            _ => {}
        }
    }

    fn on_notification(&mut self, n: Notification, route: Route, now: u64, effects: &mut Vec<RuntimeEffect>) {
        if n.epoch != 0 && n.epoch < self.epoch {
            tracing::debug!(node = %n.node, epoch = n.epoch, "stale notification");
            return;
        }
        match n.change {
            NodeChange::Joined => {
                if n.node == self.local_id() || !n.node.is_node() {
                    return;
                }
                let info = self.directory.get(&n.node).copied().unwrap_or(NodeInfo {
                    node: n.node,
                    ..NodeInfo::default()
                });
                if self.ctx.nodes.add_node(info, now) {
                    effects.push(RuntimeEffect::Emit(ClusterEvent::NodeJoined { node: n.node }));
                }
            }
            NodeChange::Left | NodeChange::Failed => {
                let cause = if n.change == NodeChange::Left {
                    RemovalCause::Left
                } else {
                    RemovalCause::Failed
                };
                if n.node == self.local_id() {
                    // The master gave up on us; register again.
                    if self.state == MemberState::Member {
                        if let Some((_, master_route)) = self.master_route() {
                            self.connect_to(master_route, now, effects);
                        }
                    }
                    return;
                }
                if self.master() == Some(n.node) && self.state == MemberState::Member {
                    self.master_lost(now, cause, effects);
                } else {
                    self.remove_member(n.node, cause, now, effects);
                }
            }
            NodeChange::MasterElected => {
                if n.node == self.local_id() {
                    return;
                }
                self.on_master_claim(n.node, n.epoch, route, now, effects);
            }
        }
    }

    fn on_register(&mut self, msg: &Message, r: Register, route: Route, effects: &mut Vec<RuntimeEffect>) {
        if self.state != MemberState::Master {
            self.reply(msg, route, Ack { status: AckStatus::Rejected }, effects);
            return;
        }
        let name = if r.name.is_empty() {
            format!("legacy-{}", msg.source)
        } else {
            r.name
        };
        let resource = Resource::new(r.kind, name);
        let status = if self.ctx.nodes.register_resource(msg.source, resource.clone()) {
            tracing::info!(node = %msg.source, ?resource, "resource registered");
            effects.push(RuntimeEffect::Emit(ClusterEvent::ResourceRegistered {
                node: msg.source,
                resource,
            }));
            AckStatus::Ok
        } else if self.ctx.nodes.resource_owner(&resource) == Some(msg.source) {
            AckStatus::Duplicate
        } else {
            AckStatus::Rejected
        };
        self.reply(msg, route, Ack { status }, effects);
    }

    fn on_connect(&mut self, msg: &Message, c: Connect, route: Route, now: u64, effects: &mut Vec<RuntimeEffect>) {
        let info = c.info;
        let valid = info.node.is_node() && info.node == msg.source && info.node != self.local_id();

        if !valid || self.state != MemberState::Master {
            if !valid {
                tracing::warn!(node = %info.node, source = %msg.source, "rejecting connect");
            }
            let master = if valid { self.master() } else { None };
            let members = master
                .and_then(|m| {
                    self.ctx
                        .nodes
                        .node(m)
                        .map(|n| n.info)
                        .or_else(|| self.directory.get(&m).copied())
                })
                .into_iter()
                .collect();
            let response = ConnectResponse {
                accepted: false,
                master: master.unwrap_or(NodeId::UNKNOWN),
                epoch: self.epoch,
                config_version: self.store.version(),
                members,
            };
            self.reply(msg, route, response, effects);
            return;
        }

        self.admit(info, now, effects);
        let members = self.ctx.nodes.alive_nodes().into_iter().map(|n| n.info).collect();
        let response = ConnectResponse {
            accepted: true,
            master: self.local_id(),
            epoch: self.epoch,
            config_version: self.store.version(),
            members,
        };
        self.reply(msg, route, response, effects);

        self.catch_up(info.node, route, now, effects);
    }

    fn on_connect_response(&mut self, r: ConnectResponse, route: Route, now: u64, effects: &mut Vec<RuntimeEffect>) {
        if self.state != MemberState::Connecting {
            return;
        }
        if r.accepted && r.master.is_node() {
            for info in &r.members {
                if info.node.is_node() && info.node != self.local_id() {
                    self.directory.insert(info.node, *info);
                    self.ctx.nodes.add_node(*info, now);
                }
            }
            self.adopt_master(r.master, r.epoch, now, effects);
            self.set_state(MemberState::Member, effects);
            tracing::info!(master = %r.master, epoch = r.epoch, members = r.members.len(), "joined cluster");
            return;
        }

        // Redirect to the master the other side knows about.
        let redirect = r
            .members
            .iter()
            .find(|info| info.node == r.master && r.master.is_node())
            .map(Route::for_info)
            .filter(|target| *target != route);
        match redirect {
            Some(target) => self.connect_to(target, now, effects),
            None => self.restart_discovery(now, effects),
        }
    }

    fn on_disconnect(&mut self, msg: &Message, d: Disconnect, route: Route, now: u64, effects: &mut Vec<RuntimeEffect>) {
        let node = if d.node.is_node() { d.node } else { msg.source };
        self.reply(msg, route, Ack::default(), effects);
        match self.state {
            MemberState::Master => {
                self.remove_member(node, RemovalCause::Left, now, effects);
                self.announce(Notification {
                    node,
                    change: NodeChange::Left,
                    epoch: self.epoch,
                }, effects);
            }
            MemberState::Member if self.master() == Some(node) => {
                self.master_lost(now, RemovalCause::Left, effects);
            }
            _ => self.remove_member(node, RemovalCause::Left, now, effects),
        }
    }

    fn on_config_update(&mut self, msg: &Message, u: ConfigUpdate, route: Route, effects: &mut Vec<RuntimeEffect>) {
        if self.master() != Some(msg.source) {
            self.reply(msg, route, Ack { status: AckStatus::Rejected }, effects);
            return;
        }
        let status = match self.store.stage(u.version, u.entries) {
            StageOutcome::Staged | StageOutcome::AlreadyStaged => AckStatus::Ok,
            StageOutcome::AlreadyApplied => AckStatus::Duplicate,
        };
        self.reply(msg, route, Ack { status }, effects);
    }

    fn on_config_commit(&mut self, msg: &Message, c: ConfigCommit, route: Route, effects: &mut Vec<RuntimeEffect>) {
        if self.master() != Some(msg.source) {
            self.reply(msg, route, Ack { status: AckStatus::Rejected }, effects);
            return;
        }
        let status = match self.store.commit(c.version) {
            CommitOutcome::Applied { version } => {
                tracing::info!(version, "config committed");
                effects.push(RuntimeEffect::Emit(ClusterEvent::ConfigApplied { version }));
                AckStatus::Ok
            }
            CommitOutcome::AlreadyApplied => AckStatus::Duplicate,
            CommitOutcome::NotStaged => AckStatus::NotStaged,
        };
        self.reply(msg, route, Ack { status }, effects);
    }

    // ── Tick ─────────────────────────────────────────────────────────────

    /// Advance timers: retransmits, liveness, heartbeats, phase deadlines.
    pub fn tick(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        if self.state.is_terminal() {
            return effects;
        }

        let sweep = self.retransmit.sweep(now);
        for (route, message) in sweep.resend {
            tracing::debug!(frame_id = message.frame_id, sent = message.sent_count(), "retransmitting {}", message.label());
            self.push_send(route, message, &mut effects);
        }
        for outstanding in sweep.abandoned {
            self.on_abandoned(outstanding, now, &mut effects);
        }

        for event in self.heartbeats.check_at(now) {
            match event {
                LivenessEvent::Failed(node) => match self.state {
                    MemberState::Master => self.fail_member(node, now, &mut effects),
                    MemberState::Member if self.master() == Some(node) => {
                        self.master_lost(now, RemovalCause::Failed, &mut effects);
                    }
                    _ => {}
                },
                LivenessEvent::Stale(node) => tracing::debug!(node = %node, "heartbeat stale"),
                LivenessEvent::Recovered(node) => tracing::debug!(node = %node, "heartbeat recovered"),
            }
        }

        if self.state == MemberState::Master && now >= self.next_heartbeat_at {
            self.heartbeat_members(now, &mut effects);
            self.next_heartbeat_at = now + self.interval;
        }

        self.tick_phase(now, &mut effects);

        if let Some(lost_at) = self.master_lost_at {
            let settled = matches!(self.state, MemberState::Member | MemberState::Master);
            if !settled && !self.state.is_terminal() && now >= lost_at + self.timeout {
                tracing::error!(node = %self.local_id(), "no master since {lost_at}, shutting down");
                self.finish(StopReason::MasterLost, &mut effects);
            }
        }

        if now >= self.next_purge_at {
            self.dedup.purge_expired(now);
            self.next_purge_at = now + self.timeout;
        }
        effects
    }

    fn tick_phase(&mut self, now: u64, effects: &mut Vec<RuntimeEffect>) {
        let deadline_passed = self.phase_deadline.is_some_and(|d| now >= d);
        match self.state {
            MemberState::Discovering => {
                if deadline_passed {
                    tracing::info!(known = self.directory.len(), "discovery window closed without a master");
                    self.phase_deadline = None;
                    self.begin_election(now, effects);
                } else if now >= self.next_probe_at {
                    self.probe(now, effects);
                }
            }
            MemberState::Electing => {
                if self.election.as_ref().is_some_and(|round| round.is_due(now)) {
                    self.conclude_election(now, effects);
                }
            }
            MemberState::Connecting => {
                if deadline_passed {
                    tracing::info!(target = ?self.connect_target, "connect timed out");
                    self.restart_discovery(now, effects);
                }
            }
            MemberState::AwaitingMaster => {
                if deadline_passed {
                    tracing::warn!("elected master never showed up");
                    self.phase_deadline = None;
                    self.begin_election(now, effects);
                }
            }
            MemberState::Leaving => {
                if deadline_passed {
                    self.finish(StopReason::Left, effects);
                }
            }
            _ => {}
        }
    }

    /// Earliest time `tick` has work to do.
    pub fn next_wakeup(&self, now: u64) -> u64 {
        let mut next = now + self.interval;
        let mut consider = |t: Option<u64>| {
            if let Some(t) = t {
                next = next.min(t);
            }
        };
        consider(self.retransmit.next_deadline());
        consider(self.heartbeats.next_deadline());
        consider(self.phase_deadline);
        consider(Some(self.next_purge_at));
        consider(self.election.as_ref().map(ElectionRound::deadline));
        consider(self.master_lost_at.map(|t| t + self.timeout));
        match self.state {
            MemberState::Master => consider(Some(self.next_heartbeat_at)),
            MemberState::Discovering => consider(Some(self.next_probe_at)),
            _ => {}
        }
        next.max(now)
    }

    // ── Transitions ──────────────────────────────────────────────────────

    fn set_state(&mut self, next: MemberState, effects: &mut Vec<RuntimeEffect>) {
        if self.state == next {
            return;
        }
        tracing::info!(node = %self.local_id(), from = ?self.state, to = ?next, "state change");
        effects.push(RuntimeEffect::Emit(ClusterEvent::StateChanged {
            from: self.state,
            to: next,
        }));
        self.state = next;
    }

    fn restart_discovery(&mut self, now: u64, effects: &mut Vec<RuntimeEffect>) {
        self.connect_target = None;
        self.election = None;
        self.set_state(MemberState::Discovering, effects);
        self.phase_deadline = Some(now + ms(self.config.discovery_window));
        self.probe(now, effects);
    }

    /// Broadcast Discovery and send it to every seed with a PEER destination.
    fn probe(&mut self, now: u64, effects: &mut Vec<RuntimeEffect>) {
        self.next_probe_at = now + self.interval;
        let discovery = Discovery { info: self.config.local };

        let fanout = self.directory_routes();
        let message = self.message(NodeId::BROADCAST, discovery.clone());
        effects.push(RuntimeEffect::Broadcast { message, fanout });

        for seed in self.config.seeds.clone() {
            let message = self.message(NodeId::PEER, discovery.clone());
            self.push_send(Route::current(seed), message, effects);
        }
    }

    fn connect_to(&mut self, route: Route, now: u64, effects: &mut Vec<RuntimeEffect>) {
        if self.state == MemberState::Connecting && self.connect_target == Some(route) {
            return;
        }
        tracing::info!(target = %route.address, "connecting");
        self.connect_target = Some(route);
        self.election = None;
        self.phase_deadline = Some(now + ms(self.config.election_window));
        self.set_state(MemberState::Connecting, effects);
        let message = self.message(NodeId::PEER, Connect { info: self.config.local });
        self.push_send(route, message, effects);
    }

    fn begin_election(&mut self, now: u64, effects: &mut Vec<RuntimeEffect>) {
        if self.election.is_some() {
            return;
        }
        let mut round = ElectionRound::new(self.epoch + 1, now, ms(self.config.election_window));
        let local = self.config.local;
        let eligible = local.has_capability(CAP_MASTER_ELIGIBLE);
        if eligible {
            round.offer(Candidate::new(local.node, local.priority));
        }
        let epoch = round.epoch();
        self.election = Some(round);
        self.phase_deadline = None;
        self.set_state(MemberState::Electing, effects);
        effects.push(RuntimeEffect::Emit(ClusterEvent::ElectionStarted { epoch }));
        tracing::info!(epoch, eligible, "election started");

        if eligible {
            let election = Election {
                candidate: local.node,
                priority: local.priority,
                epoch,
            };
            let fanout = self.directory_routes();
            let message = self.message(NodeId::BROADCAST, election.clone());
            effects.push(RuntimeEffect::Broadcast { message, fanout });
            for seed in self.config.seeds.clone() {
                let message = self.message(NodeId::PEER, election.clone());
                self.push_send(Route::current(seed), message, effects);
            }
        }
    }

    fn conclude_election(&mut self, now: u64, effects: &mut Vec<RuntimeEffect>) {
        let Some(round) = self.election.take() else {
            return;
        };
        let result = round.conclude();
        tracing::info!(winner = ?result.winner, reason = ?result.reason, candidates = result.candidate_count, "election concluded");
        match result.winner {
            Some(winner) if winner == self.local_id() => self.become_master(round.epoch(), now, effects),
            Some(winner) => {
                self.epoch = self.epoch.max(round.epoch());
                self.set_state(MemberState::AwaitingMaster, effects);
                self.phase_deadline = Some(now + ms(self.config.election_window));
                tracing::debug!(winner = %winner, "waiting for the winner to announce itself");
            }
            None => self.restart_discovery(now, effects),
        }
    }

    fn become_master(&mut self, epoch: u64, now: u64, effects: &mut Vec<RuntimeEffect>) {
        self.epoch = epoch;
        self.master_lost_at = None;
        self.phase_deadline = None;
        self.connect_target = None;
        self.ctx.nodes.set_master(Some(self.local_id()));
        self.set_state(MemberState::Master, effects);
        effects.push(RuntimeEffect::Emit(ClusterEvent::MasterChanged {
            master: Some(self.local_id()),
            epoch,
        }));
        tracing::info!(node = %self.local_id(), epoch, "elected master");

        self.heartbeats = HeartbeatTracker::with_timeout(self.timeout);
        for node in self.ctx.nodes.alive_ids() {
            if node != self.local_id() {
                self.heartbeats.track_at(node, now);
            }
        }
        self.next_heartbeat_at = now;

        let announcement = Notification {
            node: self.local_id(),
            change: NodeChange::MasterElected,
            epoch,
        };
        let mut fanout = self.directory_routes();
        for (_, route) in self.member_routes() {
            if !fanout.contains(&route) {
                fanout.push(route);
            }
        }
        let message = self.message(NodeId::BROADCAST, announcement);
        effects.push(RuntimeEffect::Broadcast { message, fanout });
    }

    fn adopt_master(&mut self, master: NodeId, epoch: u64, now: u64, effects: &mut Vec<RuntimeEffect>) {
        if epoch != 0 {
            self.epoch = self.epoch.max(epoch);
        }
        self.election = None;
        self.phase_deadline = None;
        self.connect_target = None;
        self.master_lost_at = None;
        self.heartbeats = HeartbeatTracker::with_timeout(self.timeout);
        self.heartbeats.record_heartbeat_at(master, now);
        if self.ctx.nodes.master() != Some(master) {
            self.ctx.nodes.set_master(Some(master));
            effects.push(RuntimeEffect::Emit(ClusterEvent::MasterChanged {
                master: Some(master),
                epoch: self.epoch,
            }));
        }
    }

    fn master_lost(&mut self, now: u64, cause: RemovalCause, effects: &mut Vec<RuntimeEffect>) {
        let Some(master) = self.master() else {
            return;
        };
        tracing::warn!(master = %master, ?cause, "master lost");
        effects.push(RuntimeEffect::Emit(ClusterEvent::MasterLost { master }));
        self.heartbeats.untrack(master);
        self.retransmit.forget_target(master);
        self.remove_member(master, cause, now, effects);
        self.ctx.nodes.set_master(None);
        self.directory.remove(&master);
        if cause == RemovalCause::Failed {
            self.master_lost_at.get_or_insert(now);
        }
        self.begin_election(now, effects);
    }

    /// Master side: admit or refresh a member.
    fn admit(&mut self, info: NodeInfo, now: u64, effects: &mut Vec<RuntimeEffect>) {
        self.directory.insert(info.node, info);
        self.heartbeats.record_heartbeat_at(info.node, now);
        if self.ctx.nodes.add_node(info, now) {
            tracing::info!(node = %info.node, addr = %info.socket_addr(), "node joined");
            effects.push(RuntimeEffect::Emit(ClusterEvent::NodeJoined { node: info.node }));
            let joined = Notification {
                node: info.node,
                change: NodeChange::Joined,
                epoch: self.epoch,
            };
            let fanout: Vec<Route> = self
                .member_routes()
                .into_iter()
                .filter(|(node, _)| *node != info.node)
                .map(|(_, route)| route)
                .collect();
            let message = self.message(NodeId::BROADCAST, joined);
            effects.push(RuntimeEffect::Broadcast { message, fanout });
        }
    }

    /// Master side: a member missed its heartbeats.
    fn fail_member(&mut self, node: NodeId, now: u64, effects: &mut Vec<RuntimeEffect>) {
        tracing::warn!(node = %node, "heartbeat timeout");
        self.remove_member(node, RemovalCause::Failed, now, effects);
        self.announce(
            Notification {
                node,
                change: NodeChange::Failed,
                epoch: self.epoch,
            },
            effects,
        );
    }

    /// Remove a node from the table and everything we track for it.
    fn remove_member(&mut self, node: NodeId, cause: RemovalCause, now: u64, effects: &mut Vec<RuntimeEffect>) {
        self.heartbeats.untrack(node);
        self.retransmit.forget_target(node);
        let versions: Vec<u64> = self.proposals.keys().copied().collect();
        for version in versions {
            self.proposal_dropped(version, node, now, effects);
        }

        match self.ctx.nodes.remove_node(node, cause) {
            RemoveOutcome::Removed(removed) => {
                let event = match cause {
                    RemovalCause::Left => ClusterEvent::NodeLeft {
                        node,
                        released: removed.released,
                    },
                    RemovalCause::Failed => ClusterEvent::NodeFailed {
                        node,
                        released: removed.released,
                    },
                };
                effects.push(RuntimeEffect::Emit(event));
            }
            RemoveOutcome::Deferred => {
                tracing::debug!(node = %node, "removal deferred until in-flight calls finish");
            }
            RemoveOutcome::Absent => {
                tracing::debug!(node = %node, "removal of unknown node ignored");
            }
        }
    }

    fn on_abandoned(&mut self, outstanding: Outstanding, now: u64, effects: &mut Vec<RuntimeEffect>) {
        let label = outstanding.message.label();
        tracing::warn!(target = %outstanding.target, frame_id = outstanding.message.frame_id, "{label} unacknowledged, peer unreachable");
        effects.push(RuntimeEffect::Emit(ClusterEvent::Unreachable {
            node: outstanding.target,
            frame: label,
        }));
        match outstanding.message.payload {
            Payload::ConfigUpdate(update) => {
                self.proposal_dropped(update.version, outstanding.target, now, effects);
            }
            Payload::Disconnect(_) if self.state == MemberState::Leaving => {
                self.finish(StopReason::Left, effects);
            }
            Payload::Register(register) => {
                effects.push(RuntimeEffect::Emit(ClusterEvent::ResourceRejected {
                    resource: Resource::new(register.kind, register.name),
                }));
            }
            _ => {}
        }
    }

    /// `node` no longer holds up `version`; commit once nobody does.
    fn proposal_dropped(&mut self, version: u64, node: NodeId, now: u64, effects: &mut Vec<RuntimeEffect>) {
        let done = match self.proposals.get_mut(&version) {
            Some(proposal) => {
                proposal.waiting.remove(&node);
                proposal.waiting.is_empty()
            }
            None => false,
        };
        if done {
            self.proposals.remove(&version);
            self.commit_proposal(version, now, effects);
        }
    }

    fn commit_proposal(&mut self, version: u64, now: u64, effects: &mut Vec<RuntimeEffect>) {
        if let CommitOutcome::Applied { version } = self.store.commit(version) {
            // Older proposals are contained in this snapshot.
            self.proposals.retain(|&v, _| v > version);
            tracing::info!(version, "config committed");
            effects.push(RuntimeEffect::Emit(ClusterEvent::ConfigApplied { version }));
            for (node, route) in self.member_routes() {
                if route.wire == Wire::Current {
                    self.send(route, node, ConfigCommit { version }, now, effects);
                }
            }
        }
    }

    /// Send `node` the committed config as an update plus its commit.
    fn catch_up(&mut self, node: NodeId, route: Route, now: u64, effects: &mut Vec<RuntimeEffect>) {
        let version = self.store.version();
        if version == 0 || route.wire == Wire::Legacy {
            return;
        }
        tracing::info!(node = %node, version, "catching member up on config");
        let update = ConfigUpdate {
            version,
            entries: self.store.entries().clone(),
        };
        self.send(route, node, update, now, effects);
        self.send(route, node, ConfigCommit { version }, now, effects);
    }

    fn heartbeat_members(&mut self, now: u64, effects: &mut Vec<RuntimeEffect>) {
        let heartbeat = self.heartbeat_payload();
        for (node, route) in self.member_routes() {
            self.heartbeats.track_at(node, now);
            self.send(route, node, heartbeat.clone(), now, effects);
        }
    }

    fn heartbeat_payload(&self) -> Heartbeat {
        Heartbeat {
            epoch: self.epoch,
            master: self.local_id(),
            config_version: self.store.version(),
        }
    }

    fn announce(&mut self, notification: Notification, effects: &mut Vec<RuntimeEffect>) {
        let fanout: Vec<Route> = self.member_routes().into_iter().map(|(_, r)| r).collect();
        if fanout.is_empty() {
            return;
        }
        let message = self.message(NodeId::BROADCAST, notification);
        effects.push(RuntimeEffect::Broadcast { message, fanout });
    }

    fn finish(&mut self, reason: StopReason, effects: &mut Vec<RuntimeEffect>) {
        let next = match reason {
            StopReason::MasterLost => MemberState::Failed,
            StopReason::Left | StopReason::Shutdown => MemberState::Left,
        };
        self.set_state(next, effects);
        self.phase_deadline = None;
        self.election = None;
        effects.push(RuntimeEffect::Emit(ClusterEvent::Stopped { reason }));
        effects.push(RuntimeEffect::Shutdown(reason));
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn message(&self, destination: NodeId, payload: impl Into<Payload>) -> Message {
        Message::new(self.ctx.next_frame_id(), self.local_id(), destination, payload)
            .with_base_timeout(ms(self.config.retransmit_timeout))
    }

    /// Send `payload` to `target`, tracking it for retransmission if it wants
    /// an Ack. Legacy peers never Ack, so nothing sent to them is tracked.
    fn send(
        &mut self,
        route: Route,
        target: NodeId,
        payload: impl Into<Payload>,
        now: u64,
        effects: &mut Vec<RuntimeEffect>,
    ) {
        let message = self.message(target, payload);
        if message.payload.wants_ack() && route.wire == Wire::Current {
            let wire = self.retransmit.track(message, route, target, now);
            effects.push(RuntimeEffect::SendTo { route, message: wire });
        } else {
            self.push_send(route, message, effects);
        }
    }

    fn push_send(&self, route: Route, message: Message, effects: &mut Vec<RuntimeEffect>) {
        if !self.skips_legacy(route, &message) {
            effects.push(RuntimeEffect::SendTo { route, message });
        }
    }

    fn skips_legacy(&self, route: Route, message: &Message) -> bool {
        let skip = route.wire == Wire::Legacy && LegacyFrame::from_message(message).is_err();
        if skip {
            tracing::trace!(to = %route.address, "{} has no legacy form, skipped", message.label());
        }
        skip
    }

    /// Answer `request` on `route` and remember the answer for duplicates.
    fn reply(&mut self, request: &Message, route: Route, payload: impl Into<Payload>, effects: &mut Vec<RuntimeEffect>) {
        let response = request
            .reply(self.ctx.next_frame_id(), self.local_id(), payload)
            .with_base_timeout(ms(self.config.retransmit_timeout));
        self.dedup.record_response(request, &response);
        self.push_send(route, response, effects);
    }

    fn route_for(&self, node: NodeId) -> Option<Route> {
        self.ctx
            .nodes
            .node(node)
            .map(|n| n.info)
            .filter(|info| info.port != 0)
            .or_else(|| self.directory.get(&node).copied())
            .map(|info| Route::for_info(&info))
    }

    fn master_route(&self) -> Option<(NodeId, Route)> {
        let master = self.master()?;
        self.route_for(master).map(|route| (master, route))
    }

    fn priority_of(&self, node: NodeId) -> u32 {
        self.ctx
            .nodes
            .node(node)
            .map(|n| n.info.priority)
            .or_else(|| self.directory.get(&node).map(|i| i.priority))
            .unwrap_or(0)
    }

    /// Alive members other than us, with their routes.
    fn member_routes(&self) -> Vec<(NodeId, Route)> {
        self.ctx
            .nodes
            .alive_ids()
            .into_iter()
            .filter(|&node| node != self.local_id())
            .filter_map(|node| self.route_for(node).map(|route| (node, route)))
            .collect()
    }

    fn directory_routes(&self) -> Vec<Route> {
        self.directory.values().map(Route::for_info).collect()
    }
}

/// Whatever a peer reached over the legacy endpoint says about itself, it
/// only speaks the legacy format.
fn tag_wire(mut info: NodeInfo, route: Route) -> NodeInfo {
    if route.wire == Wire::Legacy {
        info.capabilities |= CAP_LEGACY_WIRE;
    }
    info
}
