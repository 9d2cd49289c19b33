//! The shared registry of cluster members.
//!
//! Single writer: only the membership state machine mutates it. Readers
//! (`is_alive`, `master`, ...) take a short read lock and get owned copies.
//!
//! Removing a node releases every resource attributed to it, exactly once.
//! A node pinned by a [`NodeRef`] (an in-flight RPC) is not removed until
//! the last guard drops.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::frames::{NodeInfo, ResourceKind};
use crate::types::NodeId;

/// A named resource held on behalf of a node (lock, component, service).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub name: String,
}

impl Resource {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub info: NodeInfo,
    pub alive: bool,
    pub is_master: bool,
    /// Unix ms of (re)admission.
    pub joined_at: u64,
    pub resources: BTreeSet<Resource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalCause {
    /// Heartbeat timeout.
    Failed,
    /// Explicit disconnect.
    Left,
}

/// A completed removal and what it released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub node: NodeId,
    pub cause: RemovalCause,
    pub released: Vec<Resource>,
    pub was_master: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed(Removed),
    /// The node is pinned; removal completes when the last guard drops.
    Deferred,
    /// Not in the table. Duplicate failure signals land here.
    Absent,
}

/// Hook for higher layers that react to membership changes.
///
/// Called after the table lock is released, on the thread that made the
/// change.
pub trait MembershipListener: Send + Sync {
    fn node_added(&self, _node: &Node) {}
    fn node_removed(&self, _removed: &Removed) {}
    fn master_changed(&self, _old: Option<NodeId>, _new: Option<NodeId>) {}
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<NodeId, Node>,
    master: Option<NodeId>,
    pins: HashMap<NodeId, usize>,
    pending_removal: HashMap<NodeId, RemovalCause>,
}

enum Notice {
    Added(Node),
    Removed(Removed),
    Master(Option<NodeId>, Option<NodeId>),
}

pub struct NodeTable {
    local_id: NodeId,
    inner: RwLock<Inner>,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
}

impl std::fmt::Debug for NodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("NodeTable")
            .field("local_id", &self.local_id)
            .field("nodes", &inner.nodes.keys().collect::<Vec<_>>())
            .field("master", &inner.master)
            .finish()
    }
}

impl NodeTable {
    pub fn new(local_id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            inner: RwLock::new(Inner::default()),
            listeners: RwLock::new(Vec::new()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── Readers ──────────────────────────────────────────────────────────

    pub fn local_node_id(&self) -> NodeId {
        self.local_id
    }

    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.read().nodes.get(&id).cloned()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.read().nodes.contains_key(&id)
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.read().nodes.get(&id).is_some_and(|n| n.alive)
    }

    pub fn alive_nodes(&self) -> Vec<Node> {
        self.read().nodes.values().filter(|n| n.alive).cloned().collect()
    }

    pub fn alive_ids(&self) -> Vec<NodeId> {
        self.read()
            .nodes
            .values()
            .filter(|n| n.alive)
            .map(|n| n.id)
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.read().nodes.values().filter(|n| n.alive).count()
    }

    pub fn master(&self) -> Option<NodeId> {
        self.read().master
    }

    pub fn master_node(&self) -> Option<Node> {
        let inner = self.read();
        inner.master.and_then(|id| inner.nodes.get(&id).cloned())
    }

    /// Every node, dead-but-pinned ones included.
    pub fn snapshot(&self) -> Vec<Node> {
        self.read().nodes.values().cloned().collect()
    }

    pub fn resources(&self, id: NodeId) -> Vec<Resource> {
        self.read()
            .nodes
            .get(&id)
            .map(|n| n.resources.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Which node holds `resource`, if any.
    pub fn resource_owner(&self, resource: &Resource) -> Option<NodeId> {
        self.read()
            .nodes
            .values()
            .find(|n| n.resources.contains(resource))
            .map(|n| n.id)
    }

    pub fn pin_count(&self, id: NodeId) -> usize {
        self.read().pins.get(&id).copied().unwrap_or(0)
    }

    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Pin a node for the duration of an in-flight call.
    pub fn pin(self: &Arc<Self>, id: NodeId) -> Option<NodeRef> {
        let mut inner = self.write();
        if !inner.nodes.contains_key(&id) || inner.pending_removal.contains_key(&id) {
            return None;
        }
        *inner.pins.entry(id).or_insert(0) += 1;
        Some(NodeRef {
            table: Arc::clone(self),
            id,
        })
    }

    // ── Mutators (membership state machine only) ─────────────────────────

    /// Insert or refresh a node. Returns true if it was not a member before.
    ///
    /// Re-adding a node whose removal is deferred cancels the removal.
    pub fn add_node(&self, info: NodeInfo, now: u64) -> bool {
        let mut notices = Vec::new();
        let added = {
            let mut inner = self.write();
            let revived = inner.pending_removal.remove(&info.node).is_some();
            let is_master = inner.master == Some(info.node);
            match inner.nodes.get_mut(&info.node) {
                Some(node) => {
                    node.info = info;
                    node.alive = true;
                    if revived {
                        node.joined_at = now;
                    }
                    false
                }
                None => {
                    let node = Node {
                        id: info.node,
                        info,
                        alive: true,
                        is_master,
                        joined_at: now,
                        resources: BTreeSet::new(),
                    };
                    notices.push(Notice::Added(node.clone()));
                    inner.nodes.insert(info.node, node);
                    true
                }
            }
        };
        self.notify(notices);
        added
    }

    /// Remove a node and release its resources.
    pub fn remove_node(&self, id: NodeId, cause: RemovalCause) -> RemoveOutcome {
        let mut notices = Vec::new();
        let outcome = {
            let mut inner = self.write();
            if !inner.nodes.contains_key(&id) {
                return RemoveOutcome::Absent;
            }
            if inner.pins.get(&id).copied().unwrap_or(0) > 0 {
                inner.pending_removal.entry(id).or_insert(cause);
                if let Some(node) = inner.nodes.get_mut(&id) {
                    node.alive = false;
                }
                RemoveOutcome::Deferred
            } else {
                match finalize(&mut inner, id, cause, &mut notices) {
                    Some(removed) => RemoveOutcome::Removed(removed),
                    None => RemoveOutcome::Absent,
                }
            }
        };
        self.notify(notices);
        outcome
    }

    /// Record the master. `None` clears it.
    pub fn set_master(&self, master: Option<NodeId>) {
        let mut notices = Vec::new();
        {
            let mut inner = self.write();
            let old = inner.master;
            if old == master {
                return;
            }
            inner.master = master;
            for node in inner.nodes.values_mut() {
                node.is_master = Some(node.id) == master;
            }
            notices.push(Notice::Master(old, master));
        }
        self.notify(notices);
    }

    pub fn set_alive(&self, id: NodeId, alive: bool) {
        if let Some(node) = self.write().nodes.get_mut(&id) {
            node.alive = alive;
        }
    }

    /// Attribute `resource` to `id`. False if the node is unknown or the
    /// resource already has an owner.
    pub fn register_resource(&self, id: NodeId, resource: Resource) -> bool {
        let mut inner = self.write();
        if inner.nodes.values().any(|n| n.resources.contains(&resource)) {
            return false;
        }
        match inner.nodes.get_mut(&id) {
            Some(node) => node.resources.insert(resource),
            None => false,
        }
    }

    pub fn release_resource(&self, id: NodeId, resource: &Resource) -> bool {
        self.write()
            .nodes
            .get_mut(&id)
            .is_some_and(|n| n.resources.remove(resource))
    }

    fn unpin(&self, id: NodeId) {
        let mut notices = Vec::new();
        {
            let mut inner = self.write();
            let remaining = match inner.pins.get_mut(&id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => return,
            };
            if remaining > 0 {
                return;
            }
            inner.pins.remove(&id);
            if let Some(cause) = inner.pending_removal.remove(&id) {
                finalize(&mut inner, id, cause, &mut notices);
            }
        }
        self.notify(notices);
    }

    fn notify(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for notice in &notices {
            for listener in &listeners {
                match notice {
                    Notice::Added(node) => listener.node_added(node),
                    Notice::Removed(removed) => listener.node_removed(removed),
                    Notice::Master(old, new) => listener.master_changed(*old, *new),
                }
            }
        }
    }
}

fn finalize(inner: &mut Inner, id: NodeId, cause: RemovalCause, notices: &mut Vec<Notice>) -> Option<Removed> {
    let node = inner.nodes.remove(&id)?;
    let was_master = inner.master == Some(id);
    if was_master {
        inner.master = None;
        notices.push(Notice::Master(Some(id), None));
    }
    let removed = Removed {
        node: id,
        cause,
        released: node.resources.into_iter().collect(),
        was_master,
    };
    tracing::debug!(node = %id, ?cause, released = removed.released.len(), "node removed");
    notices.push(Notice::Removed(removed.clone()));
    Some(removed)
}

/// Keeps a node in the table while an RPC to it is in flight.
#[derive(Debug)]
pub struct NodeRef {
    table: Arc<NodeTable>,
    id: NodeId,
}

impl NodeRef {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node(&self) -> Option<Node> {
        self.table.node(self.id)
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        self.table.unpin(self.id);
    }
}
