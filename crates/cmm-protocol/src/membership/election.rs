/// Deterministic master election.
///
/// Every node collects the candidacies it hears during a fixed window and
/// then applies the same total order: highest priority wins, ties go to the
/// lowest node id. Same candidate set, same winner, whatever the arrival
/// order; no extra rounds.
use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;

use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub node: NodeId,
    pub priority: u32,
}

impl Candidate {
    pub fn new(node: NodeId, priority: u32) -> Self {
        Self { node, priority }
    }

    fn rank(&self) -> (u32, Reverse<NodeId>) {
        (self.priority, Reverse(self.node))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of an election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionResult {
    /// None if nobody stood.
    pub winner: Option<NodeId>,
    pub reason: ElectionReason,
    pub candidate_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionReason {
    /// Only one candidate.
    Unopposed,
    /// Strictly highest priority.
    Priority,
    /// Priority tie, lowest id among the tied.
    LowestId,
    NoCandidates,
}

/// A node offered more than once stands with its highest priority.
pub fn elect(candidates: impl IntoIterator<Item = Candidate>) -> ElectionResult {
    let mut by_node: BTreeMap<NodeId, u32> = BTreeMap::new();
    for candidate in candidates {
        let priority = by_node.entry(candidate.node).or_insert(candidate.priority);
        *priority = (*priority).max(candidate.priority);
    }
    let mut all: Vec<Candidate> = by_node
        .into_iter()
        .map(|(node, priority)| Candidate::new(node, priority))
        .collect();
    all.sort_by(|a, b| b.cmp(a));

    let Some(best) = all.first().copied() else {
        return ElectionResult {
            winner: None,
            reason: ElectionReason::NoCandidates,
            candidate_count: 0,
        };
    };

    let reason = match all.get(1) {
        None => ElectionReason::Unopposed,
        Some(second) if second.priority == best.priority => ElectionReason::LowestId,
        Some(_) => ElectionReason::Priority,
    };

    ElectionResult {
        winner: Some(best.node),
        reason,
        candidate_count: all.len(),
    }
}

/// One election in progress.
#[derive(Debug, Clone)]
pub struct ElectionRound {
    epoch: u64,
    deadline: u64,
    candidates: BTreeMap<NodeId, u32>,
}

impl ElectionRound {
    pub fn new(epoch: u64, now: u64, window_ms: u64) -> Self {
        Self {
            epoch,
            deadline: now.saturating_add(window_ms),
            candidates: BTreeMap::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Move to a later epoch heard from another candidate. Candidates
    /// collected so far stay; they are still alive.
    pub fn raise_epoch(&mut self, epoch: u64) {
        self.epoch = self.epoch.max(epoch);
    }

    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    pub fn is_due(&self, now: u64) -> bool {
        now >= self.deadline
    }

    /// Record a candidacy. Returns true if it was new.
    pub fn offer(&mut self, candidate: Candidate) -> bool {
        self.candidates.insert(candidate.node, candidate.priority) != Some(candidate.priority)
    }

    pub fn withdraw(&mut self, node: NodeId) {
        self.candidates.remove(&node);
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Current front runner.
    pub fn leader(&self) -> Option<NodeId> {
        self.conclude().winner
    }

    pub fn conclude(&self) -> ElectionResult {
        elect(
            self.candidates
                .iter()
                .map(|(&node, &priority)| Candidate::new(node, priority)),
        )
    }
}
