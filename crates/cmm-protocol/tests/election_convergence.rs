/// Integration tests: every start order and priority assignment converges
/// on a single master, the highest-priority eligible node.
mod sim;

use cmm_protocol::{ClusterEvent, NodeId};
use rand::{Rng, SeedableRng};
use sim::SimNet;

fn permutations(items: &[u32]) -> Vec<Vec<u32>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head);
            out.push(tail);
        }
    }
    out
}

/// Start nodes `stagger_ms` apart in the given order and wait for a master.
fn elect(cluster: &[(i32, u32)], order: &[i32], stagger_ms: u64) -> (SimNet, NodeId) {
    let mut net = SimNet::new(cluster);
    for &id in order {
        net.start(id);
        net.advance(stagger_ms);
    }
    let master = net.settle();
    (net, master)
}

/// The winner: highest priority, lowest id on ties.
fn expected(cluster: &[(i32, u32)]) -> NodeId {
    let &(id, _) = cluster
        .iter()
        .max_by_key(|&&(id, priority)| (priority, std::cmp::Reverse(id)))
        .unwrap();
    NodeId::new(id)
}

#[test]
fn every_priority_assignment_elects_the_highest() {
    for priorities in permutations(&[10, 20, 30]) {
        let cluster: Vec<(i32, u32)> = (1..=3).zip(priorities.iter().copied()).collect();
        let (net, master) = elect(&cluster, &[1, 2, 3], 0);
        assert_eq!(master, expected(&cluster), "priorities {priorities:?}");
        assert_eq!(net.masters().len(), 1);
    }
}

#[test]
fn every_start_order_elects_the_same_master() {
    let cluster = [(1, 10), (2, 30), (3, 20)];
    for order in permutations(&[1, 2, 3]) {
        let order: Vec<i32> = order.into_iter().map(|id| id as i32).collect();
        let (net, master) = elect(&cluster, &order, 700);
        assert_eq!(master, NodeId::new(2), "start order {order:?}");
        for id in [1, 3] {
            assert_eq!(net.node(id).state.nodes().master(), Some(NodeId::new(2)));
        }
    }
}

#[test]
fn equal_priorities_fall_back_to_lowest_id() {
    let cluster = [(4, 7), (2, 7), (9, 7)];
    for order in permutations(&[4, 2, 9]) {
        let order: Vec<i32> = order.into_iter().map(|id| id as i32).collect();
        let (_, master) = elect(&cluster, &order, 300);
        assert_eq!(master, NodeId::new(2), "start order {order:?}");
    }
}

#[test]
fn one_election_started_event_per_node() {
    let (net, _) = elect(&[(1, 1), (2, 2), (3, 3)], &[3, 1, 2], 0);
    for id in [1, 2, 3] {
        let started = net
            .events(id)
            .iter()
            .filter(|e| matches!(e, ClusterEvent::ElectionStarted { .. }))
            .count();
        assert_eq!(started, 1, "node {id}");
    }
}

#[test]
fn random_clusters_converge() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xC1u64);
    for round in 0..10 {
        let size = rng.random_range(2..=6);
        let cluster: Vec<(i32, u32)> = (1..=size).map(|id| (id, rng.random_range(0..5))).collect();
        let mut order: Vec<i32> = cluster.iter().map(|&(id, _)| id).collect();
        for i in (1..order.len()).rev() {
            order.swap(i, rng.random_range(0..=i));
        }
        // Everyone is up before the first discovery window closes.
        let stagger = rng.random_range(0..1_500);

        let (net, master) = elect(&cluster, &order, stagger);
        assert_eq!(master, expected(&cluster), "round {round}: {cluster:?} order {order:?}");
        assert!(net.settled());
    }
}
