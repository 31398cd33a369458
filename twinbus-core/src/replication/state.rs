//! Replicated registry state
//!
//! Every node contributes only to its own slice of a registry value and
//! bumps a per-node version on each local mutation. Merging keeps the
//! highest-versioned contribution per node, which makes the merge
//! commutative, associative, and idempotent regardless of the order
//! replication deltas arrive in.

use crate::cluster::NodeId;
use crate::hash::TopicBucket;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Key of the replicated ack-label ownership map
pub const ACK_REGISTRY_KEY: &str = "twinbus/acks";

/// Key of one topic-registry shard
pub fn topic_shard_key(shard: u32) -> String {
    format!("twinbus/topics/{}", shard)
}

/// One subscriber's replicated subscription record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// One compact digest per subscribed topic: the set of
    /// `(seed, hash(topic, seed))` buckets for that topic
    pub digests: Vec<BTreeSet<TopicBucket>>,
    /// Group membership, if the subscription is load-balanced
    pub group: Option<String>,
}

/// A node's contribution to one topic-registry shard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardContribution {
    /// Monotonic per-node version; higher replaces lower on merge
    pub version: u64,
    /// Subscriber id -> its subscription record
    pub subscribers: BTreeMap<String, SubscriptionRecord>,
}

/// Replicated topic-registry shard: per-node contributions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicShardState {
    pub nodes: BTreeMap<NodeId, ShardContribution>,
}

impl TopicShardState {
    /// Merge another replica's view into this one (CRDT join)
    pub fn merge(&mut self, other: &TopicShardState) {
        for (node, contribution) in &other.nodes {
            match self.nodes.get(node) {
                Some(existing) if existing.version >= contribution.version => {}
                _ => {
                    self.nodes.insert(node.clone(), contribution.clone());
                }
            }
        }
    }

    /// Replace this node's contribution, bumping its version
    pub fn update_own(&mut self, node: &NodeId, subscribers: BTreeMap<String, SubscriptionRecord>) {
        let version = self.nodes.get(node).map(|c| c.version).unwrap_or(0) + 1;
        self.nodes.insert(
            node.clone(),
            ShardContribution {
                version,
                subscribers,
            },
        );
    }
}

/// A tentative or committed ack-label claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckClaim {
    /// Declaring subscriber
    pub subscriber: String,
    /// Optional group the declaration is scoped to
    pub group: Option<String>,
    /// Generated proposal identifier; part of the deterministic tie-break
    pub proposal: String,
}

impl AckClaim {
    /// Tie-break ordering for two claims on the same label: the
    /// lexicographically smallest `(subscriber, proposal)` pair wins,
    /// independent of the order replication deltas arrived in.
    pub fn beats(&self, other: &AckClaim) -> bool {
        (&self.subscriber, &self.proposal) < (&other.subscriber, &other.proposal)
    }
}

/// A node's contribution to the ack-label ownership map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckContribution {
    /// Monotonic per-node version; higher replaces lower on merge
    pub version: u64,
    /// Label -> claim
    pub claims: BTreeMap<String, AckClaim>,
}

/// Replicated ack-label ownership map: per-node contributions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckOwnershipState {
    pub nodes: BTreeMap<NodeId, AckContribution>,
}

impl AckOwnershipState {
    /// Merge another replica's view into this one (CRDT join)
    pub fn merge(&mut self, other: &AckOwnershipState) {
        for (node, contribution) in &other.nodes {
            match self.nodes.get(node) {
                Some(existing) if existing.version >= contribution.version => {}
                _ => {
                    self.nodes.insert(node.clone(), contribution.clone());
                }
            }
        }
    }

    /// Replace this node's contribution, bumping its version
    pub fn update_own(&mut self, node: &NodeId, claims: BTreeMap<String, AckClaim>) {
        let version = self.nodes.get(node).map(|c| c.version).unwrap_or(0) + 1;
        self.nodes
            .insert(node.clone(), AckContribution { version, claims });
    }

    /// Resolve the winning claim per label across all live nodes.
    ///
    /// Nodes in `departed` are skipped entirely; their entries are treated
    /// as removed until they rejoin and re-announce.
    pub fn winners(&self, departed: &BTreeSet<NodeId>) -> BTreeMap<String, (NodeId, AckClaim)> {
        let mut out: BTreeMap<String, (NodeId, AckClaim)> = BTreeMap::new();
        for (node, contribution) in &self.nodes {
            if departed.contains(node) {
                continue;
            }
            for (label, claim) in &contribution.claims {
                match out.get(label) {
                    Some((_, held)) if !claim.beats(held) => {}
                    _ => {
                        out.insert(label.clone(), (node.clone(), claim.clone()));
                    }
                }
            }
        }
        out
    }
}

/// Value stored under one replication key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryValue {
    TopicShard(TopicShardState),
    AckOwners(AckOwnershipState),
}

impl RegistryValue {
    /// Merge a same-typed value into this one. Mixed-type merges on one
    /// key indicate a wiring bug and are ignored.
    pub fn merge(&mut self, other: &RegistryValue) {
        match (self, other) {
            (RegistryValue::TopicShard(a), RegistryValue::TopicShard(b)) => a.merge(b),
            (RegistryValue::AckOwners(a), RegistryValue::AckOwners(b)) => a.merge(b),
            _ => {
                tracing::warn!("ignoring mixed-type merge on replicated registry value");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: &str) -> NodeId {
        NodeId::new(n)
    }

    fn claim(subscriber: &str, proposal: &str) -> AckClaim {
        AckClaim {
            subscriber: subscriber.to_string(),
            group: None,
            proposal: proposal.to_string(),
        }
    }

    #[test]
    fn test_shard_merge_keeps_highest_version() {
        let mut a = TopicShardState::default();
        a.update_own(&node("n1"), BTreeMap::new());

        let mut b = a.clone();
        let mut subs = BTreeMap::new();
        subs.insert(
            "s1".to_string(),
            SubscriptionRecord {
                digests: vec![],
                group: None,
            },
        );
        b.update_own(&node("n1"), subs.clone());

        // Stale merge into fresh view is a no-op.
        let mut fresh = b.clone();
        fresh.merge(&a);
        assert_eq!(fresh, b);

        // Fresh merge into stale view adopts the newer contribution.
        a.merge(&b);
        assert_eq!(a.nodes[&node("n1")].subscribers, subs);
    }

    #[test]
    fn test_merge_is_commutative_and_idempotent() {
        let mut a = AckOwnershipState::default();
        let mut claims_a = BTreeMap::new();
        claims_a.insert("lorem".to_string(), claim("s1", "p1"));
        a.update_own(&node("n1"), claims_a);

        let mut b = AckOwnershipState::default();
        let mut claims_b = BTreeMap::new();
        claims_b.insert("lorem".to_string(), claim("s2", "p2"));
        b.update_own(&node("n2"), claims_b);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        let mut twice = ab.clone();
        twice.merge(&b);
        assert_eq!(twice, ab);
    }

    #[test]
    fn test_winner_is_replication_order_independent() {
        let mut state = AckOwnershipState::default();
        let mut n1 = BTreeMap::new();
        n1.insert("lorem".to_string(), claim("s2", "p9"));
        state.update_own(&node("n1"), n1);
        let mut n2 = BTreeMap::new();
        n2.insert("lorem".to_string(), claim("s1", "p5"));
        state.update_own(&node("n2"), n2);

        let winners = state.winners(&BTreeSet::new());
        let (winner_node, winner) = &winners["lorem"];
        assert_eq!(winner_node, &node("n2"));
        assert_eq!(winner.subscriber, "s1");
    }

    #[test]
    fn test_departed_nodes_are_skipped() {
        let mut state = AckOwnershipState::default();
        let mut n1 = BTreeMap::new();
        n1.insert("lorem".to_string(), claim("s1", "p1"));
        state.update_own(&node("n1"), n1);

        let mut departed = BTreeSet::new();
        departed.insert(node("n1"));
        assert!(state.winners(&departed).is_empty());
    }
}
