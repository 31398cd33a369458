//! Registry replication: CRDT state types, the replicated-store contract,
//! and the in-memory gossip fabric.

mod memory;
mod state;
mod store;

pub use memory::{GossipHub, InMemoryStore};
pub use state::{
    topic_shard_key, AckClaim, AckContribution, AckOwnershipState, RegistryValue,
    ShardContribution, SubscriptionRecord, TopicShardState, ACK_REGISTRY_KEY,
};
pub use store::{Consistency, ReplicatedStore, StoreUpdate};
