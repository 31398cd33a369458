//! Replicated registry maintainers
//!
//! One maintainer task per registry per node. Handles stay valid across
//! supervised restarts; local state does not, so dependents are told to
//! re-establish their subscriptions and declarations after a crash.

pub mod acks;
pub mod topic;

pub use acks::{
    ack_registry, AckGrant, AckRegistryHandle, AckRegistryUnit, AckSnapshot, ClusterAckOwner,
    ClusterAckView, DeclareAck, ACK_REGISTRY_UNIT,
};
pub use topic::{
    topic_registry, LocalRoute, LocalRouteTable, SnapshotEntry, SubscribeAck, TopicFilter,
    TopicRegistryHandle, TopicRegistryUnit, TopicSnapshot, UnsubscribeAck, TOPIC_REGISTRY_UNIT,
};
