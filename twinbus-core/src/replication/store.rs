//! Replicated key-value store contract
//!
//! The transport that carries registry deltas between nodes is an external
//! collaborator. The core only requires pairwise-mergeable values, a
//! fire-and-forget write, two read consistency levels, and a notification
//! stream of remote updates.

use crate::cluster::NodeId;
use crate::error::Result;
use crate::replication::state::RegistryValue;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Read consistency level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Fast local read; may be stale
    Local,
    /// Majority-ish read used for startup recovery
    Majority,
}

/// Notification that a key changed because of a remote write
#[derive(Debug, Clone)]
pub struct StoreUpdate {
    /// The changed key
    pub key: String,
    /// Node whose write caused the change
    pub origin: NodeId,
}

/// Replicated key-value store carrying the registries between nodes.
///
/// Writes are deltas: the store merges them into whatever it already holds
/// for the key, locally first and on every other replica as gossip spreads.
/// Merge is commutative and idempotent, so delivery order and duplication
/// do not matter.
#[async_trait]
pub trait ReplicatedStore: Send + Sync {
    /// Identity of the local node
    fn node(&self) -> NodeId;

    /// Merge a delta into the value under `key` and queue it for
    /// replication. Returns once the local replica is updated; cluster-wide
    /// visibility is eventual.
    async fn write(&self, key: &str, delta: RegistryValue) -> Result<()>;

    /// Read the value under `key`
    async fn read(&self, key: &str, consistency: Consistency) -> Result<Option<RegistryValue>>;

    /// Subscribe to remote-update notifications
    fn updates(&self) -> broadcast::Receiver<StoreUpdate>;
}
