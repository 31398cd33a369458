//! In-memory replicated store
//!
//! A `GossipHub` connects any number of in-process replicas: a write to one
//! replica is merged locally, then gossiped to every other member, firing
//! their update streams. Used as the single-node default backend and as
//! the multi-node fabric in the integration tests, which can pause the hub
//! to reproduce delayed-replication races.

use crate::cluster::NodeId;
use crate::error::Result;
use crate::replication::state::RegistryValue;
use crate::replication::store::{Consistency, ReplicatedStore, StoreUpdate};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

struct Replica {
    node: NodeId,
    data: RwLock<HashMap<String, RegistryValue>>,
    updates: broadcast::Sender<StoreUpdate>,
}

impl Replica {
    fn merge(&self, key: &str, delta: &RegistryValue) {
        let mut data = self.data.write().expect("replica lock poisoned");
        match data.get_mut(key) {
            Some(existing) => existing.merge(delta),
            None => {
                data.insert(key.to_string(), delta.clone());
            }
        }
    }
}

struct HubInner {
    members: Vec<Arc<Replica>>,
    paused: bool,
    /// Deltas queued while the hub is paused: (origin, key, delta)
    queued: Vec<(NodeId, String, RegistryValue)>,
}

/// Shared gossip fabric connecting in-process replicas
#[derive(Clone)]
pub struct GossipHub {
    inner: Arc<Mutex<HubInner>>,
}

impl Default for GossipHub {
    fn default() -> Self {
        Self::new()
    }
}

impl GossipHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                members: Vec::new(),
                paused: false,
                queued: Vec::new(),
            })),
        }
    }

    /// Create a replica for `node` joined to this hub
    pub fn join(&self, node: NodeId) -> InMemoryStore {
        let (updates, _) = broadcast::channel(256);
        let replica = Arc::new(Replica {
            node,
            data: RwLock::new(HashMap::new()),
            updates,
        });
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .members
            .push(replica.clone());
        InMemoryStore {
            replica,
            hub: self.clone(),
        }
    }

    /// Stop propagating deltas; they queue until [`GossipHub::resume`]
    pub fn pause(&self) {
        self.inner.lock().expect("hub lock poisoned").paused = true;
    }

    /// Resume propagation and flush everything queued while paused
    pub fn resume(&self) {
        let (members, queued) = {
            let mut inner = self.inner.lock().expect("hub lock poisoned");
            inner.paused = false;
            (inner.members.clone(), std::mem::take(&mut inner.queued))
        };
        for (origin, key, delta) in queued {
            Self::propagate(&members, &origin, &key, &delta);
        }
    }

    fn gossip(&self, origin: &NodeId, key: &str, delta: &RegistryValue) {
        let members = {
            let mut inner = self.inner.lock().expect("hub lock poisoned");
            if inner.paused {
                inner
                    .queued
                    .push((origin.clone(), key.to_string(), delta.clone()));
                return;
            }
            inner.members.clone()
        };
        Self::propagate(&members, origin, key, delta);
    }

    fn propagate(members: &[Arc<Replica>], origin: &NodeId, key: &str, delta: &RegistryValue) {
        for member in members {
            if member.node == *origin {
                continue;
            }
            member.merge(key, delta);
            let _ = member.updates.send(StoreUpdate {
                key: key.to_string(),
                origin: origin.clone(),
            });
        }
    }

    /// Merged view across every member, regardless of gossip progress.
    /// This backs the majority-consistency read.
    fn merged_read(&self, key: &str) -> Option<RegistryValue> {
        let members = self.inner.lock().expect("hub lock poisoned").members.clone();
        let mut merged: Option<RegistryValue> = None;
        for member in members {
            let data = member.data.read().expect("replica lock poisoned");
            if let Some(value) = data.get(key) {
                match merged.as_mut() {
                    Some(m) => m.merge(value),
                    None => merged = Some(value.clone()),
                }
            }
        }
        merged
    }
}

/// Replicated store backed by process memory and a [`GossipHub`]
pub struct InMemoryStore {
    replica: Arc<Replica>,
    hub: GossipHub,
}

impl InMemoryStore {
    /// Standalone single-node store (its own private hub)
    pub fn standalone(node: NodeId) -> Self {
        GossipHub::new().join(node)
    }
}

#[async_trait]
impl ReplicatedStore for InMemoryStore {
    fn node(&self) -> NodeId {
        self.replica.node.clone()
    }

    async fn write(&self, key: &str, delta: RegistryValue) -> Result<()> {
        debug!(node = %self.replica.node, key, "replicated write");
        self.replica.merge(key, &delta);
        self.hub.gossip(&self.replica.node, key, &delta);
        Ok(())
    }

    async fn read(&self, key: &str, consistency: Consistency) -> Result<Option<RegistryValue>> {
        match consistency {
            Consistency::Local => {
                let data = self.replica.data.read().expect("replica lock poisoned");
                Ok(data.get(key).cloned())
            }
            Consistency::Majority => Ok(self.hub.merged_read(key)),
        }
    }

    fn updates(&self) -> broadcast::Receiver<StoreUpdate> {
        self.replica.updates.subscribe()
    }
}
