//! Cross-node delivery contract and the in-process mesh used by
//! single-process deployments and the integration tests

use crate::cluster::NodeId;
use crate::error::{Result, TwinBusError};
use crate::pubsub::message::Envelope;
use crate::pubsub::subscriber::SubscriberId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// A publish forwarded to another node for local fan-out there
#[derive(Debug, Clone)]
pub struct RemotePublish {
    pub envelope: Envelope,
    pub sender: SubscriberId,
    /// Node the publish originated on; acknowledgements route back here
    pub origin: NodeId,
    /// Group members picked by the publishing node. `None` means the
    /// receiving node delivers to all of its matching ungrouped
    /// subscribers; `Some` restricts delivery to exactly these targets.
    pub targets: Option<Vec<SubscriberId>>,
}

/// Carries publishes and acknowledgements to subscribers on other nodes
#[async_trait]
pub trait RemoteDelivery: Send + Sync {
    async fn deliver(&self, node: &NodeId, publish: RemotePublish) -> Result<()>;

    /// Route an acknowledgement back to a sender on `node`
    async fn acknowledge(
        &self,
        node: &NodeId,
        sender: SubscriberId,
        ack: crate::pubsub::message::Acknowledgement,
    ) -> Result<()>;
}

/// Single-node deployments have nowhere to forward to
#[derive(Debug, Default)]
pub struct NoRemoteDelivery;

#[async_trait]
impl RemoteDelivery for NoRemoteDelivery {
    async fn deliver(&self, node: &NodeId, _publish: RemotePublish) -> Result<()> {
        debug!(%node, "dropping remote publish, no cross-node transport configured");
        Ok(())
    }

    async fn acknowledge(
        &self,
        node: &NodeId,
        _sender: SubscriberId,
        _ack: crate::pubsub::message::Acknowledgement,
    ) -> Result<()> {
        debug!(%node, "dropping remote acknowledgement, no cross-node transport configured");
        Ok(())
    }
}

/// In-process mesh connecting the publishers of co-hosted nodes.
///
/// Publishers register after construction; delivery to an unregistered
/// node is an error so tests catch wiring mistakes.
#[derive(Default)]
pub struct InProcessMesh {
    publishers: Mutex<HashMap<NodeId, Weak<crate::pubsub::publisher::Publisher>>>,
}

impl InProcessMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: NodeId, publisher: &Arc<crate::pubsub::publisher::Publisher>) {
        if let Ok(mut publishers) = self.publishers.lock() {
            publishers.insert(node, Arc::downgrade(publisher));
        }
    }
}

#[async_trait]
impl RemoteDelivery for InProcessMesh {
    async fn deliver(&self, node: &NodeId, publish: RemotePublish) -> Result<()> {
        let publisher = self
            .publishers
            .lock()
            .map_err(|_| TwinBusError::Other("mesh registry poisoned".to_string()))?
            .get(node)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TwinBusError::Unavailable(format!("node {} not in mesh", node)))?;
        publisher.deliver_remote(publish);
        Ok(())
    }

    async fn acknowledge(
        &self,
        node: &NodeId,
        sender: SubscriberId,
        ack: crate::pubsub::message::Acknowledgement,
    ) -> Result<()> {
        let publisher = self
            .publishers
            .lock()
            .map_err(|_| TwinBusError::Other("mesh registry poisoned".to_string()))?
            .get(node)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TwinBusError::Unavailable(format!("node {} not in mesh", node)))?;
        publisher.deliver_ack(&sender, ack);
        Ok(())
    }
}
