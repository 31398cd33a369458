//! Node-level assembly of the bus
//!
//! Wires the replicated store, the two supervised registry maintainers,
//! and the publisher together, and bridges supervision events so a crash
//! of one registry also tells the other registry's dependents that their
//! state is gone.

use crate::cluster::{MembershipEvent, NodeId};
use crate::config::TwinBusConfig;
use crate::error::Result;
use crate::hash::HashFamily;
use crate::pubsub::extractor::{
    AckExtractor, EnvelopeAckExtractor, HeaderTopicExtractor, TopicExtractor,
};
use crate::pubsub::publisher::Publisher;
use crate::pubsub::remote::{NoRemoteDelivery, RemoteDelivery};
use crate::pubsub::subscriber::{SubscriberEvent, SubscriberRef};
use crate::pubsub::subscription::SubscriptionManager;
use crate::registry::acks::{ack_registry, AckRegistryHandle, AckSnapshot, ACK_REGISTRY_UNIT};
use crate::registry::topic::{topic_registry, TopicRegistryHandle, TOPIC_REGISTRY_UNIT};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use twinbus_supervisor::{SupervisedHandle, SupervisionEvent, SupervisionEventKind, Supervisor};

/// Builder for a [`PubSubService`]
pub struct PubSubServiceBuilder {
    config: TwinBusConfig,
    store: Arc<dyn crate::replication::ReplicatedStore>,
    topics: Arc<dyn TopicExtractor>,
    acks: Arc<dyn AckExtractor>,
    remote: Arc<dyn RemoteDelivery>,
}

impl PubSubServiceBuilder {
    pub fn new(config: TwinBusConfig, store: Arc<dyn crate::replication::ReplicatedStore>) -> Self {
        Self {
            config,
            store,
            topics: Arc::new(HeaderTopicExtractor),
            acks: Arc::new(EnvelopeAckExtractor),
            remote: Arc::new(NoRemoteDelivery),
        }
    }

    /// Replace the default header-based topic extractor
    pub fn with_topic_extractor(mut self, topics: Arc<dyn TopicExtractor>) -> Self {
        self.topics = topics;
        self
    }

    /// Replace the default envelope-based ack extractor
    pub fn with_ack_extractor(mut self, acks: Arc<dyn AckExtractor>) -> Self {
        self.acks = acks;
        self
    }

    /// Plug in a cross-node transport (defaults to none)
    pub fn with_remote_delivery(mut self, remote: Arc<dyn RemoteDelivery>) -> Self {
        self.remote = remote;
        self
    }

    pub fn build(self) -> Result<PubSubService> {
        self.config.validate()?;
        let node = self.store.node();
        if node.as_str() != self.config.node.name {
            warn!(
                store_node = %node,
                config_node = %self.config.node.name,
                "store and configuration disagree on node identity, using the store's"
            );
        }

        let hash = HashFamily::new(&self.config.hash);
        let (membership, _) = broadcast::channel(64);

        let (topic_unit, mut topic_handle) = topic_registry(
            hash.clone(),
            self.config.replication.shard_count,
            self.config.replication.subscribe_timeout,
            self.store.clone(),
            membership.clone(),
        );
        let (ack_unit, mut ack_handle) = ack_registry(
            self.config.replication.heartbeat_interval,
            self.config.replication.declare_timeout,
            self.store.clone(),
            membership.clone(),
        );

        let supervisor = Supervisor::new(self.config.supervision.clone());
        let topic_task = supervisor.spawn(topic_unit);
        let ack_task = supervisor.spawn(ack_unit);
        topic_handle.set_state_watch(topic_task.state_watch());
        ack_handle.set_state_watch(ack_task.state_watch());

        let publisher = Arc::new(Publisher::new(
            node.clone(),
            hash,
            self.topics,
            self.acks,
            self.remote,
            topic_handle.snapshot(),
            topic_handle.local_routes(),
            ack_handle.cluster_acks(),
        ));

        let notifier_shutdown = CancellationToken::new();
        tokio::spawn(cross_notify(
            supervisor.events(),
            topic_handle.clone(),
            ack_handle.clone(),
            notifier_shutdown.clone(),
        ));

        info!(%node, "pubsub service assembled");
        Ok(PubSubService {
            config: self.config,
            node,
            publisher,
            topic_handle,
            ack_handle,
            supervisor,
            topic_task,
            ack_task,
            membership,
            notifier_shutdown,
        })
    }
}

/// A crash of one registry invalidates state the other registry's
/// dependents rely on, so both sides get the termination notice.
async fn cross_notify(
    mut events: broadcast::Receiver<SupervisionEvent>,
    topic_handle: TopicRegistryHandle,
    ack_handle: AckRegistryHandle,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let relevant = matches!(
            event.kind,
            SupervisionEventKind::Failed { .. } | SupervisionEventKind::Corrupted { .. }
        );
        if !relevant {
            continue;
        }
        match event.unit.as_str() {
            TOPIC_REGISTRY_UNIT => {
                ack_handle
                    .notify_dependents_terminated(TOPIC_REGISTRY_UNIT)
                    .await;
            }
            ACK_REGISTRY_UNIT => {
                topic_handle
                    .notify_dependents_terminated(ACK_REGISTRY_UNIT)
                    .await;
            }
            _ => {}
        }
    }
}

/// One node's view of the bus: supervised registries plus a publisher
pub struct PubSubService {
    config: TwinBusConfig,
    node: NodeId,
    publisher: Arc<Publisher>,
    topic_handle: TopicRegistryHandle,
    ack_handle: AckRegistryHandle,
    supervisor: Supervisor,
    topic_task: SupervisedHandle,
    ack_task: SupervisedHandle,
    membership: broadcast::Sender<MembershipEvent>,
    notifier_shutdown: CancellationToken,
}

impl PubSubService {
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn config(&self) -> &TwinBusConfig {
        &self.config
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn topic_registry(&self) -> TopicRegistryHandle {
        self.topic_handle.clone()
    }

    pub fn ack_registry(&self) -> AckRegistryHandle {
        self.ack_handle.clone()
    }

    /// Create a subscriber sink plus its bound registry facade
    pub fn subscriber(
        &self,
        id: impl Into<String>,
    ) -> (SubscriptionManager, mpsc::Receiver<SubscriberEvent>) {
        let (subscriber, rx) =
            SubscriberRef::channel(id, self.config.publish.delivery_buffer);
        (
            SubscriptionManager::new(self.topic_handle.clone(), self.ack_handle.clone(), subscriber),
            rx,
        )
    }

    /// Per-heartbeat push of the labels declared on this node
    pub async fn add_ack_listener(&self, listener: mpsc::Sender<AckSnapshot>) {
        self.ack_handle.add_listener(listener).await;
    }

    /// Supervision lifecycle events of the registry maintainers
    pub fn supervision_events(&self) -> broadcast::Receiver<SupervisionEvent> {
        self.supervisor.events()
    }

    /// Cluster membership feed; the embedding transport publishes
    /// node-up/node-down here
    pub fn membership(&self) -> broadcast::Sender<MembershipEvent> {
        self.membership.clone()
    }

    /// Wait until both registries are active
    pub async fn started(&self) -> Result<()> {
        futures::try_join!(self.topic_task.wait_active(), self.ack_task.wait_active())?;
        Ok(())
    }

    /// Stop both registries and the supervision bridge
    pub async fn shutdown(self) {
        self.notifier_shutdown.cancel();
        self.topic_task.shutdown().await;
        self.ack_task.shutdown().await;
        info!(node = %self.node, "pubsub service stopped");
    }
}
