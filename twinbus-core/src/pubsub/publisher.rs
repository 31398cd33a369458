//! Publish-side routing
//!
//! Routing works off the watch views the registries maintain: the compact
//! cluster snapshot narrows candidates cheaply, and the exact local route
//! table re-checks literal topics before anything is handed to a
//! subscriber, so hash collisions never cause a spurious delivery on the
//! receiving node.

use crate::cluster::NodeId;
use crate::error::Result;
use crate::hash::{self, HashFamily, TopicBucket};
use crate::pubsub::extractor::{AckExtractor, TopicExtractor};
use crate::pubsub::message::{Acknowledgement, Delivery, Envelope};
use crate::pubsub::remote::{RemoteDelivery, RemotePublish};
use crate::pubsub::subscriber::{SubscriberEvent, SubscriberId, SubscriberRef};
use crate::registry::acks::ClusterAckView;
use crate::registry::topic::{LocalRouteTable, TopicSnapshot};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Outcome summary of a publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Subscribers on this node the message was handed to
    pub delivered_local: usize,
    /// Other nodes the message was forwarded to
    pub forwarded_nodes: usize,
    /// Acknowledgements synthesized because no reachable owner was targeted
    pub weak_acks: usize,
}

/// Resolves subscribers for a message and fans it out, locally and across
/// the cluster
pub struct Publisher {
    node: NodeId,
    hash: HashFamily,
    topics: Arc<dyn TopicExtractor>,
    acks: Arc<dyn AckExtractor>,
    remote: Arc<dyn RemoteDelivery>,
    snapshot: watch::Receiver<TopicSnapshot>,
    routes: watch::Receiver<LocalRouteTable>,
    cluster_acks: watch::Receiver<ClusterAckView>,
}

impl Publisher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node: NodeId,
        hash: HashFamily,
        topics: Arc<dyn TopicExtractor>,
        acks: Arc<dyn AckExtractor>,
        remote: Arc<dyn RemoteDelivery>,
        snapshot: watch::Receiver<TopicSnapshot>,
        routes: watch::Receiver<LocalRouteTable>,
        cluster_acks: watch::Receiver<ClusterAckView>,
    ) -> Self {
        Self {
            node,
            hash,
            topics,
            acks,
            remote,
            snapshot,
            routes,
            cluster_acks,
        }
    }

    /// Publish `envelope` on behalf of `sender`.
    ///
    /// Grouped subscriptions receive the message on exactly one member,
    /// picked deterministically from `routing_key` (falling back to the
    /// entity id, then the message id, so the same entity stays sticky to
    /// the same member). Ungrouped matches all receive it. For every
    /// requested ack label whose owner is not among the resolved targets,
    /// a weak acknowledgement is synthesized back to the sender
    /// immediately.
    pub async fn publish(
        &self,
        envelope: Envelope,
        routing_key: Option<&str>,
        sender: &SubscriberRef,
    ) -> Result<PublishReceipt> {
        let acks = self.acks.clone();
        self.publish_inner(envelope, routing_key, sender, acks.as_ref())
            .await
    }

    /// Like [`Publisher::publish`] but with a per-call ack extractor, for
    /// senders whose ack metadata does not live on the envelope
    pub async fn publish_with_acks(
        &self,
        envelope: Envelope,
        routing_key: Option<&str>,
        acks: &dyn AckExtractor,
        sender: &SubscriberRef,
    ) -> Result<PublishReceipt> {
        self.publish_inner(envelope, routing_key, sender, acks).await
    }

    async fn publish_inner(
        &self,
        envelope: Envelope,
        routing_key: Option<&str>,
        sender: &SubscriberRef,
        acks: &dyn AckExtractor,
    ) -> Result<PublishReceipt> {
        let topics = self.topics.extract_topics(&envelope);
        let mut receipt = PublishReceipt::default();

        let publish_digest = self.publish_digest(&topics);
        let prefix_set = prefix_set(&topics);
        let snapshot = self.snapshot.borrow().clone();
        let routes = self.routes.borrow().clone();

        // Who the message is going to; used for weak-ack synthesis below.
        let mut targeted: BTreeSet<SubscriberId> = BTreeSet::new();

        // Ungrouped: every matching subscriber, locals directly and one
        // forward per node holding remote matches.
        let mut remote_plain: BTreeSet<NodeId> = BTreeSet::new();
        // Grouped: collect matching members per group, then pick one.
        let mut groups: BTreeMap<String, Vec<(NodeId, SubscriberId)>> = BTreeMap::new();

        for entry in &snapshot.entries {
            let matched = entry
                .digests
                .iter()
                .any(|d| !d.is_empty() && HashFamily::matches(d, &publish_digest));
            if !matched {
                continue;
            }
            match &entry.group {
                Some(group) => groups
                    .entry(group.clone())
                    .or_default()
                    .push((entry.node.clone(), entry.subscriber.clone())),
                None => {
                    if entry.node == self.node {
                        if self.deliver_to_route(&routes, &entry.subscriber, &envelope, sender.id(), &prefix_set)
                        {
                            receipt.delivered_local += 1;
                            targeted.insert(entry.subscriber.clone());
                        }
                    } else {
                        remote_plain.insert(entry.node.clone());
                        targeted.insert(entry.subscriber.clone());
                    }
                }
            }
        }

        let key = routing_key
            .map(str::to_string)
            .or_else(|| envelope.entity_id.clone())
            .unwrap_or_else(|| envelope.id.to_string());
        let mut remote_grouped: BTreeMap<NodeId, Vec<SubscriberId>> = BTreeMap::new();
        for (group, mut members) in groups {
            members.sort();
            members.dedup();
            let index =
                (self.hash.digest(&key, 1)[0] % members.len() as u64) as usize;
            let (node, subscriber) = members[index].clone();
            debug!(%group, member = %subscriber, "group member selected");
            if node == self.node {
                if self.deliver_to_route(&routes, &subscriber, &envelope, sender.id(), &prefix_set) {
                    receipt.delivered_local += 1;
                    targeted.insert(subscriber);
                }
            } else {
                remote_grouped.entry(node).or_default().push(subscriber.clone());
                targeted.insert(subscriber);
            }
        }

        for node in &remote_plain {
            self.remote
                .deliver(
                    node,
                    RemotePublish {
                        envelope: envelope.clone(),
                        sender: sender.id().clone(),
                        origin: self.node.clone(),
                        targets: None,
                    },
                )
                .await?;
            receipt.forwarded_nodes += 1;
        }
        for (node, targets) in remote_grouped {
            self.remote
                .deliver(
                    &node,
                    RemotePublish {
                        envelope: envelope.clone(),
                        sender: sender.id().clone(),
                        origin: self.node.clone(),
                        targets: Some(targets),
                    },
                )
                .await?;
            if !remote_plain.contains(&node) {
                receipt.forwarded_nodes += 1;
            }
        }

        receipt.weak_acks = self.synthesize_weak_acks(&envelope, &targeted, sender, acks);
        Ok(receipt)
    }

    /// Local fan-out on the receiving node of a forwarded publish
    pub fn deliver_remote(&self, publish: RemotePublish) {
        let topics = self.topics.extract_topics(&publish.envelope);
        let prefix_set = prefix_set(&topics);
        let routes = self.routes.borrow().clone();

        match &publish.targets {
            Some(targets) => {
                for subscriber in targets {
                    self.deliver_forwarded(&routes, subscriber, &publish, &prefix_set);
                }
            }
            None => {
                let ungrouped: Vec<SubscriberId> = routes
                    .routes
                    .iter()
                    .filter(|(_, route)| route.group.is_none())
                    .map(|(id, _)| id.clone())
                    .collect();
                for subscriber in &ungrouped {
                    self.deliver_forwarded(&routes, subscriber, &publish, &prefix_set);
                }
            }
        }
    }

    /// Route an acknowledgement back to the sender of a delivery
    pub async fn acknowledge(
        &self,
        delivery: &Delivery,
        ack: Acknowledgement,
    ) -> Result<()> {
        if delivery.origin == self.node {
            self.deliver_ack(&delivery.sender, ack);
            Ok(())
        } else {
            self.remote
                .acknowledge(&delivery.origin, delivery.sender.clone(), ack)
                .await
        }
    }

    /// Hand an acknowledgement to a sender on this node. Senders that are
    /// not registered subscribers cannot be reached this way.
    pub fn deliver_ack(&self, sender: &SubscriberId, ack: Acknowledgement) {
        let routes = self.routes.borrow();
        match routes.routes.get(sender) {
            Some(route) => {
                route.subscriber.offer(SubscriberEvent::Ack(ack));
            }
            None => {
                warn!(%sender, "dropping acknowledgement for unknown sender");
            }
        }
    }

    fn publish_digest(&self, topics: &BTreeSet<String>) -> BTreeSet<TopicBucket> {
        let mut digest = BTreeSet::new();
        for topic in topics {
            digest.extend(self.hash.prefix_buckets(topic));
        }
        digest
    }

    fn deliver_to_route(
        &self,
        routes: &LocalRouteTable,
        subscriber: &SubscriberId,
        envelope: &Envelope,
        sender: &SubscriberId,
        prefix_set: &BTreeSet<String>,
    ) -> bool {
        let Some(route) = routes.routes.get(subscriber) else {
            return false;
        };
        // Exact re-check: the snapshot match may be a hash false positive.
        if !route.topics.iter().any(|t| prefix_set.contains(t)) {
            return false;
        }
        if let Some(filter) = &route.filter {
            if !filter.accepts(envelope) {
                return false;
            }
        }
        route.subscriber.offer(SubscriberEvent::Message(Delivery {
            envelope: envelope.clone(),
            sender: sender.clone(),
            origin: self.node.clone(),
        }))
    }

    fn deliver_forwarded(
        &self,
        routes: &LocalRouteTable,
        subscriber: &SubscriberId,
        publish: &RemotePublish,
        prefix_set: &BTreeSet<String>,
    ) {
        let Some(route) = routes.routes.get(subscriber) else {
            debug!(%subscriber, "forwarded target not on this node anymore");
            return;
        };
        if !route.topics.iter().any(|t| prefix_set.contains(t)) {
            return;
        }
        if let Some(filter) = &route.filter {
            if !filter.accepts(&publish.envelope) {
                return;
            }
        }
        route.subscriber.offer(SubscriberEvent::Message(Delivery {
            envelope: publish.envelope.clone(),
            sender: publish.sender.clone(),
            origin: publish.origin.clone(),
        }));
    }

    /// For each requested ack label with no reachable owner among the
    /// resolved targets, answer the sender with a weak acknowledgement so
    /// it never waits on an ack nobody will send.
    fn synthesize_weak_acks(
        &self,
        envelope: &Envelope,
        targeted: &BTreeSet<SubscriberId>,
        sender: &SubscriberRef,
        acks: &dyn AckExtractor,
    ) -> usize {
        if envelope.ack_requests.is_empty() {
            return 0;
        }
        let owners = self.cluster_acks.borrow().clone();
        let mut synthesized = 0;
        for request in &envelope.ack_requests {
            let expected = owners
                .owners
                .get(&request.label)
                .map(|owner| targeted.contains(&owner.subscriber))
                .unwrap_or(false);
            if expected {
                continue;
            }
            debug!(label = %request.label, "synthesizing weak acknowledgement");
            sender.offer(SubscriberEvent::Ack(Acknowledgement {
                label: request.label.clone(),
                entity_id: acks.entity_id(envelope),
                headers: acks.headers(envelope),
                weak: true,
            }));
            synthesized += 1;
        }
        synthesized
    }
}

fn prefix_set(topics: &BTreeSet<String>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for topic in topics {
        out.extend(hash::prefixes(topic).map(str::to_string));
    }
    out
}
