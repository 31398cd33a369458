//! Per-subscriber facade over the two registries

use crate::error::Result;
use crate::pubsub::subscriber::SubscriberRef;
use crate::registry::acks::{AckRegistryHandle, DeclareAck};
use crate::registry::topic::{SubscribeAck, TopicFilter, TopicRegistryHandle, UnsubscribeAck};
use std::collections::BTreeSet;

/// Convenience wrapper binding one subscriber to the registries.
///
/// Everything here is also reachable through the registry handles
/// directly; the manager just carries the subscriber reference so
/// call sites stay short.
#[derive(Clone)]
pub struct SubscriptionManager {
    topics: TopicRegistryHandle,
    acks: AckRegistryHandle,
    subscriber: SubscriberRef,
}

impl SubscriptionManager {
    pub(crate) fn new(
        topics: TopicRegistryHandle,
        acks: AckRegistryHandle,
        subscriber: SubscriberRef,
    ) -> Self {
        Self {
            topics,
            acks,
            subscriber,
        }
    }

    pub fn subscriber(&self) -> &SubscriberRef {
        &self.subscriber
    }

    /// Subscribe to `topics`, replacing any previous subscription
    pub async fn subscribe(&self, topics: BTreeSet<String>) -> Result<SubscribeAck> {
        self.topics
            .subscribe(self.subscriber.clone(), topics, None, None)
            .await
    }

    /// Subscribe as a member of a load-balanced group
    pub async fn subscribe_in_group(
        &self,
        topics: BTreeSet<String>,
        group: impl Into<String>,
    ) -> Result<SubscribeAck> {
        self.topics
            .subscribe(self.subscriber.clone(), topics, Some(group.into()), None)
            .await
    }

    /// Subscribe with a delivery-time filter predicate
    pub async fn subscribe_filtered(
        &self,
        topics: BTreeSet<String>,
        group: Option<String>,
        filter: TopicFilter,
    ) -> Result<SubscribeAck> {
        self.topics
            .subscribe(self.subscriber.clone(), topics, group, Some(filter))
            .await
    }

    /// Drop `topics` from the subscription
    pub async fn unsubscribe(&self, topics: BTreeSet<String>) -> Result<UnsubscribeAck> {
        self.topics
            .unsubscribe(self.subscriber.id().clone(), topics)
            .await
    }

    /// Claim exclusive ownership of ack labels
    pub async fn declare_acks(
        &self,
        labels: BTreeSet<String>,
        group: Option<String>,
    ) -> Result<DeclareAck> {
        self.acks
            .declare(self.subscriber.clone(), labels, group)
            .await
    }

    /// Release every ack label this subscriber owns
    pub async fn undeclare_acks(&self) -> Result<()> {
        self.acks.undeclare(self.subscriber.id().clone()).await
    }

    /// Terminate the subscriber; the registries clean up on their own
    pub fn terminate(&self) {
        self.subscriber.terminate();
    }
}
