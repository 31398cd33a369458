//! Published message envelope and acknowledgement types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Opaque, addressable payload carried through the bus.
///
/// The core never inspects the payload; topics and ack metadata are pulled
/// out by the embedding application's extractors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Message id for subscriber-side deduplication
    pub id: Uuid,

    /// Payload (JSON)
    pub payload: serde_json::Value,

    /// Transport headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Entity the message concerns, if any (digital-twin id)
    #[serde(default)]
    pub entity_id: Option<String>,

    /// Acknowledgement labels the publisher wants confirmed
    #[serde(default)]
    pub ack_requests: Vec<AckRequest>,

    /// Publish timestamp
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope with a fresh id
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            headers: BTreeMap::new(),
            entity_id: None,
            ack_requests: Vec::new(),
            published_at: Utc::now(),
        }
    }

    /// Builder: set a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builder: set the entity id
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Builder: request an acknowledgement for `label`
    pub fn requesting_ack(mut self, label: impl Into<String>) -> Self {
        self.ack_requests.push(AckRequest {
            label: label.into(),
        });
        self
    }
}

/// Request for a subscriber-side acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckRequest {
    /// The ack label whose owner should confirm receipt
    pub label: String,
}

/// Acknowledgement flowing back to the publisher.
///
/// `weak` is set when no reachable, authorized subscriber owns the label
/// and the bus synthesized the response itself so the sender does not
/// block forever.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Acknowledgement {
    pub label: String,
    pub entity_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub weak: bool,
}

/// A message delivered to a subscriber, with the sender's address and the
/// node it published from (needed to route acknowledgements back)
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: Envelope,
    pub sender: crate::pubsub::subscriber::SubscriberId,
    pub origin: crate::cluster::NodeId,
}
