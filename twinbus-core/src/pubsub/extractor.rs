//! Collaborator traits supplied by the embedding application
//!
//! The core treats messages as opaque; the application decides which
//! topics a message is tagged with and what goes into synthetic
//! acknowledgements.

use crate::pubsub::message::Envelope;
use std::collections::{BTreeMap, BTreeSet};

/// Pulls the topic set out of a message
pub trait TopicExtractor: Send + Sync {
    fn extract_topics(&self, envelope: &Envelope) -> BTreeSet<String>;
}

/// Pulls entity identity and headers used to build weak acknowledgements
pub trait AckExtractor: Send + Sync {
    fn entity_id(&self, envelope: &Envelope) -> Option<String>;
    fn headers(&self, envelope: &Envelope) -> BTreeMap<String, String>;
}

/// Default extractor: topics come from the `topics` header,
/// comma-separated, empty entries skipped
#[derive(Debug, Clone, Default)]
pub struct HeaderTopicExtractor;

impl TopicExtractor for HeaderTopicExtractor {
    fn extract_topics(&self, envelope: &Envelope) -> BTreeSet<String> {
        envelope
            .headers
            .get("topics")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Default ack extractor: entity id and headers straight off the envelope
#[derive(Debug, Clone, Default)]
pub struct EnvelopeAckExtractor;

impl AckExtractor for EnvelopeAckExtractor {
    fn entity_id(&self, envelope: &Envelope) -> Option<String> {
        envelope.entity_id.clone()
    }

    fn headers(&self, envelope: &Envelope) -> BTreeMap<String, String> {
        envelope.headers.clone()
    }
}
