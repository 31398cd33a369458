//! Subscriber identity and message sink

use crate::pubsub::message::{Acknowledgement, Delivery};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Address of a subscriber; equality and ordering are by address only
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        SubscriberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a subscriber can receive from the bus
#[derive(Debug, Clone)]
pub enum SubscriberEvent {
    /// A published message matching one of the subscriptions
    Message(Delivery),
    /// An acknowledgement routed back to this subscriber as a sender
    Ack(Acknowledgement),
    /// A registry maintainer this subscriber depends on died; all
    /// subscriptions/declarations are gone and must be re-established
    /// once the maintainer restarts
    RegistryTerminated { registry: String },
    /// Ack labels this subscriber thought it owned were lost to a
    /// concurrent declaration elsewhere in the cluster
    AckLabelsRevoked { labels: Vec<String> },
}

/// Addressable, watchable reference to a subscriber's message sink.
///
/// Cancelling the liveness token signals subscriber termination; the
/// registries watch it and clean up automatically.
#[derive(Debug, Clone)]
pub struct SubscriberRef {
    id: SubscriberId,
    sink: mpsc::Sender<SubscriberEvent>,
    liveness: CancellationToken,
}

impl SubscriberRef {
    /// Create a subscriber reference plus the receiving end of its sink
    pub fn channel(
        id: impl Into<String>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<SubscriberEvent>) {
        let (sink, rx) = mpsc::channel(buffer);
        (
            Self {
                id: SubscriberId::new(id),
                sink,
                liveness: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Liveness token; cancelled means the subscriber terminated
    pub fn liveness(&self) -> &CancellationToken {
        &self.liveness
    }

    /// Whether `other` is the same construction of this subscriber, not
    /// just the same address. Equality is by id; a re-constructed
    /// subscriber under the same id carries a fresh sink and token.
    pub fn same_incarnation(&self, other: &SubscriberRef) -> bool {
        self.sink.same_channel(&other.sink)
    }

    /// Whether the subscriber still counts as alive
    pub fn is_live(&self) -> bool {
        !self.liveness.is_cancelled() && !self.sink.is_closed()
    }

    /// Mark the subscriber as terminated, triggering registry cleanup
    pub fn terminate(&self) {
        self.liveness.cancel();
    }

    /// Best-effort event delivery; a full or closed sink drops the event
    /// (at-least-once overall, per-subscriber backpressure stays local)
    pub fn offer(&self, event: SubscriberEvent) -> bool {
        match self.sink.try_send(event) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(subscriber = %self.id, %err, "dropping subscriber event");
                false
            }
        }
    }
}

impl PartialEq for SubscriberRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SubscriberRef {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_by_address() {
        let (a1, _rx1) = SubscriberRef::channel("a", 4);
        let (a2, _rx2) = SubscriberRef::channel("a", 4);
        let (b, _rx3) = SubscriberRef::channel("b", 4);
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_terminate_cancels_liveness() {
        let (s, _rx) = SubscriberRef::channel("a", 4);
        assert!(s.is_live());
        s.terminate();
        assert!(!s.is_live());
    }

    #[tokio::test]
    async fn test_offer_delivers() {
        let (s, mut rx) = SubscriberRef::channel("a", 4);
        assert!(s.offer(SubscriberEvent::RegistryTerminated {
            registry: "topic".into()
        }));
        match rx.recv().await.unwrap() {
            SubscriberEvent::RegistryTerminated { registry } => assert_eq!(registry, "topic"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
