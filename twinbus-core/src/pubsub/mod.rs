//! Topic-based publish/subscribe with acknowledgement arbitration

pub mod extractor;
pub mod message;
pub mod publisher;
pub mod remote;
pub mod subscriber;
pub mod subscription;

pub use extractor::{AckExtractor, EnvelopeAckExtractor, HeaderTopicExtractor, TopicExtractor};
pub use message::{AckRequest, Acknowledgement, Delivery, Envelope};
pub use publisher::{PublishReceipt, Publisher};
pub use remote::{InProcessMesh, NoRemoteDelivery, RemoteDelivery, RemotePublish};
pub use subscriber::{SubscriberEvent, SubscriberId, SubscriberRef};
pub use subscription::SubscriptionManager;
