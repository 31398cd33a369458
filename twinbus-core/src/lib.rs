//! twinbus-core: clustered topic pub/sub with acknowledgement arbitration
//!
//! The bus replicates two registries across the cluster: a topic registry
//! holding hash-compacted subscription digests, and an ack-label registry
//! holding exclusive acknowledgement-label ownership. Both are maintained
//! by supervised tasks per node; merges are CRDT joins so replication
//! order never matters. Publishing resolves subscribers from the merged
//! views, load-balances grouped subscriptions deterministically, and
//! synthesizes weak acknowledgements when a requested label has no
//! reachable owner.

pub mod cluster;
pub mod config;
pub mod error;
pub mod hash;
pub mod pubsub;
pub mod registry;
pub mod replication;
pub mod service;

pub use cluster::{MembershipEvent, NodeId};
pub use config::TwinBusConfig;
pub use error::{Result, TwinBusError};
pub use service::{PubSubService, PubSubServiceBuilder};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types
pub mod prelude {
    pub use crate::cluster::{MembershipEvent, NodeId};
    pub use crate::config::TwinBusConfig;
    pub use crate::error::{Result, TwinBusError};
    pub use crate::pubsub::{
        Acknowledgement, Delivery, Envelope, InProcessMesh, PublishReceipt, Publisher,
        SubscriberEvent, SubscriberId, SubscriberRef, SubscriptionManager,
    };
    pub use crate::registry::{AckRegistryHandle, TopicFilter, TopicRegistryHandle};
    pub use crate::replication::{GossipHub, InMemoryStore, ReplicatedStore};
    pub use crate::service::{PubSubService, PubSubServiceBuilder};
}
