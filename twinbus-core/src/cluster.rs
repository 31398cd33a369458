//! Cluster identity and membership events
//!
//! Membership detection itself is an external collaborator; the core only
//! consumes a stream of node-up/node-down events and prunes registry state
//! attributable to departed nodes.

use serde::{Deserialize, Serialize};

/// Stable identity of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        NodeId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Membership change observed from the cluster membership service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node joined (or rejoined) the cluster
    NodeUp(NodeId),
    /// A node left or was declared down; all registry entries attributed
    /// to it must be removed
    NodeDown(NodeId),
}
