//! Error types for twinbus operations

/// Result type for twinbus operations
pub type Result<T> = std::result::Result<T, TwinBusError>;

/// Error types for the twinbus core
#[derive(Debug, thiserror::Error)]
pub enum TwinBusError {
    /// One or more ack labels are already owned by another subscriber
    #[error("Ack label conflict: {labels:?}")]
    Conflict {
        /// The labels that clashed with an existing declaration
        labels: Vec<String>,
    },

    /// A registry maintainer is not started, restarting, or corrupted
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// A registry maintainer died while the caller held live state;
    /// the caller must resubscribe/redeclare from scratch
    #[error("Registry terminated: {0}")]
    Terminated(String),

    /// Topic failed validation (empty, or otherwise unusable)
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// A registry call did not complete within its deadline
    #[error("Registry call timed out: {0}")]
    Timeout(String),

    /// Replicated store reported a failure
    #[error("Replication error: {0}")]
    Replication(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for TwinBusError {
    fn from(s: String) -> Self {
        TwinBusError::Other(s)
    }
}

impl From<&str> for TwinBusError {
    fn from(s: &str) -> Self {
        TwinBusError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for TwinBusError {
    fn from(err: anyhow::Error) -> Self {
        TwinBusError::Other(err.to_string())
    }
}

impl From<twinbus_supervisor::SupervisorError> for TwinBusError {
    fn from(err: twinbus_supervisor::SupervisorError) -> Self {
        match err {
            twinbus_supervisor::SupervisorError::Unavailable(unit) => {
                TwinBusError::Unavailable(unit)
            }
            other => TwinBusError::Other(other.to_string()),
        }
    }
}
