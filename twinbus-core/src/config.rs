//! Configuration types for the twinbus core

use serde::{Deserialize, Serialize};
use std::time::Duration;
use twinbus_supervisor::SupervisionConfig;

/// Main configuration for a twinbus node
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TwinBusConfig {
    /// Identity of this node in the cluster
    pub node: NodeConfig,

    /// Hash family used for topic compaction
    pub hash: HashConfig,

    /// Registry replication configuration
    pub replication: ReplicationConfig,

    /// Restart/backoff behavior of the registry maintainers
    #[serde(default)]
    pub supervision: SupervisionConfig,

    /// Publish-side behavior
    pub publish: PublishConfig,
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node name; must be unique within the cluster.
    /// Empty means "not configured" and corrupts the registries at startup.
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node-1".to_string(),
        }
    }
}

/// Hash family configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashConfig {
    /// Ordered seeds of the hash family. All nodes must agree on these.
    pub seeds: Vec<u64>,

    /// Upper bound on hashed bucket values
    pub bucket_count: u64,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            seeds: vec![0x9e37_79b9, 0x85eb_ca6b, 0xc2b2_ae35],
            bucket_count: 1 << 16,
        }
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Number of shards the topic registry spreads its buckets over,
    /// bounding the size of a single replicated update
    pub shard_count: u32,

    /// Interval between local ack-label snapshot heartbeats
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Deadline for subscribe/unsubscribe registry calls
    #[serde(with = "humantime_serde")]
    pub subscribe_timeout: Duration,

    /// Deadline for declare/undeclare registry calls
    #[serde(with = "humantime_serde")]
    pub declare_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            shard_count: 8,
            heartbeat_interval: Duration::from_millis(500),
            subscribe_timeout: Duration::from_secs(5),
            declare_timeout: Duration::from_secs(5),
        }
    }
}

/// Publish-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Capacity of each subscriber's delivery channel
    pub delivery_buffer: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            delivery_buffer: 128,
        }
    }
}

impl TwinBusConfig {
    /// Load configuration from `twinbus.toml` and `TWINBUS_`-prefixed
    /// environment variables, with `TWINBUS_CONFIG_PATH` as an override.
    pub fn load() -> crate::error::Result<Self> {
        use figment::{
            providers::{Env, Format, Toml},
            Figment,
        };

        let mut figment = Figment::new()
            .merge(Toml::file("twinbus.toml"))
            .merge(Env::prefixed("TWINBUS_").split("_"));

        if let Ok(path) = std::env::var("TWINBUS_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: TwinBusConfig = figment.extract().map_err(|e| {
            crate::error::TwinBusError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        use figment::{
            providers::{Format, Toml},
            Figment,
        };

        let config: TwinBusConfig = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                crate::error::TwinBusError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the type system cannot express
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.hash.seeds.is_empty() {
            return Err(crate::error::TwinBusError::Configuration(
                "hash.seeds must not be empty".to_string(),
            ));
        }
        if self.hash.bucket_count == 0 {
            return Err(crate::error::TwinBusError::Configuration(
                "hash.bucket_count must be positive".to_string(),
            ));
        }
        if self.replication.shard_count == 0 {
            return Err(crate::error::TwinBusError::Configuration(
                "replication.shard_count must be positive".to_string(),
            ));
        }
        if self.publish.delivery_buffer == 0 {
            return Err(crate::error::TwinBusError::Configuration(
                "publish.delivery_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TwinBusConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_seeds_rejected() {
        let mut config = TwinBusConfig::default();
        config.hash.seeds.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_shards_rejected() {
        let mut config = TwinBusConfig::default();
        config.replication.shard_count = 0;
        assert!(config.validate().is_err());
    }
}
