//! Node configuration, loadable from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::action::{AckPolicy, ActionConfig};
use crate::error::{SegrepError, SegrepResult};
use crate::remote::metadata::{MetadataHandlerRegistry, CURRENT_METADATA_VERSION};

/// Identity and storage of this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id, also written into metadata blob names.
    pub node_id: String,
    /// Root of local shard directories.
    pub data_path: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            data_path: PathBuf::from("/var/lib/segrep"),
        }
    }
}

/// Remote segment store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteStoreConfig {
    /// Upload published checkpoints.
    pub enabled: bool,
    /// Repository name, resolved through the repository registry.
    pub repository: String,
    /// Path prefix inside the repository.
    pub base_path: String,
    /// Metadata blob version written on upload.
    pub metadata_version: u32,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            repository: "segments".to_string(),
            base_path: "indices".to_string(),
            metadata_version: CURRENT_METADATA_VERSION,
        }
    }
}

/// Primary/replica dispatch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Primary re-resolutions before an action fails.
    pub max_primary_retries: u32,
    /// Pause between primary attempts.
    pub retry_backoff_ms: u64,
    /// Per-replica acknowledgement timeout.
    pub replica_ack_timeout_ms: u64,
    /// Copies that must acknowledge.
    pub ack_policy: AckPolicy,
    /// Bound of the publisher channel.
    pub checkpoint_channel_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_primary_retries: 3,
            retry_backoff_ms: 50,
            replica_ack_timeout_ms: 30_000,
            ack_policy: AckPolicy::BestEffort,
            checkpoint_channel_capacity: 1024,
        }
    }
}

impl ReplicationConfig {
    /// Settings for [`crate::action::ReplicationAction`].
    pub fn action_config(&self) -> ActionConfig {
        ActionConfig {
            max_primary_retries: self.max_primary_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            replica_ack_timeout: Duration::from_millis(self.replica_ack_timeout_ms),
            ack_policy: self.ack_policy,
        }
    }
}

/// Back-pressure on the primary when replicas fall behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Reject writes under pressure.
    pub enabled: bool,
    /// A replica further behind than this many checkpoints may be stale.
    pub max_checkpoints_behind: u64,
    /// A replica lagging longer than this may be stale.
    pub max_replication_time_ms: u64,
    /// Writes are rejected once this share of replicas is stale.
    pub max_stale_replica_fraction: f64,
    /// Replicas lagging longer than this are reported for failing; 0 disables.
    pub fail_replica_after_ms: u64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_checkpoints_behind: 4,
            max_replication_time_ms: 300_000,
            max_stale_replica_fraction: 0.5,
            fail_replica_after_ms: 0,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegrepConfig {
    /// `[node]`
    pub node: NodeConfig,
    /// `[remote_store]`
    pub remote_store: RemoteStoreConfig,
    /// `[replication]`
    pub replication: ReplicationConfig,
    /// `[pressure]`
    pub pressure: PressureConfig,
}

impl SegrepConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> SegrepResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SegrepConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| SegrepError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| SegrepError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?,
            _ => {
                return Err(SegrepError::Config {
                    reason: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> SegrepResult<()> {
        if self.replication.checkpoint_channel_capacity == 0 {
            return Err(SegrepError::Config {
                reason: "replication.checkpoint_channel_capacity must be positive".to_string(),
            });
        }
        let fraction = self.pressure.max_stale_replica_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(SegrepError::Config {
                reason: format!("pressure.max_stale_replica_fraction {} is outside (0, 1]", fraction),
            });
        }
        if self.node.node_id.is_empty() || self.node.node_id.contains("__") {
            return Err(SegrepError::Config {
                reason: format!("node.node_id {:?} is empty or contains \"__\"", self.node.node_id),
            });
        }
        MetadataHandlerRegistry::shipped().get_handler(self.remote_store.metadata_version)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = SegrepConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.remote_store.metadata_version, 2);
        assert_eq!(config.replication.max_primary_retries, 3);
        assert_eq!(config.replication.ack_policy, AckPolicy::BestEffort);
        assert_eq!(config.replication.checkpoint_channel_capacity, 1024);
        assert!(!config.pressure.enabled);
        assert_eq!(config.pressure.max_checkpoints_behind, 4);
    }

    #[test]
    fn test_action_config() {
        let config = ReplicationConfig {
            retry_backoff_ms: 10,
            replica_ack_timeout_ms: 250,
            ack_policy: AckPolicy::Quorum,
            ..Default::default()
        };
        let action = config.action_config();
        assert_eq!(action.retry_backoff, Duration::from_millis(10));
        assert_eq!(action.replica_ack_timeout, Duration::from_millis(250));
        assert_eq!(action.ack_policy, AckPolicy::Quorum);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[node]
node_id = "n7"

[remote_store]
enabled = true
repository = "s3-main"
metadata_version = 1

[replication]
ack_policy = "quorum"
replica_ack_timeout_ms = 500
            "#
        )
        .unwrap();

        let config = SegrepConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.node_id, "n7");
        assert!(config.remote_store.enabled);
        assert_eq!(config.remote_store.repository, "s3-main");
        assert_eq!(config.remote_store.metadata_version, 1);
        assert_eq!(config.replication.ack_policy, AckPolicy::Quorum);
        assert_eq!(config.replication.replica_ack_timeout_ms, 500);
        assert_eq!(config.replication.max_primary_retries, 3);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "replication": {{ "ack_policy": "all" }},
                "pressure": {{ "enabled": true, "max_stale_replica_fraction": 0.25 }}
            }}"#
        )
        .unwrap();

        let config = SegrepConfig::from_file(file.path()).unwrap();
        assert_eq!(config.replication.ack_policy, AckPolicy::All);
        assert!(config.pressure.enabled);
        assert_eq!(config.pressure.max_stale_replica_fraction, 0.25);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = SegrepConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, SegrepError::Config { .. }));
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = SegrepConfig::default();
        config.replication.checkpoint_channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = SegrepConfig::default();
        config.pressure.max_stale_replica_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = SegrepConfig::default();
        config.remote_store.metadata_version = 3;
        assert!(matches!(
            config.validate().unwrap_err(),
            SegrepError::UnsupportedVersion { version: 3, .. }
        ));
    }
}
