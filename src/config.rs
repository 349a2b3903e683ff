//! Configuration file support for the consensus core.
//!
//! Loads an optional `parhelion.toml` from the data directory. Every value
//! has a default drawn from [`crate::constants`], so a missing file or a
//! partial file both work.

use serde::Deserialize;
use std::path::Path;

use crate::crypto::keys::NodeId;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ParhelionConfig {
    pub consensus: ConsensusConfig,
    pub snapshot: SnapshotConfig,
    pub storage: StorageConfig,
    pub schema: SchemaConfig,
}

/// Consensus section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub max_transaction_threshold: usize,
    pub max_observation_threshold: usize,
    pub max_parallel_rounds: usize,
    pub own_round_cooldown_ms: u64,
    pub stage_timeout_ms: u64,
    pub round_total_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            max_transaction_threshold: crate::constants::MAX_TRANSACTION_THRESHOLD,
            max_observation_threshold: crate::constants::MAX_OBSERVATION_THRESHOLD,
            max_parallel_rounds: crate::constants::MAX_PARALLEL_ROUNDS,
            own_round_cooldown_ms: crate::constants::OWN_ROUND_COOLDOWN_MS,
            stage_timeout_ms: crate::constants::STAGE_TIMEOUT_MS,
            round_total_timeout_ms: crate::constants::ROUND_TOTAL_TIMEOUT_MS,
        }
    }
}

/// Snapshot section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub snapshot_height_interval: u64,
    pub snapshot_height_delay_interval: u64,
    pub active_peers_rotation_interval: u64,
    /// Total bytes the snapshot directory may use; 0 disables the limit.
    pub size_disk_limit: u64,
    pub snapshot_tick_ms: u64,
    /// Hex-encoded node ids seeded as the first active full-node pool.
    pub initial_active_full_nodes: Vec<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            snapshot_height_interval: crate::constants::SNAPSHOT_HEIGHT_INTERVAL,
            snapshot_height_delay_interval: crate::constants::SNAPSHOT_HEIGHT_DELAY_INTERVAL,
            active_peers_rotation_interval: crate::constants::ACTIVE_PEERS_ROTATION_INTERVAL,
            size_disk_limit: 0,
            snapshot_tick_ms: crate::constants::SNAPSHOT_TICK_MS,
            initial_active_full_nodes: vec![],
        }
    }
}

impl SnapshotConfig {
    /// Parse the configured initial pool, skipping malformed entries.
    pub fn parse_initial_active_full_nodes(&self) -> Vec<NodeId> {
        self.initial_active_full_nodes
            .iter()
            .filter_map(|s| {
                let bytes = hex::decode(s).ok()?;
                let id: NodeId = bytes.try_into().ok()?;
                Some(id)
            })
            .collect()
    }
}

/// Storage section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Enable off-loading snapshots to the configured object stores.
    pub enabled: bool,
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            enabled: false,
            data_dir: "./parhelion-data".into(),
        }
    }
}

/// Legacy-schema section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Snapshots at or below this height use the V1 on-disk shape.
    pub v1_snapshot_info_max_height: u64,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        SchemaConfig {
            v1_snapshot_info_max_height: 0,
        }
    }
}

impl ParhelionConfig {
    /// Load configuration from `parhelion.toml` in the given directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("parhelion.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        let config = ParhelionConfig::default();
        assert_eq!(
            config.snapshot.snapshot_height_interval,
            crate::constants::SNAPSHOT_HEIGHT_INTERVAL
        );
        assert_eq!(config.snapshot.size_disk_limit, 0);
        assert!(!config.storage.enabled);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[consensus]
max_transaction_threshold = 25

[snapshot]
snapshot_height_interval = 4
initial_active_full_nodes = ["0101010101010101010101010101010101010101010101010101010101010101"]

[storage]
enabled = true
"#;
        let config: ParhelionConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.consensus.max_transaction_threshold, 25);
        assert_eq!(config.snapshot.snapshot_height_interval, 4);
        assert!(config.storage.enabled);
        assert_eq!(
            config.snapshot.parse_initial_active_full_nodes(),
            vec![[1u8; 32]]
        );
    }

    #[test]
    fn malformed_pool_entries_skipped() {
        let config = SnapshotConfig {
            initial_active_full_nodes: vec!["zz".into(), "0a".into()],
            ..Default::default()
        };
        assert!(config.parse_initial_active_full_nodes().is_empty());
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ParhelionConfig::load(dir.path());
        assert_eq!(
            config.consensus.stage_timeout_ms,
            crate::constants::STAGE_TIMEOUT_MS
        );
    }
}
