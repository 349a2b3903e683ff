//! Rollback: restoring full node state from an external object store.
//!
//! Artifacts live under `<height>-<hash>-snapshot`,
//! `<height>-<hash>-snapshot_info`, and `genesis-observation` keys across an
//! ordered list of backends; reads fail over head to tail. Snapshots at or
//! below the configured legacy height use the V1 on-disk shape and are
//! migrated on the way in.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::acceptance::AcceptancePipeline;
use crate::address::AddressCache;
use crate::checkpoint::{CheckpointCache, GenesisObservation, ParentRef};
use crate::cluster::{ActiveNodes, ClusterService};
use crate::config::SnapshotConfig;
use crate::crypto::keys::NodeId;
use crate::dag::TipData;
use crate::snapshot::{Snapshot, SnapshotInfo, SnapshotService, StoredSnapshot};
use crate::storage::{
    deserialize_artifact, serialize_artifact, MetaStorage, ObjectStore, ObjectStoreError,
    SnapshotFileStorage, StorageError,
};
use crate::transaction::{Address, TxRef};
use crate::Hash;

/// Errors from a rollback attempt.
#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("no snapshot found in any object store")]
    SnapshotNotFound,
    #[error("all object-store backends failed: {0}")]
    CloudRead(String),
    #[error("snapshot contains negative balances")]
    InvalidBalances,
    #[error("legacy snapshot migration failed: {0}")]
    Migration(String),
    #[error("genesis observation missing from the object store")]
    MissingGenesis,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ── V1 legacy shapes ──
// Early snapshots predate active-pool rotation and the resumable tip and
// chain maps; everything missing is reconstructed from the sealed blocks.

#[derive(Debug, Deserialize)]
struct SnapshotV1 {
    last_snapshot: Hash,
    checkpoint_blocks: Vec<Hash>,
    public_reputation: Vec<(NodeId, f64)>,
}

#[derive(Debug, Deserialize)]
struct StoredSnapshotV1 {
    snapshot: SnapshotV1,
    checkpoint_cache: Vec<CheckpointCache>,
}

#[derive(Debug, Deserialize)]
struct SnapshotInfoV1 {
    snapshot: StoredSnapshotV1,
    accepted_cb_since_snapshot: Vec<Hash>,
    last_snapshot_height: u64,
    snapshot_hashes: Vec<Hash>,
    address_cache_data: HashMap<Address, AddressCache>,
}

/// Restores node state from the object store.
pub struct RollbackService {
    stores: Vec<Arc<dyn ObjectStore>>,
    pipeline: Arc<AcceptancePipeline>,
    snapshots: Arc<SnapshotService>,
    cluster: Arc<ClusterService>,
    files: Arc<SnapshotFileStorage>,
    meta: Arc<MetaStorage>,
    config: SnapshotConfig,
    v1_max_height: u64,
}

impl RollbackService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Vec<Arc<dyn ObjectStore>>,
        pipeline: Arc<AcceptancePipeline>,
        snapshots: Arc<SnapshotService>,
        cluster: Arc<ClusterService>,
        files: Arc<SnapshotFileStorage>,
        meta: Arc<MetaStorage>,
        config: SnapshotConfig,
        v1_max_height: u64,
    ) -> Self {
        RollbackService {
            stores,
            pipeline,
            snapshots,
            cluster,
            files,
            meta,
            config,
            v1_max_height,
        }
    }

    /// Object key for a snapshot artifact.
    pub fn snapshot_key(height: u64, hash: &Hash) -> String {
        format!("{height}-{}-snapshot", crate::hash_hex(hash))
    }

    /// Object key for a snapshot-info artifact.
    pub fn snapshot_info_key(height: u64, hash: &Hash) -> String {
        format!("{height}-{}-snapshot_info", crate::hash_hex(hash))
    }

    /// Read one object, failing over across backends in order.
    async fn read_object(&self, key: &str) -> Result<Vec<u8>, RollbackError> {
        let mut last_err = String::from("no object stores configured");
        for store in &self.stores {
            match store.get(key).await {
                Ok(bytes) => return Ok(bytes),
                Err(ObjectStoreError::NotFound(_)) => {
                    last_err = format!("{key} not found");
                }
                Err(e) => {
                    tracing::warn!(key, %e, "object store read failed, trying next backend");
                    last_err = e.to_string();
                }
            }
        }
        Err(RollbackError::CloudRead(last_err))
    }

    /// Restore node state from the snapshot at `(height, hash)`.
    pub async fn rollback_to(&self, height: u64, hash: Hash) -> Result<(), RollbackError> {
        tracing::info!(height, hash = %crate::hash_hex(&hash), "rollback started");

        let info_bytes = self
            .read_object(&Self::snapshot_info_key(height, &hash))
            .await?;
        let info = if height <= self.v1_max_height {
            self.migrate_v1(&info_bytes, height)?
        } else {
            deserialize_artifact::<SnapshotInfo>(&info_bytes)?
        };

        let genesis_bytes = self
            .read_object("genesis-observation")
            .await
            .map_err(|_| RollbackError::MissingGenesis)?;
        let genesis: GenesisObservation = deserialize_artifact(&genesis_bytes)?;

        if info
            .address_cache_data
            .values()
            .any(|cache| cache.balance < 0)
        {
            return Err(RollbackError::InvalidBalances);
        }

        // Apply.
        self.cluster.set_participated_in_rollback().await;
        self.pipeline.accept_genesis(&genesis).await;

        let stored_bytes = serialize_artifact(&info.snapshot)?;
        self.files.write_snapshot(&hash, &stored_bytes).await?;
        self.files
            .write_snapshot_info(&hash, &serialize_artifact(&info)?)
            .await?;

        let mut info = info;
        info.last_snapshot_height = height;
        self.snapshots.restore(info).await;

        let joined = height.saturating_sub(self.config.snapshot_height_interval);
        self.cluster.set_joined_height(joined).await;
        self.meta.set_last_majority_state(height, &hash)?;

        tracing::info!(height, joined, "rollback complete");
        Ok(())
    }

    /// Find the highest snapshot available in the stores and restore it.
    pub async fn rollback_to_highest(&self) -> Result<(u64, Hash), RollbackError> {
        let mut best: Option<(u64, Hash)> = None;
        for store in &self.stores {
            let Ok(keys) = store.list().await else { continue };
            for key in keys {
                if let Some((height, hash)) = parse_snapshot_key(&key) {
                    if best.map(|(h, _)| height > h).unwrap_or(true) {
                        best = Some((height, hash));
                    }
                }
            }
            if best.is_some() {
                break;
            }
        }
        let (height, hash) = best.ok_or(RollbackError::SnapshotNotFound)?;
        self.rollback_to(height, hash).await?;
        Ok((height, hash))
    }

    /// Lift a V1 snapshot-info into the current shape.
    fn migrate_v1(&self, bytes: &[u8], height: u64) -> Result<SnapshotInfo, RollbackError> {
        let v1: SnapshotInfoV1 = deserialize_artifact(bytes)
            .map_err(|e| RollbackError::Migration(e.to_string()))?;

        // V1 predates pool rotation: seed the pool from configuration.
        let next_active_nodes = ActiveNodes {
            full: self
                .config
                .parse_initial_active_full_nodes()
                .into_iter()
                .collect(),
            light: Default::default(),
        };
        let snapshot = Snapshot {
            last_snapshot: v1.snapshot.snapshot.last_snapshot,
            checkpoint_blocks: v1.snapshot.snapshot.checkpoint_blocks,
            public_reputation: v1.snapshot.snapshot.public_reputation,
            next_active_nodes,
        };

        // Rebuild the tip set from the highest sealed blocks and the chain
        // heads from the sealed transactions.
        let caches = v1.snapshot.checkpoint_cache;
        let mut by_height: Vec<&CheckpointCache> = caches.iter().collect();
        by_height.sort_by_key(|c| std::cmp::Reverse(c.height.unwrap_or(0)));
        let tips: HashMap<Hash, TipData> = by_height
            .iter()
            .take(crate::constants::MAX_TIPS)
            .map(|c| {
                (
                    c.soe_hash,
                    TipData {
                        reference: ParentRef {
                            soe_hash: c.soe_hash,
                            base_hash: c.base_hash,
                        },
                        height: c.height.unwrap_or(height),
                        num_uses: 0,
                        facilitators: c.block.signatures.iter().map(|s| s.id).collect(),
                    },
                )
            })
            .collect();

        let mut last_accepted_tx_ref: HashMap<Address, TxRef> = HashMap::new();
        for cache in &caches {
            for tx in &cache.block.transactions {
                let entry = last_accepted_tx_ref
                    .entry(tx.sender)
                    .or_insert_with(|| tx.tx_ref());
                if tx.ordinal > entry.ordinal {
                    *entry = tx.tx_ref();
                }
            }
        }

        Ok(SnapshotInfo {
            snapshot: StoredSnapshot {
                snapshot,
                checkpoint_cache: caches,
            },
            accepted_cb_since_snapshot: v1.accepted_cb_since_snapshot,
            last_snapshot_height: v1.last_snapshot_height,
            snapshot_hashes: v1.snapshot_hashes,
            address_cache_data: v1.address_cache_data,
            tips,
            last_accepted_tx_ref,
        })
    }
}

/// Parse `<height>-<hash>-snapshot` keys; anything else is ignored.
fn parse_snapshot_key(key: &str) -> Option<(u64, Hash)> {
    let rest = key.strip_suffix("-snapshot")?;
    let (height_str, hash_str) = rest.split_once('-')?;
    let height = height_str.parse().ok()?;
    let bytes = hex::decode(hash_str).ok()?;
    let hash: Hash = bytes.try_into().ok()?;
    Some((height, hash))
}
