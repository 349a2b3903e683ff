//! Snapshot sealing: condensing accepted height intervals into persisted,
//! hash-chained snapshots.
//!
//! Every `snapshot_height_interval` heights the service seals the interval
//! `(last_snapshot_height, last_snapshot_height + interval]`: the blocks in
//! it leave the in-memory DAG, their hashes form the next [`Snapshot`], and
//! the self-contained [`StoredSnapshot`] plus the resumable [`SnapshotInfo`]
//! go to disk. Artifacts are written before any state mutates, so a failed
//! write never leaves the node half-sealed; the in-memory commit itself
//! happens under the admission gate so no block lands mid-seal.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::acceptance::{AcceptancePipeline, AcceptedCbLog};
use crate::address::{AddressCache, AddressService};
use crate::chain::TransactionChainService;
use crate::checkpoint::CheckpointCache;
use crate::cluster::{ActiveNodes, ClusterService};
use crate::config::SnapshotConfig;
use crate::crypto::keys::{NodeId, NodeKeypair};
use crate::dag::{CheckpointStorage, TipData, TipService};
use crate::mempool::PendingObservationPool;
use crate::observation::{Observation, ObservationKind};
use crate::storage::{serialize_artifact, MetaStorage, SnapshotFileStorage};
use crate::transaction::{Address, TxRef};
use crate::Hash;

/// A sealed interval: hash-chained summary of its accepted blocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Hash of the preceding snapshot (all-zero for the chain head).
    pub last_snapshot: Hash,
    /// Base hashes of the sealed blocks, sorted.
    pub checkpoint_blocks: Vec<Hash>,
    /// Reputation of every known node at seal time, sorted by id.
    pub public_reputation: Vec<(NodeId, f64)>,
    /// The pool authorized to facilitate until the next rotation.
    pub next_active_nodes: ActiveNodes,
}

impl Snapshot {
    /// The chain head before any interval has been sealed.
    pub fn zero(initial_active: ActiveNodes) -> Self {
        Snapshot {
            last_snapshot: [0u8; 32],
            checkpoint_blocks: Vec::new(),
            public_reputation: Vec::new(),
            next_active_nodes: initial_active,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.last_snapshot == [0u8; 32] && self.checkpoint_blocks.is_empty()
    }

    pub fn hash(&self) -> Hash {
        let bytes = serialize_artifact(self).unwrap_or_default();
        crate::hash_domain(b"parhelion.snapshot", &bytes)
    }
}

/// The self-contained persisted form: the snapshot plus its blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub snapshot: Snapshot,
    pub checkpoint_cache: Vec<CheckpointCache>,
}

/// Everything needed to resume a node at a snapshot boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot: StoredSnapshot,
    pub accepted_cb_since_snapshot: Vec<Hash>,
    pub last_snapshot_height: u64,
    pub snapshot_hashes: Vec<Hash>,
    pub address_cache_data: HashMap<Address, AddressCache>,
    pub tips: HashMap<Hash, TipData>,
    pub last_accepted_tx_ref: HashMap<Address, TxRef>,
}

/// Why a snapshot attempt did not seal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("node is not in the active full-node pool")]
    NodeNotInActivePool,
    #[error("node has not been active across the interval ending at {0}")]
    ActiveBetweenHeightsNotMet(u64),
    #[error("not enough usable disk space ({0} bytes free)")]
    NotEnoughSpace(u64),
    #[error("accepted-hash backlog exceeded its limit ({0} entries); trimmed")]
    TooManyAcceptedHashes(usize),
    #[error("no blocks accepted since the last snapshot")]
    NoAcceptedBlocksSinceSnapshot,
    #[error("minimum tip height {min_tip:?} has not passed the seal point {seal_point}")]
    HeightIntervalNotMet {
        min_tip: Option<u64>,
        seal_point: u64,
    },
    #[error("no accepted blocks fall within the height interval")]
    NoBlocksWithinInterval,
    #[error("another snapshot attempt is already running")]
    IllegalState,
    #[error("snapshot write failed after retries: {0}")]
    Io(String),
}

struct SnapshotState {
    stored: StoredSnapshot,
    last_snapshot_height: u64,
    snapshot_hashes: Vec<Hash>,
}

/// Seals height intervals into snapshots.
pub struct SnapshotService {
    keypair: NodeKeypair,
    config: SnapshotConfig,
    storage: Arc<CheckpointStorage>,
    tips: Arc<TipService>,
    addresses: Arc<AddressService>,
    chain: Arc<TransactionChainService>,
    cluster: Arc<ClusterService>,
    obs_pool: Arc<PendingObservationPool>,
    pipeline: Arc<AcceptancePipeline>,
    accepted_log: Arc<AcceptedCbLog>,
    files: Arc<SnapshotFileStorage>,
    meta: Arc<MetaStorage>,
    state: Mutex<SnapshotState>,
    /// Serializes whole snapshot attempts.
    attempt_guard: Mutex<()>,
    io_failures: AtomicU64,
}

impl SnapshotService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: NodeKeypair,
        config: SnapshotConfig,
        storage: Arc<CheckpointStorage>,
        tips: Arc<TipService>,
        addresses: Arc<AddressService>,
        chain: Arc<TransactionChainService>,
        cluster: Arc<ClusterService>,
        obs_pool: Arc<PendingObservationPool>,
        pipeline: Arc<AcceptancePipeline>,
        accepted_log: Arc<AcceptedCbLog>,
        files: Arc<SnapshotFileStorage>,
        meta: Arc<MetaStorage>,
    ) -> Self {
        let initial_active = ActiveNodes {
            full: config.parse_initial_active_full_nodes().into_iter().collect(),
            light: Default::default(),
        };
        SnapshotService {
            keypair,
            config,
            storage,
            tips,
            addresses,
            chain,
            cluster,
            obs_pool,
            pipeline,
            accepted_log,
            files,
            meta,
            state: Mutex::new(SnapshotState {
                stored: StoredSnapshot {
                    snapshot: Snapshot::zero(initial_active),
                    checkpoint_cache: Vec::new(),
                },
                last_snapshot_height: 0,
                snapshot_hashes: Vec::new(),
            }),
            attempt_guard: Mutex::new(()),
            io_failures: AtomicU64::new(0),
        }
    }

    pub async fn last_snapshot_height(&self) -> u64 {
        self.state.lock().await.last_snapshot_height
    }

    pub async fn stored_snapshot(&self) -> StoredSnapshot {
        self.state.lock().await.stored.clone()
    }

    pub fn io_failures(&self) -> u64 {
        self.io_failures.load(Ordering::Relaxed)
    }

    /// Attempt to seal the next height interval. Precondition failures are
    /// typed and side-effect free (except the self-healing backlog trim);
    /// on success the new snapshot's hash is returned.
    pub async fn attempt_snapshot(&self) -> Result<Hash, SnapshotError> {
        let Ok(_attempt) = self.attempt_guard.try_lock() else {
            return Err(SnapshotError::IllegalState);
        };

        let (last_height, prev_snapshot) = {
            let state = self.state.lock().await;
            (state.last_snapshot_height, state.stored.snapshot.clone())
        };
        let next_height = last_height + self.config.snapshot_height_interval;

        // Preconditions, cheapest first.
        let own_id = self.cluster.own_id().await;
        if !prev_snapshot.next_active_nodes.full.contains(&own_id) {
            return Err(SnapshotError::NodeNotInActivePool);
        }
        if !self.cluster.active_between(next_height).await {
            return Err(SnapshotError::ActiveBetweenHeightsNotMet(next_height));
        }
        let free = self.files.usable_space();
        if free < crate::constants::MIN_SNAPSHOT_FREE_SPACE_BYTES {
            return Err(SnapshotError::NotEnoughSpace(free));
        }
        let backlog = self.accepted_log.len().await;
        if backlog > crate::constants::MAX_ACCEPTED_CB_HASHES_IN_MEMORY {
            self.accepted_log
                .trim_to(crate::constants::ACCEPTED_CB_TRIM_LEN)
                .await;
            return Err(SnapshotError::TooManyAcceptedHashes(backlog));
        }
        if backlog == 0 {
            return Err(SnapshotError::NoAcceptedBlocksSinceSnapshot);
        }
        let min_tip = self.tips.min_tip_height().await;
        let seal_point = next_height + self.config.snapshot_height_delay_interval;
        if min_tip.map(|h| h <= seal_point).unwrap_or(true) {
            return Err(SnapshotError::HeightIntervalNotMet { min_tip, seal_point });
        }
        // Block admissions from here on: the interval query, the artifact
        // write, and the commit must all see the same DAG.
        let gate = self.pipeline.lock_admissions().await;

        let blocks = self.storage.blocks_in_interval(last_height, next_height).await;
        if blocks.is_empty() {
            return Err(SnapshotError::NoBlocksWithinInterval);
        }

        let mut all_blocks = blocks;
        all_blocks.sort_by(|a, b| a.base_hash.cmp(&b.base_hash));
        let hashes: Vec<Hash> = all_blocks.iter().map(|c| c.base_hash).collect();

        let next_active_nodes = self
            .compute_next_active_nodes(next_height, &prev_snapshot)
            .await;
        let next_snapshot = Snapshot {
            last_snapshot: prev_snapshot.hash(),
            checkpoint_blocks: hashes.clone(),
            public_reputation: self.cluster.public_reputation().await,
            next_active_nodes: next_active_nodes.clone(),
        };
        let snapshot_hash = next_snapshot.hash();
        let new_stored = StoredSnapshot {
            snapshot: next_snapshot,
            checkpoint_cache: all_blocks.clone(),
        };

        let sealed_bases: HashSet<Hash> = hashes.iter().copied().collect();
        let info = {
            let state = self.state.lock().await;
            let mut snapshot_hashes = state.snapshot_hashes.clone();
            snapshot_hashes.push(snapshot_hash);
            let remaining: Vec<Hash> = remaining_accepted(&self.accepted_log, &sealed_bases).await;
            SnapshotInfo {
                snapshot: new_stored.clone(),
                accepted_cb_since_snapshot: remaining,
                last_snapshot_height: next_height,
                snapshot_hashes,
                address_cache_data: self.addresses.export().await,
                tips: self.tips.export().await,
                last_accepted_tx_ref: self.chain.export().await,
            }
        };

        // Write-ahead: both artifacts must land before any state mutates.
        self.write_with_retries(&snapshot_hash, &new_stored, &info)
            .await?;

        // Commit.
        let soe_hashes: Vec<Hash> = all_blocks.iter().map(|c| c.soe_hash).collect();
        self.storage.batch_remove(&soe_hashes).await;
        {
            let mut state = self.state.lock().await;
            state.stored = new_stored;
            state.last_snapshot_height = next_height;
            state.snapshot_hashes.push(snapshot_hash);
        }
        self.accepted_log.remove(&sealed_bases).await;
        let total = self.meta.total_checkpoint_blocks() + hashes.len() as u64;
        if let Err(e) = self.meta.set_total_checkpoint_blocks(total) {
            tracing::warn!(%e, "total block counter not persisted");
        }
        drop(gate);

        // Post-seal cluster maintenance and membership observations.
        self.cluster.mark_leaving_peers_offline().await;
        let removed = self.cluster.remove_offline_peers().await;
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "offline peers removed at seal");
        }
        self.emit_active_pool_observations(&next_active_nodes).await;

        if let Err(e) = self.meta.set_last_majority_state(next_height, &snapshot_hash) {
            tracing::warn!(%e, "last majority state not persisted");
        }
        tracing::info!(
            snapshot = %crate::hash_hex(&snapshot_hash),
            height = next_height,
            blocks = hashes.len(),
            total,
            "snapshot sealed"
        );
        Ok(snapshot_hash)
    }

    /// The active pool for the next epoch: recomputed from reputation every
    /// rotation period, seeded from config right after the zero snapshot,
    /// carried forward otherwise.
    async fn compute_next_active_nodes(
        &self,
        next_height: u64,
        prev_snapshot: &Snapshot,
    ) -> ActiveNodes {
        let rotation_span =
            self.config.snapshot_height_interval * self.config.active_peers_rotation_interval;
        if rotation_span > 0 && next_height % rotation_span == 0 {
            return self
                .cluster
                .select_active_nodes(crate::constants::ACTIVE_POOL_SIZE)
                .await;
        }
        if prev_snapshot.is_zero() {
            return ActiveNodes {
                full: self
                    .config
                    .parse_initial_active_full_nodes()
                    .into_iter()
                    .collect(),
                light: Default::default(),
            };
        }
        prev_snapshot.next_active_nodes.clone()
    }

    /// Write both artifacts, retrying with cleanup when the disk-limit
    /// policy rejects the write.
    async fn write_with_retries(
        &self,
        snapshot_hash: &Hash,
        stored: &StoredSnapshot,
        info: &SnapshotInfo,
    ) -> Result<(), SnapshotError> {
        let stored_bytes = serialize_artifact(stored)
            .map_err(|e| SnapshotError::Io(e.to_string()))?;
        let info_bytes =
            serialize_artifact(info).map_err(|e| SnapshotError::Io(e.to_string()))?;

        let mut last_err = String::new();
        for attempt in 0..crate::constants::SNAPSHOT_WRITE_RETRIES {
            if self.config.size_disk_limit > 0 {
                let needed = stored_bytes.len() as u64 + info_bytes.len() as u64;
                if self.files.used_space() + needed > self.config.size_disk_limit {
                    let removed = self.files.remove_oldest_snapshots(1);
                    tracing::warn!(attempt, removed, "snapshot disk limit hit, cleaned up");
                    if self.files.used_space() + needed > self.config.size_disk_limit {
                        last_err = "disk limit exceeded after cleanup".into();
                        continue;
                    }
                }
            }
            let result = async {
                self.files.write_snapshot(snapshot_hash, &stored_bytes).await?;
                self.files.write_snapshot_info(snapshot_hash, &info_bytes).await
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = e.to_string();
                    self.io_failures.fetch_add(1, Ordering::Relaxed);
                    self.files.remove_oldest_snapshots(1);
                    tracing::warn!(attempt, %last_err, "snapshot write failed, retrying");
                }
            }
        }
        self.io_failures.fetch_add(1, Ordering::Relaxed);
        Err(SnapshotError::Io(last_err))
    }

    /// Observe every known peer's membership in the new active pool.
    async fn emit_active_pool_observations(&self, active: &ActiveNodes) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        for peer in self.cluster.known_peer_ids().await {
            let kind = if active.full.contains(&peer) || active.light.contains(&peer) {
                ObservationKind::NodeMemberOfActivePool
            } else {
                ObservationKind::NodeNotMemberOfActivePool
            };
            self.obs_pool
                .put(Observation::new(&self.keypair, peer, kind, now))
                .await;
        }
    }

    /// Assemble the current resumable state.
    pub async fn snapshot_info(&self) -> SnapshotInfo {
        let state = self.state.lock().await;
        SnapshotInfo {
            snapshot: state.stored.clone(),
            accepted_cb_since_snapshot: self.accepted_log.view().await,
            last_snapshot_height: state.last_snapshot_height,
            snapshot_hashes: state.snapshot_hashes.clone(),
            address_cache_data: self.addresses.export().await,
            tips: self.tips.export().await,
            last_accepted_tx_ref: self.chain.export().await,
        }
    }

    /// Replace all snapshot-owned state from a restored [`SnapshotInfo`]
    /// (rollback and startup resume).
    pub async fn restore(&self, info: SnapshotInfo) {
        {
            let mut state = self.state.lock().await;
            state.stored = info.snapshot.clone();
            state.last_snapshot_height = info.last_snapshot_height;
            state.snapshot_hashes = info.snapshot_hashes.clone();
        }
        self.accepted_log
            .restore(info.accepted_cb_since_snapshot.clone())
            .await;
        self.addresses.restore(info.address_cache_data.clone()).await;
        self.tips.restore(info.tips.clone()).await;
        self.chain.restore(info.last_accepted_tx_ref).await;
        tracing::info!(
            height = info.last_snapshot_height,
            "snapshot state restored"
        );
    }
}

/// The accepted backlog minus the freshly sealed hashes.
async fn remaining_accepted(log: &AcceptedCbLog, sealed: &HashSet<Hash>) -> Vec<Hash> {
    log.view()
        .await
        .into_iter()
        .filter(|h| !sealed.contains(h))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_snapshot_is_zero() {
        let zero = Snapshot::zero(ActiveNodes::default());
        assert!(zero.is_zero());
        let next = Snapshot {
            last_snapshot: zero.hash(),
            checkpoint_blocks: vec![[1u8; 32]],
            public_reputation: vec![],
            next_active_nodes: ActiveNodes::default(),
        };
        assert!(!next.is_zero());
        assert_ne!(zero.hash(), next.hash());
    }

    #[test]
    fn snapshot_hash_chain_is_order_sensitive() {
        let a = Snapshot {
            last_snapshot: [0u8; 32],
            checkpoint_blocks: vec![[1u8; 32], [2u8; 32]],
            public_reputation: vec![],
            next_active_nodes: ActiveNodes::default(),
        };
        let b = Snapshot {
            checkpoint_blocks: vec![[2u8; 32], [1u8; 32]],
            ..a.clone()
        };
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn stored_snapshot_serialization_roundtrip() {
        let stored = StoredSnapshot {
            snapshot: Snapshot::zero(ActiveNodes::default()),
            checkpoint_cache: vec![],
        };
        let bytes = serialize_artifact(&stored).unwrap();
        let back: StoredSnapshot = crate::storage::deserialize_artifact(&bytes).unwrap();
        assert_eq!(back.snapshot, stored.snapshot);
    }
}
