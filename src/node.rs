//! Node wiring: constructing the core services and driving the periodic
//! work (own rounds, snapshot attempts, cloud off-load).
//!
//! [`NodeContext`] owns one `Arc` per service; components never reach
//! around it into each other's state. The node itself is two timer loops
//! plus lifecycle transitions; message ingestion is the transport's job
//! (it calls [`ConsensusManager::handle_message`] directly).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::acceptance::{AcceptancePipeline, AcceptedCbLog};
use crate::address::AddressService;
use crate::chain::TransactionChainService;
use crate::checkpoint::GenesisObservation;
use crate::cluster::{ClusterService, NodeState};
use crate::config::ParhelionConfig;
use crate::consensus::ConsensusManager;
use crate::crypto::keys::NodeKeypair;
use crate::dag::{CheckpointStorage, TipService};
use crate::mempool::{PendingObservationPool, PendingTransactionPool};
use crate::network::{NodeType, PeerNetwork};
use crate::rollback::RollbackService;
use crate::snapshot::{SnapshotError, SnapshotService};
use crate::storage::{
    deserialize_artifact, MetaStorage, ObjectStore, SnapshotFileStorage, StorageError,
};

/// Errors from node construction and lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("no local snapshot state to resume from")]
    NothingToResume,
}

/// All core services, constructed once and shared by reference.
pub struct NodeContext {
    pub keypair: NodeKeypair,
    pub config: ParhelionConfig,
    pub chain: Arc<TransactionChainService>,
    pub tx_pool: Arc<PendingTransactionPool>,
    pub obs_pool: Arc<PendingObservationPool>,
    pub storage: Arc<CheckpointStorage>,
    pub tips: Arc<TipService>,
    pub addresses: Arc<AddressService>,
    pub cluster: Arc<ClusterService>,
    pub accepted_log: Arc<AcceptedCbLog>,
    pub pipeline: Arc<AcceptancePipeline>,
    pub manager: Arc<ConsensusManager>,
    pub snapshots: Arc<SnapshotService>,
    pub rollback: Arc<RollbackService>,
    pub files: Arc<SnapshotFileStorage>,
    pub meta: Arc<MetaStorage>,
    pub object_stores: Vec<Arc<dyn ObjectStore>>,
}

impl NodeContext {
    /// Wire up every service against the given transport and object stores.
    pub fn new(
        keypair: NodeKeypair,
        config: ParhelionConfig,
        node_type: NodeType,
        network: Arc<dyn PeerNetwork>,
        object_stores: Vec<Arc<dyn ObjectStore>>,
        data_dir: &Path,
    ) -> Result<Self, NodeError> {
        let files = Arc::new(SnapshotFileStorage::open(data_dir)?);
        let meta = Arc::new(MetaStorage::open(data_dir)?);

        let chain = Arc::new(TransactionChainService::new());
        let tx_pool = Arc::new(PendingTransactionPool::new());
        let obs_pool = Arc::new(PendingObservationPool::new());
        let storage = Arc::new(CheckpointStorage::new());
        let tips = Arc::new(TipService::default());
        let addresses = Arc::new(AddressService::new());
        let cluster = Arc::new(ClusterService::new(keypair.id(), node_type));
        let accepted_log = Arc::new(AcceptedCbLog::new());

        let pipeline = Arc::new(AcceptancePipeline::new(
            storage.clone(),
            tips.clone(),
            chain.clone(),
            addresses.clone(),
            cluster.clone(),
            network.clone(),
            accepted_log.clone(),
        ));
        let manager = Arc::new(ConsensusManager::new(
            keypair.clone(),
            config.consensus.clone(),
            network,
            tx_pool.clone(),
            obs_pool.clone(),
            pipeline.clone(),
            storage.clone(),
            tips.clone(),
            cluster.clone(),
        ));
        let snapshots = Arc::new(SnapshotService::new(
            keypair.clone(),
            config.snapshot.clone(),
            storage.clone(),
            tips.clone(),
            addresses.clone(),
            chain.clone(),
            cluster.clone(),
            obs_pool.clone(),
            pipeline.clone(),
            accepted_log.clone(),
            files.clone(),
            meta.clone(),
        ));
        let rollback = Arc::new(RollbackService::new(
            object_stores.clone(),
            pipeline.clone(),
            snapshots.clone(),
            cluster.clone(),
            files.clone(),
            meta.clone(),
            config.snapshot.clone(),
            config.schema.v1_snapshot_info_max_height,
        ));

        Ok(NodeContext {
            keypair,
            config,
            chain,
            tx_pool,
            obs_pool,
            storage,
            tips,
            addresses,
            cluster,
            accepted_log,
            pipeline,
            manager,
            snapshots,
            rollback,
            files,
            meta,
            object_stores,
        })
    }

    /// Bootstrap a fresh cluster: accept the genesis observation, join at
    /// height zero, go ready.
    pub async fn bootstrap_genesis(&self, genesis: &GenesisObservation) {
        self.pipeline.accept_genesis(genesis).await;
        self.cluster.set_joined_height(0).await;
        self.cluster.set_node_state(NodeState::Ready).await;
    }

    /// Resume from the snapshot-info written by the last seal on this disk.
    pub async fn resume_from_disk(&self) -> Result<u64, NodeError> {
        let Some((height, hash)) = self.meta.last_majority_state()? else {
            return Err(NodeError::NothingToResume);
        };
        let bytes = self.files.read_snapshot_info(&hash).await?;
        let info = deserialize_artifact(&bytes)?;
        self.snapshots.restore(info).await;
        self.cluster.set_joined_height(height).await;
        tracing::info!(height, "resumed from local snapshot state");
        Ok(height)
    }

    /// Leave the awaiting-final-sync state and accept everything buffered
    /// while syncing.
    pub async fn complete_final_sync(&self) {
        self.cluster.set_node_state(NodeState::Ready).await;
        let buffered = self.pipeline.drain_sync_buffer().await;
        for cache in buffered {
            match self.pipeline.accept(cache).await {
                Ok(_) => {}
                Err(err) if err.is_informational() => {}
                Err(err) => tracing::warn!(%err, "buffered block rejected after sync"),
            }
        }
    }

    /// Off-load the latest sealed snapshot to the first healthy store.
    async fn offload_snapshot(&self, hash: &crate::Hash) {
        let height = self.snapshots.last_snapshot_height().await;
        let Ok(snapshot_bytes) = self.files.read_snapshot(hash).await else {
            return;
        };
        let Ok(info_bytes) = self.files.read_snapshot_info(hash).await else {
            return;
        };
        for store in &self.object_stores {
            let key = RollbackService::snapshot_key(height, hash);
            let info_key = RollbackService::snapshot_info_key(height, hash);
            let result = async {
                store.put(&key, &snapshot_bytes).await?;
                store.put(&info_key, &info_bytes).await
            }
            .await;
            match result {
                Ok(()) => {
                    tracing::debug!(key, "snapshot off-loaded");
                    return;
                }
                Err(e) => tracing::warn!(key, %e, "snapshot off-load failed, trying next store"),
            }
        }
    }

    /// Run the periodic drivers until cancellation.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        let snapshot_tick = Duration::from_millis(self.config.snapshot.snapshot_tick_ms);
        let round_tick = Duration::from_millis(crate::constants::ROUND_TICK_MS);

        let ctx = self.clone();
        let snapshot_cancel = cancel.clone();
        let snapshot_loop = tokio::spawn(async move {
            let mut interval = tokio::time::interval(snapshot_tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = snapshot_cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                match ctx.snapshots.attempt_snapshot().await {
                    Ok(hash) => {
                        if ctx.config.storage.enabled {
                            ctx.offload_snapshot(&hash).await;
                        }
                    }
                    // Preconditions simply retry next tick.
                    Err(SnapshotError::Io(e)) => {
                        tracing::error!(%e, "snapshot write failing");
                    }
                    Err(err) => {
                        tracing::debug!(%err, "snapshot attempt deferred");
                    }
                }
            }
        });

        let ctx = self.clone();
        let round_cancel = cancel.clone();
        let round_loop = tokio::spawn(async move {
            let mut interval = tokio::time::interval(round_tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = round_cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                if ctx.cluster.node_state().await != NodeState::Ready {
                    continue;
                }
                ctx.manager.start_own_round().await;
            }
        });

        let _ = tokio::join!(snapshot_loop, round_loop);
        self.manager.shutdown().await;
    }
}
