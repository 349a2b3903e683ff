//! Checkpoint acceptance: the single-writer admission gate for the DAG.
//!
//! Resolution (parent fetch, conflict, structure, and chain-reference
//! checks) runs without the lock so parallel rounds can overlap their
//! network I/O; only the commit step serializes on `accept_lock`. A
//! per-base-hash pending set prevents duplicate concurrent work on the
//! same block, and the racy checks are repeated under the lock because
//! another block may have committed while this one was resolving.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::address::AddressService;
use crate::chain::TransactionChainService;
use crate::checkpoint::{CheckpointCache, CheckpointValidationError, GenesisObservation};
use crate::cluster::{ClusterService, NodeState};
use crate::dag::{CheckpointStorage, TipData, TipService};
use crate::network::PeerNetwork;
use crate::transaction::{Address, Transaction};
use crate::Hash;

/// Errors from the acceptance pipeline.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AcceptanceError {
    #[error("checkpoint cache carries no block")]
    MissingCheckpointBlock,
    #[error("block {} is already being accepted", crate::hash_hex(.0))]
    PendingAcceptance(Hash),
    #[error("block {} is already stored", crate::hash_hex(.0))]
    AlreadyStored(Hash),
    #[error("parents could not be resolved")]
    MissingParents,
    #[error("a transaction does not extend its sender's accepted chain")]
    MissingTransactionReference,
    #[error("{} transactions conflict with already-accepted ones", .0.len())]
    TipConflict(Vec<Transaction>),
    #[error("{} transactions are invalid", .0.len())]
    ContainsInvalidTransactions(Vec<Transaction>),
    #[error("block structure invalid: {0}")]
    InvalidBlock(#[from] CheckpointValidationError),
    #[error("network failure during parent resolution: {0}")]
    ResolutionFailed(String),
}

impl AcceptanceError {
    /// `AlreadyStored` and `PendingAcceptance` are informational; the block
    /// is in the pipeline either way.
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            AcceptanceError::AlreadyStored(_) | AcceptanceError::PendingAcceptance(_)
        )
    }
}

/// How an admitted block entered the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Committed into the DAG at this height.
    Accepted(u64),
    /// Buffered while the node awaits final sync.
    Buffered,
}

/// Base hashes of blocks accepted since the last snapshot seal.
#[derive(Default)]
pub struct AcceptedCbLog {
    hashes: Mutex<Vec<Hash>>,
}

impl AcceptedCbLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, base_hash: Hash) {
        self.hashes.lock().await.push(base_hash);
    }

    pub async fn view(&self) -> Vec<Hash> {
        self.hashes.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.hashes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop the sealed hashes, keeping everything accepted after them.
    pub async fn remove(&self, sealed: &HashSet<Hash>) {
        self.hashes.lock().await.retain(|h| !sealed.contains(h));
    }

    /// Self-healing trim: keep only the first `keep` entries.
    pub async fn trim_to(&self, keep: usize) {
        self.hashes.lock().await.truncate(keep);
    }

    pub async fn restore(&self, hashes: Vec<Hash>) {
        *self.hashes.lock().await = hashes;
    }
}

/// The checkpoint acceptance pipeline.
pub struct AcceptancePipeline {
    storage: Arc<CheckpointStorage>,
    tips: Arc<TipService>,
    chain: Arc<TransactionChainService>,
    addresses: Arc<AddressService>,
    cluster: Arc<ClusterService>,
    network: Arc<dyn PeerNetwork>,
    accepted_log: Arc<AcceptedCbLog>,
    /// Global admission gate; held only across the commit step.
    accept_lock: Mutex<()>,
    /// Base hashes currently being worked on.
    pending: Mutex<HashSet<Hash>>,
    /// Blocks buffered while awaiting final sync.
    sync_buffer: Mutex<Vec<CheckpointCache>>,
    total_accepted: AtomicU64,
    parent_fetch_timeout: Duration,
}

impl AcceptancePipeline {
    pub fn new(
        storage: Arc<CheckpointStorage>,
        tips: Arc<TipService>,
        chain: Arc<TransactionChainService>,
        addresses: Arc<AddressService>,
        cluster: Arc<ClusterService>,
        network: Arc<dyn PeerNetwork>,
        accepted_log: Arc<AcceptedCbLog>,
    ) -> Self {
        AcceptancePipeline {
            storage,
            tips,
            chain,
            addresses,
            cluster,
            network,
            accepted_log,
            accept_lock: Mutex::new(()),
            pending: Mutex::new(HashSet::new()),
            sync_buffer: Mutex::new(Vec::new()),
            total_accepted: AtomicU64::new(0),
            parent_fetch_timeout: Duration::from_millis(
                crate::constants::PARENT_RESOLUTION_TIMEOUT_MS,
            ),
        }
    }

    /// Entry point for gossip, where the block may be absent.
    pub async fn accept_from_gossip(
        &self,
        cache: Option<CheckpointCache>,
    ) -> Result<AcceptOutcome, AcceptanceError> {
        match cache {
            Some(cache) => self.accept(cache).await,
            None => Err(AcceptanceError::MissingCheckpointBlock),
        }
    }

    /// Validate, resolve, and admit a block into the DAG.
    pub async fn accept(&self, cache: CheckpointCache) -> Result<AcceptOutcome, AcceptanceError> {
        if self.cluster.node_state().await == NodeState::DownloadCompleteAwaitingFinalSync {
            tracing::debug!(
                block = %crate::hash_hex(&cache.base_hash),
                "buffering block until final sync"
            );
            self.sync_buffer.lock().await.push(cache);
            return Ok(AcceptOutcome::Buffered);
        }

        let base_hash = cache.base_hash;
        {
            let mut pending = self.pending.lock().await;
            if !pending.insert(base_hash) {
                return Err(AcceptanceError::PendingAcceptance(base_hash));
            }
        }

        let result = self
            .accept_inner(cache, crate::constants::MAX_PARENT_DEPTH)
            .await;

        self.pending.lock().await.remove(&base_hash);
        result
    }

    fn accept_inner<'a>(
        &'a self,
        cache: CheckpointCache,
        depth: u32,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<AcceptOutcome, AcceptanceError>> + Send + 'a>,
    > {
        Box::pin(async move {
            if self.storage.contains_base(&cache.base_hash).await {
                return Err(AcceptanceError::AlreadyStored(cache.base_hash));
            }

            self.resolve_parents(&cache, depth).await?;

            // Resolution-phase checks, repeated under the lock below.
            self.check_conflicts(&cache).await?;
            cache.block.validate_structure().map_err(|err| {
                let invalid = cache.block.invalid_transactions();
                if invalid.is_empty() {
                    AcceptanceError::InvalidBlock(err)
                } else {
                    AcceptanceError::ContainsInvalidTransactions(invalid)
                }
            })?;
            self.check_chain_references(&cache).await?;

            let height = self
                .storage
                .calculate_height(&cache.block)
                .await
                .ok_or(AcceptanceError::MissingParents)?;

            // Commit step: everything from here happens under the gate.
            let _gate = self.accept_lock.lock().await;

            // Re-run the racy checks: another block may have committed while
            // this one was resolving without the lock.
            if self.storage.contains_base(&cache.base_hash).await {
                return Err(AcceptanceError::AlreadyStored(cache.base_hash));
            }
            self.check_conflicts(&cache).await?;
            self.check_chain_references(&cache).await?;

            let committed = CheckpointCache {
                height: Some(height),
                ..cache
            };
            self.storage.put(committed.clone()).await;
            for tx in &committed.block.transactions {
                // Chain validity was just checked; a failure here means the
                // check and the commit raced, which the gate excludes.
                if let Err(err) = self.chain.apply_after_acceptance(tx).await {
                    tracing::error!(%err, "chain advance failed after validation");
                }
                self.addresses.apply_transaction(tx).await;
            }
            self.tips.update(&committed, &self.storage).await;
            self.accepted_log.push(committed.base_hash).await;
            let total = self.total_accepted.fetch_add(1, Ordering::Relaxed) + 1;

            tracing::info!(
                block = %crate::hash_hex(&committed.base_hash),
                height,
                total,
                txs = committed.block.transactions.len(),
                "checkpoint accepted"
            );
            Ok(AcceptOutcome::Accepted(height))
        })
    }

    /// Fetch unknown parents from peers and accept them first.
    async fn resolve_parents(
        &self,
        cache: &CheckpointCache,
        depth: u32,
    ) -> Result<(), AcceptanceError> {
        for parent in &cache.block.parents {
            if self.storage.contains(&parent.soe_hash).await {
                continue;
            }
            if depth == 0 {
                return Err(AcceptanceError::MissingParents);
            }
            let fetched = tokio::time::timeout(
                self.parent_fetch_timeout,
                self.network.fetch_checkpoint(parent.soe_hash),
            )
            .await
            .map_err(|_| AcceptanceError::MissingParents)?
            .map_err(|e| AcceptanceError::ResolutionFailed(e.to_string()))?;

            let Some(parent_cache) = fetched else {
                return Err(AcceptanceError::MissingParents);
            };
            match self.accept_inner(parent_cache, depth - 1).await {
                Ok(_) => {}
                Err(err) if err.is_informational() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Fail if any transaction is already accepted in another block.
    async fn check_conflicts(&self, cache: &CheckpointCache) -> Result<(), AcceptanceError> {
        let mut conflicting = Vec::new();
        for tx in &cache.block.transactions {
            if let Some(owner) = self.storage.accepted_block_containing(&tx.hash).await {
                if owner != cache.soe_hash {
                    conflicting.push(tx.clone());
                }
            }
        }
        if !conflicting.is_empty() {
            self.storage.mark_conflicting(cache.base_hash).await;
            tracing::warn!(
                block = %crate::hash_hex(&cache.base_hash),
                conflicts = conflicting.len(),
                "checkpoint conflicts with accepted transactions"
            );
            return Err(AcceptanceError::TipConflict(conflicting));
        }
        Ok(())
    }

    /// Every sender's transactions must extend that sender's accepted chain.
    async fn check_chain_references(
        &self,
        cache: &CheckpointCache,
    ) -> Result<(), AcceptanceError> {
        let mut by_sender: HashMap<Address, Vec<&Transaction>> = HashMap::new();
        for tx in &cache.block.transactions {
            by_sender.entry(tx.sender).or_default().push(tx);
        }
        for (sender, mut txs) in by_sender {
            txs.sort_by_key(|tx| tx.ordinal);
            let mut expected = self.chain.last_accepted_ref(&sender).await;
            for tx in txs {
                if tx.last_tx_ref != expected || tx.ordinal != expected.ordinal + 1 {
                    return Err(AcceptanceError::MissingTransactionReference);
                }
                expected = tx.tx_ref();
            }
        }
        Ok(())
    }

    /// Seed the DAG from a genesis observation: the genesis block plus the
    /// two initial distribution blocks become the first entries and tips.
    pub async fn accept_genesis(&self, genesis: &GenesisObservation) {
        let mut tip_map = HashMap::new();
        for (block, height) in genesis.blocks() {
            let cache = CheckpointCache::new(block.clone(), Some(height));
            if height > 0 {
                tip_map.insert(
                    cache.soe_hash,
                    TipData {
                        reference: crate::checkpoint::ParentRef {
                            soe_hash: cache.soe_hash,
                            base_hash: cache.base_hash,
                        },
                        height,
                        num_uses: 0,
                        facilitators: cache.block.signatures.iter().map(|s| s.id).collect(),
                    },
                );
            }
            self.storage.put(cache).await;
        }
        for (address, amount) in &genesis.initial_balances {
            self.addresses.credit(*address, *amount).await;
        }
        self.tips.restore(tip_map).await;
        tracing::info!("genesis observation accepted");
    }

    /// Blocks buffered during final sync, drained when the node is ready.
    pub async fn drain_sync_buffer(&self) -> Vec<CheckpointCache> {
        std::mem::take(&mut *self.sync_buffer.lock().await)
    }

    /// Acquire the admission gate; the snapshot service holds this while
    /// sealing so no block commits mid-seal.
    pub async fn lock_admissions(&self) -> MutexGuard<'_, ()> {
        self.accept_lock.lock().await
    }

    /// The chain service this pipeline advances on acceptance.
    pub fn chain(&self) -> Arc<TransactionChainService> {
        self.chain.clone()
    }

    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    pub fn set_total_accepted(&self, value: u64) {
        self.total_accepted.store(value, Ordering::Relaxed);
    }
}
