//! The checkpoint DAG: accepted-block storage and tip tracking.
//!
//! Blocks are indexed by soe hash; the DAG is the index map plus parent
//! references, so no reference cycles exist. [`CheckpointStorage`] also
//! keeps the height index (for snapshot interval queries), the accepted
//! transaction index (for conflict detection), and per-block usage counters.
//! [`TipService`] maintains the bounded set of blocks eligible to parent new
//! blocks.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::checkpoint::{CheckpointBlock, CheckpointCache, ParentRef};
use crate::crypto::keys::NodeId;
use crate::Hash;

#[derive(Default)]
struct StoreInner {
    blocks: HashMap<Hash, CheckpointCache>,
    /// base hash -> soe hash of the stored block with that content
    by_base: HashMap<Hash, Hash>,
    /// height -> soe hashes at that height
    height_index: BTreeMap<u64, HashSet<Hash>>,
    /// accepted transaction hash -> soe hash of its containing block
    tx_index: HashMap<Hash, Hash>,
    /// soe hash -> times referenced as a parent
    usages: HashMap<Hash, u32>,
    /// base hashes of blocks rejected for transaction conflicts
    conflicts: HashSet<Hash>,
}

/// Storage for accepted checkpoint blocks.
#[derive(Default)]
pub struct CheckpointStorage {
    inner: RwLock<StoreInner>,
}

impl CheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cache entry, indexing height, transactions, and children.
    pub async fn put(&self, cache: CheckpointCache) {
        let mut inner = self.inner.write().await;
        let soe = cache.soe_hash;
        inner.by_base.insert(cache.base_hash, soe);
        if let Some(height) = cache.height {
            inner.height_index.entry(height).or_default().insert(soe);
        }
        for tx_hash in cache.block.tx_hashes() {
            inner.tx_index.insert(tx_hash, soe);
        }
        for parent in &cache.block.parents {
            if let Some(parent_cache) = inner.blocks.get_mut(&parent.soe_hash) {
                parent_cache.children.insert(soe);
            }
        }
        inner.blocks.insert(soe, cache);
    }

    pub async fn lookup(&self, soe_hash: &Hash) -> Option<CheckpointCache> {
        self.inner.read().await.blocks.get(soe_hash).cloned()
    }

    /// Find a stored block by content identity.
    pub async fn lookup_by_base(&self, base_hash: &Hash) -> Option<CheckpointCache> {
        let inner = self.inner.read().await;
        let soe = inner.by_base.get(base_hash)?;
        inner.blocks.get(soe).cloned()
    }

    pub async fn contains(&self, soe_hash: &Hash) -> bool {
        self.inner.read().await.blocks.contains_key(soe_hash)
    }

    pub async fn contains_base(&self, base_hash: &Hash) -> bool {
        self.inner.read().await.by_base.contains_key(base_hash)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.blocks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove a batch of blocks and all their index entries atomically.
    pub async fn batch_remove(&self, soe_hashes: &[Hash]) {
        let mut inner = self.inner.write().await;
        for soe in soe_hashes {
            let Some(cache) = inner.blocks.remove(soe) else {
                continue;
            };
            inner.by_base.remove(&cache.base_hash);
            if let Some(height) = cache.height {
                if let Some(set) = inner.height_index.get_mut(&height) {
                    set.remove(soe);
                    if set.is_empty() {
                        inner.height_index.remove(&height);
                    }
                }
            }
            for tx_hash in cache.block.tx_hashes() {
                inner.tx_index.remove(&tx_hash);
            }
            inner.usages.remove(soe);
        }
    }

    /// `1 + max(parent heights)` when both parents and their heights are
    /// known; `None` otherwise.
    pub async fn calculate_height(&self, block: &CheckpointBlock) -> Option<u64> {
        let inner = self.inner.read().await;
        let mut max_parent = 0u64;
        for parent in &block.parents {
            let cache = inner.blocks.get(&parent.soe_hash)?;
            let height = cache.height?;
            max_parent = max_parent.max(height);
        }
        if block.parents.is_empty() {
            return Some(0);
        }
        Some(1 + max_parent)
    }

    /// Count a use of a block as a parent; returns the new count.
    pub async fn register_usage(&self, soe_hash: &Hash) -> u32 {
        let mut inner = self.inner.write().await;
        let count = inner.usages.entry(*soe_hash).or_insert(0);
        *count += 1;
        *count
    }

    pub async fn usages(&self, soe_hash: &Hash) -> u32 {
        self.inner
            .read()
            .await
            .usages
            .get(soe_hash)
            .copied()
            .unwrap_or(0)
    }

    /// The block (by soe hash) that already contains this accepted
    /// transaction, if any.
    pub async fn accepted_block_containing(&self, tx_hash: &Hash) -> Option<Hash> {
        self.inner.read().await.tx_index.get(tx_hash).copied()
    }

    /// Record a block rejected for transaction conflicts.
    pub async fn mark_conflicting(&self, base_hash: Hash) {
        self.inner.write().await.conflicts.insert(base_hash);
    }

    pub async fn is_conflicting(&self, base_hash: &Hash) -> bool {
        self.inner.read().await.conflicts.contains(base_hash)
    }

    /// All blocks with `height in (above, up_to]`, unordered.
    pub async fn blocks_in_interval(&self, above: u64, up_to: u64) -> Vec<CheckpointCache> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for (_, soes) in inner.height_index.range(above + 1..=up_to) {
            for soe in soes {
                if let Some(cache) = inner.blocks.get(soe) {
                    out.push(cache.clone());
                }
            }
        }
        out
    }
}

/// A tip: an accepted block still eligible to parent new blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TipData {
    pub reference: ParentRef,
    pub height: u64,
    pub num_uses: u32,
    /// The nodes that signed the tip's block; tip-pair selection wants
    /// their union to cover the required facilitator count.
    pub facilitators: BTreeSet<NodeId>,
}

/// The two selected parents plus the facilitator set for a new round.
#[derive(Clone, Debug)]
pub struct PulledTips {
    pub tips_soe: [ParentRef; 2],
    pub peers: Vec<NodeId>,
}

#[derive(Default)]
struct TipInner {
    tips: HashMap<Hash, TipData>,
}

/// Bounded tip set with capped reuse.
pub struct TipService {
    inner: Mutex<TipInner>,
    max_tips: usize,
    max_tip_usage: u32,
    min_facilitators: usize,
}

impl Default for TipService {
    fn default() -> Self {
        TipService::new(
            crate::constants::MAX_TIPS,
            crate::constants::MAX_TIP_USAGE,
            crate::constants::MIN_FACILITATORS,
        )
    }
}

impl TipService {
    pub fn new(max_tips: usize, max_tip_usage: u32, min_facilitators: usize) -> Self {
        TipService {
            inner: Mutex::new(TipInner::default()),
            max_tips,
            max_tip_usage,
            min_facilitators,
        }
    }

    /// Process a newly accepted block: count parent uses, retire exhausted
    /// tips, and admit the block as a tip if there is room.
    ///
    /// Holds the tip lock for the whole update so `|tips| <= max_tips` and
    /// `num_uses <= max_tip_usage` hold at every instant under concurrency.
    pub async fn update(&self, cache: &CheckpointCache, storage: &CheckpointStorage) {
        let mut inner = self.inner.lock().await;
        for parent in &cache.block.parents {
            storage.register_usage(&parent.soe_hash).await;
            if let Some(tip) = inner.tips.get_mut(&parent.soe_hash) {
                tip.num_uses += 1;
                if tip.num_uses >= self.max_tip_usage {
                    inner.tips.remove(&parent.soe_hash);
                }
            }
        }
        if inner.tips.len() < self.max_tips {
            if let Some(height) = cache.height {
                inner.tips.insert(
                    cache.soe_hash,
                    TipData {
                        reference: ParentRef {
                            soe_hash: cache.soe_hash,
                            base_hash: cache.base_hash,
                        },
                        height,
                        num_uses: 0,
                        facilitators: cache.block.signatures.iter().map(|s| s.id).collect(),
                    },
                );
            }
        }
    }

    /// Select two tips and the facilitator set for a new round, or `None`
    /// when tips or ready facilitators are insufficient.
    ///
    /// Preferred: the first pair (in least-used, oldest order) whose joint
    /// signer set covers `min_facilitators` of the ready nodes; those
    /// covered nodes become the round's peers. When no pair qualifies (all
    /// tip signers offline, or bootstrap tips signed by one key), the two
    /// best-ranked tips are taken and peers are drawn by XOR distance from
    /// the joint tip hash instead, so the set still rotates with the DAG.
    pub async fn pull(&self, ready_facilitators: &[NodeId]) -> Option<PulledTips> {
        if ready_facilitators.len() < self.min_facilitators {
            return None;
        }
        let inner = self.inner.lock().await;
        if inner.tips.len() < 2 {
            return None;
        }
        // Least-used tips first, oldest first; soe hash settles the rest.
        let mut candidates: Vec<&TipData> = inner.tips.values().collect();
        candidates.sort_by(|a, b| {
            a.num_uses
                .cmp(&b.num_uses)
                .then(a.height.cmp(&b.height))
                .then(a.reference.soe_hash.cmp(&b.reference.soe_hash))
        });

        let ready: BTreeSet<NodeId> = ready_facilitators.iter().copied().collect();
        for i in 0..candidates.len() {
            for j in i + 1..candidates.len() {
                let covered: Vec<NodeId> = candidates[i]
                    .facilitators
                    .union(&candidates[j].facilitators)
                    .filter(|id| ready.contains(*id))
                    .copied()
                    .collect();
                if covered.len() >= self.min_facilitators {
                    return Some(PulledTips {
                        tips_soe: [candidates[i].reference, candidates[j].reference],
                        peers: covered,
                    });
                }
            }
        }

        let first = candidates[0].reference;
        let second = candidates[1].reference;
        let joint = crate::hash_concat(&[&first.soe_hash, &second.soe_hash]);
        let mut ranked: Vec<NodeId> = ready_facilitators.to_vec();
        ranked.sort_by_key(|id| {
            let mut dist = [0u8; 32];
            for (i, byte) in dist.iter_mut().enumerate() {
                *byte = id[i] ^ joint[i];
            }
            dist
        });
        ranked.truncate(self.min_facilitators.max(2));

        Some(PulledTips {
            tips_soe: [first, second],
            peers: ranked,
        })
    }

    /// Minimum height over the current tips (`None` when empty).
    pub async fn min_tip_height(&self) -> Option<u64> {
        self.inner
            .lock()
            .await
            .tips
            .values()
            .map(|tip| tip.height)
            .min()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.tips.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of the tip map for persistence.
    pub async fn export(&self) -> HashMap<Hash, TipData> {
        self.inner.lock().await.tips.clone()
    }

    /// Replace the tip map (rollback restore and genesis bootstrap).
    pub async fn restore(&self, tips: HashMap<Hash, TipData>) {
        self.inner.lock().await.tips = tips;
    }

    /// Verify the structural invariants; used by tests.
    pub async fn check_invariants(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.tips.len() <= self.max_tips
            && inner
                .tips
                .values()
                .all(|tip| tip.num_uses <= self.max_tip_usage)
    }
}
