//! Pending pools feeding consensus rounds.
//!
//! [`PendingTransactionPool`] holds not-yet-accepted transactions keyed by
//! hash. A consensus pull takes a prefix-valid, fee-prioritized batch: each
//! sender's transactions are considered as an ordinal-ordered chain, a chain
//! qualifies only if it extends the sender's last accepted reference, and
//! qualifying chains are drained highest-total-fee first. The pull is atomic
//! with respect to concurrent puts, so a sender's chain is never split
//! across the pull boundary.
//!
//! [`PendingObservationPool`] offers the same put/pull contract for
//! observations, without the chain constraint.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::chain::TransactionChainService;
use crate::observation::Observation;
use crate::transaction::{Transaction, TransactionCacheData, TransactionStatus};
use crate::Hash;

struct TxEntry {
    data: TransactionCacheData,
    insertion_order: u64,
}

#[derive(Default)]
struct TxPoolInner {
    entries: HashMap<Hash, TxEntry>,
    insertion_counter: u64,
}

/// Mempool of pending transactions.
#[derive(Default)]
pub struct PendingTransactionPool {
    inner: Mutex<TxPoolInner>,
}

impl PendingTransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite by hash.
    pub async fn put(&self, tx: Transaction, status: TransactionStatus) {
        let mut inner = self.inner.lock().await;
        let order = inner.insertion_counter;
        inner.insertion_counter += 1;
        inner.entries.insert(
            tx.hash,
            TxEntry {
                data: TransactionCacheData::new(tx, status),
                insertion_order: order,
            },
        );
    }

    /// Insert only if unknown, as `Unknown` (peer-proposal ingestion).
    pub async fn put_if_absent(&self, tx: Transaction) {
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(&tx.hash) {
            return;
        }
        let order = inner.insertion_counter;
        inner.insertion_counter += 1;
        inner.entries.insert(
            tx.hash,
            TxEntry {
                data: TransactionCacheData::new(tx, TransactionStatus::Unknown),
                insertion_order: order,
            },
        );
    }

    pub async fn lookup(&self, hash: &Hash) -> Option<TransactionCacheData> {
        self.inner
            .lock()
            .await
            .entries
            .get(hash)
            .map(|e| e.data.clone())
    }

    pub async fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().await.entries.contains_key(hash)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop entries by hash (accepted transactions leave the pool for good).
    pub async fn remove(&self, hashes: &[Hash]) {
        let mut inner = self.inner.lock().await;
        for hash in hashes {
            inner.entries.remove(hash);
        }
    }

    /// Return transactions to the pool after a failed round.
    ///
    /// Re-inserted as `Unknown` so a later pull re-evaluates them against
    /// the (possibly advanced) chain heads.
    pub async fn return_transactions(&self, txs: Vec<Transaction>) {
        for tx in txs {
            self.put(tx, TransactionStatus::Unknown).await;
        }
    }

    /// Atomically select, mark removed, and return up to `max_count`
    /// transactions for a consensus round.
    ///
    /// Selection: group by sender, order each group by ordinal, keep only
    /// groups whose first transaction extends the sender's last accepted
    /// reference, then drain whole groups highest total fee first (ties by
    /// earliest insertion).
    pub async fn pull_for_consensus(
        &self,
        max_count: usize,
        chain: &TransactionChainService,
    ) -> Vec<Transaction> {
        // The pool lock is held across the chain lookups so no concurrent
        // put can split a sender's chain across the pull boundary.
        let mut inner = self.inner.lock().await;

        let mut by_sender: HashMap<crate::transaction::Address, Vec<(&Hash, &TxEntry)>> =
            HashMap::new();
        for (hash, entry) in &inner.entries {
            by_sender
                .entry(entry.data.transaction.sender)
                .or_default()
                .push((hash, entry));
        }

        // (total fee, earliest insertion, ordered hashes) per qualifying sender
        let mut groups: Vec<(u64, u64, Vec<Hash>)> = Vec::new();
        for (sender, mut entries) in by_sender {
            entries.sort_by_key(|(_, e)| e.data.transaction.ordinal);
            let head_ref = chain.last_accepted_ref(&sender).await;
            if entries[0].1.data.transaction.last_tx_ref != head_ref {
                continue;
            }
            let total_fee: u64 = entries
                .iter()
                .map(|(_, e)| e.data.transaction.fee_or_zero())
                .sum();
            let first_insertion = entries
                .iter()
                .map(|(_, e)| e.insertion_order)
                .min()
                .unwrap_or(u64::MAX);
            groups.push((
                total_fee,
                first_insertion,
                entries.iter().map(|(h, _)| **h).collect(),
            ));
        }

        // Highest fee first; insertion order breaks ties.
        groups.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let selected: Vec<Hash> = groups
            .into_iter()
            .flat_map(|(_, _, hashes)| hashes)
            .take(max_count)
            .collect();

        selected
            .iter()
            .filter_map(|hash| inner.entries.remove(hash))
            .map(|mut e| {
                e.data.status = TransactionStatus::InConsensus;
                e.data.transaction
            })
            .collect()
    }
}

struct ObsEntry {
    observation: Observation,
    insertion_order: u64,
}

#[derive(Default)]
struct ObsPoolInner {
    entries: HashMap<Hash, ObsEntry>,
    insertion_counter: u64,
}

/// Mempool of pending observations: same contract as the transaction
/// pool minus the ordinal/chain constraint.
#[derive(Default)]
pub struct PendingObservationPool {
    inner: Mutex<ObsPoolInner>,
}

impl PendingObservationPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, observation: Observation) {
        let mut inner = self.inner.lock().await;
        let order = inner.insertion_counter;
        inner.insertion_counter += 1;
        inner.entries.insert(
            observation.hash,
            ObsEntry {
                observation,
                insertion_order: order,
            },
        );
    }

    pub async fn put_if_absent(&self, observation: Observation) {
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(&observation.hash) {
            return;
        }
        let order = inner.insertion_counter;
        inner.insertion_counter += 1;
        inner.entries.insert(
            observation.hash,
            ObsEntry {
                observation,
                insertion_order: order,
            },
        );
    }

    pub async fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().await.entries.contains_key(hash)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn remove(&self, hashes: &[Hash]) {
        let mut inner = self.inner.lock().await;
        for hash in hashes {
            inner.entries.remove(hash);
        }
    }

    pub async fn return_observations(&self, observations: Vec<Observation>) {
        for obs in observations {
            self.put(obs).await;
        }
    }

    /// Atomically take up to `max_count` observations, oldest first.
    pub async fn pull_for_consensus(&self, max_count: usize) -> Vec<Observation> {
        let mut inner = self.inner.lock().await;
        let mut ordered: Vec<(u64, Hash)> = inner
            .entries
            .values()
            .map(|e| (e.insertion_order, e.observation.hash))
            .collect();
        ordered.sort();
        ordered
            .into_iter()
            .take(max_count)
            .filter_map(|(_, hash)| inner.entries.remove(&hash))
            .map(|e| e.observation)
            .collect()
    }
}
