//! Per-sender transaction chain tracking.
//!
//! The chain service remembers, for every address, the reference of the last
//! transaction accepted into the DAG. Acceptance advances an address's entry
//! one link at a time; anything that does not extend the current head is a
//! broken chain and must be rejected before it corrupts the per-sender
//! ordering invariant.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::transaction::{Address, Transaction, TxRef};

/// Errors from chain updates.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChainError {
    #[error(
        "transaction {tx} (ordinal {ordinal}) does not extend the last accepted reference",
        tx = crate::hash_hex(.hash)
    )]
    BrokenChain { hash: crate::Hash, ordinal: u64 },
}

/// Tracks `address -> last accepted TxRef`.
///
/// A single mutex serializes updates; lookups clone the entry out so the
/// lock is never held across callers' work.
#[derive(Default)]
pub struct TransactionChainService {
    last_accepted: Mutex<HashMap<Address, TxRef>>,
}

impl TransactionChainService {
    pub fn new() -> Self {
        Self::default()
    }

    /// The reference the next transaction from `address` must extend.
    /// Defaults to the address's genesis reference.
    pub async fn last_accepted_ref(&self, address: &Address) -> TxRef {
        let map = self.last_accepted.lock().await;
        map.get(address)
            .copied()
            .unwrap_or_else(|| TxRef::genesis(address))
    }

    /// Advance the sender's chain after the transaction's block is accepted.
    ///
    /// Succeeds iff the transaction references the current head and its
    /// ordinal is exactly one past it.
    pub async fn apply_after_acceptance(&self, tx: &Transaction) -> Result<(), ChainError> {
        let mut map = self.last_accepted.lock().await;
        let current = map
            .get(&tx.sender)
            .copied()
            .unwrap_or_else(|| TxRef::genesis(&tx.sender));
        if tx.last_tx_ref != current || tx.ordinal != current.ordinal + 1 {
            return Err(ChainError::BrokenChain {
                hash: tx.hash,
                ordinal: tx.ordinal,
            });
        }
        map.insert(tx.sender, tx.tx_ref());
        Ok(())
    }

    /// Full map export for snapshot info.
    pub async fn export(&self) -> HashMap<Address, TxRef> {
        self.last_accepted.lock().await.clone()
    }

    /// Replace the whole map (rollback restore).
    pub async fn restore(&self, entries: HashMap<Address, TxRef>) {
        *self.last_accepted.lock().await = entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use crate::transaction::tests::make_chain;

    #[tokio::test]
    async fn chain_advances_in_order() {
        let kp = NodeKeypair::generate();
        let txs = make_chain(&kp, [9u8; 32], 3);
        let service = TransactionChainService::new();
        for tx in &txs {
            service.apply_after_acceptance(tx).await.unwrap();
        }
        let head = service.last_accepted_ref(&kp.id()).await;
        assert_eq!(head, txs[2].tx_ref());
    }

    #[tokio::test]
    async fn out_of_order_is_broken_chain() {
        let kp = NodeKeypair::generate();
        let txs = make_chain(&kp, [9u8; 32], 3);
        let service = TransactionChainService::new();
        service.apply_after_acceptance(&txs[0]).await.unwrap();
        // Skipping ordinal 2 must fail.
        assert!(matches!(
            service.apply_after_acceptance(&txs[2]).await,
            Err(ChainError::BrokenChain { .. })
        ));
    }

    #[tokio::test]
    async fn replay_is_broken_chain() {
        let kp = NodeKeypair::generate();
        let txs = make_chain(&kp, [9u8; 32], 1);
        let service = TransactionChainService::new();
        service.apply_after_acceptance(&txs[0]).await.unwrap();
        assert!(service.apply_after_acceptance(&txs[0]).await.is_err());
    }

    #[tokio::test]
    async fn default_is_genesis_reference() {
        let service = TransactionChainService::new();
        let addr = [1u8; 32];
        assert_eq!(
            service.last_accepted_ref(&addr).await,
            TxRef::genesis(&addr)
        );
    }
}
