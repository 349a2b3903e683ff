//! Address balance bookkeeping.
//!
//! Balances advance only under the acceptance lock (when a block commits)
//! or wholesale during snapshot/rollback restore. Balances are signed so a
//! restore can detect a corrupt snapshot by spotting negatives; normal
//! acceptance never drives one below zero because spends are checked first.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::transaction::{Address, Transaction};

/// Cached per-address state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressCache {
    pub balance: i64,
    /// Accepted transactions sent from this address.
    pub tx_count: u64,
}

/// Node-wide balance table.
#[derive(Default)]
pub struct AddressService {
    balances: Mutex<HashMap<Address, AddressCache>>,
}

impl AddressService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup(&self, address: &Address) -> AddressCache {
        self.balances
            .lock()
            .await
            .get(address)
            .copied()
            .unwrap_or_default()
    }

    /// Apply an accepted transaction: debit sender (amount plus fee),
    /// credit receiver.
    pub async fn apply_transaction(&self, tx: &Transaction) {
        let mut balances = self.balances.lock().await;
        let debit = (tx.amount + tx.fee_or_zero()) as i64;
        let sender = balances.entry(tx.sender).or_default();
        sender.balance -= debit;
        sender.tx_count += 1;
        let receiver = balances.entry(tx.receiver).or_default();
        receiver.balance += tx.amount as i64;
    }

    /// Grant a balance outside the transaction flow (genesis allocations).
    pub async fn credit(&self, address: Address, amount: u64) {
        let mut balances = self.balances.lock().await;
        balances.entry(address).or_default().balance += amount as i64;
    }

    pub async fn export(&self) -> HashMap<Address, AddressCache> {
        self.balances.lock().await.clone()
    }

    pub async fn restore(&self, entries: HashMap<Address, AddressCache>) {
        *self.balances.lock().await = entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use crate::transaction::{Transaction, TxRef};

    #[tokio::test]
    async fn transfer_moves_amount_and_burns_fee() {
        let kp = NodeKeypair::generate();
        let receiver = [9u8; 32];
        let service = AddressService::new();
        service.credit(kp.id(), 100).await;

        let tx = Transaction::new(&kp, receiver, 30, Some(2), 1, TxRef::genesis(&kp.id()));
        service.apply_transaction(&tx).await;

        assert_eq!(service.lookup(&kp.id()).await.balance, 68);
        assert_eq!(service.lookup(&receiver).await.balance, 30);
        assert_eq!(service.lookup(&kp.id()).await.tx_count, 1);
    }

    #[tokio::test]
    async fn export_restore_roundtrip() {
        let service = AddressService::new();
        service.credit([1u8; 32], 10).await;
        let exported = service.export().await;

        let other = AddressService::new();
        other.restore(exported).await;
        assert_eq!(other.lookup(&[1u8; 32]).await.balance, 10);
    }
}
