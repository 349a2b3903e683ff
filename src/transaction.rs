//! Transactions and per-sender transaction chains.
//!
//! Every sender's transactions form a hash-linked chain: each transaction
//! carries a strictly increasing `ordinal` and a [`TxRef`] pointing at its
//! predecessor (or at the sender's genesis reference for the first one).
//! The chain is what lets the mempool select a prefix-valid run of
//! transactions and the acceptance pipeline advance the last-accepted
//! reference one link at a time.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{NodeKeypair, NodePublicKey, Signature};
use crate::Hash;

/// A ledger address (fingerprint of the owner's public key).
pub type Address = Hash;

/// Reference to a previous transaction in a sender's chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxRef {
    pub hash: Hash,
    pub ordinal: u64,
}

impl TxRef {
    /// The genesis reference for an address: the synthetic predecessor of the
    /// address's first transaction.
    pub fn genesis(address: &Address) -> Self {
        TxRef {
            hash: crate::hash_domain(b"parhelion.tx.genesis", address),
            ordinal: 0,
        }
    }
}

/// Status of a transaction while it moves through the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Known but not yet examined (e.g. gossiped in from a peer proposal)
    Unknown,
    /// Waiting in the mempool
    Pending,
    /// Pulled into an active consensus round
    InConsensus,
    /// Included in an accepted checkpoint block
    Accepted,
}

/// A transaction plus its node-local status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionCacheData {
    pub transaction: Transaction,
    pub status: TransactionStatus,
}

impl TransactionCacheData {
    pub fn new(transaction: Transaction, status: TransactionStatus) -> Self {
        TransactionCacheData {
            transaction,
            status,
        }
    }
}

/// Errors from transaction validation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TxValidationError {
    #[error("transaction hash does not match its contents")]
    HashMismatch,
    #[error("sender signature is invalid")]
    InvalidSignature,
    #[error("counter-party signature is invalid")]
    InvalidCounterSignature,
    #[error("transaction amount must be positive")]
    ZeroAmount,
    #[error("ordinal 0 is reserved for the genesis reference")]
    ReservedOrdinal,
}

/// A value transfer between two addresses.
///
/// `hash` is a pure function of the content fields (everything except the
/// signatures), so equal content yields an equal hash regardless of who has
/// co-signed it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: Address,
    pub receiver: Address,
    pub amount: u64,
    /// Optional priority fee; `None` behaves like zero for ordering.
    pub fee: Option<u64>,
    /// Strictly increasing per sender, starting at 1.
    pub ordinal: u64,
    /// The predecessor in the sender's chain.
    pub last_tx_ref: TxRef,
    /// The sender's public key (must fingerprint to `sender`).
    pub sender_public_key: NodePublicKey,
    pub sender_signature: Signature,
    /// Optional receiver co-signature over the same content hash.
    pub counter_signature: Option<(NodePublicKey, Signature)>,
    pub hash: Hash,
}

impl Transaction {
    /// Build and sign a transaction extending the sender's chain.
    pub fn new(
        keypair: &NodeKeypair,
        receiver: Address,
        amount: u64,
        fee: Option<u64>,
        ordinal: u64,
        last_tx_ref: TxRef,
    ) -> Self {
        let sender = keypair.id();
        let hash = Self::compute_hash(&sender, &receiver, amount, fee, ordinal, &last_tx_ref);
        let sender_signature = keypair.sign(&hash);
        Transaction {
            sender,
            receiver,
            amount,
            fee,
            ordinal,
            last_tx_ref,
            sender_public_key: keypair.public.clone(),
            sender_signature,
            counter_signature: None,
            hash,
        }
    }

    /// Content hash over everything except the signatures.
    pub fn compute_hash(
        sender: &Address,
        receiver: &Address,
        amount: u64,
        fee: Option<u64>,
        ordinal: u64,
        last_tx_ref: &TxRef,
    ) -> Hash {
        crate::hash_domain(
            b"parhelion.tx",
            &crate::hash_concat(&[
                sender,
                receiver,
                &amount.to_le_bytes(),
                &fee.unwrap_or(0).to_le_bytes(),
                &[fee.is_some() as u8],
                &ordinal.to_le_bytes(),
                &last_tx_ref.hash,
                &last_tx_ref.ordinal.to_le_bytes(),
            ]),
        )
    }

    /// Attach the receiver's co-signature.
    pub fn counter_sign(&mut self, keypair: &NodeKeypair) {
        let sig = keypair.sign(&self.hash);
        self.counter_signature = Some((keypair.public.clone(), sig));
    }

    /// The fee treated as a plain amount for ordering.
    pub fn fee_or_zero(&self) -> u64 {
        self.fee.unwrap_or(0)
    }

    /// The reference a successor transaction must carry.
    pub fn tx_ref(&self) -> TxRef {
        TxRef {
            hash: self.hash,
            ordinal: self.ordinal,
        }
    }

    /// Structural validation: content hash, signatures, and basic ranges.
    pub fn validate_structure(&self) -> Result<(), TxValidationError> {
        if self.amount == 0 {
            return Err(TxValidationError::ZeroAmount);
        }
        if self.ordinal == 0 {
            return Err(TxValidationError::ReservedOrdinal);
        }
        let expected = Self::compute_hash(
            &self.sender,
            &self.receiver,
            self.amount,
            self.fee,
            self.ordinal,
            &self.last_tx_ref,
        );
        if expected != self.hash || self.sender_public_key.fingerprint() != self.sender {
            return Err(TxValidationError::HashMismatch);
        }
        if !self.sender_public_key.verify(&self.hash, &self.sender_signature) {
            return Err(TxValidationError::InvalidSignature);
        }
        if let Some((pk, sig)) = &self.counter_signature {
            if !pk.verify(&self.hash, sig) {
                return Err(TxValidationError::InvalidCounterSignature);
            }
        }
        Ok(())
    }
}
