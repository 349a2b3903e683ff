//! Checkpoint blocks: the vertices of the ledger DAG.
//!
//! A checkpoint block bundles transactions, observations, and channel data
//! under two parent references. It has two identities:
//! - the **base hash**, over content excluding signatures, so blocks with the
//!   same content but different signer sets compare equal, and
//! - the **soe hash** (signed-observation-edge hash), which additionally
//!   covers the signer set and is the identity parents are referenced by.
//!
//! Content collections are hashed as sorted sets, so facilitators that
//! unioned the same proposals in a different arrival order still converge on
//! one base hash.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{NodeId, NodeKeypair, NodePublicKey, Signature};
use crate::observation::Observation;
use crate::transaction::{Address, Transaction, TxRef};
use crate::Hash;

/// Reference from a block to one of its parents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    /// Identity of the parent including its signer set.
    pub soe_hash: Hash,
    /// Content identity of the parent.
    pub base_hash: Hash,
}

/// One facilitator's signature over a block's base hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HashSignature {
    pub id: NodeId,
    pub public_key: NodePublicKey,
    pub signature: Signature,
}

impl HashSignature {
    pub fn verify(&self, base_hash: &Hash) -> bool {
        self.public_key.fingerprint() == self.id
            && self.public_key.verify(base_hash, &self.signature)
    }
}

/// Opaque payload routed through a state channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel_id: Hash,
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    pub fn hash(&self) -> Hash {
        crate::hash_domain(
            b"parhelion.channel",
            &crate::hash_concat(&[&self.channel_id, &self.payload]),
        )
    }
}

/// A peer announcing it joins or leaves the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNotification {
    pub id: NodeId,
    pub joins: bool,
}

/// Errors from checkpoint block validation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CheckpointValidationError {
    #[error("block must reference exactly two parents")]
    WrongParentCount,
    #[error("block carries no signatures")]
    NoSignatures,
    #[error("signature from {signer} does not verify", signer = crate::hash_hex(.0))]
    BadSignature(NodeId),
    #[error("{0} transactions failed structural validation")]
    InvalidTransactions(usize),
    #[error("{0} observations failed validation")]
    InvalidObservations(usize),
}

/// A vertex of the checkpoint DAG.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointBlock {
    pub transactions: Vec<Transaction>,
    /// Exactly two entries for every block after genesis.
    pub parents: Vec<ParentRef>,
    pub observations: Vec<Observation>,
    pub messages: Vec<ChannelMessage>,
    pub notifications: Vec<PeerNotification>,
    pub signatures: Vec<HashSignature>,
}

impl CheckpointBlock {
    /// Build an unsigned block over the given content.
    pub fn new(
        transactions: Vec<Transaction>,
        parents: Vec<ParentRef>,
        observations: Vec<Observation>,
        messages: Vec<ChannelMessage>,
        notifications: Vec<PeerNotification>,
    ) -> Self {
        CheckpointBlock {
            transactions,
            parents,
            observations,
            messages,
            notifications,
            signatures: Vec::new(),
        }
    }

    /// Content identity, independent of signatures and of collection order.
    pub fn base_hash(&self) -> Hash {
        let mut tx_hashes: Vec<Hash> = self.transactions.iter().map(|tx| tx.hash).collect();
        tx_hashes.sort();
        let mut obs_hashes: Vec<Hash> = self.observations.iter().map(|o| o.hash).collect();
        obs_hashes.sort();
        let mut msg_hashes: Vec<Hash> = self.messages.iter().map(|m| m.hash()).collect();
        msg_hashes.sort();
        let mut notif_parts: Vec<Vec<u8>> = self
            .notifications
            .iter()
            .map(|n| {
                let mut part = n.id.to_vec();
                part.push(n.joins as u8);
                part
            })
            .collect();
        notif_parts.sort();

        let mut parts: Vec<&[u8]> = Vec::new();
        let parent_bytes: Vec<Vec<u8>> = self
            .parents
            .iter()
            .map(|p| {
                let mut b = p.soe_hash.to_vec();
                b.extend_from_slice(&p.base_hash);
                b
            })
            .collect();
        for b in &parent_bytes {
            parts.push(b);
        }
        for h in &tx_hashes {
            parts.push(h);
        }
        for h in &obs_hashes {
            parts.push(h);
        }
        for h in &msg_hashes {
            parts.push(h);
        }
        for p in &notif_parts {
            parts.push(p);
        }
        crate::hash_domain(b"parhelion.checkpoint.base", &crate::hash_concat(&parts))
    }

    /// Full identity: base hash plus the sorted signer set.
    pub fn soe_hash(&self) -> Hash {
        let base = self.base_hash();
        let mut signers: Vec<NodeId> = self.signatures.iter().map(|s| s.id).collect();
        signers.sort();
        let mut parts: Vec<&[u8]> = vec![&base];
        for s in &signers {
            parts.push(s);
        }
        crate::hash_domain(b"parhelion.checkpoint.soe", &crate::hash_concat(&parts))
    }

    /// The reference a child block carries for this block.
    pub fn parent_ref(&self) -> ParentRef {
        ParentRef {
            soe_hash: self.soe_hash(),
            base_hash: self.base_hash(),
        }
    }

    /// Append our signature over the base hash (idempotent per signer).
    pub fn sign(&mut self, keypair: &NodeKeypair) {
        let id = keypair.id();
        if self.signatures.iter().any(|s| s.id == id) {
            return;
        }
        let base = self.base_hash();
        self.signatures.push(HashSignature {
            id,
            public_key: keypair.public.clone(),
            signature: keypair.sign(&base),
        });
        self.signatures.sort_by(|a, b| a.id.cmp(&b.id));
    }

    /// Merge another replica of the same content, unioning signer sets.
    ///
    /// Blocks with different base hashes are not mergeable; the other block
    /// is ignored in that case.
    pub fn plus_edge(mut self, other: &CheckpointBlock) -> CheckpointBlock {
        if self.base_hash() != other.base_hash() {
            return self;
        }
        let known: HashSet<NodeId> = self.signatures.iter().map(|s| s.id).collect();
        for sig in &other.signatures {
            if !known.contains(&sig.id) {
                self.signatures.push(sig.clone());
            }
        }
        self.signatures.sort_by(|a, b| a.id.cmp(&b.id));
        self
    }

    /// Structural validation: parent arity, signature set, transaction and
    /// observation integrity. Chain validity against the last-accepted
    /// references is the acceptance pipeline's job, not this one's.
    pub fn validate_structure(&self) -> Result<(), CheckpointValidationError> {
        if self.parents.len() != 2 {
            return Err(CheckpointValidationError::WrongParentCount);
        }
        if self.signatures.is_empty() {
            return Err(CheckpointValidationError::NoSignatures);
        }
        let base = self.base_hash();
        for sig in &self.signatures {
            if !sig.verify(&base) {
                return Err(CheckpointValidationError::BadSignature(sig.id));
            }
        }
        let bad_txs = self
            .transactions
            .iter()
            .filter(|tx| tx.validate_structure().is_err())
            .count();
        if bad_txs > 0 {
            return Err(CheckpointValidationError::InvalidTransactions(bad_txs));
        }
        let bad_obs = self.observations.iter().filter(|o| !o.is_valid()).count();
        if bad_obs > 0 {
            return Err(CheckpointValidationError::InvalidObservations(bad_obs));
        }
        Ok(())
    }

    /// Transactions that failed structural validation, by hash.
    pub fn invalid_transactions(&self) -> Vec<Transaction> {
        self.transactions
            .iter()
            .filter(|tx| tx.validate_structure().is_err())
            .cloned()
            .collect()
    }

    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.transactions.iter().map(|tx| tx.hash).collect()
    }
}

/// An accepted block together with its DAG bookkeeping.
///
/// The block is immutable once cached; `children` only grows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointCache {
    pub block: CheckpointBlock,
    pub height: Option<u64>,
    pub children: HashSet<Hash>,
    /// Cached identities (the block does not change after admission).
    pub base_hash: Hash,
    pub soe_hash: Hash,
}

impl CheckpointCache {
    pub fn new(block: CheckpointBlock, height: Option<u64>) -> Self {
        let base_hash = block.base_hash();
        let soe_hash = block.soe_hash();
        CheckpointCache {
            block,
            height,
            children: HashSet::new(),
            base_hash,
            soe_hash,
        }
    }
}

/// The bootstrap artifact: the genesis block plus the two initial
/// distribution blocks that seed the faucet balances and the first tips.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisObservation {
    pub genesis: CheckpointBlock,
    pub initial_distribution: CheckpointBlock,
    pub initial_distribution2: CheckpointBlock,
    /// Balances granted outside the transaction flow at bootstrap.
    pub initial_balances: Vec<(Address, u64)>,
}

impl GenesisObservation {
    /// Build a genesis observation distributing `amount` to each address.
    pub fn new(keypair: &NodeKeypair, allocations: Vec<(Address, u64)>) -> Self {
        let mut genesis = CheckpointBlock::new(vec![], vec![], vec![], vec![], vec![]);
        genesis.sign(keypair);
        let genesis_ref = genesis.parent_ref();

        // Both distribution blocks hang off genesis twice; a join marker
        // keeps their content hashes distinct.
        let mut dist1 = CheckpointBlock::new(
            vec![],
            vec![genesis_ref, genesis_ref],
            vec![],
            vec![],
            vec![PeerNotification {
                id: keypair.id(),
                joins: true,
            }],
        );
        dist1.sign(keypair);
        let mut dist2 = CheckpointBlock::new(
            vec![],
            vec![genesis_ref, genesis_ref],
            vec![],
            vec![],
            vec![PeerNotification {
                id: keypair.id(),
                joins: false,
            }],
        );
        dist2.sign(keypair);

        GenesisObservation {
            genesis,
            initial_distribution: dist1,
            initial_distribution2: dist2,
            initial_balances: allocations,
        }
    }

    /// The three bootstrap blocks with their fixed heights.
    pub fn blocks(&self) -> [(&CheckpointBlock, u64); 3] {
        [
            (&self.genesis, 0),
            (&self.initial_distribution, 1),
            (&self.initial_distribution2, 1),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::tests::make_chain;

    fn two_parent_refs() -> Vec<ParentRef> {
        vec![
            ParentRef {
                soe_hash: [1u8; 32],
                base_hash: [2u8; 32],
            },
            ParentRef {
                soe_hash: [3u8; 32],
                base_hash: [4u8; 32],
            },
        ]
    }

    #[test]
    fn base_hash_ignores_signatures_and_order() {
        let kp = NodeKeypair::generate();
        let txs = make_chain(&kp, [7u8; 32], 2);
        let a = CheckpointBlock::new(txs.clone(), two_parent_refs(), vec![], vec![], vec![]);
        let mut reversed = txs;
        reversed.reverse();
        let mut b = CheckpointBlock::new(reversed, two_parent_refs(), vec![], vec![], vec![]);
        b.sign(&kp);
        assert_eq!(a.base_hash(), b.base_hash());
        assert_ne!(a.soe_hash(), b.soe_hash());
    }

    #[test]
    fn plus_edge_unions_signers() {
        let kp1 = NodeKeypair::generate();
        let kp2 = NodeKeypair::generate();
        let block = CheckpointBlock::new(vec![], two_parent_refs(), vec![], vec![], vec![]);
        let mut a = block.clone();
        a.sign(&kp1);
        let mut b = block;
        b.sign(&kp2);
        let merged = a.plus_edge(&b);
        assert_eq!(merged.signatures.len(), 2);
        merged.validate_structure().unwrap();
    }

    #[test]
    fn plus_edge_is_idempotent() {
        let kp = NodeKeypair::generate();
        let mut a = CheckpointBlock::new(vec![], two_parent_refs(), vec![], vec![], vec![]);
        a.sign(&kp);
        let b = a.clone();
        let merged = a.plus_edge(&b);
        assert_eq!(merged.signatures.len(), 1);
    }

    #[test]
    fn soe_hash_is_signer_order_independent() {
        let kp1 = NodeKeypair::generate();
        let kp2 = NodeKeypair::generate();
        let block = CheckpointBlock::new(vec![], two_parent_refs(), vec![], vec![], vec![]);
        let mut a = block.clone();
        a.sign(&kp1);
        a.sign(&kp2);
        let mut b = block;
        b.sign(&kp2);
        b.sign(&kp1);
        assert_eq!(a.soe_hash(), b.soe_hash());
    }

    #[test]
    fn validation_rejects_wrong_parent_count() {
        let kp = NodeKeypair::generate();
        let mut block = CheckpointBlock::new(vec![], vec![], vec![], vec![], vec![]);
        block.sign(&kp);
        assert!(matches!(
            block.validate_structure(),
            Err(CheckpointValidationError::WrongParentCount)
        ));
    }

    #[test]
    fn genesis_observation_shape() {
        let kp = NodeKeypair::generate();
        let gen = GenesisObservation::new(&kp, vec![([5u8; 32], 1000)]);
        let blocks = gen.blocks();
        assert_eq!(blocks[0].1, 0);
        assert_eq!(blocks[1].1, 1);
        assert_ne!(
            gen.initial_distribution.base_hash(),
            gen.initial_distribution2.base_hash()
        );
        assert_eq!(
            gen.initial_distribution.parents[0].soe_hash,
            gen.genesis.soe_hash()
        );
    }
}
