//! Signed peer-behavior observations.
//!
//! Observations are small signed events about other nodes (joined or left
//! the active pool, went unresponsive, proposed an invalid block). They ride
//! through consensus alongside transactions and end up in accepted
//! checkpoint blocks, where the external reputation layer consumes them.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{NodeId, NodeKeypair, NodePublicKey, Signature};
use crate::Hash;

/// The behavior an observation attests to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservationKind {
    NodeMemberOfActivePool,
    NodeNotMemberOfActivePool,
    NodeUnresponsive,
    InvalidCheckpointProposed,
}

/// A signed event about a subject node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub observer: NodeId,
    pub subject: NodeId,
    pub kind: ObservationKind,
    /// Unix epoch seconds at observation time.
    pub epoch_seconds: u64,
    pub observer_public_key: NodePublicKey,
    pub signature: Signature,
    pub hash: Hash,
}

impl Observation {
    pub fn new(
        keypair: &NodeKeypair,
        subject: NodeId,
        kind: ObservationKind,
        epoch_seconds: u64,
    ) -> Self {
        let observer = keypair.id();
        let hash = Self::compute_hash(&observer, &subject, kind, epoch_seconds);
        let signature = keypair.sign(&hash);
        Observation {
            observer,
            subject,
            kind,
            epoch_seconds,
            observer_public_key: keypair.public.clone(),
            signature,
            hash,
        }
    }

    fn kind_tag(kind: ObservationKind) -> u8 {
        match kind {
            ObservationKind::NodeMemberOfActivePool => 0,
            ObservationKind::NodeNotMemberOfActivePool => 1,
            ObservationKind::NodeUnresponsive => 2,
            ObservationKind::InvalidCheckpointProposed => 3,
        }
    }

    pub fn compute_hash(
        observer: &NodeId,
        subject: &NodeId,
        kind: ObservationKind,
        epoch_seconds: u64,
    ) -> Hash {
        crate::hash_domain(
            b"parhelion.observation",
            &crate::hash_concat(&[
                observer,
                subject,
                &[Self::kind_tag(kind)],
                &epoch_seconds.to_le_bytes(),
            ]),
        )
    }

    /// Verify the content hash and observer signature.
    pub fn is_valid(&self) -> bool {
        let expected =
            Self::compute_hash(&self.observer, &self.subject, self.kind, self.epoch_seconds);
        expected == self.hash
            && self.observer_public_key.fingerprint() == self.observer
            && self.observer_public_key.verify(&self.hash, &self.signature)
    }
}
