//! Round-based checkpoint consensus.
//!
//! A round moves through three phases across a fixed facilitator set: data
//! proposals (everyone contributes transactions and observations), union
//! block proposals (everyone builds and signs the unioned block), and
//! selected blocks (everyone announces the majority block it saw). The
//! per-round state machine lives in [`round`]; round lifecycle, routing,
//! and timeouts live in [`manager`].

pub mod manager;
pub mod round;

use std::collections::BTreeSet;
use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{ChannelMessage, CheckpointBlock, ParentRef};
use crate::crypto::keys::NodeId;
use crate::observation::Observation;
use crate::transaction::Transaction;

pub use manager::ConsensusManager;
pub use round::ConsensusRound;

/// Opaque unique round identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundId(pub [u8; 16]);

impl RoundId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        RoundId(bytes)
    }
}

impl fmt::Debug for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoundId({})", hex::encode(self.0))
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The totally ordered stages of a round. Transitions are monotonic;
/// a message aimed at a passed stage is a `PreviousStage` error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConsensusStage {
    Starting,
    WaitingForProposals,
    WaitingForBlockProposals,
    ResolvingMajorityCb,
    WaitingForSelectedBlocks,
    AcceptingMajorityCb,
}

/// Phase 1: a facilitator's contribution of raw consensus data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusDataProposal {
    pub round_id: RoundId,
    pub facilitator: NodeId,
    pub transactions: Vec<Transaction>,
    pub observations: Vec<Observation>,
    pub messages: Vec<ChannelMessage>,
    pub notifications: Vec<crate::checkpoint::PeerNotification>,
}

/// Phase 2: a facilitator's signed union block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnionBlockProposal {
    pub round_id: RoundId,
    pub facilitator: NodeId,
    pub block: CheckpointBlock,
}

/// Phase 3: the majority block a facilitator selected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectedUnionBlock {
    pub round_id: RoundId,
    pub facilitator: NodeId,
    pub block: CheckpointBlock,
}

/// Immutable description of a round, fixed at creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundData {
    pub round_id: RoundId,
    /// Remote facilitators (the initiator is not in this set).
    pub peers: BTreeSet<NodeId>,
    pub light_peers: BTreeSet<NodeId>,
    /// The initiator of the round.
    pub facilitator_id: NodeId,
    /// The initiator's own pulled transactions.
    pub transactions: Vec<Transaction>,
    pub observations: Vec<Observation>,
    /// The two parents every union block of this round references.
    pub tips_soe: [ParentRef; 2],
    pub messages: Vec<ChannelMessage>,
}

impl RoundData {
    /// Facilitator count including self.
    pub fn facilitator_count(&self) -> usize {
        self.peers.len() + 1
    }
}

/// Why a round failed.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RoundErrorKind {
    #[error("no proposals arrived before the stage deadline")]
    EmptyProposals,
    #[error("only {count} of {total} proposals arrived")]
    NotEnoughProposals { count: usize, total: usize },
    #[error("message targets already-passed stage {stage:?}")]
    PreviousStage { stage: ConsensusStage },
    #[error("height unknown for the majority block")]
    HeightMissing,
    #[error("block acceptance failed: {0}")]
    AcceptanceFailed(String),
}

/// A round failure plus the data that must flow back to the mempools.
#[derive(Clone, Debug, thiserror::Error)]
#[error("round {round_id} failed: {kind}")]
pub struct RoundError {
    pub round_id: RoundId,
    pub kind: RoundErrorKind,
    pub transactions_to_return: Vec<Transaction>,
    pub observations_to_return: Vec<Observation>,
}

impl RoundError {
    pub fn new(round_id: RoundId, kind: RoundErrorKind) -> Self {
        RoundError {
            round_id,
            kind,
            transactions_to_return: Vec::new(),
            observations_to_return: Vec::new(),
        }
    }

    pub fn with_data(
        mut self,
        transactions: Vec<Transaction>,
        observations: Vec<Observation>,
    ) -> Self {
        self.transactions_to_return = transactions;
        self.observations_to_return = observations;
        self
    }
}

/// How a finished round ended.
#[derive(Clone, Debug)]
pub struct RoundOutcome {
    pub round_id: RoundId,
    /// The accepted block, if the round committed one.
    pub accepted: Option<crate::checkpoint::CheckpointCache>,
    pub transactions_to_return: Vec<Transaction>,
    pub observations_to_return: Vec<Observation>,
}
