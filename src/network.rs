//! Peer messages and the transport-facing interface.
//!
//! The core is transport-agnostic: everything it needs from the outside
//! world is the [`PeerNetwork`] trait (broadcast, directed send, checkpoint
//! fetch). Messages must be delivered at least once; receivers deduplicate
//! by `(round_id, facilitator, phase)` inside the round machinery.

use async_trait::async_trait;
use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointBlock, CheckpointCache, HashSignature};
use crate::consensus::{
    ConsensusDataProposal, RoundData, RoundId, SelectedUnionBlock, UnionBlockProposal,
};
use crate::crypto::keys::NodeId;
use crate::Hash;

/// Full nodes hold the whole DAG; light nodes track headers and balances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Full,
    Light,
}

/// Directory entry for a known peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub node_type: NodeType,
    /// Opaque dial string owned by the transport layer.
    pub address: String,
}

/// Network protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    // ── Round lifecycle ──
    /// Coordinator announces a new round to its facilitators
    StartConsensusRound(RoundData),

    /// Phase 1: a facilitator's transactions and observations
    ConsensusDataProposal(ConsensusDataProposal),

    /// Phase 2: a facilitator's unioned checkpoint block
    UnionBlockProposal(UnionBlockProposal),

    /// Phase 3: the majority block a facilitator selected
    SelectedUnionBlock(SelectedUnionBlock),

    /// An accepted block spread to non-facilitators
    FinishedCheckpoint {
        cache: Box<CheckpointCache>,
        facilitators: Vec<NodeId>,
    },

    // ── Co-signing ──
    /// Ask a peer to co-sign a block
    SignatureRequest {
        block: Box<CheckpointBlock>,
        facilitators: Vec<NodeId>,
    },

    /// Co-signing reply; `re_register` asks the requester to rejoin the
    /// cluster before trying again
    SignatureResponse {
        signature: Option<HashSignature>,
        re_register: bool,
    },

    // ── Parent resolution ──
    /// Request a checkpoint block by soe hash
    GetCheckpoint(Hash),

    /// Response with a requested checkpoint block
    CheckpointResponse(Option<Box<CheckpointCache>>),
}

impl Message {
    /// The round this message belongs to, when any.
    pub fn round_id(&self) -> Option<RoundId> {
        match self {
            Message::StartConsensusRound(data) => Some(data.round_id),
            Message::ConsensusDataProposal(p) => Some(p.round_id),
            Message::UnionBlockProposal(p) => Some(p.round_id),
            Message::SelectedUnionBlock(p) => Some(p.round_id),
            _ => None,
        }
    }
}

/// Errors from message encoding and peer I/O.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("message serialization failed: {0}")]
    SerializationFailed(String),
    #[error(
        "message exceeds maximum size ({} bytes)",
        crate::constants::MAX_NETWORK_MESSAGE_BYTES
    )]
    MessageTooLarge,
    #[error("peer request failed: {0}")]
    RequestFailed(String),
    #[error("peer request timed out")]
    Timeout,
}

/// Wire format revision carried in every frame header. A peer speaking a
/// different revision is rejected before any payload bytes are parsed.
pub const WIRE_VERSION: u8 = 1;

/// Bincode restricted to the protocol's message ceiling, so a hostile
/// length field inside a payload cannot force a giant allocation.
fn wire_options() -> impl bincode::Options {
    bincode::options().with_limit(crate::constants::MAX_NETWORK_MESSAGE_BYTES as u64)
}

/// Frame a message for the wire: a version byte, the body length as a
/// big-endian u32, then the bincode body.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, NetworkError> {
    let body = wire_options()
        .serialize(msg)
        .map_err(|e| NetworkError::SerializationFailed(e.to_string()))?;
    if body.len() > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(NetworkError::MessageTooLarge);
    }
    let mut frame = Vec::with_capacity(1 + 4 + body.len());
    frame.push(WIRE_VERSION);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse one frame back into a message.
///
/// Returns `None` for a foreign wire version, a truncated header or body,
/// or a declared length past the protocol ceiling.
pub fn decode_message(frame: &[u8]) -> Option<Message> {
    let (&version, rest) = frame.split_first()?;
    if version != WIRE_VERSION || rest.len() < 4 {
        return None;
    }
    let (len_bytes, body) = rest.split_at(4);
    let declared = u32::from_be_bytes(len_bytes.try_into().ok()?) as usize;
    if declared > crate::constants::MAX_NETWORK_MESSAGE_BYTES || body.len() < declared {
        return None;
    }
    wire_options().deserialize(&body[..declared]).ok()
}

/// What the core needs from the transport layer.
///
/// Implementations live outside this crate (gossip/UDP in production, an
/// in-memory router in tests).
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Fire-and-forget broadcast to all known peers.
    async fn broadcast(&self, msg: Message) -> Result<(), NetworkError>;

    /// Fire-and-forget send to one peer.
    async fn send_to(&self, peer: NodeId, msg: Message) -> Result<(), NetworkError>;

    /// Fetch a checkpoint block from whichever peer has it.
    async fn fetch_checkpoint(&self, soe_hash: Hash) -> Result<Option<CheckpointCache>, NetworkError>;
}
