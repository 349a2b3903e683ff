//! # Parhelion
//!
//! The consensus and checkpoint-acceptance core of a DAG ledger node:
//! - **Checkpoint DAG** — blocks carry two parent references; acceptance is a
//!   single-writer admission gate with conflict detection
//! - **Facilitated rounds** — a three-phase proposal/union/selection protocol
//!   run by a rotating facilitator set with per-stage timeouts
//! - **Fee-biased mempool** — per-sender ordered chains with prefix-valid,
//!   atomic pulls for consensus
//! - **Snapshot sealing** — height intervals condensed into hash-chained,
//!   disk-persisted snapshots with active-pool rotation
//! - **Rollback** — full node-state restore from an external object store
//!
//! Transport, RPC, and wallet surfaces live outside this crate; the core
//! talks to them through the narrow interfaces in [`network`] and
//! [`storage`].

pub mod acceptance;
pub mod address;
pub mod chain;
pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod dag;
pub mod mempool;
pub mod network;
pub mod node;
pub mod observation;
pub mod rollback;
pub mod snapshot;
pub mod storage;
pub mod transaction;

/// Protocol constants
pub mod constants {
    /// Maximum transactions pulled from the mempool per data proposal
    pub const MAX_TRANSACTION_THRESHOLD: usize = 50;
    /// Maximum observations pulled per data proposal
    pub const MAX_OBSERVATION_THRESHOLD: usize = 50;
    /// Maximum number of tips eligible as parents for new blocks
    pub const MAX_TIPS: usize = 6;
    /// A tip is retired after being used as a parent this many times
    pub const MAX_TIP_USAGE: u32 = 2;
    /// Minimum facilitators (besides the initiator) required to start a round
    pub const MIN_FACILITATORS: usize = 2;
    /// Maximum own rounds a node runs concurrently
    pub const MAX_PARALLEL_ROUNDS: usize = 3;
    /// Cooldown between starting two own rounds, in milliseconds
    pub const OWN_ROUND_COOLDOWN_MS: u64 = 1_000;
    /// Upper bound on a whole round, in milliseconds
    pub const ROUND_TOTAL_TIMEOUT_MS: u64 = 30_000;
    /// Upper bound on a single consensus stage, in milliseconds
    pub const STAGE_TIMEOUT_MS: u64 = 5_000;
    /// Timeout for a single parent-resolution peer request, in milliseconds
    pub const PARENT_RESOLUTION_TIMEOUT_MS: u64 = 15_000;
    /// Maximum recursion depth when resolving missing parents from peers
    pub const MAX_PARENT_DEPTH: u32 = 10;
    /// Heights sealed per snapshot
    pub const SNAPSHOT_HEIGHT_INTERVAL: u64 = 2;
    /// Required lead of the minimum tip height past the seal point
    pub const SNAPSHOT_HEIGHT_DELAY_INTERVAL: u64 = 1;
    /// Active pool is recomputed every this many snapshot intervals
    pub const ACTIVE_PEERS_ROTATION_INTERVAL: u64 = 2;
    /// Number of full (and light) nodes selected into the active pool
    pub const ACTIVE_POOL_SIZE: usize = 3;
    /// Accepted-hash backlog above which the snapshot service self-heals
    pub const MAX_ACCEPTED_CB_HASHES_IN_MEMORY: usize = 4_000;
    /// Backlog length kept after a self-healing trim
    pub const ACCEPTED_CB_TRIM_LEN: usize = 100;
    /// Free disk space required before writing a snapshot (1 GiB)
    pub const MIN_SNAPSHOT_FREE_SPACE_BYTES: u64 = 1024 * 1024 * 1024;
    /// Snapshot disk writes are retried this many times, cleaning up between
    pub const SNAPSHOT_WRITE_RETRIES: u32 = 3;
    /// Maximum network message size (16 MiB)
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Interval between snapshot attempts, in milliseconds
    pub const SNAPSHOT_TICK_MS: u64 = 10_000;
    /// Interval between own-round attempts, in milliseconds
    pub const ROUND_TICK_MS: u64 = 2_000;
    /// Buffered pre-round proposals are dropped after this many milliseconds
    pub const ROUND_BUFFER_TTL_MS: u64 = 10_000;
}

/// 32-byte content digest used throughout the protocol
pub type Hash = [u8; 32];

/// Render a hash as lowercase hex (the canonical external form).
pub fn hash_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all parhelion domains use ASCII).
/// Panics at runtime if it is not — that is a programming error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}
