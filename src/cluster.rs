//! Cluster membership, reputation, and the active facilitator pool.
//!
//! The reputation scores themselves are produced by an external layer; this
//! module stores them per peer and answers the membership questions the
//! consensus and snapshot services ask: who is ready to facilitate, who is
//! in the active pool for the current epoch, and across which heights this
//! node itself has been active.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::crypto::keys::NodeId;
use crate::network::{NodeType, PeerInfo};

/// Lifecycle of this node within the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    PendingDownload,
    DownloadInProgress,
    /// Historic data downloaded; buffering live blocks until final sync.
    DownloadCompleteAwaitingFinalSync,
    Ready,
    Leaving,
    Offline,
}

/// Lifecycle of a remote peer as this node sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Ready,
    Leaving,
    Offline,
}

/// Everything tracked about one remote peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerMetadata {
    pub info: PeerInfo,
    pub reputation: f64,
    pub state: PeerState,
}

/// The nodes authorized to facilitate consensus for a snapshot epoch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveNodes {
    pub full: BTreeSet<NodeId>,
    pub light: BTreeSet<NodeId>,
}

struct OwnInfo {
    id: NodeId,
    node_type: NodeType,
    state: NodeState,
    joined_height: Option<u64>,
    left_height: Option<u64>,
    participated_in_rollback: bool,
}

/// Peer registry and own-membership tracking.
pub struct ClusterService {
    peers: RwLock<HashMap<NodeId, PeerMetadata>>,
    own: RwLock<OwnInfo>,
}

impl ClusterService {
    pub fn new(id: NodeId, node_type: NodeType) -> Self {
        ClusterService {
            peers: RwLock::new(HashMap::new()),
            own: RwLock::new(OwnInfo {
                id,
                node_type,
                state: NodeState::PendingDownload,
                joined_height: None,
                left_height: None,
                participated_in_rollback: false,
            }),
        }
    }

    // ── Peers ──

    pub async fn add_peer(&self, info: PeerInfo, reputation: f64) {
        let mut peers = self.peers.write().await;
        peers.insert(
            info.id,
            PeerMetadata {
                info,
                reputation,
                state: PeerState::Ready,
            },
        );
    }

    pub async fn set_reputation(&self, id: &NodeId, reputation: f64) {
        if let Some(peer) = self.peers.write().await.get_mut(id) {
            peer.reputation = reputation;
        }
    }

    pub async fn set_peer_state(&self, id: &NodeId, state: PeerState) {
        if let Some(peer) = self.peers.write().await.get_mut(id) {
            peer.state = state;
        }
    }

    /// Mark every leaving peer offline; returns how many changed.
    pub async fn mark_leaving_peers_offline(&self) -> usize {
        let mut peers = self.peers.write().await;
        let mut changed = 0;
        for peer in peers.values_mut() {
            if peer.state == PeerState::Leaving {
                peer.state = PeerState::Offline;
                changed += 1;
            }
        }
        changed
    }

    /// Drop offline peers from the registry; returns their ids.
    pub async fn remove_offline_peers(&self) -> Vec<NodeId> {
        let mut peers = self.peers.write().await;
        let offline: Vec<NodeId> = peers
            .iter()
            .filter(|(_, p)| p.state == PeerState::Offline)
            .map(|(id, _)| *id)
            .collect();
        for id in &offline {
            peers.remove(id);
        }
        offline
    }

    /// Peers currently eligible to facilitate a round (ready full nodes).
    pub async fn ready_facilitators(&self) -> Vec<NodeId> {
        let peers = self.peers.read().await;
        let mut out: Vec<NodeId> = peers
            .values()
            .filter(|p| p.state == PeerState::Ready && p.info.node_type == NodeType::Full)
            .map(|p| p.info.id)
            .collect();
        out.sort();
        out
    }

    pub async fn known_peer_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn peer(&self, id: &NodeId) -> Option<PeerMetadata> {
        self.peers.read().await.get(id).cloned()
    }

    /// Public reputation for all known peers plus self, sorted by id.
    pub async fn public_reputation(&self) -> Vec<(NodeId, f64)> {
        let peers = self.peers.read().await;
        let own = self.own.read().await;
        let mut out: Vec<(NodeId, f64)> = peers
            .values()
            .map(|p| (p.info.id, p.reputation))
            .collect();
        out.push((own.id, 1.0));
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Top-`pool_size` nodes by reputation within each node class.
    pub async fn select_active_nodes(&self, pool_size: usize) -> ActiveNodes {
        let peers = self.peers.read().await;
        let own = self.own.read().await;

        let mut full: Vec<(f64, NodeId)> = Vec::new();
        let mut light: Vec<(f64, NodeId)> = Vec::new();
        for peer in peers.values() {
            match peer.info.node_type {
                NodeType::Full => full.push((peer.reputation, peer.info.id)),
                NodeType::Light => light.push((peer.reputation, peer.info.id)),
            }
        }
        match own.node_type {
            NodeType::Full => full.push((1.0, own.id)),
            NodeType::Light => light.push((1.0, own.id)),
        }

        let take_top = |mut pool: Vec<(f64, NodeId)>| -> BTreeSet<NodeId> {
            pool.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.cmp(&b.1))
            });
            pool.into_iter().take(pool_size).map(|(_, id)| id).collect()
        };

        ActiveNodes {
            full: take_top(full),
            light: take_top(light),
        }
    }

    // ── Own membership ──

    pub async fn own_id(&self) -> NodeId {
        self.own.read().await.id
    }

    pub async fn node_state(&self) -> NodeState {
        self.own.read().await.state
    }

    pub async fn set_node_state(&self, state: NodeState) {
        let mut own = self.own.write().await;
        tracing::info!(from = ?own.state, to = ?state, "node state transition");
        own.state = state;
    }

    pub async fn set_joined_height(&self, height: u64) {
        self.own.write().await.joined_height = Some(height);
    }

    pub async fn set_left_height(&self, height: u64) {
        self.own.write().await.left_height = Some(height);
    }

    pub async fn joined_height(&self) -> Option<u64> {
        self.own.read().await.joined_height
    }

    /// Whether this node has been active across the whole interval ending
    /// at `height`: it joined at or before it and has not left before it.
    pub async fn active_between(&self, height: u64) -> bool {
        let own = self.own.read().await;
        let joined_ok = own.joined_height.map(|j| j <= height).unwrap_or(false);
        let left_ok = own.left_height.map(|l| height <= l).unwrap_or(true);
        joined_ok && left_ok
    }

    pub async fn set_participated_in_rollback(&self) {
        self.own.write().await.participated_in_rollback = true;
    }

    pub async fn participated_in_rollback(&self) -> bool {
        self.own.read().await.participated_in_rollback
    }
}
