//! End-to-end integration tests: complete flows across multiple nodes.
//!
//! An in-memory message router stands in for the transport: broadcasts are
//! queued and pumped node-by-node, so every delivery is at-least-once and
//! strictly ordered per pump pass. Flows covered:
//! - a full three-node consensus round committing one checkpoint on every
//!   facilitator
//! - snapshot interval sealing, backlog bookkeeping, and the zero-snapshot
//!   pool seeding
//! - rollback from an object store, including the restored heights and
//!   balances

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parhelion::checkpoint::{CheckpointBlock, CheckpointCache, GenesisObservation, ParentRef};
use parhelion::cluster::NodeState;
use parhelion::config::ParhelionConfig;
use parhelion::consensus::ConsensusManager;
use parhelion::crypto::keys::{NodeId, NodeKeypair};
use parhelion::dag::CheckpointStorage;
use parhelion::network::{Message, NetworkError, NodeType, PeerInfo, PeerNetwork};
use parhelion::node::NodeContext;
use parhelion::rollback::RollbackService;
use parhelion::snapshot::SnapshotError;
use parhelion::storage::{serialize_artifact, DirectoryObjectStore, ObjectStore};
use parhelion::transaction::{Transaction, TransactionStatus, TxRef};
use parhelion::Hash;

// ── In-memory router ────────────────────────────────────────────────────

#[derive(Default)]
struct HubInner {
    managers: HashMap<NodeId, Arc<ConsensusManager>>,
    storages: HashMap<NodeId, Arc<CheckpointStorage>>,
    queue: VecDeque<(NodeId, Option<NodeId>, Message)>,
}

/// Routes messages between in-process nodes.
#[derive(Default)]
struct Hub {
    inner: tokio::sync::Mutex<HubInner>,
}

impl Hub {
    async fn register(&self, id: NodeId, manager: Arc<ConsensusManager>, storage: Arc<CheckpointStorage>) {
        let mut inner = self.inner.lock().await;
        inner.managers.insert(id, manager);
        inner.storages.insert(id, storage);
    }

    /// Deliver queued messages until the network is quiet.
    async fn pump(&self) {
        loop {
            let item = self.inner.lock().await.queue.pop_front();
            let Some((from, to, msg)) = item else { return };
            let targets: Vec<Arc<ConsensusManager>> = {
                let inner = self.inner.lock().await;
                match to {
                    Some(target) => inner.managers.get(&target).cloned().into_iter().collect(),
                    None => inner
                        .managers
                        .iter()
                        .filter(|(id, _)| **id != from)
                        .map(|(_, m)| m.clone())
                        .collect(),
                }
            };
            for manager in targets {
                manager.handle_message(from, msg.clone()).await;
            }
        }
    }
}

/// One node's handle onto the hub.
struct HubNetwork {
    id: NodeId,
    hub: Arc<Hub>,
}

#[async_trait::async_trait]
impl PeerNetwork for HubNetwork {
    async fn broadcast(&self, msg: Message) -> Result<(), NetworkError> {
        self.hub.inner.lock().await.queue.push_back((self.id, None, msg));
        Ok(())
    }
    async fn send_to(&self, peer: NodeId, msg: Message) -> Result<(), NetworkError> {
        self.hub
            .inner
            .lock()
            .await
            .queue
            .push_back((self.id, Some(peer), msg));
        Ok(())
    }
    async fn fetch_checkpoint(
        &self,
        soe_hash: Hash,
    ) -> Result<Option<CheckpointCache>, NetworkError> {
        let storages: Vec<Arc<CheckpointStorage>> = {
            let inner = self.hub.inner.lock().await;
            inner
                .storages
                .iter()
                .filter(|(id, _)| **id != self.id)
                .map(|(_, s)| s.clone())
                .collect()
        };
        for storage in storages {
            if let Some(cache) = storage.lookup(&soe_hash).await {
                return Ok(Some(cache));
            }
        }
        Ok(None)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn make_chain(keypair: &NodeKeypair, n: u64) -> Vec<Transaction> {
    let mut out = Vec::new();
    let mut last = TxRef::genesis(&keypair.id());
    for ordinal in 1..=n {
        let tx = Transaction::new(keypair, [0xEE; 32], 10, Some(1), ordinal, last);
        last = tx.tx_ref();
        out.push(tx);
    }
    out
}

struct TestNode {
    ctx: Arc<NodeContext>,
    keypair: NodeKeypair,
    _dir: tempfile::TempDir,
}

/// Build a node wired to the hub, with the shared genesis accepted.
async fn hub_node(
    hub: &Arc<Hub>,
    genesis: &GenesisObservation,
    config: ParhelionConfig,
) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let keypair = NodeKeypair::generate();
    let network = Arc::new(HubNetwork {
        id: keypair.id(),
        hub: hub.clone(),
    });
    let ctx = Arc::new(
        NodeContext::new(
            keypair.clone(),
            config,
            NodeType::Full,
            network,
            vec![],
            dir.path(),
        )
        .unwrap(),
    );
    ctx.bootstrap_genesis(genesis).await;
    hub.register(keypair.id(), ctx.manager.clone(), ctx.storage.clone())
        .await;
    TestNode {
        ctx,
        keypair,
        _dir: dir,
    }
}

/// Make every node aware of every other as a ready full-node peer.
async fn introduce_peers(nodes: &[&TestNode]) {
    for node in nodes {
        for other in nodes {
            if node.keypair.id() == other.keypair.id() {
                continue;
            }
            node.ctx
                .cluster
                .add_peer(
                    PeerInfo {
                        id: other.keypair.id(),
                        node_type: NodeType::Full,
                        address: String::new(),
                    },
                    0.8,
                )
                .await;
        }
    }
}

/// A signed block extending the two given parents.
fn block_between(
    keypair: &NodeKeypair,
    parents: [ParentRef; 2],
    txs: Vec<Transaction>,
) -> CheckpointCache {
    let mut block = CheckpointBlock::new(txs, parents.to_vec(), vec![], vec![], vec![]);
    block.sign(keypair);
    CheckpointCache::new(block, None)
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn three_node_round_commits_on_every_facilitator() {
    let hub = Arc::new(Hub::default());
    let genesis_key = NodeKeypair::generate();
    let genesis = GenesisObservation::new(&genesis_key, vec![]);

    let a = hub_node(&hub, &genesis, ParhelionConfig::default()).await;
    let b = hub_node(&hub, &genesis, ParhelionConfig::default()).await;
    let c = hub_node(&hub, &genesis, ParhelionConfig::default()).await;
    introduce_peers(&[&a, &b, &c]).await;

    // Five chained transactions wait in the initiator's mempool.
    let sender = NodeKeypair::generate();
    let txs = make_chain(&sender, 5);
    for tx in &txs {
        a.ctx
            .tx_pool
            .put(tx.clone(), TransactionStatus::Pending)
            .await;
    }

    a.ctx.manager.start_own_round().await.expect("round started");
    hub.pump().await;

    // Every facilitator committed the same single block with all five
    // transactions; the backlog grew by exactly one on each node.
    for node in [&a, &b, &c] {
        assert_eq!(node.ctx.storage.len().await, 4, "genesis plus one block");
        assert_eq!(node.ctx.accepted_log.len().await, 1);
        let backlog = node.ctx.accepted_log.view().await;
        let cache = node
            .ctx
            .storage
            .lookup_by_base(&backlog[0])
            .await
            .expect("committed block stored");
        assert_eq!(cache.block.transactions.len(), 5);
        assert_eq!(cache.height, Some(2));
        assert_eq!(node.ctx.manager.active_round_count().await, 0);
    }
    // Accepted transactions left the initiator's mempool for good.
    assert_eq!(a.ctx.tx_pool.len().await, 0);
    // The per-sender chain advanced on all nodes.
    for node in [&a, &b, &c] {
        assert_eq!(
            node.ctx.chain.last_accepted_ref(&sender.id()).await,
            txs[4].tx_ref()
        );
    }
}

#[tokio::test]
async fn snapshot_seals_the_interval_and_prunes_the_dag() {
    let hub = Arc::new(Hub::default());
    let keypair = NodeKeypair::generate();
    let genesis = GenesisObservation::new(&keypair, vec![]);

    // The node itself forms the initial active pool.
    let mut config = ParhelionConfig::default();
    config.snapshot.snapshot_height_interval = 2;
    config.snapshot.snapshot_height_delay_interval = 1;
    config.snapshot.active_peers_rotation_interval = 10;
    config
        .snapshot
        .initial_active_full_nodes
        .push(hex::encode(keypair.id()));

    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(HubNetwork {
        id: keypair.id(),
        hub: hub.clone(),
    });
    let ctx = Arc::new(
        NodeContext::new(
            keypair.clone(),
            config,
            NodeType::Full,
            network,
            vec![],
            dir.path(),
        )
        .unwrap(),
    );
    ctx.bootstrap_genesis(&genesis).await;

    // Nothing accepted yet: the attempt defers.
    assert!(matches!(
        ctx.snapshots.attempt_snapshot().await,
        Err(SnapshotError::NoAcceptedBlocksSinceSnapshot)
    ));

    // Grow the DAG pairwise so each generation retires the one before it:
    // heights 2, 2, 3, 3, 4, 4.
    let d1 = genesis.initial_distribution.parent_ref();
    let d2 = genesis.initial_distribution2.parent_ref();
    let mut parents = [d1, d2];
    let mut generation_bases: Vec<Vec<Hash>> = Vec::new();
    for _ in 0..3 {
        let left = block_between(&keypair, parents, vec![]);
        let right = {
            // A peer notification keeps the sibling's content distinct.
            let mut block = CheckpointBlock::new(
                vec![],
                parents.to_vec(),
                vec![],
                vec![],
                vec![parhelion::checkpoint::PeerNotification {
                    id: keypair.id(),
                    joins: true,
                }],
            );
            block.sign(&keypair);
            CheckpointCache::new(block, None)
        };
        ctx.pipeline.accept(left.clone()).await.unwrap();
        ctx.pipeline.accept(right.clone()).await.unwrap();
        generation_bases.push(vec![left.base_hash, right.base_hash]);
        parents = [
            ParentRef {
                soe_hash: left.soe_hash,
                base_hash: left.base_hash,
            },
            ParentRef {
                soe_hash: right.soe_hash,
                base_hash: right.base_hash,
            },
        ];
    }
    assert_eq!(ctx.accepted_log.len().await, 6);
    // Tips are the height-4 generation; the seal point 2+1 is passed.
    assert_eq!(ctx.tips.min_tip_height().await, Some(4));

    let snapshot_hash = ctx.snapshots.attempt_snapshot().await.unwrap();
    assert_eq!(ctx.snapshots.last_snapshot_height().await, 2);

    // The interval (0, 2] sealed the genesis distribution blocks plus the
    // first generation; those left the DAG and the backlog.
    let stored = ctx.snapshots.stored_snapshot().await;
    assert_eq!(stored.checkpoint_cache.len(), 4);
    let mut expected: Vec<Hash> = generation_bases[0].clone();
    expected.push(genesis.initial_distribution.base_hash());
    expected.push(genesis.initial_distribution2.base_hash());
    expected.sort();
    assert_eq!(stored.snapshot.checkpoint_blocks, expected);
    for base in &generation_bases[0] {
        assert!(ctx.storage.lookup_by_base(base).await.is_none());
    }
    assert_eq!(ctx.accepted_log.len().await, 4);

    // The artifacts are on disk under the snapshot hash.
    assert!(ctx.files.read_snapshot(&snapshot_hash).await.is_ok());
    assert!(ctx.files.read_snapshot_info(&snapshot_hash).await.is_ok());
    assert_eq!(ctx.meta.last_majority_state().unwrap().unwrap().0, 2);

    // The next interval cannot seal yet: the tips have not outrun 4 + 1.
    assert!(matches!(
        ctx.snapshots.attempt_snapshot().await,
        Err(SnapshotError::HeightIntervalNotMet { .. })
    ));
}

#[tokio::test]
async fn rollback_restores_heights_and_balances() {
    let hub = Arc::new(Hub::default());
    let keypair = NodeKeypair::generate();
    let faucet = [0xFA; 32];
    let genesis = GenesisObservation::new(&keypair, vec![(faucet, 10_000)]);

    let store_dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> =
        Arc::new(DirectoryObjectStore::open(store_dir.path()).unwrap());
    store
        .put("genesis-observation", &serialize_artifact(&genesis).unwrap())
        .await
        .unwrap();

    // Node one runs, seals a snapshot, and off-loads the artifacts.
    let mut config = ParhelionConfig::default();
    config.snapshot.snapshot_height_interval = 2;
    config.snapshot.snapshot_height_delay_interval = 1;
    config.snapshot.active_peers_rotation_interval = 10;
    config
        .snapshot
        .initial_active_full_nodes
        .push(hex::encode(keypair.id()));

    let dir1 = tempfile::tempdir().unwrap();
    let ctx1 = Arc::new(
        NodeContext::new(
            keypair.clone(),
            config.clone(),
            NodeType::Full,
            Arc::new(HubNetwork {
                id: keypair.id(),
                hub: hub.clone(),
            }),
            vec![store.clone()],
            dir1.path(),
        )
        .unwrap(),
    );
    ctx1.bootstrap_genesis(&genesis).await;

    let d1 = genesis.initial_distribution.parent_ref();
    let d2 = genesis.initial_distribution2.parent_ref();
    let mut parents = [d1, d2];
    for salt in 0..3u8 {
        let left = block_between(&keypair, parents, vec![]);
        let mut right_block = CheckpointBlock::new(
            vec![],
            parents.to_vec(),
            vec![],
            vec![],
            vec![parhelion::checkpoint::PeerNotification {
                id: [salt; 32],
                joins: true,
            }],
        );
        right_block.sign(&keypair);
        let right = CheckpointCache::new(right_block, None);
        ctx1.pipeline.accept(left.clone()).await.unwrap();
        ctx1.pipeline.accept(right.clone()).await.unwrap();
        parents = [
            ParentRef {
                soe_hash: left.soe_hash,
                base_hash: left.base_hash,
            },
            ParentRef {
                soe_hash: right.soe_hash,
                base_hash: right.base_hash,
            },
        ];
    }
    let snapshot_hash = ctx1.snapshots.attempt_snapshot().await.unwrap();
    let height = ctx1.snapshots.last_snapshot_height().await;
    assert_eq!(height, 2);

    // Off-load the artifacts the way the run loop would.
    let snapshot_bytes = ctx1.files.read_snapshot(&snapshot_hash).await.unwrap();
    let info_bytes = ctx1.files.read_snapshot_info(&snapshot_hash).await.unwrap();
    store
        .put(
            &RollbackService::snapshot_key(height, &snapshot_hash),
            &snapshot_bytes,
        )
        .await
        .unwrap();
    store
        .put(
            &RollbackService::snapshot_info_key(height, &snapshot_hash),
            &info_bytes,
        )
        .await
        .unwrap();

    // Node two restores from the store alone.
    let keypair2 = NodeKeypair::generate();
    let dir2 = tempfile::tempdir().unwrap();
    let ctx2 = Arc::new(
        NodeContext::new(
            keypair2.clone(),
            config,
            NodeType::Full,
            Arc::new(HubNetwork {
                id: keypair2.id(),
                hub,
            }),
            vec![store],
            dir2.path(),
        )
        .unwrap(),
    );

    let (found_height, found_hash) = ctx2.rollback.rollback_to_highest().await.unwrap();
    assert_eq!(found_height, 2);
    assert_eq!(found_hash, snapshot_hash);

    assert_eq!(ctx2.snapshots.last_snapshot_height().await, 2);
    assert_eq!(ctx2.cluster.joined_height().await, Some(0));
    assert!(ctx2.cluster.participated_in_rollback().await);
    assert_eq!(ctx2.meta.last_majority_state().unwrap(), Some((2, snapshot_hash)));
    // Genesis balances restored, nothing negative.
    assert_eq!(ctx2.addresses.lookup(&faucet).await.balance, 10_000);
    let balances = ctx2.addresses.export().await;
    assert!(balances.values().all(|cache| cache.balance >= 0));
    // The node can pick up where the snapshot left off.
    assert_eq!(ctx2.cluster.node_state().await, NodeState::PendingDownload);
    assert_eq!(
        ctx2.accepted_log.len().await,
        ctx1.accepted_log.len().await
    );
}
