//! Consensus property tests: verification of the invariants underpinning
//! the checkpoint DAG and the round state machine.
//!
//! These tests exercise the public API only. Properties verified:
//! - **Mempool**: prefix-valid pulls, fee priority, pull/return round-trip
//! - **Tips**: bounded set and capped reuse under concurrency
//! - **Acceptance**: per-sender chain advance, conflict exclusion, height
//!   computation, at-most-one winner for a shared transaction
//! - **Rounds**: monotonic stages, late messages rejected, one committed
//!   block per round

use std::sync::Arc;

use parhelion::acceptance::{AcceptOutcome, AcceptanceError, AcceptancePipeline, AcceptedCbLog};
use parhelion::address::AddressService;
use parhelion::chain::TransactionChainService;
use parhelion::checkpoint::{CheckpointBlock, CheckpointCache, GenesisObservation};
use parhelion::cluster::{ClusterService, NodeState};
use parhelion::consensus::{
    ConsensusDataProposal, ConsensusRound, ConsensusStage, RoundData, RoundErrorKind, RoundId,
    SelectedUnionBlock, UnionBlockProposal,
};
use parhelion::crypto::keys::{NodeId, NodeKeypair};
use parhelion::dag::{CheckpointStorage, TipService};
use parhelion::mempool::{PendingObservationPool, PendingTransactionPool};
use parhelion::network::{Message, NetworkError, NodeType, PeerNetwork};
use parhelion::transaction::{Transaction, TransactionStatus, TxRef};
use parhelion::Hash;

// ── Helpers ─────────────────────────────────────────────────────────────

/// A network stub that records every broadcast message.
#[derive(Default)]
struct RecordingNetwork {
    sent: std::sync::Mutex<Vec<Message>>,
}

impl RecordingNetwork {
    fn broadcasts(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PeerNetwork for RecordingNetwork {
    async fn broadcast(&self, msg: Message) -> Result<(), NetworkError> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
    async fn send_to(&self, _peer: NodeId, msg: Message) -> Result<(), NetworkError> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
    async fn fetch_checkpoint(
        &self,
        _soe_hash: Hash,
    ) -> Result<Option<CheckpointCache>, NetworkError> {
        Ok(None)
    }
}

struct Fixture {
    keypair: NodeKeypair,
    chain: Arc<TransactionChainService>,
    tx_pool: Arc<PendingTransactionPool>,
    obs_pool: Arc<PendingObservationPool>,
    storage: Arc<CheckpointStorage>,
    pipeline: Arc<AcceptancePipeline>,
    network: Arc<RecordingNetwork>,
    genesis: GenesisObservation,
}

/// A bootstrapped single-node fixture with the genesis DAG in place.
async fn fixture() -> Fixture {
    let keypair = NodeKeypair::generate();
    let chain = Arc::new(TransactionChainService::new());
    let tx_pool = Arc::new(PendingTransactionPool::new());
    let obs_pool = Arc::new(PendingObservationPool::new());
    let storage = Arc::new(CheckpointStorage::new());
    let tips = Arc::new(TipService::default());
    let addresses = Arc::new(AddressService::new());
    let cluster = Arc::new(ClusterService::new(keypair.id(), NodeType::Full));
    cluster.set_node_state(NodeState::Ready).await;
    let network = Arc::new(RecordingNetwork::default());
    let pipeline = Arc::new(AcceptancePipeline::new(
        storage.clone(),
        tips.clone(),
        chain.clone(),
        addresses,
        cluster,
        network.clone(),
        Arc::new(AcceptedCbLog::new()),
    ));
    let genesis = GenesisObservation::new(&keypair, vec![]);
    pipeline.accept_genesis(&genesis).await;
    Fixture {
        keypair,
        chain,
        tx_pool,
        obs_pool,
        storage,
        pipeline,
        network,
        genesis,
    }
}

/// Build a chain of `n` signed transactions from one sender.
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

/// A signed block hanging off the fixture's genesis distribution tips.
fn block_on_genesis(fix: &Fixture, txs: Vec<Transaction>) -> CheckpointCache {
    let parents = vec![
        fix.genesis.initial_distribution.parent_ref(),
        fix.genesis.initial_distribution2.parent_ref(),
    ];
    let mut block = CheckpointBlock::new(txs, parents, vec![], vec![], vec![]);
    block.sign(&fix.keypair);
    CheckpointCache::new(block, None)
}

// ── Mempool properties ──────────────────────────────────────────────────

#[tokio::test]
async fn prefix_valid_sender_pulled_invalid_sender_left() {
    let fix = fixture().await;
    let a = NodeKeypair::generate();
    for tx in make_chain(&a, 3) {
        fix.tx_pool.put(tx, TransactionStatus::Pending).await;
    }
    // Sender B's transaction has ordinal 7 and references nothing accepted.
    let b = NodeKeypair::generate();
    let stray = Transaction::new(
        &b,
        [0xEE; 32],
        10,
        Some(50),
        7,
        TxRef {
            hash: [0xAB; 32],
            ordinal: 6,
        },
    );
    fix.tx_pool.put(stray, TransactionStatus::Pending).await;

    let pulled = fix.tx_pool.pull_for_consensus(10, &fix.chain).await;
    assert_eq!(pulled.len(), 3);
    assert!(pulled.iter().all(|tx| tx.sender == a.id()));
    assert_eq!(fix.tx_pool.len().await, 1);
}

#[tokio::test]
async fn highest_fee_sender_wins_the_pull() {
    let fix = fixture().await;
    let a = NodeKeypair::generate();
    let b = NodeKeypair::generate();
    let tx_a = Transaction::new(&a, [0xEE; 32], 10, Some(1), 1, TxRef::genesis(&a.id()));
    let tx_b = Transaction::new(&b, [0xEE; 32], 10, Some(10), 1, TxRef::genesis(&b.id()));
    fix.tx_pool.put(tx_a, TransactionStatus::Pending).await;
    fix.tx_pool.put(tx_b.clone(), TransactionStatus::Pending).await;

    let pulled = fix.tx_pool.pull_for_consensus(1, &fix.chain).await;
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].hash, tx_b.hash);
}

#[tokio::test]
async fn pull_then_return_is_a_round_trip() {
    let fix = fixture().await;
    let a = NodeKeypair::generate();
    for tx in make_chain(&a, 4) {
        fix.tx_pool.put(tx, TransactionStatus::Pending).await;
    }
    let pulled = fix.tx_pool.pull_for_consensus(10, &fix.chain).await;
    fix.tx_pool.return_transactions(pulled.clone()).await;
    let repulled = fix.tx_pool.pull_for_consensus(10, &fix.chain).await;

    let mut first: Vec<Hash> = pulled.iter().map(|tx| tx.hash).collect();
    let mut second: Vec<Hash> = repulled.iter().map(|tx| tx.hash).collect();
    first.sort();
    second.sort();
    assert_eq!(first, second);
}

// ── Tip properties ──────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_updates_never_exceed_tip_bounds() {
    let storage = Arc::new(CheckpointStorage::new());
    let tips = Arc::new(TipService::default());
    let keypair = NodeKeypair::generate();

    // 6 tasks feeding 18 distinct blocks.
    let mut handles = Vec::new();
    for task in 0..6u8 {
        let storage = storage.clone();
        let tips = tips.clone();
        let keypair = keypair.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..3u8 {
                let salt = task * 3 + i;
                let mut block = CheckpointBlock::new(
                    vec![],
                    vec![
                        parhelion::checkpoint::ParentRef {
                            soe_hash: [salt; 32],
                            base_hash: [salt; 32],
                        },
                        parhelion::checkpoint::ParentRef {
                            soe_hash: [salt.wrapping_add(100); 32],
                            base_hash: [salt.wrapping_add(100); 32],
                        },
                    ],
                    vec![],
                    vec![],
                    vec![parhelion::checkpoint::PeerNotification {
                        id: [salt; 32],
                        joins: true,
                    }],
                );
                block.sign(&keypair);
                let cache = CheckpointCache::new(block, Some(salt as u64 + 1));
                storage.put(cache.clone()).await;
                tips.update(&cache, &storage).await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(tips.len().await, parhelion::constants::MAX_TIPS);
    assert!(tips.check_invariants().await);
}

// ── Acceptance properties ───────────────────────────────────────────────

#[tokio::test]
async fn accepted_chain_advances_last_accepted_ref() {
    let fix = fixture().await;
    let sender = NodeKeypair::generate();
    let txs = make_chain(&sender, 3);
    let cache = block_on_genesis(&fix, txs.clone());
    fix.pipeline.accept(cache).await.unwrap();

    // Invariant: the chain head equals the last accepted transaction.
    let head = fix.chain.last_accepted_ref(&sender.id()).await;
    assert_eq!(head, txs[2].tx_ref());
}

#[tokio::test]
async fn shared_transaction_has_exactly_one_winner() {
    let fix = fixture().await;
    let sender = NodeKeypair::generate();
    let shared = make_chain(&sender, 1);

    let other_a = NodeKeypair::generate();
    let mut txs_a = shared.clone();
    txs_a.extend(make_chain(&other_a, 1));
    let block_a = block_on_genesis(&fix, txs_a);

    let other_b = NodeKeypair::generate();
    let mut txs_b = shared.clone();
    txs_b.extend(make_chain(&other_b, 1));
    let block_b = block_on_genesis(&fix, txs_b);

    // Race the two admissions; exactly one may win.
    let (ra, rb) = tokio::join!(
        fix.pipeline.accept(block_a.clone()),
        fix.pipeline.accept(block_b.clone())
    );
    let outcomes = [ra, rb];
    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    let loss = outcomes.into_iter().find(|r| r.is_err()).unwrap();
    match loss.unwrap_err() {
        AcceptanceError::TipConflict(conflicting) => {
            assert_eq!(conflicting.len(), 1);
            assert_eq!(conflicting[0].hash, shared[0].hash);
        }
        other => panic!("expected TipConflict, got {other:?}"),
    }

    // Invariant: the shared transaction maps to exactly one stored block.
    let owner = fix
        .storage
        .accepted_block_containing(&shared[0].hash)
        .await
        .unwrap();
    assert!(fix.storage.lookup(&owner).await.is_some());
}

#[tokio::test]
async fn height_is_one_past_the_tallest_parent() {
    let fix = fixture().await;
    let parent = block_on_genesis(&fix, vec![]);
    fix.pipeline.accept(parent.clone()).await.unwrap();

    let mut block = CheckpointBlock::new(
        vec![],
        vec![
            parent.block.parent_ref(),
            fix.genesis.initial_distribution.parent_ref(),
        ],
        vec![],
        vec![],
        vec![],
    );
    block.sign(&fix.keypair);
    let child = CheckpointCache::new(block, None);
    let outcome = fix.pipeline.accept(child).await.unwrap();
    // Parents at heights 2 and 1.
    assert_eq!(outcome, AcceptOutcome::Accepted(3));
}

// ── Round properties ────────────────────────────────────────────────────

struct ManualRound {
    round: ConsensusRound,
    peer1: NodeKeypair,
    peer2: NodeKeypair,
    fix: Fixture,
}

/// A round with two scripted remote facilitators.
async fn manual_round(own_txs: Vec<Transaction>) -> ManualRound {
    let fix = fixture().await;
    let peer1 = NodeKeypair::generate();
    let peer2 = NodeKeypair::generate();
    let round_data = RoundData {
        round_id: RoundId::generate(),
        peers: [peer1.id(), peer2.id()].into_iter().collect(),
        light_peers: Default::default(),
        facilitator_id: fix.keypair.id(),
        transactions: own_txs,
        observations: vec![],
        tips_soe: [
            fix.genesis.initial_distribution.parent_ref(),
            fix.genesis.initial_distribution2.parent_ref(),
        ],
        messages: vec![],
    };
    let round = ConsensusRound::new(
        round_data,
        fix.keypair.id(),
        fix.keypair.clone(),
        fix.network.clone(),
        fix.tx_pool.clone(),
        fix.obs_pool.clone(),
        fix.pipeline.clone(),
        parhelion::constants::MAX_TRANSACTION_THRESHOLD,
        parhelion::constants::MAX_OBSERVATION_THRESHOLD,
    );
    ManualRound {
        round,
        peer1,
        peer2,
        fix,
    }
}

fn empty_proposal(round_id: RoundId, facilitator: NodeId) -> ConsensusDataProposal {
    ConsensusDataProposal {
        round_id,
        facilitator,
        transactions: vec![],
        observations: vec![],
        messages: vec![],
        notifications: vec![],
    }
}

/// The last union block the round broadcast.
fn captured_union_block(network: &RecordingNetwork) -> CheckpointBlock {
    network
        .broadcasts()
        .into_iter()
        .rev()
        .find_map(|msg| match msg {
            Message::UnionBlockProposal(p) => Some(p.block),
            _ => None,
        })
        .expect("a union block was broadcast")
}

fn captured_selected_block(network: &RecordingNetwork) -> CheckpointBlock {
    network
        .broadcasts()
        .into_iter()
        .rev()
        .find_map(|msg| match msg {
            Message::SelectedUnionBlock(p) => Some(p.block),
            _ => None,
        })
        .expect("a selected block was broadcast")
}

#[tokio::test]
async fn round_happy_path_commits_exactly_one_block() {
    let sender = NodeKeypair::generate();
    let txs = make_chain(&sender, 5);
    let mr = manual_round(txs.clone()).await;
    let round_id = mr.round.id();

    mr.round.start_consensus_data_proposal().await.unwrap();
    assert_eq!(mr.round.stage().await, ConsensusStage::WaitingForProposals);

    // Phase 1 completes on the second remote proposal.
    mr.round
        .add_consensus_data_proposal(empty_proposal(round_id, mr.peer1.id()))
        .await
        .unwrap();
    mr.round
        .add_consensus_data_proposal(empty_proposal(round_id, mr.peer2.id()))
        .await
        .unwrap();
    assert_eq!(
        mr.round.stage().await,
        ConsensusStage::WaitingForBlockProposals
    );

    // Peers produce the same content, signed by themselves.
    let union = captured_union_block(&mr.fix.network);
    for peer in [&mr.peer1, &mr.peer2] {
        let mut block = union.clone();
        block.sign(peer);
        mr.round
            .add_block_proposal(UnionBlockProposal {
                round_id,
                facilitator: peer.id(),
                block,
            })
            .await
            .unwrap();
    }
    assert_eq!(
        mr.round.stage().await,
        ConsensusStage::WaitingForSelectedBlocks
    );

    // The merged majority block carries all three signers.
    let selected = captured_selected_block(&mr.fix.network);
    assert_eq!(selected.signatures.len(), 3);

    let mut outcome = None;
    for peer in [&mr.peer1, &mr.peer2] {
        let result = mr
            .round
            .add_selected_block_proposal(SelectedUnionBlock {
                round_id,
                facilitator: peer.id(),
                block: selected.clone(),
            })
            .await
            .unwrap();
        if let Some(done) = result {
            outcome = Some(done);
        }
    }
    let outcome = outcome.expect("round completed");
    assert_eq!(mr.round.stage().await, ConsensusStage::AcceptingMajorityCb);

    let committed = outcome.accepted.expect("a block was committed");
    assert_eq!(committed.block.transactions.len(), 5);
    assert_eq!(committed.height, Some(2));
    assert!(mr.fix.storage.contains_base(&committed.base_hash).await);
    // At most one block per round: the store grew by exactly one.
    assert_eq!(mr.fix.storage.len().await, 4);
}

#[tokio::test]
async fn stage_never_regresses_and_late_messages_fail() {
    let mr = manual_round(vec![]).await;
    let round_id = mr.round.id();

    mr.round.start_consensus_data_proposal().await.unwrap();
    let mut last_stage = mr.round.stage().await;

    mr.round
        .add_consensus_data_proposal(empty_proposal(round_id, mr.peer1.id()))
        .await
        .unwrap();
    assert!(mr.round.stage().await >= last_stage);
    last_stage = mr.round.stage().await;

    mr.round
        .add_consensus_data_proposal(empty_proposal(round_id, mr.peer2.id()))
        .await
        .unwrap();
    assert!(mr.round.stage().await >= last_stage);

    // Phase 1 is over; a late data proposal targets a passed stage.
    let err = mr
        .round
        .add_consensus_data_proposal(empty_proposal(round_id, mr.peer1.id()))
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind,
        RoundErrorKind::PreviousStage {
            stage: ConsensusStage::WaitingForBlockProposals
        }
    ));
}

#[tokio::test]
async fn behind_union_requires_majority() {
    let mr = manual_round(vec![]).await;
    let round_id = mr.round.id();

    mr.round.start_consensus_data_proposal().await.unwrap();
    // Only self has contributed: 1 of 3 is no majority.
    let err = mr.round.union_behind().await.unwrap_err();
    assert!(matches!(
        err.kind,
        RoundErrorKind::NotEnoughProposals { count: 1, total: 3 }
    ));

    // One remote proposal makes it 2 of 3; the forced union proceeds.
    mr.round
        .add_consensus_data_proposal(empty_proposal(round_id, mr.peer1.id()))
        .await
        .unwrap();
    mr.round.union_behind().await.unwrap();
    assert_eq!(
        mr.round.stage().await,
        ConsensusStage::WaitingForBlockProposals
    );
}

#[tokio::test]
async fn failed_round_returns_data_to_the_pools() {
    let sender = NodeKeypair::generate();
    let txs = make_chain(&sender, 2);
    let mr = manual_round(txs.clone()).await;

    mr.round.start_consensus_data_proposal().await.unwrap();
    let err = mr.round.union_behind().await.unwrap_err();
    // The round's payload rides on the error for the manager to return.
    let returned: Vec<Hash> = err.transactions_to_return.iter().map(|t| t.hash).collect();
    for tx in &txs {
        assert!(returned.contains(&tx.hash));
    }
}
