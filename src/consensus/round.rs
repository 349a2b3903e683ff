//! Per-round consensus state machine.
//!
//! One [`ConsensusRound`] exists per active round id on each facilitator.
//! All mutation funnels through a single per-round mutex, so handler bodies
//! observe a totally ordered sequence of stage transitions and the stage
//! never moves backward. Proposals for a later phase may arrive before this
//! node reaches that phase (peers run ahead); they are recorded and the
//! completion check re-runs after each local stage advance.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::acceptance::{AcceptanceError, AcceptancePipeline};
use crate::checkpoint::{CheckpointBlock, CheckpointCache};
use crate::crypto::keys::{NodeId, NodeKeypair};
use crate::mempool::{PendingObservationPool, PendingTransactionPool};
use crate::network::{Message, PeerNetwork};
use crate::observation::Observation;
use crate::transaction::Transaction;
use crate::Hash;

use super::{
    ConsensusDataProposal, ConsensusStage, RoundData, RoundError, RoundErrorKind, RoundOutcome,
    SelectedUnionBlock, UnionBlockProposal,
};

struct RoundState {
    stage: ConsensusStage,
    /// This node's own phase-1 contribution (not counted toward the
    /// phase-1 threshold; remote proposals are).
    own_proposal: Option<ConsensusDataProposal>,
    data_proposals: HashMap<NodeId, ConsensusDataProposal>,
    block_proposals: HashMap<NodeId, CheckpointBlock>,
    selected_blocks: HashMap<NodeId, CheckpointBlock>,
}

/// A consensus round in progress.
pub struct ConsensusRound {
    pub round_data: RoundData,
    node_id: NodeId,
    keypair: NodeKeypair,
    network: Arc<dyn PeerNetwork>,
    tx_pool: Arc<PendingTransactionPool>,
    obs_pool: Arc<PendingObservationPool>,
    pipeline: Arc<AcceptancePipeline>,
    state: Mutex<RoundState>,
    max_transaction_threshold: usize,
    max_observation_threshold: usize,
}

impl ConsensusRound {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        round_data: RoundData,
        node_id: NodeId,
        keypair: NodeKeypair,
        network: Arc<dyn PeerNetwork>,
        tx_pool: Arc<PendingTransactionPool>,
        obs_pool: Arc<PendingObservationPool>,
        pipeline: Arc<AcceptancePipeline>,
        max_transaction_threshold: usize,
        max_observation_threshold: usize,
    ) -> Self {
        ConsensusRound {
            round_data,
            node_id,
            keypair,
            network,
            tx_pool,
            obs_pool,
            pipeline,
            state: Mutex::new(RoundState {
                stage: ConsensusStage::Starting,
                own_proposal: None,
                data_proposals: HashMap::new(),
                block_proposals: HashMap::new(),
                selected_blocks: HashMap::new(),
            }),
            max_transaction_threshold,
            max_observation_threshold,
        }
    }

    pub fn id(&self) -> super::RoundId {
        self.round_data.round_id
    }

    pub async fn stage(&self) -> ConsensusStage {
        self.state.lock().await.stage
    }

    fn is_initiator(&self) -> bool {
        self.round_data.facilitator_id == self.node_id
    }

    /// Phase-1 self action: contribute our data and open the round.
    ///
    /// The initiator's data was already pulled into `RoundData`; other
    /// facilitators pull from their own pools here. Either way the proposal
    /// is broadcast and recorded locally.
    pub async fn start_consensus_data_proposal(
        &self,
    ) -> Result<Option<RoundOutcome>, RoundError> {
        let (transactions, observations) = if self.is_initiator() {
            (
                self.round_data.transactions.clone(),
                self.round_data.observations.clone(),
            )
        } else {
            let chain = self.pipeline.chain();
            (
                self.tx_pool
                    .pull_for_consensus(self.max_transaction_threshold, &chain)
                    .await,
                self.obs_pool
                    .pull_for_consensus(self.max_observation_threshold)
                    .await,
            )
        };

        let proposal = ConsensusDataProposal {
            round_id: self.round_data.round_id,
            facilitator: self.node_id,
            transactions,
            observations,
            messages: self.round_data.messages.clone(),
            notifications: Vec::new(),
        };

        {
            let mut state = self.state.lock().await;
            if state.stage == ConsensusStage::Starting {
                state.stage = ConsensusStage::WaitingForProposals;
            }
        }
        if let Err(e) = self
            .network
            .broadcast(Message::ConsensusDataProposal(proposal.clone()))
            .await
        {
            tracing::warn!(round = %self.id(), %e, "broadcasting data proposal failed");
        }
        self.add_consensus_data_proposal(proposal).await
    }

    /// Record a phase-1 proposal; runs the union once all remote
    /// facilitators have contributed.
    pub async fn add_consensus_data_proposal(
        &self,
        proposal: ConsensusDataProposal,
    ) -> Result<Option<RoundOutcome>, RoundError> {
        // Make remote-carried data reachable regardless of round outcome.
        // Our own contribution was just pulled out of the pools and stays out.
        if proposal.facilitator != self.node_id {
            for tx in &proposal.transactions {
                self.tx_pool.put_if_absent(tx.clone()).await;
            }
            for obs in &proposal.observations {
                self.obs_pool.put_if_absent(obs.clone()).await;
            }
        }

        let mut state = self.state.lock().await;
        if state.stage >= ConsensusStage::WaitingForBlockProposals {
            return Err(RoundError::new(
                self.id(),
                RoundErrorKind::PreviousStage { stage: state.stage },
            ));
        }

        if proposal.facilitator == self.node_id {
            Self::merge_proposal(&mut state.own_proposal, proposal);
        } else {
            let mut slot = state.data_proposals.remove(&proposal.facilitator);
            Self::merge_proposal(&mut slot, proposal);
            if let Some(merged) = slot {
                state.data_proposals.insert(merged.facilitator, merged);
            }
        }

        if state.data_proposals.len() == self.round_data.peers.len()
            && state.own_proposal.is_some()
        {
            state.stage = ConsensusStage::WaitingForBlockProposals;
            return self.union_and_cascade(&mut state).await;
        }
        Ok(None)
    }

    /// Idempotent re-delivery support: union the sequences per facilitator.
    fn merge_proposal(slot: &mut Option<ConsensusDataProposal>, incoming: ConsensusDataProposal) {
        match slot {
            None => *slot = Some(incoming),
            Some(existing) => {
                for tx in incoming.transactions {
                    if !existing.transactions.iter().any(|t| t.hash == tx.hash) {
                        existing.transactions.push(tx);
                    }
                }
                for obs in incoming.observations {
                    if !existing.observations.iter().any(|o| o.hash == obs.hash) {
                        existing.observations.push(obs);
                    }
                }
                for msg in incoming.messages {
                    if !existing.messages.contains(&msg) {
                        existing.messages.push(msg);
                    }
                }
                for notif in incoming.notifications {
                    if !existing.notifications.contains(&notif) {
                        existing.notifications.push(notif);
                    }
                }
            }
        }
    }

    /// Force the union on whatever proposals are present (stage timeout).
    ///
    /// Succeeds when a strict majority (counting self) has contributed;
    /// otherwise the round fails with the data to return.
    pub async fn union_behind(&self) -> Result<Option<RoundOutcome>, RoundError> {
        let mut state = self.state.lock().await;
        if state.stage != ConsensusStage::WaitingForProposals {
            return Ok(None);
        }
        let count = state.data_proposals.len() + usize::from(state.own_proposal.is_some());
        let total = self.round_data.facilitator_count();
        if count == 0 {
            return Err(self.round_error(&state, RoundErrorKind::EmptyProposals));
        }
        if count * 2 <= total {
            return Err(self.round_error(&state, RoundErrorKind::NotEnoughProposals { count, total }));
        }
        tracing::info!(round = %self.id(), count, total, "forcing union behind schedule");
        state.stage = ConsensusStage::WaitingForBlockProposals;
        self.union_and_cascade(&mut state).await
    }

    /// Build the union block from everything gathered in phase 1, sign it,
    /// broadcast it, and record it; cascades if later phases are complete.
    async fn union_and_cascade(
        &self,
        state: &mut RoundState,
    ) -> Result<Option<RoundOutcome>, RoundError> {
        let mut transactions: Vec<Transaction> = Vec::new();
        let mut observations: Vec<Observation> = Vec::new();
        let mut messages = self.round_data.messages.clone();
        let mut notifications = Vec::new();

        let mut push_proposal = |p: &ConsensusDataProposal,
                                 transactions: &mut Vec<Transaction>,
                                 observations: &mut Vec<Observation>| {
            for tx in &p.transactions {
                if !transactions.iter().any(|t: &Transaction| t.hash == tx.hash) {
                    transactions.push(tx.clone());
                }
            }
            for obs in &p.observations {
                if !observations.iter().any(|o: &Observation| o.hash == obs.hash) {
                    observations.push(obs.clone());
                }
            }
        };

        for tx in &self.round_data.transactions {
            if !transactions.iter().any(|t| t.hash == tx.hash) {
                transactions.push(tx.clone());
            }
        }
        for obs in &self.round_data.observations {
            observations.push(obs.clone());
        }
        if let Some(own) = &state.own_proposal {
            push_proposal(own, &mut transactions, &mut observations);
        }
        // Remote proposals in facilitator-id order for a deterministic
        // first-appearance ordering across nodes.
        let mut facilitators: Vec<NodeId> = state.data_proposals.keys().copied().collect();
        facilitators.sort();
        for id in facilitators {
            let p = &state.data_proposals[&id];
            push_proposal(p, &mut transactions, &mut observations);
            for msg in &p.messages {
                if !messages.contains(msg) {
                    messages.push(msg.clone());
                }
            }
            for notif in &p.notifications {
                if !notifications.contains(notif) {
                    notifications.push(*notif);
                }
            }
        }

        let mut block = CheckpointBlock::new(
            transactions,
            self.round_data.tips_soe.to_vec(),
            observations,
            messages,
            notifications,
        );
        block.sign(&self.keypair);

        let proposal = UnionBlockProposal {
            round_id: self.round_data.round_id,
            facilitator: self.node_id,
            block: block.clone(),
        };
        self.network
            .broadcast(Message::UnionBlockProposal(proposal))
            .await
            .ok();
        state.block_proposals.insert(self.node_id, block);

        self.cascade(state).await
    }

    /// Record a phase-2 union block.
    pub async fn add_block_proposal(
        &self,
        proposal: UnionBlockProposal,
    ) -> Result<Option<RoundOutcome>, RoundError> {
        let mut state = self.state.lock().await;
        if state.stage > ConsensusStage::WaitingForBlockProposals {
            return Err(RoundError::new(
                self.id(),
                RoundErrorKind::PreviousStage { stage: state.stage },
            ));
        }
        state
            .block_proposals
            .insert(proposal.facilitator, proposal.block);
        self.cascade(&mut state).await
    }

    /// Record a phase-3 selected block.
    pub async fn add_selected_block_proposal(
        &self,
        proposal: SelectedUnionBlock,
    ) -> Result<Option<RoundOutcome>, RoundError> {
        let mut state = self.state.lock().await;
        if state.stage > ConsensusStage::WaitingForSelectedBlocks {
            return Err(RoundError::new(
                self.id(),
                RoundErrorKind::PreviousStage { stage: state.stage },
            ));
        }
        state
            .selected_blocks
            .insert(proposal.facilitator, proposal.block);
        self.cascade(&mut state).await
    }

    /// Run whichever phase actions have become due. A phase may complete
    /// from buffered future-phase proposals the moment the stage advances,
    /// so this loops until nothing more fires.
    async fn cascade(&self, state: &mut RoundState) -> Result<Option<RoundOutcome>, RoundError> {
        let total = self.round_data.facilitator_count();
        loop {
            match state.stage {
                ConsensusStage::WaitingForBlockProposals
                    if state.block_proposals.len() == total =>
                {
                    state.stage = ConsensusStage::ResolvingMajorityCb;
                    self.resolve_majority(state).await?;
                }
                ConsensusStage::WaitingForSelectedBlocks
                    if state.selected_blocks.len() == total =>
                {
                    state.stage = ConsensusStage::AcceptingMajorityCb;
                    return self.accept_majority(state).await.map(Some);
                }
                _ => return Ok(None),
            }
        }
    }

    /// Phase-2 action: merge the majority content group and announce it.
    async fn resolve_majority(&self, state: &mut RoundState) -> Result<(), RoundError> {
        let count = state.block_proposals.len();
        let total = self.round_data.facilitator_count();
        if count * 2 <= total {
            return Err(self.round_error(state, RoundErrorKind::NotEnoughProposals { count, total }));
        }

        let mut groups: HashMap<Hash, Vec<&CheckpointBlock>> = HashMap::new();
        for block in state.block_proposals.values() {
            groups.entry(block.base_hash()).or_default().push(block);
        }
        // Max group; ties broken by the larger base hash.
        let (_, winners) = groups
            .into_iter()
            .max_by(|(ka, va), (kb, vb)| va.len().cmp(&vb.len()).then(ka.cmp(kb)))
            .expect("at least one block proposal is present");

        let mut merged = winners[0].clone();
        for block in &winners[1..] {
            merged = merged.plus_edge(block);
        }

        state.stage = ConsensusStage::WaitingForSelectedBlocks;
        let selected = SelectedUnionBlock {
            round_id: self.round_data.round_id,
            facilitator: self.node_id,
            block: merged.clone(),
        };
        self.network
            .broadcast(Message::SelectedUnionBlock(selected))
            .await
            .ok();
        state.selected_blocks.insert(self.node_id, merged);
        Ok(())
    }

    /// Phase-3 action: admit the majority block through the pipeline.
    async fn accept_majority(&self, state: &mut RoundState) -> Result<RoundOutcome, RoundError> {
        let count = state.selected_blocks.len();
        let total = self.round_data.facilitator_count();
        if count != total {
            return Err(self.round_error(state, RoundErrorKind::NotEnoughProposals { count, total }));
        }

        let mut groups: HashMap<Hash, Vec<&CheckpointBlock>> = HashMap::new();
        for block in state.selected_blocks.values() {
            groups.entry(block.soe_hash()).or_default().push(block);
        }
        let (_, winners) = groups
            .into_iter()
            .max_by(|(ka, va), (kb, vb)| va.len().cmp(&vb.len()).then(ka.cmp(kb)))
            .expect("at least one selected block is present");
        let block = winners[0].clone();

        let cache = CheckpointCache::new(block, None);
        match self.pipeline.accept(cache.clone()).await {
            Ok(crate::acceptance::AcceptOutcome::Accepted(height)) => {
                let committed = CheckpointCache {
                    height: Some(height),
                    ..cache
                };
                let mut facilitators: Vec<NodeId> =
                    self.round_data.peers.iter().copied().collect();
                facilitators.push(self.round_data.facilitator_id);
                self.network
                    .broadcast(Message::FinishedCheckpoint {
                        cache: Box::new(committed.clone()),
                        facilitators,
                    })
                    .await
                    .ok();
                Ok(RoundOutcome {
                    round_id: self.id(),
                    accepted: Some(committed),
                    transactions_to_return: Vec::new(),
                    observations_to_return: Vec::new(),
                })
            }
            Ok(crate::acceptance::AcceptOutcome::Buffered) => Ok(RoundOutcome {
                round_id: self.id(),
                accepted: None,
                transactions_to_return: Vec::new(),
                observations_to_return: Vec::new(),
            }),
            Err(err) => Ok(self.outcome_for_failure(state, err)),
        }
    }

    /// Map an acceptance failure to the data that flows back to the pools.
    fn outcome_for_failure(&self, state: &RoundState, err: AcceptanceError) -> RoundOutcome {
        let (transactions, observations) = self.round_payload(state);
        let (txs, obs) = match &err {
            AcceptanceError::AlreadyStored(_)
            | AcceptanceError::PendingAcceptance(_)
            | AcceptanceError::MissingTransactionReference
            | AcceptanceError::MissingParents => (Vec::new(), Vec::new()),
            AcceptanceError::TipConflict(conflicting) => {
                let excluded: Vec<Hash> = conflicting.iter().map(|tx| tx.hash).collect();
                (
                    transactions
                        .into_iter()
                        .filter(|tx| !excluded.contains(&tx.hash))
                        .collect(),
                    observations,
                )
            }
            AcceptanceError::ContainsInvalidTransactions(excluded) => {
                let excluded: Vec<Hash> = excluded.iter().map(|tx| tx.hash).collect();
                (
                    transactions
                        .into_iter()
                        .filter(|tx| !excluded.contains(&tx.hash))
                        .collect(),
                    observations,
                )
            }
            _ => (transactions, observations),
        };
        if !err.is_informational() {
            tracing::warn!(round = %self.id(), %err, "majority block not accepted");
        }
        RoundOutcome {
            round_id: self.id(),
            accepted: None,
            transactions_to_return: txs,
            observations_to_return: obs,
        }
    }

    /// Everything this round is holding that belongs back in the pools.
    fn round_payload(&self, state: &RoundState) -> (Vec<Transaction>, Vec<Observation>) {
        let mut transactions: Vec<Transaction> = Vec::new();
        let mut observations: Vec<Observation> = Vec::new();
        let mut add = |txs: &[Transaction], obs: &[Observation]| {
            for tx in txs {
                if !transactions.iter().any(|t| t.hash == tx.hash) {
                    transactions.push(tx.clone());
                }
            }
            for o in obs {
                if !observations.iter().any(|x| x.hash == o.hash) {
                    observations.push(o.clone());
                }
            }
        };
        add(&self.round_data.transactions, &self.round_data.observations);
        if let Some(own) = &state.own_proposal {
            add(&own.transactions, &own.observations);
        }
        for p in state.data_proposals.values() {
            add(&p.transactions, &p.observations);
        }
        (transactions, observations)
    }

    fn round_error(&self, state: &RoundState, kind: RoundErrorKind) -> RoundError {
        let (txs, obs) = self.round_payload(state);
        RoundError::new(self.id(), kind).with_data(txs, obs)
    }

    /// The round's data for a cancellation outcome (manager shutdown).
    pub async fn drain_payload(&self) -> (Vec<Transaction>, Vec<Observation>) {
        let state = self.state.lock().await;
        self.round_payload(&state)
    }
}
