//! Round lifecycle management: creation, routing, timeouts, teardown.
//!
//! The manager owns the map of active rounds. It starts own rounds (subject
//! to a parallelism cap and a cooldown), creates participant rounds when a
//! `StartConsensusRound` arrives, briefly buffers proposals that beat their
//! round announcement, and runs a watchdog per round that forces a
//! behind-schedule union or fails the round when a stage stalls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::acceptance::AcceptancePipeline;
use crate::cluster::ClusterService;
use crate::config::ConsensusConfig;
use crate::crypto::keys::{NodeId, NodeKeypair};
use crate::dag::{CheckpointStorage, TipService};
use crate::mempool::{PendingObservationPool, PendingTransactionPool};
use crate::network::{Message, PeerNetwork};

use super::{
    ConsensusRound, ConsensusStage, RoundData, RoundError, RoundErrorKind, RoundId, RoundOutcome,
};

/// Owns and drives all active rounds.
pub struct ConsensusManager {
    node_id: NodeId,
    keypair: NodeKeypair,
    config: ConsensusConfig,
    network: Arc<dyn PeerNetwork>,
    tx_pool: Arc<PendingTransactionPool>,
    obs_pool: Arc<PendingObservationPool>,
    pipeline: Arc<AcceptancePipeline>,
    storage: Arc<CheckpointStorage>,
    tips: Arc<TipService>,
    cluster: Arc<ClusterService>,
    active_rounds: RwLock<HashMap<RoundId, Arc<ConsensusRound>>>,
    /// Proposals that arrived before their round announcement.
    buffered: Mutex<HashMap<RoundId, Vec<(Instant, Message)>>>,
    last_own_round: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl ConsensusManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: NodeKeypair,
        config: ConsensusConfig,
        network: Arc<dyn PeerNetwork>,
        tx_pool: Arc<PendingTransactionPool>,
        obs_pool: Arc<PendingObservationPool>,
        pipeline: Arc<AcceptancePipeline>,
        storage: Arc<CheckpointStorage>,
        tips: Arc<TipService>,
        cluster: Arc<ClusterService>,
    ) -> Self {
        ConsensusManager {
            node_id: keypair.id(),
            keypair,
            config,
            network,
            tx_pool,
            obs_pool,
            pipeline,
            storage,
            tips,
            cluster,
            active_rounds: RwLock::new(HashMap::new()),
            buffered: Mutex::new(HashMap::new()),
            last_own_round: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn active_round_count(&self) -> usize {
        self.active_rounds.read().await.len()
    }

    /// Start a round with this node as initiator.
    ///
    /// Returns the round id, or `None` when capped, cooling down, or when
    /// tips/facilitators are insufficient.
    pub async fn start_own_round(self: &Arc<Self>) -> Option<RoundId> {
        if self.active_rounds.read().await.len() >= self.config.max_parallel_rounds {
            return None;
        }
        {
            let last = self.last_own_round.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < Duration::from_millis(self.config.own_round_cooldown_ms) {
                    return None;
                }
            }
        }

        let ready = self.cluster.ready_facilitators().await;
        let pulled = self.tips.pull(&ready).await?;

        let chain = self.pipeline.chain();
        let transactions = self
            .tx_pool
            .pull_for_consensus(self.config.max_transaction_threshold, &chain)
            .await;
        let observations = self
            .obs_pool
            .pull_for_consensus(self.config.max_observation_threshold)
            .await;

        let round_data = RoundData {
            round_id: RoundId::generate(),
            peers: pulled.peers.iter().copied().collect(),
            light_peers: Default::default(),
            facilitator_id: self.node_id,
            transactions,
            observations,
            tips_soe: pulled.tips_soe,
            messages: Vec::new(),
        };
        let round_id = round_data.round_id;

        *self.last_own_round.lock().await = Some(Instant::now());
        let round = self.create_round(round_data.clone()).await;
        tracing::info!(round = %round_id, peers = round_data.peers.len(), "starting own round");

        if let Err(e) = self
            .network
            .broadcast(Message::StartConsensusRound(round_data))
            .await
        {
            tracing::warn!(round = %round_id, %e, "round-start broadcast failed");
        }
        let result = round.start_consensus_data_proposal().await;
        self.process_round_result(&round, result).await;
        Some(round_id)
    }

    /// Create a round instance, register it, and arm its watchdog.
    async fn create_round(self: &Arc<Self>, round_data: RoundData) -> Arc<ConsensusRound> {
        let round = Arc::new(ConsensusRound::new(
            round_data,
            self.node_id,
            self.keypair.clone(),
            self.network.clone(),
            self.tx_pool.clone(),
            self.obs_pool.clone(),
            self.pipeline.clone(),
            self.config.max_transaction_threshold,
            self.config.max_observation_threshold,
        ));
        self.active_rounds
            .write()
            .await
            .insert(round.id(), round.clone());
        self.spawn_watchdog(round.clone());
        round
    }

    /// Route an incoming peer message. `from` is the transport-verified
    /// identity of the sender.
    pub async fn handle_message(self: &Arc<Self>, from: NodeId, message: Message) {
        match message {
            Message::StartConsensusRound(round_data) => {
                if round_data.facilitator_id == self.node_id
                    || self
                        .active_rounds
                        .read()
                        .await
                        .contains_key(&round_data.round_id)
                {
                    return;
                }
                let round_id = round_data.round_id;
                let round = self.create_round(round_data).await;
                tracing::debug!(round = %round_id, "joined round as facilitator");
                let result = round.start_consensus_data_proposal().await;
                self.process_round_result(&round, result).await;
                self.replay_buffered(round_id).await;
            }
            Message::ConsensusDataProposal(_)
            | Message::UnionBlockProposal(_)
            | Message::SelectedUnionBlock(_) => {
                let round_id = message
                    .round_id()
                    .expect("proposal messages always carry a round id");
                let round = self.active_rounds.read().await.get(&round_id).cloned();
                match round {
                    Some(round) => self.dispatch_to_round(&round, message).await,
                    None => self.buffer_message(round_id, message).await,
                }
            }
            Message::FinishedCheckpoint { cache, facilitators } => {
                if facilitators.contains(&self.node_id) {
                    return;
                }
                match self.pipeline.accept_from_gossip(Some(*cache)).await {
                    Ok(_) => {}
                    Err(err) if err.is_informational() => {}
                    Err(err) => {
                        tracing::warn!(%err, "gossiped checkpoint rejected");
                    }
                }
            }
            Message::SignatureRequest { block, facilitators } => {
                self.handle_signature_request(from, *block, facilitators).await;
            }
            Message::SignatureResponse { .. } => {
                // Responses are consumed by the requesting transport call.
            }
            Message::GetCheckpoint(soe_hash) => {
                let cache = self.storage.lookup(&soe_hash).await;
                let response = Message::CheckpointResponse(cache.map(Box::new));
                if let Err(e) = self.network.send_to(from, response).await {
                    tracing::debug!(%e, "checkpoint response not delivered");
                }
            }
            Message::CheckpointResponse(_) => {}
        }
    }

    async fn dispatch_to_round(self: &Arc<Self>, round: &Arc<ConsensusRound>, message: Message) {
        let result = match message {
            Message::ConsensusDataProposal(p) => round.add_consensus_data_proposal(p).await,
            Message::UnionBlockProposal(p) => round.add_block_proposal(p).await,
            Message::SelectedUnionBlock(p) => round.add_selected_block_proposal(p).await,
            _ => return,
        };
        self.process_round_result(round, result).await;
    }

    /// Hold a proposal for a round we have not been told about yet.
    async fn buffer_message(&self, round_id: RoundId, message: Message) {
        let mut buffered = self.buffered.lock().await;
        let ttl = Duration::from_millis(crate::constants::ROUND_BUFFER_TTL_MS);
        buffered
            .values_mut()
            .for_each(|msgs| msgs.retain(|(at, _)| at.elapsed() < ttl));
        buffered.retain(|_, msgs| !msgs.is_empty());
        buffered
            .entry(round_id)
            .or_default()
            .push((Instant::now(), message));
    }

    async fn replay_buffered(self: &Arc<Self>, round_id: RoundId) {
        let messages = self.buffered.lock().await.remove(&round_id);
        let Some(messages) = messages else { return };
        let round = self.active_rounds.read().await.get(&round_id).cloned();
        let Some(round) = round else { return };
        for (_, message) in messages {
            self.dispatch_to_round(&round, message).await;
        }
    }

    /// Apply a round-method result: completion stops the round, stage
    /// errors are informational, anything else destroys the round.
    async fn process_round_result(
        self: &Arc<Self>,
        round: &Arc<ConsensusRound>,
        result: Result<Option<RoundOutcome>, RoundError>,
    ) {
        match result {
            Ok(None) => {}
            Ok(Some(outcome)) => self.stop_round(outcome).await,
            Err(err) => match &err.kind {
                RoundErrorKind::PreviousStage { stage } => {
                    tracing::debug!(round = %round.id(), ?stage, "late message ignored");
                }
                _ => self.handle_round_error(err).await,
            },
        }
    }

    /// Stop the round and return its data to the pools.
    pub async fn handle_round_error(&self, err: RoundError) {
        tracing::warn!(round = %err.round_id, kind = %err.kind, "round failed");
        self.active_rounds.write().await.remove(&err.round_id);
        self.tx_pool
            .return_transactions(err.transactions_to_return)
            .await;
        self.obs_pool
            .return_observations(err.observations_to_return)
            .await;
    }

    /// Finish a round. Data belonging to an accepted block leaves the pools
    /// permanently; everything else flows back.
    pub async fn stop_round(&self, outcome: RoundOutcome) {
        self.active_rounds.write().await.remove(&outcome.round_id);
        if let Some(cache) = &outcome.accepted {
            let tx_hashes = cache.block.tx_hashes();
            self.tx_pool.remove(&tx_hashes).await;
            let obs_hashes: Vec<crate::Hash> =
                cache.block.observations.iter().map(|o| o.hash).collect();
            self.obs_pool.remove(&obs_hashes).await;
            tracing::info!(
                round = %outcome.round_id,
                block = %crate::hash_hex(&cache.base_hash),
                "round committed a checkpoint"
            );
        }
        self.tx_pool
            .return_transactions(outcome.transactions_to_return)
            .await;
        self.obs_pool
            .return_observations(outcome.observations_to_return)
            .await;
    }

    /// Per-round stall detection. A stage that makes no progress within the
    /// stage timeout either forces a behind-schedule union (phase 1) or
    /// fails the round; a round alive past the total timeout always fails.
    fn spawn_watchdog(self: &Arc<Self>, round: Arc<ConsensusRound>) {
        let manager = self.clone();
        let stage_timeout = Duration::from_millis(self.config.stage_timeout_ms);
        let total_timeout = Duration::from_millis(self.config.round_total_timeout_ms);
        tokio::spawn(async move {
            let started = Instant::now();
            let mut last_stage = ConsensusStage::Starting;
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = tokio::time::sleep(stage_timeout) => {}
                }
                if !manager
                    .active_rounds
                    .read()
                    .await
                    .contains_key(&round.id())
                {
                    return;
                }
                let stage = round.stage().await;
                let timed_out = started.elapsed() >= total_timeout;
                if stage > last_stage && !timed_out {
                    last_stage = stage;
                    continue;
                }
                if stage == ConsensusStage::WaitingForProposals && !timed_out {
                    let result = round.union_behind().await;
                    match result {
                        Ok(None) => continue,
                        other => {
                            manager.process_round_result(&round, other).await;
                            return;
                        }
                    }
                }
                let (transactions, observations) = round.drain_payload().await;
                let err = RoundError::new(
                    round.id(),
                    RoundErrorKind::NotEnoughProposals {
                        count: 0,
                        total: round.round_data.facilitator_count(),
                    },
                )
                .with_data(transactions, observations);
                manager.handle_round_error(err).await;
                return;
            }
        });
    }

    /// Co-sign a block for a requester, or ask it to re-register when we do
    /// not recognize it as a cluster member.
    async fn handle_signature_request(
        &self,
        from: NodeId,
        block: crate::checkpoint::CheckpointBlock,
        facilitators: Vec<NodeId>,
    ) {
        let known = self.cluster.known_peer_ids().await;
        let response = if !known.contains(&from) && !facilitators.iter().any(|id| known.contains(id)) {
            Message::SignatureResponse {
                signature: None,
                re_register: true,
            }
        } else if block.validate_structure().is_err() {
            Message::SignatureResponse {
                signature: None,
                re_register: false,
            }
        } else {
            let base = block.base_hash();
            Message::SignatureResponse {
                signature: Some(crate::checkpoint::HashSignature {
                    id: self.node_id,
                    public_key: self.keypair.public.clone(),
                    signature: self.keypair.sign(&base),
                }),
                re_register: false,
            }
        };
        if let Err(e) = self.network.send_to(from, response).await {
            tracing::debug!(%e, "signature response not delivered");
        }
    }

    /// Cancel all rounds and return their data to the pools.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let rounds: Vec<Arc<ConsensusRound>> =
            self.active_rounds.write().await.drain().map(|(_, r)| r).collect();
        for round in rounds {
            let (transactions, observations) = round.drain_payload().await;
            self.tx_pool.return_transactions(transactions).await;
            self.obs_pool.return_observations(observations).await;
        }
        tracing::info!("consensus manager shut down");
    }
}
