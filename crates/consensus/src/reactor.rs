//! The consensus reactor: mirrors every peer's round state and runs the
//! per-peer gossip routines that push proposals, block parts and votes to
//! whoever is missing them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use noirbft_config::ConsensusConfig;
use noirbft_core_types::{
    BitArray, BlockId, Height, NodeId, PartSetHeader, Round, Vote, VoteType,
};
use noirbft_p2p::{channels, ChannelId, Envelope, PeerStatus, RouterHandle};
use noirbft_proto as proto;
use noirbft_proto::Protobuf;
use noirbft_store::BlockStore;
use noirbft_votekeeper::VoteSetReader;

use crate::messages::{ConsensusMessage, StateEvent};
use crate::round_state::{RoundState, RoundStepType};
use crate::state::StateHandle;

/// Penalty for peers sending malformed consensus traffic.
const MALFORMED_PENALTY: i64 = 3;

/// What we know about one peer's progress through the protocol.
#[derive(Clone, Debug)]
struct PeerRoundState {
    height: Height,
    round: Round,
    step: RoundStepType,

    proposal: bool,
    proposal_block_parts_header: PartSetHeader,
    proposal_block_parts: BitArray,
    proposal_pol_round: Round,
    proposal_pol: BitArray,

    prevotes: BitArray,
    precommits: BitArray,

    last_commit_round: Round,
    last_commit: BitArray,

    catchup_commit_round: Round,
    catchup_commit: BitArray,
}

impl Default for PeerRoundState {
    fn default() -> Self {
        Self {
            height: Height::ZERO,
            round: Round::NIL,
            step: RoundStepType::NewHeight,
            proposal: false,
            proposal_block_parts_header: PartSetHeader::default(),
            proposal_block_parts: BitArray::new(0),
            proposal_pol_round: Round::NIL,
            proposal_pol: BitArray::new(0),
            prevotes: BitArray::new(0),
            precommits: BitArray::new(0),
            last_commit_round: Round::NIL,
            last_commit: BitArray::new(0),
            catchup_commit_round: Round::NIL,
            catchup_commit: BitArray::new(0),
        }
    }
}

impl PeerRoundState {
    /// The peer's vote bitmap for one `(height, round, type)` slice, if we
    /// track it.
    fn vote_bits(&self, height: Height, round: Round, vote_type: VoteType) -> Option<&BitArray> {
        if height == self.height {
            if round == self.round {
                return Some(match vote_type {
                    VoteType::Prevote => &self.prevotes,
                    VoteType::Precommit => &self.precommits,
                });
            }
            if round == self.catchup_commit_round && vote_type == VoteType::Precommit {
                return Some(&self.catchup_commit);
            }
            if round == self.proposal_pol_round && vote_type == VoteType::Prevote {
                return Some(&self.proposal_pol);
            }
        }
        if height.increment() == self.height
            && round == self.last_commit_round
            && vote_type == VoteType::Precommit
        {
            return Some(&self.last_commit);
        }
        None
    }

    fn set_has_vote(&mut self, height: Height, round: Round, vote_type: VoteType, index: i32) {
        if index < 0 {
            return;
        }
        if let Some(bits) = self.vote_bits(height, round, vote_type) {
            bits.set(index as usize, true);
        }
    }

    fn apply_new_round_step(
        &mut self,
        height: Height,
        round: Round,
        step: RoundStepType,
        last_commit_round: Round,
        validator_count: usize,
    ) {
        let new_height = height != self.height;
        let new_round = new_height || round != self.round;

        if new_round {
            self.prevotes = BitArray::new(validator_count);
            self.precommits = BitArray::new(validator_count);
            self.proposal = false;
            self.proposal_block_parts_header = PartSetHeader::default();
            self.proposal_block_parts = BitArray::new(0);
            self.proposal_pol_round = Round::NIL;
            self.proposal_pol = BitArray::new(0);
        }
        if new_height {
            // The peer's precommits for its previous height become its
            // last-commit slice.
            if height == self.height.increment() {
                self.last_commit = self.precommits.copy();
                self.last_commit_round = self.round;
            } else {
                self.last_commit = BitArray::new(0);
                self.last_commit_round = last_commit_round;
            }
            self.catchup_commit_round = Round::NIL;
            self.catchup_commit = BitArray::new(0);
        }

        self.height = height;
        self.round = round;
        self.step = step;
        if !new_height {
            self.last_commit_round = last_commit_round;
        }
    }
}

struct Peer {
    prs: Mutex<PeerRoundState>,
    cancel: watch::Sender<bool>,
}

impl Peer {
    fn snapshot(&self) -> PeerRoundState {
        self.prs.lock().expect("peer state lock poisoned").clone()
    }
}

pub struct Reactor {
    state: StateHandle,
    router: RouterHandle,
    block_store: BlockStore,
    config: ConsensusConfig,
    peers: Arc<Mutex<BTreeMap<NodeId, Arc<Peer>>>>,
    cancel: watch::Sender<bool>,
}

impl Reactor {
    pub fn new(
        state: StateHandle,
        router: RouterHandle,
        block_store: BlockStore,
        config: ConsensusConfig,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            state,
            router,
            block_store,
            config,
            peers: Arc::new(Mutex::new(BTreeMap::new())),
            cancel,
        }
    }

    pub fn stop(&self) {
        let peers = self.peers.lock().expect("reactor peers lock poisoned");
        for peer in peers.values() {
            let _ = peer.cancel.send(true);
        }
        drop(peers);
        let _ = self.cancel.send(true);
    }

    pub fn start(&self, events_rx: mpsc::Receiver<StateEvent>) {
        self.spawn_broadcast_loop(events_rx);
        self.spawn_peer_lifecycle();
        for channel in [
            channels::CONSENSUS_STATE,
            channels::CONSENSUS_DATA,
            channels::CONSENSUS_VOTE,
        ] {
            self.spawn_inbound(channel);
        }
    }

    fn spawn_broadcast_loop(&self, mut events_rx: mpsc::Receiver<StateEvent>) {
        let router = self.router.clone();
        let mut cancel_rx = self.cancel.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    event = events_rx.recv() => {
                        let Some(event) = event else { break };
                        let msg = match event {
                            StateEvent::NewRoundStep(msg)
                            | StateEvent::NewValidBlock(msg)
                            | StateEvent::HasVote(msg) => msg,
                        };
                        if let Some(payload) = encode(&msg) {
                            router.broadcast(channels::CONSENSUS_STATE, payload);
                        }
                    }
                }
            }
            debug!("Consensus broadcast loop finished");
        });
    }

    fn spawn_peer_lifecycle(&self) {
        let peers = Arc::clone(&self.peers);
        let mut updates = self.router.peer_manager().subscribe();
        let mut cancel_rx = self.cancel.subscribe();
        let state = self.state.clone();
        let router = self.router.clone();
        let block_store = self.block_store.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    update = updates.recv() => {
                        let Ok(update) = update else { break };
                        match update.status {
                            PeerStatus::Up => {
                                let peer = Arc::new(Peer {
                                    prs: Mutex::new(PeerRoundState::default()),
                                    cancel: watch::channel(false).0,
                                });
                                {
                                    let mut peers =
                                        peers.lock().expect("reactor peers lock poisoned");
                                    peers.insert(update.peer_id.clone(), Arc::clone(&peer));
                                }
                                spawn_gossip_tasks(
                                    update.peer_id.clone(),
                                    Arc::clone(&peer),
                                    state.clone(),
                                    router.clone(),
                                    block_store.clone(),
                                    config.clone(),
                                );

                                // Tell the newcomer where we are.
                                let rs = state.round_state();
                                let msg = new_round_step_from(&rs);
                                if let Some(payload) = encode(&msg) {
                                    let _ = router.send(
                                        &update.peer_id,
                                        channels::CONSENSUS_STATE,
                                        payload,
                                    );
                                }
                            }
                            PeerStatus::Down => {
                                let removed = {
                                    let mut peers =
                                        peers.lock().expect("reactor peers lock poisoned");
                                    peers.remove(&update.peer_id)
                                };
                                if let Some(peer) = removed {
                                    let _ = peer.cancel.send(true);
                                }
                            }
                        }
                    }
                }
            }
            debug!("Consensus peer lifecycle loop finished");
        });
    }

    fn spawn_inbound(&self, channel: ChannelId) {
        let mut inbound = self.router.open_channel(channel);
        let peers = Arc::clone(&self.peers);
        let state = self.state.clone();
        let router = self.router.clone();
        let mut cancel_rx = self.cancel.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    envelope = inbound.recv() => {
                        let Some(envelope) = envelope else { break };
                        handle_envelope(&peers, &state, &router, envelope).await;
                    }
                }
            }
            debug!(%channel, "Consensus inbound loop finished");
        });
    }
}

fn encode(msg: &ConsensusMessage) -> Option<Bytes> {
    match msg.to_proto() {
        Ok(proto) => Some(Bytes::from(proto.encode_to_vec())),
        Err(e) => {
            warn!("Failed to encode consensus message: {e}");
            None
        }
    }
}

fn new_round_step_from(rs: &RoundState) -> ConsensusMessage {
    ConsensusMessage::NewRoundStep {
        height: rs.height,
        round: rs.round,
        step: rs.step,
        seconds_since_start_time: 0,
        last_commit_round: rs
            .last_commit
            .as_ref()
            .map(|lc| lc.round())
            .unwrap_or(Round::NIL),
    }
}

async fn handle_envelope(
    peers: &Arc<Mutex<BTreeMap<NodeId, Arc<Peer>>>>,
    state: &StateHandle,
    router: &RouterHandle,
    envelope: Envelope,
) {
    let peer = {
        let peers = peers.lock().expect("reactor peers lock poisoned");
        peers.get(&envelope.from).cloned()
    };
    let Some(peer) = peer else {
        trace!(peer = %envelope.from, "Message from untracked peer");
        return;
    };

    let msg = match proto::consensus::Message::decode(envelope.payload.as_ref())
        .map_err(proto::Error::from)
        .and_then(ConsensusMessage::from_proto)
    {
        Ok(msg) => msg,
        Err(e) => {
            warn!(peer = %envelope.from, "Undecodable consensus message: {e}");
            router.peer_manager().report(&envelope.from, MALFORMED_PENALTY);
            return;
        }
    };

    let rs = state.round_state();
    match msg {
        ConsensusMessage::NewRoundStep {
            height,
            round,
            step,
            last_commit_round,
            ..
        } => {
            let mut prs = peer.prs.lock().expect("peer state lock poisoned");
            prs.apply_new_round_step(
                height,
                round,
                step,
                last_commit_round,
                rs.validators.len(),
            );
        }

        ConsensusMessage::NewValidBlock {
            height,
            round,
            block_part_set_header,
            block_parts,
            ..
        } => {
            let mut prs = peer.prs.lock().expect("peer state lock poisoned");
            if prs.height == height && (prs.round == round || prs.step == RoundStepType::Commit) {
                prs.proposal_block_parts_header = block_part_set_header;
                prs.proposal_block_parts = block_parts;
            }
        }

        ConsensusMessage::HasVote {
            height,
            round,
            vote_type,
            index,
        } => {
            let mut prs = peer.prs.lock().expect("peer state lock poisoned");
            prs.set_has_vote(height, round, vote_type, index);
        }

        ConsensusMessage::HasProposalBlockPart {
            height,
            round,
            index,
        } => {
            let prs = peer.prs.lock().expect("peer state lock poisoned");
            if prs.height == height && prs.round == round && index >= 0 {
                prs.proposal_block_parts.set(index as usize, true);
            }
        }

        ConsensusMessage::VoteSetMaj23 {
            height,
            round,
            vote_type,
            block_id,
        } => {
            if height != rs.height {
                return;
            }
            if let Err(e) =
                rs.votes
                    .set_peer_maj23(round, vote_type, envelope.from.clone(), block_id.clone())
            {
                debug!(peer = %envelope.from, "Rejected maj23 claim: {e}");
                router.peer_manager().report(&envelope.from, MALFORMED_PENALTY);
                return;
            }

            // Respond with which of those votes we already have.
            let votes = rs
                .votes
                .get(round, vote_type)
                .map(|set| {
                    set.bit_array_by_block_id(&block_id)
                        .unwrap_or_else(|| BitArray::new(set.size()))
                })
                .unwrap_or_else(|| BitArray::new(0));
            let response = ConsensusMessage::VoteSetBits {
                height,
                round,
                vote_type,
                block_id,
                votes,
            };
            if let Some(payload) = encode(&response) {
                let _ = router.send(&envelope.from, channels::CONSENSUS_STATE, payload);
            }
        }

        ConsensusMessage::VoteSetBits {
            height,
            round,
            vote_type,
            votes,
            ..
        } => {
            let mut prs = peer.prs.lock().expect("peer state lock poisoned");
            if prs.height == height && prs.round == round {
                match vote_type {
                    VoteType::Prevote => prs.prevotes.update(&votes),
                    VoteType::Precommit => prs.precommits.update(&votes),
                }
            }
        }

        ConsensusMessage::Proposal(proposal) => {
            {
                let mut prs = peer.prs.lock().expect("peer state lock poisoned");
                if prs.height == proposal.height && prs.round == proposal.round {
                    prs.proposal = true;
                    if prs.proposal_block_parts_header.is_zero() {
                        prs.proposal_block_parts_header =
                            proposal.block_id.part_set_header.clone();
                        prs.proposal_block_parts =
                            BitArray::new(proposal.block_id.part_set_header.total as usize);
                    }
                    prs.proposal_pol_round = proposal.pol_round;
                }
            }
            state
                .submit(ConsensusMessage::Proposal(proposal), envelope.from)
                .await;
        }

        ConsensusMessage::ProposalPol {
            height,
            proposal_pol_round,
            proposal_pol,
        } => {
            let mut prs = peer.prs.lock().expect("peer state lock poisoned");
            if prs.height == height {
                prs.proposal_pol_round = proposal_pol_round;
                prs.proposal_pol = proposal_pol;
            }
        }

        ConsensusMessage::BlockPart {
            height,
            round,
            part,
        } => {
            {
                let prs = peer.prs.lock().expect("peer state lock poisoned");
                if prs.height == height {
                    prs.proposal_block_parts.set(part.index as usize, true);
                }
            }
            state
                .submit(
                    ConsensusMessage::BlockPart {
                        height,
                        round,
                        part,
                    },
                    envelope.from,
                )
                .await;
        }

        ConsensusMessage::Vote(vote) => {
            {
                let mut prs = peer.prs.lock().expect("peer state lock poisoned");
                let (height, round, vote_type, index) = (
                    vote.height,
                    vote.round,
                    vote.vote_type,
                    vote.validator_index,
                );
                prs.set_has_vote(height, round, vote_type, index);
            }
            state
                .submit(ConsensusMessage::Vote(vote), envelope.from)
                .await;
        }
    }
}

fn spawn_gossip_tasks(
    peer_id: NodeId,
    peer: Arc<Peer>,
    state: StateHandle,
    router: RouterHandle,
    block_store: BlockStore,
    config: ConsensusConfig,
) {
    {
        let peer_id = peer_id.clone();
        let peer = Arc::clone(&peer);
        let state = state.clone();
        let router = router.clone();
        let block_store = block_store.clone();
        let sleep = config.peer_gossip_sleep_duration;
        let mut cancel_rx = peer.cancel.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = gossip_data_once(&peer_id, &peer, &state, &router, &block_store, sleep) => {}
                }
            }
            trace!(peer = %peer_id, "Data gossip finished");
        });
    }

    {
        let peer_id = peer_id.clone();
        let peer = Arc::clone(&peer);
        let state = state.clone();
        let router = router.clone();
        let block_store = block_store.clone();
        let sleep = config.peer_gossip_sleep_duration;
        let mut cancel_rx = peer.cancel.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = gossip_votes_once(&peer_id, &peer, &state, &router, &block_store, sleep) => {}
                }
            }
            trace!(peer = %peer_id, "Vote gossip finished");
        });
    }

    {
        let sleep = config.peer_query_maj23_sleep_duration;
        let mut cancel_rx = peer.cancel.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = query_maj23_once(&peer_id, &state, &router, sleep) => {}
                }
            }
            trace!(peer = %peer_id, "Maj23 query finished");
        });
    }
}

/// One pass of the data gossip: send a missing block part, a catch-up
/// part, or the proposal itself; otherwise nap.
async fn gossip_data_once(
    peer_id: &NodeId,
    peer: &Arc<Peer>,
    state: &StateHandle,
    router: &RouterHandle,
    block_store: &BlockStore,
    sleep: Duration,
) {
    let rs = state.round_state();
    let prs = peer.snapshot();

    // Peer is on our height: feed it proposal parts it is missing.
    if prs.height == rs.height {
        if let Some(parts) = &rs.proposal_block_parts {
            if parts.header() == prs.proposal_block_parts_header {
                let missing = parts.bit_array().sub(&prs.proposal_block_parts);
                let mut rng = rand::thread_rng();
                if let Some(index) = missing.pick_random(&mut rng) {
                    if let Some(part) = parts.get_part(index as u32) {
                        let msg = ConsensusMessage::BlockPart {
                            height: rs.height,
                            round: rs.round,
                            part: part.clone(),
                        };
                        if let Some(payload) = encode(&msg) {
                            if router
                                .send(peer_id, channels::CONSENSUS_DATA, payload)
                                .is_ok()
                            {
                                let prs = peer.prs.lock().expect("peer state lock poisoned");
                                prs.proposal_block_parts.set(index, true);
                            }
                        }
                        return;
                    }
                }
            }
        }

        // Peer lacks the proposal itself.
        if !prs.proposal {
            if let Some(proposal) = &rs.proposal {
                let msg = ConsensusMessage::Proposal(proposal.clone());
                if let Some(payload) = encode(&msg) {
                    let _ = router.send(peer_id, channels::CONSENSUS_DATA, payload);
                }
                {
                    let mut prs = peer.prs.lock().expect("peer state lock poisoned");
                    prs.proposal = true;
                }

                if !proposal.pol_round.is_nil() {
                    if let Some(prevotes) = rs.votes.prevotes(proposal.pol_round) {
                        let msg = ConsensusMessage::ProposalPol {
                            height: rs.height,
                            proposal_pol_round: proposal.pol_round,
                            proposal_pol: prevotes.bit_array(),
                        };
                        if let Some(payload) = encode(&msg) {
                            let _ = router.send(peer_id, channels::CONSENSUS_DATA, payload);
                        }
                    }
                }
                return;
            }
        }
    }

    // Peer is on an older height: serve parts of the stored block.
    if prs.height < rs.height && prs.height > Height::ZERO {
        if let Ok(Some(meta)) = block_store.load_block_meta(prs.height) {
            if meta.block_id.part_set_header == prs.proposal_block_parts_header {
                let total = prs.proposal_block_parts_header.total as usize;
                let ours = BitArray::new(total).not();
                let missing = ours.sub(&prs.proposal_block_parts);
                let mut rng = rand::thread_rng();
                if let Some(index) = missing.pick_random(&mut rng) {
                    if let Ok(Some(part)) = block_store.load_block_part(prs.height, index as u32) {
                        let msg = ConsensusMessage::BlockPart {
                            height: prs.height,
                            round: prs.round,
                            part,
                        };
                        if let Some(payload) = encode(&msg) {
                            if router
                                .send(peer_id, channels::CONSENSUS_DATA, payload)
                                .is_ok()
                            {
                                let prs = peer.prs.lock().expect("peer state lock poisoned");
                                prs.proposal_block_parts.set(index, true);
                            }
                        }
                        return;
                    }
                }
            }
        }
    }

    tokio::time::sleep(sleep).await;
}

/// One pass of the vote gossip: send one vote the peer is missing,
/// preferring last-commit votes, then prevotes, then precommits, then
/// catch-up commits.
async fn gossip_votes_once(
    peer_id: &NodeId,
    peer: &Arc<Peer>,
    state: &StateHandle,
    router: &RouterHandle,
    block_store: &BlockStore,
    sleep: Duration,
) {
    let rs = state.round_state();
    let prs = peer.snapshot();

    let mut readers: Vec<(VoteSetReader, &BitArray)> = Vec::new();

    if prs.height == rs.height {
        // Last-commit votes help a peer still waiting at NewHeight.
        if prs.step == RoundStepType::NewHeight {
            if let Some(last_commit) = &rs.last_commit {
                readers.push((VoteSetReader::from_vote_set(last_commit), &prs.last_commit));
            }
        }
        if !prs.round.is_nil() {
            if let Some(prevotes) = rs.votes.prevotes(prs.round) {
                readers.push((VoteSetReader::from_vote_set(&prevotes), &prs.prevotes));
            }
            if let Some(precommits) = rs.votes.precommits(prs.round) {
                readers.push((VoteSetReader::from_vote_set(&precommits), &prs.precommits));
            }
        }
        if !prs.proposal_pol_round.is_nil() {
            if let Some(prevotes) = rs.votes.prevotes(prs.proposal_pol_round) {
                readers.push((VoteSetReader::from_vote_set(&prevotes), &prs.proposal_pol));
            }
        }
    } else if prs.height.increment() == rs.height {
        // The peer is exactly one height behind: our last-commit decides
        // its current height.
        if let Some(last_commit) = &rs.last_commit {
            readers.push((VoteSetReader::from_vote_set(last_commit), &prs.precommits));
        }
    } else if prs.height < rs.height && prs.height > Height::ZERO {
        // Deep catch-up: serve the stored commit.
        if let Ok(Some(commit)) = block_store.load_seen_commit(prs.height) {
            readers.push((VoteSetReader::from_commit(&commit), &prs.catchup_commit));
        }
    }

    for (reader, their_bits) in readers {
        let missing = reader.bit_array().sub(their_bits);
        let mut rng = rand::thread_rng();
        let Some(index) = missing.pick_random(&mut rng) else {
            continue;
        };
        let Some(vote) = reader.get_by_index(index) else {
            continue;
        };

        let vote: Vote = vote.clone();
        trace!(peer = %peer_id, vote = %vote, "Gossiping vote");
        let msg = ConsensusMessage::Vote(vote.clone());
        if let Some(payload) = encode(&msg) {
            if router
                .send(peer_id, channels::CONSENSUS_VOTE, payload)
                .is_ok()
            {
                let mut prs = peer.prs.lock().expect("peer state lock poisoned");
                prs.set_has_vote(vote.height, vote.round, vote.vote_type, vote.validator_index);
            }
        }
        return;
    }

    tokio::time::sleep(sleep).await;
}

/// Probes the peer for its claimed +2/3 on our current round so byzantine
/// divergence is discovered.
async fn query_maj23_once(
    peer_id: &NodeId,
    state: &StateHandle,
    router: &RouterHandle,
    sleep: Duration,
) {
    tokio::time::sleep(sleep).await;

    let rs = state.round_state();
    for vote_type in [VoteType::Prevote, VoteType::Precommit] {
        let maj23: Option<BlockId> = rs
            .votes
            .get(rs.round, vote_type)
            .and_then(|set| set.two_thirds_majority());
        if let Some(block_id) = maj23 {
            let msg = ConsensusMessage::VoteSetMaj23 {
                height: rs.height,
                round: rs.round,
                vote_type,
                block_id,
            };
            if let Some(payload) = encode(&msg) {
                let _ = router.send(peer_id, channels::CONSENSUS_STATE, payload);
            }
        }
    }
}
