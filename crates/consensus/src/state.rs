//! The consensus state machine.
//!
//! A single task consumes exactly one input at a time from three sources:
//! peer messages, our own internal messages, and timeouts. Every input is
//! written to the WAL before it is processed, and inputs that lead to us
//! signing something are fsynced before the signature can leave the node.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use noirbft_config::ConsensusConfig;
use noirbft_core_types::{
    Block, BlockId, Height, NodeId, PartSet, PrivValidator, Proposal, Round, Timestamp, Vote,
    VoteType, BLOCK_PART_SIZE_BYTES,
};
use noirbft_evidence::Pool as EvidencePool;
use noirbft_proto as proto;
use noirbft_store::{BlockStore, State};
use noirbft_votekeeper::{Error as VoteError, HeightVoteSet, VoteSet};
use noirbft_wal::{SearchOptions, TimedWalMessage, Wal, WalMessage};

use crate::executor::BlockExecutor;
use crate::messages::{ConsensusMessage, MsgInfo, StateEvent, TimeoutInfo};
use crate::round_state::{RoundState, RoundStepType};
use crate::ticker::TimeoutTicker;
use crate::Error;

/// Handle the reactor uses to feed peer messages in and observe the round
/// state.
#[derive(Clone)]
pub struct StateHandle {
    peer_msg_tx: mpsc::Sender<MsgInfo>,
    snapshot_rx: watch::Receiver<Arc<RoundState>>,
}

impl StateHandle {
    /// Queues a peer message for the state machine.
    pub async fn submit(&self, msg: ConsensusMessage, peer_id: NodeId) {
        let _ = self
            .peer_msg_tx
            .send(MsgInfo {
                msg,
                peer_id: Some(peer_id),
            })
            .await;
    }

    /// The latest published round-state snapshot.
    pub fn round_state(&self) -> Arc<RoundState> {
        self.snapshot_rx.borrow().clone()
    }

    /// Waits for the next snapshot change.
    pub async fn changed(&mut self) -> bool {
        self.snapshot_rx.changed().await.is_ok()
    }
}

pub struct ConsensusState {
    config: ConsensusConfig,
    state: State,
    rs: RoundState,
    priv_validator: Option<PrivValidator>,

    wal: Wal,
    block_exec: BlockExecutor,
    block_store: BlockStore,
    evidence_pool: Arc<EvidencePool>,

    ticker: TimeoutTicker,
    timeout_rx: mpsc::Receiver<TimeoutInfo>,
    peer_msg_rx: mpsc::Receiver<MsgInfo>,
    internal_msg_rx: mpsc::Receiver<MsgInfo>,
    internal_msg_tx: mpsc::Sender<MsgInfo>,

    snapshot_tx: watch::Sender<Arc<RoundState>>,
    events_tx: mpsc::Sender<StateEvent>,

    replay_mode: bool,
}

impl ConsensusState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConsensusConfig,
        state: State,
        priv_validator: Option<PrivValidator>,
        wal: Wal,
        block_exec: BlockExecutor,
        block_store: BlockStore,
        evidence_pool: Arc<EvidencePool>,
    ) -> (Self, StateHandle, mpsc::Receiver<StateEvent>) {
        let (ticker, timeout_rx) = TimeoutTicker::spawn();
        let (peer_msg_tx, peer_msg_rx) = mpsc::channel(1024);
        let (internal_msg_tx, internal_msg_rx) = mpsc::channel(1024);
        let (events_tx, events_rx) = mpsc::channel(256);

        let rs = fresh_round_state(&state);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(rs.clone()));

        let mut cs = Self {
            config,
            state,
            rs,
            priv_validator,
            wal,
            block_exec,
            block_store,
            evidence_pool,
            ticker,
            timeout_rx,
            peer_msg_rx,
            internal_msg_rx,
            internal_msg_tx,
            snapshot_tx,
            events_tx,
            replay_mode: false,
        };
        cs.reconstruct_last_commit();

        let handle = StateHandle {
            peer_msg_tx,
            snapshot_rx,
        };
        (cs, handle, events_rx)
    }

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    fn our_address(&self) -> Option<noirbft_core_types::Address> {
        self.priv_validator.as_ref().map(|pv| pv.address())
    }

    fn is_proposer(&self) -> bool {
        match (self.our_address(), self.rs.validators.get_proposer()) {
            (Some(address), Some(proposer)) => proposer.address == address,
            _ => false,
        }
    }

    /// On restart, rebuild the last-commit vote set from the persisted
    /// seen-commit so we can gossip it to lagging peers.
    fn reconstruct_last_commit(&mut self) {
        if self.state.is_empty() {
            return;
        }
        let Ok(Some(seen_commit)) = self.block_store.load_seen_commit(self.state.last_block_height)
        else {
            return;
        };

        let vote_set = VoteSet::new(
            self.state.chain_id.clone(),
            seen_commit.height,
            seen_commit.round,
            VoteType::Precommit,
            self.state.last_validators.clone(),
        );
        for index in 0..seen_commit.len() {
            if let Some(vote) = seen_commit.vote(index as i32) {
                if let Err(e) = vote_set.add_vote(vote) {
                    warn!("Failed to reconstruct last-commit vote: {e}");
                }
            }
        }
        self.rs.last_commit = Some(Arc::new(vote_set));
    }

    /// Replays the WAL from the last completed height, then runs the
    /// receive loop forever.
    pub async fn run(mut self) -> Result<(), Error> {
        self.catchup_replay().await?;

        info!(
            height = %self.rs.height,
            validators = self.rs.validators.len(),
            "Starting consensus"
        );
        self.schedule_round_0();
        self.publish();

        loop {
            tokio::select! {
                biased;

                Some(msg) = self.internal_msg_rx.recv() => {
                    self.wal
                        .write_sync(&timed(WalMessage {
                            sum: Some(noirbft_proto::wal::wal_message::Sum::MsgInfo(
                                msg.to_wal_proto()?,
                            )),
                        }))?;
                    if let Err(e) = self.handle_msg(msg).await {
                        self.check_fatal(e)?;
                    }
                    self.publish();
                }

                Some(ti) = self.timeout_rx.recv() => {
                    self.wal.write(&timed(WalMessage {
                        sum: Some(noirbft_proto::wal::wal_message::Sum::TimeoutInfo(
                            ti.to_wal_proto(),
                        )),
                    }))?;
                    if let Err(e) = self.handle_timeout(ti).await {
                        self.check_fatal(e)?;
                    }
                    self.publish();
                }

                Some(msg) = self.peer_msg_rx.recv() => {
                    self.wal.write(&timed(WalMessage {
                        sum: Some(noirbft_proto::wal::wal_message::Sum::MsgInfo(
                            msg.to_wal_proto()?,
                        )),
                    }))?;
                    if let Err(e) = self.handle_msg(msg).await {
                        self.check_fatal(e)?;
                    }
                    self.publish();
                }

                else => return Err(Error::ChannelClosed("consensus inputs")),
            }
        }
    }

    /// Application failures and invariant violations abort the node; all
    /// other errors are logged and dropped.
    fn check_fatal(&self, e: Error) -> Result<(), Error> {
        match e {
            Error::Application(_) | Error::Invariant(_) | Error::Wal(_) | Error::Store(_) => {
                error!("Fatal consensus failure: {e}");
                Err(e)
            }
            other => {
                debug!("Dropped consensus input: {other}");
                Ok(())
            }
        }
    }

    /// Publishes the current round state and, on step changes, the
    /// corresponding broadcast.
    fn publish(&mut self) {
        let snapshot = Arc::new(self.rs.clone());
        let changed = {
            let prev = self.snapshot_tx.borrow();
            prev.hrs() != snapshot.hrs()
        };
        let _ = self.snapshot_tx.send(snapshot);

        if changed {
            let _ = self.wal.write(&timed(WalMessage {
                sum: Some(noirbft_proto::wal::wal_message::Sum::RoundStepUpdate(
                    proto::wal::RoundStepUpdate {
                        height: self.rs.height.as_i64(),
                        round: self.rs.round.as_i32(),
                        step: self.rs.step.as_u32(),
                    },
                )),
            }));
            self.send_event(StateEvent::NewRoundStep(self.new_round_step_msg()));
        }
    }

    fn send_event(&self, event: StateEvent) {
        if self.replay_mode {
            return;
        }
        let _ = self.events_tx.try_send(event);
    }

    fn new_round_step_msg(&self) -> ConsensusMessage {
        ConsensusMessage::NewRoundStep {
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
            seconds_since_start_time: Timestamp::now()
                .elapsed_since(self.rs.start_time)
                .as_secs() as i64,
            last_commit_round: self
                .rs
                .last_commit
                .as_ref()
                .map(|lc| lc.round())
                .unwrap_or(Round::NIL),
        }
    }

    // ---------------------------------------------------------------
    // Replay
    // ---------------------------------------------------------------

    async fn catchup_replay(&mut self) -> Result<(), Error> {
        let last_height = self.state.last_block_height;
        let records = match self
            .wal
            .search_for_end_height(last_height.as_i64(), SearchOptions::default())
        {
            Ok(Some(records)) => records,
            Ok(None) => {
                if last_height > Height::ZERO {
                    debug!(%last_height, "No WAL end-height marker; starting clean");
                }
                return Ok(());
            }
            Err(e) => return Err(Error::Wal(e)),
        };

        info!(
            %last_height,
            records = records.len(),
            "Replaying WAL from last completed height"
        );

        self.replay_mode = true;
        for record in records {
            if let Err(e) = self.replay_record(record).await {
                self.replay_mode = false;
                return Err(e);
            }
        }
        self.replay_mode = false;
        Ok(())
    }

    async fn replay_record(&mut self, record: TimedWalMessage) -> Result<(), Error> {
        use noirbft_proto::wal::wal_message::Sum;

        match record.msg.and_then(|m| m.sum) {
            Some(Sum::MsgInfo(msg)) => {
                let msg = MsgInfo::from_wal_proto(msg)?;
                if let Err(e) = self.handle_msg(msg).await {
                    self.check_fatal(e)?;
                }
            }
            Some(Sum::TimeoutInfo(ti)) => {
                let ti = TimeoutInfo::from_wal_proto(ti)?;
                if let Err(e) = self.handle_timeout(ti).await {
                    self.check_fatal(e)?;
                }
            }
            Some(Sum::RoundStepUpdate(_)) | Some(Sum::EndHeight(_)) | None => {}
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Input handling
    // ---------------------------------------------------------------

    async fn handle_msg(&mut self, msg: MsgInfo) -> Result<(), Error> {
        let peer_id = msg.peer_id.clone();
        match msg.msg {
            ConsensusMessage::Proposal(proposal) => self.set_proposal(proposal),
            ConsensusMessage::BlockPart {
                height,
                round,
                part,
            } => self.add_proposal_block_part(height, round, part).await,
            ConsensusMessage::Vote(vote) => self.try_add_vote(vote, peer_id).await,
            other => {
                debug!("Unexpected message in state machine: {other:?}");
                Ok(())
            }
        }
    }

    async fn handle_timeout(&mut self, ti: TimeoutInfo) -> Result<(), Error> {
        if ti.height != self.rs.height
            || ti.round < self.rs.round
            || (ti.round == self.rs.round && ti.step < self.rs.step)
        {
            debug!(
                height = %ti.height, round = %ti.round, step = %ti.step,
                "Ignoring stale timeout"
            );
            return Ok(());
        }

        debug!(height = %ti.height, round = %ti.round, step = %ti.step, "Timeout");
        match ti.step {
            RoundStepType::NewHeight => self.enter_new_round(ti.height, Round::ZERO),
            RoundStepType::NewRound => self.enter_propose(ti.height, ti.round),
            RoundStepType::Propose => self.enter_prevote(ti.height, ti.round),
            RoundStepType::PrevoteWait => self.enter_precommit(ti.height, ti.round),
            RoundStepType::PrecommitWait => {
                self.enter_precommit(ti.height, ti.round)?;
                self.enter_new_round(ti.height, ti.round.increment())
            }
            _ => Ok(()),
        }
    }

    // ---------------------------------------------------------------
    // Height lifecycle
    // ---------------------------------------------------------------

    fn schedule_round_0(&mut self) {
        let now = Timestamp::now();
        let sleep = self.rs.start_time.elapsed_since(now);
        self.ticker.schedule(TimeoutInfo {
            duration: sleep,
            height: self.rs.height,
            round: Round::ZERO,
            step: RoundStepType::NewHeight,
        });
    }

    /// Moves the machine to the next height after a commit.
    fn update_to_state(&mut self, state: State) {
        let height = state.next_height();

        // Keep our own precommits around for the new height's last-commit
        // gossip.
        let last_commit = if self.rs.commit_round.is_nil() {
            None
        } else {
            self.rs
                .votes
                .precommits(self.rs.commit_round)
                .filter(|pc| pc.has_two_thirds_majority())
        };

        let start_time = if self.rs.commit_time == Timestamp::ZERO {
            Timestamp::now().add(self.config.timeout_commit)
        } else {
            self.rs.commit_time.add(self.config.timeout_commit)
        };

        let validators = state.validators.clone();
        self.rs = RoundState {
            height,
            round: Round::ZERO,
            step: RoundStepType::NewHeight,
            start_time,
            commit_time: Timestamp::ZERO,
            votes: Arc::new(HeightVoteSet::new(
                state.chain_id.clone(),
                height,
                validators.clone(),
            )),
            validators,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: Round::NIL,
            locked_block: None,
            locked_block_parts: None,
            valid_round: Round::NIL,
            valid_block: None,
            valid_block_parts: None,
            commit_round: Round::NIL,
            last_commit,
            last_validators: state.last_validators.clone(),
            triggered_timeout_precommit: false,
        };
        self.state = state;
    }

    // ---------------------------------------------------------------
    // Round transitions
    // ---------------------------------------------------------------

    fn enter_new_round(&mut self, height: Height, round: Round) -> Result<(), Error> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != RoundStepType::NewHeight)
        {
            return Ok(());
        }

        info!(%height, %round, "Entering new round");

        // Skipped rounds advance the proposer rotation.
        if round > self.rs.round {
            let diff = round.as_i32() - self.rs.round.as_i32();
            self.rs.validators.increment_proposer_priority(diff)?;
        }

        self.rs.round = round;
        self.rs.step = RoundStepType::NewRound;
        if round != Round::ZERO {
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        self.rs.votes.set_round(round.increment());
        self.rs.triggered_timeout_precommit = false;

        let wait_for_txs = !self.config.create_empty_blocks
            && round == Round::ZERO
            && !self.block_exec.mempool().has_txs();
        if wait_for_txs {
            if self.config.create_empty_blocks_interval > Duration::ZERO {
                self.ticker.schedule(TimeoutInfo {
                    duration: self.config.create_empty_blocks_interval,
                    height,
                    round,
                    step: RoundStepType::NewRound,
                });
            }
            return Ok(());
        }
        self.enter_propose(height, round)
    }

    fn enter_propose(&mut self, height: Height, round: Round) -> Result<(), Error> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStepType::Propose)
        {
            return Ok(());
        }

        debug!(%height, %round, "Entering propose step");
        self.rs.round = round;
        self.rs.step = RoundStepType::Propose;

        self.ticker.schedule(TimeoutInfo {
            duration: self.config.propose_timeout(round.as_i32()),
            height,
            round,
            step: RoundStepType::Propose,
        });

        if self.is_proposer() && !self.replay_mode {
            self.decide_proposal(height, round)?;
        }

        if self.rs.is_proposal_complete() {
            return self.enter_prevote(height, round);
        }
        Ok(())
    }

    /// Builds (or re-proposes) a block, signs the proposal, and submits it
    /// plus every part through the internal queue.
    fn decide_proposal(&mut self, height: Height, round: Round) -> Result<(), Error> {
        let Some(priv_validator) = self.priv_validator.clone() else {
            return Ok(());
        };

        let (block, parts) = if let Some(locked) = self.rs.locked_block.clone() {
            let parts = self
                .rs
                .locked_block_parts
                .clone()
                .ok_or_else(|| Error::Invariant("locked block without parts".to_string()))?;
            (locked, parts)
        } else if let Some(valid) = self.rs.valid_block.clone() {
            let parts = self
                .rs
                .valid_block_parts
                .clone()
                .ok_or_else(|| Error::Invariant("valid block without parts".to_string()))?;
            (valid, parts)
        } else {
            let last_commit = if height == self.state.initial_height {
                noirbft_core_types::Commit::new(
                    Height::ZERO,
                    Round::ZERO,
                    BlockId::nil(),
                    Vec::new(),
                )
            } else {
                let Some(last_commit) = self.rs.last_commit.as_ref() else {
                    debug!("Cannot propose without the previous block's commit");
                    return Ok(());
                };
                last_commit.make_commit()?
            };

            let proposer_address = priv_validator.address();
            let (_, proposer) = self
                .rs
                .validators
                .get_by_address(&proposer_address)
                .ok_or(Error::NotAValidator)?;
            let block = self.block_exec.create_proposal_block(
                &self.state,
                height,
                last_commit,
                proposer,
                Timestamp::now(),
            )?;
            let parts = block
                .make_part_set(BLOCK_PART_SIZE_BYTES)
                .map_err(|e| Error::InvalidBlock(e.to_string()))?;
            (block, parts)
        };

        let block_id = BlockId::new(
            block.hash().map_err(|e| Error::InvalidBlock(e.to_string()))?,
            parts.header(),
        );
        let mut proposal = Proposal::new(
            height,
            round,
            self.rs.valid_round,
            block_id,
            Timestamp::now(),
        );
        proposal.signature =
            Some(priv_validator.sign(&proposal.sign_bytes(&self.state.chain_id)));

        info!(%height, %round, block = %proposal.block_id, "Proposing block");

        let internal = self.internal_msg_tx.clone();
        let _ = internal.try_send(MsgInfo {
            msg: ConsensusMessage::Proposal(proposal),
            peer_id: None,
        });
        for index in 0..parts.total() {
            if let Some(part) = parts.get_part(index) {
                let _ = internal.try_send(MsgInfo {
                    msg: ConsensusMessage::BlockPart {
                        height,
                        round,
                        part: part.clone(),
                    },
                    peer_id: None,
                });
            }
        }
        Ok(())
    }

    fn set_proposal(&mut self, proposal: Proposal) -> Result<(), Error> {
        if self.rs.proposal.is_some() {
            return Ok(());
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            return Ok(());
        }
        if !proposal.pol_round.is_nil() && proposal.pol_round >= proposal.round {
            return Err(Error::InvalidProposal(
                "proof-of-lock round must precede the proposal round".to_string(),
            ));
        }

        let proposer = self
            .rs
            .validators
            .get_proposer()
            .ok_or(Error::NoProposer(proposal.height, proposal.round))?;
        let pub_key = proposer
            .pub_key
            .ok_or_else(|| Error::InvalidProposal("proposer key unknown".to_string()))?;
        let signature = proposal
            .signature
            .ok_or_else(|| Error::InvalidProposal("unsigned proposal".to_string()))?;
        pub_key
            .verify(&proposal.sign_bytes(&self.state.chain_id), &signature)
            .map_err(|_| Error::InvalidProposal("bad proposal signature".to_string()))?;

        debug!(proposal = %proposal, "Received proposal");
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts = Some(PartSet::from_header(
                proposal.block_id.part_set_header.clone(),
            ));
        }
        self.rs.proposal = Some(proposal);
        Ok(())
    }

    async fn add_proposal_block_part(
        &mut self,
        height: Height,
        _round: Round,
        part: noirbft_core_types::Part,
    ) -> Result<(), Error> {
        if height != self.rs.height {
            debug!(%height, "Dropping block part for other height");
            return Ok(());
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            debug!("Dropping block part: no part set header yet");
            return Ok(());
        };

        let index = part.index;
        let added = parts
            .add_part(part)
            .map_err(|e| Error::InvalidBlock(e.to_string()))?;
        if !added {
            return Ok(());
        }
        let is_complete = parts.is_complete();
        self.send_event(StateEvent::HasVote(ConsensusMessage::HasProposalBlockPart {
            height,
            round: self.rs.round,
            index: index as i32,
        }));

        if !is_complete {
            return Ok(());
        }

        // All parts arrived: decode and validate the block shape.
        let parts = self
            .rs
            .proposal_block_parts
            .as_mut()
            .expect("proposal_block_parts checked above");
        let block =
            Block::from_part_set(parts).map_err(|e| Error::InvalidBlock(e.to_string()))?;
        block
            .validate_basic()
            .map_err(|e| Error::InvalidBlock(e.to_string()))?;
        info!(%height, hash = %hex::encode(block.hash().unwrap_or_default()), "Received complete proposal block");
        self.rs.proposal_block = Some(block);

        // A +2/3 prevote might already exist for it.
        if let Some(prevotes) = self.rs.votes.prevotes(self.rs.round) {
            if let Some(block_id) = prevotes.two_thirds_majority() {
                self.update_valid_block_if_matching(&block_id, self.rs.round);
            }
        }

        if self.rs.step <= RoundStepType::Propose && self.rs.is_proposal_complete() {
            let round = self.rs.round;
            self.enter_prevote(height, round)?;
            if let Some(precommits) = self.rs.votes.precommits(self.rs.round) {
                if precommits.two_thirds_majority().is_some() {
                    self.enter_precommit(height, self.rs.round)?;
                }
            }
        } else if self.rs.step == RoundStepType::Commit {
            self.try_finalize_commit(height).await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Voting
    // ---------------------------------------------------------------

    async fn try_add_vote(&mut self, vote: Vote, peer_id: Option<NodeId>) -> Result<(), Error> {
        match self.add_vote(vote, peer_id).await {
            Ok(()) => Ok(()),
            Err(Error::VoteKeeper(VoteError::ConflictingVote {
                existing,
                conflicting,
            })) => {
                warn!(
                    validator = %existing.validator_address,
                    "Found conflicting vote, recording evidence"
                );
                self.evidence_pool.report_conflicting_votes(
                    *existing,
                    *conflicting,
                    self.state.last_block_time,
                )?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn add_vote(&mut self, vote: Vote, peer_id: Option<NodeId>) -> Result<(), Error> {
        let height = self.rs.height;

        // A precommit for the previous height: feed the last-commit set.
        if vote.height.increment() == height {
            if vote.vote_type != VoteType::Precommit {
                return Ok(());
            }
            let Some(last_commit) = self.rs.last_commit.as_ref() else {
                return Ok(());
            };
            let added = last_commit.add_vote(vote)?;
            if added {
                debug!("Added vote to last commit");
            }
            return Ok(());
        }

        // Height skipping happens only via block sync.
        if vote.height != height {
            debug!(vote_height = %vote.height, "Dropping vote for other height");
            return Ok(());
        }

        let peer = peer_id.unwrap_or_default();
        let vote_round = vote.round;
        let vote_type = vote.vote_type;
        let vote_index = vote.validator_index;
        let added = self.rs.votes.add_vote(vote, &peer)?;
        if !added {
            return Ok(());
        }

        self.send_event(StateEvent::HasVote(ConsensusMessage::HasVote {
            height,
            round: vote_round,
            vote_type,
            index: vote_index,
        }));

        match vote_type {
            VoteType::Prevote => self.on_prevote_added(height, vote_round),
            VoteType::Precommit => self.on_precommit_added(height, vote_round).await,
        }
    }

    fn on_prevote_added(&mut self, height: Height, vote_round: Round) -> Result<(), Error> {
        let Some(prevotes) = self.rs.votes.prevotes(vote_round) else {
            return Ok(());
        };

        if let Some(block_id) = prevotes.two_thirds_majority() {
            // Unlock if a newer polka contradicts our lock.
            if !self.rs.locked_round.is_nil()
                && self.rs.locked_round < vote_round
                && vote_round <= self.rs.round
            {
                let locked_matches = self
                    .locked_block_id()
                    .map(|locked| locked.hash == block_id.hash)
                    .unwrap_or(false);
                if !locked_matches {
                    info!(%vote_round, "Unlocking: polka for a different block");
                    self.rs.locked_round = Round::NIL;
                    self.rs.locked_block = None;
                    self.rs.locked_block_parts = None;
                }
            }

            if !block_id.is_zero() {
                self.update_valid_block_if_matching(&block_id, vote_round);
            }
        }

        let current_round = self.rs.round;
        if current_round < vote_round && prevotes.has_two_thirds_any() {
            // Round skip: the network has moved ahead of us.
            self.enter_new_round(height, vote_round)?;
        } else if current_round == vote_round && self.rs.step >= RoundStepType::Prevote {
            let maj23 = prevotes.two_thirds_majority();
            if let Some(block_id) = maj23 {
                if self.rs.is_proposal_complete() || block_id.is_zero() {
                    self.enter_precommit(height, vote_round)?;
                } else if prevotes.has_two_thirds_any() {
                    self.enter_prevote_wait(height, vote_round)?;
                }
            } else if prevotes.has_two_thirds_any() {
                self.enter_prevote_wait(height, vote_round)?;
            }
        } else if let Some(proposal) = &self.rs.proposal {
            // A late POL for the proposal we are waiting on.
            if proposal.pol_round == vote_round && self.rs.is_proposal_complete() {
                let round = self.rs.round;
                self.enter_prevote(height, round)?;
            }
        }
        Ok(())
    }

    async fn on_precommit_added(&mut self, height: Height, vote_round: Round) -> Result<(), Error> {
        let Some(precommits) = self.rs.votes.precommits(vote_round) else {
            return Ok(());
        };

        if let Some(block_id) = precommits.two_thirds_majority() {
            self.enter_new_round(height, vote_round)?;
            self.enter_precommit(height, vote_round)?;

            if !block_id.is_zero() {
                self.enter_commit(height, vote_round).await?;
            } else {
                self.enter_precommit_wait(height, vote_round)?;
            }
        } else if self.rs.round <= vote_round && precommits.has_two_thirds_any() {
            self.enter_new_round(height, vote_round)?;
            self.enter_precommit_wait(height, vote_round)?;
        }
        Ok(())
    }

    fn locked_block_id(&self) -> Option<BlockId> {
        let block = self.rs.locked_block.as_ref()?;
        let parts = self.rs.locked_block_parts.as_ref()?;
        Some(BlockId::new(block.hash().ok()?, parts.header()))
    }

    fn update_valid_block_if_matching(&mut self, block_id: &BlockId, round: Round) {
        if self.rs.valid_round >= round {
            return;
        }
        let matches = self
            .rs
            .proposal_block
            .as_ref()
            .and_then(|block| block.hash().ok())
            .map(|hash| hash == block_id.hash)
            .unwrap_or(false);
        if matches {
            debug!(%round, "Updating valid block");
            self.rs.valid_round = round;
            self.rs.valid_block = self.rs.proposal_block.clone();
            self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
            self.send_event(StateEvent::NewValidBlock(self.new_valid_block_msg(false)));
        }
    }

    fn new_valid_block_msg(&self, is_commit: bool) -> ConsensusMessage {
        let (header, bits) = match &self.rs.proposal_block_parts {
            Some(parts) => (parts.header(), parts.bit_array().copy()),
            None => (Default::default(), noirbft_core_types::BitArray::new(0)),
        };
        ConsensusMessage::NewValidBlock {
            height: self.rs.height,
            round: self.rs.round,
            block_part_set_header: header,
            block_parts: bits,
            is_commit,
        }
    }

    fn enter_prevote(&mut self, height: Height, round: Round) -> Result<(), Error> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStepType::Prevote)
        {
            return Ok(());
        }

        debug!(%height, %round, "Entering prevote step");
        self.rs.round = round;
        self.rs.step = RoundStepType::Prevote;

        // Decide what to prevote.
        let block_id = if let Some(locked) = self.locked_block_id() {
            debug!("Prevoting locked block");
            locked
        } else if let Some(block) = self.rs.proposal_block.clone() {
            match self.block_exec.validate_block(&self.state, &block) {
                Ok(()) => self
                    .rs
                    .proposal_block_parts
                    .as_ref()
                    .and_then(|parts| {
                        block
                            .hash()
                            .ok()
                            .map(|hash| BlockId::new(hash, parts.header()))
                    })
                    .unwrap_or_else(BlockId::nil),
                Err(e) => {
                    warn!("Proposal block failed validation, prevoting nil: {e}");
                    BlockId::nil()
                }
            }
        } else {
            BlockId::nil()
        };

        self.sign_add_vote(VoteType::Prevote, block_id);
        Ok(())
    }

    fn enter_prevote_wait(&mut self, height: Height, round: Round) -> Result<(), Error> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStepType::PrevoteWait)
        {
            return Ok(());
        }

        debug!(%height, %round, "Entering prevote-wait step");
        self.rs.round = round;
        self.rs.step = RoundStepType::PrevoteWait;
        self.ticker.schedule(TimeoutInfo {
            duration: self.config.prevote_timeout(round.as_i32()),
            height,
            round,
            step: RoundStepType::PrevoteWait,
        });
        Ok(())
    }

    fn enter_precommit(&mut self, height: Height, round: Round) -> Result<(), Error> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStepType::Precommit)
        {
            return Ok(());
        }

        debug!(%height, %round, "Entering precommit step");
        self.rs.round = round;
        self.rs.step = RoundStepType::Precommit;

        let maj23 = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|prevotes| prevotes.two_thirds_majority());

        let block_id = match maj23 {
            None => {
                debug!("No +2/3 prevotes, precommitting nil");
                BlockId::nil()
            }
            Some(block_id) if block_id.is_zero() => {
                // +2/3 prevoted nil: release any lock.
                if self.rs.locked_block.is_some() {
                    info!("Unlocking: +2/3 prevoted nil");
                    self.rs.locked_round = Round::NIL;
                    self.rs.locked_block = None;
                    self.rs.locked_block_parts = None;
                }
                BlockId::nil()
            }
            Some(block_id) => {
                let locked_matches = self
                    .locked_block_id()
                    .map(|locked| locked.hash == block_id.hash)
                    .unwrap_or(false);
                let proposal_matches = self
                    .rs
                    .proposal_block
                    .as_ref()
                    .and_then(|block| block.hash().ok())
                    .map(|hash| hash == block_id.hash)
                    .unwrap_or(false);

                if locked_matches {
                    // Re-lock at this round.
                    self.rs.locked_round = round;
                    block_id
                } else if proposal_matches {
                    // Lock on the polka block.
                    info!(%round, block = %block_id, "Locking block");
                    self.rs.locked_round = round;
                    self.rs.locked_block = self.rs.proposal_block.clone();
                    self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                    block_id
                } else {
                    // +2/3 for a block we have not seen: drop any stale
                    // lock and fetch the polka block's parts.
                    self.rs.locked_round = Round::NIL;
                    self.rs.locked_block = None;
                    self.rs.locked_block_parts = None;
                    if !self
                        .rs
                        .proposal_block_parts
                        .as_ref()
                        .map(|parts| parts.has_header(&block_id.part_set_header))
                        .unwrap_or(false)
                    {
                        self.rs.proposal_block = None;
                        self.rs.proposal_block_parts =
                            Some(PartSet::from_header(block_id.part_set_header.clone()));
                    }
                    BlockId::nil()
                }
            }
        };

        self.sign_add_vote(VoteType::Precommit, block_id);
        Ok(())
    }

    fn enter_precommit_wait(&mut self, height: Height, round: Round) -> Result<(), Error> {
        if self.rs.height != height
            || round != self.rs.round
            || self.rs.triggered_timeout_precommit
        {
            return Ok(());
        }
        let has_any = self
            .rs
            .votes
            .precommits(round)
            .map(|precommits| precommits.has_two_thirds_any())
            .unwrap_or(false);
        if !has_any {
            return Err(Error::Invariant(format!(
                "entering precommit-wait at {height}/{round} without +2/3 precommits"
            )));
        }

        debug!(%height, %round, "Entering precommit-wait step");
        self.rs.triggered_timeout_precommit = true;
        self.rs.step = RoundStepType::PrecommitWait;
        self.ticker.schedule(TimeoutInfo {
            duration: self.config.precommit_timeout(round.as_i32()),
            height,
            round,
            step: RoundStepType::PrecommitWait,
        });
        Ok(())
    }

    // ---------------------------------------------------------------
    // Commit
    // ---------------------------------------------------------------

    async fn enter_commit(&mut self, height: Height, commit_round: Round) -> Result<(), Error> {
        if self.rs.height != height || self.rs.step >= RoundStepType::Commit {
            return Ok(());
        }

        let block_id = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|precommits| precommits.two_thirds_majority())
            .ok_or_else(|| {
                Error::Invariant(format!(
                    "entering commit at {height}/{commit_round} without +2/3 precommits"
                ))
            })?;

        info!(%height, %commit_round, block = %block_id, "Entering commit step");
        self.rs.step = RoundStepType::Commit;
        self.rs.commit_round = commit_round;
        self.rs.commit_time = Timestamp::now();

        // The locked block may be the one being committed.
        let locked_matches = self
            .locked_block_id()
            .map(|locked| locked.hash == block_id.hash)
            .unwrap_or(false);
        if locked_matches {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }

        // If we do not have the committed block yet, start collecting its
        // parts.
        let have_parts_header = self
            .rs
            .proposal_block_parts
            .as_ref()
            .map(|parts| parts.has_header(&block_id.part_set_header))
            .unwrap_or(false);
        if !have_parts_header {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts =
                Some(PartSet::from_header(block_id.part_set_header.clone()));
            self.send_event(StateEvent::NewValidBlock(self.new_valid_block_msg(true)));
        }

        self.try_finalize_commit(height).await
    }

    async fn try_finalize_commit(&mut self, height: Height) -> Result<(), Error> {
        if self.rs.height != height {
            return Ok(());
        }

        let Some(block_id) = self
            .rs
            .votes
            .precommits(self.rs.commit_round)
            .and_then(|precommits| precommits.two_thirds_majority())
        else {
            return Ok(());
        };
        if block_id.is_zero() {
            return Ok(());
        }

        let block_matches = self
            .rs
            .proposal_block
            .as_ref()
            .and_then(|block| block.hash().ok())
            .map(|hash| hash == block_id.hash)
            .unwrap_or(false);
        if !block_matches {
            // Still waiting for the committed block's parts.
            return Ok(());
        }

        self.finalize_commit(height, block_id).await
    }

    async fn finalize_commit(&mut self, height: Height, block_id: BlockId) -> Result<(), Error> {
        let block = self
            .rs
            .proposal_block
            .clone()
            .ok_or_else(|| Error::Invariant("finalizing without a block".to_string()))?;
        let parts = self
            .rs
            .proposal_block_parts
            .clone()
            .ok_or_else(|| Error::Invariant("finalizing without parts".to_string()))?;
        if !parts.is_complete() {
            return Err(Error::Invariant("finalizing an incomplete part set".to_string()));
        }

        self.block_exec
            .validate_block(&self.state, &block)
            .map_err(|e| Error::Invariant(format!("committing an invalid block: {e}")))?;

        info!(%height, block = %block_id, txs = block.data.txs.len(), "Finalizing commit");

        // Persist the block with the commit we saw, unless block sync
        // already stored it.
        let already_stored = self
            .block_store
            .height()?
            .map(|stored| stored >= height)
            .unwrap_or(false);
        if !already_stored {
            let seen_commit = self
                .rs
                .votes
                .precommits(self.rs.commit_round)
                .ok_or_else(|| Error::Invariant("commit round has no precommits".to_string()))?
                .make_commit()?;
            self.block_store.save_block(&block, &parts, &seen_commit)?;
        }

        // Apply through the application. A failure here halts the node;
        // replay will retry because EndHeight is only written after.
        let new_state = match self
            .block_exec
            .apply_block(&self.state, &block_id, &block)
            .await
        {
            Ok(new_state) => new_state,
            Err(Error::Abci(e)) => return Err(Error::Application(e.to_string())),
            Err(e) => return Err(e),
        };

        self.wal.write_sync(&timed(WalMessage {
            sum: Some(noirbft_proto::wal::wal_message::Sum::EndHeight(
                proto::wal::EndHeight {
                    height: height.as_i64(),
                },
            )),
        }))?;

        self.update_to_state(new_state);
        self.schedule_round_0();
        Ok(())
    }

    // ---------------------------------------------------------------
    // Signing
    // ---------------------------------------------------------------

    /// Signs a vote and submits it through the internal queue. The vote is
    /// only released to peers after the queue write lands in the WAL.
    fn sign_add_vote(&mut self, vote_type: VoteType, block_id: BlockId) {
        if self.replay_mode {
            return;
        }
        let Some(priv_validator) = self.priv_validator.clone() else {
            return;
        };
        let address = priv_validator.address();
        let Some((index, _)) = self.rs.validators.get_by_address(&address) else {
            return;
        };

        let mut vote = Vote {
            vote_type,
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            timestamp: Timestamp::now(),
            validator_address: address,
            validator_index: index as i32,
            signature: None,
            extension: Vec::new(),
        };
        vote.signature = Some(priv_validator.sign(&vote.sign_bytes(&self.state.chain_id)));

        debug!(vote = %vote, "Signed vote");
        let _ = self.internal_msg_tx.try_send(MsgInfo {
            msg: ConsensusMessage::Vote(vote),
            peer_id: None,
        });
    }
}

fn fresh_round_state(state: &State) -> RoundState {
    let height = state.next_height();
    RoundState {
        height,
        round: Round::ZERO,
        step: RoundStepType::NewHeight,
        start_time: Timestamp::now(),
        commit_time: Timestamp::ZERO,
        validators: state.validators.clone(),
        proposal: None,
        proposal_block: None,
        proposal_block_parts: None,
        locked_round: Round::NIL,
        locked_block: None,
        locked_block_parts: None,
        valid_round: Round::NIL,
        valid_block: None,
        valid_block_parts: None,
        votes: Arc::new(HeightVoteSet::new(
            state.chain_id.clone(),
            height,
            state.validators.clone(),
        )),
        commit_round: Round::NIL,
        last_commit: None,
        last_validators: state.last_validators.clone(),
        triggered_timeout_precommit: false,
    }
}

fn timed(msg: WalMessage) -> TimedWalMessage {
    TimedWalMessage {
        time: Timestamp::now().as_nanos(),
        msg: Some(msg),
    }
}
