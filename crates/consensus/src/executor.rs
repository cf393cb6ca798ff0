//! The block executor: the only component that talks to the application.
//! Builds proposal blocks, validates incoming ones, and applies committed
//! blocks through the ABCI connection.

use std::sync::Arc;

use prost::Message;
use tracing::{debug, info};

use noirbft_abci::Client;
use noirbft_core_types::{
    merkle_root, Block, BlockId, Commit, Evidence, EvidenceList, Height, PublicKey, Timestamp,
    Validator, ValidatorSet,
};
use noirbft_evidence::Pool as EvidencePool;
use noirbft_proto as proto;
use noirbft_proto::Protobuf;
use noirbft_store::{BlockStore, State, StateStore};

use crate::Error;

/// The mempool boundary: transactions in, pruning notifications out.
pub trait Mempool: Send + Sync {
    /// Transactions for a new proposal, in priority order.
    fn reap_txs(&self, max_txs: usize) -> Vec<Vec<u8>>;

    /// A block committed; committed transactions can be dropped.
    fn update(&self, height: Height, txs: &[Vec<u8>]);

    /// Whether any transactions are waiting.
    fn has_txs(&self) -> bool;
}

/// Stand-in used when the node runs without a mempool process.
pub struct NoopMempool;

impl Mempool for NoopMempool {
    fn reap_txs(&self, _max_txs: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn update(&self, _height: Height, _txs: &[Vec<u8>]) {}

    fn has_txs(&self) -> bool {
        false
    }
}

pub struct BlockExecutor {
    abci: Arc<dyn Client>,
    state_store: StateStore,
    block_store: BlockStore,
    evidence_pool: Arc<EvidencePool>,
    mempool: Arc<dyn Mempool>,
    max_txs_per_block: usize,
}

impl BlockExecutor {
    pub fn new(
        abci: Arc<dyn Client>,
        state_store: StateStore,
        block_store: BlockStore,
        evidence_pool: Arc<EvidencePool>,
        mempool: Arc<dyn Mempool>,
        max_txs_per_block: usize,
    ) -> Self {
        Self {
            abci,
            state_store,
            block_store,
            evidence_pool,
            mempool,
            max_txs_per_block,
        }
    }

    pub fn mempool(&self) -> &Arc<dyn Mempool> {
        &self.mempool
    }

    /// Assembles a new proposal on top of `state`: mempool transactions
    /// plus whatever evidence is pending.
    pub fn create_proposal_block(
        &self,
        state: &State,
        height: Height,
        last_commit: Commit,
        proposer: &Validator,
        time: Timestamp,
    ) -> Result<Block, Error> {
        let txs = self.mempool.reap_txs(self.max_txs_per_block);
        let evidence = EvidenceList::new(
            self.evidence_pool
                .pending_evidence(state.consensus_params.evidence.max_bytes)?,
        );
        Ok(state.make_block(height, txs, evidence, last_commit, proposer, time)?)
    }

    /// Full validation of a proposed block against the current state.
    pub fn validate_block(&self, state: &State, block: &Block) -> Result<(), Error> {
        block
            .validate_basic()
            .map_err(|e| Error::InvalidBlock(e.to_string()))?;

        let header = &block.header;
        if header.chain_id != state.chain_id {
            return Err(Error::InvalidBlock(format!(
                "wrong chain id: {}",
                header.chain_id
            )));
        }
        if header.height != state.next_height() {
            return Err(Error::InvalidBlock(format!(
                "wrong height: got {}, expected {}",
                header.height,
                state.next_height()
            )));
        }
        if header.last_block_id != state.last_block_id {
            return Err(Error::InvalidBlock("wrong last block id".to_string()));
        }
        if header.validators_hash != state.validators.hash() {
            return Err(Error::InvalidBlock("wrong validators hash".to_string()));
        }
        if header.next_validators_hash != state.next_validators.hash() {
            return Err(Error::InvalidBlock("wrong next validators hash".to_string()));
        }
        if header.app_hash != state.app_hash {
            return Err(Error::InvalidBlock("wrong app hash".to_string()));
        }

        // The embedded last-commit must carry +2/3 of the previous set.
        if header.height != state.initial_height {
            block
                .verify_last_commit(&state.chain_id, &state.last_validators, &state.last_block_id)
                .map_err(|e| Error::InvalidBlock(format!("last commit invalid: {e}")))?;
        } else if !block.last_commit.is_empty() {
            return Err(Error::InvalidBlock(
                "initial block must carry an empty last commit".to_string(),
            ));
        }

        self.evidence_pool.check_evidence(&block.evidence)?;
        Ok(())
    }

    /// Applies a committed block: the `begin_block / deliver_tx* /
    /// end_block / commit` sequence, persistence of the results, and the
    /// derived next state. A non-OK consensus call surfaces as
    /// [`Error::Application`]; the caller halts the node.
    pub async fn apply_block(
        &self,
        state: &State,
        block_id: &BlockId,
        block: &Block,
    ) -> Result<State, Error> {
        let height = block.header.height;

        let begin_block = self
            .abci
            .begin_block(proto::abci::RequestBeginBlock {
                hash: block_id.hash.clone(),
                header: Some(block.header.to_proto().map_err(Error::Proto)?),
                last_commit_info: Some(last_commit_info(state, &block.last_commit)),
                byzantine_validators: byzantine_validators(block),
            })
            .await?;

        let mut deliver_txs = Vec::with_capacity(block.data.txs.len());
        for tx in &block.data.txs {
            let response = self
                .abci
                .deliver_tx(proto::abci::RequestDeliverTx { tx: tx.clone() })
                .await?;
            deliver_txs.push(response);
        }

        let end_block = self
            .abci
            .end_block(proto::abci::RequestEndBlock {
                height: height.as_i64(),
            })
            .await?;

        let commit = self.abci.commit().await?;

        let responses = proto::abci::AbciResponses {
            deliver_txs: deliver_txs.clone(),
            begin_block: Some(begin_block),
            end_block: Some(end_block.clone()),
        };
        self.state_store.save_abci_responses(height, &responses)?;

        let next_state =
            self.next_state(state, block_id, block, &deliver_txs, &end_block, commit.data)?;
        self.state_store.save(&next_state)?;

        // Let the collaborating pools prune what the block consumed.
        self.mempool.update(height, &block.data.txs);
        self.evidence_pool
            .update(next_state.clone(), &block.evidence)?;

        info!(
            %height,
            txs = block.data.txs.len(),
            app_hash = %hex_fmt(&next_state.app_hash),
            "Applied block"
        );
        Ok(next_state)
    }

    /// Derives the post-block state: validator updates apply to the
    /// next-next height, consensus-param updates to the next height.
    fn next_state(
        &self,
        state: &State,
        block_id: &BlockId,
        block: &Block,
        deliver_txs: &[proto::abci::ResponseDeliverTx],
        end_block: &proto::abci::ResponseEndBlock,
        app_hash: Vec<u8>,
    ) -> Result<State, Error> {
        let height = block.header.height;

        let mut next_validators = state.next_validators.clone();
        let mut last_height_validators_changed = state.last_height_validators_changed;
        if !end_block.validator_updates.is_empty() {
            let updates = validator_updates(&end_block.validator_updates)?;
            next_validators
                .apply_updates(updates)
                .map_err(Error::Core)?;
            // Takes effect at H+2.
            last_height_validators_changed = height.increment().increment();
        }
        next_validators.increment_proposer_priority(1)?;

        let mut consensus_params = state.consensus_params.clone();
        let mut last_height_params_changed = state.last_height_consensus_params_changed;
        if let Some(param_updates) = &end_block.consensus_param_updates {
            consensus_params = consensus_params.update(param_updates);
            consensus_params.validate().map_err(Error::Core)?;
            last_height_params_changed = height.increment();
        }

        // The results hash anchors every deliver-tx response, with the
        // end-block updates folded in as a final leaf.
        let mut result_leaves: Vec<Vec<u8>> =
            deliver_txs.iter().map(|r| r.encode_to_vec()).collect();
        result_leaves.push(end_block.encode_to_vec());
        let last_results_hash = merkle_root(&result_leaves).to_vec();

        let next_state = State {
            chain_id: state.chain_id.clone(),
            initial_height: state.initial_height,
            last_block_height: height,
            last_block_id: block_id.clone(),
            last_block_time: block.header.time,
            last_validators: state.validators.clone(),
            validators: state.next_validators.clone(),
            next_validators,
            last_height_validators_changed,
            consensus_params,
            last_height_consensus_params_changed: last_height_params_changed,
            last_results_hash,
            app_hash,
        };

        self.state_store.save_validators(
            height.increment().increment(),
            next_state.last_height_validators_changed,
            &next_state.next_validators,
        )?;
        self.state_store.save_consensus_params(
            height.increment(),
            next_state.last_height_consensus_params_changed,
            &next_state.consensus_params,
        )?;

        debug!(%height, "Derived next state");
        Ok(next_state)
    }
}

fn hex_fmt(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn last_commit_info(state: &State, last_commit: &Commit) -> proto::abci::LastCommitInfo {
    let votes = last_commit
        .signatures
        .iter()
        .filter_map(|sig| {
            let (_, validator) = state.last_validators.get_by_address(&sig.validator_address)?;
            Some(proto::abci::VoteInfo {
                validator: Some(proto::abci::ValidatorAbci {
                    address: validator.address.as_bytes().to_vec(),
                    power: validator.voting_power,
                }),
                signed_last_block: !sig.is_absent(),
            })
        })
        .collect();

    proto::abci::LastCommitInfo {
        round: last_commit.round.as_i32(),
        votes,
    }
}

fn byzantine_validators(block: &Block) -> Vec<proto::abci::Misbehavior> {
    block
        .evidence
        .evidence
        .iter()
        .flat_map(|evidence: &Evidence| {
            noirbft_evidence::to_abci_evidence(evidence, block.header.time)
        })
        .collect()
}

fn validator_updates(
    updates: &[proto::abci::ValidatorUpdate],
) -> Result<Vec<Validator>, Error> {
    updates
        .iter()
        .map(|update| {
            let pub_key = PublicKey::try_from(update.pub_key.as_slice()).map_err(Error::Core)?;
            Ok(Validator {
                address: pub_key.address(),
                pub_key: Some(pub_key),
                voting_power: update.power,
                proposer_priority: 0,
            })
        })
        .collect()
}

/// Verifies a sync'd block against the validator set that was live at its
/// height, using the commit embedded in its successor.
pub fn verify_sync_block(
    chain_id: &str,
    validators: &ValidatorSet,
    first: &Block,
    second: &Block,
    part_size: usize,
) -> Result<BlockId, Error> {
    first
        .validate_basic()
        .map_err(|e| Error::InvalidBlock(e.to_string()))?;

    let block_id = first
        .block_id(part_size)
        .map_err(|e| Error::InvalidBlock(e.to_string()))?;

    if second.last_commit.block_id != block_id {
        return Err(Error::InvalidBlock(
            "successor's last-commit names a different block".to_string(),
        ));
    }
    validators
        .verify_commit_light(
            &chain_id.to_string(),
            &block_id,
            first.header.height,
            &second.last_commit,
        )
        .map_err(|e| Error::InvalidBlock(format!("commit verification failed: {e}")))?;

    Ok(block_id)
}
