use noirbft_core_types::{
    Block, BlockId, ChainId, Commit, ConsensusParams, Data, EvidenceList, GenesisDoc, Header,
    Height, Timestamp, Validator, ValidatorSet, Version,
};
use noirbft_proto as proto;
use noirbft_proto::Protobuf;

use crate::Error;

/// The replicated state after applying block `last_block_height`.
///
/// Holds three validator sets: the one that signed the last block, the one
/// in force now, and the one that takes over next height (validator updates
/// apply with a one-height delay).
#[derive(Clone, Debug, PartialEq)]
pub struct State {
    pub chain_id: ChainId,
    pub initial_height: Height,

    pub last_block_height: Height,
    pub last_block_id: BlockId,
    pub last_block_time: Timestamp,

    pub validators: ValidatorSet,
    pub next_validators: ValidatorSet,
    pub last_validators: ValidatorSet,
    pub last_height_validators_changed: Height,

    pub consensus_params: ConsensusParams,
    pub last_height_consensus_params_changed: Height,

    pub last_results_hash: Vec<u8>,
    pub app_hash: Vec<u8>,
}

impl State {
    pub fn from_genesis(genesis: &GenesisDoc) -> Result<Self, Error> {
        let validators = genesis.validator_set()?;
        Ok(Self {
            chain_id: genesis.chain_id.clone(),
            initial_height: genesis.initial_height(),
            last_block_height: Height::ZERO,
            last_block_id: BlockId::nil(),
            last_block_time: genesis.genesis_time,
            next_validators: validators.clone(),
            last_validators: ValidatorSet::new([])?,
            validators,
            last_height_validators_changed: genesis.initial_height(),
            consensus_params: genesis.consensus_params.clone(),
            last_height_consensus_params_changed: genesis.initial_height(),
            last_results_hash: Vec::new(),
            app_hash: genesis.app_hash.clone(),
        })
    }

    /// Whether any block has been committed yet.
    pub fn is_empty(&self) -> bool {
        self.last_block_height == Height::ZERO
    }

    /// The height consensus runs at next.
    pub fn next_height(&self) -> Height {
        if self.is_empty() {
            self.initial_height
        } else {
            self.last_block_height.increment()
        }
    }

    /// Assembles a proposal block on top of the current state.
    pub fn make_block(
        &self,
        height: Height,
        txs: Vec<Vec<u8>>,
        evidence: EvidenceList,
        last_commit: Commit,
        proposer: &Validator,
        time: Timestamp,
    ) -> Result<Block, Error> {
        let data = Data { txs };
        let header = Header {
            version: Version { block: 11, app: self.consensus_params.version.app_version },
            chain_id: self.chain_id.clone(),
            height,
            time,
            last_block_id: self.last_block_id.clone(),
            last_commit_hash: last_commit.hash()?,
            data_hash: data.hash(),
            validators_hash: self.validators.hash(),
            next_validators_hash: self.next_validators.hash(),
            consensus_hash: self.consensus_params.hash()?,
            app_hash: self.app_hash.clone(),
            last_results_hash: self.last_results_hash.clone(),
            evidence_hash: evidence.hash()?,
            proposer_address: proposer.address,
        };
        Ok(Block {
            header,
            data,
            evidence,
            last_commit,
        })
    }
}

impl Protobuf for State {
    type Proto = proto::types::State;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        let height = |h: i64, field: &'static str| {
            Height::try_from(h).map_err(|e| proto::Error::invalid_field(field, e))
        };
        Ok(Self {
            chain_id: value.chain_id,
            initial_height: height(value.initial_height, "initial_height")?,
            last_block_height: height(value.last_block_height, "last_block_height")?,
            last_block_id: value
                .last_block_id
                .map(BlockId::from_proto)
                .transpose()?
                .unwrap_or_default(),
            last_block_time: Timestamp::from_nanos(value.last_block_time),
            validators: value
                .validators
                .map(ValidatorSet::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("validators"))?,
            next_validators: value
                .next_validators
                .map(ValidatorSet::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("next_validators"))?,
            last_validators: value
                .last_validators
                .map(ValidatorSet::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("last_validators"))?,
            last_height_validators_changed: height(
                value.last_height_validators_changed,
                "last_height_validators_changed",
            )?,
            consensus_params: value
                .consensus_params
                .map(ConsensusParams::from_proto)
                .transpose()?
                .unwrap_or_default(),
            last_height_consensus_params_changed: height(
                value.last_height_consensus_params_changed,
                "last_height_consensus_params_changed",
            )?,
            last_results_hash: value.last_results_hash,
            app_hash: value.app_hash,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::State {
            chain_id: self.chain_id.clone(),
            initial_height: self.initial_height.as_i64(),
            last_block_height: self.last_block_height.as_i64(),
            last_block_id: Some(self.last_block_id.to_proto()?),
            last_block_time: self.last_block_time.as_nanos(),
            validators: Some(self.validators.to_proto()?),
            next_validators: Some(self.next_validators.to_proto()?),
            last_validators: Some(self.last_validators.to_proto()?),
            last_height_validators_changed: self.last_height_validators_changed.as_i64(),
            consensus_params: Some(self.consensus_params.to_proto()?),
            last_height_consensus_params_changed: self
                .last_height_consensus_params_changed
                .as_i64(),
            last_results_hash: self.last_results_hash.clone(),
            app_hash: self.app_hash.clone(),
        })
    }
}
