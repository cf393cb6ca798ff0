use std::path::Path;
use std::sync::Arc;

use redb::ReadableTable;

use tracing::debug;

use noirbft_core_types::{ConsensusParams, Height, ValidatorSet};
use noirbft_proto as proto;
use noirbft_proto::Protobuf;
use prost::Message;

use crate::{Error, State};

const STATE_TABLE: redb::TableDefinition<'_, &str, Vec<u8>> = redb::TableDefinition::new("state");

const VALIDATORS_TABLE: redb::TableDefinition<'_, u64, Vec<u8>> =
    redb::TableDefinition::new("validators");

const CONSENSUS_PARAMS_TABLE: redb::TableDefinition<'_, u64, Vec<u8>> =
    redb::TableDefinition::new("consensus_params");

const ABCI_RESPONSES_TABLE: redb::TableDefinition<'_, u64, Vec<u8>> =
    redb::TableDefinition::new("abci_responses");

/// Persists the latest state snapshot plus, per height, the validator set,
/// consensus params and ABCI responses in force.
///
/// Validator sets change rarely, so intermediate heights store only a
/// back-reference to the height where the set last changed.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<redb::Database>,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = redb::Database::create(path)?;

        let tx = db.begin_write()?;
        {
            tx.open_table(STATE_TABLE)?;
            tx.open_table(VALIDATORS_TABLE)?;
            tx.open_table(CONSENSUS_PARAMS_TABLE)?;
            tx.open_table(ABCI_RESPONSES_TABLE)?;
        }
        tx.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Writes the genesis-derived state and the validator sets for the
    /// first heights.
    pub fn bootstrap(&self, state: &State) -> Result<(), Error> {
        self.save_validators(
            state.next_height(),
            state.last_height_validators_changed,
            &state.validators,
        )?;
        self.save_validators(
            state.next_height().increment(),
            state.last_height_validators_changed,
            &state.next_validators,
        )?;
        self.save_consensus_params(
            state.next_height(),
            state.last_height_consensus_params_changed,
            &state.consensus_params,
        )?;
        self.save(state)
    }

    pub fn save(&self, state: &State) -> Result<(), Error> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(STATE_TABLE)?;
            table.insert("state", state.to_bytes()?)?;
        }
        tx.commit()?;
        debug!(height = %state.last_block_height, "Saved state");
        Ok(())
    }

    pub fn load(&self) -> Result<Option<State>, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(STATE_TABLE)?;
        let Some(bytes) = table.get("state")? else {
            return Ok(None);
        };
        Ok(Some(State::from_bytes(&bytes.value())?))
    }

    pub fn save_validators(
        &self,
        height: Height,
        last_height_changed: Height,
        validators: &ValidatorSet,
    ) -> Result<(), Error> {
        let info = proto::types::ValidatorsInfo {
            // Store the full set only at the height it changed.
            validator_set: (height == last_height_changed)
                .then(|| validators.to_proto())
                .transpose()?,
            last_height_changed: last_height_changed.as_i64(),
        };

        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(VALIDATORS_TABLE)?;
            table.insert(height.as_u64(), info.encode_to_vec())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The validator set in force at `height`, following the
    /// `last_height_changed` indirection when needed.
    pub fn load_validators(&self, height: Height) -> Result<ValidatorSet, Error> {
        let info = self
            .load_validators_info(height)?
            .ok_or(Error::HeightNotFound(height))?;

        if let Some(set) = info.validator_set {
            return Ok(ValidatorSet::from_proto(set)?);
        }

        let changed_height = Height::try_from(info.last_height_changed)
            .map_err(|e| Error::InvalidValue(e.to_string()))?;
        if changed_height >= height {
            return Err(Error::InvalidValue(format!(
                "validators info at {height} points forward to {changed_height}"
            )));
        }

        let base = self
            .load_validators_info(changed_height)?
            .ok_or(Error::HeightNotFound(changed_height))?;
        let set = base
            .validator_set
            .ok_or_else(|| Error::InvalidValue(format!("no validator set at {changed_height}")))?;
        Ok(ValidatorSet::from_proto(set)?)
    }

    fn load_validators_info(
        &self,
        height: Height,
    ) -> Result<Option<proto::types::ValidatorsInfo>, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(VALIDATORS_TABLE)?;
        let Some(bytes) = table.get(height.as_u64())? else {
            return Ok(None);
        };
        let info = proto::types::ValidatorsInfo::decode(bytes.value().as_slice())
            .map_err(proto::Error::from)?;
        Ok(Some(info))
    }

    pub fn save_consensus_params(
        &self,
        height: Height,
        last_height_changed: Height,
        params: &ConsensusParams,
    ) -> Result<(), Error> {
        let info = proto::types::ConsensusParamsInfo {
            consensus_params: (height == last_height_changed)
                .then(|| params.to_proto())
                .transpose()?,
            last_height_changed: last_height_changed.as_i64(),
        };

        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(CONSENSUS_PARAMS_TABLE)?;
            table.insert(height.as_u64(), info.encode_to_vec())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_consensus_params(&self, height: Height) -> Result<ConsensusParams, Error> {
        let info = {
            let tx = self.db.begin_read()?;
            let table = tx.open_table(CONSENSUS_PARAMS_TABLE)?;
            let Some(bytes) = table.get(height.as_u64())? else {
                return Err(Error::HeightNotFound(height));
            };
            proto::types::ConsensusParamsInfo::decode(bytes.value().as_slice())
                .map_err(proto::Error::from)?
        };

        if let Some(params) = info.consensus_params {
            return Ok(ConsensusParams::from_proto(params)?);
        }

        let changed_height = Height::try_from(info.last_height_changed)
            .map_err(|e| Error::InvalidValue(e.to_string()))?;
        self.load_consensus_params(changed_height)
    }

    pub fn save_abci_responses(
        &self,
        height: Height,
        responses: &proto::abci::AbciResponses,
    ) -> Result<(), Error> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(ABCI_RESPONSES_TABLE)?;
            table.insert(height.as_u64(), responses.encode_to_vec())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_abci_responses(
        &self,
        height: Height,
    ) -> Result<Option<proto::abci::AbciResponses>, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(ABCI_RESPONSES_TABLE)?;
        let Some(bytes) = table.get(height.as_u64())? else {
            return Ok(None);
        };
        let responses = proto::abci::AbciResponses::decode(bytes.value().as_slice())
            .map_err(proto::Error::from)?;
        Ok(Some(responses))
    }
}
