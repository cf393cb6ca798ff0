use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ConsensusParams, Error, Height, PublicKey, Timestamp, Validator, ValidatorSet};

/// A validator entry as written in the genesis file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    /// Hex-encoded Ed25519 public key.
    pub pub_key: String,
    pub power: i64,
    #[serde(default)]
    pub name: String,
}

impl GenesisValidator {
    pub fn to_validator(&self) -> Result<Validator, Error> {
        let bytes = hex::decode(&self.pub_key)
            .map_err(|e| Error::InvalidGenesis(format!("bad validator key: {e}")))?;
        let pub_key = PublicKey::try_from(bytes.as_slice())?;
        Ok(Validator::new(pub_key, self.power))
    }
}

/// The chain's starting point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenesisDoc {
    pub genesis_time: Timestamp,
    pub chain_id: String,
    #[serde(default = "initial_height")]
    pub initial_height: u64,
    #[serde(default)]
    pub consensus_params: ConsensusParams,
    pub validators: Vec<GenesisValidator>,
    #[serde(default, with = "hex::serde")]
    pub app_hash: Vec<u8>,
    #[serde(default)]
    pub app_state: serde_json::Value,
}

fn initial_height() -> u64 {
    Height::INITIAL.as_u64()
}

impl GenesisDoc {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidGenesis(format!("cannot read genesis file: {e}")))?;
        let doc: GenesisDoc = serde_json::from_str(&contents)
            .map_err(|e| Error::InvalidGenesis(format!("cannot parse genesis file: {e}")))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chain_id.is_empty() {
            return Err(Error::InvalidGenesis("chain_id is empty".to_string()));
        }
        if self.initial_height == 0 {
            return Err(Error::InvalidGenesis(
                "initial_height must be at least 1".to_string(),
            ));
        }
        self.consensus_params.validate()?;
        if self.validators.is_empty() {
            return Err(Error::InvalidGenesis("no validators".to_string()));
        }
        Ok(())
    }

    pub fn initial_height(&self) -> Height {
        Height::new(self.initial_height)
    }

    pub fn validator_set(&self) -> Result<ValidatorSet, Error> {
        let validators = self
            .validators
            .iter()
            .map(|v| v.to_validator())
            .collect::<Result<Vec<_>, _>>()?;
        ValidatorSet::new(validators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PrivateKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn doc() -> GenesisDoc {
        let key = PrivateKey::generate(StdRng::seed_from_u64(33));
        GenesisDoc {
            genesis_time: Timestamp::from_nanos(1),
            chain_id: "test-chain".to_string(),
            initial_height: 1,
            consensus_params: ConsensusParams::default(),
            validators: vec![GenesisValidator {
                pub_key: hex::encode(key.public_key().as_bytes()),
                power: 10,
                name: "val-0".to_string(),
            }],
            app_hash: Vec::new(),
            app_state: serde_json::Value::Null,
        }
    }

    #[test]
    fn json_round_trip() {
        let doc = doc();
        let json = serde_json::to_string(&doc).unwrap();
        let decoded: GenesisDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, decoded);
        decoded.validate().unwrap();
    }

    #[test]
    fn validator_set_built_from_genesis() {
        let set = doc().validator_set().unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.total_voting_power(), 10);
    }

    #[test]
    fn empty_chain_id_rejected() {
        let mut doc = doc();
        doc.chain_id.clear();
        assert!(doc.validate().is_err());
    }
}
