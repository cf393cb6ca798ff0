use std::time::Duration;

use serde::{Deserialize, Serialize};

use noirbft_proto as proto;
use noirbft_proto::Protobuf;

use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParams {
    pub max_bytes: i64,
    pub max_gas: i64,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            max_bytes: 22_020_096, // 21 MiB
            max_gas: -1,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceParams {
    pub max_age_num_blocks: i64,
    #[serde(with = "humantime_serde")]
    pub max_age_duration: Duration,
    pub max_bytes: i64,
}

impl Default for EvidenceParams {
    fn default() -> Self {
        Self {
            max_age_num_blocks: 100_000,
            max_age_duration: Duration::from_secs(48 * 60 * 60),
            max_bytes: 1_048_576,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorParams {
    pub pub_key_types: Vec<String>,
}

impl Default for ValidatorParams {
    fn default() -> Self {
        Self {
            pub_key_types: vec!["ed25519".to_string()],
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionParams {
    pub app_version: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub block: BlockParams,
    pub evidence: EvidenceParams,
    pub validator: ValidatorParams,
    pub version: VersionParams,
}

impl ConsensusParams {
    pub fn validate(&self) -> Result<(), Error> {
        if self.block.max_bytes <= 0 {
            return Err(Error::InvalidGenesis(format!(
                "block.max_bytes must be positive, got {}",
                self.block.max_bytes
            )));
        }
        if self.block.max_gas < -1 {
            return Err(Error::InvalidGenesis(format!(
                "block.max_gas must be >= -1, got {}",
                self.block.max_gas
            )));
        }
        if self.evidence.max_age_num_blocks <= 0 {
            return Err(Error::InvalidGenesis(
                "evidence.max_age_num_blocks must be positive".to_string(),
            ));
        }
        if self.validator.pub_key_types.is_empty() {
            return Err(Error::InvalidGenesis(
                "validator.pub_key_types must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies an ABCI parameter update; absent sections keep their values.
    pub fn update(&self, updates: &proto::types::ConsensusParams) -> Self {
        let mut params = self.clone();
        if let Some(block) = updates.block {
            params.block.max_bytes = block.max_bytes;
            params.block.max_gas = block.max_gas;
        }
        if let Some(evidence) = updates.evidence {
            params.evidence.max_age_num_blocks = evidence.max_age_num_blocks;
            params.evidence.max_age_duration =
                Duration::from_nanos(evidence.max_age_duration.max(0) as u64);
            params.evidence.max_bytes = evidence.max_bytes;
        }
        if let Some(validator) = &updates.validator {
            params.validator.pub_key_types = validator.pub_key_types.clone();
        }
        if let Some(version) = updates.version {
            params.version.app_version = version.app_version;
        }
        params
    }

    /// Deterministic hash pinned into each header's `consensus_hash`.
    pub fn hash(&self) -> Result<Vec<u8>, Error> {
        use sha2::{Digest, Sha256};
        Ok(Sha256::digest(self.to_bytes()?).to_vec())
    }
}

impl Protobuf for ConsensusParams {
    type Proto = proto::types::ConsensusParams;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(ConsensusParams::default().update(&value))
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::ConsensusParams {
            block: Some(proto::types::BlockParams {
                max_bytes: self.block.max_bytes,
                max_gas: self.block.max_gas,
            }),
            evidence: Some(proto::types::EvidenceParams {
                max_age_num_blocks: self.evidence.max_age_num_blocks,
                max_age_duration: self.evidence.max_age_duration.as_nanos() as i64,
                max_bytes: self.evidence.max_bytes,
            }),
            validator: Some(proto::types::ValidatorParams {
                pub_key_types: self.validator.pub_key_types.clone(),
            }),
            version: Some(proto::types::VersionParams {
                app_version: self.version.app_version,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ConsensusParams::default().validate().unwrap();
    }

    #[test]
    fn update_preserves_absent_sections() {
        let params = ConsensusParams::default();
        let updates = proto::types::ConsensusParams {
            block: Some(proto::types::BlockParams {
                max_bytes: 1024,
                max_gas: 10,
            }),
            evidence: None,
            validator: None,
            version: None,
        };
        let updated = params.update(&updates);
        assert_eq!(updated.block.max_bytes, 1024);
        assert_eq!(updated.evidence, params.evidence);
    }

    #[test]
    fn invalid_params_rejected() {
        let mut params = ConsensusParams::default();
        params.block.max_bytes = 0;
        assert!(params.validate().is_err());
    }
}
