//! Evidence payload types. Verification against chain state lives in the
//! evidence pool; these types only know how to validate their own shape.

use prost::Message;
use sha2::{Digest, Sha256};

use noirbft_proto as proto;
use noirbft_proto::Protobuf;

use crate::block::Header;
use crate::{Commit, Error, Height, Timestamp, Validator, ValidatorSet, Vote};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedHeader {
    pub header: Header,
    pub commit: Commit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LightBlock {
    pub signed_header: SignedHeader,
    pub validator_set: ValidatorSet,
}

/// Proof that a validator signed two different votes for the same
/// `(height, round, type)` slice. `vote_a` always has the smaller block key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateVoteEvidence {
    pub vote_a: Vote,
    pub vote_b: Vote,
    pub total_voting_power: i64,
    pub validator_power: i64,
    pub timestamp: Timestamp,
}

impl DuplicateVoteEvidence {
    pub fn new(
        vote_1: Vote,
        vote_2: Vote,
        block_time: Timestamp,
        validators: &ValidatorSet,
    ) -> Result<Self, Error> {
        let (_, validator) = validators
            .get_by_address(&vote_1.validator_address)
            .ok_or(Error::UnknownValidator(vote_1.validator_address))?;
        let validator_power = validator.voting_power;

        let (vote_a, vote_b) = if vote_1.block_id.key() < vote_2.block_id.key() {
            (vote_1, vote_2)
        } else {
            (vote_2, vote_1)
        };

        Ok(Self {
            vote_a,
            vote_b,
            total_voting_power: validators.total_voting_power(),
            validator_power,
            timestamp: block_time,
        })
    }

    pub fn validate_basic(&self) -> Result<(), Error> {
        if self.vote_a.block_id.key() >= self.vote_b.block_id.key() {
            return Err(Error::InvalidEvidence(
                "duplicate votes in invalid order".to_string(),
            ));
        }
        if self.vote_a.validator_address != self.vote_b.validator_address {
            return Err(Error::InvalidEvidence(
                "duplicate votes from different validators".to_string(),
            ));
        }
        if (self.vote_a.height, self.vote_a.round, self.vote_a.vote_type)
            != (self.vote_b.height, self.vote_b.round, self.vote_b.vote_type)
        {
            return Err(Error::InvalidEvidence(
                "duplicate votes from different slices".to_string(),
            ));
        }
        Ok(())
    }
}

/// A conflicting signed header for a past height, together with the
/// validators found to have signed it out of the trusted set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LightClientAttackEvidence {
    pub conflicting_block: LightBlock,
    pub common_height: Height,
    pub byzantine_validators: Vec<Validator>,
    pub total_voting_power: i64,
    pub timestamp: Timestamp,
}

impl LightClientAttackEvidence {
    pub fn validate_basic(&self) -> Result<(), Error> {
        if self.common_height > self.conflicting_block.signed_header.header.height {
            return Err(Error::InvalidEvidence(
                "common height above conflicting header".to_string(),
            ));
        }
        if self.conflicting_block.validator_set.is_empty() {
            return Err(Error::InvalidEvidence(
                "conflicting block has no validators".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Evidence {
    DuplicateVote(DuplicateVoteEvidence),
    LightClientAttack(LightClientAttackEvidence),
}

impl Evidence {
    pub fn height(&self) -> Height {
        match self {
            Evidence::DuplicateVote(ev) => ev.vote_a.height,
            Evidence::LightClientAttack(ev) => ev.common_height,
        }
    }

    pub fn time(&self) -> Timestamp {
        match self {
            Evidence::DuplicateVote(ev) => ev.timestamp,
            Evidence::LightClientAttack(ev) => ev.timestamp,
        }
    }

    pub fn validate_basic(&self) -> Result<(), Error> {
        match self {
            Evidence::DuplicateVote(ev) => ev.validate_basic(),
            Evidence::LightClientAttack(ev) => ev.validate_basic(),
        }
    }

    pub fn hash(&self) -> Result<Vec<u8>, Error> {
        let bytes = self.to_bytes()?;
        Ok(Sha256::digest(&bytes).to_vec())
    }

    pub fn byte_size(&self) -> Result<usize, Error> {
        Ok(self.to_bytes()?.len())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvidenceList {
    pub evidence: Vec<Evidence>,
}

impl EvidenceList {
    pub fn new(evidence: Vec<Evidence>) -> Self {
        Self { evidence }
    }

    pub fn is_empty(&self) -> bool {
        self.evidence.is_empty()
    }

    pub fn len(&self) -> usize {
        self.evidence.len()
    }

    pub fn hash(&self) -> Result<Vec<u8>, Error> {
        let leaves: Vec<Vec<u8>> = self
            .evidence
            .iter()
            .map(|ev| ev.hash())
            .collect::<Result<_, _>>()?;
        Ok(crate::merkle::merkle_root(&leaves).to_vec())
    }

    pub fn has(&self, evidence: &Evidence) -> Result<bool, Error> {
        let hash = evidence.hash()?;
        for ev in &self.evidence {
            if ev.hash()? == hash {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Protobuf for SignedHeader {
    type Proto = proto::types::SignedHeader;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(Self {
            header: value
                .header
                .map(Header::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("header"))?,
            commit: value
                .commit
                .map(Commit::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("commit"))?,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::SignedHeader {
            header: Some(self.header.to_proto()?),
            commit: Some(self.commit.to_proto()?),
        })
    }
}

impl Protobuf for LightBlock {
    type Proto = proto::types::LightBlock;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(Self {
            signed_header: value
                .signed_header
                .map(SignedHeader::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("signed_header"))?,
            validator_set: value
                .validator_set
                .map(ValidatorSet::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("validator_set"))?,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::LightBlock {
            signed_header: Some(self.signed_header.to_proto()?),
            validator_set: Some(self.validator_set.to_proto()?),
        })
    }
}

impl Protobuf for DuplicateVoteEvidence {
    type Proto = proto::types::DuplicateVoteEvidence;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(Self {
            vote_a: value
                .vote_a
                .map(Vote::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("vote_a"))?,
            vote_b: value
                .vote_b
                .map(Vote::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("vote_b"))?,
            total_voting_power: value.total_voting_power,
            validator_power: value.validator_power,
            timestamp: Timestamp::from_nanos(value.timestamp),
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::DuplicateVoteEvidence {
            vote_a: Some(self.vote_a.to_proto()?),
            vote_b: Some(self.vote_b.to_proto()?),
            total_voting_power: self.total_voting_power,
            validator_power: self.validator_power,
            timestamp: self.timestamp.as_nanos(),
        })
    }
}

impl Protobuf for LightClientAttackEvidence {
    type Proto = proto::types::LightClientAttackEvidence;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(Self {
            conflicting_block: value
                .conflicting_block
                .map(LightBlock::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("conflicting_block"))?,
            common_height: Height::try_from(value.common_height)
                .map_err(|e| proto::Error::invalid_field("common_height", e))?,
            byzantine_validators: value
                .byzantine_validators
                .into_iter()
                .map(Validator::from_proto)
                .collect::<Result<_, _>>()?,
            total_voting_power: value.total_voting_power,
            timestamp: Timestamp::from_nanos(value.timestamp),
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::LightClientAttackEvidence {
            conflicting_block: Some(self.conflicting_block.to_proto()?),
            common_height: self.common_height.as_i64(),
            byzantine_validators: self
                .byzantine_validators
                .iter()
                .map(|v| v.to_proto())
                .collect::<Result<_, _>>()?,
            total_voting_power: self.total_voting_power,
            timestamp: self.timestamp.as_nanos(),
        })
    }
}

impl Protobuf for Evidence {
    type Proto = proto::types::Evidence;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        match value.sum.ok_or_else(|| proto::Error::missing_field("sum"))? {
            proto::types::evidence::Sum::DuplicateVoteEvidence(ev) => {
                Ok(Evidence::DuplicateVote(DuplicateVoteEvidence::from_proto(ev)?))
            }
            proto::types::evidence::Sum::LightClientAttackEvidence(ev) => Ok(
                Evidence::LightClientAttack(LightClientAttackEvidence::from_proto(ev)?),
            ),
        }
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        let sum = match self {
            Evidence::DuplicateVote(ev) => {
                proto::types::evidence::Sum::DuplicateVoteEvidence(ev.to_proto()?)
            }
            Evidence::LightClientAttack(ev) => {
                proto::types::evidence::Sum::LightClientAttackEvidence(ev.to_proto()?)
            }
        };
        Ok(proto::types::Evidence { sum: Some(sum) })
    }
}

impl Protobuf for EvidenceList {
    type Proto = proto::types::EvidenceList;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(Self {
            evidence: value
                .evidence
                .into_iter()
                .map(Evidence::from_proto)
                .collect::<Result<_, _>>()?,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::EvidenceList {
            evidence: self
                .evidence
                .iter()
                .map(|ev| ev.to_proto())
                .collect::<Result<_, _>>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockId, PartSetHeader, PrivateKey, Round, VoteType};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn duplicate_votes() -> (Vote, Vote, ValidatorSet) {
        let key = PrivateKey::generate(StdRng::seed_from_u64(21));
        let validator = Validator::new(key.public_key(), 10);
        let validators = ValidatorSet::new([validator.clone()]).unwrap();

        let make = |hash: u8| Vote {
            vote_type: VoteType::Prevote,
            height: Height::new(10),
            round: Round::new(0),
            block_id: BlockId::new(vec![hash; 32], PartSetHeader::new(1, vec![hash; 32])),
            timestamp: Timestamp::from_nanos(5),
            validator_address: validator.address,
            validator_index: 0,
            signature: None,
            extension: Vec::new(),
        };
        (make(0x0a), make(0x0b), validators)
    }

    #[test]
    fn votes_are_ordered_by_block_key() {
        let (low, high, validators) = duplicate_votes();

        let ev = DuplicateVoteEvidence::new(
            high.clone(),
            low.clone(),
            Timestamp::from_nanos(7),
            &validators,
        )
        .unwrap();

        assert_eq!(ev.vote_a, low);
        assert_eq!(ev.vote_b, high);
        ev.validate_basic().unwrap();
    }

    #[test]
    fn same_block_twice_is_invalid() {
        let (low, _, validators) = duplicate_votes();
        let ev = DuplicateVoteEvidence {
            vote_a: low.clone(),
            vote_b: low,
            total_voting_power: validators.total_voting_power(),
            validator_power: 10,
            timestamp: Timestamp::ZERO,
        };
        assert!(ev.validate_basic().is_err());
    }

    #[test]
    fn list_hash_and_membership() {
        let (low, high, validators) = duplicate_votes();
        let ev = Evidence::DuplicateVote(
            DuplicateVoteEvidence::new(low, high, Timestamp::from_nanos(7), &validators).unwrap(),
        );

        let list = EvidenceList::new(vec![ev.clone()]);
        assert!(list.has(&ev).unwrap());
        assert_ne!(list.hash().unwrap(), EvidenceList::default().hash().unwrap());
    }
}
