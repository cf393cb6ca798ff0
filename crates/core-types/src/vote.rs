use core::fmt;

use prost::Message;

use noirbft_proto as proto;
use noirbft_proto::types::SignedMsgType;
use noirbft_proto::Protobuf;

use crate::commit::{BlockIdFlag, CommitSig};
use crate::{Address, BlockId, ChainId, Error, Height, Round, Signature, Timestamp};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl VoteType {
    pub fn to_signed_msg_type(self) -> SignedMsgType {
        match self {
            VoteType::Prevote => SignedMsgType::Prevote,
            VoteType::Precommit => SignedMsgType::Precommit,
        }
    }

    pub fn from_signed_msg_type(value: i32) -> Result<Self, proto::Error> {
        match SignedMsgType::try_from(value) {
            Ok(SignedMsgType::Prevote) => Ok(VoteType::Prevote),
            Ok(SignedMsgType::Precommit) => Ok(VoteType::Precommit),
            _ => Err(proto::Error::invalid_field("type", "not a vote type")),
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => f.write_str("prevote"),
            VoteType::Precommit => f.write_str("precommit"),
        }
    }
}

/// A prevote or precommit from one validator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockId,
    pub timestamp: Timestamp,
    pub validator_address: Address,
    pub validator_index: i32,
    pub signature: Option<Signature>,
    /// Application-defined payload, carried but not covered by `signature`.
    pub extension: Vec<u8>,
}

impl Vote {
    /// The canonical encoding the signature covers. Includes the chain id so
    /// a vote cannot be replayed on another chain.
    pub fn sign_bytes(&self, chain_id: &ChainId) -> Vec<u8> {
        let canonical = proto::canonical::CanonicalVote {
            r#type: self.vote_type.to_signed_msg_type() as i32,
            height: self.height.as_i64(),
            round: self.round.as_i32() as i64,
            block_id: Some(self.block_id.to_canonical()),
            timestamp: self.timestamp.as_nanos(),
            chain_id: chain_id.clone(),
        };
        canonical.encode_length_delimited_to_vec()
    }

    pub fn is_nil(&self) -> bool {
        self.block_id.is_zero()
    }

    /// Collapses this vote into the commit signature stored in a block.
    pub fn to_commit_sig(&self) -> Result<CommitSig, Error> {
        let flag = if self.block_id.is_complete() {
            BlockIdFlag::Commit
        } else if self.block_id.is_zero() {
            BlockIdFlag::Nil
        } else {
            return Err(Error::InvalidBlock(
                "vote block id is neither nil nor complete".to_string(),
            ));
        };

        Ok(CommitSig {
            block_id_flag: flag,
            validator_address: self.validator_address,
            timestamp: self.timestamp,
            signature: self.signature,
        })
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} by {} for {}",
            self.vote_type, self.height, self.round, self.validator_address, self.block_id
        )
    }
}

impl Protobuf for Vote {
    type Proto = proto::types::Vote;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        let signature = if value.signature.is_empty() {
            None
        } else {
            Some(
                Signature::try_from(value.signature.as_slice())
                    .map_err(|e| proto::Error::invalid_field("signature", e))?,
            )
        };

        Ok(Self {
            vote_type: VoteType::from_signed_msg_type(value.r#type)?,
            height: Height::try_from(value.height)
                .map_err(|e| proto::Error::invalid_field("height", e))?,
            round: Round::new(value.round),
            block_id: value
                .block_id
                .map(BlockId::from_proto)
                .transpose()?
                .unwrap_or_default(),
            timestamp: Timestamp::from_nanos(value.timestamp),
            validator_address: Address::try_from(value.validator_address.as_slice())
                .map_err(|e| proto::Error::invalid_field("validator_address", e))?,
            validator_index: value.validator_index,
            signature,
            extension: value.extension,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::Vote {
            r#type: self.vote_type.to_signed_msg_type() as i32,
            height: self.height.as_i64(),
            round: self.round.as_i32(),
            block_id: Some(self.block_id.to_proto()?),
            timestamp: self.timestamp.as_nanos(),
            validator_address: self.validator_address.as_bytes().to_vec(),
            validator_index: self.validator_index,
            signature: self
                .signature
                .map(|s| s.as_slice().to_vec())
                .unwrap_or_default(),
            extension: self.extension.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PartSetHeader, PrivateKey};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn vote(chain_id: &str, key: &PrivateKey) -> Vote {
        let mut vote = Vote {
            vote_type: VoteType::Prevote,
            height: Height::new(5),
            round: Round::new(1),
            block_id: BlockId::new(vec![7; 32], PartSetHeader::new(2, vec![8; 32])),
            timestamp: Timestamp::from_nanos(1_000_000),
            validator_address: key.public_key().address(),
            validator_index: 0,
            signature: None,
            extension: Vec::new(),
        };
        let chain_id = chain_id.to_string();
        vote.signature = Some(key.sign(&vote.sign_bytes(&chain_id)));
        vote
    }

    #[test]
    fn sign_bytes_bind_the_chain_id() {
        let key = PrivateKey::generate(StdRng::seed_from_u64(3));
        let vote = vote("chain-a", &key);
        let sig = vote.signature.unwrap();
        let pub_key = key.public_key();

        pub_key
            .verify(&vote.sign_bytes(&"chain-a".to_string()), &sig)
            .unwrap();
        assert!(pub_key
            .verify(&vote.sign_bytes(&"chain-b".to_string()), &sig)
            .is_err());
    }

    #[test]
    fn extension_not_covered_by_signature() {
        let key = PrivateKey::generate(StdRng::seed_from_u64(4));
        let mut vote = vote("chain-a", &key);
        let before = vote.sign_bytes(&"chain-a".to_string());
        vote.extension = b"metadata".to_vec();
        assert_eq!(before, vote.sign_bytes(&"chain-a".to_string()));
    }

    #[test]
    fn proto_round_trip() {
        let key = PrivateKey::generate(StdRng::seed_from_u64(5));
        let vote = vote("chain-a", &key);
        let decoded = Vote::from_proto(vote.to_proto().unwrap()).unwrap();
        assert_eq!(vote, decoded);
    }

    #[test]
    fn commit_sig_flags() {
        let key = PrivateKey::generate(StdRng::seed_from_u64(6));
        let vote = vote("chain-a", &key);
        assert_eq!(vote.to_commit_sig().unwrap().block_id_flag, BlockIdFlag::Commit);

        let mut nil_vote = vote.clone();
        nil_vote.block_id = BlockId::nil();
        assert_eq!(
            nil_vote.to_commit_sig().unwrap().block_id_flag,
            BlockIdFlag::Nil
        );
    }
}
