use prost::Message;

use noirbft_proto as proto;
use noirbft_proto::Protobuf;

use crate::vote::{Vote, VoteType};
use crate::{Address, BitArray, BlockId, Error, Height, Round, Signature, Timestamp};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockIdFlag {
    /// The validator did not vote at all.
    Absent,
    /// The validator precommitted the committed block.
    Commit,
    /// The validator precommitted nil.
    Nil,
}

impl BlockIdFlag {
    fn to_proto_enum(self) -> proto::types::BlockIdFlag {
        match self {
            BlockIdFlag::Absent => proto::types::BlockIdFlag::Absent,
            BlockIdFlag::Commit => proto::types::BlockIdFlag::Commit,
            BlockIdFlag::Nil => proto::types::BlockIdFlag::Nil,
        }
    }
}

/// One validator's slot in a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitSig {
    pub block_id_flag: BlockIdFlag,
    pub validator_address: Address,
    pub timestamp: Timestamp,
    pub signature: Option<Signature>,
}

impl CommitSig {
    pub fn absent() -> Self {
        Self {
            block_id_flag: BlockIdFlag::Absent,
            validator_address: Address::default(),
            timestamp: Timestamp::ZERO,
            signature: None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.block_id_flag == BlockIdFlag::Absent
    }

    pub fn for_block(&self) -> bool {
        self.block_id_flag == BlockIdFlag::Commit
    }

    /// The block id this signature voted for, relative to the commit's id.
    pub fn block_id(&self, commit_block_id: &BlockId) -> BlockId {
        match self.block_id_flag {
            BlockIdFlag::Commit => commit_block_id.clone(),
            BlockIdFlag::Absent | BlockIdFlag::Nil => BlockId::nil(),
        }
    }
}

/// The aggregated +2/3 precommit for one block: one `CommitSig` per
/// validator, in validator-index order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub height: Height,
    pub round: Round,
    pub block_id: BlockId,
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    pub fn new(
        height: Height,
        round: Round,
        block_id: BlockId,
        signatures: Vec<CommitSig>,
    ) -> Self {
        Self {
            height,
            round,
            block_id,
            signatures,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    /// Merkle root over the encoded signatures, in index order.
    pub fn hash(&self) -> Result<Vec<u8>, Error> {
        let leaves: Vec<Vec<u8>> = self
            .signatures
            .iter()
            .map(|sig| sig.to_proto().map(|p| p.encode_to_vec()))
            .collect::<Result<_, _>>()?;
        Ok(crate::merkle::merkle_root(&leaves).to_vec())
    }

    /// Reconstructs the precommit vote behind signature `index`.
    pub fn vote(&self, index: i32) -> Option<Vote> {
        let sig = self.signatures.get(usize::try_from(index).ok()?)?;
        if sig.is_absent() {
            return None;
        }
        Some(Vote {
            vote_type: VoteType::Precommit,
            height: self.height,
            round: self.round,
            block_id: sig.block_id(&self.block_id),
            timestamp: sig.timestamp,
            validator_address: sig.validator_address,
            validator_index: index,
            signature: sig.signature,
            extension: Vec::new(),
        })
    }

    /// Which validator slots carry any signature.
    pub fn bit_array(&self) -> BitArray {
        let bits = BitArray::new(self.signatures.len());
        for (i, sig) in self.signatures.iter().enumerate() {
            bits.set(i, !sig.is_absent());
        }
        bits
    }
}

impl Protobuf for CommitSig {
    type Proto = proto::types::CommitSig;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        let flag = match proto::types::BlockIdFlag::try_from(value.block_id_flag) {
            Ok(proto::types::BlockIdFlag::Absent) => BlockIdFlag::Absent,
            Ok(proto::types::BlockIdFlag::Commit) => BlockIdFlag::Commit,
            Ok(proto::types::BlockIdFlag::Nil) => BlockIdFlag::Nil,
            _ => return Err(proto::Error::invalid_field("block_id_flag", "unknown flag")),
        };

        if flag == BlockIdFlag::Absent {
            return Ok(CommitSig::absent());
        }

        let signature = if value.signature.is_empty() {
            None
        } else {
            Some(
                Signature::try_from(value.signature.as_slice())
                    .map_err(|e| proto::Error::invalid_field("signature", e))?,
            )
        };

        Ok(Self {
            block_id_flag: flag,
            validator_address: Address::try_from(value.validator_address.as_slice())
                .map_err(|e| proto::Error::invalid_field("validator_address", e))?,
            timestamp: Timestamp::from_nanos(value.timestamp),
            signature,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::CommitSig {
            block_id_flag: self.block_id_flag.to_proto_enum() as i32,
            validator_address: self.validator_address.as_bytes().to_vec(),
            timestamp: self.timestamp.as_nanos(),
            signature: self
                .signature
                .map(|s| s.as_slice().to_vec())
                .unwrap_or_default(),
        })
    }
}

impl Protobuf for Commit {
    type Proto = proto::types::Commit;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(Self {
            height: Height::try_from(value.height)
                .map_err(|e| proto::Error::invalid_field("height", e))?,
            round: Round::new(value.round),
            block_id: value
                .block_id
                .map(BlockId::from_proto)
                .transpose()?
                .unwrap_or_default(),
            signatures: value
                .signatures
                .into_iter()
                .map(CommitSig::from_proto)
                .collect::<Result<_, _>>()?,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::Commit {
            height: self.height.as_i64(),
            round: self.round.as_i32(),
            block_id: Some(self.block_id.to_proto()?),
            signatures: self
                .signatures
                .iter()
                .map(|s| s.to_proto())
                .collect::<Result<_, _>>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PartSetHeader;

    fn commit() -> Commit {
        let block_id = BlockId::new(vec![1; 32], PartSetHeader::new(2, vec![2; 32]));
        let addr = Address::new([9; 20]);
        Commit::new(
            Height::new(10),
            Round::new(0),
            block_id,
            vec![
                CommitSig {
                    block_id_flag: BlockIdFlag::Commit,
                    validator_address: addr,
                    timestamp: Timestamp::from_nanos(50),
                    signature: Signature::try_from([3u8; 64].as_slice()).ok(),
                },
                CommitSig::absent(),
                CommitSig {
                    block_id_flag: BlockIdFlag::Nil,
                    validator_address: Address::new([8; 20]),
                    timestamp: Timestamp::from_nanos(51),
                    signature: Signature::try_from([4u8; 64].as_slice()).ok(),
                },
            ],
        )
    }

    #[test]
    fn vote_reconstruction() {
        let commit = commit();

        let vote = commit.vote(0).unwrap();
        assert_eq!(vote.vote_type, VoteType::Precommit);
        assert_eq!(vote.block_id, commit.block_id);

        assert!(commit.vote(1).is_none());

        let nil_vote = commit.vote(2).unwrap();
        assert!(nil_vote.block_id.is_zero());
    }

    #[test]
    fn bit_array_skips_absent() {
        let bits = commit().bit_array();
        assert!(bits.get(0));
        assert!(!bits.get(1));
        assert!(bits.get(2));
    }

    #[test]
    fn hash_is_order_sensitive() {
        let a = commit();
        let mut b = commit();
        b.signatures.swap(0, 2);
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }
}
