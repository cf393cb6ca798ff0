use prost::Message;

use noirbft_proto as proto;
use noirbft_proto::Protobuf;

use crate::evidence::EvidenceList;
use crate::{
    Address, BlockId, ChainId, Commit, Error, Height, PartSet, Timestamp, ValidatorSet,
};

/// Protocol versions pinned into every header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Version {
    pub block: u64,
    pub app: u64,
}

/// Block header. The hash is the Merkle root over the canonical encoding of
/// every field, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: Version,
    pub chain_id: ChainId,
    pub height: Height,
    pub time: Timestamp,
    pub last_block_id: BlockId,
    pub last_commit_hash: Vec<u8>,
    pub data_hash: Vec<u8>,
    pub validators_hash: Vec<u8>,
    pub next_validators_hash: Vec<u8>,
    pub consensus_hash: Vec<u8>,
    pub app_hash: Vec<u8>,
    pub last_results_hash: Vec<u8>,
    pub evidence_hash: Vec<u8>,
    pub proposer_address: Address,
}

impl Header {
    pub fn hash(&self) -> Result<Vec<u8>, Error> {
        let version = proto::types::Consensus {
            block: self.version.block,
            app: self.version.app,
        };
        let fields: Vec<Vec<u8>> = vec![
            version.encode_to_vec(),
            self.chain_id.as_bytes().to_vec(),
            self.height.as_i64().to_be_bytes().to_vec(),
            self.time.as_nanos().to_be_bytes().to_vec(),
            self.last_block_id.to_proto()?.encode_to_vec(),
            self.last_commit_hash.clone(),
            self.data_hash.clone(),
            self.validators_hash.clone(),
            self.next_validators_hash.clone(),
            self.consensus_hash.clone(),
            self.app_hash.clone(),
            self.last_results_hash.clone(),
            self.evidence_hash.clone(),
            self.proposer_address.as_bytes().to_vec(),
        ];
        Ok(crate::merkle::merkle_root(&fields).to_vec())
    }
}

/// Transaction payload of a block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Data {
    pub txs: Vec<Vec<u8>>,
}

impl Data {
    pub fn hash(&self) -> Vec<u8> {
        crate::merkle::merkle_root(&self.txs).to_vec()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub data: Data,
    pub evidence: EvidenceList,
    pub last_commit: Commit,
}

impl Block {
    /// Structural checks that need no chain state: every hash field must be
    /// consistent with the content it summarizes.
    pub fn validate_basic(&self) -> Result<(), Error> {
        if self.header.height != Height::INITIAL
            && self.header.last_commit_hash != self.last_commit.hash()?
        {
            return Err(Error::InvalidBlock(
                "last_commit_hash does not match last_commit".to_string(),
            ));
        }
        if self.header.data_hash != self.data.hash() {
            return Err(Error::InvalidBlock(
                "data_hash does not match transactions".to_string(),
            ));
        }
        if self.header.evidence_hash != self.evidence.hash()? {
            return Err(Error::InvalidBlock(
                "evidence_hash does not match evidence list".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks the embedded last-commit against the validator set that was
    /// live at the previous height.
    pub fn verify_last_commit(
        &self,
        chain_id: &ChainId,
        last_validators: &ValidatorSet,
        last_block_id: &BlockId,
    ) -> Result<(), Error> {
        let last_height = self
            .header
            .height
            .decrement()
            .ok_or_else(|| Error::InvalidBlock("no height below initial".to_string()))?;
        last_validators.verify_commit_light(
            chain_id,
            last_block_id,
            last_height,
            &self.last_commit,
        )
    }

    pub fn hash(&self) -> Result<Vec<u8>, Error> {
        self.header.hash()
    }

    pub fn block_id(&self, part_size: usize) -> Result<BlockId, Error> {
        let parts = self.make_part_set(part_size)?;
        Ok(BlockId::new(self.hash()?, parts.header()))
    }

    /// Deterministically encodes the block and splits it into parts.
    pub fn make_part_set(&self, part_size: usize) -> Result<PartSet, Error> {
        let bytes = self.to_bytes()?;
        Ok(PartSet::from_data(&bytes, part_size))
    }

    /// Reassembles a block from a complete part set.
    pub fn from_part_set(parts: &PartSet) -> Result<Self, Error> {
        let bytes = parts.reassemble()?;
        Ok(Self::from_bytes(&bytes)?)
    }
}

/// Slim header-level record kept in the block store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub block_size: usize,
    pub header: Header,
    pub num_txs: usize,
}

impl Protobuf for Header {
    type Proto = proto::types::Header;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        let version = value
            .version
            .ok_or_else(|| proto::Error::missing_field("version"))?;
        Ok(Self {
            version: Version {
                block: version.block,
                app: version.app,
            },
            chain_id: value.chain_id,
            height: Height::try_from(value.height)
                .map_err(|e| proto::Error::invalid_field("height", e))?,
            time: Timestamp::from_nanos(value.time),
            last_block_id: value
                .last_block_id
                .map(BlockId::from_proto)
                .transpose()?
                .unwrap_or_default(),
            last_commit_hash: value.last_commit_hash,
            data_hash: value.data_hash,
            validators_hash: value.validators_hash,
            next_validators_hash: value.next_validators_hash,
            consensus_hash: value.consensus_hash,
            app_hash: value.app_hash,
            last_results_hash: value.last_results_hash,
            evidence_hash: value.evidence_hash,
            proposer_address: Address::try_from(value.proposer_address.as_slice())
                .map_err(|e| proto::Error::invalid_field("proposer_address", e))?,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::Header {
            version: Some(proto::types::Consensus {
                block: self.version.block,
                app: self.version.app,
            }),
            chain_id: self.chain_id.clone(),
            height: self.height.as_i64(),
            time: self.time.as_nanos(),
            last_block_id: Some(self.last_block_id.to_proto()?),
            last_commit_hash: self.last_commit_hash.clone(),
            data_hash: self.data_hash.clone(),
            validators_hash: self.validators_hash.clone(),
            next_validators_hash: self.next_validators_hash.clone(),
            consensus_hash: self.consensus_hash.clone(),
            app_hash: self.app_hash.clone(),
            last_results_hash: self.last_results_hash.clone(),
            evidence_hash: self.evidence_hash.clone(),
            proposer_address: self.proposer_address.as_bytes().to_vec(),
        })
    }
}

impl Protobuf for Block {
    type Proto = proto::types::Block;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(Self {
            header: value
                .header
                .map(Header::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("header"))?,
            data: Data {
                txs: value.data.map(|d| d.txs).unwrap_or_default(),
            },
            evidence: value
                .evidence
                .map(EvidenceList::from_proto)
                .transpose()?
                .unwrap_or_default(),
            last_commit: value
                .last_commit
                .map(Commit::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("last_commit"))?,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::Block {
            header: Some(self.header.to_proto()?),
            data: Some(proto::types::Data {
                txs: self.data.txs.clone(),
            }),
            evidence: Some(self.evidence.to_proto()?),
            last_commit: Some(self.last_commit.to_proto()?),
        })
    }
}

impl Protobuf for BlockMeta {
    type Proto = proto::types::BlockMeta;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(Self {
            block_id: value
                .block_id
                .map(BlockId::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("block_id"))?,
            block_size: value.block_size as usize,
            header: value
                .header
                .map(Header::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("header"))?,
            num_txs: value.num_txs as usize,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::BlockMeta {
            block_id: Some(self.block_id.to_proto()?),
            block_size: self.block_size as i64,
            header: Some(self.header.to_proto()?),
            num_txs: self.num_txs as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PartSetHeader, Round};

    pub(crate) fn test_header(height: u64) -> Header {
        Header {
            version: Version { block: 11, app: 1 },
            chain_id: "test-chain".to_string(),
            height: Height::new(height),
            time: Timestamp::from_nanos(1_000),
            last_block_id: BlockId::new(vec![1; 32], PartSetHeader::new(1, vec![2; 32])),
            last_commit_hash: Vec::new(),
            data_hash: Vec::new(),
            validators_hash: vec![3; 32],
            next_validators_hash: vec![4; 32],
            consensus_hash: vec![5; 32],
            app_hash: vec![6; 32],
            last_results_hash: vec![7; 32],
            evidence_hash: Vec::new(),
            proposer_address: Address::new([8; 20]),
        }
    }

    fn test_block() -> Block {
        let data = Data {
            txs: vec![b"tx-1".to_vec(), b"tx-2".to_vec()],
        };
        let evidence = EvidenceList::default();
        let last_commit = Commit::new(
            Height::new(9),
            Round::new(0),
            BlockId::new(vec![1; 32], PartSetHeader::new(1, vec![2; 32])),
            Vec::new(),
        );

        let mut header = test_header(10);
        header.data_hash = data.hash();
        header.evidence_hash = evidence.hash().unwrap();
        header.last_commit_hash = last_commit.hash().unwrap();

        Block {
            header,
            data,
            evidence,
            last_commit,
        }
    }

    #[test]
    fn header_hash_covers_every_field() {
        let a = test_header(10);
        let mut b = test_header(10);
        b.app_hash = vec![9; 32];
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn validate_basic_checks_hashes() {
        let block = test_block();
        block.validate_basic().unwrap();

        let mut bad = block.clone();
        bad.data.txs.push(b"injected".to_vec());
        assert!(bad.validate_basic().is_err());
    }

    #[test]
    fn part_set_round_trip() {
        let block = test_block();
        let parts = block.make_part_set(64).unwrap();
        assert_eq!(parts.hash().to_vec(), parts.header().hash);

        let restored = Block::from_part_set(&parts).unwrap();
        assert_eq!(restored, block);
        assert_eq!(restored.to_bytes().unwrap(), block.to_bytes().unwrap());
    }
}
