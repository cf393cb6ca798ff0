use core::fmt;

use noirbft_proto as proto;
use noirbft_proto::Protobuf;

/// Count and Merkle root of the parts a block was split into.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Vec<u8>,
}

impl PartSetHeader {
    pub fn new(total: u32, hash: Vec<u8>) -> Self {
        Self { total, hash }
    }

    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.total, hex::encode(&self.hash))
    }
}

/// Identifies a block by its header hash plus the header of its part set.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    pub hash: Vec<u8>,
    pub part_set_header: PartSetHeader,
}

impl BlockId {
    pub fn new(hash: Vec<u8>, part_set_header: PartSetHeader) -> Self {
        Self {
            hash,
            part_set_header,
        }
    }

    /// The nil block id: votes for "no block" carry this.
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.hash.iter().all(|&b| b == 0) && self.part_set_header.is_zero()
    }

    /// A block id that actually names a gossipable block.
    pub fn is_complete(&self) -> bool {
        !self.hash.is_empty() && self.part_set_header.total > 0
    }

    /// Stable map key over hash and part-set header.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            hex::encode(&self.hash),
            self.part_set_header.total,
            hex::encode(&self.part_set_header.hash)
        )
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", hex::encode(&self.hash), self.part_set_header)
    }
}

impl Protobuf for PartSetHeader {
    type Proto = proto::types::PartSetHeader;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(Self {
            total: value.total,
            hash: value.hash,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::PartSetHeader {
            total: self.total,
            hash: self.hash.clone(),
        })
    }
}

impl Protobuf for BlockId {
    type Proto = proto::types::BlockId;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(Self {
            hash: value.hash,
            part_set_header: value
                .part_set_header
                .map(PartSetHeader::from_proto)
                .transpose()?
                .unwrap_or_default(),
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::BlockId {
            hash: self.hash.clone(),
            part_set_header: Some(self.part_set_header.to_proto()?),
        })
    }
}

impl BlockId {
    pub fn to_canonical(&self) -> proto::canonical::CanonicalBlockId {
        proto::canonical::CanonicalBlockId {
            hash: self.hash.clone(),
            part_set_header: Some(proto::canonical::CanonicalPartSetHeader {
                total: self.part_set_header.total,
                hash: self.part_set_header.hash.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_is_zero_not_complete() {
        let nil = BlockId::nil();
        assert!(nil.is_zero());
        assert!(!nil.is_complete());
    }

    #[test]
    fn complete_requires_parts() {
        let no_parts = BlockId::new(vec![1; 32], PartSetHeader::default());
        assert!(!no_parts.is_complete());

        let id = BlockId::new(vec![1; 32], PartSetHeader::new(4, vec![2; 32]));
        assert!(id.is_complete());
        assert!(!id.is_zero());
    }

    #[test]
    fn keys_distinguish_part_headers() {
        let a = BlockId::new(vec![1; 32], PartSetHeader::new(4, vec![2; 32]));
        let b = BlockId::new(vec![1; 32], PartSetHeader::new(5, vec![2; 32]));
        assert_ne!(a.key(), b.key());
    }
}
