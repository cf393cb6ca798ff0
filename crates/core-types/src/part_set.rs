use bytes::Bytes;

use noirbft_proto as proto;
use noirbft_proto::Protobuf;

use crate::merkle::Proof;
use crate::{BitArray, Error, PartSetHeader};

/// One slice of an encoded block, with its Merkle inclusion proof.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub index: u32,
    pub bytes: Bytes,
    pub proof: Proof,
}

/// A block split into `total` parts, gossiped part by part and reassembled
/// once every index is present.
#[derive(Clone, Debug)]
pub struct PartSet {
    total: u32,
    hash: Vec<u8>,
    parts: Vec<Option<Part>>,
    parts_bit_array: BitArray,
    count: u32,
}

impl PartSet {
    /// Splits `data` into `ceil(len / part_size)` parts and computes the
    /// Merkle root over the ordered parts.
    pub fn from_data(data: &[u8], part_size: usize) -> Self {
        assert!(part_size > 0, "part size must be positive");

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(part_size).collect()
        };
        let total = chunks.len() as u32;

        let (root, proofs) = Proof::from_items(&chunks);

        let parts_bit_array = BitArray::new(total as usize);
        let parts: Vec<Option<Part>> = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (chunk, proof))| {
                parts_bit_array.set(index, true);
                Some(Part {
                    index: index as u32,
                    bytes: Bytes::copy_from_slice(chunk),
                    proof,
                })
            })
            .collect();

        Self {
            total,
            hash: root.to_vec(),
            parts,
            parts_bit_array,
            count: total,
        }
    }

    /// An empty set expecting parts for a known header.
    pub fn from_header(header: PartSetHeader) -> Self {
        Self {
            total: header.total,
            hash: header.hash,
            parts: vec![None; header.total as usize],
            parts_bit_array: BitArray::new(header.total as usize),
            count: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        PartSetHeader::new(self.total, self.hash.clone())
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.total == header.total && self.hash == header.hash
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }

    pub fn bit_array(&self) -> &BitArray {
        &self.parts_bit_array
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(Option::as_ref)
    }

    /// Adds a part after verifying its proof against the set's root.
    /// Returns `Ok(false)` for a part that is already present.
    pub fn add_part(&mut self, part: Part) -> Result<bool, Error> {
        let index = part.index;
        if index >= self.total {
            return Err(Error::PartOutOfBounds {
                index,
                total: self.total,
            });
        }
        if self.parts[index as usize].is_some() {
            return Ok(false);
        }

        let root: [u8; 32] = self
            .hash
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidPartProof(index))?;
        part.proof.verify(&root, &part.bytes)?;

        if part.proof.index != index as usize || part.proof.total != self.total as usize {
            return Err(Error::InvalidPartProof(index));
        }

        self.parts[index as usize] = Some(part);
        self.parts_bit_array.set(index as usize, true);
        self.count += 1;
        Ok(true)
    }

    /// Concatenates all parts in index order. Fails unless complete.
    pub fn reassemble(&self) -> Result<Vec<u8>, Error> {
        if !self.is_complete() {
            return Err(Error::IncompletePartSet {
                count: self.count,
                total: self.total,
            });
        }
        let mut data = Vec::new();
        for part in self.parts.iter().flatten() {
            data.extend_from_slice(&part.bytes);
        }
        Ok(data)
    }
}

impl Protobuf for Part {
    type Proto = proto::types::Part;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        Ok(Self {
            index: value.index,
            bytes: value.bytes,
            proof: value
                .proof
                .map(Proof::from_proto)
                .transpose()?
                .ok_or_else(|| proto::Error::missing_field("proof"))?,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::Part {
            index: self.index,
            bytes: self.bytes.clone(),
            proof: Some(self.proof.to_proto()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn split_and_reassemble() {
        for len in [0usize, 1, 63, 64, 65, 1000] {
            let data = data(len);
            let ps = PartSet::from_data(&data, 64);
            assert!(ps.is_complete());
            assert_eq!(ps.total(), (len.max(1)).div_ceil(64) as u32);
            assert_eq!(ps.reassemble().unwrap(), data);
        }
    }

    #[test]
    fn parts_flow_into_empty_set() {
        let data = data(300);
        let full = PartSet::from_data(&data, 64);
        let mut empty = PartSet::from_header(full.header());

        assert!(!empty.is_complete());
        assert!(empty.reassemble().is_err());

        for i in 0..full.total() {
            let added = empty.add_part(full.get_part(i).unwrap().clone()).unwrap();
            assert!(added);
        }

        assert!(empty.is_complete());
        assert_eq!(empty.reassemble().unwrap(), data);
    }

    #[test]
    fn duplicate_part_is_not_an_error() {
        let full = PartSet::from_data(&data(200), 64);
        let mut empty = PartSet::from_header(full.header());
        let part = full.get_part(1).unwrap().clone();
        assert!(empty.add_part(part.clone()).unwrap());
        assert!(!empty.add_part(part).unwrap());
        assert_eq!(empty.count(), 1);
    }

    #[test]
    fn tampered_part_rejected() {
        let full = PartSet::from_data(&data(200), 64);
        let mut empty = PartSet::from_header(full.header());

        let mut part = full.get_part(0).unwrap().clone();
        let mut tampered = part.bytes.to_vec();
        tampered[0] ^= 0xff;
        part.bytes = Bytes::from(tampered);

        assert!(matches!(
            empty.add_part(part),
            Err(Error::InvalidPartProof(0))
        ));
        assert_eq!(empty.count(), 0);
    }

    #[test]
    fn out_of_bounds_part_rejected() {
        let full = PartSet::from_data(&data(100), 64);
        let mut empty = PartSet::from_header(full.header());
        let mut part = full.get_part(0).unwrap().clone();
        part.index = 99;
        assert!(matches!(
            empty.add_part(part),
            Err(Error::PartOutOfBounds { .. })
        ));
    }

    #[test]
    fn bitmap_tracks_presence() {
        let full = PartSet::from_data(&data(300), 64);
        let mut empty = PartSet::from_header(full.header());
        empty.add_part(full.get_part(2).unwrap().clone()).unwrap();
        assert!(empty.bit_array().get(2));
        assert!(!empty.bit_array().get(0));
    }
}
