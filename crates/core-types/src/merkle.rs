//! SHA-256 Merkle trees with domain-separated leaf and inner nodes.

use sha2::{Digest, Sha256};

use noirbft_proto as proto;
use noirbft_proto::Protobuf;

use crate::Error;

const LEAF_PREFIX: u8 = 0x00;
const INNER_PREFIX: u8 = 0x01;

pub type Hash = [u8; 32];

fn empty_hash() -> Hash {
    Sha256::digest([]).into()
}

fn leaf_hash(leaf: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf);
    hasher.finalize().into()
}

fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([INNER_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Largest power of two strictly less than `n`.
fn split_point(n: usize) -> usize {
    debug_assert!(n > 1);
    let mut split = 1;
    while split * 2 < n {
        split *= 2;
    }
    split
}

/// Merkle root over an ordered list of byte strings.
pub fn merkle_root<B: AsRef<[u8]>>(items: &[B]) -> Hash {
    match items.len() {
        0 => empty_hash(),
        1 => leaf_hash(items[0].as_ref()),
        n => {
            let split = split_point(n);
            let left = merkle_root(&items[..split]);
            let right = merkle_root(&items[split..]);
            inner_hash(&left, &right)
        }
    }
}

/// Inclusion proof for one leaf: the leaf hash plus the sibling hashes from
/// the leaf up to the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proof {
    pub total: usize,
    pub index: usize,
    pub leaf_hash: Hash,
    pub aunts: Vec<Hash>,
}

impl Proof {
    /// Builds the root plus a proof for every leaf.
    pub fn from_items<B: AsRef<[u8]>>(items: &[B]) -> (Hash, Vec<Proof>) {
        let leaves: Vec<Hash> = items.iter().map(|i| leaf_hash(i.as_ref())).collect();
        let total = leaves.len();

        if total == 0 {
            return (empty_hash(), Vec::new());
        }

        let mut proofs: Vec<Proof> = leaves
            .iter()
            .enumerate()
            .map(|(index, &leaf_hash)| Proof {
                total,
                index,
                leaf_hash,
                aunts: Vec::new(),
            })
            .collect();

        let root = build(&leaves, 0, &mut proofs);
        (root, proofs)
    }

    /// Recomputes the root implied by this proof.
    pub fn compute_root(&self) -> Hash {
        fn climb(leaf: &Hash, index: usize, total: usize, aunts: &[Hash]) -> Option<Hash> {
            if total == 1 {
                return aunts.is_empty().then_some(*leaf);
            }
            let (&aunt, rest) = aunts.split_last()?;
            let split = split_point(total);
            if index < split {
                let left = climb(leaf, index, split, rest)?;
                Some(inner_hash(&left, &aunt))
            } else {
                let right = climb(leaf, index - split, total - split, rest)?;
                Some(inner_hash(&aunt, &right))
            }
        }

        climb(&self.leaf_hash, self.index, self.total, &self.aunts).unwrap_or_else(empty_hash)
    }

    /// Verifies that `leaf` is included under `root` at this proof's index.
    pub fn verify(&self, root: &Hash, leaf: &[u8]) -> Result<(), Error> {
        if self.leaf_hash != leaf_hash(leaf) {
            return Err(Error::InvalidPartProof(self.index as u32));
        }
        if self.compute_root() != *root {
            return Err(Error::InvalidPartProof(self.index as u32));
        }
        Ok(())
    }
}

/// Builds the subtree over `leaves`, pushing each sibling hash onto the
/// proofs of the leaves on the opposite side. Aunts are ordered bottom-up,
/// closest sibling first; `compute_root` consumes them back-to-front.
fn build(leaves: &[Hash], offset: usize, proofs: &mut [Proof]) -> Hash {
    match leaves.len() {
        1 => leaves[0],
        n => {
            let split = split_point(n);
            let left = build(&leaves[..split], offset, proofs);
            let right = build(&leaves[split..], offset + split, proofs);
            for proof in &mut proofs[offset..offset + split] {
                proof.aunts.push(right);
            }
            for proof in &mut proofs[offset + split..offset + n] {
                proof.aunts.push(left);
            }
            inner_hash(&left, &right)
        }
    }
}

impl Protobuf for Proof {
    type Proto = proto::types::Proof;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        let mut aunts = Vec::with_capacity(value.aunts.len());
        for aunt in value.aunts {
            let aunt: Hash = aunt
                .as_slice()
                .try_into()
                .map_err(|_| proto::Error::invalid_field("aunts", "invalid hash length"))?;
            aunts.push(aunt);
        }
        Ok(Proof {
            total: value.total as usize,
            index: value.index as usize,
            leaf_hash: value
                .leaf_hash
                .as_slice()
                .try_into()
                .map_err(|_| proto::Error::invalid_field("leaf_hash", "invalid hash length"))?,
            aunts,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::Proof {
            total: self.total as i64,
            index: self.index as i64,
            leaf_hash: self.leaf_hash.to_vec(),
            aunts: self.aunts.iter().map(|a| a.to_vec()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_single() {
        assert_eq!(merkle_root::<&[u8]>(&[]), empty_hash());
        assert_eq!(merkle_root(&[b"x"]), leaf_hash(b"x"));
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for n in 1..=17usize {
            let items: Vec<Vec<u8>> = (0..n).map(|i| format!("item-{i}").into_bytes()).collect();
            let (root, proofs) = Proof::from_items(&items);
            assert_eq!(root, merkle_root(&items));
            assert_eq!(proofs.len(), n);
            for (i, proof) in proofs.iter().enumerate() {
                proof.verify(&root, &items[i]).unwrap();
            }
        }
    }

    #[test]
    fn tampered_leaf_fails() {
        let items: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d", b"e"];
        let (root, proofs) = Proof::from_items(&items);
        assert!(proofs[2].verify(&root, b"tampered").is_err());
    }

    #[test]
    fn root_depends_on_order() {
        let forward = merkle_root(&[b"a", b"b"]);
        let reverse = merkle_root(&[b"b", b"a"]);
        assert_ne!(forward, reverse);
    }
}
