use core::fmt;
use std::sync::RwLock;

use rand::Rng;

use noirbft_proto as proto;
use noirbft_proto::Protobuf;

/// Fixed-size bit vector tracking membership across a validator set or a
/// part set.
///
/// Mutations take the write lock, accessors the read lock, so readers may
/// run concurrently with each other but not with writers.
pub struct BitArray {
    bits: usize,
    elems: RwLock<Vec<bool>>,
}

impl BitArray {
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            elems: RwLock::new(vec![false; bits]),
        }
    }

    pub fn size(&self) -> usize {
        self.bits
    }

    /// Returns the bit at `index`, or `false` when out of range.
    pub fn get(&self, index: usize) -> bool {
        let elems = self.elems.read().expect("bit array lock poisoned");
        elems.get(index).copied().unwrap_or(false)
    }

    /// Sets the bit at `index`. Returns `false` when out of range.
    pub fn set(&self, index: usize, value: bool) -> bool {
        let mut elems = self.elems.write().expect("bit array lock poisoned");
        match elems.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Copies the overlapping prefix of `other` into `self`.
    pub fn update(&self, other: &BitArray) {
        let other_elems = other.elems.read().expect("bit array lock poisoned");
        let mut elems = self.elems.write().expect("bit array lock poisoned");
        let overlap = elems.len().min(other_elems.len());
        elems[..overlap].copy_from_slice(&other_elems[..overlap]);
    }

    /// Bitwise and-not: bits set in `self` but not in `other`.
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let elems = self.elems.read().expect("bit array lock poisoned");
        let other_elems = other.elems.read().expect("bit array lock poisoned");
        let mut result = elems.clone();
        let overlap = result.len().min(other_elems.len());
        for i in 0..overlap {
            result[i] = result[i] && !other_elems[i];
        }
        BitArray {
            bits: self.bits,
            elems: RwLock::new(result),
        }
    }

    /// Bitwise or; the result grows to the larger of the two sizes.
    pub fn or(&self, other: &BitArray) -> BitArray {
        let elems = self.elems.read().expect("bit array lock poisoned");
        let other_elems = other.elems.read().expect("bit array lock poisoned");
        let bits = self.bits.max(other.bits);
        let mut result = vec![false; bits];
        for (i, slot) in result.iter_mut().enumerate() {
            let a = elems.get(i).copied().unwrap_or(false);
            let b = other_elems.get(i).copied().unwrap_or(false);
            *slot = a || b;
        }
        BitArray {
            bits,
            elems: RwLock::new(result),
        }
    }

    pub fn not(&self) -> BitArray {
        let elems = self.elems.read().expect("bit array lock poisoned");
        BitArray {
            bits: self.bits,
            elems: RwLock::new(elems.iter().map(|b| !b).collect()),
        }
    }

    pub fn copy(&self) -> BitArray {
        let elems = self.elems.read().expect("bit array lock poisoned");
        BitArray {
            bits: self.bits,
            elems: RwLock::new(elems.clone()),
        }
    }

    pub fn is_all_zero(&self) -> bool {
        let elems = self.elems.read().expect("bit array lock poisoned");
        elems.iter().all(|b| !b)
    }

    pub fn true_indices(&self) -> Vec<usize> {
        let elems = self.elems.read().expect("bit array lock poisoned");
        elems
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| b.then_some(i))
            .collect()
    }

    /// Picks a uniformly random set bit, or `None` if all bits are clear.
    pub fn pick_random<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        let indices = self.true_indices();
        if indices.is_empty() {
            return None;
        }
        Some(indices[rng.gen_range(0..indices.len())])
    }

    /// Packs the bits LSB-first into bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let elems = self.elems.read().expect("bit array lock poisoned");
        let mut bytes = vec![0u8; self.bits.div_ceil(8)];
        for (i, &bit) in elems.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }
}

impl Clone for BitArray {
    fn clone(&self) -> Self {
        self.copy()
    }
}

impl PartialEq for BitArray {
    fn eq(&self, other: &Self) -> bool {
        if self.bits != other.bits {
            return false;
        }
        let elems = self.elems.read().expect("bit array lock poisoned");
        let other_elems = other.elems.read().expect("bit array lock poisoned");
        *elems == *other_elems
    }
}

impl Eq for BitArray {}

impl fmt::Debug for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elems = self.elems.read().expect("bit array lock poisoned");
        let repr: String = elems.iter().map(|&b| if b { 'x' } else { '_' }).collect();
        write!(f, "BitArray({repr})")
    }
}

impl Protobuf for BitArray {
    type Proto = proto::types::BitArray;

    fn from_proto(proto: Self::Proto) -> Result<Self, proto::Error> {
        let bits = usize::try_from(proto.bits)
            .map_err(|_| proto::Error::invalid_field("bits", "negative size"))?;
        let array = BitArray::new(bits);
        for (word_idx, word) in proto.elems.iter().enumerate() {
            for bit_idx in 0..64 {
                let i = word_idx * 64 + bit_idx;
                if i >= bits {
                    break;
                }
                if (word >> bit_idx) & 1 == 1 {
                    array.set(i, true);
                }
            }
        }
        Ok(array)
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        let elems = self.elems.read().expect("bit array lock poisoned");
        let mut words = vec![0u64; self.bits.div_ceil(64)];
        for (i, &bit) in elems.iter().enumerate() {
            if bit {
                words[i / 64] |= 1 << (i % 64);
            }
        }
        Ok(proto::types::BitArray {
            bits: self.bits as i64,
            elems: words,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample() -> BitArray {
        let a = BitArray::new(10);
        a.set(0, true);
        a.set(3, true);
        a.set(9, true);
        a
    }

    #[test]
    fn or_is_idempotent() {
        let a = sample();
        assert_eq!(a.or(&a), a);
    }

    #[test]
    fn sub_self_is_zero() {
        let a = sample();
        assert!(a.sub(&a).is_all_zero());
    }

    #[test]
    fn double_negation() {
        let a = sample();
        assert_eq!(a.not().not(), a);
    }

    #[test]
    fn or_grows_to_max_size() {
        let a = sample();
        let b = BitArray::new(16);
        b.set(15, true);
        let c = a.or(&b);
        assert_eq!(c.size(), 16);
        assert!(c.get(0) && c.get(15));
    }

    #[test]
    fn update_copies_overlap_only() {
        let a = BitArray::new(4);
        let b = BitArray::new(8);
        b.set(1, true);
        b.set(6, true);
        a.update(&b);
        assert!(a.get(1));
        assert!(!a.get(6));
        assert_eq!(a.size(), 4);
    }

    #[test]
    fn out_of_range_accesses() {
        let a = BitArray::new(3);
        assert!(!a.get(5));
        assert!(!a.set(5, true));
    }

    #[test]
    fn pick_random_only_set_bits() {
        let a = sample();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let picked = a.pick_random(&mut rng).unwrap();
            assert!(a.get(picked));
        }
        assert_eq!(BitArray::new(4).pick_random(&mut rng), None);
    }

    #[test]
    fn byte_packing_is_lsb_first() {
        let a = BitArray::new(10);
        a.set(0, true);
        a.set(9, true);
        assert_eq!(a.to_bytes(), vec![0b0000_0001, 0b0000_0010]);
    }

    #[test]
    fn proto_round_trip() {
        let a = sample();
        let decoded = BitArray::from_proto(a.to_proto().unwrap()).unwrap();
        assert_eq!(a, decoded);
    }
}
