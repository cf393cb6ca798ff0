use core::cmp::Reverse;
use core::fmt;

use prost::Message;

use noirbft_proto as proto;
use noirbft_proto::Protobuf;

use crate::commit::BlockIdFlag;
use crate::{Address, BlockId, ChainId, Commit, Error, Height, PublicKey};

/// Cap on the cumulative voting power of a set, so that `2/3 + 1`
/// arithmetic cannot overflow a signed 64-bit integer.
pub const MAX_TOTAL_VOTING_POWER: i64 = i64::MAX / 8;

/// The dynamic range allowed for proposer priorities, as a multiple of the
/// total voting power. Priorities are rescaled once they drift further apart.
const PRIORITY_WINDOW_SIZE_FACTOR: i64 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validator {
    pub address: Address,
    pub pub_key: Option<PublicKey>,
    pub voting_power: i64,
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(pub_key: PublicKey, voting_power: i64) -> Self {
        Self {
            address: pub_key.address(),
            pub_key: Some(pub_key),
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Canonical encoding hashed into the validator-set hash: key and power
    /// only, never the (constantly moving) proposer priority.
    fn hash_bytes(&self) -> Vec<u8> {
        proto::types::Validator {
            address: self.address.as_bytes().to_vec(),
            pub_key: self
                .pub_key
                .map(|pk| pk.as_bytes().to_vec())
                .unwrap_or_default(),
            voting_power: self.voting_power,
            proposer_priority: 0,
        }
        .encode_to_vec()
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.voting_power)
    }
}

/// Ordered set of validators with deterministic proposer rotation.
///
/// Validators are kept sorted by address. The proposer moves by the
/// classic weighted round-robin: every increment adds each validator's
/// power to its priority, elects the highest-priority validator and
/// charges it the total power.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_voting_power: i64,
    proposer: Option<Address>,
}

impl ValidatorSet {
    pub fn new(validators: impl IntoIterator<Item = Validator>) -> Result<Self, Error> {
        let mut validators: Vec<_> = validators.into_iter().collect();
        validators.sort_by(|a, b| a.address.cmp(&b.address));

        for pair in validators.windows(2) {
            if pair[0].address == pair[1].address {
                return Err(Error::DuplicateValidator(pair[0].address));
            }
        }

        let mut set = Self {
            validators,
            total_voting_power: 0,
            proposer: None,
        };
        set.recompute_total_voting_power()?;
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn total_voting_power(&self) -> i64 {
        self.total_voting_power
    }

    /// Smallest voting power that constitutes +2/3.
    pub fn quorum_threshold(&self) -> i64 {
        self.total_voting_power * 2 / 3 + 1
    }

    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|idx| (idx, &self.validators[idx]))
    }

    pub fn get_by_index(&self, index: i32) -> Option<&Validator> {
        usize::try_from(index)
            .ok()
            .and_then(|idx| self.validators.get(idx))
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// The current proposer: the validator elected by the last increment,
    /// or, on a fresh set, the one with the largest `(priority, -address)`
    /// key.
    pub fn get_proposer(&self) -> Option<&Validator> {
        match self.proposer {
            Some(address) => self.get_by_address(&address).map(|(_, v)| v),
            None => self.find_max_priority(),
        }
    }

    fn find_max_priority(&self) -> Option<&Validator> {
        self.validators
            .iter()
            .max_by_key(|v| (v.proposer_priority, Reverse(v.address)))
    }

    /// Advances the proposer rotation `times` steps.
    pub fn increment_proposer_priority(&mut self, times: i32) -> Result<Address, Error> {
        if self.is_empty() {
            return Err(Error::EmptyValidatorSet);
        }
        if times <= 0 {
            return Err(Error::NonPositiveTimes(times));
        }

        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR * self.total_voting_power;
        self.rescale_priorities(diff_max);
        self.shift_by_avg_proposer_priority();

        let mut proposer = self.validators[0].address;
        for _ in 0..times {
            proposer = self.increment_once();
        }

        self.proposer = Some(proposer);
        Ok(proposer)
    }

    fn increment_once(&mut self) -> Address {
        for v in &mut self.validators {
            v.proposer_priority = v.proposer_priority.saturating_add(v.voting_power);
        }

        let total = self.total_voting_power;
        let elected = self
            .validators
            .iter_mut()
            .max_by_key(|v| (v.proposer_priority, Reverse(v.address)))
            .expect("set checked non-empty");

        elected.proposer_priority = elected.proposer_priority.saturating_sub(total);
        elected.address
    }

    /// Compresses the priority spread back under `diff_max`.
    fn rescale_priorities(&mut self, diff_max: i64) {
        let max = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .max()
            .unwrap_or(0);
        let min = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .min()
            .unwrap_or(0);

        let diff = max.saturating_sub(min);
        if diff_max > 0 && diff > diff_max {
            let ratio = (diff + diff_max - 1) / diff_max;
            for v in &mut self.validators {
                v.proposer_priority /= ratio;
            }
        }
    }

    fn shift_by_avg_proposer_priority(&mut self) {
        let sum: i64 = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .fold(0, |acc, p| acc.saturating_add(p));
        let avg = sum / self.validators.len() as i64;
        for v in &mut self.validators {
            v.proposer_priority = v.proposer_priority.saturating_sub(avg);
        }
    }

    /// Merges validator updates by address: zero power removes, positive
    /// power inserts or replaces. Freshly joining validators start with a
    /// priority penalty so they cannot immediately win the rotation.
    pub fn apply_updates(&mut self, updates: impl IntoIterator<Item = Validator>) -> Result<(), Error> {
        let penalty = -(self
            .total_voting_power
            .saturating_add(self.total_voting_power >> 3));

        for update in updates {
            if update.voting_power < 0 {
                return Err(Error::NonPositiveVotingPower(update.voting_power));
            }
            let existing = self
                .validators
                .iter()
                .position(|v| v.address == update.address);

            if update.voting_power == 0 {
                let Some(idx) = existing else {
                    return Err(Error::UnknownValidator(update.address));
                };
                self.validators.remove(idx);
            } else {
                match existing {
                    Some(idx) => {
                        self.validators[idx].voting_power = update.voting_power;
                        self.validators[idx].pub_key = update.pub_key;
                    }
                    None => self.validators.push(Validator {
                        proposer_priority: penalty,
                        ..update
                    }),
                }
            }
        }

        self.validators.sort_by(|a, b| a.address.cmp(&b.address));
        self.recompute_total_voting_power()?;

        if !self.validators.is_empty() {
            self.rescale_priorities(PRIORITY_WINDOW_SIZE_FACTOR * self.total_voting_power);
            self.shift_by_avg_proposer_priority();
        }
        self.proposer = None;

        Ok(())
    }

    fn recompute_total_voting_power(&mut self) -> Result<(), Error> {
        let mut total: i64 = 0;
        for v in &self.validators {
            if v.voting_power <= 0 {
                return Err(Error::NonPositiveVotingPower(v.voting_power));
            }
            total = total
                .checked_add(v.voting_power)
                .ok_or(Error::TotalVotingPowerOverflow(i64::MAX, MAX_TOTAL_VOTING_POWER))?;
        }
        if total > MAX_TOTAL_VOTING_POWER {
            return Err(Error::TotalVotingPowerOverflow(total, MAX_TOTAL_VOTING_POWER));
        }
        self.total_voting_power = total;
        Ok(())
    }

    /// Merkle root over the canonical validator encodings, in address order.
    pub fn hash(&self) -> Vec<u8> {
        let leaves: Vec<Vec<u8>> = self.validators.iter().map(|v| v.hash_bytes()).collect();
        crate::merkle::merkle_root(&leaves).to_vec()
    }

    /// Verifies that `commit` carries +2/3 of this set's power for
    /// `block_id` at `height`. Stops as soon as the quorum is reached.
    pub fn verify_commit_light(
        &self,
        chain_id: &ChainId,
        block_id: &BlockId,
        height: Height,
        commit: &Commit,
    ) -> Result<(), Error> {
        if commit.height != height {
            return Err(Error::InvalidCommit {
                height,
                round: commit.round,
                reason: format!("commit is for height {}", commit.height),
            });
        }
        if &commit.block_id != block_id {
            return Err(Error::InvalidCommit {
                height,
                round: commit.round,
                reason: "commit is for a different block".to_string(),
            });
        }

        let needed = self.total_voting_power * 2 / 3;
        let mut tallied: i64 = 0;

        for (idx, sig) in commit.signatures.iter().enumerate() {
            if sig.block_id_flag != BlockIdFlag::Commit {
                continue;
            }
            let Some((_, validator)) = self.get_by_address(&sig.validator_address) else {
                continue;
            };
            let Some(pub_key) = validator.pub_key else {
                return Err(Error::UnknownValidator(sig.validator_address));
            };

            let vote = commit.vote(idx as i32).ok_or_else(|| Error::InvalidCommit {
                height,
                round: commit.round,
                reason: format!("cannot reconstruct vote {idx}"),
            })?;
            let signature = sig.signature.ok_or(Error::InvalidSignature)?;
            pub_key.verify(&vote.sign_bytes(chain_id), &signature)?;

            tallied += validator.voting_power;
            if tallied > needed {
                return Ok(());
            }
        }

        Err(Error::NotEnoughVotingPower {
            have: tallied,
            need: needed,
        })
    }
}

impl Protobuf for Validator {
    type Proto = proto::types::Validator;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        let pub_key = if value.pub_key.is_empty() {
            None
        } else {
            Some(
                PublicKey::try_from(value.pub_key.as_slice())
                    .map_err(|e| proto::Error::invalid_field("pub_key", e))?,
            )
        };
        Ok(Self {
            address: Address::try_from(value.address.as_slice())
                .map_err(|e| proto::Error::invalid_field("address", e))?,
            pub_key,
            voting_power: value.voting_power,
            proposer_priority: value.proposer_priority,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::Validator {
            address: self.address.as_bytes().to_vec(),
            pub_key: self
                .pub_key
                .map(|pk| pk.as_bytes().to_vec())
                .unwrap_or_default(),
            voting_power: self.voting_power,
            proposer_priority: self.proposer_priority,
        })
    }
}

impl Protobuf for ValidatorSet {
    type Proto = proto::types::ValidatorSet;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        let mut validators = Vec::with_capacity(value.validators.len());
        for v in value.validators {
            validators.push(Validator::from_proto(v)?);
        }
        let proposer = value
            .proposer
            .map(Validator::from_proto)
            .transpose()?
            .map(|v| v.address);

        let mut set = ValidatorSet::new(validators)
            .map_err(|e| proto::Error::invalid_field("validators", e))?;
        set.proposer = proposer;
        Ok(set)
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        let proposer = self
            .get_proposer()
            .map(|v| v.to_proto())
            .transpose()?;
        Ok(proto::types::ValidatorSet {
            validators: self
                .validators
                .iter()
                .map(|v| v.to_proto())
                .collect::<Result<_, _>>()?,
            proposer,
            total_voting_power: self.total_voting_power,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        let mut bytes = [0; Address::LENGTH];
        bytes[Address::LENGTH - 1] = n;
        Address::new(bytes)
    }

    fn val(n: u8, power: i64) -> Validator {
        Validator {
            address: addr(n),
            pub_key: None,
            voting_power: power,
            proposer_priority: 0,
        }
    }

    #[test]
    fn rejects_empty_and_non_positive() {
        let mut empty = ValidatorSet::new([]).unwrap();
        assert!(matches!(
            empty.increment_proposer_priority(1),
            Err(Error::EmptyValidatorSet)
        ));

        let mut set = ValidatorSet::new([val(0, 10)]).unwrap();
        assert!(matches!(
            set.increment_proposer_priority(0),
            Err(Error::NonPositiveTimes(0))
        ));

        assert!(ValidatorSet::new([val(0, 0)]).is_err());
    }

    #[test]
    fn duplicate_addresses_rejected() {
        assert!(matches!(
            ValidatorSet::new([val(1, 5), val(1, 7)]),
            Err(Error::DuplicateValidator(_))
        ));
    }

    #[test]
    fn equal_powers_rotate_round_robin() {
        let mut set = ValidatorSet::new([val(0, 100), val(1, 100), val(2, 100)]).unwrap();
        for i in 0..9u8 {
            let proposer = set.increment_proposer_priority(1).unwrap();
            assert_eq!(proposer, addr(i % 3));
        }
    }

    #[test]
    fn heavier_validator_proposes_twice_in_a_row() {
        let mut set = ValidatorSet::new([val(0, 100), val(1, 100), val(2, 401)]).unwrap();
        assert_eq!(set.increment_proposer_priority(1).unwrap(), addr(2));
        assert_eq!(set.increment_proposer_priority(1).unwrap(), addr(2));
        assert_eq!(set.increment_proposer_priority(1).unwrap(), addr(0));
    }

    #[test]
    fn proposer_frequency_is_proportional() {
        let powers = [(0u8, 4i64), (1, 5), (2, 3)];
        let mut set =
            ValidatorSet::new(powers.iter().map(|&(n, p)| val(n, p))).unwrap();

        let rounds = 120;
        let mut counts = [0i64; 3];
        for _ in 0..rounds {
            set.increment_proposer_priority(1).unwrap();
            let proposer = set.get_proposer().unwrap().address;
            let idx = powers.iter().position(|&(n, _)| addr(n) == proposer).unwrap();
            counts[idx] += 1;
        }

        let total: i64 = powers.iter().map(|&(_, p)| p).sum();
        for (idx, &(_, power)) in powers.iter().enumerate() {
            let expected = rounds * power / total;
            assert!(
                (counts[idx] - expected).abs() <= 1,
                "validator {idx}: {} rounds, expected ~{expected}",
                counts[idx]
            );
        }
    }

    #[test]
    fn increment_is_deterministic() {
        let build = || ValidatorSet::new([val(0, 1000), val(1, 300), val(2, 330)]).unwrap();
        let mut a = build();
        let mut b = build();
        a.increment_proposer_priority(7).unwrap();
        b.increment_proposer_priority(7).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.get_proposer().unwrap().address,
            b.get_proposer().unwrap().address
        );
    }

    #[test]
    fn priorities_stay_within_window() {
        let mut set = ValidatorSet::new([val(0, 1), val(1, 1000)]).unwrap();
        for _ in 0..500 {
            set.increment_proposer_priority(1).unwrap();
        }
        let max = set
            .validators()
            .iter()
            .map(|v| v.proposer_priority)
            .max()
            .unwrap();
        let min = set
            .validators()
            .iter()
            .map(|v| v.proposer_priority)
            .min()
            .unwrap();
        assert!(max - min <= 2 * set.total_voting_power() + set.total_voting_power());
    }

    #[test]
    fn apply_updates_inserts_in_address_order() {
        let mut set = ValidatorSet::new([val(2, 44), val(4, 66)]).unwrap();
        set.apply_updates([val(1, 11), val(3, 33)]).unwrap();

        let addresses: Vec<Address> =
            set.validators().iter().map(|v| v.address).collect();
        assert_eq!(addresses, vec![addr(1), addr(2), addr(3), addr(4)]);
        assert_eq!(set.total_voting_power(), 44 + 66 + 11 + 33);
    }

    #[test]
    fn apply_updates_replaces_and_removes() {
        let mut set = ValidatorSet::new([val(1, 10), val(2, 20), val(3, 30)]).unwrap();

        set.apply_updates([val(2, 25)]).unwrap();
        assert_eq!(set.get_by_address(&addr(2)).unwrap().1.voting_power, 25);

        set.apply_updates([val(1, 0)]).unwrap();
        assert!(!set.has_address(&addr(1)));
        assert_eq!(set.total_voting_power(), 25 + 30);

        assert!(matches!(
            set.apply_updates([val(9, 0)]),
            Err(Error::UnknownValidator(_))
        ));
    }

    #[test]
    fn total_power_cap_enforced() {
        assert!(matches!(
            ValidatorSet::new([val(0, MAX_TOTAL_VOTING_POWER), val(1, 1)]),
            Err(Error::TotalVotingPowerOverflow(..))
        ));
    }

    #[test]
    fn hash_changes_with_membership() {
        let a = ValidatorSet::new([val(1, 10), val(2, 20)]).unwrap();
        let b = ValidatorSet::new([val(1, 10), val(2, 21)]).unwrap();
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), ValidatorSet::new([val(2, 20), val(1, 10)]).unwrap().hash());
    }
}
