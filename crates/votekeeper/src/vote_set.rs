use std::collections::BTreeMap;
use std::sync::RwLock;

use tracing::debug;

use noirbft_core_types::{
    BitArray, BlockId, ChainId, Commit, CommitSig, Height, NodeId, Round, ValidatorSet, Vote,
    VoteType,
};

use crate::Error;

/// Votes for one particular block id, tracked separately so conflicting
/// votes can be tallied without double-counting power.
///
/// A bucket exists because either a validator's first vote was for that
/// block, or a peer claimed to have seen +2/3 for it. Conflicting votes are
/// only stored in peer-claimed buckets, and each peer gets exactly one
/// claim, which keeps the whole structure memory-bounded.
#[derive(Clone, Debug)]
struct BlockVotes {
    peer_maj23: bool,
    bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: i64,
}

impl BlockVotes {
    fn new(peer_maj23: bool, num_validators: usize) -> Self {
        Self {
            peer_maj23,
            bit_array: BitArray::new(num_validators),
            votes: vec![None; num_validators],
            sum: 0,
        }
    }

    fn add_verified_vote(&mut self, vote: Vote, voting_power: i64) {
        let index = vote.validator_index as usize;
        if self.votes[index].is_none() {
            self.bit_array.set(index, true);
            self.votes[index] = Some(vote);
            self.sum += voting_power;
        }
    }

    fn get_by_index(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(Option::as_ref)
    }
}

#[derive(Debug)]
struct Inner {
    votes_bit_array: BitArray,
    /// Canonical votes, one slot per validator index. Holds the first vote
    /// seen from each validator until a +2/3 block emerges, at which point
    /// that block's votes take priority.
    votes: Vec<Option<Vote>>,
    /// Power counted in `votes`.
    sum: i64,
    /// Set once, the first time one block crosses +2/3. Never changes after.
    maj23: Option<BlockId>,
    votes_by_block: BTreeMap<String, BlockVotes>,
    peer_maj23s: BTreeMap<NodeId, BlockId>,
}

/// Collects signatures from validators for one `(height, round, type)`
/// slice. Readers may run concurrently with each other but not with
/// writers.
#[derive(Debug)]
pub struct VoteSet {
    chain_id: ChainId,
    height: Height,
    round: Round,
    vote_type: VoteType,
    validators: ValidatorSet,
    inner: RwLock<Inner>,
}

impl VoteSet {
    pub fn new(
        chain_id: ChainId,
        height: Height,
        round: Round,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> Self {
        let size = validators.len();
        Self {
            chain_id,
            height,
            round,
            vote_type,
            validators,
            inner: RwLock::new(Inner {
                votes_bit_array: BitArray::new(size),
                votes: vec![None; size],
                sum: 0,
                maj23: None,
                votes_by_block: BTreeMap::new(),
                peer_maj23s: BTreeMap::new(),
            }),
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    /// Adds a vote, verifying its signature against the validator set.
    ///
    /// Returns `Ok(false)` for an exact duplicate. A conflicting vote from
    /// the same validator surfaces as [`Error::ConflictingVote`] carrying
    /// both votes; power for it is only tallied under a peer-claimed block.
    pub fn add_vote(&self, vote: Vote) -> Result<bool, Error> {
        let val_index = vote.validator_index;
        let val_addr = vote.validator_address;
        let block_key = vote.block_id.key();

        if val_index < 0 {
            return Err(Error::InvalidValidatorIndex(val_index));
        }
        if val_addr.is_empty() {
            return Err(Error::EmptyValidatorAddress);
        }

        if (vote.height, vote.round, vote.vote_type) != (self.height, self.round, self.vote_type) {
            return Err(Error::NonMatchingSlice {
                expected: format!("{}/{}/{}", self.height, self.round, self.vote_type),
                got: format!("{}/{}/{}", vote.height, vote.round, vote.vote_type),
            });
        }

        let validator = self
            .validators
            .get_by_index(val_index)
            .ok_or(Error::UnknownValidator(val_index))?;
        if validator.address != val_addr {
            return Err(Error::AddressMismatch(val_index));
        }

        let mut inner = self.inner.write().expect("vote set lock poisoned");

        // Same vote already counted?
        if let Some(existing) = Self::get_vote_locked(&inner, val_index as usize, &block_key) {
            if existing.signature == vote.signature {
                return Ok(false);
            }
            return Err(Error::NonDeterministicSignature);
        }

        let pub_key = validator
            .pub_key
            .ok_or(Error::UnknownValidator(val_index))?;
        let signature = vote
            .signature
            .ok_or(noirbft_core_types::Error::InvalidSignature)?;
        pub_key.verify(&vote.sign_bytes(&self.chain_id), &signature)?;

        let voting_power = validator.voting_power;
        let idx = val_index as usize;

        // A different vote from this validator marks it as potentially
        // byzantine. The first vote keeps its slot unless the newcomer is
        // for the +2/3 block.
        let conflicting = match &inner.votes[idx] {
            Some(existing) if existing.block_id != vote.block_id => Some(existing.clone()),
            Some(_) => None,
            None => {
                inner.votes[idx] = Some(vote.clone());
                inner.votes_bit_array.set(idx, true);
                inner.sum += voting_power;
                None
            }
        };

        if conflicting.is_some() {
            let replaces_canonical = inner
                .maj23
                .as_ref()
                .is_some_and(|maj23| maj23.key() == block_key);
            if replaces_canonical {
                inner.votes[idx] = Some(vote.clone());
                inner.votes_bit_array.set(idx, true);
            }
        }

        match inner.votes_by_block.get(&block_key) {
            Some(bucket) => {
                if conflicting.is_some() && !bucket.peer_maj23 {
                    // Conflict on a block no peer vouches for: drop it.
                    return Err(Error::ConflictingVote {
                        existing: Box::new(conflicting.expect("checked above")),
                        conflicting: Box::new(vote),
                    });
                }
            }
            None => {
                if let Some(existing) = conflicting {
                    // Not tracking this block at all, just forget it.
                    return Err(Error::ConflictingVote {
                        existing: Box::new(existing),
                        conflicting: Box::new(vote),
                    });
                }
                inner
                    .votes_by_block
                    .insert(block_key.clone(), BlockVotes::new(false, self.validators.len()));
            }
        }

        let quorum = self.validators.quorum_threshold();
        let bucket = inner
            .votes_by_block
            .get_mut(&block_key)
            .expect("bucket inserted above");
        let orig_sum = bucket.sum;
        bucket.add_verified_vote(vote.clone(), voting_power);
        let crossed = orig_sum < quorum && quorum <= bucket.sum;

        if crossed && inner.maj23.is_none() {
            debug!(
                height = %self.height, round = %self.round, vote_type = %self.vote_type,
                block_id = %vote.block_id, "Reached +2/3 majority"
            );
            inner.maj23 = Some(vote.block_id.clone());
            let bucket_votes = inner.votes_by_block[&block_key].votes.clone();
            for (i, bucket_vote) in bucket_votes.into_iter().enumerate() {
                if let Some(v) = bucket_vote {
                    inner.votes_bit_array.set(i, true);
                    inner.votes[i] = Some(v);
                }
            }
        }

        match conflicting {
            Some(existing) => Err(Error::ConflictingVote {
                existing: Box::new(existing),
                conflicting: Box::new(vote),
            }),
            None => Ok(true),
        }
    }

    fn get_vote_locked<'a>(inner: &'a Inner, index: usize, block_key: &str) -> Option<&'a Vote> {
        if let Some(vote) = inner.votes.get(index).and_then(Option::as_ref) {
            if vote.block_id.key() == block_key {
                return Some(vote);
            }
        }
        inner
            .votes_by_block
            .get(block_key)
            .and_then(|bucket| bucket.get_by_index(index))
    }

    pub fn get_vote(&self, index: i32, block_key: &str) -> Option<Vote> {
        let inner = self.inner.read().expect("vote set lock poisoned");
        Self::get_vote_locked(&inner, usize::try_from(index).ok()?, block_key).cloned()
    }

    pub fn get_by_index(&self, index: i32) -> Option<Vote> {
        let inner = self.inner.read().expect("vote set lock poisoned");
        inner
            .votes
            .get(usize::try_from(index).ok()?)
            .and_then(Option::as_ref)
            .cloned()
    }

    /// Records a peer's claim of a +2/3 majority for `block_id`, creating a
    /// tracking bucket so conflicting votes for it can be stored. Each peer
    /// may claim exactly one block.
    pub fn set_peer_maj23(&self, peer: NodeId, block_id: BlockId) -> Result<(), Error> {
        let mut inner = self.inner.write().expect("vote set lock poisoned");

        if let Some(existing) = inner.peer_maj23s.get(&peer) {
            if existing == &block_id {
                return Ok(());
            }
            return Err(Error::ConflictingMaj23Claim {
                peer,
                existing: Box::new(existing.clone()),
                claimed: Box::new(block_id),
            });
        }
        inner.peer_maj23s.insert(peer, block_id.clone());

        let block_key = block_id.key();
        match inner.votes_by_block.get_mut(&block_key) {
            Some(bucket) => bucket.peer_maj23 = true,
            None => {
                inner
                    .votes_by_block
                    .insert(block_key, BlockVotes::new(true, self.validators.len()));
            }
        }
        Ok(())
    }

    pub fn bit_array(&self) -> BitArray {
        let inner = self.inner.read().expect("vote set lock poisoned");
        inner.votes_bit_array.copy()
    }

    pub fn bit_array_by_block_id(&self, block_id: &BlockId) -> Option<BitArray> {
        let inner = self.inner.read().expect("vote set lock poisoned");
        inner
            .votes_by_block
            .get(&block_id.key())
            .map(|bucket| bucket.bit_array.copy())
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        let inner = self.inner.read().expect("vote set lock poisoned");
        inner.maj23.is_some()
    }

    pub fn has_two_thirds_any(&self) -> bool {
        let inner = self.inner.read().expect("vote set lock poisoned");
        inner.sum > self.validators.total_voting_power() * 2 / 3
    }

    pub fn has_all(&self) -> bool {
        let inner = self.inner.read().expect("vote set lock poisoned");
        inner.sum == self.validators.total_voting_power()
    }

    /// The +2/3 block id, if one block has crossed the threshold.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        let inner = self.inner.read().expect("vote set lock poisoned");
        inner.maj23.clone()
    }

    /// Builds a commit from this set. Only valid on precommit sets with a
    /// +2/3 block; signatures for other blocks are coerced to absent.
    pub fn make_commit(&self) -> Result<Commit, Error> {
        if self.vote_type != VoteType::Precommit {
            return Err(Error::NotPrecommit);
        }
        let inner = self.inner.read().expect("vote set lock poisoned");
        let maj23 = inner.maj23.clone().ok_or(Error::NoMajority)?;

        let mut commit_sigs = Vec::with_capacity(inner.votes.len());
        for vote in &inner.votes {
            let sig = match vote {
                Some(vote) => {
                    let sig = vote.to_commit_sig()?;
                    if sig.for_block() && vote.block_id != maj23 {
                        CommitSig::absent()
                    } else {
                        sig
                    }
                }
                None => CommitSig::absent(),
            };
            commit_sigs.push(sig);
        }

        Ok(Commit::new(self.height, self.round, maj23, commit_sigs))
    }
}

/// Read-only view over either a live vote set or a commit, letting the
/// gossip layer treat last-commit votes and current votes uniformly.
#[derive(Clone, Debug)]
pub struct VoteSetReader {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub is_commit: bool,
    bit_array: BitArray,
    votes: Vec<Option<Vote>>,
}

impl VoteSetReader {
    pub fn from_commit(commit: &Commit) -> Self {
        let votes: Vec<Option<Vote>> = (0..commit.len())
            .map(|i| commit.vote(i as i32))
            .collect();
        Self {
            height: commit.height,
            round: commit.round,
            vote_type: VoteType::Precommit,
            is_commit: !commit.is_empty(),
            bit_array: commit.bit_array(),
            votes,
        }
    }

    pub fn from_vote_set(vote_set: &VoteSet) -> Self {
        let inner = vote_set.inner.read().expect("vote set lock poisoned");
        Self {
            height: vote_set.height,
            round: vote_set.round,
            vote_type: vote_set.vote_type,
            is_commit: vote_set.vote_type == VoteType::Precommit && inner.maj23.is_some(),
            bit_array: inner.votes_bit_array.copy(),
            votes: inner.votes.clone(),
        }
    }

    pub fn size(&self) -> usize {
        self.votes.len()
    }

    pub fn bit_array(&self) -> &BitArray {
        &self.bit_array
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(Option::as_ref)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use noirbft_core_types::{PartSetHeader, PrivateKey, Timestamp, Validator};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub(crate) struct Fixture {
        pub chain_id: ChainId,
        pub keys: Vec<PrivateKey>,
        pub validators: ValidatorSet,
    }

    pub(crate) fn fixture(powers: &[i64]) -> Fixture {
        let mut rng = StdRng::seed_from_u64(99);
        let keys: Vec<PrivateKey> = powers.iter().map(|_| PrivateKey::generate(&mut rng)).collect();
        let mut validators: Vec<Validator> = keys
            .iter()
            .zip(powers)
            .map(|(key, &power)| Validator::new(key.public_key(), power))
            .collect();
        validators.sort_by(|a, b| a.address.cmp(&b.address));

        // Keys indexed to match the sorted validator order.
        let mut sorted_keys = Vec::with_capacity(keys.len());
        for validator in &validators {
            let key = keys
                .iter()
                .find(|k| k.public_key().address() == validator.address)
                .unwrap()
                .clone();
            sorted_keys.push(key);
        }

        Fixture {
            chain_id: "test-chain".to_string(),
            keys: sorted_keys,
            validators: ValidatorSet::new(validators).unwrap(),
        }
    }

    pub(crate) fn block_id(seed: u8) -> BlockId {
        BlockId::new(vec![seed; 32], PartSetHeader::new(1, vec![seed; 32]))
    }

    pub(crate) fn signed_vote(
        fixture: &Fixture,
        index: usize,
        vote_type: VoteType,
        height: u64,
        round: i32,
        block_id: BlockId,
    ) -> Vote {
        let key = &fixture.keys[index];
        let mut vote = Vote {
            vote_type,
            height: Height::new(height),
            round: Round::new(round),
            block_id,
            timestamp: Timestamp::from_nanos(1_000 + index as i64),
            validator_address: key.public_key().address(),
            validator_index: index as i32,
            signature: None,
            extension: Vec::new(),
        };
        vote.signature = Some(key.sign(&vote.sign_bytes(&fixture.chain_id)));
        vote
    }

    fn prevote_set(fixture: &Fixture) -> VoteSet {
        VoteSet::new(
            fixture.chain_id.clone(),
            Height::new(1),
            Round::new(0),
            VoteType::Prevote,
            fixture.validators.clone(),
        )
    }

    #[test]
    fn majority_found_at_two_thirds_plus_one() {
        let fixture = fixture(&[1, 1, 1]);
        let set = prevote_set(&fixture);
        let target = block_id(1);

        for i in 0..2 {
            set.add_vote(signed_vote(&fixture, i, VoteType::Prevote, 1, 0, target.clone()))
                .unwrap();
            assert!(set.two_thirds_majority().is_none());
        }

        set.add_vote(signed_vote(&fixture, 2, VoteType::Prevote, 1, 0, target.clone()))
            .unwrap();
        assert_eq!(set.two_thirds_majority(), Some(target));
    }

    #[test]
    fn duplicate_vote_is_not_an_error() {
        let fixture = fixture(&[1, 1, 1]);
        let set = prevote_set(&fixture);
        let vote = signed_vote(&fixture, 0, VoteType::Prevote, 1, 0, block_id(1));

        assert!(set.add_vote(vote.clone()).unwrap());
        assert!(!set.add_vote(vote).unwrap());
        assert!(set.bit_array().get(0));
    }

    #[test]
    fn wrong_slice_rejected() {
        let fixture = fixture(&[1, 1, 1]);
        let set = prevote_set(&fixture);
        let vote = signed_vote(&fixture, 0, VoteType::Prevote, 1, 5, block_id(1));
        assert!(matches!(
            set.add_vote(vote),
            Err(Error::NonMatchingSlice { .. })
        ));
    }

    #[test]
    fn forged_signature_rejected() {
        let fixture = fixture(&[1, 1, 1]);
        let set = prevote_set(&fixture);

        let mut vote = signed_vote(&fixture, 0, VoteType::Prevote, 1, 0, block_id(1));
        // Signed by validator 1 but claiming to be validator 0.
        vote.signature = Some(fixture.keys[1].sign(&vote.sign_bytes(&fixture.chain_id)));
        assert!(matches!(set.add_vote(vote), Err(Error::InvalidSignature(_))));
    }

    #[test]
    fn conflicting_vote_reported_not_counted() {
        let fixture = fixture(&[1, 1, 1]);
        let set = prevote_set(&fixture);

        set.add_vote(signed_vote(&fixture, 0, VoteType::Prevote, 1, 0, block_id(1)))
            .unwrap();

        let second = signed_vote(&fixture, 0, VoteType::Prevote, 1, 0, block_id(2));
        match set.add_vote(second) {
            Err(Error::ConflictingVote {
                existing,
                conflicting,
            }) => {
                assert_eq!(existing.block_id, block_id(1));
                assert_eq!(conflicting.block_id, block_id(2));
            }
            other => panic!("expected conflicting vote, got {other:?}"),
        }

        // Power counted only once.
        assert!(!set.has_two_thirds_any());
    }

    #[test]
    fn conflicting_votes_tracked_after_peer_claim() {
        let fixture = fixture(&[1, 1, 1]);
        let set = prevote_set(&fixture);
        let peer: NodeId = "aa".repeat(20).parse().unwrap();

        set.add_vote(signed_vote(&fixture, 0, VoteType::Prevote, 1, 0, block_id(1)))
            .unwrap();

        set.set_peer_maj23(peer, block_id(2)).unwrap();

        // The conflict is still surfaced, but the vote now lands in the
        // claimed block's bucket.
        let conflict = set.add_vote(signed_vote(&fixture, 0, VoteType::Prevote, 1, 0, block_id(2)));
        assert!(matches!(conflict, Err(Error::ConflictingVote { .. })));

        let bits = set.bit_array_by_block_id(&block_id(2)).unwrap();
        assert!(bits.get(0));
    }

    #[test]
    fn peer_may_claim_only_one_block() {
        let fixture = fixture(&[1, 1, 1]);
        let set = prevote_set(&fixture);
        let peer: NodeId = "bb".repeat(20).parse().unwrap();

        set.set_peer_maj23(peer.clone(), block_id(1)).unwrap();
        set.set_peer_maj23(peer.clone(), block_id(1)).unwrap();
        assert!(matches!(
            set.set_peer_maj23(peer, block_id(2)),
            Err(Error::ConflictingMaj23Claim { .. })
        ));
    }

    #[test]
    fn maj23_is_monotone() {
        let fixture = fixture(&[1, 1, 1, 1]);
        let set = prevote_set(&fixture);
        let first = block_id(1);

        for i in 0..3 {
            set.add_vote(signed_vote(&fixture, i, VoteType::Prevote, 1, 0, first.clone()))
                .unwrap();
        }
        assert_eq!(set.two_thirds_majority(), Some(first.clone()));

        // A late vote for another block cannot displace the majority.
        set.add_vote(signed_vote(&fixture, 3, VoteType::Prevote, 1, 0, block_id(2)))
            .unwrap();
        assert_eq!(set.two_thirds_majority(), Some(first));
    }

    #[test]
    fn make_commit_requires_precommit_majority() {
        let fixture = fixture(&[1, 1, 1]);
        let prevotes = prevote_set(&fixture);
        assert!(matches!(prevotes.make_commit(), Err(Error::NotPrecommit)));

        let precommits = VoteSet::new(
            fixture.chain_id.clone(),
            Height::new(1),
            Round::new(0),
            VoteType::Precommit,
            fixture.validators.clone(),
        );
        assert!(matches!(precommits.make_commit(), Err(Error::NoMajority)));

        let target = block_id(3);
        for i in 0..3 {
            precommits
                .add_vote(signed_vote(
                    &fixture,
                    i,
                    VoteType::Precommit,
                    1,
                    0,
                    target.clone(),
                ))
                .unwrap();
        }

        let commit = precommits.make_commit().unwrap();
        assert_eq!(commit.block_id, target);
        assert_eq!(commit.len(), 3);
        assert!(commit.signatures.iter().all(|sig| sig.for_block()));
    }

    #[test]
    fn make_commit_coerces_other_blocks_to_absent() {
        let fixture = fixture(&[1, 1, 1, 1]);
        let precommits = VoteSet::new(
            fixture.chain_id.clone(),
            Height::new(1),
            Round::new(0),
            VoteType::Precommit,
            fixture.validators.clone(),
        );

        let target = block_id(1);
        precommits
            .add_vote(signed_vote(&fixture, 3, VoteType::Precommit, 1, 0, block_id(2)))
            .unwrap();
        for i in 0..3 {
            precommits
                .add_vote(signed_vote(
                    &fixture,
                    i,
                    VoteType::Precommit,
                    1,
                    0,
                    target.clone(),
                ))
                .unwrap();
        }

        let commit = precommits.make_commit().unwrap();
        assert_eq!(commit.block_id, target);
        assert!(commit.signatures[3].is_absent());
    }

    #[test]
    fn reader_views_commit_and_vote_set_alike() {
        let fixture = fixture(&[1, 1, 1]);
        let precommits = VoteSet::new(
            fixture.chain_id.clone(),
            Height::new(1),
            Round::new(0),
            VoteType::Precommit,
            fixture.validators.clone(),
        );
        let target = block_id(1);
        for i in 0..3 {
            precommits
                .add_vote(signed_vote(
                    &fixture,
                    i,
                    VoteType::Precommit,
                    1,
                    0,
                    target.clone(),
                ))
                .unwrap();
        }

        let from_set = VoteSetReader::from_vote_set(&precommits);
        let from_commit = VoteSetReader::from_commit(&precommits.make_commit().unwrap());

        assert!(from_set.is_commit);
        assert!(from_commit.is_commit);
        assert_eq!(from_set.size(), from_commit.size());
        for i in 0..3 {
            assert_eq!(
                from_set.get_by_index(i).map(|v| v.block_id.clone()),
                from_commit.get_by_index(i).map(|v| v.block_id.clone())
            );
        }
    }
}
