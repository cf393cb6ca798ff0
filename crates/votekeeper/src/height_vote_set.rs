use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use noirbft_core_types::{
    BlockId, ChainId, Height, NodeId, Round, ValidatorSet, Vote, VoteType,
};

use crate::{Error, VoteSet};

#[derive(Debug)]
struct RoundVoteSet {
    prevotes: Arc<VoteSet>,
    precommits: Arc<VoteSet>,
}

#[derive(Debug)]
struct Inner {
    round: Round,
    round_vote_sets: BTreeMap<Round, RoundVoteSet>,
    /// Rounds lazily created on behalf of each peer. A peer is allowed two:
    /// one for its last-commit round and one for the official commit round.
    peer_catchup_rounds: BTreeMap<NodeId, Vec<Round>>,
}

/// Keeps one `VoteSet` per vote type for every round from 0 up to the
/// current round, plus a bounded number of peer-driven future rounds for
/// catch-up commits.
#[derive(Debug)]
pub struct HeightVoteSet {
    chain_id: ChainId,
    height: Height,
    validators: ValidatorSet,
    inner: Mutex<Inner>,
}

impl HeightVoteSet {
    pub fn new(chain_id: ChainId, height: Height, validators: ValidatorSet) -> Self {
        let hvs = Self {
            chain_id,
            height,
            validators,
            inner: Mutex::new(Inner {
                round: Round::ZERO,
                round_vote_sets: BTreeMap::new(),
                peer_catchup_rounds: BTreeMap::new(),
            }),
        };
        {
            let mut inner = hvs.inner.lock().expect("height vote set lock poisoned");
            hvs.add_round(&mut inner, Round::ZERO);
        }
        hvs
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.inner.lock().expect("height vote set lock poisoned").round
    }

    fn add_round(&self, inner: &mut Inner, round: Round) {
        debug_assert!(!inner.round_vote_sets.contains_key(&round));
        let prevotes = Arc::new(VoteSet::new(
            self.chain_id.clone(),
            self.height,
            round,
            VoteType::Prevote,
            self.validators.clone(),
        ));
        let precommits = Arc::new(VoteSet::new(
            self.chain_id.clone(),
            self.height,
            round,
            VoteType::Precommit,
            self.validators.clone(),
        ));
        inner.round_vote_sets.insert(
            round,
            RoundVoteSet {
                prevotes,
                precommits,
            },
        );
    }

    /// Advances to `round`, creating any missing intermediate rounds.
    pub fn set_round(&self, round: Round) {
        let mut inner = self.inner.lock().expect("height vote set lock poisoned");
        let mut r = inner.round;
        while r <= round {
            if !inner.round_vote_sets.contains_key(&r) {
                self.add_round(&mut inner, r);
            }
            r = r.increment();
        }
        inner.round = round;
    }

    /// Routes a vote to its round's vote set. A vote for an untracked round
    /// lazily creates that round, but each peer may trigger at most two such
    /// creations.
    pub fn add_vote(&self, vote: Vote, peer: &NodeId) -> Result<bool, Error> {
        let vote_set = {
            let mut inner = self.inner.lock().expect("height vote set lock poisoned");
            match Self::get_locked(&inner, vote.round, vote.vote_type) {
                Some(vote_set) => vote_set,
                None => {
                    let rounds = inner.peer_catchup_rounds.entry(peer.clone()).or_default();
                    if rounds.len() >= 2 {
                        return Err(Error::GotVoteFromUnwantedRound);
                    }
                    rounds.push(vote.round);
                    let round = vote.round;
                    self.add_round(&mut inner, round);
                    Self::get_locked(&inner, round, vote.vote_type).expect("round just added")
                }
            }
        };
        vote_set.add_vote(vote)
    }

    fn get_locked(inner: &Inner, round: Round, vote_type: VoteType) -> Option<Arc<VoteSet>> {
        inner.round_vote_sets.get(&round).map(|rvs| match vote_type {
            VoteType::Prevote => Arc::clone(&rvs.prevotes),
            VoteType::Precommit => Arc::clone(&rvs.precommits),
        })
    }

    pub fn prevotes(&self, round: Round) -> Option<Arc<VoteSet>> {
        let inner = self.inner.lock().expect("height vote set lock poisoned");
        Self::get_locked(&inner, round, VoteType::Prevote)
    }

    pub fn precommits(&self, round: Round) -> Option<Arc<VoteSet>> {
        let inner = self.inner.lock().expect("height vote set lock poisoned");
        Self::get_locked(&inner, round, VoteType::Precommit)
    }

    pub fn get(&self, round: Round, vote_type: VoteType) -> Option<Arc<VoteSet>> {
        let inner = self.inner.lock().expect("height vote set lock poisoned");
        Self::get_locked(&inner, round, vote_type)
    }

    /// The most recent round with a +2/3 prevote majority, if any.
    pub fn pol_info(&self) -> Option<(Round, BlockId)> {
        let inner = self.inner.lock().expect("height vote set lock poisoned");
        let mut round = inner.round;
        loop {
            if let Some(prevotes) = Self::get_locked(&inner, round, VoteType::Prevote) {
                if let Some(block_id) = prevotes.two_thirds_majority() {
                    return Some((round, block_id));
                }
            }
            match round.as_i32() {
                0 => return None,
                r => round = Round::new(r - 1),
            }
        }
    }

    pub fn set_peer_maj23(
        &self,
        round: Round,
        vote_type: VoteType,
        peer: NodeId,
        block_id: BlockId,
    ) -> Result<(), Error> {
        let vote_set = {
            let inner = self.inner.lock().expect("height vote set lock poisoned");
            Self::get_locked(&inner, round, vote_type)
        };
        match vote_set {
            Some(vote_set) => vote_set.set_peer_maj23(peer, block_id),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vote_set::tests::{block_id, fixture, signed_vote};

    fn peer(byte: &str) -> NodeId {
        byte.repeat(20).parse().unwrap()
    }

    #[test]
    fn set_round_creates_intermediate_rounds() {
        let fixture = fixture(&[1, 1, 1]);
        let hvs = HeightVoteSet::new(
            fixture.chain_id.clone(),
            Height::new(1),
            fixture.validators.clone(),
        );

        hvs.set_round(Round::new(3));
        for r in 0..=3 {
            assert!(hvs.prevotes(Round::new(r)).is_some());
            assert!(hvs.precommits(Round::new(r)).is_some());
        }
        assert!(hvs.prevotes(Round::new(4)).is_none());
    }

    #[test]
    fn votes_land_in_their_round() {
        let fixture = fixture(&[1, 1, 1]);
        let hvs = HeightVoteSet::new(
            fixture.chain_id.clone(),
            Height::new(1),
            fixture.validators.clone(),
        );
        hvs.set_round(Round::new(1));

        let vote = signed_vote(&fixture, 0, VoteType::Prevote, 1, 1, block_id(1));
        hvs.add_vote(vote, &peer("aa")).unwrap();

        assert!(hvs.prevotes(Round::new(1)).unwrap().bit_array().get(0));
        assert!(!hvs.prevotes(Round::new(0)).unwrap().bit_array().get(0));
    }

    #[test]
    fn peer_catchup_allowance_is_two_rounds() {
        let fixture = fixture(&[1, 1, 1]);
        let hvs = HeightVoteSet::new(
            fixture.chain_id.clone(),
            Height::new(1),
            fixture.validators.clone(),
        );
        let peer = peer("cc");

        // Two future rounds are tolerated.
        for (i, round) in [5, 7].into_iter().enumerate() {
            let vote = signed_vote(&fixture, i, VoteType::Precommit, 1, round, block_id(1));
            hvs.add_vote(vote, &peer).unwrap();
        }

        // The third gets the peer punished.
        let vote = signed_vote(&fixture, 2, VoteType::Precommit, 1, 9, block_id(1));
        assert!(matches!(
            hvs.add_vote(vote, &peer),
            Err(Error::GotVoteFromUnwantedRound)
        ));
    }

    #[test]
    fn pol_info_finds_latest_prevote_majority() {
        let fixture = fixture(&[1, 1, 1]);
        let hvs = HeightVoteSet::new(
            fixture.chain_id.clone(),
            Height::new(1),
            fixture.validators.clone(),
        );
        assert!(hvs.pol_info().is_none());

        hvs.set_round(Round::new(1));
        let target = block_id(4);
        for i in 0..3 {
            let vote = signed_vote(&fixture, i, VoteType::Prevote, 1, 1, target.clone());
            hvs.add_vote(vote, &peer("dd")).unwrap();
        }

        assert_eq!(hvs.pol_info(), Some((Round::new(1), target)));
    }
}
