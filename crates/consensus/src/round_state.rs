use std::sync::Arc;

use noirbft_core_types::{
    Block, Height, PartSet, Proposal, Round, Timestamp, ValidatorSet,
};
use noirbft_votekeeper::{HeightVoteSet, VoteSet};

/// The sub-phase within a round. The machine only ever moves forward in
/// `(height, round, step)` lexicographic order, except for the +2/3-driven
/// round skip.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoundStepType {
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    PrevoteWait,
    Precommit,
    PrecommitWait,
    Commit,
}

impl RoundStepType {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::NewHeight => 1,
            Self::NewRound => 2,
            Self::Propose => 3,
            Self::Prevote => 4,
            Self::PrevoteWait => 5,
            Self::Precommit => 6,
            Self::PrecommitWait => 7,
            Self::Commit => 8,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::NewHeight),
            2 => Some(Self::NewRound),
            3 => Some(Self::Propose),
            4 => Some(Self::Prevote),
            5 => Some(Self::PrevoteWait),
            6 => Some(Self::Precommit),
            7 => Some(Self::PrecommitWait),
            8 => Some(Self::Commit),
            _ => None,
        }
    }
}

impl core::fmt::Display for RoundStepType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::NewHeight => "NewHeight",
            Self::NewRound => "NewRound",
            Self::Propose => "Propose",
            Self::Prevote => "Prevote",
            Self::PrevoteWait => "PrevoteWait",
            Self::Precommit => "Precommit",
            Self::PrecommitWait => "PrecommitWait",
            Self::Commit => "Commit",
        };
        f.write_str(name)
    }
}

/// Everything the state machine knows about the round in progress.
/// Published as an immutable snapshot after every transition so the gossip
/// reactor can serve peers without holding any consensus lock.
#[derive(Clone, Debug)]
pub struct RoundState {
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
    pub start_time: Timestamp,
    pub commit_time: Timestamp,

    pub validators: ValidatorSet,

    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,

    pub locked_round: Round,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,

    /// Last known block with a +2/3 prevote, and the round it got it in.
    pub valid_round: Round,
    pub valid_block: Option<Block>,
    pub valid_block_parts: Option<PartSet>,

    pub votes: Arc<HeightVoteSet>,
    pub commit_round: Round,

    /// Precommits for the previous height.
    pub last_commit: Option<Arc<VoteSet>>,
    pub last_validators: ValidatorSet,

    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    /// A proposal is complete once it is signed, delivered, and all of its
    /// parts have arrived (and, when carrying a proof-of-lock, that POL's
    /// prevotes are visible).
    pub fn is_proposal_complete(&self) -> bool {
        let Some(proposal) = &self.proposal else {
            return false;
        };
        if self.proposal_block.is_none() {
            return false;
        }
        if proposal.pol_round.is_nil() {
            return true;
        }
        self.votes
            .prevotes(proposal.pol_round)
            .map(|prevotes| prevotes.has_two_thirds_majority())
            .unwrap_or(false)
    }

    /// `(height, round, step)` key for ordering comparisons.
    pub fn hrs(&self) -> (Height, Round, RoundStepType) {
        (self.height, self.round, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_ordered() {
        use RoundStepType::*;
        let steps = [
            NewHeight,
            NewRound,
            Propose,
            Prevote,
            PrevoteWait,
            Precommit,
            PrecommitWait,
            Commit,
        ];
        for pair in steps.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn step_codes_round_trip() {
        for code in 1..=8 {
            let step = RoundStepType::from_u32(code).unwrap();
            assert_eq!(step.as_u32(), code);
        }
        assert!(RoundStepType::from_u32(0).is_none());
        assert!(RoundStepType::from_u32(9).is_none());
    }
}
