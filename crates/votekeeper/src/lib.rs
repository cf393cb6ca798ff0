//! Vote bookkeeping: tallies prevotes and precommits per `(height, round)`
//! slice, detects +2/3 majorities, and keeps enough state to catch
//! double-signing without unbounded memory.

mod height_vote_set;
mod vote_set;

pub use height_vote_set::HeightVoteSet;
pub use vote_set::{VoteSet, VoteSetReader};

use noirbft_core_types::{BlockId, NodeId, Vote};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid validator index: {0}")]
    InvalidValidatorIndex(i32),

    #[error("Empty validator address")]
    EmptyValidatorAddress,

    #[error("Vote does not match this set: expected {expected}, got {got}")]
    NonMatchingSlice { expected: String, got: String },

    #[error("Unknown validator at index {0}")]
    UnknownValidator(i32),

    #[error("Validator address does not match index {0}")]
    AddressMismatch(i32),

    #[error("A different vote with the same block id already exists")]
    NonDeterministicSignature,

    #[error("Invalid vote signature: {0}")]
    InvalidSignature(#[from] noirbft_core_types::Error),

    /// The validator voted twice for different blocks. Carries both votes so
    /// the caller can turn them into evidence.
    #[error("Conflicting vote from potentially byzantine validator")]
    ConflictingVote {
        existing: Box<Vote>,
        conflicting: Box<Vote>,
    },

    #[error("Peer {peer} already claimed +2/3 for a different block")]
    ConflictingMaj23Claim {
        peer: NodeId,
        existing: Box<BlockId>,
        claimed: Box<BlockId>,
    },

    #[error("Peer has sent a vote that does not match our round for more than one round")]
    GotVoteFromUnwantedRound,

    #[error("Cannot make a commit from a non-precommit vote set")]
    NotPrecommit,

    #[error("Cannot make a commit without a +2/3 majority")]
    NoMajority,
}
