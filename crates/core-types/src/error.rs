use thiserror::Error;

use crate::{Address, Height, Round};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Height cannot be negative: {0}")]
    NegativeHeight(i64),

    #[error("Validator set is empty")]
    EmptyValidatorSet,

    #[error("Cannot increment proposer priority a non-positive number of times: {0}")]
    NonPositiveTimes(i32),

    #[error("Total voting power {0} exceeds the allowed maximum {1}")]
    TotalVotingPowerOverflow(i64, i64),

    #[error("Validator has non-positive voting power: {0}")]
    NonPositiveVotingPower(i64),

    #[error("Duplicate validator address: {0}")]
    DuplicateValidator(Address),

    #[error("Unknown validator: {0}")]
    UnknownValidator(Address),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Part index {index} out of bounds (total {total})")]
    PartOutOfBounds { index: u32, total: u32 },

    #[error("Part {0} failed Merkle proof verification")]
    InvalidPartProof(u32),

    #[error("Part set is incomplete: {count}/{total} parts")]
    IncompletePartSet { count: u32, total: u32 },

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Invalid commit for height {height}, round {round}: {reason}")]
    InvalidCommit {
        height: Height,
        round: Round,
        reason: String,
    },

    #[error("Not enough voting power: have {have}, need more than {need}")]
    NotEnoughVotingPower { have: i64, need: i64 },

    #[error("Invalid evidence: {0}")]
    InvalidEvidence(String),

    #[error("Protobuf conversion failed: {0}")]
    Proto(#[from] noirbft_proto::Error),

    #[error("Invalid genesis document: {0}")]
    InvalidGenesis(String),
}
