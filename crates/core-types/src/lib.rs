//! Core data model for the Noir BFT node.
//!
//! Everything in here is deterministic and free of I/O: primitive ids,
//! cryptographic identities, validator bookkeeping, votes, commits, blocks
//! and their part sets.

mod bit_array;
mod block;
mod block_id;
mod commit;
mod error;
mod evidence;
mod genesis;
mod height;
mod merkle;
mod node_id;
mod params;
mod part_set;
mod proposal;
mod signing;
mod time;
mod validator;
mod vote;

pub use bit_array::BitArray;
pub use block::{Block, BlockMeta, Data, Header, Version};
pub use block_id::{BlockId, PartSetHeader};
pub use commit::{BlockIdFlag, Commit, CommitSig};
pub use error::Error;
pub use evidence::{
    DuplicateVoteEvidence, Evidence, EvidenceList, LightBlock, LightClientAttackEvidence,
    SignedHeader,
};
pub use genesis::{GenesisDoc, GenesisValidator};
pub use height::{Height, Round};
pub use merkle::{merkle_root, Proof};
pub use node_id::NodeId;
pub use params::{BlockParams, ConsensusParams, EvidenceParams, ValidatorParams, VersionParams};
pub use part_set::{Part, PartSet};
pub use proposal::Proposal;
pub use signing::{Address, PrivValidator, PrivateKey, PublicKey, Signature};
pub use time::Timestamp;
pub use validator::{Validator, ValidatorSet, MAX_TOTAL_VOTING_POWER};
pub use vote::{Vote, VoteType};

/// Chain identifier, carried in every canonical signing payload.
pub type ChainId = String;

/// Default size of a block part, in bytes.
pub const BLOCK_PART_SIZE_BYTES: usize = 65536;
