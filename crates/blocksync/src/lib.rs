//! Block-sync: when the node is behind the network it downloads blocks
//! from many peers in parallel, verifies each against the next block's
//! last-commit, applies them, and hands over to consensus at the tip.

mod pool;
mod reactor;

pub use pool::{BlockPool, BlockPoolConfig, PoolStatus};
pub use reactor::{BlockProcessor, ProcessOutcome, Reactor};

use noirbft_core_types::{Height, NodeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No requester for height {0}")]
    NoRequester(Height),

    #[error("Peer {0} is not in the pool")]
    UnknownPeer(NodeId),

    #[error("Block from peer {peer} does not match the request for height {height}")]
    UnsolicitedBlock { peer: NodeId, height: Height },

    #[error("Block verification failed at height {height}: {reason}")]
    Verification { height: Height, reason: String },

    #[error("Failed to apply block at height {height}: {reason}")]
    Apply { height: Height, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] noirbft_store::Error),

    #[error("Protobuf error: {0}")]
    Proto(#[from] noirbft_proto::Error),

    #[error("Core type error: {0}")]
    Core(#[from] noirbft_core_types::Error),
}
