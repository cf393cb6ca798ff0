//! The `Node` value: owns the stores, the WAL, the evidence pool, the
//! transport stack and the reactors, and sequences startup and shutdown.

mod key;
mod node;
mod sync_processor;

pub use key::NodeKey;
pub use node::{Node, NodeHandle};
pub use sync_processor::SyncBlockProcessor;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Genesis error: {0}")]
    Genesis(#[from] noirbft_core_types::Error),

    #[error("Store error: {0}")]
    Store(#[from] noirbft_store::Error),

    #[error("WAL error: {0}")]
    Wal(#[from] noirbft_wal::Error),

    #[error("Evidence error: {0}")]
    Evidence(#[from] noirbft_evidence::Error),

    #[error("ABCI error: {0}")]
    Abci(#[from] noirbft_abci::Error),

    #[error("Consensus error: {0}")]
    Consensus(#[from] noirbft_consensus::Error),

    #[error("P2P error: {0}")]
    P2p(#[from] noirbft_p2p::Error),
}
