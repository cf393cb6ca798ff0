//! The evidence subsystem: verifies misbehavior proofs against historical
//! chain state, keeps them pending until they land in a block, and gossips
//! them to peers.

mod pool;
mod reactor;
mod verify;

pub use pool::{Pool, PoolConfig};
pub use reactor::Reactor;
pub use verify::{to_abci_evidence, AttackType};

use noirbft_core_types::Height;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid evidence: {0}")]
    Invalid(String),

    #[error("Evidence from height {height} is expired: {reason}")]
    Expired { height: Height, reason: String },

    #[error("Evidence already committed")]
    AlreadyCommitted,

    #[error("Evidence is pending but was proposed as new")]
    AlreadyPending,

    #[error("Core type error: {0}")]
    Core(#[from] noirbft_core_types::Error),

    #[error("Store error: {0}")]
    Store(#[from] noirbft_store::Error),

    #[error("Database error: {0}")]
    Database(#[from] redb::Error),

    #[error("Database error: {0}")]
    DatabaseOpen(#[from] redb::DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Protobuf error: {0}")]
    Proto(#[from] noirbft_proto::Error),
}
