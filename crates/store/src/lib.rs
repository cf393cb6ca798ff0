//! Persistence for blocks, commits, parts and per-height state snapshots,
//! backed by `redb`.

mod block_store;
mod state;
mod state_store;

pub use block_store::BlockStore;
pub use state::State;
pub use state_store::StateStore;

use noirbft_core_types::Height;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Failed to decode stored value: {0}")]
    Decode(#[from] noirbft_proto::Error),

    #[error("Height {0} not found in store")]
    HeightNotFound(Height),

    #[error("Store is empty")]
    Empty,

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    #[error("Core type error: {0}")]
    Core(#[from] noirbft_core_types::Error),
}
