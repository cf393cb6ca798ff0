//! The consensus subsystem: the height/round/step state machine that
//! drives proposal, prevote, precommit and commit; the block executor that
//! applies decided blocks through ABCI; and the per-peer gossip reactor.

mod executor;
mod messages;
mod reactor;
mod round_state;
mod state;
mod ticker;

pub use executor::{verify_sync_block, BlockExecutor, Mempool, NoopMempool};
pub use messages::{ConsensusMessage, MsgInfo, StateEvent, TimeoutInfo};
pub use reactor::Reactor;
pub use round_state::{RoundState, RoundStepType};
pub use state::{ConsensusState, StateHandle};
pub use ticker::TimeoutTicker;

use noirbft_core_types::{Height, Round};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("No proposer for height {0}, round {1}")]
    NoProposer(Height, Round),

    #[error("This node is not a validator")]
    NotAValidator,

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Application error on consensus-critical call: {0}")]
    Application(String),

    #[error("ABCI error: {0}")]
    Abci(#[from] noirbft_abci::Error),

    #[error("WAL error: {0}")]
    Wal(#[from] noirbft_wal::Error),

    #[error("Store error: {0}")]
    Store(#[from] noirbft_store::Error),

    #[error("Vote keeping error: {0}")]
    VoteKeeper(#[from] noirbft_votekeeper::Error),

    #[error("Evidence error: {0}")]
    Evidence(#[from] noirbft_evidence::Error),

    #[error("Core type error: {0}")]
    Core(#[from] noirbft_core_types::Error),

    #[error("Protobuf error: {0}")]
    Proto(#[from] noirbft_proto::Error),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}
