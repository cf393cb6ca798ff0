//! Write-ahead log for the consensus state machine.
//!
//! Every state-machine input is appended here before it is processed, and
//! an end-of-height marker is written after each commit, so a crashed node
//! can replay its way back to exactly where it stopped.
//!
//! Each entry has the following format on disk:
//!
//! ```text
//! +-----------------+----------------+-----------------+
//! |      CRC        |     Length     |     Payload     |
//! |   (4 bytes BE)  |  (4 bytes BE)  | ($length bytes) |
//! +-----------------+----------------+-----------------+
//! ```
//!
//! The payload is an encoded [`TimedWalMessage`]. The log rotates across a
//! fixed set of files (`cs_wal.0` .. `cs_wal.{n-1}`); when the live file
//! exceeds the rotation threshold the next index is truncated and reused,
//! discarding the oldest history.

mod decoder;
mod log;
mod repair;

pub use decoder::{Decoded, WalDecoder, MAX_MSG_PAYLOAD_BYTES};
pub use log::{Wal, WalOptions, WAL_FILE_PREFIX};
pub use repair::repair;

pub use noirbft_proto::wal::{
    EndHeight, MsgInfo, RoundStepUpdate, TimedWalMessage, TimeoutInfo, WalMessage,
};

use std::io;

use thiserror::Error;

/// Options for [`Wal::search_for_end_height`].
#[derive(Copy, Clone, Debug, Default)]
pub struct SearchOptions {
    /// Skip over records that fail the CRC check instead of failing the
    /// search. Only used during explicit repair flows.
    pub ignore_data_corruption: bool,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WAL message too big: {size} bytes, max {max} bytes")]
    MessageTooBig { size: usize, max: usize },

    #[error("WAL record corrupted: {0}")]
    Corrupted(String),

    #[error("Failed to decode WAL payload: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Computes the CRC-32 checksum framed in front of every record.
pub(crate) fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
