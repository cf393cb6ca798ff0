//! Protobuf schema for everything the consensus core puts on the wire or on disk.
//!
//! The message structs are hand-derived with `prost` rather than generated from
//! `.proto` files; tag numbers follow the Tendermint schema so the framing is
//! interoperable at the byte level.

use prost::{DecodeError, EncodeError, Message};
use thiserror::Error;

pub use prost;

pub mod abci;
pub mod blocksync;
pub mod canonical;
pub mod consensus;
pub mod p2p;
pub mod types;
pub mod wal;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to decode Protobuf message")]
    Decode(#[from] DecodeError),

    #[error("Failed to encode Protobuf message")]
    Encode(#[from] EncodeError),

    #[error("Unable to decode Protobuf message: missing field `{field}`")]
    MissingField { field: &'static str },

    #[error("Invalid value for field `{field}`: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn missing_field(field: &'static str) -> Self {
        Self::MissingField { field }
    }

    pub fn invalid_field(field: &'static str, reason: impl ToString) -> Self {
        Self::InvalidField {
            field,
            reason: reason.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

/// Conversion between a domain type and its Protobuf representation.
pub trait Protobuf: Sized {
    type Proto: Message + Default;

    fn from_proto(proto: Self::Proto) -> Result<Self, Error>;

    fn to_proto(&self) -> Result<Self::Proto, Error>;

    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let proto = Self::Proto::decode(bytes)?;
        Self::from_proto(proto)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let proto = self.to_proto()?;
        Ok(proto.encode_to_vec())
    }
}
