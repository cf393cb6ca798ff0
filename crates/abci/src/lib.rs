//! Client side of the ABCI boundary.
//!
//! The application runs out of process; requests and responses are framed
//! with a varint length prefix over a Unix socket or TCP connection. The
//! consensus-critical calls (`begin_block`, `deliver_tx`, `end_block`,
//! `commit`) flow through here one at a time from the block executor.

mod client;
mod codec;
mod socket;

pub use client::Client;
pub use socket::SocketClient;

pub use noirbft_proto::abci::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ABCI I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode ABCI response: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("ABCI connection closed")]
    ConnectionClosed,

    #[error("Unexpected ABCI response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: &'static str, got: String },

    #[error("Application returned an exception: {0}")]
    Exception(String),

    #[error("Invalid ABCI address `{0}`: expected unix://<path> or tcp://<host:port>")]
    InvalidAddress(String),
}

/// How an ABCI address is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    Unix(std::path::PathBuf),
    Tcp(String),
}

impl Address {
    pub fn parse(address: &str) -> Result<Self, Error> {
        if let Some(path) = address.strip_prefix("unix://") {
            return Ok(Self::Unix(path.into()));
        }
        if let Some(addr) = address.strip_prefix("tcp://") {
            return Ok(Self::Tcp(addr.to_string()));
        }
        Err(Error::InvalidAddress(address.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing() {
        assert_eq!(
            Address::parse("unix:///tmp/app.sock").unwrap(),
            Address::Unix("/tmp/app.sock".into())
        );
        assert_eq!(
            Address::parse("tcp://127.0.0.1:26658").unwrap(),
            Address::Tcp("127.0.0.1:26658".to_string())
        );
        assert!(Address::parse("http://nope").is_err());
    }
}
