//! Peer-to-peer stack: the Secret-Connection authenticated transport, the
//! MConn multiplexed framing on top of it, the peer manager that owns peer
//! lifecycle, and the router that dispatches channel traffic to reactors.

mod channel;
mod mconn;
mod node_info;
mod peer_manager;
mod router;
mod secret_connection;

pub use channel::{core_channel_descriptors, ChannelDescriptor, ChannelId, OverflowPolicy};
pub use mconn::{MConn, MConnConfig, MConnEvent};
pub use node_info::NodeInfo;
pub use peer_manager::{Direction, PeerManager, PeerManagerConfig, PeerState, PeerStatus, PeerUpdate};
pub use router::{Envelope, Router, RouterHandle};
pub use secret_connection::SecretConnection;

use noirbft_core_types::NodeId;
use thiserror::Error;

/// Channels used by the core, with their wire ids.
pub mod channels {
    use super::ChannelId;

    pub const CONSENSUS_STATE: ChannelId = ChannelId(0x20);
    pub const CONSENSUS_DATA: ChannelId = ChannelId(0x21);
    pub const CONSENSUS_VOTE: ChannelId = ChannelId(0x22);
    pub const MEMPOOL: ChannelId = ChannelId(0x30);
    pub const EVIDENCE: ChannelId = ChannelId(0x38);
    pub const BLOCK_SYNC: ChannelId = ChannelId(0x40);
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Low-order shared secret")]
    LowOrderKey,

    #[error("Peer authentication failed: {0}")]
    Authentication(String),

    #[error("Frame sealing failed")]
    Seal,

    #[error("Frame opening failed (corrupted or replayed frame)")]
    Open,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Message on channel {0} exceeds the receive capacity")]
    RecvCapacityExceeded(ChannelId),

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("Send queue full for channel {0}")]
    SendQueueFull(ChannelId),

    #[error("Pong not received within the timeout")]
    PongTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Peer {0} is not connected")]
    PeerNotConnected(NodeId),

    #[error("Incompatible peer: {0}")]
    IncompatiblePeer(String),

    #[error("Protobuf error: {0}")]
    Proto(#[from] noirbft_proto::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Core type error: {0}")]
    Core(#[from] noirbft_core_types::Error),
}
