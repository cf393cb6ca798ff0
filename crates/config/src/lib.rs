//! Noir node configuration options.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bytesize::ByteSize;
use config as config_rs;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// A custom human-readable name for this node
    pub moniker: String,

    /// Log configuration options
    pub logging: LoggingConfig,

    /// Consensus configuration options
    pub consensus: ConsensusConfig,

    /// P2P configuration options
    pub p2p: P2pConfig,

    /// Mempool configuration options
    pub mempool: MempoolConfig,

    /// Block-sync configuration options
    pub block_sync: BlockSyncConfig,

    /// Write-ahead log configuration options
    pub wal: WalConfig,

    /// Storage configuration options
    pub storage: StorageConfig,

    /// ABCI application configuration options
    pub abci: AbciConfig,
}

/// Parses the environment variables and loads the provided config file path
/// to create a Config struct.
pub fn load_config(config_file_path: &Path, prefix: Option<&str>) -> Result<Config, String> {
    config_rs::Config::builder()
        .add_source(config_rs::File::from(config_file_path))
        .add_source(config_rs::Environment::with_prefix(prefix.unwrap_or("NOIR")).separator("__"))
        .build()
        .map_err(|error| error.to_string())?
        .try_deserialize()
        .map_err(|error| error.to_string())
}

/// Consensus timing and proposal behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// How long we wait for a proposal block before prevoting nil
    #[serde(with = "humantime_serde")]
    pub timeout_propose: Duration,

    /// How much timeout_propose increases with each round
    #[serde(with = "humantime_serde")]
    pub timeout_propose_delta: Duration,

    /// How long we wait after receiving +2/3 prevotes for "anything"
    #[serde(with = "humantime_serde")]
    pub timeout_prevote: Duration,

    /// How much the timeout_prevote increases with each round
    #[serde(with = "humantime_serde")]
    pub timeout_prevote_delta: Duration,

    /// How long we wait after receiving +2/3 precommits for "anything"
    #[serde(with = "humantime_serde")]
    pub timeout_precommit: Duration,

    /// How much the timeout_precommit increases with each round
    #[serde(with = "humantime_serde")]
    pub timeout_precommit_delta: Duration,

    /// Pause between a commit and the start of the next height
    #[serde(with = "humantime_serde")]
    pub timeout_commit: Duration,

    /// Whether to propose blocks with no transactions
    pub create_empty_blocks: bool,

    /// Minimum gap between empty blocks when create_empty_blocks is off
    #[serde(with = "humantime_serde")]
    pub create_empty_blocks_interval: Duration,

    /// Nap between per-peer gossip attempts
    #[serde(with = "humantime_serde")]
    pub peer_gossip_sleep_duration: Duration,

    /// Cadence of the +2/3 probe sent to each peer
    #[serde(with = "humantime_serde")]
    pub peer_query_maj23_sleep_duration: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeout_propose: Duration::from_secs(3),
            timeout_propose_delta: Duration::from_millis(500),
            timeout_prevote: Duration::from_secs(1),
            timeout_prevote_delta: Duration::from_millis(500),
            timeout_precommit: Duration::from_secs(1),
            timeout_precommit_delta: Duration::from_millis(500),
            timeout_commit: Duration::from_secs(1),
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
            peer_gossip_sleep_duration: Duration::from_millis(100),
            peer_query_maj23_sleep_duration: Duration::from_secs(2),
        }
    }
}

impl ConsensusConfig {
    /// Propose-step wait for a given round; grows with each retry.
    pub fn propose_timeout(&self, round: i32) -> Duration {
        self.timeout_propose + self.timeout_propose_delta * round.max(0) as u32
    }

    pub fn prevote_timeout(&self, round: i32) -> Duration {
        self.timeout_prevote + self.timeout_prevote_delta * round.max(0) as u32
    }

    pub fn precommit_timeout(&self, round: i32) -> Duration {
        self.timeout_precommit + self.timeout_precommit_delta * round.max(0) as u32
    }
}

/// P2P transport and peer-management knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Address to listen for incoming connections
    pub listen_addr: SocketAddr,

    /// List of nodes to keep persistent connections to, `id@host:port`
    pub persistent_peers: Vec<String>,

    /// Maximum number of connected peers
    pub max_connected: usize,

    /// Time allotted to the secret-connection handshake
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Upper bound on a single MConn packet payload
    pub max_packet_msg_payload_size: ByteSize,

    /// MConn send batching window
    #[serde(with = "humantime_serde")]
    pub flush_throttle_timeout: Duration,

    /// Send a ping when the connection has been silent this long
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,

    /// Fail the connection when a ping goes unanswered this long
    #[serde(with = "humantime_serde")]
    pub pong_timeout: Duration,

    /// Base of the geometric dial backoff
    #[serde(with = "humantime_serde")]
    pub dial_backoff_base: Duration,

    /// Cap on the dial backoff for ordinary peers
    #[serde(with = "humantime_serde")]
    pub max_retry_time: Duration,

    /// Cap on the dial backoff for persistent peers
    #[serde(with = "humantime_serde")]
    pub max_retry_time_persistent: Duration,

    /// Cooldown before reconnecting to a just-disconnected peer
    #[serde(with = "humantime_serde")]
    pub reconnect_cooldown: Duration,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from_str("0.0.0.0:26656").expect("valid address"),
            persistent_peers: Vec::new(),
            max_connected: 40,
            handshake_timeout: Duration::from_secs(20),
            max_packet_msg_payload_size: ByteSize::b(1400),
            flush_throttle_timeout: Duration::from_millis(100),
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(45),
            dial_backoff_base: Duration::from_secs(1),
            max_retry_time: Duration::from_secs(10 * 60),
            max_retry_time_persistent: Duration::from_secs(20),
            reconnect_cooldown: Duration::from_secs(5),
        }
    }
}

/// Mempool boundary knobs. The mempool itself is an external collaborator;
/// the node only needs to know how to talk to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MempoolConfig {
    /// Maximum number of transactions reaped into one proposal
    pub max_txs_per_block: usize,

    /// Re-run CheckTx on all remaining transactions after a commit
    pub recheck: bool,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_txs_per_block: 10_000,
            recheck: true,
        }
    }
}

/// Fast-sync tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockSyncConfig {
    /// Enable the block-sync fast path on startup
    pub enable: bool,

    /// Bound on concurrently outstanding height requesters
    pub max_total_requesters: usize,

    /// Bound on in-flight requests per peer
    pub max_pending_requests_per_peer: usize,

    /// Evict a peer that has sent nothing for this long
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,

    /// Pacing of the requester spawn loop
    #[serde(with = "humantime_serde")]
    pub request_interval: Duration,
}

impl Default for BlockSyncConfig {
    fn default() -> Self {
        Self {
            enable: true,
            max_total_requesters: 30,
            max_pending_requests_per_peer: 20,
            peer_timeout: Duration::from_secs(15),
            request_interval: Duration::from_millis(2),
        }
    }
}

/// Write-ahead log sizing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalConfig {
    /// Per-file size before rotating to the next file
    pub rotate_size: ByteSize,

    /// Number of files in the rotation ring
    pub num_files: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            rotate_size: ByteSize::mib(10),
            num_files: 16,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the block store, state store, evidence store and
    /// the WAL. Empty means the platform default home.
    pub home: PathBuf,
}

/// How to reach the ABCI application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AbciConfig {
    /// `unix:///path/to.sock` or `tcp://host:port`
    pub address: String,

    /// Flush the request pipe at this cadence
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for AbciConfig {
    fn default() -> Self {
        Self {
            address: "unix:///tmp/noir-abci.sock".to_string(),
            flush_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_level: LogLevel,
    pub log_format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_format: LogFormat::Plaintext,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.block_sync.max_total_requesters, 30);
        assert_eq!(config.block_sync.max_pending_requests_per_peer, 20);
        assert_eq!(config.block_sync.peer_timeout, Duration::from_secs(15));
        assert_eq!(config.block_sync.request_interval, Duration::from_millis(2));
        assert_eq!(config.p2p.max_packet_msg_payload_size, ByteSize::b(1400));
        assert!(config.consensus.create_empty_blocks);
    }

    #[test]
    fn timeouts_grow_per_round() {
        let consensus = ConsensusConfig::default();
        assert_eq!(consensus.propose_timeout(0), Duration::from_secs(3));
        assert_eq!(
            consensus.propose_timeout(4),
            Duration::from_secs(3) + Duration::from_millis(2000)
        );
        assert!(consensus.prevote_timeout(2) > consensus.prevote_timeout(1));
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn load_from_file() {
        let config = Config {
            moniker: "test-node".to_string(),
            ..Default::default()
        };

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(toml::to_string(&config).unwrap().as_bytes())
            .unwrap();

        let loaded = load_config(file.path(), Some("NOIR_TEST")).unwrap();
        assert_eq!(loaded.moniker, "test-node");
        assert_eq!(loaded, config);
    }
}
