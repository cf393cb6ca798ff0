use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use noirbft_abci::{Client, SocketClient};
use noirbft_blocksync::{BlockPool, BlockPoolConfig};
use noirbft_config::Config;
use noirbft_consensus::{BlockExecutor, ConsensusState, NoopMempool, Reactor as ConsensusReactor};
use noirbft_core_types::{GenesisDoc, NodeId, PrivValidator, PrivateKey};
use noirbft_evidence::{Pool as EvidencePool, PoolConfig, Reactor as EvidenceReactor};
use noirbft_p2p::{
    core_channel_descriptors, MConnConfig, NodeInfo, PeerManager, PeerManagerConfig, Router,
    RouterHandle,
};
use noirbft_store::{BlockStore, State, StateStore};
use noirbft_wal::{Wal, WalOptions};

use crate::key::NodeKey;
use crate::sync_processor::SyncBlockProcessor;
use crate::Error;

/// Protocol versions spoken by this build.
const P2P_VERSION: u64 = 8;
const BLOCK_VERSION: u64 = 11;

/// Owns every subsystem. Construction wires them; `start` brings the node
/// up; `NodeHandle::stop` tears it down in dependency order.
pub struct Node {
    config: Config,
    genesis: GenesisDoc,
    home: PathBuf,
    node_key: NodeKey,
    priv_validator: Option<PrivValidator>,
}

pub struct NodeHandle {
    pub node_id: NodeId,
    router: Router,
    router_handle: RouterHandle,
    evidence_reactor: Arc<EvidenceReactor>,
    consensus_reactor: Arc<ConsensusReactor>,
    blocksync_reactor: Option<Arc<noirbft_blocksync::Reactor>>,
    consensus_task: JoinHandle<()>,
}

impl Node {
    pub fn new(
        config: Config,
        genesis: GenesisDoc,
        node_key: NodeKey,
        priv_validator_key: Option<PrivateKey>,
    ) -> Result<Self, Error> {
        genesis.validate()?;
        let home = if config.storage.home.as_os_str().is_empty() {
            PathBuf::from(".noir")
        } else {
            config.storage.home.clone()
        };
        Ok(Self {
            config,
            genesis,
            home,
            node_key,
            priv_validator: priv_validator_key.map(PrivValidator::new),
        })
    }

    /// Brings the whole node up and returns the handle that owns it.
    pub async fn start(self) -> Result<NodeHandle, Error> {
        let data_dir = self.home.join("data");
        std::fs::create_dir_all(&data_dir)?;

        // Stores and state.
        let block_store = BlockStore::open(data_dir.join("blockstore.redb"))?;
        let state_store = StateStore::open(data_dir.join("state.redb"))?;
        let state = match state_store.load()? {
            Some(state) => state,
            None => {
                let state = State::from_genesis(&self.genesis)?;
                state_store.bootstrap(&state)?;
                state
            }
        };

        // ABCI connection and handshake.
        let abci_address = noirbft_abci::Address::parse(&self.config.abci.address)?;
        let abci: Arc<dyn Client> = Arc::new(SocketClient::connect(&abci_address).await?);
        let state = handshake(&*abci, state, &state_store, &self.genesis).await?;

        // Evidence pool.
        let evidence_pool = Arc::new(EvidencePool::open(
            data_dir.join("evidence.redb"),
            PoolConfig {
                max_bytes: state.consensus_params.evidence.max_bytes,
            },
            state.clone(),
            state_store.clone(),
            block_store.clone(),
        )?);

        // Block executor over ABCI.
        let executor = Arc::new(BlockExecutor::new(
            Arc::clone(&abci),
            state_store.clone(),
            block_store.clone(),
            Arc::clone(&evidence_pool),
            Arc::new(NoopMempool),
            self.config.mempool.max_txs_per_block,
        ));

        // Transport: peer manager + router.
        let node_id = self.node_key.node_id();
        let peer_manager = Arc::new(PeerManager::new(PeerManagerConfig {
            max_connected: self.config.p2p.max_connected,
            dial_backoff_base: self.config.p2p.dial_backoff_base,
            max_retry_time: self.config.p2p.max_retry_time,
            max_retry_time_persistent: self.config.p2p.max_retry_time_persistent,
            reconnect_cooldown: self.config.p2p.reconnect_cooldown,
            ..PeerManagerConfig::default()
        }));
        for entry in &self.config.p2p.persistent_peers {
            match parse_peer_address(entry) {
                Ok((peer_id, address)) => peer_manager.add_address(peer_id, address, true),
                Err(e) => warn!("Skipping bad persistent peer `{entry}`: {e}"),
            }
        }

        let descriptors = core_channel_descriptors();
        let node_info = NodeInfo {
            p2p_version: P2P_VERSION,
            block_version: BLOCK_VERSION,
            app_version: state.consensus_params.version.app_version,
            node_id: node_id.clone(),
            listen_addr: self.config.p2p.listen_addr.to_string(),
            network: state.chain_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            channels: descriptors.iter().map(|d| d.id).collect(),
            moniker: self.config.moniker.clone(),
        };
        let router = Router::new(
            self.node_key.private_key.clone(),
            node_info,
            descriptors,
            MConnConfig {
                max_packet_msg_payload_size: self.config.p2p.max_packet_msg_payload_size.as_u64()
                    as usize,
                flush_throttle: self.config.p2p.flush_throttle_timeout,
                ping_interval: self.config.p2p.ping_interval,
                pong_timeout: self.config.p2p.pong_timeout,
            },
            Arc::clone(&peer_manager),
        );
        let router_handle = router.handle();

        // Reactors claim their channels before the listener opens.
        let evidence_reactor = Arc::new(EvidenceReactor::new(
            Arc::clone(&evidence_pool),
            router_handle.clone(),
        ));

        let (consensus_state, state_handle, events_rx) = ConsensusState::new(
            self.config.consensus.clone(),
            state.clone(),
            self.priv_validator.clone(),
            Wal::open(
                data_dir.join("cs_wal"),
                WalOptions {
                    rotate_size: self.config.wal.rotate_size.as_u64(),
                    num_files: self.config.wal.num_files,
                },
            )?,
            BlockExecutor::new(
                Arc::clone(&abci),
                state_store.clone(),
                block_store.clone(),
                Arc::clone(&evidence_pool),
                Arc::new(NoopMempool),
                self.config.mempool.max_txs_per_block,
            ),
            block_store.clone(),
            Arc::clone(&evidence_pool),
        );
        let consensus_reactor = Arc::new(ConsensusReactor::new(
            state_handle,
            router_handle.clone(),
            block_store.clone(),
            self.config.consensus.clone(),
        ));

        // Block-sync fast path, switched off once caught up.
        let blocksync_reactor = if self.config.block_sync.enable {
            let pool = Arc::new(BlockPool::new(
                state.next_height(),
                BlockPoolConfig {
                    max_total_requesters: self.config.block_sync.max_total_requesters,
                    max_pending_requests_per_peer: self
                        .config
                        .block_sync
                        .max_pending_requests_per_peer
                        as u32,
                    peer_timeout: self.config.block_sync.peer_timeout,
                },
            ));
            let processor = Arc::new(SyncBlockProcessor::new(
                Arc::clone(&executor),
                state_store.clone(),
                block_store.clone(),
                Arc::new(Mutex::new(state.clone())),
            ));
            Some(Arc::new(noirbft_blocksync::Reactor::new(
                pool,
                router_handle.clone(),
                block_store.clone(),
                processor,
                self.config.block_sync.request_interval,
            )))
        } else {
            None
        };

        // Open for business.
        let listener = TcpListener::bind(self.config.p2p.listen_addr).await?;
        info!(
            %node_id,
            listen = %self.config.p2p.listen_addr,
            chain = %state.chain_id,
            "Starting node"
        );
        router.start(listener);
        evidence_reactor.start();
        consensus_reactor.start(events_rx);

        // Consensus waits for block sync to catch up, when enabled.
        let consensus_task = match &blocksync_reactor {
            Some(reactor) => {
                reactor.start();
                let mut caught_up = reactor.caught_up_signal();
                let reactor = Arc::clone(reactor);
                tokio::spawn(async move {
                    while !*caught_up.borrow() {
                        if caught_up.changed().await.is_err() {
                            return;
                        }
                    }
                    reactor.stop();
                    if let Err(e) = consensus_state.run().await {
                        tracing::error!("Consensus halted: {e}");
                    }
                })
            }
            None => tokio::spawn(async move {
                if let Err(e) = consensus_state.run().await {
                    tracing::error!("Consensus halted: {e}");
                }
            }),
        };

        Ok(NodeHandle {
            node_id,
            router,
            router_handle,
            evidence_reactor,
            consensus_reactor,
            blocksync_reactor,
            consensus_task,
        })
    }
}

impl NodeHandle {
    pub fn router(&self) -> &RouterHandle {
        &self.router_handle
    }

    /// Ordered shutdown: transport first, then reactors, then the state
    /// machine.
    pub async fn stop(self) {
        self.router.stop();
        if let Some(reactor) = &self.blocksync_reactor {
            reactor.stop();
        }
        self.evidence_reactor.stop();
        self.consensus_reactor.stop();
        self.consensus_task.abort();
        let _ = self.consensus_task.await;
        info!("Node stopped");
    }
}

/// Compares our persisted state with the application's and initializes a
/// fresh chain via `init_chain`.
async fn handshake(
    abci: &dyn Client,
    mut state: State,
    state_store: &StateStore,
    genesis: &GenesisDoc,
) -> Result<State, Error> {
    let info = abci
        .info(noirbft_abci::RequestInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            block_version: BLOCK_VERSION,
            p2p_version: P2P_VERSION,
        })
        .await?;

    info!(
        app = %info.data,
        app_height = info.last_block_height,
        our_height = %state.last_block_height,
        "ABCI handshake"
    );

    if state.is_empty() && info.last_block_height == 0 {
        let response = abci
            .init_chain(noirbft_abci::RequestInitChain {
                time: genesis.genesis_time.as_nanos(),
                chain_id: genesis.chain_id.clone(),
                consensus_params: Some(
                    noirbft_proto::Protobuf::to_proto(&genesis.consensus_params)
                        .map_err(noirbft_core_types::Error::Proto)?,
                ),
                validators: Vec::new(),
                app_state_bytes: serde_json_bytes(&genesis.app_state),
                initial_height: genesis.initial_height().as_i64(),
            })
            .await?;

        if !response.app_hash.is_empty() {
            state.app_hash = response.app_hash;
        }
        state_store.save(&state)?;
        return Ok(state);
    }

    if info.last_block_height == state.last_block_height.as_i64() {
        return Ok(state);
    }

    // The only tolerated divergence is the app trailing by the block whose
    // commit was cut short; WAL replay will re-drive it.
    if info.last_block_height == state.last_block_height.as_i64() + 1 {
        warn!("Application is one height ahead; assuming replayed commit");
        return Ok(state);
    }

    Err(Error::Config(format!(
        "application at height {} but chain state at {}; manual intervention required",
        info.last_block_height, state.last_block_height
    )))
}

fn serde_json_bytes(value: &serde_json::Value) -> Vec<u8> {
    if value.is_null() {
        Vec::new()
    } else {
        serde_json::to_vec(value).unwrap_or_default()
    }
}

/// Parses `id@host:port`.
fn parse_peer_address(entry: &str) -> Result<(NodeId, String), Error> {
    let (id, address) = entry
        .split_once('@')
        .ok_or_else(|| Error::Config(format!("peer address `{entry}` missing `id@`")))?;
    let peer_id: NodeId = id
        .parse()
        .map_err(|e| Error::Config(format!("bad peer id in `{entry}`: {e}")))?;
    Ok((peer_id, address.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_address_parsing() {
        let id = "ab".repeat(20);
        let (peer_id, address) = parse_peer_address(&format!("{id}@127.0.0.1:26656")).unwrap();
        assert_eq!(peer_id.to_string(), id);
        assert_eq!(address, "127.0.0.1:26656");

        assert!(parse_peer_address("127.0.0.1:26656").is_err());
        assert!(parse_peer_address("nothex@127.0.0.1:26656").is_err());
    }
}
