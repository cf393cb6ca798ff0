use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use noirbft_core_types::{Block, Height, NodeId};
use noirbft_p2p::{channels, Envelope, PeerStatus, RouterHandle};
use noirbft_proto as proto;
use noirbft_proto::Protobuf;
use noirbft_store::BlockStore;

use crate::pool::BlockPool;

/// Penalty for peers that send undecodable or unsolicited sync traffic.
const BAD_BLOCK_PENALTY: i64 = 10;

/// Cadence of the status broadcast while syncing.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// How the verified blocks leave the reactor: the node's block executor
/// implements this.
#[async_trait]
pub trait BlockProcessor: Send + Sync {
    /// Verifies `first` using `second`'s last-commit (which commits
    /// `first`) and applies it to the chain. An error means `first` or the
    /// commit inside `second` cannot be trusted.
    async fn process_block(&self, first: &Block, second: &Block) -> Result<(), String>;
}

/// Result of one processing step, used by tests and the caught-up check.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied,
    NothingToDo,
}

pub struct Reactor {
    pool: Arc<BlockPool>,
    router: RouterHandle,
    block_store: BlockStore,
    processor: Arc<dyn BlockProcessor>,
    request_interval: Duration,
    caught_up: watch::Sender<bool>,
    cancel: watch::Sender<bool>,
}

impl Reactor {
    pub fn new(
        pool: Arc<BlockPool>,
        router: RouterHandle,
        block_store: BlockStore,
        processor: Arc<dyn BlockProcessor>,
        request_interval: Duration,
    ) -> Self {
        let (caught_up, _) = watch::channel(false);
        let (cancel, _) = watch::channel(false);
        Self {
            pool,
            router,
            block_store,
            processor,
            request_interval,
            caught_up,
            cancel,
        }
    }

    /// Completes (flips to `true`) when the pool reaches the network tip
    /// and consensus should take over.
    pub fn caught_up_signal(&self) -> watch::Receiver<bool> {
        self.caught_up.subscribe()
    }

    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn start(&self) {
        self.spawn_inbound();
        self.spawn_request_loop();
        self.spawn_process_loop();
        self.spawn_status_loop();
    }

    fn spawn_inbound(&self) {
        let pool = Arc::clone(&self.pool);
        let router = self.router.clone();
        let block_store = self.block_store.clone();
        let mut inbound = router.open_channel(channels::BLOCK_SYNC);
        let mut cancel_rx = self.cancel.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    envelope = inbound.recv() => match envelope {
                        Some(envelope) => {
                            handle_envelope(&pool, &router, &block_store, envelope);
                        }
                        None => break,
                    }
                }
            }
            debug!("Block-sync inbound loop finished");
        });
    }

    /// Paces requester creation and dispatch, and evicts silent peers.
    fn spawn_request_loop(&self) {
        let pool = Arc::clone(&self.pool);
        let router = self.router.clone();
        let mut cancel_rx = self.cancel.subscribe();
        let interval = self.request_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let (evicted, redo) = pool.remove_timed_out_peers();
                for peer in evicted {
                    router.peer_manager().report(&peer, BAD_BLOCK_PENALTY);
                }
                for height in redo {
                    dispatch_request(&pool, &router, height);
                }

                for height in pool.unassigned_heights() {
                    dispatch_request(&pool, &router, height);
                }
                if let Some(height) = pool.make_next_requester() {
                    dispatch_request(&pool, &router, height);
                }
            }
            debug!("Block-sync request loop finished");
        });
    }

    /// Applies verified blocks in order and raises the caught-up signal.
    fn spawn_process_loop(&self) {
        let pool = Arc::clone(&self.pool);
        let router = self.router.clone();
        let processor = Arc::clone(&self.processor);
        let caught_up = self.caught_up.clone();
        let mut cancel_rx = self.cancel.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(10));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                while process_next(&pool, &router, processor.as_ref()).await
                    == ProcessOutcome::Applied
                {}

                if pool.is_caught_up() {
                    let height = pool.status().height;
                    info!(%height, "Block sync caught up, switching to consensus");
                    let _ = caught_up.send(true);
                    break;
                }
            }
            debug!("Block-sync process loop finished");
        });
    }

    fn spawn_status_loop(&self) {
        let router = self.router.clone();
        let pool = Arc::clone(&self.pool);
        let mut peer_updates = self.router.peer_manager().subscribe();
        let mut cancel_rx = self.cancel.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {
                        router.broadcast(channels::BLOCK_SYNC, encode_status_request());
                    }
                    update = peer_updates.recv() => match update {
                        Ok(update) if update.status == PeerStatus::Up => {
                            let _ = router.send(
                                &update.peer_id,
                                channels::BLOCK_SYNC,
                                encode_status_request(),
                            );
                        }
                        Ok(update) => {
                            pool.remove_peer(&update.peer_id);
                        }
                        Err(_) => break,
                    }
                }
            }
            debug!("Block-sync status loop finished");
        });
    }
}

fn dispatch_request(pool: &Arc<BlockPool>, router: &RouterHandle, height: Height) {
    let Some(peer) = pool.pick_available_peer(height) else {
        return;
    };
    debug!(%height, %peer, "Requesting block");
    let msg = proto::blocksync::Message {
        sum: Some(proto::blocksync::message::Sum::BlockRequest(
            proto::blocksync::BlockRequest {
                height: height.as_i64(),
            },
        )),
    };
    if router
        .send(&peer, channels::BLOCK_SYNC, Bytes::from(msg.encode_to_vec()))
        .is_err()
    {
        pool.redo_request(height);
    }
}

fn encode_status_request() -> Bytes {
    let msg = proto::blocksync::Message {
        sum: Some(proto::blocksync::message::Sum::StatusRequest(
            proto::blocksync::StatusRequest {},
        )),
    };
    Bytes::from(msg.encode_to_vec())
}

fn handle_envelope(
    pool: &Arc<BlockPool>,
    router: &RouterHandle,
    block_store: &BlockStore,
    envelope: Envelope,
) {
    let peer = envelope.from.clone();
    let msg = match proto::blocksync::Message::decode(envelope.payload.as_ref()) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(%peer, "Undecodable block-sync message: {e}");
            router.peer_manager().report(&peer, BAD_BLOCK_PENALTY);
            return;
        }
    };

    use proto::blocksync::message::Sum;
    match msg.sum {
        Some(Sum::BlockRequest(request)) => {
            let height = match Height::try_from(request.height) {
                Ok(height) => height,
                Err(_) => return,
            };
            let response = match block_store.load_block(height) {
                Ok(Some(block)) => match block.to_proto() {
                    Ok(block) => Sum::BlockResponse(proto::blocksync::BlockResponse {
                        block: Some(block),
                    }),
                    Err(e) => {
                        warn!(%height, "Failed to encode block: {e}");
                        return;
                    }
                },
                _ => Sum::NoBlockResponse(proto::blocksync::NoBlockResponse {
                    height: request.height,
                }),
            };
            let msg = proto::blocksync::Message {
                sum: Some(response),
            };
            let _ = router.send(&peer, channels::BLOCK_SYNC, Bytes::from(msg.encode_to_vec()));
        }

        Some(Sum::BlockResponse(response)) => {
            let Some(block) = response.block else {
                router.peer_manager().report(&peer, BAD_BLOCK_PENALTY);
                return;
            };
            let block = match Block::from_proto(block) {
                Ok(block) => block,
                Err(e) => {
                    warn!(%peer, "Undecodable block in response: {e}");
                    router.peer_manager().report(&peer, BAD_BLOCK_PENALTY);
                    return;
                }
            };
            if let Err(e) = pool.add_block(&peer, block) {
                debug!(%peer, "Rejected block response: {e}");
                router.peer_manager().report(&peer, BAD_BLOCK_PENALTY);
            }
        }

        Some(Sum::NoBlockResponse(response)) => {
            if let Ok(height) = Height::try_from(response.height) {
                debug!(%peer, %height, "Peer has no block, retrying elsewhere");
                pool.redo_request(height);
            }
        }

        Some(Sum::StatusRequest(_)) => {
            let height = block_store.height().ok().flatten().unwrap_or(Height::ZERO);
            let base = block_store.base().ok().flatten().unwrap_or(Height::ZERO);
            let msg = proto::blocksync::Message {
                sum: Some(Sum::StatusResponse(proto::blocksync::StatusResponse {
                    height: height.as_i64(),
                    base: base.as_i64(),
                })),
            };
            let _ = router.send(&peer, channels::BLOCK_SYNC, Bytes::from(msg.encode_to_vec()));
        }

        Some(Sum::StatusResponse(response)) => {
            let (Ok(base), Ok(height)) = (
                Height::try_from(response.base),
                Height::try_from(response.height),
            ) else {
                return;
            };
            pool.set_peer_range(peer, base, height);
        }

        None => {
            router.peer_manager().report(&peer, BAD_BLOCK_PENALTY);
        }
    }
}

/// Verifies and applies the block at the pool's current height, if both it
/// and its successor have arrived.
async fn process_next(
    pool: &Arc<BlockPool>,
    router: &RouterHandle,
    processor: &dyn BlockProcessor,
) -> ProcessOutcome {
    let Some((first, second)) = pool.peek_two_blocks() else {
        return ProcessOutcome::NothingToDo;
    };
    let first_height = first.header.height;

    match processor.process_block(&first, &second).await {
        Ok(()) => {
            pool.pop_request();
            ProcessOutcome::Applied
        }
        Err(reason) => {
            warn!(height = %first_height, "Block failed verification during sync: {reason}");
            // Either block could be at fault: retry both from other peers
            // and punish the senders.
            for height in [first_height, first_height.increment()] {
                if let Some(peer) = pool.redo_request(height) {
                    router.peer_manager().report(&peer, BAD_BLOCK_PENALTY);
                    pool.remove_peer(&peer);
                }
            }
            ProcessOutcome::NothingToDo
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_request_encodes() {
        let bytes = encode_status_request();
        let msg = proto::blocksync::Message::decode(bytes.as_ref()).unwrap();
        assert!(matches!(
            msg.sum,
            Some(proto::blocksync::message::Sum::StatusRequest(_))
        ));
    }
}
