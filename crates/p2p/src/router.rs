//! Routes channel traffic between reactors and connected peers.
//!
//! One send pump and one receive task run per connected peer. Inbound
//! messages are demultiplexed by channel id into the queue a reactor
//! opened for that channel; outbound messages go through a bounded
//! per-(peer, channel) queue with the channel's overflow policy before
//! entering the MConn.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use noirbft_core_types::{NodeId, PrivateKey};
use noirbft_proto::Protobuf;

use crate::channel::{ChannelDescriptor, ChannelId, OverflowPolicy};
use crate::mconn::{MConn, MConnConfig, MConnEvent};
use crate::node_info::NodeInfo;
use crate::peer_manager::PeerManager;
use crate::secret_connection::SecretConnection;
use crate::Error;

/// A message delivered to a reactor, tagged with its source peer.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: NodeId,
    pub channel: ChannelId,
    pub payload: Bytes,
}

struct PeerHandle {
    outbound: mpsc::UnboundedSender<(ChannelId, Bytes)>,
    cancel: watch::Sender<bool>,
}

struct Inner {
    node_key: PrivateKey,
    node_info: NodeInfo,
    descriptors: Vec<ChannelDescriptor>,
    mconn_config: MConnConfig,
    peer_manager: Arc<PeerManager>,
    peers: Mutex<BTreeMap<NodeId, PeerHandle>>,
    channel_queues: Mutex<BTreeMap<ChannelId, mpsc::Sender<Envelope>>>,
}

/// Cloneable handle used by reactors to talk to peers.
#[derive(Clone)]
pub struct RouterHandle {
    inner: Arc<Inner>,
}

impl RouterHandle {
    /// Claims the inbound queue for a channel. Each channel can be claimed
    /// once; reopening replaces the previous queue.
    pub fn open_channel(&self, channel: ChannelId) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(1024);
        let mut queues = self
            .inner
            .channel_queues
            .lock()
            .expect("router lock poisoned");
        queues.insert(channel, tx);
        rx
    }

    /// Sends to one peer. Backpressure is absorbed by the per-peer queue;
    /// overflow follows the channel's policy.
    pub fn send(&self, to: &NodeId, channel: ChannelId, payload: Bytes) -> Result<(), Error> {
        let peers = self.inner.peers.lock().expect("router lock poisoned");
        let peer = peers
            .get(to)
            .ok_or_else(|| Error::PeerNotConnected(to.clone()))?;
        peer.outbound
            .send((channel, payload))
            .map_err(|_| Error::PeerNotConnected(to.clone()))
    }

    /// Sends to every connected peer.
    pub fn broadcast(&self, channel: ChannelId, payload: Bytes) {
        let peers = self.inner.peers.lock().expect("router lock poisoned");
        for peer in peers.values() {
            let _ = peer.outbound.send((channel, payload.clone()));
        }
    }

    pub fn peers(&self) -> Vec<NodeId> {
        let peers = self.inner.peers.lock().expect("router lock poisoned");
        peers.keys().cloned().collect()
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.inner.peer_manager
    }

    /// Tears down one peer connection.
    pub fn disconnect(&self, peer_id: &NodeId) {
        let handle = {
            let mut peers = self.inner.peers.lock().expect("router lock poisoned");
            peers.remove(peer_id)
        };
        if let Some(handle) = handle {
            let _ = handle.cancel.send(true);
            self.inner.peer_manager.disconnected(peer_id);
        }
    }
}

pub struct Router {
    inner: Arc<Inner>,
    cancel: watch::Sender<bool>,
}

impl Router {
    pub fn new(
        node_key: PrivateKey,
        node_info: NodeInfo,
        descriptors: Vec<ChannelDescriptor>,
        mconn_config: MConnConfig,
        peer_manager: Arc<PeerManager>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                node_key,
                node_info,
                descriptors,
                mconn_config,
                peer_manager,
                peers: Mutex::new(BTreeMap::new()),
                channel_queues: Mutex::new(BTreeMap::new()),
            }),
            cancel,
        }
    }

    pub fn handle(&self) -> RouterHandle {
        RouterHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Spawns the accept, dial and evict loops on `listener`.
    pub fn start(&self, listener: TcpListener) {
        let inner = Arc::clone(&self.inner);
        let mut cancel_rx = self.cancel.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "Accepted connection");
                            let inner = Arc::clone(&inner);
                            tokio::spawn(async move {
                                if let Err(e) = connect_peer(inner, stream, None).await {
                                    debug!(%addr, "Inbound connection failed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Accept failed: {e}");
                        }
                    }
                }
            }
            debug!("Accept loop finished");
        });

        let inner = Arc::clone(&self.inner);
        let mut cancel_rx = self.cancel.subscribe();
        tokio::spawn(async move {
            loop {
                let dial = inner.peer_manager.dial_next();
                let (peer_id, address) = tokio::select! {
                    _ = cancel_rx.changed() => break,
                    next = dial => next,
                };

                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    match TcpStream::connect(&address).await {
                        Ok(stream) => {
                            let expected = peer_id.clone();
                            if let Err(e) =
                                connect_peer(Arc::clone(&inner), stream, Some(expected)).await
                            {
                                debug!(peer = %peer_id, "Dial handshake failed: {e}");
                                inner.peer_manager.dial_failed(&peer_id);
                            }
                        }
                        Err(e) => {
                            debug!(peer = %peer_id, %address, "Dial failed: {e}");
                            inner.peer_manager.dial_failed(&peer_id);
                        }
                    }
                });
            }
            debug!("Dial loop finished");
        });

        let inner = Arc::clone(&self.inner);
        let mut cancel_rx = self.cancel.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {
                        while let Some(peer_id) = inner.peer_manager.evict_next() {
                            info!(peer = %peer_id, "Evicting peer");
                            RouterHandle { inner: Arc::clone(&inner) }.disconnect(&peer_id);
                        }
                    }
                }
            }
            debug!("Evict loop finished");
        });
    }

    /// Stops the router: accept loop first, then every peer.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
        let peer_ids: Vec<NodeId> = {
            let peers = self.inner.peers.lock().expect("router lock poisoned");
            peers.keys().cloned().collect()
        };
        let handle = self.handle();
        for peer_id in peer_ids {
            handle.disconnect(&peer_id);
        }
    }
}

/// Full connection bring-up: secret handshake, node-info exchange, peer
/// manager registration, then the peer's send pump and receive task.
/// `expected` carries the dialed peer's id on outgoing connections.
async fn connect_peer(
    inner: Arc<Inner>,
    stream: TcpStream,
    expected: Option<NodeId>,
) -> Result<(), Error> {
    stream.set_nodelay(true)?;

    let mut conn = SecretConnection::handshake(stream, &inner.node_key).await?;

    // Node-info exchange over the encrypted stream.
    conn.write_chunk(&inner.node_info.to_proto()?.encode_to_vec())
        .await?;
    let their_info_bytes = conn.read_chunk().await?;
    let their_info = NodeInfo::from_proto(noirbft_proto::p2p::NodeInfo::decode(
        their_info_bytes.as_slice(),
    )?)?;

    inner.node_info.compatible_with(&their_info)?;

    // The claimed node id must match the authenticated key.
    let derived = NodeId::from_public_key(&conn.remote_pub_key());
    if derived != their_info.node_id {
        return Err(Error::Authentication(format!(
            "node id {} does not match key-derived id {derived}",
            their_info.node_id
        )));
    }
    let peer_id = derived;

    match &expected {
        Some(expected) => {
            // We dialed an address claiming to be `expected`.
            if expected != &peer_id {
                return Err(Error::Authentication(format!(
                    "dialed {expected} but authenticated as {peer_id}"
                )));
            }
            inner.peer_manager.dialed(&peer_id)?;
        }
        None => inner.peer_manager.accepted(peer_id.clone())?,
    }

    let (mconn, events) = MConn::spawn(conn, inner.descriptors.clone(), inner.mconn_config);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (peer_cancel, peer_cancel_rx) = watch::channel(false);

    {
        let mut peers = inner.peers.lock().expect("router lock poisoned");
        peers.insert(
            peer_id.clone(),
            PeerHandle {
                outbound: outbound_tx,
                cancel: peer_cancel,
            },
        );
    }
    inner.peer_manager.ready(&peer_id)?;

    tokio::spawn(peer_task(
        Arc::clone(&inner),
        peer_id,
        mconn,
        events,
        outbound_rx,
        peer_cancel_rx,
    ));
    Ok(())
}

/// Owns one peer's connection: pumps outbound queues into the MConn and
/// routes inbound events to the channel queues.
async fn peer_task(
    inner: Arc<Inner>,
    peer_id: NodeId,
    mconn: MConn,
    mut events: mpsc::Receiver<MConnEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<(ChannelId, Bytes)>,
    mut cancel: watch::Receiver<bool>,
) {
    let capacities: BTreeMap<ChannelId, (usize, OverflowPolicy)> = inner
        .descriptors
        .iter()
        .map(|desc| (desc.id, (desc.send_queue_capacity, desc.overflow_policy)))
        .collect();
    let mut queues: BTreeMap<ChannelId, std::collections::VecDeque<Bytes>> = BTreeMap::new();

    let failure = loop {
        // Drain one queued message, preferring not to block reception.
        let next = queues
            .iter_mut()
            .find_map(|(&channel, queue)| queue.front().cloned().map(|head| (channel, head)));

        if let Some((channel, payload)) = next {
            tokio::select! {
                _ = cancel.changed() => break None,
                sent = mconn.send(channel, payload) => {
                    match sent {
                        Ok(()) => {
                            if let Some(queue) = queues.get_mut(&channel) {
                                queue.pop_front();
                            }
                        }
                        Err(e) => break Some(e),
                    }
                }
                outbound = outbound_rx.recv() => match outbound {
                    Some((channel, payload)) => {
                        enqueue(&mut queues, &capacities, channel, payload);
                    }
                    None => break None,
                },
                event = events.recv() => {
                    if let Some(failure) = handle_event(&inner, &peer_id, event).await {
                        break failure;
                    }
                }
            }
        } else {
            tokio::select! {
                _ = cancel.changed() => break None,
                outbound = outbound_rx.recv() => match outbound {
                    Some((channel, payload)) => {
                        enqueue(&mut queues, &capacities, channel, payload);
                    }
                    None => break None,
                },
                event = events.recv() => {
                    if let Some(failure) = handle_event(&inner, &peer_id, event).await {
                        break failure;
                    }
                }
            }
        }
    };

    if let Some(error) = failure {
        warn!(peer = %peer_id, "Peer connection failed: {error}");
    }

    mconn.stop().await;

    let had_handle = {
        let mut peers = inner.peers.lock().expect("router lock poisoned");
        peers.remove(&peer_id).is_some()
    };
    if had_handle {
        inner.peer_manager.disconnected(&peer_id);
    }
    debug!(peer = %peer_id, "Peer task finished");
}

fn enqueue(
    queues: &mut BTreeMap<ChannelId, std::collections::VecDeque<Bytes>>,
    capacities: &BTreeMap<ChannelId, (usize, OverflowPolicy)>,
    channel: ChannelId,
    payload: Bytes,
) {
    let Some(&(capacity, policy)) = capacities.get(&channel) else {
        warn!(%channel, "Dropping message for unknown channel");
        return;
    };
    let queue = queues.entry(channel).or_default();
    if queue.len() >= capacity {
        match policy {
            OverflowPolicy::DropOldest => {
                queue.pop_front();
                queue.push_back(payload);
            }
            OverflowPolicy::DropNewest => {
                debug!(%channel, "Peer queue full, dropping newest message");
            }
        }
        return;
    }
    queue.push_back(payload);
}

/// Returns `Some(failure)` when the peer task must stop.
async fn handle_event(
    inner: &Arc<Inner>,
    peer_id: &NodeId,
    event: Option<MConnEvent>,
) -> Option<Option<Error>> {
    match event {
        Some(MConnEvent::Received { channel, payload }) => {
            let queue = {
                let queues = inner.channel_queues.lock().expect("router lock poisoned");
                queues.get(&channel).cloned()
            };
            match queue {
                Some(queue) => {
                    let envelope = Envelope {
                        from: peer_id.clone(),
                        channel,
                        payload,
                    };
                    if queue.send(envelope).await.is_err() {
                        debug!(%channel, "Reactor queue closed, dropping message");
                    }
                }
                None => {
                    debug!(%channel, "No reactor for channel, dropping message");
                }
            }
            None
        }
        Some(MConnEvent::Failed(error)) => Some(Some(error)),
        None => Some(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::core_channel_descriptors;
    use crate::channels;
    use crate::peer_manager::{PeerManagerConfig, PeerStatus};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn make_router(seed: u64) -> (Router, NodeId) {
        let key = PrivateKey::generate(StdRng::seed_from_u64(seed));
        let node_id = NodeId::from_public_key(&key.public_key());
        let info = NodeInfo {
            p2p_version: 8,
            block_version: 11,
            app_version: 1,
            node_id: node_id.clone(),
            listen_addr: "127.0.0.1:0".to_string(),
            network: "noir-test".to_string(),
            version: "0.1.0".to_string(),
            channels: core_channel_descriptors().iter().map(|d| d.id).collect(),
            moniker: format!("router-{seed}"),
        };
        let manager = Arc::new(PeerManager::new(PeerManagerConfig::default()));
        let router = Router::new(
            key,
            info,
            core_channel_descriptors(),
            MConnConfig::default(),
            manager,
        );
        (router, node_id)
    }

    #[tokio::test]
    async fn two_routers_exchange_messages() {
        let (router_a, id_a) = make_router(41);
        let (router_b, id_b) = make_router(42);

        let handle_a = router_a.handle();
        let handle_b = router_b.handle();
        let mut votes_a = handle_a.open_channel(channels::CONSENSUS_VOTE);
        let mut votes_b = handle_b.open_channel(channels::CONSENSUS_VOTE);

        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();

        let mut updates_b = handle_b.peer_manager().subscribe();

        router_a.start(listener_a);
        router_b.start(listener_b);

        handle_b
            .peer_manager()
            .add_address(id_a.clone(), addr_a.to_string(), true);

        // Wait for B to see A come up.
        let update = updates_b.recv().await.unwrap();
        assert_eq!(update.status, PeerStatus::Up);
        assert_eq!(update.peer_id, id_a);

        handle_b
            .send(&id_a, channels::CONSENSUS_VOTE, Bytes::from_static(b"hi a"))
            .unwrap();
        let envelope = votes_a.recv().await.unwrap();
        assert_eq!(envelope.from, id_b);
        assert_eq!(envelope.payload, Bytes::from_static(b"hi a"));

        handle_a.broadcast(channels::CONSENSUS_VOTE, Bytes::from_static(b"hi all"));
        let envelope = votes_b.recv().await.unwrap();
        assert_eq!(envelope.from, id_a);
        assert_eq!(envelope.payload, Bytes::from_static(b"hi all"));

        router_a.stop();
        router_b.stop();
    }

    #[tokio::test]
    async fn send_to_unconnected_peer_fails() {
        let (router, _) = make_router(50);
        let handle = router.handle();
        let ghost: NodeId = "ab".repeat(20).parse().unwrap();
        assert!(matches!(
            handle.send(&ghost, channels::CONSENSUS_VOTE, Bytes::new()),
            Err(Error::PeerNotConnected(_))
        ));
    }
}
