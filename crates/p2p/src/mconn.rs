//! Multiplexed connection: many prioritized logical channels over one
//! secret connection.
//!
//! A sender task slices queued messages into `PacketMsg` frames, always
//! draining the least-recently-serviced channel relative to its priority.
//! A receiver task reassembles packets into complete messages and emits
//! them as events. Liveness is enforced with ping/pong probes.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use noirbft_proto::p2p::{packet, Packet, PacketMsg, PacketPing, PacketPong};

use crate::secret_connection::{SecretConnection, SecretReadHalf, SecretWriteHalf};
use crate::{ChannelDescriptor, ChannelId, Error};

/// How often `recently_sent` counters decay.
const STATS_INTERVAL: Duration = Duration::from_secs(2);
/// Packets written per send-loop wakeup before re-selecting a channel.
const NUM_BATCH_PACKET_MSGS: usize = 10;

#[derive(Copy, Clone, Debug)]
pub struct MConnConfig {
    pub max_packet_msg_payload_size: usize,
    pub flush_throttle: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for MConnConfig {
    fn default() -> Self {
        Self {
            max_packet_msg_payload_size: 1400,
            flush_throttle: Duration::from_millis(100),
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(45),
        }
    }
}

/// Events surfaced to the connection's owner (the router's peer task).
#[derive(Debug)]
pub enum MConnEvent {
    /// A complete message arrived on a channel.
    Received { channel: ChannelId, payload: Bytes },
    /// The connection died; the peer should be disconnected.
    Failed(Error),
}

enum SendCmd {
    Msg { channel: ChannelId, payload: Bytes },
    Pong,
    PongReceived,
    Flush,
}

/// Handle to a running multiplexed connection.
pub struct MConn {
    send_tx: mpsc::Sender<SendCmd>,
    cancel: watch::Sender<bool>,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

impl MConn {
    /// Spawns the send and receive loops over an authenticated connection.
    pub fn spawn<S>(
        conn: SecretConnection<S>,
        descriptors: Vec<ChannelDescriptor>,
        config: MConnConfig,
    ) -> (Self, mpsc::Receiver<MConnEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = conn.into_split();
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (send_tx, send_rx) = mpsc::channel(1024);
        let (cancel, cancel_rx) = watch::channel(false);

        let send_channels: BTreeMap<ChannelId, SendChannel> = descriptors
            .iter()
            .map(|desc| (desc.id, SendChannel::new(desc.clone())))
            .collect();
        let recv_channels: BTreeMap<ChannelId, RecvChannel> = descriptors
            .iter()
            .map(|desc| (desc.id, RecvChannel::new(desc.clone())))
            .collect();

        let send_task = tokio::spawn(send_loop(
            write_half,
            send_channels,
            send_rx,
            event_tx.clone(),
            config,
            cancel_rx.clone(),
        ));
        let recv_task = tokio::spawn(recv_loop(
            read_half,
            recv_channels,
            send_tx.clone(),
            event_tx,
            cancel_rx,
        ));

        (
            Self {
                send_tx,
                cancel,
                send_task,
                recv_task,
            },
            event_rx,
        )
    }

    /// Queues `payload` for sending on `channel`.
    pub async fn send(&self, channel: ChannelId, payload: Bytes) -> Result<(), Error> {
        self.send_tx
            .send(SendCmd::Msg { channel, payload })
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Ordered stop: the receive loop drains, then the send loop flushes,
    /// then the underlying connection drops.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.recv_task.await;
        let _ = self.send_tx.send(SendCmd::Flush).await;
        drop(self.send_tx);
        let _ = self.send_task.await;
    }
}

struct SendChannel {
    desc: ChannelDescriptor,
    queue: VecDeque<Bytes>,
    /// The message currently being sliced into packets.
    sending: Option<(Bytes, usize)>,
    recently_sent: u64,
}

impl SendChannel {
    fn new(desc: ChannelDescriptor) -> Self {
        Self {
            desc,
            queue: VecDeque::new(),
            sending: None,
            recently_sent: 0,
        }
    }

    fn is_send_pending(&self) -> bool {
        self.sending.is_some() || !self.queue.is_empty()
    }

    /// Pops the next packet-worth of bytes off the in-flight message.
    fn next_packet(&mut self, max_payload: usize) -> Option<PacketMsg> {
        if self.sending.is_none() {
            self.sending = self.queue.pop_front().map(|payload| (payload, 0));
        }
        let (payload, offset) = self.sending.as_mut()?;

        let remaining = payload.len() - *offset;
        let take = remaining.min(max_payload);
        let data = payload.slice(*offset..*offset + take);
        *offset += take;
        let eof = *offset >= payload.len();

        let packet = PacketMsg {
            channel_id: self.desc.id.0 as i32,
            eof,
            data,
        };
        if eof {
            self.sending = None;
        }
        self.recently_sent += take as u64 + 8;
        Some(packet)
    }
}

/// Selects the channel that deserves the next packet: lowest
/// `recently_sent / priority` ratio among channels with pending data.
fn select_channel(channels: &BTreeMap<ChannelId, SendChannel>) -> Option<ChannelId> {
    channels
        .values()
        .filter(|ch| ch.is_send_pending())
        .min_by(|a, b| {
            let ratio_a = a.recently_sent as f64 / a.desc.priority.max(1) as f64;
            let ratio_b = b.recently_sent as f64 / b.desc.priority.max(1) as f64;
            ratio_a.total_cmp(&ratio_b)
        })
        .map(|ch| ch.desc.id)
}

async fn write_packet<S>(
    write_half: &mut SecretWriteHalf<S>,
    sum: packet::Sum,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let packet = Packet { sum: Some(sum) };
    write_half
        .write_chunk(&packet.encode_length_delimited_to_vec())
        .await
}

#[allow(clippy::too_many_lines)]
async fn send_loop<S>(
    mut write_half: SecretWriteHalf<S>,
    mut channels: BTreeMap<ChannelId, SendChannel>,
    mut send_rx: mpsc::Receiver<SendCmd>,
    event_tx: mpsc::Sender<MConnEvent>,
    config: MConnConfig,
    mut cancel: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut flush_ticker = interval(config.flush_throttle);
    flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping_ticker = interval(config.ping_interval);
    ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats_ticker = interval(STATS_INTERVAL);
    stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Deadline for an outstanding ping, if any.
    let mut pong_deadline: Option<Instant> = None;

    let fail = |event_tx: &mpsc::Sender<MConnEvent>, error: Error| {
        let event_tx = event_tx.clone();
        async move {
            let _ = event_tx.send(MConnEvent::Failed(error)).await;
        }
    };

    loop {
        let pong_sleep = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.changed() => {
                let _ = drain_pending(&mut write_half, &mut channels, &config).await;
                break;
            }

            cmd = send_rx.recv() => match cmd {
                Some(SendCmd::Msg { channel, payload }) => {
                    let Some(ch) = channels.get_mut(&channel) else {
                        fail(&event_tx, Error::UnknownChannel(channel)).await;
                        break;
                    };
                    if ch.queue.len() >= ch.desc.send_queue_capacity {
                        // The router applies the per-channel overflow
                        // policy before we ever get here; a full queue at
                        // this level means the peer cannot keep up.
                        warn!(%channel, "MConn send queue full, dropping message");
                        continue;
                    }
                    ch.queue.push_back(payload);
                    if let Err(e) = send_batch(&mut write_half, &mut channels, &config).await {
                        fail(&event_tx, e).await;
                        break;
                    }
                }
                Some(SendCmd::Pong) => {
                    if let Err(e) = write_packet(&mut write_half, packet::Sum::PacketPong(PacketPong {})).await {
                        fail(&event_tx, e).await;
                        break;
                    }
                }
                Some(SendCmd::PongReceived) => {
                    trace!("Pong received");
                    pong_deadline = None;
                }
                Some(SendCmd::Flush) => {
                    let _ = drain_pending(&mut write_half, &mut channels, &config).await;
                }
                None => {
                    let _ = drain_pending(&mut write_half, &mut channels, &config).await;
                    break;
                }
            },

            _ = flush_ticker.tick() => {
                if let Err(e) = send_batch(&mut write_half, &mut channels, &config).await {
                    fail(&event_tx, e).await;
                    break;
                }
            }

            _ = ping_ticker.tick() => {
                trace!("Sending ping");
                if let Err(e) = write_packet(&mut write_half, packet::Sum::PacketPing(PacketPing {})).await {
                    fail(&event_tx, e).await;
                    break;
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + config.pong_timeout);
                }
            }

            _ = stats_ticker.tick() => {
                for ch in channels.values_mut() {
                    ch.recently_sent /= 2;
                }
            }

            _ = pong_sleep => {
                fail(&event_tx, Error::PongTimeout).await;
                break;
            }
        }
    }
    debug!("MConn send loop finished");
}

async fn send_batch<S>(
    write_half: &mut SecretWriteHalf<S>,
    channels: &mut BTreeMap<ChannelId, SendChannel>,
    config: &MConnConfig,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for _ in 0..NUM_BATCH_PACKET_MSGS {
        let Some(channel) = select_channel(channels) else {
            return Ok(());
        };
        let packet = channels
            .get_mut(&channel)
            .and_then(|ch| ch.next_packet(config.max_packet_msg_payload_size));
        let Some(packet) = packet else {
            return Ok(());
        };
        write_packet(write_half, packet::Sum::PacketMsg(packet)).await?;
    }
    Ok(())
}

async fn drain_pending<S>(
    write_half: &mut SecretWriteHalf<S>,
    channels: &mut BTreeMap<ChannelId, SendChannel>,
    config: &MConnConfig,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while channels.values().any(SendChannel::is_send_pending) {
        send_batch(write_half, channels, config).await?;
    }
    Ok(())
}

struct RecvChannel {
    desc: ChannelDescriptor,
    recving: Vec<u8>,
}

impl RecvChannel {
    fn new(desc: ChannelDescriptor) -> Self {
        Self {
            desc,
            recving: Vec::new(),
        }
    }

    /// Appends one packet; returns the complete message on `eof`.
    fn recv_packet(&mut self, packet: PacketMsg) -> Result<Option<Bytes>, Error> {
        if self.recving.len() + packet.data.len() > self.desc.recv_message_capacity {
            return Err(Error::RecvCapacityExceeded(self.desc.id));
        }
        self.recving.extend_from_slice(&packet.data);
        if packet.eof {
            let message = Bytes::from(std::mem::take(&mut self.recving));
            return Ok(Some(message));
        }
        Ok(None)
    }
}

async fn recv_loop<S>(
    mut read_half: SecretReadHalf<S>,
    mut channels: BTreeMap<ChannelId, RecvChannel>,
    send_tx: mpsc::Sender<SendCmd>,
    event_tx: mpsc::Sender<MConnEvent>,
    mut cancel: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Stream reassembly buffer: packets are varint length-delimited over
    // the decrypted frame stream.
    let mut buffer: Vec<u8> = Vec::new();
    // A buffer past this size cannot hold a legal packet prefix.
    let max_buffered = channels
        .values()
        .map(|ch| ch.desc.recv_message_capacity)
        .max()
        .unwrap_or(0)
        + 64 * 1024;

    loop {
        // Decode as many packets as the buffer holds.
        loop {
            let mut slice = buffer.as_slice();
            let packet = match Packet::decode_length_delimited(&mut slice) {
                Ok(packet) => {
                    let consumed = buffer.len() - slice.len();
                    buffer.drain(..consumed);
                    packet
                }
                Err(_) => break, // need more bytes
            };

            match packet.sum {
                Some(packet::Sum::PacketPing(_)) => {
                    trace!("Ping received, queueing pong");
                    if send_tx.send(SendCmd::Pong).await.is_err() {
                        return;
                    }
                }
                Some(packet::Sum::PacketPong(_)) => {
                    if send_tx.send(SendCmd::PongReceived).await.is_err() {
                        return;
                    }
                }
                Some(packet::Sum::PacketMsg(msg)) => {
                    let channel = ChannelId(msg.channel_id as u8);
                    let Some(ch) = channels.get_mut(&channel) else {
                        let _ = event_tx
                            .send(MConnEvent::Failed(Error::UnknownChannel(channel)))
                            .await;
                        return;
                    };
                    match ch.recv_packet(msg) {
                        Ok(Some(payload)) => {
                            if event_tx
                                .send(MConnEvent::Received { channel, payload })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = event_tx.send(MConnEvent::Failed(e)).await;
                            return;
                        }
                    }
                }
                None => {
                    let _ = event_tx
                        .send(MConnEvent::Failed(Error::MalformedFrame(
                            "empty packet".to_string(),
                        )))
                        .await;
                    return;
                }
            }
        }

        tokio::select! {
            _ = cancel.changed() => {
                debug!("MConn recv loop cancelled");
                return;
            }
            chunk = read_half.read_chunk() => match chunk {
                Ok(chunk) => {
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() > max_buffered {
                        let _ = event_tx
                            .send(MConnEvent::Failed(Error::MalformedFrame(
                                "undecodable packet stream".to_string(),
                            )))
                            .await;
                        return;
                    }
                }
                Err(e) => {
                    let _ = event_tx.send(MConnEvent::Failed(e)).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels;
    use crate::secret_connection::SecretConnection;
    use noirbft_core_types::PrivateKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    async fn mconn_pair(
        config: MConnConfig,
    ) -> (MConn, mpsc::Receiver<MConnEvent>, MConn, mpsc::Receiver<MConnEvent>) {
        let key_a = PrivateKey::generate(StdRng::seed_from_u64(5));
        let key_b = PrivateKey::generate(StdRng::seed_from_u64(6));
        let (io_a, io_b) = tokio::io::duplex(256 * 1024);

        let (conn_a, conn_b) = tokio::try_join!(
            SecretConnection::handshake(io_a, &key_a),
            SecretConnection::handshake(io_b, &key_b),
        )
        .unwrap();

        let descriptors = crate::channel::core_channel_descriptors();
        let (mconn_a, events_a) = MConn::spawn(conn_a, descriptors.clone(), config);
        let (mconn_b, events_b) = MConn::spawn(conn_b, descriptors, config);
        (mconn_a, events_a, mconn_b, events_b)
    }

    async fn next_received(events: &mut mpsc::Receiver<MConnEvent>) -> (ChannelId, Bytes) {
        loop {
            match events.recv().await.expect("events channel open") {
                MConnEvent::Received { channel, payload } => return (channel, payload),
                MConnEvent::Failed(e) => panic!("connection failed: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn small_message_round_trip() {
        let (mconn_a, _events_a, _mconn_b, mut events_b) =
            mconn_pair(MConnConfig::default()).await;

        mconn_a
            .send(channels::CONSENSUS_VOTE, Bytes::from_static(b"vote!"))
            .await
            .unwrap();

        let (channel, payload) = next_received(&mut events_b).await;
        assert_eq!(channel, channels::CONSENSUS_VOTE);
        assert_eq!(payload, Bytes::from_static(b"vote!"));
    }

    #[tokio::test]
    async fn large_message_is_sliced_and_reassembled() {
        let (mconn_a, _events_a, _mconn_b, mut events_b) =
            mconn_pair(MConnConfig::default()).await;

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        mconn_a
            .send(channels::CONSENSUS_DATA, Bytes::from(payload.clone()))
            .await
            .unwrap();

        let (channel, received) = next_received(&mut events_b).await;
        assert_eq!(channel, channels::CONSENSUS_DATA);
        assert_eq!(received.to_vec(), payload);
    }

    #[tokio::test]
    async fn messages_on_one_channel_stay_ordered() {
        let (mconn_a, _events_a, _mconn_b, mut events_b) =
            mconn_pair(MConnConfig::default()).await;

        for i in 0..20u8 {
            mconn_a
                .send(channels::CONSENSUS_VOTE, Bytes::from(vec![i; 100]))
                .await
                .unwrap();
        }

        for i in 0..20u8 {
            loop {
                let (channel, payload) = next_received(&mut events_b).await;
                if channel == channels::CONSENSUS_VOTE {
                    assert_eq!(payload.to_vec(), vec![i; 100]);
                    break;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_fails_the_connection() {
        let config = MConnConfig {
            ping_interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(200),
            ..MConnConfig::default()
        };

        let key_a = PrivateKey::generate(StdRng::seed_from_u64(7));
        let key_b = PrivateKey::generate(StdRng::seed_from_u64(8));
        let (io_a, io_b) = tokio::io::duplex(256 * 1024);

        let (conn_a, conn_b) = tokio::try_join!(
            SecretConnection::handshake(io_a, &key_a),
            SecretConnection::handshake(io_b, &key_b),
        )
        .unwrap();

        // Peer B never answers: its connection is dropped outright.
        drop(conn_b);

        let (_mconn_a, mut events_a) =
            MConn::spawn(conn_a, crate::channel::core_channel_descriptors(), config);

        loop {
            match events_a.recv().await.expect("events open") {
                MConnEvent::Failed(_) => break,
                MConnEvent::Received { .. } => continue,
            }
        }
    }
}
