//! Bookkeeping for parallel block download: which peers can serve which
//! heights, which heights have in-flight requests, and which blocks have
//! arrived and await verification.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use noirbft_core_types::{Block, Height, NodeId};

use crate::Error;

#[derive(Clone, Debug)]
pub struct BlockPoolConfig {
    pub max_total_requesters: usize,
    pub max_pending_requests_per_peer: u32,
    pub peer_timeout: Duration,
}

impl Default for BlockPoolConfig {
    fn default() -> Self {
        Self {
            max_total_requesters: 30,
            max_pending_requests_per_peer: 20,
            peer_timeout: Duration::from_secs(15),
        }
    }
}

/// A peer advertising blocks in `[base, height]`.
#[derive(Clone, Debug)]
struct BpPeer {
    base: Height,
    height: Height,
    num_pending: u32,
    /// Deadline by which the peer must deliver something, armed while it
    /// has pending requests.
    deadline: Option<Instant>,
}

impl BpPeer {
    fn incr_pending(&mut self, timeout: Duration) {
        if self.num_pending == 0 {
            self.deadline = Some(Instant::now() + timeout);
        }
        self.num_pending += 1;
    }

    fn decr_pending(&mut self, timeout: Duration) {
        self.num_pending = self.num_pending.saturating_sub(1);
        if self.num_pending == 0 {
            self.deadline = None;
        } else {
            self.deadline = Some(Instant::now() + timeout);
        }
    }
}

/// Tracks one height until its block is verified and applied. The peer
/// changes across retries; the height never does.
#[derive(Clone, Debug)]
struct Requester {
    peer: Option<NodeId>,
    block: Option<Block>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub height: Height,
    pub num_pending: usize,
    pub num_requesters: usize,
    pub max_peer_height: Height,
}

struct Inner {
    /// Next height to be applied.
    height: Height,
    start_height: Height,
    max_peer_height: Height,
    peers: BTreeMap<NodeId, BpPeer>,
    requesters: BTreeMap<Height, Requester>,
    last_advance: Instant,
    /// Rolling sync-rate sample, updated every 100 blocks.
    last_hundred_start: Instant,
    last_sync_rate: f64,
}

pub struct BlockPool {
    config: BlockPoolConfig,
    inner: Mutex<Inner>,
}

impl BlockPool {
    pub fn new(start: Height, config: BlockPoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                height: start,
                start_height: start,
                max_peer_height: Height::ZERO,
                peers: BTreeMap::new(),
                requesters: BTreeMap::new(),
                last_advance: Instant::now(),
                last_hundred_start: Instant::now(),
                last_sync_rate: 0.0,
            }),
        }
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock().expect("block pool lock poisoned");
        PoolStatus {
            height: inner.height,
            num_pending: inner
                .requesters
                .values()
                .filter(|r| r.block.is_none())
                .count(),
            num_requesters: inner.requesters.len(),
            max_peer_height: inner.max_peer_height,
        }
    }

    /// Caught up when we are within one height of the best peer.
    pub fn is_caught_up(&self) -> bool {
        let inner = self.inner.lock().expect("block pool lock poisoned");
        if inner.peers.is_empty() {
            return false;
        }
        inner.height.as_u64() + 1 >= inner.max_peer_height.as_u64()
    }

    pub fn sync_rate(&self) -> f64 {
        let inner = self.inner.lock().expect("block pool lock poisoned");
        inner.last_sync_rate
    }

    /// Records a peer's advertised `[base, height]` range.
    pub fn set_peer_range(&self, peer: NodeId, base: Height, height: Height) {
        let mut inner = self.inner.lock().expect("block pool lock poisoned");
        inner
            .peers
            .entry(peer)
            .and_modify(|p| {
                p.base = base;
                p.height = height;
            })
            .or_insert(BpPeer {
                base,
                height,
                num_pending: 0,
                deadline: None,
            });
        inner.max_peer_height = inner
            .peers
            .values()
            .map(|p| p.height)
            .max()
            .unwrap_or(Height::ZERO);
    }

    /// Drops a peer and returns the heights whose requests must be
    /// re-dispatched.
    pub fn remove_peer(&self, peer: &NodeId) -> Vec<Height> {
        let mut inner = self.inner.lock().expect("block pool lock poisoned");
        Self::remove_peer_locked(&mut inner, peer)
    }

    fn remove_peer_locked(inner: &mut Inner, peer: &NodeId) -> Vec<Height> {
        if inner.peers.remove(peer).is_none() {
            return Vec::new();
        }
        inner.max_peer_height = inner
            .peers
            .values()
            .map(|p| p.height)
            .max()
            .unwrap_or(Height::ZERO);

        let mut redo = Vec::new();
        for (&height, requester) in inner.requesters.iter_mut() {
            if requester.peer.as_ref() == Some(peer) && requester.block.is_none() {
                requester.peer = None;
                redo.push(height);
            }
        }
        redo
    }

    /// Evicts peers that have sat on pending requests past the timeout.
    /// Returns `(evicted peers, heights to re-dispatch)`.
    pub fn remove_timed_out_peers(&self) -> (Vec<NodeId>, Vec<Height>) {
        let mut inner = self.inner.lock().expect("block pool lock poisoned");
        let now = Instant::now();

        let timed_out: Vec<NodeId> = inner
            .peers
            .iter()
            .filter(|(_, peer)| peer.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(peer_id, _)| peer_id.clone())
            .collect();

        let mut redo = Vec::new();
        for peer_id in &timed_out {
            warn!(peer = %peer_id, "Peer did not send us anything for a while, evicting");
            redo.extend(Self::remove_peer_locked(&mut inner, peer_id));
        }
        (timed_out, redo)
    }

    /// Spawns the requester for the next un-requested height, if limits
    /// allow. Returns the height to ask for.
    pub fn make_next_requester(&self) -> Option<Height> {
        let mut inner = self.inner.lock().expect("block pool lock poisoned");
        if inner.requesters.len() >= self.config.max_total_requesters {
            return None;
        }
        let next = Height::new(inner.height.as_u64() + inner.requesters.len() as u64);
        if inner.max_peer_height < next {
            return None;
        }
        inner.requesters.insert(
            next,
            Requester {
                peer: None,
                block: None,
            },
        );
        Some(next)
    }

    /// Picks a peer able to serve `height` with spare in-flight budget and
    /// charges the request to it.
    pub fn pick_available_peer(&self, height: Height) -> Option<NodeId> {
        let mut inner = self.inner.lock().expect("block pool lock poisoned");

        let peer_id = inner
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.base <= height
                    && height <= peer.height
                    && peer.num_pending < self.config.max_pending_requests_per_peer
            })
            .map(|(peer_id, _)| peer_id.clone())
            .next()?;

        let timeout = self.config.peer_timeout;
        if let Some(peer) = inner.peers.get_mut(&peer_id) {
            peer.incr_pending(timeout);
        }
        if let Some(requester) = inner.requesters.get_mut(&height) {
            requester.peer = Some(peer_id.clone());
        }
        Some(peer_id)
    }

    /// Stores a received block with the requester that asked for it.
    pub fn add_block(&self, peer: &NodeId, block: Block) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("block pool lock poisoned");
        let height = block.header.height;

        let requester = inner
            .requesters
            .get_mut(&height)
            .ok_or(Error::NoRequester(height))?;
        if requester.peer.as_ref() != Some(peer) {
            return Err(Error::UnsolicitedBlock {
                peer: peer.clone(),
                height,
            });
        }
        if requester.block.is_some() {
            return Ok(());
        }
        requester.block = Some(block);

        let timeout = self.config.peer_timeout;
        if let Some(bp_peer) = inner.peers.get_mut(peer) {
            bp_peer.decr_pending(timeout);
        }
        debug!(%height, peer = %peer, "Received block");
        Ok(())
    }

    /// The two consecutive blocks needed to commit the first of them.
    pub fn peek_two_blocks(&self) -> Option<(Block, Block)> {
        let inner = self.inner.lock().expect("block pool lock poisoned");
        let first = inner.requesters.get(&inner.height)?.block.clone()?;
        let second = inner
            .requesters
            .get(&inner.height.increment())?
            .block
            .clone()?;
        Some((first, second))
    }

    /// Drops the requester at the current height and advances. Every 100
    /// blocks the rolling sync rate is resampled.
    pub fn pop_request(&self) {
        let mut inner = self.inner.lock().expect("block pool lock poisoned");
        let height = inner.height;
        inner.requesters.remove(&height);
        inner.height = height.increment();
        inner.last_advance = Instant::now();

        let synced = inner.height.as_u64() - inner.start_height.as_u64();
        if synced % 100 == 0 && synced > 0 {
            let elapsed = inner.last_hundred_start.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                inner.last_sync_rate = 0.9 * inner.last_sync_rate + 0.1 * (100.0 / elapsed);
            }
            inner.last_hundred_start = Instant::now();
            info!(
                height = %inner.height,
                rate = format!("{:.0} blocks/s", inner.last_sync_rate),
                "Block sync progress"
            );
        }
    }

    /// Clears the requester at `height` for a retry with another peer.
    /// Returns the peer that failed us, if any.
    pub fn redo_request(&self, height: Height) -> Option<NodeId> {
        let mut inner = self.inner.lock().expect("block pool lock poisoned");
        let requester = inner.requesters.get_mut(&height)?;
        let failed_peer = requester.peer.take();
        requester.block = None;

        let timeout = self.config.peer_timeout;
        if let Some(peer_id) = &failed_peer {
            if let Some(peer) = inner.peers.get_mut(peer_id) {
                peer.decr_pending(timeout);
            }
        }
        failed_peer
    }

    /// Heights with a requester but no assigned peer.
    pub fn unassigned_heights(&self) -> Vec<Height> {
        let inner = self.inner.lock().expect("block pool lock poisoned");
        inner
            .requesters
            .iter()
            .filter(|(_, requester)| requester.peer.is_none())
            .map(|(&height, _)| height)
            .collect()
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        let inner = self.inner.lock().expect("block pool lock poisoned");
        inner.peers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noirbft_core_types::{
        Address, BlockId, Commit, Data, EvidenceList, Header, PartSetHeader, Round, Timestamp,
        Version,
    };

    fn node_id(n: u8) -> NodeId {
        format!("{:040x}", n as u128).parse().unwrap()
    }

    pub(crate) fn make_block(height: u64) -> Block {
        let data = Data::default();
        let evidence = EvidenceList::default();
        let last_commit = Commit::new(
            Height::new(height.saturating_sub(1)),
            Round::new(0),
            BlockId::new(vec![1; 32], PartSetHeader::new(1, vec![1; 32])),
            Vec::new(),
        );
        let mut header = Header {
            version: Version { block: 11, app: 1 },
            chain_id: "sync-test".to_string(),
            height: Height::new(height),
            time: Timestamp::from_nanos(height as i64),
            last_block_id: BlockId::nil(),
            last_commit_hash: last_commit.hash().unwrap(),
            data_hash: data.hash(),
            validators_hash: Vec::new(),
            next_validators_hash: Vec::new(),
            consensus_hash: Vec::new(),
            app_hash: Vec::new(),
            last_results_hash: Vec::new(),
            evidence_hash: evidence.hash().unwrap(),
            proposer_address: Address::new([1; 20]),
        };
        header.evidence_hash = evidence.hash().unwrap();
        Block {
            header,
            data,
            evidence,
            last_commit,
        }
    }

    fn pool() -> BlockPool {
        BlockPool::new(
            Height::new(1),
            BlockPoolConfig {
                max_total_requesters: 5,
                max_pending_requests_per_peer: 2,
                peer_timeout: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn requesters_respect_limits() {
        let pool = pool();
        pool.set_peer_range(node_id(1), Height::new(1), Height::new(100));

        let mut heights = Vec::new();
        while let Some(height) = pool.make_next_requester() {
            heights.push(height);
        }
        // Capped by max_total_requesters.
        assert_eq!(
            heights,
            (1..=5).map(Height::new).collect::<Vec<_>>()
        );

        // Per-peer in-flight budget caps assignment.
        assert!(pool.pick_available_peer(Height::new(1)).is_some());
        assert!(pool.pick_available_peer(Height::new(2)).is_some());
        assert!(pool.pick_available_peer(Height::new(3)).is_none());
    }

    #[tokio::test]
    async fn peer_range_gates_requests() {
        let pool = pool();
        pool.set_peer_range(node_id(1), Height::new(10), Height::new(20));

        // Peer cannot serve height 1.
        pool.make_next_requester().unwrap();
        assert!(pool.pick_available_peer(Height::new(1)).is_none());
    }

    #[tokio::test]
    async fn two_blocks_peek_and_advance() {
        let pool = pool();
        pool.set_peer_range(node_id(1), Height::new(1), Height::new(100));

        for _ in 0..2 {
            let height = pool.make_next_requester().unwrap();
            let peer = pool.pick_available_peer(height).unwrap();
            pool.add_block(&peer, make_block(height.as_u64())).unwrap();
        }

        let (first, second) = pool.peek_two_blocks().unwrap();
        assert_eq!(first.header.height, Height::new(1));
        assert_eq!(second.header.height, Height::new(2));

        pool.pop_request();
        assert_eq!(pool.status().height, Height::new(2));
        assert!(pool.peek_two_blocks().is_none());
    }

    #[tokio::test]
    async fn unsolicited_blocks_rejected() {
        let pool = pool();
        pool.set_peer_range(node_id(1), Height::new(1), Height::new(100));
        pool.set_peer_range(node_id(2), Height::new(1), Height::new(100));

        let height = pool.make_next_requester().unwrap();
        let peer = pool.pick_available_peer(height).unwrap();
        let other = if peer == node_id(1) { node_id(2) } else { node_id(1) };

        assert!(matches!(
            pool.add_block(&other, make_block(height.as_u64())),
            Err(Error::UnsolicitedBlock { .. })
        ));
        assert!(matches!(
            pool.add_block(&peer, make_block(55)),
            Err(Error::NoRequester(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_peers_are_evicted() {
        let pool = pool();
        pool.set_peer_range(node_id(1), Height::new(1), Height::new(100));

        let height = pool.make_next_requester().unwrap();
        pool.pick_available_peer(height).unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        let (evicted, redo) = pool.remove_timed_out_peers();
        assert_eq!(evicted, vec![node_id(1)]);
        assert_eq!(redo, vec![height]);
        assert!(pool.peer_ids().is_empty());
    }

    #[tokio::test]
    async fn caught_up_near_max_peer_height() {
        let pool = pool();
        assert!(!pool.is_caught_up(), "no peers means not caught up");

        pool.set_peer_range(node_id(1), Height::new(1), Height::new(2));
        assert!(pool.is_caught_up(), "height 1 with peer at 2 is caught up");

        pool.set_peer_range(node_id(2), Height::new(1), Height::new(50));
        assert!(!pool.is_caught_up());
    }

    #[tokio::test]
    async fn redo_clears_requester_for_retry() {
        let pool = pool();
        pool.set_peer_range(node_id(1), Height::new(1), Height::new(100));

        let height = pool.make_next_requester().unwrap();
        let peer = pool.pick_available_peer(height).unwrap();
        pool.add_block(&peer, make_block(1)).unwrap();

        let failed = pool.redo_request(height).unwrap();
        assert_eq!(failed, peer);
        assert_eq!(pool.unassigned_heights(), vec![height]);
        assert!(pool.peek_two_blocks().is_none());

        // The height can be assigned again.
        assert!(pool.pick_available_peer(height).is_some());
    }
}
