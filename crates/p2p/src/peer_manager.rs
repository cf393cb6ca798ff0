//! Source of truth for peer lifecycle: dialing, accepting, scoring,
//! backoff and eviction.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use noirbft_core_types::NodeId;

use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Lifecycle states a peer moves through.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// Known address, nothing in flight.
    Unknown,
    /// A dial attempt is in progress.
    Dialing,
    /// Transport established, handshake not yet validated.
    Connected(Direction),
    /// Fully handshaked; reactors may talk to it.
    Ready,
    /// Selected for removal; waiting for the router to drop it.
    Evicting,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    Up,
    Down,
}

/// Broadcast to subscribers whenever a peer goes up or down.
#[derive(Clone, Debug)]
pub struct PeerUpdate {
    pub peer_id: NodeId,
    pub status: PeerStatus,
}

#[derive(Clone, Debug)]
pub struct PeerManagerConfig {
    pub max_connected: usize,
    pub dial_backoff_base: Duration,
    pub max_retry_time: Duration,
    pub max_retry_time_persistent: Duration,
    pub reconnect_cooldown: Duration,
    /// Validation failures tolerated before the peer is marked for
    /// eviction.
    pub violation_budget: u32,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            max_connected: 40,
            dial_backoff_base: Duration::from_secs(1),
            max_retry_time: Duration::from_secs(10 * 60),
            max_retry_time_persistent: Duration::from_secs(20),
            reconnect_cooldown: Duration::from_secs(5),
            violation_budget: 10,
        }
    }
}

#[derive(Clone, Debug)]
struct PeerInfo {
    address: Option<String>,
    state: PeerState,
    persistent: bool,
    /// Persistent peers keep a fixed high score; everything else drifts
    /// with behavior.
    score: i64,
    dial_failures: u32,
    next_dial_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    violations: u32,
}

impl PeerInfo {
    fn new(address: Option<String>, persistent: bool) -> Self {
        Self {
            address,
            state: PeerState::Unknown,
            persistent,
            score: if persistent { i64::MAX } else { 0 },
            dial_failures: 0,
            next_dial_at: None,
            cooldown_until: None,
            violations: 0,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.state,
            PeerState::Connected(_) | PeerState::Ready | PeerState::Evicting
        )
    }
}

pub struct PeerManager {
    config: PeerManagerConfig,
    peers: Mutex<BTreeMap<NodeId, PeerInfo>>,
    wake: Notify,
    updates: broadcast::Sender<PeerUpdate>,
}

impl PeerManager {
    pub fn new(config: PeerManagerConfig) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            config,
            peers: Mutex::new(BTreeMap::new()),
            wake: Notify::new(),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerUpdate> {
        self.updates.subscribe()
    }

    /// Registers an address for a peer, from configuration or peer
    /// exchange.
    pub fn add_address(&self, peer_id: NodeId, address: String, persistent: bool) {
        let mut peers = self.peers.lock().expect("peer manager lock poisoned");
        let info = peers
            .entry(peer_id)
            .or_insert_with(|| PeerInfo::new(None, persistent));
        info.address = Some(address);
        info.persistent |= persistent;
        if info.persistent {
            info.score = i64::MAX;
        }
        drop(peers);
        self.wake.notify_waiters();
    }

    pub fn state(&self, peer_id: &NodeId) -> Option<PeerState> {
        let peers = self.peers.lock().expect("peer manager lock poisoned");
        peers.get(peer_id).map(|info| info.state)
    }

    pub fn connected_count(&self) -> usize {
        let peers = self.peers.lock().expect("peer manager lock poisoned");
        peers.values().filter(|info| info.is_connected()).count()
    }

    /// Blocks until a peer is due for dialing, then claims it. The caller
    /// must follow up with [`PeerManager::dialed`] or
    /// [`PeerManager::dial_failed`].
    pub async fn dial_next(&self) -> (NodeId, String) {
        loop {
            let now = Instant::now();
            let (candidate, next_wakeup) = self.pick_dial_candidate(now);
            if let Some((peer_id, address)) = candidate {
                return (peer_id, address);
            }

            match next_wakeup {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }

    fn pick_dial_candidate(&self, now: Instant) -> (Option<(NodeId, String)>, Option<Instant>) {
        let mut peers = self.peers.lock().expect("peer manager lock poisoned");

        let connected = peers.values().filter(|info| info.is_connected()).count();
        let dialing = peers
            .values()
            .filter(|info| info.state == PeerState::Dialing)
            .count();
        if connected + dialing >= self.config.max_connected {
            return (None, None);
        }

        let mut next_wakeup: Option<Instant> = None;
        let mut best: Option<(NodeId, String, i64)> = None;

        for (peer_id, info) in peers.iter() {
            if info.state != PeerState::Unknown {
                continue;
            }
            let Some(address) = &info.address else {
                continue;
            };

            let due_at = [info.next_dial_at, info.cooldown_until]
                .into_iter()
                .flatten()
                .max();
            if let Some(due_at) = due_at {
                if due_at > now {
                    next_wakeup = Some(next_wakeup.map_or(due_at, |w| w.min(due_at)));
                    continue;
                }
            }

            let better = match &best {
                None => true,
                Some((_, _, best_score)) => info.score > *best_score,
            };
            if better {
                best = Some((peer_id.clone(), address.clone(), info.score));
            }
        }

        if let Some((peer_id, address, _)) = best {
            let info = peers.get_mut(&peer_id).expect("candidate exists");
            info.state = PeerState::Dialing;
            debug!(peer = %peer_id, %address, "Claimed peer for dialing");
            return (Some((peer_id, address)), None);
        }
        (None, next_wakeup)
    }

    /// The dial succeeded at the transport level.
    pub fn dialed(&self, peer_id: &NodeId) -> Result<(), Error> {
        let mut peers = self.peers.lock().expect("peer manager lock poisoned");
        let info = peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::PeerNotConnected(peer_id.clone()))?;
        if info.state != PeerState::Dialing {
            return Err(Error::PeerNotConnected(peer_id.clone()));
        }
        info.state = PeerState::Connected(Direction::Outgoing);
        info.dial_failures = 0;
        info.next_dial_at = None;
        Ok(())
    }

    /// The dial failed; schedules the retry with geometric backoff.
    pub fn dial_failed(&self, peer_id: &NodeId) {
        let mut peers = self.peers.lock().expect("peer manager lock poisoned");
        if let Some(info) = peers.get_mut(peer_id) {
            info.state = PeerState::Unknown;
            info.dial_failures = info.dial_failures.saturating_add(1);

            let cap = if info.persistent {
                self.config.max_retry_time_persistent
            } else {
                self.config.max_retry_time
            };
            let backoff = self
                .config
                .dial_backoff_base
                .saturating_mul(1u32 << info.dial_failures.min(16))
                .min(cap);
            info.next_dial_at = Some(Instant::now() + backoff);
            debug!(peer = %peer_id, ?backoff, "Dial failed, backing off");
        }
        drop(peers);
        self.wake.notify_waiters();
    }

    /// An inbound connection completed its handshake as `peer_id`.
    pub fn accepted(&self, peer_id: NodeId) -> Result<(), Error> {
        let mut peers = self.peers.lock().expect("peer manager lock poisoned");

        let connected = peers.values().filter(|info| info.is_connected()).count();
        let info = peers
            .entry(peer_id.clone())
            .or_insert_with(|| PeerInfo::new(None, false));

        if info.is_connected() {
            return Err(Error::IncompatiblePeer(format!(
                "peer {peer_id} already connected"
            )));
        }
        if let Some(until) = info.cooldown_until {
            if until > Instant::now() {
                return Err(Error::IncompatiblePeer(format!(
                    "peer {peer_id} in reconnect cooldown"
                )));
            }
        }
        if connected >= self.config.max_connected {
            return Err(Error::IncompatiblePeer("at connection capacity".to_string()));
        }

        info.state = PeerState::Connected(Direction::Incoming);
        Ok(())
    }

    /// Node-info validated: the peer may carry traffic now.
    pub fn ready(&self, peer_id: &NodeId) -> Result<(), Error> {
        let mut peers = self.peers.lock().expect("peer manager lock poisoned");
        let info = peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::PeerNotConnected(peer_id.clone()))?;
        let PeerState::Connected(_) = info.state else {
            return Err(Error::PeerNotConnected(peer_id.clone()));
        };
        info.state = PeerState::Ready;
        info.violations = 0;
        drop(peers);

        info!(peer = %peer_id, "Peer ready");
        let _ = self.updates.send(PeerUpdate {
            peer_id: peer_id.clone(),
            status: PeerStatus::Up,
        });
        Ok(())
    }

    /// The connection went away, cleanly or not.
    pub fn disconnected(&self, peer_id: &NodeId) {
        let mut peers = self.peers.lock().expect("peer manager lock poisoned");
        let was_ready = match peers.get_mut(peer_id) {
            Some(info) => {
                let was_ready = matches!(info.state, PeerState::Ready | PeerState::Evicting);
                info.state = PeerState::Unknown;
                info.cooldown_until = Some(Instant::now() + self.config.reconnect_cooldown);
                was_ready
            }
            None => false,
        };
        drop(peers);

        if was_ready {
            info!(peer = %peer_id, "Peer down");
            let _ = self.updates.send(PeerUpdate {
                peer_id: peer_id.clone(),
                status: PeerStatus::Down,
            });
        }
        self.wake.notify_waiters();
    }

    /// Records a protocol violation. Once the budget is exhausted the peer
    /// is marked for eviction.
    pub fn report(&self, peer_id: &NodeId, penalty: i64) {
        let mut peers = self.peers.lock().expect("peer manager lock poisoned");
        let Some(info) = peers.get_mut(peer_id) else {
            return;
        };
        if !info.persistent {
            info.score = info.score.saturating_sub(penalty);
        }
        info.violations = info.violations.saturating_add(1);
        if info.violations > self.config.violation_budget && info.state == PeerState::Ready {
            warn!(peer = %peer_id, violations = info.violations, "Violation budget exhausted");
            info.state = PeerState::Evicting;
        }
    }

    /// The next peer that should be disconnected: any peer marked
    /// `Evicting`, or, above capacity, the worst-ranked ready peer.
    /// Ordering is deterministic: score, then incoming before outgoing,
    /// then node id.
    pub fn evict_next(&self) -> Option<NodeId> {
        let mut peers = self.peers.lock().expect("peer manager lock poisoned");

        if let Some((peer_id, _)) = peers
            .iter()
            .find(|(_, info)| info.state == PeerState::Evicting)
        {
            return Some(peer_id.clone());
        }

        let connected = peers.values().filter(|info| info.is_connected()).count();
        if connected <= self.config.max_connected {
            return None;
        }

        let victim = peers
            .iter()
            .filter_map(|(peer_id, info)| match info.state {
                PeerState::Ready => Some((info.score, peer_id.clone())),
                _ => None,
            })
            .min_by(|(score_a, id_a), (score_b, id_b)| {
                score_a.cmp(score_b).then_with(|| id_a.cmp(id_b))
            })
            .map(|(_, peer_id)| peer_id);

        if let Some(peer_id) = &victim {
            if let Some(info) = peers.get_mut(peer_id) {
                info.state = PeerState::Evicting;
            }
        }
        victim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id(n: u8) -> NodeId {
        format!("{:040x}", n as u128).parse().unwrap()
    }

    fn manager() -> PeerManager {
        PeerManager::new(PeerManagerConfig {
            max_connected: 2,
            dial_backoff_base: Duration::from_millis(10),
            max_retry_time: Duration::from_millis(100),
            max_retry_time_persistent: Duration::from_millis(40),
            reconnect_cooldown: Duration::from_millis(50),
            violation_budget: 2,
        })
    }

    #[tokio::test]
    async fn dial_claims_and_transitions() {
        let manager = manager();
        manager.add_address(node_id(1), "127.0.0.1:1000".to_string(), false);

        let (peer, address) = manager.dial_next().await;
        assert_eq!(peer, node_id(1));
        assert_eq!(address, "127.0.0.1:1000");
        assert_eq!(manager.state(&peer), Some(PeerState::Dialing));

        manager.dialed(&peer).unwrap();
        assert_eq!(
            manager.state(&peer),
            Some(PeerState::Connected(Direction::Outgoing))
        );

        manager.ready(&peer).unwrap();
        assert_eq!(manager.state(&peer), Some(PeerState::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dial_backs_off() {
        let manager = manager();
        manager.add_address(node_id(1), "addr".to_string(), false);

        let (peer, _) = manager.dial_next().await;
        let before = Instant::now();
        manager.dial_failed(&peer);

        let (peer, _) = manager.dial_next().await;
        assert_eq!(peer, node_id(1));
        // The backoff forced the auto-advancing clock forward.
        assert!(Instant::now() > before);
    }

    #[tokio::test]
    async fn updates_broadcast_up_and_down() {
        let manager = manager();
        let mut updates = manager.subscribe();

        manager.add_address(node_id(1), "addr".to_string(), false);
        let (peer, _) = manager.dial_next().await;
        manager.dialed(&peer).unwrap();
        manager.ready(&peer).unwrap();

        let up = updates.recv().await.unwrap();
        assert_eq!(up.status, PeerStatus::Up);

        manager.disconnected(&peer);
        let down = updates.recv().await.unwrap();
        assert_eq!(down.status, PeerStatus::Down);
    }

    #[tokio::test]
    async fn violation_budget_marks_eviction() {
        let manager = manager();
        manager.accepted(node_id(3)).unwrap();
        manager.ready(&node_id(3)).unwrap();

        manager.report(&node_id(3), 1);
        manager.report(&node_id(3), 1);
        assert_eq!(manager.evict_next(), None);

        manager.report(&node_id(3), 1);
        assert_eq!(manager.evict_next(), Some(node_id(3)));
        assert_eq!(manager.state(&node_id(3)), Some(PeerState::Evicting));
    }

    #[tokio::test]
    async fn capacity_rejects_new_inbound() {
        let manager = manager();
        manager.accepted(node_id(1)).unwrap();
        manager.accepted(node_id(2)).unwrap();
        assert!(manager.accepted(node_id(3)).is_err());
    }

    #[tokio::test]
    async fn duplicate_connection_rejected() {
        let manager = manager();
        manager.accepted(node_id(1)).unwrap();
        assert!(manager.accepted(node_id(1)).is_err());
    }

    #[tokio::test]
    async fn no_eviction_at_or_under_capacity() {
        let manager = manager();
        manager.accepted(node_id(1)).unwrap();
        manager.ready(&node_id(1)).unwrap();
        manager.accepted(node_id(2)).unwrap();
        manager.ready(&node_id(2)).unwrap();

        manager.report(&node_id(1), 5);
        assert_eq!(manager.evict_next(), None);
    }
}
