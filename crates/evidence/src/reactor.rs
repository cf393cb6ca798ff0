use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use tokio::sync::watch;
use tracing::{debug, warn};

use noirbft_core_types::{Evidence, EvidenceList};
use noirbft_p2p::{channels, Envelope, RouterHandle};
use noirbft_proto as proto;
use noirbft_proto::Protobuf;

use crate::Pool;

/// Cadence of the per-peer evidence broadcast.
const BROADCAST_INTERVAL: Duration = Duration::from_secs(10);

/// Penalty applied to peers that send evidence that fails verification.
const INVALID_EVIDENCE_PENALTY: i64 = 5;

/// Gossips pending evidence to every peer and admits evidence received
/// from the network into the pool.
pub struct Reactor {
    pool: Arc<Pool>,
    router: RouterHandle,
    cancel: watch::Sender<bool>,
}

impl Reactor {
    pub fn new(pool: Arc<Pool>, router: RouterHandle) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            pool,
            router,
            cancel,
        }
    }

    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Spawns the inbound handler and the broadcast ticker.
    pub fn start(&self) {
        let pool = Arc::clone(&self.pool);
        let router = self.router.clone();
        let mut inbound = router.open_channel(channels::EVIDENCE);
        let mut cancel_rx = self.cancel.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    envelope = inbound.recv() => match envelope {
                        Some(envelope) => handle_envelope(&pool, &router, envelope),
                        None => break,
                    }
                }
            }
            debug!("Evidence inbound loop finished");
        });

        let pool = Arc::clone(&self.pool);
        let router = self.router.clone();
        let notify = self.pool.evidence_added();
        let mut cancel_rx = self.cancel.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {}
                    _ = notify.notified() => {}
                }
                broadcast_pending(&pool, &router);
            }
            debug!("Evidence broadcast loop finished");
        });
    }
}

fn handle_envelope(pool: &Arc<Pool>, router: &RouterHandle, envelope: Envelope) {
    let list = match proto::types::EvidenceList::decode(envelope.payload.as_ref())
        .map_err(proto::Error::from)
        .and_then(EvidenceList::from_proto)
    {
        Ok(list) => list,
        Err(e) => {
            warn!(peer = %envelope.from, "Undecodable evidence list: {e}");
            router
                .peer_manager()
                .report(&envelope.from, INVALID_EVIDENCE_PENALTY);
            return;
        }
    };

    for evidence in list.evidence {
        match pool.add_evidence(evidence) {
            Ok(true) => {}
            Ok(false) => {} // duplicate
            Err(crate::Error::Expired { .. }) => {
                // Peers legitimately gossip evidence close to its age
                // limit; expiry alone is not a violation.
            }
            Err(e) => {
                warn!(peer = %envelope.from, "Peer sent invalid evidence: {e}");
                router
                    .peer_manager()
                    .report(&envelope.from, INVALID_EVIDENCE_PENALTY);
            }
        }
    }
}

fn broadcast_pending(pool: &Arc<Pool>, router: &RouterHandle) {
    let pending: Vec<Evidence> = match pool.pending_evidence(i64::MAX) {
        Ok(pending) => pending,
        Err(e) => {
            warn!("Failed to read pending evidence: {e}");
            return;
        }
    };
    if pending.is_empty() {
        return;
    }

    let list = EvidenceList::new(pending);
    match list.to_proto() {
        Ok(list) => {
            let payload = Bytes::from(list.encode_to_vec());
            debug!(count = list.evidence.len(), "Broadcasting pending evidence");
            router.broadcast(channels::EVIDENCE, payload);
        }
        Err(e) => warn!("Failed to encode evidence list: {e}"),
    }
}
