use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use redb::ReadableTable;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use noirbft_core_types::{Evidence, EvidenceList, Timestamp};
use noirbft_proto::Protobuf;
use noirbft_store::{BlockStore, State, StateStore};

use crate::{verify, Error};

const PENDING_TABLE: redb::TableDefinition<'_, (i64, &[u8]), Vec<u8>> =
    redb::TableDefinition::new("pending");

const COMMITTED_TABLE: redb::TableDefinition<'_, (u64, &[u8]), ()> =
    redb::TableDefinition::new("committed");

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Upper bound on the total encoded size of evidence handed to a
    /// proposer.
    pub max_bytes: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1_048_576,
        }
    }
}

struct Inner {
    /// Pending evidence ordered by (time, hash): oldest gossips and
    /// proposes first.
    pending: BTreeMap<(i64, Vec<u8>), Evidence>,
    state: State,
}

/// Collects verified evidence until it is committed in a block, persisting
/// both the pending queue and the set of committed hashes.
pub struct Pool {
    config: PoolConfig,
    db: redb::Database,
    state_store: StateStore,
    block_store: BlockStore,
    inner: Mutex<Inner>,
    /// Pinged whenever new evidence lands, so the reactor can gossip it.
    evidence_added: Arc<Notify>,
}

impl Pool {
    pub fn open(
        path: impl AsRef<Path>,
        config: PoolConfig,
        state: State,
        state_store: StateStore,
        block_store: BlockStore,
    ) -> Result<Self, Error> {
        let db = redb::Database::create(path)?;
        let tx = db.begin_write()?;
        {
            tx.open_table(PENDING_TABLE)?;
            tx.open_table(COMMITTED_TABLE)?;
        }
        tx.commit()?;

        let pool = Self {
            config,
            db,
            state_store,
            block_store,
            inner: Mutex::new(Inner {
                pending: BTreeMap::new(),
                state,
            }),
            evidence_added: Arc::new(Notify::new()),
        };
        pool.load_pending()?;
        Ok(pool)
    }

    fn load_pending(&self) -> Result<(), Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(PENDING_TABLE)?;

        let mut inner = self.inner.lock().expect("evidence pool lock poisoned");
        for entry in table.iter()? {
            let (key, value) = entry?;
            match Evidence::from_bytes(&value.value()) {
                Ok(evidence) => {
                    let (time, hash) = key.value();
                    inner.pending.insert((time, hash.to_vec()), evidence);
                }
                Err(e) => warn!("Dropping undecodable pending evidence: {e}"),
            }
        }
        debug!(pending = inner.pending.len(), "Loaded pending evidence");
        Ok(())
    }

    pub fn evidence_added(&self) -> Arc<Notify> {
        Arc::clone(&self.evidence_added)
    }

    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().expect("evidence pool lock poisoned");
        inner.pending.len()
    }

    /// Verifies and admits one piece of evidence. Duplicates of pending or
    /// committed evidence are ignored without error.
    pub fn add_evidence(&self, evidence: Evidence) -> Result<bool, Error> {
        let hash = evidence.hash()?;

        {
            let inner = self.inner.lock().expect("evidence pool lock poisoned");
            let key = (evidence.time().as_nanos(), hash.clone());
            if inner.pending.contains_key(&key) {
                return Ok(false);
            }
        }
        if self.is_committed(evidence.height().as_u64(), &hash)? {
            return Ok(false);
        }

        {
            let inner = self.inner.lock().expect("evidence pool lock poisoned");
            verify::verify(&evidence, &inner.state, &self.state_store, &self.block_store)?;
        }

        let key = (evidence.time().as_nanos(), hash);
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(PENDING_TABLE)?;
            table.insert((key.0, key.1.as_slice()), evidence.to_bytes()?)?;
        }
        tx.commit()?;

        info!(height = %evidence.height(), "Added evidence to pool");
        {
            let mut inner = self.inner.lock().expect("evidence pool lock poisoned");
            inner.pending.insert(key, evidence);
        }
        self.evidence_added.notify_waiters();
        Ok(true)
    }

    /// Validates a block-proposed evidence list: everything must verify
    /// and must not already be committed.
    pub fn check_evidence(&self, list: &EvidenceList) -> Result<(), Error> {
        let mut total_bytes: i64 = 0;
        for evidence in &list.evidence {
            let hash = evidence.hash()?;
            if self.is_committed(evidence.height().as_u64(), &hash)? {
                return Err(Error::AlreadyCommitted);
            }
            total_bytes += evidence.byte_size()? as i64;
            if total_bytes > self.config.max_bytes {
                return Err(Error::Invalid(format!(
                    "evidence list exceeds {} bytes",
                    self.config.max_bytes
                )));
            }

            let inner = self.inner.lock().expect("evidence pool lock poisoned");
            verify::verify(evidence, &inner.state, &self.state_store, &self.block_store)?;
        }
        Ok(())
    }

    /// Oldest pending evidence, up to `max_bytes` of encoded size.
    pub fn pending_evidence(&self, max_bytes: i64) -> Result<Vec<Evidence>, Error> {
        let inner = self.inner.lock().expect("evidence pool lock poisoned");
        let mut result = Vec::new();
        let mut total: i64 = 0;
        for evidence in inner.pending.values() {
            total += evidence.byte_size()? as i64;
            if total > max_bytes {
                break;
            }
            result.push(evidence.clone());
        }
        Ok(result)
    }

    /// Called after every commit: marks the block's evidence as committed,
    /// adopts the new state, and prunes everything that has expired under
    /// the new tip.
    pub fn update(&self, state: State, committed: &EvidenceList) -> Result<(), Error> {
        let tx = self.db.begin_write()?;
        {
            let mut committed_table = tx.open_table(COMMITTED_TABLE)?;
            let mut pending_table = tx.open_table(PENDING_TABLE)?;
            let mut inner = self.inner.lock().expect("evidence pool lock poisoned");

            for evidence in &committed.evidence {
                let hash = evidence.hash()?;
                committed_table.insert((evidence.height().as_u64(), hash.as_slice()), ())?;

                let key = (evidence.time().as_nanos(), hash);
                if inner.pending.remove(&key).is_some() {
                    pending_table.remove((key.0, key.1.as_slice()))?;
                }
            }

            // Prune expired entries under the new tip.
            let params = state.consensus_params.evidence;
            let expired: Vec<(i64, Vec<u8>)> = inner
                .pending
                .iter()
                .filter(|(_, ev)| {
                    let age_blocks = state.last_block_height.as_i64() - ev.height().as_i64();
                    let age_time = state.last_block_time.elapsed_since(ev.time());
                    age_blocks > params.max_age_num_blocks || age_time > params.max_age_duration
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                debug!("Pruning expired evidence");
                inner.pending.remove(&key);
                pending_table.remove((key.0, key.1.as_slice()))?;
            }

            inner.state = state;
        }
        tx.commit()?;
        Ok(())
    }

    fn is_committed(&self, height: u64, hash: &[u8]) -> Result<bool, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(COMMITTED_TABLE)?;
        Ok(table.get((height, hash))?.is_some())
    }

    /// Builds duplicate-vote evidence out of a conflicting vote pair seen
    /// by the consensus state machine, and admits it.
    pub fn report_conflicting_votes(
        &self,
        vote_a: noirbft_core_types::Vote,
        vote_b: noirbft_core_types::Vote,
        block_time: Timestamp,
    ) -> Result<bool, Error> {
        let validators = self.state_store.load_validators(vote_a.height)?;
        let evidence = noirbft_core_types::DuplicateVoteEvidence::new(
            vote_a, vote_b, block_time, &validators,
        )?;
        self.add_evidence(Evidence::DuplicateVote(evidence))
    }
}
