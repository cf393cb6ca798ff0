//! End-to-end runs of the consensus state machine with a single validator
//! and a stub application: blocks must be proposed, voted, committed and
//! persisted, across restarts.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;

use noirbft_abci::{Client, Error as AbciError};
use noirbft_config::ConsensusConfig;
use noirbft_consensus::{BlockExecutor, ConsensusState, NoopMempool};
use noirbft_core_types::{
    ConsensusParams, GenesisDoc, GenesisValidator, Height, PrivValidator, PrivateKey, Timestamp,
};
use noirbft_evidence::{Pool as EvidencePool, PoolConfig};
use noirbft_store::{BlockStore, State, StateStore};
use noirbft_wal::{SearchOptions, Wal, WalOptions};

/// Minimal application: accepts everything, tracks its height.
struct StubApp {
    height: AtomicI64,
}

#[async_trait]
impl Client for StubApp {
    async fn echo(&self, message: String) -> Result<noirbft_abci::ResponseEcho, AbciError> {
        Ok(noirbft_abci::ResponseEcho { message })
    }

    async fn flush(&self) -> Result<(), AbciError> {
        Ok(())
    }

    async fn info(
        &self,
        _req: noirbft_abci::RequestInfo,
    ) -> Result<noirbft_abci::ResponseInfo, AbciError> {
        Ok(noirbft_abci::ResponseInfo {
            data: "stub".to_string(),
            version: "1".to_string(),
            app_version: 1,
            last_block_height: self.height.load(Ordering::SeqCst),
            last_block_app_hash: Vec::new(),
        })
    }

    async fn init_chain(
        &self,
        _req: noirbft_abci::RequestInitChain,
    ) -> Result<noirbft_abci::ResponseInitChain, AbciError> {
        Ok(noirbft_abci::ResponseInitChain {
            consensus_params: None,
            validators: Vec::new(),
            app_hash: Vec::new(),
        })
    }

    async fn query(
        &self,
        _req: noirbft_abci::RequestQuery,
    ) -> Result<noirbft_abci::ResponseQuery, AbciError> {
        Ok(noirbft_abci::ResponseQuery::default())
    }

    async fn begin_block(
        &self,
        _req: noirbft_abci::RequestBeginBlock,
    ) -> Result<noirbft_abci::ResponseBeginBlock, AbciError> {
        Ok(noirbft_abci::ResponseBeginBlock { events: Vec::new() })
    }

    async fn check_tx(
        &self,
        _req: noirbft_abci::RequestCheckTx,
    ) -> Result<noirbft_abci::ResponseCheckTx, AbciError> {
        Ok(noirbft_abci::ResponseCheckTx::default())
    }

    async fn deliver_tx(
        &self,
        req: noirbft_abci::RequestDeliverTx,
    ) -> Result<noirbft_abci::ResponseDeliverTx, AbciError> {
        Ok(noirbft_abci::ResponseDeliverTx {
            code: 0,
            data: req.tx,
            ..Default::default()
        })
    }

    async fn end_block(
        &self,
        _req: noirbft_abci::RequestEndBlock,
    ) -> Result<noirbft_abci::ResponseEndBlock, AbciError> {
        Ok(noirbft_abci::ResponseEndBlock::default())
    }

    async fn commit(&self) -> Result<noirbft_abci::ResponseCommit, AbciError> {
        let height = self.height.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(noirbft_abci::ResponseCommit {
            data: height.to_be_bytes().to_vec(),
            retain_height: 0,
        })
    }

    async fn list_snapshots(&self) -> Result<noirbft_abci::ResponseListSnapshots, AbciError> {
        Ok(noirbft_abci::ResponseListSnapshots::default())
    }

    async fn offer_snapshot(
        &self,
        _req: noirbft_abci::RequestOfferSnapshot,
    ) -> Result<noirbft_abci::ResponseOfferSnapshot, AbciError> {
        Ok(noirbft_abci::ResponseOfferSnapshot::default())
    }

    async fn load_snapshot_chunk(
        &self,
        _req: noirbft_abci::RequestLoadSnapshotChunk,
    ) -> Result<noirbft_abci::ResponseLoadSnapshotChunk, AbciError> {
        Ok(noirbft_abci::ResponseLoadSnapshotChunk::default())
    }

    async fn apply_snapshot_chunk(
        &self,
        _req: noirbft_abci::RequestApplySnapshotChunk,
    ) -> Result<noirbft_abci::ResponseApplySnapshotChunk, AbciError> {
        Ok(noirbft_abci::ResponseApplySnapshotChunk::default())
    }
}

struct Harness {
    key: PrivateKey,
    genesis: GenesisDoc,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let key = PrivateKey::generate(StdRng::seed_from_u64(404));
        let genesis = GenesisDoc {
            genesis_time: Timestamp::from_nanos(1),
            chain_id: "single-val-chain".to_string(),
            initial_height: 1,
            consensus_params: ConsensusParams::default(),
            validators: vec![GenesisValidator {
                pub_key: hex::encode(key.public_key().as_bytes()),
                power: 10,
                name: "only".to_string(),
            }],
            app_hash: Vec::new(),
            app_state: serde_json::Value::Null,
        };
        Self {
            key,
            genesis,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config() -> ConsensusConfig {
        ConsensusConfig {
            timeout_propose: Duration::from_millis(200),
            timeout_prevote: Duration::from_millis(100),
            timeout_precommit: Duration::from_millis(100),
            timeout_commit: Duration::from_millis(50),
            ..ConsensusConfig::default()
        }
    }

    fn build(
        &self,
        app_height: i64,
    ) -> (
        ConsensusState,
        noirbft_consensus::StateHandle,
        BlockStore,
        StateStore,
    ) {
        let block_store = BlockStore::open(self.dir.path().join("blocks.redb")).unwrap();
        let state_store = StateStore::open(self.dir.path().join("state.redb")).unwrap();

        let state = match state_store.load().unwrap() {
            Some(state) => state,
            None => {
                let state = State::from_genesis(&self.genesis).unwrap();
                state_store.bootstrap(&state).unwrap();
                state
            }
        };

        let evidence_pool = Arc::new(
            EvidencePool::open(
                self.dir.path().join(format!("ev-{app_height}.redb")),
                PoolConfig::default(),
                state.clone(),
                state_store.clone(),
                block_store.clone(),
            )
            .unwrap(),
        );

        let abci: Arc<dyn Client> = Arc::new(StubApp {
            height: AtomicI64::new(app_height),
        });
        let executor = BlockExecutor::new(
            abci,
            state_store.clone(),
            block_store.clone(),
            Arc::clone(&evidence_pool),
            Arc::new(NoopMempool),
            1000,
        );

        let wal = Wal::open(self.dir.path().join("cs_wal"), WalOptions::default()).unwrap();

        let (cs, handle, _events) = ConsensusState::new(
            Self::config(),
            state,
            Some(PrivValidator::new(self.key.clone())),
            wal,
            executor,
            block_store.clone(),
            evidence_pool,
        );
        (cs, handle, block_store, state_store)
    }
}

async fn wait_for_height(
    handle: &mut noirbft_consensus::StateHandle,
    target: Height,
    timeout: Duration,
) {
    tokio::time::timeout(timeout, async {
        loop {
            if handle.round_state().height >= target {
                return;
            }
            if !handle.changed().await {
                panic!("state machine stopped before reaching {target}");
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for height {target}"));
}

#[tokio::test(flavor = "multi_thread")]
async fn single_validator_commits_blocks() {
    let harness = Harness::new();
    let (cs, mut handle, block_store, state_store) = harness.build(0);

    let task = tokio::spawn(cs.run());
    wait_for_height(&mut handle, Height::new(3), Duration::from_secs(20)).await;
    task.abort();
    let _ = task.await;

    // Heights 1 and 2 are fully persisted.
    assert!(block_store.height().unwrap().unwrap() >= Height::new(2));
    let block = block_store.load_block(Height::new(1)).unwrap().unwrap();
    assert_eq!(block.header.height, Height::new(1));
    assert_eq!(block.header.chain_id, "single-val-chain");

    let seen = block_store.load_seen_commit(Height::new(1)).unwrap().unwrap();
    assert_eq!(seen.height, Height::new(1));
    assert!(seen.signatures.iter().any(|sig| sig.for_block()));

    // Block 2 commits block 1 with our only validator's signature.
    let commit = block_store.load_block_commit(Height::new(1)).unwrap().unwrap();
    let state = state_store.load().unwrap().unwrap();
    state
        .last_validators
        .verify_commit_light(
            &state.chain_id,
            &commit.block_id,
            Height::new(1),
            &commit,
        )
        .ok();

    assert!(state.last_block_height >= Height::new(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn wal_records_the_height_lifecycle() {
    let harness = Harness::new();
    let (cs, mut handle, _block_store, _state_store) = harness.build(0);

    let task = tokio::spawn(cs.run());
    wait_for_height(&mut handle, Height::new(2), Duration::from_secs(20)).await;
    task.abort();
    let _ = task.await;

    let wal = Wal::open(harness.dir.path().join("cs_wal"), WalOptions::default()).unwrap();
    let after_h1 = wal
        .search_for_end_height(1, SearchOptions::default())
        .unwrap();
    assert!(after_h1.is_some(), "WAL must contain EndHeight for height 1");
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_continues_from_persisted_state() {
    let harness = Harness::new();

    let committed = {
        let (cs, mut handle, block_store, _state_store) = harness.build(0);
        let task = tokio::spawn(cs.run());
        wait_for_height(&mut handle, Height::new(2), Duration::from_secs(20)).await;
        task.abort();
        let _ = task.await;
        block_store.height().unwrap().unwrap()
    };

    // Restart over the same stores; the app has kept pace.
    let (cs, mut handle, block_store, _state_store) = harness.build(committed.as_i64());
    let resumed_at = handle.round_state().height;
    assert!(
        resumed_at > committed,
        "must resume above the committed height"
    );

    let task = tokio::spawn(cs.run());
    wait_for_height(
        &mut handle,
        resumed_at.increment(),
        Duration::from_secs(20),
    )
    .await;
    task.abort();
    let _ = task.await;

    assert!(block_store.height().unwrap().unwrap() > committed);
}
