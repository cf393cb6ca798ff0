use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use noirbft_blocksync::BlockProcessor;
use noirbft_consensus::{verify_sync_block, BlockExecutor};
use noirbft_core_types::{Block, BLOCK_PART_SIZE_BYTES};
use noirbft_store::{BlockStore, State, StateStore};

/// Applies fast-synced blocks through the block executor, verifying each
/// against the commit carried by its successor.
pub struct SyncBlockProcessor {
    executor: Arc<BlockExecutor>,
    state_store: StateStore,
    block_store: BlockStore,
    state: Arc<Mutex<State>>,
}

impl SyncBlockProcessor {
    pub fn new(
        executor: Arc<BlockExecutor>,
        state_store: StateStore,
        block_store: BlockStore,
        state: Arc<Mutex<State>>,
    ) -> Self {
        Self {
            executor,
            state_store,
            block_store,
            state,
        }
    }
}

#[async_trait]
impl BlockProcessor for SyncBlockProcessor {
    async fn process_block(&self, first: &Block, second: &Block) -> Result<(), String> {
        let mut state = self.state.lock().await;

        let validators = self
            .state_store
            .load_validators(first.header.height)
            .map_err(|e| format!("no validators for {}: {e}", first.header.height))?;

        let block_id = verify_sync_block(
            &state.chain_id,
            &validators,
            first,
            second,
            BLOCK_PART_SIZE_BYTES,
        )
        .map_err(|e| e.to_string())?;

        // Persist before applying so a crash replays from the store.
        let parts = first
            .make_part_set(BLOCK_PART_SIZE_BYTES)
            .map_err(|e| e.to_string())?;
        self.block_store
            .save_block(first, &parts, &second.last_commit)
            .map_err(|e| e.to_string())?;

        let new_state = self
            .executor
            .apply_block(&state, &block_id, first)
            .await
            .map_err(|e| e.to_string())?;
        *state = new_state;
        Ok(())
    }
}
