use std::path::Path;
use std::sync::Arc;

use redb::ReadableTable;
use tracing::debug;

use noirbft_core_types::{Block, BlockId, BlockMeta, Commit, Height, Part, PartSet};
use noirbft_proto::Protobuf;

use crate::Error;

const BLOCK_META_TABLE: redb::TableDefinition<'_, u64, Vec<u8>> =
    redb::TableDefinition::new("block_meta");

const BLOCK_PART_TABLE: redb::TableDefinition<'_, (u64, u32), Vec<u8>> =
    redb::TableDefinition::new("block_part");

const BLOCK_COMMIT_TABLE: redb::TableDefinition<'_, u64, Vec<u8>> =
    redb::TableDefinition::new("block_commit");

const SEEN_COMMIT_TABLE: redb::TableDefinition<'_, u64, Vec<u8>> =
    redb::TableDefinition::new("seen_commit");

/// `base` and `height` sentinels live here.
const RANGE_TABLE: redb::TableDefinition<'_, &str, u64> = redb::TableDefinition::new("range");

/// Stores committed blocks as metadata plus their original parts, the
/// canonical commit for each height, and the locally-seen commit for the
/// most recent height. Writers are serialized by the underlying `redb`
/// write transaction; readers run concurrently.
#[derive(Clone)]
pub struct BlockStore {
    db: Arc<redb::Database>,
}

impl BlockStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = redb::Database::create(path)?;

        // Make sure every table exists so first reads don't fail.
        let tx = db.begin_write()?;
        {
            tx.open_table(BLOCK_META_TABLE)?;
            tx.open_table(BLOCK_PART_TABLE)?;
            tx.open_table(BLOCK_COMMIT_TABLE)?;
            tx.open_table(SEEN_COMMIT_TABLE)?;
            tx.open_table(RANGE_TABLE)?;
        }
        tx.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Lowest height retained, or `None` when empty.
    pub fn base(&self) -> Result<Option<Height>, Error> {
        self.sentinel("base")
    }

    /// Highest height stored, or `None` when empty.
    pub fn height(&self) -> Result<Option<Height>, Error> {
        self.sentinel("height")
    }

    fn sentinel(&self, key: &str) -> Result<Option<Height>, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RANGE_TABLE)?;
        Ok(table.get(key)?.map(|v| Height::new(v.value())))
    }

    /// Persists a block with its part set, the canonical commit for the
    /// previous height (the block's own last-commit) and the commit this
    /// node saw for the block itself.
    pub fn save_block(
        &self,
        block: &Block,
        parts: &PartSet,
        seen_commit: &Commit,
    ) -> Result<(), Error> {
        debug_assert!(parts.is_complete());

        let height = block.header.height;
        let block_id = BlockId::new(block.hash()?, parts.header());
        let meta = BlockMeta {
            block_id,
            block_size: parts.reassemble()?.len(),
            header: block.header.clone(),
            num_txs: block.data.txs.len(),
        };

        let tx = self.db.begin_write()?;
        {
            let mut metas = tx.open_table(BLOCK_META_TABLE)?;
            metas.insert(height.as_u64(), meta.to_bytes()?)?;

            let mut part_table = tx.open_table(BLOCK_PART_TABLE)?;
            for index in 0..parts.total() {
                let part = parts
                    .get_part(index)
                    .ok_or_else(|| Error::InvalidValue(format!("missing part {index}")))?;
                part_table.insert((height.as_u64(), index), part.to_bytes()?)?;
            }

            let mut commits = tx.open_table(BLOCK_COMMIT_TABLE)?;
            if let Some(last_height) = height.decrement() {
                commits.insert(last_height.as_u64(), block.last_commit.to_bytes()?)?;
            }

            let mut seen = tx.open_table(SEEN_COMMIT_TABLE)?;
            seen.insert(height.as_u64(), seen_commit.to_bytes()?)?;

            let mut range = tx.open_table(RANGE_TABLE)?;
            if range.get("base")?.is_none() {
                range.insert("base", height.as_u64())?;
            }
            range.insert("height", height.as_u64())?;
        }
        tx.commit()?;

        debug!(%height, "Saved block");
        Ok(())
    }

    pub fn load_block_meta(&self, height: Height) -> Result<Option<BlockMeta>, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(BLOCK_META_TABLE)?;
        let Some(bytes) = table.get(height.as_u64())? else {
            return Ok(None);
        };
        Ok(Some(BlockMeta::from_bytes(&bytes.value())?))
    }

    pub fn load_block_part(&self, height: Height, index: u32) -> Result<Option<Part>, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(BLOCK_PART_TABLE)?;
        let Some(bytes) = table.get((height.as_u64(), index))? else {
            return Ok(None);
        };
        Ok(Some(Part::from_bytes(&bytes.value())?))
    }

    /// Reassembles a full block from its stored parts.
    pub fn load_block(&self, height: Height) -> Result<Option<Block>, Error> {
        let Some(meta) = self.load_block_meta(height)? else {
            return Ok(None);
        };

        let mut parts = PartSet::from_header(meta.block_id.part_set_header);
        for index in 0..parts.total() {
            let part = self
                .load_block_part(height, index)?
                .ok_or_else(|| Error::InvalidValue(format!("missing part {index}")))?;
            parts
                .add_part(part)
                .map_err(|e| Error::InvalidValue(e.to_string()))?;
        }
        Ok(Some(Block::from_part_set(&parts)?))
    }

    /// The canonical commit for `height`, taken from block `height + 1`.
    pub fn load_block_commit(&self, height: Height) -> Result<Option<Commit>, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(BLOCK_COMMIT_TABLE)?;
        let Some(bytes) = table.get(height.as_u64())? else {
            return Ok(None);
        };
        Ok(Some(Commit::from_bytes(&bytes.value())?))
    }

    /// The commit this node itself collected when it decided `height`.
    pub fn load_seen_commit(&self, height: Height) -> Result<Option<Commit>, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(SEEN_COMMIT_TABLE)?;
        let Some(bytes) = table.get(height.as_u64())? else {
            return Ok(None);
        };
        Ok(Some(Commit::from_bytes(&bytes.value())?))
    }

    /// Drops every height below `retain_height`. Returns how many blocks
    /// were pruned.
    pub fn prune(&self, retain_height: Height) -> Result<u64, Error> {
        let Some(base) = self.base()? else {
            return Ok(0);
        };
        if retain_height <= base {
            return Ok(0);
        }

        let mut pruned = 0;
        let tx = self.db.begin_write()?;
        {
            let mut metas = tx.open_table(BLOCK_META_TABLE)?;
            let mut part_table = tx.open_table(BLOCK_PART_TABLE)?;
            let mut commits = tx.open_table(BLOCK_COMMIT_TABLE)?;
            let mut seen = tx.open_table(SEEN_COMMIT_TABLE)?;

            let mut height = base;
            while height < retain_height {
                let h = height.as_u64();
                if metas.remove(h)?.is_some() {
                    pruned += 1;
                }
                let part_keys: Vec<(u64, u32)> = {
                    let mut keys = Vec::new();
                    for entry in part_table.iter()? {
                        let (key, _) = entry?;
                        if key.value().0 == h {
                            keys.push(key.value());
                        }
                    }
                    keys
                };
                for key in part_keys {
                    part_table.remove(key)?;
                }
                commits.remove(h)?;
                seen.remove(h)?;
                height = height.increment();
            }

            let mut range = tx.open_table(RANGE_TABLE)?;
            range.insert("base", retain_height.as_u64())?;
        }
        tx.commit()?;

        debug!(%retain_height, pruned, "Pruned block store");
        Ok(pruned)
    }
}
