//! Checkpoints and derived records: the persisted side of the pipeline.
//!
//! A checkpoint stores the last block whose handler effects are durable. The
//! block's records, its hash and the checkpoint move together in one atomic
//! commit, so on restart the indexer resumes at `checkpoint + 1` and re-applies
//! nothing that was already made visible.
//!
//! Commits are compare-and-swap on the previous checkpoint: a second writer
//! for the same target gets [`IndexerError::Conflict`] instead of silently
//! interleaving blocks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IndexerError;
use crate::types::{BlockRef, IndexTarget, LogPosition, B256};

/// A persisted checkpoint for one indexing target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last block whose effects are fully committed.
    pub last_processed: BlockRef,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// A row written by a handler, carrying the provenance of the log that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRecord {
    pub table: String,
    /// Handler-chosen key, unique within one log's writes to `table`.
    pub key: String,
    pub block_number: u64,
    pub transaction_index: u32,
    pub log_index: u32,
    pub data: Value,
}

impl DerivedRecord {
    pub fn position(&self) -> LogPosition {
        LogPosition {
            block_number: self.block_number,
            transaction_index: self.transaction_index,
            log_index: self.log_index,
        }
    }

    /// Returns `true` if `other` has the same upsert identity.
    pub fn same_identity(&self, other: &DerivedRecord) -> bool {
        self.table == other.table && self.key == other.key && self.position() == other.position()
    }
}

/// Everything that becomes durable when one block is committed.
#[derive(Debug, Clone)]
pub struct BlockCommit {
    pub block: BlockRef,
    pub records: Vec<DerivedRecord>,
    /// Recorded block hashes strictly below this height may be dropped.
    pub prune_below: Option<u64>,
}

/// Filter for [`RecordReader::records`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub table: String,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Returns `true` if a record at `block_number` falls inside the block bounds.
    pub fn covers(&self, block_number: u64) -> bool {
        self.from_block.map_or(true, |from| block_number >= from)
            && self.to_block.map_or(true, |to| block_number <= to)
    }
}

/// Persistence of checkpoints, recorded block hashes and derived records.
///
/// Implementations: `InMemoryStorage`, `SqliteStorage`, `PostgresStorage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for `target`, if one exists.
    async fn load(&self, target: &IndexTarget) -> Result<Option<Checkpoint>, IndexerError>;

    /// Atomically upsert the block's records, record its hash and advance the
    /// checkpoint to `commit.block`.
    ///
    /// `expected` is the checkpoint the caller believes is current; if the
    /// stored one differs, nothing is written and `Conflict` is returned.
    async fn commit(
        &self,
        target: &IndexTarget,
        expected: Option<&BlockRef>,
        commit: BlockCommit,
    ) -> Result<Checkpoint, IndexerError>;

    /// Atomically delete records and recorded hashes above `ancestor` and move
    /// the checkpoint back to it. Compare-and-swap on `expected` like [`commit`].
    ///
    /// [`commit`]: CheckpointStore::commit
    async fn rollback(
        &self,
        target: &IndexTarget,
        expected: &BlockRef,
        ancestor: &BlockRef,
    ) -> Result<Checkpoint, IndexerError>;

    /// The hash recorded when block `number` was committed.
    async fn recorded_hash(
        &self,
        target: &IndexTarget,
        number: u64,
    ) -> Result<Option<B256>, IndexerError>;

    /// Delete the checkpoint, recorded hashes and records of `target`.
    async fn reset(&self, target: &IndexTarget) -> Result<(), IndexerError>;
}

/// Read-only access for downstream consumers.
///
/// Readers never observe records above the committed checkpoint.
#[async_trait]
pub trait RecordReader: Send + Sync {
    async fn checkpoint(&self, target: &IndexTarget) -> Result<Option<Checkpoint>, IndexerError>;

    /// Records of one table in `(block, transaction, log, key)` order.
    async fn records(
        &self,
        target: &IndexTarget,
        query: &RecordQuery,
    ) -> Result<Vec<DerivedRecord>, IndexerError>;
}

/// A full storage backend.
pub trait IndexStore: CheckpointStore + RecordReader {}

impl<T: CheckpointStore + RecordReader + ?Sized> IndexStore for T {}

/// Build the `Conflict` error a backend returns when the compare-and-swap fails.
pub fn conflict(expected: Option<&BlockRef>, found: Option<&BlockRef>) -> IndexerError {
    let describe = |b: Option<&BlockRef>| b.map_or_else(|| "no checkpoint".to_string(), |b| b.to_string());
    IndexerError::Conflict {
        expected: describe(expected),
        found: describe(found),
    }
}

// ─── CheckpointManager ────────────────────────────────────────────────────────

/// Manages checkpoint reads/writes for one indexing target.
///
/// Caches the last committed checkpoint, which is the `expected` value of the
/// next compare-and-swap.
pub struct CheckpointManager {
    store: Arc<dyn IndexStore>,
    target: IndexTarget,
    current: Option<Checkpoint>,
    /// Number of recent block hashes kept for reorg resolution.
    retain: u64,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn IndexStore>, target: IndexTarget, max_reorg_depth: u64) -> Self {
        Self {
            store,
            target,
            current: None,
            retain: max_reorg_depth.saturating_add(1),
        }
    }

    pub fn target(&self) -> &IndexTarget {
        &self.target
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    /// Load the saved checkpoint (returns `None` if none exists) and cache it.
    pub async fn load(&mut self) -> Result<Option<Checkpoint>, IndexerError> {
        self.current = self.store.load(&self.target).await?;
        Ok(self.current.clone())
    }

    pub fn current(&self) -> Option<&Checkpoint> {
        self.current.as_ref()
    }

    /// Last committed block.
    pub fn last_block(&self) -> Option<BlockRef> {
        self.current.as_ref().map(|c| c.last_processed)
    }

    /// Commit `block` together with its records.
    pub async fn commit_block(
        &mut self,
        block: BlockRef,
        records: Vec<DerivedRecord>,
    ) -> Result<Checkpoint, IndexerError> {
        let expected = self.last_block();
        let prune_below = block.number.checked_sub(self.retain - 1);
        let commit = BlockCommit {
            block,
            records,
            prune_below,
        };
        let checkpoint = self
            .store
            .commit(&self.target, expected.as_ref(), commit)
            .await?;
        tracing::trace!(block = block.number, indexer = %self.target, "checkpoint advanced");
        self.current = Some(checkpoint.clone());
        Ok(checkpoint)
    }

    /// Roll back to `ancestor`, discarding everything above it.
    pub async fn rollback_to(&mut self, ancestor: BlockRef) -> Result<Checkpoint, IndexerError> {
        let expected = self
            .last_block()
            .ok_or_else(|| conflict(Some(&ancestor), None))?;
        let checkpoint = self.store.rollback(&self.target, &expected, &ancestor).await?;
        tracing::info!(
            from = expected.number,
            to = ancestor.number,
            indexer = %self.target,
            "checkpoint rolled back"
        );
        self.current = Some(checkpoint.clone());
        Ok(checkpoint)
    }

    pub async fn recorded_hash(&self, number: u64) -> Result<Option<B256>, IndexerError> {
        self.store.recorded_hash(&self.target, number).await
    }

    /// Delete all state for this target (the manual intervention after a
    /// too-deep reorg).
    pub async fn reset(&mut self) -> Result<(), IndexerError> {
        self.store.reset(&self.target).await?;
        self.current = None;
        Ok(())
    }
}
