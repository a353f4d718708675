//! In-memory storage backend.
//!
//! Stores checkpoints, recorded block hashes and derived records in RAM behind
//! a single lock, so each commit is atomic. Useful for tests and short-lived
//! indexers that don't need persistence.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chainingest_core::checkpoint::{
    conflict, BlockCommit, Checkpoint, CheckpointStore, DerivedRecord, RecordQuery, RecordReader,
};
use chainingest_core::error::IndexerError;
use chainingest_core::types::{BlockRef, IndexTarget, B256};

/// `(table, block, transaction index, log index, key)`
type RecordKey = (String, u64, u32, u32, String);

#[derive(Default)]
struct TargetState {
    checkpoint: Option<Checkpoint>,
    hashes: BTreeMap<u64, B256>,
    records: BTreeMap<RecordKey, DerivedRecord>,
}

fn record_key(r: &DerivedRecord) -> RecordKey {
    (
        r.table.clone(),
        r.block_number,
        r.transaction_index,
        r.log_index,
        r.key.clone(),
    )
}

/// In-memory indexer storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    targets: Mutex<HashMap<IndexTarget, TargetState>>,
    crash_next_commit: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail after its records are written but before the
    /// checkpoint moves, as if the process died mid-commit.
    pub fn crash_next_commit(&self) {
        self.crash_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of stored records for `target`, including any not yet covered by
    /// the checkpoint.
    pub fn raw_record_count(&self, target: &IndexTarget) -> usize {
        self.lock()
            .map(|t| t.get(target).map_or(0, |s| s.records.len()))
            .unwrap_or(0)
    }

    /// Heights with a recorded block hash for `target`, ascending.
    pub fn recorded_heights(&self, target: &IndexTarget) -> Vec<u64> {
        self.lock()
            .map(|t| t.get(target).map_or_else(Vec::new, |s| s.hashes.keys().copied().collect()))
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<IndexTarget, TargetState>>, IndexerError> {
        self.targets
            .lock()
            .map_err(|_| IndexerError::Storage("in-memory store lock poisoned".into()))
    }
}

fn check_expected(state: &TargetState, expected: Option<&BlockRef>) -> Result<(), IndexerError> {
    let found = state.checkpoint.as_ref().map(|c| &c.last_processed);
    if found != expected {
        return Err(conflict(expected, found));
    }
    Ok(())
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(&self, target: &IndexTarget) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.lock()?.get(target).and_then(|s| s.checkpoint.clone()))
    }

    async fn commit(
        &self,
        target: &IndexTarget,
        expected: Option<&BlockRef>,
        commit: BlockCommit,
    ) -> Result<Checkpoint, IndexerError> {
        let mut targets = self.lock()?;
        let state = targets.entry(target.clone()).or_default();
        check_expected(state, expected)?;

        // Anything above the checkpoint was left by a commit that never
        // completed and may belong to a block that has since been replaced.
        let committed = expected.map(|b| b.number);
        state
            .records
            .retain(|_, r| committed.is_some_and(|n| r.block_number <= n));
        state.hashes.retain(|h, _| committed.is_some_and(|n| *h <= n));

        for record in commit.records {
            state.records.insert(record_key(&record), record);
        }
        state.hashes.insert(commit.block.number, commit.block.hash);

        if self.crash_next_commit.swap(false, Ordering::SeqCst) {
            return Err(IndexerError::Storage(format!(
                "injected crash before checkpoint write at block {}",
                commit.block.number
            )));
        }

        if let Some(below) = commit.prune_below {
            state.hashes = state.hashes.split_off(&below);
        }
        let checkpoint = Checkpoint {
            last_processed: commit.block,
            updated_at: chrono::Utc::now().timestamp(),
        };
        state.checkpoint = Some(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn rollback(
        &self,
        target: &IndexTarget,
        expected: &BlockRef,
        ancestor: &BlockRef,
    ) -> Result<Checkpoint, IndexerError> {
        let mut targets = self.lock()?;
        let state = targets.entry(target.clone()).or_default();
        check_expected(state, Some(expected))?;

        state.records.retain(|_, r| r.block_number <= ancestor.number);
        state.hashes.retain(|n, _| *n <= ancestor.number);
        state.hashes.insert(ancestor.number, ancestor.hash);

        let checkpoint = Checkpoint {
            last_processed: *ancestor,
            updated_at: chrono::Utc::now().timestamp(),
        };
        state.checkpoint = Some(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn recorded_hash(
        &self,
        target: &IndexTarget,
        number: u64,
    ) -> Result<Option<B256>, IndexerError> {
        Ok(self
            .lock()?
            .get(target)
            .and_then(|s| s.hashes.get(&number).copied()))
    }

    async fn reset(&self, target: &IndexTarget) -> Result<(), IndexerError> {
        self.lock()?.remove(target);
        Ok(())
    }
}

#[async_trait]
impl RecordReader for InMemoryStorage {
    async fn checkpoint(&self, target: &IndexTarget) -> Result<Option<Checkpoint>, IndexerError> {
        self.load(target).await
    }

    async fn records(
        &self,
        target: &IndexTarget,
        query: &RecordQuery,
    ) -> Result<Vec<DerivedRecord>, IndexerError> {
        let targets = self.lock()?;
        let Some(state) = targets.get(target) else {
            return Ok(Vec::new());
        };
        let Some(visible) = state.checkpoint.as_ref().map(|c| c.last_processed.number) else {
            return Ok(Vec::new());
        };

        let records = state
            .records
            .values()
            .filter(|r| r.table == query.table)
            .filter(|r| r.block_number <= visible && query.covers(r.block_number))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> IndexTarget {
        IndexTarget::new("devnet", "mem")
    }

    fn block(n: u64) -> BlockRef {
        BlockRef::new(n, B256::repeat_byte(n as u8), B256::repeat_byte(n as u8 - 1))
    }

    fn record(n: u64, key: &str) -> DerivedRecord {
        DerivedRecord {
            table: "transfers".into(),
            key: key.into(),
            block_number: n,
            transaction_index: 0,
            log_index: 0,
            data: json!({ "block": n }),
        }
    }

    fn commit(n: u64, records: Vec<DerivedRecord>) -> BlockCommit {
        BlockCommit {
            block: block(n),
            records,
            prune_below: None,
        }
    }

    #[tokio::test]
    async fn crash_leaves_checkpoint_and_hides_records() {
        let store = InMemoryStorage::new();
        store.commit(&target(), None, commit(10, vec![record(10, "a")])).await.unwrap();

        store.crash_next_commit();
        let err = store
            .commit(&target(), Some(&block(10)), commit(11, vec![record(11, "b")]))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Storage(_)));

        let cp = store.load(&target()).await.unwrap().unwrap();
        assert_eq!(cp.last_processed.number, 10);
        assert_eq!(store.raw_record_count(&target()), 2);
        let visible = store
            .records(&target(), &RecordQuery::table("transfers"))
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);

        // Replay of the same block converges.
        store
            .commit(&target(), Some(&block(10)), commit(11, vec![record(11, "b")]))
            .await
            .unwrap();
        assert_eq!(store.raw_record_count(&target()), 2);
    }

    #[tokio::test]
    async fn commit_discards_leftovers_of_crashed_block() {
        let store = InMemoryStorage::new();
        store.commit(&target(), None, commit(10, vec![record(10, "a")])).await.unwrap();

        store.crash_next_commit();
        let mut crashed = record(11, "b");
        crashed.log_index = 1;
        store
            .commit(&target(), Some(&block(10)), commit(11, vec![record(11, "a"), crashed]))
            .await
            .unwrap_err();

        // Block 11 was replaced while down: the new one only writes log 0.
        store
            .commit(&target(), Some(&block(10)), commit(11, vec![record(11, "a")]))
            .await
            .unwrap();
        let visible = store
            .records(&target(), &RecordQuery::table("transfers"))
            .await
            .unwrap();
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|r| r.log_index == 0));
        assert_eq!(store.raw_record_count(&target()), 2);
    }

    #[tokio::test]
    async fn prune_keeps_recent_hashes() {
        let store = InMemoryStorage::new();
        let mut expected = None;
        for n in 1..=10u64 {
            let c = BlockCommit {
                block: block(n),
                records: vec![],
                prune_below: n.checked_sub(3),
            };
            let cp = store.commit(&target(), expected.as_ref(), c).await.unwrap();
            expected = Some(cp.last_processed);
        }
        assert_eq!(store.recorded_heights(&target()), vec![7, 8, 9, 10]);
    }
}
