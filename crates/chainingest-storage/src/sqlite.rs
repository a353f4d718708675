//! SQLite storage backend for ChainIngest.
//!
//! Persists checkpoints, recorded block hashes and derived records to a single
//! SQLite file. Every commit and rollback runs in one `sqlx` transaction.
//!
//! # Usage
//! ```rust,no_run
//! use chainingest_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./ingest.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainingest_core::checkpoint::{
    conflict, BlockCommit, Checkpoint, CheckpointStore, DerivedRecord, RecordQuery, RecordReader,
};
use chainingest_core::error::IndexerError;
use chainingest_core::types::{hash_hex, BlockRef, IndexTarget, B256};

use crate::{parse_hash, storage_err};

/// SQLite-backed storage for checkpoints, block hashes and records.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./ingest.db"`) or a full
    /// SQLite URL (`"sqlite:./ingest.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        // WAL mode: readers don't block the committing writer
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        // Each connection to `:memory:` is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables if they don't already exist.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ingest_checkpoints (
                chain_id     TEXT    NOT NULL,
                indexer_id   TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                parent_hash  TEXT    NOT NULL,
                updated_at   INTEGER NOT NULL,
                PRIMARY KEY (chain_id, indexer_id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ingest_block_hashes (
                chain_id     TEXT    NOT NULL,
                indexer_id   TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                PRIMARY KEY (chain_id, indexer_id, block_number)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ingest_records (
                chain_id          TEXT    NOT NULL,
                indexer_id        TEXT    NOT NULL,
                table_name        TEXT    NOT NULL,
                block_number      INTEGER NOT NULL,
                transaction_index INTEGER NOT NULL,
                log_index         INTEGER NOT NULL,
                record_key        TEXT    NOT NULL,
                data              TEXT    NOT NULL,
                PRIMARY KEY (chain_id, indexer_id, table_name, block_number,
                             transaction_index, log_index, record_key)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ingest_records_block
             ON ingest_records (chain_id, indexer_id, block_number);",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint, IndexerError> {
        let hash: String = row.get("block_hash");
        let parent: String = row.get("parent_hash");
        Ok(Checkpoint {
            last_processed: BlockRef::new(
                row.get::<i64, _>("block_number") as u64,
                parse_hash(&hash)?,
                parse_hash(&parent)?,
            ),
            updated_at: row.get("updated_at"),
        })
    }

    /// Total number of stored records for `target`, including any above the checkpoint.
    pub async fn raw_record_count(&self, target: &IndexTarget) -> Result<u64, IndexerError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM ingest_records WHERE chain_id = ? AND indexer_id = ?",
        )
        .bind(&target.chain_id)
        .bind(&target.indexer_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(&self, target: &IndexTarget) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT block_number, block_hash, parent_hash, updated_at
             FROM ingest_checkpoints WHERE chain_id = ? AND indexer_id = ?",
        )
        .bind(&target.chain_id)
        .bind(&target.indexer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::checkpoint_from_row).transpose()
    }

    async fn commit(
        &self,
        target: &IndexTarget,
        expected: Option<&BlockRef>,
        commit: BlockCommit,
    ) -> Result<Checkpoint, IndexerError> {
        let block = commit.block;
        let updated_at = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let swapped = match expected {
            Some(prev) => sqlx::query(
                "UPDATE ingest_checkpoints
                 SET block_number = ?, block_hash = ?, parent_hash = ?, updated_at = ?
                 WHERE chain_id = ? AND indexer_id = ? AND block_number = ? AND block_hash = ?",
            )
            .bind(block.number as i64)
            .bind(hash_hex(&block.hash))
            .bind(hash_hex(&block.parent_hash))
            .bind(updated_at)
            .bind(&target.chain_id)
            .bind(&target.indexer_id)
            .bind(prev.number as i64)
            .bind(hash_hex(&prev.hash))
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?,
            None => sqlx::query(
                "INSERT INTO ingest_checkpoints
                 (chain_id, indexer_id, block_number, block_hash, parent_hash, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (chain_id, indexer_id) DO NOTHING",
            )
            .bind(&target.chain_id)
            .bind(&target.indexer_id)
            .bind(block.number as i64)
            .bind(hash_hex(&block.hash))
            .bind(hash_hex(&block.parent_hash))
            .bind(updated_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?,
        };

        if swapped.rows_affected() != 1 {
            tx.rollback().await.map_err(storage_err)?;
            let found = self.load(target).await?;
            return Err(conflict(expected, found.as_ref().map(|c| &c.last_processed)));
        }

        for record in &commit.records {
            let data = serde_json::to_string(&record.data)
                .map_err(|e| IndexerError::Storage(e.to_string()))?;
            sqlx::query(
                "INSERT INTO ingest_records
                 (chain_id, indexer_id, table_name, block_number, transaction_index,
                  log_index, record_key, data)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (chain_id, indexer_id, table_name, block_number,
                              transaction_index, log_index, record_key)
                 DO UPDATE SET data = excluded.data",
            )
            .bind(&target.chain_id)
            .bind(&target.indexer_id)
            .bind(&record.table)
            .bind(record.block_number as i64)
            .bind(record.transaction_index as i64)
            .bind(record.log_index as i64)
            .bind(&record.key)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        sqlx::query(
            "INSERT OR REPLACE INTO ingest_block_hashes
             (chain_id, indexer_id, block_number, block_hash)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&target.chain_id)
        .bind(&target.indexer_id)
        .bind(block.number as i64)
        .bind(hash_hex(&block.hash))
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        if let Some(below) = commit.prune_below {
            sqlx::query(
                "DELETE FROM ingest_block_hashes
                 WHERE chain_id = ? AND indexer_id = ? AND block_number < ?",
            )
            .bind(&target.chain_id)
            .bind(&target.indexer_id)
            .bind(below as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(indexer = %target, block = block.number, records = commit.records.len(), "block committed");

        Ok(Checkpoint {
            last_processed: block,
            updated_at,
        })
    }

    async fn rollback(
        &self,
        target: &IndexTarget,
        expected: &BlockRef,
        ancestor: &BlockRef,
    ) -> Result<Checkpoint, IndexerError> {
        let updated_at = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let swapped = sqlx::query(
            "UPDATE ingest_checkpoints
             SET block_number = ?, block_hash = ?, parent_hash = ?, updated_at = ?
             WHERE chain_id = ? AND indexer_id = ? AND block_number = ? AND block_hash = ?",
        )
        .bind(ancestor.number as i64)
        .bind(hash_hex(&ancestor.hash))
        .bind(hash_hex(&ancestor.parent_hash))
        .bind(updated_at)
        .bind(&target.chain_id)
        .bind(&target.indexer_id)
        .bind(expected.number as i64)
        .bind(hash_hex(&expected.hash))
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        if swapped.rows_affected() != 1 {
            tx.rollback().await.map_err(storage_err)?;
            let found = self.load(target).await?;
            return Err(conflict(Some(expected), found.as_ref().map(|c| &c.last_processed)));
        }

        let deleted = sqlx::query(
            "DELETE FROM ingest_records
             WHERE chain_id = ? AND indexer_id = ? AND block_number > ?",
        )
        .bind(&target.chain_id)
        .bind(&target.indexer_id)
        .bind(ancestor.number as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "DELETE FROM ingest_block_hashes
             WHERE chain_id = ? AND indexer_id = ? AND block_number > ?",
        )
        .bind(&target.chain_id)
        .bind(&target.indexer_id)
        .bind(ancestor.number as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "INSERT OR REPLACE INTO ingest_block_hashes
             (chain_id, indexer_id, block_number, block_hash)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&target.chain_id)
        .bind(&target.indexer_id)
        .bind(ancestor.number as i64)
        .bind(hash_hex(&ancestor.hash))
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        debug!(
            indexer = %target,
            ancestor = ancestor.number,
            records_deleted = deleted.rows_affected(),
            "rolled back storage"
        );

        Ok(Checkpoint {
            last_processed: *ancestor,
            updated_at,
        })
    }

    async fn recorded_hash(
        &self,
        target: &IndexTarget,
        number: u64,
    ) -> Result<Option<B256>, IndexerError> {
        let row = sqlx::query(
            "SELECT block_hash FROM ingest_block_hashes
             WHERE chain_id = ? AND indexer_id = ? AND block_number = ?",
        )
        .bind(&target.chain_id)
        .bind(&target.indexer_id)
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(|r| parse_hash(&r.get::<String, _>("block_hash")))
            .transpose()
    }

    async fn reset(&self, target: &IndexTarget) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for table in ["ingest_records", "ingest_block_hashes", "ingest_checkpoints"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE chain_id = ? AND indexer_id = ?"
            ))
            .bind(&target.chain_id)
            .bind(&target.indexer_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }
}

// ─── RecordReader impl ───────────────────────────────────────────────────────

#[async_trait]
impl RecordReader for SqliteStorage {
    async fn checkpoint(&self, target: &IndexTarget) -> Result<Option<Checkpoint>, IndexerError> {
        self.load(target).await
    }

    async fn records(
        &self,
        target: &IndexTarget,
        query: &RecordQuery,
    ) -> Result<Vec<DerivedRecord>, IndexerError> {
        let rows = sqlx::query(
            "SELECT r.table_name, r.record_key, r.block_number, r.transaction_index,
                    r.log_index, r.data
             FROM ingest_records r
             JOIN ingest_checkpoints c
               ON c.chain_id = r.chain_id AND c.indexer_id = r.indexer_id
             WHERE r.chain_id = ? AND r.indexer_id = ? AND r.table_name = ?
               AND r.block_number <= c.block_number
               AND r.block_number >= ? AND r.block_number <= ?
             ORDER BY r.block_number, r.transaction_index, r.log_index, r.record_key
             LIMIT ?",
        )
        .bind(&target.chain_id)
        .bind(&target.indexer_id)
        .bind(&query.table)
        .bind(query.from_block.map_or(0, |b| b as i64))
        .bind(query.to_block.map_or(i64::MAX, |b| b.min(i64::MAX as u64) as i64))
        .bind(query.limit.map_or(-1, |l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.get("data");
            records.push(DerivedRecord {
                table: row.get("table_name"),
                key: row.get("record_key"),
                block_number: row.get::<i64, _>("block_number") as u64,
                transaction_index: row.get::<i64, _>("transaction_index") as u32,
                log_index: row.get::<i64, _>("log_index") as u32,
                data: serde_json::from_str(&data)
                    .map_err(|e| IndexerError::Storage(e.to_string()))?,
            });
        }
        Ok(records)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> IndexTarget {
        IndexTarget::new("ethereum", "test-indexer")
    }

    fn hash(n: u64, fork: u8) -> B256 {
        let mut word = [0u8; 32];
        word[0] = fork;
        word[24..].copy_from_slice(&n.to_be_bytes());
        B256::from(word)
    }

    fn block(n: u64, fork: u8) -> BlockRef {
        BlockRef::new(n, hash(n, fork), hash(n - 1, fork))
    }

    fn record(n: u64, log: u32, value: u64) -> DerivedRecord {
        DerivedRecord {
            table: "transfers".into(),
            key: "Transfer".into(),
            block_number: n,
            transaction_index: 0,
            log_index: log,
            data: json!({ "value": value }),
        }
    }

    fn commit(n: u64, records: Vec<DerivedRecord>) -> BlockCommit {
        BlockCommit {
            block: block(n, 0),
            records,
            prune_below: None,
        }
    }

    #[tokio::test]
    async fn commit_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.load(&target()).await.unwrap().is_none());

        let cp = store
            .commit(&target(), None, commit(100, vec![record(100, 0, 5)]))
            .await
            .unwrap();
        assert_eq!(cp.last_processed, block(100, 0));

        let loaded = store.load(&target()).await.unwrap().unwrap();
        assert_eq!(loaded.last_processed, block(100, 0));
        assert_eq!(
            store.recorded_hash(&target(), 100).await.unwrap(),
            Some(block(100, 0).hash)
        );

        let records = store.records(&target(), &RecordQuery::table("transfers")).await.unwrap();
        assert_eq!(records, vec![record(100, 0, 5)]);
    }

    #[tokio::test]
    async fn stale_expected_checkpoint_conflicts() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.commit(&target(), None, commit(100, vec![])).await.unwrap();

        // A second writer that never saw block 100.
        let err = store.commit(&target(), None, commit(100, vec![])).await.unwrap_err();
        assert!(err.is_conflict());

        store
            .commit(&target(), Some(&block(100, 0)), commit(101, vec![record(101, 0, 1)]))
            .await
            .unwrap();
        let err = store
            .commit(&target(), Some(&block(100, 0)), commit(101, vec![record(101, 0, 2)]))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // The losing writer changed nothing.
        let records = store.records(&target(), &RecordQuery::table("transfers")).await.unwrap();
        assert_eq!(records[0].data["value"], 1);
    }

    #[tokio::test]
    async fn replay_after_rollback_converges() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.commit(&target(), None, commit(100, vec![record(100, 0, 1)])).await.unwrap();
        store
            .commit(&target(), Some(&block(100, 0)), commit(101, vec![record(101, 0, 1)]))
            .await
            .unwrap();
        store.rollback(&target(), &block(101, 0), &block(100, 0)).await.unwrap();
        store
            .commit(&target(), Some(&block(100, 0)), commit(101, vec![record(101, 0, 9)]))
            .await
            .unwrap();

        assert_eq!(store.raw_record_count(&target()).await.unwrap(), 2);
        let records = store.records(&target(), &RecordQuery::table("transfers")).await.unwrap();
        assert_eq!(records[1].data["value"], 9);
    }

    #[tokio::test]
    async fn rollback_removes_future_data() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut prev: Option<BlockRef> = None;
        for n in 100u64..=105 {
            let cp = store
                .commit(&target(), prev.as_ref(), commit(n, vec![record(n, 0, n)]))
                .await
                .unwrap();
            prev = Some(cp.last_processed);
        }

        let cp = store
            .rollback(&target(), &block(105, 0), &block(102, 0))
            .await
            .unwrap();
        assert_eq!(cp.last_processed.number, 102);

        // 100, 101, 102 remain; 103–105 purged
        let records = store.records(&target(), &RecordQuery::table("transfers")).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(store.recorded_hash(&target(), 103).await.unwrap().is_none());
        assert!(store.recorded_hash(&target(), 102).await.unwrap().is_some());

        // Rolling back from a stale position is a conflict.
        let err = store
            .rollback(&target(), &block(105, 0), &block(101, 0))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn targets_are_isolated() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let other = IndexTarget::new("polygon", "test-indexer");
        store.commit(&target(), None, commit(200, vec![record(200, 0, 1)])).await.unwrap();
        store.commit(&other, None, commit(200, vec![record(200, 0, 2)])).await.unwrap();

        store.reset(&target()).await.unwrap();
        assert!(store.load(&target()).await.unwrap().is_none());
        assert!(store.load(&other).await.unwrap().is_some());
        assert_eq!(store.raw_record_count(&other).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_bounds_and_limit() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut prev: Option<BlockRef> = None;
        for n in 1u64..=5 {
            let cp = store
                .commit(&target(), prev.as_ref(), commit(n, vec![record(n, 0, n), record(n, 1, n)]))
                .await
                .unwrap();
            prev = Some(cp.last_processed);
        }
        let query = RecordQuery {
            table: "transfers".into(),
            from_block: Some(2),
            to_block: Some(4),
            limit: Some(5),
        };
        let records = store.records(&target(), &query).await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].block_number, 2);
        assert_eq!(records[4].block_number, 4);
        assert_eq!(records[4].log_index, 0);
    }
}
