//! PostgreSQL storage backend for ChainIngest.
//!
//! Same layout and transaction discipline as the SQLite backend, on a pooled
//! Postgres connection. Record payloads are stored as `JSONB`.
//!
//! # Feature Flag
//! Requires the `postgres` feature:
//! ```toml
//! chainingest-storage = { version = "0.1", features = ["postgres"] }
//! ```
//!
//! # Schema
//! Created automatically on first connect:
//! - `ingest_checkpoints`: one row per (chain_id, indexer_id)
//! - `ingest_block_hashes`: recent block hashes for reorg resolution
//! - `ingest_records`: derived records with log provenance

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use chainingest_core::checkpoint::{
    conflict, BlockCommit, Checkpoint, CheckpointStore, DerivedRecord, RecordQuery, RecordReader,
};
use chainingest_core::error::IndexerError;
use chainingest_core::types::{hash_hex, BlockRef, IndexTarget, B256};

use crate::{parse_hash, storage_err};

// ─── Connection options ────────────────────────────────────────────────────────

/// Connection options for the Postgres storage backend.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: u32,
    /// Minimum number of idle connections to keep open (default: 1)
    pub min_connections: u32,
    /// Connection timeout in seconds (default: 30)
    pub connect_timeout_secs: u64,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
        }
    }
}

// ─── PostgresStorage ─────────────────────────────────────────────────────────

/// PostgreSQL-backed storage for checkpoints, block hashes and records.
///
/// Thread-safe and cheaply cloneable: wraps a connection pool internally.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to a PostgreSQL database and initialize the schema.
    ///
    /// The URL format follows libpq convention:
    /// `postgresql://[user[:password]@][host][:port][/dbname]`
    pub async fn connect(database_url: &str) -> Result<Self, IndexerError> {
        Self::connect_with_options(database_url, PostgresOptions::default()).await
    }

    /// Connect with custom pool options.
    pub async fn connect_with_options(
        database_url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, IndexerError> {
        let pool = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(opts.connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| IndexerError::Storage(format!("postgres connect: {e}")))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        info!("PostgresStorage connected and schema initialized");
        Ok(storage)
    }

    /// Create tables and indexes if they don't already exist.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ingest_checkpoints (
                chain_id     TEXT   NOT NULL,
                indexer_id   TEXT   NOT NULL,
                block_number BIGINT NOT NULL,
                block_hash   TEXT   NOT NULL,
                parent_hash  TEXT   NOT NULL,
                updated_at   BIGINT NOT NULL,
                PRIMARY KEY (chain_id, indexer_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ingest_block_hashes (
                chain_id     TEXT   NOT NULL,
                indexer_id   TEXT   NOT NULL,
                block_number BIGINT NOT NULL,
                block_hash   TEXT   NOT NULL,
                PRIMARY KEY (chain_id, indexer_id, block_number)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ingest_records (
                chain_id          TEXT    NOT NULL,
                indexer_id        TEXT    NOT NULL,
                table_name        TEXT    NOT NULL,
                block_number      BIGINT  NOT NULL,
                transaction_index INTEGER NOT NULL,
                log_index         INTEGER NOT NULL,
                record_key        TEXT    NOT NULL,
                data              JSONB   NOT NULL,
                PRIMARY KEY (chain_id, indexer_id, table_name, block_number,
                             transaction_index, log_index, record_key)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ingest_records_block
             ON ingest_records (chain_id, indexer_id, block_number)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!("PostgresStorage schema initialized");
        Ok(())
    }

    /// Expose the underlying pool for custom queries.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn checkpoint_from_row(row: &PgRow) -> Result<Checkpoint, IndexerError> {
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
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for PostgresStorage {
    async fn load(&self, target: &IndexTarget) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT block_number, block_hash, parent_hash, updated_at
             FROM ingest_checkpoints WHERE chain_id = $1 AND indexer_id = $2",
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
                 SET block_number = $1, block_hash = $2, parent_hash = $3, updated_at = $4
                 WHERE chain_id = $5 AND indexer_id = $6 AND block_number = $7 AND block_hash = $8",
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
                 VALUES ($1, $2, $3, $4, $5, $6)
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
            sqlx::query(
                "INSERT INTO ingest_records
                 (chain_id, indexer_id, table_name, block_number, transaction_index,
                  log_index, record_key, data)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (chain_id, indexer_id, table_name, block_number,
                              transaction_index, log_index, record_key)
                 DO UPDATE SET data = EXCLUDED.data",
            )
            .bind(&target.chain_id)
            .bind(&target.indexer_id)
            .bind(&record.table)
            .bind(record.block_number as i64)
            .bind(record.transaction_index as i32)
            .bind(record.log_index as i32)
            .bind(&record.key)
            .bind(Json(&record.data))
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        sqlx::query(
            "INSERT INTO ingest_block_hashes (chain_id, indexer_id, block_number, block_hash)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (chain_id, indexer_id, block_number)
             DO UPDATE SET block_hash = EXCLUDED.block_hash",
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
                 WHERE chain_id = $1 AND indexer_id = $2 AND block_number < $3",
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
             SET block_number = $1, block_hash = $2, parent_hash = $3, updated_at = $4
             WHERE chain_id = $5 AND indexer_id = $6 AND block_number = $7 AND block_hash = $8",
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

        for table in ["ingest_records", "ingest_block_hashes"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE chain_id = $1 AND indexer_id = $2 AND block_number > $3"
            ))
            .bind(&target.chain_id)
            .bind(&target.indexer_id)
            .bind(ancestor.number as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        sqlx::query(
            "INSERT INTO ingest_block_hashes (chain_id, indexer_id, block_number, block_hash)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (chain_id, indexer_id, block_number)
             DO UPDATE SET block_hash = EXCLUDED.block_hash",
        )
        .bind(&target.chain_id)
        .bind(&target.indexer_id)
        .bind(ancestor.number as i64)
        .bind(hash_hex(&ancestor.hash))
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        debug!(indexer = %target, ancestor = ancestor.number, "rolled back storage");

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
             WHERE chain_id = $1 AND indexer_id = $2 AND block_number = $3",
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
                "DELETE FROM {table} WHERE chain_id = $1 AND indexer_id = $2"
            ))
            .bind(&target.chain_id)
            .bind(&target.indexer_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        info!(indexer = %target, "indexer state reset");
        Ok(())
    }
}

// ─── RecordReader impl ───────────────────────────────────────────────────────

#[async_trait]
impl RecordReader for PostgresStorage {
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
             WHERE r.chain_id = $1 AND r.indexer_id = $2 AND r.table_name = $3
               AND r.block_number <= c.block_number
               AND r.block_number >= $4 AND r.block_number <= $5
             ORDER BY r.block_number, r.transaction_index, r.log_index, r.record_key
             LIMIT $6",
        )
        .bind(&target.chain_id)
        .bind(&target.indexer_id)
        .bind(&query.table)
        .bind(query.from_block.map_or(0, |b| b as i64))
        .bind(query.to_block.map_or(i64::MAX, |b| b.min(i64::MAX as u64) as i64))
        .bind(query.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|row| DerivedRecord {
                table: row.get("table_name"),
                key: row.get("record_key"),
                block_number: row.get::<i64, _>("block_number") as u64,
                transaction_index: row.get::<i32, _>("transaction_index") as u32,
                log_index: row.get::<i32, _>("log_index") as u32,
                data: row.get::<Json<serde_json::Value>, _>("data").0,
            })
            .collect())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
