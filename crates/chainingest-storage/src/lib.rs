//! chainingest-storage: pluggable storage backends for ChainIngest.
//!
//! Backends:
//! - [`memory`]: in-memory (dev/testing, no persistence)
//! - `sqlite`: SQLite via `sqlx` (embedded, single-file persistence)
//! - `postgres`: PostgreSQL via `sqlx`
//!
//! Every backend implements both `CheckpointStore` (the engine's side) and
//! `RecordReader` (the query side), so one `Arc<dyn IndexStore>` serves both.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use chainingest_core::checkpoint::IndexStore;
use chainingest_core::error::IndexerError;

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStorage;

/// Which backend to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Sqlite { path: String },
    Postgres { url: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: "./chainingest.db".into(),
        }
    }
}

impl StorageConfig {
    /// Interpret a database URL: `memory`, `postgres://…`/`postgresql://…`,
    /// or a SQLite path/URL.
    pub fn from_url(url: &str) -> Self {
        let url = url.trim();
        if url.eq_ignore_ascii_case("memory") {
            Self::Memory
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Self::Postgres { url: url.into() }
        } else {
            Self::Sqlite { path: url.into() }
        }
    }
}

/// Open the configured backend.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn IndexStore>, IndexerError> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(InMemoryStorage::new())),
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            tracing::info!(path = %path, "opening SQLite storage");
            Ok(Arc::new(sqlite::SqliteStorage::open(path).await?))
        }
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres { url } => Ok(Arc::new(postgres::PostgresStorage::connect(url).await?)),
        #[allow(unreachable_patterns)]
        other => Err(IndexerError::Config(format!(
            "storage backend {other:?} is not compiled in"
        ))),
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
fn parse_hash(s: &str) -> Result<chainingest_core::types::B256, IndexerError> {
    s.parse()
        .map_err(|e| IndexerError::Storage(format!("stored hash '{s}' is invalid: {e}")))
}
