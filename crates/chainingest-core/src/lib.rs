//! chainingest-core: foundation for the reorg-safe event ingestion engine.
//!
//! # Architecture
//!
//! ```text
//! Indexer → IndexLoop
//!               ├── ChainClient       (node access, faked in tests)
//!               ├── Cursor            (next block, parent-hash continuity)
//!               ├── HandlerRegistry   (decoders + user handlers, staged writes)
//!               ├── ReorgResolver     (common-ancestor walk, bounded depth)
//!               ├── CheckpointManager (atomic block commit, compare-and-swap)
//!               └── Storage backend   (memory / SQLite / Postgres)
//! ```

pub mod abi;
pub mod chain;
pub mod checkpoint;
pub mod cursor;
pub mod error;
pub mod handler;
pub mod indexer;
pub mod range;
pub mod reorg;
pub mod retry;
pub mod types;

pub use abi::{AbiDecoder, DecodedEvent, EventDecoder, EventSignature};
pub use chain::{ChainClient, HeadStream};
pub use checkpoint::{
    BlockCommit, Checkpoint, CheckpointManager, CheckpointStore, DerivedRecord, IndexStore,
    RecordQuery, RecordReader,
};
pub use cursor::Cursor;
pub use error::{ClientError, DecodeError, ErrorKind, HandlerError, IndexerError};
pub use handler::{
    handler_fn, EventHandler, HandlerRegistry, ProjectionHandler, Registration, ReorgHandler,
    TxnContext,
};
pub use indexer::{IndexerConfig, IndexerState, StartPolicy, StopSignal};
pub use range::{AdaptiveRange, RangeConfig};
pub use reorg::{ReorgEvent, ReorgResolver, ReorgType};
pub use retry::{RetryConfig, RetryPolicy};
pub use types::{
    Address, BlockRef, BlockWithLogs, Bytes, EventLog, IndexPhase, IndexTarget, LogFilter,
    LogPosition, B256,
};
