//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

pub use alloy_primitives::{Address, Bytes, B256};

// ─── BlockRef ─────────────────────────────────────────────────────────────────

/// Identifies a block unambiguously; used for chain-continuity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block number.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
}

impl BlockRef {
    pub fn new(number: u64, hash: B256, parent_hash: B256) -> Self {
        Self {
            number,
            hash,
            parent_hash,
        }
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockRef) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.number, hash_hex(&self.hash))
    }
}

/// Render a 32-byte hash as `0x`-prefixed lowercase hex.
pub fn hash_hex(hash: &B256) -> String {
    format!("0x{}", hex::encode(hash.as_slice()))
}

// ─── LogPosition ──────────────────────────────────────────────────────────────

/// Canonical ordering key of a log: `(block number, transaction index, log index)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogPosition {
    pub block_number: u64,
    pub transaction_index: u32,
    pub log_index: u32,
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block_number, self.transaction_index, self.log_index
        )
    }
}

// ─── EventLog ─────────────────────────────────────────────────────────────────

/// A raw log emitted by a contract; the atomic unit of ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    /// The block this log belongs to.
    pub block: BlockRef,
    pub transaction_index: u32,
    pub log_index: u32,
    pub transaction_hash: Option<B256>,
    /// Emitting contract.
    pub address: Address,
    /// `topics[0]` is the event selector for non-anonymous events.
    pub topics: Vec<B256>,
    /// ABI-encoded non-indexed parameters.
    pub data: Bytes,
}

impl EventLog {
    pub fn position(&self) -> LogPosition {
        LogPosition {
            block_number: self.block.number,
            transaction_index: self.transaction_index,
            log_index: self.log_index,
        }
    }

    /// The event selector, if the log has one.
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }
}

// ─── BlockWithLogs ────────────────────────────────────────────────────────────

/// A block header together with the logs of interest it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWithLogs {
    pub block: BlockRef,
    pub logs: Vec<EventLog>,
}

impl BlockWithLogs {
    pub fn new(block: BlockRef, mut logs: Vec<EventLog>) -> Self {
        logs.sort_by_key(EventLog::position);
        Self { block, logs }
    }

    /// A block with no logs of interest.
    pub fn empty(block: BlockRef) -> Self {
        Self {
            block,
            logs: Vec::new(),
        }
    }
}

// ─── LogFilter ────────────────────────────────────────────────────────────────

/// Which logs the chain client should return for a block range.
///
/// Built from the handler registry; an empty list matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    pub topic0: Vec<B256>,
}

impl LogFilter {
    pub fn matches(&self, log: &EventLog) -> bool {
        let address_ok = self.addresses.is_empty() || self.addresses.contains(&log.address);
        let topic_ok = self.topic0.is_empty()
            || log.topic0().map_or(false, |t| self.topic0.contains(t));
        address_ok && topic_ok
    }
}

// ─── IndexTarget ──────────────────────────────────────────────────────────────

/// Key of one indexing target: exactly one checkpoint exists per target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexTarget {
    /// Chain slug (e.g. `"ethereum"`).
    pub chain_id: String,
    /// Indexer name.
    pub indexer_id: String,
}

impl IndexTarget {
    pub fn new(chain_id: impl Into<String>, indexer_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            indexer_id: indexer_id.into(),
        }
    }
}

impl std::fmt::Display for IndexTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.indexer_id)
    }
}

/// The current phase of the ingestion loop, exposed to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexPhase {
    /// Catching up to the chain head over bounded ranges.
    CatchUp,
    /// Following new heads as they arrive.
    Live,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
