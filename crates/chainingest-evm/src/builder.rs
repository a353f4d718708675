//! Fluent builder API for indexer configuration.
//!
//! # Example
//!
//! ```rust
//! use chainingest_evm::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .chain("ethereum")
//!     .id("usdc-transfers")
//!     .from_block(19_000_000)
//!     .max_reorg_depth(128)
//!     .range_size(500)
//!     .build_config();
//! assert_eq!(config.range.initial, 500);
//! ```

use chainingest_core::indexer::{IndexerConfig, StartPolicy};
use chainingest_core::retry::RetryConfig;

/// Fluent builder for `IndexerConfig`.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Set the indexer ID (used for checkpoint keys).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the chain to index.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Start at a literal block when no checkpoint exists.
    pub fn from_block(mut self, block: u64) -> Self {
        self.config.start = StartPolicy::Block(block);
        self
    }

    /// Start at the node's head when no checkpoint exists.
    pub fn from_latest(mut self) -> Self {
        self.config.start = StartPolicy::Latest;
        self
    }

    /// Set the end block (for bounded backfill).
    pub fn to_block(mut self, block: u64) -> Self {
        self.config.to_block = Some(block);
        self
    }

    /// Blocks behind head at which catch-up hands over to live mode.
    pub fn live_threshold(mut self, blocks: u64) -> Self {
        self.config.live_threshold = blocks;
        self
    }

    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    /// Set the initial number of blocks per catch-up range.
    pub fn range_size(mut self, size: u64) -> Self {
        self.config.range.initial = size;
        self
    }

    /// Bound the adaptive range size.
    pub fn range_bounds(mut self, min: u64, max: u64) -> Self {
        self.config.range.min = min;
        self.config.range.max = max;
        self
    }

    pub fn node_retry(mut self, retry: RetryConfig) -> Self {
        self.config.node_retry = retry;
        self
    }

    pub fn handler_retry(mut self, retry: RetryConfig) -> Self {
        self.config.handler_retry = retry;
        self
    }

    /// Per-call timeout for node requests in milliseconds.
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    /// Wait between head checks when no subscription is available.
    pub fn idle_interval_ms(mut self, ms: u64) -> Self {
        self.config.idle_interval_ms = ms;
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = IndexerBuilder::new().build_config();
        assert_eq!(cfg.chain, "ethereum");
        assert_eq!(cfg.start, StartPolicy::Latest);
        assert_eq!(cfg.max_reorg_depth, 64);
        assert_eq!(cfg.range.initial, 100);
    }

    #[test]
    fn builder_custom() {
        let cfg = IndexerBuilder::new()
            .id("my-indexer")
            .chain("polygon")
            .from_block(50_000_000)
            .to_block(50_001_000)
            .max_reorg_depth(32)
            .range_size(500)
            .range_bounds(10, 1_000)
            .build_config();

        assert_eq!(cfg.id, "my-indexer");
        assert_eq!(cfg.chain, "polygon");
        assert_eq!(cfg.start, StartPolicy::Block(50_000_000));
        assert_eq!(cfg.to_block, Some(50_001_000));
        assert_eq!(cfg.max_reorg_depth, 32);
        assert_eq!(cfg.range.initial, 500);
        assert_eq!((cfg.range.min, cfg.range.max), (10, 1_000));
        assert!(cfg.validate().is_ok());
    }
}
