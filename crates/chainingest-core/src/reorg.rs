//! Reorg detection and common-ancestor resolution.
//!
//! When the node's chain no longer agrees with the blocks we committed, the
//! resolver walks back from the last committed block and compares the hash
//! recorded at each height with the node's current block at that height. The
//! highest height where they agree is the common ancestor; everything above it
//! is rolled back and re-ingested.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chain::ChainClient;
use crate::checkpoint::CheckpointManager;
use crate::error::IndexerError;
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::{BlockRef, B256};

/// Reorgs of at most this many blocks are classified as short.
pub const SHORT_REORG_MAX_DEPTH: u64 = 3;

/// Describes a resolved chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgEvent {
    /// The last committed block when the fork was detected.
    pub detected_at: u64,
    /// Highest block shared by the committed chain and the node's chain.
    pub common_ancestor: BlockRef,
    /// Number of committed blocks rolled back.
    pub depth: u64,
    pub reorg_type: ReorgType,
}

/// Classification of the reorg type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReorgType {
    /// 1–3 blocks.
    Short,
    Deep,
}

impl ReorgType {
    pub fn from_depth(depth: u64) -> Self {
        if depth <= SHORT_REORG_MAX_DEPTH {
            Self::Short
        } else {
            Self::Deep
        }
    }
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Short => write!(f, "short reorg"),
            Self::Deep => write!(f, "deep reorg"),
        }
    }
}

/// Returns `true` if `head` cannot be appended after `last`.
///
/// `recorded` is the hash we committed at `head.number`, if any.
pub fn is_discontinuous(head: &BlockRef, last: &BlockRef, recorded: Option<&B256>) -> bool {
    if head.number == last.number + 1 {
        return head.parent_hash != last.hash;
    }
    match recorded {
        Some(hash) if head.number <= last.number => *hash != head.hash,
        _ => false,
    }
}

/// Finds the common ancestor within a bounded lookback window.
#[derive(Debug, Clone)]
pub struct ReorgResolver {
    max_depth: u64,
}

impl ReorgResolver {
    pub fn new(max_depth: u64) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> u64 {
        self.max_depth
    }

    /// Walk back from the last committed block looking for the common ancestor.
    ///
    /// Checks at most `max_depth + 1` heights. A height with no recorded hash
    /// lies below the first indexed block, so the node's block there is the
    /// ancestor. Returns `ReorgTooDeep` if no height matches; nothing is
    /// modified in that case.
    pub async fn find_common_ancestor<C: ChainClient + ?Sized>(
        &self,
        client: &C,
        checkpoints: &CheckpointManager,
        retry: &RetryPolicy,
        timeout: Duration,
    ) -> Result<ReorgEvent, IndexerError> {
        let last = checkpoints
            .last_block()
            .ok_or_else(|| IndexerError::Config("reorg recovery without a checkpoint".into()))?;
        let floor = last.number.saturating_sub(self.max_depth);

        for height in (floor..=last.number).rev() {
            let canonical = retry_transient(retry, timeout, "eth_getBlockByNumber", || {
                client.block(height)
            })
            .await?;
            // The node may not have re-grown this height yet.
            let Some(canonical) = canonical else {
                continue;
            };

            let ancestor = match checkpoints.recorded_hash(height).await? {
                Some(hash) if hash == canonical.hash => canonical,
                Some(_) => {
                    tracing::debug!(height, "recorded hash differs from node");
                    continue;
                }
                None => canonical,
            };

            let depth = last.number - ancestor.number;
            let reorg_type = ReorgType::from_depth(depth);
            tracing::warn!(
                detected_at = last.number,
                ancestor = ancestor.number,
                depth,
                reorg_type = %reorg_type,
                "reorg resolved"
            );
            return Ok(ReorgEvent {
                detected_at: last.number,
                common_ancestor: ancestor,
                depth,
                reorg_type,
            });
        }

        tracing::error!(
            from = last.number,
            max_depth = self.max_depth,
            "no common ancestor within lookback window"
        );
        Err(IndexerError::ReorgTooDeep {
            from: last.number,
            max_depth: self.max_depth,
        })
    }
}
