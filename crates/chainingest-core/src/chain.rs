//! The chain client boundary: pure I/O, no business logic, so it can be faked
//! in tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ClientError;
use crate::types::{BlockRef, BlockWithLogs, LogFilter};

/// Lazy, infinite stream of new chain heads. Dropping it cancels the subscription.
pub type HeadStream = BoxStream<'static, Result<BlockRef, ClientError>>;

/// Access to a chain node: request/response for history, push for new heads.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block number.
    async fn head_number(&self) -> Result<u64, ClientError>;

    /// Fetch a block reference by number; `None` if the node has no such block.
    async fn block(&self, number: u64) -> Result<Option<BlockRef>, ClientError>;

    /// Fetch every block in `[start, end]` in ascending order, each with the logs
    /// matching `filter`, sorted by `(transaction_index, log_index)`.
    async fn block_range(
        &self,
        start: u64,
        end: u64,
        filter: &LogFilter,
    ) -> Result<Vec<BlockWithLogs>, ClientError>;

    /// Subscribe to new heads.
    async fn subscribe_new_heads(&self) -> Result<HeadStream, ClientError>;
}

#[async_trait]
impl<T: ChainClient + ?Sized> ChainClient for Arc<T> {
    async fn head_number(&self) -> Result<u64, ClientError> {
        (**self).head_number().await
    }

    async fn block(&self, number: u64) -> Result<Option<BlockRef>, ClientError> {
        (**self).block(number).await
    }

    async fn block_range(
        &self,
        start: u64,
        end: u64,
        filter: &LogFilter,
    ) -> Result<Vec<BlockWithLogs>, ClientError> {
        (**self).block_range(start, end, filter).await
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream, ClientError> {
        (**self).subscribe_new_heads().await
    }
}
