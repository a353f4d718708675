//! The ingestion loop: orchestrates catch-up, live, and reorg-recovery phases.
//!
//! # CatchingUp
//! Fetch bounded ranges `[next, min(next + size - 1, head, to_block)]`, verify
//! each block links to the last committed one, apply handlers, commit per
//! block. Switch to live once within `live_threshold` blocks of head.
//!
//! # Live
//! Drain new heads from a spawned subscription task:
//!   - next block with the right parent → fetch, apply, commit
//!   - gap → back to catch-up
//!   - parent mismatch / replaced known block → reorg recovery
//!   - subscription failure → back to catch-up (re-subscribe later)
//!
//! # ReorgRecovery
//! Find the common ancestor, roll back to it atomically, notify reorg
//! handlers, resume catch-up from `ancestor + 1`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use chainingest_core::chain::{ChainClient, HeadStream};
use chainingest_core::checkpoint::{CheckpointManager, IndexStore};
use chainingest_core::cursor::Cursor;
use chainingest_core::error::{ClientError, IndexerError};
use chainingest_core::handler::{HandlerRegistry, TxnContext};
use chainingest_core::indexer::{IndexerConfig, IndexerState, StartPolicy, StopSignal};
use chainingest_core::range::AdaptiveRange;
use chainingest_core::reorg::{is_discontinuous, ReorgResolver};
use chainingest_core::retry::{retry_transient, RetryPolicy};
use chainingest_core::types::{hash_hex, BlockRef, BlockWithLogs, IndexPhase, LogFilter};

/// Why the loop left its run: a stop request or a fatal error.
enum Halt {
    Stopped,
    Failed(IndexerError),
}

impl From<IndexerError> for Halt {
    fn from(e: IndexerError) -> Self {
        Self::Failed(e)
    }
}

type Step<T> = Result<T, Halt>;

type HeadQueue = mpsc::Receiver<Result<BlockRef, ClientError>>;

/// What to do with a head received while live.
#[derive(Debug, PartialEq, Eq)]
enum HeadAction {
    Apply,
    Ignore,
    Gap,
    Reorg,
}

/// Aborts the head subscription task when the live phase ends.
struct SubscriptionTask(JoinHandle<()>);

impl Drop for SubscriptionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The core ingestion loop for one target.
pub struct IndexLoop<C> {
    config: IndexerConfig,
    client: C,
    registry: Arc<HandlerRegistry>,
    filter: LogFilter,
    checkpoints: CheckpointManager,
    resolver: ReorgResolver,
    range: AdaptiveRange,
    node_retry: RetryPolicy,
    handler_retry: RetryPolicy,
    timeout: Duration,
    state: Arc<watch::Sender<IndexerState>>,
    stop: StopSignal,
}

impl<C: ChainClient> IndexLoop<C> {
    pub fn new(
        config: IndexerConfig,
        client: C,
        store: Arc<dyn IndexStore>,
        registry: Arc<HandlerRegistry>,
        state: Arc<watch::Sender<IndexerState>>,
        stop: StopSignal,
    ) -> Self {
        let checkpoints = CheckpointManager::new(store, config.target(), config.max_reorg_depth);
        Self {
            filter: registry.filter(),
            resolver: ReorgResolver::new(config.max_reorg_depth),
            range: AdaptiveRange::new(&config.range),
            node_retry: RetryPolicy::new(config.node_retry.clone()),
            handler_retry: RetryPolicy::new(config.handler_retry.clone()),
            timeout: Duration::from_millis(config.request_timeout_ms),
            checkpoints,
            registry,
            client,
            state,
            stop,
            config,
        }
    }

    /// Run until stopped, `to_block` is committed, or a fatal error.
    ///
    /// The final state (`Stopped` or `Failed`) is published before returning.
    pub async fn run(mut self) -> Result<(), IndexerError> {
        let target = self.checkpoints.target().clone();
        match self.run_phases().await {
            Ok(()) | Err(Halt::Stopped) => {
                tracing::info!(indexer = %target, "indexer stopped");
                self.state.send_replace(IndexerState::Stopped);
                Ok(())
            }
            Err(Halt::Failed(e)) => {
                tracing::error!(indexer = %target, kind = %e.kind(), error = %e, "indexer halted");
                self.state.send_replace(IndexerState::Failed);
                Err(e)
            }
        }
    }

    async fn run_phases(&mut self) -> Step<()> {
        let mut cursor = self.resume().await?;
        let mut phase = IndexerState::CatchingUp;

        loop {
            if self.stop.is_stopped() {
                return Err(Halt::Stopped);
            }
            if self.reached_end(&cursor) {
                tracing::info!(to_block = ?self.config.to_block, "end block committed");
                return Ok(());
            }
            self.publish(phase);
            phase = match phase {
                IndexerState::CatchingUp => self.catch_up(&mut cursor).await?,
                IndexerState::Live => self.follow(&mut cursor).await?,
                IndexerState::ReorgRecovery => self.recover(&mut cursor).await?,
                IndexerState::Idle | IndexerState::Stopped | IndexerState::Failed => return Ok(()),
            };
        }
    }

    async fn resume(&mut self) -> Step<Cursor> {
        let checkpoint = self.checkpoints.load().await?;
        let start = match self.config.start {
            StartPolicy::Block(n) => n,
            StartPolicy::Latest => self.node("eth_blockNumber", || self.client.head_number()).await?,
        };
        let cursor = Cursor::resume(checkpoint.as_ref(), start);
        match &checkpoint {
            Some(cp) => tracing::info!(
                block = cp.last_processed.number,
                hash = %hash_hex(&cp.last_processed.hash),
                "resuming from checkpoint"
            ),
            None => tracing::info!(start = cursor.next_block(), policy = %self.config.start, "no checkpoint, starting fresh"),
        }
        Ok(cursor)
    }

    fn publish(&self, phase: IndexerState) {
        let previous = self.state.send_replace(phase);
        if previous != phase {
            tracing::info!(from = %previous, to = %phase, "phase transition");
        }
    }

    fn reached_end(&self, cursor: &Cursor) -> bool {
        match (self.config.to_block, cursor.last()) {
            (Some(end), Some(last)) => last.number >= end,
            _ => false,
        }
    }

    /// A node call with timeout and retries, abandoned if a stop is requested.
    async fn node<T, F, Fut>(&self, operation: &str, call: F) -> Step<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        tokio::select! {
            biased;
            _ = self.stop.stopped() => Err(Halt::Stopped),
            result = retry_transient(&self.node_retry, self.timeout, operation, call) => Ok(result?),
        }
    }

    /// Sleep for the idle interval, or less if a stop is requested.
    async fn idle(&self) -> Step<()> {
        tokio::select! {
            biased;
            _ = self.stop.stopped() => Err(Halt::Stopped),
            _ = tokio::time::sleep(Duration::from_millis(self.config.idle_interval_ms)) => Ok(()),
        }
    }

    // ─── CatchingUp ───────────────────────────────────────────────────────────

    async fn catch_up(&mut self, cursor: &mut Cursor) -> Step<IndexerState> {
        let head = self.node("eth_blockNumber", || self.client.head_number()).await?;
        let next = cursor.next_block();
        let limit = self.config.to_block.map_or(head, |end| end.min(head));
        if next > limit {
            return Ok(IndexerState::Live);
        }
        let end = self.range.end_for(next).min(limit);

        let fetched = self
            .node("eth_getLogs", || self.client.block_range(next, end, &self.filter))
            .await;
        let blocks = match fetched {
            Ok(blocks) => blocks,
            Err(Halt::Failed(IndexerError::Client(ClientError::RangeTooLarge { start, end, reason }))) => {
                if !self.range.shrink() {
                    return Err(IndexerError::Client(ClientError::RangeTooLarge { start, end, reason }).into());
                }
                tracing::warn!(start, end, size = self.range.size(), reason = %reason, "range too large, shrinking");
                return Ok(IndexerState::CatchingUp);
            }
            Err(halt) => return Err(halt),
        };

        tracing::info!(from = next, to = end, head, size = self.range.size(), "catching up");
        for block in blocks {
            if !cursor.accepts(&block.block) {
                return self.reject(cursor, &block.block);
            }
            self.process_block(cursor, block, IndexPhase::CatchUp).await?;
            if self.reached_end(cursor) {
                return Ok(IndexerState::CatchingUp);
            }
            if self.stop.is_stopped() {
                return Err(Halt::Stopped);
            }
        }
        self.range.record_success();

        let lag = cursor.lag(head);
        if lag <= self.config.live_threshold {
            tracing::info!(head, lag, "caught up with chain head");
            Ok(IndexerState::Live)
        } else {
            Ok(IndexerState::CatchingUp)
        }
    }

    /// A fetched block that doesn't fit the cursor: a fork if it is the next
    /// height, a node error otherwise.
    fn reject(&self, cursor: &Cursor, block: &BlockRef) -> Step<IndexerState> {
        if block.number == cursor.next_block() {
            tracing::warn!(
                block = block.number,
                parent = %hash_hex(&block.parent_hash),
                expected = ?cursor.last().map(|b| hash_hex(&b.hash)),
                "parent hash mismatch"
            );
            return Ok(IndexerState::ReorgRecovery);
        }
        Err(IndexerError::Client(ClientError::MalformedResponse(format!(
            "expected block {}, node returned {}",
            cursor.next_block(),
            block.number
        )))
        .into())
    }

    /// Apply handlers to one block and commit it with its records.
    ///
    /// A stop request abandons the block while handlers run or back off;
    /// the commit itself is never interrupted.
    async fn process_block(
        &mut self,
        cursor: &mut Cursor,
        block: BlockWithLogs,
        phase: IndexPhase,
    ) -> Step<()> {
        let mut ctx = TxnContext::new(self.checkpoints.target().clone(), block.block, phase);
        let applied = tokio::select! {
            biased;
            _ = self.stop.stopped() => {
                tracing::debug!(block = block.block.number, "stop requested, block abandoned before commit");
                return Err(Halt::Stopped);
            }
            r = self.registry.apply_block(&block.logs, &mut ctx, &self.handler_retry) => r?,
        };
        let records = ctx.into_records();
        let written = records.len();
        self.checkpoints.commit_block(block.block, records).await?;
        cursor.advance(block.block);
        tracing::debug!(
            block = block.block.number,
            hash = %hash_hex(&block.block.hash),
            logs = block.logs.len(),
            applied,
            records = written,
            "block committed"
        );
        Ok(())
    }

    // ─── Live ─────────────────────────────────────────────────────────────────

    /// Forward `stream` into a bounded queue from its own task; the first error
    /// ends the subscription.
    fn spawn_subscription(&self, mut stream: HeadStream) -> (SubscriptionTask, HeadQueue) {
        let (tx, rx) = mpsc::channel(self.config.head_queue_capacity);
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        (SubscriptionTask(task), rx)
    }

    async fn follow(&mut self, cursor: &mut Cursor) -> Step<IndexerState> {
        let subscribed = tokio::select! {
            biased;
            _ = self.stop.stopped() => return Err(Halt::Stopped),
            r = tokio::time::timeout(self.timeout, self.client.subscribe_new_heads()) => r,
        };
        let stream = match subscribed {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "head subscription failed");
                self.idle().await?;
                return Ok(IndexerState::CatchingUp);
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.config.request_timeout_ms, "head subscription timed out");
                return Ok(IndexerState::CatchingUp);
            }
        };
        let (_task, mut heads) = self.spawn_subscription(stream);

        loop {
            let head = tokio::select! {
                biased;
                _ = self.stop.stopped() => return Err(Halt::Stopped),
                head = heads.recv() => head,
            };
            let head = match head {
                Some(Ok(head)) => head,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "head subscription error");
                    self.idle().await?;
                    return Ok(IndexerState::CatchingUp);
                }
                None => {
                    tracing::warn!("head subscription ended");
                    self.idle().await?;
                    return Ok(IndexerState::CatchingUp);
                }
            };

            match self.classify_head(cursor, &head).await? {
                HeadAction::Ignore => {
                    tracing::trace!(block = head.number, "head already processed");
                }
                HeadAction::Gap => {
                    tracing::debug!(head = head.number, next = cursor.next_block(), "gap behind head");
                    return Ok(IndexerState::CatchingUp);
                }
                HeadAction::Reorg => {
                    tracing::warn!(
                        head = head.number,
                        hash = %hash_hex(&head.hash),
                        last = ?cursor.last().map(|b| b.number),
                        "head does not extend committed chain"
                    );
                    return Ok(IndexerState::ReorgRecovery);
                }
                HeadAction::Apply => {
                    let number = head.number;
                    let mut blocks = self
                        .node("eth_getLogs", || self.client.block_range(number, number, &self.filter))
                        .await?;
                    let Some(block) = blocks.pop() else {
                        return Ok(IndexerState::CatchingUp);
                    };
                    if !cursor.accepts(&block.block) {
                        return self.reject(cursor, &block.block);
                    }
                    self.process_block(cursor, block, IndexPhase::Live).await?;
                    if self.reached_end(cursor) {
                        return Ok(IndexerState::Live);
                    }
                }
            }
        }
    }

    async fn classify_head(&self, cursor: &Cursor, head: &BlockRef) -> Result<HeadAction, IndexerError> {
        let next = cursor.next_block();
        let Some(last) = cursor.last().copied() else {
            return Ok(match head.number {
                n if n == next => HeadAction::Apply,
                n if n > next => HeadAction::Gap,
                _ => HeadAction::Ignore,
            });
        };

        let recorded = if head.number <= last.number {
            self.checkpoints.recorded_hash(head.number).await?
        } else {
            None
        };
        if is_discontinuous(head, &last, recorded.as_ref()) {
            return Ok(HeadAction::Reorg);
        }
        Ok(if head.number == next {
            HeadAction::Apply
        } else if head.number > next {
            HeadAction::Gap
        } else {
            HeadAction::Ignore
        })
    }

    // ─── ReorgRecovery ────────────────────────────────────────────────────────

    async fn recover(&mut self, cursor: &mut Cursor) -> Step<IndexerState> {
        let event = tokio::select! {
            biased;
            _ = self.stop.stopped() => return Err(Halt::Stopped),
            r = self.resolver.find_common_ancestor(&self.client, &self.checkpoints, &self.node_retry, self.timeout) => r?,
        };

        if event.depth == 0 {
            tracing::debug!(block = event.common_ancestor.number, "committed chain still canonical");
            cursor.rewind_to(event.common_ancestor);
            self.idle().await?;
            return Ok(IndexerState::CatchingUp);
        }

        self.checkpoints.rollback_to(event.common_ancestor).await?;
        cursor.rewind_to(event.common_ancestor);
        self.registry.dispatch_reorg(&event).await?;
        tracing::warn!(
            ancestor = event.common_ancestor.number,
            depth = event.depth,
            reorg_type = %event.reorg_type,
            "rolled back, re-ingesting"
        );
        Ok(IndexerState::CatchingUp)
    }
}
