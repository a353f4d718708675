//! End-to-end ingestion tests against a scripted chain and in-memory storage.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use chainingest_core::abi::{DecodedEvent, EventSignature};
use chainingest_core::checkpoint::{IndexStore, RecordQuery, RecordReader};
use chainingest_core::error::{ClientError, ErrorKind, HandlerError, IndexerError};
use chainingest_core::handler::{
    handler_fn, EventHandler, ProjectionHandler, ReorgHandler, TxnContext,
};
use chainingest_core::indexer::{IndexerConfig, IndexerState};
use chainingest_core::reorg::{ReorgEvent, ReorgType};
use chainingest_core::retry::RetryConfig;
use chainingest_core::types::{BlockRef, B256};
use chainingest_evm::Indexer;
use chainingest_storage::InMemoryStorage;

use common::*;

const APPROVAL: &str = "Approval(address indexed owner, address indexed spender, uint256 value)";

fn projection_indexer(
    cfg: &IndexerConfig,
    chain: &Arc<FakeChain>,
    store: &Arc<dyn IndexStore>,
) -> Indexer<Arc<FakeChain>> {
    let mut indexer = Indexer::new(cfg.clone(), chain.clone(), store.clone());
    indexer
        .register(token(), TRANSFER, Arc::new(ProjectionHandler::new("transfers")))
        .unwrap();
    indexer
}

async fn run(indexer: &mut Indexer<Arc<FakeChain>>) -> Result<(), IndexerError> {
    indexer.start()?;
    indexer.wait().await
}

fn bounded(id: &str, start: u64, end: u64) -> IndexerConfig {
    let mut cfg = config(id, start);
    cfg.to_block = Some(end);
    cfg
}

#[derive(Default)]
struct ReorgLog(Mutex<Vec<ReorgEvent>>);

#[async_trait]
impl ReorgHandler for ReorgLog {
    async fn on_reorg(&self, event: &ReorgEvent) -> Result<(), HandlerError> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ─── Ordering & idempotence ───────────────────────────────────────────────────

#[tokio::test]
async fn backfill_commits_every_block_in_order() {
    let chain = FakeChain::new();
    chain.grow(1..=20, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let mut cfg = bounded("ordered", 1, 20);
    cfg.range.initial = 7;

    let mut indexer = projection_indexer(&cfg, &chain, &store);
    run(&mut indexer).await.unwrap();

    assert_eq!(indexer.state(), IndexerState::Stopped);
    assert_eq!(chain.range_calls(), vec![(1, 7), (8, 14), (15, 20)]);
    assert_eq!(values(&transfers(&store, &cfg).await), (1..=20).collect::<Vec<_>>());
    let cp = indexer.checkpoint().await.unwrap().unwrap();
    assert_eq!(cp.last_processed, BlockRef::new(20, hash(20, 0), hash(19, 0)));
}

#[tokio::test]
async fn crash_between_records_and_checkpoint_resumes_without_duplicates() {
    let chain = FakeChain::new();
    chain.grow(1..=10, 0);
    let memory = Arc::new(InMemoryStorage::new());
    let store: Arc<dyn IndexStore> = memory.clone();

    run(&mut projection_indexer(&bounded("crash", 1, 5), &chain, &store)).await.unwrap();

    // Block 6's records land, its checkpoint write does not.
    memory.crash_next_commit();
    let cfg = bounded("crash", 1, 10);
    let mut crashed = projection_indexer(&cfg, &chain, &store);
    let err = run(&mut crashed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(crashed.state(), IndexerState::Failed);
    assert_eq!(crashed.checkpoint().await.unwrap().unwrap().last_processed.number, 5);
    assert_eq!(memory.raw_record_count(&cfg.target()), 6);
    assert_eq!(values(&transfers(&store, &cfg).await), vec![1, 2, 3, 4, 5]);

    // Restart replays block 6 and converges.
    run(&mut projection_indexer(&cfg, &chain, &store)).await.unwrap();
    assert_eq!(memory.raw_record_count(&cfg.target()), 10);

    // Identical to an uninterrupted run.
    let fresh: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    run(&mut projection_indexer(&cfg, &chain, &fresh)).await.unwrap();
    assert_eq!(transfers(&store, &cfg).await, transfers(&fresh, &cfg).await);
}

#[tokio::test]
async fn crash_then_reorg_of_the_crashed_block_leaves_no_orphans() {
    let chain = FakeChain::new();
    chain.grow(1..=6, 0);
    chain.add_transfer(6, 1, 9999);
    let memory = Arc::new(InMemoryStorage::new());
    let store: Arc<dyn IndexStore> = memory.clone();
    let cfg = bounded("crash-reorg", 1, 6);

    run(&mut projection_indexer(&bounded("crash-reorg", 1, 5), &chain, &store)).await.unwrap();
    memory.crash_next_commit();
    let err = run(&mut projection_indexer(&cfg, &chain, &store)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(memory.raw_record_count(&cfg.target()), 7);

    // Block 6 is replaced by a block without the second Transfer.
    chain.grow(6..=6, 1);
    let mut indexer = projection_indexer(&cfg, &chain, &store);
    run(&mut indexer).await.unwrap();

    assert_eq!(values(&transfers(&store, &cfg).await), vec![1, 2, 3, 4, 5, 1006]);
    assert_eq!(memory.raw_record_count(&cfg.target()), 6);
    let cp = indexer.checkpoint().await.unwrap().unwrap();
    assert_eq!(cp.last_processed.hash, hash(6, 1));
}

#[tokio::test]
async fn restart_after_completion_is_a_no_op() {
    let chain = FakeChain::new();
    chain.grow(1..=5, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let cfg = bounded("again", 1, 5);

    let mut indexer = projection_indexer(&cfg, &chain, &store);
    run(&mut indexer).await.unwrap();
    let calls = chain.range_calls().len();

    // Second run resumes at the checkpoint, which is already the end block.
    run(&mut indexer).await.unwrap();
    assert_eq!(chain.range_calls().len(), calls);
    assert_eq!(values(&transfers(&store, &cfg).await), vec![1, 2, 3, 4, 5]);
}

// ─── Reorgs ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reorg_replacing_100_rolls_back_to_99() {
    let chain = FakeChain::new();
    chain.grow(95..=105, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    run(&mut projection_indexer(&bounded("reorg", 95, 105), &chain, &store)).await.unwrap();

    // 100' replaces 100 and the fork grows one block past our checkpoint.
    chain.grow(100..=106, 1);
    let cfg = bounded("reorg", 95, 106);
    let reorgs = Arc::new(ReorgLog::default());
    let mut indexer = projection_indexer(&cfg, &chain, &store);
    indexer.on_reorg(reorgs.clone()).unwrap();
    run(&mut indexer).await.unwrap();

    let events = reorgs.0.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].detected_at, 105);
    assert_eq!(events[0].common_ancestor, BlockRef::new(99, hash(99, 0), hash(98, 0)));
    assert_eq!(events[0].depth, 6);
    assert_eq!(events[0].reorg_type, ReorgType::Deep);

    let mut expected: Vec<u64> = (95..=99).collect();
    expected.extend(1100..=1106);
    assert_eq!(values(&transfers(&store, &cfg).await), expected);
    let cp = indexer.checkpoint().await.unwrap().unwrap();
    assert_eq!(cp.last_processed.hash, hash(106, 1));
}

#[tokio::test]
async fn reorg_deeper_than_window_halts_without_deleting() {
    let chain = FakeChain::new();
    chain.grow(95..=105, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let mut cfg = bounded("deep", 95, 105);
    cfg.max_reorg_depth = 3;
    run(&mut projection_indexer(&cfg, &chain, &store)).await.unwrap();

    // Every height we know was replaced.
    chain.grow(95..=106, 2);
    cfg.to_block = Some(106);
    let mut indexer = projection_indexer(&cfg, &chain, &store);
    let err = run(&mut indexer).await.unwrap_err();

    assert!(matches!(err, IndexerError::ReorgTooDeep { from: 105, max_depth: 3 }));
    assert_eq!(err.kind(), ErrorKind::ChainAnomaly);
    assert_eq!(indexer.state(), IndexerState::Failed);
    let cp = indexer.checkpoint().await.unwrap().unwrap();
    assert_eq!(cp.last_processed.hash, hash(105, 0));
    assert_eq!(values(&transfers(&store, &cfg).await), (95..=105).collect::<Vec<_>>());
}

// ─── Concurrent writers ────────────────────────────────────────────────────────

/// Projects Transfers, but holds its first event until the gate opens.
#[derive(Default)]
struct GatedProjection {
    entered: AtomicBool,
    gate: Notify,
}

#[async_trait]
impl EventHandler for GatedProjection {
    async fn apply(&self, event: &DecodedEvent, ctx: &mut TxnContext) -> Result<(), HandlerError> {
        if !self.entered.swap(true, Ordering::SeqCst) {
            self.gate.notified().await;
        }
        ctx.upsert("transfers", "Transfer", &event.fields)
    }
}

#[tokio::test]
async fn second_indexer_on_the_same_target_halts_with_conflict() {
    let chain = FakeChain::new();
    chain.grow(1..=3, 0);
    let memory = Arc::new(InMemoryStorage::new());
    let store: Arc<dyn IndexStore> = memory.clone();
    let cfg = bounded("shared", 1, 3);

    let gated = Arc::new(GatedProjection::default());
    let mut slow = Indexer::new(cfg.clone(), chain.clone(), store.clone());
    slow.register(token(), TRANSFER, gated.clone()).unwrap();
    slow.start().unwrap();
    eventually("slow indexer inside block 1", || async {
        gated.entered.load(Ordering::SeqCst)
    })
    .await;

    // The other writer commits 1..=3 while the slow one still expects no checkpoint.
    run(&mut projection_indexer(&cfg, &chain, &store)).await.unwrap();
    gated.gate.notify_one();

    let err = slow.wait().await.unwrap_err();
    assert!(matches!(err, IndexerError::Conflict { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(slow.state(), IndexerState::Failed);

    assert_eq!(values(&transfers(&store, &cfg).await), vec![1, 2, 3]);
    assert_eq!(memory.raw_record_count(&cfg.target()), 3);
    let cp = slow.checkpoint().await.unwrap().unwrap();
    assert_eq!(cp.last_processed.hash, hash(3, 0));
}

// ─── Registration & decoding ──────────────────────────────────────────────────

#[tokio::test]
async fn unregistered_logs_are_skipped() {
    let chain = FakeChain::new();
    chain.grow(1..=3, 0);
    let selector = EventSignature::parse(TRANSFER).unwrap().selector();
    // Passes the node filter (known address and selector) but no registration
    // pairs them.
    chain.add_log(2, 1, other_contract(), selector);
    chain.add_log(2, 2, token(), B256::repeat_byte(0x77));

    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let cfg = bounded("skip", 1, 3);
    let mut indexer = projection_indexer(&cfg, &chain, &store);
    indexer
        .register(other_contract(), APPROVAL, Arc::new(ProjectionHandler::new("approvals")))
        .unwrap();
    run(&mut indexer).await.unwrap();

    assert_eq!(values(&transfers(&store, &cfg).await), vec![1, 2, 3]);
    let approvals = store
        .records(
            &cfg.target(),
            &RecordQuery::table("approvals"),
        )
        .await
        .unwrap();
    assert!(approvals.is_empty());
}

#[tokio::test]
async fn decode_failure_halts_with_log_context() {
    let chain = FakeChain::new();
    chain.grow(1..=3, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let cfg = bounded("decode", 1, 3);

    // Same selector, but only one indexed parameter: the logs carry two.
    let mut indexer = Indexer::new(cfg.clone(), chain.clone(), store.clone());
    indexer
        .register(
            token(),
            "Transfer(address indexed from, address to, uint256 value)",
            Arc::new(ProjectionHandler::new("transfers")),
        )
        .unwrap();
    let err = run(&mut indexer).await.unwrap_err();

    match err {
        IndexerError::Decode { position, address, .. } => {
            assert_eq!(position.block_number, 1);
            assert_eq!(address, token());
        }
        other => panic!("expected decode error, got {other:?}"),
    }
    assert!(indexer.checkpoint().await.unwrap().is_none());
}

// ─── Handler failures ─────────────────────────────────────────────────────────

#[tokio::test]
async fn flaky_handler_is_retried() {
    let chain = FakeChain::new();
    chain.grow(1..=3, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let cfg = bounded("flaky", 1, 3);

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut indexer = Indexer::new(cfg.clone(), chain.clone(), store.clone());
    indexer
        .register(
            token(),
            TRANSFER,
            handler_fn(move |event: &DecodedEvent, ctx: &mut TxnContext| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(HandlerError::new("database busy"));
                }
                ctx.upsert("transfers", "Transfer", &event.fields)
            }),
        )
        .unwrap();
    run(&mut indexer).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(values(&transfers(&store, &cfg).await), vec![1, 2, 3]);
}

#[tokio::test]
async fn persistent_handler_failure_halts_before_commit() {
    let chain = FakeChain::new();
    chain.grow(1..=3, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let cfg = bounded("broken", 1, 3);

    let mut indexer = Indexer::new(cfg.clone(), chain.clone(), store.clone());
    indexer
        .register(
            token(),
            TRANSFER,
            handler_fn(|event: &DecodedEvent, ctx: &mut TxnContext| {
                if event.position.block_number == 2 {
                    return Err(HandlerError::new("constraint violated"));
                }
                ctx.upsert("transfers", "Transfer", &event.fields)
            }),
        )
        .unwrap();
    let err = run(&mut indexer).await.unwrap_err();

    assert!(matches!(err, IndexerError::HandlerFailed { attempts: 3, .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Handler);
    assert_eq!(indexer.checkpoint().await.unwrap().unwrap().last_processed.number, 1);
    assert_eq!(values(&transfers(&store, &cfg).await), vec![1]);
}

// ─── Node failures ────────────────────────────────────────────────────────────

#[tokio::test]
async fn range_too_large_shrinks_the_range() {
    let chain = FakeChain::new();
    chain.grow(1..=40, 0);
    chain.limit_range(10);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let mut cfg = bounded("shrink", 1, 40);
    cfg.range.initial = 64;

    run(&mut projection_indexer(&cfg, &chain, &store)).await.unwrap();

    let calls = chain.range_calls();
    assert_eq!(calls[0], (1, 8));
    assert!(calls.iter().all(|(s, e)| e - s + 1 <= 10));
    assert_eq!(values(&transfers(&store, &cfg).await), (1..=40).collect::<Vec<_>>());
}

#[tokio::test]
async fn range_too_large_at_minimum_size_is_fatal() {
    let chain = FakeChain::new();
    chain.grow(1..=10, 0);
    chain.limit_range(0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let mut cfg = bounded("tiny", 1, 10);
    cfg.range.initial = 4;

    let err = run(&mut projection_indexer(&cfg, &chain, &store)).await.unwrap_err();
    assert!(matches!(err, IndexerError::Client(ClientError::RangeTooLarge { .. })));
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn transient_node_failures_are_retried() {
    let chain = FakeChain::new();
    chain.grow(1..=5, 0);
    chain.fail_next(3, ClientError::NodeUnavailable("connection reset".into()));
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let cfg = bounded("transient", 1, 5);

    run(&mut projection_indexer(&cfg, &chain, &store)).await.unwrap();
    assert_eq!(values(&transfers(&store, &cfg).await), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn exhausted_retries_halt_the_indexer() {
    let chain = FakeChain::new();
    chain.grow(1..=5, 0);
    chain.fail_next(10, ClientError::Timeout { ms: 1 });
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let mut cfg = bounded("exhausted", 1, 5);
    cfg.node_retry = RetryConfig::immediate(3);

    let mut indexer = projection_indexer(&cfg, &chain, &store);
    let err = run(&mut indexer).await.unwrap_err();
    assert!(matches!(err, IndexerError::RetriesExhausted { attempts: 4, .. }), "{err:?}");
    assert_eq!(indexer.state(), IndexerState::Failed);
    assert!(indexer.checkpoint().await.unwrap().is_none());
}

// ─── Lifecycle ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let chain = FakeChain::new();
    chain.grow(1..=3, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let cfg = config("lifecycle", 1);

    let mut indexer = projection_indexer(&cfg, &chain, &store);
    assert_eq!(indexer.state(), IndexerState::Idle);
    indexer.start().unwrap();
    indexer.start().unwrap();

    eventually("checkpoint at 3", || async {
        matches!(indexer.checkpoint().await, Ok(Some(cp)) if cp.last_processed.number == 3)
    })
    .await;

    indexer.stop().await.unwrap();
    indexer.stop().await.unwrap();
    assert_eq!(indexer.state(), IndexerState::Stopped);
    indexer.wait().await.unwrap();
}

#[tokio::test]
async fn stop_after_a_fatal_halt_leaves_the_error_to_wait() {
    let chain = FakeChain::new();
    chain.grow(1..=3, 0);
    chain.fail_next(10, ClientError::Timeout { ms: 1 });
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let mut indexer = projection_indexer(&config("halted", 1), &chain, &store);
    indexer.start().unwrap();

    eventually("indexer failed", || async { indexer.state() == IndexerState::Failed }).await;

    indexer.stop().await.unwrap();
    let err = indexer.wait().await.unwrap_err();
    assert!(matches!(err, IndexerError::RetriesExhausted { .. }), "{err:?}");
    indexer.stop().await.unwrap();
    assert_eq!(indexer.state(), IndexerState::Failed);
}

#[tokio::test]
async fn stop_interrupts_handler_backoff() {
    let chain = FakeChain::new();
    chain.grow(1..=3, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let mut cfg = config("backoff", 1);
    cfg.handler_retry = RetryConfig {
        max_retries: 5,
        initial_backoff_ms: 60_000,
        max_backoff_ms: 60_000,
        multiplier: 2.0,
    };

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut indexer = Indexer::new(cfg.clone(), chain.clone(), store.clone());
    indexer
        .register(
            token(),
            TRANSFER,
            handler_fn(move |_: &DecodedEvent, _: &mut TxnContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::new("database busy"))
            }),
        )
        .unwrap();
    indexer.start().unwrap();
    eventually("first handler attempt", || async { calls.load(Ordering::SeqCst) > 0 }).await;

    tokio::time::timeout(Duration::from_secs(5), indexer.stop())
        .await
        .expect("stop waits out the backoff")
        .unwrap();
    assert_eq!(indexer.state(), IndexerState::Stopped);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(indexer.checkpoint().await.unwrap().is_none());
}

#[tokio::test]
async fn registration_after_start_is_rejected() {
    let chain = FakeChain::new();
    chain.grow(1..=3, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let mut indexer = projection_indexer(&bounded("late", 1, 3), &chain, &store);
    indexer.start().unwrap();

    let err = indexer
        .register(other_contract(), APPROVAL, Arc::new(ProjectionHandler::new("approvals")))
        .unwrap_err();
    assert!(matches!(err, IndexerError::Registration(_)));
    assert!(indexer.on_reorg(Arc::new(ReorgLog::default())).is_err());
    indexer.wait().await.unwrap();
}

#[tokio::test]
async fn invalid_config_is_rejected_at_start() {
    let chain = FakeChain::new();
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let mut cfg = config("invalid", 100);
    cfg.to_block = Some(50);

    let mut indexer = projection_indexer(&cfg, &chain, &store);
    assert!(matches!(indexer.start(), Err(IndexerError::Config(_))));
    assert_eq!(indexer.state(), IndexerState::Idle);
}
