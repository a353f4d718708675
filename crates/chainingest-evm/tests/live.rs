//! Head-following: new blocks and reorgs arriving over the head subscription.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use chainingest_core::checkpoint::IndexStore;
use chainingest_core::error::HandlerError;
use chainingest_core::handler::{ProjectionHandler, ReorgHandler};
use chainingest_core::indexer::IndexerState;
use chainingest_core::reorg::{ReorgEvent, ReorgType};
use chainingest_core::types::B256;
use chainingest_evm::Indexer;
use chainingest_storage::InMemoryStorage;

use common::*;

#[derive(Default)]
struct Reorgs(Mutex<Vec<ReorgEvent>>);

#[async_trait]
impl ReorgHandler for Reorgs {
    async fn on_reorg(&self, event: &ReorgEvent) -> Result<(), HandlerError> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

async fn checkpoint_hash(indexer: &Indexer<Arc<FakeChain>>) -> Option<B256> {
    indexer
        .checkpoint()
        .await
        .ok()
        .flatten()
        .map(|cp| cp.last_processed.hash)
}

#[tokio::test]
async fn follows_heads_and_recovers_from_short_reorg() {
    let chain = FakeChain::new();
    chain.grow(1..=5, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let cfg = config("live", 1);

    let reorgs = Arc::new(Reorgs::default());
    let mut indexer = Indexer::new(cfg.clone(), chain.clone(), store.clone());
    indexer
        .register(token(), TRANSFER, Arc::new(ProjectionHandler::new("transfers")))
        .unwrap();
    indexer.on_reorg(reorgs.clone()).unwrap();
    let states = indexer.subscribe_state();
    indexer.start().unwrap();

    eventually("caught up to 5", || async { checkpoint_hash(&indexer).await == Some(hash(5, 0)) }).await;
    eventually("live", || {
        let live = *states.borrow() == IndexerState::Live;
        async move { live }
    })
    .await;

    chain.grow(6..=8, 0);
    eventually("followed to 8", || async { checkpoint_hash(&indexer).await == Some(hash(8, 0)) }).await;

    // 8' replaces 8 and 9' extends it.
    chain.grow(8..=9, 1);
    eventually("switched to fork", || async { checkpoint_hash(&indexer).await == Some(hash(9, 1)) }).await;

    let events = reorgs.0.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].common_ancestor.number, 7);
    assert_eq!(events[0].common_ancestor.hash, hash(7, 0));
    assert_eq!(events[0].depth, 1);
    assert_eq!(events[0].reorg_type, ReorgType::Short);

    let mut expected: Vec<u64> = (1..=7).collect();
    expected.extend([1008, 1009]);
    assert_eq!(values(&transfers(&store, &cfg).await), expected);

    indexer.stop().await.unwrap();
    assert_eq!(indexer.state(), IndexerState::Stopped);
}

#[tokio::test]
async fn stop_interrupts_an_idle_live_indexer() {
    let chain = FakeChain::new();
    chain.grow(1..=2, 0);
    let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::new());
    let mut indexer = Indexer::new(config("quiet", 1), chain.clone(), store);
    indexer
        .register(token(), TRANSFER, Arc::new(ProjectionHandler::new("transfers")))
        .unwrap();
    let states = indexer.subscribe_state();
    indexer.start().unwrap();

    eventually("live", || {
        let live = *states.borrow() == IndexerState::Live;
        async move { live }
    })
    .await;

    tokio::time::timeout(std::time::Duration::from_secs(5), indexer.stop())
        .await
        .expect("stop completes")
        .unwrap();
    assert_eq!(indexer.state(), IndexerState::Stopped);
}
