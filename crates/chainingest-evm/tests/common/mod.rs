//! Scripted in-process chain used by the ingestion tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;

use chainingest_core::abi::EventSignature;
use chainingest_core::chain::{ChainClient, HeadStream};
use chainingest_core::checkpoint::{DerivedRecord, IndexStore, RecordQuery, RecordReader};
use chainingest_core::error::ClientError;
use chainingest_core::indexer::IndexerConfig;
use chainingest_core::retry::RetryConfig;
use chainingest_core::types::{Address, BlockRef, BlockWithLogs, Bytes, EventLog, LogFilter, B256};
use chainingest_evm::IndexerBuilder;

pub const TRANSFER: &str = "Transfer(address indexed from, address indexed to, uint256 value)";

pub fn token() -> Address {
    Address::repeat_byte(0x11)
}

pub fn other_contract() -> Address {
    Address::repeat_byte(0x22)
}

pub fn hash(n: u64, fork: u8) -> B256 {
    let mut word = [0u8; 32];
    word[0] = fork;
    word[24..].copy_from_slice(&n.to_be_bytes());
    B256::from(word)
}

fn word(n: u64) -> [u8; 32] {
    let mut w = [0u8; 32];
    w[24..].copy_from_slice(&n.to_be_bytes());
    w
}

/// A Transfer of `value` from `token()`; `value` identifies the fork it came from.
pub fn transfer_log(block: BlockRef, log_index: u32, value: u64) -> EventLog {
    let selector = EventSignature::parse(TRANSFER).unwrap().selector();
    EventLog {
        block,
        transaction_index: 0,
        log_index,
        transaction_hash: Some(B256::repeat_byte(0xee)),
        address: token(),
        topics: vec![
            selector,
            B256::left_padding_from(Address::repeat_byte(0xaa).as_slice()),
            B256::left_padding_from(Address::repeat_byte(0xbb).as_slice()),
        ],
        data: Bytes::from(word(value).to_vec()),
    }
}

#[derive(Default)]
struct State {
    blocks: BTreeMap<u64, BlockWithLogs>,
    failures: VecDeque<ClientError>,
    max_range: Option<u64>,
    range_calls: Vec<(u64, u64)>,
}

/// Chain whose blocks, failures and range limits are set by the test.
pub struct FakeChain {
    state: Mutex<State>,
    heads: broadcast::Sender<BlockRef>,
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        let (heads, _) = broadcast::channel(256);
        Arc::new(Self {
            state: Mutex::new(State::default()),
            heads,
        })
    }

    /// Add (or replace) blocks `numbers` on `fork`, each carrying one Transfer
    /// of value `number + 1000 * fork`. A block's parent is whatever block the
    /// chain holds one height below.
    pub fn grow(&self, numbers: RangeInclusive<u64>, fork: u8) {
        let mut state = self.state.lock().unwrap();
        for n in numbers {
            let parent = state
                .blocks
                .get(&(n.wrapping_sub(1)))
                .map_or_else(|| hash(n.wrapping_sub(1), fork), |b| b.block.hash);
            let block = BlockRef::new(n, hash(n, fork), parent);
            let logs = vec![transfer_log(block, 0, n + 1000 * fork as u64)];
            state.blocks.insert(n, BlockWithLogs::new(block, logs));
            let _ = self.heads.send(block);
        }
    }

    /// Add a log to block `n`.
    pub fn add_log(&self, n: u64, log_index: u32, address: Address, topic0: B256) {
        let mut state = self.state.lock().unwrap();
        let entry = state.blocks.get_mut(&n).expect("block exists");
        let log = EventLog {
            block: entry.block,
            transaction_index: 0,
            log_index,
            transaction_hash: None,
            address,
            topics: vec![topic0],
            data: Bytes::new(),
        };
        let mut logs = std::mem::take(&mut entry.logs);
        logs.push(log);
        *entry = BlockWithLogs::new(entry.block, logs);
    }

    /// Add a Transfer of `value` at `log_index` to block `n`.
    pub fn add_transfer(&self, n: u64, log_index: u32, value: u64) {
        let mut state = self.state.lock().unwrap();
        let entry = state.blocks.get_mut(&n).expect("block exists");
        let mut logs = std::mem::take(&mut entry.logs);
        logs.push(transfer_log(entry.block, log_index, value));
        *entry = BlockWithLogs::new(entry.block, logs);
    }

    /// The next `count` node calls fail with `error`.
    pub fn fail_next(&self, count: usize, error: ClientError) {
        let mut state = self.state.lock().unwrap();
        state.failures.extend(std::iter::repeat(error).take(count));
    }

    /// Reject `block_range` requests spanning more than `max` blocks.
    pub fn limit_range(&self, max: u64) {
        self.state.lock().unwrap().max_range = Some(max);
    }

    pub fn range_calls(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().range_calls.clone()
    }

    fn injected_failure(&self) -> Result<(), ClientError> {
        match self.state.lock().unwrap().failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn head_number(&self) -> Result<u64, ClientError> {
        self.injected_failure()?;
        Ok(self.state.lock().unwrap().blocks.keys().last().copied().unwrap_or(0))
    }

    async fn block(&self, number: u64) -> Result<Option<BlockRef>, ClientError> {
        self.injected_failure()?;
        Ok(self.state.lock().unwrap().blocks.get(&number).map(|b| b.block))
    }

    async fn block_range(
        &self,
        start: u64,
        end: u64,
        filter: &LogFilter,
    ) -> Result<Vec<BlockWithLogs>, ClientError> {
        self.injected_failure()?;
        let mut state = self.state.lock().unwrap();
        if let Some(max) = state.max_range {
            if end - start + 1 > max {
                return Err(ClientError::RangeTooLarge {
                    start,
                    end,
                    reason: format!("at most {max} blocks per query"),
                });
            }
        }
        state.range_calls.push((start, end));
        (start..=end)
            .map(|n| {
                let block = state
                    .blocks
                    .get(&n)
                    .ok_or_else(|| ClientError::NodeUnavailable(format!("block {n} unknown")))?;
                let logs = block.logs.iter().filter(|l| filter.matches(l)).cloned().collect();
                Ok(BlockWithLogs::new(block.block, logs))
            })
            .collect()
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream, ClientError> {
        // Subscribe before reading the tip so no head is lost in between.
        let rx = self.heads.subscribe();
        let tip = self.state.lock().unwrap().blocks.values().last().map(|b| b.block);
        let live = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(head) => return Some((Ok(head), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(futures::stream::iter(tip.map(Ok)).chain(live).boxed())
    }
}

/// A config suited to tests: no backoff, short idle waits.
pub fn config(id: &str, start: u64) -> IndexerConfig {
    IndexerBuilder::new()
        .chain("devnet")
        .id(id)
        .from_block(start)
        .node_retry(RetryConfig::immediate(3))
        .handler_retry(RetryConfig::immediate(2))
        .request_timeout_ms(2_000)
        .idle_interval_ms(10)
        .build_config()
}

pub async fn transfers(store: &Arc<dyn IndexStore>, config: &IndexerConfig) -> Vec<DerivedRecord> {
    store
        .records(&config.target(), &RecordQuery::table("transfers"))
        .await
        .unwrap()
}

/// The decoded `value` of each record, in store order.
pub fn values(records: &[DerivedRecord]) -> Vec<u64> {
    records
        .iter()
        .map(|r| r.data["value"].as_u64().unwrap())
        .collect()
}

/// Poll until `check` passes or the timeout elapses.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
