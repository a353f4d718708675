//! HTTP JSON-RPC chain client backed by `reqwest`.
//!
//! - `eth_blockNumber`, `eth_getBlockByNumber` for heads and single blocks
//! - batched `eth_getBlockByNumber` + one `eth_getLogs` per range
//! - `newHeads` over WebSocket when `ws_url` is set, else HTTP polling

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chainingest_core::chain::{ChainClient, HeadStream};
use chainingest_core::error::ClientError;
use chainingest_core::types::{hash_hex, BlockRef, BlockWithLogs, EventLog, LogFilter};

use crate::wire::{
    block_from_json, classify_http_status, classify_rpc_error, hex_quantity, parse_hex_u64,
    JsonRpcRequest, JsonRpcResponse, RawLog, RpcId,
};
use crate::ws;

/// Headers requested per JSON-RPC batch.
const HEADER_BATCH_SIZE: u64 = 100;

/// When a poll finds more new blocks than this, only the head is emitted and
/// the ingestion loop catches up over ranges.
const MAX_POLLED_BACKLOG: u64 = 16;

/// Configuration for [`JsonRpcClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// HTTP JSON-RPC endpoint.
    pub rpc_url: String,
    /// WebSocket endpoint for `eth_subscribe("newHeads")`.
    pub ws_url: Option<String>,
    /// Head polling interval when no WebSocket endpoint is configured.
    pub poll_interval_ms: u64,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".into(),
            ws_url: None,
            poll_interval_ms: 2_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            ..Self::default()
        }
    }

    pub fn with_ws(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// EVM node client speaking JSON-RPC 2.0 over HTTP.
#[derive(Clone)]
pub struct JsonRpcClient {
    config: Arc<ClientConfig>,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("rpc_url", &self.config.rpc_url)
            .field("ws_url", &self.config.ws_url)
            .finish_non_exhaustive()
    }
}

impl JsonRpcClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ClientError::NodeUnavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config: Arc::new(config),
            http,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn post<B, R>(&self, body: &B) -> Result<R, ClientError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let resp = self
            .http
            .post(&self.config.rpc_url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body));
        }

        resp.json::<R>().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(e)
            } else {
                ClientError::MalformedResponse(e.to_string())
            }
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout {
                ms: self.config.request_timeout_ms,
            }
        } else if e.is_decode() {
            ClientError::MalformedResponse(e.to_string())
        } else {
            ClientError::NodeUnavailable(e.to_string())
        }
    }

    /// Single JSON-RPC call.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        let req = JsonRpcRequest::new(self.next_id(), method, params);
        let resp: JsonRpcResponse = self.post(&req).await?;
        resp.into_result().map_err(|e| classify_rpc_error(&e, None))
    }

    /// Headers for `[start, end]`, ascending. A block the node doesn't have
    /// yet is a transient failure.
    async fn headers(&self, start: u64, end: u64) -> Result<Vec<BlockRef>, ClientError> {
        let mut headers = Vec::with_capacity((end - start + 1) as usize);
        let mut chunk_start = start;
        while chunk_start <= end {
            let chunk_end = chunk_start.saturating_add(HEADER_BATCH_SIZE - 1).min(end);
            headers.extend(self.header_batch(chunk_start, chunk_end).await?);
            chunk_start = chunk_end + 1;
        }
        Ok(headers)
    }

    async fn header_batch(&self, start: u64, end: u64) -> Result<Vec<BlockRef>, ClientError> {
        let mut ids = Vec::new();
        let requests: Vec<JsonRpcRequest> = (start..=end)
            .map(|n| {
                let id = self.next_id();
                ids.push((id, n));
                JsonRpcRequest::new(id, "eth_getBlockByNumber", vec![json!(hex_quantity(n)), json!(false)])
            })
            .collect();

        let responses: Vec<JsonRpcResponse> = self.post(&requests).await?;
        let mut by_id: HashMap<u64, JsonRpcResponse> = responses
            .into_iter()
            .filter_map(|r| match r.id {
                RpcId::Number(id) => Some((id, r)),
                _ => None,
            })
            .collect();

        ids.into_iter()
            .map(|(id, number)| {
                let resp = by_id.remove(&id).ok_or_else(|| {
                    ClientError::MalformedResponse(format!("batch response missing block {number}"))
                })?;
                let value = resp.into_result().map_err(|e| classify_rpc_error(&e, None))?;
                match block_from_json(value)? {
                    Some(block) if block.number == number => Ok(block),
                    Some(block) => Err(ClientError::MalformedResponse(format!(
                        "asked for block {number}, node returned {}",
                        block.number
                    ))),
                    None => Err(ClientError::NodeUnavailable(format!(
                        "block {number} not available yet"
                    ))),
                }
            })
            .collect()
    }

    async fn logs(&self, start: u64, end: u64, filter: &LogFilter) -> Result<Vec<RawLog>, ClientError> {
        let mut params = json!({
            "fromBlock": hex_quantity(start),
            "toBlock": hex_quantity(end),
        });
        if !filter.addresses.is_empty() {
            params["address"] = json!(filter
                .addresses
                .iter()
                .map(|a| a.to_checksum(None))
                .collect::<Vec<_>>());
        }
        if !filter.topic0.is_empty() {
            params["topics"] = json!([filter.topic0.iter().map(hash_hex).collect::<Vec<_>>()]);
        }

        let req = JsonRpcRequest::new(self.next_id(), "eth_getLogs", vec![params]);
        let resp: JsonRpcResponse = self.post(&req).await?;
        let value = resp
            .into_result()
            .map_err(|e| classify_rpc_error(&e, Some((start, end))))?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::MalformedResponse(format!("invalid eth_getLogs result: {e}")))
    }

    /// New heads by polling `eth_blockNumber`; emits every new block in order.
    fn poll_heads(&self) -> HeadStream {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let state = (self.clone(), None::<u64>, VecDeque::<u64>::new());

        futures::stream::unfold(state, move |(client, mut last, mut pending)| async move {
            loop {
                if let Some(number) = pending.pop_front() {
                    let item = match client.block(number).await {
                        Ok(Some(block)) => Ok(block),
                        // Not served yet; try again on the next poll.
                        Ok(None) => {
                            pending.clear();
                            last = Some(number.saturating_sub(1));
                            tokio::time::sleep(interval).await;
                            continue;
                        }
                        Err(e) => Err(e),
                    };
                    return Some((item, (client, last, pending)));
                }

                let head = match client.head_number().await {
                    Ok(head) => head,
                    Err(e) => return Some((Err(e), (client, last, pending))),
                };
                match last {
                    Some(prev) if head <= prev => tokio::time::sleep(interval).await,
                    Some(prev) if head - prev <= MAX_POLLED_BACKLOG => pending.extend(prev + 1..=head),
                    _ => pending.push_back(head),
                }
                last = Some(last.map_or(head, |prev| prev.max(head)));
            }
        })
        .boxed()
    }
}

#[async_trait]
impl ChainClient for JsonRpcClient {
    async fn head_number(&self) -> Result<u64, ClientError> {
        let value = self.call("eth_blockNumber", vec![]).await?;
        let hex = value
            .as_str()
            .ok_or_else(|| ClientError::MalformedResponse(format!("eth_blockNumber returned {value}")))?;
        parse_hex_u64(hex)
    }

    async fn block(&self, number: u64) -> Result<Option<BlockRef>, ClientError> {
        let value = self
            .call("eth_getBlockByNumber", vec![json!(hex_quantity(number)), json!(false)])
            .await?;
        block_from_json(value)
    }

    async fn block_range(
        &self,
        start: u64,
        end: u64,
        filter: &LogFilter,
    ) -> Result<Vec<BlockWithLogs>, ClientError> {
        if end < start {
            return Ok(vec![]);
        }
        let headers = self.headers(start, end).await?;

        // No registrations means nothing can match.
        let raw_logs = if filter.addresses.is_empty() && filter.topic0.is_empty() {
            Vec::new()
        } else {
            self.logs(start, end, filter).await?
        };

        let by_number: BTreeMap<u64, BlockRef> = headers.iter().map(|b| (b.number, *b)).collect();
        let mut grouped: HashMap<u64, Vec<EventLog>> = HashMap::new();
        for raw in raw_logs {
            if raw.is_removed() {
                continue;
            }
            let number = raw.block_number_u64()?;
            let block = by_number.get(&number).copied().ok_or_else(|| {
                ClientError::MalformedResponse(format!(
                    "log for block {number} outside requested range {start}..={end}"
                ))
            })?;
            if raw.block_hash()? != block.hash {
                // The node reorganized between the two calls.
                return Err(ClientError::NodeUnavailable(format!(
                    "log block hash {} does not match header {} at block {number}",
                    raw.block_hash,
                    hash_hex(&block.hash)
                )));
            }
            grouped.entry(number).or_default().push(raw.into_event_log(block)?);
        }

        let blocks: Vec<BlockWithLogs> = headers
            .into_iter()
            .map(|block| BlockWithLogs::new(block, grouped.remove(&block.number).unwrap_or_default()))
            .collect();
        tracing::trace!(
            start,
            end,
            logs = blocks.iter().map(|b| b.logs.len()).sum::<usize>(),
            "fetched block range"
        );
        Ok(blocks)
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream, ClientError> {
        match &self.config.ws_url {
            Some(url) => ws::subscribe_new_heads(url, self.config.request_timeout()).await,
            None => {
                tracing::debug!(
                    interval_ms = self.config.poll_interval_ms,
                    "no WebSocket endpoint, polling for new heads"
                );
                Ok(self.poll_heads())
            }
        }
    }
}
