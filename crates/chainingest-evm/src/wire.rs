//! JSON-RPC 2.0 wire types and EVM payload parsing.
//!
//! Everything here is pure: raw JSON in, [`BlockRef`]/[`EventLog`] or a
//! classified [`ClientError`] out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainingest_core::error::ClientError;
use chainingest_core::types::{Address, BlockRef, Bytes, EventLog, B256};

// ─── JSON-RPC envelope ────────────────────────────────────────────────────────

/// JSON-RPC request ID: string, number, or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: RpcId,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Unwrap the result value or return the error object.
    ///
    /// A missing `result` is `null` (e.g. an unknown block).
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Error classification ─────────────────────────────────────────────────────

/// Provider code for "limit exceeded" (Infura, Alchemy, geth `--rpc.logs-limit`).
const LIMIT_EXCEEDED: i64 = -32005;
const INTERNAL_ERROR: i64 = -32603;

const RANGE_HINTS: &[&str] = &[
    "block range",
    "range too large",
    "range is too large",
    "exceed",
    "too many",
    "limit",
    "response size",
    "query returned more than",
];

const UNAVAILABLE_HINTS: &[&str] = &[
    "header not found",
    "unknown block",
    "capacity",
    "timeout",
    "try again",
];

/// Map a JSON-RPC error object to a [`ClientError`].
///
/// `range` is the requested `[start, end]` for range queries (`eth_getLogs`);
/// only those can be `RangeTooLarge`.
pub fn classify_rpc_error(err: &JsonRpcError, range: Option<(u64, u64)>) -> ClientError {
    let message = err.message.to_ascii_lowercase();
    let rate_limited = message.contains("rate limit") || message.contains("too many requests");

    if let (Some((start, end)), false) = (range, rate_limited) {
        if err.code == LIMIT_EXCEEDED || RANGE_HINTS.iter().any(|h| message.contains(h)) {
            return ClientError::RangeTooLarge {
                start,
                end,
                reason: err.message.clone(),
            };
        }
    }

    if rate_limited
        || err.code == INTERNAL_ERROR
        || err.code == LIMIT_EXCEEDED
        || UNAVAILABLE_HINTS.iter().any(|h| message.contains(h))
    {
        return ClientError::NodeUnavailable(err.to_string());
    }
    ClientError::MalformedResponse(err.to_string())
}

/// Map a non-success HTTP status to a [`ClientError`].
pub fn classify_http_status(status: u16, body: &str) -> ClientError {
    let detail = format!("HTTP {status}: {}", body.trim());
    if status == 429 || status >= 500 {
        ClientError::NodeUnavailable(detail)
    } else {
        ClientError::MalformedResponse(detail)
    }
}

// ─── Hex helpers ──────────────────────────────────────────────────────────────

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(s: &str) -> Result<u64, ClientError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|e| ClientError::MalformedResponse(format!("invalid quantity '{s}': {e}")))
}

pub fn hex_quantity(n: u64) -> String {
    format!("{n:#x}")
}

fn parse_b256(field: &str, s: &str) -> Result<B256, ClientError> {
    s.parse()
        .map_err(|e| ClientError::MalformedResponse(format!("invalid {field} '{s}': {e}")))
}

// ─── Blocks & logs ────────────────────────────────────────────────────────────

/// The subset of a block header we need (`eth_getBlockByNumber`, `newHeads`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHeader {
    pub number: String,
    pub hash: String,
    pub parent_hash: String,
}

impl RawHeader {
    pub fn to_block_ref(&self) -> Result<BlockRef, ClientError> {
        Ok(BlockRef::new(
            parse_hex_u64(&self.number)?,
            parse_b256("hash", &self.hash)?,
            parse_b256("parentHash", &self.parent_hash)?,
        ))
    }
}

/// Parse a block result; `null` means the node has no such block.
pub fn block_from_json(value: Value) -> Result<Option<BlockRef>, ClientError> {
    if value.is_null() {
        return Ok(None);
    }
    let header: RawHeader = serde_json::from_value(value)
        .map_err(|e| ClientError::MalformedResponse(format!("invalid block: {e}")))?;
    header.to_block_ref().map(Some)
}

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub block_hash: String,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    pub transaction_index: String,
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    pub fn block_number_u64(&self) -> Result<u64, ClientError> {
        parse_hex_u64(&self.block_number)
    }

    pub fn block_hash(&self) -> Result<B256, ClientError> {
        parse_b256("blockHash", &self.block_hash)
    }

    /// Convert into an [`EventLog`] belonging to `block`.
    pub fn into_event_log(self, block: BlockRef) -> Result<EventLog, ClientError> {
        let address: Address = self.address.parse().map_err(|e| {
            ClientError::MalformedResponse(format!("invalid address '{}': {e}", self.address))
        })?;
        let topics = self
            .topics
            .iter()
            .map(|t| parse_b256("topic", t))
            .collect::<Result<Vec<_>, _>>()?;
        let data: Bytes = self.data.parse().map_err(|e| {
            ClientError::MalformedResponse(format!("invalid log data: {e}"))
        })?;
        let transaction_hash = self
            .transaction_hash
            .as_deref()
            .map(|h| parse_b256("transactionHash", h))
            .transpose()?;

        Ok(EventLog {
            block,
            transaction_index: to_u32("transactionIndex", &self.transaction_index)?,
            log_index: to_u32("logIndex", &self.log_index)?,
            transaction_hash,
            address,
            topics,
            data,
        })
    }
}

fn to_u32(field: &str, s: &str) -> Result<u32, ClientError> {
    let n = parse_hex_u64(s)?;
    u32::try_from(n)
        .map_err(|_| ClientError::MalformedResponse(format!("{field} {n} out of range")))
}

/// Extract the new head from an `eth_subscription` notification for
/// `subscription`. Returns `None` for any other message.
pub fn parse_head_notification(
    message: &Value,
    subscription: &str,
) -> Option<Result<BlockRef, ClientError>> {
    if message.get("method")?.as_str()? != "eth_subscription" {
        return None;
    }
    let params = message.get("params")?;
    if params.get("subscription")?.as_str()? != subscription {
        return None;
    }
    let header = params.get("result")?.clone();
    Some(
        serde_json::from_value::<RawHeader>(header)
            .map_err(|e| ClientError::MalformedResponse(format!("invalid head: {e}")))
            .and_then(|h| h.to_block_ref()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const HASH_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(1, "eth_blockNumber", vec![]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"eth_blockNumber\""));
    }

    #[test]
    fn null_result_is_missing_block() {
        let resp: JsonRpcResponse =
            serde_json::from_value(json!({ "jsonrpc": "2.0", "id": 3, "result": null })).unwrap();
        assert_eq!(block_from_json(resp.into_result().unwrap()).unwrap(), None);
    }

    #[test]
    fn parses_block_header() {
        let block = block_from_json(json!({
            "number": "0x64",
            "hash": HASH_A,
            "parentHash": HASH_B,
            "transactions": []
        }))
        .unwrap()
        .unwrap();
        assert_eq!(block.number, 100);
        assert_eq!(block.hash, B256::repeat_byte(0xaa));
        assert_eq!(block.parent_hash, B256::repeat_byte(0xbb));
    }

    #[test]
    fn parses_log() {
        let raw: RawLog = serde_json::from_value(json!({
            "address": "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
            "topics": [HASH_A],
            "data": "0x01",
            "blockNumber": "0x64",
            "blockHash": HASH_A,
            "transactionHash": HASH_B,
            "transactionIndex": "0x2",
            "logIndex": "0x5",
            "removed": false
        }))
        .unwrap();
        assert!(!raw.is_removed());
        assert_eq!(raw.block_number_u64().unwrap(), 100);

        let block = BlockRef::new(100, B256::repeat_byte(0xaa), B256::repeat_byte(0x99));
        let log = raw.into_event_log(block).unwrap();
        assert_eq!(log.transaction_index, 2);
        assert_eq!(log.log_index, 5);
        assert_eq!(log.topic0(), Some(&B256::repeat_byte(0xaa)));
        assert_eq!(log.data.to_vec(), vec![1u8]);
    }

    #[test]
    fn bad_hex_is_malformed() {
        assert!(matches!(
            parse_hex_u64("0xzz"),
            Err(ClientError::MalformedResponse(_))
        ));
        assert_eq!(hex_quantity(255), "0xff");
    }

    #[test]
    fn range_errors_are_classified() {
        let err = JsonRpcError {
            code: -32005,
            message: "query returned more than 10000 results".into(),
            data: None,
        };
        assert!(matches!(
            classify_rpc_error(&err, Some((1, 5000))),
            ClientError::RangeTooLarge { start: 1, end: 5000, .. }
        ));

        let worded = JsonRpcError {
            code: -32000,
            message: "block range is too large".into(),
            data: None,
        };
        assert!(matches!(
            classify_rpc_error(&worded, Some((1, 10))),
            ClientError::RangeTooLarge { .. }
        ));
        // Outside a range query the same wording is not a range error.
        assert!(matches!(
            classify_rpc_error(&worded, None),
            ClientError::MalformedResponse(_)
        ));
    }

    #[test]
    fn transient_errors_are_classified() {
        let header = JsonRpcError {
            code: -32000,
            message: "header not found".into(),
            data: None,
        };
        assert!(classify_rpc_error(&header, Some((1, 2))).is_retryable());

        let internal = JsonRpcError {
            code: -32603,
            message: "internal error".into(),
            data: None,
        };
        assert!(classify_rpc_error(&internal, None).is_retryable());

        let invalid = JsonRpcError {
            code: -32602,
            message: "invalid params".into(),
            data: None,
        };
        assert!(!classify_rpc_error(&invalid, None).is_retryable());

        assert!(classify_http_status(429, "slow down").is_retryable());
        assert!(classify_http_status(503, "").is_retryable());
        assert!(!classify_http_status(400, "bad request").is_retryable());
    }

    #[test]
    fn head_notification() {
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x9ce59a13059e417087c02d3236a0b1cc",
                "result": { "number": "0x1b4", "hash": HASH_A, "parentHash": HASH_B }
            }
        });
        let head = parse_head_notification(&msg, "0x9ce59a13059e417087c02d3236a0b1cc")
            .unwrap()
            .unwrap();
        assert_eq!(head.number, 436);
        assert!(parse_head_notification(&msg, "0xother").is_none());
        assert!(parse_head_notification(&json!({ "id": 1, "result": "0x1" }), "x").is_none());
    }
}
