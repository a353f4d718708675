//! Error types for the chainingest pipeline.
//!
//! Every failure the ingestion loop can hit maps to an [`ErrorKind`], so callers
//! decide between retrying and halting without inspecting messages.

use alloy_primitives::Address;
use thiserror::Error;

use crate::types::LogPosition;

/// Errors raised by a [`ChainClient`](crate::chain::ChainClient) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Connection lost, refused, or the node answered with a transient failure.
    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    /// The request did not complete within the configured timeout.
    #[error("node call timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The node rejected the requested block range as too large.
    #[error("node rejected range {start}..={end}: {reason}")]
    RangeTooLarge { start: u64, end: u64, reason: String },

    /// The response payload did not have the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ClientError {
    /// Returns `true` if the call may succeed when retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeUnavailable(_) | Self::Timeout { .. })
    }
}

/// Errors produced while decoding a log against a registered event signature.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid event signature '{signature}': {reason}")]
    InvalidSignature { signature: String, reason: String },

    #[error("log selector {actual} does not match {expected}")]
    SelectorMismatch { expected: String, actual: String },

    #[error("event {event} expects {expected} topics, log has {actual}")]
    TopicCount {
        event: String,
        expected: usize,
        actual: usize,
    },

    #[error("ABI decode of {event} failed: {reason}")]
    Abi { event: String, reason: String },
}

/// Error returned by an application handler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// Coarse classification used to decide between retry and halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient I/O; the loop retries with backoff.
    Transient,
    /// Protocol or data error; halts with block/log context.
    Protocol,
    /// Another instance owns the checkpoint; this one must stop.
    Conflict,
    /// Reorg deeper than the lookback window; needs a manual reset.
    ChainAnomaly,
    /// Application handler kept failing after its retries.
    Handler,
    /// Backing store failure; the store stays at its last consistent state.
    Storage,
    /// API misuse (late registration, bad configuration).
    Usage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Protocol => write!(f, "protocol"),
            Self::Conflict => write!(f, "conflict"),
            Self::ChainAnomaly => write!(f, "chain-anomaly"),
            Self::Handler => write!(f, "handler"),
            Self::Storage => write!(f, "storage"),
            Self::Usage => write!(f, "usage"),
        }
    }
}

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: ClientError,
    },

    #[error("failed to decode log {position} from {address}: {source}")]
    Decode {
        position: LogPosition,
        address: Address,
        #[source]
        source: DecodeError,
    },

    #[error("handler for {event} failed at {position} after {attempts} attempts: {reason}")]
    HandlerFailed {
        event: String,
        position: LogPosition,
        attempts: u32,
        reason: String,
    },

    #[error("checkpoint conflict: expected {expected}, found {found}")]
    Conflict { expected: String, found: String },

    #[error("no common ancestor within {max_depth} blocks below block {from}")]
    ReorgTooDeep { from: u64, max_depth: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("registration rejected: {0}")]
    Registration(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("indexer aborted: {reason}")]
    Aborted { reason: String },
}

impl IndexerError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Client(e) if e.is_retryable() => ErrorKind::Transient,
            Self::Client(_) | Self::RetriesExhausted { .. } | Self::Decode { .. } => {
                ErrorKind::Protocol
            }
            Self::HandlerFailed { .. } => ErrorKind::Handler,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::ReorgTooDeep { .. } => ErrorKind::ChainAnomaly,
            Self::Storage(_) | Self::Aborted { .. } => ErrorKind::Storage,
            Self::Registration(_) | Self::Config(_) => ErrorKind::Usage,
        }
    }

    /// Returns `true` if the loop may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Returns `true` if this is a checkpoint conflict with another instance.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
