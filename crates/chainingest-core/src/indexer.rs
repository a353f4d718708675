//! Indexer configuration and state types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::watch;

use crate::error::IndexerError;
use crate::range::RangeConfig;
use crate::retry::RetryConfig;
use crate::types::IndexTarget;

/// Where to begin when no checkpoint exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPolicy {
    /// The node's head block at startup.
    #[default]
    Latest,
    /// A literal block number.
    Block(u64),
}

impl std::str::FromStr for StartPolicy {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        s.parse::<u64>()
            .map(Self::Block)
            .map_err(|_| IndexerError::Config(format!("start block must be 'latest' or a number, got '{s}'")))
    }
}

impl std::fmt::Display for StartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Block(n) => write!(f, "{n}"),
        }
    }
}

impl Serialize for StartPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Latest => serializer.serialize_str("latest"),
            Self::Block(n) => serializer.serialize_u64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for StartPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self::Block(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Configuration for an indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this indexer (used for checkpoint keys).
    pub id: String,
    /// Chain to index (e.g. `"ethereum"`).
    pub chain: String,
    /// First block when no checkpoint exists.
    pub start: StartPolicy,
    /// Optional inclusive end block (bounded backfill). `None` = run forever.
    pub to_block: Option<u64>,
    /// Switch from catch-up to live once within this many blocks of head.
    pub live_threshold: u64,
    /// Block-range sizing for catch-up.
    pub range: RangeConfig,
    /// How far back the reorg resolver may walk.
    pub max_reorg_depth: u64,
    /// Retries for node calls.
    pub node_retry: RetryConfig,
    /// Retries for handler `apply`.
    pub handler_retry: RetryConfig,
    /// Per-call timeout for node requests (milliseconds).
    pub request_timeout_ms: u64,
    /// Wait between head checks when caught up without a subscription (milliseconds).
    pub idle_interval_ms: u64,
    /// Capacity of the queue between the head subscription task and the loop.
    pub head_queue_capacity: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            chain: "ethereum".into(),
            start: StartPolicy::Latest,
            to_block: None,
            live_threshold: 2,
            range: RangeConfig::default(),
            max_reorg_depth: 64,
            node_retry: RetryConfig::default(),
            handler_retry: RetryConfig {
                max_retries: 3,
                ..RetryConfig::default()
            },
            request_timeout_ms: 10_000,
            idle_interval_ms: 1_000,
            head_queue_capacity: 64,
        }
    }
}

impl IndexerConfig {
    pub fn target(&self) -> IndexTarget {
        IndexTarget::new(&self.chain, &self.id)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.id.is_empty() || self.chain.is_empty() {
            return Err(IndexerError::Config("id and chain must not be empty".into()));
        }
        if self.range.min == 0 || self.range.min > self.range.max {
            return Err(IndexerError::Config(format!(
                "range bounds [{}, {}] are invalid",
                self.range.min, self.range.max
            )));
        }
        if self.head_queue_capacity == 0 {
            return Err(IndexerError::Config("head_queue_capacity must be positive".into()));
        }
        if let (StartPolicy::Block(start), Some(end)) = (self.start, self.to_block) {
            if end < start {
                return Err(IndexerError::Config(format!(
                    "to_block {end} is below start block {start}"
                )));
            }
        }
        Ok(())
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Fetching bounded ranges up to the chain head.
    CatchingUp,
    /// Following the chain tip in real-time.
    Live,
    /// Rolling back to a common ancestor.
    ReorgRecovery,
    /// Stopped cleanly.
    Stopped,
    /// Halted on an unrecoverable error.
    Failed,
}

impl IndexerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::CatchingUp => write!(f, "catching-up"),
            Self::Live => write!(f, "live"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Cooperative stop flag observed by the ingestion loop.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// Create a stop flag; send `true` on the sender to stop.
    pub fn channel() -> (watch::Sender<bool>, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, StopSignal(rx))
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once a stop is requested or the sender is gone.
    pub async fn stopped(&self) {
        let mut rx = self.0.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
