//! Event and reorg handler traits + registry.
//!
//! Handlers never write to storage directly. They stage [`DerivedRecord`]s in
//! a [`TxnContext`]; the ingestion loop commits the staged records of a block
//! together with the checkpoint.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::abi::{AbiDecoder, DecodedEvent, EventDecoder, EventSignature};
use crate::checkpoint::DerivedRecord;
use crate::error::{HandlerError, IndexerError};
use crate::reorg::ReorgEvent;
use crate::retry::RetryPolicy;
use crate::types::{hash_hex, Address, BlockRef, EventLog, IndexPhase, IndexTarget, LogFilter, LogPosition, B256};

// ─── TxnContext ───────────────────────────────────────────────────────────────

/// Write buffer for one block; becomes durable only when the block commits.
#[derive(Debug)]
pub struct TxnContext {
    target: IndexTarget,
    block: BlockRef,
    phase: IndexPhase,
    position: LogPosition,
    records: Vec<DerivedRecord>,
}

impl TxnContext {
    pub fn new(target: IndexTarget, block: BlockRef, phase: IndexPhase) -> Self {
        Self {
            target,
            block,
            phase,
            position: LogPosition {
                block_number: block.number,
                transaction_index: 0,
                log_index: 0,
            },
            records: Vec::new(),
        }
    }

    pub fn target(&self) -> &IndexTarget {
        &self.target
    }

    pub fn block(&self) -> &BlockRef {
        &self.block
    }

    pub fn phase(&self) -> IndexPhase {
        self.phase
    }

    /// Position of the log currently being handled.
    pub fn position(&self) -> LogPosition {
        self.position
    }

    /// Stage an insert-or-replace of `(table, key)` at the current log position.
    pub fn upsert<T: Serialize>(
        &mut self,
        table: &str,
        key: impl Into<String>,
        data: &T,
    ) -> Result<(), HandlerError> {
        let record = DerivedRecord {
            table: table.to_string(),
            key: key.into(),
            block_number: self.position.block_number,
            transaction_index: self.position.transaction_index,
            log_index: self.position.log_index,
            data: serde_json::to_value(data)?,
        };
        match self.records.iter_mut().find(|r| r.same_identity(&record)) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
        Ok(())
    }

    /// Staged records, in write order.
    pub fn records(&self) -> &[DerivedRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<DerivedRecord> {
        self.records
    }

    fn begin_log(&mut self, position: LogPosition) -> usize {
        self.position = position;
        self.records.len()
    }

    fn discard_from(&mut self, mark: usize) {
        self.records.truncate(mark);
    }
}

// ─── Handler traits ───────────────────────────────────────────────────────────

/// Trait for user-provided event handlers.
///
/// `apply` may be invoked more than once for the same log (retries, replay
/// after a crash); staged writes of a failed attempt are discarded.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn apply(&self, event: &DecodedEvent, ctx: &mut TxnContext) -> Result<(), HandlerError>;
}

/// Trait for reorg handlers.
///
/// Called after the rollback to the common ancestor has been committed.
#[async_trait]
pub trait ReorgHandler: Send + Sync {
    async fn on_reorg(&self, event: &ReorgEvent) -> Result<(), HandlerError>;
}

/// Adapts a synchronous closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&DecodedEvent, &mut TxnContext) -> Result<(), HandlerError> + Send + Sync,
{
    async fn apply(&self, event: &DecodedEvent, ctx: &mut TxnContext) -> Result<(), HandlerError> {
        (self.0)(event, ctx)
    }
}

pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&DecodedEvent, &mut TxnContext) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Writes every decoded event as one row of `table`, keyed by its log position.
///
/// The row holds the decoded fields plus `contract` and `transaction_hash`.
pub struct ProjectionHandler {
    table: String,
}

impl ProjectionHandler {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

#[async_trait]
impl EventHandler for ProjectionHandler {
    async fn apply(&self, event: &DecodedEvent, ctx: &mut TxnContext) -> Result<(), HandlerError> {
        let mut row = event.fields.clone();
        row.insert("contract".into(), json!(event.address.to_checksum(None)));
        row.insert(
            "transaction_hash".into(),
            event.transaction_hash.as_ref().map_or(Value::Null, |h| json!(hash_hex(h))),
        );
        ctx.upsert(&self.table, event.name.as_str(), &row)
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// One `(contract, event)` registration.
#[derive(Clone)]
pub struct Registration {
    pub address: Address,
    pub selector: B256,
    /// Event name used in logs and errors.
    pub event: String,
    pub decoder: Arc<dyn EventDecoder>,
    pub handler: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("address", &self.address)
            .field("selector", &self.selector)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// Registry of event + reorg handlers, keyed by `(address, selector)`.
#[derive(Default)]
pub struct HandlerRegistry {
    events: HashMap<(Address, B256), Registration>,
    reorg_handlers: Vec<Arc<dyn ReorgHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `signature` emitted by `address`, decoded with
    /// the default ABI decoder.
    pub fn register(
        &mut self,
        address: Address,
        signature: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), IndexerError> {
        let signature = EventSignature::parse(signature)
            .map_err(|e| IndexerError::Registration(e.to_string()))?;
        let event = signature.name().to_string();
        let selector = signature.selector();
        self.register_with_decoder(
            address,
            selector,
            event,
            Arc::new(AbiDecoder::new(signature)),
            handler,
        )
    }

    /// Register with a custom decoder.
    pub fn register_with_decoder(
        &mut self,
        address: Address,
        selector: B256,
        event: impl Into<String>,
        decoder: Arc<dyn EventDecoder>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), IndexerError> {
        let event = event.into();
        if self.events.contains_key(&(address, selector)) {
            return Err(IndexerError::Registration(format!(
                "{event} ({}) is already registered for {address}",
                hash_hex(&selector)
            )));
        }
        tracing::debug!(%address, event = %event, selector = %hash_hex(&selector), "handler registered");
        self.events.insert(
            (address, selector),
            Registration {
                address,
                selector,
                event,
                decoder,
                handler,
            },
        );
        Ok(())
    }

    /// Register a reorg handler.
    pub fn on_reorg(&mut self, handler: Arc<dyn ReorgHandler>) {
        self.reorg_handlers.push(handler);
    }

    /// The registration a log matches, if any.
    pub fn lookup(&self, log: &EventLog) -> Option<&Registration> {
        let selector = log.topic0()?;
        self.events.get(&(log.address, *selector))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Node-side log filter covering every registration.
    pub fn filter(&self) -> LogFilter {
        let mut addresses: Vec<Address> = self.events.keys().map(|(a, _)| *a).collect();
        let mut topic0: Vec<B256> = self.events.keys().map(|(_, s)| *s).collect();
        addresses.sort();
        addresses.dedup();
        topic0.sort();
        topic0.dedup();
        LogFilter { addresses, topic0 }
    }

    /// Decode and apply every registered log of a block into `ctx`.
    ///
    /// Unregistered logs are skipped. A decode failure is fatal; a handler
    /// failure is retried per `retry`, discarding the attempt's staged writes.
    pub async fn apply_block(
        &self,
        logs: &[EventLog],
        ctx: &mut TxnContext,
        retry: &RetryPolicy,
    ) -> Result<usize, IndexerError> {
        let mut applied = 0;
        for log in logs {
            let Some(registration) = self.lookup(log) else {
                tracing::trace!(position = %log.position(), address = %log.address, "no handler, skipping log");
                continue;
            };
            let event = registration
                .decoder
                .decode(log)
                .map_err(|source| IndexerError::Decode {
                    position: log.position(),
                    address: log.address,
                    source,
                })?;
            self.apply_event(registration, &event, ctx, retry).await?;
            applied += 1;
        }
        Ok(applied)
    }

    async fn apply_event(
        &self,
        registration: &Registration,
        event: &DecodedEvent,
        ctx: &mut TxnContext,
        retry: &RetryPolicy,
    ) -> Result<(), IndexerError> {
        let mut attempt = 0u32;
        loop {
            let mark = ctx.begin_log(event.position);
            let err = match registration.handler.apply(event, ctx).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            ctx.discard_from(mark);
            attempt += 1;
            match retry.next_delay(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        event = %registration.event,
                        position = %event.position,
                        attempt,
                        error = %err,
                        "handler failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(IndexerError::HandlerFailed {
                        event: registration.event.clone(),
                        position: event.position,
                        attempts: attempt,
                        reason: err.message().to_string(),
                    })
                }
            }
        }
    }

    /// Notify all reorg handlers. A failing reorg handler halts the indexer.
    pub async fn dispatch_reorg(&self, event: &ReorgEvent) -> Result<(), IndexerError> {
        for handler in &self.reorg_handlers {
            handler
                .on_reorg(event)
                .await
                .map_err(|e| IndexerError::HandlerFailed {
                    event: "reorg".into(),
                    position: LogPosition {
                        block_number: event.common_ancestor.number,
                        transaction_index: 0,
                        log_index: 0,
                    },
                    attempts: 1,
                    reason: e.message().to_string(),
                })?;
        }
        Ok(())
    }
}
