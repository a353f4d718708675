//! Indexer lifecycle: registration, start/stop, state, checkpoint queries.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainingest_core::handler::ProjectionHandler;
//! use chainingest_evm::{ClientConfig, Indexer, IndexerBuilder, JsonRpcClient};
//! use chainingest_storage::InMemoryStorage;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = JsonRpcClient::new(ClientConfig::new("http://127.0.0.1:8545"))?;
//! let config = IndexerBuilder::new().id("usdc").from_block(19_000_000).build_config();
//! let mut indexer = Indexer::new(config, client, Arc::new(InMemoryStorage::new()));
//! indexer.register(
//!     "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".parse()?,
//!     "Transfer(address indexed from, address indexed to, uint256 value)",
//!     Arc::new(ProjectionHandler::new("transfers")),
//! )?;
//! indexer.start()?;
//! indexer.wait().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use chainingest_core::abi::EventDecoder;
use chainingest_core::chain::ChainClient;
use chainingest_core::checkpoint::{Checkpoint, CheckpointStore, IndexStore};
use chainingest_core::error::IndexerError;
use chainingest_core::handler::{EventHandler, HandlerRegistry, ReorgHandler};
use chainingest_core::indexer::{IndexerConfig, IndexerState, StopSignal};
use chainingest_core::types::{Address, B256};

use crate::index_loop::IndexLoop;

/// Handlers are collected until the first start, then shared read-only with
/// the loop.
enum Registry {
    Open(HandlerRegistry),
    Frozen(Arc<HandlerRegistry>),
}

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<(), IndexerError>>,
}

/// A configured indexer for one `(chain, indexer id)` target.
pub struct Indexer<C> {
    config: IndexerConfig,
    client: Arc<C>,
    store: Arc<dyn IndexStore>,
    registry: Registry,
    state: Arc<watch::Sender<IndexerState>>,
    running: Option<Running>,
}

impl<C: ChainClient + 'static> Indexer<C> {
    pub fn new(config: IndexerConfig, client: C, store: Arc<dyn IndexStore>) -> Self {
        let (state, _) = watch::channel(IndexerState::Idle);
        Self {
            config,
            client: Arc::new(client),
            store,
            registry: Registry::Open(HandlerRegistry::new()),
            state: Arc::new(state),
            running: None,
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    fn open_registry(&mut self) -> Result<&mut HandlerRegistry, IndexerError> {
        match &mut self.registry {
            Registry::Open(registry) => Ok(registry),
            Registry::Frozen(_) => Err(IndexerError::Registration(
                "handlers cannot be registered after the indexer has started".into(),
            )),
        }
    }

    /// Register `handler` for the event `signature` emitted by `address`.
    pub fn register(
        &mut self,
        address: Address,
        signature: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), IndexerError> {
        self.open_registry()?.register(address, signature, handler)
    }

    /// Register `handler` with a custom decoder for logs whose topic0 is `selector`.
    pub fn register_with_decoder(
        &mut self,
        address: Address,
        selector: B256,
        event: impl Into<String>,
        decoder: Arc<dyn EventDecoder>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), IndexerError> {
        self.open_registry()?
            .register_with_decoder(address, selector, event, decoder, handler)
    }

    /// Register a handler notified after every reorg rollback.
    pub fn on_reorg(&mut self, handler: Arc<dyn ReorgHandler>) -> Result<(), IndexerError> {
        self.open_registry()?.on_reorg(handler);
        Ok(())
    }

    /// Spawn the ingestion loop. A no-op while it is already running; after it
    /// has terminated, starts a new run that resumes from the checkpoint.
    pub fn start(&mut self) -> Result<(), IndexerError> {
        if let Some(running) = &self.running {
            if !running.task.is_finished() {
                return Ok(());
            }
        }
        self.config.validate()?;

        let registry = match std::mem::replace(&mut self.registry, Registry::Open(HandlerRegistry::new())) {
            Registry::Open(registry) => Arc::new(registry),
            Registry::Frozen(registry) => registry,
        };
        if registry.is_empty() {
            tracing::warn!(indexer = %self.config.target(), "starting with no registered handlers");
        }
        self.registry = Registry::Frozen(registry.clone());

        let (stop, signal) = StopSignal::channel();
        let index_loop = IndexLoop::new(
            self.config.clone(),
            self.client.clone(),
            self.store.clone(),
            registry,
            self.state.clone(),
            signal,
        );
        tracing::info!(indexer = %self.config.target(), "starting indexer");
        let task = tokio::spawn(index_loop.run());
        self.running = Some(Running { stop, task });
        Ok(())
    }

    /// Request a stop and wait for the loop to finish its current block.
    ///
    /// A no-op returning `Ok` when nothing is running, including after the
    /// loop has already terminated on its own; [`wait`](Self::wait) reports
    /// how such a run ended. An error here means the loop failed while
    /// shutting down.
    pub async fn stop(&mut self) -> Result<(), IndexerError> {
        if self.running.as_ref().map_or(true, |r| r.task.is_finished()) {
            return Ok(());
        }
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.stop.send(true);
        flatten(running.task.await)
    }

    /// Wait for the loop to terminate on its own (`to_block` reached, stop
    /// requested elsewhere, or a fatal error).
    ///
    /// Cancel-safe: dropping the future leaves the loop running and
    /// stoppable.
    pub async fn wait(&mut self) -> Result<(), IndexerError> {
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };
        let outcome = (&mut running.task).await;
        self.running = None;
        flatten(outcome)
    }

    pub fn state(&self) -> IndexerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<IndexerState> {
        self.state.subscribe()
    }

    /// The last committed checkpoint for this target.
    pub async fn checkpoint(&self) -> Result<Option<Checkpoint>, IndexerError> {
        self.store.load(&self.config.target()).await
    }

    /// The storage backend, for record queries.
    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }
}

fn flatten(outcome: Result<Result<(), IndexerError>, JoinError>) -> Result<(), IndexerError> {
    outcome.map_err(|e| IndexerError::Aborted {
        reason: e.to_string(),
    })?
}
