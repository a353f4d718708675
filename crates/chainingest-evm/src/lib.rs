//! chainingest-evm: EVM JSON-RPC client, ingestion loop, and indexer lifecycle.

pub mod builder;
pub mod client;
pub mod index_loop;
pub mod indexer;
pub mod wire;
pub mod ws;

pub use builder::IndexerBuilder;
pub use client::{ClientConfig, JsonRpcClient};
pub use index_loop::IndexLoop;
pub use indexer::Indexer;
pub use wire::RawLog;
