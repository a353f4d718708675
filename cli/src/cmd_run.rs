//! `chainingest run`: ingest until `to_block`, Ctrl-C, or a fatal error.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;

use chainingest_core::handler::ProjectionHandler;
use chainingest_evm::{Indexer, JsonRpcClient};

use crate::config::{table_for, Settings};

pub async fn run(settings: Settings) -> Result<()> {
    let target = settings.indexer.target();
    let store = chainingest_storage::connect(&settings.storage)
        .await
        .context("opening storage")?;
    let client = JsonRpcClient::new(settings.client.clone()).context("building RPC client")?;

    let mut indexer = Indexer::new(settings.indexer, client, store);
    for contract in &settings.contracts {
        let address = contract.parsed_address()?;
        for signature in &contract.events {
            let table = table_for(signature);
            indexer
                .register(address, signature, Arc::new(ProjectionHandler::new(table.clone())))
                .with_context(|| format!("registering {signature} on {address}"))?;
            tracing::info!(%address, event = %signature, table = %table, "registered event");
        }
    }

    tracing::info!(
        indexer = %target,
        rpc = %settings.client.rpc_url,
        ws = settings.client.ws_url.as_deref().unwrap_or("-"),
        "starting ingestion"
    );
    indexer.start()?;

    let finished = tokio::select! {
        r = indexer.wait() => Some(r),
        _ = signal::ctrl_c() => None,
    };
    let outcome = match finished {
        Some(r) => r,
        None => {
            tracing::info!("interrupt received, stopping after the current block");
            // A run that ended just before the interrupt reports through wait().
            match indexer.stop().await {
                Ok(()) => indexer.wait().await,
                Err(e) => Err(e),
            }
        }
    };

    if let Err(e) = outcome {
        tracing::error!(error = %e, kind = ?e.kind(), "indexer halted");
        return Err(e).context(format!("indexer {target} halted"));
    }

    match indexer.checkpoint().await? {
        Some(cp) => println!("stopped at block {} ({})", cp.last_processed.number, cp.last_processed.hash),
        None => println!("stopped before the first block was committed"),
    }
    Ok(())
}
