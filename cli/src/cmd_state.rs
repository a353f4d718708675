//! `chainingest status | records | reset`: inspect or clear stored state.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use chainingest_core::chain::ChainClient;
use chainingest_core::checkpoint::{CheckpointStore, IndexStore, RecordQuery, RecordReader};
use chainingest_evm::JsonRpcClient;

use crate::config::Settings;

async fn open(settings: &Settings) -> Result<std::sync::Arc<dyn IndexStore>> {
    chainingest_storage::connect(&settings.storage)
        .await
        .context("opening storage")
}

pub async fn status(settings: &Settings, check_node: bool) -> Result<()> {
    let target = settings.indexer.target();
    let store = open(settings).await?;
    let checkpoint = RecordReader::checkpoint(store.as_ref(), &target).await?;

    println!("Indexer: {target}");
    match &checkpoint {
        Some(cp) => {
            println!("  Last block: {}", cp.last_processed.number);
            println!("  Hash:       {}", cp.last_processed.hash);
            println!("  Updated at: {}", cp.updated_at);
        }
        None => println!("  No checkpoint (starts at {})", settings.indexer.start),
    }

    if check_node {
        let client = JsonRpcClient::new(settings.client.clone())?;
        let head = tokio::time::timeout(Duration::from_secs(5), client.head_number()).await;
        match head {
            Ok(Ok(head)) => {
                println!("  Node head:  {head}");
                if let Some(cp) = &checkpoint {
                    println!("  Lag:        {} blocks", head.saturating_sub(cp.last_processed.number));
                }
            }
            Ok(Err(e)) => println!("  Node head:  unavailable ({e})"),
            Err(_) => println!("  Node head:  unavailable (timed out)"),
        }
    }
    Ok(())
}

pub async fn records(settings: &Settings, query: RecordQuery) -> Result<()> {
    let target = settings.indexer.target();
    let store = open(settings).await?;
    let records = store.records(&target, &query).await?;
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    tracing::debug!(table = %query.table, count = records.len(), "records listed");
    Ok(())
}

pub async fn reset(settings: &Settings, confirmed: bool) -> Result<()> {
    let target = settings.indexer.target();
    if !confirmed {
        bail!("reset deletes every checkpoint, block hash and record of {target}; pass --yes to confirm");
    }
    let store = open(settings).await?;
    CheckpointStore::reset(store.as_ref(), &target).await?;
    println!("Reset {target}");
    Ok(())
}
