//! ChainIngest CLI: run an indexer and inspect or reset its state.
//!
//! # Commands
//! ```text
//! chainingest run     [--rpc-url <url>] [--ws-url <url>] [--start <block|latest>] [--to-block <n>]
//! chainingest status  [--node]
//! chainingest records --table <name> [--from <n>] [--to <n>] [--limit <n>]
//! chainingest reset   --yes
//! chainingest info
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use chainingest_core::checkpoint::RecordQuery;
use chainingest_core::indexer::IndexerConfig;
use chainingest_core::range::RangeConfig;

mod cmd_run;
mod cmd_state;
mod config;
mod logging;

use config::{FileConfig, Overrides, Settings, PRESETS};

#[derive(Parser)]
#[command(
    name = "chainingest",
    about = "Reorg-safe EVM event ingestion with atomic checkpoints",
    long_about = "
ChainIngest CLI: follow a chain's event logs into SQLite or PostgreSQL,
rolling back cleanly on reorgs.

ENVIRONMENT VARIABLES:
  CHAININGEST_RPC_URL        HTTP JSON-RPC endpoint
  CHAININGEST_WS_URL         WebSocket endpoint for newHeads (optional)
  STARTING_BLOCK_NUMBER      First block when no checkpoint exists ('latest' or a number)
  CHAININGEST_DATABASE_URL   'memory', a SQLite path, or a postgres:// URL
  RUST_LOG                   Overrides the configured log filter
",
    version
)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, global = true, default_value = "chainingest.yaml", env = "CHAININGEST_CONFIG")]
    config: PathBuf,

    /// Log level (overrides the config file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TargetArgs {
    /// Indexer id (overrides the config file)
    #[arg(long, global = true)]
    id: Option<String>,

    /// Chain name (overrides the config file)
    #[arg(long, global = true)]
    chain: Option<String>,

    /// Storage: 'memory', a SQLite path, or a postgres:// URL
    #[arg(long, global = true, env = "CHAININGEST_DATABASE_URL")]
    database_url: Option<String>,

    /// HTTP JSON-RPC endpoint
    #[arg(long, global = true, env = "CHAININGEST_RPC_URL")]
    rpc_url: Option<String>,

    /// WebSocket endpoint for new heads
    #[arg(long, global = true, env = "CHAININGEST_WS_URL")]
    ws_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest events until --to-block, Ctrl-C, or a fatal error
    Run {
        /// First block when no checkpoint exists ('latest' or a number)
        #[arg(long, env = "STARTING_BLOCK_NUMBER")]
        start: Option<String>,
        /// Stop after this block
        #[arg(long)]
        to_block: Option<u64>,
    },

    /// Show the stored checkpoint
    Status {
        /// Also query the node head and report lag
        #[arg(long)]
        node: bool,
    },

    /// Print committed records of one table as JSON lines
    Records {
        /// Table (snake-case event name, e.g. 'transfer')
        #[arg(long)]
        table: String,
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        to: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Delete the checkpoint, block hashes and records of this indexer
    Reset {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Show defaults, presets and storage backends
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut file = FileConfig::load(&cli.config)?;
    if let Some(level) = cli.log_level {
        file.log.level = level;
    }
    file.log.json |= cli.log_json;
    logging::init_tracing(&file.log);

    let mut overrides = Overrides {
        rpc_url: cli.target.rpc_url,
        ws_url: cli.target.ws_url,
        database_url: cli.target.database_url,
        indexer_id: cli.target.id,
        chain: cli.target.chain,
        ..Default::default()
    };

    match cli.command {
        Commands::Run { start, to_block } => {
            overrides.start = start;
            overrides.to_block = to_block;
            cmd_run::run(Settings::resolve(file, overrides)?).await
        }

        Commands::Status { node } => {
            cmd_state::status(&Settings::resolve(file, overrides)?, node).await
        }

        Commands::Records { table, from, to, limit } => {
            let query = RecordQuery {
                table,
                from_block: from,
                to_block: to,
                limit,
            };
            cmd_state::records(&Settings::resolve(file, overrides)?, query).await
        }

        Commands::Reset { yes } => cmd_state::reset(&Settings::resolve(file, overrides)?, yes).await,

        Commands::Info => {
            cmd_info();
            Ok(())
        }
    }
}

fn cmd_info() {
    let defaults = IndexerConfig::default();
    let range = RangeConfig::default();
    println!("ChainIngest v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default max reorg depth: {} blocks", defaults.max_reorg_depth);
    println!("  Default live threshold:  {} blocks", defaults.live_threshold);
    println!(
        "  Default range size:      {} blocks/call (min {}, max {})",
        range.initial, range.min, range.max
    );
    println!("  Node retries:            {}", defaults.node_retry.max_retries);
    println!("  Storage backends:        memory, SQLite, PostgreSQL");
    println!("  Network presets:");
    for preset in PRESETS {
        println!("    {:<8} {} / {}", preset.name, preset.rpc_url, preset.ws_url);
    }
}
