//! `chainingest.yaml` loading, network presets and environment overrides.
//!
//! ```yaml
//! network: devnet
//! database_url: ./chainingest.db
//! indexer:
//!   id: usdc
//!   chain: ethereum
//!   start: 19000000
//! contracts:
//!   - address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"
//!     events:
//!       - "Transfer(address indexed from, address indexed to, uint256 value)"
//! log:
//!   level: info
//!   components:
//!     chainingest_evm: debug
//! ```

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use chainingest_core::indexer::{IndexerConfig, StartPolicy};
use chainingest_core::types::Address;
use chainingest_evm::ClientConfig;
use chainingest_storage::StorageConfig;

use crate::logging::LogConfig;

/// Named endpoints used when no URL is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub name: &'static str,
    pub rpc_url: &'static str,
    pub ws_url: &'static str,
}

pub const PRESETS: &[Preset] = &[
    Preset {
        name: "devnet",
        rpc_url: "http://127.0.0.1:8545",
        ws_url: "ws://127.0.0.1:8545",
    },
    // Public, rate-limited endpoints; set rpc_url/ws_url for real workloads.
    Preset {
        name: "sepolia",
        rpc_url: "https://ethereum-sepolia-rpc.publicnode.com",
        ws_url: "wss://ethereum-sepolia-rpc.publicnode.com",
    },
    Preset {
        name: "mainnet",
        rpc_url: "https://ethereum-rpc.publicnode.com",
        ws_url: "wss://ethereum-rpc.publicnode.com",
    },
];

pub fn preset(name: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// One contract and the event signatures indexed for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractConfig {
    pub address: String,
    #[serde(default)]
    pub events: Vec<String>,
}

impl ContractConfig {
    pub fn parsed_address(&self) -> Result<Address> {
        self.address
            .parse()
            .map_err(|e| anyhow!("invalid contract address '{}': {e}", self.address))
    }
}

/// Contents of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub network: Option<String>,
    pub rpc_url: Option<String>,
    pub ws_url: Option<String>,
    pub database_url: Option<String>,
    pub indexer: IndexerConfig,
    pub contracts: Vec<ContractConfig>,
    pub log: LogConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            network: Some("devnet".into()),
            rpc_url: None,
            ws_url: None,
            database_url: None,
            indexer: IndexerConfig::default(),
            contracts: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

impl FileConfig {
    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Flag and environment values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub rpc_url: Option<String>,
    pub ws_url: Option<String>,
    pub start: Option<String>,
    pub to_block: Option<u64>,
    pub database_url: Option<String>,
    pub indexer_id: Option<String>,
    pub chain: Option<String>,
}

/// Everything a command needs, after presets and overrides are applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub client: ClientConfig,
    pub storage: StorageConfig,
    pub indexer: IndexerConfig,
    pub contracts: Vec<ContractConfig>,
}

impl Settings {
    pub fn resolve(file: FileConfig, overrides: Overrides) -> Result<Self> {
        let network = file.network.as_deref().map(|name| {
            preset(name).ok_or_else(|| anyhow!("unknown network preset '{name}'"))
        });
        let network = network.transpose()?;

        let rpc_url = overrides
            .rpc_url
            .or(file.rpc_url)
            .or_else(|| network.map(|p| p.rpc_url.to_string()))
            .ok_or_else(|| anyhow!("no RPC URL configured (set rpc_url, a network preset or CHAININGEST_RPC_URL)"))?;
        let ws_url = overrides
            .ws_url
            .or(file.ws_url)
            .or_else(|| network.map(|p| p.ws_url.to_string()));

        let mut indexer = file.indexer;
        if let Some(start) = overrides.start {
            indexer.start = start.parse::<StartPolicy>()?;
        }
        if let Some(to_block) = overrides.to_block {
            indexer.to_block = Some(to_block);
        }
        if let Some(id) = overrides.indexer_id {
            indexer.id = id;
        }
        if let Some(chain) = overrides.chain {
            indexer.chain = chain;
        }
        indexer.validate()?;

        let mut client = ClientConfig::new(rpc_url);
        client.ws_url = ws_url.filter(|url| !url.is_empty());
        client.request_timeout_ms = indexer.request_timeout_ms;

        let storage = overrides
            .database_url
            .or(file.database_url)
            .map(|url| StorageConfig::from_url(&url))
            .unwrap_or_default();

        for contract in &file.contracts {
            contract.parsed_address()?;
            if contract.events.is_empty() {
                bail!("contract {} lists no events", contract.address);
            }
        }

        Ok(Self {
            client,
            storage,
            indexer,
            contracts: file.contracts,
        })
    }
}

/// Table name for an event signature: the event name in snake case.
pub fn table_for(signature: &str) -> String {
    let name = signature.split('(').next().unwrap_or(signature).trim();
    let mut table = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                table.push('_');
            }
            table.push(c.to_ascii_lowercase());
        } else {
            table.push(c);
        }
    }
    table
}
