use std::path::{Path, PathBuf};
use std::time::Duration;

use custodian_core::interface::load_escrow_data;
use custodian_core::TxId;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "./custodian_config.json";
/// Operator keypair read when neither the config nor `--keypair` names one.
pub const DEFAULT_KEYPAIR_PATH: &str = "./wallet.json";
/// Directory holding escrow records when `--record` is not given.
pub const DEFAULT_RECORD_DIR: &str = "./escrows";

const EXPLORER_URL: &str = "https://explorer.solana.com";

/// Solana cluster the custodian operates on.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Cluster {
    #[default]
    Devnet,
    Testnet,
    MainnetBeta,
    Localnet,
}

impl Cluster {
    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            Self::Devnet => "https://api.devnet.solana.com",
            Self::Testnet => "https://api.testnet.solana.com",
            Self::MainnetBeta => "https://api.mainnet-beta.solana.com",
            Self::Localnet => "http://127.0.0.1:8899",
        }
    }

    /// Query string selecting this cluster on the block explorer.
    fn explorer_query(&self) -> String {
        match self {
            Self::Devnet => "?cluster=devnet".to_string(),
            Self::Testnet => "?cluster=testnet".to_string(),
            Self::MainnetBeta => String::new(),
            Self::Localnet => format!(
                "?cluster=custom&customUrl={}",
                Self::Localnet.default_rpc_url()
            ),
        }
    }
}

/// Network and key configuration, read from JSON.
///
/// Every field has a default, so a missing or partial file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// JSON-RPC endpoint URL
    pub rpc_url: String,
    /// Path to the custodian's keypair file
    pub keypair_path: PathBuf,
    /// Cluster used for explorer links
    pub cluster: Cluster,
    /// Upper bound on waiting for a submitted transaction to confirm
    pub confirm_timeout_secs: u64,
    /// Delay between confirmation polls
    pub poll_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            rpc_url: Cluster::Devnet.default_rpc_url().to_string(),
            keypair_path: PathBuf::from(DEFAULT_KEYPAIR_PATH),
            cluster: Cluster::Devnet,
            confirm_timeout_secs: 60,
            poll_interval_ms: 500,
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub rpc_url: Option<String>,
    pub keypair_path: Option<PathBuf>,
    pub cluster: Option<Cluster>,
}

impl ClusterConfig {
    /// Loads the config from `path`, or from [`DEFAULT_CONFIG_PATH`] when it
    /// exists, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Fails when an explicitly named file is missing, or any file is malformed.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => load_escrow_data(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    load_escrow_data(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Applies command-line overrides. Choosing a cluster without an RPC
    /// URL also points the client at that cluster's public endpoint.
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(cluster) = overrides.cluster {
            self.cluster = cluster;
            if overrides.rpc_url.is_none() {
                self.rpc_url = cluster.default_rpc_url().to_string();
            }
        }
        if let Some(rpc_url) = overrides.rpc_url {
            self.rpc_url = rpc_url;
        }
        if let Some(keypair_path) = overrides.keypair_path {
            self.keypair_path = keypair_path;
        }
        self
    }

    /// # Errors
    ///
    /// Rejects an unparsable RPC URL and zero timing values.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.rpc_url)?;
        if self.confirm_timeout_secs == 0 {
            return Err(ClientError::Config(
                "confirm_timeout_secs must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ClientError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Block explorer link for a transaction on the configured cluster.
    pub fn explorer_url(&self, tx: &TxId) -> String {
        format!(
            "{}/tx/{}{}",
            EXPLORER_URL,
            tx.signature,
            self.cluster.explorer_query()
        )
    }
}

/// Record file for escrow `id` under [`DEFAULT_RECORD_DIR`].
pub fn default_record_path(id: &str) -> PathBuf {
    record_path_in(Path::new(DEFAULT_RECORD_DIR), id)
}

/// Record file for escrow `id` under `dir`. Characters outside
/// `[A-Za-z0-9_-]` become `_`.
pub fn record_path_in(dir: &Path, id: &str) -> PathBuf {
    let name: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{}.json", name))
}
