//! Settlement engine configuration.

use crate::{
    account::FeeSettings,
    alerts::TelegramConfig,
    constants::{DEFAULT_METRICS_PORT, DEFAULT_PORT},
    rules::TokenInfo,
};
use alloy::primitives::{Address, ChainId};
use eyre::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};
use url::Url;

/// Settlement engine configuration.
#[derive(Debug, Serialize, Deserialize)]
pub struct SettlerConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Per-chain configuration.
    pub chains: Vec<ChainConfig>,
    /// Token registry: known tokens per chain.
    #[serde(default)]
    pub tokens: HashMap<ChainId, Vec<TokenInfo>>,
    /// Rule configuration.
    pub rules: RulesConfig,
    /// Sweep cadence.
    #[serde(default)]
    pub sweeps: SweepConfig,
    /// Payout policy.
    #[serde(default)]
    pub payout: PayoutConfig,
    /// Telegram alert sink, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramConfig>,
    /// Secrets.
    #[serde(skip_serializing, default)]
    pub secrets: SecretsConfig,
    /// Database URL. Without one, the volatile in-memory store is used.
    pub database_url: Option<String>,
}

impl SettlerConfig {
    /// Loads the configuration from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> eyre::Result<Self> {
        let text = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("reading {}", path.as_ref().display()))?;
        serde_json::from_str(&text)
            .wrap_err_with(|| format!("parsing {}", path.as_ref().display()))
    }

    /// Saves the configuration to a JSON file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> eyre::Result<()> {
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .wrap_err_with(|| format!("writing {}", path.as_ref().display()))?;
        Ok(())
    }

    /// The configuration of one chain, if present.
    pub fn chain(&self, chain_id: ChainId) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

/// Server configuration.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address to bind on.
    pub address: IpAddr,
    /// The process port.
    pub port: u16,
    /// The port to serve metrics on.
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

/// Per-chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain id.
    pub chain_id: ChainId,
    /// RPC endpoint transactions are sent through.
    pub rpc_url: Url,
    /// Router contract used for batched payouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<Address>,
    /// Fee policy for this chain.
    #[serde(default)]
    pub fees: FeeSettings,
}

/// Rule configuration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Maker rule documents, flattened and unioned at startup.
    pub maker_files: Vec<PathBuf>,
    /// Dealer addresses the security code indexes into.
    #[serde(default)]
    pub dealers: Vec<Address>,
    /// EBC addresses the security code indexes into.
    #[serde(default)]
    pub ebcs: Vec<Address>,
    /// Chain ids the security code indexes into.
    #[serde(default)]
    pub chain_index: Vec<ChainId>,
}

/// Sweep cadence, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// V1 source sweep interval.
    pub v1_source_secs: u64,
    /// V1 destination sweep interval.
    pub v1_dest_secs: u64,
    /// V2 source sweep interval.
    pub v2_source_secs: u64,
    /// V2 destination sweep interval.
    pub v2_dest_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            v1_source_secs: 5 * 60,
            v1_dest_secs: 7 * 60,
            v2_source_secs: 3 * 60,
            v2_dest_secs: 6 * 60,
        }
    }
}

/// Payout policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutConfig {
    /// Largest acceptable deposit-to-payout value loss, in basis points.
    pub max_loss_bps: u64,
    /// Whether same-sender payouts are batched through the router.
    pub batch_enabled: bool,
    /// Constant exchange rate override. For testing only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant_rate: Option<f64>,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self { max_loss_bps: 200, batch_enabled: true, constant_rate: None }
    }
}

/// Secrets, environment-fed and never serialized back out.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Private keys of the payout makers, hex encoded.
    #[serde(default)]
    pub payout_keys: Vec<String>,
}
