//! Command line interface.

use crate::config::SettlerConfig;
use clap::Parser;
use std::path::PathBuf;

/// The settlement engine matches cross-chain deposits to maker payouts and
/// dispatches them under exactly-once constraints.
#[derive(Debug, Parser)]
#[command(author, about = "Settlement engine", long_about = None)]
pub struct Args {
    /// Path to the configuration file.
    #[arg(long, value_name = "CONFIG", default_value = "settler.json")]
    pub config: PathBuf,

    /// The process port.
    #[arg(long = "http.port", value_name = "PORT", env = "PORT")]
    pub port: Option<u16>,

    /// Database URL.
    #[arg(long, value_name = "DATABASE_URL", env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Comma-separated payout signing keys.
    #[arg(long, value_name = "KEYS", env = "SETTLER_PAYOUT_KEYS", value_delimiter = ',')]
    pub payout_keys: Vec<String>,
}

impl Args {
    /// Overlays CLI and environment values onto a loaded configuration.
    pub fn merge_config(&self, mut config: SettlerConfig) -> SettlerConfig {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.database_url.is_some() {
            config.database_url = self.database_url.clone();
        }
        if !self.payout_keys.is_empty() {
            config.secrets.payout_keys = self.payout_keys.clone();
        }
        config
    }
}
