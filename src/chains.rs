//! Per-chain RPC provider registry.

use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::primitives::ChainId;
use dashmap::DashMap;
use tracing::info;
use url::Url;

/// Providers keyed by chain, rebuilt whenever the configured URL changes.
#[derive(Debug, Default)]
pub struct ChainProviders {
    providers: DashMap<ChainId, (Url, DynProvider)>,
}

impl ChainProviders {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The provider for `chain` at `url`. A cached provider is reused only
    /// while its URL matches the configuration.
    pub fn provider(&self, chain: ChainId, url: &Url) -> DynProvider {
        if let Some(entry) = self.providers.get(&chain) {
            if entry.0 == *url {
                return entry.1.clone();
            }
            info!(chain, %url, "rpc endpoint changed, rebuilding provider");
        }

        let provider = ProviderBuilder::new().connect_http(url.clone()).erased();
        self.providers.insert(chain, (url.clone(), provider.clone()));
        provider
    }
}
