//! Engine assembly and startup.

use crate::{
    account::{AccountRegistry, EoaAccount},
    alerts::{Alerts, NoopAlerts, TelegramAlerter},
    chains::ChainProviders,
    config::SettlerConfig,
    matcher::{MatchCache, Matcher},
    rates::RateOracle,
    rules::{RuleBook, RuleEvaluator, StaticRuleGraph, TokenRegistry},
    sequencer::{InFlightStore, PayoutPolicy, Sequencer},
    storage::{InMemoryStorage, PgStorage, StorageApi},
    types::TransferVersion,
};
use alloy::signers::local::PrivateKeySigner;
use eyre::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn};

/// Builds every component from the configuration and spawns the periodic
/// tasks: the four sweeps, the payout scheduler, and the startup
/// reconciliation.
pub async fn try_spawn(config: SettlerConfig) -> eyre::Result<()> {
    let storage: Arc<dyn StorageApi> = match &config.database_url {
        Some(url) => Arc::new(PgStorage::connect(url).await.wrap_err("connecting database")?),
        None => {
            warn!("no database configured; using the volatile in-memory store");
            Arc::new(InMemoryStorage::new())
        }
    };
    storage.ping().await.wrap_err("database ping")?;

    let rules = Arc::new(RuleBook::load(&config.rules.maker_files)?);
    if rules.is_empty() {
        warn!("no maker rules loaded; the source sweep will build nothing");
    }
    let graph = Arc::new(StaticRuleGraph {
        dealers: config.rules.dealers.clone(),
        ebcs: config.rules.ebcs.clone(),
        chain_index: config.rules.chain_index.clone(),
    });
    let tokens = Arc::new(TokenRegistry::new(config.tokens.clone()));
    let evaluator = RuleEvaluator::new(graph, rules.clone(), tokens.clone());

    let mut rates = RateOracle::default();
    if let Some(constant_rate) = config.payout.constant_rate {
        warn!(constant_rate, "constant exchange rate set; not for production");
        rates = rates.with_constant_rate(constant_rate);
    }

    let alerts: Arc<dyn Alerts> = match &config.telegram {
        Some(telegram) if telegram.is_configured() => {
            Arc::new(TelegramAlerter::new(telegram.clone()))
        }
        _ => Arc::new(NoopAlerts),
    };

    let providers = ChainProviders::new();
    let mut accounts = AccountRegistry::new();
    for key in &config.secrets.payout_keys {
        let signer: PrivateKeySigner = key.parse().wrap_err("invalid payout key")?;
        for chain in &config.chains {
            accounts.insert(Arc::new(EoaAccount::new(
                chain.chain_id,
                providers.provider(chain.chain_id, &chain.rpc_url),
                signer.clone(),
                storage.clone(),
                chain.fees.clone(),
                chain.router,
            )));
        }
    }
    let accounts = Arc::new(accounts);
    info!(
        accounts = accounts.accounts().len(),
        chains = config.chains.len(),
        rules = rules.len(),
        "settlement engine assembled"
    );

    let store = Arc::new(InFlightStore::new());
    let cache = Arc::new(MatchCache::new());
    let matcher = Arc::new(Matcher::new(
        storage.clone(),
        evaluator,
        cache.clone(),
        store.clone(),
    ));
    let sequencer = Arc::new(Sequencer::new(
        storage.clone(),
        store.clone(),
        alerts,
        rates,
        accounts,
        tokens,
        PayoutPolicy {
            max_loss_bps: config.payout.max_loss_bps,
            batch_enabled: config.payout.batch_enabled,
        },
    ));

    // Crash recovery precedes any new payout attempt.
    let recovered = sequencer.reconcile().await?;
    let queued = sequencer.backfill().await?;
    info!(recovered, queued, "startup reconciliation complete");

    let exporter: SocketAddr = (config.server.address, config.server.metrics_port).into();
    if let Err(err) = PrometheusBuilder::new().with_http_listener(exporter).install() {
        warn!(%err, "metrics exporter failed to start");
    }

    spawn_sweep(matcher.clone(), TransferVersion::V1Deposit, config.sweeps.v1_source_secs);
    spawn_sweep(matcher.clone(), TransferVersion::V1Payout, config.sweeps.v1_dest_secs);
    spawn_sweep(matcher.clone(), TransferVersion::V2Deposit, config.sweeps.v2_source_secs);
    spawn_sweep(matcher, TransferVersion::V2Payout, config.sweeps.v2_dest_secs);
    tokio::spawn(sequencer.run());

    Ok(())
}

/// Runs one sweep on a fixed cadence.
fn spawn_sweep(matcher: Arc<Matcher>, version: TransferVersion, secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(secs));
        loop {
            ticker.tick().await;
            let result = if version.is_deposit() {
                matcher.source_sweep(version).await
            } else {
                matcher.dest_sweep(version).await
            };
            match result {
                Ok(0) => {}
                Ok(count) => info!(%version, count, "sweep pass done"),
                Err(err) => warn!(%version, %err, "sweep pass failed"),
            }
        }
    });
}
