//! Exchange-rate oracle used by the payout sanity bound.
//!
//! Rates are pushed by the external side service and served from an
//! in-task registry with a TTL. A constant rate can be injected for
//! testing.

use metrics::counter;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

/// A symbol pair, `from -> to`.
pub type RatePair = (String, String);

#[derive(Debug, Clone, Copy)]
struct RateTick {
    rate: f64,
    timestamp: Instant,
}

/// Messages used by the rate oracle task.
#[derive(Debug)]
enum RateMessage {
    Update { pairs: Vec<(RatePair, f64)>, timestamp: Instant },
    Lookup { pair: RatePair, tx: oneshot::Sender<Option<f64>> },
}

/// Configuration for the rate oracle.
#[derive(Debug, Clone)]
pub struct RateOracleConfig {
    /// Duration after which a rate is considered expired.
    pub rate_ttl: Duration,
}

impl Default for RateOracleConfig {
    fn default() -> Self {
        Self { rate_ttl: Duration::from_secs(300) }
    }
}

/// Serves conversion rates between token symbols.
#[derive(Debug, Clone)]
pub struct RateOracle {
    tx: mpsc::UnboundedSender<RateMessage>,
    constant_rate: Option<f64>,
}

impl Default for RateOracle {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl RateOracle {
    /// Returns a new [`RateOracle`].
    pub fn new(config: RateOracleConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut registry: HashMap<RatePair, RateTick> = HashMap::new();
            while let Some(message) = rx.recv().await {
                match message {
                    RateMessage::Update { pairs, timestamp } => {
                        trace!(count = pairs.len(), "received rate updates");
                        for (pair, rate) in pairs {
                            registry.insert(pair, RateTick { rate, timestamp });
                        }
                    }
                    RateMessage::Lookup { pair, tx } => {
                        let _ = tx.send(
                            registry
                                .get(&pair)
                                .filter(|t| {
                                    if t.timestamp.elapsed() > config.rate_ttl {
                                        warn!(?pair, "hit expired exchange rate");
                                        counter!("rates.expired_hits").increment(1);
                                        false
                                    } else {
                                        true
                                    }
                                })
                                .map(|t| t.rate),
                        );
                    }
                }
            }
        });

        Self { tx, constant_rate: None }
    }

    /// Returns [`Self`] with a constant rate to fall back to. For testing.
    pub fn with_constant_rate(mut self, rate: f64) -> Self {
        self.constant_rate = Some(rate);
        self
    }

    /// Pushes fresh rates into the registry.
    pub fn update(&self, pairs: Vec<(RatePair, f64)>) {
        let _ = self.tx.send(RateMessage::Update { pairs, timestamp: Instant::now() });
    }

    /// Conversion rate from one symbol to another. Identical symbols trade
    /// at parity without consulting the registry.
    pub async fn rate(&self, from: &str, to: &str) -> Option<f64> {
        if from == to {
            return Some(1.0);
        }

        let (req_tx, req_rx) = oneshot::channel();
        let _ = self.tx.send(RateMessage::Lookup {
            pair: (from.to_string(), to.to_string()),
            tx: req_tx,
        });
        req_rx.await.ok().flatten().or(self.constant_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parity_for_identical_symbols() {
        let oracle = RateOracle::default();
        assert_eq!(oracle.rate("ETH", "ETH").await, Some(1.0));
    }

    #[tokio::test]
    async fn serves_pushed_rates() {
        let oracle = RateOracle::default();
        oracle.update(vec![(("ETH".into(), "USDC".into()), 3200.0)]);
        // The update is processed by the oracle task before the lookup
        // because both travel the same channel.
        assert_eq!(oracle.rate("ETH", "USDC").await, Some(3200.0));
        assert_eq!(oracle.rate("USDC", "ETH").await, None);
    }

    #[tokio::test]
    async fn constant_rate_fallback() {
        let oracle = RateOracle::default().with_constant_rate(1.0);
        assert_eq!(oracle.rate("ETH", "USDC").await, Some(1.0));
    }
}
