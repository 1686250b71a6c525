//! Settlement engine constants.

use alloy::{primitives::U256, uint};
use std::time::Duration;

/// Process-wide identifier reported in logs and alerts.
pub const APP_NAME: &str = "arbitration-api";

/// Modulus carving the 4-digit security/safety code out of a raw value.
pub const CODE_MODULUS: U256 = uint!(10_000_U256);

/// Largest source nonce that still fits the 4-digit safety code.
pub const MAX_SAFETY_NONCE: u64 = 9_999;

/// Trade fees are expressed in basis points of the traded amount.
pub const TRADE_FEE_DENOMINATOR: U256 = uint!(10_000_U256);

/// Deposits older than this are never picked up by the source sweep.
pub const MAX_SOURCE_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum number of deposits handled by one source sweep.
pub const SOURCE_SWEEP_LIMIT: i64 = 1_000;

/// Maximum number of payout transfers handled by one destination sweep.
pub const DEST_SWEEP_LIMIT: i64 = 1_000;

/// A matched source deposit must not be older than this relative to the payout.
pub const MATCH_LOOKBACK: Duration = Duration::from_secs(120 * 60);

/// A matched source deposit may postdate the payout by at most this much.
pub const MATCH_LOOKAHEAD: Duration = Duration::from_secs(5 * 60);

/// End-to-end bound on the fee computation before a payout is aborted.
pub const FEE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the sequencer drains the in-flight set.
pub const SCHEDULE_INTERVAL: Duration = Duration::from_secs(15);

/// Upper bound on entries kept per side of the in-memory match cache.
pub const MATCH_CACHE_CAPACITY: usize = 4_096;

/// Default port for the process listener.
pub const DEFAULT_PORT: u16 = 3000;

/// Default port for the Prometheus exporter.
pub const DEFAULT_METRICS_PORT: u16 = 9000;
