//! # Bridge Settler
//!
//! Settlement engine of a cross-chain bridge: matches source-chain
//! deposits to their destination-chain obligations and dispatches maker
//! payouts under per-sender serialization, nonce management, and
//! exactly-once constraints.

pub mod account;
pub mod alerts;
pub mod chains;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod matcher;
pub mod rates;
pub mod rules;
pub mod sequencer;
pub mod spawn;
pub mod storage;
pub mod types;
