//! In-memory match acceleration for the destination sweep.
//!
//! Two bounded indexes share the content key `(chain, symbol, address,
//! amount)`: recent unmatched bridge rows published by the source sweep,
//! and payout-side transfers that arrived before their bridge row existed.
//! Eviction is FIFO per side.

use crate::{
    constants::{MATCH_CACHE_CAPACITY, MATCH_LOOKAHEAD, MATCH_LOOKBACK},
    types::{BridgeTx, Transfer, TransferVersion},
};
use alloy::primitives::{Address, ChainId, B256, U256};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::{collections::VecDeque, sync::Mutex};

/// Content key the destination sweep matches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    /// Chain the payout lands on.
    pub chain: ChainId,
    /// Payout token symbol.
    pub symbol: String,
    /// Payout recipient.
    pub address: Address,
    /// Exact raw payout value.
    pub amount: U256,
}

impl MatchKey {
    /// Key of a bridge row's target side.
    pub fn of_bridge(row: &BridgeTx) -> Self {
        Self {
            chain: row.target_chain,
            symbol: row.target_symbol.clone(),
            address: row.target_address,
            amount: row.target_amount,
        }
    }

    /// Key a payout-side transfer is looked up under.
    pub fn of_payout(transfer: &Transfer) -> Self {
        Self {
            chain: transfer.chain_id,
            symbol: transfer.symbol.clone(),
            address: transfer.receiver,
            amount: transfer.value,
        }
    }
}

/// Slimmed bridge row kept on the cache's bridge side.
#[derive(Debug, Clone)]
pub struct BridgeCandidate {
    /// Chain of the source deposit.
    pub source_chain: ChainId,
    /// Hash of the source deposit.
    pub source_id: B256,
    /// Deposit block time, for the match window.
    pub source_time: DateTime<Utc>,
    /// Makers allowed to fulfill the row.
    pub response_maker: Vec<Address>,
}

/// Whether a deposit at `source_time` may pair with a payout at
/// `payout_time`.
pub fn within_match_window(source_time: DateTime<Utc>, payout_time: DateTime<Utc>) -> bool {
    let lookback = ChronoDuration::from_std(MATCH_LOOKBACK).expect("constant fits");
    let lookahead = ChronoDuration::from_std(MATCH_LOOKAHEAD).expect("constant fits");
    source_time >= payout_time - lookback && source_time <= payout_time + lookahead
}

#[derive(Debug, Default)]
pub struct MatchCache {
    bridges: DashMap<MatchKey, Vec<BridgeCandidate>>,
    bridge_order: Mutex<VecDeque<(MatchKey, B256)>>,
    parked: DashMap<(ChainId, B256), Transfer>,
    parked_order: Mutex<VecDeque<(ChainId, B256)>>,
}

impl MatchCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a freshly built bridge row for fast reverse matching.
    pub fn publish_bridge(&self, row: &BridgeTx) {
        let key = MatchKey::of_bridge(row);
        let candidate = BridgeCandidate {
            source_chain: row.source_chain,
            source_id: row.source_id,
            source_time: row.source_time,
            response_maker: row.response_maker.clone(),
        };

        let mut order = self.bridge_order.lock().expect("cache order poisoned");
        let mut slot = self.bridges.entry(key.clone()).or_default();
        if slot.iter().any(|c| c.source_id == candidate.source_id) {
            return;
        }
        slot.push(candidate);
        drop(slot);

        order.push_back((key, row.source_id));
        if order.len() > MATCH_CACHE_CAPACITY {
            if let Some((old_key, old_id)) = order.pop_front() {
                self.remove_candidate(&old_key, old_id);
            }
        }
    }

    /// Removes and returns the oldest published row matching the key, the
    /// maker, and the time window.
    pub fn take_bridge_candidate(
        &self,
        key: &MatchKey,
        sender: Address,
        payout_time: DateTime<Utc>,
    ) -> Option<BridgeCandidate> {
        let mut slot = self.bridges.get_mut(key)?;
        let idx = slot.iter().position(|c| {
            c.response_maker.contains(&sender) && within_match_window(c.source_time, payout_time)
        })?;
        Some(slot.remove(idx))
    }

    /// Drops a published row, e.g. once it is closed through the database.
    pub fn remove_bridge(&self, key: &MatchKey, source_id: B256) {
        self.remove_candidate(key, source_id);
    }

    fn remove_candidate(&self, key: &MatchKey, source_id: B256) {
        if let Some(mut slot) = self.bridges.get_mut(key) {
            slot.retain(|c| c.source_id != source_id);
        }
        self.bridges.remove_if(key, |_, v| v.is_empty());
    }

    /// Parks a payout-side transfer that found no bridge row yet.
    pub fn park_transfer(&self, transfer: &Transfer) {
        let key = transfer.key();
        if self.parked.insert(key, transfer.clone()).is_none() {
            let mut order = self.parked_order.lock().expect("cache order poisoned");
            order.push_back(key);
            if order.len() > MATCH_CACHE_CAPACITY {
                if let Some(old) = order.pop_front() {
                    self.parked.remove(&old);
                }
            }
        }
    }

    /// Parked transfers of one dialect, oldest first.
    pub fn parked_transfers(&self, version: TransferVersion) -> Vec<Transfer> {
        let order = self.parked_order.lock().expect("cache order poisoned");
        order
            .iter()
            .filter_map(|key| self.parked.get(key))
            .filter(|t| t.version == version)
            .map(|t| t.clone())
            .collect()
    }

    /// Unparks a transfer once it matched.
    pub fn unpark(&self, chain: ChainId, hash: B256) {
        self.parked.remove(&(chain, hash));
    }

    /// Number of published bridge candidates.
    pub fn bridge_len(&self) -> usize {
        self.bridges.iter().map(|e| e.len()).sum()
    }

    /// Number of parked transfers.
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BridgeStatus, TransferStatus};
    use alloy::primitives::{address, b256};

    fn bridge(source_id: B256, maker: Address, source_time: DateTime<Utc>) -> BridgeTx {
        BridgeTx {
            id: None,
            source_chain: 1,
            source_id,
            source_address: address!("1111111111111111111111111111111111111111"),
            source_maker: maker,
            source_amount: "1.0".into(),
            source_symbol: "ETH".into(),
            source_token: Address::ZERO,
            source_nonce: 12,
            source_time,
            target_chain: 10,
            target_id: None,
            target_address: address!("1111111111111111111111111111111111111111"),
            target_amount: U256::from(996_970_000_000_010_012u64),
            target_symbol: "ETH".into(),
            target_token: Address::ZERO,
            target_maker: None,
            target_time: None,
            target_nonce: None,
            target_fee: None,
            target_fee_symbol: None,
            rule_id: "1-10:ETH-ETH".into(),
            ebc_address: Address::ZERO,
            dealer_address: Address::ZERO,
            withholding_fee: U256::ZERO,
            trade_fee: U256::ZERO,
            response_maker: vec![maker],
            version: crate::types::TransferVersion::V2Deposit,
            status: BridgeStatus::Created,
        }
    }

    #[test]
    fn takes_candidate_within_window() {
        let cache = MatchCache::new();
        let maker = address!("80c67432656d59144ceff962e8faf8926599bcf8");
        let now = Utc::now();
        let row = bridge(b256!("00000000000000000000000000000000000000000000000000000000000000aa"), maker, now);
        cache.publish_bridge(&row);

        let key = MatchKey::of_bridge(&row);
        // A stranger maker does not match.
        assert!(cache
            .take_bridge_candidate(&key, Address::ZERO, now)
            .is_none());
        // The configured maker does, and the entry is consumed.
        assert!(cache.take_bridge_candidate(&key, maker, now).is_some());
        assert!(cache.take_bridge_candidate(&key, maker, now).is_none());
    }

    #[test]
    fn respects_time_window() {
        let cache = MatchCache::new();
        let maker = address!("80c67432656d59144ceff962e8faf8926599bcf8");
        let now = Utc::now();
        let stale = now - ChronoDuration::minutes(121);
        let row = bridge(b256!("00000000000000000000000000000000000000000000000000000000000000ab"), maker, stale);
        cache.publish_bridge(&row);

        assert!(cache
            .take_bridge_candidate(&MatchKey::of_bridge(&row), maker, now)
            .is_none());
    }

    #[test]
    fn parks_and_unparks_transfers() {
        let cache = MatchCache::new();
        let transfer = Transfer {
            hash: b256!("00000000000000000000000000000000000000000000000000000000000000ac"),
            chain_id: 10,
            sender: address!("80c67432656d59144ceff962e8faf8926599bcf8"),
            receiver: address!("1111111111111111111111111111111111111111"),
            token: Address::ZERO,
            symbol: "ETH".into(),
            amount: "0.9".into(),
            value: U256::from(996_970_000_000_010_012u64),
            nonce: 3,
            timestamp: Utc::now(),
            fee_amount: None,
            fee_token: None,
            input: None,
            version: crate::types::TransferVersion::V2Payout,
            status: TransferStatus::Success,
            op_status: 0,
        };

        cache.park_transfer(&transfer);
        cache.park_transfer(&transfer);
        assert_eq!(cache.parked_len(), 1);
        assert_eq!(cache.parked_transfers(crate::types::TransferVersion::V2Payout).len(), 1);
        assert!(cache.parked_transfers(crate::types::TransferVersion::V1Payout).is_empty());

        cache.unpark(transfer.chain_id, transfer.hash);
        assert_eq!(cache.parked_len(), 0);
    }
}
