//! Settlement storage implementation in-memory. For testing only.
//!
//! Transactions are serialized behind a single owned mutex, which gives the
//! same observable guarantees as row-level locking for the workloads the
//! suite drives: a transaction held open across a broadcast blocks every
//! competing writer until it commits or rolls back.

use super::api::{BridgeClose, Result, SettlementTx, StorageApi};
use crate::{
    types::{BridgeStatus, BridgeTx, Transfer, TransferStatus, TransferVersion},
};
use alloy::primitives::{Address, ChainId, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct Inner {
    transfers: DashMap<(ChainId, B256), Transfer>,
    bridges: DashMap<(ChainId, B256), BridgeTx>,
    serials: DashMap<B256, B256>,
    next_id: AtomicI64,
}

/// [`StorageApi`] implementation in-memory. Used for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Inner>,
    tx_lock: Arc<Mutex<()>>,
}

impl InMemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageApi for InMemoryStorage {
    async fn insert_transfer(&self, transfer: &Transfer) -> Result<()> {
        self.inner.transfers.insert(transfer.key(), transfer.clone());
        Ok(())
    }

    async fn transfer(&self, chain: ChainId, hash: B256) -> Result<Option<Transfer>> {
        Ok(self.inner.transfers.get(&(chain, hash)).map(|t| t.clone()))
    }

    async fn unprocessed_deposits(
        &self,
        versions: &[TransferVersion],
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transfer>> {
        let mut rows: Vec<Transfer> = self
            .inner
            .transfers
            .iter()
            .filter(|t| {
                t.status == TransferStatus::Success
                    && t.op_status == 0
                    && versions.contains(&t.version)
                    && t.timestamp >= since
            })
            .map(|t| t.clone())
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn unprocessed_payouts(
        &self,
        versions: &[TransferVersion],
        limit: i64,
    ) -> Result<Vec<Transfer>> {
        let mut rows: Vec<Transfer> = self
            .inner
            .transfers
            .iter()
            .filter(|t| {
                matches!(t.status, TransferStatus::Success | TransferStatus::Failed)
                    && t.op_status == 0
                    && versions.contains(&t.version)
            })
            .map(|t| t.clone())
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn set_transfer_op_status(&self, chain: ChainId, hash: B256, op: i16) -> Result<()> {
        if let Some(mut t) = self.inner.transfers.get_mut(&(chain, hash)) {
            t.op_status = op;
        }
        Ok(())
    }

    async fn bridge_by_source(&self, chain: ChainId, source_id: B256) -> Result<Option<BridgeTx>> {
        Ok(self.inner.bridges.get(&(chain, source_id)).map(|b| b.clone()))
    }

    async fn bridge_by_target(&self, chain: ChainId, target_id: B256) -> Result<Option<BridgeTx>> {
        Ok(self
            .inner
            .bridges
            .iter()
            .find(|b| b.target_chain == chain && b.target_id == Some(target_id))
            .map(|b| b.clone()))
    }

    async fn closable_match(
        &self,
        chain: ChainId,
        symbol: &str,
        address: Address,
        amount: U256,
        sender: Address,
    ) -> Result<Option<BridgeTx>> {
        let mut rows: Vec<BridgeTx> = self
            .inner
            .bridges
            .iter()
            .filter(|b| {
                BridgeStatus::CLOSABLE.contains(&b.status)
                    && b.target_chain == chain
                    && b.target_symbol == symbol
                    && b.target_address == address
                    && b.target_amount == amount
                    && b.allows_maker(&sender)
            })
            .map(|b| b.clone())
            .collect();
        rows.sort_by_key(|b| b.id);
        Ok(rows.into_iter().next())
    }

    async fn pending_payout_rows(&self) -> Result<Vec<BridgeTx>> {
        Ok(self
            .inner
            .bridges
            .iter()
            .filter(|b| b.status == BridgeStatus::Created && b.target_id.is_none())
            .map(|b| b.clone())
            .collect())
    }

    async fn bridges_with_status(&self, status: BridgeStatus) -> Result<Vec<BridgeTx>> {
        Ok(self
            .inner
            .bridges
            .iter()
            .filter(|b| b.status == status)
            .map(|b| b.clone())
            .collect())
    }

    async fn set_bridge_status(
        &self,
        chain: ChainId,
        source_id: B256,
        from: BridgeStatus,
        to: BridgeStatus,
    ) -> Result<u64> {
        match self.inner.bridges.get_mut(&(chain, source_id)) {
            Some(mut b) if b.status == from => {
                b.status = to;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn mark_recovered(
        &self,
        chain: ChainId,
        source_id: B256,
        tx_hash: B256,
    ) -> Result<u64> {
        match self.inner.bridges.get_mut(&(chain, source_id)) {
            Some(mut b) if b.status == BridgeStatus::ReadyPaid => {
                b.status = BridgeStatus::PaidSuccess;
                b.target_id = Some(tx_hash);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn finalize_receipt(
        &self,
        chain: ChainId,
        source_id: B256,
        maker: Address,
    ) -> Result<u64> {
        match self.inner.bridges.get_mut(&(chain, source_id)) {
            Some(mut b) if b.status == BridgeStatus::PaidSuccess => {
                b.status = BridgeStatus::Matched;
                b.target_maker = Some(maker);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn serial_by_source(&self, source_id: B256) -> Result<Option<B256>> {
        Ok(self.inner.serials.get(&source_id).map(|h| *h))
    }

    async fn save_serial(&self, source_ids: &[B256], tx_hash: B256) -> Result<()> {
        for id in source_ids {
            self.inner.serials.insert(*id, tx_hash);
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn SettlementTx>> {
        let guard = self.tx_lock.clone().lock_owned().await;
        Ok(Box::new(MemTx {
            inner: self.inner.clone(),
            _guard: guard,
            undo: Vec::new(),
            finished: false,
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

enum Undo {
    Bridge { key: (ChainId, B256), prev: Option<BridgeTx> },
    TransferOp { key: (ChainId, B256), prev: i16 },
}

struct MemTx {
    inner: Arc<Inner>,
    _guard: OwnedMutexGuard<()>,
    undo: Vec<Undo>,
    finished: bool,
}

impl MemTx {
    fn restore(&mut self) {
        for op in self.undo.drain(..).rev() {
            match op {
                Undo::Bridge { key, prev } => match prev {
                    Some(row) => {
                        self.inner.bridges.insert(key, row);
                    }
                    None => {
                        self.inner.bridges.remove(&key);
                    }
                },
                Undo::TransferOp { key, prev } => {
                    if let Some(mut t) = self.inner.transfers.get_mut(&key) {
                        t.op_status = prev;
                    }
                }
            }
        }
    }

    fn snapshot_bridge(&mut self, key: (ChainId, B256)) {
        let prev = self.inner.bridges.get(&key).map(|b| b.clone());
        self.undo.push(Undo::Bridge { key, prev });
    }
}

impl Drop for MemTx {
    fn drop(&mut self) {
        // Dropping an unfinished transaction rolls it back.
        if !self.finished {
            self.restore();
        }
    }
}

#[async_trait]
impl SettlementTx for MemTx {
    async fn bridge_for_update(
        &mut self,
        chain: ChainId,
        source_id: B256,
    ) -> Result<Option<BridgeTx>> {
        Ok(self.inner.bridges.get(&(chain, source_id)).map(|b| b.clone()))
    }

    async fn upsert_bridge(&mut self, row: &BridgeTx) -> Result<()> {
        let key = (row.source_chain, row.source_id);
        if let Some(existing) = self.inner.bridges.get(&key) {
            if existing.status.in_operation() {
                return Ok(());
            }
        }
        self.snapshot_bridge(key);

        let mut row = row.clone();
        if row.id.is_none() {
            row.id = Some(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        }
        self.inner.bridges.insert(key, row);
        Ok(())
    }

    async fn save_bridge(&mut self, row: &BridgeTx) -> Result<()> {
        let key = (row.source_chain, row.source_id);
        self.snapshot_bridge(key);
        self.inner.bridges.insert(key, row.clone());
        Ok(())
    }

    async fn update_bridge_status(
        &mut self,
        keys: &[(ChainId, B256)],
        from: BridgeStatus,
        to: BridgeStatus,
    ) -> Result<u64> {
        let mut affected = 0;
        for key in keys {
            let prev = self.inner.bridges.get(key).map(|b| b.clone());
            if let Some(mut b) = self.inner.bridges.get_mut(key) {
                if b.status == from {
                    self.undo.push(Undo::Bridge { key: *key, prev });
                    b.status = to;
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn record_broadcast(
        &mut self,
        keys: &[(ChainId, B256)],
        target_id: Option<B256>,
        target_maker: Option<Address>,
        target_nonce: Option<u64>,
        to: BridgeStatus,
    ) -> Result<u64> {
        let mut affected = 0;
        for key in keys {
            let prev = self.inner.bridges.get(key).map(|b| b.clone());
            if let Some(mut b) = self.inner.bridges.get_mut(key) {
                if b.status == BridgeStatus::ReadyPaid {
                    self.undo.push(Undo::Bridge { key: *key, prev });
                    b.target_id = target_id;
                    b.target_maker = target_maker;
                    b.target_nonce = target_nonce;
                    b.status = to;
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn close_bridge(&mut self, close: &BridgeClose) -> Result<u64> {
        let key = (close.source_chain, close.source_id);
        let prev = self.inner.bridges.get(&key).map(|b| b.clone());
        match self.inner.bridges.get_mut(&key) {
            Some(mut b) if BridgeStatus::CLOSABLE.contains(&b.status) => {
                self.undo.push(Undo::Bridge { key, prev });
                b.target_id = Some(close.target_id);
                b.target_time = Some(close.target_time);
                b.target_fee = close.target_fee.clone();
                b.target_fee_symbol = close.target_fee_symbol.clone();
                b.target_nonce = Some(close.target_nonce);
                b.target_maker = Some(close.target_maker);
                b.status = close.status;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn set_transfer_op_status(
        &mut self,
        keys: &[(ChainId, B256)],
        op: i16,
    ) -> Result<u64> {
        let mut affected = 0;
        for key in keys {
            if let Some(mut t) = self.inner.transfers.get_mut(key) {
                self.undo.push(Undo::TransferOp { key: *key, prev: t.op_status });
                t.op_status = op;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.undo.clear();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.restore();
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::op_status;
    use alloy::primitives::{address, b256};
    use chrono::Utc;

    fn transfer() -> Transfer {
        Transfer {
            hash: b256!("00000000000000000000000000000000000000000000000000000000000000aa"),
            chain_id: 1,
            sender: address!("1111111111111111111111111111111111111111"),
            receiver: address!("80c67432656d59144ceff962e8faf8926599bcf8"),
            token: Address::ZERO,
            symbol: "ETH".into(),
            amount: "1.0".into(),
            value: U256::from(1_000_000_000_000_009_912u64),
            nonce: 12,
            timestamp: Utc::now(),
            fee_amount: None,
            fee_token: None,
            input: None,
            version: TransferVersion::V2Deposit,
            status: TransferStatus::Success,
            op_status: 0,
        }
    }

    fn bridge() -> BridgeTx {
        let t = transfer();
        BridgeTx {
            id: None,
            source_chain: t.chain_id,
            source_id: t.hash,
            source_address: t.sender,
            source_maker: t.receiver,
            source_amount: t.amount.clone(),
            source_symbol: t.symbol.clone(),
            source_token: t.token,
            source_nonce: t.nonce,
            source_time: t.timestamp,
            target_chain: 10,
            target_id: None,
            target_address: t.sender,
            target_amount: U256::from(996_995_015_000_000_012u64),
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
            response_maker: vec![t.receiver],
            version: t.version,
            status: BridgeStatus::Created,
        }
    }

    #[tokio::test]
    async fn rollback_restores_everything_it_touched() {
        let storage = InMemoryStorage::new();
        storage.insert_transfer(&transfer()).await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        tx.upsert_bridge(&bridge()).await.unwrap();
        tx.set_transfer_op_status(&[(1, transfer().hash)], op_status::SOURCE_BUILT)
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(storage.bridge_by_source(1, transfer().hash).await.unwrap().is_none());
        assert_eq!(storage.transfer(1, transfer().hash).await.unwrap().unwrap().op_status, 0);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let storage = InMemoryStorage::new();
        {
            let mut tx = storage.begin().await.unwrap();
            tx.upsert_bridge(&bridge()).await.unwrap();
            // Dropped without commit.
        }
        assert!(storage.bridge_by_source(1, transfer().hash).await.unwrap().is_none());

        // The lock is released; a later transaction commits normally.
        let mut tx = storage.begin().await.unwrap();
        tx.upsert_bridge(&bridge()).await.unwrap();
        tx.commit().await.unwrap();
        let row = storage.bridge_by_source(1, transfer().hash).await.unwrap().unwrap();
        assert_eq!(row.status, BridgeStatus::Created);
        assert!(row.id.is_some());
    }

    #[tokio::test]
    async fn guarded_updates_report_row_counts() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.begin().await.unwrap();
        tx.upsert_bridge(&bridge()).await.unwrap();
        tx.commit().await.unwrap();

        let key = (1, transfer().hash);
        let mut tx = storage.begin().await.unwrap();
        assert_eq!(
            tx.update_bridge_status(&[key], BridgeStatus::Created, BridgeStatus::ReadyPaid)
                .await
                .unwrap(),
            1
        );
        // A second guarded flip from the same status misses.
        assert_eq!(
            tx.update_bridge_status(&[key], BridgeStatus::Created, BridgeStatus::ReadyPaid)
                .await
                .unwrap(),
            0
        );
        tx.commit().await.unwrap();
    }
}
