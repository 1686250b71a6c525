//! Settlement storage api.

use crate::{
    error::StorageError,
    types::{BridgeStatus, BridgeTx, Transfer, TransferVersion},
};
use alloy::primitives::{Address, ChainId, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Type alias for `Result<T, StorageError>`.
pub type Result<T> = core::result::Result<T, StorageError>;

/// Target-side fields written when the destination sweep closes a row.
#[derive(Debug, Clone)]
pub struct BridgeClose {
    /// Chain of the source deposit.
    pub source_chain: ChainId,
    /// Hash of the source deposit.
    pub source_id: B256,
    /// Hash of the payout transaction.
    pub target_id: B256,
    /// Payout block time.
    pub target_time: DateTime<Utc>,
    /// Fee paid by the payout transaction.
    pub target_fee: Option<String>,
    /// Token the payout fee was paid in.
    pub target_fee_symbol: Option<String>,
    /// Sender nonce of the payout transaction.
    pub target_nonce: u64,
    /// Maker that fulfilled the payout.
    pub target_maker: Address,
    /// `Matched` for a successful payout, `OnChainFailed` for a reverted one.
    pub status: BridgeStatus,
}

/// Storage API.
#[async_trait]
pub trait StorageApi: Debug + Send + Sync {
    /// Inserts an ingested transfer row.
    async fn insert_transfer(&self, transfer: &Transfer) -> Result<()>;

    /// Reads one transfer by its chain and hash.
    async fn transfer(&self, chain: ChainId, hash: B256) -> Result<Option<Transfer>>;

    /// Confirmed deposits the source sweep has not yet visited, newest
    /// first, no older than `since`.
    async fn unprocessed_deposits(
        &self,
        versions: &[TransferVersion],
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transfer>>;

    /// Finalized payout-side transfers the destination sweep has not yet
    /// visited.
    async fn unprocessed_payouts(
        &self,
        versions: &[TransferVersion],
        limit: i64,
    ) -> Result<Vec<Transfer>>;

    /// Writes a matcher progress marker outside a transaction.
    async fn set_transfer_op_status(&self, chain: ChainId, hash: B256, op: i16) -> Result<()>;

    /// Reads a bridge row by its logical identity.
    async fn bridge_by_source(&self, chain: ChainId, source_id: B256) -> Result<Option<BridgeTx>>;

    /// Reads a bridge row by its payout transaction.
    async fn bridge_by_target(&self, chain: ChainId, target_id: B256) -> Result<Option<BridgeTx>>;

    /// Content-match lookup used by the destination sweep: closable rows
    /// with the given target key whose `response_maker` contains `sender`.
    async fn closable_match(
        &self,
        chain: ChainId,
        symbol: &str,
        address: Address,
        amount: U256,
        sender: Address,
    ) -> Result<Option<BridgeTx>>;

    /// Rows awaiting a payout attempt: `Created` with no `target_id`.
    async fn pending_payout_rows(&self) -> Result<Vec<BridgeTx>>;

    /// All rows at the given status; used by the startup reconciler.
    async fn bridges_with_status(&self, status: BridgeStatus) -> Result<Vec<BridgeTx>>;

    /// Guarded single-row status flip outside a transaction. Returns the
    /// affected row count.
    async fn set_bridge_status(
        &self,
        chain: ChainId,
        source_id: B256,
        from: BridgeStatus,
        to: BridgeStatus,
    ) -> Result<u64>;

    /// Promotes a recovered row to `PaidSuccess` with its payout hash,
    /// guarded on `ReadyPaid`.
    async fn mark_recovered(
        &self,
        chain: ChainId,
        source_id: B256,
        tx_hash: B256,
    ) -> Result<u64>;

    /// Finalizes a row once its receipt is observed: `PaidSuccess` to
    /// `Matched`, recording the confirmed sender.
    async fn finalize_receipt(
        &self,
        chain: ChainId,
        source_id: B256,
        maker: Address,
    ) -> Result<u64>;

    /// The payout hash recorded for a source deposit, if a broadcast was
    /// ever attempted.
    async fn serial_by_source(&self, source_id: B256) -> Result<Option<B256>>;

    /// Durably records `source_ids -> tx_hash` before the nonce is
    /// submitted. Survives process crashes; the recovery anchor.
    async fn save_serial(&self, source_ids: &[B256], tx_hash: B256) -> Result<()>;

    /// Opens a storage transaction.
    async fn begin(&self) -> Result<Box<dyn SettlementTx>>;

    /// Pings the database, checking if the connection is alive.
    async fn ping(&self) -> Result<()>;
}

/// A storage transaction. Everything inside either commits atomically or
/// rolls back; dropping without [`commit`](Self::commit) rolls back.
#[async_trait]
pub trait SettlementTx: Send {
    /// Reads a bridge row with a row-level write lock held for the
    /// remainder of the transaction.
    async fn bridge_for_update(
        &mut self,
        chain: ChainId,
        source_id: B256,
    ) -> Result<Option<BridgeTx>>;

    /// Inserts or updates a bridge row keyed `(source_chain, source_id)`.
    /// Rows already in operation are never overwritten; the matcher's
    /// write primitive.
    async fn upsert_bridge(&mut self, row: &BridgeTx) -> Result<()>;

    /// Unconditionally writes a bridge row previously loaded with
    /// [`bridge_for_update`](Self::bridge_for_update); the sequencer's
    /// write primitive while it owns the row lock.
    async fn save_bridge(&mut self, row: &BridgeTx) -> Result<()>;

    /// Guarded status flip over a set of rows; returns the affected count
    /// so callers can enforce batch-size invariants.
    async fn update_bridge_status(
        &mut self,
        keys: &[(ChainId, B256)],
        from: BridgeStatus,
        to: BridgeStatus,
    ) -> Result<u64>;

    /// Records a broadcast over a set of rows previously promoted to
    /// `ReadyPaid`: writes the best-known payout hash and sender and flips
    /// the status. Returns the affected count.
    async fn record_broadcast(
        &mut self,
        keys: &[(ChainId, B256)],
        target_id: Option<B256>,
        target_maker: Option<Address>,
        target_nonce: Option<u64>,
        to: BridgeStatus,
    ) -> Result<u64>;

    /// Writes the target side of a matched row, guarded on the closable
    /// statuses. Returns the affected count.
    async fn close_bridge(&mut self, close: &BridgeClose) -> Result<u64>;

    /// Flips matcher progress markers; returns the affected count.
    async fn set_transfer_op_status(
        &mut self,
        keys: &[(ChainId, B256)],
        op: i16,
    ) -> Result<u64>;

    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rolls the transaction back.
    async fn rollback(self: Box<Self>) -> Result<()>;
}
