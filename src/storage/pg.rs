//! Settlement storage implementation using a PostgreSQL database.

use super::api::{BridgeClose, Result, SettlementTx, StorageApi};
use crate::{
    error::StorageError,
    types::{BridgeStatus, BridgeTx, Transfer, TransferStatus, TransferVersion},
};
use alloy::primitives::{Address, Bytes, ChainId, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use tracing::instrument;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// PostgreSQL storage implementation.
#[derive(Debug)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Wraps an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and applies pending migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        MIGRATOR.run(&pool).await.map_err(|e| StorageError::Database(e.into()))?;
        Ok(Self { pool })
    }
}

fn decode<T>(col: &str, res: core::result::Result<T, impl std::fmt::Display>) -> Result<T> {
    res.map_err(|e| StorageError::Decode(format!("{col}: {e}")))
}

fn get_addr(row: &PgRow, col: &str) -> Result<Address> {
    let bytes: Vec<u8> = row.try_get(col)?;
    decode(col, Address::try_from(bytes.as_slice()))
}

fn get_addr_opt(row: &PgRow, col: &str) -> Result<Option<Address>> {
    let bytes: Option<Vec<u8>> = row.try_get(col)?;
    bytes.map(|b| decode(col, Address::try_from(b.as_slice()))).transpose()
}

fn get_b256(row: &PgRow, col: &str) -> Result<B256> {
    let bytes: Vec<u8> = row.try_get(col)?;
    decode(col, B256::try_from(bytes.as_slice()))
}

fn get_b256_opt(row: &PgRow, col: &str) -> Result<Option<B256>> {
    let bytes: Option<Vec<u8>> = row.try_get(col)?;
    bytes.map(|b| decode(col, B256::try_from(b.as_slice()))).transpose()
}

fn get_u256(row: &PgRow, col: &str) -> Result<U256> {
    let text: String = row.try_get(col)?;
    decode(col, U256::from_str(&text))
}

fn transfer_from_row(row: &PgRow) -> Result<Transfer> {
    let version: String = row.try_get("version")?;
    let status: i16 = row.try_get("status")?;
    Ok(Transfer {
        hash: get_b256(row, "hash")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as ChainId,
        sender: get_addr(row, "sender")?,
        receiver: get_addr(row, "receiver")?,
        token: get_addr(row, "token")?,
        symbol: row.try_get("symbol")?,
        amount: row.try_get("amount")?,
        value: get_u256(row, "value")?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        timestamp: row.try_get("timestamp")?,
        fee_amount: row.try_get("fee_amount")?,
        fee_token: row.try_get("fee_token")?,
        input: row.try_get::<Option<Vec<u8>>, _>("input")?.map(Bytes::from),
        version: decode("version", TransferVersion::from_str(&version))?,
        status: TransferStatus::from_i16(status)
            .ok_or_else(|| StorageError::Decode(format!("status: {status}")))?,
        op_status: row.try_get("op_status")?,
    })
}

fn bridge_from_row(row: &PgRow) -> Result<BridgeTx> {
    let version: String = row.try_get("version")?;
    let status: i16 = row.try_get("status")?;
    let makers: Vec<Vec<u8>> = row.try_get("response_maker")?;
    Ok(BridgeTx {
        id: Some(row.try_get("id")?),
        source_chain: row.try_get::<i64, _>("source_chain")? as ChainId,
        source_id: get_b256(row, "source_id")?,
        source_address: get_addr(row, "source_address")?,
        source_maker: get_addr(row, "source_maker")?,
        source_amount: row.try_get("source_amount")?,
        source_symbol: row.try_get("source_symbol")?,
        source_token: get_addr(row, "source_token")?,
        source_nonce: row.try_get::<i64, _>("source_nonce")? as u64,
        source_time: row.try_get("source_time")?,
        target_chain: row.try_get::<i64, _>("target_chain")? as ChainId,
        target_id: get_b256_opt(row, "target_id")?,
        target_address: get_addr(row, "target_address")?,
        target_amount: get_u256(row, "target_amount")?,
        target_symbol: row.try_get("target_symbol")?,
        target_token: get_addr(row, "target_token")?,
        target_maker: get_addr_opt(row, "target_maker")?,
        target_time: row.try_get("target_time")?,
        target_nonce: row.try_get::<Option<i64>, _>("target_nonce")?.map(|n| n as u64),
        target_fee: row.try_get("target_fee")?,
        target_fee_symbol: row.try_get("target_fee_symbol")?,
        rule_id: row.try_get("rule_id")?,
        ebc_address: get_addr(row, "ebc_address")?,
        dealer_address: get_addr(row, "dealer_address")?,
        withholding_fee: get_u256(row, "withholding_fee")?,
        trade_fee: get_u256(row, "trade_fee")?,
        response_maker: makers
            .iter()
            .map(|m| decode("response_maker", Address::try_from(m.as_slice())))
            .collect::<Result<_>>()?,
        version: decode("version", TransferVersion::from_str(&version))?,
        status: BridgeStatus::from_i16(status)
            .ok_or_else(|| StorageError::Decode(format!("status: {status}")))?,
    })
}

fn version_strings(versions: &[TransferVersion]) -> Vec<String> {
    versions.iter().map(|v| v.as_str().to_string()).collect()
}

fn closable_statuses() -> Vec<i16> {
    BridgeStatus::CLOSABLE.iter().map(|s| *s as i16).collect()
}

fn maker_bytes(makers: &[Address]) -> Vec<Vec<u8>> {
    makers.iter().map(|m| m.as_slice().to_vec()).collect()
}

#[async_trait]
impl StorageApi for PgStorage {
    #[instrument(skip_all, fields(hash = %transfer.hash))]
    async fn insert_transfer(&self, transfer: &Transfer) -> Result<()> {
        sqlx::query(
            "insert into transfers \
             (hash, chain_id, sender, receiver, token, symbol, amount, value, nonce, \
              timestamp, fee_amount, fee_token, input, version, status, op_status) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             on conflict (chain_id, hash) do nothing",
        )
        .bind(transfer.hash.as_slice())
        .bind(transfer.chain_id as i64)
        .bind(transfer.sender.as_slice())
        .bind(transfer.receiver.as_slice())
        .bind(transfer.token.as_slice())
        .bind(&transfer.symbol)
        .bind(&transfer.amount)
        .bind(transfer.value.to_string())
        .bind(transfer.nonce as i64)
        .bind(transfer.timestamp)
        .bind(&transfer.fee_amount)
        .bind(&transfer.fee_token)
        .bind(transfer.input.as_ref().map(|b| b.to_vec()))
        .bind(transfer.version.as_str())
        .bind(transfer.status as i16)
        .bind(transfer.op_status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transfer(&self, chain: ChainId, hash: B256) -> Result<Option<Transfer>> {
        sqlx::query("select * from transfers where chain_id = $1 and hash = $2")
            .bind(chain as i64)
            .bind(hash.as_slice())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| transfer_from_row(&row))
            .transpose()
    }

    async fn unprocessed_deposits(
        &self,
        versions: &[TransferVersion],
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transfer>> {
        sqlx::query(
            "select * from transfers \
             where status = 2 and op_status = 0 and version = any($1) and timestamp >= $2 \
             order by timestamp desc limit $3",
        )
        .bind(version_strings(versions))
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(transfer_from_row)
        .collect()
    }

    async fn unprocessed_payouts(
        &self,
        versions: &[TransferVersion],
        limit: i64,
    ) -> Result<Vec<Transfer>> {
        sqlx::query(
            "select * from transfers \
             where status in (2, 3) and op_status = 0 and version = any($1) \
             order by timestamp desc limit $2",
        )
        .bind(version_strings(versions))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(transfer_from_row)
        .collect()
    }

    async fn set_transfer_op_status(&self, chain: ChainId, hash: B256, op: i16) -> Result<()> {
        sqlx::query("update transfers set op_status = $3 where chain_id = $1 and hash = $2")
            .bind(chain as i64)
            .bind(hash.as_slice())
            .bind(op)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bridge_by_source(&self, chain: ChainId, source_id: B256) -> Result<Option<BridgeTx>> {
        sqlx::query("select * from bridge_txs where source_chain = $1 and source_id = $2")
            .bind(chain as i64)
            .bind(source_id.as_slice())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| bridge_from_row(&row))
            .transpose()
    }

    async fn bridge_by_target(&self, chain: ChainId, target_id: B256) -> Result<Option<BridgeTx>> {
        sqlx::query("select * from bridge_txs where target_chain = $1 and target_id = $2")
            .bind(chain as i64)
            .bind(target_id.as_slice())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| bridge_from_row(&row))
            .transpose()
    }

    async fn closable_match(
        &self,
        chain: ChainId,
        symbol: &str,
        address: Address,
        amount: U256,
        sender: Address,
    ) -> Result<Option<BridgeTx>> {
        sqlx::query(
            "select * from bridge_txs \
             where target_chain = $1 and target_symbol = $2 and target_address = $3 \
               and target_amount = $4 and status = any($5) and $6 = any(response_maker) \
             order by id asc limit 1",
        )
        .bind(chain as i64)
        .bind(symbol)
        .bind(address.as_slice())
        .bind(amount.to_string())
        .bind(closable_statuses())
        .bind(sender.as_slice())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| bridge_from_row(&row))
        .transpose()
    }

    async fn pending_payout_rows(&self) -> Result<Vec<BridgeTx>> {
        sqlx::query("select * from bridge_txs where status = 0 and target_id is null")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(bridge_from_row)
            .collect()
    }

    async fn bridges_with_status(&self, status: BridgeStatus) -> Result<Vec<BridgeTx>> {
        sqlx::query("select * from bridge_txs where status = $1")
            .bind(status as i16)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(bridge_from_row)
            .collect()
    }

    async fn set_bridge_status(
        &self,
        chain: ChainId,
        source_id: B256,
        from: BridgeStatus,
        to: BridgeStatus,
    ) -> Result<u64> {
        let res = sqlx::query(
            "update bridge_txs set status = $4 \
             where source_chain = $1 and source_id = $2 and status = $3",
        )
        .bind(chain as i64)
        .bind(source_id.as_slice())
        .bind(from as i16)
        .bind(to as i16)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn mark_recovered(
        &self,
        chain: ChainId,
        source_id: B256,
        tx_hash: B256,
    ) -> Result<u64> {
        let res = sqlx::query(
            "update bridge_txs set status = $4, target_id = $3 \
             where source_chain = $1 and source_id = $2 and status = $5",
        )
        .bind(chain as i64)
        .bind(source_id.as_slice())
        .bind(tx_hash.as_slice())
        .bind(BridgeStatus::PaidSuccess as i16)
        .bind(BridgeStatus::ReadyPaid as i16)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn finalize_receipt(
        &self,
        chain: ChainId,
        source_id: B256,
        maker: Address,
    ) -> Result<u64> {
        let res = sqlx::query(
            "update bridge_txs set status = $4, target_maker = $3 \
             where source_chain = $1 and source_id = $2 and status = $5",
        )
        .bind(chain as i64)
        .bind(source_id.as_slice())
        .bind(maker.as_slice())
        .bind(BridgeStatus::Matched as i16)
        .bind(BridgeStatus::PaidSuccess as i16)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn serial_by_source(&self, source_id: B256) -> Result<Option<B256>> {
        sqlx::query("select tx_hash from serial_relations where source_id = $1")
            .bind(source_id.as_slice())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| get_b256(&row, "tx_hash"))
            .transpose()
    }

    #[instrument(skip_all, fields(tx_hash = %tx_hash))]
    async fn save_serial(&self, source_ids: &[B256], tx_hash: B256) -> Result<()> {
        for source_id in source_ids {
            sqlx::query(
                "insert into serial_relations (source_id, tx_hash) values ($1, $2) \
                 on conflict (source_id) do update set tx_hash = excluded.tx_hash",
            )
            .bind(source_id.as_slice())
            .bind(tx_hash.as_slice())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn SettlementTx>> {
        Ok(Box::new(PgTx { tx: Some(self.pool.begin().await?) }))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("select 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// An open PostgreSQL transaction.
struct PgTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTx {
    fn conn(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or(StorageError::TxFinished)
    }
}

#[async_trait]
impl SettlementTx for PgTx {
    async fn bridge_for_update(
        &mut self,
        chain: ChainId,
        source_id: B256,
    ) -> Result<Option<BridgeTx>> {
        let tx = self.conn()?;
        sqlx::query(
            "select * from bridge_txs where source_chain = $1 and source_id = $2 for update",
        )
        .bind(chain as i64)
        .bind(source_id.as_slice())
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| bridge_from_row(&row))
        .transpose()
    }

    async fn upsert_bridge(&mut self, row: &BridgeTx) -> Result<()> {
        let tx = self.conn()?;
        sqlx::query(
            "insert into bridge_txs \
             (source_chain, source_id, source_address, source_maker, source_amount, \
              source_symbol, source_token, source_nonce, source_time, target_chain, \
              target_address, target_amount, target_symbol, target_token, rule_id, \
              ebc_address, dealer_address, withholding_fee, trade_fee, response_maker, \
              version, status) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                     $16, $17, $18, $19, $20, $21, $22) \
             on conflict (source_chain, source_id) do update set \
               source_address = excluded.source_address, \
               source_maker = excluded.source_maker, \
               source_amount = excluded.source_amount, \
               source_symbol = excluded.source_symbol, \
               source_token = excluded.source_token, \
               source_nonce = excluded.source_nonce, \
               source_time = excluded.source_time, \
               target_chain = excluded.target_chain, \
               target_address = excluded.target_address, \
               target_amount = excluded.target_amount, \
               target_symbol = excluded.target_symbol, \
               target_token = excluded.target_token, \
               rule_id = excluded.rule_id, \
               ebc_address = excluded.ebc_address, \
               dealer_address = excluded.dealer_address, \
               withholding_fee = excluded.withholding_fee, \
               trade_fee = excluded.trade_fee, \
               response_maker = excluded.response_maker \
             where bridge_txs.status < 90",
        )
        .bind(row.source_chain as i64)
        .bind(row.source_id.as_slice())
        .bind(row.source_address.as_slice())
        .bind(row.source_maker.as_slice())
        .bind(&row.source_amount)
        .bind(&row.source_symbol)
        .bind(row.source_token.as_slice())
        .bind(row.source_nonce as i64)
        .bind(row.source_time)
        .bind(row.target_chain as i64)
        .bind(row.target_address.as_slice())
        .bind(row.target_amount.to_string())
        .bind(&row.target_symbol)
        .bind(row.target_token.as_slice())
        .bind(&row.rule_id)
        .bind(row.ebc_address.as_slice())
        .bind(row.dealer_address.as_slice())
        .bind(row.withholding_fee.to_string())
        .bind(row.trade_fee.to_string())
        .bind(maker_bytes(&row.response_maker))
        .bind(row.version.as_str())
        .bind(row.status as i16)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn save_bridge(&mut self, row: &BridgeTx) -> Result<()> {
        let tx = self.conn()?;
        sqlx::query(
            "update bridge_txs set \
               target_id = $3, target_maker = $4, target_time = $5, target_nonce = $6, \
               target_fee = $7, target_fee_symbol = $8, status = $9 \
             where source_chain = $1 and source_id = $2",
        )
        .bind(row.source_chain as i64)
        .bind(row.source_id.as_slice())
        .bind(row.target_id.map(|h| h.as_slice().to_vec()))
        .bind(row.target_maker.map(|a| a.as_slice().to_vec()))
        .bind(row.target_time)
        .bind(row.target_nonce.map(|n| n as i64))
        .bind(&row.target_fee)
        .bind(&row.target_fee_symbol)
        .bind(row.status as i16)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_bridge_status(
        &mut self,
        keys: &[(ChainId, B256)],
        from: BridgeStatus,
        to: BridgeStatus,
    ) -> Result<u64> {
        let mut affected = 0;
        for (chain, source_id) in keys {
            let tx = self.conn()?;
            let res = sqlx::query(
                "update bridge_txs set status = $4 \
                 where source_chain = $1 and source_id = $2 and status = $3",
            )
            .bind(*chain as i64)
            .bind(source_id.as_slice())
            .bind(from as i16)
            .bind(to as i16)
            .execute(&mut **tx)
            .await?;
            affected += res.rows_affected();
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
        for (chain, source_id) in keys {
            let tx = self.conn()?;
            let res = sqlx::query(
                "update bridge_txs set \
                   target_id = $3, target_maker = $4, target_nonce = $5, status = $6 \
                 where source_chain = $1 and source_id = $2 and status = $7",
            )
            .bind(*chain as i64)
            .bind(source_id.as_slice())
            .bind(target_id.map(|h| h.as_slice().to_vec()))
            .bind(target_maker.map(|a| a.as_slice().to_vec()))
            .bind(target_nonce.map(|n| n as i64))
            .bind(to as i16)
            .bind(BridgeStatus::ReadyPaid as i16)
            .execute(&mut **tx)
            .await?;
            affected += res.rows_affected();
        }
        Ok(affected)
    }

    async fn close_bridge(&mut self, close: &BridgeClose) -> Result<u64> {
        let tx = self.conn()?;
        let res = sqlx::query(
            "update bridge_txs set \
               target_id = $3, target_time = $4, target_fee = $5, target_fee_symbol = $6, \
               target_nonce = $7, target_maker = $8, status = $9 \
             where source_chain = $1 and source_id = $2 and status = any($10)",
        )
        .bind(close.source_chain as i64)
        .bind(close.source_id.as_slice())
        .bind(close.target_id.as_slice())
        .bind(close.target_time)
        .bind(&close.target_fee)
        .bind(&close.target_fee_symbol)
        .bind(close.target_nonce as i64)
        .bind(close.target_maker.as_slice())
        .bind(close.status as i16)
        .bind(closable_statuses())
        .execute(&mut **tx)
        .await?;
        Ok(res.rows_affected())
    }

    async fn set_transfer_op_status(
        &mut self,
        keys: &[(ChainId, B256)],
        op: i16,
    ) -> Result<u64> {
        let mut affected = 0;
        for (chain, hash) in keys {
            let tx = self.conn()?;
            let res = sqlx::query(
                "update transfers set op_status = $3 where chain_id = $1 and hash = $2",
            )
            .bind(*chain as i64)
            .bind(hash.as_slice())
            .bind(op)
            .execute(&mut **tx)
            .await?;
            affected += res.rows_affected();
        }
        Ok(affected)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.tx.take().ok_or(StorageError::TxFinished)?.commit().await?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.tx.take().ok_or(StorageError::TxFinished)?.rollback().await?;
        Ok(())
    }
}

impl std::fmt::Debug for PgTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTx").field("open", &self.tx.is_some()).finish()
    }
}
