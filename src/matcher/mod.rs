//! The match pipeline: the source sweep turns confirmed deposits into
//! bridge rows, the destination sweep pairs maker payouts with their rows
//! and closes them.

mod cache;
pub use cache::{within_match_window, BridgeCandidate, MatchCache, MatchKey};

use crate::{
    constants::{DEST_SWEEP_LIMIT, MAX_SOURCE_AGE, SOURCE_SWEEP_LIMIT},
    error::StorageError,
    rules::{Obligation, RuleEvaluator},
    sequencer::{InFlightStore, QueuedPayout},
    storage::{BridgeClose, StorageApi},
    types::{op_status, BridgeStatus, BridgeTx, Transfer, TransferStatus, TransferVersion},
};
use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, instrument, warn};

/// Runs the two periodic sweeps.
#[derive(Debug, Clone)]
pub struct Matcher {
    storage: Arc<dyn StorageApi>,
    evaluator: RuleEvaluator,
    cache: Arc<MatchCache>,
    in_flight: Arc<InFlightStore>,
}

impl Matcher {
    /// Creates a new matcher.
    pub fn new(
        storage: Arc<dyn StorageApi>,
        evaluator: RuleEvaluator,
        cache: Arc<MatchCache>,
        in_flight: Arc<InFlightStore>,
    ) -> Self {
        Self { storage, evaluator, cache, in_flight }
    }

    /// One pass of the source sweep for a deposit dialect. Returns how many
    /// bridge rows were built.
    #[instrument(skip(self))]
    pub async fn source_sweep(&self, version: TransferVersion) -> Result<usize, StorageError> {
        let since = Utc::now() - ChronoDuration::from_std(MAX_SOURCE_AGE).expect("constant fits");
        let deposits = self
            .storage
            .unprocessed_deposits(&[version], since, SOURCE_SWEEP_LIMIT)
            .await?;
        counter!("matcher.source_scanned").increment(deposits.len() as u64);

        let mut built = 0;
        for deposit in deposits {
            // Rows already owned by a payout attempt must not be rebuilt.
            if let Some(existing) =
                self.storage.bridge_by_source(deposit.chain_id, deposit.hash).await?
            {
                if existing.status.in_operation() {
                    debug!(hash = %deposit.hash, status = ?existing.status, "row in operation, skipping");
                    continue;
                }
            }

            let obligation = match self.evaluator.evaluate(&deposit).await {
                Ok(obligation) => obligation,
                Err(err) => {
                    warn!(hash = %deposit.hash, %err, "rule evaluation failed");
                    counter!("matcher.rule_errors").increment(1);
                    self.storage
                        .set_transfer_op_status(
                            deposit.chain_id,
                            deposit.hash,
                            op_status::RULE_ERROR,
                        )
                        .await?;
                    continue;
                }
            };

            let row = build_bridge_row(&deposit, &obligation);
            let mut tx = self.storage.begin().await?;
            tx.upsert_bridge(&row).await?;
            tx.set_transfer_op_status(&[(deposit.chain_id, deposit.hash)], op_status::SOURCE_BUILT)
                .await?;
            tx.commit().await?;

            self.cache.publish_bridge(&row);
            self.in_flight.add_transaction(QueuedPayout::from_bridge(&row));
            counter!("matcher.source_built").increment(1);
            built += 1;
        }
        Ok(built)
    }

    /// One pass of the destination sweep for a payout dialect. Returns how
    /// many rows were closed.
    #[instrument(skip(self))]
    pub async fn dest_sweep(&self, version: TransferVersion) -> Result<usize, StorageError> {
        let mut payouts = self.storage.unprocessed_payouts(&[version], DEST_SWEEP_LIMIT).await?;

        // Re-examine parked transfers the query window may have missed.
        let seen: HashSet<_> = payouts.iter().map(Transfer::key).collect();
        payouts.extend(
            self.cache.parked_transfers(version).into_iter().filter(|t| !seen.contains(&t.key())),
        );

        let mut closed = 0;
        for payout in payouts {
            match self.close_one(&payout).await? {
                true => closed += 1,
                false => self.cache.park_transfer(&payout),
            }
        }
        counter!("matcher.dest_closed").increment(closed as u64);
        Ok(closed)
    }

    /// Tries to pair one payout-side transfer with its bridge row.
    async fn close_one(&self, payout: &Transfer) -> Result<bool, StorageError> {
        let key = MatchKey::of_payout(payout);

        // Path A: memory cache.
        if let Some(candidate) =
            self.cache.take_bridge_candidate(&key, payout.sender, payout.timestamp)
        {
            counter!("matcher.cache_hits").increment(1);
            if self
                .close_row(candidate.source_chain, candidate.source_id, payout)
                .await?
            {
                return Ok(true);
            }
            // The cached row lost a race; fall through to the database.
        }

        // Path B: database, first by explicit payout hash, then by content.
        let row = match self.storage.bridge_by_target(payout.chain_id, payout.hash).await? {
            Some(row) if BridgeStatus::CLOSABLE.contains(&row.status) => Some(row),
            _ => self
                .storage
                .closable_match(
                    payout.chain_id,
                    &payout.symbol,
                    payout.receiver,
                    payout.value,
                    payout.sender,
                )
                .await?
                .filter(|row| within_match_window(row.source_time, payout.timestamp)),
        };

        let Some(row) = row else {
            return Ok(false);
        };
        self.close_row(row.source_chain, row.source_id, payout).await
    }

    /// Closes a bridge row against a payout in one storage transaction:
    /// the target side is written and exactly the two transfer rows flip
    /// to matched, or nothing happens.
    async fn close_row(
        &self,
        source_chain: alloy::primitives::ChainId,
        source_id: alloy::primitives::B256,
        payout: &Transfer,
    ) -> Result<bool, StorageError> {
        let close = BridgeClose {
            source_chain,
            source_id,
            target_id: payout.hash,
            target_time: payout.timestamp,
            target_fee: payout.fee_amount.clone(),
            target_fee_symbol: payout.fee_token.clone(),
            target_nonce: payout.nonce,
            target_maker: payout.sender,
            status: if payout.status == TransferStatus::Failed {
                BridgeStatus::OnChainFailed
            } else {
                BridgeStatus::Matched
            },
        };

        let mut tx = self.storage.begin().await?;
        if tx.close_bridge(&close).await? != 1 {
            tx.rollback().await?;
            debug!(%source_id, "bridge row no longer closable");
            return Ok(false);
        }
        let flipped = tx
            .set_transfer_op_status(
                &[(source_chain, source_id), (payout.chain_id, payout.hash)],
                op_status::MATCHED,
            )
            .await?;
        if flipped != 2 {
            tx.rollback().await?;
            warn!(%source_id, flipped, "match close touched unexpected row count");
            return Ok(false);
        }
        tx.commit().await?;

        self.cache.remove_bridge(&MatchKey::of_payout(payout), source_id);
        self.cache.unpark(payout.chain_id, payout.hash);
        Ok(true)
    }
}

/// Builds the bridge row persisted by the source sweep.
pub(crate) fn build_bridge_row(deposit: &Transfer, obligation: &Obligation) -> BridgeTx {
    BridgeTx {
        id: None,
        source_chain: deposit.chain_id,
        source_id: deposit.hash,
        source_address: deposit.sender,
        source_maker: deposit.receiver,
        source_amount: deposit.amount.clone(),
        source_symbol: deposit.symbol.clone(),
        source_token: deposit.token,
        source_nonce: deposit.nonce,
        source_time: deposit.timestamp,
        target_chain: obligation.target_chain,
        target_id: None,
        target_address: obligation.target_address,
        target_amount: obligation.target_amount,
        target_symbol: obligation.target_symbol.clone(),
        target_token: obligation.target_token,
        target_maker: None,
        target_time: None,
        target_nonce: None,
        target_fee: None,
        target_fee_symbol: None,
        rule_id: obligation.rule_id.clone(),
        ebc_address: obligation.ebc_address,
        dealer_address: obligation.dealer_address,
        withholding_fee: obligation.withholding_fee,
        trade_fee: obligation.trade_fee,
        response_maker: obligation.response_maker.clone(),
        version: deposit.version,
        status: BridgeStatus::Created,
    }
}
