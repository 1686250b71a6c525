//! Payout orchestration: drains the in-flight set, runs the per-sender
//! exclusive payout state machine, and keeps bridge rows consistent with
//! what actually reached the chain.

mod store;
pub use store::{InFlightStore, PayoutReservation, QueuedPayout};

use crate::{
    alerts::{AlertChannel, Alerts},
    account::{AccountRegistry, SenderAccount},
    constants::SCHEDULE_INTERVAL,
    error::{PayoutError, StorageError},
    rates::RateOracle,
    rules::TokenRegistry,
    storage::StorageApi,
    types::BridgeStatus,
};
use alloy::primitives::{Address, B256, ChainId, U256};
use eyre::eyre;
use itertools::Itertools;
use metrics::counter;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, instrument, warn};

/// Payout policy knobs.
#[derive(Debug, Clone)]
pub struct PayoutPolicy {
    /// Largest acceptable value loss between the deposit and the payout,
    /// in basis points.
    pub max_loss_bps: u64,
    /// Whether payouts sharing `(chain, token, sender)` are batched
    /// through the router.
    pub batch_enabled: bool,
}

impl Default for PayoutPolicy {
    fn default() -> Self {
        Self { max_loss_bps: 200, batch_enabled: true }
    }
}

/// The payout sequencer.
#[derive(Debug)]
pub struct Sequencer {
    storage: Arc<dyn StorageApi>,
    store: Arc<InFlightStore>,
    alerts: Arc<dyn Alerts>,
    rates: RateOracle,
    accounts: Arc<AccountRegistry>,
    tokens: Arc<TokenRegistry>,
    policy: PayoutPolicy,
}

impl Sequencer {
    /// Creates a new sequencer.
    pub fn new(
        storage: Arc<dyn StorageApi>,
        store: Arc<InFlightStore>,
        alerts: Arc<dyn Alerts>,
        rates: RateOracle,
        accounts: Arc<AccountRegistry>,
        tokens: Arc<TokenRegistry>,
        policy: PayoutPolicy,
    ) -> Self {
        Self { storage, store, alerts, rates, accounts, tokens, policy }
    }

    /// Drains the in-flight set on a fixed interval. Never returns.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SCHEDULE_INTERVAL);
        loop {
            ticker.tick().await;
            Arc::clone(&self).schedule_once().await;
        }
    }

    /// One scheduling pass: groups queued payouts by `(chain, token)` and
    /// resolved sender, then dispatches each group on its own task.
    pub async fn schedule_once(self: Arc<Self>) {
        for ((chain, token), jobs) in self.store.snapshot() {
            let mut by_sender: HashMap<Address, Vec<QueuedPayout>> = HashMap::new();
            for job in jobs {
                match self.accounts.resolve(job.target_chain, &job.response_maker) {
                    Some(account) => {
                        by_sender.entry(account.address()).or_default().push(job)
                    }
                    None => {
                        debug!(source_id = %job.source_id, "no signing account; job stays queued")
                    }
                }
            }

            for (_, group) in by_sender {
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    if group.len() > 1 && this.policy.batch_enabled {
                        let _ = this.batch_send(chain, token, group).await;
                    } else {
                        for job in group {
                            let _ = this
                                .single_send(chain, token, job.source_id)
                                .await;
                        }
                    }
                });
            }
        }
    }

    /// Pops one payout from the in-flight set and executes it under the
    /// sender's exclusive section.
    #[instrument(skip(self))]
    pub async fn single_send(
        &self,
        chain: ChainId,
        token: Address,
        source_id: B256,
    ) -> Result<B256, PayoutError> {
        if self
            .storage
            .serial_by_source(source_id)
            .await
            .map_err(PayoutError::before)?
            .is_some()
        {
            self.store.remove_transaction(chain, token, source_id);
            return Err(PayoutError::Skipped("payout already recorded in serial index".into()));
        }

        let reservation = self.store.remove_and_reserve(chain, token, &[source_id]);
        let Some(job) = reservation.jobs().first().cloned() else {
            reservation.confirm();
            return Err(PayoutError::Skipped("payout not queued".into()));
        };

        let Some(account) = self.accounts.resolve(job.target_chain, &job.response_maker) else {
            reservation.rollback();
            let err = PayoutError::before(eyre!(
                "no signing account for chain {} among permitted makers",
                job.target_chain
            ));
            self.alert(&format!("payout {source_id}: {err}")).await;
            return Err(err);
        };

        let result = self
            .store
            .run_exclusive(account.address(), self.exec_single(&account, &job))
            .await;
        self.settle(reservation, &result, source_id).await;
        result
    }

    /// Filters and executes a batch sharing `(chain, token, sender)`.
    #[instrument(skip(self, jobs))]
    pub async fn batch_send(
        &self,
        chain: ChainId,
        token: Address,
        jobs: Vec<QueuedPayout>,
    ) -> Result<B256, PayoutError> {
        let mut eligible = Vec::new();
        for job in jobs {
            let recorded = self
                .storage
                .serial_by_source(job.source_id)
                .await
                .map_err(PayoutError::before)?
                .is_some();
            if recorded {
                self.store.remove_transaction(chain, token, job.source_id);
                continue;
            }
            if let Err(err) = self.validate_rate(&job).await {
                warn!(source_id = %job.source_id, %err, "payout fails value bound; left queued");
                continue;
            }
            eligible.push(job);
        }

        if eligible.is_empty() {
            return Err(PayoutError::Skipped("no batch members left".into()));
        }

        let Some(account) =
            self.accounts.resolve(eligible[0].target_chain, &eligible[0].response_maker)
        else {
            let err = PayoutError::before(eyre!("no signing account for batch"));
            self.alert(&format!("batch payout: {err}")).await;
            return Err(err);
        };

        let ids = eligible.iter().map(|j| j.source_id).collect::<Vec<_>>();
        let reservation = self.store.remove_and_reserve(chain, token, &ids);
        let batch = reservation.jobs().to_vec();
        if batch.is_empty() {
            reservation.confirm();
            return Err(PayoutError::Skipped("batch raced away".into()));
        }

        let result = self
            .store
            .run_exclusive(account.address(), self.exec_batch(&account, &batch))
            .await;
        self.settle(reservation, &result, ids[0]).await;
        result
    }

    /// Applies the in-flight rollback contract to a finished attempt.
    async fn settle(
        &self,
        reservation: PayoutReservation,
        result: &Result<B256, PayoutError>,
        source_id: B256,
    ) {
        match result {
            Ok(_) => {
                counter!("sequencer.payouts_sent").increment(1);
                reservation.confirm();
            }
            Err(PayoutError::Skipped(reason)) => {
                // Precondition violations drop out silently.
                debug!(%source_id, %reason, "payout skipped");
                counter!("sequencer.payouts_skipped").increment(1);
                reservation.confirm();
            }
            Err(err @ PayoutError::BeforeBroadcast(_)) => {
                counter!("sequencer.payouts_requeued").increment(1);
                reservation.rollback();
                self.alert(&format!("payout {source_id}: {err}")).await;
            }
            Err(err @ PayoutError::AfterBroadcast { .. }) => {
                // The transaction may have landed; never requeue.
                counter!("sequencer.payouts_crashed").increment(1);
                reservation.confirm();
                self.alert(&format!("payout {source_id}: {err}")).await;
            }
        }
    }

    /// The single-payout state machine.
    ///
    /// The storage transaction deliberately stays open across the
    /// broadcast: the row either commits `Created -> PaidSuccess` with its
    /// hash, commits `Created -> PaidCrash` on a post-broadcast failure,
    /// or rolls back to `Created` untouched.
    async fn exec_single(
        &self,
        account: &Arc<dyn SenderAccount>,
        job: &QueuedPayout,
    ) -> Result<B256, PayoutError> {
        self.validate_rate(job).await?;

        let mut tx = self.storage.begin().await.map_err(PayoutError::before)?;
        let mut bridge = match tx
            .bridge_for_update(job.source_chain, job.source_id)
            .await
            .map_err(PayoutError::before)?
        {
            Some(bridge) => bridge,
            None => {
                let _ = tx.rollback().await;
                return Err(PayoutError::before(eyre!(
                    "no bridge row for deposit {}",
                    job.source_id
                )));
            }
        };

        if bridge.status != BridgeStatus::Created {
            let _ = tx.rollback().await;
            return Err(PayoutError::Skipped(format!(
                "bridge row is {:?}, not payable",
                bridge.status
            )));
        }
        if bridge.target_id.is_some() {
            let _ = tx.rollback().await;
            return Err(PayoutError::Skipped("bridge row already carries a payout".into()));
        }
        if bridge.target_chain != job.target_chain
            || bridge.target_amount != job.target_amount
            || bridge.target_symbol != job.target_symbol
        {
            let _ = tx.rollback().await;
            return Err(PayoutError::before(eyre!(
                "payout intent diverged from bridge row {}",
                job.source_id
            )));
        }

        bridge.status = BridgeStatus::ReadyPaid;
        if let Err(err) = tx.save_bridge(&bridge).await {
            let _ = tx.rollback().await;
            return Err(PayoutError::before(err));
        }

        let source_ids = [job.source_id];
        let sent = if job.target_token == Address::ZERO {
            account.transfer(job.target_address, job.target_amount, &source_ids).await
        } else {
            account
                .transfer_token(job.target_token, job.target_address, job.target_amount, &source_ids)
                .await
        };

        match sent {
            Ok(sent) => {
                bridge.status = BridgeStatus::PaidSuccess;
                bridge.target_id = Some(sent.hash);
                bridge.target_maker = Some(sent.from);
                bridge.target_nonce = Some(sent.nonce);
                let after = |e: StorageError| PayoutError::AfterBroadcast {
                    hash: Some(sent.hash),
                    sender: Some(sent.from),
                    reason: e.to_string(),
                };
                tx.save_bridge(&bridge).await.map_err(after)?;
                tx.commit().await.map_err(after)?;

                self.spawn_receipt_watch(
                    Arc::clone(account),
                    vec![(job.source_chain, job.source_id)],
                    sent.hash,
                );
                info!(source_id = %job.source_id, hash = %sent.hash, "payout broadcast");
                Ok(sent.hash)
            }
            Err(err @ (PayoutError::BeforeBroadcast(_) | PayoutError::Skipped(_))) => {
                // The broadcast cannot have landed; the row returns to
                // `Created` with the rollback.
                let _ = tx.rollback().await;
                Err(err)
            }
            Err(PayoutError::AfterBroadcast { hash, sender, reason }) => {
                bridge.status = BridgeStatus::PaidCrash;
                bridge.target_id = hash;
                bridge.target_maker = sender;
                let _ = tx.save_bridge(&bridge).await;
                let _ = tx.commit().await;
                Err(PayoutError::AfterBroadcast { hash, sender, reason })
            }
        }
    }

    /// The batch state machine: promote all rows under a row-count check,
    /// broadcast once through the router, demote or advance all rows
    /// together.
    async fn exec_batch(
        &self,
        account: &Arc<dyn SenderAccount>,
        jobs: &[QueuedPayout],
    ) -> Result<B256, PayoutError> {
        let keys = jobs.iter().map(|j| (j.source_chain, j.source_id)).collect::<Vec<_>>();
        let source_ids = jobs.iter().map(|j| j.source_id).collect::<Vec<_>>();
        let (tos, values): (Vec<Address>, Vec<U256>) =
            jobs.iter().map(|j| (j.target_address, j.target_amount)).unzip();
        let token = jobs[0].target_token;

        let mut tx = self.storage.begin().await.map_err(PayoutError::before)?;
        let promoted = tx
            .update_bridge_status(&keys, BridgeStatus::Created, BridgeStatus::ReadyPaid)
            .await
            .map_err(PayoutError::before)?;
        if promoted != jobs.len() as u64 {
            let _ = tx.rollback().await;
            return Err(PayoutError::before(eyre!(
                "batch promoted {promoted} of {} rows",
                jobs.len()
            )));
        }

        let sent = if token == Address::ZERO {
            account.transfers(tos, values, &source_ids).await
        } else {
            account.transfer_tokens(token, tos, values, &source_ids).await
        };

        match sent {
            Ok(sent) => {
                let after = |e: StorageError| PayoutError::AfterBroadcast {
                    hash: Some(sent.hash),
                    sender: Some(sent.from),
                    reason: e.to_string(),
                };
                tx.record_broadcast(
                    &keys,
                    Some(sent.hash),
                    Some(sent.from),
                    Some(sent.nonce),
                    BridgeStatus::PaidSuccess,
                )
                .await
                .map_err(after)?;
                tx.commit().await.map_err(after)?;

                info!(batch = %format_keys(&keys), hash = %sent.hash, "batch payout broadcast");
                self.spawn_receipt_watch(Arc::clone(account), keys, sent.hash);
                Ok(sent.hash)
            }
            Err(err @ (PayoutError::BeforeBroadcast(_) | PayoutError::Skipped(_))) => {
                let _ = tx.rollback().await;
                Err(err)
            }
            Err(PayoutError::AfterBroadcast { hash, sender, reason }) => {
                let _ = tx
                    .record_broadcast(&keys, hash, sender, None, BridgeStatus::PaidCrash)
                    .await;
                let _ = tx.commit().await;
                Err(PayoutError::AfterBroadcast { hash, sender, reason })
            }
        }
    }

    /// The exchange-rate sanity bound: the payout must not be worth more
    /// than the deposit, nor lose more than the configured share.
    async fn validate_rate(&self, job: &QueuedPayout) -> Result<(), PayoutError> {
        let rate = self
            .rates
            .rate(&job.source_symbol, &job.target_symbol)
            .await
            .ok_or_else(|| {
                PayoutError::before(eyre!(
                    "no exchange rate {} -> {}",
                    job.source_symbol,
                    job.target_symbol
                ))
            })?;

        let source_units: f64 = job
            .source_amount
            .parse()
            .map_err(|_| PayoutError::before(eyre!("unparseable amount {}", job.source_amount)))?;
        let decimals = self
            .tokens
            .by_address(job.target_chain, job.target_token)
            .map(|t| t.decimals)
            .unwrap_or(18);
        let target_units = u256_units(job.target_amount, decimals);

        let expected = source_units * rate;
        if expected <= 0.0 {
            return Err(PayoutError::before(eyre!("non-positive expected payout")));
        }
        if target_units > expected {
            return Err(PayoutError::before(eyre!(
                "payout {target_units} exceeds deposit value {expected}"
            )));
        }
        if (expected - target_units) / expected > self.policy.max_loss_bps as f64 / 10_000.0 {
            return Err(PayoutError::before(eyre!(
                "payout {target_units} loses more than {} bps of {expected}",
                self.policy.max_loss_bps
            )));
        }
        Ok(())
    }

    fn spawn_receipt_watch(
        &self,
        account: Arc<dyn SenderAccount>,
        keys: Vec<(ChainId, B256)>,
        hash: B256,
    ) {
        let storage = Arc::clone(&self.storage);
        let alerts = Arc::clone(&self.alerts);
        tokio::spawn(async move {
            match account.wait_for_confirmation(hash).await {
                Ok(confirmed_from) => {
                    for (chain, source_id) in keys {
                        if let Err(err) =
                            storage.finalize_receipt(chain, source_id, confirmed_from).await
                        {
                            warn!(%source_id, %err, "receipt finalize failed");
                        }
                    }
                    counter!("sequencer.payouts_confirmed").increment(1);
                }
                Err(err) => {
                    // The row stays at PaidSuccess; the destination sweep
                    // closes it once the payout transfer is ingested.
                    warn!(%hash, %err, "receipt watch failed");
                    alerts
                        .send_message(
                            &format!("payout {hash} receipt watch failed: {err}"),
                            &[AlertChannel::Telegram],
                        )
                        .await;
                }
            }
        });
    }

    /// Reconciles rows interrupted mid-payout by a crash: a serial record
    /// proves the broadcast happened and promotes the row; its absence
    /// proves it did not, and the row is requeued.
    pub async fn reconcile(&self) -> Result<usize, StorageError> {
        let stuck = self.storage.bridges_with_status(BridgeStatus::ReadyPaid).await?;
        let mut recovered = 0;
        for row in stuck {
            match self.storage.serial_by_source(row.source_id).await? {
                Some(hash) => {
                    if self.storage.mark_recovered(row.source_chain, row.source_id, hash).await?
                        == 1
                    {
                        info!(source_id = %row.source_id, %hash, "recovered interrupted payout");
                        recovered += 1;
                    }
                }
                None => {
                    if self
                        .storage
                        .set_bridge_status(
                            row.source_chain,
                            row.source_id,
                            BridgeStatus::ReadyPaid,
                            BridgeStatus::Created,
                        )
                        .await?
                        == 1
                    {
                        info!(source_id = %row.source_id, "requeued interrupted payout");
                        self.store.add_transaction(QueuedPayout::from_bridge(&row));
                    }
                }
            }
        }
        Ok(recovered)
    }

    /// Refills the in-flight set from rows that never saw an attempt.
    pub async fn backfill(&self) -> Result<usize, StorageError> {
        let rows = self.storage.pending_payout_rows().await?;
        let mut queued = 0;
        for row in rows {
            if self.storage.serial_by_source(row.source_id).await?.is_some() {
                continue;
            }
            if self.store.add_transaction(QueuedPayout::from_bridge(&row)) {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(queued, "backfilled payout queue");
        }
        Ok(queued)
    }

    async fn alert(&self, text: &str) {
        self.alerts.send_message(text, &[AlertChannel::Telegram]).await;
    }
}

fn u256_units(value: U256, decimals: u8) -> f64 {
    let value: f64 = value.to_string().parse().unwrap_or(f64::MAX);
    value / 10f64.powi(decimals as i32)
}

/// Display helper: `chain:id` pairs for log lines.
pub fn format_keys(keys: &[(ChainId, B256)]) -> String {
    keys.iter().map(|(chain, id)| format!("{chain}:{id}")).join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        account::SentPayout,
        rules::{TokenInfo, TokenRegistry},
        storage::InMemoryStorage,
        types::{BridgeTx, TransferVersion},
    };
    use alloy::primitives::{address, b256};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    const MAKER: Address = address!("80c67432656d59144ceff962e8faf8926599bcf8");
    const USER: Address = address!("1111111111111111111111111111111111111111");
    const SRC_A: B256 =
        b256!("00000000000000000000000000000000000000000000000000000000000000aa");
    const SRC_B: B256 =
        b256!("00000000000000000000000000000000000000000000000000000000000000ab");
    const SRC_C: B256 =
        b256!("00000000000000000000000000000000000000000000000000000000000000ac");
    const PAYOUT_VALUE: U256 = U256::from_limbs([996_970_000_000_010_012u64, 0, 0, 0]);

    #[derive(Debug, Default)]
    struct RecordingAlerts {
        messages: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Alerts for RecordingAlerts {
        async fn send_message(&self, text: &str, _channels: &[AlertChannel]) {
            self.messages.lock().unwrap().push(text.to_string());
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Succeed,
        StaleNonce,
        CrashAfter,
    }

    #[derive(Debug)]
    struct MockAccount {
        address: Address,
        chain: ChainId,
        storage: Arc<dyn StorageApi>,
        scripted: std::sync::Mutex<Vec<Behavior>>,
        broadcasts: AtomicU64,
        nonce: AtomicU64,
    }

    impl MockAccount {
        fn new(storage: Arc<dyn StorageApi>, chain: ChainId) -> Arc<Self> {
            Arc::new(Self {
                address: MAKER,
                chain,
                storage,
                scripted: Default::default(),
                broadcasts: AtomicU64::new(0),
                nonce: AtomicU64::new(0),
            })
        }

        fn script(&self, behavior: Behavior) {
            self.scripted.lock().unwrap().push(behavior);
        }

        async fn dispatch(&self, source_ids: &[B256]) -> Result<SentPayout, PayoutError> {
            let behavior =
                self.scripted.lock().unwrap().pop().unwrap_or(Behavior::Succeed);
            match behavior {
                Behavior::StaleNonce => {
                    Err(PayoutError::before(eyre!("stale nonce: NONCE_EXPIRED")))
                }
                Behavior::CrashAfter => {
                    let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
                    let hash = payout_hash(nonce);
                    self.storage
                        .save_serial(source_ids, hash)
                        .await
                        .map_err(PayoutError::before)?;
                    Err(PayoutError::AfterBroadcast {
                        hash: Some(hash),
                        sender: Some(self.address),
                        reason: "connection reset mid-broadcast".into(),
                    })
                }
                Behavior::Succeed => {
                    let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
                    let hash = payout_hash(nonce);
                    self.storage
                        .save_serial(source_ids, hash)
                        .await
                        .map_err(PayoutError::before)?;
                    self.broadcasts.fetch_add(1, Ordering::SeqCst);
                    Ok(SentPayout { hash, from: self.address, nonce })
                }
            }
        }
    }

    fn payout_hash(nonce: u64) -> B256 {
        B256::with_last_byte(0x10 + nonce as u8)
    }

    #[async_trait]
    impl SenderAccount for MockAccount {
        fn address(&self) -> Address {
            self.address
        }

        fn chain_id(&self) -> ChainId {
            self.chain
        }

        async fn transfer(
            &self,
            _to: Address,
            _value: U256,
            source_ids: &[B256],
        ) -> Result<SentPayout, PayoutError> {
            self.dispatch(source_ids).await
        }

        async fn transfer_token(
            &self,
            _token: Address,
            _to: Address,
            _value: U256,
            source_ids: &[B256],
        ) -> Result<SentPayout, PayoutError> {
            self.dispatch(source_ids).await
        }

        async fn transfers(
            &self,
            _tos: Vec<Address>,
            _values: Vec<U256>,
            source_ids: &[B256],
        ) -> Result<SentPayout, PayoutError> {
            self.dispatch(source_ids).await
        }

        async fn transfer_tokens(
            &self,
            _token: Address,
            _tos: Vec<Address>,
            _values: Vec<U256>,
            source_ids: &[B256],
        ) -> Result<SentPayout, PayoutError> {
            self.dispatch(source_ids).await
        }

        async fn get_balance(&self) -> Result<U256, PayoutError> {
            Ok(U256::MAX)
        }

        async fn get_token_balance(&self, _token: Address) -> Result<U256, PayoutError> {
            Ok(U256::MAX)
        }

        async fn wait_for_confirmation(&self, _hash: B256) -> eyre::Result<Address> {
            Ok(self.address)
        }
    }

    struct Harness {
        storage: Arc<InMemoryStorage>,
        store: Arc<InFlightStore>,
        alerts: Arc<RecordingAlerts>,
        account: Arc<MockAccount>,
        sequencer: Arc<Sequencer>,
    }

    fn harness() -> Harness {
        let storage = Arc::new(InMemoryStorage::new());
        let store = Arc::new(InFlightStore::new());
        let alerts = Arc::new(RecordingAlerts::default());
        let account = MockAccount::new(storage.clone(), 10);

        let mut registry = AccountRegistry::new();
        registry.insert(account.clone());

        let mut tokens = HashMap::new();
        tokens.insert(
            10u64,
            vec![TokenInfo {
                address: Address::ZERO,
                symbol: "ETH".into(),
                decimals: 18,
                mainnet_token: Address::ZERO,
            }],
        );

        let sequencer = Arc::new(Sequencer::new(
            storage.clone(),
            store.clone(),
            alerts.clone(),
            RateOracle::default().with_constant_rate(1.0),
            Arc::new(registry),
            Arc::new(TokenRegistry::new(tokens)),
            PayoutPolicy::default(),
        ));

        Harness { storage, store, alerts, account, sequencer }
    }

    fn bridge_row(source_id: B256) -> BridgeTx {
        BridgeTx {
            id: None,
            source_chain: 1,
            source_id,
            source_address: USER,
            source_maker: MAKER,
            source_amount: "1.0".into(),
            source_symbol: "ETH".into(),
            source_token: Address::ZERO,
            source_nonce: 12,
            source_time: Utc::now(),
            target_chain: 10,
            target_id: None,
            target_address: USER,
            target_amount: PAYOUT_VALUE,
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
            withholding_fee: U256::from(5_000_000_000_000u64),
            trade_fee: U256::from(300_000_000_000_000u64),
            response_maker: vec![MAKER],
            version: TransferVersion::V2Deposit,
            status: BridgeStatus::Created,
        }
    }

    async fn seed(h: &Harness, source_id: B256) {
        let row = bridge_row(source_id);
        let mut tx = h.storage.begin().await.unwrap();
        tx.upsert_bridge(&row).await.unwrap();
        tx.commit().await.unwrap();
        h.store.add_transaction(QueuedPayout::from_bridge(&row));
    }

    async fn status_of(h: &Harness, source_id: B256) -> BridgeStatus {
        h.storage.bridge_by_source(1, source_id).await.unwrap().unwrap().status
    }

    async fn wait_for_status(h: &Harness, source_id: B256, status: BridgeStatus) {
        for _ in 0..200 {
            if status_of(h, source_id).await == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("row {source_id} never reached {status:?}");
    }

    #[tokio::test]
    async fn happy_single_payout_reaches_matched() {
        let h = harness();
        seed(&h, SRC_A).await;

        let hash = h.sequencer.single_send(10, Address::ZERO, SRC_A).await.unwrap();

        let row = h.storage.bridge_by_source(1, SRC_A).await.unwrap().unwrap();
        assert_eq!(row.target_id, Some(hash));
        assert_eq!(row.target_maker, Some(MAKER));
        assert_eq!(h.storage.serial_by_source(SRC_A).await.unwrap(), Some(hash));

        // The receipt watcher closes the row.
        wait_for_status(&h, SRC_A, BridgeStatus::Matched).await;
        assert!(h.alerts.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_nonce_rolls_back_to_created() {
        let h = harness();
        seed(&h, SRC_A).await;
        h.account.script(Behavior::StaleNonce);

        let err = h.sequencer.single_send(10, Address::ZERO, SRC_A).await.unwrap_err();
        assert!(err.is_retryable());

        // The row is untouched, the job is requeued, nothing crashed.
        assert_eq!(status_of(&h, SRC_A).await, BridgeStatus::Created);
        assert_eq!(h.store.len(), 1);
        assert!(h.storage.serial_by_source(SRC_A).await.unwrap().is_none());
        assert_eq!(h.alerts.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn post_broadcast_crash_marks_paid_crash() {
        let h = harness();
        seed(&h, SRC_A).await;
        h.account.script(Behavior::CrashAfter);

        let err = h.sequencer.single_send(10, Address::ZERO, SRC_A).await.unwrap_err();
        assert!(matches!(err, PayoutError::AfterBroadcast { .. }));

        let row = h.storage.bridge_by_source(1, SRC_A).await.unwrap().unwrap();
        assert_eq!(row.status, BridgeStatus::PaidCrash);
        assert!(row.target_id.is_some());
        // Never requeued: the broadcast may have landed.
        assert!(h.store.is_empty());
        assert!(h.storage.serial_by_source(SRC_A).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn amount_mismatch_aborts_before_broadcast() {
        let h = harness();
        seed(&h, SRC_A).await;

        // The scheduler is invoked with a payout worth 0.9 of the deposit.
        let mut job = h.store.remove_transaction(10, Address::ZERO, SRC_A).unwrap();
        job.target_amount = U256::from(900_000_000_000_000_000u64);
        h.store.add_transaction(job);

        let err = h.sequencer.single_send(10, Address::ZERO, SRC_A).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(status_of(&h, SRC_A).await, BridgeStatus::Created);
        assert_eq!(h.account.broadcasts.load(Ordering::SeqCst), 0);
        assert_eq!(h.alerts.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_single_payouts_broadcast_once() {
        let h = harness();
        seed(&h, SRC_A).await;
        let job = QueuedPayout::from_bridge(&bridge_row(SRC_A));
        let account: Arc<dyn SenderAccount> = h.account.clone();

        let (a, b) = tokio::join!(
            h.sequencer.exec_single(&account, &job),
            h.sequencer.exec_single(&account, &job),
        );

        // Exactly one attempt reaches the broadcast; the loser observes a
        // row that is no longer payable.
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser.unwrap_err(), PayoutError::Skipped(_)));
        assert_eq!(h.account.broadcasts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_filters_recorded_members() {
        let h = harness();
        for id in [SRC_A, SRC_B, SRC_C] {
            seed(&h, id).await;
        }
        // One member already has a durable payout record.
        h.storage.save_serial(&[SRC_C], payout_hash(200)).await.unwrap();

        let jobs = [SRC_A, SRC_B, SRC_C]
            .iter()
            .map(|id| QueuedPayout::from_bridge(&bridge_row(*id)))
            .collect::<Vec<_>>();
        let hash = h.sequencer.batch_send(10, Address::ZERO, jobs).await.unwrap();

        for id in [SRC_A, SRC_B] {
            let row = h.storage.bridge_by_source(1, id).await.unwrap().unwrap();
            assert_eq!(row.status, BridgeStatus::PaidSuccess);
            assert_eq!(row.target_id, Some(hash));
        }
        assert_eq!(status_of(&h, SRC_C).await, BridgeStatus::Created);
    }

    #[tokio::test]
    async fn batch_aborts_on_row_count_mismatch() {
        let h = harness();
        seed(&h, SRC_A).await;
        seed(&h, SRC_B).await;
        // A competing writer already owns one of the rows.
        h.storage
            .set_bridge_status(1, SRC_B, BridgeStatus::Created, BridgeStatus::PaidSuccess)
            .await
            .unwrap();

        let jobs = [SRC_A, SRC_B]
            .iter()
            .map(|id| QueuedPayout::from_bridge(&bridge_row(*id)))
            .collect::<Vec<_>>();
        let err = h.sequencer.batch_send(10, Address::ZERO, jobs).await.unwrap_err();
        assert!(err.is_retryable());

        // The promotion rolled back and both jobs returned to the queue.
        assert_eq!(status_of(&h, SRC_A).await, BridgeStatus::Created);
        assert_eq!(h.store.len(), 2);
        assert_eq!(h.account.broadcasts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reconcile_recovers_interrupted_payouts() {
        let h = harness();
        seed(&h, SRC_A).await;
        seed(&h, SRC_B).await;
        for id in [SRC_A, SRC_B] {
            h.store.remove_transaction(10, Address::ZERO, id);
            h.storage
                .set_bridge_status(1, id, BridgeStatus::Created, BridgeStatus::ReadyPaid)
                .await
                .unwrap();
        }
        // Only the first row's broadcast left a durable record.
        h.storage.save_serial(&[SRC_A], payout_hash(7)).await.unwrap();

        let recovered = h.sequencer.reconcile().await.unwrap();
        assert_eq!(recovered, 1);

        let row = h.storage.bridge_by_source(1, SRC_A).await.unwrap().unwrap();
        assert_eq!(row.status, BridgeStatus::PaidSuccess);
        assert_eq!(row.target_id, Some(payout_hash(7)));

        // The row with no serial record returns to the queue.
        assert_eq!(status_of(&h, SRC_B).await, BridgeStatus::Created);
        assert!(h.store.get_transaction(10, Address::ZERO, SRC_B).is_some());
    }
}
