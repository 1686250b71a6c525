//! Transient payout work set: per `(chain, token)` queues, the serial
//! reservation handshake, and per-sender exclusivity.

use crate::types::BridgeTx;
use alloy::primitives::{Address, ChainId, B256, U256};
use dashmap::DashMap;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::sync::Mutex;

/// A payout awaiting scheduling, snapshotted off its bridge row.
#[derive(Debug, Clone)]
pub struct QueuedPayout {
    /// Chain of the source deposit.
    pub source_chain: ChainId,
    /// Hash of the source deposit.
    pub source_id: B256,
    /// Human-readable deposit amount, for the exchange-rate bound.
    pub source_amount: String,
    /// Deposit token symbol.
    pub source_symbol: String,
    /// Chain the payout must land on.
    pub target_chain: ChainId,
    /// Payout token contract, zero for the native asset.
    pub target_token: Address,
    /// Payout token symbol.
    pub target_symbol: String,
    /// Payout recipient.
    pub target_address: Address,
    /// Exact raw payout value.
    pub target_amount: U256,
    /// Makers allowed to fulfill.
    pub response_maker: Vec<Address>,
}

impl QueuedPayout {
    /// Snapshots the scheduling view of a bridge row.
    pub fn from_bridge(row: &BridgeTx) -> Self {
        Self {
            source_chain: row.source_chain,
            source_id: row.source_id,
            source_amount: row.source_amount.clone(),
            source_symbol: row.source_symbol.clone(),
            target_chain: row.target_chain,
            target_token: row.target_token,
            target_symbol: row.target_symbol.clone(),
            target_address: row.target_address,
            target_amount: row.target_amount,
            response_maker: row.response_maker.clone(),
        }
    }

    /// Queue key of this payout.
    pub fn queue_key(&self) -> (ChainId, Address) {
        (self.target_chain, self.target_token)
    }
}

/// The in-flight payout set.
///
/// Queues are keyed `(target_chain, target_token)` and hold jobs by source
/// id. Detaching jobs for a payout attempt reserves them so a concurrent
/// scheduling pass cannot pick them up again; the reservation is released
/// either by the rollback thunk (pre-broadcast failure) or by
/// [`PayoutReservation::confirm`] once the outcome is settled.
#[derive(Debug, Default)]
pub struct InFlightStore {
    queues: DashMap<(ChainId, Address), HashMap<B256, QueuedPayout>>,
    reserved: DashMap<B256, ()>,
    locks: DashMap<Address, Arc<Mutex<()>>>,
}

impl InFlightStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a payout unless it is currently reserved or already queued.
    /// Returns whether it was inserted.
    pub fn add_transaction(&self, job: QueuedPayout) -> bool {
        if self.reserved.contains_key(&job.source_id) {
            return false;
        }
        let mut queue = self.queues.entry(job.queue_key()).or_default();
        if queue.contains_key(&job.source_id) {
            return false;
        }
        queue.insert(job.source_id, job);
        true
    }

    /// Reads a queued payout without detaching it.
    pub fn get_transaction(
        &self,
        chain: ChainId,
        token: Address,
        source_id: B256,
    ) -> Option<QueuedPayout> {
        self.queues.get(&(chain, token))?.get(&source_id).cloned()
    }

    /// Detaches a queued payout without reserving it.
    pub fn remove_transaction(
        &self,
        chain: ChainId,
        token: Address,
        source_id: B256,
    ) -> Option<QueuedPayout> {
        self.queues.get_mut(&(chain, token))?.remove(&source_id)
    }

    /// Detaches the given payouts and reserves their ids.
    ///
    /// Jobs that are not queued are skipped; the returned reservation
    /// carries what was actually detached.
    pub fn remove_and_reserve(
        self: &Arc<Self>,
        chain: ChainId,
        token: Address,
        source_ids: &[B256],
    ) -> PayoutReservation {
        let mut jobs = Vec::new();
        if let Some(mut queue) = self.queues.get_mut(&(chain, token)) {
            for id in source_ids {
                if let Some(job) = queue.remove(id) {
                    self.reserved.insert(*id, ());
                    jobs.push(job);
                }
            }
        }
        PayoutReservation { store: Arc::clone(self), jobs }
    }

    /// All queued payouts, grouped by queue key.
    pub fn snapshot(&self) -> Vec<((ChainId, Address), Vec<QueuedPayout>)> {
        self.queues
            .iter()
            .map(|entry| (*entry.key(), entry.values().cloned().collect()))
            .collect()
    }

    /// Number of queued payouts across all queues.
    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Whether no payout is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sender_lock(&self, sender: Address) -> Arc<Mutex<()>> {
        self.locks.entry(sender).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Runs `fut` while holding the exclusive section of `sender`.
    ///
    /// At most one payout future per sender runs at a time; waiters queue
    /// FIFO within a sender and independently across senders. The mutex
    /// entry is an `Arc` clone, so it is never replaced under a holder.
    /// Callers dispatch payouts on their own tasks, so cancelling the
    /// dispatcher does not interrupt a payout past its broadcast step.
    pub async fn run_exclusive<F, T>(&self, sender: Address, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self.sender_lock(sender);
        let _guard = lock.lock().await;
        fut.await
    }
}

/// Jobs detached for a payout attempt, plus their reservations.
#[derive(Debug)]
pub struct PayoutReservation {
    store: Arc<InFlightStore>,
    jobs: Vec<QueuedPayout>,
}

impl PayoutReservation {
    /// The detached jobs.
    pub fn jobs(&self) -> &[QueuedPayout] {
        &self.jobs
    }

    /// Returns the jobs to the queue. Only valid before any broadcast was
    /// attempted; post-broadcast failures must call
    /// [`confirm`](Self::confirm) instead.
    pub fn rollback(self) {
        for job in self.jobs {
            self.store.reserved.remove(&job.source_id);
            let mut queue = self.store.queues.entry(job.queue_key()).or_default();
            queue.entry(job.source_id).or_insert(job);
        }
    }

    /// Releases the reservations without requeueing; the durable serial
    /// record now owns deduplication.
    pub fn confirm(self) {
        for job in &self.jobs {
            self.store.reserved.remove(&job.source_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::b256;
    use std::time::Duration;

    fn job(id: B256) -> QueuedPayout {
        QueuedPayout {
            source_chain: 1,
            source_id: id,
            source_amount: "1.0".into(),
            source_symbol: "ETH".into(),
            target_chain: 10,
            target_token: Address::ZERO,
            target_symbol: "ETH".into(),
            target_address: Address::ZERO,
            target_amount: U256::from(1u64),
            response_maker: vec![],
        }
    }

    const ID_A: B256 = b256!("00000000000000000000000000000000000000000000000000000000000000aa");
    const ID_B: B256 = b256!("00000000000000000000000000000000000000000000000000000000000000bb");

    #[test]
    fn reservation_blocks_requeue_until_rolled_back() {
        let store = Arc::new(InFlightStore::new());
        assert!(store.add_transaction(job(ID_A)));

        let reservation = store.remove_and_reserve(10, Address::ZERO, &[ID_A]);
        assert_eq!(reservation.jobs().len(), 1);
        // While reserved, the job cannot be scheduled again.
        assert!(!store.add_transaction(job(ID_A)));
        assert!(store.is_empty());

        reservation.rollback();
        assert_eq!(store.len(), 1);
        assert!(store.get_transaction(10, Address::ZERO, ID_A).is_some());
    }

    #[test]
    fn confirm_releases_without_requeueing() {
        let store = Arc::new(InFlightStore::new());
        store.add_transaction(job(ID_A));
        store.add_transaction(job(ID_B));

        let reservation = store.remove_and_reserve(10, Address::ZERO, &[ID_A]);
        reservation.confirm();

        assert!(store.get_transaction(10, Address::ZERO, ID_A).is_none());
        assert!(store.get_transaction(10, Address::ZERO, ID_B).is_some());
        // After confirmation the id may be queued again.
        assert!(store.add_transaction(job(ID_A)));
    }

    #[tokio::test]
    async fn exclusive_sections_serialize_per_sender() {
        let store = Arc::new(InFlightStore::new());
        let sender = Address::ZERO;
        let counter = Arc::new(std::sync::Mutex::new((0u32, 0u32))); // (active, max)

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                store
                    .run_exclusive(sender, async {
                        {
                            let mut c = counter.lock().unwrap();
                            c.0 += 1;
                            c.1 = c.1.max(c.0);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        counter.lock().unwrap().0 -= 1;
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.lock().unwrap().1, 1);
    }
}
