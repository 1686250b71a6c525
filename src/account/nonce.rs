//! Nonce management for payout senders.
//!
//! Each sender gets a serialized issuer vending strictly increasing
//! nonces with commit/rollback semantics: a rolled-back nonce lands on a
//! free list and is re-issued, smallest first, before the next sequential
//! one.

use alloy::{
    primitives::Address,
    providers::{DynProvider, Provider},
    transports::TransportResult,
};
use dashmap::DashMap;
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct NonceState {
    initialized: bool,
    next: u64,
    free: BTreeSet<u64>,
}

impl NonceState {
    /// The smallest freed nonce, falling back to the sequential cursor.
    fn vend(&mut self) -> u64 {
        match self.free.iter().next().copied() {
            Some(freed) => {
                self.free.remove(&freed);
                freed
            }
            None => {
                let n = self.next;
                self.next += 1;
                n
            }
        }
    }
}

/// Per-address nonce issuer.
#[derive(Debug, Clone, Default)]
pub struct NonceManager {
    states: DashMap<Address, Arc<Mutex<NonceState>>>,
}

impl NonceManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, address: Address) -> Arc<Mutex<NonceState>> {
        // Short map lock to clone the Arc; the await below runs outside it.
        self.states.entry(address).or_default().clone()
    }

    /// Vends the next nonce for `address`.
    ///
    /// Issuance is totally ordered per address. The first call seeds the
    /// cursor from the chain's pending nonce. The caller must settle the
    /// returned handle with [`NonceHandle::submit`] or
    /// [`NonceHandle::rollback`]; a handle dropped unsettled burns its
    /// nonce.
    pub async fn next(
        &self,
        provider: &DynProvider,
        address: Address,
    ) -> TransportResult<NonceHandle> {
        let state = self.state(address);
        let mut guard = state.lock().await;

        if !guard.initialized {
            guard.next = provider.get_transaction_count(address).pending().await?;
            guard.initialized = true;
        }

        let nonce = guard.vend();
        drop(guard);

        metrics::counter!("account.nonces_issued").increment(1);
        Ok(NonceHandle { nonce, state })
    }

    /// Re-reads the pending nonce from the chain and discards the free
    /// list. Used after a broadcast was rejected as stale.
    pub async fn force_refresh(
        &self,
        provider: &DynProvider,
        address: Address,
    ) -> TransportResult<()> {
        let state = self.state(address);
        let mut guard = state.lock().await;
        guard.next = provider.get_transaction_count(address).pending().await?;
        guard.free.clear();
        guard.initialized = true;
        Ok(())
    }
}

/// An issued nonce awaiting settlement.
#[derive(Debug)]
pub struct NonceHandle {
    nonce: u64,
    state: Arc<Mutex<NonceState>>,
}

impl NonceHandle {
    /// The issued nonce.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Commits the nonce: it is considered consumed by a broadcast.
    pub fn submit(self) {}

    /// Returns the nonce to the free list for re-issue.
    pub async fn rollback(self) {
        self.state.lock().await.free.insert(self.nonce);
        metrics::counter!("account.nonces_rolled_back").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(start: u64) -> (NonceManager, Address) {
        let manager = NonceManager::new();
        let address = Address::ZERO;
        let state = manager.state(address);
        let mut guard = state.try_lock().unwrap();
        guard.initialized = true;
        guard.next = start;
        drop(guard);
        (manager, address)
    }

    async fn vend(manager: &NonceManager, address: Address) -> NonceHandle {
        // Seeded states never hit the provider.
        let state = manager.state(address);
        let nonce = state.lock().await.vend();
        NonceHandle { nonce, state }
    }

    #[tokio::test]
    async fn vends_sequentially() {
        let (manager, address) = seeded(7);
        let a = vend(&manager, address).await;
        let b = vend(&manager, address).await;
        assert_eq!((a.nonce(), b.nonce()), (7, 8));
        a.submit();
        b.submit();
        assert_eq!(vend(&manager, address).await.nonce(), 9);
    }

    #[tokio::test]
    async fn rolled_back_nonce_is_reissued_first() {
        let (manager, address) = seeded(0);
        let a = vend(&manager, address).await;
        let b = vend(&manager, address).await;
        assert_eq!((a.nonce(), b.nonce()), (0, 1));

        b.rollback().await;
        a.rollback().await;

        // The smallest freed nonce comes back first.
        let c = vend(&manager, address).await;
        let d = vend(&manager, address).await;
        let e = vend(&manager, address).await;
        assert_eq!((c.nonce(), d.nonce(), e.nonce()), (0, 1, 2));
    }
}
