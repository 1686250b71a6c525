//! Signing accounts: fee selection, nonce issue, local signing, and the
//! crash-safe broadcast ordering (serial record before nonce submit before
//! broadcast).

mod fees;
pub use fees::{estimate_fees, FeeSettings, GasFees};
mod nonce;
pub use nonce::{NonceHandle, NonceManager};

use crate::{
    error::PayoutError,
    storage::StorageApi,
    types::{IOrbiterRouterV3, IERC20},
};
use alloy::{
    consensus::{TxEip1559, TxLegacy, TypedTransaction},
    eips::Encodable2718,
    network::{Ethereum, EthereumWallet, NetworkWallet},
    primitives::{Address, Bytes, ChainId, TxKind, B256, U256},
    providers::{DynProvider, PendingTransactionConfig, Provider},
    rpc::types::{TransactionInput, TransactionRequest},
    signers::local::PrivateKeySigner,
    sol_types::SolCall,
};
use async_trait::async_trait;
use eyre::eyre;
use std::{fmt::Debug, sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};

/// How long a receipt watch waits before giving up.
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Outcome of a broadcast payout.
#[derive(Debug, Clone, Copy)]
pub struct SentPayout {
    /// Hash of the signed transaction.
    pub hash: B256,
    /// The broadcasting sender.
    pub from: Address,
    /// Nonce the transaction was signed with.
    pub nonce: u64,
}

/// A payout-capable account on one chain.
#[async_trait]
pub trait SenderAccount: Debug + Send + Sync {
    /// The sender address.
    fn address(&self) -> Address;

    /// The chain this account pays out on.
    fn chain_id(&self) -> ChainId;

    /// Sends the native asset to one recipient.
    async fn transfer(
        &self,
        to: Address,
        value: U256,
        source_ids: &[B256],
    ) -> Result<SentPayout, PayoutError>;

    /// Sends an ERC-20 token to one recipient.
    async fn transfer_token(
        &self,
        token: Address,
        to: Address,
        value: U256,
        source_ids: &[B256],
    ) -> Result<SentPayout, PayoutError>;

    /// Sends the native asset to many recipients through the router.
    async fn transfers(
        &self,
        tos: Vec<Address>,
        values: Vec<U256>,
        source_ids: &[B256],
    ) -> Result<SentPayout, PayoutError>;

    /// Sends an ERC-20 token to many recipients through the router.
    async fn transfer_tokens(
        &self,
        token: Address,
        tos: Vec<Address>,
        values: Vec<U256>,
        source_ids: &[B256],
    ) -> Result<SentPayout, PayoutError>;

    /// Native balance of the sender.
    async fn get_balance(&self) -> Result<U256, PayoutError>;

    /// Token balance of the sender.
    async fn get_token_balance(&self, token: Address) -> Result<U256, PayoutError>;

    /// Waits for a payout receipt and returns the confirmed sender.
    async fn wait_for_confirmation(&self, hash: B256) -> eyre::Result<Address>;
}

/// The payout request shapes an account can broadcast.
#[derive(Debug, Clone)]
enum PayoutCall {
    Native { to: Address, value: U256 },
    Token { token: Address, to: Address, amount: U256 },
    NativeBatch { tos: Vec<Address>, values: Vec<U256> },
    TokenBatch { token: Address, tos: Vec<Address>, values: Vec<U256> },
}

impl PayoutCall {
    /// Destination, attached value, and calldata of the transaction.
    fn build(&self, router: Option<Address>) -> Result<(Address, U256, Bytes), PayoutError> {
        match self {
            Self::Native { to, value } => Ok((*to, *value, Bytes::new())),
            Self::Token { token, to, amount } => Ok((
                *token,
                U256::ZERO,
                IERC20::transferCall { to: *to, amount: *amount }.abi_encode().into(),
            )),
            Self::NativeBatch { tos, values } => {
                let router =
                    router.ok_or_else(|| PayoutError::before(eyre!("no router configured")))?;
                let total: U256 = values.iter().copied().sum();
                Ok((
                    router,
                    total,
                    IOrbiterRouterV3::transfersCall { tos: tos.clone(), values: values.clone() }
                        .abi_encode()
                        .into(),
                ))
            }
            Self::TokenBatch { token, tos, values } => {
                let router =
                    router.ok_or_else(|| PayoutError::before(eyre!("no router configured")))?;
                Ok((
                    router,
                    U256::ZERO,
                    IOrbiterRouterV3::transferTokensCall {
                        token: *token,
                        tos: tos.clone(),
                        values: values.clone(),
                    }
                    .abi_encode()
                    .into(),
                ))
            }
        }
    }

    /// Token and total amount to preflight the balance against.
    fn required_balance(&self) -> (Option<Address>, U256) {
        match self {
            Self::Native { value, .. } => (None, *value),
            Self::Token { token, amount, .. } => (Some(*token), *amount),
            Self::NativeBatch { values, .. } => (None, values.iter().copied().sum()),
            Self::TokenBatch { token, values, .. } => (Some(*token), values.iter().copied().sum()),
        }
    }
}

/// A locally-signing EOA account.
pub struct EoaAccount {
    chain_id: ChainId,
    address: Address,
    provider: DynProvider,
    wallet: EthereumWallet,
    nonces: NonceManager,
    storage: Arc<dyn StorageApi>,
    fees: FeeSettings,
    router: Option<Address>,
}

impl Debug for EoaAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EoaAccount")
            .field("chain_id", &self.chain_id)
            .field("address", &self.address)
            .finish()
    }
}

impl EoaAccount {
    /// Creates an account from a private key signer.
    pub fn new(
        chain_id: ChainId,
        provider: DynProvider,
        signer: PrivateKeySigner,
        storage: Arc<dyn StorageApi>,
        fees: FeeSettings,
        router: Option<Address>,
    ) -> Self {
        let address = signer.address();
        Self {
            chain_id,
            address,
            provider,
            wallet: EthereumWallet::new(signer),
            nonces: NonceManager::new(),
            storage,
            fees,
            router,
        }
    }

    /// Signs and broadcasts one payout call.
    ///
    /// Ordering is load-bearing: the serial relation is persisted before
    /// the nonce is submitted and before the raw broadcast, so a crash at
    /// any later point leaves a durable record of the attempted hash.
    #[instrument(skip_all, fields(chain = self.chain_id, sender = %self.address))]
    async fn send_payout(
        &self,
        call: PayoutCall,
        source_ids: &[B256],
    ) -> Result<SentPayout, PayoutError> {
        let fees = estimate_fees(&self.provider, &self.fees).await?;
        let (to, value, input) = call.build(self.router)?;

        self.check_balance(&call).await?;

        let request = TransactionRequest {
            from: Some(self.address),
            to: Some(TxKind::Call(to)),
            value: Some(value),
            input: TransactionInput::new(input.clone()),
            ..Default::default()
        };
        let gas_limit = self
            .provider
            .estimate_gas(request)
            .await
            .map_err(|e| PayoutError::before(eyre!("gas estimation failed: {e}")))?;

        let nonce_handle = self
            .nonces
            .next(&self.provider, self.address)
            .await
            .map_err(|e| PayoutError::before(eyre!("nonce fetch failed: {e}")))?;
        let nonce = nonce_handle.nonce();

        let tx = self.typed_transaction(to, value, input, gas_limit, nonce, fees);
        let signed = match NetworkWallet::<Ethereum>::sign_transaction_from(
            &self.wallet,
            self.address,
            tx,
        )
        .await
        {
            Ok(signed) => signed,
            Err(err) => {
                nonce_handle.rollback().await;
                return Err(PayoutError::before(eyre!("signing failed: {err}")));
            }
        };
        let hash = *signed.tx_hash();

        // Durable record of the attempted hash, ahead of any side effect.
        if let Err(err) = self.storage.save_serial(source_ids, hash).await {
            nonce_handle.rollback().await;
            return Err(PayoutError::before(eyre!("serial record failed: {err}")));
        }
        nonce_handle.submit();

        match self.provider.send_raw_transaction(&signed.encoded_2718()).await {
            Ok(_) => {
                debug!(%hash, nonce, "payout broadcast");
                metrics::counter!("account.broadcasts").increment(1);
                Ok(SentPayout { hash, from: self.address, nonce })
            }
            Err(err) if is_stale_nonce(&err.to_string()) => {
                // The chain already consumed this nonce; resync and let the
                // sequencer retry from a clean row.
                warn!(%hash, nonce, %err, "stale nonce on broadcast");
                let _ = self.nonces.force_refresh(&self.provider, self.address).await;
                Err(PayoutError::before(eyre!("stale nonce: {err}")))
            }
            Err(err) => Err(PayoutError::AfterBroadcast {
                hash: Some(hash),
                sender: Some(self.address),
                reason: err.to_string(),
            }),
        }
    }

    async fn check_balance(&self, call: &PayoutCall) -> Result<(), PayoutError> {
        let (token, required) = call.required_balance();
        let available = match token {
            None => self.get_balance().await?,
            Some(token) => self.get_token_balance(token).await?,
        };
        if available < required {
            return Err(PayoutError::before(eyre!(
                "insufficient balance: have {available}, need {required}"
            )));
        }
        Ok(())
    }

    fn typed_transaction(
        &self,
        to: Address,
        value: U256,
        input: Bytes,
        gas_limit: u64,
        nonce: u64,
        fees: GasFees,
    ) -> TypedTransaction {
        match fees {
            GasFees::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas } => TxEip1559 {
                chain_id: self.chain_id,
                nonce,
                gas_limit,
                max_fee_per_gas,
                max_priority_fee_per_gas,
                to: TxKind::Call(to),
                value,
                access_list: Default::default(),
                input,
            }
            .into(),
            GasFees::Legacy { gas_price } => TxLegacy {
                chain_id: Some(self.chain_id),
                nonce,
                gas_price,
                gas_limit,
                to: TxKind::Call(to),
                value,
                input,
            }
            .into(),
        }
    }
}

#[async_trait]
impl SenderAccount for EoaAccount {
    fn address(&self) -> Address {
        self.address
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn transfer(
        &self,
        to: Address,
        value: U256,
        source_ids: &[B256],
    ) -> Result<SentPayout, PayoutError> {
        self.send_payout(PayoutCall::Native { to, value }, source_ids).await
    }

    async fn transfer_token(
        &self,
        token: Address,
        to: Address,
        value: U256,
        source_ids: &[B256],
    ) -> Result<SentPayout, PayoutError> {
        self.send_payout(PayoutCall::Token { token, to, amount: value }, source_ids).await
    }

    async fn transfers(
        &self,
        tos: Vec<Address>,
        values: Vec<U256>,
        source_ids: &[B256],
    ) -> Result<SentPayout, PayoutError> {
        self.send_payout(PayoutCall::NativeBatch { tos, values }, source_ids).await
    }

    async fn transfer_tokens(
        &self,
        token: Address,
        tos: Vec<Address>,
        values: Vec<U256>,
        source_ids: &[B256],
    ) -> Result<SentPayout, PayoutError> {
        self.send_payout(PayoutCall::TokenBatch { token, tos, values }, source_ids).await
    }

    async fn get_balance(&self) -> Result<U256, PayoutError> {
        self.provider
            .get_balance(self.address)
            .await
            .map_err(|e| PayoutError::before(eyre!("balance read failed: {e}")))
    }

    async fn get_token_balance(&self, token: Address) -> Result<U256, PayoutError> {
        IERC20::new(token, self.provider.clone())
            .balanceOf(self.address)
            .call()
            .await
            .map_err(|e| PayoutError::before(eyre!("token balance read failed: {e}")))
    }

    async fn wait_for_confirmation(&self, hash: B256) -> eyre::Result<Address> {
        let config =
            PendingTransactionConfig::new(hash).with_timeout(Some(CONFIRMATION_TIMEOUT));
        self.provider
            .watch_pending_transaction(config)
            .await
            .map_err(|e| eyre!("receipt watch failed for {hash}: {e}"))?
            .await
            .map_err(|e| eyre!("receipt watch failed for {hash}: {e}"))?;

        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| eyre!("receipt fetch failed for {hash}: {e}"))?
            .ok_or_else(|| eyre!("no receipt for {hash}"))?;

        if !receipt.status() {
            return Err(eyre!("payout {hash} reverted on chain"));
        }
        Ok(receipt.from)
    }
}

/// Whether a broadcast rejection means the nonce was already consumed.
fn is_stale_nonce(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("nonce_expired")
        || message.contains("nonce too low")
        || message.contains("invalid nonce")
        || message.contains("already known")
}

/// The signing accounts this process controls, looked up by chain and
/// permitted maker set.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    accounts: Vec<Arc<dyn SenderAccount>>,
}

impl AccountRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account.
    pub fn insert(&mut self, account: Arc<dyn SenderAccount>) {
        self.accounts.push(account);
    }

    /// The first account on `chain` whose address is permitted by
    /// `candidates`.
    pub fn resolve(
        &self,
        chain: ChainId,
        candidates: &[Address],
    ) -> Option<Arc<dyn SenderAccount>> {
        self.accounts
            .iter()
            .find(|a| a.chain_id() == chain && candidates.contains(&a.address()))
            .cloned()
    }

    /// All registered accounts.
    pub fn accounts(&self) -> &[Arc<dyn SenderAccount>] {
        &self.accounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_nonce_detection() {
        assert!(is_stale_nonce("NONCE_EXPIRED"));
        assert!(is_stale_nonce("rpc error: nonce too low: next nonce 5"));
        assert!(is_stale_nonce("already known"));
        assert!(!is_stale_nonce("insufficient funds for gas * price + value"));
    }

    #[test]
    fn batch_call_requires_router() {
        let call = PayoutCall::NativeBatch {
            tos: vec![Address::ZERO],
            values: vec![U256::from(1u64)],
        };
        assert!(call.build(None).is_err());

        let (to, value, input) = call.build(Some(Address::repeat_byte(7))).unwrap();
        assert_eq!(to, Address::repeat_byte(7));
        assert_eq!(value, U256::from(1u64));
        assert!(!input.is_empty());
    }
}
