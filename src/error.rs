//! Settlement error types.

use alloy::primitives::{Address, B256, U256};

/// Errors produced while deriving a payout obligation from a deposit.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The deposit nonce does not fit the 4-digit safety code.
    #[error("deposit {hash} nonce {nonce} exceeds the 4-digit safety range")]
    SecurityCodeInvalid {
        /// Hash of the offending deposit.
        hash: B256,
        /// The out-of-range nonce.
        nonce: u64,
    },

    /// No rule covers the resolved chain/symbol pair.
    #[error("no rule for {source_chain}:{source_symbol} -> {target_chain}:{target_symbol}")]
    RuleNotFound {
        /// Source chain id.
        source_chain: u64,
        /// Target chain id.
        target_chain: u64,
        /// Source token symbol.
        source_symbol: String,
        /// Target token symbol.
        target_symbol: String,
    },

    /// The dealer index from the security code is not configured.
    #[error("dealer index {0} is not configured")]
    DealerNotFound(usize),

    /// The EBC index from the security code is not configured.
    #[error("ebc index {0} is not configured")]
    EbcNotFound(usize),

    /// The target chain index from the security code is not configured.
    #[error("target chain index {0} is not configured")]
    ChainNotFound(usize),

    /// The token has no counterpart sharing a mainnet token on the target chain.
    #[error("token {token} on chain {chain} has no counterpart on chain {target_chain}")]
    TokenNotFound {
        /// Chain the token was looked up on.
        chain: u64,
        /// Chain that was missing the counterpart.
        target_chain: u64,
        /// The token address.
        token: Address,
    },

    /// The derived payout exceeds the rule price range.
    #[error("derived amount {amount} exceeds the rule max price {max}")]
    AmountOutOfRange {
        /// The derived payout value.
        amount: U256,
        /// The configured maximum.
        max: U256,
    },

    /// The deposit value cannot cover the security code and fees.
    #[error("deposit value {0} is too small to cover the code and fees")]
    ValueUnderflow(U256),

    /// The V1 deposit calldata could not be decoded.
    #[error("malformed swap data in deposit calldata")]
    SwapDataInvalid,

    /// A payout-side transfer was handed to the deposit evaluator.
    #[error("transfer {0} is not a deposit")]
    NotADeposit(B256),
}

/// Errors driving the payout state machine.
///
/// The three kinds have distinct recovery semantics: [`BeforeBroadcast`]
/// leaves the bridge row at `Created` and requeues the job,
/// [`Skipped`] drops the job silently, and [`AfterBroadcast`] moves the
/// row to `PaidCrash` because the transaction may have landed on chain.
///
/// [`BeforeBroadcast`]: PayoutError::BeforeBroadcast
/// [`Skipped`]: PayoutError::Skipped
/// [`AfterBroadcast`]: PayoutError::AfterBroadcast
#[derive(Debug, thiserror::Error)]
pub enum PayoutError {
    /// Failure observed before the transaction could have reached the network.
    #[error("payout aborted before broadcast: {0}")]
    BeforeBroadcast(eyre::Report),

    /// Precondition violation that must not be retried.
    #[error("payout skipped: {0}")]
    Skipped(String),

    /// The broadcast may have landed; best-known hash and sender attached.
    #[error("payout failed after broadcast ({hash:?}): {reason}")]
    AfterBroadcast {
        /// Hash of the signed transaction, when signing completed.
        hash: Option<B256>,
        /// The sender, when known.
        sender: Option<Address>,
        /// Broadcast failure description.
        reason: String,
    },
}

impl PayoutError {
    /// Shorthand for a pre-broadcast failure.
    pub fn before(err: impl Into<eyre::Report>) -> Self {
        Self::BeforeBroadcast(err.into())
    }

    /// Whether the job should be returned to the in-flight set.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BeforeBroadcast(_))
    }
}

/// Errors returned by the settlement storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database driver error.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// A guarded update touched an unexpected number of rows.
    #[error("row count mismatch: expected {expected}, affected {affected}")]
    RowCount {
        /// Rows the update had to touch.
        expected: u64,
        /// Rows it actually touched.
        affected: u64,
    },

    /// A row failed to decode into its domain type.
    #[error("corrupt row: {0}")]
    Decode(String),

    /// The transaction was already consumed.
    #[error("storage transaction already finished")]
    TxFinished,
}

impl StorageError {
    /// Whether the error is the row-count guard firing.
    pub fn is_row_count(&self) -> bool {
        matches!(self, Self::RowCount { .. })
    }
}
