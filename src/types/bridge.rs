use super::TransferVersion;
use alloy::primitives::{Address, ChainId, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a bridge transaction.
///
/// The numbering is part of the durable schema. Status is monotonic except
/// for the `Created -> ReadyPaid -> Created` demotion on a pre-broadcast
/// failure. Once a row reaches `ReadyPaid` or beyond it is "in operation"
/// and no other writer may rebuild it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum BridgeStatus {
    /// Match recorded, payout not yet attempted.
    Created = 0,
    /// A payout attempt holds the row; transient within one DB transaction.
    ReadyPaid = 90,
    /// Broadcast accepted; awaiting the receipt.
    PaidSuccess = 95,
    /// Payout transaction landed but failed on chain.
    OnChainFailed = 97,
    /// Broadcast crashed after a possible partial side effect.
    PaidCrash = 98,
    /// Receipt observed or reverse-matched; terminal.
    Matched = 99,
}

impl BridgeStatus {
    /// Decodes the stored representation.
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Self::Created),
            90 => Some(Self::ReadyPaid),
            95 => Some(Self::PaidSuccess),
            97 => Some(Self::OnChainFailed),
            98 => Some(Self::PaidCrash),
            99 => Some(Self::Matched),
            _ => None,
        }
    }

    /// Whether a payout attempt owns the row and it must not be rebuilt.
    pub fn in_operation(&self) -> bool {
        (*self as i16) >= Self::ReadyPaid as i16
    }

    /// Statuses the destination sweep may still close.
    ///
    /// Includes `PaidSuccess` so that rows whose receipt watch was lost
    /// (process restart, RPC outage) are closed by the reverse matcher.
    pub const CLOSABLE: [BridgeStatus; 4] =
        [Self::Created, Self::PaidSuccess, Self::OnChainFailed, Self::PaidCrash];
}

/// The durable record pairing a source deposit with its payout obligation.
///
/// Logical identity is `(source_chain, source_id)`, enforced unique in
/// storage; `id` is the surrogate key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeTx {
    /// Storage surrogate key; `None` until first persisted.
    pub id: Option<i64>,
    /// Chain of the source deposit.
    pub source_chain: ChainId,
    /// Hash of the source deposit.
    pub source_id: B256,
    /// Depositing user address.
    pub source_address: Address,
    /// Maker address the deposit was sent to.
    pub source_maker: Address,
    /// Human-readable deposit amount.
    pub source_amount: String,
    /// Deposit token symbol.
    pub source_symbol: String,
    /// Deposit token contract.
    pub source_token: Address,
    /// Sender nonce of the deposit; becomes the safety code.
    pub source_nonce: u64,
    /// Deposit block time.
    pub source_time: DateTime<Utc>,
    /// Chain the payout must land on.
    pub target_chain: ChainId,
    /// Payout transaction hash. Set iff a broadcast was attempted; may
    /// point at a failed transaction.
    pub target_id: Option<B256>,
    /// Payout recipient, the depositing user.
    pub target_address: Address,
    /// Exact raw payout value, safety code spliced into the last 4 digits.
    pub target_amount: U256,
    /// Payout token symbol.
    pub target_symbol: String,
    /// Payout token contract.
    pub target_token: Address,
    /// Maker that actually fulfilled the payout.
    pub target_maker: Option<Address>,
    /// Payout block time.
    pub target_time: Option<DateTime<Utc>>,
    /// Sender nonce of the payout transaction.
    pub target_nonce: Option<u64>,
    /// Fee paid by the payout transaction.
    pub target_fee: Option<String>,
    /// Token the payout fee was paid in.
    pub target_fee_symbol: Option<String>,
    /// Identifier of the rule the amounts were derived from.
    pub rule_id: String,
    /// Event-binding contract resolved from the security code.
    pub ebc_address: Address,
    /// Dealer resolved from the security code.
    pub dealer_address: Address,
    /// Flat fee withheld from the deposit.
    pub withholding_fee: U256,
    /// Proportional fee taken from the traded amount.
    pub trade_fee: U256,
    /// Addresses permitted to fulfill this row; always contains the
    /// deposit's receiver. Lowercased and deduplicated.
    pub response_maker: Vec<Address>,
    /// Dialect the deposit was ingested under.
    pub version: TransferVersion,
    /// Lifecycle status.
    pub status: BridgeStatus,
}

impl BridgeTx {
    /// Whether `sender` is allowed to fulfill this row.
    pub fn allows_maker(&self, sender: &Address) -> bool {
        self.response_maker.contains(sender)
    }

    /// The content key the destination sweep matches on.
    pub fn match_key(&self) -> (ChainId, String, Address, U256) {
        (self.target_chain, self.target_symbol.clone(), self.target_address, self.target_amount)
    }
}
