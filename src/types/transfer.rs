use alloy::primitives::{Address, Bytes, ChainId, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Bridge protocol dialect of a transfer.
///
/// Versions suffixed `-0` are user deposits towards a maker; `-1` are maker
/// payouts towards a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferVersion {
    /// User deposit carrying V1 swap data in its calldata.
    #[serde(rename = "1-0")]
    V1Deposit,
    /// Maker payout fulfilling a V1 deposit.
    #[serde(rename = "1-1")]
    V1Payout,
    /// User deposit carrying the security code in its raw value.
    #[serde(rename = "2-0")]
    V2Deposit,
    /// Maker payout fulfilling a V2 deposit.
    #[serde(rename = "2-1")]
    V2Payout,
}

impl TransferVersion {
    /// Whether this transfer is a user deposit.
    pub fn is_deposit(&self) -> bool {
        matches!(self, Self::V1Deposit | Self::V2Deposit)
    }

    /// Whether this transfer is a maker payout.
    pub fn is_payout(&self) -> bool {
        !self.is_deposit()
    }

    /// The payout version closing deposits of this version.
    pub fn payout_side(&self) -> Self {
        match self {
            Self::V1Deposit | Self::V1Payout => Self::V1Payout,
            Self::V2Deposit | Self::V2Payout => Self::V2Payout,
        }
    }

    /// Wire representation, identical to the ingester's.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1Deposit => "1-0",
            Self::V1Payout => "1-1",
            Self::V2Deposit => "2-0",
            Self::V2Payout => "2-1",
        }
    }
}

impl fmt::Display for TransferVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1-0" => Ok(Self::V1Deposit),
            "1-1" => Ok(Self::V1Payout),
            "2-0" => Ok(Self::V2Deposit),
            "2-1" => Ok(Self::V2Payout),
            other => Err(format!("unknown transfer version {other}")),
        }
    }
}

/// On-chain confirmation status of an ingested transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum TransferStatus {
    /// Observed but not yet final.
    Pending = 1,
    /// Confirmed on chain.
    Success = 2,
    /// Reverted on chain.
    Failed = 3,
}

impl TransferStatus {
    /// Decodes the stored representation.
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            1 => Some(Self::Pending),
            2 => Some(Self::Success),
            3 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Matcher progress markers kept on each transfer row.
pub mod op_status {
    /// Not yet looked at by any sweep.
    pub const UNTOUCHED: i16 = 0;
    /// A bridge row has been built from this deposit.
    pub const SOURCE_BUILT: i16 = 1;
    /// Rule evaluation failed; the row is parked.
    pub const RULE_ERROR: i16 = 9;
    /// Closed by the destination sweep.
    pub const MATCHED: i16 = 99;
}

/// An ingested transfer row. Immutable after ingest except for `op_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    /// Transaction hash on its chain.
    pub hash: B256,
    /// Chain the transfer happened on.
    pub chain_id: ChainId,
    /// Sending address.
    pub sender: Address,
    /// Receiving address.
    pub receiver: Address,
    /// Transferred token contract, zero for the native asset.
    pub token: Address,
    /// Token symbol as ingested.
    pub symbol: String,
    /// Human-readable decimal amount.
    pub amount: String,
    /// Raw on-chain value. For deposits this carries the security code.
    pub value: U256,
    /// Sender account nonce of the transaction.
    pub nonce: u64,
    /// Block timestamp.
    pub timestamp: DateTime<Utc>,
    /// Paid transaction fee, if known.
    pub fee_amount: Option<String>,
    /// Token the fee was paid in, if known.
    pub fee_token: Option<String>,
    /// Calldata, populated for V1 deposits carrying swap data.
    pub input: Option<Bytes>,
    /// Bridge protocol dialect.
    pub version: TransferVersion,
    /// On-chain confirmation status.
    pub status: TransferStatus,
    /// Matcher progress marker, see [`op_status`].
    pub op_status: i16,
}

impl Transfer {
    /// Key identifying this transfer across chains.
    pub fn key(&self) -> (ChainId, B256) {
        (self.chain_id, self.hash)
    }
}
