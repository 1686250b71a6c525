//! Swap-data dialect: the deposit calldata names the target chain and
//! recipient instead of a security code.

use crate::error::RuleError;
use alloy::primitives::{Address, Bytes, ChainId};

/// Target routing decoded from V1 deposit calldata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapData {
    /// Chain the payout must land on.
    pub target_chain: ChainId,
    /// Recipient of the payout.
    pub target_address: Address,
}

/// Decodes `c=<chain>&t=<address>` swap data from deposit calldata.
pub fn decode_swap_data(input: &Bytes) -> Result<SwapData, RuleError> {
    let text = core::str::from_utf8(input).map_err(|_| RuleError::SwapDataInvalid)?;

    let mut target_chain = None;
    let mut target_address = None;
    for field in text.trim().split('&') {
        match field.split_once('=') {
            Some(("c", chain)) => target_chain = chain.parse::<ChainId>().ok(),
            Some(("t", addr)) => target_address = addr.parse::<Address>().ok(),
            _ => return Err(RuleError::SwapDataInvalid),
        }
    }

    match (target_chain, target_address) {
        (Some(target_chain), Some(target_address)) => {
            Ok(SwapData { target_chain, target_address })
        }
        _ => Err(RuleError::SwapDataInvalid),
    }
}
