//! Security-code dialect: the deposit's raw value carries a 4-digit code
//! selecting dealer, EBC, and target chain, and the payout splices the
//! deposit nonce into its trailing digits.

use crate::{
    constants::{CODE_MODULUS, MAX_SAFETY_NONCE, TRADE_FEE_DENOMINATOR},
    error::RuleError,
    rules::config::MakerRule,
};
use alloy::primitives::U256;

/// Decoded trailing 4 digits of a deposit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityCode {
    /// Digit 0: index into the dealer registry.
    pub dealer_index: usize,
    /// Digit 1: index into the EBC registry.
    pub ebc_index: usize,
    /// Digits 2-3: index into the chain table, base 10.
    pub chain_index: usize,
    /// The code as carried on chain.
    pub raw: u16,
}

impl SecurityCode {
    /// Extracts the code from a raw deposit value.
    pub fn decode(value: U256) -> Self {
        let raw = (value % CODE_MODULUS).to::<u16>();
        Self {
            dealer_index: (raw / 1000) as usize,
            ebc_index: ((raw / 100) % 10) as usize,
            chain_index: (raw % 100) as usize,
            raw,
        }
    }
}

/// Fee deductions and the final payout value derived from a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedAmounts {
    /// Proportional fee taken from the traded amount.
    pub trade_fee: U256,
    /// Exact payout value, safety code spliced into the trailing digits.
    pub response_amount: U256,
}

/// Derives the payout value.
///
/// `deducted` is whatever must come off the raw value before fees: the
/// security code for the V2 dialect, zero for V1. The last four digits of
/// the fee-reduced amount are truncated and replaced with the zero-padded
/// source nonce so the reverse matcher can pair the payout with its
/// deposit. The truncation must be preserved exactly; existing on-chain
/// payouts depend on it.
///
/// Callers must have rejected nonces above [`MAX_SAFETY_NONCE`] already.
pub fn derive_amounts(
    value: U256,
    deducted: U256,
    nonce: u64,
    rule: &MakerRule,
) -> Result<DerivedAmounts, RuleError> {
    debug_assert!(nonce <= MAX_SAFETY_NONCE);

    let trade_amount = value
        .checked_sub(deducted)
        .and_then(|v| v.checked_sub(rule.withholding_fee))
        .ok_or(RuleError::ValueUnderflow(value))?;

    let trade_fee = trade_amount * U256::from(rule.trade_fee_bps) / TRADE_FEE_DENOMINATOR;
    let truncated = ((trade_amount - trade_fee) / CODE_MODULUS) * CODE_MODULUS;
    let response_amount = truncated + U256::from(nonce);

    // Min-price enforcement is disabled by policy; only the cap is checked.
    if response_amount > rule.max_price {
        return Err(RuleError::AmountOutOfRange {
            amount: response_amount,
            max: rule.max_price,
        });
    }

    Ok(DerivedAmounts { trade_fee, response_amount })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    fn rule(trade_fee_bps: u64, withholding_fee: u64) -> MakerRule {
        MakerRule {
            id: "1-10:ETH-ETH".into(),
            source_chain: 1,
            target_chain: 10,
            source_symbol: "ETH".into(),
            target_symbol: "ETH".into(),
            trade_fee_bps,
            withholding_fee: U256::from(withholding_fee),
            min_price: U256::ZERO,
            max_price: U256::MAX,
            response_maker_list: Vec::<Address>::new(),
        }
    }

    #[test]
    fn decodes_code_digits() {
        let code = SecurityCode::decode(U256::from(1_000_000_000_000_009_912u64));
        assert_eq!(code.raw, 9912);
        assert_eq!(code.dealer_index, 9);
        assert_eq!(code.ebc_index, 9);
        assert_eq!(code.chain_index, 12);
    }

    #[test]
    fn code_of_round_value_is_zero() {
        let code = SecurityCode::decode(U256::from(5_000_000_000_000u64));
        assert_eq!(code.raw, 0);
    }

    #[test]
    fn response_ends_with_padded_nonce() {
        // The safety code round-trips: response mod 10000 == nonce.
        let value = U256::from(1_000_000_000_000_009_912u64);
        let code = SecurityCode::decode(value);
        for nonce in [0u64, 7, 12, 9_999] {
            let derived =
                derive_amounts(value, U256::from(code.raw), nonce, &rule(30, 5_000_000_000_000))
                    .unwrap();
            assert_eq!(derived.response_amount % CODE_MODULUS, U256::from(nonce));
        }
    }

    #[test]
    fn truncates_before_splicing() {
        // 30 bps off 1e18-ish, then the last 4 digits are overwritten.
        let value = U256::from(1_000_000_000_000_009_912u64);
        let derived = derive_amounts(
            value,
            U256::from(9912u64),
            12,
            &rule(30, 5_000_000_000_000),
        )
        .unwrap();

        let trade = value - U256::from(9912u64) - U256::from(5_000_000_000_000u64);
        let fee = trade * U256::from(30u64) / U256::from(10_000u64);
        let expected = ((trade - fee) / U256::from(10_000u64)) * U256::from(10_000u64)
            + U256::from(12u64);
        assert_eq!(derived.response_amount, expected);
        assert_eq!(derived.trade_fee, fee);
    }

    #[test]
    fn rejects_amount_above_cap() {
        let mut capped = rule(0, 0);
        capped.max_price = U256::from(1_000u64);
        let err = derive_amounts(U256::from(1_000_000u64), U256::ZERO, 1, &capped).unwrap_err();
        assert!(matches!(err, RuleError::AmountOutOfRange { .. }));
    }

    #[test]
    fn rejects_value_below_fees() {
        let err = derive_amounts(U256::from(100u64), U256::ZERO, 1, &rule(0, 1_000_000))
            .unwrap_err();
        assert!(matches!(err, RuleError::ValueUnderflow(_)));
    }
}
