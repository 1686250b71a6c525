//! Gas fee selection for payout transactions.

use crate::{constants::FEE_TIMEOUT, error::PayoutError};
use alloy::providers::{DynProvider, Provider};
use eyre::eyre;
use serde::{Deserialize, Serialize};

/// Per-chain fee policy from the environment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeSettings {
    /// Forced transaction type: 0 for legacy, 2 for EIP-1559. When unset,
    /// EIP-1559 is used whenever the provider reports both 1559 fields.
    pub force_type: Option<u8>,
    /// Floor applied to the max fee / gas price, in wei.
    pub min_fee_per_gas: u128,
    /// Floor applied to the priority fee, in wei.
    pub min_priority_fee_per_gas: u128,
}

/// The selected fee shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasFees {
    /// Dynamic-fee transaction.
    Eip1559 {
        /// Fee cap in wei.
        max_fee_per_gas: u128,
        /// Tip cap in wei.
        max_priority_fee_per_gas: u128,
    },
    /// Legacy gas-priced transaction.
    Legacy {
        /// Gas price in wei.
        gas_price: u128,
    },
}

/// Picks fees for a payout, bounded end-to-end by [`FEE_TIMEOUT`].
///
/// A zero fee component after flooring fails fast instead of producing an
/// unminable transaction.
pub async fn estimate_fees(
    provider: &DynProvider,
    settings: &FeeSettings,
) -> Result<GasFees, PayoutError> {
    tokio::time::timeout(FEE_TIMEOUT, select_fees(provider, settings))
        .await
        .map_err(|_| PayoutError::before(eyre!("fee computation timed out")))?
}

async fn select_fees(
    provider: &DynProvider,
    settings: &FeeSettings,
) -> Result<GasFees, PayoutError> {
    match settings.force_type {
        Some(0) => legacy_fees(provider, settings).await,
        Some(2) => eip1559_fees(provider, settings).await,
        _ => match provider.estimate_eip1559_fees().await {
            Ok(estimate)
                if estimate.max_fee_per_gas > 0 && estimate.max_priority_fee_per_gas > 0 =>
            {
                Ok(apply_floors(
                    estimate.max_fee_per_gas,
                    estimate.max_priority_fee_per_gas,
                    settings,
                ))
            }
            _ => legacy_fees(provider, settings).await,
        },
    }
}

async fn eip1559_fees(
    provider: &DynProvider,
    settings: &FeeSettings,
) -> Result<GasFees, PayoutError> {
    let estimate = provider
        .estimate_eip1559_fees()
        .await
        .map_err(|e| PayoutError::before(eyre!("EIP1559 Fee fail: {e}")))?;

    let fees = apply_floors(estimate.max_fee_per_gas, estimate.max_priority_fee_per_gas, settings);
    match fees {
        GasFees::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas }
            if max_fee_per_gas == 0 || max_priority_fee_per_gas == 0 =>
        {
            Err(PayoutError::before(eyre!("EIP1559 Fee fail: zero component")))
        }
        fees => Ok(fees),
    }
}

async fn legacy_fees(
    provider: &DynProvider,
    settings: &FeeSettings,
) -> Result<GasFees, PayoutError> {
    let gas_price = provider
        .get_gas_price()
        .await
        .map_err(|e| PayoutError::before(eyre!("gasPrice Fee fail: {e}")))?
        .max(settings.min_fee_per_gas);

    if gas_price == 0 {
        return Err(PayoutError::before(eyre!("gasPrice Fee fail: zero gas price")));
    }
    Ok(GasFees::Legacy { gas_price })
}

fn apply_floors(max_fee: u128, priority_fee: u128, settings: &FeeSettings) -> GasFees {
    let max_priority_fee_per_gas = priority_fee.max(settings.min_priority_fee_per_gas);
    GasFees::Eip1559 {
        max_fee_per_gas: max_fee.max(settings.min_fee_per_gas).max(max_priority_fee_per_gas),
        max_priority_fee_per_gas,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floors_lift_both_components() {
        let settings = FeeSettings {
            force_type: None,
            min_fee_per_gas: 100,
            min_priority_fee_per_gas: 40,
        };
        assert_eq!(
            apply_floors(60, 10, &settings),
            GasFees::Eip1559 { max_fee_per_gas: 100, max_priority_fee_per_gas: 40 }
        );
        // The fee cap never drops below the tip cap.
        assert_eq!(
            apply_floors(60, 200, &settings),
            GasFees::Eip1559 { max_fee_per_gas: 200, max_priority_fee_per_gas: 200 }
        );
    }
}
