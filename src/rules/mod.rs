//! Payout derivation: dispatches a deposit to its dialect evaluator and
//! produces the obligation the matcher persists.

pub mod config;
mod v1;
mod v2;

pub use config::{MakerRule, RuleBook, RuleGraph, StaticRuleGraph, TokenInfo, TokenRegistry};
pub use v1::{decode_swap_data, SwapData};
pub use v2::{derive_amounts, DerivedAmounts, SecurityCode};

use crate::{
    constants::MAX_SAFETY_NONCE,
    error::RuleError,
    types::{Transfer, TransferVersion},
};
use alloy::primitives::{Address, ChainId, U256};
use std::sync::Arc;
use tracing::instrument;

/// The payout obligation derived from one deposit.
///
/// Deterministic for a given (transfer, rule snapshot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obligation {
    /// Chain the payout must land on.
    pub target_chain: ChainId,
    /// Payout token contract on the target chain.
    pub target_token: Address,
    /// Payout token symbol.
    pub target_symbol: String,
    /// Payout recipient.
    pub target_address: Address,
    /// Exact raw payout value, safety code spliced in.
    pub target_amount: U256,
    /// Addresses permitted to fulfill; contains the deposit receiver.
    pub response_maker: Vec<Address>,
    /// Rule the amounts were derived from.
    pub rule_id: String,
    /// Resolved event-binding contract; zero for the V1 dialect.
    pub ebc_address: Address,
    /// Resolved dealer; zero for the V1 dialect.
    pub dealer_address: Address,
    /// Flat fee withheld from the deposit.
    pub withholding_fee: U256,
    /// Proportional fee taken from the traded amount.
    pub trade_fee: U256,
}

/// Evaluates deposits into payout obligations.
#[derive(Debug, Clone)]
pub struct RuleEvaluator {
    graph: Arc<dyn RuleGraph>,
    rules: Arc<RuleBook>,
    tokens: Arc<TokenRegistry>,
}

impl RuleEvaluator {
    /// Creates a new evaluator over a rule snapshot.
    pub fn new(graph: Arc<dyn RuleGraph>, rules: Arc<RuleBook>, tokens: Arc<TokenRegistry>) -> Self {
        Self { graph, rules, tokens }
    }

    /// Derives the payout obligation for a deposit, dispatching on dialect.
    #[instrument(skip_all, fields(hash = %transfer.hash, chain = transfer.chain_id))]
    pub async fn evaluate(&self, transfer: &Transfer) -> Result<Obligation, RuleError> {
        match transfer.version {
            TransferVersion::V2Deposit => self.evaluate_security_code(transfer).await,
            TransferVersion::V1Deposit => self.evaluate_swap_data(transfer).await,
            _ => Err(RuleError::NotADeposit(transfer.hash)),
        }
    }

    async fn evaluate_security_code(&self, transfer: &Transfer) -> Result<Obligation, RuleError> {
        if transfer.nonce > MAX_SAFETY_NONCE {
            return Err(RuleError::SecurityCodeInvalid {
                hash: transfer.hash,
                nonce: transfer.nonce,
            });
        }

        let code = SecurityCode::decode(transfer.value);
        let owner = transfer.receiver;

        let dealer = self
            .graph
            .dealer(owner, transfer.timestamp, code.dealer_index)
            .await?
            .ok_or(RuleError::DealerNotFound(code.dealer_index))?;
        let ebc = self
            .graph
            .ebc(owner, transfer.timestamp, code.ebc_index)
            .await?
            .ok_or(RuleError::EbcNotFound(code.ebc_index))?;
        let target_chain = self
            .graph
            .chain_by_index(code.chain_index)
            .await?
            .ok_or(RuleError::ChainNotFound(code.chain_index))?;

        let target_token = self.counterpart(transfer, target_chain)?;
        let rule = self.find_rule(transfer, target_chain, &target_token.symbol)?;
        let derived =
            derive_amounts(transfer.value, U256::from(code.raw), transfer.nonce, rule)?;

        Ok(Obligation {
            target_chain,
            target_token: target_token.address,
            target_symbol: target_token.symbol.clone(),
            target_address: transfer.sender,
            target_amount: derived.response_amount,
            response_maker: response_makers(transfer.receiver, &rule.response_maker_list),
            rule_id: rule.id.clone(),
            ebc_address: ebc,
            dealer_address: dealer,
            withholding_fee: rule.withholding_fee,
            trade_fee: derived.trade_fee,
        })
    }

    async fn evaluate_swap_data(&self, transfer: &Transfer) -> Result<Obligation, RuleError> {
        if transfer.nonce > MAX_SAFETY_NONCE {
            return Err(RuleError::SecurityCodeInvalid {
                hash: transfer.hash,
                nonce: transfer.nonce,
            });
        }

        let input = transfer.input.as_ref().ok_or(RuleError::SwapDataInvalid)?;
        let swap = decode_swap_data(input)?;

        let target_token = self.counterpart(transfer, swap.target_chain)?;
        let rule = self.find_rule(transfer, swap.target_chain, &target_token.symbol)?;
        let derived = derive_amounts(transfer.value, U256::ZERO, transfer.nonce, rule)?;

        Ok(Obligation {
            target_chain: swap.target_chain,
            target_token: target_token.address,
            target_symbol: target_token.symbol.clone(),
            target_address: swap.target_address,
            target_amount: derived.response_amount,
            response_maker: response_makers(transfer.receiver, &rule.response_maker_list),
            rule_id: rule.id.clone(),
            ebc_address: Address::ZERO,
            dealer_address: Address::ZERO,
            withholding_fee: rule.withholding_fee,
            trade_fee: derived.trade_fee,
        })
    }

    fn counterpart(
        &self,
        transfer: &Transfer,
        target_chain: ChainId,
    ) -> Result<&TokenInfo, RuleError> {
        self.tokens
            .counterpart(transfer.chain_id, transfer.token, target_chain)
            .ok_or(RuleError::TokenNotFound {
                chain: transfer.chain_id,
                target_chain,
                token: transfer.token,
            })
    }

    fn find_rule(
        &self,
        transfer: &Transfer,
        target_chain: ChainId,
        target_symbol: &str,
    ) -> Result<&MakerRule, RuleError> {
        self.rules
            .find(transfer.chain_id, target_chain, &transfer.symbol, target_symbol)
            .ok_or_else(|| RuleError::RuleNotFound {
                source_chain: transfer.chain_id,
                target_chain,
                source_symbol: transfer.symbol.clone(),
                target_symbol: target_symbol.to_string(),
            })
    }
}

/// The deposit receiver joined with the rule's extra makers, deduplicated.
fn response_makers(receiver: Address, extra: &[Address]) -> Vec<Address> {
    let mut makers = vec![receiver];
    for maker in extra {
        if !makers.contains(maker) {
            makers.push(*maker);
        }
    }
    makers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransferStatus;
    use alloy::primitives::{address, b256};
    use chrono::Utc;
    use std::collections::HashMap;

    fn registry() -> TokenRegistry {
        let weth = address!("c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");
        let mut tokens = HashMap::new();
        for chain in [1u64, 10] {
            tokens.insert(
                chain,
                vec![TokenInfo {
                    address: Address::ZERO,
                    symbol: "ETH".into(),
                    decimals: 18,
                    mainnet_token: weth,
                }],
            );
        }
        TokenRegistry::new(tokens)
    }

    fn graph() -> StaticRuleGraph {
        StaticRuleGraph {
            dealers: (0..10).map(|_| address!("00000000000000000000000000000000000000d1")).collect(),
            ebcs: (0..10).map(|_| address!("00000000000000000000000000000000000000eb")).collect(),
            chain_index: {
                let mut chains = vec![0; 13];
                chains[12] = 10;
                chains
            },
        }
    }

    fn rules() -> RuleBook {
        let mut book = RuleBook::default();
        book.merge_document(
            serde_json::from_str(
                r#"{
                    "1-10": {
                        "ETH-ETH": {
                            "tradeFee": "30",
                            "withholdingFee": "5000000000000",
                            "maxPrice": "2000000000000000000",
                            "responseMakers": {
                                "response_maker_list": [
                                    "0x80c67432656d59144ceff962e8faf8926599bcf8"
                                ]
                            }
                        }
                    }
                }"#,
            )
            .unwrap(),
        )
        .unwrap();
        book
    }

    fn evaluator() -> RuleEvaluator {
        RuleEvaluator::new(Arc::new(graph()), Arc::new(rules()), Arc::new(registry()))
    }

    fn deposit() -> Transfer {
        Transfer {
            hash: b256!("00000000000000000000000000000000000000000000000000000000000000aa"),
            chain_id: 1,
            sender: address!("1111111111111111111111111111111111111111"),
            receiver: address!("80c67432656d59144ceff962e8faf8926599bcf8"),
            token: Address::ZERO,
            symbol: "ETH".into(),
            amount: "1.0".into(),
            value: U256::from(1_000_000_000_000_009_912u64),
            nonce: 12,
            timestamp: Utc::now(),
            fee_amount: None,
            fee_token: None,
            input: None,
            version: TransferVersion::V2Deposit,
            status: TransferStatus::Success,
            op_status: 0,
        }
    }

    #[tokio::test]
    async fn derives_target_side_from_security_code() {
        let obligation = evaluator().evaluate(&deposit()).await.unwrap();

        assert_eq!(obligation.target_chain, 10);
        assert_eq!(obligation.target_address, deposit().sender);
        assert_eq!(obligation.target_amount % U256::from(10_000u64), U256::from(12u64));
        assert!(obligation.response_maker.contains(&deposit().receiver));
        assert_eq!(obligation.response_maker.len(), 1);
        assert_eq!(obligation.rule_id, "1-10:ETH-ETH");
    }

    #[tokio::test]
    async fn rejects_wide_nonce() {
        let mut transfer = deposit();
        transfer.nonce = 10_000;
        let err = evaluator().evaluate(&transfer).await.unwrap_err();
        assert!(matches!(err, RuleError::SecurityCodeInvalid { nonce: 10_000, .. }));
    }

    #[tokio::test]
    async fn unknown_chain_index_fails() {
        let mut transfer = deposit();
        // Trailing digits 99 select a chain slot that is not configured.
        transfer.value = U256::from(1_000_000_000_000_009_999u64);
        let err = evaluator().evaluate(&transfer).await.unwrap_err();
        assert!(matches!(err, RuleError::ChainNotFound(99)));
    }

    #[tokio::test]
    async fn swap_data_dialect_routes_by_calldata() {
        let mut transfer = deposit();
        transfer.version = TransferVersion::V1Deposit;
        transfer.value = U256::from(1_000_000_000_000_000_000u64);
        transfer.input = Some(
            format!("c=10&t={}", address!("2222222222222222222222222222222222222222"))
                .into_bytes()
                .into(),
        );

        let obligation = evaluator().evaluate(&transfer).await.unwrap();
        assert_eq!(obligation.target_chain, 10);
        assert_eq!(
            obligation.target_address,
            address!("2222222222222222222222222222222222222222")
        );
        assert_eq!(obligation.dealer_address, Address::ZERO);
        assert_eq!(obligation.target_amount % U256::from(10_000u64), U256::from(12u64));
    }
}
