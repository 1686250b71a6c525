//! Rule configuration: maker documents, token registry, and the rule graph
//! seam towards the external configuration service.

use crate::error::RuleError;
use alloy::primitives::{Address, ChainId, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{eyre, Context};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt::Debug, path::Path, str::FromStr};

/// Key a flattened rule is looked up under.
pub type RuleKey = (ChainId, ChainId, String, String);

/// One directional settlement rule, flattened from the maker documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakerRule {
    /// Stable identifier, `<chains>:<symbols>` as written in the document.
    pub id: String,
    /// Chain deposits arrive on.
    pub source_chain: ChainId,
    /// Chain payouts leave on.
    pub target_chain: ChainId,
    /// Symbol of the deposited token.
    pub source_symbol: String,
    /// Symbol of the payout token.
    pub target_symbol: String,
    /// Proportional fee in basis points of the traded amount.
    pub trade_fee_bps: u64,
    /// Flat fee withheld from the deposit, raw units.
    pub withholding_fee: U256,
    /// Smallest payout the rule admits. Not enforced by policy.
    pub min_price: U256,
    /// Largest payout the rule admits.
    pub max_price: U256,
    /// Extra maker addresses allowed to fulfill, beyond the deposit receiver.
    pub response_maker_list: Vec<Address>,
}

/// Wire shape of one rule entry inside a maker document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawRule {
    trade_fee: String,
    withholding_fee: String,
    #[serde(default)]
    min_price: Option<String>,
    #[serde(default)]
    max_price: Option<String>,
    #[serde(default)]
    response_makers: RawResponseMakers,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawResponseMakers {
    #[serde(default)]
    response_maker_list: Vec<Address>,
}

/// Wire shape of a maker document:
/// `{"<chainA>-<chainB>": {"<symA>-<symB>": {..rule..}}}`.
pub(crate) type RawMakerDoc = HashMap<String, HashMap<String, RawRule>>;

/// The flattened union of all loaded maker documents.
#[derive(Debug, Default)]
pub struct RuleBook {
    rules: HashMap<RuleKey, MakerRule>,
}

impl RuleBook {
    /// Loads and flattens a set of maker documents. Later documents win on
    /// key collisions.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> eyre::Result<Self> {
        let mut book = Self::default();
        for path in paths {
            let text = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("reading {}", path.as_ref().display()))?;
            let doc: RawMakerDoc = serde_json::from_str(&text)
                .wrap_err_with(|| format!("parsing {}", path.as_ref().display()))?;
            book.merge_document(doc)?;
        }
        Ok(book)
    }

    /// Flattens one document into the book.
    ///
    /// Every `"<chainA>-<chainB>"`/`"<symA>-<symB>"` entry is directional:
    /// chain A is the deposit side. The fee side selection happens here,
    /// once, instead of at every evaluation.
    pub fn merge_document(&mut self, doc: RawMakerDoc) -> eyre::Result<()> {
        for (chains, by_symbol) in doc {
            let (source_chain, target_chain) = split_pair(&chains)
                .ok_or_else(|| eyre!("malformed chain pair key {chains:?}"))?;
            for (symbols, raw) in by_symbol {
                let (source_symbol, target_symbol) = symbols
                    .split_once('-')
                    .map(|(a, b)| (a.to_string(), b.to_string()))
                    .ok_or_else(|| eyre!("malformed symbol pair key {symbols:?}"))?;

                let rule = MakerRule {
                    id: format!("{chains}:{symbols}"),
                    source_chain,
                    target_chain,
                    source_symbol: source_symbol.clone(),
                    target_symbol: target_symbol.clone(),
                    trade_fee_bps: raw
                        .trade_fee
                        .parse()
                        .wrap_err_with(|| format!("tradeFee in {chains}:{symbols}"))?,
                    withholding_fee: parse_u256(&raw.withholding_fee)
                        .wrap_err_with(|| format!("withholdingFee in {chains}:{symbols}"))?,
                    min_price: raw
                        .min_price
                        .as_deref()
                        .map(parse_u256)
                        .transpose()?
                        .unwrap_or(U256::ZERO),
                    max_price: raw
                        .max_price
                        .as_deref()
                        .map(parse_u256)
                        .transpose()?
                        .unwrap_or(U256::MAX),
                    response_maker_list: raw.response_makers.response_maker_list,
                };
                self.rules.insert(
                    (source_chain, target_chain, source_symbol, target_symbol),
                    rule,
                );
            }
        }
        Ok(())
    }

    /// Looks up the rule for a directional chain/symbol pair.
    pub fn find(
        &self,
        source_chain: ChainId,
        target_chain: ChainId,
        source_symbol: &str,
        target_symbol: &str,
    ) -> Option<&MakerRule> {
        self.rules.get(&(
            source_chain,
            target_chain,
            source_symbol.to_string(),
            target_symbol.to_string(),
        ))
    }

    /// Number of flattened rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the book holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn split_pair(s: &str) -> Option<(ChainId, ChainId)> {
    let (a, b) = s.split_once('-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn parse_u256(s: &str) -> eyre::Result<U256> {
    U256::from_str(s).map_err(|e| eyre!("invalid integer {s:?}: {e}"))
}

/// A token known to the settlement engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Contract address, zero for the native asset.
    pub address: Address,
    /// Display symbol.
    pub symbol: String,
    /// Token decimals.
    pub decimals: u8,
    /// Canonical L1 token this one is pegged to; cross-chain counterparts
    /// share it.
    pub mainnet_token: Address,
}

/// Per-chain token registry.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TokenRegistry {
    tokens: HashMap<ChainId, Vec<TokenInfo>>,
}

impl TokenRegistry {
    /// Builds a registry from `(chain, token)` pairs.
    pub fn new(tokens: HashMap<ChainId, Vec<TokenInfo>>) -> Self {
        Self { tokens }
    }

    /// The token at `address` on `chain`.
    pub fn by_address(&self, chain: ChainId, address: Address) -> Option<&TokenInfo> {
        self.tokens.get(&chain)?.iter().find(|t| t.address == address)
    }

    /// The token on `target_chain` pegged to the same mainnet token.
    pub fn counterpart(
        &self,
        source_chain: ChainId,
        token: Address,
        target_chain: ChainId,
    ) -> Option<&TokenInfo> {
        let mainnet = self.by_address(source_chain, token)?.mainnet_token;
        self.tokens.get(&target_chain)?.iter().find(|t| t.mainnet_token == mainnet)
    }

    /// The token with `symbol` on `chain`.
    pub fn by_symbol(&self, chain: ChainId, symbol: &str) -> Option<&TokenInfo> {
        self.tokens.get(&chain)?.iter().find(|t| t.symbol == symbol)
    }
}

/// Seam towards the external rule/configuration graph: dealer and EBC
/// registries and the chain index table the security code points into.
#[async_trait]
pub trait RuleGraph: Debug + Send + Sync {
    /// Dealer registered under `index` for `owner` at `at`.
    async fn dealer(
        &self,
        owner: Address,
        at: DateTime<Utc>,
        index: usize,
    ) -> Result<Option<Address>, RuleError>;

    /// Event-binding contract registered under `index` for `owner` at `at`.
    async fn ebc(
        &self,
        owner: Address,
        at: DateTime<Utc>,
        index: usize,
    ) -> Result<Option<Address>, RuleError>;

    /// Chain id the two trailing security-code digits select.
    async fn chain_by_index(&self, index: usize) -> Result<Option<ChainId>, RuleError>;
}

/// A [`RuleGraph`] backed by static configuration tables. Time-keyed
/// lookups resolve against the single loaded snapshot.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StaticRuleGraph {
    /// Dealer addresses, indexed by security-code digit 0.
    pub dealers: Vec<Address>,
    /// EBC addresses, indexed by security-code digit 1.
    pub ebcs: Vec<Address>,
    /// Chain ids, indexed by security-code digits 2-3.
    pub chain_index: Vec<ChainId>,
}

#[async_trait]
impl RuleGraph for StaticRuleGraph {
    async fn dealer(
        &self,
        _owner: Address,
        _at: DateTime<Utc>,
        index: usize,
    ) -> Result<Option<Address>, RuleError> {
        Ok(self.dealers.get(index).copied())
    }

    async fn ebc(
        &self,
        _owner: Address,
        _at: DateTime<Utc>,
        index: usize,
    ) -> Result<Option<Address>, RuleError> {
        Ok(self.ebcs.get(index).copied())
    }

    async fn chain_by_index(&self, index: usize) -> Result<Option<ChainId>, RuleError> {
        Ok(self.chain_index.get(index).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn doc(json: &str) -> RawMakerDoc {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn flattens_directional_entries() {
        let mut book = RuleBook::default();
        book.merge_document(doc(
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
        ))
        .unwrap();

        let rule = book.find(1, 10, "ETH", "ETH").expect("rule present");
        assert_eq!(rule.trade_fee_bps, 30);
        assert_eq!(rule.withholding_fee, U256::from(5_000_000_000_000u64));
        assert_eq!(
            rule.response_maker_list,
            vec![address!("80c67432656d59144ceff962e8faf8926599bcf8")]
        );
        assert!(book.find(10, 1, "ETH", "ETH").is_none());
    }

    #[test]
    fn later_documents_override() {
        let mut book = RuleBook::default();
        let entry = |fee: &str| {
            doc(&format!(
                r#"{{"1-42161": {{"USDC-USDC": {{"tradeFee": "{fee}", "withholdingFee": "0"}}}}}}"#
            ))
        };
        book.merge_document(entry("10")).unwrap();
        book.merge_document(entry("25")).unwrap();
        assert_eq!(book.len(), 1);
        assert_eq!(book.find(1, 42161, "USDC", "USDC").unwrap().trade_fee_bps, 25);
    }

    #[test]
    fn registry_counterpart_by_mainnet_token() {
        let weth = address!("c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");
        let mut tokens = HashMap::new();
        tokens.insert(
            1,
            vec![TokenInfo {
                address: Address::ZERO,
                symbol: "ETH".into(),
                decimals: 18,
                mainnet_token: weth,
            }],
        );
        tokens.insert(
            10,
            vec![TokenInfo {
                address: address!("4200000000000000000000000000000000000006"),
                symbol: "ETH".into(),
                decimals: 18,
                mainnet_token: weth,
            }],
        );
        let registry = TokenRegistry::new(tokens);

        let counterpart = registry.counterpart(1, Address::ZERO, 10).expect("pegged pair");
        assert_eq!(counterpart.symbol, "ETH");
        assert!(registry.counterpart(1, Address::ZERO, 42161).is_none());
    }
}
