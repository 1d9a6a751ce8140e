//! Exchange domain types shared by stores, workers, and the upstream API.

use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Token metadata as returned by the token registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub canister_id: String,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    #[serde(with = "amount_str")]
    pub fee: u128,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub price_usd: Option<Decimal>,
}

impl Token {
    pub fn new(canister_id: impl Into<String>, symbol: impl Into<String>, decimals: u8) -> Self {
        let symbol = symbol.into();
        Self {
            canister_id: canister_id.into(),
            name: symbol.clone(),
            symbol,
            decimals,
            fee: 0,
            logo_url: None,
            price_usd: None,
        }
    }
}

/// A liquidity pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub token0: String,
    pub token1: String,
    pub fee: u32,
    #[serde(default)]
    pub tvl_usd: Option<Decimal>,
}

/// Balance of one token for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceAmount {
    /// Amount in the token's smallest unit.
    #[serde(with = "amount_str")]
    pub amount_raw: u128,
    pub amount_usd: Decimal,
}

/// Balances keyed by token canister id, in request order.
pub type Balances = IndexMap<String, BalanceAmount>;

/// Response of the pool listing endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolsPage {
    pub pools: Vec<Pool>,
}

impl PoolsPage {
    /// Pools keyed by id, preserving upstream order.
    pub fn into_collection(self) -> IndexMap<String, Pool> {
        self.pools.into_iter().map(|p| (p.id.clone(), p)).collect()
    }
}

/// Raw token amounts travel as decimal strings; JSON numbers cannot hold
/// every `u128`.
mod amount_str {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(D::Error::custom),
            Raw::Number(n) => Ok(n as u128),
        }
    }
}

/// Canonical key for an owner plus an unordered token set.
pub fn balance_key(owner: &str, tokens: &[Token]) -> String {
    let mut ids: Vec<&str> = tokens.iter().map(|t| t.canister_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    format!("{owner}:{}", ids.join(","))
}
