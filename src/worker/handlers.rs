//! Built-in fetch handlers served by the sync worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FetchError;
use crate::model::{PoolsPage, Token};
use crate::stores::{BalanceStore, PoolStore, TokenStore};
use crate::worker::handler::{HandlerRegistry, TaskHandler, decode_payload, encode_result};

pub const FETCH_BALANCES: &str = "fetch_balances";
pub const FETCH_POOLS: &str = "fetch_pools";
pub const FETCH_TOKENS: &str = "fetch_tokens";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchBalancesPayload {
    pub owner: String,
    pub tokens: Vec<Token>,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchPoolsPayload {
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchTokensPayload {
    pub ids: Vec<String>,
}

/// Balances through the worker's own coalescing store. The request is
/// remembered, so the balances domain keeps it fresh afterwards.
pub struct FetchBalancesHandler {
    store: Arc<BalanceStore>,
}

impl FetchBalancesHandler {
    pub fn new(store: Arc<BalanceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for FetchBalancesHandler {
    fn task_type(&self) -> &str {
        FETCH_BALANCES
    }

    async fn handle(&self, payload: Value) -> Result<Value, FetchError> {
        let req: FetchBalancesPayload = decode_payload(FETCH_BALANCES, payload)?;
        let balances = self
            .store
            .try_load_balances(&req.tokens, &req.owner, req.force_refresh)
            .await?;
        encode_result(FETCH_BALANCES, &balances)
    }
}

pub struct FetchPoolsHandler {
    store: Arc<PoolStore>,
}

impl FetchPoolsHandler {
    pub fn new(store: Arc<PoolStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for FetchPoolsHandler {
    fn task_type(&self) -> &str {
        FETCH_POOLS
    }

    async fn handle(&self, payload: Value) -> Result<Value, FetchError> {
        let req: FetchPoolsPayload = if payload.is_null() {
            FetchPoolsPayload::default()
        } else {
            decode_payload(FETCH_POOLS, payload)?
        };
        let pools = self.store.load_pools(req.force_refresh).await?;
        let page = PoolsPage {
            pools: pools.values().cloned().collect(),
        };
        encode_result(FETCH_POOLS, &page)
    }
}

/// Token metadata; ids looked up here are refreshed by the prices domain.
pub struct FetchTokensHandler {
    store: Arc<TokenStore>,
}

impl FetchTokensHandler {
    pub fn new(store: Arc<TokenStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for FetchTokensHandler {
    fn task_type(&self) -> &str {
        FETCH_TOKENS
    }

    async fn handle(&self, payload: Value) -> Result<Value, FetchError> {
        let req: FetchTokensPayload = decode_payload(FETCH_TOKENS, payload)?;
        let tokens = self.store.get_tokens(&req.ids).await?;
        encode_result(FETCH_TOKENS, &tokens)
    }
}

/// Registry with the three built-in handlers over the given stores.
pub fn builtin_registry(
    balances: Arc<BalanceStore>,
    pools: Arc<PoolStore>,
    tokens: Arc<TokenStore>,
) -> HandlerRegistry {
    HandlerRegistry::new([
        Arc::new(FetchBalancesHandler::new(balances)) as Arc<dyn TaskHandler>,
        Arc::new(FetchPoolsHandler::new(pools)),
        Arc::new(FetchTokensHandler::new(tokens)),
    ])
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::api::ExchangeApi;
    use crate::config::StoreConfig;
    use crate::model::{BalanceAmount, Balances, Pool};

    struct FixedApi;

    #[async_trait]
    impl ExchangeApi for FixedApi {
        async fn fetch_balances(&self, tokens: &[Token], _: &str, _: bool) -> Result<Balances, FetchError> {
            Ok(tokens
                .iter()
                .map(|t| (t.canister_id.clone(), BalanceAmount { amount_raw: 7, amount_usd: dec!(0.7) }))
                .collect())
        }

        async fn fetch_pools(&self) -> Result<PoolsPage, FetchError> {
            Ok(PoolsPage {
                pools: vec![Pool {
                    id: "icp-ckbtc".into(),
                    token0: "icp".into(),
                    token1: "ckbtc".into(),
                    fee: 30,
                    tvl_usd: None,
                }],
            })
        }

        async fn fetch_tokens_by_canister_id(&self, ids: &[String]) -> Result<Vec<Token>, FetchError> {
            Ok(ids.iter().map(|id| Token::new(id.clone(), id.to_uppercase(), 8)).collect())
        }
    }

    fn registry() -> HandlerRegistry {
        let api: Arc<dyn ExchangeApi> = Arc::new(FixedApi);
        let config = StoreConfig::default();
        builtin_registry(
            Arc::new(BalanceStore::new(Arc::clone(&api), config.clone())),
            Arc::new(PoolStore::new(Arc::clone(&api), config.clone())),
            Arc::new(TokenStore::new(api, config)),
        )
    }

    #[tokio::test]
    async fn balances_handler_returns_map() {
        let registry = registry();
        let handler = registry.get(FETCH_BALANCES).unwrap();
        let payload = serde_json::to_value(FetchBalancesPayload {
            owner: "alice".into(),
            tokens: vec![Token::new("icp", "ICP", 8)],
            force_refresh: false,
        })
        .unwrap();

        let result = handler.handle(payload).await.unwrap();
        assert_eq!(result["icp"]["amount_raw"], "7");
    }

    #[tokio::test]
    async fn pools_handler_accepts_null_payload() {
        let registry = registry();
        let handler = registry.get(FETCH_POOLS).unwrap();
        let page: PoolsPage = serde_json::from_value(handler.handle(Value::Null).await.unwrap()).unwrap();
        assert_eq!(page.pools.len(), 1);
    }

    #[tokio::test]
    async fn tokens_handler_rejects_malformed_payload() {
        let registry = registry();
        let handler = registry.get(FETCH_TOKENS).unwrap();
        let err = handler.handle(json!({"wrong": true})).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }
}
