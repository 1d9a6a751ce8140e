//! Token metadata and price store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::api::ExchangeApi;
use crate::coalesce::FetchCoalescer;
use crate::config::StoreConfig;
use crate::error::FetchError;
use crate::model::Token;

struct CachedToken {
    token: Token,
    fetched_at: Instant,
}

/// Caches token metadata per canister id.
///
/// Lookups for ids fetched within the TTL are served locally; the rest are
/// fetched in one coalesced upstream call keyed by the sorted id set.
pub struct TokenStore {
    api: Arc<dyn ExchangeApi>,
    config: StoreConfig,
    tokens: Arc<RwLock<HashMap<String, CachedToken>>>,
    coalescer: FetchCoalescer<String, Vec<Token>>,
}

impl TokenStore {
    pub fn new(api: Arc<dyn ExchangeApi>, config: StoreConfig) -> Self {
        Self {
            api,
            config,
            tokens: Arc::new(RwLock::new(HashMap::new())),
            coalescer: FetchCoalescer::new(),
        }
    }

    /// Metadata for `ids` in request order. Ids unknown upstream are omitted.
    pub async fn get_tokens(&self, ids: &[String]) -> Result<Vec<Token>, FetchError> {
        self.lookup(ids, false).await
    }

    /// Re-fetch `ids` regardless of cache age.
    pub async fn refresh(&self, ids: &[String]) -> Result<Vec<Token>, FetchError> {
        self.lookup(ids, true).await
    }

    /// Re-fetch every token seen so far.
    pub async fn refresh_known(&self) -> Result<Vec<Token>, FetchError> {
        let ids = self.known_ids().await;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.refresh(&ids).await
    }

    pub async fn token(&self, id: &str) -> Option<Token> {
        self.tokens.read().await.get(id).map(|c| c.token.clone())
    }

    /// USD prices of every cached token that has one.
    pub async fn prices(&self) -> IndexMap<String, Decimal> {
        let tokens = self.tokens.read().await;
        let mut prices: IndexMap<String, Decimal> = tokens
            .iter()
            .filter_map(|(id, c)| c.token.price_usd.map(|p| (id.clone(), p)))
            .collect();
        prices.sort_keys();
        prices
    }

    pub async fn known_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tokens.read().await.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn clear(&self) {
        self.tokens.write().await.clear();
    }

    async fn lookup(&self, ids: &[String], force: bool) -> Result<Vec<Token>, FetchError> {
        let missing: Vec<String> = {
            let tokens = self.tokens.read().await;
            let mut missing: Vec<String> = ids
                .iter()
                .filter(|id| {
                    force
                        || !tokens
                            .get(id.as_str())
                            .is_some_and(|c| c.fetched_at.elapsed() < self.config.ttl)
                })
                .cloned()
                .collect();
            missing.sort_unstable();
            missing.dedup();
            missing
        };

        if !missing.is_empty() {
            let api = Arc::clone(&self.api);
            let cache = Arc::clone(&self.tokens);
            let key = missing.join(",");
            debug!(count = missing.len(), "Fetching token metadata");
            self.coalescer
                .run(key, move || async move {
                    let fetched = api.fetch_tokens_by_canister_id(&missing).await?;
                    let now = Instant::now();
                    let mut tokens = cache.write().await;
                    for token in &fetched {
                        tokens.insert(
                            token.canister_id.clone(),
                            CachedToken { token: token.clone(), fetched_at: now },
                        );
                    }
                    Ok(fetched)
                })
                .await?;
        }

        let tokens = self.tokens.read().await;
        let mut seen = HashSet::new();
        Ok(ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| tokens.get(id.as_str()).map(|c| c.token.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::model::{Balances, PoolsPage};

    #[derive(Default)]
    struct RegistryApi {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeApi for RegistryApi {
        async fn fetch_balances(&self, _: &[Token], _: &str, _: bool) -> Result<Balances, FetchError> {
            Ok(Balances::new())
        }

        async fn fetch_pools(&self) -> Result<PoolsPage, FetchError> {
            Ok(PoolsPage::default())
        }

        async fn fetch_tokens_by_canister_id(&self, ids: &[String]) -> Result<Vec<Token>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(ids
                .iter()
                .filter(|id| id.as_str() != "unknown")
                .map(|id| {
                    let mut token = Token::new(id.clone(), id.to_uppercase(), 8);
                    token.price_usd = Some(dec!(2.5));
                    token
                })
                .collect())
        }
    }

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn only_missing_ids_are_fetched() {
        let api = Arc::new(RegistryApi::default());
        let store = TokenStore::new(api.clone(), StoreConfig::default());

        store.get_tokens(&ids(&["icp"])).await.unwrap();
        let tokens = store.get_tokens(&ids(&["ckbtc", "icp", "unknown"])).await.unwrap();

        let symbols: Vec<&str> = tokens.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["CKBTC", "ICP"]);
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);

        store.get_tokens(&ids(&["icp", "ckbtc"])).await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_lookups_coalesce() {
        let api = Arc::new(RegistryApi::default());
        let store = TokenStore::new(api.clone(), StoreConfig::default());
        let wanted = ids(&["icp", "ckbtc"]);

        let (a, b) = tokio::join!(store.get_tokens(&wanted), store.get_tokens(&wanted));
        assert_eq!(a.unwrap().len(), 2);
        assert_eq!(b.unwrap().len(), 2);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_known_refetches_and_reports_prices() {
        let api = Arc::new(RegistryApi::default());
        let store = TokenStore::new(api.clone(), StoreConfig::default());
        assert!(store.refresh_known().await.unwrap().is_empty());

        store.get_tokens(&ids(&["icp", "ckbtc"])).await.unwrap();
        store.refresh_known().await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);

        let prices = store.prices().await;
        assert_eq!(prices.keys().collect::<Vec<_>>(), vec!["ckbtc", "icp"]);
        assert_eq!(prices["icp"], dec!(2.5));
    }
}
