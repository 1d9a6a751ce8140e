//! Pool listing store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::api::ExchangeApi;
use crate::coalesce::{CoalescingStore, Collection, CollectionSource, StoreSnapshot};
use crate::config::StoreConfig;
use crate::error::FetchError;
use crate::model::Pool;

/// The pool listing is global, so it lives under a single owner key.
pub const POOLS_OWNER: &str = "all";

struct PoolSource {
    api: Arc<dyn ExchangeApi>,
}

#[async_trait]
impl CollectionSource<Pool> for PoolSource {
    async fn load(&self, _owner: &str) -> Result<Collection<Pool>, FetchError> {
        Ok(self.api.fetch_pools().await?.into_collection())
    }
}

/// Coalesced, TTL-gated pool listing.
pub struct PoolStore {
    store: CoalescingStore<Pool>,
}

impl PoolStore {
    pub fn new(api: Arc<dyn ExchangeApi>, config: StoreConfig) -> Self {
        Self {
            store: CoalescingStore::new("pools", config, Arc::new(PoolSource { api })),
        }
    }

    pub async fn load_pools(&self, force_refresh: bool) -> Result<Arc<Collection<Pool>>, FetchError> {
        self.store.initialize(POOLS_OWNER, force_refresh).await
    }

    pub async fn refresh(&self) -> Result<Arc<Collection<Pool>>, FetchError> {
        self.load_pools(true).await
    }

    pub fn pools(&self) -> Vec<Pool> {
        self.store.snapshot().items.values().cloned().collect()
    }

    pub fn pool(&self, id: &str) -> Option<Pool> {
        self.store.snapshot().items.get(id).cloned()
    }

    pub fn snapshot(&self) -> StoreSnapshot<Pool> {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot<Pool>> {
        self.store.subscribe()
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::model::{Balances, PoolsPage, Token};

    #[derive(Default)]
    struct CountingApi {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeApi for CountingApi {
        async fn fetch_balances(&self, _: &[Token], _: &str, _: bool) -> Result<Balances, FetchError> {
            Ok(Balances::new())
        }

        async fn fetch_pools(&self) -> Result<PoolsPage, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PoolsPage {
                pools: (0..=n)
                    .map(|i| Pool {
                        id: format!("pool-{i}"),
                        token0: "icp".into(),
                        token1: "ckbtc".into(),
                        fee: 30,
                        tvl_usd: None,
                    })
                    .collect(),
            })
        }

        async fn fetch_tokens_by_canister_id(&self, _: &[String]) -> Result<Vec<Token>, FetchError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_bypasses_ttl() {
        let api = Arc::new(CountingApi::default());
        let store = PoolStore::new(api.clone(), StoreConfig::default());

        assert_eq!(store.load_pools(false).await.unwrap().len(), 1);
        assert_eq!(store.load_pools(false).await.unwrap().len(), 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        assert_eq!(store.refresh().await.unwrap().len(), 2);
        assert_eq!(store.pools().len(), 2);
        assert!(store.pool("pool-1").is_some());
    }
}
