//! Per-owner token balances.
//!
//! Balances are cached per token with their own fetch time, so loading a
//! new token set never disturbs balances cached for other tokens. A failed
//! load returns an empty map from `load_balances` and records the error in
//! the published snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::ExchangeApi;
use crate::coalesce::{FetchCoalescer, insert_chunk, merge_in_chunks};
use crate::config::StoreConfig;
use crate::error::FetchError;
use crate::model::{BalanceAmount, Balances, Token, balance_key};

/// Published balance state for the current owner.
#[derive(Debug, Clone, Default)]
pub struct BalanceSnapshot {
    pub owner: Option<String>,
    pub balances: Arc<Balances>,
    pub loading: bool,
    pub error: Option<FetchError>,
    fetched_at: Arc<HashMap<String, Instant>>,
}

impl BalanceSnapshot {
    /// When the balance for `token_id` was last fetched.
    pub fn fetched_at(&self, token_id: &str) -> Option<Instant> {
        self.fetched_at.get(token_id).copied()
    }
}

struct BalanceInner {
    api: Arc<dyn ExchangeApi>,
    config: StoreConfig,
    state: watch::Sender<BalanceSnapshot>,
    generation: AtomicU64,
}

impl BalanceInner {
    fn publish_if_current<F>(&self, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut BalanceSnapshot),
    {
        self.state.send_if_modified(|s| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            f(s);
            true
        })
    }

    async fn fetch_and_merge(
        &self,
        tokens: Vec<Token>,
        owner: String,
        upstream_force: bool,
        generation: u64,
    ) -> Result<Balances, FetchError> {
        let fetched = match self.api.fetch_balances(&tokens, &owner, upstream_force).await {
            Ok(balances) => balances,
            Err(e) => {
                warn!(owner = %owner, tokens = tokens.len(), error = %e, "Balance fetch failed");
                self.publish_if_current(generation, |s| {
                    s.loading = false;
                    s.error = Some(e.clone());
                });
                return Err(e);
            }
        };

        // Chunks land in the live map so overlapping loads for other token
        // sets keep their entries.
        let now = Instant::now();
        let completed = merge_in_chunks(&fetched, self.config.chunk_size, |chunk| {
            self.publish_if_current(generation, |s| {
                insert_chunk(&mut s.balances, chunk);
                let fetched_at = Arc::make_mut(&mut s.fetched_at);
                for (token_id, _) in chunk {
                    fetched_at.insert((*token_id).clone(), now);
                }
            })
        })
        .await;

        let applied = completed
            && self.publish_if_current(generation, |s| {
                s.loading = false;
                s.error = None;
            });
        if !applied {
            debug!(owner = %owner, "Discarding balances for stale owner");
        }
        Ok(fetched)
    }
}

/// Coalescing, TTL-gated balance cache.
pub struct BalanceStore {
    inner: Arc<BalanceInner>,
    coalescer: FetchCoalescer<(String, u64), Balances>,
    last_request: Mutex<Option<(String, Vec<Token>)>>,
}

impl BalanceStore {
    pub fn new(api: Arc<dyn ExchangeApi>, config: StoreConfig) -> Self {
        let (state, _rx) = watch::channel(BalanceSnapshot::default());
        Self {
            inner: Arc::new(BalanceInner {
                api,
                config,
                state,
                generation: AtomicU64::new(0),
            }),
            coalescer: FetchCoalescer::new(),
            last_request: Mutex::new(None),
        }
    }

    /// Best-effort load: failures are logged, recorded in the snapshot, and
    /// yield an empty map.
    pub async fn load_balances(&self, tokens: &[Token], owner: &str, force_refresh: bool) -> Balances {
        self.try_load_balances(tokens, owner, force_refresh)
            .await
            .unwrap_or_default()
    }

    /// Load balances of `tokens` for `owner`.
    ///
    /// Served from cache when every requested token was fetched within the
    /// TTL, unless `force_refresh` is set.
    pub async fn try_load_balances(
        &self,
        tokens: &[Token],
        owner: &str,
        force_refresh: bool,
    ) -> Result<Balances, FetchError> {
        self.load(tokens, owner, force_refresh, force_refresh).await
    }

    /// Re-run the most recent request, bypassing the local TTL without
    /// asking upstream to skip its own cache.
    pub async fn reload(&self) -> Result<Balances, FetchError> {
        let last = self.last_request.lock().await.clone();
        match last {
            Some((owner, tokens)) => self.load(&tokens, &owner, true, false).await,
            None => Ok(Balances::new()),
        }
    }

    /// Owner and token set of the most recent request.
    pub async fn last_request(&self) -> Option<(String, Vec<Token>)> {
        self.last_request.lock().await.clone()
    }

    pub fn cached_balance(&self, token_id: &str) -> Option<BalanceAmount> {
        self.inner.state.borrow().balances.get(token_id).copied()
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BalanceSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn clear(&self) {
        self.inner.state.send_modify(|s| {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            *s = BalanceSnapshot::default();
        });
    }

    async fn load(
        &self,
        tokens: &[Token],
        owner: &str,
        bypass_ttl: bool,
        upstream_force: bool,
    ) -> Result<Balances, FetchError> {
        let generation = self.switch_owner(owner);
        *self.last_request.lock().await = Some((owner.to_string(), tokens.to_vec()));

        if tokens.is_empty() {
            return Ok(Balances::new());
        }
        if !bypass_ttl && let Some(cached) = self.fresh_subset(tokens) {
            debug!(owner = %owner, tokens = tokens.len(), "Serving cached balances");
            return Ok(cached);
        }

        self.inner.publish_if_current(generation, |s| s.loading = true);

        let inner = Arc::clone(&self.inner);
        let tokens = tokens.to_vec();
        let owner_key = owner.to_string();
        self.coalescer
            .run((balance_key(owner, &tokens), generation), move || async move {
                inner
                    .fetch_and_merge(tokens, owner_key, upstream_force, generation)
                    .await
            })
            .await
    }

    fn switch_owner(&self, owner: &str) -> u64 {
        let mut generation = 0;
        self.inner.state.send_if_modified(|s| {
            generation = self.inner.generation.load(Ordering::SeqCst);
            if s.owner.as_deref() == Some(owner) {
                return false;
            }
            generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!(owner = %owner, generation, "Balance owner changed; clearing cache");
            *s = BalanceSnapshot {
                owner: Some(owner.to_string()),
                ..BalanceSnapshot::default()
            };
            true
        });
        generation
    }

    fn fresh_subset(&self, tokens: &[Token]) -> Option<Balances> {
        let s = self.inner.state.borrow();
        let ttl = self.inner.config.ttl;
        let mut subset = Balances::new();
        for token in tokens {
            let id = &token.canister_id;
            let fresh = s.fetched_at(id).is_some_and(|at| at.elapsed() < ttl);
            let amount = s.balances.get(id)?;
            if !fresh {
                return None;
            }
            subset.insert(id.clone(), *amount);
        }
        Some(subset)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::future::join_all;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::model::PoolsPage;

    struct StubApi {
        calls: AtomicUsize,
        failing: HashSet<String>,
    }

    impl StubApi {
        fn new(failing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: failing.iter().map(|s| s.to_string()).collect(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExchangeApi for StubApi {
        async fn fetch_balances(
            &self,
            tokens: &[Token],
            owner: &str,
            _force_refresh: bool,
        ) -> Result<Balances, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if tokens.iter().any(|t| self.failing.contains(&t.canister_id)) {
                return Err(FetchError::upstream("balances", "ledger unavailable"));
            }
            Ok(tokens
                .iter()
                .map(|t| {
                    let raw = (owner.len() * 100 + t.decimals as usize) as u128;
                    (t.canister_id.clone(), BalanceAmount { amount_raw: raw, amount_usd: dec!(1.5) })
                })
                .collect())
        }

        async fn fetch_pools(&self) -> Result<PoolsPage, FetchError> {
            Ok(PoolsPage::default())
        }

        async fn fetch_tokens_by_canister_id(&self, _ids: &[String]) -> Result<Vec<Token>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn tokens(ids: &[&str]) -> Vec<Token> {
        ids.iter().map(|id| Token::new(*id, id.to_uppercase(), 8)).collect()
    }

    fn store(api: Arc<StubApi>) -> Arc<BalanceStore> {
        Arc::new(BalanceStore::new(api, StoreConfig { ttl: Duration::from_secs(30), chunk_size: 2 }))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_loads_share_one_upstream_call() {
        let api = StubApi::new(&[]);
        let store = store(Arc::clone(&api));
        let set = tokens(&["icp", "ckbtc", "cketh"]);

        let results = join_all((0..5).map(|_| {
            let store = Arc::clone(&store);
            let set = set.clone();
            async move { store.try_load_balances(&set, "alice", false).await }
        }))
        .await;

        assert_eq!(api.calls(), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap().len() == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn cached_until_ttl_expires() {
        let api = StubApi::new(&[]);
        let store = store(Arc::clone(&api));
        let set = tokens(&["icp"]);

        store.load_balances(&set, "alice", false).await;
        store.load_balances(&set, "alice", false).await;
        assert_eq!(api.calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        store.load_balances(&set, "alice", false).await;
        assert_eq!(api.calls(), 2);

        store.load_balances(&set, "alice", true).await;
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_returns_empty_and_keeps_other_tokens() {
        let api = StubApi::new(&["broken"]);
        let store = store(Arc::clone(&api));

        let ok = store.load_balances(&tokens(&["icp"]), "alice", false).await;
        assert_eq!(ok.len(), 1);

        let failed = store.load_balances(&tokens(&["broken"]), "alice", false).await;
        assert!(failed.is_empty());

        let snapshot = store.snapshot();
        assert!(snapshot.error.is_some());
        assert!(!snapshot.loading);
        assert!(store.cached_balance("icp").is_some());

        // Another token set's failure does not expire icp.
        let calls = api.calls();
        let again = store.load_balances(&tokens(&["icp"]), "alice", false).await;
        assert_eq!(again.len(), 1);
        assert_eq!(api.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_loads_keep_each_others_balances() {
        let api = StubApi::new(&[]);
        let store = store(Arc::clone(&api));
        let first = tokens(&["a", "b", "c"]);
        let second = tokens(&["d", "e", "f"]);

        let (x, y) = tokio::join!(
            store.try_load_balances(&first, "alice", false),
            store.try_load_balances(&second, "alice", false)
        );
        assert_eq!(x.unwrap().len(), 3);
        assert_eq!(y.unwrap().len(), 3);
        assert_eq!(api.calls(), 2);

        let snapshot = store.snapshot();
        for id in ["a", "b", "c", "d", "e", "f"] {
            assert!(store.cached_balance(id).is_some(), "balance for {id} lost");
            assert!(snapshot.fetched_at(id).is_some());
        }
        assert_eq!(snapshot.balances.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn owner_switch_drops_previous_balances() {
        let api = StubApi::new(&[]);
        let store = store(Arc::clone(&api));
        let set = tokens(&["icp", "ckbtc"]);

        let alice = store.load_balances(&set, "alice", false).await;
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        let loader = {
            let store = Arc::clone(&store);
            let set = set.clone();
            tokio::spawn(async move { store.load_balances(&set, "bob", false).await })
        };

        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            assert_eq!(snapshot.owner.as_deref(), Some("bob"));
            for (id, amount) in snapshot.balances.iter() {
                assert_ne!(Some(amount), alice.get(id), "alice's balance leaked for {id}");
            }
            if !snapshot.loading && snapshot.balances.len() == 2 {
                break;
            }
        }
        let bob = loader.await.unwrap();
        assert_eq!(bob.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_bypasses_ttl() {
        let api = StubApi::new(&[]);
        let store = store(Arc::clone(&api));
        assert!(store.reload().await.unwrap().is_empty());

        store.load_balances(&tokens(&["icp"]), "alice", false).await;
        store.reload().await.unwrap();
        assert_eq!(api.calls(), 2);
        assert_eq!(store.last_request().await.unwrap().0, "alice");
    }
}
