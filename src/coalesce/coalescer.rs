//! Single-flight fetch deduplication.
//!
//! At most one fetch per key is outstanding. Callers that arrive while it is
//! running await the same shared future; the entry is removed from the
//! in-flight map as soon as the fetch resolves.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::FetchError;

type SharedFetch<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// Deduplicates concurrent fetches that share a key.
pub struct FetchCoalescer<K, V, E = FetchError> {
    in_flight: Arc<Mutex<HashMap<K, SharedFetch<V, E>>>>,
    started: AtomicU64,
}

impl<K, V, E> FetchCoalescer<K, V, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicU64::new(0),
        }
    }

    /// Run `fetch` for `key`, or join the fetch already running for it.
    ///
    /// `fetch` is only invoked when no fetch for `key` is in flight.
    pub async fn run<F, Fut>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let shared = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(key = ?key, "Joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    self.started.fetch_add(1, Ordering::Relaxed);
                    let registry = Arc::clone(&self.in_flight);
                    let cleanup_key = key.clone();
                    let upstream = fetch();
                    let shared = async move {
                        let result = upstream.await;
                        registry.lock().await.remove(&cleanup_key);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, shared.clone());
                    shared
                }
            }
        };

        shared.await
    }

    /// Whether a fetch for `key` is currently running.
    pub async fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.lock().await.contains_key(key)
    }

    /// Number of keys with a running fetch.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Total upstream fetches started since creation.
    pub fn fetches_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

impl<K, V, E> Default for FetchCoalescer<K, V, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_fetch() {
        let coalescer: Arc<FetchCoalescer<String, u32>> = Arc::new(FetchCoalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..8).map(|_| {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            async move {
                coalescer
                    .run("alice".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }
        });

        let results = join_all(callers).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Ok(42)));
        assert_eq!(coalescer.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn entry_removed_after_resolution() {
        let coalescer: FetchCoalescer<&'static str, u32> = FetchCoalescer::new();
        coalescer.run("k", || async { Ok(1) }).await.unwrap();
        assert!(!coalescer.is_in_flight(&"k").await);

        // A later call starts a fresh fetch.
        let second = coalescer.run("k", || async { Ok(2) }).await.unwrap();
        assert_eq!(second, 2);
        assert_eq!(coalescer.fetches_started(), 2);
    }

    #[tokio::test]
    async fn failure_is_shared_and_not_cached() {
        let coalescer: FetchCoalescer<&'static str, u32> = FetchCoalescer::new();
        let err = coalescer
            .run("k", || async { Err(FetchError::upstream("pools", "boom")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        let ok = coalescer.run("k", || async { Ok(7) }).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_fetch_independently() {
        let coalescer: Arc<FetchCoalescer<u8, u8>> = Arc::new(FetchCoalescer::new());
        let (a, b) = tokio::join!(
            coalescer.run(1, || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(1)
            }),
            coalescer.run(2, || async { Ok(2) }),
        );
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!(coalescer.fetches_started(), 2);
    }
}
