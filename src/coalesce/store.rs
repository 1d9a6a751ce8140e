//! Load-or-reuse collection store.
//!
//! A `CoalescingStore` owns one keyed collection (pools, user balances, ...)
//! loaded from a `CollectionSource`. Loads for the same owner key are
//! coalesced, results younger than the configured TTL are reused, and large
//! results are merged into the visible collection chunk by chunk with a
//! yield point in between. Subscribers observe every intermediate state
//! through a `watch` channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::coalesce::FetchCoalescer;
use crate::config::StoreConfig;
use crate::error::FetchError;

/// Ordered collection keyed by entity id.
pub type Collection<V> = IndexMap<String, V>;

/// Upstream loader for one collection.
#[async_trait]
pub trait CollectionSource<V>: Send + Sync {
    async fn load(&self, owner: &str) -> Result<Collection<V>, FetchError>;
}

/// Published state of a store.
#[derive(Debug, Clone)]
pub struct StoreSnapshot<V> {
    /// Key the collection currently belongs to.
    pub owner: Option<String>,
    pub items: Arc<Collection<V>>,
    pub loading: bool,
    /// Last load failure for `owner`, cleared by the next success.
    pub error: Option<FetchError>,
    pub last_fetched: Option<Instant>,
}

impl<V> Default for StoreSnapshot<V> {
    fn default() -> Self {
        Self {
            owner: None,
            items: Arc::new(IndexMap::new()),
            loading: false,
            error: None,
            last_fetched: None,
        }
    }
}

/// Hand `incoming` to `apply` `chunk_size` entries at a time, in order.
///
/// `apply` returns `false` to abandon the merge. Yields to the scheduler
/// between chunks. Returns whether the merge ran to completion.
pub async fn merge_in_chunks<V, F>(incoming: &Collection<V>, chunk_size: usize, mut apply: F) -> bool
where
    F: FnMut(&[(&String, &V)]) -> bool,
{
    let entries: Vec<(&String, &V)> = incoming.iter().collect();
    for chunk in entries.chunks(chunk_size.max(1)) {
        if !apply(chunk) {
            return false;
        }
        tokio::task::yield_now().await;
    }
    true
}

/// Insert a chunk into a published collection, copying it only when a
/// reader still holds the previous version.
pub fn insert_chunk<V: Clone>(target: &mut Arc<Collection<V>>, chunk: &[(&String, &V)]) {
    let target = Arc::make_mut(target);
    for (key, value) in chunk {
        target.insert((*key).clone(), (*value).clone());
    }
}

struct StoreInner<V> {
    name: String,
    config: StoreConfig,
    source: Arc<dyn CollectionSource<V>>,
    state: watch::Sender<StoreSnapshot<V>>,
    /// Bumped on every owner switch or clear; loads from older generations
    /// are discarded when they land.
    generation: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> StoreInner<V> {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Publish `f` only if `generation` is still current.
    fn publish_if_current<F>(&self, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut StoreSnapshot<V>),
    {
        self.state.send_if_modified(|snapshot| {
            if !self.is_current(generation) {
                return false;
            }
            f(snapshot);
            true
        })
    }

    async fn load(
        &self,
        owner: &str,
        generation: u64,
    ) -> Result<Arc<Collection<V>>, FetchError> {
        let fetched = match self.source.load(owner).await {
            Ok(items) => items,
            Err(e) => {
                warn!(store = %self.name, owner = %owner, error = %e, "Load failed; keeping previous data");
                self.publish_if_current(generation, |s| {
                    s.loading = false;
                    s.error = Some(e.clone());
                });
                return Err(e);
            }
        };

        let completed = merge_in_chunks(&fetched, self.config.chunk_size, |chunk| {
            self.publish_if_current(generation, |s| insert_chunk(&mut s.items, chunk))
        })
        .await;

        let fetched = Arc::new(fetched);
        if !completed || !self.is_current(generation) {
            debug!(store = %self.name, owner = %owner, "Discarding load for stale owner");
            return Ok(fetched);
        }

        let items = Arc::clone(&fetched);
        self.publish_if_current(generation, |s| {
            s.items = items;
            s.loading = false;
            s.error = None;
            s.last_fetched = Some(Instant::now());
        });
        debug!(store = %self.name, owner = %owner, count = fetched.len(), "Collection loaded");
        Ok(fetched)
    }
}

/// Fetch-coalescing, TTL-gated collection store.
pub struct CoalescingStore<V> {
    inner: Arc<StoreInner<V>>,
    coalescer: FetchCoalescer<(String, u64), Arc<Collection<V>>>,
}

impl<V: Clone + Send + Sync + 'static> CoalescingStore<V> {
    pub fn new(
        name: impl Into<String>,
        config: StoreConfig,
        source: Arc<dyn CollectionSource<V>>,
    ) -> Self {
        let (state, _rx) = watch::channel(StoreSnapshot::default());
        Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                config,
                source,
                state,
                generation: AtomicU64::new(0),
            }),
            coalescer: FetchCoalescer::new(),
        }
    }

    /// Load the collection for `owner`, reusing fresh data and joining any
    /// load already in flight for the same owner.
    ///
    /// Switching to a different owner clears the visible collection before
    /// the new load starts. Failures are returned and also recorded in the
    /// snapshot's `error` field; the previous collection is kept.
    pub async fn initialize(
        &self,
        owner: &str,
        force_refresh: bool,
    ) -> Result<Arc<Collection<V>>, FetchError> {
        let generation = self.switch_owner(owner);

        if !force_refresh && let Some(items) = self.fresh_items(owner) {
            debug!(store = %self.inner.name, owner = %owner, "Serving cached collection");
            return Ok(items);
        }

        self.inner.publish_if_current(generation, |s| s.loading = true);

        let inner = Arc::clone(&self.inner);
        let owner_key = owner.to_string();
        self.coalescer
            .run((owner.to_string(), generation), move || async move {
                inner.load(&owner_key, generation).await
            })
            .await
    }

    /// Reload the current owner's collection, bypassing the TTL.
    pub async fn refresh(&self) -> Result<Arc<Collection<V>>, FetchError> {
        match self.owner() {
            Some(owner) => self.initialize(&owner, true).await,
            None => Ok(Arc::new(IndexMap::new())),
        }
    }

    /// Drop the collection and forget the owner.
    pub fn clear(&self) {
        self.inner.state.send_modify(|s| {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            *s = StoreSnapshot::default();
        });
    }

    pub fn snapshot(&self) -> StoreSnapshot<V> {
        self.inner.state.borrow().clone()
    }

    pub fn owner(&self) -> Option<String> {
        self.inner.state.borrow().owner.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot<V>> {
        self.inner.state.subscribe()
    }

    /// Snapshot stream for consumers that prefer `Stream` over `watch`.
    pub fn updates(&self) -> WatchStream<StoreSnapshot<V>> {
        WatchStream::new(self.subscribe())
    }

    /// Reset the collection when `owner` differs from the current one.
    /// Returns the generation the caller's load belongs to.
    fn switch_owner(&self, owner: &str) -> u64 {
        // Generation changes only under the watch lock, so reading it there
        // pairs it with `owner`.
        let mut generation = 0;
        self.inner.state.send_if_modified(|s| {
            generation = self.inner.generation.load(Ordering::SeqCst);
            if s.owner.as_deref() == Some(owner) {
                return false;
            }
            generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!(store = %self.inner.name, owner = %owner, generation, "Owner changed; clearing collection");
            *s = StoreSnapshot {
                owner: Some(owner.to_string()),
                ..StoreSnapshot::default()
            };
            true
        });
        generation
    }

    fn fresh_items(&self, owner: &str) -> Option<Arc<Collection<V>>> {
        let s = self.inner.state.borrow();
        let fetched = s.last_fetched?;
        let fresh = s.owner.as_deref() == Some(owner)
            && s.error.is_none()
            && fetched.elapsed() < self.inner.config.ttl;
        fresh.then(|| Arc::clone(&s.items))
    }
}
