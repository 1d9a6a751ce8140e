//! Two-tier cache for immutable remote assets.
//!
//! Lookups go memory → durable → network. A memory entry is authoritative
//! once created; the durable tier is only read on a memory miss. Entries
//! older than the TTL count as absent and are deleted on the read that
//! notices them. Network failures degrade to the original url.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use indexmap::IndexSet;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::assets::clock::Clock;
use crate::assets::durable::{AssetRecord, DurableStore};
use crate::assets::fetcher::AssetFetcher;
use crate::coalesce::FetchCoalescer;
use crate::config::AssetCacheConfig;
use crate::error::CacheError;

/// In-process handle to cached asset bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHandle {
    pub url: String,
    pub bytes: Arc<[u8]>,
}

impl AssetHandle {
    fn new(url: &str, bytes: Vec<u8>) -> Self {
        Self {
            url: url.to_string(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Where the caller should read the asset from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    Cached(AssetHandle),
    /// Caching failed; use the original url.
    Remote(String),
}

impl AssetSource {
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Cached(handle) => &handle.url,
            Self::Remote(url) => url,
        }
    }
}

/// Outcome of `preload_assets`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadReport {
    /// Distinct urls requested.
    pub requested: usize,
    pub already_cached: usize,
    pub fetched: usize,
    pub failed: Vec<String>,
}

struct MemoryEntry {
    handle: AssetHandle,
    inserted_at: i64,
}

struct CacheInner {
    ttl_millis: i64,
    durable: Arc<dyn DurableStore>,
    fetcher: Arc<dyn AssetFetcher>,
    clock: Arc<dyn Clock>,
    memory: RwLock<HashMap<String, MemoryEntry>>,
}

impl CacheInner {
    fn is_expired(&self, inserted_at: i64, now: i64) -> bool {
        now.saturating_sub(inserted_at) > self.ttl_millis
    }

    async fn memory_hit(&self, url: &str) -> Option<AssetHandle> {
        let now = self.clock.now_millis();
        {
            let memory = self.memory.read().await;
            match memory.get(url) {
                Some(entry) if !self.is_expired(entry.inserted_at, now) => return Some(entry.handle.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        debug!(url = %url, "Evicting expired memory entry");
        self.memory.write().await.remove(url);
        None
    }

    /// Fresh durable record for `url`. Expired records are deleted.
    async fn durable_hit(&self, url: &str) -> Result<Option<AssetRecord>, CacheError> {
        let Some(record) = self.durable.get(url).await? else {
            return Ok(None);
        };
        if !self.is_expired(record.timestamp, self.clock.now_millis()) {
            return Ok(Some(record));
        }
        debug!(url = %url, "Evicting expired durable entry");
        if let Err(e) = self.durable.delete(url).await {
            warn!(url = %url, error = %e, "Failed to delete expired asset");
        }
        Ok(None)
    }

    async fn remember(&self, url: &str, handle: &AssetHandle, inserted_at: i64) {
        self.memory.write().await.insert(
            url.to_string(),
            MemoryEntry {
                handle: handle.clone(),
                inserted_at,
            },
        );
    }

    /// Durable tier, then network. Populates both tiers.
    async fn load(&self, url: &str) -> Result<AssetHandle, CacheError> {
        match self.durable_hit(url).await {
            Ok(Some(record)) => {
                let handle = AssetHandle::new(url, record.blob);
                self.remember(url, &handle, record.timestamp).await;
                debug!(url = %url, "Asset served from durable tier");
                return Ok(handle);
            }
            Ok(None) => {}
            Err(e) => warn!(url = %url, error = %e, "Durable lookup failed; fetching from network"),
        }

        let bytes = self.fetcher.fetch(url).await?;
        let now = self.clock.now_millis();
        let record = AssetRecord {
            id: url.to_string(),
            blob: bytes,
            timestamp: now,
        };
        if let Err(e) = self.durable.put(&record).await {
            warn!(url = %url, error = %e, "Failed to persist asset");
        }
        let handle = AssetHandle::new(url, record.blob);
        self.remember(url, &handle, now).await;
        debug!(url = %url, bytes = handle.len(), "Asset fetched");
        Ok(handle)
    }
}

/// Memory + durable asset cache.
pub struct AssetCache {
    inner: Arc<CacheInner>,
    coalescer: FetchCoalescer<String, AssetHandle, String>,
}

impl AssetCache {
    pub fn new(
        config: &AssetCacheConfig,
        durable: Arc<dyn DurableStore>,
        fetcher: Arc<dyn AssetFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                ttl_millis: config.ttl.as_millis() as i64,
                durable,
                fetcher,
                clock,
                memory: RwLock::new(HashMap::new()),
            }),
            coalescer: FetchCoalescer::new(),
        }
    }

    /// Cached handle for `url`, or the url itself when it cannot be cached.
    pub async fn get_asset(&self, url: &str) -> AssetSource {
        if let Some(handle) = self.inner.memory_hit(url).await {
            return AssetSource::Cached(handle);
        }
        match self.load(url).await {
            Ok(handle) => AssetSource::Cached(handle),
            Err(reason) => {
                warn!(url = %url, reason = %reason, "Asset unavailable; using original url");
                AssetSource::Remote(url.to_string())
            }
        }
    }

    /// Fetch every url not already fresh in the durable tier, in parallel.
    /// One failure never aborts the rest.
    pub async fn preload_assets(&self, urls: &[String]) -> PreloadReport {
        let unique: IndexSet<&str> = urls.iter().map(String::as_str).collect();
        let mut report = PreloadReport {
            requested: unique.len(),
            ..PreloadReport::default()
        };

        let mut missing = Vec::new();
        for url in unique {
            match self.inner.durable_hit(url).await {
                Ok(Some(_)) => report.already_cached += 1,
                Ok(None) => missing.push(url),
                Err(e) => {
                    warn!(url = %url, error = %e, "Durable lookup failed during preload");
                    missing.push(url);
                }
            }
        }

        let results = join_all(missing.iter().map(|url| self.load(url))).await;
        for (url, result) in missing.into_iter().zip(results) {
            match result {
                Ok(_) => report.fetched += 1,
                Err(reason) => {
                    warn!(url = %url, reason = %reason, "Preload failed");
                    report.failed.push(url.to_string());
                }
            }
        }

        info!(
            requested = report.requested,
            cached = report.already_cached,
            fetched = report.fetched,
            failed = report.failed.len(),
            "Asset preload finished"
        );
        report
    }

    /// True only if every url is fresh in at least one tier.
    pub async fn are_assets_cached(&self, urls: &[String]) -> bool {
        for url in urls {
            if self.inner.memory_hit(url).await.is_some() {
                continue;
            }
            match self.inner.durable_hit(url).await {
                Ok(Some(_)) => continue,
                Ok(None) => return false,
                Err(e) => {
                    warn!(url = %url, error = %e, "Durable lookup failed");
                    return false;
                }
            }
        }
        true
    }

    /// Drop in-process handles and empty the durable tier.
    pub async fn clear_cache(&self) -> Result<(), CacheError> {
        self.inner.memory.write().await.clear();
        self.inner.durable.clear().await?;
        info!("Asset cache cleared");
        Ok(())
    }

    pub async fn memory_len(&self) -> usize {
        self.inner.memory.read().await.len()
    }

    async fn load(&self, url: &str) -> Result<AssetHandle, String> {
        let inner = Arc::clone(&self.inner);
        let key = url.to_string();
        self.coalescer
            .run(key.clone(), move || async move { inner.load(&key).await.map_err(|e| e.to_string()) })
            .await
    }
}
