//! Application root: owns the dispatcher, the host-side stores, and the
//! asset cache, and wires worker notifications back into the stores.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::ExchangeApi;
use crate::assets::{AssetCache, AssetFetcher, Clock, DurableStore, SystemClock};
use crate::config::SyncConfig;
use crate::dispatcher::{
    InProcessSpawner, Lifecycle, RemoteExchangeApi, TaskDispatcher, WorkerNotification,
};
use crate::error::DispatchError;
use crate::scheduler::domains::{BALANCES, POOLS, PRICES};
use crate::stores::{BalanceStore, PoolStore, TokenStore};
use crate::worker::SyncWorker;

pub const SYNC_WORKER_ID: &str = "sync";

/// Host-side stores, refreshed when the worker reports new data.
#[derive(Clone)]
struct HostStores {
    balances: Arc<BalanceStore>,
    pools: Arc<PoolStore>,
    tokens: Arc<TokenStore>,
}

impl HostStores {
    async fn apply(&self, note: &WorkerNotification) {
        let result = match note.domain.as_str() {
            BALANCES => match self.balances.last_request().await {
                Some(_) => self.balances.reload().await.map(|_| ()),
                None => Ok(()),
            },
            POOLS => match self.pools.snapshot().owner {
                Some(_) => self.pools.refresh().await.map(|_| ()),
                None => Ok(()),
            },
            PRICES => self.tokens.refresh_known().await.map(|_| ()),
            other => {
                debug!(domain = %other, "Notification for unknown domain");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(domain = %note.domain, error = %e, "Host store refresh failed");
        }
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    upstream: Arc<dyn ExchangeApi>,
    dispatcher: Arc<TaskDispatcher>,
    stores: HostStores,
    assets: Arc<AssetCache>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        upstream: Arc<dyn ExchangeApi>,
        asset_store: Arc<dyn DurableStore>,
        asset_fetcher: Arc<dyn AssetFetcher>,
    ) -> Self {
        Self::with_clock(config, upstream, asset_store, asset_fetcher, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SyncConfig,
        upstream: Arc<dyn ExchangeApi>,
        asset_store: Arc<dyn DurableStore>,
        asset_fetcher: Arc<dyn AssetFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dispatcher = Arc::new(TaskDispatcher::new(config.dispatcher.clone()));
        let remote: Arc<dyn ExchangeApi> = Arc::new(RemoteExchangeApi::new(Arc::clone(&dispatcher), SYNC_WORKER_ID));
        let stores = HostStores {
            balances: Arc::new(BalanceStore::new(Arc::clone(&remote), config.store.clone())),
            pools: Arc::new(PoolStore::new(Arc::clone(&remote), config.store.clone())),
            tokens: Arc::new(TokenStore::new(remote, config.store.clone())),
        };
        let assets = Arc::new(AssetCache::new(&config.assets, asset_store, asset_fetcher, clock));
        Self {
            config,
            upstream,
            dispatcher,
            stores,
            assets,
            listener: Mutex::new(None),
        }
    }

    /// Register the sync worker and start forwarding its notifications into
    /// the host stores. Idempotent.
    pub async fn start_sync_worker(&self) -> Result<(), DispatchError> {
        let worker = Arc::new(SyncWorker::new(Arc::clone(&self.upstream), self.config.clone()));
        let spawner = InProcessSpawner::from_entry(worker);
        self.dispatcher.register_worker(SYNC_WORKER_ID, &spawner).await?;

        let mut listener = self.listener.lock().await;
        if listener.is_none() {
            *listener = Some(self.spawn_listener());
        }
        Ok(())
    }

    fn spawn_listener(&self) -> JoinHandle<()> {
        let mut rx = self.dispatcher.subscribe();
        let stores = self.stores.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(note) => {
                        debug!(worker_id = %note.worker_id, domain = %note.domain, "Worker notification");
                        stores.apply(&note).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Notification listener lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    /// Host went to the background.
    pub async fn pause(&self) {
        self.dispatcher.broadcast_lifecycle(Lifecycle::Pause).await;
    }

    /// Host is in the foreground again.
    pub async fn resume(&self) {
        self.dispatcher.broadcast_lifecycle(Lifecycle::Resume).await;
    }

    /// Stop the listener and terminate every worker.
    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        self.dispatcher.terminate_all().await;
        info!("Sync engine shut down");
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn balances(&self) -> &Arc<BalanceStore> {
        &self.stores.balances
    }

    pub fn pools(&self) -> &Arc<PoolStore> {
        &self.stores.pools
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.stores.tokens
    }

    pub fn assets(&self) -> &Arc<AssetCache> {
        &self.assets
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkerNotification> {
        self.dispatcher.subscribe()
    }
}
