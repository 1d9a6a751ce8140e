//! The sync worker: an isolated execution context with its own stores and
//! scheduler, driven entirely by messages on its port.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::ExchangeApi;
use crate::config::SyncConfig;
use crate::dispatcher::channel::{WorkerEntry, WorkerPort};
use crate::dispatcher::message::{TaskId, WorkerRequest, WorkerResponse};
use crate::scheduler::{BalanceSync, PoolSync, PriceSync, SyncScheduler};
use crate::stores::{BalanceStore, PoolStore, TokenStore};
use crate::worker::handler::HandlerRegistry;
use crate::worker::handlers::builtin_registry;

pub struct SyncWorker {
    api: Arc<dyn ExchangeApi>,
    config: SyncConfig,
}

impl SyncWorker {
    pub fn new(api: Arc<dyn ExchangeApi>, config: SyncConfig) -> Self {
        Self { api, config }
    }
}

/// State owned by one run of the worker.
struct WorkerContext {
    registry: Arc<HandlerRegistry>,
    scheduler: SyncScheduler,
    balances: Arc<BalanceStore>,
    pools: Arc<PoolStore>,
    tokens: Arc<TokenStore>,
    started: bool,
}

impl WorkerContext {
    fn new(api: &Arc<dyn ExchangeApi>, config: &SyncConfig) -> Self {
        let balances = Arc::new(BalanceStore::new(Arc::clone(api), config.store.clone()));
        let pools = Arc::new(PoolStore::new(Arc::clone(api), config.store.clone()));
        let tokens = Arc::new(TokenStore::new(Arc::clone(api), config.store.clone()));
        let registry = Arc::new(builtin_registry(
            Arc::clone(&balances),
            Arc::clone(&pools),
            Arc::clone(&tokens),
        ));
        Self {
            registry,
            scheduler: SyncScheduler::new(config.scheduler.throttle),
            balances,
            pools,
            tokens,
            started: false,
        }
    }

    async fn start_schedules(&mut self, config: &SyncConfig) {
        if self.started {
            return;
        }
        let cadence = &config.scheduler;
        self.scheduler
            .schedule(Arc::new(BalanceSync::new(Arc::clone(&self.balances))), cadence.balances)
            .await;
        self.scheduler
            .schedule(Arc::new(PoolSync::new(Arc::clone(&self.pools))), cadence.pools)
            .await;
        self.scheduler
            .schedule(Arc::new(PriceSync::new(Arc::clone(&self.tokens))), cadence.prices)
            .await;
        self.started = true;
    }
}

#[async_trait]
impl WorkerEntry for SyncWorker {
    async fn run(&self, mut port: WorkerPort) {
        let worker_id = port.worker_id.clone();
        let mut ctx = WorkerContext::new(&self.api, &self.config);
        let mut notifications = ctx.scheduler.subscribe();

        loop {
            tokio::select! {
                request = port.rx.recv() => {
                    let Some(request) = request else {
                        debug!(worker_id = %worker_id, "Request queue closed");
                        break;
                    };
                    match request {
                        WorkerRequest::Init => {
                            ctx.start_schedules(&self.config).await;
                            if port.tx.send(WorkerResponse::Init).await.is_err() {
                                break;
                            }
                            info!(worker_id = %worker_id, "Sync worker ready");
                        }
                        WorkerRequest::Task { task_id, task_type, payload } => {
                            tokio::spawn(run_task(
                                Arc::clone(&ctx.registry),
                                port.tx.clone(),
                                task_id,
                                task_type,
                                payload,
                            ));
                        }
                        WorkerRequest::Pause => ctx.scheduler.pause().await,
                        WorkerRequest::Resume => ctx.scheduler.resume().await,
                    }
                }
                note = notifications.recv() => match note {
                    Ok(note) => {
                        let message = WorkerResponse::Notification { domain: note.domain };
                        if port.tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(worker_id = %worker_id, skipped, "Dropped scheduler notifications");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        ctx.scheduler.stop().await;
        info!(worker_id = %worker_id, "Sync worker stopped");
    }
}

async fn run_task(
    registry: Arc<HandlerRegistry>,
    tx: mpsc::Sender<WorkerResponse>,
    task_id: TaskId,
    task_type: String,
    payload: serde_json::Value,
) {
    let response = match registry.get(&task_type) {
        Some(handler) => match handler.handle(payload).await {
            Ok(result) => WorkerResponse::success(task_id, task_type, result),
            Err(e) => {
                warn!(task_id = %task_id, task_type = %task_type, error = %e, "Task failed");
                WorkerResponse::failure(task_id, task_type, e)
            }
        },
        None => {
            let reason = format!("unknown task type: {task_type}");
            WorkerResponse::failure(task_id, task_type, reason)
        }
    };
    // ok if the dispatcher is gone
    let _ = tx.send(response).await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::DomainCadence;
    use crate::dispatcher::channel::link_pair;
    use crate::error::FetchError;
    use crate::model::{Balances, PoolsPage, Token};

    #[derive(Default)]
    struct PoolCounter {
        pool_calls: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeApi for PoolCounter {
        async fn fetch_balances(&self, _: &[Token], _: &str, _: bool) -> Result<Balances, FetchError> {
            Ok(Balances::new())
        }

        async fn fetch_pools(&self) -> Result<PoolsPage, FetchError> {
            self.pool_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PoolsPage::default())
        }

        async fn fetch_tokens_by_canister_id(&self, _: &[String]) -> Result<Vec<Token>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.scheduler.pools = DomainCadence::new(Duration::from_secs(5), Duration::from_secs(20));
        config
    }

    #[tokio::test(start_paused = true)]
    async fn answers_init_and_tasks() {
        let api = Arc::new(PoolCounter::default());
        let worker = Arc::new(SyncWorker::new(api, config()));
        let (mut link, port) = link_pair("sync", 8);
        tokio::spawn(async move { worker.run(port).await });

        link.tx.send(WorkerRequest::Init).await.unwrap();
        assert_eq!(link.rx.recv().await, Some(WorkerResponse::Init));

        let task_id = TaskId::from("t-1");
        link.tx
            .send(WorkerRequest::Task {
                task_id: task_id.clone(),
                task_type: "nope".into(),
                payload: json!({}),
            })
            .await
            .unwrap();
        match link.rx.recv().await {
            Some(WorkerResponse::TaskResult { task_id: id, error: Some(reason), .. }) => {
                assert_eq!(id, task_id);
                assert!(reason.contains("unknown task type"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_scheduler_notifications_and_honours_pause() {
        let api = Arc::new(PoolCounter::default());
        let worker = Arc::new(SyncWorker::new(api.clone(), config()));
        let (mut link, port) = link_pair("sync", 8);
        tokio::spawn(async move { worker.run(port).await });

        link.tx.send(WorkerRequest::Init).await.unwrap();
        assert_eq!(link.rx.recv().await, Some(WorkerResponse::Init));

        // First pools tick lands at 5s.
        loop {
            match link.rx.recv().await {
                Some(WorkerResponse::Notification { domain }) if domain == "pools" => break,
                Some(_) => continue,
                None => panic!("worker exited"),
            }
        }
        assert_eq!(api.pool_calls.load(Ordering::SeqCst), 1);

        link.tx.send(WorkerRequest::Pause).await.unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(api.pool_calls.load(Ordering::SeqCst), 1);
    }
}
