//! Future-based RPC over worker execution contexts.
//!
//! `TaskDispatcher` owns the registry of workers. Each dispatched task gets a
//! unique id and a oneshot continuation in the worker's pending map; a
//! per-worker reader task resolves continuations as responses arrive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::dispatcher::channel::WorkerSpawner;
use crate::dispatcher::message::{Lifecycle, TaskId, WorkerRequest, WorkerResponse};
use crate::dispatcher::state::WorkerState;
use crate::error::DispatchError;

type TaskOutcome = Result<Value, DispatchError>;

struct PendingTask {
    task_type: String,
    dispatched_at: Instant,
    reply: oneshot::Sender<TaskOutcome>,
}

struct WorkerHandle {
    id: String,
    state: WorkerState,
    tx: Option<mpsc::Sender<WorkerRequest>>,
    pending: HashMap<TaskId, PendingTask>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: WorkerState::Uninitialized,
            tx: None,
            pending: HashMap::new(),
            reader: None,
        }
    }

    fn transition(&mut self, to: WorkerState) {
        if !self.state.can_transition_to(to) {
            warn!(worker_id = %self.id, from = %self.state, to = %to, "Ignoring invalid worker transition");
            return;
        }
        debug!(worker_id = %self.id, from = %self.state, to = %to, "Worker state change");
        self.state = to;
    }
}

type Registry = Arc<RwLock<HashMap<String, WorkerHandle>>>;

/// Notification posted by a worker's scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerNotification {
    pub worker_id: String,
    pub domain: String,
}

/// Registry of worker contexts and the RPC facade over them.
pub struct TaskDispatcher {
    config: DispatcherConfig,
    workers: Registry,
    notify_tx: broadcast::Sender<WorkerNotification>,
    registration: Mutex<()>,
}

impl TaskDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let (notify_tx, _) = broadcast::channel(256);
        Self {
            config,
            workers: Arc::new(RwLock::new(HashMap::new())),
            notify_tx,
            registration: Mutex::new(()),
        }
    }

    /// Start the worker context for `worker_id` and wait for its init
    /// acknowledgement. No-op when the worker is already active.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        spawner: &dyn WorkerSpawner,
    ) -> Result<(), DispatchError> {
        let _guard = self.registration.lock().await;

        {
            let mut workers = self.workers.write().await;
            let handle = workers
                .entry(worker_id.to_string())
                .or_insert_with(|| WorkerHandle::new(worker_id));
            if handle.state == WorkerState::Active {
                debug!(worker_id = %worker_id, "Worker already registered");
                return Ok(());
            }
            handle.transition(WorkerState::Initializing);
        }

        let mut link = match spawner.spawn(worker_id, self.config.channel_capacity) {
            Ok(link) => link,
            Err(reason) => return Err(self.fail_init(worker_id, reason).await),
        };

        if link.tx.send(WorkerRequest::Init).await.is_err() {
            return Err(self.fail_init(worker_id, "worker closed before init".to_string()).await);
        }

        let ack = tokio::time::timeout(self.config.init_timeout, async {
            loop {
                match link.rx.recv().await {
                    Some(WorkerResponse::Init) => return Ok(()),
                    Some(other) => debug!(worker_id = %worker_id, message = ?other, "Ignoring message before init"),
                    None => return Err("worker exited before init".to_string()),
                }
            }
        })
        .await;

        match ack {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(self.fail_init(worker_id, reason).await),
            Err(_) => {
                let reason = format!("no init acknowledgement within {:?}", self.config.init_timeout);
                return Err(self.fail_init(worker_id, reason).await);
            }
        }

        let mut workers = self.workers.write().await;
        let Some(handle) = workers
            .get_mut(worker_id)
            .filter(|h| h.state == WorkerState::Initializing)
        else {
            // Terminated during the handshake; dropping the link stops the worker.
            drop(link);
            let reason = "terminated during init".to_string();
            error!(worker_id = %worker_id, reason = %reason, "Worker initialization failed");
            return Err(DispatchError::Initialization {
                worker_id: worker_id.to_string(),
                reason,
            });
        };
        handle.reader = Some(tokio::spawn(read_responses(
            worker_id.to_string(),
            link.rx,
            Arc::clone(&self.workers),
            self.notify_tx.clone(),
        )));
        handle.tx = Some(link.tx);
        handle.transition(WorkerState::Active);
        info!(worker_id = %worker_id, "Worker registered");
        Ok(())
    }

    /// Post a task to `worker_id` and wait for its result.
    ///
    /// Fails immediately with `NotInitialized` (nothing is posted) unless the
    /// worker is active. If the worker is terminated while the task is
    /// pending, the returned future never resolves; use
    /// `dispatch_with_timeout` for a bounded wait.
    pub async fn dispatch(
        &self,
        task_type: &str,
        payload: Value,
        worker_id: &str,
    ) -> Result<Value, DispatchError> {
        let (_, reply) = self.post(task_type, payload, worker_id).await?;
        await_reply(reply).await
    }

    /// `dispatch` with typed payload and result.
    pub async fn dispatch_typed<P, R>(
        &self,
        task_type: &str,
        payload: &P,
        worker_id: &str,
    ) -> Result<R, DispatchError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload =
            serde_json::to_value(payload).map_err(|e| DispatchError::Codec(format!("encode {task_type}: {e}")))?;
        let value = self.dispatch(task_type, payload, worker_id).await?;
        serde_json::from_value(value).map_err(|e| DispatchError::Codec(format!("decode {task_type}: {e}")))
    }

    /// `dispatch` bounded by `timeout`, or the configured task timeout.
    pub async fn dispatch_with_timeout(
        &self,
        task_type: &str,
        payload: Value,
        worker_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, DispatchError> {
        let timeout = timeout.unwrap_or(self.config.task_timeout);
        let (task_id, reply) = self.post(task_type, payload, worker_id).await?;
        match tokio::time::timeout(timeout, await_reply(reply)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if let Some(handle) = self.workers.write().await.get_mut(worker_id) {
                    handle.pending.remove(&task_id);
                }
                warn!(worker_id = %worker_id, task_id = %task_id, ?timeout, "Task timed out");
                Err(DispatchError::Timeout {
                    worker_id: worker_id.to_string(),
                    task_type: task_type.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Tear down the worker context. Pending tasks are abandoned, not
    /// rejected.
    pub async fn terminate(&self, worker_id: &str) {
        let mut workers = self.workers.write().await;
        let Some(handle) = workers.get_mut(worker_id) else {
            return;
        };
        if handle.state == WorkerState::Terminated || handle.state == WorkerState::Uninitialized {
            return;
        }

        // Dropping the sender closes the worker's request queue.
        handle.tx = None;
        let abandoned = handle.pending.len();
        handle.pending.clear();
        if let Some(reader) = handle.reader.take() {
            reader.abort();
        }
        handle.transition(WorkerState::Terminated);
        info!(worker_id = %worker_id, abandoned, "Worker terminated");
    }

    /// Terminate every registered worker.
    pub async fn terminate_all(&self) {
        for id in self.worker_ids().await {
            self.terminate(&id).await;
        }
    }

    /// Forward a host visibility change into the worker.
    pub async fn notify_lifecycle(&self, worker_id: &str, event: Lifecycle) -> Result<(), DispatchError> {
        let tx = self.active_sender(worker_id).await?;
        tx.send(event.into())
            .await
            .map_err(|_| DispatchError::ChannelClosed {
                worker_id: worker_id.to_string(),
            })
    }

    /// Forward a host visibility change into every active worker.
    pub async fn broadcast_lifecycle(&self, event: Lifecycle) {
        for id in self.worker_ids().await {
            match self.notify_lifecycle(&id, event).await {
                Ok(()) => {}
                Err(DispatchError::NotInitialized { .. }) => {}
                Err(e) => warn!(worker_id = %id, error = %e, "Failed to forward lifecycle event"),
            }
        }
    }

    /// Receive refresh notifications from all workers.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerNotification> {
        self.notify_tx.subscribe()
    }

    pub async fn worker_state(&self, worker_id: &str) -> WorkerState {
        self.workers
            .read()
            .await
            .get(worker_id)
            .map(|h| h.state)
            .unwrap_or(WorkerState::Uninitialized)
    }

    pub async fn pending_count(&self, worker_id: &str) -> usize {
        self.workers
            .read()
            .await
            .get(worker_id)
            .map(|h| h.pending.len())
            .unwrap_or(0)
    }

    pub async fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn fail_init(&self, worker_id: &str, reason: String) -> DispatchError {
        error!(worker_id = %worker_id, reason = %reason, "Worker initialization failed");
        if let Some(handle) = self.workers.write().await.get_mut(worker_id) {
            handle.transition(WorkerState::Terminated);
        }
        DispatchError::Initialization {
            worker_id: worker_id.to_string(),
            reason,
        }
    }

    async fn active_sender(&self, worker_id: &str) -> Result<mpsc::Sender<WorkerRequest>, DispatchError> {
        let workers = self.workers.read().await;
        workers
            .get(worker_id)
            .filter(|h| h.state.accepts_tasks())
            .and_then(|h| h.tx.clone())
            .ok_or_else(|| DispatchError::NotInitialized {
                worker_id: worker_id.to_string(),
            })
    }

    async fn post(
        &self,
        task_type: &str,
        payload: Value,
        worker_id: &str,
    ) -> Result<(TaskId, oneshot::Receiver<TaskOutcome>), DispatchError> {
        let task_id = TaskId::generate(task_type);
        let (reply_tx, reply_rx) = oneshot::channel();

        let sender = {
            let mut workers = self.workers.write().await;
            let handle = workers
                .get_mut(worker_id)
                .filter(|h| h.state.accepts_tasks())
                .ok_or_else(|| DispatchError::NotInitialized {
                    worker_id: worker_id.to_string(),
                })?;
            let sender = handle.tx.clone().ok_or_else(|| DispatchError::NotInitialized {
                worker_id: worker_id.to_string(),
            })?;
            handle.pending.insert(
                task_id.clone(),
                PendingTask {
                    task_type: task_type.to_string(),
                    dispatched_at: Instant::now(),
                    reply: reply_tx,
                },
            );
            sender
        };

        let request = WorkerRequest::Task {
            task_id: task_id.clone(),
            task_type: task_type.to_string(),
            payload,
        };
        if sender.send(request).await.is_err() {
            if let Some(handle) = self.workers.write().await.get_mut(worker_id) {
                handle.pending.remove(&task_id);
            }
            return Err(DispatchError::ChannelClosed {
                worker_id: worker_id.to_string(),
            });
        }
        debug!(worker_id = %worker_id, task_id = %task_id, "Task dispatched");
        Ok((task_id, reply_rx))
    }
}

async fn await_reply(reply: oneshot::Receiver<TaskOutcome>) -> TaskOutcome {
    match reply.await {
        Ok(outcome) => outcome,
        // Continuation dropped by `terminate`: the task is abandoned.
        Err(_) => std::future::pending().await,
    }
}

async fn read_responses(
    worker_id: String,
    mut rx: mpsc::Receiver<WorkerResponse>,
    workers: Registry,
    notify_tx: broadcast::Sender<WorkerNotification>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            WorkerResponse::TaskResult {
                task_id,
                task_type,
                result,
                error,
            } => {
                let pending = workers
                    .write()
                    .await
                    .get_mut(&worker_id)
                    .and_then(|h| h.pending.remove(&task_id));
                let Some(pending) = pending else {
                    debug!(worker_id = %worker_id, task_id = %task_id, "Response for unknown task");
                    continue;
                };
                let outcome = match error {
                    Some(reason) => Err(DispatchError::TaskFailed {
                        task_id: task_id.to_string(),
                        reason,
                    }),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                debug!(
                    worker_id = %worker_id,
                    task_id = %task_id,
                    task_type = %task_type,
                    expected_type = %pending.task_type,
                    rejected = outcome.is_err(),
                    elapsed_ms = pending.dispatched_at.elapsed().as_millis() as u64,
                    "Task settled"
                );
                // Caller may have timed out
                let _ = pending.reply.send(outcome);
            }
            WorkerResponse::Notification { domain } => {
                // ok if no receivers
                let _ = notify_tx.send(WorkerNotification {
                    worker_id: worker_id.clone(),
                    domain,
                });
            }
            WorkerResponse::Init => {
                debug!(worker_id = %worker_id, "Duplicate init acknowledgement");
            }
        }
    }

    let mut workers = workers.write().await;
    if let Some(handle) = workers.get_mut(&worker_id)
        && handle.state == WorkerState::Active
    {
        warn!(worker_id = %worker_id, pending = handle.pending.len(), "Worker link closed unexpectedly");
        handle.tx = None;
        handle.reader = None;
        for (_, task) in handle.pending.drain() {
            let _ = task.reply.send(Err(DispatchError::ChannelClosed {
                worker_id: worker_id.clone(),
            }));
        }
        handle.transition(WorkerState::Terminated);
    }
}
