//! Transport between the dispatcher and a worker execution context.
//!
//! A worker is reached through a pair of bounded mpsc queues. How the other
//! end is hosted (tokio task, thread, child process bridge) is up to the
//! `WorkerSpawner`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::dispatcher::message::{WorkerRequest, WorkerResponse};

/// Dispatcher side of a worker link.
pub struct WorkerLink {
    pub tx: mpsc::Sender<WorkerRequest>,
    pub rx: mpsc::Receiver<WorkerResponse>,
}

/// Worker side of a worker link.
pub struct WorkerPort {
    pub worker_id: String,
    pub rx: mpsc::Receiver<WorkerRequest>,
    pub tx: mpsc::Sender<WorkerResponse>,
}

/// Create both ends of a link.
pub fn link_pair(worker_id: impl Into<String>, capacity: usize) -> (WorkerLink, WorkerPort) {
    let (req_tx, req_rx) = mpsc::channel(capacity.max(1));
    let (resp_tx, resp_rx) = mpsc::channel(capacity.max(1));
    (
        WorkerLink {
            tx: req_tx,
            rx: resp_rx,
        },
        WorkerPort {
            worker_id: worker_id.into(),
            rx: req_rx,
            tx: resp_tx,
        },
    )
}

/// Creates worker execution contexts.
pub trait WorkerSpawner: Send + Sync {
    /// Start a context for `worker_id` and return the dispatcher's end of
    /// its link. An `Err` is a construction failure.
    fn spawn(&self, worker_id: &str, capacity: usize) -> Result<WorkerLink, String>;
}

/// Body of a worker: runs until the request side of its port closes.
#[async_trait]
pub trait WorkerEntry: Send + Sync {
    async fn run(&self, port: WorkerPort);
}

type EntryFactory = dyn Fn() -> Result<Arc<dyn WorkerEntry>, String> + Send + Sync;

/// Hosts each worker on its own tokio task.
pub struct InProcessSpawner {
    factory: Box<EntryFactory>,
}

impl InProcessSpawner {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn WorkerEntry>, String> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }

    /// Spawner that always runs the same entry.
    pub fn from_entry(entry: Arc<dyn WorkerEntry>) -> Self {
        Self::new(move || Ok(Arc::clone(&entry)))
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self, worker_id: &str, capacity: usize) -> Result<WorkerLink, String> {
        let entry = (self.factory)()?;
        let (link, port) = link_pair(worker_id, capacity);
        let id = worker_id.to_string();
        tokio::spawn(async move {
            debug!(worker_id = %id, "Worker task started");
            entry.run(port).await;
            info!(worker_id = %id, "Worker task exited");
        });
        Ok(link)
    }
}
