//! Repeating timer with a cancel handle and a switchable period.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Calls `tick` every `period` until cancelled or dropped.
///
/// Changing the period restarts the pending wait, so the next tick is a full
/// new period after the change.
pub struct RepeatingTask {
    name: String,
    period: watch::Sender<Duration>,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    pub fn spawn<F>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let (period_tx, mut period_rx) = watch::channel(period);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            loop {
                let current = *period_rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep(current) => tick(),
                    changed = period_rx.changed() => {
                        if changed.is_err() {
                            debug!(task = %task_name, "Period sender dropped; stopping");
                            return;
                        }
                    }
                }
            }
        });

        Self {
            name,
            period: period_tx,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        *self.period.borrow()
    }

    /// Switch to `period`, restarting the pending wait.
    pub fn set_period(&self, period: Duration) {
        self.period.send_replace(period);
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
