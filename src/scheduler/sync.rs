//! Periodic sync scheduler.
//!
//! Each registered domain gets a `RepeatingTask` at its active or background
//! interval. Ticks are guarded: a tick is skipped while the previous refresh
//! for the same domain is still running or the last successful run started
//! within the throttle window. Refresh errors are logged and never stop the
//! schedule.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DomainCadence;
use crate::error::FetchError;
use crate::scheduler::job::{ScheduledJob, TickDecision};
use crate::scheduler::repeating::RepeatingTask;

/// A state domain refreshed on a timer.
#[async_trait]
pub trait SyncDomain: Send + Sync {
    fn name(&self) -> &str;

    async fn refresh(&self) -> Result<(), FetchError>;
}

/// Posted after every successful refresh so the host can reload dependent
/// stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNotification {
    pub domain: String,
}

type JobTable = Arc<Mutex<HashMap<String, ScheduledJob>>>;

struct Registration {
    domain: Arc<dyn SyncDomain>,
    task: RepeatingTask,
}

pub struct SyncScheduler {
    throttle: Duration,
    jobs: JobTable,
    registrations: Mutex<HashMap<String, Registration>>,
    notify_tx: broadcast::Sender<SyncNotification>,
    paused: AtomicBool,
}

impl SyncScheduler {
    pub fn new(throttle: Duration) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            throttle,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            registrations: Mutex::new(HashMap::new()),
            notify_tx,
            paused: AtomicBool::new(false),
        }
    }

    /// Start polling `domain`. Replaces any schedule already registered
    /// under the same name.
    pub async fn schedule(&self, domain: Arc<dyn SyncDomain>, cadence: DomainCadence) {
        let name = domain.name().to_string();
        let mut job = ScheduledJob::new(&name, cadence, self.throttle);
        job.paused = self.paused.load(Ordering::SeqCst);
        let period = job.current_interval();
        self.jobs.lock().await.insert(name.clone(), job);

        let jobs = Arc::clone(&self.jobs);
        let tick_domain = Arc::clone(&domain);
        let notify_tx = self.notify_tx.clone();
        let task = RepeatingTask::spawn(name.clone(), period, move || {
            let jobs = Arc::clone(&jobs);
            let domain = Arc::clone(&tick_domain);
            let notify_tx = notify_tx.clone();
            tokio::spawn(async move {
                run_tick(&jobs, domain, &notify_tx).await;
            });
        });

        info!(domain = %name, period_secs = period.as_secs(), "Domain scheduled");
        if let Some(old) = self
            .registrations
            .lock()
            .await
            .insert(name, Registration { domain, task })
        {
            old.task.cancel();
        }
    }

    /// Switch every domain to its background interval.
    pub async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.apply_tier(true).await;
        info!("Scheduler paused; using background cadence");
    }

    /// Switch every domain back to its active interval. Does not tick
    /// immediately.
    pub async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.apply_tier(false).await;
        info!("Scheduler resumed; using active cadence");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Run one guarded tick for `domain` now and wait for it.
    ///
    /// Returns `None` for an unknown domain.
    pub async fn trigger(&self, domain: &str) -> Option<TickDecision> {
        let target = {
            let registrations = self.registrations.lock().await;
            Arc::clone(&registrations.get(domain)?.domain)
        };
        run_tick(&self.jobs, target, &self.notify_tx).await
    }

    /// Cancel every repeating task. Refreshes already running finish on
    /// their own.
    pub async fn stop(&self) {
        let mut registrations = self.registrations.lock().await;
        for (name, registration) in registrations.drain() {
            registration.task.cancel();
            debug!(domain = %name, "Repeating task cancelled");
        }
        info!("Scheduler stopped");
    }

    pub async fn job_snapshot(&self, domain: &str) -> Option<ScheduledJob> {
        self.jobs.lock().await.get(domain).cloned()
    }

    pub async fn domains(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registrations.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.notify_tx.subscribe()
    }

    async fn apply_tier(&self, paused: bool) {
        let mut jobs = self.jobs.lock().await;
        let registrations = self.registrations.lock().await;
        for (name, job) in jobs.iter_mut() {
            job.paused = paused;
            if let Some(registration) = registrations.get(name) {
                registration.task.set_period(job.current_interval());
            }
        }
    }
}

async fn run_tick(
    jobs: &JobTable,
    domain: Arc<dyn SyncDomain>,
    notify_tx: &broadcast::Sender<SyncNotification>,
) -> Option<TickDecision> {
    let name = domain.name().to_string();
    let started = Instant::now();
    let decision = jobs.lock().await.get_mut(&name)?.begin_tick(started);
    if decision != TickDecision::Run {
        debug!(domain = %name, ?decision, "Tick skipped");
        return Some(decision);
    }

    // A panicking refresh must not leave the job marked in progress.
    let refresh = tokio::spawn(async move { domain.refresh().await }).await;
    let success = match refresh {
        Ok(Ok(())) => {
            // ok if no receivers
            let _ = notify_tx.send(SyncNotification { domain: name.clone() });
            debug!(domain = %name, elapsed_ms = started.elapsed().as_millis() as u64, "Refresh complete");
            true
        }
        Ok(Err(e)) => {
            warn!(domain = %name, error = %e, "Refresh failed");
            false
        }
        Err(e) => {
            warn!(domain = %name, error = %e, "Refresh task panicked");
            false
        }
    };

    if let Some(job) = jobs.lock().await.get_mut(&name) {
        job.finish(started, success);
    }
    Some(decision)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct TestDomain {
        name: &'static str,
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl TestDomain {
        fn new(name: &'static str, delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                delay,
                fail,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SyncDomain for TestDomain {
        fn name(&self) -> &str {
            self.name
        }

        async fn refresh(&self) -> Result<(), FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(FetchError::upstream(self.name, "boom"))
            } else {
                Ok(())
            }
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_never_overlaps() {
        let scheduler = SyncScheduler::new(secs(2));
        let domain = TestDomain::new("pools", Duration::from_millis(3500), false);
        scheduler.schedule(domain.clone(), DomainCadence::new(secs(1), secs(5))).await;

        tokio::time::sleep(secs(10)).await;

        // Runs start at 1s, 5s and 9s; every tick in between is skipped.
        assert_eq!(domain.calls(), 3);
        assert_eq!(domain.max_running.load(Ordering::SeqCst), 1);
        let job = scheduler.job_snapshot("pools").await.unwrap();
        assert!(job.skipped >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_switch_cadence() {
        let scheduler = SyncScheduler::new(secs(2));
        let domain = TestDomain::new("balances", Duration::ZERO, false);
        scheduler.schedule(domain.clone(), DomainCadence::new(secs(10), secs(30))).await;

        tokio::time::sleep(secs(5)).await;
        scheduler.pause().await;
        tokio::time::sleep(secs(29)).await; // t = 34
        assert_eq!(domain.calls(), 0);
        tokio::time::sleep(secs(2)).await; // t = 36
        assert_eq!(domain.calls(), 1);

        scheduler.resume().await;
        tokio::time::sleep(secs(9)).await; // t = 45
        assert_eq!(domain.calls(), 1);
        tokio::time::sleep(secs(2)).await; // t = 47
        assert_eq!(domain.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_is_throttled() {
        let scheduler = SyncScheduler::new(secs(2));
        let domain = TestDomain::new("prices", Duration::ZERO, false);
        scheduler.schedule(domain.clone(), DomainCadence::new(secs(60), secs(120))).await;

        assert_eq!(scheduler.trigger("prices").await, Some(TickDecision::Run));
        assert_eq!(scheduler.trigger("prices").await, Some(TickDecision::SkipThrottled));
        tokio::time::sleep(secs(3)).await;
        assert_eq!(scheduler.trigger("prices").await, Some(TickDecision::Run));
        assert_eq!(scheduler.trigger("unknown").await, None);
        assert_eq!(domain.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_keep_schedule_running() {
        let scheduler = SyncScheduler::new(secs(2));
        let domain = TestDomain::new("pools", Duration::ZERO, true);
        let mut notifications = scheduler.subscribe();
        scheduler.schedule(domain.clone(), DomainCadence::new(secs(5), secs(10))).await;

        tokio::time::sleep(secs(16)).await;
        assert_eq!(domain.calls(), 3);
        let job = scheduler.job_snapshot("pools").await.unwrap();
        assert_eq!(job.failures, 3);
        assert!(job.last_run.is_none());
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn success_posts_notification() {
        let scheduler = SyncScheduler::new(secs(2));
        let domain = TestDomain::new("pools", Duration::ZERO, false);
        let mut notifications = scheduler.subscribe();
        scheduler.schedule(domain, DomainCadence::new(secs(5), secs(10))).await;

        let note = notifications.recv().await.unwrap();
        assert_eq!(note.domain, "pools");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_all_domains() {
        let scheduler = SyncScheduler::new(secs(2));
        let domain = TestDomain::new("pools", Duration::ZERO, false);
        scheduler.schedule(domain.clone(), DomainCadence::new(secs(1), secs(2))).await;
        scheduler.stop().await;

        tokio::time::sleep(secs(5)).await;
        assert_eq!(domain.calls(), 0);
        assert!(scheduler.domains().await.is_empty());
    }
}
