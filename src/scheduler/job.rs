//! Per-domain polling state.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::DomainCadence;

/// Outcome of the guard checks at the start of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    Run,
    /// A refresh for the domain is still running.
    SkipInProgress,
    /// The last successful run started less than the throttle window ago.
    SkipThrottled,
}

/// Polling state of one domain.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub domain: String,
    pub cadence: DomainCadence,
    pub throttle: Duration,
    /// Start time of the last successful run.
    pub last_run: Option<Instant>,
    pub in_progress: bool,
    pub paused: bool,
    pub runs: u64,
    pub failures: u64,
    pub skipped: u64,
}

impl ScheduledJob {
    pub fn new(domain: impl Into<String>, cadence: DomainCadence, throttle: Duration) -> Self {
        Self {
            domain: domain.into(),
            cadence,
            throttle,
            last_run: None,
            in_progress: false,
            paused: false,
            runs: 0,
            failures: 0,
            skipped: 0,
        }
    }

    /// Interval of the tier currently selected.
    pub fn current_interval(&self) -> Duration {
        if self.paused {
            self.cadence.background
        } else {
            self.cadence.active
        }
    }

    /// Apply the overlap and throttle guards. Marks the job in progress on `Run`.
    pub fn begin_tick(&mut self, now: Instant) -> TickDecision {
        if self.in_progress {
            self.skipped += 1;
            return TickDecision::SkipInProgress;
        }
        if let Some(last) = self.last_run
            && now.saturating_duration_since(last) < self.throttle
        {
            self.skipped += 1;
            return TickDecision::SkipThrottled;
        }
        self.in_progress = true;
        TickDecision::Run
    }

    /// Record the end of a run that started at `started`.
    pub fn finish(&mut self, started: Instant, success: bool) {
        self.in_progress = false;
        if success {
            self.last_run = Some(started);
            self.runs += 1;
        } else {
            self.failures += 1;
        }
    }
}
