//! Periodic sync scheduling.
pub mod domains;
pub mod job;
pub mod repeating;
pub mod sync;

pub use domains::{BalanceSync, PoolSync, PriceSync};
pub use job::{ScheduledJob, TickDecision};
pub use repeating::RepeatingTask;
pub use sync::{SyncDomain, SyncNotification, SyncScheduler};
