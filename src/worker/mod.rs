//! Worker-side runtime: task handlers and the sync worker entry.
pub mod handler;
pub mod handlers;
pub mod runtime;

pub use handler::{HandlerRegistry, TaskHandler};
pub use handlers::{FETCH_BALANCES, FETCH_POOLS, FETCH_TOKENS};
pub use runtime::SyncWorker;
