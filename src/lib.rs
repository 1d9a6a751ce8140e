//! DEX sync: background synchronization and caching engine for an exchange
//! frontend.

pub mod api;
pub mod assets;
pub mod coalesce;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod stores;
pub mod worker;
