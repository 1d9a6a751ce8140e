//! Error types for the sync engine.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors (durable asset tier).
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Task dispatcher errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Worker construction or init handshake failed.
    #[error("Worker {worker_id} failed to initialize: {reason}")]
    Initialization { worker_id: String, reason: String },

    /// No active execution context for this worker id.
    #[error("Worker {worker_id} is not initialized")]
    NotInitialized { worker_id: String },

    #[error("Task {task_id} failed: {reason}")]
    TaskFailed { task_id: String, reason: String },

    #[error("Channel to worker {worker_id} closed")]
    ChannelClosed { worker_id: String },

    #[error("Task {task_type} on worker {worker_id} timed out after {timeout:?}")]
    Timeout {
        worker_id: String,
        task_type: String,
        timeout: Duration,
    },

    #[error("Payload codec error: {0}")]
    Codec(String),
}

/// Upstream fetch failure.
///
/// `Clone` so a single failed coalesced fetch can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("{source_name} request failed: {reason}")]
    Upstream { source_name: String, reason: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn upstream(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Upstream {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Asset cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Asset fetch failed for {url}: {reason}")]
    AssetFetch { url: String, reason: String },

    #[error("HTTP client error: {0}")]
    Http(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
