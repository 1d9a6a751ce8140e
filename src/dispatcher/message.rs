//! Messages exchanged between the dispatcher and a worker.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique task identifier: `{task_type}-{unix_millis}-{random}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate(task_type: &str) -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let nonce: u32 = rand::random();
        Self(format!("{task_type}-{millis}-{nonce:08x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dispatcher → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Init,
    Task {
        task_id: TaskId,
        task_type: String,
        payload: Value,
    },
    /// Host went to the background.
    Pause,
    /// Host is in the foreground again.
    Resume,
}

/// Worker → dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Readiness acknowledgement.
    Init,
    TaskResult {
        task_id: TaskId,
        task_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A scheduled refresh finished for `domain`.
    Notification { domain: String },
}

impl WorkerResponse {
    pub fn success(task_id: TaskId, task_type: impl Into<String>, result: Value) -> Self {
        Self::TaskResult {
            task_id,
            task_type: task_type.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(task_id: TaskId, task_type: impl Into<String>, error: impl ToString) -> Self {
        Self::TaskResult {
            task_id,
            task_type: task_type.into(),
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Host visibility change forwarded into a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Pause,
    Resume,
}

impl From<Lifecycle> for WorkerRequest {
    fn from(event: Lifecycle) -> Self {
        match event {
            Lifecycle::Pause => Self::Pause,
            Lifecycle::Resume => Self::Resume,
        }
    }
}
