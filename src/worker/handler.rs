//! Task handlers and the registry the worker dispatches through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FetchError;

/// Handles one task type inside a worker.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &str;

    async fn handle(&self, payload: Value) -> Result<Value, FetchError>;
}

/// Decode a task payload, mapping failures to `FetchError::Decode`.
pub fn decode_payload<T: serde::de::DeserializeOwned>(task_type: &str, payload: Value) -> Result<T, FetchError> {
    serde_json::from_value(payload).map_err(|e| FetchError::Decode(format!("{task_type} payload: {e}")))
}

/// Encode a handler result.
pub fn encode_result<T: serde::Serialize>(task_type: &str, value: &T) -> Result<Value, FetchError> {
    serde_json::to_value(value).map_err(|e| FetchError::Decode(format!("{task_type} result: {e}")))
}

/// Task handlers keyed by task type, fixed at construction.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new(handlers: impl IntoIterator<Item = Arc<dyn TaskHandler>>) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|h| (h.task_type().to_string(), h))
            .collect();
        Self { handlers }
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Constant(&'static str, Value);

    #[async_trait]
    impl TaskHandler for Constant {
        fn task_type(&self) -> &str {
            self.0
        }

        async fn handle(&self, _payload: Value) -> Result<Value, FetchError> {
            Ok(self.1.clone())
        }
    }

    #[tokio::test]
    async fn looks_up_handler_by_task_type() {
        let registry = HandlerRegistry::new([
            Arc::new(Constant("fetch_pools", json!(1))) as Arc<dyn TaskHandler>,
            Arc::new(Constant("fetch_tokens", json!(2))),
        ]);

        let handler = registry.get("fetch_pools").unwrap();
        assert_eq!(handler.handle(Value::Null).await.unwrap(), json!(1));
        assert!(registry.get("fetch_prices").is_none());
    }

    #[test]
    fn bad_payload_is_decode_error() {
        let err = decode_payload::<Vec<String>>("fetch_tokens", json!({"ids": 1})).unwrap_err();
        assert!(matches!(err, FetchError::Decode(msg) if msg.starts_with("fetch_tokens payload")));
    }
}
