//! `ExchangeApi` that forwards every call into a worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::api::ExchangeApi;
use crate::dispatcher::dispatcher::TaskDispatcher;
use crate::error::{DispatchError, FetchError};
use crate::model::{Balances, PoolsPage, Token};
use crate::worker::handlers::{
    FETCH_BALANCES, FETCH_POOLS, FETCH_TOKENS, FetchBalancesPayload, FetchPoolsPayload, FetchTokensPayload,
};

/// Host-side stores use this to run their fetches inside a worker.
pub struct RemoteExchangeApi {
    dispatcher: Arc<TaskDispatcher>,
    worker_id: String,
    timeout: Option<Duration>,
}

impl RemoteExchangeApi {
    pub fn new(dispatcher: Arc<TaskDispatcher>, worker_id: impl Into<String>) -> Self {
        Self {
            dispatcher,
            worker_id: worker_id.into(),
            timeout: None,
        }
    }

    /// Bound every call; without it the configured task timeout applies.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn call<P, R>(&self, task_type: &str, payload: &P) -> Result<R, FetchError>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let payload = serde_json::to_value(payload).map_err(|e| FetchError::Decode(e.to_string()))?;
        let value = self
            .dispatcher
            .dispatch_with_timeout(task_type, payload, &self.worker_id, self.timeout)
            .await
            .map_err(|e| into_fetch_error(task_type, e))?;
        serde_json::from_value(value).map_err(|e| FetchError::Decode(format!("{task_type}: {e}")))
    }
}

fn into_fetch_error(task_type: &str, err: DispatchError) -> FetchError {
    match err {
        DispatchError::TaskFailed { reason, .. } => FetchError::upstream(task_type, reason),
        other => FetchError::upstream(task_type, other),
    }
}

#[async_trait]
impl ExchangeApi for RemoteExchangeApi {
    async fn fetch_balances(
        &self,
        tokens: &[Token],
        owner: &str,
        force_refresh: bool,
    ) -> Result<Balances, FetchError> {
        let payload = FetchBalancesPayload {
            owner: owner.to_string(),
            tokens: tokens.to_vec(),
            force_refresh,
        };
        self.call(FETCH_BALANCES, &payload).await
    }

    async fn fetch_pools(&self) -> Result<PoolsPage, FetchError> {
        self.call(FETCH_POOLS, &FetchPoolsPayload::default()).await
    }

    async fn fetch_tokens_by_canister_id(&self, ids: &[String]) -> Result<Vec<Token>, FetchError> {
        let payload = FetchTokensPayload { ids: ids.to_vec() };
        self.call(FETCH_TOKENS, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;

    #[tokio::test]
    async fn unregistered_worker_surfaces_as_fetch_error() {
        let dispatcher = Arc::new(TaskDispatcher::new(DispatcherConfig::default()));
        let api = RemoteExchangeApi::new(dispatcher, "sync");
        let err = api.fetch_pools().await.unwrap_err();
        assert!(matches!(err, FetchError::Upstream { ref source_name, .. } if source_name == "fetch_pools"));
        assert!(err.to_string().contains("not initialized"));
    }
}
