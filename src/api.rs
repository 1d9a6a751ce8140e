//! Upstream exchange API, the collaborator every store fetches through.
//!
//! The engine treats these calls as opaque async functions that may fail.
//! `HttpExchangeApi` talks to a JSON gateway in front of the canisters.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::FetchError;
use crate::model::{Balances, PoolsPage, Token};

/// Read-side exchange operations.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Balances of `tokens` held by `owner`, keyed by canister id.
    async fn fetch_balances(
        &self,
        tokens: &[Token],
        owner: &str,
        force_refresh: bool,
    ) -> Result<Balances, FetchError>;

    /// Full pool listing.
    async fn fetch_pools(&self) -> Result<PoolsPage, FetchError>;

    /// Token metadata (including USD price) for the given canister ids.
    async fn fetch_tokens_by_canister_id(&self, ids: &[String]) -> Result<Vec<Token>, FetchError>;
}

#[derive(Serialize)]
struct BalancesRequest<'a> {
    owner: &'a str,
    tokens: Vec<&'a str>,
    force_refresh: bool,
}

#[derive(Serialize)]
struct TokensRequest<'a> {
    ids: &'a [String],
}

/// `ExchangeApi` over a JSON HTTP gateway.
pub struct HttpExchangeApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpExchangeApi {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        source: &str,
        resp: reqwest::Response,
    ) -> Result<T, FetchError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::upstream(source, format!("HTTP {status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| FetchError::Decode(format!("{source}: {e}")))
    }
}

#[async_trait]
impl ExchangeApi for HttpExchangeApi {
    async fn fetch_balances(
        &self,
        tokens: &[Token],
        owner: &str,
        force_refresh: bool,
    ) -> Result<Balances, FetchError> {
        let body = BalancesRequest {
            owner,
            tokens: tokens.iter().map(|t| t.canister_id.as_str()).collect(),
            force_refresh,
        };
        let resp = self
            .client
            .post(self.url("balances"))
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::upstream("balances", e))?;
        Self::decode("balances", resp).await
    }

    async fn fetch_pools(&self) -> Result<PoolsPage, FetchError> {
        let resp = self
            .client
            .get(self.url("pools"))
            .send()
            .await
            .map_err(|e| FetchError::upstream("pools", e))?;
        Self::decode("pools", resp).await
    }

    async fn fetch_tokens_by_canister_id(&self, ids: &[String]) -> Result<Vec<Token>, FetchError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .client
            .post(self.url("tokens"))
            .json(&TokensRequest { ids })
            .send()
            .await
            .map_err(|e| FetchError::upstream("tokens", e))?;
        Self::decode("tokens", resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let api = HttpExchangeApi::new("http://localhost:8080/", reqwest::Client::new());
        assert_eq!(api.url("pools"), "http://localhost:8080/pools");
    }

    #[tokio::test]
    async fn empty_token_lookup_skips_network() {
        // Unroutable address: any real request would fail.
        let api = HttpExchangeApi::new("http://127.0.0.1:9", reqwest::Client::new());
        let tokens = api.fetch_tokens_by_canister_id(&[]).await.unwrap();
        assert!(tokens.is_empty());
    }
}
