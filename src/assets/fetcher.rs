//! Network tier of the asset cache.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::CacheError;

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CacheError>;
}

/// Fetches assets over HTTP. Relative urls (`/logos/icp.png`) are resolved
/// against the configured base url.
pub struct HttpAssetFetcher {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpAssetFetcher {
    pub fn new(timeout: Duration) -> Result<Self, CacheError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url: None })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn resolve(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) if url.starts_with('/') => format!("{base}{url}"),
            _ => url.to_string(),
        }
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CacheError> {
        let target = self.resolve(url);
        debug!(url = %target, "Fetching asset");
        let resp = self.client.get(&target).send().await.map_err(|e| CacheError::AssetFetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CacheError::AssetFetch {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| CacheError::AssetFetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_urls_use_base() {
        let fetcher = HttpAssetFetcher::new(Duration::from_secs(1))
            .unwrap()
            .with_base_url("https://cdn.example.com/");
        assert_eq!(fetcher.resolve("/a.png"), "https://cdn.example.com/a.png");
        assert_eq!(fetcher.resolve("https://other.example/b.png"), "https://other.example/b.png");
    }

    #[tokio::test]
    async fn connection_failure_is_asset_fetch_error() {
        let fetcher = HttpAssetFetcher::new(Duration::from_millis(500))
            .unwrap()
            .with_base_url("http://127.0.0.1:9");
        let err = fetcher.fetch("/a.png").await.unwrap_err();
        assert!(matches!(err, CacheError::AssetFetch { url, .. } if url == "/a.png"));
    }
}
