use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

use dex_sync::api::{ExchangeApi, HttpExchangeApi};
use dex_sync::assets::{AssetFetcher, DurableStore, HttpAssetFetcher, LibSqlAssetStore};
use dex_sync::config::SyncConfig;
use dex_sync::engine::SyncEngine;
use dex_sync::error::ConfigError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = SyncConfig::from_env()?;
    let api_url = std::env::var("DEX_SYNC_API_URL")
        .map_err(|_| ConfigError::MissingEnvVar("DEX_SYNC_API_URL".to_string()))?;
    let asset_base = std::env::var("DEX_SYNC_ASSET_BASE_URL").ok();

    eprintln!("DEX sync v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: {api_url}");
    eprintln!("   Asset cache: {}", config.assets.db_path.display());

    let client = reqwest::Client::builder()
        .timeout(config.dispatcher.task_timeout)
        .build()
        .context("building HTTP client")?;
    let upstream: Arc<dyn ExchangeApi> = Arc::new(HttpExchangeApi::new(api_url, client));

    // ── Asset cache ─────────────────────────────────────────────────────
    let asset_store: Arc<dyn DurableStore> = Arc::new(
        LibSqlAssetStore::new_local(&config.assets.db_path)
            .await
            .with_context(|| format!("opening asset cache at {}", config.assets.db_path.display()))?,
    );
    let mut fetcher = HttpAssetFetcher::new(config.assets.http_timeout)?;
    if let Some(base) = asset_base {
        fetcher = fetcher.with_base_url(base);
    }
    let fetcher: Arc<dyn AssetFetcher> = Arc::new(fetcher);

    let engine = SyncEngine::new(config, upstream, asset_store, fetcher);
    engine.start_sync_worker().await?;

    let preload: Vec<String> = std::env::args().skip(1).collect();
    if !preload.is_empty() {
        let report = engine.assets().preload_assets(&preload).await;
        eprintln!(
            "   Preloaded {} asset(s): {} fetched, {} already cached, {} failed",
            report.requested,
            report.fetched,
            report.already_cached,
            report.failed.len()
        );
    }

    let mut notifications = engine.subscribe();
    loop {
        tokio::select! {
            note = notifications.recv() => match note {
                Ok(note) => tracing::info!(worker_id = %note.worker_id, domain = %note.domain, "Domain refreshed"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Missed notifications"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
