//! Configuration types.
//!
//! Every struct has a `Default` with the production constants. `from_env()`
//! overrides individual values from `DEX_SYNC_*` environment variables;
//! durations are given in whole seconds.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Active/background polling intervals for one sync domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainCadence {
    /// Interval while the host is in the foreground.
    pub active: Duration,
    /// Interval while the host is hidden.
    pub background: Duration,
}

impl DomainCadence {
    pub fn new(active: Duration, background: Duration) -> Self {
        Self { active, background }
    }
}

/// Periodic sync scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub balances: DomainCadence,
    pub pools: DomainCadence,
    pub prices: DomainCadence,
    /// Minimum age of the last successful run before a domain may run again.
    pub throttle: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            balances: DomainCadence::new(Duration::from_secs(10), Duration::from_secs(30)),
            pools: DomainCadence::new(Duration::from_secs(30), Duration::from_secs(60)),
            prices: DomainCadence::new(Duration::from_secs(5), Duration::from_secs(10)),
            throttle: Duration::from_secs(2),
        }
    }
}

/// Fetch coalescing store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Cached data younger than this skips the upstream call.
    pub ttl: Duration,
    /// Number of entries merged into the visible collection per step.
    pub chunk_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            chunk_size: 50,
        }
    }
}

/// Two-tier asset cache configuration.
#[derive(Debug, Clone)]
pub struct AssetCacheConfig {
    pub ttl: Duration,
    pub db_path: PathBuf,
    pub http_timeout: Duration,
}

impl Default for AssetCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
            db_path: PathBuf::from("./data/asset-cache.db"),
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// Task dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long `register_worker` waits for the init acknowledgement.
    pub init_timeout: Duration,
    /// Bound used by `dispatch_with_timeout` when the caller passes none.
    pub task_timeout: Duration,
    /// Capacity of each direction of a worker link.
    pub channel_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            task_timeout: Duration::from_secs(30),
            channel_capacity: 64,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub assets: AssetCacheConfig,
    pub dispatcher: DispatcherConfig,
}

impl SyncConfig {
    /// Build a config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let s = &mut config.scheduler;
        override_secs(&lookup, "DEX_SYNC_BALANCES_ACTIVE_SECS", &mut s.balances.active)?;
        override_secs(&lookup, "DEX_SYNC_BALANCES_BACKGROUND_SECS", &mut s.balances.background)?;
        override_secs(&lookup, "DEX_SYNC_POOLS_ACTIVE_SECS", &mut s.pools.active)?;
        override_secs(&lookup, "DEX_SYNC_POOLS_BACKGROUND_SECS", &mut s.pools.background)?;
        override_secs(&lookup, "DEX_SYNC_PRICES_ACTIVE_SECS", &mut s.prices.active)?;
        override_secs(&lookup, "DEX_SYNC_PRICES_BACKGROUND_SECS", &mut s.prices.background)?;
        override_secs(&lookup, "DEX_SYNC_THROTTLE_SECS", &mut s.throttle)?;

        override_secs(&lookup, "DEX_SYNC_STORE_TTL_SECS", &mut config.store.ttl)?;
        if let Some(raw) = lookup("DEX_SYNC_CHUNK_SIZE") {
            let size = parse_number("DEX_SYNC_CHUNK_SIZE", &raw)?;
            if size == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "DEX_SYNC_CHUNK_SIZE".into(),
                    message: "must be greater than zero".into(),
                });
            }
            config.store.chunk_size = size as usize;
        }

        override_secs(&lookup, "DEX_SYNC_ASSET_TTL_SECS", &mut config.assets.ttl)?;
        override_secs(&lookup, "DEX_SYNC_HTTP_TIMEOUT_SECS", &mut config.assets.http_timeout)?;
        if let Some(path) = lookup("DEX_SYNC_ASSET_DB_PATH") {
            config.assets.db_path = PathBuf::from(path);
        }

        override_secs(&lookup, "DEX_SYNC_INIT_TIMEOUT_SECS", &mut config.dispatcher.init_timeout)?;
        override_secs(&lookup, "DEX_SYNC_TASK_TIMEOUT_SECS", &mut config.dispatcher.task_timeout)?;

        for (name, cadence) in [
            ("balances", config.scheduler.balances),
            ("pools", config.scheduler.pools),
            ("prices", config.scheduler.prices),
        ] {
            if cadence.active.is_zero() || cadence.background.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: format!("{name} cadence"),
                    message: "intervals must be non-zero".into(),
                });
            }
        }

        Ok(config)
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected a non-negative integer, got '{raw}': {e}"),
    })
}

fn override_secs<F>(lookup: &F, key: &str, target: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = Duration::from_secs(parse_number(key, &raw)?);
    }
    Ok(())
}
