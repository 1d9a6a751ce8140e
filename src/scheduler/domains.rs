//! Sync domains backed by the worker-side stores.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::scheduler::sync::SyncDomain;
use crate::stores::{BalanceStore, PoolStore, TokenStore};

pub const BALANCES: &str = "balances";
pub const POOLS: &str = "pools";
pub const PRICES: &str = "prices";

/// Re-runs the most recent balance request.
pub struct BalanceSync {
    store: Arc<BalanceStore>,
}

impl BalanceSync {
    pub fn new(store: Arc<BalanceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SyncDomain for BalanceSync {
    fn name(&self) -> &str {
        BALANCES
    }

    async fn refresh(&self) -> Result<(), FetchError> {
        self.store.reload().await.map(|_| ())
    }
}

pub struct PoolSync {
    store: Arc<PoolStore>,
}

impl PoolSync {
    pub fn new(store: Arc<PoolStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SyncDomain for PoolSync {
    fn name(&self) -> &str {
        POOLS
    }

    async fn refresh(&self) -> Result<(), FetchError> {
        self.store.refresh().await.map(|_| ())
    }
}

/// Refreshes metadata (and with it USD prices) of every token seen so far.
pub struct PriceSync {
    store: Arc<TokenStore>,
}

impl PriceSync {
    pub fn new(store: Arc<TokenStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SyncDomain for PriceSync {
    fn name(&self) -> &str {
        PRICES
    }

    async fn refresh(&self) -> Result<(), FetchError> {
        self.store.refresh_known().await.map(|_| ())
    }
}
