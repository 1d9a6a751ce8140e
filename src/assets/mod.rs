//! Two-tier (memory + durable) asset cache.
pub mod cache;
pub mod clock;
pub mod durable;
pub mod fetcher;
pub mod libsql_store;

pub use cache::{AssetCache, AssetHandle, AssetSource, PreloadReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use durable::{AssetRecord, DurableStore, MemoryDurableStore};
pub use fetcher::{AssetFetcher, HttpAssetFetcher};
pub use libsql_store::LibSqlAssetStore;
