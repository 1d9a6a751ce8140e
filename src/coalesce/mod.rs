//! Fetch coalescing: single-flight loads and the collection store built on them.

pub mod coalescer;
pub mod store;

pub use coalescer::FetchCoalescer;
pub use store::{Collection, CoalescingStore, CollectionSource, StoreSnapshot, insert_chunk, merge_in_chunks};
