//! Domain stores built on the coalescing primitives.
pub mod balances;
pub mod pools;
pub mod tokens;

pub use balances::{BalanceSnapshot, BalanceStore};
pub use pools::{POOLS_OWNER, PoolStore};
pub use tokens::TokenStore;
