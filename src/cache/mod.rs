//! Generation-scoped response caching.
//!
//! This module provides the storage half of the engine:
//! - Persistent key→response stores, one per (kind, generation)
//! - An arena owning the create/retire/destroy lifecycle of those stores
//! - Strategies answering a request from the stores and the network
//! - A bounded pool for detached background refreshes

mod arena;
mod refresh;
mod storage;
mod strategy;
mod traits;

pub use arena::{CacheArena, CacheStore};
pub use refresh::RefreshPool;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub(crate) use storage::{format_datetime, parse_datetime};
pub use strategy::{Strategy, StrategyExecutor};
pub use traits::{CacheId, CacheKind, CachedEntry, ResponseSource, Served};
