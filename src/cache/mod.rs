//! Persistent TTL cache for offline support.
//!
//! This module provides a resource-agnostic cache that:
//! - Stores opaque payloads under string keys, optionally with a TTL
//! - Treats expired and corrupt entries as misses and evicts them
//! - Keeps each store's rows under its own namespace in the shared database

mod entry;
mod result;
mod store;

pub use entry::CacheEntry;
pub use result::{CacheResult, CacheSource};
pub use store::TtlCache;
