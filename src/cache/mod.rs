//! Read-through response cache with offline support.
//!
//! This module provides:
//! - Deterministic request keys (method + endpoint + normalized params)
//! - Per-entry freshness (`now - fetched_at < ttl`)
//! - Three-way lookups: fresh, stale-but-available, absent
//!
//! Stale entries are never evicted on read; they stay servable while offline
//! until an explicit clear.

mod key;
mod store;

pub use key::RequestKey;
pub use store::{CacheEntry, CacheError, CacheLookup, CacheStore, Freshness};
