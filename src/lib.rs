//! Offline-first request layer for the household coordination API.
//!
//! Reads go through a read-through response cache; writes that cannot reach
//! the remote API are parked in a durable outbox and replayed in order once
//! connectivity returns.
//!
//! ```text
//! ┌──────────────┐   GET    ┌───────────┐
//! │ OfflineClient│─────────►│ Transport │──► remote API
//! │   (façade)   │◄─────────│  (trait)  │
//! └──────┬───────┘          └─────▲─────┘
//!        │ cache / enqueue        │ replay (FIFO, backoff)
//!        ▼                        │
//! ┌────────────┐  ┌────────┐  ┌───┴────────┐  online edge  ┌──────────────┐
//! │ CacheStore │  │ Outbox │◄─│ SyncEngine │◄──────────────│ Connectivity │
//! └─────┬──────┘  └───┬────┘  └────────────┘               └──────────────┘
//!       └─────┬───────┘
//!             ▼
//!        KvStore (SQLite)
//! ```

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod outbox;
pub mod payload;
pub mod storage;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{CacheStats, ClientOptions, DataSource, OfflineClient, RequestError, RequestOutcome};
pub use config::Config;
pub use payload::Payload;
pub use transport::Method;
