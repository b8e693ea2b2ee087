//! Outbox replay.
//!
//! # State machine
//!
//! ```text
//!            online edge / manual flush / resume
//!   ┌──────┐ ─────────────────────────────────► ┌─────────┐
//!   │ Idle │                                     │ Syncing │──┐ 2xx: remove, next
//!   └──────┘ ◄───────────────────────────────── └─────────┘◄─┘ 4xx: remove, notify, next
//!      ▲        drained / went offline            │    ▲
//!      │                                retryable │    │ delay elapsed,
//!      │ offline                                  ▼    │ online edge, resume
//!      │                                     ┌────────────┐
//!      └──────────────────────────────────── │ Backoff(n) │
//!                                            └────────────┘
//! ```
//!
//! Replay is strictly FIFO: a retryable failure parks the head operation and
//! nothing behind it is attempted until it succeeds or is rejected.

mod engine;
mod events;
mod policy;

pub use engine::{FlushResult, PassOutcome, SyncEngine, SyncReport, SyncState, SyncTrigger};
pub use events::{RejectReason, SyncEvent, SyncReplayError, SyncTransientError};
pub use policy::RetryPolicy;
