//! Durable outbox for mutations that have not been confirmed by the remote.
//!
//! Operations are persisted one record per key under the `queue_` prefix. A
//! zero-padded sequence number in the key makes key order equal enqueue
//! order, so listing the prefix yields the replay order directly.
//!
//! The outbox does not make remote operations idempotent. Callers queuing
//! non-idempotent writes (e.g. `POST /bookings`) should stamp an idempotency
//! key into the payload (see [`Payload::with_idempotency_key`]) so a replay
//! after a crash cannot create the resource twice.
//!
//! [`Payload::with_idempotency_key`]: crate::payload::Payload::with_idempotency_key

mod queue;

pub use queue::{OperationId, Outbox, OutboxError, OutboxResult, QueuedOperation};
