//! Sync engine that drains the outbox through the transport.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{RejectReason, SyncEvent, SyncReplayError, SyncTransientError};
use super::policy::RetryPolicy;
use crate::clock::Clock;
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::outbox::{OperationId, Outbox, QueuedOperation};
use crate::transport::{classify, Disposition, Transport, TransportError, TransportResponse};

/// Capacity of the event channel; slow listeners miss the oldest events.
const EVENT_CAPACITY: usize = 128;

/// State of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  /// Nothing in flight.
  Idle,
  /// A pass is replaying the outbox.
  Syncing,
  /// The head operation failed `attempt` times; the next pass is scheduled.
  Backoff {
    attempt: u32,
    retry_at: DateTime<Utc>,
  },
}

impl fmt::Display for SyncState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SyncState::Idle => write!(f, "idle"),
      SyncState::Syncing => write!(f, "syncing"),
      SyncState::Backoff { attempt, retry_at } => {
        write!(f, "backoff({}) until {}", attempt, retry_at.to_rfc3339())
      }
    }
  }
}

/// What asked for a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  /// Offline → online edge from the connectivity monitor.
  ConnectivityRestored,
  /// Explicit flush from the application (e.g. pull-to-refresh).
  Manual,
  /// Application came back to the foreground, or the engine just started.
  Resume,
  /// The backoff timer fired.
  BackoffElapsed,
}

impl SyncTrigger {
  /// Whether this trigger may cut a pending backoff short.
  fn overrides_backoff(self) -> bool {
    !matches!(self, SyncTrigger::Manual)
  }
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
  /// The outbox is empty.
  Drained,
  /// The head operation hit a retryable failure and is parked.
  BackingOff {
    id: OperationId,
    retry_count: u32,
    delay: Duration,
  },
  /// Connectivity dropped; the rest of the outbox was left untouched.
  WentOffline,
  /// The outbox could not be read or updated.
  StorageFailed(String),
}

/// Summary of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  pub replayed: usize,
  pub rejected: usize,
  pub outcome: PassOutcome,
}

/// Result of asking the engine to sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushResult {
  /// A pass ran to completion.
  Completed(SyncReport),
  /// A pass was already running or backing off; this request was folded into it.
  Coalesced,
  /// Not attempted: connectivity is down.
  Offline,
}

struct EngineInner {
  outbox: Arc<Outbox>,
  connectivity: ConnectivityMonitor,
  transport: Arc<dyn Transport>,
  clock: Arc<dyn Clock>,
  policy: RetryPolicy,
  timeout: Duration,
  state: watch::Sender<SyncState>,
  events: broadcast::Sender<SyncEvent>,
  /// Pending backoff timer
  timer: Mutex<Option<JoinHandle<()>>>,
  subscription: Mutex<Option<Subscription>>,
}

/// Replays the outbox in FIFO order with backoff on retryable failures.
///
/// At most one pass runs at a time; the engine state doubles as the busy
/// flag, so triggers arriving mid-pass are coalesced.
#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<EngineInner>,
}

impl SyncEngine {
  pub fn new(
    outbox: Arc<Outbox>,
    connectivity: ConnectivityMonitor,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    timeout: Duration,
  ) -> Self {
    let (state, _) = watch::channel(SyncState::Idle);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    Self {
      inner: Arc::new(EngineInner {
        outbox,
        connectivity,
        transport,
        clock,
        policy,
        timeout,
        state,
        events,
        timer: Mutex::new(None),
        subscription: Mutex::new(None),
      }),
    }
  }

  /// Start listening for connectivity edges and flush anything left over
  /// from a previous run if we are online.
  pub fn init(&self) {
    let weak = Arc::downgrade(&self.inner);
    let subscription = self.inner.connectivity.subscribe(move |state| {
      let Some(inner) = weak.upgrade() else {
        return;
      };
      let engine = SyncEngine { inner };
      if state.is_online {
        engine.spawn_trigger(SyncTrigger::ConnectivityRestored);
      } else {
        engine.cancel_backoff();
      }
    });

    if let Ok(mut slot) = self.inner.subscription.lock() {
      *slot = Some(subscription);
    }

    if self.inner.connectivity.is_online() {
      self.spawn_trigger(SyncTrigger::Resume);
    }
  }

  /// Stop reacting to connectivity and cancel any pending backoff timer.
  /// A pass already in flight finishes on its own.
  pub fn teardown(&self) {
    if let Ok(mut slot) = self.inner.subscription.lock() {
      slot.take();
    }
    self.cancel_backoff();
  }

  pub fn state(&self) -> SyncState {
    *self.inner.state.borrow()
  }

  /// Receiver that observes every state change.
  pub fn watch_state(&self) -> watch::Receiver<SyncState> {
    self.inner.state.subscribe()
  }

  /// Listen for replay results, including terminal rejections.
  pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  /// Manually flush the outbox. Coalesced while a pass is running or backing off.
  pub async fn flush(&self) -> FlushResult {
    self.trigger(SyncTrigger::Manual).await
  }

  /// The application returned to the foreground. A pending backoff timer
  /// may not have survived suspension, so retry right away.
  pub async fn resume(&self) -> FlushResult {
    self.trigger(SyncTrigger::Resume).await
  }

  /// Run a pass for `trigger`, unless one is already active.
  pub async fn trigger(&self, trigger: SyncTrigger) -> FlushResult {
    if !self.inner.connectivity.is_online() {
      debug!(?trigger, "sync skipped while offline");
      if trigger == SyncTrigger::BackoffElapsed {
        self.cancel_backoff();
      }
      return FlushResult::Offline;
    }

    if trigger.overrides_backoff() && trigger != SyncTrigger::BackoffElapsed {
      if let Some(timer) = self.take_backoff_timer() {
        timer.abort();
      }
    }

    if !self.try_begin(trigger) {
      debug!(?trigger, state = %self.state(), "sync trigger coalesced");
      return FlushResult::Coalesced;
    }

    info!(?trigger, "sync pass started");
    let report = self.drain().await;
    self.finish(&report);
    info!(
      replayed = report.replayed,
      rejected = report.rejected,
      outcome = ?report.outcome,
      "sync pass finished"
    );

    FlushResult::Completed(report)
  }

  /// Fire-and-forget trigger, for use from synchronous callbacks.
  pub(crate) fn spawn_trigger(&self, trigger: SyncTrigger) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      warn!(?trigger, "no async runtime; sync trigger dropped");
      return;
    };
    let engine = self.clone();
    handle.spawn(async move {
      engine.trigger(trigger).await;
    });
  }

  /// Atomically claim the engine for a pass.
  fn try_begin(&self, trigger: SyncTrigger) -> bool {
    self.inner.state.send_if_modified(|state| {
      let allowed = match state {
        SyncState::Idle => true,
        SyncState::Backoff { .. } => trigger.overrides_backoff(),
        SyncState::Syncing => false,
      };
      if allowed {
        *state = SyncState::Syncing;
      }
      allowed
    })
  }

  /// Take the backoff timer, but only while we are actually backing off.
  fn take_backoff_timer(&self) -> Option<JoinHandle<()>> {
    if matches!(self.state(), SyncState::Backoff { .. }) {
      self.take_timer()
    } else {
      None
    }
  }

  fn take_timer(&self) -> Option<JoinHandle<()>> {
    self.inner.timer.lock().ok().and_then(|mut slot| slot.take())
  }

  /// Drop a pending backoff and go idle so the next trigger starts a fresh pass.
  fn cancel_backoff(&self) {
    if let Some(timer) = self.take_timer() {
      timer.abort();
    }
    let cancelled = self.inner.state.send_if_modified(|state| {
      if matches!(state, SyncState::Backoff { .. }) {
        *state = SyncState::Idle;
        true
      } else {
        false
      }
    });
    if cancelled {
      info!("pending backoff cancelled");
    }
  }

  /// Leave `Syncing`, arming the backoff timer if the head is parked.
  fn finish(&self, report: &SyncReport) {
    match report.outcome {
      PassOutcome::BackingOff {
        retry_count, delay, ..
      } => {
        self.arm_backoff(|_| true, retry_count, delay);
      }
      _ => {
        self.inner.state.send_replace(SyncState::Idle);
      }
    }
  }

  /// An attempt made outside a pass (a direct call from the façade) failed
  /// and the operation was queued with `retry_count` already charged.
  /// Park it the same way a pass would, unless the engine is busy.
  pub(crate) fn defer(&self, retry_count: u32) {
    let delay = self.inner.policy.delay_for(retry_count);
    let armed = self.arm_backoff(
      |state| matches!(state, SyncState::Idle),
      retry_count,
      delay,
    );
    if armed {
      debug!(retry_count, ?delay, "queued operation deferred");
    }
  }

  /// Switch to `Backoff` and spawn the retry timer, if `allowed` accepts the
  /// current state. Returns whether the timer was armed.
  fn arm_backoff<F>(&self, allowed: F, retry_count: u32, delay: Duration) -> bool
  where
    F: Fn(&SyncState) -> bool,
  {
    let retry_at = self.inner.clock.now()
      + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

    // Hold the slot while switching state so a concurrent trigger cannot
    // observe Backoff without a timer to cancel
    let Ok(mut slot) = self.inner.timer.lock() else {
      self.inner.state.send_replace(SyncState::Idle);
      return false;
    };
    let switched = self.inner.state.send_if_modified(|state| {
      if !allowed(state) {
        return false;
      }
      *state = SyncState::Backoff {
        attempt: retry_count,
        retry_at,
      };
      true
    });
    if !switched {
      return false;
    }

    if let Some(previous) = slot.take() {
      previous.abort();
    }
    let weak = Arc::downgrade(&self.inner);
    *slot = Some(tokio::spawn(backoff_timer(weak, delay)));
    true
  }

  /// Replay the outbox head-first until it is empty, the head is parked, or
  /// connectivity drops.
  async fn drain(&self) -> SyncReport {
    let mut replayed = 0;
    let mut rejected = 0;

    let outcome = loop {
      if !self.inner.connectivity.is_online() {
        break PassOutcome::WentOffline;
      }

      let op = match self.inner.outbox.head() {
        Ok(Some(op)) => op,
        Ok(None) => break PassOutcome::Drained,
        Err(e) => {
          error!(error = %e, "could not read outbox");
          break PassOutcome::StorageFailed(e.to_string());
        }
      };

      let result = self
        .inner
        .transport
        .send(op.method, &op.endpoint, op.payload.as_ref(), self.inner.timeout)
        .await;

      match classify(&result) {
        Disposition::Success => {
          let status = result.as_ref().map(|r| r.status).unwrap_or_default();
          if let Err(e) = self.inner.outbox.remove(op.id) {
            // Remote has it; it will be replayed again (at-least-once)
            error!(id = %op.id, error = %e, "could not remove confirmed operation");
            break PassOutcome::StorageFailed(e.to_string());
          }
          debug!(id = %op.id, status, "operation replayed");
          replayed += 1;
          self.emit(SyncEvent::Replayed { id: op.id, status });
        }
        Disposition::Terminal => {
          let reason = match &result {
            Ok(response) => RejectReason::Status {
              status: response.status,
              message: response.error_message(),
            },
            Err(e) => RejectReason::Invalid(e.to_string()),
          };
          if let Err(e) = self.reject(op, reason) {
            break PassOutcome::StorageFailed(e);
          }
          rejected += 1;
        }
        Disposition::Retryable => {
          if !self.inner.connectivity.is_online() {
            // Dropped mid-call: not the operation's fault
            break PassOutcome::WentOffline;
          }

          let message = describe_failure(&result);
          let retry_count = op.retry_count.saturating_add(1);

          if self.inner.policy.retries_exhausted(retry_count) {
            if let Err(e) = self.reject(op, RejectReason::RetriesExhausted { last_error: message }) {
              break PassOutcome::StorageFailed(e);
            }
            rejected += 1;
            continue;
          }

          if self.is_expired(&op) {
            if let Err(e) = self.reject(op, RejectReason::Expired { last_error: message }) {
              break PassOutcome::StorageFailed(e);
            }
            rejected += 1;
            continue;
          }

          if let Err(e) = self
            .inner
            .outbox
            .update(op.id, retry_count, Some(message.clone()))
          {
            error!(id = %op.id, error = %e, "could not record failed attempt");
            break PassOutcome::StorageFailed(e.to_string());
          }

          let delay = self.inner.policy.delay_for(retry_count);
          let transient = SyncTransientError {
            id: op.id,
            retry_count,
            delay,
            message,
          };
          warn!(%transient, "replay deferred");
          self.emit(SyncEvent::Deferred(transient));

          break PassOutcome::BackingOff {
            id: op.id,
            retry_count,
            delay,
          };
        }
      }
    };

    SyncReport {
      replayed,
      rejected,
      outcome,
    }
  }

  fn is_expired(&self, op: &QueuedOperation) -> bool {
    let age = self.inner.clock.now() - op.enqueued_at;
    match chrono::Duration::from_std(self.inner.policy.max_age) {
      Ok(max_age) => age >= max_age,
      Err(_) => false,
    }
  }

  /// Remove a rejected operation and notify listeners.
  fn reject(&self, op: QueuedOperation, reason: RejectReason) -> Result<(), String> {
    if let Err(e) = self.inner.outbox.remove(op.id) {
      error!(id = %op.id, error = %e, "could not remove rejected operation");
      return Err(e.to_string());
    }
    let rejection = SyncReplayError {
      operation: op,
      reason,
    };
    error!(%rejection, "queued operation dropped");
    self.emit(SyncEvent::Rejected(rejection));
    Ok(())
  }

  fn emit(&self, event: SyncEvent) {
    // No listeners is fine
    let _ = self.inner.events.send(event);
  }
}

/// Wait out a backoff delay, then retry the head operation.
async fn backoff_timer(engine: Weak<EngineInner>, delay: Duration) {
  tokio::time::sleep(delay).await;

  let Some(inner) = engine.upgrade() else {
    return;
  };
  let engine = SyncEngine { inner };

  // Whoever took the handle first (an edge, resume, teardown) owns the retry
  if engine.take_timer().is_none() {
    return;
  }
  engine.trigger(SyncTrigger::BackoffElapsed).await;
}

fn describe_failure(result: &Result<TransportResponse, TransportError>) -> String {
  match result {
    Ok(response) => match response.body.get("message").and_then(|m| m.as_str()) {
      Some(message) => format!("HTTP {}: {}", response.status, message),
      None => format!("HTTP {}", response.status),
    },
    Err(e) => e.to_string(),
  }
}
