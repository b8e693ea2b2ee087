use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{ConnectivityState, Reachability};
use crate::clock::Clock;

type Callback = Arc<dyn Fn(&ConnectivityState) + Send + Sync>;

/// A reachability change waiting out the debounce window.
#[derive(Default)]
struct Pending {
  /// Bumped whenever the pending target changes; a delayed commit only
  /// lands if its generation is still current
  generation: u64,
  target: Option<bool>,
}

struct MonitorInner {
  state: watch::Sender<ConnectivityState>,
  debounce: Duration,
  clock: Arc<dyn Clock>,
  pending: Mutex<Pending>,
  subscribers: Mutex<Vec<(u64, Callback)>>,
  next_subscriber: AtomicU64,
}

/// Debounced connectivity state with edge notifications.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
  /// Create a monitor. `debounce` is how long a reachability change must
  /// hold before it is committed as an edge; zero commits immediately.
  pub fn new(initial: Reachability, debounce: Duration, clock: Arc<dyn Clock>) -> Self {
    let (state, _) = watch::channel(ConnectivityState {
      is_online: initial.is_online(),
      transitioned_at: clock.now(),
    });

    Self {
      inner: Arc::new(MonitorInner {
        state,
        debounce,
        clock,
        pending: Mutex::new(Pending::default()),
        subscribers: Mutex::new(Vec::new()),
        next_subscriber: AtomicU64::new(1),
      }),
    }
  }

  /// Current committed state.
  pub fn current(&self) -> ConnectivityState {
    *self.inner.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current().is_online
  }

  /// Receiver that observes every committed state.
  pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
    self.inner.state.subscribe()
  }

  /// Feed a raw reachability observation from the platform.
  ///
  /// Repeated reports of the committed state are ignored, and a change that
  /// is reverted within the debounce window never produces an edge.
  pub fn report(&self, reachability: Reachability) {
    let is_online = reachability.is_online();

    let generation = {
      let Ok(mut pending) = self.inner.pending.lock() else {
        return;
      };
      if is_online == self.is_online() {
        // Back to the committed state: cancel whatever was counting down
        if pending.target.take().is_some() {
          pending.generation += 1;
        }
        return;
      }
      if pending.target == Some(is_online) {
        return;
      }
      pending.generation += 1;
      pending.target = Some(is_online);
      pending.generation
    };

    if self.inner.debounce.is_zero() {
      self.inner.settle(generation, is_online);
      return;
    }

    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      self.inner.settle(generation, is_online);
      return;
    };

    let inner = Arc::clone(&self.inner);
    handle.spawn(async move {
      tokio::time::sleep(inner.debounce).await;
      inner.settle(generation, is_online);
    });
  }

  /// Register a callback invoked once per committed edge.
  ///
  /// Callbacks run synchronously on the thread that commits the edge and
  /// may call back into the monitor or trigger work that subscribes again.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&ConnectivityState) + Send + Sync + 'static,
  {
    let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut subscribers) = self.inner.subscribers.lock() {
      subscribers.push((id, Arc::new(callback)));
    }
    Subscription {
      id,
      monitor: Arc::downgrade(&self.inner),
    }
  }

  /// Number of live subscriptions.
  pub fn subscriber_count(&self) -> usize {
    self
      .inner
      .subscribers
      .lock()
      .map(|s| s.len())
      .unwrap_or_default()
  }
}

impl MonitorInner {
  /// Commit a pending change if nothing newer superseded it.
  fn settle(&self, generation: u64, is_online: bool) {
    let committed = {
      let Ok(mut pending) = self.pending.lock() else {
        return;
      };
      if pending.generation != generation {
        debug!(is_online, "connectivity change superseded within debounce window");
        return;
      }
      pending.target = None;
      // Commit under the same lock `report` compares against, so a report
      // cannot act on the old state while this edge lands
      self.commit(is_online)
    };

    if let Some(state) = committed {
      info!(is_online, "connectivity edge");
      self.notify(&state);
    }
  }

  /// Publish `is_online` to watchers. Returns the new state if it changed.
  fn commit(&self, is_online: bool) -> Option<ConnectivityState> {
    let now = self.clock.now();
    let mut committed = None;
    self.state.send_if_modified(|state| {
      if state.is_online == is_online {
        return false;
      }
      *state = ConnectivityState {
        is_online,
        transitioned_at: now,
      };
      committed = Some(*state);
      true
    });
    committed
  }

  fn notify(&self, state: &ConnectivityState) {
    // Snapshot so callbacks can (un)subscribe without deadlocking
    let callbacks: Vec<Callback> = match self.subscribers.lock() {
      Ok(subscribers) => subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
      Err(_) => return,
    };
    for callback in callbacks {
      callback(state);
    }
  }

  fn unsubscribe(&self, id: u64) {
    if let Ok(mut subscribers) = self.subscribers.lock() {
      subscribers.retain(|(sub_id, _)| *sub_id != id);
    }
  }
}

/// Handle for a connectivity subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  id: u64,
  monitor: Weak<MonitorInner>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(monitor) = self.monitor.upgrade() {
      monitor.unsubscribe(self.id);
    }
  }
}
