//! Shared test helpers.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connectivity::{ConnectivityMonitor, Reachability};
use crate::payload::Payload;
use crate::storage::{KvStore, MemoryKv, StorageError, StorageResult};
use crate::transport::{Method, Transport, TransportError, TransportResponse, TransportResult};

/// A call observed by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
  pub method: Method,
  pub endpoint: String,
  pub payload: Option<Value>,
}

type SendHook = Box<dyn Fn(&RecordedCall) + Send + Sync>;

/// Scripted transport. Replies are consumed in order; once the script runs
/// out every call answers `200 null`.
#[derive(Default)]
pub struct MockTransport {
  script: Mutex<VecDeque<TransportResult<TransportResponse>>>,
  calls: Mutex<Vec<RecordedCall>>,
  latency: Mutex<Option<Duration>>,
  hook: Mutex<Option<SendHook>>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push_response(&self, response: TransportResponse) {
    self.script.lock().unwrap().push_back(Ok(response));
  }

  pub fn push_status(&self, status: u16) {
    self.push_response(TransportResponse::new(status, Value::Null));
  }

  pub fn push_error(&self, error: TransportError) {
    self.script.lock().unwrap().push_back(Err(error));
  }

  /// Delay every call, to keep a sync pass in flight.
  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = Some(latency);
  }

  /// Run `hook` at the start of every call.
  pub fn on_send<F>(&self, hook: F)
  where
    F: Fn(&RecordedCall) + Send + Sync + 'static,
  {
    *self.hook.lock().unwrap() = Some(Box::new(hook));
  }

  pub fn calls(&self) -> Vec<RecordedCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(
    &self,
    method: Method,
    endpoint: &str,
    payload: Option<&Payload>,
    _timeout: Duration,
  ) -> TransportResult<TransportResponse> {
    let call = RecordedCall {
      method,
      endpoint: endpoint.to_string(),
      payload: payload.map(|p| p.as_value().clone()),
    };
    self.calls.lock().unwrap().push(call.clone());

    if let Some(hook) = self.hook.lock().unwrap().as_ref() {
      hook(&call);
    }

    let latency = *self.latency.lock().unwrap();
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }

    self
      .script
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Ok(TransportResponse::new(200, Value::Null)))
  }
}

/// A monitor with no debounce, so reports take effect immediately.
pub fn instant_monitor(initial: Reachability) -> ConnectivityMonitor {
  ConnectivityMonitor::new(
    initial,
    Duration::ZERO,
    Arc::new(crate::clock::ManualClock::at_epoch()),
  )
}

/// In-memory store whose writes can be made to fail, e.g. a full disk.
#[derive(Default)]
pub struct FailingKv {
  inner: MemoryKv,
  fail_writes: AtomicBool,
}

impl FailingKv {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  fn check(&self) -> StorageResult<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(StorageError::Io(std::io::Error::other("no space left on device")));
    }
    Ok(())
  }
}

impl KvStore for FailingKv {
  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    self.inner.get(key)
  }

  fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    self.check()?;
    self.inner.set(key, value)
  }

  fn remove(&self, key: &str) -> StorageResult<bool> {
    self.check()?;
    self.inner.remove(key)
  }

  fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
    self.inner.list_keys(prefix)
  }
}
