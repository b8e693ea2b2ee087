//! Request façade: the single entry point for the rest of the application.
//!
//! | request            | online                                   | offline                 |
//! |--------------------|------------------------------------------|-------------------------|
//! | GET                | network, write-through; cache on failure | cache (fresh or stale)  |
//! | POST/PUT/PATCH/DEL | network; queue on retryable failure      | queue                   |
//!
//! Mutations issued while the outbox still holds unconfirmed operations are
//! queued behind them rather than sent out of order.

mod error;
mod outcome;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub use error::RequestError;
pub use outcome::{CacheStats, DataSource, RequestOutcome};

use crate::cache::{CacheStore, RequestKey};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::outbox::{Outbox, OutboxResult};
use crate::payload::Payload;
use crate::storage::{KvStore, SqliteKv};
use crate::sync::{FlushResult, RetryPolicy, SyncEngine, SyncEvent, SyncState, SyncTrigger};
use crate::transport::{
  classify, Disposition, HttpTransport, Method, Transport, TransportError, TransportResponse,
};

/// Tunables for [`OfflineClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
  pub cache_ttl: Duration,
  pub request_timeout: Duration,
  pub retry: RetryPolicy,
}

impl ClientOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      cache_ttl: config.cache_ttl(),
      request_timeout: config.request_timeout(),
      retry: RetryPolicy::from_config(&config.sync),
    }
  }
}

/// Offline-first client for the household API.
#[derive(Clone)]
pub struct OfflineClient {
  cache: CacheStore,
  outbox: Arc<Outbox>,
  connectivity: ConnectivityMonitor,
  transport: Arc<dyn Transport>,
  engine: SyncEngine,
  clock: Arc<dyn Clock>,
  options: ClientOptions,
}

impl OfflineClient {
  /// Assemble a client from its parts. Cache and outbox share `storage`
  /// under separate key prefixes.
  pub fn new(
    storage: Arc<dyn KvStore>,
    transport: Arc<dyn Transport>,
    connectivity: ConnectivityMonitor,
    clock: Arc<dyn Clock>,
    options: ClientOptions,
  ) -> OutboxResult<Self> {
    let cache = CacheStore::new(storage.clone(), clock.clone());
    let outbox = Arc::new(Outbox::open(storage, clock.clone())?);
    let engine = SyncEngine::new(
      outbox.clone(),
      connectivity.clone(),
      transport.clone(),
      clock.clone(),
      options.retry,
      options.request_timeout,
    );

    Ok(Self {
      cache,
      outbox,
      connectivity,
      transport,
      engine,
      clock,
      options,
    })
  }

  /// Build a client backed by SQLite and HTTP, as configured.
  pub fn from_config(config: &Config, connectivity: ConnectivityMonitor) -> color_eyre::Result<Self> {
    let storage = SqliteKv::open(&config.database_path()?)?;
    let transport = HttpTransport::new(config)?;
    let client = Self::new(
      Arc::new(storage),
      Arc::new(transport),
      connectivity,
      Arc::new(SystemClock),
      ClientOptions::from_config(config),
    )?;
    Ok(client)
  }

  /// Start replaying on connectivity edges. Flushes leftovers right away
  /// when already online.
  pub fn init(&self) {
    self.engine.init();
  }

  /// Stop reacting to connectivity and cancel pending backoff timers.
  pub fn teardown(&self) {
    self.engine.teardown();
  }

  /// Issue a request against `endpoint` (e.g. `/bookings`).
  ///
  /// For GET, an object `payload` is sent as query parameters. For
  /// mutations it is the JSON body.
  pub async fn request(
    &self,
    method: Method,
    endpoint: &str,
    payload: Option<Payload>,
  ) -> Result<RequestOutcome, RequestError> {
    if method.is_mutation() {
      self.mutate(method, endpoint, payload).await
    } else {
      let endpoint = match &payload {
        Some(params) => with_query(endpoint, params),
        None => endpoint.to_string(),
      };
      self.fetch(&endpoint).await
    }
  }

  async fn fetch(&self, endpoint: &str) -> Result<RequestOutcome, RequestError> {
    let key = RequestKey::new(Method::Get, endpoint, None);

    if !self.connectivity.is_online() {
      return self.cached(&key);
    }

    let result = self
      .transport
      .send(Method::Get, key.endpoint(), None, self.options.request_timeout)
      .await;

    match (classify(&result), result) {
      (Disposition::Success, Ok(response)) => {
        let payload = response.body;
        match self.cache.put(&key, payload.clone(), self.options.cache_ttl) {
          Ok(entry) => Ok(RequestOutcome::Data {
            payload,
            source: DataSource::Network,
            fetched_at: entry.fetched_at,
          }),
          Err(e) => {
            warn!(request = %key, error = %e, "could not refresh cache entry");
            Ok(RequestOutcome::Data {
              payload,
              source: DataSource::Network,
              fetched_at: self.clock.now(),
            })
          }
        }
      }
      (Disposition::Terminal, result) => Err(network_error(result)),
      (_, result) => {
        let error = network_error(result);
        warn!(request = %key, %error, "fetch failed, falling back to cache");
        match self.cached(&key) {
          Err(RequestError::OfflineNoCache { .. }) if self.connectivity.is_online() => Err(error),
          other => other,
        }
      }
    }
  }

  /// Serve `key` from cache, whatever its age.
  fn cached(&self, key: &RequestKey) -> Result<RequestOutcome, RequestError> {
    match self.cache.get(key)?.into_entry() {
      Some((entry, freshness)) => Ok(RequestOutcome::Data {
        payload: entry.payload,
        source: freshness.into(),
        fetched_at: entry.fetched_at,
      }),
      None => Err(RequestError::OfflineNoCache {
        endpoint: key.endpoint().to_string(),
      }),
    }
  }

  async fn mutate(
    &self,
    method: Method,
    endpoint: &str,
    payload: Option<Payload>,
  ) -> Result<RequestOutcome, RequestError> {
    if !self.connectivity.is_online() {
      return self.enqueue(method, endpoint, payload);
    }

    let backlog = self.outbox.len().map_err(RequestError::Outbox)?;
    if backlog > 0 {
      debug!(%method, endpoint, backlog, "queuing behind pending operations");
      let outcome = self.enqueue(method, endpoint, payload)?;
      self.engine.spawn_trigger(SyncTrigger::Manual);
      return Ok(outcome);
    }

    let result = self
      .transport
      .send(method, endpoint, payload.as_ref(), self.options.request_timeout)
      .await;

    match (classify(&result), result) {
      (Disposition::Success, Ok(response)) => Ok(RequestOutcome::Confirmed {
        status: response.status,
        body: response.body,
      }),
      (Disposition::Terminal, result) => Err(network_error(result)),
      (_, result) => {
        let error = network_error(result);
        warn!(%method, endpoint, %error, "mutation failed, queuing for replay");
        self.enqueue_failed(method, endpoint, payload, &error)
      }
    }
  }

  /// Queue a mutation whose direct attempt just failed. The attempt counts
  /// as the first retry, so replay waits out the backoff instead of
  /// hitting the remote again straight away.
  fn enqueue_failed(
    &self,
    method: Method,
    endpoint: &str,
    payload: Option<Payload>,
    error: &RequestError,
  ) -> Result<RequestOutcome, RequestError> {
    let outcome = self.enqueue(method, endpoint, payload)?;
    if let RequestOutcome::Queued { id, .. } = &outcome {
      self
        .outbox
        .update(*id, 1, Some(error.to_string()))
        .map_err(RequestError::QueueWrite)?;
      self.engine.defer(1);
    }
    Ok(outcome)
  }

  fn enqueue(
    &self,
    method: Method,
    endpoint: &str,
    payload: Option<Payload>,
  ) -> Result<RequestOutcome, RequestError> {
    let op = self
      .outbox
      .enqueue(method, endpoint, payload)
      .map_err(RequestError::QueueWrite)?;
    info!(id = %op.id, %method, endpoint, "mutation queued");
    Ok(RequestOutcome::Queued {
      id: op.id,
      enqueued_at: op.enqueued_at,
    })
  }

  /// Manually replay the outbox (e.g. pull-to-refresh).
  pub async fn sync_queued_operations(&self) -> FlushResult {
    self.engine.flush().await
  }

  /// The application returned to the foreground.
  pub async fn resume(&self) -> FlushResult {
    self.engine.resume().await
  }

  pub fn cache_stats(&self) -> Result<CacheStats, RequestError> {
    Ok(CacheStats {
      cache_size: self.cache.len()?,
      queue_size: self.outbox.len().map_err(RequestError::Outbox)?,
      is_online: self.connectivity.is_online(),
    })
  }

  /// Drop cached responses, optionally only those under `endpoint_prefix`.
  /// Returns how many entries were removed.
  pub fn clear_cache(&self, endpoint_prefix: Option<&str>) -> Result<usize, RequestError> {
    Ok(self.cache.clear(endpoint_prefix)?)
  }

  /// Discard every queued mutation without replaying it.
  pub fn purge_outbox(&self) -> Result<usize, RequestError> {
    self.outbox.purge().map_err(RequestError::Outbox)
  }

  pub fn sync_state(&self) -> SyncState {
    self.engine.state()
  }

  pub fn watch_sync_state(&self) -> watch::Receiver<SyncState> {
    self.engine.watch_state()
  }

  /// Replay notifications, including rejections of queued mutations.
  pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
    self.engine.subscribe_events()
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.connectivity
  }
}

fn network_error(result: Result<TransportResponse, TransportError>) -> RequestError {
  match result {
    Ok(response) => RequestError::Network {
      status: Some(response.status),
      message: response.error_message(),
    },
    Err(e) => RequestError::Network {
      status: None,
      message: e.to_string(),
    },
  }
}

/// Append the fields of an object payload to `endpoint` as query parameters.
fn with_query(endpoint: &str, params: &Payload) -> String {
  let Some(fields) = params.as_value().as_object() else {
    warn!(endpoint, "ignoring non-object GET parameters");
    return endpoint.to_string();
  };
  if fields.is_empty() {
    return endpoint.to_string();
  }

  let mut query = url::form_urlencoded::Serializer::new(String::new());
  for (name, value) in fields {
    match value {
      Value::String(s) => query.append_pair(name, s),
      Value::Null => query.append_key_only(name),
      other => query.append_pair(name, &other.to_string()),
    };
  }

  let separator = if endpoint.contains('?') { '&' } else { '?' };
  format!("{}{}{}", endpoint, separator, query.finish())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Freshness;
  use crate::clock::ManualClock;
  use crate::connectivity::Reachability;
  use crate::storage::MemoryKv;
  use crate::testing::{instant_monitor, FailingKv, MockTransport};
  use serde_json::json;

  struct Harness {
    client: OfflineClient,
    transport: Arc<MockTransport>,
    monitor: ConnectivityMonitor,
    clock: Arc<ManualClock>,
  }

  fn harness_with(storage: Arc<dyn KvStore>, initial: Reachability) -> Harness {
    let clock = Arc::new(ManualClock::at_epoch());
    let transport = Arc::new(MockTransport::new());
    let monitor = instant_monitor(initial);
    let options = ClientOptions {
      cache_ttl: Duration::from_millis(300_000),
      request_timeout: Duration::from_secs(5),
      retry: RetryPolicy {
        base_delay: Duration::from_secs(3600),
        max_delay: Duration::from_secs(3600),
        ..RetryPolicy::default()
      },
    };
    let client = OfflineClient::new(
      storage,
      transport.clone(),
      monitor.clone(),
      clock.clone(),
      options,
    )
    .unwrap();
    Harness {
      client,
      transport,
      monitor,
      clock,
    }
  }

  fn harness(initial: Reachability) -> Harness {
    harness_with(Arc::new(MemoryKv::new()), initial)
  }

  fn body(value: Value) -> Option<Payload> {
    Some(Payload::from_value(value).unwrap())
  }

  #[tokio::test]
  async fn test_online_get_writes_through() {
    let h = harness(Reachability::Online);
    h.clock.advance(chrono::Duration::seconds(42));
    let requested_at = h.clock.now();
    h.transport
      .push_response(TransportResponse::new(200, json!({"id": "123"})));

    let outcome = h.client.request(Method::Get, "/bookings/123", None).await.unwrap();

    assert_eq!(
      outcome,
      RequestOutcome::Data {
        payload: json!({"id": "123"}),
        source: DataSource::Network,
        fetched_at: requested_at,
      }
    );
    let key = RequestKey::new(Method::Get, "/bookings/123", None);
    let (entry, freshness) = h.client.cache.get(&key).unwrap().into_entry().unwrap();
    assert_eq!(entry.fetched_at, requested_at);
    assert_eq!(entry.payload, json!({"id": "123"}));
    assert_eq!(freshness, Freshness::Fresh);
  }

  #[tokio::test]
  async fn test_online_get_refreshes_fresh_entry() {
    let h = harness(Reachability::Online);
    h.transport.push_response(TransportResponse::new(200, json!([1])));
    h.transport.push_response(TransportResponse::new(200, json!([1, 2])));

    h.client.request(Method::Get, "/chores", None).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(10));
    h.client.request(Method::Get, "/chores", None).await.unwrap();

    assert_eq!(h.transport.call_count(), 2);
    let key = RequestKey::new(Method::Get, "/chores", None);
    let entry = h.client.cache.get(&key).unwrap().into_entry().unwrap().0;
    assert_eq!(entry.payload, json!([1, 2]));
    assert_eq!(entry.fetched_at, h.clock.now());
  }

  #[tokio::test]
  async fn test_offline_get_serves_fresh_then_stale() {
    let h = harness(Reachability::Online);
    h.transport
      .push_response(TransportResponse::new(200, json!({"id": "123"})));
    h.client.request(Method::Get, "/bookings/123", None).await.unwrap();

    h.monitor.report(Reachability::Offline);

    h.clock.advance(chrono::Duration::milliseconds(250_000));
    let fresh = h.client.request(Method::Get, "/bookings/123", None).await.unwrap();
    assert!(matches!(
      fresh,
      RequestOutcome::Data { ref payload, source: DataSource::CacheFresh, .. } if *payload == json!({"id": "123"})
    ));

    h.clock.advance(chrono::Duration::milliseconds(150_000));
    let stale = h.client.request(Method::Get, "/bookings/123", None).await.unwrap();
    assert!(matches!(
      stale,
      RequestOutcome::Data { ref payload, source: DataSource::CacheStale, .. } if *payload == json!({"id": "123"})
    ));

    assert_eq!(h.transport.call_count(), 1);
  }

  #[tokio::test]
  async fn test_offline_get_without_cache() {
    let h = harness(Reachability::Offline);

    let err = h.client.request(Method::Get, "/inventory", None).await.unwrap_err();

    assert!(matches!(err, RequestError::OfflineNoCache { ref endpoint } if endpoint == "/inventory"));
    assert_eq!(h.transport.call_count(), 0);
  }

  #[tokio::test]
  async fn test_get_falls_back_to_stale_cache_on_server_error() {
    let h = harness(Reachability::Online);
    h.transport
      .push_response(TransportResponse::new(200, json!({"items": ["milk"]})));
    h.client.request(Method::Get, "/inventory", None).await.unwrap();

    h.clock.advance(chrono::Duration::seconds(600));
    h.transport.push_status(503);
    let outcome = h.client.request(Method::Get, "/inventory", None).await.unwrap();

    assert!(matches!(
      outcome,
      RequestOutcome::Data { source: DataSource::CacheStale, .. }
    ));
  }

  #[tokio::test]
  async fn test_get_failure_without_cache_is_network_error() {
    let h = harness(Reachability::Online);
    h.transport
      .push_error(TransportError::Timeout(Duration::from_secs(5)));

    let err = h.client.request(Method::Get, "/inventory", None).await.unwrap_err();

    assert!(matches!(err, RequestError::Network { status: None, .. }));
  }

  #[tokio::test]
  async fn test_get_not_found_skips_cache() {
    let h = harness(Reachability::Online);
    h.transport
      .push_response(TransportResponse::new(200, json!({"id": 9})));
    h.client.request(Method::Get, "/bookings/9", None).await.unwrap();

    h.transport.push_response(TransportResponse::new(
      404,
      json!({"error": "NotFound", "message": "Booking not found"}),
    ));
    let err = h.client.request(Method::Get, "/bookings/9", None).await.unwrap_err();

    assert!(matches!(
      err,
      RequestError::Network { status: Some(404), ref message } if message == "Booking not found"
    ));
  }

  #[tokio::test]
  async fn test_get_params_become_query() {
    let h = harness(Reachability::Online);

    h.client
      .request(
        Method::Get,
        "/bookings",
        body(json!({"status": "upcoming", "limit": 5})),
      )
      .await
      .unwrap();

    let calls = h.transport.calls();
    assert_eq!(calls[0].endpoint, "/bookings?limit=5&status=upcoming");
    assert_eq!(calls[0].payload, None);
  }

  #[tokio::test]
  async fn test_online_mutation_is_confirmed() {
    let h = harness(Reachability::Online);
    h.transport
      .push_response(TransportResponse::new(201, json!({"id": 77})));

    let outcome = h
      .client
      .request(Method::Post, "/maintenance", body(json!({"title": "Leak"})))
      .await
      .unwrap();

    assert_eq!(
      outcome,
      RequestOutcome::Confirmed {
        status: 201,
        body: json!({"id": 77})
      }
    );
    assert_eq!(h.client.cache_stats().unwrap().queue_size, 0);
  }

  #[tokio::test]
  async fn test_offline_mutation_is_queued() {
    let h = harness(Reachability::Offline);

    let outcome = h
      .client
      .request(Method::Post, "/bookings", body(json!({"guest": "X"})))
      .await
      .unwrap();

    assert!(outcome.is_queued());
    assert_eq!(outcome.payload(), None);
    assert_eq!(h.transport.call_count(), 0);
    let stats = h.client.cache_stats().unwrap();
    assert_eq!(stats.queue_size, 1);
    assert!(!stats.is_online);
  }

  #[tokio::test]
  async fn test_retryable_mutation_failure_is_queued() {
    let h = harness(Reachability::Online);
    h.transport
      .push_error(TransportError::Connection("connection reset".into()));

    let outcome = h
      .client
      .request(Method::Put, "/bookings/3", body(json!({"nights": 2})))
      .await
      .unwrap();

    assert!(outcome.is_queued());
    assert_eq!(h.client.outbox.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_failed_mutation_waits_for_backoff() {
    let h = harness(Reachability::Online);
    h.transport.push_status(503);
    h.transport.push_status(503);

    let outcome = h
      .client
      .request(Method::Post, "/bookings", body(json!({"guest": "X"})))
      .await
      .unwrap();
    assert!(outcome.is_queued());

    for _ in 0..10 {
      tokio::task::yield_now().await;
    }

    assert_eq!(h.transport.call_count(), 1);
    let head = h.client.outbox.head().unwrap().unwrap();
    assert_eq!(head.retry_count, 1);
    assert!(head.last_error.unwrap().contains("503"));
    assert!(matches!(
      h.client.sync_state(),
      SyncState::Backoff { attempt: 1, .. }
    ));
    h.client.teardown();
  }

  #[tokio::test]
  async fn test_created_with_text_body_is_confirmed() {
    let h = harness(Reachability::Online);
    h.transport
      .push_response(TransportResponse::new(201, Value::String("Created".into())));

    let outcome = h
      .client
      .request(Method::Post, "/bookings", body(json!({"guest": "X"})))
      .await
      .unwrap();

    assert!(!outcome.is_queued());
    assert_eq!(h.transport.call_count(), 1);
    assert!(h.client.outbox.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_rejected_mutation_is_not_queued() {
    let h = harness(Reachability::Online);
    h.transport.push_response(TransportResponse::new(
      400,
      json!({"error": "ValidationError", "message": "Check-out must be after check-in"}),
    ));

    let err = h
      .client
      .request(Method::Post, "/bookings", body(json!({"guest": "X"})))
      .await
      .unwrap_err();

    assert_eq!(err.status(), Some(400));
    assert!(h.client.outbox.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_mutation_queues_behind_backlog() {
    let h = harness(Reachability::Offline);
    h.client
      .request(Method::Post, "/bookings", body(json!({"n": 1})))
      .await
      .unwrap();

    // Flip online without a running engine so nothing drains the backlog
    h.monitor.report(Reachability::Online);
    let outcome = h
      .client
      .request(Method::Post, "/bookings", body(json!({"n": 2})))
      .await
      .unwrap();

    assert!(outcome.is_queued());
    assert_eq!(h.transport.call_count(), 0);

    let FlushResult::Completed(report) = h.client.sync_queued_operations().await else {
      panic!("expected a completed pass");
    };
    assert_eq!(report.replayed, 2);

    let sent: Vec<_> = h
      .transport
      .calls()
      .into_iter()
      .map(|c| c.payload.unwrap())
      .collect();
    assert_eq!(sent, vec![json!({"n": 1}), json!({"n": 2})]);
  }

  #[tokio::test]
  async fn test_queue_write_failure_is_surfaced() {
    let storage = Arc::new(FailingKv::new());
    let h = harness_with(storage.clone(), Reachability::Offline);
    storage.fail_writes(true);

    let err = h
      .client
      .request(Method::Delete, "/bookings/5", None)
      .await
      .unwrap_err();

    assert!(matches!(err, RequestError::QueueWrite(_)));
  }

  #[tokio::test]
  async fn test_offline_post_replays_on_reconnect() {
    let h = harness(Reachability::Offline);
    h.client.init();

    h.client
      .request(Method::Post, "/bookings", body(json!({"guest": "X"})))
      .await
      .unwrap();
    assert_eq!(h.client.cache_stats().unwrap().queue_size, 1);

    let mut state = h.client.watch_sync_state();
    h.monitor.report(Reachability::Online);
    state.changed().await.unwrap();
    state.wait_for(|s| *s == SyncState::Idle).await.unwrap();

    assert_eq!(h.client.cache_stats().unwrap().queue_size, 0);
    let calls = h.transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].payload, Some(json!({"guest": "X"})));
    h.client.teardown();
  }

  #[tokio::test]
  async fn test_clear_cache_and_purge() {
    let h = harness(Reachability::Online);
    h.client.request(Method::Get, "/bookings", None).await.unwrap();
    h.client.request(Method::Get, "/chores", None).await.unwrap();
    h.monitor.report(Reachability::Offline);
    h.client
      .request(Method::Patch, "/user/profile", body(json!({"name": "N"})))
      .await
      .unwrap();

    assert_eq!(h.client.clear_cache(Some("/chores")).unwrap(), 1);
    assert_eq!(h.client.cache_stats().unwrap().cache_size, 1);
    assert_eq!(h.client.purge_outbox().unwrap(), 1);
    assert_eq!(h.client.clear_cache(None).unwrap(), 1);

    let stats = h.client.cache_stats().unwrap();
    assert_eq!(stats.cache_size, 0);
    assert_eq!(stats.queue_size, 0);
  }

  #[test]
  fn test_with_query_appends() {
    let params = Payload::from_value(json!({"q": "a b"})).unwrap();
    assert_eq!(with_query("/items?x=1", &params), "/items?x=1&q=a+b");

    let empty = Payload::from_value(json!({})).unwrap();
    assert_eq!(with_query("/items", &empty), "/items");
  }
}
