use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{ConnectivityMonitor, Reachability};
use crate::transport::{Method, Transport, TransportError};

/// Platform reachability source.
#[async_trait]
pub trait ReachabilityProvider: Send + Sync {
  /// Check reachability right now.
  async fn check(&self) -> Reachability;
}

/// Reachability provider that probes an API endpoint.
///
/// Any HTTP answer (even an error status) proves the remote is reachable;
/// timeouts and connection failures mean offline.
pub struct HttpProbe {
  transport: Arc<dyn Transport>,
  endpoint: String,
  timeout: Duration,
}

impl HttpProbe {
  pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<String>, timeout: Duration) -> Self {
    Self {
      transport,
      endpoint: endpoint.into(),
      timeout,
    }
  }
}

#[async_trait]
impl ReachabilityProvider for HttpProbe {
  async fn check(&self) -> Reachability {
    match self
      .transport
      .send(Method::Get, &self.endpoint, None, self.timeout)
      .await
    {
      Ok(_) => Reachability::Online,
      Err(TransportError::Timeout(_)) | Err(TransportError::Connection(_)) => Reachability::Offline,
      Err(TransportError::InvalidEndpoint(_)) | Err(TransportError::Encode(_)) => {
        Reachability::Unknown
      }
    }
  }
}

impl ConnectivityMonitor {
  /// Poll `provider` every `interval` and feed the results into the monitor.
  pub fn spawn_polling(
    &self,
    provider: Arc<dyn ReachabilityProvider>,
    interval: Duration,
  ) -> JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let reachability = provider.check().await;
        debug!(?reachability, "reachability probe");
        monitor.report(reachability);
      }
    })
  }
}
