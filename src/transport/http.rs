use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{Method, Transport, TransportError, TransportResponse, TransportResult};
use crate::config::Config;
use crate::payload::Payload;

/// HTTP transport for the household API.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: String,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(config: &Config) -> Result<Self, TransportError> {
    Self::with_base_url(&config.api.base_url, Config::get_api_token())
  }

  pub fn with_base_url(base_url: &str, token: Option<String>) -> Result<Self, TransportError> {
    url::Url::parse(base_url).map_err(|_| TransportError::InvalidEndpoint(base_url.to_string()))?;

    let client = reqwest::Client::builder()
      .user_agent(concat!("hearth/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| TransportError::Connection(e.to_string()))?;

    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
      token,
    })
  }

  /// Resolve an API endpoint (e.g. `/bookings?status=upcoming`) against the base URL.
  fn url_for(&self, endpoint: &str) -> TransportResult<url::Url> {
    if !endpoint.starts_with('/') {
      return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
    }
    url::Url::parse(&format!("{}{}", self.base_url, endpoint))
      .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))
  }
}

fn to_reqwest(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

fn map_error(e: reqwest::Error, timeout: Duration) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout(timeout)
  } else {
    TransportError::Connection(e.to_string())
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(
    &self,
    method: Method,
    endpoint: &str,
    payload: Option<&Payload>,
    timeout: Duration,
  ) -> TransportResult<TransportResponse> {
    let url = self.url_for(endpoint)?;
    debug!(%method, %url, "sending request");

    let mut request = self
      .client
      .request(to_reqwest(method), url)
      .timeout(timeout)
      .header(ACCEPT, "application/json");

    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    if let Some(payload) = payload {
      let body = serde_json::to_vec(payload.as_value())
        .map_err(|e| TransportError::Encode(e.to_string()))?;
      request = request.header(CONTENT_TYPE, "application/json").body(body);
    }

    let response = request.send().await.map_err(|e| map_error(e, timeout))?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await.map_err(|e| map_error(e, timeout))?;

    let body = if bytes.is_empty() {
      Value::Null
    } else {
      // Non-JSON bodies (HTML error pages, `201 Created` as text) are kept
      // as text; the status alone decides whether the call succeeded
      serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };

    Ok(TransportResponse { status, body })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::{classify, Disposition};

  #[test]
  fn test_url_for_keeps_base_path() {
    let transport = HttpTransport::with_base_url("https://household.example.com/api/", None).unwrap();
    let url = transport.url_for("/bookings?status=upcoming").unwrap();
    assert_eq!(
      url.as_str(),
      "https://household.example.com/api/bookings?status=upcoming"
    );
  }

  #[test]
  fn test_url_for_rejects_relative_endpoint() {
    let transport = HttpTransport::with_base_url("https://household.example.com/api", None).unwrap();
    assert!(matches!(
      transport.url_for("bookings"),
      Err(TransportError::InvalidEndpoint(_))
    ));
  }

  /// Serve a single canned HTTP response on a local port.
  async fn serve_once(response: &'static str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 4096];
      let _ = socket.read(&mut buf).await;
      socket.write_all(response.as_bytes()).await.unwrap();
      socket.shutdown().await.unwrap();
    });
    format!("http://{}", addr)
  }

  #[tokio::test]
  async fn test_created_with_text_body_is_success() {
    let base = serve_once(
      "HTTP/1.1 201 Created\r\nContent-Type: text/plain\r\nContent-Length: 7\r\nConnection: close\r\n\r\nCreated",
    )
    .await;
    let transport = HttpTransport::with_base_url(&base, None).unwrap();
    let payload = Payload::from_value(serde_json::json!({"guest": "X"})).unwrap();

    let result = transport
      .send(Method::Post, "/bookings", Some(&payload), Duration::from_secs(5))
      .await;

    assert_eq!(classify(&result), Disposition::Success);
    let response = result.unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.body, Value::String("Created".to_string()));
  }

  #[tokio::test]
  async fn test_html_error_page_keeps_status() {
    let base = serve_once(
      "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/html\r\nContent-Length: 13\r\nConnection: close\r\n\r\n<h1>502</h1>\n",
    )
    .await;
    let transport = HttpTransport::with_base_url(&base, None).unwrap();

    let result = transport
      .send(Method::Get, "/bookings", None, Duration::from_secs(5))
      .await;

    assert_eq!(classify(&result), Disposition::Retryable);
    assert_eq!(result.unwrap().status, 502);
  }

  #[tokio::test]
  async fn test_unreachable_host_is_connection_error() {
    // Port 9 (discard) on localhost is almost never listening
    let transport = HttpTransport::with_base_url("http://127.0.0.1:9", None).unwrap();
    let result = transport
      .send(Method::Get, "/health", None, Duration::from_secs(2))
      .await;
    assert!(matches!(
      result,
      Err(TransportError::Connection(_)) | Err(TransportError::Timeout(_))
    ));
  }
}
