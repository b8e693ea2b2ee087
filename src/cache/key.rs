//! Cache keys for API requests.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::payload::Payload;
use crate::storage::CACHE_PREFIX;
use crate::transport::Method;

/// Identity of a cacheable request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestKey {
  method: Method,
  endpoint: String,
  params: Option<String>,
}

impl RequestKey {
  pub fn new(method: Method, endpoint: &str, params: Option<&Payload>) -> Self {
    Self {
      method,
      endpoint: normalize_endpoint(endpoint),
      // serde_json maps are ordered by key, so this rendering is canonical
      params: params.map(|p| p.as_value().to_string()),
    }
  }

  /// Normalized endpoint this key was built from.
  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  /// SHA256 hash of the canonical request, for stable fixed-length keys.
  pub fn cache_hash(&self) -> String {
    let input = format!(
      "{}:{}:{}",
      self.method,
      self.endpoint,
      self.params.as_deref().unwrap_or("")
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Key under which the entry lives in the key-value store.
  pub fn storage_key(&self) -> String {
    format!("{}{}", CACHE_PREFIX, self.cache_hash())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.endpoint)
  }
}

/// Normalize an endpoint for consistent hashing.
///
/// Trims whitespace and trailing slashes from the path and sorts query
/// parameters, so `/bookings/?b=2&a=1` and `/bookings?a=1&b=2` share a key.
fn normalize_endpoint(endpoint: &str) -> String {
  let endpoint = endpoint.trim();
  let (path, query) = match endpoint.split_once('?') {
    Some((path, query)) => (path, Some(query)),
    None => (endpoint, None),
  };

  let path = match path.trim_end_matches('/') {
    "" => "/",
    trimmed => trimmed,
  };

  let mut pairs: Vec<(String, String)> = query
    .map(|q| {
      url::form_urlencoded::parse(q.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
    })
    .unwrap_or_default();

  if pairs.is_empty() {
    return path.to_string();
  }

  pairs.sort();
  let query = url::form_urlencoded::Serializer::new(String::new())
    .extend_pairs(pairs)
    .finish();
  format!("{}?{}", path, query)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_query_order_does_not_matter() {
    let a = RequestKey::new(Method::Get, "/bookings?status=upcoming&page=2", None);
    let b = RequestKey::new(Method::Get, "/bookings/?page=2&status=upcoming", None);
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.endpoint(), "/bookings?page=2&status=upcoming");
  }

  #[test]
  fn test_params_participate_in_key() {
    let p1 = Payload::from_value(json!({"month": 5, "year": 2024})).unwrap();
    let p2 = Payload::from_value(json!({"year": 2024, "month": 5})).unwrap();
    let p3 = Payload::from_value(json!({"month": 6, "year": 2024})).unwrap();

    let k1 = RequestKey::new(Method::Get, "/bookings/calendar", Some(&p1));
    let k2 = RequestKey::new(Method::Get, "/bookings/calendar", Some(&p2));
    let k3 = RequestKey::new(Method::Get, "/bookings/calendar", Some(&p3));

    assert_eq!(k1.cache_hash(), k2.cache_hash());
    assert_ne!(k1.cache_hash(), k3.cache_hash());
  }

  #[test]
  fn test_storage_key_prefix() {
    let key = RequestKey::new(Method::Get, "/maintenance", None);
    assert!(key.storage_key().starts_with("cache_"));
    assert_eq!(key.storage_key().len(), "cache_".len() + 64);
    assert_eq!(key.to_string(), "GET /maintenance");
  }

  #[test]
  fn test_root_path() {
    assert_eq!(normalize_endpoint("/"), "/");
    assert_eq!(normalize_endpoint(" /dashboard/ "), "/dashboard");
  }
}
