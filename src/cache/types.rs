//! Core types for stored responses and where a served response came from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fully buffered HTTP response, as fetched from the network or read
/// back from a cache generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl StoredResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or_default()
        .to_string(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Synthetic response for a failed request with nothing cached.
  pub fn unavailable() -> Self {
    Self {
      status: 503,
      status_text: "Service Unavailable".to_string(),
      headers: vec![(
        "content-type".to_string(),
        "text/plain; charset=utf-8".to_string(),
      )],
      body: b"Network error".to_vec(),
    }
  }

  /// 2xx, the same test `cache.add` applies.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  #[cfg(test)]
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A response read back from a cache generation.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: StoredResponse,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Result of an intercepted fetch, including metadata about the source.
#[derive(Debug, Clone)]
pub struct Intercepted<T> {
  /// The response handed back to the page
  pub data: T,
  /// Where the response came from
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> Intercepted<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: ResponseSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn offline_fallback(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: ResponseSource::OfflineFallback,
      cached_at: Some(cached_at),
    }
  }

  pub fn unavailable(data: T) -> Self {
    Self {
      data,
      source: ResponseSource::Unavailable,
      cached_at: None,
    }
  }
}

/// Indicates where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Network failed, served the cached entry for this request
  Cache,
  /// Network failed on a navigation with no entry, served the offline page
  OfflineFallback,
  /// Network failed and nothing applicable was cached
  Unavailable,
}

impl ResponseSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::OfflineFallback => "offline-fallback",
      Self::Unavailable => "unavailable",
    }
  }
}
