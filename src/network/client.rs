use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::future::Future;
use tracing::debug;

use crate::cache::StoredResponse;

use super::request::FetchRequest;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// True for hop-by-hop headers and headers the client recomputes.
pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
    || name.eq_ignore_ascii_case("host")
    || name.eq_ignore_ascii_case("content-length")
}

/// The live network.
///
/// Any `Err` means the request failed before a response arrived (offline,
/// DNS, connection reset). HTTP error statuses are `Ok` responses.
pub trait Network: Send + Sync {
  fn fetch(&self, request: &FetchRequest) -> impl Future<Output = Result<StoredResponse>> + Send;
}

/// `reqwest`-backed network client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &FetchRequest) -> Result<StoredResponse> {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
      if is_hop_by_hop(name) {
        continue;
      }
      let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) else {
        continue;
      };
      headers.append(name, value);
    }

    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(headers)
      .body(request.body.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    debug!(url = %request.url, status = status.as_u16(), "fetched");

    Ok(StoredResponse {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}
