//! Cache keys for stored responses.

use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// Identifies a stored response within a cache generation.
///
/// Two requests share a key when they use the same method and their URLs
/// are equal once the fragment is dropped. The query string is significant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  method: Method,
  url: Url,
}

impl CacheKey {
  pub fn new(method: Method, url: &Url) -> Self {
    Self {
      method,
      url: normalize_url(url),
    }
  }

  /// Key for a plain GET of `url`.
  pub fn get(url: &Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Host of the keyed URL, lowercased by the URL parser.
  pub fn host(&self) -> Option<&str> {
    self.url.host_str()
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let input = format!("{} {}", self.method, self.url);

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
  }
}

/// Drop the fragment; it never reaches the network.
fn normalize_url(url: &Url) -> Url {
  let mut url = url.clone();
  url.set_fragment(None);
  url
}
