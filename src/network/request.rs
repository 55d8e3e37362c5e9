use reqwest::Method;
use url::Url;

/// How the page issued a request, mirroring the Fetch `mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page load
  Navigate,
  SameOrigin,
  #[default]
  NoCors,
  Cors,
}

impl RequestMode {
  /// Parse a `Sec-Fetch-Mode` header value.
  pub fn from_sec_fetch_mode(value: &str) -> Option<Self> {
    match value.trim().to_ascii_lowercase().as_str() {
      "navigate" => Some(Self::Navigate),
      "same-origin" => Some(Self::SameOrigin),
      "no-cors" => Some(Self::NoCors),
      "cors" => Some(Self::Cors),
      _ => None,
    }
  }
}

/// An outgoing request as seen by the cache controller.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl FetchRequest {
  /// A bodiless GET, as issued for precaching and subresources.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::default(),
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  #[cfg(test)]
  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  #[cfg(test)]
  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }
}
