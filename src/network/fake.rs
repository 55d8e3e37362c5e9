//! Scripted in-process network for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::cache::StoredResponse;

use super::client::Network;
use super::request::FetchRequest;

/// Serves canned responses by exact URL and records every request.
///
/// Unknown URLs answer 404. While offline every fetch fails, and failed
/// requests are still recorded.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, StoredResponse>>,
  failing: Mutex<Vec<String>>,
  offline: AtomicBool,
  requests: Mutex<Vec<FetchRequest>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(&self, url: &str, response: StoredResponse) {
    self.routes.lock().unwrap().insert(normalize(url), response);
  }

  /// Make one URL fail at the network level while the rest stay up.
  pub fn fail(&self, url: &str) {
    self.failing.lock().unwrap().push(normalize(url));
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn requests(&self) -> Vec<FetchRequest> {
    self.requests.lock().unwrap().clone()
  }

  pub fn request_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }
}

fn normalize(url: &str) -> String {
  Url::parse(url).map(String::from).unwrap_or_else(|_| url.to_string())
}

impl Network for FakeNetwork {
  async fn fetch(&self, request: &FetchRequest) -> Result<StoredResponse> {
    self.requests.lock().unwrap().push(request.clone());

    let url = request.url.as_str().to_string();
    if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&url) {
      return Err(eyre!("Failed to fetch {}: network unreachable", url));
    }

    let response = self.routes.lock().unwrap().get(&url).cloned();
    Ok(response.unwrap_or_else(|| StoredResponse::new(404, "not found")))
  }
}
