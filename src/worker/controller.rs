//! Offline cache controller: install, activate and network-first interception.

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, try_join_all};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::{Origin, Url};

use crate::cache::{CacheKey, CacheStorage, CachedEntry, Intercepted, StoredResponse};
use crate::config::Config;
use crate::network::{FetchRequest, Network};

use super::lifecycle::WorkerState;
use super::message::{ControlMessage, CONTACT_FORM_SYNC};

/// Resolved controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
  /// Name of the current cache generation
  pub version: String,
  pub origin: Url,
  pub offline_url: Url,
  /// Same-origin manifest entries; all must succeed at install
  pub precache_local: Vec<Url>,
  /// Cross-origin manifest entries; best-effort
  pub precache_remote: Vec<Url>,
  pub excluded_hosts: BTreeSet<String>,
  /// Origins cached at runtime besides our own
  pub cdn_origins: Vec<Origin>,
}

impl ControllerConfig {
  pub fn new(version: &str, origin: Url) -> Result<Self> {
    let offline_url = origin
      .join("/offline.html")
      .map_err(|e| eyre!("Invalid offline URL: {}", e))?;

    Ok(Self {
      version: version.to_string(),
      origin,
      offline_url,
      precache_local: Vec::new(),
      precache_remote: Vec::new(),
      excluded_hosts: BTreeSet::new(),
      cdn_origins: Vec::new(),
    })
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    let mut resolved = Self::new(&config.cache.version, config.origin.clone())?
      .with_offline_url(&config.offline_url)?
      .with_precache(&config.precache)?
      .with_cdn_allowlist(&config.cdn_allowlist)?;
    resolved.excluded_hosts = config.excluded_hosts.clone();
    Ok(resolved)
  }

  pub fn with_offline_url(mut self, path: &str) -> Result<Self> {
    self.offline_url = self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid offline URL {}: {}", path, e))?;
    Ok(self)
  }

  /// Split manifest entries: absolute http(s) URLs are cross-origin, the
  /// rest are paths on our origin.
  pub fn with_precache<T: AsRef<str>>(mut self, entries: &[T]) -> Result<Self> {
    for entry in entries {
      let entry = entry.as_ref();
      if entry.starts_with("http://") || entry.starts_with("https://") {
        let url = Url::parse(entry).map_err(|e| eyre!("Invalid precache URL {}: {}", entry, e))?;
        self.precache_remote.push(url);
      } else {
        let url = self
          .origin
          .join(entry)
          .map_err(|e| eyre!("Invalid precache path {}: {}", entry, e))?;
        self.precache_local.push(url);
      }
    }
    Ok(self)
  }

  #[cfg(test)]
  pub fn with_excluded_host(mut self, host: &str) -> Self {
    self.excluded_hosts.insert(host.to_lowercase());
    self
  }

  pub fn with_cdn_allowlist<T: AsRef<str>>(mut self, entries: &[T]) -> Result<Self> {
    for entry in entries {
      let entry = entry.as_ref();
      let url = Url::parse(entry).map_err(|e| eyre!("Invalid CDN URL {}: {}", entry, e))?;
      let origin = url.origin();
      if !self.cdn_origins.contains(&origin) {
        self.cdn_origins.push(origin);
      }
    }
    Ok(self)
  }

  /// Exact host match; a trailing root dot is ignored.
  fn is_excluded(&self, url: &Url) -> bool {
    url
      .host_str()
      .is_some_and(|host| self.excluded_hosts.contains(host.trim_end_matches('.')))
  }

  fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  /// Same-origin or allow-listed CDN.
  fn is_cacheable(&self, url: &Url) -> bool {
    if self.is_same_origin(url) {
      return true;
    }
    let origin = url.origin();
    self.cdn_origins.iter().any(|cdn| *cdn == origin)
  }
}

/// Why a request was left to the network untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
  /// Controller is not activated yet
  NotActive,
  NonGet,
  NonHttp,
  ExcludedHost,
}

/// What the host should do with a request.
#[derive(Debug)]
pub enum FetchOutcome {
  /// Forward to the network as if no controller existed
  Passthrough(PassthroughReason),
  /// Reply with this response
  Respond(Intercepted<StoredResponse>),
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
  pub state: WorkerState,
  pub version: String,
  /// Generation answering intercepted requests
  pub active_generation: Option<String>,
  pub skip_waiting: bool,
  pub clients_claimed: bool,
  pub generations: Vec<String>,
  pub entry_count: usize,
}

/// The offline cache controller.
///
/// Owns one storage handle and one network client. Lifecycle entry points
/// are [`install`](Self::install), [`activate`](Self::activate),
/// [`handle_fetch`](Self::handle_fetch) and
/// [`handle_message`](Self::handle_message).
pub struct OfflineCacheController<S: CacheStorage, N: Network> {
  config: ControllerConfig,
  storage: Arc<S>,
  network: Arc<N>,
  state: Mutex<WorkerState>,
  /// Generation answering intercepted requests. Survives failed installs.
  active: Mutex<Option<String>>,
  skip_waiting: AtomicBool,
  clients_claimed: AtomicBool,
  /// Background cache writes not yet joined
  pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, N> OfflineCacheController<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  pub fn new(config: ControllerConfig, storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      config,
      storage,
      network,
      state: Mutex::new(WorkerState::Parsed),
      active: Mutex::new(None),
      skip_waiting: AtomicBool::new(false),
      clients_claimed: AtomicBool::new(false),
      pending_writes: Mutex::new(Vec::new()),
    }
  }

  pub fn config(&self) -> &ControllerConfig {
    &self.config
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  /// Move to `to` if the current state passes `allowed`. Returns the
  /// state left behind.
  fn transition(
    &self,
    allowed: fn(WorkerState) -> bool,
    to: WorkerState,
  ) -> Result<WorkerState> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if !allowed(*state) {
      return Err(eyre!("Cannot enter {} from {}", to, *state));
    }
    Ok(std::mem::replace(&mut *state, to))
  }

  pub fn active_generation(&self) -> Option<String> {
    self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  fn set_active(&self, generation: &str) {
    *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(generation.to_string());
  }

  /// Pick up a generation left on disk by an earlier run, so requests are
  /// answered while the refresh install runs. Prefers the current
  /// version, then the newest other generation with entries.
  ///
  /// Returns the generation now answering requests, if any.
  pub fn resume(&self) -> Result<Option<String>> {
    if self.state() != WorkerState::Parsed || self.active_generation().is_some() {
      return Ok(self.active_generation());
    }

    let names = self.storage.generation_names()?;
    let version = &self.config.version;
    let current = names.iter().filter(|name| *name == version);
    let older = names.iter().rev().filter(|name| *name != version);

    for name in current.chain(older) {
      if self.storage.entry_count(name)? == 0 {
        continue;
      }
      info!(generation = %name, "resuming from cached generation");
      self.set_active(name);
      if name == version {
        self.claim_clients();
        self.set_state(WorkerState::Activated);
      }
      return Ok(Some(name.clone()));
    }

    Ok(None)
  }

  /// True once install finished and skip-waiting was requested.
  pub fn wants_activation(&self) -> bool {
    self.state().can_activate() && self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Install: populate the current generation from the precache manifest.
  ///
  /// Same-origin entries are all-or-nothing; any failure aborts the install
  /// and leaves the controller `Redundant`, or `Activated` again if it was
  /// already serving. Cross-origin entries are best-effort. The active
  /// generation keeps answering requests throughout.
  pub async fn install(&self) -> Result<()> {
    let previous = self.transition(WorkerState::can_install, WorkerState::Installing)?;
    info!(version = %self.config.version, "installing");

    match self.precache().await {
      Ok(()) => {
        self.set_state(WorkerState::Installed);
        info!(version = %self.config.version, "installed");
        self.skip_waiting();
        Ok(())
      }
      Err(e) => {
        if previous.is_active() {
          self.set_state(WorkerState::Activated);
        } else {
          self.set_state(WorkerState::Redundant);
        }
        match self.active_generation() {
          Some(active) => warn!(
            version = %self.config.version,
            %active,
            "install failed, still serving previous generation: {}",
            e
          ),
          None => error!(version = %self.config.version, "install failed: {}", e),
        }
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<()> {
    let version = &self.config.version;
    self.storage.open_generation(version)?;

    let local = &self.config.precache_local;
    let responses = try_join_all(local.iter().map(|url| self.fetch_ok(url))).await?;
    let entries: Vec<(CacheKey, StoredResponse)> = local
      .iter()
      .map(CacheKey::get)
      .zip(responses)
      .collect();
    self.storage.put_all(version, &entries)?;
    debug!(count = entries.len(), "precached same-origin assets");

    let remote = &self.config.precache_remote;
    let results = join_all(remote.iter().map(|url| self.fetch_ok(url))).await;
    for (url, result) in remote.iter().zip(results) {
      let stored = result.and_then(|response| self.storage.put(version, &CacheKey::get(url), &response));
      if let Err(e) = stored {
        warn!(url = %url, "could not precache: {}", e);
      }
    }

    Ok(())
  }

  /// Fetch for precaching; anything but 2xx is a failure.
  async fn fetch_ok(&self, url: &Url) -> Result<StoredResponse> {
    let response = self.network.fetch(&FetchRequest::get(url.clone())).await?;
    if !response.is_ok() {
      return Err(eyre!(
        "Failed to precache {}: status {}",
        url,
        response.status
      ));
    }
    Ok(response)
  }

  /// Activate: drop every generation except the current one, then claim
  /// clients. Returns the names of the deleted generations.
  pub async fn activate(&self) -> Result<Vec<String>> {
    self.transition(WorkerState::can_activate, WorkerState::Activating)?;

    let deleted = match self.delete_stale_generations() {
      Ok(deleted) => deleted,
      Err(e) => {
        self.set_state(WorkerState::Installed);
        return Err(e);
      }
    };

    self.set_active(&self.config.version);
    self.claim_clients();
    self.set_state(WorkerState::Activated);
    info!(version = %self.config.version, "activated");

    Ok(deleted)
  }

  fn delete_stale_generations(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.generation_names()? {
      if name != self.config.version {
        info!(generation = %name, "deleting old cache");
        self.storage.delete_generation(&name)?;
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  fn claim_clients(&self) {
    self.clients_claimed.store(true, Ordering::SeqCst);
  }

  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  /// Decide whether a request is intercepted, and if so produce its response.
  ///
  /// Never fails: every failure mode maps to a defined response.
  pub async fn handle_fetch(&self, request: &FetchRequest) -> FetchOutcome {
    match self.serving_generation(request) {
      Ok(generation) => FetchOutcome::Respond(self.network_first(&generation, request).await),
      Err(reason) => FetchOutcome::Passthrough(reason),
    }
  }

  /// The generation that answers `request`, or why it is left alone.
  fn serving_generation(&self, request: &FetchRequest) -> Result<String, PassthroughReason> {
    let generation = self
      .active_generation()
      .ok_or(PassthroughReason::NotActive)?;

    if request.method != reqwest::Method::GET {
      Err(PassthroughReason::NonGet)
    } else if !request.is_http() {
      Err(PassthroughReason::NonHttp)
    } else if self.config.is_excluded(&request.url) {
      Err(PassthroughReason::ExcludedHost)
    } else {
      Ok(generation)
    }
  }

  async fn network_first(
    &self,
    generation: &str,
    request: &FetchRequest,
  ) -> Intercepted<StoredResponse> {
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.status == 200 && self.config.is_cacheable(&request.url) {
          let key = CacheKey::new(request.method.clone(), &request.url);
          self.store_in_background(generation, key, response.clone());
        }
        Intercepted::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, "network failed, trying cache: {}", e);
        self.fallback(generation, request)
      }
    }
  }

  fn fallback(&self, generation: &str, request: &FetchRequest) -> Intercepted<StoredResponse> {
    let key = CacheKey::new(request.method.clone(), &request.url);
    if let Some(entry) = self.lookup(generation, &key) {
      return Intercepted::from_cache(entry.response, entry.cached_at);
    }

    if request.is_navigation() {
      if let Some(entry) = self.lookup(generation, &CacheKey::get(&self.config.offline_url)) {
        return Intercepted::offline_fallback(entry.response, entry.cached_at);
      }
    }

    Intercepted::unavailable(StoredResponse::unavailable())
  }

  /// Cache read; errors count as a miss.
  fn lookup(&self, generation: &str, key: &CacheKey) -> Option<CachedEntry> {
    match self.storage.match_entry(generation, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %key.url(), "cache lookup failed: {}", e);
        None
      }
    }
  }

  /// Write without holding up the response.
  fn store_in_background(&self, generation: &str, key: CacheKey, response: StoredResponse) {
    let storage = Arc::clone(&self.storage);
    let generation = generation.to_string();

    let handle = tokio::task::spawn_blocking(move || {
      if let Err(e) = storage.put(&generation, &key, &response) {
        warn!(url = %key.url(), "cache write failed: {}", e);
      }
    });

    let mut pending = self.pending_writes.lock().unwrap_or_else(|e| e.into_inner());
    pending.retain(|h| !h.is_finished());
    pending.push(handle);
  }

  /// Wait for every background cache write started so far.
  pub async fn wait_for_pending_writes(&self) {
    let handles = std::mem::take(&mut *self.pending_writes.lock().unwrap_or_else(|e| e.into_inner()));
    for result in join_all(handles).await {
      if let Err(e) = result {
        warn!("cache write task failed: {}", e);
      }
    }
  }

  /// Handle a message posted by a page. Unknown messages are ignored.
  pub async fn handle_message(&self, message: &Value) -> Result<()> {
    match ControlMessage::parse(message) {
      Some(ControlMessage::SkipWaiting) => {
        self.skip_waiting();
        if self.state().can_activate() {
          self.activate().await?;
        }
        Ok(())
      }
      None => {
        debug!(%message, "ignoring unknown message");
        Ok(())
      }
    }
  }

  /// Handle a background sync event.
  pub async fn handle_sync(&self, tag: &str) -> Result<()> {
    if tag == CONTACT_FORM_SYNC {
      self.sync_contact_form().await
    } else {
      debug!(tag, "ignoring unknown sync tag");
      Ok(())
    }
  }

  async fn sync_contact_form(&self) -> Result<()> {
    // Queued submissions are replayed by the page once online
    info!("background sync triggered for contact form");
    Ok(())
  }

  pub fn status(&self) -> Result<ControllerStatus> {
    Ok(ControllerStatus {
      state: self.state(),
      version: self.config.version.clone(),
      active_generation: self.active_generation(),
      skip_waiting: self.skip_waiting.load(Ordering::SeqCst),
      clients_claimed: self.clients_claimed.load(Ordering::SeqCst),
      generations: self.storage.generation_names()?,
      entry_count: self.storage.entry_count(&self.config.version)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResponseSource, SqliteStorage};
  use crate::network::fake::FakeNetwork;
  use reqwest::Method;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;

  const ORIGIN: &str = "https://example.com";

  /// Counts every storage call, to prove a request never touched the cache.
  struct CountingStorage {
    inner: SqliteStorage,
    calls: AtomicUsize,
  }

  impl CountingStorage {
    fn new() -> Self {
      Self {
        inner: SqliteStorage::open_in_memory().unwrap(),
        calls: AtomicUsize::new(0),
      }
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
      self.calls.fetch_add(1, Ordering::SeqCst);
    }
  }

  impl CacheStorage for CountingStorage {
    fn open_generation(&self, name: &str) -> Result<()> {
      self.hit();
      self.inner.open_generation(name)
    }

    fn generation_names(&self) -> Result<Vec<String>> {
      self.hit();
      self.inner.generation_names()
    }

    fn delete_generation(&self, name: &str) -> Result<bool> {
      self.hit();
      self.inner.delete_generation(name)
    }

    fn put(&self, generation: &str, key: &CacheKey, response: &StoredResponse) -> Result<()> {
      self.hit();
      self.inner.put(generation, key, response)
    }

    fn put_all(&self, generation: &str, entries: &[(CacheKey, StoredResponse)]) -> Result<()> {
      self.hit();
      self.inner.put_all(generation, entries)
    }

    fn match_entry(&self, generation: &str, key: &CacheKey) -> Result<Option<CachedEntry>> {
      self.hit();
      self.inner.match_entry(generation, key)
    }

    fn keys(&self, generation: &str) -> Result<Vec<CacheKey>> {
      self.hit();
      self.inner.keys(generation)
    }

    fn entry_count(&self, generation: &str) -> Result<usize> {
      self.hit();
      self.inner.entry_count(generation)
    }
  }

  type TestController = OfflineCacheController<CountingStorage, FakeNetwork>;

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn ok(body: &str) -> StoredResponse {
    StoredResponse::new(200, body)
  }

  fn site_config(version: &str, precache: &[&str]) -> ControllerConfig {
    ControllerConfig::new(version, Url::parse(ORIGIN).unwrap())
      .unwrap()
      .with_precache(precache)
      .unwrap()
      .with_excluded_host("api.example.com")
      .with_cdn_allowlist(&["https://cdn.jsdelivr.net/npm/typed.js@2.0.12"])
      .unwrap()
  }

  fn controller_with(
    config: ControllerConfig,
    storage: Arc<CountingStorage>,
    network: Arc<FakeNetwork>,
  ) -> TestController {
    OfflineCacheController::new(config, storage, network)
  }

  /// Network serving `/`, `/index.html` and `/offline.html`.
  fn site_network() -> Arc<FakeNetwork> {
    let network = FakeNetwork::new();
    network.route(url("/").as_str(), ok("<h1>home</h1>"));
    network.route(url("/index.html").as_str(), ok("<h1>home</h1>"));
    network.route(url("/offline.html").as_str(), ok("<h1>offline</h1>"));
    Arc::new(network)
  }

  async fn active_controller() -> (TestController, Arc<CountingStorage>, Arc<FakeNetwork>) {
    let storage = Arc::new(CountingStorage::new());
    let network = site_network();
    let controller = controller_with(
      site_config("v-test", &["/", "/index.html", "/offline.html"]),
      storage.clone(),
      network.clone(),
    );
    controller.install().await.unwrap();
    controller.activate().await.unwrap();
    (controller, storage, network)
  }

  fn respond(outcome: FetchOutcome) -> Intercepted<StoredResponse> {
    match outcome {
      FetchOutcome::Respond(r) => r,
      FetchOutcome::Passthrough(reason) => panic!("expected a response, got {:?}", reason),
    }
  }

  #[tokio::test]
  async fn test_install_populates_generation() {
    let storage = Arc::new(CountingStorage::new());
    let controller = controller_with(
      site_config("v-test", &["/", "/index.html"]),
      storage.clone(),
      site_network(),
    );

    controller.install().await.unwrap();
    assert_eq!(controller.state(), WorkerState::Installed);
    assert!(controller.wants_activation());
    assert_eq!(storage.inner.entry_count("v-test").unwrap(), 2);

    let deleted = controller.activate().await.unwrap();
    assert!(deleted.is_empty());
    assert_eq!(controller.state(), WorkerState::Activated);
    assert_eq!(storage.inner.entry_count("v-test").unwrap(), 2);
  }

  #[tokio::test]
  async fn test_same_origin_failure_aborts_install() {
    let storage = Arc::new(CountingStorage::new());
    let network = site_network();
    network.fail(url("/index.html").as_str());
    let controller = controller_with(
      site_config("v-test", &["/", "/index.html"]),
      storage.clone(),
      network,
    );

    assert!(controller.install().await.is_err());
    assert_eq!(controller.state(), WorkerState::Redundant);
    assert!(!controller.wants_activation());
    // Nothing from the failed batch is kept
    assert_eq!(storage.inner.entry_count("v-test").unwrap(), 0);
    assert!(controller.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_same_origin_error_status_aborts_install() {
    let storage = Arc::new(CountingStorage::new());
    let controller = controller_with(
      site_config("v-test", &["/", "/missing.css"]),
      storage.clone(),
      site_network(),
    );

    assert!(controller.install().await.is_err());
    assert_eq!(storage.inner.entry_count("v-test").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_cross_origin_failure_is_tolerated() {
    let storage = Arc::new(CountingStorage::new());
    let network = site_network();
    network.route(
      "https://fonts.googleapis.com/css2?family=Inter",
      ok("@font-face {}"),
    );
    network.fail("https://cdnjs.cloudflare.com/all.min.css");
    let controller = controller_with(
      site_config(
        "v-test",
        &[
          "/",
          "https://fonts.googleapis.com/css2?family=Inter",
          "https://cdnjs.cloudflare.com/all.min.css",
        ],
      ),
      storage.clone(),
      network,
    );

    controller.install().await.unwrap();
    assert_eq!(storage.inner.entry_count("v-test").unwrap(), 2);
    let font = CacheKey::get(&Url::parse("https://fonts.googleapis.com/css2?family=Inter").unwrap());
    assert!(storage.inner.match_entry("v-test", &font).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_reinstall_is_idempotent() {
    let (controller, storage, network) = active_controller().await;

    controller.install().await.unwrap();
    controller.install().await.unwrap();
    controller.activate().await.unwrap();
    assert_eq!(storage.inner.entry_count("v-test").unwrap(), 3);

    // Bypass is unchanged
    network.set_offline(true);
    let request = FetchRequest::get(Url::parse("https://api.example.com/chat").unwrap());
    let before = storage.calls();
    assert!(matches!(
      controller.handle_fetch(&request).await,
      FetchOutcome::Passthrough(PassthroughReason::ExcludedHost)
    ));
    assert_eq!(storage.calls(), before);
  }

  #[tokio::test]
  async fn test_activate_deletes_prior_generations() {
    let storage = Arc::new(CountingStorage::new());
    let stale = CacheKey::get(&url("/old.css"));
    let home = CacheKey::get(&url("/"));
    storage.inner.put("v-old", &stale, &ok("old")).unwrap();
    storage.inner.put("v-old", &home, &ok("<h1>stale home</h1>")).unwrap();
    storage.inner.put("v-older", &stale, &ok("older")).unwrap();

    let controller = controller_with(
      site_config("v-new", &["/", "/index.html"]),
      storage.clone(),
      site_network(),
    );
    controller.install().await.unwrap();
    let mut deleted = controller.activate().await.unwrap();
    deleted.sort();

    assert_eq!(deleted, vec!["v-old".to_string(), "v-older".to_string()]);
    assert_eq!(
      storage.inner.generation_names().unwrap(),
      vec!["v-new".to_string()]
    );
    assert_eq!(storage.inner.entry_count("v-old").unwrap(), 0);
    assert_eq!(storage.inner.entry_count("v-new").unwrap(), 2);

    // Same key re-added by the new version survives the sweep
    let kept = storage.inner.match_entry("v-new", &home).unwrap().unwrap();
    assert_eq!(kept.response.body, b"<h1>home</h1>");
  }

  #[tokio::test]
  async fn test_failed_reinstall_keeps_serving() {
    let (controller, _storage, network) = active_controller().await;
    network.set_offline(true);

    assert!(controller.install().await.is_err());
    assert_eq!(controller.state(), WorkerState::Activated);
    assert_eq!(controller.active_generation().as_deref(), Some("v-test"));

    let response = respond(controller.handle_fetch(&FetchRequest::navigate(url("/"))).await);
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.data.body, b"<h1>home</h1>");
  }

  #[tokio::test]
  async fn test_restart_offline_serves_cached_generation() {
    let (first, storage, network) = active_controller().await;
    drop(first);
    network.set_offline(true);

    let controller = controller_with(
      site_config("v-test", &["/", "/index.html", "/offline.html"]),
      storage.clone(),
      network,
    );
    assert_eq!(controller.resume().unwrap().as_deref(), Some("v-test"));
    assert_eq!(controller.state(), WorkerState::Activated);

    assert!(controller.install().await.is_err());
    assert_eq!(controller.state(), WorkerState::Activated);
    assert_eq!(storage.inner.entry_count("v-test").unwrap(), 3);

    let response = respond(controller.handle_fetch(&FetchRequest::navigate(url("/"))).await);
    assert_eq!(response.source, ResponseSource::Cache);
    let fallback = respond(
      controller
        .handle_fetch(&FetchRequest::navigate(url("/missing-page")))
        .await,
    );
    assert_eq!(fallback.source, ResponseSource::OfflineFallback);
  }

  #[tokio::test]
  async fn test_previous_generation_serves_until_new_version_activates() {
    let storage = Arc::new(CountingStorage::new());
    let home = CacheKey::get(&url("/"));
    storage.inner.put("v-older", &home, &ok("older")).unwrap();
    storage.inner.put("v-old", &home, &ok("old")).unwrap();
    let network = site_network();
    network.set_offline(true);
    let controller = controller_with(
      site_config("v-new", &["/", "/index.html"]),
      storage.clone(),
      network.clone(),
    );

    assert_eq!(controller.resume().unwrap().as_deref(), Some("v-old"));
    assert_eq!(controller.state(), WorkerState::Parsed);

    // New version fails to install; the old one keeps answering
    assert!(controller.install().await.is_err());
    assert_eq!(controller.state(), WorkerState::Redundant);
    let response = respond(controller.handle_fetch(&FetchRequest::get(url("/"))).await);
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.data.body, b"old");

    network.set_offline(false);
    controller.install().await.unwrap();
    controller.activate().await.unwrap();
    assert_eq!(controller.active_generation().as_deref(), Some("v-new"));
    assert_eq!(
      storage.inner.generation_names().unwrap(),
      vec!["v-new".to_string()]
    );

    network.set_offline(true);
    let response = respond(controller.handle_fetch(&FetchRequest::get(url("/"))).await);
    assert_eq!(response.data.body, b"<h1>home</h1>");
  }

  #[tokio::test]
  async fn test_resume_with_empty_storage_stays_passthrough() {
    let storage = Arc::new(CountingStorage::new());
    storage.inner.open_generation("v-test").unwrap();
    let controller = controller_with(site_config("v-test", &["/"]), storage, site_network());

    assert_eq!(controller.resume().unwrap(), None);
    assert!(matches!(
      controller.handle_fetch(&FetchRequest::get(url("/"))).await,
      FetchOutcome::Passthrough(PassthroughReason::NotActive)
    ));
  }

  #[tokio::test]
  async fn test_not_intercepting_before_activation() {
    let storage = Arc::new(CountingStorage::new());
    let controller = controller_with(site_config("v-test", &["/"]), storage, site_network());

    let outcome = controller.handle_fetch(&FetchRequest::get(url("/"))).await;
    assert!(matches!(
      outcome,
      FetchOutcome::Passthrough(PassthroughReason::NotActive)
    ));
  }

  #[tokio::test]
  async fn test_excluded_host_never_touches_cache() {
    let (controller, storage, network) = active_controller().await;
    network.route("https://api.example.com/chat", ok("{\"reply\":\"hi\"}"));
    let request = FetchRequest::get(Url::parse("https://API.example.com/chat").unwrap());

    let before = storage.calls();
    for offline in [false, true, false] {
      network.set_offline(offline);
      let outcome = controller.handle_fetch(&request).await;
      assert!(matches!(
        outcome,
        FetchOutcome::Passthrough(PassthroughReason::ExcludedHost)
      ));
    }
    controller.wait_for_pending_writes().await;

    assert_eq!(storage.calls(), before);
    // The controller itself never fetched it either; the host forwards it
    assert!(network
      .requests()
      .iter()
      .all(|r| r.url.host_str() != Some("api.example.com")));
    let keys = storage.inner.keys("v-test").unwrap();
    assert!(keys.iter().all(|k| k.host() != Some("api.example.com")));
  }

  #[tokio::test]
  async fn test_excluded_host_with_trailing_dot() {
    let (controller, storage, _network) = active_controller().await;
    let request = FetchRequest::get(Url::parse("https://api.example.com./chat").unwrap());

    let before = storage.calls();
    assert!(matches!(
      controller.handle_fetch(&request).await,
      FetchOutcome::Passthrough(PassthroughReason::ExcludedHost)
    ));
    assert_eq!(storage.calls(), before);
  }

  #[tokio::test]
  async fn test_non_get_is_never_intercepted() {
    let (controller, storage, network) = active_controller().await;
    let before_calls = storage.calls();
    let before_requests = network.request_count();

    for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
      let request = FetchRequest::get(url("/contact"))
        .with_method(method)
        .with_body("name=a");
      assert!(matches!(
        controller.handle_fetch(&request).await,
        FetchOutcome::Passthrough(PassthroughReason::NonGet)
      ));
    }

    assert_eq!(storage.calls(), before_calls);
    assert_eq!(network.request_count(), before_requests);
  }

  #[tokio::test]
  async fn test_non_http_is_never_intercepted() {
    let (controller, _storage, _network) = active_controller().await;
    let request = FetchRequest::get(Url::parse("chrome-extension://abc/content.js").unwrap());
    assert!(matches!(
      controller.handle_fetch(&request).await,
      FetchOutcome::Passthrough(PassthroughReason::NonHttp)
    ));
  }

  #[tokio::test]
  async fn test_success_is_cached_and_replayed_offline() {
    let (controller, storage, network) = active_controller().await;
    let css = StoredResponse::new(200, "body { margin: 0 }").with_header("content-type", "text/css");
    network.route(url("/assets/app.css").as_str(), css.clone());
    let request = FetchRequest::get(url("/assets/app.css"));

    let online = respond(controller.handle_fetch(&request).await);
    assert_eq!(online.source, ResponseSource::Network);
    assert_eq!(online.data, css);

    controller.wait_for_pending_writes().await;
    assert_eq!(storage.inner.entry_count("v-test").unwrap(), 4);

    network.set_offline(true);
    let offline = respond(controller.handle_fetch(&request).await);
    assert_eq!(offline.source, ResponseSource::Cache);
    assert!(offline.cached_at.is_some());
    assert_eq!(offline.data.body, css.body);
    assert_eq!(offline.data.header("content-type"), Some("text/css"));
  }

  #[tokio::test]
  async fn test_network_is_tried_before_cache() {
    let (controller, _storage, network) = active_controller().await;
    network.route(url("/").as_str(), ok("<h1>fresh</h1>"));

    let response = respond(controller.handle_fetch(&FetchRequest::navigate(url("/"))).await);
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(response.data.body, b"<h1>fresh</h1>");
  }

  #[tokio::test]
  async fn test_non_200_is_returned_but_not_cached() {
    let (controller, storage, network) = active_controller().await;
    network.route(url("/teapot").as_str(), StoredResponse::new(418, "short and stout"));
    network.route(url("/empty").as_str(), StoredResponse::new(204, ""));

    for path in ["/teapot", "/empty", "/not-routed"] {
      let response = respond(controller.handle_fetch(&FetchRequest::get(url(path))).await);
      assert_eq!(response.source, ResponseSource::Network);
    }
    controller.wait_for_pending_writes().await;

    assert_eq!(storage.inner.entry_count("v-test").unwrap(), 3);
  }

  #[tokio::test]
  async fn test_cross_origin_cached_only_when_allow_listed() {
    let (controller, storage, network) = active_controller().await;
    let allowed = "https://cdn.jsdelivr.net/npm/particles.js@2.0.0/particles.min.js";
    let other = "https://tracker.example.org/pixel.js";
    network.route(allowed, ok("particles"));
    network.route(other, ok("pixel"));

    for u in [allowed, other] {
      respond(
        controller
          .handle_fetch(&FetchRequest::get(Url::parse(u).unwrap()))
          .await,
      );
    }
    controller.wait_for_pending_writes().await;

    let hosts: Vec<String> = storage
      .inner
      .keys("v-test")
      .unwrap()
      .iter()
      .filter_map(|k| k.host().map(String::from))
      .collect();
    assert!(hosts.contains(&"cdn.jsdelivr.net".to_string()));
    assert!(!hosts.contains(&"tracker.example.org".to_string()));
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_fallback_page() {
    let (controller, _storage, network) = active_controller().await;
    network.set_offline(true);

    let response = respond(
      controller
        .handle_fetch(&FetchRequest::navigate(url("/missing-page")))
        .await,
    );
    assert_eq!(response.source, ResponseSource::OfflineFallback);
    assert_eq!(response.data.body, b"<h1>offline</h1>");
  }

  #[tokio::test]
  async fn test_offline_navigation_prefers_exact_entry() {
    let (controller, _storage, network) = active_controller().await;
    network.set_offline(true);

    let response = respond(controller.handle_fetch(&FetchRequest::navigate(url("/"))).await);
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.data.body, b"<h1>home</h1>");
  }

  #[tokio::test]
  async fn test_offline_subresource_miss_is_503() {
    let (controller, _storage, network) = active_controller().await;
    network.set_offline(true);

    let response = respond(
      controller
        .handle_fetch(&FetchRequest::get(url("/assets/missing.js")))
        .await,
    );
    assert_eq!(response.source, ResponseSource::Unavailable);
    assert_eq!(response.data.status, 503);
    assert_eq!(response.data.status_text, "Service Unavailable");
  }

  #[tokio::test]
  async fn test_offline_navigation_without_fallback_page_is_503() {
    let storage = Arc::new(CountingStorage::new());
    let network = site_network();
    let controller = controller_with(site_config("v-test", &["/"]), storage, network.clone());
    controller.install().await.unwrap();
    controller.activate().await.unwrap();
    network.set_offline(true);

    let response = respond(
      controller
        .handle_fetch(&FetchRequest::navigate(url("/missing-page")))
        .await,
    );
    assert_eq!(response.source, ResponseSource::Unavailable);
  }

  #[tokio::test]
  async fn test_skip_waiting_message_activates_installed_controller() {
    let storage = Arc::new(CountingStorage::new());
    let controller = controller_with(site_config("v-test", &["/"]), storage, site_network());
    controller.install().await.unwrap();
    assert_eq!(controller.state(), WorkerState::Installed);

    controller
      .handle_message(&json!({ "type": "SKIP_WAITING" }))
      .await
      .unwrap();
    assert_eq!(controller.state(), WorkerState::Activated);

    let status = controller.status().unwrap();
    assert!(status.clients_claimed);
    assert!(status.skip_waiting);
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let storage = Arc::new(CountingStorage::new());
    let controller = controller_with(site_config("v-test", &["/"]), storage, site_network());
    controller.install().await.unwrap();

    controller
      .handle_message(&json!({ "type": "SOMETHING_ELSE" }))
      .await
      .unwrap();
    assert_eq!(controller.state(), WorkerState::Installed);
  }

  #[tokio::test]
  async fn test_skip_waiting_before_install_only_sets_flag() {
    let storage = Arc::new(CountingStorage::new());
    let controller = controller_with(site_config("v-test", &["/"]), storage, site_network());

    controller
      .handle_message(&json!({ "type": "SKIP_WAITING" }))
      .await
      .unwrap();
    assert_eq!(controller.state(), WorkerState::Parsed);
    assert!(controller.status().unwrap().skip_waiting);
  }

  #[tokio::test]
  async fn test_sync_tags() {
    let (controller, _storage, _network) = active_controller().await;
    controller.handle_sync(CONTACT_FORM_SYNC).await.unwrap();
    controller.handle_sync("unknown-tag").await.unwrap();
  }

  #[tokio::test]
  async fn test_status_reports_generation() {
    let (controller, _storage, _network) = active_controller().await;
    let status = controller.status().unwrap();

    assert_eq!(status.state, WorkerState::Activated);
    assert_eq!(status.version, "v-test");
    assert_eq!(status.active_generation.as_deref(), Some("v-test"));
    assert_eq!(status.generations, vec!["v-test".to_string()]);
    assert_eq!(status.entry_count, 3);
  }

  #[test]
  fn test_config_splits_manifest() {
    let config = site_config("v", &["/", "/a.css", "https://fonts.example.net/x.css"]);
    assert_eq!(config.precache_local.len(), 2);
    assert_eq!(config.precache_remote.len(), 1);
    assert_eq!(config.precache_local[1].as_str(), "https://example.com/a.css");
  }

  #[test]
  fn test_config_allow_list_matches_origin_only() {
    let config = site_config("v", &[]);
    let ok = Url::parse("https://cdn.jsdelivr.net/npm/other@1/x.js").unwrap();
    let lookalike = Url::parse("https://cdn.jsdelivr.net.evil.test/x.js").unwrap();
    assert!(config.is_cacheable(&ok));
    assert!(!config.is_cacheable(&lookalike));
    assert!(config.is_cacheable(&url("/anything")));
  }

  #[test]
  fn test_config_from_file_config() {
    let file = Config::from_yaml(include_str!("../../config.example.yaml")).unwrap();
    let config = ControllerConfig::from_config(&file).unwrap();

    assert_eq!(config.version, "shaun-portfolio-v7");
    assert_eq!(
      config.offline_url.as_str(),
      "https://shaunprince.dev/offline.html"
    );
    assert_eq!(config.precache_remote.len(), 2);
    assert_eq!(config.cdn_origins.len(), 2);
    assert!(config.is_excluded(&Url::parse("https://api.solidrust.ai/v1/chat").unwrap()));
    assert!(config.is_excluded(&Url::parse("https://api.solidrust.ai./v1/chat").unwrap()));
  }
}
