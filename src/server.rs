//! HTTP host for the controller.
//!
//! Every request that is not a control endpoint goes through
//! [`OfflineCacheController::handle_fetch`]. Requests in absolute form
//! (forward proxy) keep their own target; everything else is resolved
//! against the configured origin (reverse proxy). `CONNECT` opens a raw
//! tunnel to the requested authority; its traffic is never intercepted.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, StoredResponse};
use crate::network::{is_hop_by_hop, FetchRequest, Network, RequestMode};
use crate::worker::{FetchOutcome, OfflineCacheController};

/// Largest request body forwarded upstream.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Header naming where an intercepted response came from.
pub const SOURCE_HEADER: &str = "x-sw-source";

type Shared<S, N> = Arc<OfflineCacheController<S, N>>;

pub fn build_router<S, N>(controller: Shared<S, N>) -> Router
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  Router::new()
    .route("/__sw/message", post(post_message::<S, N>))
    .route("/__sw/sync", post(post_sync::<S, N>))
    .route("/__sw/status", get(get_status::<S, N>))
    .fallback(proxy::<S, N>)
    .with_state(controller)
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve<S, N>(
  listener: TcpListener,
  controller: Shared<S, N>,
  shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  let addr = listener
    .local_addr()
    .map_err(|e| eyre!("Failed to read listener address: {}", e))?;
  info!(%addr, "listening");

  axum::serve(listener, build_router(controller))
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

pub async fn bind(listen: SocketAddr) -> Result<TcpListener> {
  TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))
}

async fn post_message<S, N>(
  State(controller): State<Shared<S, N>>,
  Json(message): Json<Value>,
) -> Response
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  match controller.handle_message(&message).await {
    Ok(()) => StatusCode::NO_CONTENT.into_response(),
    Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
  }
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
  tag: String,
}

async fn post_sync<S, N>(
  State(controller): State<Shared<S, N>>,
  Json(sync): Json<SyncRequest>,
) -> Response
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  match controller.handle_sync(&sync.tag).await {
    Ok(()) => StatusCode::NO_CONTENT.into_response(),
    Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
  }
}

async fn get_status<S, N>(State(controller): State<Shared<S, N>>) -> Response
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  match controller.status() {
    Ok(status) => Json(status).into_response(),
    Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
  }
}

async fn proxy<S, N>(State(controller): State<Shared<S, N>>, request: Request) -> Response
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  if *request.method() == Method::CONNECT {
    return tunnel(request).await;
  }

  let (parts, body) = request.into_parts();

  let url = match target_url(&controller.config().origin, &parts.uri) {
    Ok(url) => url,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  let body = match to_bytes(body, MAX_BODY_BYTES).await {
    Ok(body) => body,
    Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
  };

  let fetch = FetchRequest {
    mode: request_mode(&parts.method, &parts.headers),
    method: parts.method,
    url,
    headers: header_pairs(&parts.headers),
    body: body.to_vec(),
  };

  match controller.handle_fetch(&fetch).await {
    FetchOutcome::Respond(intercepted) => {
      let mut response = into_response(intercepted.data);
      response.headers_mut().insert(
        SOURCE_HEADER,
        HeaderValue::from_static(intercepted.source.as_str()),
      );
      response
    }
    FetchOutcome::Passthrough(reason) => {
      debug!(url = %fetch.url, ?reason, "passthrough");
      match controller.network().fetch(&fetch).await {
        Ok(response) => into_response(response),
        Err(e) => {
          warn!(url = %fetch.url, "upstream failed: {}", e);
          StatusCode::BAD_GATEWAY.into_response()
        }
      }
    }
  }
}

/// Splice the client connection to `host:port` once the `200` is sent.
async fn tunnel(request: Request) -> Response {
  let authority = match request.uri().authority() {
    Some(authority) if authority.port_u16().is_some() => authority.to_string(),
    _ => {
      return (
        StatusCode::BAD_REQUEST,
        format!("CONNECT target must be host:port, got {}", request.uri()),
      )
        .into_response()
    }
  };

  let mut upstream = match TcpStream::connect(&authority).await {
    Ok(stream) => stream,
    Err(e) => {
      warn!(%authority, "tunnel connect failed: {}", e);
      return StatusCode::BAD_GATEWAY.into_response();
    }
  };

  debug!(%authority, "tunnel");
  tokio::spawn(async move {
    let upgraded = match hyper::upgrade::on(request).await {
      Ok(upgraded) => upgraded,
      Err(e) => {
        warn!(%authority, "tunnel upgrade failed: {}", e);
        return;
      }
    };
    let mut client = TokioIo::new(upgraded);
    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
      debug!(%authority, "tunnel closed: {}", e);
    }
  });

  Response::new(Body::empty())
}

/// Absolute-form URIs keep their target; origin-form paths go to `origin`.
fn target_url(origin: &Url, uri: &Uri) -> Result<Url> {
  if uri.scheme().is_some() && uri.authority().is_some() {
    return Url::parse(&uri.to_string()).map_err(|e| eyre!("Invalid request URI {}: {}", uri, e));
  }

  let mut url = origin.clone();
  url.set_path(uri.path());
  url.set_query(uri.query());
  Ok(url)
}

/// `Sec-Fetch-Mode` when present; otherwise an HTML-accepting GET is a
/// navigation.
fn request_mode(method: &Method, headers: &HeaderMap) -> RequestMode {
  let sec_fetch_mode = headers
    .get("sec-fetch-mode")
    .and_then(|v| v.to_str().ok())
    .and_then(RequestMode::from_sec_fetch_mode);
  if let Some(mode) = sec_fetch_mode {
    return mode;
  }

  let accepts_html = headers
    .get(header::ACCEPT)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.contains("text/html"));
  if *method == Method::GET && accepts_html {
    RequestMode::Navigate
  } else {
    RequestMode::default()
  }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect()
}

fn into_response(stored: StoredResponse) -> Response {
  let mut response = Response::new(Body::from(stored.body));
  *response.status_mut() = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::BAD_GATEWAY);

  let headers = response.headers_mut();
  for (name, value) in &stored.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  response
}
