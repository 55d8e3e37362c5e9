//! The offline cache controller.
//!
//! Mirrors a service worker's lifecycle:
//! - install: precache the manifest into the current generation
//! - activate: delete stale generations, claim clients
//! - fetch: network first, cache fallback, offline page, synthetic 503
//! - message: `SKIP_WAITING` activates an installed controller

mod controller;
mod lifecycle;
mod message;

pub use controller::{
  ControllerConfig, ControllerStatus, FetchOutcome, OfflineCacheController, PassthroughReason,
};
pub use lifecycle::WorkerState;
