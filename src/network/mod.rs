mod client;
mod request;

#[cfg(test)]
pub mod fake;

pub use client::{is_hop_by_hop, HttpNetwork, Network};
pub use request::{FetchRequest, RequestMode};
