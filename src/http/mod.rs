//! HTTP transport and its cached wrapper.

mod cached_client;
mod client;

pub use cached_client::{parse_request, CachedHttpClient};
