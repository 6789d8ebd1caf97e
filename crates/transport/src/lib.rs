#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Transport layer for the `drover` worker node: a streaming driver, a
//! request/response fallback driver, a resilience wrapper, and the
//! communication manager that selects between them.

pub mod envelope;
pub mod http;
pub mod manager;
pub mod protocol;
pub mod resilient;
pub mod stream;

#[cfg(test)]
mod testutil;

pub use http::HttpClient;
pub use manager::CommunicationManager;
pub use protocol::{Transport, TransportMetrics, TransportMetricsSnapshot};
pub use resilient::{ExponentialBackoff, MessageBuffer, ResilientClient};
pub use stream::StreamClient;
