//! Rate-limited HTTP transport.
//!
//! - [`client`] - the [`Fetcher`] seam and the reqwest-backed [`HttpClient`]
//! - [`pacer`] - global dispatch spacing and per-host Retry-After
//! - [`retry`] - failure classification and capped exponential backoff
//! - [`queue`] - the FIFO worker pool tying the above together

pub mod client;
mod error;
pub mod pacer;
pub mod queue;
pub mod retry;

pub use client::{
    FetchRequest, FetchResponse, Fetcher, HttpClient, HttpClientSettings, CONNECT_TIMEOUT_SECS,
    DEFAULT_MAX_BODY_BYTES, REQUEST_TIMEOUT_SECS,
};
pub use error::TransportError;
pub use pacer::{Pacer, extract_domain, interval_for_qps, parse_retry_after};
pub use queue::{
    DEFAULT_CONCURRENCY, DEFAULT_QPS, RateLimitedTransport, TransportSettings,
    TransportSetupError, TransportStats,
};
pub use retry::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, FailureType, RetryDecision,
    RetryPolicy, classify_error,
};
