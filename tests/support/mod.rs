//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod mock_page;

use std::sync::Arc;
use std::time::Duration;

use casefile_core::resolve::ResolveSettings;
use casefile_core::{Fetcher, HttpClient, HttpClientSettings, RateLimitedTransport, TransportSettings};

/// PDF-looking bytes of exactly `len` bytes.
pub fn pdf_bytes(len: usize) -> Vec<u8> {
    let mut body = b"%PDF-1.7\n".to_vec();
    body.resize(len, b'0');
    body
}

/// HTML error page padded past the size threshold.
pub fn html_error_page() -> Vec<u8> {
    let mut body = b"<!DOCTYPE html><html><body>session expired</body></html>".to_vec();
    body.resize(4096, b' ');
    body
}

/// Transport with no pacing and no retries.
pub fn transport() -> Arc<RateLimitedTransport> {
    Arc::new(RateLimitedTransport::new(TransportSettings::unpaced()).expect("transport starts"))
}

pub fn http_fetcher() -> Arc<dyn Fetcher> {
    Arc::new(HttpClient::new(HttpClientSettings::default()).expect("client builds"))
}

/// Short timeouts so scripted races finish quickly.
pub fn fast_settings() -> ResolveSettings {
    ResolveSettings {
        download_timeout: Duration::from_millis(200),
        popup_timeout: Duration::from_millis(200),
        response_timeout: Duration::from_millis(200),
        navigation_timeout: Duration::from_millis(200),
        settle_window: Duration::from_millis(20),
        popup_signal_timeout: Duration::from_millis(100),
        candidate_budget: Duration::from_secs(10),
        ..ResolveSettings::default()
    }
}
