//! Error types for the transport module.
//!
//! Every variant carries the URL that failed so that manifest entries and log
//! lines stay actionable without extra context.

use thiserror::Error;

use crate::sniff::Verdict;

/// Errors that can occur while fetching a resource.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-2xx HTTP response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// Payload failed the integrity sniff (HTML page or implausibly small).
    #[error("integrity check rejected {url}: {verdict} ({bytes} bytes)")]
    IntegrityRejected {
        /// The URL whose payload was rejected.
        url: String,
        /// What the sniffer concluded.
        verdict: Verdict,
        /// Size of the rejected body.
        bytes: usize,
    },

    /// Body exceeded the configured size cap.
    #[error("body of {url} exceeds {limit} bytes")]
    TooLarge {
        /// The URL being fetched.
        url: String,
        /// Configured cap in bytes.
        limit: u64,
    },

    /// The provided URL is malformed or uses an unsupported scheme.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },

    /// The page/session provider failed to issue the request.
    #[error("session request for {url} failed: {message}")]
    Session {
        /// The URL being fetched.
        url: String,
        /// Provider supplied description.
        message: String,
    },

    /// The transport workers have shut down.
    #[error("transport closed before {url} could be fetched")]
    Closed {
        /// The URL that was pending.
        url: String,
    },
}

impl TransportError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an integrity rejection.
    pub fn integrity(url: impl Into<String>, verdict: Verdict, bytes: usize) -> Self {
        Self::IntegrityRejected {
            url: url.into(),
            verdict,
            bytes,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a session/provider error.
    pub fn session(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Session {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Returns the HTTP status for [`TransportError::HttpStatus`].
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_display() {
        let error = TransportError::http_status("https://example.com/file.pdf", 503);
        let msg = error.to_string();
        assert!(msg.contains("503"), "Expected '503' in: {msg}");
        assert!(msg.contains("https://example.com/file.pdf"));
        assert_eq!(error.status(), Some(503));
    }

    #[test]
    fn test_integrity_display_names_verdict() {
        let error = TransportError::integrity("https://example.com/a", Verdict::ErrorPage, 812);
        let msg = error.to_string();
        assert!(msg.contains("html error page"), "got: {msg}");
        assert!(msg.contains("812"));
    }

    #[test]
    fn test_timeout_display() {
        let error = TransportError::timeout("https://example.com/slow");
        assert!(error.to_string().contains("timeout"));
        assert_eq!(error.status(), None);
    }

    #[test]
    fn test_invalid_url_display() {
        let msg = TransportError::invalid_url("javascript:void(0)").to_string();
        assert!(msg.contains("invalid URL"));
        assert!(msg.contains("javascript:void(0)"));
    }
}
