//! HTTP fetch primitive used by the transport workers.
//!
//! [`Fetcher`] is the seam between the transport and whatever actually issues
//! the request. [`HttpClient`] is the reqwest-backed implementation; page
//! sessions hand out their own fetchers so that requests carry the session's
//! cookies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::cookie::Jar;
use reqwest::header::{
    CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap, REFERER, RETRY_AFTER, USER_AGENT,
};
use tracing::{debug, instrument};
use url::Url;

use super::TransportError;
use crate::resolve::filename::parse_content_disposition;
use crate::user_agent;

/// Default HTTP connect timeout (15 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Default whole-request timeout (60 seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default body size cap (200 MiB).
pub const DEFAULT_MAX_BODY_BYTES: u64 = 200 * 1024 * 1024;

/// A single outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Absolute http(s) URL.
    pub url: String,
    /// Referer header to send, usually the detail page.
    pub referer: Option<String>,
    /// When set, the transport runs the integrity sniff on the body.
    pub expect_file: bool,
}

impl FetchRequest {
    /// Request for a document; the body is sniffed before it is accepted.
    pub fn file(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referer: None,
            expect_file: true,
        }
    }

    /// Request for a page; no integrity sniff.
    pub fn page(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referer: None,
            expect_file: false,
        }
    }

    /// Sets the Referer header.
    #[must_use]
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// URL after redirects.
    pub final_url: String,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Declared Content-Type, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header_str(CONTENT_TYPE.as_str())
    }

    /// Filename from the Content-Disposition header, if any.
    #[must_use]
    pub fn content_disposition_filename(&self) -> Option<String> {
        self.header_str(CONTENT_DISPOSITION.as_str())
            .and_then(parse_content_disposition)
    }

    /// Header value as a string, ignoring non-ASCII values.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body decoded lossily as UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Something that can issue a single HTTP request.
///
/// Implementations must not retry or pace; the transport does both.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Issues `request` once. Non-2xx statuses are errors.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError>;
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct HttpClientSettings {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    pub request_timeout: Duration,
    /// Largest accepted body.
    pub max_body_bytes: u64,
    /// User-Agent header; the project UA when `None`.
    pub user_agent: Option<String>,
}

impl Default for HttpClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            user_agent: None,
        }
    }
}

/// reqwest-backed [`Fetcher`] with a shared cookie jar.
///
/// Create once and clone; clones share the connection pool and cookies.
///
/// # Example
///
/// ```no_run
/// use casefile_core::transport::{FetchRequest, Fetcher, HttpClient, HttpClientSettings};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new(HttpClientSettings::default())?;
/// let response = client.fetch(&FetchRequest::page("https://example.com/case/1")).await?;
/// println!("{} bytes", response.body.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    cookies: Arc<Jar>,
    max_body_bytes: u64,
}

impl HttpClient {
    /// Builds a client with a fresh cookie jar.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ClientBuild`] if reqwest rejects the configuration.
    pub fn new(settings: HttpClientSettings) -> Result<Self, TransportError> {
        Self::with_cookie_jar(settings, Arc::new(Jar::default()))
    }

    /// Builds a client that shares `cookies` with other clients.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ClientBuild`] if reqwest rejects the configuration.
    #[instrument(level = "debug", skip(cookies))]
    pub fn with_cookie_jar(
        settings: HttpClientSettings,
        cookies: Arc<Jar>,
    ) -> Result<Self, TransportError> {
        let user_agent = settings
            .user_agent
            .clone()
            .unwrap_or_else(user_agent::default_fetch_user_agent);
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .gzip(true)
            .user_agent(user_agent)
            .cookie_provider(Arc::clone(&cookies))
            .build()
            .map_err(|source| TransportError::ClientBuild { source })?;
        Ok(Self {
            client,
            cookies,
            max_body_bytes: settings.max_body_bytes,
        })
    }

    /// Shared cookie jar.
    #[must_use]
    pub fn cookies(&self) -> Arc<Jar> {
        Arc::clone(&self.cookies)
    }
}

#[async_trait]
impl Fetcher for HttpClient {
    #[instrument(level = "debug", skip(self, request), fields(url = %request.url))]
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
        let url = request.url.as_str();
        let parsed = Url::parse(url).map_err(|_| TransportError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TransportError::invalid_url(url));
        }

        let mut builder = self.client.get(parsed);
        if !request.expect_file {
            builder = builder.header(USER_AGENT, user_agent::BROWSER_USER_AGENT);
        }
        if let Some(referer) = &request.referer {
            builder = builder.header(REFERER, referer);
        }

        let response = builder.send().await.map_err(|e| map_send_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(TransportError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        if let Some(length) = response.content_length()
            && length > self.max_body_bytes
        {
            return Err(TransportError::TooLarge {
                url: url.to_string(),
                limit: self.max_body_bytes,
            });
        }

        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body = read_capped(response, url, self.max_body_bytes).await?;
        debug!(status = status.as_u16(), bytes = body.len(), "fetch complete");

        Ok(FetchResponse {
            status: status.as_u16(),
            final_url,
            headers,
            body,
        })
    }
}

fn map_send_error(url: &str, error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::timeout(url)
    } else {
        TransportError::network(url, error)
    }
}

/// Streams the body into memory, failing once it exceeds `limit`.
async fn read_capped(
    response: reqwest::Response,
    url: &str,
    limit: u64,
) -> Result<Vec<u8>, TransportError> {
    let mut stream = response.bytes_stream();
    let mut body = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| map_send_error(url, e))?;
        if body.len() as u64 + chunk.len() as u64 > limit {
            return Err(TransportError::TooLarge {
                url: url.to_string(),
                limit,
            });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client() -> HttpClient {
        HttpClient::new(HttpClientSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .insert_header("content-disposition", "attachment; filename=\"ap.pdf\"")
                    .set_body_bytes(b"%PDF-1.4 body".to_vec()),
            )
            .mount(&server)
            .await;

        let response = client()
            .fetch(&FetchRequest::file(format!("{}/doc", server.uri())))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.content_type(), Some("application/pdf"));
        assert_eq!(
            response.content_disposition_filename(),
            Some("ap.pdf".to_string())
        );
        assert!(response.body.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn test_fetch_sends_referer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc"))
            .and(header("referer", "https://court.example/case/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let request = FetchRequest::page(format!("{}/doc", server.uri()))
            .with_referer("https://court.example/case/1");
        client().fetch(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_maps_status_and_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = client()
            .fetch(&FetchRequest::page(server.uri()))
            .await
            .unwrap_err();
        match err {
            TransportError::HttpStatus {
                status,
                retry_after,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(retry_after.as_deref(), Some("7"));
            }
            other => panic!("expected HttpStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_rejects_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;

        let small = HttpClient::new(HttpClientSettings {
            max_body_bytes: 1024,
            ..HttpClientSettings::default()
        })
        .unwrap();
        let err = small
            .fetch(&FetchRequest::file(server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::TooLarge { limit: 1024, .. }));
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_http_scheme() {
        let err = client()
            .fetch(&FetchRequest::page("javascript:void(0)"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
    }
}
