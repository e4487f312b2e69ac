//! Headless page sessions backed by plain HTTP.
//!
//! A [`StaticPage`] holds the markup of the detail page fetched through the
//! transport. Clicking produces no browser events, so the resolution chain
//! falls through to direct-URL reconstruction.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::classify::{attribute, scan_elements};
use crate::resolve::{
    ActionRef, PageError, PageProvider, PageSession, ResponseFilter, SignalWatch, signal_channel,
};
use crate::transport::{FetchRequest, Fetcher, RateLimitedTransport};

#[derive(Debug, Clone)]
struct Loaded {
    url: String,
    html: String,
}

/// One fetched page.
pub struct StaticPage {
    transport: Arc<RateLimitedTransport>,
    fetcher: Arc<dyn Fetcher>,
    state: Mutex<Loaded>,
}

impl std::fmt::Debug for StaticPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticPage").finish_non_exhaustive()
    }
}

impl StaticPage {
    async fn load(
        transport: &RateLimitedTransport,
        fetcher: &Arc<dyn Fetcher>,
        url: &str,
    ) -> Result<Loaded, PageError> {
        let response = transport
            .fetch(Arc::clone(fetcher), FetchRequest::page(url))
            .await
            .map_err(|e| PageError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        debug!(%url, bytes = response.body.len(), "page loaded");
        Ok(Loaded {
            url: response.final_url.clone(),
            html: response.text(),
        })
    }
}

#[async_trait]
impl PageSession for StaticPage {
    async fn current_url(&self) -> Result<String, PageError> {
        Ok(self.state.lock().await.url.clone())
    }

    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        if self.state.lock().await.url == url {
            return Ok(());
        }
        let loaded = Self::load(&self.transport, &self.fetcher, url).await?;
        *self.state.lock().await = loaded;
        Ok(())
    }

    async fn arm(&self, _filter: &ResponseFilter) -> Result<SignalWatch, PageError> {
        // No browser, no events: every signal resolves as closed.
        let (_senders, watch) = signal_channel();
        Ok(watch)
    }

    async fn click(&self, action: &ActionRef) -> Result<(), PageError> {
        debug!(%action, "static page ignores click");
        Ok(())
    }

    async fn find_by_label(&self, pattern: &str) -> Result<Option<ActionRef>, PageError> {
        let regex = Regex::new(pattern).map_err(|e| PageError::Action {
            message: format!("invalid label pattern: {e}"),
        })?;
        let html = self.state.lock().await.html.clone();
        Ok(scan_elements(&html)
            .into_iter()
            .find(|element| regex.is_match(&element.label))
            .map(|element| ActionRef::new(element.action())))
    }

    async fn attribute_values(
        &self,
        selector: &str,
        attribute_name: &str,
    ) -> Result<Vec<String>, PageError> {
        let tag = Regex::new(&format!(r"(?is)<{}\b([^>]*)>", regex::escape(selector)))
            .map_err(|e| PageError::Action {
                message: format!("invalid selector '{selector}': {e}"),
            })?;
        let html = self.state.lock().await.html.clone();
        Ok(tag
            .captures_iter(&html)
            .filter_map(|caps| caps.get(1))
            .filter_map(|attrs| attribute(attrs.as_str(), attribute_name))
            .filter(|value| !value.is_empty())
            .collect())
    }

    fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::clone(&self.fetcher)
    }

    async fn snapshot(&self) -> Result<String, PageError> {
        Ok(self.state.lock().await.html.clone())
    }

    async fn close(&self) -> Result<(), PageError> {
        Ok(())
    }
}

/// Opens [`StaticPage`]s through a shared transport.
#[derive(Clone)]
pub struct StaticPageProvider {
    transport: Arc<RateLimitedTransport>,
    fetcher: Arc<dyn Fetcher>,
}

impl std::fmt::Debug for StaticPageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticPageProvider").finish_non_exhaustive()
    }
}

impl StaticPageProvider {
    /// Pages are fetched through `transport` with `fetcher`'s cookies.
    #[must_use]
    pub fn new(transport: Arc<RateLimitedTransport>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { transport, fetcher }
    }
}

#[async_trait]
impl PageProvider for StaticPageProvider {
    #[instrument(skip(self))]
    async fn open(&self, url: &str) -> Result<Box<dyn PageSession>, PageError> {
        let loaded = StaticPage::load(&self.transport, &self.fetcher, url).await?;
        Ok(Box::new(StaticPage {
            transport: Arc::clone(&self.transport),
            fetcher: Arc::clone(&self.fetcher),
            state: Mutex::new(loaded),
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::transport::{HttpClient, HttpClientSettings, TransportSettings};

    const DETAIL: &str = r#"<html><body>
        <a href="/file/get.do?id=1&amp;mode=view">감정평가서</a>
        <button id="dl">다운로드</button>
        <iframe src="/viewer?file=/a.pdf"></iframe>
        <iframe src=""></iframe>
    </body></html>"#;

    async fn open(server: &MockServer) -> Box<dyn PageSession> {
        Mock::given(method("GET"))
            .and(path("/case/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DETAIL))
            .mount(server)
            .await;
        let transport = Arc::new(RateLimitedTransport::new(TransportSettings::unpaced()).unwrap());
        let client: Arc<dyn Fetcher> = Arc::new(HttpClient::new(HttpClientSettings::default()).unwrap());
        StaticPageProvider::new(transport, client)
            .open(&format!("{}/case/1", server.uri()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_and_read_page() {
        let server = MockServer::start().await;
        let page = open(&server).await;

        assert!(page.current_url().await.unwrap().ends_with("/case/1"));
        assert!(page.snapshot().await.unwrap().contains("감정평가서"));
        assert_eq!(
            page.attribute_values("iframe", "src").await.unwrap(),
            vec!["/viewer?file=/a.pdf".to_string()]
        );
        assert_eq!(
            page.find_by_label("(?i)다운로드|download").await.unwrap(),
            Some(ActionRef::new("#dl"))
        );
    }

    #[tokio::test]
    async fn test_armed_signals_close_immediately() {
        let server = MockServer::start().await;
        let page = open(&server).await;
        let watch = page.arm(&ResponseFilter::documents()).await.unwrap();
        page.click(&ActionRef::new("#dl")).await.unwrap();
        assert!(watch.download.await.is_err());
        assert!(watch.popup.await.is_err());
    }

    #[tokio::test]
    async fn test_open_failure_is_navigation_error() {
        let server = MockServer::start().await;
        let transport = Arc::new(RateLimitedTransport::new(TransportSettings::unpaced()).unwrap());
        let client: Arc<dyn Fetcher> = Arc::new(HttpClient::new(HttpClientSettings::default()).unwrap());
        let result = StaticPageProvider::new(transport, client)
            .open(&format!("{}/missing", server.uri()))
            .await;
        assert!(matches!(result, Err(PageError::Navigation { .. })));
    }
}
