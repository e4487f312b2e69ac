//! Capability surface of a live browsing session.
//!
//! The engine never drives a browser directly. It talks to a [`PageSession`],
//! which can click, read attributes and report what a click caused through a
//! set of one-shot signals armed before the click.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use super::ActionRef;
use crate::sniff;
use crate::transport::Fetcher;

/// Errors reported by a page session.
#[derive(Debug, Error)]
pub enum PageError {
    /// The page could not be opened or navigated.
    #[error("failed to open {url}: {message}")]
    Navigation {
        /// Target URL.
        url: String,
        /// Provider supplied description.
        message: String,
    },

    /// No element matched the action reference.
    #[error("no element matches {action}")]
    ElementNotFound {
        /// The reference that failed to match.
        action: String,
    },

    /// The browser rejected an action.
    #[error("page action failed: {message}")]
    Action {
        /// Provider supplied description.
        message: String,
    },

    /// The session was already closed.
    #[error("page session is closed")]
    Closed,
}

/// A download the browser started.
///
/// Providers that capture the payload fill `body`; otherwise the engine
/// fetches `url` through the transport.
#[derive(Debug, Clone)]
pub struct DownloadSignal {
    /// URL the download came from.
    pub url: String,
    /// Filename the browser proposed.
    pub suggested_filename: Option<String>,
    /// Declared content type, when known.
    pub content_type: Option<String>,
    /// Captured bytes.
    pub body: Option<Vec<u8>>,
}

/// A response observed on the page that passed the [`ResponseFilter`].
#[derive(Debug, Clone)]
pub struct ObservedResponse {
    /// Response URL.
    pub url: String,
    /// HTTP status.
    pub status: u16,
    /// Declared content type.
    pub content_type: Option<String>,
    /// Raw Content-Disposition header.
    pub content_disposition: Option<String>,
    /// Response body.
    pub body: Vec<u8>,
}

/// Which responses count as "qualifying".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFilter {
    content_types: Vec<String>,
}

impl ResponseFilter {
    /// Filter accepting the document content types.
    #[must_use]
    pub fn documents() -> Self {
        Self {
            content_types: sniff::DOCUMENT_CONTENT_TYPES
                .iter()
                .map(|ct| (*ct).to_string())
                .collect(),
        }
    }

    /// Filter accepting exactly `content_types`.
    #[must_use]
    pub fn new<I, S>(content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            content_types: content_types
                .into_iter()
                .map(|ct| sniff::mime_essence(&ct.into()))
                .collect(),
        }
    }

    /// Returns true if `content_type` is accepted.
    #[must_use]
    pub fn matches(&self, content_type: &str) -> bool {
        let essence = sniff::mime_essence(content_type);
        self.content_types.iter().any(|ct| *ct == essence)
    }
}

impl Default for ResponseFilter {
    fn default() -> Self {
        Self::documents()
    }
}

/// Receiving half of the signals armed before a click.
///
/// Each receiver fires at most once. A dropped sender means the session will
/// not report that kind of event.
pub struct SignalWatch {
    /// A download started.
    pub download: oneshot::Receiver<DownloadSignal>,
    /// A popup or new tab opened.
    pub popup: oneshot::Receiver<Box<dyn PageSession>>,
    /// A qualifying response arrived.
    pub response: oneshot::Receiver<ObservedResponse>,
    /// The page navigated to a new URL.
    pub navigation: oneshot::Receiver<String>,
}

/// Sending half handed to the session implementation.
pub struct SignalSenders {
    /// Download started.
    pub download: oneshot::Sender<DownloadSignal>,
    /// Popup opened.
    pub popup: oneshot::Sender<Box<dyn PageSession>>,
    /// Qualifying response.
    pub response: oneshot::Sender<ObservedResponse>,
    /// In-page navigation.
    pub navigation: oneshot::Sender<String>,
}

impl std::fmt::Debug for SignalWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalWatch").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for SignalSenders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSenders").finish_non_exhaustive()
    }
}

/// Creates a fresh, connected set of signal channels.
#[must_use]
pub fn signal_channel() -> (SignalSenders, SignalWatch) {
    let (download_tx, download_rx) = oneshot::channel();
    let (popup_tx, popup_rx) = oneshot::channel();
    let (response_tx, response_rx) = oneshot::channel();
    let (navigation_tx, navigation_rx) = oneshot::channel();
    (
        SignalSenders {
            download: download_tx,
            popup: popup_tx,
            response: response_tx,
            navigation: navigation_tx,
        },
        SignalWatch {
            download: download_rx,
            popup: popup_rx,
            response: response_rx,
            navigation: navigation_rx,
        },
    )
}

/// A live page or popup.
#[async_trait]
pub trait PageSession: Send + Sync {
    /// URL currently displayed.
    async fn current_url(&self) -> Result<String, PageError>;

    /// Navigates this session to `url`.
    async fn navigate(&self, url: &str) -> Result<(), PageError>;

    /// Registers listeners for the next action's effects.
    ///
    /// Must be called before [`click`](Self::click); events that fire between
    /// arming and clicking are still delivered.
    async fn arm(&self, filter: &ResponseFilter) -> Result<SignalWatch, PageError>;

    /// Clicks the element behind `action`.
    async fn click(&self, action: &ActionRef) -> Result<(), PageError>;

    /// Finds the first element whose visible label matches `pattern` (a regex).
    async fn find_by_label(&self, pattern: &str) -> Result<Option<ActionRef>, PageError>;

    /// Values of `attribute` on every element matching `selector` (tag name).
    async fn attribute_values(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Vec<String>, PageError>;

    /// Fetcher carrying this session's cookies.
    fn fetcher(&self) -> Arc<dyn Fetcher>;

    /// Serialized DOM of the page.
    async fn snapshot(&self) -> Result<String, PageError>;

    /// Closes the session. Closing twice is not an error.
    async fn close(&self) -> Result<(), PageError>;
}

/// Opens page sessions.
#[async_trait]
pub trait PageProvider: Send + Sync {
    /// Opens `url` in a new session.
    async fn open(&self, url: &str) -> Result<Box<dyn PageSession>, PageError>;
}
