//! Attachment resolution.
//!
//! Turns one labelled [`Candidate`] into either an acquired file on disk or a
//! definitive "not a file" verdict. The entry point is
//! [`ResolutionEngine::resolve`]; see [`engine`] for the strategy chain.

mod context;
pub mod engine;
pub mod filename;
pub mod page;
pub mod pickup;
mod popup;
mod race;
pub mod reconstruct;
pub mod store;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use context::{CaseContext, ObservedMeta};
pub use engine::{ResolutionEngine, ResolveSettings};
pub use filename::FilenameRegistry;
pub use page::{
    DownloadSignal, ObservedResponse, PageError, PageProvider, PageSession, ResponseFilter,
    SignalSenders, SignalWatch, signal_channel,
};
pub use pickup::{FolderPickup, PickedFile, PollingFolderPickup};

use crate::sniff::Verdict;
use crate::transport::TransportError;

/// Category recorded when a candidate has none.
pub const UNKNOWN_CATEGORY: &str = "UNK";

/// Whether a candidate can yield a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    /// Clicking may produce a document.
    #[default]
    File,
    /// Reference only; never downloaded.
    Link,
}

/// Opaque reference to a clickable element, interpreted by the page session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionRef(pub String);

impl ActionRef {
    /// Creates a reference.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw reference string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One labelled action discovered on a case page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Visible label.
    pub label: String,
    /// Element to click.
    #[serde(default)]
    pub action: ActionRef,
    /// href-like value found on the element.
    #[serde(default)]
    pub target_hint: Option<String>,
    /// Document category code.
    #[serde(default)]
    pub category: Option<String>,
    /// File or link.
    #[serde(default)]
    pub kind: CandidateKind,
}

impl Candidate {
    /// A candidate expected to produce a file.
    pub fn file(label: impl Into<String>, action: ActionRef) -> Self {
        Self {
            label: label.into(),
            action,
            target_hint: None,
            category: None,
            kind: CandidateKind::File,
        }
    }

    /// A link-only candidate.
    pub fn link(label: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ActionRef::default(),
            target_hint: Some(target.into()),
            category: None,
            kind: CandidateKind::Link,
        }
    }

    /// Sets the category code.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Sets the target hint.
    #[must_use]
    pub fn with_target_hint(mut self, hint: impl Into<String>) -> Self {
        self.target_hint = Some(hint.into());
        self
    }

    /// Category, or [`UNKNOWN_CATEGORY`].
    #[must_use]
    pub fn category_or_unknown(&self) -> &str {
        self.category.as_deref().unwrap_or(UNKNOWN_CATEGORY)
    }

    /// The most specific reference string available.
    #[must_use]
    pub fn source_ref(&self) -> String {
        self.target_hint
            .clone()
            .unwrap_or_else(|| self.action.0.clone())
    }
}

/// Which tier of the strategy chain produced the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Link candidate recorded as-is.
    LinkOnly,
    /// External absolute URL, no click.
    DirectLink,
    /// Browser download event.
    DownloadSignal,
    /// Document found through a popup.
    PopupInspection,
    /// Qualifying response on the main page.
    ResponseCapture,
    /// Reference rewritten and fetched directly.
    DirectUrlReconstruction,
    /// Page navigated to the document.
    InPageNavigation,
    /// File picked up from the OS download folder.
    FolderPickup,
    /// Nothing worked.
    Unresolved,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LinkOnly => "link_only",
            Self::DirectLink => "direct_link",
            Self::DownloadSignal => "download_signal",
            Self::PopupInspection => "popup_inspection",
            Self::ResponseCapture => "response_capture",
            Self::DirectUrlReconstruction => "direct_url_reconstruction",
            Self::InPageNavigation => "in_page_navigation",
            Self::FolderPickup => "folder_pickup",
            Self::Unresolved => "unresolved",
        };
        f.write_str(name)
    }
}

/// A file written into the case directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquiredResource {
    /// Name relative to the case directory.
    pub file_name: String,
    /// Bytes written.
    pub size: u64,
    /// Declared content type, if any.
    pub content_type: Option<String>,
    /// Extension without the dot.
    pub extension: String,
    /// Lowercase hex SHA-256 of the content.
    pub sha256: String,
}

/// What resolving one candidate produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionOutcome {
    /// Tier that decided the outcome.
    pub strategy: ResolutionStrategy,
    /// Best known concrete location.
    pub resolved_location: Option<String>,
    /// Whether the candidate resolved.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
    /// The file, when one was written.
    pub acquired: Option<AcquiredResource>,
}

impl ResolutionOutcome {
    /// A successful acquisition.
    #[must_use]
    pub fn acquired(
        strategy: ResolutionStrategy,
        location: impl Into<String>,
        resource: AcquiredResource,
    ) -> Self {
        Self {
            strategy,
            resolved_location: Some(location.into()),
            success: true,
            error: None,
            acquired: Some(resource),
        }
    }

    /// A successful resolution without a file.
    #[must_use]
    pub fn link(strategy: ResolutionStrategy, location: Option<String>) -> Self {
        Self {
            strategy,
            resolved_location: location,
            success: true,
            error: None,
            acquired: None,
        }
    }

    /// A failed resolution.
    #[must_use]
    pub fn failed(
        strategy: ResolutionStrategy,
        location: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            strategy,
            resolved_location: location,
            success: false,
            error: Some(error.into()),
            acquired: None,
        }
    }
}

/// Errors raised inside the strategy chain.
///
/// [`ResolutionEngine::resolve`] folds these into a failed outcome.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No strategy yielded a file.
    #[error("no strategy produced a file for '{label}'{}", last_error_suffix(.last_error))]
    Ambiguous {
        /// Candidate label.
        label: String,
        /// Most recent error seen along the chain.
        last_error: Option<String>,
    },

    /// The candidate budget ran out.
    #[error("resolution of '{label}' exceeded its {budget_ms}ms budget")]
    BudgetExceeded {
        /// Candidate label.
        label: String,
        /// Budget in milliseconds.
        budget_ms: u64,
    },

    /// Fetching failed after retries.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The payload could not be written.
    #[error("failed to write {path}: {source}")]
    Filesystem {
        /// Target path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The page session failed.
    #[error(transparent)]
    Page(#[from] PageError),

    /// The response was not a document type.
    #[error("{url} answered with non-document content type {content_type}")]
    DisallowedContentType {
        /// Fetched URL.
        url: String,
        /// What the server declared.
        content_type: String,
    },

    /// A captured payload failed the integrity sniff.
    #[error("payload from {url} rejected: {verdict}")]
    Integrity {
        /// Source URL.
        url: String,
        /// Sniffer verdict.
        verdict: Verdict,
    },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(" (last error: {e})"))
        .unwrap_or_default()
}

impl ResolveError {
    /// Creates a filesystem error.
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// True for errors that end the candidate immediately.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Filesystem { .. })
    }
}
