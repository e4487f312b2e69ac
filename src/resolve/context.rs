//! Per-case mutable state threaded through the engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::filename::FilenameRegistry;

/// Headers remembered for a URL seen during the case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedMeta {
    /// Declared content type.
    pub content_type: Option<String>,
    /// Filename from Content-Disposition.
    pub disposition_filename: Option<String>,
}

/// State owned by one case and dropped when it ends.
///
/// Holds the filename registry and the URL-keyed metadata captured from
/// responses, so nothing leaks from one case into the next.
#[derive(Debug)]
pub struct CaseContext {
    case_dir: PathBuf,
    page_url: String,
    registry: FilenameRegistry,
    observed: HashMap<String, ObservedMeta>,
}

impl CaseContext {
    /// Creates a context writing into `case_dir` for the page at `page_url`.
    pub fn new(case_dir: impl Into<PathBuf>, page_url: impl Into<String>) -> Self {
        Self {
            case_dir: case_dir.into(),
            page_url: page_url.into(),
            registry: FilenameRegistry::new(),
            observed: HashMap::new(),
        }
    }

    /// Seeds the registry with names written by earlier runs.
    #[must_use]
    pub fn with_existing_files<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.registry.seed(names);
        self
    }

    /// Output directory of the case.
    #[must_use]
    pub fn case_dir(&self) -> &Path {
        &self.case_dir
    }

    /// Detail page URL, used as referer.
    #[must_use]
    pub fn page_url(&self) -> &str {
        &self.page_url
    }

    /// Filename registry.
    #[must_use]
    pub fn registry(&self) -> &FilenameRegistry {
        &self.registry
    }

    /// Mutable filename registry.
    pub fn registry_mut(&mut self) -> &mut FilenameRegistry {
        &mut self.registry
    }

    /// Remembers headers seen for `url`. Later observations fill gaps only.
    pub fn observe(&mut self, url: &str, meta: ObservedMeta) {
        let entry = self.observed.entry(url.to_string()).or_default();
        if entry.content_type.is_none() {
            entry.content_type = meta.content_type;
        }
        if entry.disposition_filename.is_none() {
            entry.disposition_filename = meta.disposition_filename;
        }
    }

    /// Headers previously seen for `url`.
    #[must_use]
    pub fn observed(&self, url: &str) -> Option<&ObservedMeta> {
        self.observed.get(url)
    }
}
