//! Case orchestration.
//!
//! A case is one detail page. Its candidates are resolved one at a time, the
//! outcomes recorded in a fresh manifest, and the result merged into whatever
//! an earlier run left in the case directory. The manifest is saved after
//! every case.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, instrument, warn};
use url::Url;

use crate::classify::{CategoryTable, scan_candidates};
use crate::manifest::{Manifest, ManifestEntry, ManifestError, ManifestIssue};
use crate::resolve::filename::sanitize_filename;
use crate::resolve::store::sha256_hex;
use crate::resolve::{
    Candidate, CandidateKind, CaseContext, PageError, PageProvider, PageSession, ResolutionEngine,
};

/// Query keys that usually carry the case number.
const CASE_ID_KEYS: &[&str] = &["caseid", "case_id", "caseno", "case_no", "sano", "sa_no", "id", "no"];

/// Subdirectory for page snapshots.
pub const DEBUG_DIR: &str = "debug";

/// Derives a filesystem-safe case id from a detail-page URL.
///
/// Uses a known case-number query parameter, then the last path segment,
/// then a short hash of the URL.
///
/// ```
/// use casefile_core::case::derive_case_id;
///
/// assert_eq!(derive_case_id("https://court.example/detail.do?saNo=2024-1234"), "2024-1234");
/// assert_eq!(derive_case_id("https://court.example/cases/77/"), "77");
/// ```
#[must_use]
pub fn derive_case_id(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return hashed_id(url);
    };

    let from_query = CASE_ID_KEYS.iter().find_map(|key| {
        parsed
            .query_pairs()
            .find(|(k, v)| k.eq_ignore_ascii_case(key) && !v.trim().is_empty())
            .map(|(_, v)| v.trim().to_string())
    });
    let from_path = || {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
            .and_then(|s| urlencoding::decode(s).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && !s.contains('.'))
    };

    match from_query.or_else(from_path) {
        Some(id) => sanitize_filename(&id),
        None => hashed_id(url),
    }
}

fn hashed_id(url: &str) -> String {
    let digest = sha256_hex(url.as_bytes());
    format!("case-{}", &digest[..12])
}

/// Errors that fail one case.
#[derive(Debug, Error)]
pub enum CaseError {
    /// Detail page could not be opened.
    #[error("failed to open {url}: {source}")]
    Open {
        url: String,
        #[source]
        source: PageError,
    },

    /// Candidates could not be listed.
    #[error("failed to list candidates on {url}: {source}")]
    Candidates {
        url: String,
        #[source]
        source: PageError,
    },

    /// Manifest could not be loaded or saved.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// One case to process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CaseRequest {
    /// Detail-page URL.
    pub url: String,
    /// Candidates from an external classifier. Scanned from the page if absent.
    #[serde(default)]
    pub candidates: Option<Vec<Candidate>>,
}

impl CaseRequest {
    /// A request whose candidates are scanned from the page.
    pub fn scan(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            candidates: None,
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct CaseSettings {
    /// Parent of all case directories.
    pub output_root: PathBuf,
    pub required_categories: BTreeSet<String>,
    /// Categories always recorded as links.
    pub link_only_categories: BTreeSet<String>,
    /// Write `debug/before.html` and `debug/after.html`.
    pub snapshots: bool,
    /// Pause after this many cases; 0 disables.
    pub pause_every: usize,
    pub pause_duration: Duration,
}

/// What one processed case produced.
#[derive(Debug, Clone)]
pub struct CaseReport {
    pub case_id: String,
    pub url: String,
    pub case_dir: PathBuf,
    /// Entries added by this run.
    pub fresh_entries: usize,
    /// Manifest after merging with earlier runs.
    pub manifest: Manifest,
    pub issues: Vec<ManifestIssue>,
}

/// One failed case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseFailure {
    pub url: String,
    pub reason: String,
}

/// Totals for a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub reports: Vec<CaseReport>,
    pub failures: Vec<CaseFailure>,
    /// Union of missing required categories across processed cases.
    pub missing: BTreeSet<String>,
}

impl RunSummary {
    #[must_use]
    pub fn cases_ok(&self) -> usize {
        self.reports.len()
    }

    #[must_use]
    pub fn cases_failed(&self) -> usize {
        self.failures.len()
    }

    fn record(&mut self, url: &str, result: Result<CaseReport, CaseError>) {
        match result {
            Ok(report) => {
                self.missing.extend(report.manifest.missing());
                self.reports.push(report);
            }
            Err(error) => self.failures.push(CaseFailure {
                url: url.to_string(),
                reason: error.to_string(),
            }),
        }
    }
}

/// Drives cases through the engine and the ledger.
pub struct CaseOrchestrator {
    provider: Arc<dyn PageProvider>,
    engine: ResolutionEngine,
    table: CategoryTable,
    settings: CaseSettings,
}

impl std::fmt::Debug for CaseOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseOrchestrator")
            .field("engine", &self.engine)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CaseOrchestrator {
    /// Uses the built-in category table.
    #[must_use]
    pub fn new(provider: Arc<dyn PageProvider>, engine: ResolutionEngine, settings: CaseSettings) -> Self {
        Self {
            provider,
            engine,
            table: CategoryTable::builtin().clone(),
            settings,
        }
    }

    /// Replaces the category table used when scanning pages.
    #[must_use]
    pub fn with_table(mut self, table: CategoryTable) -> Self {
        self.table = table;
        self
    }

    /// Directory for a case id.
    #[must_use]
    pub fn case_dir(&self, case_id: &str) -> PathBuf {
        self.settings.output_root.join(case_id)
    }

    /// Processes one case and saves its manifest.
    ///
    /// # Errors
    ///
    /// Returns [`CaseError`] if the page cannot be opened, candidates cannot
    /// be listed, or the manifest cannot be loaded or saved. Candidate
    /// failures are recorded in the manifest instead.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn process_case(&self, request: &CaseRequest) -> Result<CaseReport, CaseError> {
        let case_id = derive_case_id(&request.url);
        let case_dir = self.case_dir(&case_id);

        let prior = Manifest::load(&case_dir).await?;
        let mut ctx = CaseContext::new(&case_dir, &request.url)
            .with_existing_files(prior.iter().flat_map(Manifest::successful_file_names));

        let page = self
            .provider
            .open(&request.url)
            .await
            .map_err(|source| CaseError::Open {
                url: request.url.clone(),
                source,
            })?;

        let result = self.resolve_all(request, page.as_ref(), &case_id, &case_dir, &mut ctx).await;
        if let Err(error) = page.close().await {
            warn!(%error, "failed to close page");
        }
        let fresh = result?;
        let fresh_entries = fresh.entries().len();

        let manifest = match prior {
            Some(prior) => Manifest::merge(prior, fresh),
            None => fresh,
        };
        manifest.persist(&case_dir).await?;

        let issues = manifest.validate();
        for issue in &issues {
            warn!(case_id = %case_id, %issue, "manifest issue");
        }
        info!(
            case_id = %case_id,
            fresh_entries,
            succeeded = manifest.stats().succeeded,
            missing = ?manifest.missing(),
            "case processed"
        );

        Ok(CaseReport {
            case_id,
            url: request.url.clone(),
            case_dir,
            fresh_entries,
            manifest,
            issues,
        })
    }

    async fn resolve_all(
        &self,
        request: &CaseRequest,
        page: &dyn PageSession,
        case_id: &str,
        case_dir: &Path,
        ctx: &mut CaseContext,
    ) -> Result<Manifest, CaseError> {
        let before = if self.settings.snapshots || request.candidates.is_none() {
            Some(page.snapshot().await.map_err(|source| CaseError::Candidates {
                url: request.url.clone(),
                source,
            })?)
        } else {
            None
        };
        if self.settings.snapshots
            && let Some(html) = &before
        {
            write_snapshot(case_dir, "before.html", html).await;
        }

        let candidates = match (&request.candidates, &before) {
            (Some(provided), _) => provided
                .iter()
                .cloned()
                .map(|c| self.apply_link_only(c))
                .collect(),
            (None, Some(html)) => {
                scan_candidates(html, &self.table, &self.settings.link_only_categories)
            }
            (None, None) => Vec::new(),
        };
        info!(candidates = candidates.len(), "resolving candidates");

        let mut fresh = Manifest::new(case_id, &request.url, self.settings.required_categories.iter().cloned());
        for candidate in &candidates {
            let outcome = self.engine.resolve(candidate, page, ctx).await;
            fresh.append(ManifestEntry::from_outcome(candidate, outcome));
        }

        if self.settings.snapshots {
            match page.snapshot().await {
                Ok(html) => write_snapshot(case_dir, "after.html", &html).await,
                Err(error) => warn!(%error, "after snapshot failed"),
            }
        }
        Ok(fresh)
    }

    /// Forces link-only categories onto the link path.
    fn apply_link_only(&self, mut candidate: Candidate) -> Candidate {
        if candidate.kind == CandidateKind::File
            && self
                .settings
                .link_only_categories
                .contains(candidate.category_or_unknown())
        {
            if candidate.target_hint.is_none() && !candidate.action.as_str().is_empty() {
                candidate.target_hint = Some(candidate.action.as_str().to_string());
            }
            candidate.kind = CandidateKind::Link;
        }
        candidate
    }

    /// Processes `requests` in order, pausing every `pause_every` cases.
    ///
    /// `on_case` is called after each case with its URL and whether it
    /// succeeded.
    pub async fn run<F>(&self, requests: &[CaseRequest], mut on_case: F) -> RunSummary
    where
        F: FnMut(&str, bool),
    {
        let mut summary = RunSummary::default();
        for (index, request) in requests.iter().enumerate() {
            let result = self.process_case(request).await;
            if let Err(error) = &result {
                warn!(url = %request.url, %error, "case failed");
            }
            on_case(&request.url, result.is_ok());
            summary.record(&request.url, result);

            let done = index + 1;
            if self.settings.pause_every > 0
                && done % self.settings.pause_every == 0
                && done < requests.len()
            {
                info!(pause_secs = self.settings.pause_duration.as_secs_f64(), "pausing between cases");
                tokio::time::sleep(self.settings.pause_duration).await;
            }
        }
        summary
    }
}

/// Writes a debug snapshot. Failures are logged and never fail the case.
async fn write_snapshot(case_dir: &Path, name: &str, html: &str) {
    let dir = case_dir.join(DEBUG_DIR);
    let path = dir.join(name);
    let written = match tokio::fs::create_dir_all(&dir).await {
        Ok(()) => tokio::fs::write(&path, html).await,
        Err(error) => Err(error),
    };
    if let Err(error) = written {
        warn!(path = %path.display(), %error, "failed to write snapshot");
    }
}
