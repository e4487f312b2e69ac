//! The resolution engine.
//!
//! For a file candidate the engine walks a fixed chain and stops at the first
//! tier that yields a document:
//!
//! 1. external absolute `target_hint` (no click)
//! 2. click-and-race: download, popup, response, navigation
//! 3. direct-URL reconstruction of the candidate's reference
//! 4. OS-folder pickup, when configured
//!
//! The whole chain runs under a per-candidate wall-clock budget. Failures
//! never escape [`ResolutionEngine::resolve`]; they become a failed
//! [`ResolutionOutcome`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::context::{CaseContext, ObservedMeta};
use super::filename::{is_document_url, parse_content_disposition};
use super::page::{DownloadSignal, ObservedResponse, PageSession, ResponseFilter};
use super::pickup::FolderPickup;
use super::race::{self, RaceTimeouts, Signal};
use super::reconstruct::reconstruct;
use super::store::{self, Payload};
use super::{Candidate, CandidateKind, ResolutionOutcome, ResolutionStrategy, ResolveError};
use crate::sniff;
use crate::transport::{FetchRequest, FetchResponse, Fetcher, RateLimitedTransport};

/// Default label pattern for a nested download control inside a popup.
pub const DEFAULT_DOWNLOAD_LABEL_PATTERN: &str = r"(?i)다운로드|내려받기|저장|download|save";

/// Timeouts and budgets for one candidate.
#[derive(Debug, Clone)]
pub struct ResolveSettings {
    /// Wait for a download-started signal.
    pub download_timeout: Duration,
    /// Wait for a popup.
    pub popup_timeout: Duration,
    /// Wait for a qualifying response.
    pub response_timeout: Duration,
    /// Wait for an in-page navigation.
    pub navigation_timeout: Duration,
    /// How long a first signal may be pre-empted by a higher-priority one.
    pub settle_window: Duration,
    /// Wait for a document inside a popup.
    pub popup_signal_timeout: Duration,
    /// Wall-clock budget for the whole chain.
    pub candidate_budget: Duration,
    /// Regex matched against popup labels to find a download control.
    pub download_label_pattern: String,
}

impl Default for ResolveSettings {
    fn default() -> Self {
        Self {
            download_timeout: Duration::from_secs(10),
            popup_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(8),
            navigation_timeout: Duration::from_secs(5),
            settle_window: Duration::from_millis(300),
            popup_signal_timeout: Duration::from_secs(4),
            candidate_budget: Duration::from_secs(90),
            download_label_pattern: DEFAULT_DOWNLOAD_LABEL_PATTERN.to_string(),
        }
    }
}

/// What happened along the chain, kept for the failure report.
#[derive(Debug)]
pub(super) struct Trail {
    strategy: ResolutionStrategy,
    location: Option<String>,
    last_error: Option<String>,
    tried: HashSet<String>,
}

impl Trail {
    fn new() -> Self {
        Self {
            strategy: ResolutionStrategy::Unresolved,
            location: None,
            last_error: None,
            tried: HashSet::new(),
        }
    }

    pub(super) fn visit(&mut self, location: &str) {
        self.location = Some(location.to_string());
    }

    /// Returns false if `url` was already fetched for this candidate.
    pub(super) fn first_try(&mut self, url: &str) -> bool {
        self.tried.insert(url.to_string())
    }

    /// Records a recoverable error; fatal ones are handed back.
    pub(super) fn absorb(&mut self, error: ResolveError) -> Result<(), ResolveError> {
        if error.is_fatal() {
            return Err(error);
        }
        debug!(%error, "strategy failed, continuing");
        self.last_error = Some(error.to_string());
        Ok(())
    }
}

/// Resolves candidates into acquired files or link verdicts.
pub struct ResolutionEngine {
    pub(super) transport: Arc<RateLimitedTransport>,
    pub(super) settings: ResolveSettings,
    pub(super) filter: ResponseFilter,
    pickup: Option<Arc<dyn FolderPickup>>,
}

impl std::fmt::Debug for ResolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionEngine")
            .field("settings", &self.settings)
            .field("folder_pickup", &self.pickup.is_some())
            .finish_non_exhaustive()
    }
}

impl ResolutionEngine {
    /// Creates an engine sharing `transport`.
    #[must_use]
    pub fn new(transport: Arc<RateLimitedTransport>, settings: ResolveSettings) -> Self {
        Self {
            transport,
            settings,
            filter: ResponseFilter::documents(),
            pickup: None,
        }
    }

    /// Enables the OS-folder pickup fallback.
    #[must_use]
    pub fn with_pickup(mut self, pickup: Arc<dyn FolderPickup>) -> Self {
        self.pickup = Some(pickup);
        self
    }

    /// Replaces the qualifying-response filter.
    #[must_use]
    pub fn with_filter(mut self, filter: ResponseFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Settings in effect.
    #[must_use]
    pub fn settings(&self) -> &ResolveSettings {
        &self.settings
    }

    /// Resolves one candidate. Never fails; problems become a failed outcome.
    #[instrument(skip(self, candidate, page, ctx), fields(label = %candidate.label, category = candidate.category_or_unknown()))]
    pub async fn resolve(
        &self,
        candidate: &Candidate,
        page: &dyn PageSession,
        ctx: &mut CaseContext,
    ) -> ResolutionOutcome {
        if candidate.kind == CandidateKind::Link {
            debug!("link candidate recorded as-is");
            return ResolutionOutcome::link(
                ResolutionStrategy::LinkOnly,
                candidate.target_hint.clone(),
            );
        }

        let mut trail = Trail::new();
        let budget = self.settings.candidate_budget;
        let result = timeout(budget, self.resolve_file(candidate, page, ctx, &mut trail)).await;

        let error = match result {
            Ok(Ok(outcome)) => {
                info!(strategy = %outcome.strategy, success = outcome.success, "candidate resolved");
                return outcome;
            }
            Ok(Err(error)) => error,
            Err(_) => ResolveError::BudgetExceeded {
                label: candidate.label.clone(),
                budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
            },
        };
        warn!(%error, "candidate unresolved");
        ResolutionOutcome::failed(trail.strategy, trail.location, error.to_string())
    }

    async fn resolve_file(
        &self,
        candidate: &Candidate,
        page: &dyn PageSession,
        ctx: &mut CaseContext,
        trail: &mut Trail,
    ) -> Result<ResolutionOutcome, ResolveError> {
        if let Some(target) = external_target(candidate.target_hint.as_deref(), ctx.page_url()) {
            return self.resolve_direct(&target, candidate, page, ctx, trail).await;
        }

        let clicked_at = SystemTime::now();
        if candidate.action.as_str().is_empty() {
            debug!("no action to click");
        } else {
            match race::click_and_race(page, &candidate.action, &self.filter, self.race_timeouts())
                .await
            {
                Ok(Some(signal)) => {
                    if let Some(outcome) =
                        self.follow_signal(signal, candidate, page, ctx, trail).await?
                    {
                        return Ok(outcome);
                    }
                }
                Ok(None) => debug!("click produced no signal"),
                Err(error) => trail.absorb(error.into())?,
            }
        }

        if let Some(outcome) = self.try_reconstruction(candidate, page, ctx, trail).await? {
            return Ok(outcome);
        }

        if let Some(outcome) = self.try_pickup(clicked_at, candidate, ctx, trail).await? {
            return Ok(outcome);
        }

        Err(ResolveError::Ambiguous {
            label: candidate.label.clone(),
            last_error: trail.last_error.clone(),
        })
    }

    /// External absolute URL: fetch it if it names a document, otherwise
    /// record it as a resolved link.
    async fn resolve_direct(
        &self,
        target: &str,
        candidate: &Candidate,
        page: &dyn PageSession,
        ctx: &mut CaseContext,
        trail: &mut Trail,
    ) -> Result<ResolutionOutcome, ResolveError> {
        trail.strategy = ResolutionStrategy::DirectLink;
        trail.visit(target);
        if !is_document_url(target) {
            debug!(%target, "external non-document target, no click");
            return Ok(ResolutionOutcome::link(
                ResolutionStrategy::DirectLink,
                Some(target.to_string()),
            ));
        }
        let response = self.fetch_document(page.fetcher(), target, ctx).await?;
        self.accept_fetched(response, ResolutionStrategy::DirectLink, candidate, ctx)
            .await
    }

    async fn follow_signal(
        &self,
        signal: Signal,
        candidate: &Candidate,
        page: &dyn PageSession,
        ctx: &mut CaseContext,
        trail: &mut Trail,
    ) -> Result<Option<ResolutionOutcome>, ResolveError> {
        match signal {
            Signal::Download(download) => {
                trail.strategy = ResolutionStrategy::DownloadSignal;
                let result = self
                    .accept_download(download, ResolutionStrategy::DownloadSignal, candidate, page, ctx, trail)
                    .await;
                settle(result, trail)
            }
            Signal::Popup(guard) => {
                trail.strategy = ResolutionStrategy::PopupInspection;
                let result = self
                    .inspect_popup(guard.session(), candidate, ctx, trail)
                    .await;
                guard.close().await;
                result
            }
            Signal::Response(observed) => {
                trail.strategy = ResolutionStrategy::ResponseCapture;
                let result = self
                    .accept_observed(observed, ResolutionStrategy::ResponseCapture, candidate, ctx, trail)
                    .await;
                settle(result, trail)
            }
            Signal::Navigation(url) => {
                trail.strategy = ResolutionStrategy::InPageNavigation;
                trail.visit(&url);
                let result = if trail.first_try(&url) {
                    match self.fetch_document(page.fetcher(), &url, ctx).await {
                        Ok(response) => self
                            .accept_fetched(response, ResolutionStrategy::InPageNavigation, candidate, ctx)
                            .await
                            .map(Some),
                        Err(error) => Err(error),
                    }
                } else {
                    Ok(None)
                };
                // Later candidates need the detail page back.
                if let Err(error) = page.navigate(ctx.page_url()).await {
                    warn!(%error, "failed to return to detail page");
                }
                match result {
                    Ok(outcome) => Ok(outcome),
                    Err(error) => {
                        trail.absorb(error)?;
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn try_reconstruction(
        &self,
        candidate: &Candidate,
        page: &dyn PageSession,
        ctx: &mut CaseContext,
        trail: &mut Trail,
    ) -> Result<Option<ResolutionOutcome>, ResolveError> {
        let base_str = page
            .current_url()
            .await
            .unwrap_or_else(|_| ctx.page_url().to_string());
        let Ok(base) = Url::parse(&base_str).or_else(|_| Url::parse(ctx.page_url())) else {
            return Ok(None);
        };

        let references = candidate
            .target_hint
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(candidate.action.as_str()).filter(|a| looks_like_reference(a)));

        for reference in references {
            let Some(url) = reconstruct(reference, &base) else {
                continue;
            };
            let url = url.to_string();
            if !trail.first_try(&url) {
                continue;
            }
            trail.strategy = ResolutionStrategy::DirectUrlReconstruction;
            trail.visit(&url);
            debug!(%reference, %url, "trying reconstructed URL");

            match self.fetch_document(page.fetcher(), &url, ctx).await {
                Ok(response) => {
                    return self
                        .accept_fetched(
                            response,
                            ResolutionStrategy::DirectUrlReconstruction,
                            candidate,
                            ctx,
                        )
                        .await
                        .map(Some);
                }
                Err(error) => trail.absorb(error)?,
            }
        }
        Ok(None)
    }

    async fn try_pickup(
        &self,
        since: SystemTime,
        candidate: &Candidate,
        ctx: &mut CaseContext,
        trail: &mut Trail,
    ) -> Result<Option<ResolutionOutcome>, ResolveError> {
        let Some(pickup) = &self.pickup else {
            return Ok(None);
        };
        let Some(picked) = pickup.pick_up(since).await else {
            return Ok(None);
        };
        trail.strategy = ResolutionStrategy::FolderPickup;
        let location = picked.path.display().to_string();
        trail.visit(&location);

        let body = tokio::fs::read(&picked.path)
            .await
            .map_err(|e| ResolveError::filesystem(&picked.path, e))?;
        let verdict = sniff::sniff(&body, None);
        if !verdict.is_genuine() {
            trail.absorb(ResolveError::Integrity {
                url: location,
                verdict,
            })?;
            return Ok(None);
        }

        let payload = Payload {
            source_url: &location,
            body: &body,
            content_type: None,
            suggested_name: picked.file_name(),
        };
        let acquired = store::persist(ctx, candidate, payload).await?;
        Ok(Some(ResolutionOutcome::acquired(
            ResolutionStrategy::FolderPickup,
            location,
            acquired,
        )))
    }

    /// Persists a download signal's payload, fetching it if the session did
    /// not capture the bytes.
    pub(super) async fn accept_download(
        &self,
        download: DownloadSignal,
        strategy: ResolutionStrategy,
        candidate: &Candidate,
        page: &dyn PageSession,
        ctx: &mut CaseContext,
        trail: &mut Trail,
    ) -> Result<ResolutionOutcome, ResolveError> {
        trail.visit(&download.url);
        let Some(body) = download.body else {
            trail.first_try(&download.url);
            let request = FetchRequest::file(&download.url).with_referer(ctx.page_url());
            let response = self.transport.fetch(page.fetcher(), request).await?;
            let suggested = response
                .content_disposition_filename()
                .or(download.suggested_filename);
            let payload = Payload {
                source_url: &response.final_url,
                body: &response.body,
                content_type: response.content_type().or(download.content_type.as_deref()),
                suggested_name: suggested.as_deref(),
            };
            let acquired = store::persist(ctx, candidate, payload).await?;
            return Ok(ResolutionOutcome::acquired(
                strategy,
                response.final_url.clone(),
                acquired,
            ));
        };

        let verdict = sniff::sniff(&body, download.content_type.as_deref());
        if !verdict.is_genuine() {
            return Err(ResolveError::Integrity {
                url: download.url,
                verdict,
            });
        }
        let payload = Payload {
            source_url: &download.url,
            body: &body,
            content_type: download.content_type.as_deref(),
            suggested_name: download.suggested_filename.as_deref(),
        };
        let acquired = store::persist(ctx, candidate, payload).await?;
        Ok(ResolutionOutcome::acquired(strategy, download.url, acquired))
    }

    /// Persists a response the session observed.
    pub(super) async fn accept_observed(
        &self,
        observed: ObservedResponse,
        strategy: ResolutionStrategy,
        candidate: &Candidate,
        ctx: &mut CaseContext,
        trail: &mut Trail,
    ) -> Result<ResolutionOutcome, ResolveError> {
        trail.visit(&observed.url);
        let disposition_name = observed
            .content_disposition
            .as_deref()
            .and_then(parse_content_disposition);
        ctx.observe(
            &observed.url,
            ObservedMeta {
                content_type: observed.content_type.clone(),
                disposition_filename: disposition_name.clone(),
            },
        );

        let verdict = sniff::sniff(&observed.body, observed.content_type.as_deref());
        if !verdict.is_genuine() {
            return Err(ResolveError::Integrity {
                url: observed.url,
                verdict,
            });
        }
        let payload = Payload {
            source_url: &observed.url,
            body: &observed.body,
            content_type: observed.content_type.as_deref(),
            suggested_name: disposition_name.as_deref(),
        };
        let acquired = store::persist(ctx, candidate, payload).await?;
        Ok(ResolutionOutcome::acquired(strategy, observed.url, acquired))
    }

    /// Persists a transport response that already passed the sniff.
    pub(super) async fn accept_fetched(
        &self,
        response: FetchResponse,
        strategy: ResolutionStrategy,
        candidate: &Candidate,
        ctx: &mut CaseContext,
    ) -> Result<ResolutionOutcome, ResolveError> {
        let disposition_name = response.content_disposition_filename();
        let payload = Payload {
            source_url: &response.final_url,
            body: &response.body,
            content_type: response.content_type(),
            suggested_name: disposition_name.as_deref(),
        };
        let acquired = store::persist(ctx, candidate, payload).await?;
        Ok(ResolutionOutcome::acquired(
            strategy,
            response.final_url.clone(),
            acquired,
        ))
    }

    /// Fetches `url` through the transport with the detail page as referer
    /// and accepts it only if it is a document.
    pub(super) async fn fetch_document(
        &self,
        fetcher: Arc<dyn Fetcher>,
        url: &str,
        ctx: &mut CaseContext,
    ) -> Result<FetchResponse, ResolveError> {
        let request = FetchRequest::file(url).with_referer(ctx.page_url());
        let response = self.transport.fetch(fetcher, request).await?;
        ctx.observe(
            &response.final_url,
            ObservedMeta {
                content_type: response.content_type().map(str::to_string),
                disposition_filename: response.content_disposition_filename(),
            },
        );
        ensure_document_type(&response)?;
        Ok(response)
    }

    pub(super) fn race_timeouts(&self) -> RaceTimeouts {
        RaceTimeouts {
            download: self.settings.download_timeout,
            popup: self.settings.popup_timeout,
            response: self.settings.response_timeout,
            navigation: self.settings.navigation_timeout,
            settle: self.settings.settle_window,
        }
    }
}

/// Turns a strategy error into "try the next tier" unless it is fatal.
fn settle(
    result: Result<ResolutionOutcome, ResolveError>,
    trail: &mut Trail,
) -> Result<Option<ResolutionOutcome>, ResolveError> {
    match result {
        Ok(outcome) => Ok(Some(outcome)),
        Err(error) => {
            trail.absorb(error)?;
            Ok(None)
        }
    }
}

/// Accepts allow-listed content types, or an undeclared type whose bytes
/// carry a known document signature.
fn ensure_document_type(response: &FetchResponse) -> Result<(), ResolveError> {
    match response.content_type() {
        Some(content_type) if sniff::is_document_content_type(content_type) => Ok(()),
        None if sniff::detect_signature(&response.body).is_some() => Ok(()),
        other => Err(ResolveError::DisallowedContentType {
            url: response.final_url.clone(),
            content_type: other.unwrap_or("none").to_string(),
        }),
    }
}

/// `hint` if it is an absolute http(s) URL on a different host than the page.
fn external_target(hint: Option<&str>, page_url: &str) -> Option<String> {
    let hint = Url::parse(hint?.trim()).ok()?;
    if !matches!(hint.scheme(), "http" | "https") {
        return None;
    }
    let page_host = Url::parse(page_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase));
    let hint_host = hint.host_str().map(str::to_ascii_lowercase);
    (hint_host.is_some() && hint_host != page_host).then(|| hint.to_string())
}

/// Action strings that are themselves references rather than selectors.
fn looks_like_reference(action: &str) -> bool {
    let lower = action.trim().to_ascii_lowercase();
    lower.starts_with("javascript:")
        || lower.starts_with("http://")
        || lower.starts_with("https://")
        || (lower.starts_with('/') && !lower.starts_with("//"))
        || lower.contains(".do?")
}
