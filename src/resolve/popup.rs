//! Popup inspection.
//!
//! A popup that won the race is searched for the document in order: a
//! qualifying response while it loads, a nested download control, its own
//! URL rewritten to download mode, then inline viewer sources.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};
use url::Url;

use super::context::CaseContext;
use super::engine::{ResolutionEngine, Trail};
use super::page::PageSession;
use super::race::{self, RaceTimeouts, Signal};
use super::reconstruct::reconstruct;
use super::{Candidate, ResolutionOutcome, ResolutionStrategy, ResolveError};

/// Viewer elements and the attribute naming their content.
const VIEWER_SOURCES: &[(&str, &str)] = &[("iframe", "src"), ("embed", "src"), ("object", "data")];

/// Query keys viewer pages use to name the document they display.
const VIEWER_FILE_KEYS: &[&str] = &["file", "src", "url", "doc"];

/// Owns a popup and closes it on every exit path.
pub(crate) struct PopupGuard {
    session: Arc<dyn PageSession>,
    closed: bool,
}

impl PopupGuard {
    pub(super) fn new(session: Box<dyn PageSession>) -> Self {
        Self {
            session: Arc::from(session),
            closed: false,
        }
    }

    pub(super) fn session(&self) -> &dyn PageSession {
        self.session.as_ref()
    }

    /// Closes the popup and waits for it.
    pub(super) async fn close(mut self) {
        self.closed = true;
        if let Err(error) = self.session.close().await {
            debug!(%error, "popup close failed");
        }
    }
}

impl Drop for PopupGuard {
    fn drop(&mut self) {
        if !self.closed {
            race::close_detached(Arc::clone(&self.session));
        }
    }
}

impl ResolutionEngine {
    /// Looks inside a popup for the candidate's document.
    #[instrument(skip_all, fields(label = %candidate.label))]
    pub(super) async fn inspect_popup(
        &self,
        popup: &dyn PageSession,
        candidate: &Candidate,
        ctx: &mut CaseContext,
        trail: &mut Trail,
    ) -> Result<Option<ResolutionOutcome>, ResolveError> {
        let popup_url = match popup.current_url().await {
            Ok(url) => url,
            Err(error) => {
                trail.absorb(error.into())?;
                return Ok(None);
            }
        };
        trail.visit(&popup_url);
        debug!(%popup_url, "inspecting popup");

        // Document delivered while the popup loads.
        match popup.arm(&self.filter).await {
            Ok(watch) => {
                let signal = race::race(watch, &popup_url, self.popup_timeouts()).await;
                if let Some(outcome) = self.take_popup_signal(signal, candidate, popup, ctx, trail).await? {
                    return Ok(Some(outcome));
                }
            }
            Err(error) => trail.absorb(error.into())?,
        }

        // Nested download control.
        match popup.find_by_label(&self.settings.download_label_pattern).await {
            Ok(Some(action)) => {
                debug!(%action, "clicking download control in popup");
                match race::click_and_race(popup, &action, &self.filter, self.popup_timeouts()).await {
                    Ok(signal) => {
                        if let Some(outcome) =
                            self.take_popup_signal(signal, candidate, popup, ctx, trail).await?
                        {
                            return Ok(Some(outcome));
                        }
                    }
                    Err(error) => trail.absorb(error.into())?,
                }
            }
            Ok(None) => debug!("no download control in popup"),
            Err(error) => trail.absorb(error.into())?,
        }

        let Ok(base) = Url::parse(&popup_url) else {
            return Ok(None);
        };

        // The popup URL itself, in download mode.
        if let Some(url) = reconstruct(&popup_url, &base)
            && let Some(outcome) = self.fetch_from_popup(url, candidate, popup, ctx, trail).await?
        {
            return Ok(Some(outcome));
        }

        // Inline viewer sources.
        for (tag, attribute) in VIEWER_SOURCES {
            let values = match popup.attribute_values(tag, attribute).await {
                Ok(values) => values,
                Err(error) => {
                    trail.absorb(error.into())?;
                    continue;
                }
            };
            for value in values {
                let Some(url) = viewer_target(&value, &base) else {
                    continue;
                };
                if let Some(outcome) = self.fetch_from_popup(url, candidate, popup, ctx, trail).await? {
                    return Ok(Some(outcome));
                }
            }
        }
        Ok(None)
    }

    async fn take_popup_signal(
        &self,
        signal: Option<Signal>,
        candidate: &Candidate,
        popup: &dyn PageSession,
        ctx: &mut CaseContext,
        trail: &mut Trail,
    ) -> Result<Option<ResolutionOutcome>, ResolveError> {
        let strategy = ResolutionStrategy::PopupInspection;
        let result = match signal {
            Some(Signal::Download(download)) => {
                self.accept_download(download, strategy, candidate, popup, ctx, trail)
                    .await
            }
            Some(Signal::Response(observed)) => {
                self.accept_observed(observed, strategy, candidate, ctx, trail)
                    .await
            }
            Some(Signal::Popup(nested)) => {
                debug!("closing nested popup");
                nested.close().await;
                return Ok(None);
            }
            Some(Signal::Navigation(_)) | None => return Ok(None),
        };
        match result {
            Ok(outcome) => Ok(Some(outcome)),
            Err(error) => {
                trail.absorb(error)?;
                Ok(None)
            }
        }
    }

    async fn fetch_from_popup(
        &self,
        url: Url,
        candidate: &Candidate,
        popup: &dyn PageSession,
        ctx: &mut CaseContext,
        trail: &mut Trail,
    ) -> Result<Option<ResolutionOutcome>, ResolveError> {
        let url = url.to_string();
        if !trail.first_try(&url) {
            return Ok(None);
        }
        trail.visit(&url);
        let fetched = match self.fetch_document(popup.fetcher(), &url, ctx).await {
            Ok(response) => {
                self.accept_fetched(response, ResolutionStrategy::PopupInspection, candidate, ctx)
                    .await
            }
            Err(error) => Err(error),
        };
        match fetched {
            Ok(outcome) => Ok(Some(outcome)),
            Err(error) => {
                trail.absorb(error)?;
                Ok(None)
            }
        }
    }

    fn popup_timeouts(&self) -> RaceTimeouts {
        let wait = self.settings.popup_signal_timeout;
        RaceTimeouts {
            download: wait,
            popup: Duration::ZERO,
            response: wait,
            navigation: Duration::ZERO,
            settle: self.settings.settle_window,
        }
    }
}

/// Resolves a viewer element's source, unwrapping the document a viewer page
/// names in its query (`viewer.html?file=/doc.pdf`).
fn viewer_target(source: &str, base: &Url) -> Option<Url> {
    let source = source.trim();
    if source.is_empty() || source.eq_ignore_ascii_case("about:blank") {
        return None;
    }
    let url = base.join(source).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let inner = url
        .query_pairs()
        .find(|(key, value)| {
            VIEWER_FILE_KEYS.contains(&key.to_ascii_lowercase().as_str()) && !value.is_empty()
        })
        .and_then(|(_, value)| url.join(&value).ok())
        .filter(|inner| matches!(inner.scheme(), "http" | "https"));
    Some(inner.unwrap_or(url))
}
