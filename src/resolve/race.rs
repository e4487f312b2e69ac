//! Click-and-race: one click, several possible effects.
//!
//! Listeners are armed before the click. The four signal futures are then
//! polled together, each under its own timeout. Once any signal lands, a short
//! settle window lets a higher-priority signal that fired at nearly the same
//! moment take precedence. The winner is picked by fixed priority:
//!
//! download > popup > response > navigation
//!
//! Losing popups, including ones that open after the race has been decided,
//! are closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::{debug, instrument, warn};

use super::ActionRef;
use super::page::{
    DownloadSignal, ObservedResponse, PageError, PageSession, ResponseFilter, SignalWatch,
};
use super::popup::PopupGuard;

/// Per-signal timeouts and the settle window.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RaceTimeouts {
    pub download: Duration,
    pub popup: Duration,
    pub response: Duration,
    pub navigation: Duration,
    pub settle: Duration,
}

/// The signal that won the race.
pub(crate) enum Signal {
    Download(DownloadSignal),
    Popup(PopupGuard),
    Response(ObservedResponse),
    Navigation(String),
}

impl Signal {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Download(_) => "download",
            Self::Popup(_) => "popup",
            Self::Response(_) => "response",
            Self::Navigation(_) => "navigation",
        }
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Default)]
struct Collected {
    download: Option<DownloadSignal>,
    popup: Option<PopupGuard>,
    response: Option<ObservedResponse>,
    navigation: Option<String>,
}

impl Collected {
    fn any(&self) -> bool {
        self.download.is_some()
            || self.popup.is_some()
            || self.response.is_some()
            || self.navigation.is_some()
    }

    /// Highest-priority signal. A popup that did not win is closed when its
    /// guard drops.
    fn into_winner(self) -> Option<Signal> {
        let Self {
            download,
            popup,
            response,
            navigation,
        } = self;
        if let Some(download) = download {
            drop(popup);
            return Some(Signal::Download(download));
        }
        if let Some(popup) = popup {
            return Some(Signal::Popup(popup));
        }
        if let Some(response) = response {
            return Some(Signal::Response(response));
        }
        navigation.map(Signal::Navigation)
    }
}

/// Arms the page, clicks `action` and returns the winning signal, if any.
///
/// A navigation to the URL the page was already on does not count.
#[instrument(level = "debug", skip(page, filter, timeouts), fields(action = %action))]
pub(crate) async fn click_and_race(
    page: &dyn PageSession,
    action: &ActionRef,
    filter: &ResponseFilter,
    timeouts: RaceTimeouts,
) -> Result<Option<Signal>, PageError> {
    let start_url = page.current_url().await?;
    let watch = page.arm(filter).await?;
    page.click(action).await?;
    Ok(race(watch, &start_url, timeouts).await)
}

/// Awaits the armed signals and applies the priority order.
pub(crate) async fn race(
    watch: SignalWatch,
    start_url: &str,
    timeouts: RaceTimeouts,
) -> Option<Signal> {
    let SignalWatch {
        download,
        popup,
        response,
        navigation,
    } = watch;

    let mut download = Box::pin(timeout(timeouts.download, download));
    let mut popup = Box::pin(timeout(timeouts.popup, popup));
    let mut response = Box::pin(timeout(timeouts.response, response));
    let mut navigation = Box::pin(timeout(timeouts.navigation, navigation));

    let (mut download_done, mut popup_done, mut response_done, mut navigation_done) =
        (false, false, false, false);
    let mut collected = Collected::default();
    let mut settle_deadline: Option<Instant> = None;

    loop {
        if download_done && popup_done && response_done && navigation_done {
            break;
        }

        let settle = async move {
            match settle_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            result = &mut download, if !download_done => {
                download_done = true;
                if let Ok(Ok(signal)) = result {
                    debug!(url = %signal.url, "download signal");
                    collected.download = Some(signal);
                }
            }
            result = &mut popup, if !popup_done => {
                popup_done = true;
                if let Ok(Ok(session)) = result {
                    debug!("popup signal");
                    collected.popup = Some(PopupGuard::new(session));
                }
            }
            result = &mut response, if !response_done => {
                response_done = true;
                if let Ok(Ok(observed)) = result {
                    debug!(url = %observed.url, "response signal");
                    collected.response = Some(observed);
                }
            }
            result = &mut navigation, if !navigation_done => {
                navigation_done = true;
                if let Ok(Ok(url)) = result
                    && url != start_url
                {
                    debug!(%url, "navigation signal");
                    collected.navigation = Some(url);
                }
            }
            () = settle => break,
        }

        // Nothing outranks a download.
        if collected.download.is_some() {
            break;
        }
        if collected.any() && settle_deadline.is_none() {
            settle_deadline = Some(Instant::now() + timeouts.settle);
        }
    }

    let winner = collected.into_winner();

    // A popup may still open after the race is decided; close it when it does.
    if !popup_done {
        tokio::spawn(async move {
            if let Ok(Ok(late)) = popup.await {
                debug!("closing popup that opened after the race");
                if let Err(error) = late.close().await {
                    warn!(%error, "failed to close late popup");
                }
            }
        });
    }

    if let Some(signal) = &winner {
        debug!(winner = signal.kind(), "race decided");
    }
    winner
}

/// Closes a session on a background task.
pub(crate) fn close_detached(session: Arc<dyn PageSession>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("no runtime available to close popup");
        return;
    };
    handle.spawn(async move {
        if let Err(error) = session.close().await {
            warn!(%error, "failed to close popup");
        }
    });
}
