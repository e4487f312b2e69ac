//! Global request pacing for outgoing fetches.
//!
//! The [`Pacer`] guarantees that no two requests start less than a fixed
//! interval apart, across every worker and every caller. Hosts that answered
//! with `429 Retry-After` are additionally held back until the server's
//! deadline has passed.
//!
//! # Example
//!
//! ```
//! use casefile_core::transport::Pacer;
//!
//! # async fn example() {
//! // Two requests per second at most.
//! let pacer = Pacer::from_qps(2.0);
//!
//! pacer.acquire("https://example.com/a.pdf").await; // immediate
//! pacer.acquire("https://example.com/b.pdf").await; // waits ~500ms
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative pacing delay (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Shared dispatch pacer.
///
/// Designed to be wrapped in `Arc` and shared by the transport workers. The
/// dispatch slot is a `tokio::sync::Mutex` so that the check-then-update of the
/// last dispatch time is atomic even while the holder sleeps.
#[derive(Debug)]
pub struct Pacer {
    /// Minimum spacing between dispatches.
    min_interval: Duration,

    /// Time of the last dispatch; `None` until the first request.
    last_dispatch: Mutex<Option<Instant>>,

    /// Per-host earliest next dispatch, set from Retry-After.
    host_not_before: DashMap<String, Instant>,

    /// Total pacing delay applied so far (milliseconds).
    cumulative_delay_ms: AtomicU64,
}

impl Pacer {
    /// Creates a pacer with an explicit minimum interval.
    #[must_use]
    #[instrument(skip_all, fields(interval_ms = min_interval.as_millis()))]
    pub fn new(min_interval: Duration) -> Self {
        debug!("creating pacer");
        Self {
            min_interval,
            last_dispatch: Mutex::new(None),
            host_not_before: DashMap::new(),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Creates a pacer allowing at most `qps` dispatches per second.
    ///
    /// Non-positive or non-finite values disable pacing.
    #[must_use]
    pub fn from_qps(qps: f64) -> Self {
        Self::new(interval_for_qps(qps))
    }

    /// Creates a pacer that never delays.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Returns the minimum dispatch interval.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Total delay this pacer has imposed so far.
    #[must_use]
    pub fn cumulative_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::SeqCst))
    }

    /// Waits until a request to `url` may be dispatched, then claims the slot.
    #[instrument(level = "debug", skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        let host = extract_domain(url);
        tracing::Span::current().record("host", host.as_str());

        // Copy out before awaiting so no DashMap shard lock is held across the sleep.
        let host_deadline = self.host_not_before.get(&host).map(|entry| *entry.value());
        if let Some(deadline) = host_deadline {
            let now = Instant::now();
            if deadline > now {
                let wait = deadline - now;
                debug!(host = %host, wait_ms = wait.as_millis(), "honouring server retry-after");
                self.add_delay(wait);
                tokio::time::sleep_until(deadline).await;
            }
            self.host_not_before
                .remove_if(&host, |_, stored| *stored <= Instant::now());
        }

        let mut last_dispatch = self.last_dispatch.lock().await;
        if let Some(last) = *last_dispatch {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                let delay = self.min_interval - elapsed;
                debug!(delay_ms = delay.as_millis(), "pacing dispatch");
                self.add_delay(delay);
                tokio::time::sleep(delay).await;
            }
        }
        *last_dispatch = Some(Instant::now());
    }

    /// Records a server-mandated delay for the host of `url`.
    #[instrument(level = "debug", skip(self))]
    pub fn record_retry_after(&self, url: &str, delay: Duration) {
        let host = extract_domain(url);
        let deadline = Instant::now() + delay.min(MAX_RETRY_AFTER);
        self.host_not_before
            .entry(host)
            .and_modify(|existing| {
                if deadline > *existing {
                    *existing = deadline;
                }
            })
            .or_insert(deadline);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_delay(&self, delay: Duration) {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        let total = Duration::from_millis(total);
        if total >= CUMULATIVE_DELAY_WARNING_THRESHOLD
            && total.saturating_sub(delay) < CUMULATIVE_DELAY_WARNING_THRESHOLD
        {
            warn!(
                cumulative_delay_secs = total.as_secs(),
                "excessive pacing delay - consider raising the request rate or reducing cases"
            );
        }
    }
}

/// Converts a requests-per-second budget into a dispatch interval.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn interval_for_qps(qps: f64) -> Duration {
    if !qps.is_finite() || qps <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_micros((1_000_000.0 / qps).round() as u64)
}

/// Extracts the lowercase host from a URL, or `"unknown"` for malformed input.
///
/// ```
/// use casefile_core::transport::extract_domain;
///
/// assert_eq!(extract_domain("https://Example.COM/Path"), "example.com");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value (integer seconds or HTTP-date).
///
/// Returns `None` if unparseable or negative. Values are capped at 1 hour.
///
/// ```
/// use std::time::Duration;
/// use casefile_core::transport::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
        Err(_) => Some(Duration::ZERO),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_interval_for_qps() {
        assert_eq!(interval_for_qps(1.0), Duration::from_secs(1));
        assert_eq!(interval_for_qps(4.0), Duration::from_millis(250));
        assert_eq!(interval_for_qps(0.0), Duration::ZERO);
        assert_eq!(interval_for_qps(f64::NAN), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_first_dispatch_immediate() {
        tokio::time::pause();
        let pacer = Pacer::from_qps(1.0);
        let start = Instant::now();
        pacer.acquire("https://a.example/1").await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_dispatches_spaced_across_hosts() {
        tokio::time::pause();
        let pacer = Pacer::from_qps(2.0);
        let start = Instant::now();

        pacer.acquire("https://a.example/1").await;
        pacer.acquire("https://b.example/1").await;
        assert!(start.elapsed() >= Duration::from_millis(500));

        pacer.acquire("https://c.example/1").await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(pacer.cumulative_delay() >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        tokio::time::pause();
        let pacer = Arc::new(Pacer::new(Duration::from_millis(100)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for i in 0..5 {
            let pacer = Arc::clone(&pacer);
            handles.push(tokio::spawn(async move {
                pacer.acquire(&format!("https://h{i}.example/")).await;
                Instant::now()
            }));
        }
        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap());
        }
        times.sort();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_disabled_pacer_never_waits() {
        tokio::time::pause();
        let pacer = Pacer::disabled();
        let start = Instant::now();
        for _ in 0..10 {
            pacer.acquire("https://a.example/").await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_retry_after_holds_back_host() {
        tokio::time::pause();
        let pacer = Pacer::disabled();
        pacer.record_retry_after("https://slow.example/x", Duration::from_secs(3));

        let start = Instant::now();
        pacer.acquire("https://fast.example/y").await;
        assert!(start.elapsed() < Duration::from_millis(10));

        pacer.acquire("https://slow.example/z").await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_parse_retry_after_variants() {
        assert_eq!(parse_retry_after("  30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("7200"), Some(MAX_RETRY_AFTER));
        assert_eq!(
            parse_retry_after("Wed, 01 Jan 2020 00:00:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://api.example.com:8443/v1"), "api.example.com");
        assert_eq!(extract_domain(""), "unknown");
    }
}
