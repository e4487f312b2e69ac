//! Bounded-concurrency FIFO fetch queue with retries.
//!
//! Every fetch in the process goes through one [`RateLimitedTransport`]. Jobs
//! are queued in arrival order and drained by a fixed pool of worker tasks.
//! Each attempt first claims a dispatch slot from the shared [`Pacer`], so the
//! configured request rate holds regardless of how many workers are busy.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::client::{FetchRequest, FetchResponse, Fetcher};
use super::pacer::{Pacer, parse_retry_after};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use super::TransportError;
use crate::sniff::{self, Verdict};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 32;

/// Default worker count.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Default request budget per second.
pub const DEFAULT_QPS: f64 = 1.0;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Number of worker tasks (maximum requests in flight).
    pub concurrency: usize,
    /// Requests per second across all workers; `<= 0` disables pacing.
    pub qps: f64,
    /// Retry policy applied to every job.
    pub policy: RetryPolicy,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            qps: DEFAULT_QPS,
            policy: RetryPolicy::default(),
        }
    }
}

impl TransportSettings {
    /// No pacing and no retries; each request is tried once.
    #[must_use]
    pub fn unpaced() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            qps: 0.0,
            policy: RetryPolicy::new(0, Duration::ZERO, Duration::ZERO),
        }
    }
}

/// Error constructing the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportSetupError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },
}

/// Counters shared by all workers.
#[derive(Debug, Default)]
pub struct TransportStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    attempts: AtomicUsize,
}

impl TransportStats {
    /// Jobs that ended in success.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Jobs that ended in failure.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Retries scheduled.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Requests actually issued.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

struct Job {
    fetcher: Arc<dyn Fetcher>,
    request: FetchRequest,
    reply: oneshot::Sender<Result<FetchResponse, TransportError>>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("url", &self.request.url).finish()
    }
}

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// Shared fetch queue.
///
/// Dropping the transport closes the queue; workers finish the jobs already
/// queued and exit.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use casefile_core::transport::{
///     FetchRequest, HttpClient, HttpClientSettings, RateLimitedTransport, TransportSettings,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = RateLimitedTransport::new(TransportSettings::default())?;
/// let client = Arc::new(HttpClient::new(HttpClientSettings::default())?);
/// let response = transport
///     .fetch(client, FetchRequest::file("https://example.com/report.pdf"))
///     .await?;
/// println!("{} bytes", response.body.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimitedTransport {
    sender: mpsc::UnboundedSender<Job>,
    pacer: Arc<Pacer>,
    stats: Arc<TransportStats>,
    policy: RetryPolicy,
    workers: Vec<JoinHandle<()>>,
}

impl RateLimitedTransport {
    /// Spawns the worker pool. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TransportSetupError::InvalidConcurrency`] if `concurrency` is
    /// outside 1..=32.
    #[instrument(skip(settings), fields(concurrency = settings.concurrency, qps = settings.qps))]
    pub fn new(settings: TransportSettings) -> Result<Self, TransportSetupError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&settings.concurrency) {
            return Err(TransportSetupError::InvalidConcurrency {
                value: settings.concurrency,
            });
        }

        let pacer = Arc::new(Pacer::from_qps(settings.qps));
        let stats = Arc::new(TransportStats::default());
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver: SharedReceiver = Arc::new(Mutex::new(receiver));

        let workers = (0..settings.concurrency)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&receiver),
                    Arc::clone(&pacer),
                    Arc::clone(&stats),
                    settings.policy.clone(),
                ))
            })
            .collect();

        info!(
            interval_ms = pacer.min_interval().as_millis(),
            "transport started"
        );

        Ok(Self {
            sender,
            pacer,
            stats,
            policy: settings.policy,
            workers,
        })
    }

    /// Queues `request` and waits for its final result, retries included.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error once retries are exhausted, or
    /// [`TransportError::Closed`] if the workers are gone.
    pub async fn fetch(
        &self,
        fetcher: Arc<dyn Fetcher>,
        request: FetchRequest,
    ) -> Result<FetchResponse, TransportError> {
        let url = request.url.clone();
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Job {
                fetcher,
                request,
                reply,
            })
            .map_err(|_| TransportError::Closed { url: url.clone() })?;
        response
            .await
            .map_err(|_| TransportError::Closed { url })?
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// The pacer shared by all workers.
    #[must_use]
    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    /// Retry policy in effect.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn shutdown(self) {
        let Self {
            sender, workers, ..
        } = self;
        drop(sender);
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(%error, "transport worker ended abnormally");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: SharedReceiver,
    pacer: Arc<Pacer>,
    stats: Arc<TransportStats>,
    policy: RetryPolicy,
) {
    loop {
        // Hold the lock only while dequeuing so other workers can take the next job.
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            debug!(worker_id, "queue closed, worker exiting");
            return;
        };

        let result =
            fetch_with_retry(job.fetcher.as_ref(), &job.request, &policy, &pacer, &stats).await;
        match &result {
            Ok(_) => stats.completed.fetch_add(1, Ordering::SeqCst),
            Err(_) => stats.failed.fetch_add(1, Ordering::SeqCst),
        };
        if job.reply.send(result).is_err() {
            debug!(worker_id, url = %job.request.url, "requester went away before reply");
        }
    }
}

/// Runs one job to completion: pace, fetch, sniff, retry.
#[instrument(skip_all, fields(url = %request.url))]
async fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    request: &FetchRequest,
    policy: &RetryPolicy,
    pacer: &Pacer,
    stats: &TransportStats,
) -> Result<FetchResponse, TransportError> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        pacer.acquire(&request.url).await;
        stats.attempts.fetch_add(1, Ordering::SeqCst);
        debug!(attempt, "dispatching request");

        let error = match fetcher.fetch(request).await {
            Ok(response) => match check_integrity(request, &response) {
                None => return Ok(response),
                Some(verdict) => {
                    TransportError::integrity(&request.url, verdict, response.body.len())
                }
            },
            Err(error) => error,
        };

        let failure_type = classify_error(&error);
        let retry_after = if failure_type == FailureType::RateLimited {
            retry_after_delay(&error, policy)
        } else {
            None
        };

        match policy.should_retry(failure_type, attempt) {
            RetryDecision::Retry {
                delay: backoff_delay,
                attempt: next_attempt,
            } => {
                let delay = retry_after.unwrap_or(backoff_delay);
                if retry_after.is_some() {
                    pacer.record_retry_after(&request.url, delay);
                }
                info!(
                    attempt = next_attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    using_retry_after = retry_after.is_some(),
                    error = %error,
                    "retrying fetch"
                );
                stats.retried.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(attempts = attempt, %reason, error = %error, "fetch failed");
                return Err(error);
            }
        }
    }
}

fn check_integrity(request: &FetchRequest, response: &FetchResponse) -> Option<Verdict> {
    if !request.expect_file {
        return None;
    }
    let verdict = sniff::sniff(&response.body, response.content_type());
    (!verdict.is_genuine()).then_some(verdict)
}

/// Server Retry-After, capped at the policy's maximum delay.
fn retry_after_delay(error: &TransportError, policy: &RetryPolicy) -> Option<Duration> {
    let TransportError::HttpStatus {
        retry_after: Some(header),
        ..
    } = error
    else {
        return None;
    };
    let delay = parse_retry_after(header)?.min(policy.max_delay());
    debug!(retry_after = %header, delay_ms = delay.as_millis(), "using Retry-After delay");
    Some(delay)
}
