//! Retry logic with exponential backoff for failed fetches.
//!
//! When a fetch fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - non-2xx status, timeout, integrity rejection
//! - [`FailureType::RateLimited`] - HTTP 429 (the pacer also honours Retry-After)
//! - [`FailureType::Permanent`] - invalid URL, oversized body, closed transport
//!
//! [`RetryPolicy`] then decides whether to retry and how long to wait.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use casefile_core::transport::{RetryDecision, RetryPolicy, FailureType};
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(8));
//! match policy.should_retry(FailureType::Transient, 1) {
//!     RetryDecision::Retry { attempt, .. } => assert_eq!(attempt, 2),
//!     RetryDecision::DoNotRetry { .. } => unreachable!(),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::TransportError;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (1 second).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (16 seconds).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(16);

/// Backoff multiplier (doubles each attempt).
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default maximum jitter added to delays (250ms).
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(250);

/// Classification of fetch failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    Transient,

    /// Failure that won't succeed regardless of retries.
    Permanent,

    /// Server rate limiting (HTTP 429).
    RateLimited,
}

/// Decision on whether to retry a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the fetch after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Retry configuration with capped exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay(n) = min(base_delay * 2^(n-1) + jitter, max_delay)
/// ```
///
/// Jitter never exceeds `base_delay`, which keeps the sequence non-decreasing.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    max_retries: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Upper bound for random jitter.
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RetryPolicy {
    /// Creates a policy with the default jitter.
    ///
    /// `max_delay` is raised to `base_delay` if it is smaller.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_jitter: DEFAULT_MAX_JITTER.min(base_delay),
        }
    }

    /// Overrides the jitter bound. It is clamped to `base_delay`.
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter.min(self.base_delay);
        self
    }

    /// Retries allowed after the initial attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts including the initial one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Configured delay cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Determines whether to retry after `attempt` (1-indexed) failed.
    #[instrument(level = "debug", skip(self), fields(max_retries = self.max_retries))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts() {
            debug!(attempt, max = self.max_attempts(), "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        let delay = self.backoff_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Delay to wait after `attempt` (1-indexed) failed.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = f64::from(attempt.saturating_sub(1).min(32));
        let base_ms = self.base_delay.as_millis() as f64;
        let exponential_ms = base_ms * BACKOFF_MULTIPLIER.powf(exponent);
        let with_jitter = Duration::from_millis(exponential_ms.min(u64::MAX as f64) as u64)
            .saturating_add(self.jitter());
        with_jitter.min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        #[allow(clippy::cast_possible_truncation)]
        let bound = self.max_jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }
}

/// Classifies a transport error for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | HTTP 429 | RateLimited |
/// | any other non-2xx | Transient |
/// | Timeout / Network / Session | Transient |
/// | Network (TLS) | Permanent |
/// | IntegrityRejected | Transient |
/// | TooLarge / InvalidUrl / ClientBuild / Closed | Permanent |
#[must_use]
pub fn classify_error(error: &TransportError) -> FailureType {
    match error {
        TransportError::HttpStatus { status: 429, .. } => FailureType::RateLimited,
        TransportError::HttpStatus { .. }
        | TransportError::Timeout { .. }
        | TransportError::Session { .. }
        | TransportError::IntegrityRejected { .. } => FailureType::Transient,
        TransportError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        TransportError::TooLarge { .. }
        | TransportError::InvalidUrl { .. }
        | TransportError::ClientBuild { .. }
        | TransportError::Closed { .. } => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
