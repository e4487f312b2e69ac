//! Collector configuration.
//!
//! [`CollectorConfig`] gathers every tunable in one place and projects it
//! onto the settings structs of the transport, the engine and the
//! orchestrator.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::case::CaseSettings;
use crate::classify::DEFAULT_LINK_ONLY;
use crate::resolve::{FolderPickup, PollingFolderPickup, ResolveSettings};
use crate::transport::{
    DEFAULT_BASE_DELAY, DEFAULT_CONCURRENCY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, DEFAULT_QPS,
    HttpClientSettings, RetryPolicy, TransportSettings,
};

/// Required categories when none are configured.
pub const DEFAULT_REQUIRED: &[&str] = &["AP", "REG"];

/// Extensions the folder pickup accepts by default.
pub const DEFAULT_PICKUP_EXTENSIONS: &[&str] = &["pdf", "hwp", "jpg", "jpeg", "png", "zip"];

/// Invalid configuration value.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is outside its allowed range.
    #[error("invalid value for `{field}`: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// OS download-folder pickup.
#[derive(Debug, Clone)]
pub struct FolderPickupConfig {
    pub dir: PathBuf,
    pub extensions: Vec<String>,
    pub timeout: Duration,
}

/// Everything the collector can be told.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub output_dir: PathBuf,

    // Transport
    pub concurrency: usize,
    pub qps: f64,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,

    // Categories
    pub required_categories: BTreeSet<String>,
    pub link_only_categories: BTreeSet<String>,

    // Resolution
    pub download_timeout: Duration,
    pub popup_timeout: Duration,
    pub response_timeout: Duration,
    pub navigation_timeout: Duration,
    pub settle_window: Duration,
    pub candidate_budget: Duration,

    // Cases
    pub pause_every: usize,
    pub pause_duration: Duration,
    pub snapshots: bool,

    pub folder_pickup: Option<FolderPickupConfig>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        let resolve = ResolveSettings::default();
        let http = HttpClientSettings::default();
        Self {
            output_dir: PathBuf::from("./cases"),
            concurrency: DEFAULT_CONCURRENCY,
            qps: DEFAULT_QPS,
            connect_timeout: http.connect_timeout,
            request_timeout: http.request_timeout,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BASE_DELAY,
            backoff_cap: DEFAULT_MAX_DELAY,
            required_categories: DEFAULT_REQUIRED.iter().map(ToString::to_string).collect(),
            link_only_categories: DEFAULT_LINK_ONLY.iter().map(ToString::to_string).collect(),
            download_timeout: resolve.download_timeout,
            popup_timeout: resolve.popup_timeout,
            response_timeout: resolve.response_timeout,
            navigation_timeout: resolve.navigation_timeout,
            settle_window: resolve.settle_window,
            candidate_budget: resolve.candidate_budget,
            pause_every: 5,
            pause_duration: Duration::from_secs(3),
            snapshots: false,
            folder_pickup: None,
        }
    }
}

impl CollectorConfig {
    /// Checks ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=32).contains(&self.concurrency) {
            return Err(ConfigError::invalid(
                "concurrency",
                format!("{} not in 1..=32", self.concurrency),
            ));
        }
        if !self.qps.is_finite() || self.qps < 0.0 || self.qps > 100.0 {
            return Err(ConfigError::invalid(
                "qps",
                format!("{} not in 0..=100 (0 disables pacing)", self.qps),
            ));
        }
        if self.max_retries > 10 {
            return Err(ConfigError::invalid(
                "max_retries",
                format!("{} not in 0..=10", self.max_retries),
            ));
        }
        check_secs("request_timeout", self.request_timeout, 1, 3600)?;
        check_secs("connect_timeout", self.connect_timeout, 1, 3600)?;
        if self.backoff_cap < self.backoff_base {
            return Err(ConfigError::invalid(
                "backoff_cap",
                "must not be smaller than backoff_base",
            ));
        }
        if self.candidate_budget.is_zero() {
            return Err(ConfigError::invalid("candidate_budget", "must be positive"));
        }
        if let Some(category) = self
            .required_categories
            .intersection(&self.link_only_categories)
            .next()
        {
            return Err(ConfigError::invalid(
                "required_categories",
                format!("{category} is also link-only and can never be acquired"),
            ));
        }
        if let Some(pickup) = &self.folder_pickup {
            if pickup.extensions.is_empty() {
                return Err(ConfigError::invalid(
                    "folder_pickup",
                    "at least one extension is required",
                ));
            }
            if pickup.timeout.is_zero() {
                return Err(ConfigError::invalid("folder_pickup", "timeout must be positive"));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_base, self.backoff_cap)
    }

    #[must_use]
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            concurrency: self.concurrency,
            qps: self.qps,
            policy: self.retry_policy(),
        }
    }

    #[must_use]
    pub fn http_client_settings(&self) -> HttpClientSettings {
        HttpClientSettings {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            ..HttpClientSettings::default()
        }
    }

    #[must_use]
    pub fn resolve_settings(&self) -> ResolveSettings {
        ResolveSettings {
            download_timeout: self.download_timeout,
            popup_timeout: self.popup_timeout,
            response_timeout: self.response_timeout,
            navigation_timeout: self.navigation_timeout,
            settle_window: self.settle_window,
            candidate_budget: self.candidate_budget,
            ..ResolveSettings::default()
        }
    }

    #[must_use]
    pub fn case_settings(&self) -> CaseSettings {
        CaseSettings {
            output_root: self.output_dir.clone(),
            required_categories: self.required_categories.clone(),
            link_only_categories: self.link_only_categories.clone(),
            snapshots: self.snapshots,
            pause_every: self.pause_every,
            pause_duration: self.pause_duration,
        }
    }

    /// The folder pickup, when enabled.
    #[must_use]
    pub fn folder_pickup(&self) -> Option<Arc<dyn FolderPickup>> {
        self.folder_pickup.as_ref().map(|cfg| {
            Arc::new(PollingFolderPickup::new(&cfg.dir, &cfg.extensions, cfg.timeout))
                as Arc<dyn FolderPickup>
        })
    }
}

fn check_secs(field: &'static str, value: Duration, min: u64, max: u64) -> Result<(), ConfigError> {
    let secs = value.as_secs();
    if (min..=max).contains(&secs) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("{secs}s not in {min}..={max}"),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CollectorConfig::default();
        config.validate().unwrap();
        assert!(config.required_categories.contains("AP"));
        assert!(config.link_only_categories.contains("MAP"));
        assert!(config.folder_pickup().is_none());
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let config = CollectorConfig {
            concurrency: 0,
            ..CollectorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "concurrency",
                ..
            })
        ));

        let config = CollectorConfig {
            qps: f64::NAN,
            ..CollectorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = CollectorConfig {
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(1),
            ..CollectorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_required_link_only_overlap() {
        let mut config = CollectorConfig::default();
        config.required_categories.insert("MAP".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MAP"));
    }

    #[test]
    fn test_projections_carry_values() {
        let config = CollectorConfig {
            concurrency: 4,
            qps: 2.5,
            max_retries: 1,
            settle_window: Duration::from_millis(50),
            snapshots: true,
            folder_pickup: Some(FolderPickupConfig {
                dir: PathBuf::from("/tmp/dl"),
                extensions: vec!["pdf".to_string()],
                timeout: Duration::from_secs(5),
            }),
            ..CollectorConfig::default()
        };
        config.validate().unwrap();

        let transport = config.transport_settings();
        assert_eq!(transport.concurrency, 4);
        assert!((transport.qps - 2.5).abs() < f64::EPSILON);
        assert_eq!(transport.policy.max_attempts(), 2);
        assert_eq!(config.resolve_settings().settle_window, Duration::from_millis(50));
        assert!(config.case_settings().snapshots);
        assert!(config.folder_pickup().is_some());
    }
}
