//! Per-case ledger of resolution outcomes.
//!
//! One [`ManifestEntry`] per candidate per run. Statistics and the missing
//! category set are always derived from the entries.

mod store;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use store::{MANIFEST_FILE_NAME, MANIFEST_VERSION, ManifestError};

use crate::resolve::{AcquiredResource, Candidate, ResolutionOutcome, ResolutionStrategy};

/// Whether an entry holds a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// A file was acquired.
    File,
    /// A link, or a file candidate that could not be acquired.
    Link,
}

/// One candidate's recorded outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: EntryKind,
    pub category: String,
    pub label: String,
    pub source_ref: String,
    pub strategy: ResolutionStrategy,
    #[serde(default)]
    pub resolved_location: Option<String>,
    #[serde(default)]
    pub acquired: Option<AcquiredResource>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Unix seconds.
    pub recorded_at: u64,
}

impl ManifestEntry {
    /// Folds an outcome into an entry.
    ///
    /// Anything without an acquired file is recorded as a link, including file
    /// candidates that failed.
    #[must_use]
    pub fn from_outcome(candidate: &Candidate, outcome: ResolutionOutcome) -> Self {
        let kind = if outcome.acquired.is_some() {
            EntryKind::File
        } else {
            EntryKind::Link
        };
        Self {
            kind,
            category: candidate.category_or_unknown().to_string(),
            label: candidate.label.clone(),
            source_ref: candidate.source_ref(),
            strategy: outcome.strategy,
            resolved_location: outcome.resolved_location,
            acquired: outcome.acquired,
            success: outcome.success,
            error: outcome.error,
            recorded_at: unix_now(),
        }
    }

    /// Successful entry with a file on disk.
    #[must_use]
    pub fn is_acquired_file(&self) -> bool {
        self.kind == EntryKind::File && self.success && self.acquired.is_some()
    }
}

/// Totals derived from the entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStats {
    /// Successful file entries.
    pub succeeded: usize,
    /// Entries with `success == false`.
    pub failed: usize,
    /// Successful link entries.
    pub link_only: usize,
    /// Bytes across successful file entries.
    pub total_bytes: u64,
    /// Categories with at least one acquired file, excluding `UNK`.
    pub categories_present: BTreeSet<String>,
}

/// Non-fatal problems found by [`Manifest::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestIssue {
    MissingRequired(Vec<String>),
    FailuresExceedSuccesses { failed: usize, succeeded: usize },
    NoBytes,
    DuplicateFileName(String),
}

impl fmt::Display for ManifestIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRequired(categories) => {
                write!(f, "missing required categories: {}", categories.join(", "))
            }
            Self::FailuresExceedSuccesses { failed, succeeded } => {
                write!(f, "{failed} failures exceed {succeeded} successes")
            }
            Self::NoBytes => write!(f, "no bytes acquired"),
            Self::DuplicateFileName(name) => write!(f, "file name recorded twice: {name}"),
        }
    }
}

/// The ledger for one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub case_id: String,
    pub source_url: String,
    pub required_categories: BTreeSet<String>,
    /// Unix seconds.
    pub created_at: u64,
    /// Unix seconds.
    pub updated_at: u64,
    entries: Vec<ManifestEntry>,
    stats: ManifestStats,
}

impl Manifest {
    /// An empty manifest.
    pub fn new<I, S>(case_id: impl Into<String>, source_url: impl Into<String>, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = unix_now();
        Self {
            case_id: case_id.into(),
            source_url: source_url.into(),
            required_categories: required.into_iter().map(Into::into).collect(),
            created_at: now,
            updated_at: now,
            entries: Vec::new(),
            stats: ManifestStats::default(),
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    #[must_use]
    pub fn stats(&self) -> &ManifestStats {
        &self.stats
    }

    /// Appends an entry and refreshes the stats.
    pub fn append(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
        self.recompute_stats();
    }

    /// Recomputes [`ManifestStats`] from the entries.
    pub fn recompute_stats(&mut self) {
        let mut stats = ManifestStats::default();
        for entry in &self.entries {
            if !entry.success {
                stats.failed += 1;
                continue;
            }
            match (&entry.kind, &entry.acquired) {
                (EntryKind::File, Some(acquired)) => {
                    stats.succeeded += 1;
                    stats.total_bytes += acquired.size;
                    if entry.category != crate::resolve::UNKNOWN_CATEGORY {
                        stats.categories_present.insert(entry.category.clone());
                    }
                }
                _ => stats.link_only += 1,
            }
        }
        self.stats = stats;
        self.updated_at = unix_now().max(self.created_at);
    }

    /// Required categories with no acquired file, sorted.
    #[must_use]
    pub fn missing(&self) -> Vec<String> {
        self.required_categories
            .difference(&self.stats.categories_present)
            .cloned()
            .collect()
    }

    /// File names of successful file entries.
    pub fn successful_file_names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.is_acquired_file())
            .filter_map(|e| e.acquired.as_ref())
            .map(|a| a.file_name.as_str())
    }

    /// Reports non-fatal problems.
    #[must_use]
    pub fn validate(&self) -> Vec<ManifestIssue> {
        let mut issues = Vec::new();

        let missing = self.missing();
        if !missing.is_empty() {
            issues.push(ManifestIssue::MissingRequired(missing));
        }
        if self.stats.failed > self.stats.succeeded {
            issues.push(ManifestIssue::FailuresExceedSuccesses {
                failed: self.stats.failed,
                succeeded: self.stats.succeeded,
            });
        }
        if self.stats.total_bytes == 0 {
            issues.push(ManifestIssue::NoBytes);
        }

        let mut seen: HashMap<String, usize> = HashMap::new();
        for name in self.successful_file_names() {
            *seen.entry(name.to_lowercase()).or_default() += 1;
        }
        let mut duplicates: Vec<String> = seen
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, _)| name)
            .collect();
        duplicates.sort();
        issues.extend(duplicates.into_iter().map(ManifestIssue::DuplicateFileName));

        issues
    }

    /// Combines a prior run with a fresh one.
    ///
    /// Entries are concatenated without deduplication; required categories
    /// are unioned; identity and `created_at` come from `prior`.
    #[must_use]
    pub fn merge(prior: Manifest, fresh: Manifest) -> Manifest {
        let mut merged = Manifest {
            case_id: prior.case_id,
            source_url: if fresh.source_url.is_empty() {
                prior.source_url
            } else {
                fresh.source_url
            },
            required_categories: prior
                .required_categories
                .union(&fresh.required_categories)
                .cloned()
                .collect(),
            created_at: prior.created_at.min(fresh.created_at),
            updated_at: prior.updated_at.max(fresh.updated_at),
            entries: prior.entries,
            stats: ManifestStats::default(),
        };
        merged.entries.extend(fresh.entries);
        merged.recompute_stats();
        merged
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::resolve::ActionRef;

    fn acquired(name: &str, size: u64) -> AcquiredResource {
        AcquiredResource {
            file_name: name.to_string(),
            size,
            content_type: Some("application/pdf".to_string()),
            extension: "pdf".to_string(),
            sha256: "00".to_string(),
        }
    }

    fn file_entry(category: &str, name: &str, size: u64) -> ManifestEntry {
        let candidate = Candidate::file(name, ActionRef::new("#x")).with_category(category);
        let outcome = ResolutionOutcome::acquired(
            ResolutionStrategy::DownloadSignal,
            "https://a.example/f",
            acquired(name, size),
        );
        ManifestEntry::from_outcome(&candidate, outcome)
    }

    fn failed_entry(category: &str) -> ManifestEntry {
        let candidate = Candidate::file("등기부", ActionRef::new("#reg")).with_category(category);
        let outcome = ResolutionOutcome::failed(ResolutionStrategy::Unresolved, None, "nothing");
        ManifestEntry::from_outcome(&candidate, outcome)
    }

    fn link_entry() -> ManifestEntry {
        let candidate =
            Candidate::link("지도", "https://map.example/?q=1").with_category("MAP");
        let outcome = ResolutionOutcome::link(
            ResolutionStrategy::LinkOnly,
            Some("https://map.example/?q=1".to_string()),
        );
        ManifestEntry::from_outcome(&candidate, outcome)
    }

    #[test]
    fn test_stats_derived_from_entries() {
        let mut manifest = Manifest::new("c1", "https://a.example/c1", ["AP", "REG"]);
        manifest.append(file_entry("AP", "AP_a.pdf", 100));
        manifest.append(file_entry("UNK", "UNK_b.pdf", 50));
        manifest.append(failed_entry("REG"));
        manifest.append(link_entry());

        let stats = manifest.stats();
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.link_only, 1);
        assert_eq!(stats.total_bytes, 150);
        assert_eq!(
            stats.categories_present.iter().collect::<Vec<_>>(),
            vec!["AP"]
        );
        assert_eq!(manifest.missing(), vec!["REG".to_string()]);
    }

    #[test]
    fn test_failed_file_candidate_recorded_as_link() {
        let entry = failed_entry("REG");
        assert_eq!(entry.kind, EntryKind::Link);
        assert!(!entry.success);
        assert_eq!(entry.error.as_deref(), Some("nothing"));
    }

    #[test]
    fn test_link_does_not_satisfy_required_category() {
        let mut manifest = Manifest::new("c1", "u", ["MAP"]);
        manifest.append(link_entry());
        assert_eq!(manifest.missing(), vec!["MAP".to_string()]);
    }

    #[test]
    fn test_validate_reports_all_issues() {
        let mut manifest = Manifest::new("c1", "u", ["AP", "REG"]);
        manifest.append(failed_entry("AP"));
        manifest.append(failed_entry("REG"));

        let issues = manifest.validate();
        assert!(issues.contains(&ManifestIssue::MissingRequired(vec![
            "AP".to_string(),
            "REG".to_string()
        ])));
        assert!(issues.contains(&ManifestIssue::FailuresExceedSuccesses {
            failed: 2,
            succeeded: 0
        }));
        assert!(issues.contains(&ManifestIssue::NoBytes));
    }

    #[test]
    fn test_validate_flags_duplicate_file_names() {
        let mut manifest = Manifest::new("c1", "u", Vec::<String>::new());
        manifest.append(file_entry("AP", "AP_a.pdf", 10));
        manifest.append(file_entry("AP", "ap_A.pdf", 10));
        assert!(
            manifest
                .validate()
                .contains(&ManifestIssue::DuplicateFileName("ap_a.pdf".to_string()))
        );
    }

    #[test]
    fn test_merge_concatenates_and_unions() {
        let mut first = Manifest::new("c1", "u", ["AP"]);
        first.append(file_entry("AP", "AP_a.pdf", 10));
        first.created_at = 5;
        let mut second = Manifest::new("c1", "u", ["REG"]);
        second.append(file_entry("AP", "AP_a_2.pdf", 10));

        let first_missing = first.missing();
        let merged = Manifest::merge(first, second);
        assert_eq!(merged.entries().len(), 2);
        assert_eq!(merged.created_at, 5);
        assert_eq!(merged.missing(), vec!["REG".to_string()]);
        assert!(first_missing.is_empty());
        assert_eq!(merged.stats().total_bytes, 20);
    }

    #[test]
    fn test_issue_display() {
        assert_eq!(
            ManifestIssue::MissingRequired(vec!["AP".into(), "REG".into()]).to_string(),
            "missing required categories: AP, REG"
        );
    }
}
