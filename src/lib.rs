//! Casefile Core Library
//!
//! Collects the reference documents attached to auction case detail pages
//! and keeps a per-case ledger of what was obtained and what is missing.
//!
//! # Architecture
//!
//! - [`sniff`] - integrity checks on downloaded bytes
//! - [`transport`] - paced, bounded-concurrency HTTP with retries
//! - [`resolve`] - turns a clicked label into a file or a link verdict
//! - [`manifest`] - the per-case ledger and its `manifest.json`
//! - [`case`] - runs cases through the engine and the ledger
//! - [`classify`] - ordered pattern table producing candidates
//! - [`session`] - headless page sessions over plain HTTP
//! - [`config`] - collector settings and their projections

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod case;
pub mod classify;
pub mod config;
pub mod manifest;
pub mod resolve;
pub mod session;
pub mod sniff;
pub mod transport;
mod user_agent;

// Re-export commonly used types
pub use case::{
    CaseError, CaseOrchestrator, CaseReport, CaseRequest, CaseSettings, RunSummary, derive_case_id,
};
pub use classify::{CategoryTable, PageElement, scan_candidates};
pub use config::{CollectorConfig, ConfigError, FolderPickupConfig};
pub use manifest::{EntryKind, Manifest, ManifestEntry, ManifestError, ManifestIssue, ManifestStats};
pub use resolve::{
    AcquiredResource, ActionRef, Candidate, CandidateKind, CaseContext, PageError, PageProvider,
    PageSession, ResolutionEngine, ResolutionOutcome, ResolutionStrategy, ResolveError,
    ResolveSettings,
};
pub use session::{StaticPage, StaticPageProvider};
pub use sniff::Verdict;
pub use transport::{
    FetchRequest, FetchResponse, Fetcher, HttpClient, HttpClientSettings, RateLimitedTransport,
    RetryPolicy, TransportError, TransportSettings,
};
