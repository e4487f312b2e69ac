//! Shared User-Agent strings for page and document HTTP traffic.
//!
//! Single source for the project URL and UA format so page loads and document
//! fetches identify the tool the same way.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/casefile";

/// Default User-Agent for document fetches.
#[must_use]
pub(crate) fn default_fetch_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("casefile/{version} (case-document-collector; +{PROJECT_UA_URL})")
}

/// Browser-like User-Agent used for detail page loads.
///
/// Listing sites commonly serve a stripped page to unknown agents, which hides
/// the attachment cluster.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_ua_carries_version_and_url() {
        let ua = default_fetch_user_agent();
        assert!(ua.contains(PROJECT_UA_URL), "UA must contain project URL");
        assert_eq!(
            env!("CARGO_PKG_VERSION"),
            ua.strip_prefix("casefile/")
                .and_then(|s| s.split(' ').next())
                .expect("UA has version"),
        );
    }

    #[test]
    fn test_browser_ua_looks_like_browser() {
        assert!(BROWSER_USER_AGENT.starts_with("Mozilla/5.0"));
    }
}
