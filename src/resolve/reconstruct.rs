//! Direct-URL reconstruction.
//!
//! Document links on listing sites are often `javascript:` calls or viewer
//! URLs. [`reconstruct`] turns such a reference into a fetchable download URL:
//!
//! ```
//! use url::Url;
//! use casefile_core::resolve::reconstruct::reconstruct;
//!
//! let base = Url::parse("https://court.example/case/view.do?id=7").unwrap();
//! let url = reconstruct("javascript:openDoc('/file/get.do?fileId=A%2B1&mode=view')", &base);
//! assert_eq!(
//!     url.unwrap().as_str(),
//!     "https://court.example/file/get.do?fileId=A%2B1&mode=download"
//! );
//! ```

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Quoted string arguments inside a script reference.
#[allow(clippy::expect_used)]
static QUOTED_ARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"['"]([^'"]+)['"]"#).expect("quoted-arg regex is valid"));

/// Keys that select between viewing and downloading.
const MODE_KEYS: &[&str] = &[
    "mode", "type", "viewtype", "view_type", "disptype", "disp_type", "action", "cmd",
];

/// Mode values that select an inline viewer.
const VIEW_VALUES: &[&str] = &["view", "viewer", "preview", "open", "inline", "show"];

/// Parameters whose whole purpose is download-vs-view.
const DOWNLOAD_FLAGS: &[&str] = &["download", "dl", "attach", "attachment"];

/// Rewrites `reference` into an absolute http(s) download URL.
///
/// Relative references resolve against `base`. Returns `None` when nothing
/// fetchable can be derived.
#[must_use]
pub fn reconstruct(reference: &str, base: &Url) -> Option<Url> {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with('#') {
        return None;
    }

    let target = if has_script_scheme(reference) {
        unwrap_script(reference)?
    } else {
        reference.to_string()
    };

    let mut url = base.join(&target).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);

    if let Some(query) = url.query() {
        let forced = force_download_mode(query);
        url.set_query(Some(&forced));
    }
    Some(url)
}

fn has_script_scheme(reference: &str) -> bool {
    reference
        .get(..11)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("javascript:"))
}

/// Pulls the first path-like quoted argument out of a script call.
fn unwrap_script(reference: &str) -> Option<String> {
    QUOTED_ARG
        .captures_iter(reference)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .find(|arg| looks_like_location(arg))
        .map(str::to_string)
}

fn looks_like_location(arg: &str) -> bool {
    !arg.contains(char::is_whitespace)
        && (arg.starts_with("http://")
            || arg.starts_with("https://")
            || arg.starts_with('/')
            || arg.contains('?')
            || arg.contains(".do")
            || arg.contains(".jsp")
            || arg.contains(".php")
            || arg.contains(".asp"))
}

/// Flips view-mode parameters to download mode. Only known mode keys and
/// download flags are touched; all other pairs are kept
/// byte-for-byte, including their original percent-encoding and order.
#[must_use]
pub fn force_download_mode(query: &str) -> String {
    query
        .split('&')
        .map(|pair| {
            let Some((key, value)) = pair.split_once('=') else {
                return pair.to_string();
            };
            let key_lower = key.to_ascii_lowercase();
            let value_lower = value.to_ascii_lowercase();

            if DOWNLOAD_FLAGS.contains(&key_lower.as_str()) {
                return match value_lower.as_str() {
                    "n" | "no" | "false" | "0" => format!("{key}={}", flipped_flag(value)),
                    _ => pair.to_string(),
                };
            }
            if key_lower == "disposition" && value_lower == "inline" {
                return format!("{key}=attachment");
            }
            if MODE_KEYS.contains(&key_lower.as_str()) && VIEW_VALUES.contains(&value_lower.as_str()) {
                return format!("{key}=download");
            }
            pair.to_string()
        })
        .collect::<Vec<_>>()
        .join("&")
}

// Keeps the style of the original flag value.
fn flipped_flag(value: &str) -> &'static str {
    match value {
        "N" => "Y",
        "n" => "y",
        "NO" | "No" | "no" => "yes",
        "0" => "1",
        _ => "true",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://court.example/case/detail.do?caseId=2024-77").unwrap()
    }

    #[test]
    fn test_relative_reference_resolved() {
        let url = reconstruct("../file/down.do?fileSeq=3", &base()).unwrap();
        assert_eq!(url.as_str(), "https://court.example/file/down.do?fileSeq=3");
    }

    #[test]
    fn test_absolute_reference_kept() {
        let url = reconstruct("https://cdn.example/a.pdf#page=2", &base()).unwrap();
        assert_eq!(url.as_str(), "https://cdn.example/a.pdf");
    }

    #[test]
    fn test_script_reference_unwrapped() {
        let url = reconstruct(
            r#"javascript:fnView("doc", "/viewer/show.do?docId=99&type=preview");"#,
            &base(),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://court.example/viewer/show.do?docId=99&type=download"
        );
    }

    #[test]
    fn test_script_without_location_yields_none() {
        assert!(reconstruct("javascript:void(0)", &base()).is_none());
        assert!(reconstruct("JavaScript:alert('not available')", &base()).is_none());
    }

    #[test]
    fn test_non_http_and_fragment_rejected() {
        assert!(reconstruct("mailto:clerk@court.example", &base()).is_none());
        assert!(reconstruct("#section", &base()).is_none());
        assert!(reconstruct("  ", &base()).is_none());
    }

    #[test]
    fn test_force_download_mode_preserves_other_params() {
        assert_eq!(
            force_download_mode("a=%EA%B0%80&mode=VIEW&b=1+2&flag"),
            "a=%EA%B0%80&mode=download&b=1+2&flag"
        );
        assert_eq!(force_download_mode("download=N&x=1"), "download=Y&x=1");
        assert_eq!(force_download_mode("dl=0"), "dl=1");
        assert_eq!(
            force_download_mode("disposition=inline"),
            "disposition=attachment"
        );
        assert_eq!(force_download_mode("download=Y"), "download=Y");
    }

    #[test]
    fn test_view_values_outside_mode_keys_untouched() {
        assert_eq!(
            force_download_mode("fileId=7&status=open&sort=show&mode=view"),
            "fileId=7&status=open&sort=show&mode=download"
        );
        assert_eq!(force_download_mode("viewType=inline"), "viewType=download");

        let url = reconstruct("/file/get.do?fileId=7&saleStatus=open", &base()).unwrap();
        assert_eq!(
            url.as_str(),
            "https://court.example/file/get.do?fileId=7&saleStatus=open"
        );
    }
}
