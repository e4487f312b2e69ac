//! Filename sanitization, Content-Disposition parsing and per-case uniqueness.
//!
//! Output names are reserved in a [`FilenameRegistry`] before anything is
//! written, so two candidates in one case can never land on the same file.

use std::collections::HashSet;
use std::path::{Component, Path};

use url::Url;

/// Extensions that mark a URL as pointing at a document rather than a page.
const DOCUMENT_EXTENSIONS: &[&str] = &[
    ".pdf", ".hwp", ".hwpx", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".zip", ".jpg",
    ".jpeg", ".png", ".tif", ".tiff", ".gif",
];

/// Longest label fragment kept in a generated name, in characters.
const MAX_LABEL_CHARS: usize = 60;

/// Default extension for a category when neither headers nor bytes tell.
#[must_use]
pub fn category_default_extension(category: &str) -> &'static str {
    match category {
        "PHOTO" => "jpg",
        "UNK" => "bin",
        _ => "pdf",
    }
}

/// Returns true if the URL path ends in a known document extension.
#[must_use]
pub fn is_document_url(url: &str) -> bool {
    let path = Url::parse(url)
        .ok()
        .map(|u| u.path().to_lowercase())
        .unwrap_or_default();
    DOCUMENT_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Lowercased extension (without the dot) of a filename, if plausible.
#[must_use]
pub fn extension_of(name: &str) -> Option<String> {
    let dot = name.rfind('.')?;
    let ext = &name[dot + 1..];
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Parses Content-Disposition header to extract filename.
///
/// Handles both:
/// - `attachment; filename="example.pdf"`
/// - `attachment; filename=example.pdf`
/// - `attachment; filename*=UTF-8''example.pdf` (RFC 5987)
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    // Parameter names are case-insensitive; ASCII lowering keeps byte offsets.
    let lower = header.to_ascii_lowercase();

    // Try filename*= first (RFC 5987 encoded)
    if let Some(pos) = lower.find("filename*=") {
        let value = header[pos + 10..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded_name = encoded[..end].trim().trim_matches('"');
            if let Ok(decoded) = urlencoding::decode(encoded_name) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = lower.find("filename=") {
        let value = header[pos + 9..].trim();

        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(decode_percent(&stripped[..end]));
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(decode_percent(filename));
            }
        }
    }

    None
}

// Korean sites routinely percent-encode plain `filename=` values.
fn decode_percent(value: &str) -> String {
    if value.contains('%') {
        urlencoding::decode(value).map_or_else(|_| value.to_string(), |d| d.into_owned())
    } else {
        value.to_string()
    }
}

/// Sanitizes filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

/// Builds the stem for a candidate: `<CATEGORY>_<label>`.
#[must_use]
pub fn candidate_stem(category: &str, label: &str) -> String {
    let label: String = sanitize_filename(label)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .take(MAX_LABEL_CHARS)
        .collect();
    let label = label.trim_matches(['_', '.']);
    if label.is_empty() {
        category.to_string()
    } else {
        format!("{category}_{label}")
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Per-case set of output file names already in use.
///
/// Comparison is case-insensitive so the registry also holds on
/// case-insensitive filesystems.
#[derive(Debug, Default, Clone)]
pub struct FilenameRegistry {
    taken: HashSet<String>,
}

impl FilenameRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks names from a previous run as taken.
    pub fn seed<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.taken.insert(name.as_ref().to_lowercase());
        }
    }

    /// Returns true if `name` is already taken.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.taken.contains(&name.to_lowercase())
    }

    /// Number of names taken.
    #[must_use]
    pub fn len(&self) -> usize {
        self.taken.len()
    }

    /// Returns true if nothing is taken yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.taken.is_empty()
    }

    /// Reserves `stem.ext`, or `stem_2.ext`, `stem_3.ext`, ... if taken.
    pub fn reserve(&mut self, stem: &str, extension: &str) -> String {
        let stem = sanitize_filename(stem);
        let extension = extension.trim_start_matches('.');
        let build = |suffix: Option<usize>| match (suffix, extension.is_empty()) {
            (None, true) => stem.clone(),
            (None, false) => format!("{stem}.{extension}"),
            (Some(n), true) => format!("{stem}_{n}"),
            (Some(n), false) => format!("{stem}_{n}.{extension}"),
        };

        let mut name = build(None);
        let mut suffix = 2;
        while self.contains(&name) {
            name = build(Some(suffix));
            suffix += 1;
        }
        self.taken.insert(name.to_lowercase());
        name
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_removes_invalid_chars() {
        assert_eq!(sanitize_filename("file/name.pdf"), "file_name.pdf");
        assert_eq!(sanitize_filename("file:name.pdf"), "file_name.pdf");
        assert_eq!(sanitize_filename("file<name>.pdf"), "file_name_.pdf");
        assert_eq!(sanitize_filename("감정평가서.pdf"), "감정평가서.pdf");
    }

    #[test]
    fn test_sanitize_filename_rewrites_dot_segments() {
        assert_eq!(sanitize_filename(".."), "__");
        assert_eq!(sanitize_filename("   "), "_");
    }

    #[test]
    fn test_parse_content_disposition_ignores_parameter_case() {
        assert_eq!(
            parse_content_disposition(r#"attachment; FileName="%EA%B0%90%EC%A0%95.pdf""#),
            Some("감정.pdf".to_string())
        );
        assert_eq!(
            parse_content_disposition("Attachment; FILENAME*=UTF-8''Report.PDF"),
            Some("Report.PDF".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_variants() {
        assert_eq!(
            parse_content_disposition(r#"attachment; filename="example.pdf""#),
            Some("example.pdf".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=example.pdf; size=10"),
            Some("example.pdf".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename*=UTF-8''%EA%B0%90%EC%A0%95.pdf"),
            Some("감정.pdf".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=\"%EB%93%B1%EA%B8%B0.hwp\""),
            Some("등기.hwp".to_string())
        );
        assert_eq!(parse_content_disposition("inline"), None);
    }

    #[test]
    fn test_is_document_url() {
        assert!(is_document_url("https://a.example/files/report.PDF"));
        assert!(is_document_url("https://a.example/x.hwp?download=1"));
        assert!(!is_document_url("https://map.example/view?lat=1"));
        assert!(!is_document_url("not a url"));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("report.PDF"), Some("pdf".to_string()));
        assert_eq!(extension_of("archive"), None);
        assert_eq!(extension_of("weird.name with space"), None);
    }

    #[test]
    fn test_candidate_stem() {
        assert_eq!(candidate_stem("AP", "감정평가서"), "AP_감정평가서");
        assert_eq!(candidate_stem("REG", " 등기 부등본 "), "REG_등기_부등본");
        assert_eq!(candidate_stem("UNK", "///"), "UNK");
    }

    #[test]
    fn test_registry_suffixes_start_at_two() {
        let mut registry = FilenameRegistry::new();
        assert_eq!(registry.reserve("AP_감정평가서", "pdf"), "AP_감정평가서.pdf");
        assert_eq!(registry.reserve("AP_감정평가서", "pdf"), "AP_감정평가서_2.pdf");
        assert_eq!(registry.reserve("AP_감정평가서", ".pdf"), "AP_감정평가서_3.pdf");
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_registry_seeded_names_are_case_insensitive() {
        let mut registry = FilenameRegistry::new();
        registry.seed(["REG_Deed.PDF"]);
        assert!(registry.contains("reg_deed.pdf"));
        assert_eq!(registry.reserve("REG_Deed", "pdf"), "REG_Deed_2.pdf");
    }

    #[test]
    fn test_category_default_extension() {
        assert_eq!(category_default_extension("AP"), "pdf");
        assert_eq!(category_default_extension("PHOTO"), "jpg");
        assert_eq!(category_default_extension("UNK"), "bin");
    }
}
