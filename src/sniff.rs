//! Payload integrity checks for acquired documents.
//!
//! Sites frequently answer a document request with `200 OK` and an HTML error
//! or login page while still claiming `application/pdf`. Every payload the
//! engine is about to persist passes through [`sniff`] first.

use std::fmt;

/// Payloads smaller than this are never trusted as documents.
pub const MIN_DOCUMENT_BYTES: usize = 1024;

/// How many leading bytes are inspected for HTML markers.
const HTML_SCAN_WINDOW: usize = 512;

/// Markers that identify an HTML document when found in the leading bytes.
const HTML_MARKERS: &[&[u8]] = &[
    b"<!doctype html",
    b"<html",
    b"<head",
    b"<body",
    b"<script",
    b"<title",
];

/// Content types accepted as downloadable documents.
///
/// Matching is done on the MIME essence (parameters stripped, lowercased).
pub const DOCUMENT_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/x-pdf",
    "application/octet-stream",
    "application/x-download",
    "application/force-download",
    "application/download",
    "application/zip",
    "application/x-zip-compressed",
    "application/msword",
    "application/vnd.ms-excel",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/x-hwp",
    "application/haansofthwp",
    "application/vnd.hancom.hwp",
    "application/vnd.hancom.hwpx",
    "image/jpeg",
    "image/png",
    "image/tiff",
    "image/gif",
];

/// Result of inspecting a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Looks like a real document.
    Genuine,
    /// Leading bytes or declared type identify an HTML page.
    ErrorPage,
    /// Body is below [`MIN_DOCUMENT_BYTES`].
    TooSmall,
}

impl Verdict {
    /// Returns true for [`Verdict::Genuine`].
    #[must_use]
    pub fn is_genuine(self) -> bool {
        matches!(self, Self::Genuine)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Genuine => f.write_str("genuine"),
            Self::ErrorPage => f.write_str("html error page"),
            Self::TooSmall => f.write_str("too small"),
        }
    }
}

/// Classifies a payload and its declared content type.
///
/// HTML detection wins over size so that short error pages are reported as
/// such. Known binary signatures at offset zero short-circuit the HTML scan.
#[must_use]
pub fn sniff(body: &[u8], content_type: Option<&str>) -> Verdict {
    if detect_signature(body).is_none() {
        if content_type.map(mime_essence).as_deref() == Some("text/html") {
            return Verdict::ErrorPage;
        }
        if looks_like_html(body) {
            return Verdict::ErrorPage;
        }
    }
    if body.len() < MIN_DOCUMENT_BYTES {
        return Verdict::TooSmall;
    }
    Verdict::Genuine
}

/// Returns true when the leading bytes contain an HTML document marker.
#[must_use]
pub fn looks_like_html(body: &[u8]) -> bool {
    let window = &body[..body.len().min(HTML_SCAN_WINDOW)];
    let lowered = window.to_ascii_lowercase();
    HTML_MARKERS
        .iter()
        .any(|marker| lowered.windows(marker.len()).any(|w| w == *marker))
}

/// Returns the extension implied by a well-known file signature.
#[must_use]
pub fn detect_signature(body: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "pdf"),
        (b"PK\x03\x04", "zip"),
        (b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1", "hwp"),
        (b"\x89PNG\r\n\x1A\n", "png"),
        (b"\xFF\xD8\xFF", "jpg"),
        (b"II*\x00", "tif"),
        (b"MM\x00*", "tif"),
        (b"GIF8", "gif"),
    ];
    SIGNATURES
        .iter()
        .find(|(magic, _)| body.starts_with(magic))
        .map(|(_, ext)| *ext)
}

/// Returns true if the content type is on the document allow-list.
#[must_use]
pub fn is_document_content_type(content_type: &str) -> bool {
    let essence = mime_essence(content_type);
    DOCUMENT_CONTENT_TYPES.contains(&essence.as_str())
}

/// Maps a content type to a file extension (without the dot).
///
/// Generic types such as `application/octet-stream` yield `None` so callers
/// fall back to the Content-Disposition filename.
#[must_use]
pub fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    match mime_essence(content_type).as_str() {
        "application/pdf" | "application/x-pdf" => Some("pdf"),
        "application/zip" | "application/x-zip-compressed" => Some("zip"),
        "application/msword" => Some("doc"),
        "application/vnd.ms-excel" => Some("xls"),
        "application/vnd.ms-powerpoint" => Some("ppt"),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some("docx"),
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => Some("xlsx"),
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
            Some("pptx")
        }
        "application/x-hwp" | "application/haansofthwp" | "application/vnd.hancom.hwp" => {
            Some("hwp")
        }
        "application/vnd.hancom.hwpx" => Some("hwpx"),
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/tiff" => Some("tif"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

/// Lowercased MIME type without parameters.
#[must_use]
pub fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}
