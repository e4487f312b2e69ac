//! Candidate classification.
//!
//! An ordered `(pattern, category)` table tags labelled page elements with a
//! document category. The first matching pattern wins; unmatched elements
//! are not candidates.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::resolve::{ActionRef, Candidate};

/// Built-in categories in priority order.
pub const DEFAULT_CATEGORY_PATTERNS: &[(&str, &str)] = &[
    (r"감정\s*평가", "AP"),
    (r"매각\s*물건\s*명세", "SPEC"),
    (r"현황\s*조사", "STAT"),
    (r"등기", "REG"),
    (r"건축물\s*대장", "BLD"),
    (r"토지\s*(대장|이용)", "LAND"),
    (r"사진", "PHOTO"),
    (r"지도|위치도|로드뷰", "MAP"),
    (r"(?i)portal|포털|온나라|씨:?리얼", "PORTAL"),
];

/// Categories recorded as links by default.
pub const DEFAULT_LINK_ONLY: &[&str] = &["MAP", "PORTAL"];

#[allow(clippy::expect_used)]
static ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(a|button)\b([^>]*)>(.*?)</(?:a|button)\s*>").expect("element regex is valid")
});

#[allow(clippy::expect_used)]
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z][a-z0-9_:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("attribute regex is valid")
});

#[allow(clippy::expect_used)]
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex is valid"));

/// An ordered pattern table.
#[derive(Debug, Clone)]
pub struct CategoryTable {
    rules: Vec<(Regex, String)>,
}

impl CategoryTable {
    /// Compiles `rules` in order.
    ///
    /// # Errors
    ///
    /// Returns the first pattern that fails to compile.
    pub fn new<'a, I>(rules: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let rules = rules
            .into_iter()
            .map(|(pattern, category)| Ok((Regex::new(pattern)?, category.to_string())))
            .collect::<Result<_, regex::Error>>()?;
        Ok(Self { rules })
    }

    /// The built-in table.
    #[must_use]
    pub fn builtin() -> &'static Self {
        #[allow(clippy::expect_used)]
        static BUILTIN: LazyLock<CategoryTable> = LazyLock::new(|| {
            CategoryTable::new(DEFAULT_CATEGORY_PATTERNS.iter().copied())
                .expect("built-in category patterns are valid")
        });
        &BUILTIN
    }

    /// Category of the first pattern matching `label`.
    #[must_use]
    pub fn classify(&self, label: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(label))
            .map(|(_, category)| category.as_str())
    }

    /// Turns page elements into candidates, in page order.
    ///
    /// Elements whose label matches no pattern are skipped, as are repeats of
    /// the same label and action. Categories in `link_only` become link
    /// candidates.
    #[must_use]
    pub fn candidates(&self, elements: &[PageElement], link_only: &BTreeSet<String>) -> Vec<Candidate> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for element in elements {
            let Some(category) = self.classify(&element.label) else {
                continue;
            };
            let action = element.action();
            if !seen.insert((element.label.clone(), action.clone())) {
                continue;
            }
            let hint = element.href.clone().filter(|h| is_meaningful_href(h));

            let candidate = if link_only.contains(category) {
                Candidate::link(&element.label, hint.unwrap_or_else(|| action.clone()))
            } else {
                let candidate = Candidate::file(&element.label, ActionRef::new(action));
                match hint {
                    Some(hint) => candidate.with_target_hint(hint),
                    None => candidate,
                }
            };
            out.push(candidate.with_category(category));
        }
        debug!(elements = elements.len(), candidates = out.len(), "classified page elements");
        out
    }
}

/// A labelled, clickable element found in page markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageElement {
    /// Visible text.
    pub label: String,
    pub href: Option<String>,
    pub onclick: Option<String>,
    pub id: Option<String>,
}

impl PageElement {
    /// Reference used to click this element: `#id`, then a meaningful href,
    /// then the onclick script, then the label.
    #[must_use]
    pub fn action(&self) -> String {
        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            return format!("#{id}");
        }
        self.href
            .as_deref()
            .filter(|h| is_meaningful_href(h))
            .or(self.onclick.as_deref().map(str::trim).filter(|s| !s.is_empty()))
            .unwrap_or(&self.label)
            .to_string()
    }
}

fn is_meaningful_href(href: &str) -> bool {
    let trimmed = href.trim();
    !(trimmed.is_empty()
        || trimmed == "#"
        || trimmed.eq_ignore_ascii_case("javascript:void(0)")
        || trimmed.eq_ignore_ascii_case("javascript:void(0);")
        || trimmed.eq_ignore_ascii_case("javascript:;"))
}

/// Finds `<a>` and `<button>` elements with their label and click targets.
#[must_use]
pub fn scan_elements(html: &str) -> Vec<PageElement> {
    ELEMENT
        .captures_iter(html)
        .filter_map(|caps| {
            let attributes = caps.get(2).map_or("", |m| m.as_str());
            let label = visible_text(caps.get(3).map_or("", |m| m.as_str()));
            if label.is_empty() {
                return None;
            }
            Some(PageElement {
                label,
                href: attribute(attributes, "href"),
                onclick: attribute(attributes, "onclick"),
                id: attribute(attributes, "id"),
            })
        })
        .collect()
}

/// Scans `html` and classifies what it finds.
#[must_use]
pub fn scan_candidates(html: &str, table: &CategoryTable, link_only: &BTreeSet<String>) -> Vec<Candidate> {
    table.candidates(&scan_elements(html), link_only)
}

/// Value of `name` in a raw attribute list, entity-decoded.
pub(crate) fn attribute(attributes: &str, name: &str) -> Option<String> {
    ATTRIBUTE
        .captures_iter(attributes)
        .find(|caps| caps.get(1).is_some_and(|m| m.as_str().eq_ignore_ascii_case(name)))
        .and_then(|caps| caps.get(2).or_else(|| caps.get(3)))
        .map(|m| decode_entities(m.as_str()))
}

/// Markup stripped to single-spaced text.
pub(crate) fn visible_text(markup: &str) -> String {
    let text = TAG.replace_all(markup, " ");
    decode_entities(&text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
