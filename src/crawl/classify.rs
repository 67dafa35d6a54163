//! Per-response decisions: document kind, fetch strategy, language.
//!
//! All three are cheap heuristics over headers, URL and raw markup. False positives
//! are accepted; the strategy only picks between a plain and a browser-rendered fetch.

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use scraper::Html;
use url::Url;

pub const UNKNOWN_LANGUAGE: &str = "unknown";

const JS_FRAMEWORKS: &[&str] = &["react", "angular", "vue", "next.js", "svelte"];
const DYNAMIC_INDICATORS: &[&str] = &["<script", "spinner", "loading", "aria-busy"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Html,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Static,
    Rendered,
}

impl std::fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchStrategy::Static => write!(f, "static"),
            FetchStrategy::Rendered => write!(f, "rendered"),
        }
    }
}

pub fn classify_document(url: &Url, headers: &HeaderMap) -> DocumentKind {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type.contains("application/pdf") {
        DocumentKind::Pdf
    } else if url.path().to_lowercase().ends_with(".docx") {
        DocumentKind::Docx
    } else {
        DocumentKind::Html
    }
}

/// `Rendered` when the markup mentions a JS framework or a dynamic-loading hint.
pub fn choose_strategy(body: &str) -> FetchStrategy {
    let content = body.to_lowercase();
    let dynamic = JS_FRAMEWORKS
        .iter()
        .chain(DYNAMIC_INDICATORS)
        .any(|needle| content.contains(needle));
    if dynamic {
        FetchStrategy::Rendered
    } else {
        FetchStrategy::Static
    }
}

/// Primary subtag of the root element's `lang` attribute, or `"unknown"`.
pub fn detect_language(body: &str) -> String {
    let document = Html::parse_document(body);
    document
        .root_element()
        .value()
        .attr("lang")
        .and_then(|lang| lang.split('-').next())
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .unwrap_or(UNKNOWN_LANGUAGE)
        .to_string()
}
