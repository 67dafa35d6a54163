use std::sync::LazyLock;

use dashmap::DashSet;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::content::normalize_domain;

static LANGUAGE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(?:ru|en)/").unwrap());
static NEWS_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"uudis(?:ed)?|news").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// Store and visited-set key: the URL without its fragment.
pub fn normalize_url(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}

/// Absolute targets of every `<a href>` in the page, resolved against `base`.
/// Targets that do not resolve are dropped.
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let mut links = Vec::new();

    for element in document.select(&ANCHOR) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() {
            continue;
        }
        match base.join(href) {
            Ok(url) => links.push(normalize_url(&url)),
            Err(e) => debug!(href, error = %e, "Unresolvable link"),
        }
    }

    links.sort();
    links.dedup();
    links
}

/// Normalized domain plus an explicit non-default port, e.g. `example.ee:8443`.
pub fn site_key(url: &Url) -> Option<String> {
    let domain = normalize_domain(url.host_str()?);
    Some(match url.port() {
        Some(port) => format!("{domain}:{port}"),
        None => domain,
    })
}

/// Stay on the allowed site and off language-prefixed and news paths.
pub fn is_valid_link(url: &Url, allowed_domain: &str) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    if site_key(url).as_deref() != Some(allowed_domain) {
        return false;
    }
    let path = url.path().to_lowercase();
    !LANGUAGE_PATH_RE.is_match(&path) && !NEWS_PATH_RE.is_match(&path)
}

/// URLs already dispatched in one crawl run. Safe to share across page handlers.
#[derive(Debug, Default)]
pub struct VisitState {
    seen: DashSet<String>,
}

impl VisitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True only for the first caller claiming this URL.
    pub fn claim(&self, url: &Url) -> bool {
        self.seen.insert(normalize_url(url).into())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Links in `html` worth following that no other handler has claimed yet.
pub fn follow_links(html: &str, page: &Url, allowed_domain: &str, visited: &VisitState) -> Vec<Url> {
    extract_links(html, page)
        .into_iter()
        .filter(|link| is_valid_link(link, allowed_domain))
        .filter(|link| visited.claim(link))
        .collect()
}
