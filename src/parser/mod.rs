pub mod batch;
pub mod sections;

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static TIME: LazyLock<Selector> = LazyLock::new(|| Selector::parse("time").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());
static IMAGE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img[src]").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub header: String,
    pub paragraphs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub date_published: Option<String>,
    pub date_parsed: Option<DateTime<Utc>>,
}

/// `parsed_data` payload of a page record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredDocument {
    pub url: String,
    pub title: Option<String>,
    pub content: Vec<Section>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

/// Raw markup → sectioned document. Pure apart from the supplied parse time.
pub fn structure_html(url: &Url, html: &str, parsed_at: DateTime<Utc>) -> StructuredDocument {
    let document = Html::parse_document(html);
    let blocks = sections::collect_blocks(&document);

    StructuredDocument {
        url: url.to_string(),
        title: document
            .select(&TITLE)
            .next()
            .map(|el| sections::element_text(&el))
            .filter(|t| !t.is_empty()),
        content: sections::cluster_sections(&blocks),
        links: resolved_attrs(&document, &ANCHOR, "href", url),
        images: resolved_attrs(&document, &IMAGE, "src", url),
        metadata: DocumentMetadata {
            date_published: date_published(&document),
            date_parsed: Some(parsed_at),
        },
    }
}

/// First `<time>`: its `datetime` attribute, else its text.
fn date_published(document: &Html) -> Option<String> {
    let el = document.select(&TIME).next()?;
    el.value()
        .attr("datetime")
        .map(|s| s.trim().to_string())
        .or_else(|| Some(sections::element_text(&el)))
        .filter(|s| !s.is_empty())
}

/// Attribute values resolved against the page URL, first occurrence order, no duplicates.
fn resolved_attrs(document: &Html, selector: &Selector, attr: &str, base: &Url) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for el in document.select(selector) {
        let Some(value) = el.value().attr(attr).map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        let Ok(resolved) = base.join(value) else {
            continue;
        };
        let resolved = resolved.to_string();
        if !out.contains(&resolved) {
            out.push(resolved);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixture() -> String {
        std::fs::read_to_string("tests/fixtures/haridus.html").unwrap()
    }

    #[test]
    fn structures_fixture() {
        let url = Url::parse("https://www.example.ee/haridus").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let doc = structure_html(&url, &fixture(), at);

        assert_eq!(doc.url, "https://www.example.ee/haridus");
        assert_eq!(doc.title.as_deref(), Some("Haridus ja Noored"));
        assert_eq!(doc.content.len(), 3);
        assert_eq!(
            doc.links,
            vec![
                "https://www.example.ee/",
                "https://www.example.ee/en/",
                "https://www.example.ee/korgharidus#ulikoolid",
                "https://www.hm.ee/",
            ]
        );
        assert_eq!(
            doc.images,
            vec!["https://www.example.ee/img/kool.jpg", "https://cdn.example.ee/logo.png"]
        );
        assert_eq!(
            doc.metadata.date_published.as_deref(),
            Some("2024-03-01T09:00:00+02:00")
        );
        assert_eq!(doc.metadata.date_parsed, Some(at));
    }

    #[test]
    fn same_input_same_document() {
        let url = Url::parse("https://www.example.ee/haridus").unwrap();
        let first = structure_html(&url, &fixture(), Utc::now());
        let second = structure_html(&url, &fixture(), Utc::now());
        assert_eq!(first.content, second.content);
        assert_eq!(first.links, second.links);
        assert_eq!(first.title, second.title);
    }

    #[test]
    fn json_shape() {
        let url = Url::parse("https://a.ee/").unwrap();
        let doc = structure_html(&url, "<title>T</title><h1>H</h1><p>p</p>", Utc::now());
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["url"], "https://a.ee/");
        assert_eq!(json["title"], "T");
        assert_eq!(json["content"][0]["header"], "H");
        assert_eq!(json["content"][0]["paragraphs"][0], "p");
        assert!(json["metadata"]["date_published"].is_null());
        assert!(json["metadata"]["date_parsed"].is_string());
    }

    #[test]
    fn empty_markup_is_empty_document() {
        let url = Url::parse("https://a.ee/").unwrap();
        let doc = structure_html(&url, "", Utc::now());
        assert!(doc.title.is_none());
        assert!(doc.content.is_empty());
        assert!(doc.links.is_empty());
    }
}
