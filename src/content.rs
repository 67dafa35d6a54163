//! On-disk layout of saved pages: `<root>/<normalized domain>/<base64url(path)>.<ext>`.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use tracing::info;
use url::Url;

use crate::crawl::classify::DocumentKind;
use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Html,
    Pdf,
    Docx,
    Doc,
}

impl FileKind {
    pub fn extension(self) -> &'static str {
        match self {
            FileKind::Html => "html",
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Doc => "doc",
        }
    }
}

/// Lower-cased host with a leading `www.` and trailing `/` removed.
pub fn normalize_domain(host: &str) -> String {
    let host = host.trim().to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    host.trim_end_matches('/').to_string()
}

/// Base64url of the path with padding stripped.
pub fn encode_path(path: &str) -> String {
    URL_SAFE_NO_PAD.encode(path.as_bytes())
}

pub fn decode_path(stem: &str) -> Result<String, DecodeError> {
    if stem.is_empty() {
        return Err(DecodeError::MissingStem(stem.to_string()));
    }
    let mut padded = stem.to_string();
    padded.extend(std::iter::repeat('=').take((4 - stem.len() % 4) % 4));
    let bytes = URL_SAFE.decode(padded.as_bytes())?;
    Ok(String::from_utf8(bytes)?)
}

pub fn file_name(url: &Url, kind: FileKind) -> String {
    format!("{}.{}", encode_path(url.path()), kind.extension())
}

/// Recover the page URL from a stored file name. Names holding only a path are
/// rebuilt against the directory's domain.
pub fn url_from_file_name(file_name: &str, domain: &str) -> Result<Url, DecodeError> {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| DecodeError::MissingStem(file_name.to_string()))?;
    let decoded = decode_path(stem)?;
    match Url::parse(&decoded) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Ok(Url::parse(&format!("https://www.{domain}{decoded}"))?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Feeds and sitemaps are never written to disk.
pub fn ignore_xml(url: &Url) -> bool {
    url.as_str().to_lowercase().ends_with(".xml")
}

/// Coarse markup check: a page declaring `lang="en"`, `lang="en-US"` or `lang="ru"`
/// anywhere is not saved, unless it also declares `lang="et"`.
pub fn ignores_language_markup(content: &str) -> bool {
    if content.contains(r#"lang="et""#) {
        return false;
    }
    [r#"lang="en""#, r#"lang="ru""#, r#"lang="en-US""#]
        .iter()
        .any(|marker| content.contains(marker))
}

/// Legacy Word documents, recognized by the path alone.
pub fn is_doc_path(url: &Url) -> bool {
    url.path().to_lowercase().ends_with(".doc")
}

/// Decide whether and as what a fetched document is written to the content directory.
pub fn save_target(url: &Url, kind: DocumentKind, content: &str) -> Option<FileKind> {
    if ignore_xml(url) {
        return None;
    }
    match kind {
        DocumentKind::Pdf => Some(FileKind::Pdf),
        DocumentKind::Docx => Some(FileKind::Docx),
        DocumentKind::Html if is_doc_path(url) => Some(FileKind::Doc),
        DocumentKind::Html if !ignores_language_markup(content) => Some(FileKind::Html),
        DocumentKind::Html => None,
    }
}

/// Root of the saved-content tree; one subdirectory per normalized domain.
#[derive(Debug, Clone)]
pub struct ContentDir {
    root: PathBuf,
}

impl ContentDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn save(&self, url: &Url, kind: FileKind, body: &[u8]) -> std::io::Result<PathBuf> {
        let domain = normalize_domain(url.host_str().unwrap_or_default());
        let dir = self.root.join(domain);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(file_name(url, kind));
        tokio::fs::write(&path, body).await?;
        info!(url = %url, file = %path.display(), "Saved file");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn normalizes_domain() {
        assert_eq!(normalize_domain("WWW.Example.EE"), "example.ee");
        assert_eq!(normalize_domain("example.ee/"), "example.ee");
        // only the literal prefix goes, not any leading w or dot
        assert_eq!(normalize_domain("web.ee"), "web.ee");
    }

    #[test]
    fn path_survives_encoding() {
        for path in ["/", "/haridus/koolid?id=3", "/õppimine/ülikool"] {
            let encoded = encode_path(path);
            assert!(!encoded.contains('='));
            assert_eq!(decode_path(&encoded).unwrap(), path);
        }
    }

    #[test]
    fn file_name_rebuilds_url_on_directory_domain() {
        let name = file_name(&url("https://www.example.ee/kontakt"), FileKind::Html);
        assert!(name.ends_with(".html"));
        let rebuilt = url_from_file_name(&name, "example.ee").unwrap();
        assert_eq!(rebuilt.as_str(), "https://www.example.ee/kontakt");
    }

    #[test]
    fn full_url_names_are_kept() {
        let name = format!("{}.html", encode_path("http://other.ee/x"));
        let rebuilt = url_from_file_name(&name, "example.ee").unwrap();
        assert_eq!(rebuilt.as_str(), "http://other.ee/x");
    }

    #[test]
    fn undecodable_names_are_errors() {
        assert!(matches!(
            url_from_file_name("a.html", "example.ee"),
            Err(DecodeError::Base64(_))
        ));
        assert!(matches!(
            url_from_file_name("%%%%.html", "example.ee"),
            Err(DecodeError::Base64(_))
        ));
        // "_w" decodes to 0xFF, which is not utf-8
        assert!(matches!(
            url_from_file_name("_w.html", "example.ee"),
            Err(DecodeError::Utf8(_))
        ));
    }

    #[test]
    fn language_markup_policy() {
        assert!(ignores_language_markup(r#"<html lang="en">"#));
        assert!(ignores_language_markup(r#"<html lang="en-US">"#));
        assert!(ignores_language_markup(r#"<div lang="ru">"#));
        assert!(!ignores_language_markup(r#"<html lang="et"><p lang="en">"#));
        assert!(!ignores_language_markup(r#"<html lang="fi">"#));
        assert!(!ignores_language_markup("<html>"));
    }

    #[test]
    fn save_targets() {
        let html = r#"<html lang="et"></html>"#;
        assert_eq!(save_target(&url("https://a.ee/sitemap.XML"), DocumentKind::Html, html), None);
        assert_eq!(
            save_target(&url("https://a.ee/f.pdf"), DocumentKind::Pdf, ""),
            Some(FileKind::Pdf)
        );
        assert_eq!(
            save_target(&url("https://a.ee/f.docx"), DocumentKind::Docx, ""),
            Some(FileKind::Docx)
        );
        assert_eq!(
            save_target(&url("https://a.ee/f.doc"), DocumentKind::Html, r#"lang="en""#),
            Some(FileKind::Doc)
        );
        assert_eq!(
            save_target(&url("https://a.ee/"), DocumentKind::Html, html),
            Some(FileKind::Html)
        );
        assert_eq!(
            save_target(&url("https://a.ee/en"), DocumentKind::Html, r#"<html lang="en">"#),
            None
        );
    }

    #[tokio::test]
    async fn saves_under_normalized_domain() {
        let dir = tempfile::tempdir().unwrap();
        let content = ContentDir::new(dir.path());
        let page = url("https://WWW.Example.ee/a/b");
        let path = content.save(&page, FileKind::Pdf, b"%PDF-1.4").await.unwrap();
        assert_eq!(path.parent().unwrap(), dir.path().join("example.ee"));
        assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-1.4");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(url_from_file_name(name, "example.ee").unwrap().path(), "/a/b");
    }
}
