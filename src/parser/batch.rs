//! Second stage: re-read saved pages from the content directory and store their
//! structured form on the matching page record.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, error, info};
use url::Url;

use super::{structure_html, StructuredDocument};
use crate::content::{url_from_file_name, FileKind};
use crate::db::{MetadataStore, UpsertOutcome};

const CHUNK_SIZE: usize = 500;

/// A saved HTML file and the page URL its name decodes to.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub path: PathBuf,
    pub url: Url,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParseSummary {
    pub created: usize,
    pub updated: usize,
    pub undecodable: usize,
    pub failed: usize,
}

impl ParseSummary {
    pub fn print(&self) {
        println!(
            "Parsed {} pages ({} new, {} updated), {} undecodable names, {} failed.",
            self.created + self.updated,
            self.created,
            self.updated,
            self.undecodable,
            self.failed,
        );
    }
}

/// Every `.html` file one level below each domain directory under `root`.
/// Files whose names do not decode are logged and counted, not returned.
pub fn discover(root: &Path, summary: &mut ParseSummary) -> Result<Vec<RawPage>> {
    let mut pages = Vec::new();
    let mut domains: Vec<PathBuf> = std::fs::read_dir(root)
        .with_context(|| format!("Cannot read content directory {}", root.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    domains.sort();

    for dir in domains {
        let Some(domain) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("Cannot read {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        for path in files {
            let is_html = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == FileKind::Html.extension());
            if !is_html {
                debug!(file = %path.display(), "Skipping non-html file");
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match url_from_file_name(name, &domain) {
                Ok(url) => pages.push(RawPage { path, url }),
                Err(e) => {
                    error!(file = %path.display(), error = %e, "Cannot decode file name, skipping");
                    summary.undecodable += 1;
                }
            }
        }
    }

    Ok(pages)
}

/// Saved pages are always UTF-8: the crawl decodes by the response charset before
/// writing, so an in-markup charset declaration is stale and ignored here.
fn structure_file(page: &RawPage) -> std::io::Result<StructuredDocument> {
    let bytes = std::fs::read(&page.path)?;
    let html = String::from_utf8_lossy(&bytes);
    Ok(structure_html(&page.url, &html, Utc::now()))
}

/// Structure every saved page under `root` and upsert it by URL.
///
/// Parsing runs in parallel per chunk; upserts are sequential, each in its own
/// transaction. A failed file or write is logged and skipped. An unreachable
/// store aborts the run.
pub async fn parse_content_dir(store: &dyn MetadataStore, root: &Path) -> Result<ParseSummary> {
    let mut summary = ParseSummary::default();
    let pages = discover(root, &mut summary)?;
    info!(root = %root.display(), files = pages.len(), "Structuring saved pages");

    let pb = ProgressBar::new(pages.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
            .progress_chars("#>-"),
    );

    for chunk in pages.chunks(CHUNK_SIZE) {
        let chunk = chunk.to_vec();
        let results: Vec<(RawPage, std::io::Result<StructuredDocument>)> =
            tokio::task::spawn_blocking(move || {
                chunk
                    .into_par_iter()
                    .map(|page| {
                        let doc = structure_file(&page);
                        (page, doc)
                    })
                    .collect()
            })
            .await
            .context("Parser worker panicked")?;

        for (page, doc) in results {
            pb.inc(1);
            let doc = match doc {
                Ok(doc) => doc,
                Err(e) => {
                    error!(file = %page.path.display(), error = %e, "Cannot read file");
                    summary.failed += 1;
                    continue;
                }
            };
            let parsed_at = doc.metadata.date_parsed.unwrap_or_else(Utc::now);
            match store.upsert_parsed_document(page.url.as_str(), &doc, parsed_at).await {
                Ok(UpsertOutcome::Created) => {
                    info!(url = %page.url, file = %page.path.display(), "Saved parsed page");
                    summary.created += 1;
                }
                Ok(UpsertOutcome::Updated) => {
                    info!(url = %page.url, file = %page.path.display(), "Updated parsed page");
                    summary.updated += 1;
                }
                Err(e) if e.is_unavailable() => {
                    pb.abandon();
                    return Err(e).context("Metadata store unavailable");
                }
                Err(e) => {
                    error!(url = %page.url, file = %page.path.display(), error = %e, "Failed to save parsed page");
                    summary.failed += 1;
                }
            }
        }
    }

    pb.finish_and_clear();
    info!(
        created = summary.created,
        updated = summary.updated,
        undecodable = summary.undecodable,
        failed = summary.failed,
        "Structuring finished"
    );
    Ok(summary)
}
