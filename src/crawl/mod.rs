//! One crawl run: start at a schedule entry's URL and follow valid links within its
//! domain until the frontier is exhausted.
//!
//! Fetches run concurrently up to the configured limit. Each page's classification,
//! persistence and link filtering happen inside that page's own task; the visited
//! set is the only state the tasks share.

pub mod classify;
pub mod links;
pub mod persist;

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use self::classify::{choose_strategy, classify_document, detect_language, DocumentKind, FetchStrategy};
use self::links::{follow_links, normalize_url, site_key, VisitState};
use self::persist::{parse_last_modified, PagePersister, PersistOutcome};
use crate::content::{is_doc_path, save_target, ContentDir};
use crate::db::MetadataStore;
use crate::error::FetchError;
use crate::fetch::{FetchedPage, Fetcher};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrawlSummary {
    pub fetched: usize,
    pub persisted: usize,
    pub saved_files: usize,
    pub failed: usize,
}

impl CrawlSummary {
    fn add(&mut self, page: &PageOutcome) {
        self.fetched += page.fetched as usize;
        self.persisted += page.persisted as usize;
        self.saved_files += page.saved as usize;
        self.failed += page.failed as usize;
    }
}

#[derive(Debug, Default)]
struct PageOutcome {
    fetched: bool,
    persisted: bool,
    saved: bool,
    failed: bool,
    follow: Vec<Url>,
}

/// State of a single run, shared by its page tasks.
struct CrawlContext {
    allowed_domain: String,
    visited: VisitState,
    fetcher: Arc<dyn Fetcher>,
    persister: PagePersister,
    content: ContentDir,
    in_flight: Semaphore,
}

/// Long-lived crawl driver. Each `run` builds a fresh context.
pub struct Crawler {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn MetadataStore>,
    content: ContentDir,
    concurrency: usize,
}

impl Crawler {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn MetadataStore>,
        content: ContentDir,
        concurrency: usize,
    ) -> Self {
        Self {
            fetcher,
            store,
            content,
            concurrency: concurrency.max(1),
        }
    }

    /// Crawl from `start_url` to completion. Only an unusable start URL is an error;
    /// per-page failures are logged and counted in the summary.
    pub async fn run(&self, start_url: &str) -> Result<CrawlSummary, FetchError> {
        let start = parse_start_url(start_url)?;
        let allowed_domain =
            site_key(&start).ok_or_else(|| FetchError::InvalidUrl(start_url.to_string()))?;

        let ctx = Arc::new(CrawlContext {
            allowed_domain,
            visited: VisitState::new(),
            fetcher: Arc::clone(&self.fetcher),
            persister: PagePersister::new(Arc::clone(&self.store)),
            content: self.content.clone(),
            in_flight: Semaphore::new(self.concurrency),
        });
        info!(url = %start, domain = %ctx.allowed_domain, concurrency = self.concurrency, "Starting crawl");

        let mut summary = CrawlSummary::default();
        let mut tasks = JoinSet::new();
        ctx.visited.claim(&start);
        tasks.spawn(handle_page(Arc::clone(&ctx), start.clone()));

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    summary.add(&outcome);
                    for link in outcome.follow {
                        tasks.spawn(handle_page(Arc::clone(&ctx), link));
                    }
                }
                Err(e) => {
                    error!(error = %e, "Page task aborted");
                    summary.failed += 1;
                }
            }
        }

        info!(
            url = %start,
            visited = ctx.visited.len(),
            fetched = summary.fetched,
            persisted = summary.persisted,
            saved_files = summary.saved_files,
            failed = summary.failed,
            "Crawl finished"
        );
        Ok(summary)
    }
}

fn parse_start_url(raw: &str) -> Result<Url, FetchError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|e| FetchError::InvalidUrl(format!("{trimmed}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::InvalidUrl(trimmed.to_string()));
    }
    Ok(normalize_url(&url))
}

async fn handle_page(ctx: Arc<CrawlContext>, url: Url) -> PageOutcome {
    let mut outcome = PageOutcome::default();
    let Ok(permit) = ctx.in_flight.acquire().await else {
        return outcome;
    };

    let page = match ctx.fetcher.fetch(&url, FetchStrategy::Static).await {
        Ok(page) => page,
        Err(e) => {
            warn!(url = %url, error = %e, "Fetch failed, not following");
            outcome.failed = true;
            return outcome;
        }
    };
    outcome.fetched = true;

    let kind = classify_document(&page.url, &page.headers);
    debug!(url = %url, status = page.status, ?kind, "Classified");

    match kind {
        DocumentKind::Pdf => {
            drop(permit);
            save(&ctx, &url, kind, "", &page.body, &mut outcome).await;
        }
        DocumentKind::Docx => {
            drop(permit);
            office_document(&ctx, &url, kind, &page, &mut outcome).await;
        }
        // Word files served without a docx extension still come back as Html.
        DocumentKind::Html if is_doc_path(&url) => {
            drop(permit);
            office_document(&ctx, &url, kind, &page, &mut outcome).await;
        }
        DocumentKind::Html => {
            let body = page.text();
            let language = detect_language(&body);
            let last_modified = page.last_modified().and_then(parse_last_modified);

            let html = match choose_strategy(&body) {
                FetchStrategy::Static => body,
                FetchStrategy::Rendered => {
                    match ctx.fetcher.fetch(&url, FetchStrategy::Rendered).await {
                        Ok(rendered) => rendered.text(),
                        Err(e) => {
                            warn!(url = %url, error = %e, "Render failed, using static content");
                            body
                        }
                    }
                }
            };
            drop(permit);

            persist(&ctx, &url, &language, last_modified, page.status, &mut outcome).await;
            save(&ctx, &url, kind, &html, html.as_bytes(), &mut outcome).await;
            outcome.follow = follow_links(&html, &page.url, &ctx.allowed_domain, &ctx.visited);
            debug!(url = %url, links = outcome.follow.len(), "Queued links");
        }
    }

    outcome
}

/// Metadata under the unknown language, then the body bytes as received. No links.
async fn office_document(
    ctx: &CrawlContext,
    url: &Url,
    kind: DocumentKind,
    page: &FetchedPage,
    outcome: &mut PageOutcome,
) {
    let last_modified = page.last_modified().and_then(parse_last_modified);
    persist(ctx, url, classify::UNKNOWN_LANGUAGE, last_modified, page.status, outcome).await;
    save(ctx, url, kind, "", &page.body, outcome).await;
}

async fn persist(
    ctx: &CrawlContext,
    url: &Url,
    language: &str,
    last_modified: Option<chrono::DateTime<chrono::Utc>>,
    status: u16,
    outcome: &mut PageOutcome,
) {
    match ctx.persister.upsert(url, language, last_modified, status).await {
        PersistOutcome::Created | PersistOutcome::Updated => outcome.persisted = true,
        PersistOutcome::Failed => outcome.failed = true,
        PersistOutcome::Skipped => {}
    }
}

async fn save(
    ctx: &CrawlContext,
    url: &Url,
    kind: DocumentKind,
    markup: &str,
    body: &[u8],
    outcome: &mut PageOutcome,
) {
    let Some(file_kind) = save_target(url, kind, markup) else {
        debug!(url = %url, "Content not saved");
        return;
    };
    match ctx.content.save(url, file_kind, body).await {
        Ok(_) => outcome.saved = true,
        Err(e) => {
            error!(url = %url, ext = file_kind.extension(), error = %e, "Failed to save file");
            outcome.failed = true;
        }
    }
}
