//! Which registered site to crawl next, and the loop that works through them.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::crawl::{CrawlSummary, Crawler};
use crate::db::{MetadataStore, ScheduleEntry};
use crate::error::StoreError;

/// Never scraped, or the interval has fully elapsed since the last scrape.
/// An interval too large to add to the timestamp never elapses.
pub fn is_due(entry: &ScheduleEntry, now: DateTime<Utc>) -> bool {
    match entry.scraped_at {
        None => true,
        Some(at) => entry
            .interval()
            .and_then(|interval| at.checked_add_signed(interval))
            .is_some_and(|next| next < now),
    }
}

/// Best due candidate among active entries: never-scraped first, then the stalest.
/// Ties keep store order.
pub fn select_next(entries: &[ScheduleEntry], now: DateTime<Utc>) -> Option<&ScheduleEntry> {
    entries
        .iter()
        .filter(|e| e.is_active && is_due(e, now))
        // None < Some(_), so never-scraped entries sort first
        .min_by_key(|e| e.scraped_at)
}

pub async fn next_due(store: &dyn MetadataStore) -> Result<Option<ScheduleEntry>, StoreError> {
    let entries = store.active_schedule().await?;
    Ok(select_next(&entries, Utc::now()).cloned())
}

/// Stamp the entry as scraped now, whatever the crawl outcome was.
pub async fn mark_scraped(store: &dyn MetadataStore, entry: &ScheduleEntry) -> Result<(), StoreError> {
    let now = Utc::now();
    store.mark_scraped(entry.id, now).await?;
    info!(url = %entry.url, scraped_at = %now, "Marked schedule entry scraped");
    Ok(())
}

/// One pass of the loop: the entry crawled and its summary, `None` when the
/// start URL was unusable.
#[derive(Debug, Clone)]
pub struct SiteRun {
    pub entry: ScheduleEntry,
    pub summary: Option<CrawlSummary>,
}

/// Select the next due site, crawl it to completion, stamp it, repeat until nothing
/// is due (or after one site with `once`). Crawl failures are logged and the entry
/// is stamped anyway; a store failure ends the loop with an error.
pub async fn run_due(store: &dyn MetadataStore, crawler: &Crawler, once: bool) -> Result<Vec<SiteRun>, StoreError> {
    let mut runs = Vec::new();
    while let Some(entry) = next_due(store).await? {
        info!(title = %entry.title, url = %entry.url, "Crawling scheduled site");
        let summary = match crawler.run(&entry.url).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(url = %entry.url, error = %e, "Skipping scheduled site");
                None
            }
        };

        mark_scraped(store, &entry).await?;
        runs.push(SiteRun { entry, summary });
        if once {
            break;
        }
    }
    Ok(runs)
}

pub fn due_count(entries: &[ScheduleEntry], now: DateTime<Utc>) -> usize {
    entries.iter().filter(|e| e.is_active && is_due(e, now)).count()
}
