use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use url::Url;

use super::classify::UNKNOWN_LANGUAGE;
use crate::db::{MetadataStore, PageMetadata, UpsertOutcome};

/// Languages whose pages are recorded in the metadata store.
const PERSISTED_LANGUAGES: &[&str] = &["et", UNKNOWN_LANGUAGE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Skipped,
    Created,
    Updated,
    Failed,
}

pub fn should_persist_language(language: &str) -> bool {
    PERSISTED_LANGUAGES.contains(&language)
}

/// `Last-Modified` as sent by servers (`Wed, 21 Oct 2015 07:28:00 GMT`).
pub fn parse_last_modified(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Writes page metadata for the crawl. Failures are logged and reported, never raised.
#[derive(Clone)]
pub struct PagePersister {
    store: Arc<dyn MetadataStore>,
}

impl PagePersister {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(
        &self,
        url: &Url,
        language: &str,
        last_modified_at: Option<DateTime<Utc>>,
        status_code: u16,
    ) -> PersistOutcome {
        if !should_persist_language(language) {
            debug!(url = %url, language, "Skipping metadata for language");
            return PersistOutcome::Skipped;
        }

        let meta = PageMetadata {
            url: url.to_string(),
            language: language.to_string(),
            last_modified_at,
            status_code: i32::from(status_code),
            scraped_at: Utc::now(),
        };
        match self.store.upsert_page_metadata(&meta).await {
            Ok(UpsertOutcome::Created) => {
                info!(url = %url, language, status = status_code, "Saved metadata");
                PersistOutcome::Created
            }
            Ok(UpsertOutcome::Updated) => {
                info!(url = %url, language, status = status_code, "Updated metadata");
                PersistOutcome::Updated
            }
            Err(e) => {
                error!(url = %url, error = %e, "Failed to save metadata");
                PersistOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use chrono::TimeZone;

    async fn persister() -> (PagePersister, Arc<dyn MetadataStore>) {
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteStore::in_memory().unwrap());
        store.init_schema().await.unwrap();
        (PagePersister::new(Arc::clone(&store)), store)
    }

    #[test]
    fn language_gate() {
        assert!(should_persist_language("et"));
        assert!(should_persist_language("unknown"));
        assert!(!should_persist_language("en"));
        assert!(!should_persist_language("ru"));
        assert!(!should_persist_language("ET"));
    }

    #[test]
    fn last_modified_header() {
        assert_eq!(
            parse_last_modified("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap())
        );
        assert_eq!(parse_last_modified("yesterday"), None);
    }

    #[tokio::test]
    async fn twice_for_one_url_updates() {
        let (persister, store) = persister().await;
        let url = Url::parse("https://example.ee/about").unwrap();

        assert_eq!(persister.upsert(&url, "et", None, 200).await, PersistOutcome::Created);
        let first = store.get_page(url.as_str()).await.unwrap().unwrap();

        let modified = parse_last_modified("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(
            persister.upsert(&url, "unknown", modified, 404).await,
            PersistOutcome::Updated
        );
        let second = store.get_page(url.as_str()).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.language.as_deref(), Some("unknown"));
        assert_eq!(second.status_code, Some(404));
        assert_eq!(second.last_modified_at, modified);
        assert_eq!(store.stats().await.unwrap().pages, 1);
    }

    #[tokio::test]
    async fn other_languages_are_not_written() {
        let (persister, store) = persister().await;
        let url = Url::parse("https://example.ee/en").unwrap();
        assert_eq!(persister.upsert(&url, "en", None, 200).await, PersistOutcome::Skipped);
        assert!(store.get_page(url.as_str()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_failure_is_reported_not_raised() {
        // no schema: every write fails
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let persister = PagePersister::new(store);
        let url = Url::parse("https://example.ee/").unwrap();
        assert_eq!(persister.upsert(&url, "et", None, 200).await, PersistOutcome::Failed);
    }
}
