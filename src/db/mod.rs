//! Metadata store: one `link_metadata` row per normalized URL, plus the crawl schedule.
//!
//! Every write is an atomic insert-or-update keyed by URL inside its own transaction,
//! so concurrent writers to the same URL serialize at the store.

mod postgres;
mod sqlite;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;
use crate::parser::StructuredDocument;
use crate::settings::{Settings, StoreBackend};

/// Stored crawl and parse state of one URL.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub id: i64,
    pub url: String,
    pub language: Option<String>,
    pub last_modified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
    pub status_code: Option<i32>,
    pub parsed_at: Option<DateTime<Utc>>,
    pub parsed_data: Option<StructuredDocument>,
}

/// Fields written by the crawl for a fetched page.
#[derive(Debug, Clone)]
pub struct PageMetadata {
    pub url: String,
    pub language: String,
    pub last_modified_at: Option<DateTime<Utc>>,
    pub status_code: i32,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub scraped_at: Option<DateTime<Utc>>,
    pub interval_secs: i64,
    pub is_active: bool,
}

impl ScheduleEntry {
    /// `None` when the stored interval is out of range for a duration.
    pub fn interval(&self) -> Option<Duration> {
        Duration::try_seconds(self.interval_secs)
    }
}

/// Schedule row as registered from the CLI.
#[derive(Debug, Clone)]
pub struct NewScheduleEntry {
    pub title: String,
    pub url: String,
    pub interval_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub pages: i64,
    pub parsed_pages: i64,
    pub schedule_entries: i64,
    pub active_entries: i64,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create tables and indexes if they do not exist yet.
    async fn init_schema(&self) -> Result<(), StoreError>;

    /// All active schedule entries, in no particular order.
    async fn active_schedule(&self) -> Result<Vec<ScheduleEntry>, StoreError>;

    async fn list_schedule(&self) -> Result<Vec<ScheduleEntry>, StoreError>;

    async fn add_schedule_entry(&self, entry: &NewScheduleEntry)
        -> Result<UpsertOutcome, StoreError>;

    async fn mark_scraped(&self, entry_id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Overwrite language, last-modified, status and scraped timestamp, creating the row if absent.
    async fn upsert_page_metadata(&self, meta: &PageMetadata)
        -> Result<UpsertOutcome, StoreError>;

    /// Store the structured document. A row created here gets status 200; an existing
    /// row keeps its status unless it was never set.
    async fn upsert_parsed_document(
        &self,
        url: &str,
        document: &StructuredDocument,
        parsed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn get_page(&self, url: &str) -> Result<Option<PageRecord>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Open the configured backend and make sure its schema exists.
pub async fn connect(settings: &Settings) -> Result<Arc<dyn MetadataStore>, StoreError> {
    let store: Arc<dyn MetadataStore> = match settings.store_backend {
        StoreBackend::Postgres => {
            let max_connections = settings.concurrent_requests_per_domain.max(1) as u32;
            Arc::new(PgStore::connect(&settings.postgres_url(), max_connections).await?)
        }
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&settings.sqlite_path)?),
    };
    store.init_schema().await?;
    Ok(store)
}
