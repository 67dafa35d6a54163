use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use super::{
    MetadataStore, NewScheduleEntry, PageMetadata, PageRecord, ScheduleEntry, StoreStats,
    UpsertOutcome,
};
use crate::error::StoreError;
use crate::parser::StructuredDocument;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS link_metadata (
        id               INTEGER PRIMARY KEY,
        url              TEXT NOT NULL UNIQUE,
        language         TEXT,
        last_modified_at TEXT,
        created_at       TEXT NOT NULL,
        scraped_at       TEXT NOT NULL,
        status_code      INTEGER,
        parsed_at        TEXT,
        parsed_data      TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_link_metadata_parsed ON link_metadata(parsed_at);

    CREATE TABLE IF NOT EXISTS scraping_schedule (
        id                     INTEGER PRIMARY KEY,
        title                  TEXT NOT NULL,
        url                    TEXT NOT NULL UNIQUE,
        scraped_at             TEXT,
        scraping_interval_secs INTEGER NOT NULL,
        is_active              BOOLEAN NOT NULL DEFAULT 1
    );
    CREATE INDEX IF NOT EXISTS idx_schedule_active ON scraping_schedule(is_active);
";

const SCHEDULE_COLUMNS: &str = "id, title, url, scraped_at, scraping_interval_secs, is_active";
const PAGE_COLUMNS: &str = "id, url, language, last_modified_at, created_at, scraped_at,
                            status_code, parsed_at, parsed_data";

/// Single-file SQLite store for local runs and tests.
///
/// The connection sits behind a mutex that is only taken on the blocking pool, so
/// page tasks waiting for the store never stall a runtime worker.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.display(), "Opened SQLite metadata store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite worker failed: {e}")))?
    }

    async fn fetch_schedule(&self, only_active: bool) -> Result<Vec<ScheduleEntry>, StoreError> {
        self.with_conn(move |conn| {
            let sql = if only_active {
                format!("SELECT {SCHEDULE_COLUMNS} FROM scraping_schedule WHERE is_active = 1 ORDER BY id")
            } else {
                format!("SELECT {SCHEDULE_COLUMNS} FROM scraping_schedule ORDER BY id")
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], schedule_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

fn schedule_from_row(row: &Row) -> rusqlite::Result<ScheduleEntry> {
    Ok(ScheduleEntry {
        id: row.get(0)?,
        title: row.get(1)?,
        url: row.get(2)?,
        scraped_at: row.get(3)?,
        interval_secs: row.get(4)?,
        is_active: row.get(5)?,
    })
}

fn page_from_row(row: &Row) -> rusqlite::Result<(PageRecord, Option<String>)> {
    let record = PageRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        language: row.get(2)?,
        last_modified_at: row.get(3)?,
        created_at: row.get(4)?,
        scraped_at: row.get(5)?,
        status_code: row.get(6)?,
        parsed_at: row.get(7)?,
        parsed_data: None,
    };
    Ok((record, row.get(8)?))
}

fn url_exists(conn: &Connection, table: &str, url: &str) -> rusqlite::Result<bool> {
    let sql = format!("SELECT 1 FROM {table} WHERE url = ?1");
    Ok(conn
        .query_row(&sql, [url], |_| Ok(()))
        .optional()?
        .is_some())
}

fn outcome(existed: bool) -> UpsertOutcome {
    if existed {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Created
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| Ok(conn.execute_batch(SCHEMA)?)).await
    }

    async fn active_schedule(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        self.fetch_schedule(true).await
    }

    async fn list_schedule(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        self.fetch_schedule(false).await
    }

    async fn add_schedule_entry(
        &self,
        entry: &NewScheduleEntry,
    ) -> Result<UpsertOutcome, StoreError> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existed = url_exists(&tx, "scraping_schedule", &entry.url)?;
            tx.execute(
                "INSERT INTO scraping_schedule (title, url, scraping_interval_secs, is_active)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(url) DO UPDATE SET
                    title = excluded.title,
                    scraping_interval_secs = excluded.scraping_interval_secs,
                    is_active = 1",
                params![entry.title, entry.url, entry.interval_secs],
            )?;
            tx.commit()?;
            Ok(outcome(existed))
        })
        .await
    }

    async fn mark_scraped(&self, entry_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE scraping_schedule SET scraped_at = ?1 WHERE id = ?2",
                params![at, entry_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn upsert_page_metadata(
        &self,
        meta: &PageMetadata,
    ) -> Result<UpsertOutcome, StoreError> {
        let meta = meta.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existed = url_exists(&tx, "link_metadata", &meta.url)?;
            tx.execute(
                "INSERT INTO link_metadata
                    (url, language, last_modified_at, status_code, scraped_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(url) DO UPDATE SET
                    language = excluded.language,
                    last_modified_at = excluded.last_modified_at,
                    status_code = excluded.status_code,
                    scraped_at = excluded.scraped_at",
                params![
                    meta.url,
                    meta.language,
                    meta.last_modified_at,
                    meta.status_code,
                    meta.scraped_at,
                ],
            )?;
            tx.commit()?;
            Ok(outcome(existed))
        })
        .await
    }

    async fn upsert_parsed_document(
        &self,
        url: &str,
        document: &StructuredDocument,
        parsed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let json = serde_json::to_string(document)?;
        let url = url.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existed = url_exists(&tx, "link_metadata", &url)?;
            tx.execute(
                "INSERT INTO link_metadata
                    (url, parsed_at, parsed_data, status_code, scraped_at, created_at)
                 VALUES (?1, ?2, ?3, 200, ?2, ?2)
                 ON CONFLICT(url) DO UPDATE SET
                    parsed_at = excluded.parsed_at,
                    parsed_data = excluded.parsed_data,
                    status_code = COALESCE(link_metadata.status_code, 200)",
                params![url, parsed_at, json],
            )?;
            tx.commit()?;
            Ok(outcome(existed))
        })
        .await
    }

    async fn get_page(&self, url: &str) -> Result<Option<PageRecord>, StoreError> {
        let url = url.to_string();
        let found = self
            .with_conn(move |conn| {
                let sql = format!("SELECT {PAGE_COLUMNS} FROM link_metadata WHERE url = ?1");
                Ok(conn.query_row(&sql, [url], page_from_row).optional()?)
            })
            .await?;
        let Some((mut record, raw)) = found else {
            return Ok(None);
        };
        record.parsed_data = raw.as_deref().map(serde_json::from_str).transpose()?;
        Ok(Some(record))
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
            Ok(StoreStats {
                pages: count("SELECT COUNT(*) FROM link_metadata")?,
                parsed_pages: count("SELECT COUNT(*) FROM link_metadata WHERE parsed_at IS NOT NULL")?,
                schedule_entries: count("SELECT COUNT(*) FROM scraping_schedule")?,
                active_entries: count("SELECT COUNT(*) FROM scraping_schedule WHERE is_active = 1")?,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Section;

    async fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.init_schema().await.unwrap();
        store
    }

    fn meta(url: &str, language: &str, status_code: i32) -> PageMetadata {
        PageMetadata {
            url: url.to_string(),
            language: language.to_string(),
            last_modified_at: None,
            status_code,
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn init_schema_is_idempotent() {
        let store = store().await;
        store.init_schema().await.unwrap();
        assert_eq!(store.stats().await.unwrap().pages, 0);
    }

    #[tokio::test]
    async fn second_upsert_updates_the_same_record() {
        let store = store().await;
        let url = "https://example.ee/about";

        let first = store.upsert_page_metadata(&meta(url, "et", 200)).await.unwrap();
        assert_eq!(first, UpsertOutcome::Created);
        let created = store.get_page(url).await.unwrap().unwrap();

        let second = store
            .upsert_page_metadata(&meta(url, "unknown", 301))
            .await
            .unwrap();
        assert_eq!(second, UpsertOutcome::Updated);

        let page = store.get_page(url).await.unwrap().unwrap();
        assert_eq!(page.id, created.id);
        assert_eq!(page.created_at, created.created_at);
        assert_eq!(page.language.as_deref(), Some("unknown"));
        assert_eq!(page.status_code, Some(301));
        assert_eq!(store.stats().await.unwrap().pages, 1);
    }

    #[tokio::test]
    async fn parsed_document_defaults_status_and_keeps_existing() {
        let store = store().await;
        let doc = StructuredDocument {
            url: "https://example.ee/a".into(),
            content: vec![Section {
                header: "Pealkiri".into(),
                paragraphs: vec!["Tekst".into()],
            }],
            ..Default::default()
        };

        let created = store
            .upsert_parsed_document("https://example.ee/a", &doc, Utc::now())
            .await
            .unwrap();
        assert_eq!(created, UpsertOutcome::Created);
        let page = store.get_page("https://example.ee/a").await.unwrap().unwrap();
        assert_eq!(page.status_code, Some(200));
        assert_eq!(page.parsed_data.as_ref().unwrap().content, doc.content);
        assert!(page.parsed_at.is_some());

        store
            .upsert_page_metadata(&meta("https://example.ee/b", "et", 404))
            .await
            .unwrap();
        let updated = store
            .upsert_parsed_document("https://example.ee/b", &doc, Utc::now())
            .await
            .unwrap();
        assert_eq!(updated, UpsertOutcome::Updated);
        let page = store.get_page("https://example.ee/b").await.unwrap().unwrap();
        assert_eq!(page.status_code, Some(404));
        assert_eq!(page.language.as_deref(), Some("et"));
    }

    #[tokio::test]
    async fn schedule_entries_are_unique_by_url() {
        let store = store().await;
        let entry = NewScheduleEntry {
            title: "Example".into(),
            url: "https://example.ee".into(),
            interval_secs: 3600,
        };
        assert_eq!(
            store.add_schedule_entry(&entry).await.unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            store.add_schedule_entry(&entry).await.unwrap(),
            UpsertOutcome::Updated
        );

        let entries = store.active_schedule().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].scraped_at.is_none());

        let now = Utc::now();
        store.mark_scraped(entries[0].id, now).await.unwrap();
        let entries = store.list_schedule().await.unwrap();
        assert_eq!(entries[0].scraped_at, Some(now));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_page_tasks_share_the_store() {
        let store = Arc::new(store().await);
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                let url = format!("https://example.ee/leht/{}", i % 8);
                store.upsert_page_metadata(&meta(&url, "et", 200)).await
            });
        }

        let mut created = 0;
        while let Some(joined) = tasks.join_next().await {
            if joined.unwrap().unwrap() == UpsertOutcome::Created {
                created += 1;
            }
        }
        assert_eq!(created, 8);
        assert_eq!(store.stats().await.unwrap().pages, 8);
    }

    #[tokio::test]
    async fn unopenable_path_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = SqliteStore::open(dir.path()).err().unwrap();
        assert!(err.is_unavailable());
    }
}
