use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

use super::{
    MetadataStore, NewScheduleEntry, PageMetadata, PageRecord, ScheduleEntry, StoreStats,
    UpsertOutcome,
};
use crate::error::StoreError;
use crate::parser::StructuredDocument;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS link_metadata (
        id               BIGSERIAL PRIMARY KEY,
        url              TEXT NOT NULL UNIQUE,
        language         TEXT,
        last_modified_at TIMESTAMPTZ,
        created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
        scraped_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
        status_code      INTEGER,
        parsed_at        TIMESTAMPTZ,
        parsed_data      JSONB
    )",
    "CREATE INDEX IF NOT EXISTS idx_link_metadata_parsed ON link_metadata(parsed_at)",
    "CREATE TABLE IF NOT EXISTS scraping_schedule (
        id                     BIGSERIAL PRIMARY KEY,
        title                  TEXT NOT NULL,
        url                    TEXT NOT NULL UNIQUE,
        scraped_at             TIMESTAMPTZ,
        scraping_interval_secs BIGINT NOT NULL,
        is_active              BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE INDEX IF NOT EXISTS idx_schedule_active ON scraping_schedule(is_active)",
];

const SCHEDULE_COLUMNS: &str = "id, title, url, scraped_at, scraping_interval_secs, is_active";

/// Postgres-backed store over a connection pool; each call runs in its own transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!(max_connections, "Connected to Postgres metadata store");
        Ok(Self { pool })
    }

    fn schedule_from_row(row: &PgRow) -> Result<ScheduleEntry, sqlx::Error> {
        Ok(ScheduleEntry {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            url: row.try_get("url")?,
            scraped_at: row.try_get("scraped_at")?,
            interval_secs: row.try_get("scraping_interval_secs")?,
            is_active: row.try_get("is_active")?,
        })
    }

    fn page_from_row(row: &PgRow) -> Result<PageRecord, sqlx::Error> {
        let parsed: Option<Json<StructuredDocument>> = row.try_get("parsed_data")?;
        Ok(PageRecord {
            id: row.try_get("id")?,
            url: row.try_get("url")?,
            language: row.try_get("language")?,
            last_modified_at: row.try_get("last_modified_at")?,
            created_at: row.try_get("created_at")?,
            scraped_at: row.try_get("scraped_at")?,
            status_code: row.try_get("status_code")?,
            parsed_at: row.try_get("parsed_at")?,
            parsed_data: parsed.map(|Json(doc)| doc),
        })
    }

    async fn fetch_schedule(&self, only_active: bool) -> Result<Vec<ScheduleEntry>, StoreError> {
        let sql = if only_active {
            format!("SELECT {SCHEDULE_COLUMNS} FROM scraping_schedule WHERE is_active ORDER BY id")
        } else {
            format!("SELECT {SCHEDULE_COLUMNS} FROM scraping_schedule ORDER BY id")
        };
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let entries = rows
            .iter()
            .map(Self::schedule_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn outcome(inserted: bool) -> UpsertOutcome {
    if inserted {
        UpsertOutcome::Created
    } else {
        UpsertOutcome::Updated
    }
}

#[async_trait]
impl MetadataStore for PgStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
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
        let mut tx = self.pool.begin().await?;
        let inserted: bool = sqlx::query_scalar(
            "INSERT INTO scraping_schedule (title, url, scraping_interval_secs, is_active)
             VALUES ($1, $2, $3, TRUE)
             ON CONFLICT (url) DO UPDATE SET
                title = EXCLUDED.title,
                scraping_interval_secs = EXCLUDED.scraping_interval_secs,
                is_active = TRUE
             RETURNING (xmax = 0)",
        )
        .bind(&entry.title)
        .bind(&entry.url)
        .bind(entry.interval_secs)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(outcome(inserted))
    }

    async fn mark_scraped(&self, entry_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE scraping_schedule SET scraped_at = $1 WHERE id = $2")
            .bind(at)
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_page_metadata(
        &self,
        meta: &PageMetadata,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted: bool = sqlx::query_scalar(
            "INSERT INTO link_metadata (url, language, last_modified_at, status_code, scraped_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (url) DO UPDATE SET
                language = EXCLUDED.language,
                last_modified_at = EXCLUDED.last_modified_at,
                status_code = EXCLUDED.status_code,
                scraped_at = EXCLUDED.scraped_at
             RETURNING (xmax = 0)",
        )
        .bind(&meta.url)
        .bind(&meta.language)
        .bind(meta.last_modified_at)
        .bind(meta.status_code)
        .bind(meta.scraped_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(outcome(inserted))
    }

    async fn upsert_parsed_document(
        &self,
        url: &str,
        document: &StructuredDocument,
        parsed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted: bool = sqlx::query_scalar(
            "INSERT INTO link_metadata (url, parsed_at, parsed_data, status_code)
             VALUES ($1, $2, $3, 200)
             ON CONFLICT (url) DO UPDATE SET
                parsed_at = EXCLUDED.parsed_at,
                parsed_data = EXCLUDED.parsed_data,
                status_code = COALESCE(link_metadata.status_code, 200)
             RETURNING (xmax = 0)",
        )
        .bind(url)
        .bind(parsed_at)
        .bind(Json(document))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(outcome(inserted))
    }

    async fn get_page(&self, url: &str) -> Result<Option<PageRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, url, language, last_modified_at, created_at, scraped_at,
                    status_code, parsed_at, parsed_data
             FROM link_metadata WHERE url = $1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::page_from_row).transpose()?)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM link_metadata) AS pages,
                (SELECT COUNT(*) FROM link_metadata WHERE parsed_at IS NOT NULL) AS parsed_pages,
                (SELECT COUNT(*) FROM scraping_schedule) AS schedule_entries,
                (SELECT COUNT(*) FROM scraping_schedule WHERE is_active) AS active_entries",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreStats {
            pages: row.try_get("pages")?,
            parsed_pages: row.try_get("parsed_pages")?,
            schedule_entries: row.try_get("schedule_entries")?,
            active_entries: row.try_get("active_entries")?,
        })
    }
}
