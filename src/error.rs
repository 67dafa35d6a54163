//! Error types shared by the crawl and parse pipelines.

use std::time::Duration;

use thiserror::Error;

/// Failure at the metadata store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached. Fatal for the current loop iteration.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A write or read failed inside a transaction. Rolled back, recovered per page.
    #[error("persistence conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_) => StoreError::Unavailable(e.to_string()),
            other => StoreError::Conflict(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::CannotOpen
                    || f.code == rusqlite::ErrorCode::NotADatabase =>
            {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Conflict(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Conflict(format!("parsed data is not valid JSON: {e}"))
    }
}

/// Failure reported by the fetch engine. The link is dropped, never retried here.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("disallowed by robots.txt: {0}")]
    Disallowed(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("render timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// A stored filename that does not map back to a URL.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("filename has no stem: {0}")]
    MissingStem(String),

    #[error("base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decoded name is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("decoded value is not a url: {0}")]
    Url(#[from] url::ParseError),
}
