use chrono::{DateTime, Utc};
use thiserror::Error;
use url::Url;

use crate::model::{Enclosure, Entry, Source};

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the storage layer.
///
/// A failed upsert leaves the database exactly as it was before the call.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another writer holds the database lock past the busy timeout
    #[error("Database is locked by another writer")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A uniqueness, foreign-key, NOT NULL or CHECK constraint rejected a write
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// A row could not be found by its natural key right after being written
    #[error("No {table} row for {key} after write")]
    Unresolved { table: &'static str, key: String },

    /// A child record was written without its parent's storage id
    #[error("{0} has no parent storage id")]
    MissingParent(&'static str),

    /// A stored value could not be converted back into the model
    #[error("Invalid stored row: {0}")]
    InvalidRow(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[source] sqlx::Error),
}

impl DatabaseError {
    /// Classify a sqlx error into lock, constraint, or other failures.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation()
                || db_err.is_foreign_key_violation()
                || db_err.is_check_violation()
                || matches!(db_err.kind(), sqlx::error::ErrorKind::NotNullViolation)
            {
                return DatabaseError::Constraint(db_err.message().to_string());
            }
        }

        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }

    /// Whether retrying the whole operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Locked)
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        Self::from_sqlx(err)
    }
}

// ============================================================================
// Row Types
// ============================================================================

/// Number of rows per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub sources: i64,
    pub entries: i64,
    pub enclosures: i64,
}

pub(crate) fn to_timestamp(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(|d| d.timestamp())
}

fn from_timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

/// Internal row type for source queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SourceRow {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub link: Option<String>,
    pub fetch_url: String,
    pub language: Option<String>,
    pub ttl: i64,
    pub etag: Option<String>,
    pub last_modified: Option<i64>,
}

impl SourceRow {
    pub(crate) fn into_source(self) -> Result<Source, DatabaseError> {
        let fetch_url = Url::parse(&self.fetch_url)
            .map_err(|e| DatabaseError::InvalidRow(format!("fetch_url {:?}: {e}", self.fetch_url)))?;
        Ok(Source {
            id: Some(self.id),
            title: self.title,
            description: self.description,
            link: self.link,
            fetch_url,
            language: self.language,
            ttl: u32::try_from(self.ttl).ok(),
            etag: self.etag,
            last_modified: from_timestamp(self.last_modified),
            entries: Vec::new(),
        })
    }
}

/// Internal row type for entry queries, with the enclosure left-joined in
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub id: i64,
    pub source_id: i64,
    pub guid: String,
    pub title: String,
    pub description: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub pub_date: Option<i64>,
    pub read: bool,
    pub starred: bool,
    pub enclosure_id: Option<i64>,
    pub enclosure_mime_type: Option<String>,
    pub enclosure_url: Option<String>,
    pub enclosure_length: Option<i64>,
    pub enclosure_file_path: Option<String>,
}

impl EntryRow {
    pub(crate) fn into_entry(self) -> Entry {
        let enclosure = match (self.enclosure_id, self.enclosure_url) {
            (Some(id), Some(url)) => Some(Enclosure {
                id: Some(id),
                entry_id: Some(self.id),
                mime_type: self.enclosure_mime_type.unwrap_or_default(),
                url,
                length: self.enclosure_length.unwrap_or(0),
                file_path: self.enclosure_file_path,
            }),
            _ => None,
        };

        Entry {
            id: Some(self.id),
            source_id: Some(self.source_id),
            guid: self.guid,
            title: self.title,
            description: self.description,
            link: self.link,
            author: self.author,
            published: from_timestamp(self.pub_date),
            read: self.read,
            starred: self.starred,
            enclosure,
        }
    }
}
