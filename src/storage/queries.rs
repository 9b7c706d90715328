use url::Url;

use super::schema::Database;
use super::types::{DatabaseError, EntryRow, RowCounts, SourceRow};
use crate::model::{Entry, Source};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of entries returned for one source (OOM protection)
const MAX_ENTRIES: i64 = 2000;

const SOURCE_COLUMNS: &str =
    "id, title, description, link, fetch_url, language, ttl, etag, last_modified";

/// Entry columns with the entry's most recent enclosure left-joined in.
const ENTRY_SELECT: &str = r#"
    SELECT e.id, e.source_id, e.guid, e.title, e.description, e.link, e.author,
           e.pub_date, e.read, e.starred,
           n.id AS enclosure_id,
           n.mime_type AS enclosure_mime_type,
           n.url AS enclosure_url,
           n.length AS enclosure_length,
           n.file_path AS enclosure_file_path
    FROM entries e
    LEFT JOIN enclosures n
        ON n.id = (SELECT MAX(id) FROM enclosures WHERE entry_id = e.id)
"#;

impl Database {
    // ========================================================================
    // Source Queries
    // ========================================================================

    /// Look up a stored source by its natural key. Entries are not loaded.
    pub async fn get_source_by_url(&self, url: &Url) -> Result<Option<Source>, DatabaseError> {
        let row: Option<SourceRow> =
            sqlx::query_as(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE fetch_url = ?"))
                .bind(url.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.map(SourceRow::into_source).transpose()
    }

    pub async fn get_source(&self, id: i64) -> Result<Option<Source>, DatabaseError> {
        let row: Option<SourceRow> =
            sqlx::query_as(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(SourceRow::into_source).transpose()
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let rows: Vec<SourceRow> =
            sqlx::query_as(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(SourceRow::into_source).collect()
    }

    // ========================================================================
    // Entry Queries
    // ========================================================================

    /// Entries of a source, newest first, each with its enclosure if any.
    ///
    /// Capped at 2000 rows.
    pub async fn get_entries_for_source(&self, source_id: i64) -> Result<Vec<Entry>, DatabaseError> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "{ENTRY_SELECT} WHERE e.source_id = ? ORDER BY e.pub_date DESC, e.id DESC LIMIT ?"
        ))
        .bind(source_id)
        .bind(MAX_ENTRIES)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EntryRow::into_entry).collect())
    }

    pub async fn get_entry_by_guid(&self, guid: &str) -> Result<Option<Entry>, DatabaseError> {
        let row: Option<EntryRow> = sqlx::query_as(&format!("{ENTRY_SELECT} WHERE e.guid = ?"))
            .bind(guid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EntryRow::into_entry))
    }

    pub async fn row_counts(&self) -> Result<RowCounts, DatabaseError> {
        let (sources, entries, enclosures): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM sources),
                (SELECT COUNT(*) FROM entries),
                (SELECT COUNT(*) FROM enclosures)
        "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(RowCounts {
            sources,
            entries,
            enclosures,
        })
    }

    // ========================================================================
    // User State
    // ========================================================================

    /// Set the read flag of an entry. Returns false if no such entry exists.
    pub async fn set_entry_read(&self, entry_id: i64, read: bool) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE entries SET read = ? WHERE id = ?")
            .bind(read)
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_entry_starred(
        &self,
        entry_id: i64,
        starred: bool,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE entries SET starred = ? WHERE id = ?")
            .bind(starred)
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record where an enclosure was downloaded to, or clear it with `None`.
    pub async fn set_enclosure_file_path(
        &self,
        enclosure_id: i64,
        file_path: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE enclosures SET file_path = ? WHERE id = ?")
            .bind(file_path)
            .bind(enclosure_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
