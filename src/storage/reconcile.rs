//! Natural-key upserts of the source -> entry -> enclosure hierarchy.
//!
//! Every upsert follows the same steps:
//!
//! 1. Resolve an existing row by storage id OR natural key.
//! 2. INSERT if none was found, otherwise UPDATE every column of that row.
//! 3. Re-resolve the storage id by natural key and write it back onto the value.
//!
//! The INSERT carries `ON CONFLICT(<natural key>) DO UPDATE`, so a concurrent
//! writer that inserted the same key between steps 1 and 2 turns this insert
//! into an update instead of a duplicate.
//!
//! With `cascade`, children are written inside the parent's transaction. Any
//! failure rolls back the whole tree, and the storage ids on the in-memory
//! values are put back to what they were before the call.

use std::ops::AddAssign;

use super::schema::Database;
use super::tx::TxContext;
use super::types::{to_timestamp, DatabaseError};
use crate::model::{Enclosure, Entry, Source};

/// Rows written by one upsert call, children included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
}

impl AddAssign for UpsertStats {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

impl UpsertStats {
    fn record(found: bool) -> Self {
        if found {
            Self {
                inserted: 0,
                updated: 1,
            }
        } else {
            Self {
                inserted: 1,
                updated: 0,
            }
        }
    }
}

impl Database {
    /// Insert or update a source, and with `cascade` its entries and their
    /// enclosures, in one transaction.
    ///
    /// On success `source.id` and every child's id and parent id reflect the
    /// stored rows. On failure nothing is persisted.
    ///
    /// # Errors
    ///
    /// - [`DatabaseError::Constraint`] if a write collides with another row's natural key
    /// - [`DatabaseError::Locked`] if the write lock could not be acquired
    pub async fn upsert_source(
        &self,
        source: &mut Source,
        cascade: bool,
    ) -> Result<UpsertStats, DatabaseError> {
        let saved = SavedIds::of_source(source);
        let mut ctx = self.begin().await?;
        let result = self.write_source(source, cascade, &mut ctx).await;
        let result = ctx.finish(result).await;
        if result.is_err() {
            saved.restore_source(source);
        }
        result
    }

    /// Insert or update an entry, and with `cascade` its enclosure.
    ///
    /// `entry.source_id` must be set. With `tx: None` the call runs in its own
    /// transaction; with `Some` it joins the caller's and never commits it.
    ///
    /// A failed joined call restores the ids it touched. Ids from a joined
    /// call that succeeded stay on the entry even if the caller later rolls
    /// back (see [`Database::begin`]).
    pub async fn upsert_entry(
        &self,
        entry: &mut Entry,
        cascade: bool,
        tx: Option<&mut TxContext<'_>>,
    ) -> Result<UpsertStats, DatabaseError> {
        let saved = SavedIds::of_entry(entry);
        match tx {
            Some(parent) => {
                let mut joined = parent.join();
                let result = self.write_entry(entry, cascade, &mut joined).await;
                if result.is_err() {
                    saved.restore_entry(entry);
                }
                result
            }
            None => {
                let mut ctx = self.begin().await?;
                let result = self.write_entry(entry, cascade, &mut ctx).await;
                let result = ctx.finish(result).await;
                if result.is_err() {
                    saved.restore_entry(entry);
                }
                result
            }
        }
    }

    /// Insert or update an enclosure. `enclosure.entry_id` must be set.
    ///
    /// Ids are handled like [`Database::upsert_entry`] on both paths.
    pub async fn upsert_enclosure(
        &self,
        enclosure: &mut Enclosure,
        tx: Option<&mut TxContext<'_>>,
    ) -> Result<UpsertStats, DatabaseError> {
        let saved = (enclosure.id, enclosure.entry_id);
        match tx {
            Some(parent) => {
                let mut joined = parent.join();
                let result = self.write_enclosure(enclosure, &mut joined).await;
                if result.is_err() {
                    (enclosure.id, enclosure.entry_id) = saved;
                }
                result
            }
            None => {
                let mut ctx = self.begin().await?;
                let result = self.write_enclosure(enclosure, &mut ctx).await;
                let result = ctx.finish(result).await;
                if result.is_err() {
                    (enclosure.id, enclosure.entry_id) = saved;
                }
                result
            }
        }
    }

    async fn write_source(
        &self,
        source: &mut Source,
        cascade: bool,
        ctx: &mut TxContext<'_>,
    ) -> Result<UpsertStats, DatabaseError> {
        let fetch_url = source.fetch_url.as_str().to_owned();

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM sources WHERE id = ? OR fetch_url = ? ORDER BY id = ? DESC LIMIT 1",
        )
        .bind(source.id)
        .bind(&fetch_url)
        .bind(source.id)
        .fetch_optional(ctx.conn())
        .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO sources (title, description, link, fetch_url, language, ttl, etag, last_modified)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(fetch_url) DO UPDATE SET
                        title = excluded.title,
                        description = excluded.description,
                        link = excluded.link,
                        language = excluded.language,
                        ttl = excluded.ttl,
                        etag = excluded.etag,
                        last_modified = excluded.last_modified
                "#,
                )
                .bind(&source.title)
                .bind(&source.description)
                .bind(&source.link)
                .bind(&fetch_url)
                .bind(&source.language)
                .bind(source.effective_ttl())
                .bind(&source.etag)
                .bind(to_timestamp(source.last_modified))
                .execute(ctx.conn())
                .await?;
            }
            Some((id,)) => {
                source.id = Some(id);
                sqlx::query(
                    r#"
                    UPDATE sources SET
                        title = ?, description = ?, link = ?, fetch_url = ?,
                        language = ?, ttl = ?, etag = ?, last_modified = ?
                    WHERE id = ?
                "#,
                )
                .bind(&source.title)
                .bind(&source.description)
                .bind(&source.link)
                .bind(&fetch_url)
                .bind(&source.language)
                .bind(source.effective_ttl())
                .bind(&source.etag)
                .bind(to_timestamp(source.last_modified))
                .bind(id)
                .execute(ctx.conn())
                .await?;
            }
        }

        // The insert path does not hand back the id
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM sources WHERE fetch_url = ?")
            .bind(&fetch_url)
            .fetch_optional(ctx.conn())
            .await?
            .ok_or_else(|| DatabaseError::Unresolved {
                table: "sources",
                key: fetch_url.clone(),
            })?;
        source.id = Some(id);

        let mut stats = UpsertStats::record(existing.is_some());
        tracing::trace!(source_id = id, url = %fetch_url, found = existing.is_some(), "Wrote source");

        if cascade {
            for entry in &mut source.entries {
                entry.source_id = Some(id);
                stats += self.upsert_entry(entry, true, Some(&mut *ctx)).await?;
            }
        }

        Ok(stats)
    }

    async fn write_entry(
        &self,
        entry: &mut Entry,
        cascade: bool,
        ctx: &mut TxContext<'_>,
    ) -> Result<UpsertStats, DatabaseError> {
        let source_id = entry.source_id.ok_or(DatabaseError::MissingParent("entry"))?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM entries WHERE id = ? OR guid = ? ORDER BY id = ? DESC LIMIT 1",
        )
        .bind(entry.id)
        .bind(&entry.guid)
        .bind(entry.id)
        .fetch_optional(ctx.conn())
        .await?;

        let published = to_timestamp(entry.published);
        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO entries (source_id, guid, title, description, link, author, pub_date, read, starred)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(guid) DO UPDATE SET
                        source_id = excluded.source_id,
                        title = excluded.title,
                        description = excluded.description,
                        link = excluded.link,
                        author = excluded.author,
                        pub_date = excluded.pub_date,
                        read = excluded.read,
                        starred = excluded.starred
                "#,
                )
                .bind(source_id)
                .bind(&entry.guid)
                .bind(&entry.title)
                .bind(&entry.description)
                .bind(&entry.link)
                .bind(&entry.author)
                .bind(published)
                .bind(entry.read)
                .bind(entry.starred)
                .execute(ctx.conn())
                .await?;
            }
            Some((id,)) => {
                entry.id = Some(id);
                sqlx::query(
                    r#"
                    UPDATE entries SET
                        source_id = ?, guid = ?, title = ?, description = ?, link = ?,
                        author = ?, pub_date = ?, read = ?, starred = ?
                    WHERE id = ?
                "#,
                )
                .bind(source_id)
                .bind(&entry.guid)
                .bind(&entry.title)
                .bind(&entry.description)
                .bind(&entry.link)
                .bind(&entry.author)
                .bind(published)
                .bind(entry.read)
                .bind(entry.starred)
                .bind(id)
                .execute(ctx.conn())
                .await?;
            }
        }

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM entries WHERE guid = ?")
            .bind(&entry.guid)
            .fetch_optional(ctx.conn())
            .await?
            .ok_or_else(|| DatabaseError::Unresolved {
                table: "entries",
                key: entry.guid.clone(),
            })?;
        entry.id = Some(id);

        let mut stats = UpsertStats::record(existing.is_some());

        if cascade {
            if let Some(enclosure) = entry.enclosure.as_mut() {
                enclosure.entry_id = Some(id);
                stats += self.upsert_enclosure(enclosure, Some(&mut *ctx)).await?;
            }
        }

        Ok(stats)
    }

    async fn write_enclosure(
        &self,
        enclosure: &mut Enclosure,
        ctx: &mut TxContext<'_>,
    ) -> Result<UpsertStats, DatabaseError> {
        let entry_id = enclosure
            .entry_id
            .ok_or(DatabaseError::MissingParent("enclosure"))?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM enclosures WHERE id = ? OR url = ? ORDER BY id = ? DESC LIMIT 1",
        )
        .bind(enclosure.id)
        .bind(&enclosure.url)
        .bind(enclosure.id)
        .fetch_optional(ctx.conn())
        .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO enclosures (entry_id, mime_type, url, length, file_path)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(url) DO UPDATE SET
                        entry_id = excluded.entry_id,
                        mime_type = excluded.mime_type,
                        length = excluded.length,
                        file_path = excluded.file_path
                "#,
                )
                .bind(entry_id)
                .bind(&enclosure.mime_type)
                .bind(&enclosure.url)
                .bind(enclosure.length)
                .bind(&enclosure.file_path)
                .execute(ctx.conn())
                .await?;
            }
            Some((id,)) => {
                enclosure.id = Some(id);
                sqlx::query(
                    r#"
                    UPDATE enclosures SET
                        entry_id = ?, mime_type = ?, url = ?, length = ?, file_path = ?
                    WHERE id = ?
                "#,
                )
                .bind(entry_id)
                .bind(&enclosure.mime_type)
                .bind(&enclosure.url)
                .bind(enclosure.length)
                .bind(&enclosure.file_path)
                .bind(id)
                .execute(ctx.conn())
                .await?;
            }
        }

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM enclosures WHERE url = ?")
            .bind(&enclosure.url)
            .fetch_optional(ctx.conn())
            .await?
            .ok_or_else(|| DatabaseError::Unresolved {
                table: "enclosures",
                key: enclosure.url.clone(),
            })?;
        enclosure.id = Some(id);

        Ok(UpsertStats::record(existing.is_some()))
    }
}

/// Storage ids of a record tree, in traversal order.
struct SavedIds(Vec<Option<i64>>);

impl SavedIds {
    fn of_source(source: &Source) -> Self {
        let mut ids = vec![source.id];
        for entry in &source.entries {
            Self::push_entry(&mut ids, entry);
        }
        Self(ids)
    }

    fn of_entry(entry: &Entry) -> Self {
        let mut ids = Vec::new();
        Self::push_entry(&mut ids, entry);
        Self(ids)
    }

    fn push_entry(ids: &mut Vec<Option<i64>>, entry: &Entry) {
        ids.extend([entry.id, entry.source_id]);
        if let Some(enclosure) = &entry.enclosure {
            ids.extend([enclosure.id, enclosure.entry_id]);
        }
    }

    fn restore_source(self, source: &mut Source) {
        let mut ids = self.0.into_iter();
        source.id = ids.next().flatten();
        for entry in &mut source.entries {
            Self::pop_entry(&mut ids, entry);
        }
    }

    fn restore_entry(self, entry: &mut Entry) {
        Self::pop_entry(&mut self.0.into_iter(), entry);
    }

    fn pop_entry(ids: &mut impl Iterator<Item = Option<i64>>, entry: &mut Entry) {
        entry.id = ids.next().flatten();
        entry.source_id = ids.next().flatten();
        if let Some(enclosure) = entry.enclosure.as_mut() {
            enclosure.id = ids.next().flatten();
            enclosure.entry_id = ids.next().flatten();
        }
    }
}
