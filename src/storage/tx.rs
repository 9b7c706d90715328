//! Transaction context threaded through upserts.
//!
//! A [`TxContext`] either owns a transaction (it opened it and is the only one
//! allowed to commit or roll it back) or has joined a transaction owned by a
//! caller further up. Upserts take `Option<&mut TxContext>`: `None` opens an
//! owning context for the duration of the call, `Some` joins the given one.

use sqlx::{Sqlite, SqliteConnection, Transaction};

use super::schema::Database;
use super::types::DatabaseError;

/// Who is responsible for finishing the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOwnership {
    /// This context opened the transaction and must commit or roll it back.
    Owner,
    /// This context borrows a transaction owned by a parent call.
    Joined,
}

enum TxInner<'c> {
    Owned(Transaction<'static, Sqlite>),
    Joined(&'c mut SqliteConnection),
}

/// An open transaction plus the ownership tag of whoever holds this handle.
pub struct TxContext<'c> {
    inner: TxInner<'c>,
}

impl TxContext<'static> {
    pub(crate) async fn begin(db: &Database) -> Result<Self, DatabaseError> {
        // IMMEDIATE takes the write lock up front. A deferred transaction that
        // reads first cannot wait on busy_timeout when it later upgrades.
        let tx = db.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Self {
            inner: TxInner::Owned(tx),
        })
    }
}

impl<'c> TxContext<'c> {
    pub fn ownership(&self) -> TxOwnership {
        match self.inner {
            TxInner::Owned(_) => TxOwnership::Owner,
            TxInner::Joined(_) => TxOwnership::Joined,
        }
    }

    pub fn owns_transaction(&self) -> bool {
        self.ownership() == TxOwnership::Owner
    }

    /// A non-owning handle on the same transaction for a nested call.
    pub fn join(&mut self) -> TxContext<'_> {
        TxContext {
            inner: TxInner::Joined(self.conn()),
        }
    }

    pub(crate) fn conn(&mut self) -> &mut SqliteConnection {
        match &mut self.inner {
            TxInner::Owned(tx) => &mut **tx,
            TxInner::Joined(conn) => &mut **conn,
        }
    }

    /// Commit if this context owns the transaction. A joined context leaves
    /// that to its owner.
    pub async fn commit(self) -> Result<(), DatabaseError> {
        match self.inner {
            TxInner::Owned(tx) => {
                tx.commit().await?;
                Ok(())
            }
            TxInner::Joined(_) => Ok(()),
        }
    }

    /// Roll back if this context owns the transaction.
    pub async fn rollback(self) -> Result<(), DatabaseError> {
        match self.inner {
            TxInner::Owned(tx) => {
                tx.rollback().await?;
                Ok(())
            }
            TxInner::Joined(_) => Ok(()),
        }
    }

    /// Commit on success, roll back on failure, and hand `result` back.
    ///
    /// A failed rollback is logged; the original error is what the caller sees.
    pub(crate) async fn finish<T>(
        self,
        result: Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl Database {
    /// Open a transaction that the caller owns.
    ///
    /// Pass it to [`Database::upsert_entry`] or [`Database::upsert_enclosure`]
    /// to group several writes, then [`TxContext::commit`] it. Dropping it
    /// uncommitted rolls everything back.
    ///
    /// The transaction holds the database write lock until it finishes, so
    /// other writers wait (up to the busy timeout) behind it.
    ///
    /// Ids assigned by upserts inside this transaction are written onto the
    /// values straight away. If the transaction is then rolled back, those
    /// values still carry ids for rows that no longer exist; clear them (or
    /// discard the values) before upserting them again.
    pub async fn begin(&self) -> Result<TxContext<'static>, DatabaseError> {
        TxContext::begin(self).await
    }
}
