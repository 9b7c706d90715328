//! Consumers of the scheduler's output streams.
//!
//! [`run_ingest`] reconciles every document into the database with a full
//! cascade. [`drain_errors`] keeps the error stream flowing so watchers never
//! fill it up for long.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::feed::WatchError;
use crate::model::Source;
use crate::storage::{Database, DatabaseError, UpsertStats};

/// Delay before the single retry of a document that hit a locked database
const LOCKED_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Totals for one ingest run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Documents reconciled successfully
    pub documents: usize,
    /// Documents whose reconciliation failed and was rolled back
    pub failed: usize,
    /// Rows written across all successful documents
    pub rows: UpsertStats,
}

/// Reconcile documents until the stream closes.
///
/// A failed document is logged and skipped; its transaction has already been
/// rolled back. The stream closes once the scheduler is stopped and dropped.
pub async fn run_ingest(db: Database, mut documents: mpsc::Receiver<Source>) -> IngestStats {
    let mut stats = IngestStats::default();

    while let Some(mut document) = documents.recv().await {
        match reconcile_document(&db, &mut document).await {
            Ok(rows) => {
                stats.documents += 1;
                stats.rows += rows;
                tracing::info!(
                    url = %document.fetch_url,
                    source_id = ?document.id,
                    entries = document.entries.len(),
                    inserted = rows.inserted,
                    updated = rows.updated,
                    "Document reconciled"
                );
            }
            Err(e) => {
                stats.failed += 1;
                tracing::warn!(url = %document.fetch_url, error = %e, "Failed to reconcile document");
            }
        }
    }

    tracing::debug!(
        documents = stats.documents,
        failed = stats.failed,
        "Document stream closed"
    );
    stats
}

async fn reconcile_document(
    db: &Database,
    document: &mut Source,
) -> Result<UpsertStats, DatabaseError> {
    match db.upsert_source(document, true).await {
        Err(e) if e.is_transient() => {
            tracing::debug!(url = %document.fetch_url, "Database locked, retrying once");
            tokio::time::sleep(LOCKED_RETRY_DELAY).await;
            db.upsert_source(document, true).await
        }
        result => result,
    }
}

/// Consume watch errors until the stream closes, returning how many arrived.
///
/// Watchers already log each failure when it happens.
pub async fn drain_errors(mut errors: mpsc::Receiver<WatchError>) -> usize {
    let mut count = 0;
    while let Some(err) = errors.recv().await {
        count += 1;
        tracing::debug!(url = %err.url(), error = %err, "Drained watch error");
    }
    count
}
