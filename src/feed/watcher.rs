use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use url::Url;

use super::client::{CacheValidators, FeedClient, FetchOutcome};
use super::parser::DocumentParser;
use super::scheduler::WatchError;
use crate::model::Source;

/// Collaborators and output streams shared by every watcher of a scheduler.
#[derive(Clone)]
pub(crate) struct WatchDeps {
    pub client: Arc<dyn FeedClient>,
    pub parser: Arc<dyn DocumentParser>,
    pub documents: mpsc::Sender<Source>,
    pub errors: mpsc::Sender<WatchError>,
}

/// Polling state for one source. Owned by its task while running.
#[derive(Debug, Clone)]
pub(crate) struct SourceWatcher {
    pub url: Url,
    pub cadence: Duration,
    pub validators: CacheValidators,
}

/// Handle to a running watcher task.
pub(crate) struct WatcherHandle {
    url: Url,
    cadence: Duration,
    cancel_tx: oneshot::Sender<()>,
    join: JoinHandle<SourceWatcher>,
}

enum TickOutcome {
    Continue,
    CadenceChanged,
    Cancelled,
}

impl SourceWatcher {
    pub fn new(url: Url, cadence: Duration) -> Self {
        Self {
            url,
            cadence,
            validators: CacheValidators::default(),
        }
    }

    /// Move the watcher onto its own task. The first tick fires immediately.
    pub fn spawn(self, deps: WatchDeps) -> WatcherHandle {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let url = self.url.clone();
        let cadence = self.cadence;
        let join = tokio::spawn(self.run(deps, cancel_rx));
        WatcherHandle {
            url,
            cadence,
            cancel_tx,
            join,
        }
    }

    async fn run(mut self, deps: WatchDeps, mut cancel_rx: oneshot::Receiver<()>) -> Self {
        tracing::debug!(url = %self.url, cadence_secs = self.cadence.as_secs(), "Watcher started");
        let mut ticker = new_ticker(self.cadence);

        loop {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => break,
                _ = ticker.tick() => {
                    match self.tick(&deps, &mut cancel_rx).await {
                        TickOutcome::Continue => {}
                        TickOutcome::CadenceChanged => {
                            // Old timer goes away before the new one exists.
                            drop(ticker);
                            ticker = new_ticker(self.cadence);
                        }
                        TickOutcome::Cancelled => break,
                    }
                }
            }
        }

        tracing::debug!(url = %self.url, "Watcher stopped");
        self
    }

    async fn tick(
        &mut self,
        deps: &WatchDeps,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> TickOutcome {
        let outcome = match deps.client.fetch(&self.url, &self.validators).await {
            Ok(outcome) => outcome,
            Err(source) => {
                emit_error(
                    &deps.errors,
                    WatchError::Fetch {
                        url: self.url.clone(),
                        source,
                    },
                );
                return TickOutcome::Continue;
            }
        };

        let (body, fresh) = match outcome {
            FetchOutcome::NotModified => {
                tracing::debug!(url = %self.url, "Not modified");
                return TickOutcome::Continue;
            }
            FetchOutcome::Modified { body, validators } => (body, validators),
        };

        self.validators.merge(fresh);

        let mut document = match deps.parser.parse(&self.url, &body) {
            Ok(document) => document,
            Err(source) => {
                emit_error(
                    &deps.errors,
                    WatchError::Parse {
                        url: self.url.clone(),
                        source,
                    },
                );
                return TickOutcome::Continue;
            }
        };

        document.fetch_url = self.url.clone();
        document.etag = self.validators.etag.clone();
        document.last_modified = self.validators.last_modified;
        let declared = document.declared_cadence();

        tracing::debug!(url = %self.url, entries = document.entries.len(), "Fetched document");

        tokio::select! {
            biased;
            sent = deps.documents.send(document) => {
                if sent.is_err() {
                    tracing::warn!(url = %self.url, "Document receiver dropped");
                }
            }
            _ = &mut *cancel_rx => return TickOutcome::Cancelled,
        }

        match declared {
            Some(cadence) if cadence != self.cadence => {
                tracing::info!(
                    url = %self.url,
                    old_secs = self.cadence.as_secs(),
                    new_secs = cadence.as_secs(),
                    "Discovered new cadence, restarting timer"
                );
                self.cadence = cadence;
                TickOutcome::CadenceChanged
            }
            _ => TickOutcome::Continue,
        }
    }
}

impl WatcherHandle {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Ask the task to stop without waiting for it.
    pub fn cancel(self) -> CancelledWatcher {
        // The receiver only goes away once the task has already exited.
        let _ = self.cancel_tx.send(());
        CancelledWatcher {
            url: self.url,
            cadence: self.cadence,
            join: self.join,
        }
    }
}

/// A watcher that has been told to stop and is winding down.
pub(crate) struct CancelledWatcher {
    url: Url,
    cadence: Duration,
    join: JoinHandle<SourceWatcher>,
}

impl CancelledWatcher {
    /// Wait for the task to exit and take back its state.
    pub async fn join(self) -> SourceWatcher {
        match self.join.await {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::error!(url = %self.url, error = %e, "Watcher task failed, resetting its state");
                SourceWatcher::new(self.url, self.cadence)
            }
        }
    }
}

fn new_ticker(cadence: Duration) -> Interval {
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Best-effort error report. A full error stream drops the error.
fn emit_error(errors: &mpsc::Sender<WatchError>, err: WatchError) {
    tracing::warn!(error = %err, "Source poll failed");
    match errors.try_send(err) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            tracing::debug!(error = %dropped, "Error stream full, dropping error");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}
