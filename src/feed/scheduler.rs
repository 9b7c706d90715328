use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use url::Url;

use super::client::{FeedClient, FetchError};
use super::parser::{DocumentParser, ParseError};
use super::watcher::{CancelledWatcher, SourceWatcher, WatchDeps, WatcherHandle};
use crate::model::{Source, DEFAULT_TTL_MINUTES};
use crate::util::{validate_source_url, UrlValidationError};

/// Synchronous rejection of a source at registration time.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Invalid source URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    #[error("Cadence must be positive")]
    NonPositiveCadence,
    #[error("Source already registered: {0}")]
    AlreadyRegistered(Url),
}

/// `SchedulerOptions` that no scheduler can run with.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("Default cadence must be positive")]
    NonPositiveCadence,
    #[error("{0} must be greater than zero")]
    EmptyBuffer(&'static str),
}

/// A failed poll, reported on the error stream. Never fatal to the watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        url: Url,
        #[source]
        source: FetchError,
    },
    #[error("Failed to parse {url}: {source}")]
    Parse {
        url: Url,
        #[source]
        source: ParseError,
    },
}

impl WatchError {
    pub fn url(&self) -> &Url {
        match self {
            WatchError::Fetch { url, .. } | WatchError::Parse { url, .. } => url,
        }
    }
}

/// Tunables for a [`Scheduler`].
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Cadence for sources registered without an explicit one.
    pub default_cadence: Duration,
    /// Capacity of the document stream. A full stream holds watchers back.
    pub document_buffer: usize,
    /// Capacity of the error stream. A full stream drops errors.
    pub error_buffer: usize,
}

impl SchedulerOptions {
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.default_cadence.is_zero() {
            return Err(OptionsError::NonPositiveCadence);
        }
        if self.document_buffer == 0 {
            return Err(OptionsError::EmptyBuffer("document_buffer"));
        }
        if self.error_buffer == 0 {
            return Err(OptionsError::EmptyBuffer("error_buffer"));
        }
        Ok(())
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            default_cadence: Duration::from_secs(u64::from(DEFAULT_TTL_MINUTES) * 60),
            document_buffer: 6,
            error_buffer: 2,
        }
    }
}

/// Receiving ends of the scheduler's two result streams.
///
/// Wrap a receiver in `Arc<tokio::sync::Mutex<_>>` to share it between
/// several consumers.
pub struct SchedulerOutput {
    pub documents: mpsc::Receiver<Source>,
    pub errors: mpsc::Receiver<WatchError>,
}

enum Slot {
    Registered(SourceWatcher),
    Running(WatcherHandle),
}

impl Slot {
    fn url(&self) -> &Url {
        match self {
            Slot::Registered(watcher) => &watcher.url,
            Slot::Running(handle) => handle.url(),
        }
    }
}

struct SchedulerState {
    started: bool,
    slots: Vec<Slot>,
}

/// Owns one watcher per registered source and fans their output into two streams.
///
/// The watcher collection sits behind a single lock that is only taken for
/// membership and lifecycle changes. Polling state lives in each watcher's task.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    deps: WatchDeps,
    default_cadence: Duration,
}

impl Scheduler {
    /// # Errors
    ///
    /// Returns an [`OptionsError`] if the default cadence or either buffer
    /// size in `options` is zero.
    pub fn new(
        client: Arc<dyn FeedClient>,
        parser: Arc<dyn DocumentParser>,
        options: SchedulerOptions,
    ) -> Result<(Self, SchedulerOutput), OptionsError> {
        options.validate()?;
        let (documents_tx, documents) = mpsc::channel(options.document_buffer);
        let (errors_tx, errors) = mpsc::channel(options.error_buffer);

        let scheduler = Self {
            state: Mutex::new(SchedulerState {
                started: false,
                slots: Vec::new(),
            }),
            deps: WatchDeps {
                client,
                parser,
                documents: documents_tx,
                errors: errors_tx,
            },
            default_cadence: options.default_cadence,
        };

        Ok((scheduler, SchedulerOutput { documents, errors }))
    }

    /// Add a source. It starts polling right away if the scheduler is running.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::InvalidUrl`] if `url` is not an http(s) URL with a host
    /// - [`RegistrationError::NonPositiveCadence`] if `cadence` is `Some(Duration::ZERO)`
    /// - [`RegistrationError::AlreadyRegistered`] if the URL is already watched
    pub async fn register(
        &self,
        url: &str,
        cadence: Option<Duration>,
    ) -> Result<(), RegistrationError> {
        let url = validate_source_url(url)?;
        let cadence = match cadence {
            Some(c) if c.is_zero() => return Err(RegistrationError::NonPositiveCadence),
            Some(c) => c,
            None => self.default_cadence,
        };

        let mut state = self.state.lock().await;
        if state.slots.iter().any(|slot| *slot.url() == url) {
            return Err(RegistrationError::AlreadyRegistered(url));
        }

        tracing::info!(url = %url, cadence_secs = cadence.as_secs(), "Registered source");
        let watcher = SourceWatcher::new(url, cadence);
        let slot = if state.started {
            Slot::Running(watcher.spawn(self.deps.clone()))
        } else {
            Slot::Registered(watcher)
        };
        state.slots.push(slot);
        Ok(())
    }

    /// Start every registered watcher. A no-op if already started.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.started {
            return;
        }

        let slots = std::mem::take(&mut state.slots);
        state.slots = slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Registered(watcher) => Slot::Running(watcher.spawn(self.deps.clone())),
                running => running,
            })
            .collect();
        state.started = true;
        tracing::info!(sources = state.slots.len(), "Scheduler started");
    }

    /// Stop every watcher and wait until each task has exited.
    ///
    /// After this returns no further polls happen. A poll already in flight
    /// is allowed to finish; if it is blocked on a full document stream its
    /// document is dropped. A no-op if not started.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.started {
            return;
        }

        let slots = std::mem::take(&mut state.slots);
        let stopping: Vec<_> = slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Running(handle) => Stopping::Cancelled(handle.cancel()),
                Slot::Registered(watcher) => Stopping::Idle(watcher),
            })
            .collect();

        state.slots = join_all(stopping.into_iter().map(|s| async move {
            match s {
                Stopping::Cancelled(cancelled) => Slot::Registered(cancelled.join().await),
                Stopping::Idle(watcher) => Slot::Registered(watcher),
            }
        }))
        .await;
        state.started = false;
        tracing::info!(sources = state.slots.len(), "Scheduler stopped");
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.started
    }

    /// URLs of every registered source, in registration order.
    pub async fn sources(&self) -> Vec<Url> {
        let state = self.state.lock().await;
        state.slots.iter().map(|slot| slot.url().clone()).collect()
    }
}

enum Stopping {
    Cancelled(CancelledWatcher),
    Idle(SourceWatcher),
}
