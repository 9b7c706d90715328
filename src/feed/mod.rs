//! Source polling: conditional fetching, parsing, and per-source scheduling.
//!
//! - `client` - Conditional HTTP GET with cache validators (`FeedClient` port)
//! - `parser` - Body to document conversion using the `feed-rs` crate
//! - `scheduler` - Registration, lifecycle, and the two result streams
//!
//! Each registered source gets its own watcher task with a private timer. A
//! watcher fetches immediately on start, then once per cadence. When a fetched
//! document declares a different TTL the watcher adopts it, restarts its timer,
//! and polls again right away.
//!
//! # Example
//!
//! ```ignore
//! let client = Arc::new(HttpFeedClient::new("feedwarden", timeout, max_body)?);
//! let (scheduler, mut output) = Scheduler::new(client, Arc::new(FeedRsParser), options)?;
//! scheduler.register("https://example.com/feed.xml", None).await?;
//! scheduler.start().await;
//! while let Some(document) = output.documents.recv().await { /* reconcile */ }
//! ```

mod client;
mod parser;
mod scheduler;
mod watcher;

pub use client::{
    CacheValidators, FeedClient, FetchError, FetchOutcome, HttpFeedClient,
    DEFAULT_MAX_BODY_BYTES, DEFAULT_REQUEST_TIMEOUT,
};
pub use parser::{parse_document, DocumentParser, FeedRsParser, ParseError};
pub use scheduler::{
    OptionsError, RegistrationError, Scheduler, SchedulerOptions, SchedulerOutput, WatchError,
};
