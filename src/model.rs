//! Document model shared by the polling scheduler and the storage layer.
//!
//! A [`Source`] is one polled feed, identified by its fetch URL. It owns an
//! ordered list of [`Entry`] records (identified by GUID), each of which may
//! carry one [`Enclosure`] (identified by its resource URL).
//!
//! Storage identities (`id`) are `None` until the reconciler first persists a
//! record and are written back onto the value after every upsert. Child records
//! carry their parent's storage identity as a plain foreign-key value; the
//! reconciler re-derives it from the parent before every write.

use chrono::{DateTime, Utc};
use std::time::Duration;
use url::Url;

/// Poll interval applied when a source declares no TTL, in minutes.
pub const DEFAULT_TTL_MINUTES: u32 = 60;

/// A feed/channel as parsed from one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: Option<i64>,
    pub title: String,
    pub description: String,
    /// Human-facing URL of the site. Not the identity of the source.
    pub link: Option<String>,
    /// URL the source is polled from. Natural key.
    pub fetch_url: Url,
    pub language: Option<String>,
    /// Declared poll interval in minutes.
    pub ttl: Option<u32>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub entries: Vec<Entry>,
}

impl Source {
    pub fn new(fetch_url: Url) -> Self {
        Self {
            id: None,
            title: String::new(),
            description: String::new(),
            link: None,
            fetch_url,
            language: None,
            ttl: None,
            etag: None,
            last_modified: None,
            entries: Vec::new(),
        }
    }

    /// The cadence this source declares for itself, if any.
    ///
    /// A TTL of zero is treated as "not declared".
    pub fn declared_cadence(&self) -> Option<Duration> {
        match self.ttl {
            Some(minutes) if minutes > 0 => Some(Duration::from_secs(u64::from(minutes) * 60)),
            _ => None,
        }
    }

    /// TTL written to storage: the declared value, or the default.
    pub fn effective_ttl(&self) -> u32 {
        self.ttl.filter(|t| *t > 0).unwrap_or(DEFAULT_TTL_MINUTES)
    }
}

/// A post/item within a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub id: Option<i64>,
    pub source_id: Option<i64>,
    /// Globally unique identifier. Natural key.
    pub guid: String,
    pub title: String,
    pub description: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub read: bool,
    pub starred: bool,
    pub enclosure: Option<Enclosure>,
}

/// A media resource attached to an entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enclosure {
    pub id: Option<i64>,
    pub entry_id: Option<i64>,
    pub mime_type: String,
    /// Resource URL. Natural key.
    pub url: String,
    pub length: i64,
    /// Local copy of the resource, filled in by the downloader.
    pub file_path: Option<String>,
}
