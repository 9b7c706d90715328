//! Feed-ingestion backend: adaptive conditional polling of RSS/Atom sources
//! and natural-key reconciliation of what they return into SQLite.

pub mod config;
pub mod feed;
pub mod ingest;
pub mod model;
pub mod storage;
pub mod util;
