//! SQLite persistence for sources, entries, and enclosures.
//!
//! - `schema` - Connection setup and migrations
//! - `tx` - Transaction context with explicit ownership
//! - `reconcile` - Natural-key upserts, optionally cascading to children
//! - `queries` - Read side and user-state updates

mod queries;
mod reconcile;
mod schema;
mod tx;
mod types;

pub use reconcile::UpsertStats;
pub use schema::Database;
pub use tx::{TxContext, TxOwnership};
pub use types::{DatabaseError, RowCounts};
