//! Utility functions shared across modules.
//!
//! - **URL validation**: registration-time checks on source fetch URLs

mod url_validator;

pub use url_validator::{validate_source_url, UrlValidationError};
