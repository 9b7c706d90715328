use thiserror::Error;
use url::Url;

/// Errors that can occur while validating a source fetch URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host to poll.
    #[error("URL has no host: {0}")]
    MissingHost(String),
}

/// Validates a URL string for use as a polled source.
///
/// Only `http` and `https` URLs with a host are accepted. Whitespace around
/// the input is trimmed.
///
/// # Examples
///
/// ```
/// use feedwarden::util::validate_source_url;
///
/// let url = validate_source_url("https://example.com/feed.xml").unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_source_url("file:///etc/passwd").is_err());
/// assert!(validate_source_url("not a url").is_err());
/// ```
pub fn validate_source_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(UrlValidationError::MissingHost(url.to_string())),
    }
}
