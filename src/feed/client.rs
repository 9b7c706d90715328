use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default bound on one HTTP round trip, headers and body together.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Default response body limit (10MB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Errors that can occur during a conditional fetch.
///
/// All of these are transient from the scheduler's point of view: they are
/// reported and the watcher keeps polling.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[source] reqwest::Error),
    /// Round trip exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Response status other than 2xx or 304
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err)
        }
    }
}

/// Cache validators remembered between fetches of one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheValidators {
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl CacheValidators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Adopt the validators present in `fresh`.
    ///
    /// A validator missing from `fresh` leaves the known value in place.
    pub fn merge(&mut self, fresh: CacheValidators) {
        if let Some(etag) = fresh.etag {
            self.etag = Some(etag);
        }
        if let Some(last_modified) = fresh.last_modified {
            self.last_modified = Some(last_modified);
        }
    }

    /// Read `ETag` and `Last-Modified` from a response.
    ///
    /// Empty or unparseable values count as absent.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let etag = headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| match parse_http_date(raw) {
                Some(dt) => Some(dt),
                None => {
                    tracing::warn!(value = %raw, "Ignoring unparseable Last-Modified header");
                    None
                }
            });

        Self {
            etag,
            last_modified,
        }
    }
}

/// Result of a conditional fetch that reached the server.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The server answered 304; nothing changed since the validators were issued.
    NotModified,
    /// The server sent a body, with whatever validators came along with it.
    Modified {
        body: Vec<u8>,
        validators: CacheValidators,
    },
}

/// Port for the conditional GET a watcher performs on every tick.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch(
        &self,
        url: &Url,
        validators: &CacheValidators,
    ) -> Result<FetchOutcome, FetchError>;
}

/// Reqwest-backed [`FeedClient`].
#[derive(Clone)]
pub struct HttpFeedClient {
    client: reqwest::Client,
    timeout: Duration,
    max_body_bytes: usize,
}

impl HttpFeedClient {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        max_body_bytes: usize,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .pool_idle_timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self::with_client(client, timeout, max_body_bytes))
    }

    /// Wrap an existing client (allows custom configuration).
    pub fn with_client(client: reqwest::Client, timeout: Duration, max_body_bytes: usize) -> Self {
        Self {
            client,
            timeout,
            max_body_bytes,
        }
    }

    async fn round_trip(
        &self,
        url: &Url,
        validators: &CacheValidators,
    ) -> Result<FetchOutcome, FetchError> {
        let mut request = self.client.get(url.as_str());
        if let Some(etag) = &validators.etag {
            request = request.header(header::IF_NONE_MATCH, etag.as_str());
        }
        if let Some(last_modified) = validators.last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, format_http_date(last_modified));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let validators = CacheValidators::from_headers(response.headers());
        let body = read_limited_bytes(response, self.max_body_bytes).await?;
        Ok(FetchOutcome::Modified { body, validators })
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    async fn fetch(
        &self,
        url: &Url,
        validators: &CacheValidators,
    ) -> Result<FetchOutcome, FetchError> {
        tokio::time::timeout(self.timeout, self.round_trip(url, validators))
            .await
            .map_err(|_| FetchError::Timeout)?
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

/// Format a timestamp as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub(crate) fn format_http_date(dt: DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub(crate) fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use wiremock::matchers::{header as header_eq, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>a</title><link>b</link><description>c</description>
    <item><guid>1</guid><title>Test</title></item>
</channel></rss>"#;

    fn client() -> HttpFeedClient {
        HttpFeedClient::new("feedwarden-test", Duration::from_secs(5), 1024 * 1024).unwrap()
    }

    async fn feed_url(server: &MockServer) -> Url {
        Url::parse(&format!("{}/feed", server.uri())).unwrap()
    }

    fn lm() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2009, 10, 22, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_http_date_round_trip() {
        assert_eq!(format_http_date(lm()), "Thu, 22 Oct 2009 00:00:00 GMT");
        assert_eq!(parse_http_date("Thu, 22 Oct 2009 00:00:00 GMT"), Some(lm()));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn test_merge_keeps_known_validators() {
        let mut known = CacheValidators {
            etag: Some("\"v1\"".into()),
            last_modified: Some(lm()),
        };
        known.merge(CacheValidators::default());
        assert_eq!(known.etag.as_deref(), Some("\"v1\""));
        assert_eq!(known.last_modified, Some(lm()));

        known.merge(CacheValidators {
            etag: Some("\"v2\"".into()),
            last_modified: None,
        });
        assert_eq!(known.etag.as_deref(), Some("\"v2\""));
        assert_eq!(known.last_modified, Some(lm()));
    }

    proptest! {
        #[test]
        fn prop_merge_never_clears(
            old_etag in proptest::option::of("[a-z0-9]{1,8}"),
            new_etag in proptest::option::of("[a-z0-9]{1,8}"),
            old_secs in proptest::option::of(0i64..2_000_000_000),
            new_secs in proptest::option::of(0i64..2_000_000_000),
        ) {
            let to_dt = |s: i64| Utc.timestamp_opt(s, 0).unwrap();
            let mut known = CacheValidators {
                etag: old_etag.clone(),
                last_modified: old_secs.map(to_dt),
            };
            known.merge(CacheValidators {
                etag: new_etag.clone(),
                last_modified: new_secs.map(to_dt),
            });
            prop_assert_eq!(known.etag, new_etag.or(old_etag));
            prop_assert_eq!(known.last_modified, new_secs.or(old_secs).map(to_dt));
        }
    }

    #[tokio::test]
    async fn test_fetch_captures_validators() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("ETag", "\"abc\"")
                    .insert_header("Last-Modified", "Thu, 22 Oct 2009 00:00:00 GMT"),
            )
            .mount(&mock_server)
            .await;

        let outcome = client()
            .fetch(&feed_url(&mock_server).await, &CacheValidators::default())
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Modified { body, validators } => {
                assert_eq!(body, VALID_RSS.as_bytes());
                assert_eq!(validators.etag.as_deref(), Some("\"abc\""));
                assert_eq!(validators.last_modified, Some(lm()));
            }
            other => panic!("Expected Modified, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_sends_conditional_headers() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_eq("If-None-Match", "\"abc\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&mock_server)
            .await;

        let validators = CacheValidators {
            etag: Some("\"abc\"".into()),
            last_modified: Some(lm()),
        };
        let outcome = client()
            .fetch(&feed_url(&mock_server).await, &validators)
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::NotModified));

        let requests = mock_server.received_requests().await.unwrap();
        let since = requests[0]
            .headers
            .get("if-modified-since")
            .and_then(|v| v.to_str().ok());
        assert_eq!(since, Some("Thu, 22 Oct 2009 00:00:00 GMT"));
    }

    #[tokio::test]
    async fn test_fetch_without_validators_sends_no_conditions() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        client()
            .fetch(&feed_url(&mock_server).await, &CacheValidators::default())
            .await
            .unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("if-none-match"));
        assert!(!requests[0].headers.contains_key("if-modified-since"));
    }

    #[tokio::test]
    async fn test_fetch_404_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let result = client()
            .fetch(&feed_url(&mock_server).await, &CacheValidators::default())
            .await;
        match result {
            Err(FetchError::HttpStatus(404)) => {}
            other => panic!("Expected HttpStatus(404), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_500_is_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = client()
            .fetch(&feed_url(&mock_server).await, &CacheValidators::default())
            .await;
        assert!(matches!(result, Err(FetchError::HttpStatus(500))));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&mock_server)
            .await;

        let client = HttpFeedClient::new("feedwarden-test", Duration::from_millis(200), 1024)
            .unwrap();
        let result = client
            .fetch(&feed_url(&mock_server).await, &CacheValidators::default())
            .await;
        assert!(matches!(result, Err(FetchError::Timeout)));
    }

    #[tokio::test]
    async fn test_fetch_body_too_large() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&mock_server)
            .await;

        let client = HttpFeedClient::new("feedwarden-test", Duration::from_secs(5), 1024).unwrap();
        let result = client
            .fetch(&feed_url(&mock_server).await, &CacheValidators::default())
            .await;
        assert!(matches!(result, Err(FetchError::ResponseTooLarge)));
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_network_error() {
        // Bind then drop a server so the port is closed.
        let url = {
            let server = MockServer::start().await;
            feed_url(&server).await
        };
        let result = client().fetch(&url, &CacheValidators::default()).await;
        assert!(matches!(result, Err(FetchError::Network(_))));
    }
}
