//! Integration tests for the polling pipeline: scheduler -> document stream -> reconciler.
//!
//! HTTP tests run against a wiremock server in real time with sub-second
//! cadences. The hour-long cadence test uses a stub client under paused time.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedwarden::feed::{
    CacheValidators, FeedClient, FeedRsParser, FetchError, FetchOutcome, HttpFeedClient,
    Scheduler, SchedulerOptions, WatchError,
};
use feedwarden::ingest::{drain_errors, run_ingest};
use feedwarden::storage::Database;

fn rss(title: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>{title}</title>
    <link>https://example.com/</link>
    <description>Pipeline test</description>
    <item>
      <title>First post</title>
      <guid>post-1</guid>
      <link>https://example.com/1</link>
      <enclosure url="https://example.com/1.mp3" type="audio/mpeg" length="100"/>
    </item>
  </channel>
</rss>"#
    )
}

fn http_client() -> Arc<HttpFeedClient> {
    Arc::new(HttpFeedClient::new("feedwarden-test", Duration::from_secs(5), 1024 * 1024).unwrap())
}

fn options(cadence: Duration) -> SchedulerOptions {
    SchedulerOptions {
        default_cadence: cadence,
        ..SchedulerOptions::default()
    }
}

// ============================================================================
// HTTP end-to-end
// ============================================================================

#[tokio::test]
async fn test_fetch_then_not_modified_stores_one_document() {
    let server = MockServer::start().await;
    // Mounted first so it wins once the client sends the validator
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_string(rss("A")),
        )
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let (scheduler, output) = Scheduler::new(
        http_client(),
        Arc::new(FeedRsParser),
        options(Duration::from_millis(300)),
    )
    .unwrap();
    let feed_url = format!("{}/feed.xml", server.uri());
    scheduler.register(&feed_url, None).await.unwrap();

    let ingest = tokio::spawn(run_ingest(db.clone(), output.documents));
    let errors = tokio::spawn(drain_errors(output.errors));

    scheduler.start().await;
    tokio::time::sleep(Duration::from_millis(1000)).await;
    scheduler.stop().await;
    drop(scheduler);

    let stats = ingest.await.unwrap();
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(errors.await.unwrap(), 0);

    let requests = server.received_requests().await.unwrap();
    assert!(requests.len() >= 2, "expected a conditional re-fetch");
    let revalidated = requests[1]
        .headers
        .get("if-none-match")
        .and_then(|v| v.to_str().ok());
    assert_eq!(revalidated, Some("\"v1\""));

    let url = Url::parse(&feed_url).unwrap();
    let stored = db.get_source_by_url(&url).await.unwrap().unwrap();
    assert_eq!(stored.title, "A");
    assert_eq!(stored.etag.as_deref(), Some("\"v1\""));

    let entries = db.get_entries_for_source(stored.id.unwrap()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].guid, "post-1");
    assert_eq!(
        entries[0].enclosure.as_ref().map(|e| e.url.as_str()),
        Some("https://example.com/1.mp3")
    );
}

#[tokio::test]
async fn test_stop_halts_polling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss("A")))
        .mount(&server)
        .await;

    let (scheduler, mut output) = Scheduler::new(
        http_client(),
        Arc::new(FeedRsParser),
        options(Duration::from_millis(100)),
    )
    .unwrap();
    scheduler
        .register(&format!("{}/feed.xml", server.uri()), None)
        .await
        .unwrap();

    let consumer = tokio::spawn(async move {
        let mut n = 0;
        while output.documents.recv().await.is_some() {
            n += 1;
        }
        n
    });

    scheduler.start().await;
    tokio::time::sleep(Duration::from_millis(350)).await;
    scheduler.stop().await;
    assert!(!scheduler.is_started().await);

    let polled = server.received_requests().await.unwrap().len();
    assert!(polled >= 2);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), polled);

    drop(scheduler);
    let received = consumer.await.unwrap();
    assert!(received >= 2 && received <= polled);
}

#[tokio::test]
async fn test_failing_source_reports_errors_and_others_continue() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken.xml"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/garbage.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not a feed"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss("Healthy")))
        .mount(&server)
        .await;

    let (scheduler, mut output) = Scheduler::new(
        http_client(),
        Arc::new(FeedRsParser),
        SchedulerOptions {
            default_cadence: Duration::from_secs(60),
            document_buffer: 6,
            error_buffer: 4,
        },
    )
    .unwrap();
    for p in ["/broken.xml", "/garbage.xml", "/feed.xml"] {
        scheduler
            .register(&format!("{}{}", server.uri(), p), None)
            .await
            .unwrap();
    }
    scheduler.start().await;

    let document = tokio::time::timeout(Duration::from_secs(5), output.documents.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(document.title, "Healthy");

    let mut fetch_failed = false;
    let mut parse_failed = false;
    for _ in 0..2 {
        let err = tokio::time::timeout(Duration::from_secs(5), output.errors.recv())
            .await
            .unwrap()
            .unwrap();
        match err {
            WatchError::Fetch {
                source: FetchError::HttpStatus(500),
                ref url,
            } => {
                assert!(url.path().ends_with("/broken.xml"));
                fetch_failed = true;
            }
            WatchError::Parse { ref url, .. } => {
                assert!(url.path().ends_with("/garbage.xml"));
                parse_failed = true;
            }
            other => panic!("unexpected error: {other}"),
        }
    }
    assert!(fetch_failed && parse_failed);

    scheduler.stop().await;
}

// ============================================================================
// Hour-long cadence under paused time
// ============================================================================

/// Serves queued responses in order, then repeats the last one.
struct ScriptedClient {
    script: Mutex<VecDeque<Option<String>>>,
    calls: Mutex<usize>,
}

impl ScriptedClient {
    fn new(script: Vec<Option<String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
        })
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl FeedClient for ScriptedClient {
    async fn fetch(
        &self,
        _url: &Url,
        _validators: &CacheValidators,
    ) -> Result<FetchOutcome, FetchError> {
        *self.calls.lock().unwrap() += 1;
        let next = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        };
        Ok(match next {
            Some(body) => FetchOutcome::Modified {
                body: body.into_bytes(),
                validators: CacheValidators {
                    etag: Some("\"v1\"".to_string()),
                    last_modified: None,
                },
            },
            None => FetchOutcome::NotModified,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_hourly_source_second_tick_not_modified() {
    let client = ScriptedClient::new(vec![Some(rss("A")), None]);
    let (scheduler, mut output) = Scheduler::new(
        client.clone(),
        Arc::new(FeedRsParser),
        SchedulerOptions::default(),
    )
    .unwrap();
    scheduler
        .register("https://example.com/feed.xml", Some(Duration::from_secs(3600)))
        .await
        .unwrap();
    scheduler.start().await;

    // Past the second tick, short of the third
    tokio::time::sleep(Duration::from_secs(3600 + 60)).await;
    scheduler.stop().await;
    drop(scheduler);
    assert_eq!(client.calls(), 2);

    let mut documents = Vec::new();
    while let Some(document) = output.documents.recv().await {
        documents.push(document);
    }
    assert_eq!(documents.len(), 1);

    // Back to real time for the database
    tokio::time::resume();
    let db = Database::open(":memory:").await.unwrap();
    for mut document in documents {
        db.upsert_source(&mut document, true).await.unwrap();
    }
    let url = Url::parse("https://example.com/feed.xml").unwrap();
    let stored = db.get_source_by_url(&url).await.unwrap().unwrap();
    assert_eq!(stored.title, "A");
}
