use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::model::{Enclosure, Entry, Source};

#[derive(Debug, Error)]
#[error("Parse error: {0}")]
pub struct ParseError(#[from] parser::ParseFeedError);

/// Port converting a fetched body into a [`Source`] document.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, fetch_url: &Url, body: &[u8]) -> Result<Source, ParseError>;
}

/// RSS/Atom parser backed by `feed-rs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedRsParser;

impl DocumentParser for FeedRsParser {
    fn parse(&self, fetch_url: &Url, body: &[u8]) -> Result<Source, ParseError> {
        parse_document(fetch_url, body)
    }
}

pub fn parse_document(fetch_url: &Url, body: &[u8]) -> Result<Source, ParseError> {
    let feed = parser::parse(body)?;

    let mut source = Source::new(fetch_url.clone());
    source.title = feed.title.map(|t| t.content).unwrap_or_default();
    source.description = feed.description.map(|d| d.content).unwrap_or_default();
    source.link = feed.links.first().map(|l| l.href.clone());
    source.language = feed.language;
    source.ttl = feed.ttl;

    source.entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.or(entry.updated);
            let description = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default();
            let title = entry.title.map(|t| t.content).unwrap_or_default();
            let author = entry.authors.into_iter().next().map(|p| match p.email {
                Some(email) if p.name.is_empty() => email,
                _ => p.name,
            });

            let enclosure = entry
                .media
                .into_iter()
                .flat_map(|m| m.content)
                .find_map(|content| {
                    let url = content.url?;
                    Some(Enclosure {
                        url: url.to_string(),
                        mime_type: content
                            .content_type
                            .map(|m| m.to_string())
                            .unwrap_or_default(),
                        length: content
                            .size
                            .and_then(|s| i64::try_from(s).ok())
                            .unwrap_or(0),
                        ..Enclosure::default()
                    })
                });

            let guid = generate_guid(
                Some(entry.id.as_str()),
                link.as_deref(),
                &title,
                published.map(|p| p.timestamp()),
            );

            Entry {
                guid,
                title,
                description,
                link,
                author,
                published,
                enclosure,
                ..Entry::default()
            }
        })
        .collect();

    Ok(source)
}

fn generate_guid(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
    <title>Example Channel</title>
    <link>https://example.com/</link>
    <description>All about examples</description>
    <language>en-us</language>
    <ttl>30</ttl>
    <item>
        <guid>item-1</guid>
        <title>First</title>
        <link>https://example.com/1</link>
        <description>First post</description>
        <author>alice@example.com (Alice)</author>
        <pubDate>Thu, 22 Oct 2009 00:00:00 GMT</pubDate>
        <enclosure url="https://example.com/1.mp3" type="audio/mpeg" length="1234"/>
    </item>
    <item>
        <guid>item-2</guid>
        <title>Second</title>
    </item>
</channel></rss>"#;

    fn fetch_url() -> Url {
        Url::parse("https://example.com/feed").unwrap()
    }

    #[test]
    fn test_parse_channel_fields() {
        let source = parse_document(&fetch_url(), SAMPLE.as_bytes()).unwrap();
        assert_eq!(source.title, "Example Channel");
        assert_eq!(source.description, "All about examples");
        assert_eq!(source.language.as_deref(), Some("en-us"));
        assert_eq!(source.ttl, Some(30));
        assert_eq!(source.fetch_url, fetch_url());
        assert!(source.id.is_none());
        assert!(source.link.is_some());
    }

    #[test]
    fn test_parse_entries_in_order() {
        let source = parse_document(&fetch_url(), SAMPLE.as_bytes()).unwrap();
        let guids: Vec<_> = source.entries.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(guids, vec!["item-1", "item-2"]);

        let first = &source.entries[0];
        assert_eq!(first.title, "First");
        assert_eq!(first.description, "First post");
        assert!(first.published.is_some());
        assert!(!first.read);
        assert!(!first.starred);
    }

    #[test]
    fn test_parse_enclosure() {
        let source = parse_document(&fetch_url(), SAMPLE.as_bytes()).unwrap();
        let enclosure = source.entries[0].enclosure.as_ref().unwrap();
        assert_eq!(enclosure.url, "https://example.com/1.mp3");
        assert_eq!(enclosure.mime_type, "audio/mpeg");
        assert_eq!(enclosure.length, 1234);
        assert!(enclosure.file_path.is_none());
        assert!(source.entries[1].enclosure.is_none());
    }

    #[test]
    fn test_parse_malformed() {
        assert!(parse_document(&fetch_url(), b"<not valid xml").is_err());
    }

    #[test]
    fn test_generate_guid_prefers_existing() {
        assert_eq!(generate_guid(Some(" abc "), None, "t", None), "abc");
    }

    #[test]
    fn test_generate_guid_fallback_is_deterministic() {
        let a = generate_guid(Some(""), Some("https://e.com/1"), "Title", Some(1));
        let b = generate_guid(None, Some("https://e.com/1"), "Title", Some(1));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, generate_guid(None, Some("https://e.com/2"), "Title", Some(1)));
    }
}
