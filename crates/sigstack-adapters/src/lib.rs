//! Source adapter capability and the concrete feed/scrape implementations.

use std::time::Duration;

use async_trait::async_trait;
use feed_rs::parser;
use scraper::{Html, Selector};
use sigstack_core::RawRecord;
use thiserror::Error;

pub const CRATE_NAME: &str = "sigstack-adapters";

/// Per-fetch cap on candidate records, bounding load per cycle.
pub const MAX_RECORDS_PER_FETCH: usize = 50;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed feed document: {0}")]
    Feed(#[from] feed_rs::parser::ParseFeedError),
    #[error("invalid selector: {0}")]
    Selector(String),
}

/// One registered remote source. `fetch` performs a fresh network round trip
/// and yields at most [`MAX_RECORDS_PER_FETCH`] raw records; any failure
/// (network, non-2xx, malformed payload) propagates to the caller.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Source name; forms the dedup key together with each record's id.
    fn source(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<RawRecord>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "signalstack-worker/0.1".to_string(),
        }
    }
}

fn build_client(config: &HttpClientConfig) -> Result<reqwest::Client, FetchError> {
    let client = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout)
        .user_agent(config.user_agent.clone())
        .build()?;
    Ok(client)
}

/// RSS/Atom adapter: parses a feed document and yields the per-entry native
/// id, title, first link, and source-reported published time.
pub struct FeedAdapter {
    source: String,
    feed_url: String,
    client: reqwest::Client,
}

impl FeedAdapter {
    pub fn new(
        source: impl Into<String>,
        feed_url: impl Into<String>,
        config: &HttpClientConfig,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            source: source.into(),
            feed_url: feed_url.into(),
            client: build_client(config)?,
        })
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>, FetchError> {
        let response = self.client.get(&self.feed_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        let body = response.bytes().await?;
        parse_feed(&body)
    }
}

/// Pure feed-document extraction, split out from the network path so it can
/// be tested against inline documents.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<RawRecord>, FetchError> {
    let feed = parser::parse(bytes)?;
    Ok(feed
        .entries
        .into_iter()
        .take(MAX_RECORDS_PER_FETCH)
        .map(|entry| RawRecord {
            // Blank ids fall through so the normalizer's link fallback applies.
            external_id: if entry.id.trim().is_empty() {
                None
            } else {
                Some(entry.id)
            },
            title: entry.title.map(|t| t.content),
            url: entry.links.first().map(|l| l.href.clone()),
            published_at: entry.published,
        })
        .collect())
}

/// Best-effort HTML adapter: selects title/link anchors with a fixed
/// structural CSS selector. No native id or timestamp exists, so identity
/// becomes the link itself downstream.
pub struct ScrapeAdapter {
    source: String,
    page_url: String,
    selector: String,
    client: reqwest::Client,
}

impl ScrapeAdapter {
    pub fn new(
        source: impl Into<String>,
        page_url: impl Into<String>,
        selector: impl Into<String>,
        config: &HttpClientConfig,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            source: source.into(),
            page_url: page_url.into(),
            selector: selector.into(),
            client: build_client(config)?,
        })
    }
}

#[async_trait]
impl SourceAdapter for ScrapeAdapter {
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>, FetchError> {
        let response = self.client.get(&self.page_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        let body = response.text().await?;
        parse_listing(&body, &self.selector)
    }
}

/// Pure HTML extraction for the scrape adapter.
pub fn parse_listing(html: &str, selector: &str) -> Result<Vec<RawRecord>, FetchError> {
    let anchor = Selector::parse(selector).map_err(|e| FetchError::Selector(e.to_string()))?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&anchor)
        .take(MAX_RECORDS_PER_FETCH)
        .map(|node| RawRecord {
            external_id: None,
            title: Some(node.text().collect::<String>()),
            url: node.value().attr("href").map(ToString::to_string),
            published_at: None,
        })
        .collect())
}

pub fn bbc_world_rss_adapter(config: &HttpClientConfig) -> Result<FeedAdapter, FetchError> {
    FeedAdapter::new(
        "BBC World RSS",
        "http://feeds.bbci.co.uk/news/world/rss.xml",
        config,
    )
}

pub fn hacker_news_adapter(config: &HttpClientConfig) -> Result<ScrapeAdapter, FetchError> {
    ScrapeAdapter::new(
        "Hacker News",
        "https://news.ycombinator.com/",
        "span.titleline > a",
        config,
    )
}
