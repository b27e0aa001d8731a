use std::time::Duration;

use reqwest::Client;
use thiserror::Error;

/// Errors from retrieving or decoding a single feed document.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("reading response body: {0}")]
    Body(#[source] reqwest::Error),
    #[error("malformed feed: {0}")]
    Parse(#[from] rss::Error),
}

/// A feed document normalized down to the fields the aggregator stores.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeed {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<ParsedItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    /// Raw `pubDate` text; parsing it is the ingestion step's concern.
    pub pub_date: Option<String>,
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Grazer/0.1 (feed aggregator)")
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }

    /// Retrieve `url` and parse the response as an RSS 2.0 document.
    /// Non-success status codes are network errors.
    pub async fn fetch(&self, url: &str) -> Result<ParsedFeed, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(FetchError::Network)?;
        let bytes = response.bytes().await.map_err(FetchError::Body)?;
        parse_document(&bytes)
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse raw bytes as an RSS channel. Titles and descriptions get an HTML
/// entity pass on top of the XML decode, since feeds frequently
/// double-encode entities (`&amp;amp;` and friends).
pub fn parse_document(bytes: &[u8]) -> Result<ParsedFeed, FetchError> {
    let channel = rss::Channel::read_from(bytes)?;

    let items = channel
        .items()
        .iter()
        .map(|item| ParsedItem {
            title: unescape(item.title().unwrap_or_default()),
            link: item.link().unwrap_or_default().to_string(),
            description: item.description().map(unescape),
            pub_date: item.pub_date().map(str::to_string),
        })
        .collect();

    Ok(ParsedFeed {
        title: unescape(channel.title()),
        link: channel.link().to_string(),
        description: unescape(channel.description()),
        items,
    })
}

fn unescape(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}
