//! RSS/Atom feed adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::Rng;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use feedspine_core::{
    content_hash, Checkpoint, Content, FeedSpineError, Metadata, RecordCandidate,
};
use feedspine_engine::{FeedAdapter, ResourcePool};

const DEFAULT_MAX_ITEMS: usize = 100;

/// Max retry attempts for transient fetch failures.
const FETCH_MAX_ATTEMPTS: u32 = 3;
/// Base backoff duration. Actual delay is base * 3^attempt + jitter.
const FETCH_RETRY_BASE: Duration = Duration::from_millis(500);

pub struct RssAdapter {
    name: String,
    url: String,
    resources: Arc<ResourcePool>,
    max_items: usize,
    /// Entries at or before this instant are skipped. Set by `resume`
    /// and advanced as entries are emitted.
    cutoff: Mutex<Option<DateTime<Utc>>>,
}

impl RssAdapter {
    pub fn new(name: &str, url: &str, resources: Arc<ResourcePool>) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            resources,
            max_items: DEFAULT_MAX_ITEMS,
            cutoff: Mutex::new(None),
        }
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }

    /// Fetch the feed body, retrying transient failures with exponential
    /// backoff plus random jitter.
    async fn fetch_bytes(&self) -> Result<Vec<u8>, FeedSpineError> {
        let mut last_error = String::new();
        for attempt in 0..FETCH_MAX_ATTEMPTS {
            self.resources.throttle().await;
            let response = self
                .resources
                .http()
                .get(&self.url)
                .header("User-Agent", "feedspine/0.1")
                .send()
                .await;
            match response {
                Ok(response) => match response.error_for_status() {
                    Ok(response) => match response.bytes().await {
                        Ok(bytes) => return Ok(bytes.to_vec()),
                        Err(err) => last_error = err.to_string(),
                    },
                    Err(err) => last_error = err.to_string(),
                },
                Err(err) => last_error = err.to_string(),
            }
            if attempt + 1 < FETCH_MAX_ATTEMPTS {
                let backoff = FETCH_RETRY_BASE * 3u32.pow(attempt);
                let jitter = Duration::from_millis(rand::rng().random_range(0..250));
                warn!(
                    feed = %self.name,
                    url = %self.url,
                    attempt = attempt + 1,
                    error = %last_error,
                    "feed fetch failed, retrying after backoff"
                );
                tokio::time::sleep(backoff + jitter).await;
            }
        }
        Err(FeedSpineError::Adapter(format!(
            "feed fetch failed after {FETCH_MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }
}

/// Discover RSS/Atom feed URLs advertised in a page's `<link>` tags.
/// Relative hrefs are resolved against `base_url`.
pub fn discover_feed_urls(html: &str, base_url: &str) -> Vec<String> {
    let link_tag = regex::Regex::new(
        r#"<link[^>]+type\s*=\s*["']application/(rss\+xml|atom\+xml)["'][^>]*>"#,
    )
    .expect("static feed-link regex parses");
    let href = regex::Regex::new(r#"href\s*=\s*["']([^"']+)["']"#)
        .expect("static href regex parses");

    let base = url::Url::parse(base_url).ok();
    let mut feeds = Vec::new();
    for tag in link_tag.find_iter(html) {
        let Some(capture) = href.captures(tag.as_str()) else {
            continue;
        };
        let raw = &capture[1];
        let resolved = match url::Url::parse(raw) {
            Ok(absolute) => Some(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                base.as_ref().and_then(|b| b.join(raw).ok())
            }
            Err(_) => None,
        };
        if let Some(feed_url) = resolved {
            feeds.push(feed_url.to_string());
        }
    }
    feeds
}

/// Map parsed feed entries to candidates: entry id (falling back to the
/// first link) as the natural key, `published` falling back to
/// `updated`, title/link/summary as content. Entries at or before
/// `cutoff` are dropped; feed order is preserved.
pub(crate) fn candidates_from_feed(
    feed: feed_rs::model::Feed,
    source: &str,
    cutoff: Option<DateTime<Utc>>,
    max_items: usize,
) -> Vec<RecordCandidate> {
    let mut candidates = Vec::new();
    for entry in feed.entries.into_iter().take(max_items) {
        let link = entry.links.first().map(|l| l.href.clone());
        let raw_key = if !entry.id.is_empty() {
            entry.id.clone()
        } else {
            match &link {
                Some(href) => href.clone(),
                None => {
                    warn!(source, "feed entry has no id or link, skipping");
                    continue;
                }
            }
        };

        let published_at = entry
            .published
            .or(entry.updated)
            .map(|dt| dt.with_timezone(&Utc));
        if let (Some(cutoff), Some(published)) = (cutoff, published_at) {
            if published <= cutoff {
                continue;
            }
        }

        let mut content = Content::new();
        if let Some(title) = entry.title {
            content.insert("title".into(), json!(title.content));
        }
        if let Some(href) = link {
            content.insert("link".into(), json!(href));
        }
        if let Some(summary) = entry.summary {
            content.insert("summary".into(), json!(summary.content));
        }

        let metadata = match Metadata::new(source) {
            Ok(metadata) => metadata.with_record_type("feed-entry"),
            Err(err) => {
                warn!(source, error = %err, "invalid feed metadata, skipping entry");
                continue;
            }
        };
        let mut candidate = match RecordCandidate::new(&raw_key, content, metadata) {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(source, error = %err, "invalid feed entry, skipping");
                continue;
            }
        };
        candidate.content_hash = Some(content_hash(&candidate.content));
        if let Some(published) = published_at {
            candidate = candidate.with_published_at(published);
        }
        candidates.push(candidate);
    }
    candidates
}

#[async_trait]
impl FeedAdapter for RssAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> BoxStream<'_, Result<RecordCandidate, FeedSpineError>> {
        async_stream::stream! {
            let bytes = match self.fetch_bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            let feed = match feed_rs::parser::parse(&bytes[..]) {
                Ok(feed) => feed,
                Err(err) => {
                    yield Err(FeedSpineError::Adapter(format!(
                        "feed parse failed: {err}"
                    )));
                    return;
                }
            };

            let cutoff = *self.cutoff.lock().await;
            let candidates =
                candidates_from_feed(feed, &self.name, cutoff, self.max_items);
            info!(feed = %self.name, items = candidates.len(), "feed parsed");

            for candidate in candidates {
                if let Some(published) = candidate.published_at {
                    let mut cutoff = self.cutoff.lock().await;
                    if cutoff.map_or(true, |c| published > c) {
                        *cutoff = Some(published);
                    }
                }
                yield Ok(candidate);
            }
        }
        .boxed()
    }

    async fn resume(&self, checkpoint: &Checkpoint) -> Result<(), FeedSpineError> {
        let Some(raw) = checkpoint.cursor.as_str() else {
            return Ok(());
        };
        match DateTime::parse_from_rfc3339(raw) {
            Ok(instant) => {
                *self.cutoff.lock().await = Some(instant.with_timezone(&Utc));
                Ok(())
            }
            Err(err) => {
                warn!(feed = %self.name, error = %err, "unreadable feed cursor, starting fresh");
                Ok(())
            }
        }
    }

    async fn current_checkpoint(&self) -> Option<Checkpoint> {
        let cutoff = (*self.cutoff.lock().await)?;
        Some(Checkpoint::new(
            self.name.clone(),
            json!(cutoff.to_rfc3339()),
        ))
    }
}
