//! JSON API adapter: pull an endpoint, walk a dot-path to the item
//! array, map configured fields onto candidates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tracing::{info, warn};

use feedspine_core::{content_hash, Content, FeedSpineError, Metadata, RecordCandidate};
use feedspine_engine::{FeedAdapter, ResourcePool};

pub struct JsonApiAdapter {
    name: String,
    url: String,
    resources: Arc<ResourcePool>,
    /// Dot path from the response root to the item array, e.g.
    /// "data.items". Empty means the root itself is the array.
    items_path: String,
    /// Item field holding the natural key.
    key_field: String,
    /// Item field holding an RFC 3339 publication timestamp. Values
    /// without a timezone offset are rejected as invalid.
    published_field: Option<String>,
    headers: HashMap<String, String>,
    params: HashMap<String, String>,
}

impl JsonApiAdapter {
    pub fn new(
        name: &str,
        url: &str,
        items_path: &str,
        key_field: &str,
        resources: Arc<ResourcePool>,
    ) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            resources,
            items_path: items_path.to_string(),
            key_field: key_field.to_string(),
            published_field: None,
            headers: HashMap::new(),
            params: HashMap::new(),
        }
    }

    pub fn with_published_field(mut self, field: &str) -> Self {
        self.published_field = Some(field.to_string());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    async fn fetch_body(&self) -> Result<Value, FeedSpineError> {
        self.resources.throttle().await;
        let mut request = self
            .resources
            .http()
            .get(&self.url)
            .header("User-Agent", "feedspine/0.1")
            .query(&self.params);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let response = request
            .send()
            .await
            .map_err(FeedSpineError::adapter)?
            .error_for_status()
            .map_err(FeedSpineError::adapter)?;
        response.json().await.map_err(FeedSpineError::adapter)
    }
}

/// Walk a dot path into a JSON value.
pub(crate) fn items_at<'a>(root: &'a Value, path: &str) -> Option<&'a Vec<Value>> {
    let mut node = root;
    if !path.is_empty() {
        for segment in path.split('.') {
            node = node.get(segment)?;
        }
    }
    node.as_array()
}

/// Map one item object onto a candidate. None if the item lacks a
/// usable key or carries an invalid timestamp.
pub(crate) fn candidate_from_item(
    item: &Value,
    source: &str,
    key_field: &str,
    published_field: Option<&str>,
) -> Result<RecordCandidate, FeedSpineError> {
    let object = item
        .as_object()
        .ok_or_else(|| FeedSpineError::InvalidCandidate("item is not an object".to_string()))?;

    let raw_key = match object.get(key_field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(FeedSpineError::InvalidCandidate(format!(
                "item has no usable '{key_field}' field"
            )))
        }
    };

    let published_at = match published_field.and_then(|f| object.get(f)) {
        Some(Value::String(raw)) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|err| {
                    FeedSpineError::InvalidCandidate(format!(
                        "timestamp '{raw}' is not RFC 3339 with offset: {err}"
                    ))
                })?,
        ),
        _ => None,
    };

    let content: Content = object.clone();
    let metadata = Metadata::new(source)?.with_record_type("api-item");
    let mut candidate = RecordCandidate::new(&raw_key, content, metadata)?;
    candidate.content_hash = Some(content_hash(&candidate.content));
    if let Some(published) = published_at {
        candidate = candidate.with_published_at(published);
    }
    Ok(candidate)
}

#[async_trait]
impl FeedAdapter for JsonApiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> BoxStream<'_, Result<RecordCandidate, FeedSpineError>> {
        async_stream::stream! {
            let body = match self.fetch_body().await {
                Ok(body) => body,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            let Some(items) = items_at(&body, &self.items_path) else {
                yield Err(FeedSpineError::Adapter(format!(
                    "no item array at '{}'",
                    self.items_path
                )));
                return;
            };
            info!(feed = %self.name, items = items.len(), "api response parsed");

            for item in items {
                match candidate_from_item(
                    item,
                    &self.name,
                    &self.key_field,
                    self.published_field.as_deref(),
                ) {
                    Ok(candidate) => yield Ok(candidate),
                    Err(err) => {
                        // Malformed items are skipped, not fatal.
                        warn!(feed = %self.name, error = %err, "skipping invalid item");
                    }
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn walks_dot_path_to_items() {
        let body = json!({"data": {"items": [{"id": "A"}, {"id": "B"}]}});
        let items = items_at(&body, "data.items").unwrap();
        assert_eq!(items.len(), 2);

        let root = json!([{"id": "A"}]);
        assert_eq!(items_at(&root, "").unwrap().len(), 1);
        assert!(items_at(&body, "data.missing").is_none());
    }

    #[test]
    fn item_maps_to_candidate_with_full_content() {
        let item = json!({
            "id": "  Filing-001 ",
            "filed_at": "2026-03-01T09:30:00-05:00",
            "company": "ACME"
        });
        let candidate =
            candidate_from_item(&item, "edgar", "id", Some("filed_at")).unwrap();
        assert_eq!(candidate.natural_key.as_str(), "filing-001");
        assert_eq!(candidate.content["company"], json!("ACME"));
        assert!(candidate.content_hash.is_some());
        let published = candidate.published_at.unwrap();
        assert_eq!(published.to_rfc3339(), "2026-03-01T14:30:00+00:00");
    }

    #[test]
    fn numeric_keys_are_accepted() {
        let item = json!({"id": 4217});
        let candidate = candidate_from_item(&item, "api", "id", None).unwrap();
        assert_eq!(candidate.natural_key.as_str(), "4217");
    }

    #[test]
    fn naive_timestamp_is_invalid() {
        let item = json!({"id": "x", "ts": "2026-03-01T09:30:00"});
        let err = candidate_from_item(&item, "api", "id", Some("ts")).unwrap_err();
        assert!(matches!(err, FeedSpineError::InvalidCandidate(_)));
    }

    #[test]
    fn missing_key_is_invalid() {
        let item = json!({"title": "no id"});
        let err = candidate_from_item(&item, "api", "id", None).unwrap_err();
        assert!(matches!(err, FeedSpineError::InvalidCandidate(_)));
    }
}
