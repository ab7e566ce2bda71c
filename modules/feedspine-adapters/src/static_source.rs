//! In-memory adapter over a fixed candidate list. The fixture source
//! for examples and downstream test suites.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;

use feedspine_core::{Content, FeedSpineError, Metadata, RecordCandidate};
use feedspine_engine::FeedAdapter;

pub struct StaticAdapter {
    name: String,
    candidates: Vec<RecordCandidate>,
}

impl StaticAdapter {
    pub fn new(name: &str, candidates: Vec<RecordCandidate>) -> Self {
        Self {
            name: name.to_string(),
            candidates,
        }
    }

    /// Convenience: one candidate per key, content `{"key": <key>}`.
    pub fn from_keys(name: &str, keys: &[&str]) -> Self {
        let candidates = keys
            .iter()
            .filter_map(|key| {
                let mut content = Content::new();
                content.insert("key".into(), json!(key));
                let metadata = Metadata::new(name).ok()?;
                RecordCandidate::new(key, content, metadata)
                    .ok()
                    .map(RecordCandidate::with_content_hash)
            })
            .collect();
        Self::new(name, candidates)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[async_trait]
impl FeedAdapter for StaticAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> BoxStream<'_, Result<RecordCandidate, FeedSpineError>> {
        futures::stream::iter(self.candidates.clone().into_iter().map(Ok)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn yields_scripted_candidates_in_order() {
        let adapter = StaticAdapter::from_keys("fixture", &["A", "b", " c "]);
        assert_eq!(adapter.len(), 3);

        let items: Vec<_> = adapter.fetch().collect().await;
        let keys: Vec<String> = items
            .into_iter()
            .map(|i| i.unwrap().natural_key.to_string())
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
