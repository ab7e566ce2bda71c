//! In-memory store. The reference implementation of the contract and
//! the workhorse of the test suites.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::RwLock;

use feedspine_core::{Content, FeedSpineError, Layer, NaturalKey, Record, RecordId, Sighting};

use crate::traits::{OrderBy, RecordQuery, RecordStore};

#[derive(Default)]
struct Indexes {
    records: HashMap<RecordId, Record>,
    /// Unique: one record id per normalized natural key.
    by_natural_key: HashMap<NaturalKey, RecordId>,
    /// Append order per key is sighting order.
    sightings: HashMap<NaturalKey, Vec<Sighting>>,
}

/// Everything behind one RwLock: the write lock makes each mutation,
/// including the record_sighting check-then-append, atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Indexes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(record: &Record, query: &RecordQuery) -> bool {
        if let Some(source) = &query.source {
            if &record.metadata.source != source {
                return false;
            }
        }
        if let Some(record_type) = &query.record_type {
            if &record.metadata.record_type != record_type {
                return false;
            }
        }
        if let Some(layer) = query.layer {
            if record.layer != layer {
                return false;
            }
        }
        true
    }

    async fn select(&self, query: &RecordQuery) -> Vec<Record> {
        let inner = self.inner.read().await;
        let mut matched: Vec<Record> = inner
            .records
            .values()
            .filter(|r| Self::matches(r, query))
            .cloned()
            .collect();
        match query.order_by {
            OrderBy::CapturedAt => {
                matched.sort_by(|a, b| (a.captured_at, a.record_id).cmp(&(b.captured_at, b.record_id)))
            }
            OrderBy::PublishedAt => {
                matched.sort_by(|a, b| (a.published_at, a.record_id).cmp(&(b.published_at, b.record_id)))
            }
            OrderBy::NaturalKey => matched.sort_by(|a, b| a.natural_key.cmp(&b.natural_key)),
        }
        let offset = query.offset.min(matched.len());
        let mut windowed: Vec<Record> = matched.split_off(offset);
        if let Some(limit) = query.limit {
            windowed.truncate(limit);
        }
        windowed
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn initialize(&self) -> Result<(), FeedSpineError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), FeedSpineError> {
        Ok(())
    }

    async fn insert(&self, record: &Record) -> Result<(), FeedSpineError> {
        let mut inner = self.inner.write().await;
        if inner.by_natural_key.contains_key(&record.natural_key) {
            return Err(FeedSpineError::DuplicateNaturalKey(
                record.natural_key.to_string(),
            ));
        }
        inner
            .by_natural_key
            .insert(record.natural_key.clone(), record.record_id);
        inner.records.insert(record.record_id, record.clone());
        Ok(())
    }

    async fn upsert_last_seen(
        &self,
        record_id: RecordId,
        seen_at: DateTime<Utc>,
        content_hash: Option<&str>,
    ) -> Result<(), FeedSpineError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(&record_id)
            .ok_or_else(|| FeedSpineError::Storage(format!("no record {record_id}")))?;
        if seen_at > record.last_seen_at {
            record.last_seen_at = seen_at;
        }
        if seen_at > record.updated_at {
            record.updated_at = seen_at;
        }
        if let Some(hash) = content_hash {
            record.content_hash = Some(hash.to_string());
        }
        Ok(())
    }

    async fn update_layer(
        &self,
        record_id: RecordId,
        new_layer: Layer,
        merged_content: Content,
        updated_at: DateTime<Utc>,
    ) -> Result<(), FeedSpineError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(&record_id)
            .ok_or_else(|| FeedSpineError::Storage(format!("no record {record_id}")))?;
        if new_layer <= record.layer {
            return Err(FeedSpineError::InvalidPromotion {
                record_id,
                from: record.layer,
                to: new_layer,
            });
        }
        record.layer = new_layer;
        record.content = merged_content;
        if updated_at > record.updated_at {
            record.updated_at = updated_at;
        }
        Ok(())
    }

    async fn get(&self, record_id: RecordId) -> Result<Option<Record>, FeedSpineError> {
        Ok(self.inner.read().await.records.get(&record_id).cloned())
    }

    async fn get_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<Record>, FeedSpineError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_natural_key
            .get(key)
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    async fn exists_by_natural_key(&self, key: &NaturalKey) -> Result<bool, FeedSpineError> {
        Ok(self.inner.read().await.by_natural_key.contains_key(key))
    }

    async fn delete(&self, record_id: RecordId) -> Result<bool, FeedSpineError> {
        let mut inner = self.inner.write().await;
        match inner.records.remove(&record_id) {
            Some(record) => {
                inner.by_natural_key.remove(&record.natural_key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn query(&self, query: RecordQuery) -> BoxStream<'_, Result<Record, FeedSpineError>> {
        // Snapshot under the read lock, then stream the copy: callers
        // never observe torn records.
        async_stream::stream! {
            for record in self.select(&query).await {
                yield Ok(record);
            }
        }
        .boxed()
    }

    async fn count(&self, query: &RecordQuery) -> Result<u64, FeedSpineError> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .filter(|r| Self::matches(r, query))
            .count() as u64)
    }

    async fn record_sighting(&self, sighting: &Sighting) -> Result<bool, FeedSpineError> {
        let mut inner = self.inner.write().await;
        let history = inner
            .sightings
            .entry(sighting.natural_key.clone())
            .or_default();
        let first = history.is_empty();
        history.push(sighting.clone());
        Ok(first)
    }

    async fn get_sightings(&self, key: &NaturalKey) -> Result<Vec<Sighting>, FeedSpineError> {
        Ok(self
            .inner
            .read()
            .await
            .sightings
            .get(key)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedspine_core::{content_hash, Metadata, RecordCandidate, SightingId};
    use serde_json::json;

    fn candidate(key: &str, source: &str) -> RecordCandidate {
        let mut content = Content::new();
        content.insert("title".into(), json!(format!("item {key}")));
        RecordCandidate::new(key, content, Metadata::new(source).unwrap()).unwrap()
    }

    fn sighting(record: &Record, source: &str, is_new: bool) -> Sighting {
        Sighting {
            sighting_id: SightingId::generate(),
            natural_key: record.natural_key.clone(),
            source: source.to_string(),
            seen_at: Utc::now(),
            is_new,
            record_id: record.record_id,
            content_hash: record.content_hash.clone(),
        }
    }

    #[tokio::test]
    async fn insert_then_get_by_both_keys() {
        let store = MemoryStore::new();
        let record = Record::from_candidate(candidate("k1", "s1"), Utc::now());
        store.insert(&record).await.unwrap();

        let by_id = store.get(record.record_id).await.unwrap().unwrap();
        assert_eq!(by_id.natural_key.as_str(), "k1");

        let by_key = store
            .get_by_natural_key(&NaturalKey::new("  K1 ").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_key.record_id, record.record_id);
    }

    #[tokio::test]
    async fn duplicate_natural_key_rejected() {
        let store = MemoryStore::new();
        store
            .insert(&Record::from_candidate(candidate("k1", "s1"), Utc::now()))
            .await
            .unwrap();
        let err = store
            .insert(&Record::from_candidate(candidate("K1", "s2"), Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedSpineError::DuplicateNaturalKey(_)));
    }

    #[tokio::test]
    async fn last_seen_is_monotone() {
        let store = MemoryStore::new();
        let record = Record::from_candidate(candidate("k1", "s1"), Utc::now());
        store.insert(&record).await.unwrap();

        let later = record.last_seen_at + chrono::Duration::seconds(10);
        store
            .upsert_last_seen(record.record_id, later, None)
            .await
            .unwrap();
        // An older timestamp must not move last_seen_at back.
        store
            .upsert_last_seen(record.record_id, record.last_seen_at, None)
            .await
            .unwrap();

        let stored = store.get(record.record_id).await.unwrap().unwrap();
        assert_eq!(stored.last_seen_at, later);
        assert!(stored.timestamps_monotone());
    }

    #[tokio::test]
    async fn promotion_must_move_up() {
        let store = MemoryStore::new();
        let record = Record::from_candidate(candidate("k1", "s1"), Utc::now());
        store.insert(&record).await.unwrap();

        let mut merged = record.content.clone();
        merged.insert("verified".into(), json!(true));
        store
            .update_layer(record.record_id, Layer::Silver, merged.clone(), Utc::now())
            .await
            .unwrap();

        // Same layer and downgrade both rejected.
        for bad in [Layer::Silver, Layer::Bronze] {
            let err = store
                .update_layer(record.record_id, bad, merged.clone(), Utc::now())
                .await
                .unwrap_err();
            assert!(matches!(err, FeedSpineError::InvalidPromotion { .. }));
        }

        let stored = store.get(record.record_id).await.unwrap().unwrap();
        assert_eq!(stored.layer, Layer::Silver);
        assert_eq!(stored.content["verified"], json!(true));
    }

    #[tokio::test]
    async fn sightings_keep_append_order_and_first_flag() {
        let store = MemoryStore::new();
        let record = Record::from_candidate(candidate("k1", "s1"), Utc::now());
        store.insert(&record).await.unwrap();

        assert!(store
            .record_sighting(&sighting(&record, "s1", true))
            .await
            .unwrap());
        assert!(!store
            .record_sighting(&sighting(&record, "s2", false))
            .await
            .unwrap());
        assert!(!store
            .record_sighting(&sighting(&record, "s1", false))
            .await
            .unwrap());

        let history = store.get_sightings(&record.natural_key).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(
            history.iter().map(|s| s.source.as_str()).collect::<Vec<_>>(),
            vec!["s1", "s2", "s1"]
        );
        assert!(history.windows(2).all(|w| w[0].seen_at <= w[1].seen_at));
    }

    #[tokio::test]
    async fn query_filters_orders_and_windows() {
        let store = MemoryStore::new();
        for (key, source) in [("a", "s1"), ("b", "s1"), ("c", "s2")] {
            store
                .insert(&Record::from_candidate(candidate(key, source), Utc::now()))
                .await
                .unwrap();
        }

        let s1_query = RecordQuery::builder()
            .source("s1")
            .order_by(OrderBy::NaturalKey)
            .build();
        let s1: Vec<Record> = store
            .query(s1_query.clone())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            s1.iter().map(|r| r.natural_key.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(store.count(&s1_query).await.unwrap(), 2);

        let windowed = RecordQuery::builder()
            .order_by(OrderBy::NaturalKey)
            .offset(1)
            .limit(1)
            .build();
        let page: Vec<Record> = store
            .query(windowed)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].natural_key.as_str(), "b");
    }

    #[tokio::test]
    async fn delete_frees_key_but_not_id() {
        let store = MemoryStore::new();
        let record = Record::from_candidate(candidate("k1", "s1"), Utc::now());
        store.insert(&record).await.unwrap();

        assert!(store.delete(record.record_id).await.unwrap());
        assert!(!store.delete(record.record_id).await.unwrap());
        assert!(!store
            .exists_by_natural_key(&record.natural_key)
            .await
            .unwrap());

        // Re-capture mints a fresh id; the old one is never reused.
        let again = Record::from_candidate(candidate("k1", "s1"), Utc::now());
        store.insert(&again).await.unwrap();
        assert_ne!(again.record_id, record.record_id);
    }

    #[tokio::test]
    async fn content_hash_update_rides_on_sighting_path() {
        let store = MemoryStore::new();
        let record = Record::from_candidate(
            candidate("k1", "s1").with_content_hash(),
            Utc::now(),
        );
        store.insert(&record).await.unwrap();

        let mut changed = Content::new();
        changed.insert("title".into(), json!("rewritten"));
        let new_hash = content_hash(&changed);
        store
            .upsert_last_seen(
                record.record_id,
                Utc::now() + chrono::Duration::seconds(1),
                Some(&new_hash),
            )
            .await
            .unwrap();

        let stored = store.get(record.record_id).await.unwrap().unwrap();
        assert_eq!(stored.content_hash.as_deref(), Some(new_hash.as_str()));
        // Content itself is untouched at Bronze.
        assert_eq!(stored.content["title"], json!("item k1"));
    }
}
