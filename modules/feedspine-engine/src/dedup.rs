//! Single-candidate ingestion: one sighting per candidate, one record
//! per distinct normalized key.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use feedspine_core::{FeedSpineError, NaturalKey, Record, RecordCandidate, Sighting, SightingId};
use feedspine_store::RecordStore;

/// What `ingest` hands back to the caller.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub record: Record,
    pub is_new: bool,
    /// A hash was observed that differs from the stored one. The stored
    /// hash and `last_seen_at` advanced; `content` did not (content only
    /// changes through enrichment promotion).
    pub content_changed: bool,
}

/// The dedup core. Serializes the presence-check-then-act sequence
/// per normalized key, so two concurrent ingestions of the same key
/// produce at most one new record and exactly one sighting each.
pub struct DedupEngine {
    store: Arc<dyn RecordStore>,
    key_locks: Mutex<HashMap<NaturalKey, Arc<Mutex<()>>>>,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Ingest one candidate observed by adapter `source`.
    ///
    /// Absent key: persist a fresh Bronze record, then append a sighting
    /// with `is_new = true`. Present key: append a sighting with
    /// `is_new = false` and advance `last_seen_at` (plus the stored hash
    /// when the adapter supplied one). Exactly one sighting either way.
    pub async fn ingest(
        &self,
        candidate: RecordCandidate,
        source: &str,
    ) -> Result<IngestOutcome, FeedSpineError> {
        if source.trim().is_empty() {
            return Err(FeedSpineError::InvalidCandidate(
                "sighting source is empty".to_string(),
            ));
        }

        let key = candidate.natural_key.clone();
        let lock = self.key_lock(&key).await;
        let guard = lock.lock().await;

        let outcome = match self.try_ingest(candidate.clone(), source).await {
            // A writer outside this engine won the insert between our
            // presence check and insert. Retry the find-then-act path
            // once; the key now exists, so it lands on the sighting arm.
            Err(FeedSpineError::DuplicateNaturalKey(_)) => {
                debug!(key = %key, "insert raced, retrying as duplicate");
                self.try_ingest(candidate, source).await
            }
            other => other,
        };

        drop(guard);
        drop(lock);
        self.release_key_lock(&key).await;
        outcome
    }

    async fn try_ingest(
        &self,
        candidate: RecordCandidate,
        source: &str,
    ) -> Result<IngestOutcome, FeedSpineError> {
        let now = Utc::now();
        match self.store.get_by_natural_key(&candidate.natural_key).await? {
            None => {
                let record = Record::from_candidate(candidate, now);
                self.store.insert(&record).await?;
                self.store
                    .record_sighting(&Sighting {
                        sighting_id: SightingId::generate(),
                        natural_key: record.natural_key.clone(),
                        source: source.to_string(),
                        seen_at: now,
                        is_new: true,
                        record_id: record.record_id,
                        content_hash: record.content_hash.clone(),
                    })
                    .await?;
                Ok(IngestOutcome {
                    record,
                    is_new: true,
                    content_changed: false,
                })
            }
            Some(mut existing) => {
                let observed_hash = candidate.content_hash;
                let content_changed = match (&observed_hash, &existing.content_hash) {
                    (Some(observed), Some(stored)) => observed != stored,
                    (Some(_), None) => true,
                    _ => false,
                };

                self.store
                    .record_sighting(&Sighting {
                        sighting_id: SightingId::generate(),
                        natural_key: existing.natural_key.clone(),
                        source: source.to_string(),
                        seen_at: now,
                        is_new: false,
                        record_id: existing.record_id,
                        content_hash: observed_hash.clone(),
                    })
                    .await?;
                self.store
                    .upsert_last_seen(existing.record_id, now, observed_hash.as_deref())
                    .await?;

                if now > existing.last_seen_at {
                    existing.last_seen_at = now;
                }
                if now > existing.updated_at {
                    existing.updated_at = now;
                }
                if let Some(hash) = observed_hash {
                    existing.content_hash = Some(hash);
                }
                Ok(IngestOutcome {
                    record: existing,
                    is_new: false,
                    content_changed,
                })
            }
        }
    }

    async fn key_lock(&self, key: &NaturalKey) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drop the per-key entry once nothing else holds it, keeping the
    /// lock map bounded by in-flight keys rather than all keys ever seen.
    async fn release_key_lock(&self, key: &NaturalKey) {
        let mut locks = self.key_locks.lock().await;
        if let Some(lock) = locks.get(key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(key);
            }
        }
    }
}
