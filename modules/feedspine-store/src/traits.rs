//! The storage contract the capture engine consumes.
//!
//! The invariants here are properties of the contract, not of any one
//! backend: natural-key uniqueness is strongly consistent within a
//! store, sighting appends per key are totally ordered and durable
//! before `record_sighting` returns, and `query` results are
//! snapshot-consistent per call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use typed_builder::TypedBuilder;

use feedspine_core::{Content, FeedSpineError, Layer, NaturalKey, Record, RecordId, Sighting};

/// Sort key for `query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    CapturedAt,
    PublishedAt,
    NaturalKey,
}

/// Declarative record query: metadata filters, optional layer, ordering,
/// and a limit/offset window.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct RecordQuery {
    /// Match `metadata.source` exactly.
    #[builder(default, setter(strip_option, into))]
    pub source: Option<String>,
    /// Match `metadata.record_type` exactly.
    #[builder(default, setter(strip_option, into))]
    pub record_type: Option<String>,
    #[builder(default, setter(strip_option))]
    pub layer: Option<Layer>,
    #[builder(default)]
    pub order_by: OrderBy,
    #[builder(default, setter(strip_option))]
    pub limit: Option<usize>,
    #[builder(default)]
    pub offset: usize,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Prepare the backend (connections, schema). Called once before use.
    async fn initialize(&self) -> Result<(), FeedSpineError>;

    /// Release all resources. Must be safe on every exit path.
    async fn close(&self) -> Result<(), FeedSpineError>;

    /// Persist a new record. Fails with `DuplicateNaturalKey` if the
    /// normalized key already maps to a record.
    async fn insert(&self, record: &Record) -> Result<(), FeedSpineError>;

    /// Advance `last_seen_at` (monotone — never decreases) and, when
    /// supplied, replace `content_hash`. `updated_at` advances with it.
    async fn upsert_last_seen(
        &self,
        record_id: RecordId,
        seen_at: DateTime<Utc>,
        content_hash: Option<&str>,
    ) -> Result<(), FeedSpineError>;

    /// Persist an enrichment promotion. Fails with `InvalidPromotion`
    /// unless `new_layer` is strictly above the current layer.
    async fn update_layer(
        &self,
        record_id: RecordId,
        new_layer: Layer,
        merged_content: Content,
        updated_at: DateTime<Utc>,
    ) -> Result<(), FeedSpineError>;

    async fn get(&self, record_id: RecordId) -> Result<Option<Record>, FeedSpineError>;

    async fn get_by_natural_key(&self, key: &NaturalKey)
        -> Result<Option<Record>, FeedSpineError>;

    async fn exists_by_natural_key(&self, key: &NaturalKey) -> Result<bool, FeedSpineError>;

    /// Returns true if a record was deleted. The id is never reused.
    async fn delete(&self, record_id: RecordId) -> Result<bool, FeedSpineError>;

    /// Lazy, snapshot-consistent record scan.
    fn query(&self, query: RecordQuery) -> BoxStream<'_, Result<Record, FeedSpineError>>;

    async fn count(&self, query: &RecordQuery) -> Result<u64, FeedSpineError>;

    /// Append a sighting. Returns true iff it is the first sighting for
    /// its natural key. Atomic with respect to concurrent calls for the
    /// same key.
    async fn record_sighting(&self, sighting: &Sighting) -> Result<bool, FeedSpineError>;

    /// All sightings for a key in ascending `seen_at` order (ties keep
    /// append order).
    async fn get_sightings(&self, key: &NaturalKey) -> Result<Vec<Sighting>, FeedSpineError>;
}
