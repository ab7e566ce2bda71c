use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FeedSpineError;

/// Open content bag: string keys to JSON-shaped values.
///
/// `serde_json::Map` keeps keys in sorted order (BTreeMap-backed without
/// the `preserve_order` feature), but `content_hash` sorts explicitly so
/// the fingerprint never depends on map internals.
pub type Content = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Layer — Bronze < Silver < Gold
// ---------------------------------------------------------------------------

/// Data-quality tier. Strict total order; records only move up.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Bronze,
    Silver,
    Gold,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Bronze => write!(f, "bronze"),
            Layer::Silver => write!(f, "silver"),
            Layer::Gold => write!(f, "gold"),
        }
    }
}

impl std::str::FromStr for Layer {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bronze" => Ok(Self::Bronze),
            "silver" => Ok(Self::Silver),
            "gold" => Ok(Self::Gold),
            other => Err(format!("unknown Layer: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Record identifier. UUIDv7 — time-ordered, so the canonical string form
/// sorts lexicographically by creation time. Never reused; deletion does
/// not free the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RecordId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Sighting identifier. Random v4 — sightings are append-only events,
/// ordering comes from `seen_at`, not the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SightingId(Uuid);

impl SightingId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for SightingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SightingId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// NaturalKey — the dedup key
// ---------------------------------------------------------------------------

/// Source-assigned identifier, normalized (trim + lowercase) at
/// construction. Normalization is part of the type: two keys that differ
/// only in surrounding whitespace or letter case are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Normalize and validate. Rejects keys that are empty after trimming.
    pub fn new(raw: &str) -> Result<Self, FeedSpineError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(FeedSpineError::InvalidCandidate(
                "natural key is empty after normalization".to_string(),
            ));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for NaturalKey {
    type Error = FeedSpineError;
    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(&raw)
    }
}

impl From<NaturalKey> for String {
    fn from(key: NaturalKey) -> String {
        key.0
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Attached to every record: where it came from and what it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Metadata {
    /// Name of the originating feed. Required, non-empty.
    pub source: String,
    /// Free-form type tag (e.g. "article", "filing", "row").
    #[serde(default)]
    pub record_type: String,
    /// Open extension mapping.
    #[serde(default)]
    pub extra: Content,
}

impl Metadata {
    pub fn new(source: impl Into<String>) -> Result<Self, FeedSpineError> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(FeedSpineError::InvalidCandidate(
                "metadata source is empty".to_string(),
            ));
        }
        Ok(Self {
            source,
            record_type: String::new(),
            extra: Content::new(),
        })
    }

    pub fn with_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_type = record_type.into();
        self
    }
}

// ---------------------------------------------------------------------------
// RecordCandidate — an unpersisted observation
// ---------------------------------------------------------------------------

/// What an adapter emits: one observation of a natural key, not yet
/// persisted. The constructor normalizes the key and validates metadata,
/// so a candidate that exists is a candidate the engine will accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordCandidate {
    pub natural_key: NaturalKey,
    /// Timestamp the *source* asserts for the item. UTC; adapters reject
    /// naive local times at the parse boundary.
    pub published_at: Option<DateTime<Utc>>,
    pub content: Content,
    pub metadata: Metadata,
    /// Optional canonical fingerprint of `content` for change detection.
    pub content_hash: Option<String>,
}

impl RecordCandidate {
    pub fn new(
        raw_key: &str,
        content: Content,
        metadata: Metadata,
    ) -> Result<Self, FeedSpineError> {
        Ok(Self {
            natural_key: NaturalKey::new(raw_key)?,
            published_at: None,
            content,
            metadata,
            content_hash: None,
        })
    }

    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }

    /// Attach the canonical content fingerprint.
    pub fn with_content_hash(mut self) -> Self {
        self.content_hash = Some(content_hash(&self.content));
        self
    }
}

// ---------------------------------------------------------------------------
// Record — a persisted candidate with identity and lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub record_id: RecordId,
    pub natural_key: NaturalKey,
    pub published_at: Option<DateTime<Utc>>,
    pub content: Content,
    pub metadata: Metadata,
    pub content_hash: Option<String>,
    pub layer: Layer,
    /// First persistence timestamp.
    pub captured_at: DateTime<Utc>,
    /// Last mutation timestamp. Advances on every sighting and promotion.
    pub updated_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Record {
    /// Build a fresh Bronze record from a candidate at time `now`.
    /// All four timestamps start equal, satisfying
    /// `captured_at <= first_seen_at <= last_seen_at <= updated_at`.
    pub fn from_candidate(candidate: RecordCandidate, now: DateTime<Utc>) -> Self {
        Self {
            record_id: RecordId::generate(),
            natural_key: candidate.natural_key,
            published_at: candidate.published_at,
            content: candidate.content,
            metadata: candidate.metadata,
            content_hash: candidate.content_hash,
            layer: Layer::Bronze,
            captured_at: now,
            updated_at: now,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Check the timestamp monotonicity invariant.
    pub fn timestamps_monotone(&self) -> bool {
        self.captured_at <= self.first_seen_at
            && self.first_seen_at <= self.last_seen_at
            && self.last_seen_at <= self.updated_at
    }
}

// ---------------------------------------------------------------------------
// Sighting — one observation event, append-only
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sighting {
    pub sighting_id: SightingId,
    pub natural_key: NaturalKey,
    /// Adapter name that observed it.
    pub source: String,
    pub seen_at: DateTime<Utc>,
    /// True iff this sighting created a new Record.
    pub is_new: bool,
    pub record_id: RecordId,
    /// The hash observed *this time*, for change detection.
    pub content_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Checkpoint — per-feed progress marker
// ---------------------------------------------------------------------------

/// Opaque per-feed cursor. The engine never interprets `cursor`; adapters
/// that implement `resume` must accept any cursor they previously emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub feed_name: String,
    pub cursor: serde_json::Value,
    pub records_processed: u64,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(feed_name: impl Into<String>, cursor: serde_json::Value) -> Self {
        Self {
            feed_name: feed_name.into(),
            cursor,
            records_processed: 0,
            saved_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Content hashing
// ---------------------------------------------------------------------------

/// Canonical SHA-256 fingerprint of a content bag, hex-encoded.
///
/// Keys are sorted at every nesting level before serialization, so two
/// bags that differ only in field order hash identically.
pub fn content_hash(content: &Content) -> String {
    use sha2::{Digest, Sha256};
    let mut canonical = String::new();
    write_canonical(&serde_json::Value::Object(content.clone()), &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content(pairs: &[(&str, serde_json::Value)]) -> Content {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn natural_key_normalizes_trim_and_case() {
        let a = NaturalKey::new("  AbC-123  ").unwrap();
        let b = NaturalKey::new("abc-123").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "abc-123");
    }

    #[test]
    fn natural_key_rejects_whitespace_only() {
        assert!(matches!(
            NaturalKey::new("   "),
            Err(FeedSpineError::InvalidCandidate(_))
        ));
    }

    #[test]
    fn natural_key_deserializes_normalized() {
        let key: NaturalKey = serde_json::from_str("\"  XyZ \"").unwrap();
        assert_eq!(key.as_str(), "xyz");
    }

    #[test]
    fn metadata_requires_source() {
        assert!(Metadata::new("").is_err());
        assert!(Metadata::new("  ").is_err());
        assert!(Metadata::new("sec-rss").is_ok());
    }

    #[test]
    fn layer_total_order() {
        assert!(Layer::Bronze < Layer::Silver);
        assert!(Layer::Silver < Layer::Gold);
        assert_eq!("silver".parse::<Layer>().unwrap(), Layer::Silver);
    }

    #[test]
    fn record_id_string_form_sorts_by_time() {
        let earlier = RecordId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let later = RecordId::generate();
        assert!(earlier.to_string() < later.to_string());
    }

    #[test]
    fn content_hash_stable_under_field_order() {
        let a = content(&[("x", json!(1)), ("y", json!({"b": 2, "a": [1, 2]}))]);
        let mut b = Content::new();
        b.insert("y".into(), json!({"a": [1, 2], "b": 2}));
        b.insert("x".into(), json!(1));
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_hash_differs_on_value_change() {
        let a = content(&[("x", json!(1))]);
        let b = content(&[("x", json!(2))]);
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn fresh_record_timestamps_monotone() {
        let candidate = RecordCandidate::new(
            "key-1",
            content(&[("t", json!(1))]),
            Metadata::new("s1").unwrap(),
        )
        .unwrap();
        let record = Record::from_candidate(candidate, Utc::now());
        assert!(record.timestamps_monotone());
        assert_eq!(record.layer, Layer::Bronze);
    }
}
