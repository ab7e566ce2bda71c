use thiserror::Error;

use crate::types::{Layer, RecordId};

/// Error taxonomy for the capture engine.
///
/// Kinds the engine matches on (`DuplicateNaturalKey`, `InvalidPromotion`,
/// `Cancelled`) carry enough structure to branch; the rest carry a message.
#[derive(Error, Debug)]
pub enum FeedSpineError {
    /// Candidate validation failure (empty key, malformed timestamp).
    /// Counted in per-adapter stats; the candidate is skipped.
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Race signal from storage: the natural key was inserted concurrently.
    /// The ingest path retries its find-then-act sequence once.
    #[error("duplicate natural key: {0}")]
    DuplicateNaturalKey(String),

    /// Non-monotone layer transition. The record is left unchanged.
    #[error("invalid promotion for record {record_id}: {from} -> {to}")]
    InvalidPromotion {
        record_id: RecordId,
        from: Layer,
        to: Layer,
    },

    #[error("storage error: {0}")]
    Storage(String),

    /// Fetch/parse failure inside an adapter. Closes the adapter,
    /// logged in its stats; other adapters continue.
    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("collection cancelled")]
    Cancelled,

    /// Invalid configuration. Raised synchronously at setup; the only
    /// error `collect()` callers see outside a CollectionResult.
    #[error("configuration error: {0}")]
    Config(String),
}

impl FeedSpineError {
    /// Wrap any storage-backend error.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Wrap any adapter-internal error.
    pub fn adapter(err: impl std::fmt::Display) -> Self {
        Self::Adapter(err.to_string())
    }
}
