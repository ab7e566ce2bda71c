//! The contract a feed source satisfies.

use async_trait::async_trait;
use futures::stream::BoxStream;

use feedspine_core::{Checkpoint, FeedSpineError, RecordCandidate};

/// A named, async producer of record candidates.
///
/// Adapters own their pacing (rate limiting through the shared
/// `ResourcePool`), their parsing, and emit candidates whose keys are
/// already normalized by construction. `fetch` may be finite (one-shot
/// pulls) or effectively infinite (watches); the orchestrator consumes
/// until exhaustion or cancellation.
#[async_trait]
pub trait FeedAdapter: Send + Sync {
    /// Unique per orchestrator; becomes `Sighting.source`.
    fn name(&self) -> &str;

    async fn open(&self) -> Result<(), FeedSpineError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), FeedSpineError> {
        Ok(())
    }

    /// Lazy candidate stream. An `Err` item is an adapter failure: the
    /// orchestrator closes the adapter and moves on.
    fn fetch(&self) -> BoxStream<'_, Result<RecordCandidate, FeedSpineError>>;

    /// Initialize from a prior cursor. Default: checkpoints are ignored.
    async fn resume(&self, _checkpoint: &Checkpoint) -> Result<(), FeedSpineError> {
        Ok(())
    }

    /// Current progress for persistence. Default: nothing to persist.
    async fn current_checkpoint(&self) -> Option<Checkpoint> {
        None
    }
}
