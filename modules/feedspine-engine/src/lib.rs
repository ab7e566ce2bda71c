//! The capture engine: exact-match deduplication with sighting history,
//! layer promotion through pluggable enrichment, checkpointed resumable
//! collection, and an orchestrator tying adapters to storage.

pub mod adapter;
pub mod bus;
pub mod cancel;
pub mod checkpoint;
pub mod dedup;
pub mod enrich;
pub mod orchestrator;
pub mod resources;

pub use adapter::FeedAdapter;
pub use bus::{EventBus, Subscription};
pub use cancel::CancelHandle;
pub use checkpoint::{
    CheckpointManager, CheckpointStore, FsCheckpointStore, MemoryCheckpointStore,
};
pub use dedup::{DedupEngine, IngestOutcome};
pub use enrich::{Enricher, EnrichmentChain, EnrichmentResult};
pub use orchestrator::Orchestrator;
pub use resources::{RateLimiter, ResourcePool};
