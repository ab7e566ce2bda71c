pub mod config;
pub mod error;
pub mod events;
pub mod stats;
pub mod telemetry;
pub mod types;

pub use config::{AdapterConfig, CheckpointConfig, OrchestratorConfig};
pub use error::FeedSpineError;
pub use events::{EventEnvelope, EventKind, FeedEvent, Priority};
pub use stats::{CollectionResult, CollectionStatus, PipelineStats};
pub use types::*;
