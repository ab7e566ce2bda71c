use std::collections::HashMap;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::error::FeedSpineError;

/// Orchestrator tuning knobs. The collaborators themselves (storage,
/// event bus, resource pool, checkpoint store) are constructor arguments;
/// this holds the scalar options.
#[derive(Debug, Clone, TypedBuilder)]
pub struct OrchestratorConfig {
    /// Capacity of the streaming buffers. Backpressure bound.
    #[builder(default = 1000)]
    pub buffer_capacity: usize,

    /// Max adapters fetching concurrently in `collect_parallel`.
    /// None = unbounded.
    #[builder(default, setter(strip_option))]
    pub max_concurrent: Option<usize>,

    #[builder(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl OrchestratorConfig {
    /// Validate at construction time. The only path that raises outside a
    /// CollectionResult.
    pub fn validate(&self) -> Result<(), FeedSpineError> {
        if self.buffer_capacity < 1 {
            return Err(FeedSpineError::Config(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent == Some(0) {
            return Err(FeedSpineError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        self.checkpoint.validate()
    }
}

/// Checkpoint save policy.
#[derive(Debug, Clone, TypedBuilder)]
pub struct CheckpointConfig {
    /// Save after this many records per feed.
    #[builder(default = 100)]
    pub interval_records: u64,

    /// Save at least this often while a feed is producing.
    #[builder(default = Duration::from_secs(60))]
    pub interval: Duration,

    /// Filesystem stores write-to-temp then rename when set.
    #[builder(default = true)]
    pub atomic_write: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<(), FeedSpineError> {
        if self.interval_records == 0 {
            return Err(FeedSpineError::Config(
                "checkpoint interval_records must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-adapter options. Adapter-specific settings (url, headers, params)
/// ride along for the adapter's own use; the engine reads only
/// `requests_per_second` and `timeout`.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct AdapterConfig {
    /// Token-bucket pacing applied to pulls from this adapter's stream.
    #[builder(default, setter(strip_option))]
    pub requests_per_second: Option<f64>,

    /// Per-item fetch timeout. Firing closes the adapter with one error
    /// in its stats.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,

    #[builder(default, setter(strip_option, into))]
    pub url: Option<String>,

    #[builder(default)]
    pub headers: HashMap<String, String>,

    #[builder(default)]
    pub params: HashMap<String, String>,
}
