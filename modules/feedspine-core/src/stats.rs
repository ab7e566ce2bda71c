use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Per-feed stats
// ---------------------------------------------------------------------------

/// Counters for one adapter within a collection run.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Total candidates consumed from the adapter.
    pub records_processed: u64,
    pub records_new: u64,
    pub records_duplicate: u64,
    /// Per-candidate and adapter-level errors.
    pub errors: u64,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Collection result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Completed,
    /// At least one adapter failed or the run was cancelled mid-stream.
    Partial,
    Failed,
}

impl std::fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectionStatus::Completed => write!(f, "completed"),
            CollectionStatus::Partial => write!(f, "partial"),
            CollectionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Aggregate of one `collect()` invocation.
#[derive(Debug, Clone)]
pub struct CollectionResult {
    /// Per-feed stats, keyed by adapter name. BTreeMap keeps the report
    /// deterministic.
    pub per_feed: BTreeMap<String, PipelineStats>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: CollectionStatus,
}

impl CollectionResult {
    pub fn records_processed(&self) -> u64 {
        self.per_feed.values().map(|s| s.records_processed).sum()
    }

    pub fn records_new(&self) -> u64 {
        self.per_feed.values().map(|s| s.records_new).sum()
    }

    pub fn records_duplicate(&self) -> u64 {
        self.per_feed.values().map(|s| s.records_duplicate).sum()
    }

    pub fn errors(&self) -> u64 {
        self.per_feed.values().map(|s| s.errors).sum()
    }
}

impl std::fmt::Display for CollectionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Collection {} ===", self.status)?;
        writeln!(f, "Processed:  {}", self.records_processed())?;
        writeln!(f, "New:        {}", self.records_new())?;
        writeln!(f, "Duplicates: {}", self.records_duplicate())?;
        writeln!(f, "Errors:     {}", self.errors())?;
        writeln!(
            f,
            "Elapsed:    {:.1}s",
            (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
        )?;
        writeln!(f, "\nBy feed:")?;
        for (name, stats) in &self.per_feed {
            writeln!(
                f,
                "  {name}: {} processed, {} new, {} dup, {} errors in {:.1}s",
                stats.records_processed,
                stats.records_new,
                stats.records_duplicate,
                stats.errors,
                stats.duration.as_secs_f64()
            )?;
        }
        Ok(())
    }
}
