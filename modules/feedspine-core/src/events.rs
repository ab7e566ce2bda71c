//! Lifecycle events published on the in-process bus.
//!
//! Payload variants use `#[serde(tag = "type")]` with snake_case tags;
//! the envelope adds the fields every event carries (id, timestamp,
//! emitting component, priority).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stats::CollectionStatus;
use crate::types::{Content, RecordId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Discriminant used for per-type subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CollectionStarted,
    CollectionProgress,
    CollectionCompleted,
    CollectionFailed,
    AdapterStarted,
    AdapterCompleted,
    AdapterFailed,
    RecordDiscovered,
    RecordDuplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    CollectionStarted {
        feeds: Vec<String>,
    },
    CollectionProgress {
        feed: String,
        records_processed: u64,
        records_new: u64,
        records_duplicate: u64,
    },
    CollectionCompleted {
        status: CollectionStatus,
        records_processed: u64,
        records_new: u64,
    },
    CollectionFailed {
        reason: String,
    },
    AdapterStarted {
        adapter_name: String,
    },
    AdapterCompleted {
        adapter_name: String,
        records_processed: u64,
        records_new: u64,
        records_duplicate: u64,
        errors: u64,
    },
    AdapterFailed {
        adapter_name: String,
        error: String,
    },
    RecordDiscovered {
        natural_key: String,
        record_id: RecordId,
        source: String,
        content: Content,
    },
    RecordDuplicate {
        natural_key: String,
        record_id: RecordId,
        source: String,
        /// True when the observed content hash differs from the stored one.
        content_changed: bool,
    },
}

impl FeedEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            FeedEvent::CollectionStarted { .. } => EventKind::CollectionStarted,
            FeedEvent::CollectionProgress { .. } => EventKind::CollectionProgress,
            FeedEvent::CollectionCompleted { .. } => EventKind::CollectionCompleted,
            FeedEvent::CollectionFailed { .. } => EventKind::CollectionFailed,
            FeedEvent::AdapterStarted { .. } => EventKind::AdapterStarted,
            FeedEvent::AdapterCompleted { .. } => EventKind::AdapterCompleted,
            FeedEvent::AdapterFailed { .. } => EventKind::AdapterFailed,
            FeedEvent::RecordDiscovered { .. } => EventKind::RecordDiscovered,
            FeedEvent::RecordDuplicate { .. } => EventKind::RecordDuplicate,
        }
    }

    /// Default publish priority. Failure events are High; the rest Normal.
    pub fn default_priority(&self) -> Priority {
        match self {
            FeedEvent::CollectionFailed { .. } | FeedEvent::AdapterFailed { .. } => Priority::High,
            _ => Priority::Normal,
        }
    }
}

/// What subscribers receive: payload plus the fields every event carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Emitting component, e.g. "orchestrator" or an adapter name.
    pub source: String,
    pub priority: Priority,
    #[serde(flatten)]
    pub event: FeedEvent,
}

impl EventEnvelope {
    pub fn new(source: impl Into<String>, event: FeedEvent) -> Self {
        let priority = event.default_priority();
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            priority,
            event,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_events_default_to_high_priority() {
        let envelope = EventEnvelope::new(
            "orchestrator",
            FeedEvent::AdapterFailed {
                adapter_name: "s1".into(),
                error: "boom".into(),
            },
        );
        assert_eq!(envelope.priority, Priority::High);
        assert_eq!(envelope.kind(), EventKind::AdapterFailed);
    }

    #[test]
    fn envelope_serializes_with_flattened_payload() {
        let envelope = EventEnvelope::new(
            "orchestrator",
            FeedEvent::CollectionStarted {
                feeds: vec!["s1".into()],
            },
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "collection_started");
        assert_eq!(json["source"], "orchestrator");
        assert!(json["event_id"].is_string());
    }
}
