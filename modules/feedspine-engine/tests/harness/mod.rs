//! Shared test fixtures: a scripted adapter with failure/delay/resume
//! injection, and an event collector.
//!
//! Each integration binary compiles its own copy; not every binary uses
//! every helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::Mutex;

use feedspine_core::{
    Checkpoint, Content, EventEnvelope, FeedSpineError, Metadata, RecordCandidate,
};
use feedspine_engine::{EventBus, FeedAdapter};

pub fn candidate(key: &str, source: &str) -> RecordCandidate {
    let mut content = Content::new();
    content.insert("key".into(), json!(key));
    RecordCandidate::new(key, content, Metadata::new(source).unwrap())
        .unwrap()
        .with_content_hash()
}

/// Scripted candidate source. Counts opens/closes/emissions, optionally
/// fails at a given index, optionally sleeps between items, and resumes
/// from an integer cursor.
pub struct ScriptedAdapter {
    name: String,
    keys: Vec<String>,
    /// Emit an adapter error before the item at this index.
    fail_at: Option<usize>,
    delay: Option<Duration>,
    supports_resume: bool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    emitted: AtomicUsize,
    /// Next index to emit; advanced as items go out, set by resume.
    cursor: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(name: &str, keys: &[&str]) -> Self {
        Self::from_keys(name, keys.iter().map(|k| k.to_string()).collect())
    }

    pub fn from_keys(name: &str, keys: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            keys,
            fail_at: None,
            delay: None,
            supports_resume: false,
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            emitted: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn resumable(mut self) -> Self {
        self.supports_resume = true;
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), FeedSpineError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), FeedSpineError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fetch(&self) -> BoxStream<'_, Result<RecordCandidate, FeedSpineError>> {
        let start = self.cursor.load(Ordering::SeqCst);
        async_stream::stream! {
            for index in start..self.keys.len() {
                if self.fail_at == Some(index) {
                    yield Err(FeedSpineError::Adapter(format!(
                        "{} scripted failure at {index}",
                        self.name
                    )));
                    return;
                }
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.emitted.fetch_add(1, Ordering::SeqCst);
                self.cursor.store(index + 1, Ordering::SeqCst);
                yield Ok(candidate(&self.keys[index], &self.name));
            }
        }
        .boxed()
    }

    async fn resume(&self, checkpoint: &Checkpoint) -> Result<(), FeedSpineError> {
        if !self.supports_resume {
            return Ok(());
        }
        let position = checkpoint.cursor.as_u64().unwrap_or(0) as usize;
        self.cursor.store(position.min(self.keys.len()), Ordering::SeqCst);
        Ok(())
    }

    async fn current_checkpoint(&self) -> Option<Checkpoint> {
        if !self.supports_resume {
            return None;
        }
        Some(Checkpoint::new(
            self.name.clone(),
            json!(self.cursor.load(Ordering::SeqCst)),
        ))
    }
}

/// Collects every envelope published on a bus.
pub struct EventCollector {
    pub events: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl EventCollector {
    pub fn attach(bus: &EventBus) -> Self {
        let events: Arc<Mutex<Vec<EventEnvelope>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            bus.subscribe_all(move |envelope| {
                let events = events.clone();
                async move {
                    events.lock().await.push(envelope);
                    Ok(())
                }
            });
        }
        Self { events }
    }

    pub async fn kinds(&self) -> Vec<feedspine_core::EventKind> {
        self.events.lock().await.iter().map(|e| e.kind()).collect()
    }
}
