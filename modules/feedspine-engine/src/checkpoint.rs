//! Per-feed progress persistence and resume.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use feedspine_core::{Checkpoint, CheckpointConfig, FeedSpineError};

use crate::adapter::FeedAdapter;

// ---------------------------------------------------------------------------
// CheckpointStore — where checkpoints live
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Atomic write of a named checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), FeedSpineError>;

    async fn load(&self, feed_name: &str) -> Result<Option<Checkpoint>, FeedSpineError>;

    async fn delete(&self, feed_name: &str) -> Result<(), FeedSpineError>;
}

/// Ephemeral store for tests and single-run collections.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), FeedSpineError> {
        self.inner
            .write()
            .await
            .insert(checkpoint.feed_name.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, feed_name: &str) -> Result<Option<Checkpoint>, FeedSpineError> {
        Ok(self.inner.read().await.get(feed_name).cloned())
    }

    async fn delete(&self, feed_name: &str) -> Result<(), FeedSpineError> {
        self.inner.write().await.remove(feed_name);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Filesystem store — one JSON file per feed
// ---------------------------------------------------------------------------

/// Self-describing JSON files under one directory. With `atomic_write`
/// (the default) saves go write-temp → persist(rename) → fsync the
/// directory, so a crash never leaves a torn checkpoint.
pub struct FsCheckpointStore {
    dir: PathBuf,
    atomic_write: bool,
}

impl FsCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            atomic_write: true,
        }
    }

    pub fn with_atomic_write(mut self, atomic_write: bool) -> Self {
        self.atomic_write = atomic_write;
        self
    }

    fn path_for(&self, feed_name: &str) -> PathBuf {
        // Feed names become file names; anything non-alphanumeric
        // collapses to '-'.
        let slug: String = feed_name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect();
        self.dir.join(format!("{slug}.json"))
    }

    fn write_sync(
        dir: &Path,
        path: &Path,
        payload: Vec<u8>,
        atomic: bool,
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        if atomic {
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&payload)?;
            tmp.flush()?;
            tmp.as_file().sync_all()?;
            tmp.persist(path).map_err(|e| e.error)?;
            // Make the rename itself durable.
            std::fs::File::open(dir)?.sync_all()?;
        } else {
            std::fs::write(path, payload)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), FeedSpineError> {
        let payload =
            serde_json::to_vec_pretty(checkpoint).map_err(FeedSpineError::storage)?;
        let dir = self.dir.clone();
        let path = self.path_for(&checkpoint.feed_name);
        let atomic = self.atomic_write;
        tokio::task::spawn_blocking(move || Self::write_sync(&dir, &path, payload, atomic))
            .await
            .map_err(FeedSpineError::storage)?
            .map_err(FeedSpineError::storage)
    }

    async fn load(&self, feed_name: &str) -> Result<Option<Checkpoint>, FeedSpineError> {
        let path = self.path_for(feed_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(FeedSpineError::storage)?,
            )),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(FeedSpineError::storage(err)),
        }
    }

    async fn delete(&self, feed_name: &str) -> Result<(), FeedSpineError> {
        match tokio::fs::remove_file(self.path_for(feed_name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(FeedSpineError::storage(err)),
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager — the save policy
// ---------------------------------------------------------------------------

struct FeedProgress {
    records_since_save: u64,
    last_save: Instant,
}

/// Wraps a store with the save policy: every `interval_records` records,
/// every `interval` of wall time, and unconditionally on flush.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    config: CheckpointConfig,
    progress: Mutex<HashMap<String, FeedProgress>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, config: CheckpointConfig) -> Self {
        Self {
            store,
            config,
            progress: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(&self, feed_name: &str) -> Option<Checkpoint> {
        match self.store.load(feed_name).await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(feed = feed_name, error = %err, "checkpoint load failed");
                None
            }
        }
    }

    pub async fn delete(&self, feed_name: &str) {
        if let Err(err) = self.store.delete(feed_name).await {
            warn!(feed = feed_name, error = %err, "checkpoint delete failed");
        }
    }

    /// Called after every processed candidate. Saves when due.
    pub async fn observe(&self, adapter: &dyn FeedAdapter, records_processed: u64) {
        let due = {
            let mut progress = self.progress.lock().await;
            let entry = progress
                .entry(adapter.name().to_string())
                .or_insert_with(|| FeedProgress {
                    records_since_save: 0,
                    last_save: Instant::now(),
                });
            entry.records_since_save += 1;
            if entry.records_since_save >= self.config.interval_records
                || entry.last_save.elapsed() >= self.config.interval
            {
                entry.records_since_save = 0;
                entry.last_save = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            self.save_now(adapter, records_processed).await;
        }
    }

    /// Unconditional save. Called on completion, cancellation, and
    /// graceful shutdown.
    pub async fn flush(&self, adapter: &dyn FeedAdapter, records_processed: u64) {
        self.save_now(adapter, records_processed).await;
        let mut progress = self.progress.lock().await;
        if let Some(entry) = progress.get_mut(adapter.name()) {
            entry.records_since_save = 0;
            entry.last_save = Instant::now();
        }
    }

    async fn save_now(&self, adapter: &dyn FeedAdapter, records_processed: u64) {
        let Some(mut checkpoint) = adapter.current_checkpoint().await else {
            return;
        };
        checkpoint.records_processed = records_processed;
        checkpoint.saved_at = Utc::now();
        match self.store.save(&checkpoint).await {
            Ok(()) => debug!(feed = adapter.name(), records = records_processed, "checkpoint saved"),
            Err(err) => warn!(feed = adapter.name(), error = %err, "checkpoint save failed"),
        }
    }
}
