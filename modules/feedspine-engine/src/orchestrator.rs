//! The top-level engine: binds adapters, storage, the enrichment chain,
//! checkpoints, resources, and the event bus, and exposes the three
//! collection modes plus a raw-candidate pipeline factory.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::{pin_mut, StreamExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use feedspine_core::{
    AdapterConfig, CollectionResult, CollectionStatus, EventEnvelope, FeedEvent, FeedSpineError,
    OrchestratorConfig, PipelineStats, Record, RecordCandidate,
};
use feedspine_store::RecordStore;
use feedspine_stream::{amerge_bounded, Pipeline};

use crate::adapter::FeedAdapter;
use crate::bus::EventBus;
use crate::cancel::CancelHandle;
use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::dedup::DedupEngine;
use crate::enrich::{EnrichmentChain, Enricher};
use crate::resources::{RateLimiter, ResourcePool};

const PROGRESS_EVERY: u64 = 100;

#[derive(Default)]
struct RunState {
    per_feed: BTreeMap<String, PipelineStats>,
    adapter_failed: bool,
    failed: bool,
}

/// Everything a run needs, cloned out of the orchestrator so the record
/// streams own their dependencies.
#[derive(Clone)]
struct RunContext {
    storage: Arc<dyn RecordStore>,
    dedup: Arc<DedupEngine>,
    chain: EnrichmentChain,
    bus: Arc<EventBus>,
    checkpoints: Option<Arc<CheckpointManager>>,
    cancel: CancelHandle,
    state: Arc<Mutex<RunState>>,
}

enum CollectMode {
    Sequential,
    Parallel(usize),
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    storage: Arc<dyn RecordStore>,
    dedup: Arc<DedupEngine>,
    adapters: Vec<(Arc<dyn FeedAdapter>, AdapterConfig)>,
    chain: EnrichmentChain,
    bus: Arc<EventBus>,
    resources: Arc<ResourcePool>,
    checkpoints: Option<Arc<CheckpointManager>>,
    cancel: CancelHandle,
}

impl Orchestrator {
    /// Validates configuration up front; the only fallible setup path.
    pub fn new(
        storage: Arc<dyn RecordStore>,
        config: OrchestratorConfig,
    ) -> Result<Self, FeedSpineError> {
        config.validate()?;
        let resources = Arc::new(ResourcePool::new(None, config.max_concurrent)?);
        resources.open();
        Ok(Self {
            dedup: Arc::new(DedupEngine::new(storage.clone())),
            storage,
            config,
            adapters: Vec::new(),
            chain: EnrichmentChain::new(),
            bus: Arc::new(EventBus::new()),
            resources,
            checkpoints: None,
            cancel: CancelHandle::new(),
        })
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_resources(mut self, resources: Arc<ResourcePool>) -> Self {
        resources.open();
        self.resources = resources;
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(Arc::new(CheckpointManager::new(
            store,
            self.config.checkpoint.clone(),
        )));
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn resources(&self) -> &Arc<ResourcePool> {
        &self.resources
    }

    /// Shared flag for stopping a run in flight.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Register an adapter under its name. Names are unique.
    pub fn register_feed(&mut self, adapter: Arc<dyn FeedAdapter>) -> Result<(), FeedSpineError> {
        self.register_feed_with(adapter, AdapterConfig::default())
    }

    pub fn register_feed_with(
        &mut self,
        adapter: Arc<dyn FeedAdapter>,
        config: AdapterConfig,
    ) -> Result<(), FeedSpineError> {
        let name = adapter.name();
        if name.trim().is_empty() {
            return Err(FeedSpineError::Config("adapter name is empty".to_string()));
        }
        if self.adapters.iter().any(|(a, _)| a.name() == name) {
            return Err(FeedSpineError::Config(format!("duplicate feed: {name}")));
        }
        self.adapters.push((adapter, config));
        Ok(())
    }

    /// Insert an enricher at `order` (default: append).
    pub fn register_enricher(&mut self, enricher: Arc<dyn Enricher>, order: Option<i32>) {
        self.chain.register(enricher, order);
    }

    /// Release shared resources. Call when done with the orchestrator;
    /// safe after cancellation.
    pub fn shutdown(&self) {
        self.resources.close();
    }

    // -----------------------------------------------------------------
    // Collection modes
    // -----------------------------------------------------------------

    /// Run every adapter to completion and materialize the aggregate.
    /// Never raises; failures land in the result status and stats.
    pub async fn collect(&self) -> CollectionResult {
        let started_at = Utc::now();
        let (records, state) = self.run_with(CollectMode::Sequential);
        pin_mut!(records);
        while records.next().await.is_some() {}

        let state = state.lock().await;
        CollectionResult {
            per_feed: state.per_feed.clone(),
            started_at,
            finished_at: Utc::now(),
            status: self.status_of(&state),
        }
    }

    /// Lazily yield each newly persisted record, adapters run in
    /// registration order. Duplicates generate sightings but are not
    /// yielded. Constant memory in feed size.
    pub fn collect_stream(&self) -> BoxStream<'static, Record> {
        self.run_with(CollectMode::Sequential).0
    }

    /// Like `collect_stream` with all adapters merged concurrently, at
    /// most `max_concurrent` actively fetching.
    pub fn collect_parallel(&self, max_concurrent: usize) -> BoxStream<'static, Record> {
        self.run_with(CollectMode::Parallel(max_concurrent.max(1))).0
    }

    /// Raw-candidate pipeline over every registered adapter. Callers
    /// bypassing `collect_stream` own dedup and storage themselves.
    pub fn pipeline(&self) -> Pipeline<RecordCandidate> {
        let adapters = self.adapters.clone();
        Pipeline::new(stream! {
            for (adapter, _config) in adapters {
                let name = adapter.name().to_string();
                if let Err(err) = adapter.open().await {
                    warn!(feed = %name, error = %err, "adapter open failed");
                    continue;
                }
                {
                    let fetch = adapter.fetch();
                    pin_mut!(fetch);
                    while let Some(item) = fetch.next().await {
                        match item {
                            Ok(candidate) => yield candidate,
                            Err(err) => {
                                warn!(feed = %name, error = %err, "adapter failed mid-stream");
                                break;
                            }
                        }
                    }
                }
                if let Err(err) = adapter.close().await {
                    warn!(feed = %name, error = %err, "adapter close failed");
                }
            }
        })
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn status_of(&self, state: &RunState) -> CollectionStatus {
        if state.failed {
            CollectionStatus::Failed
        } else if self.cancel.is_cancelled() || state.adapter_failed {
            CollectionStatus::Partial
        } else {
            CollectionStatus::Completed
        }
    }

    fn context(&self) -> RunContext {
        RunContext {
            storage: self.storage.clone(),
            dedup: self.dedup.clone(),
            chain: self.chain.clone(),
            bus: self.bus.clone(),
            checkpoints: self.checkpoints.clone(),
            cancel: self.cancel.clone(),
            state: Arc::new(Mutex::new(RunState::default())),
        }
    }

    fn run_with(&self, mode: CollectMode) -> (BoxStream<'static, Record>, Arc<Mutex<RunState>>) {
        let ctx = self.context();
        let state = ctx.state.clone();
        let adapters = self.adapters.clone();
        let capacity = self.config.buffer_capacity;

        let records = stream! {
            let feeds: Vec<String> = adapters.iter().map(|(a, _)| a.name().to_string()).collect();
            ctx.bus.publish(EventEnvelope::new(
                "orchestrator",
                FeedEvent::CollectionStarted { feeds },
            ));

            if let Err(err) = ctx.storage.initialize().await {
                warn!(error = %err, "storage initialization failed, aborting run");
                ctx.state.lock().await.failed = true;
                ctx.bus.publish(EventEnvelope::new(
                    "orchestrator",
                    FeedEvent::CollectionFailed {
                        reason: err.to_string(),
                    },
                ));
            } else {
                match mode {
                    CollectMode::Sequential => {
                        for (adapter, config) in adapters {
                            if ctx.cancel.is_cancelled() {
                                break;
                            }
                            let feed = Self::feed_stream(ctx.clone(), adapter, config);
                            pin_mut!(feed);
                            while let Some(record) = feed.next().await {
                                yield record;
                            }
                        }
                    }
                    CollectMode::Parallel(max_concurrent) => {
                        let feeds: Vec<BoxStream<'static, Record>> = adapters
                            .into_iter()
                            .map(|(adapter, config)| {
                                Self::feed_stream(ctx.clone(), adapter, config)
                            })
                            .collect();
                        let merged = amerge_bounded(feeds, capacity, Some(max_concurrent));
                        pin_mut!(merged);
                        while let Some(record) = merged.next().await {
                            yield record;
                        }
                    }
                }

                let state = ctx.state.lock().await;
                let processed: u64 = state.per_feed.values().map(|s| s.records_processed).sum();
                let new: u64 = state.per_feed.values().map(|s| s.records_new).sum();
                let status = if ctx.cancel.is_cancelled() || state.adapter_failed {
                    CollectionStatus::Partial
                } else {
                    CollectionStatus::Completed
                };
                drop(state);
                info!(processed, new, %status, "collection finished");
                ctx.bus.publish(EventEnvelope::new(
                    "orchestrator",
                    FeedEvent::CollectionCompleted {
                        status,
                        records_processed: processed,
                        records_new: new,
                    },
                ));
            }
        }
        .boxed();

        (records, state)
    }

    /// Drive one adapter end to end: open, resume, fetch/ingest/enrich,
    /// close, checkpoint flush, stats. Failures here stay local to the
    /// adapter.
    fn feed_stream(
        ctx: RunContext,
        adapter: Arc<dyn FeedAdapter>,
        config: AdapterConfig,
    ) -> BoxStream<'static, Record> {
        stream! {
            let name = adapter.name().to_string();
            let started = Instant::now();
            let mut stats = PipelineStats::default();
            let mut failed = false;

            ctx.bus.publish(EventEnvelope::new(
                name.as_str(),
                FeedEvent::AdapterStarted {
                    adapter_name: name.clone(),
                },
            ));

            match adapter.open().await {
                Err(err) => {
                    warn!(feed = %name, error = %err, "adapter open failed");
                    stats.errors += 1;
                    failed = true;
                    ctx.bus.publish(EventEnvelope::new(
                        name.as_str(),
                        FeedEvent::AdapterFailed {
                            adapter_name: name.clone(),
                            error: err.to_string(),
                        },
                    ));
                }
                Ok(()) => {
                    if let Some(manager) = &ctx.checkpoints {
                        if let Some(checkpoint) = manager.load(&name).await {
                            info!(feed = %name, records = checkpoint.records_processed, "resuming from checkpoint");
                            if let Err(err) = adapter.resume(&checkpoint).await {
                                warn!(feed = %name, error = %err, "resume failed, starting fresh");
                            }
                        }
                    }

                    let limiter = config.requests_per_second.map(RateLimiter::new);
                    let fetch = adapter.fetch();
                    pin_mut!(fetch);
                    loop {
                        if ctx.cancel.is_cancelled() {
                            info!(feed = %name, "collection cancelled");
                            break;
                        }
                        if let Some(limiter) = &limiter {
                            limiter.acquire().await;
                        }

                        let next = match config.timeout {
                            Some(timeout) => match tokio::time::timeout(timeout, fetch.next()).await {
                                Ok(next) => next,
                                Err(_) => {
                                    warn!(feed = %name, ?timeout, "fetch timed out");
                                    stats.errors += 1;
                                    failed = true;
                                    ctx.bus.publish(EventEnvelope::new(
                                        name.as_str(),
                                        FeedEvent::AdapterFailed {
                                            adapter_name: name.clone(),
                                            error: "fetch timed out".to_string(),
                                        },
                                    ));
                                    break;
                                }
                            },
                            None => fetch.next().await,
                        };

                        let Some(item) = next else { break };
                        let candidate = match item {
                            Ok(candidate) => candidate,
                            Err(err) => {
                                warn!(feed = %name, error = %err, "adapter failed mid-stream");
                                stats.errors += 1;
                                failed = true;
                                ctx.bus.publish(EventEnvelope::new(
                                    name.as_str(),
                                    FeedEvent::AdapterFailed {
                                        adapter_name: name.clone(),
                                        error: err.to_string(),
                                    },
                                ));
                                break;
                            }
                        };

                        stats.records_processed += 1;
                        match ctx.dedup.ingest(candidate, &name).await {
                            Ok(outcome) if outcome.is_new => {
                                stats.records_new += 1;
                                ctx.bus.publish(EventEnvelope::new(
                                    name.as_str(),
                                    FeedEvent::RecordDiscovered {
                                        natural_key: outcome.record.natural_key.to_string(),
                                        record_id: outcome.record.record_id,
                                        source: name.clone(),
                                        content: outcome.record.content.clone(),
                                    },
                                ));
                                let record = ctx.chain.run(&ctx.storage, outcome.record).await;
                                if let Some(manager) = &ctx.checkpoints {
                                    manager.observe(adapter.as_ref(), stats.records_processed).await;
                                }
                                yield record;
                            }
                            Ok(outcome) => {
                                stats.records_duplicate += 1;
                                ctx.bus.publish(EventEnvelope::new(
                                    name.as_str(),
                                    FeedEvent::RecordDuplicate {
                                        natural_key: outcome.record.natural_key.to_string(),
                                        record_id: outcome.record.record_id,
                                        source: name.clone(),
                                        content_changed: outcome.content_changed,
                                    },
                                ));
                                if let Some(manager) = &ctx.checkpoints {
                                    manager.observe(adapter.as_ref(), stats.records_processed).await;
                                }
                            }
                            Err(err) => {
                                // Per-candidate errors are local: count
                                // and keep consuming the adapter.
                                stats.errors += 1;
                                warn!(feed = %name, error = %err, "candidate ingest failed");
                            }
                        }

                        if stats.records_processed % PROGRESS_EVERY == 0 {
                            ctx.bus.publish(EventEnvelope::new(
                                name.as_str(),
                                FeedEvent::CollectionProgress {
                                    feed: name.clone(),
                                    records_processed: stats.records_processed,
                                    records_new: stats.records_new,
                                    records_duplicate: stats.records_duplicate,
                                },
                            ));
                        }
                    }
                }
            }

            if let Err(err) = adapter.close().await {
                warn!(feed = %name, error = %err, "adapter close failed");
            }
            if let Some(manager) = &ctx.checkpoints {
                manager.flush(adapter.as_ref(), stats.records_processed).await;
            }
            stats.duration = started.elapsed();

            if !failed {
                ctx.bus.publish(EventEnvelope::new(
                    name.as_str(),
                    FeedEvent::AdapterCompleted {
                        adapter_name: name.clone(),
                        records_processed: stats.records_processed,
                        records_new: stats.records_new,
                        records_duplicate: stats.records_duplicate,
                        errors: stats.errors,
                    },
                ));
            }

            let mut state = ctx.state.lock().await;
            state.adapter_failed |= failed;
            state.per_feed.insert(name, stats);
        }
        .boxed()
    }
}
