//! Pluggable enrichment: ordered transformers that promote records
//! between layers and merge content.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use feedspine_core::{Content, Layer, Record};
use feedspine_store::RecordStore;

/// One enricher's verdict on one record.
#[derive(Debug, Clone)]
pub enum EnrichmentResult {
    /// Merge `enrichments` into content (shallow override on key
    /// collision) and promote to `new_layer` (strictly above current).
    Applied {
        enrichments: Content,
        new_layer: Layer,
    },
    Skipped {
        reason: String,
    },
    /// Reported and logged; the record stays at its current layer and
    /// the chain continues.
    Failed {
        error: String,
    },
}

#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;

    /// Gate: only records currently at this layer are offered.
    fn requires_layer(&self) -> Option<Layer> {
        None
    }

    /// Gate: subset-match constraints over `content` fields. Every
    /// listed field must be present and equal.
    fn requires_content(&self) -> Option<Content> {
        None
    }

    /// When present, the chain may drive `enrich_batch` in chunks of
    /// this size to amortize cost.
    fn batch_size(&self) -> Option<usize> {
        None
    }

    async fn enrich(&self, record: &Record) -> EnrichmentResult;

    /// Batch variant; the default just loops `enrich`.
    async fn enrich_batch(&self, records: &[Record]) -> Vec<EnrichmentResult> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            results.push(self.enrich(record).await);
        }
        results
    }
}

/// Ordered enrichers. Registration order is a stable sort key: equal
/// orders run in insertion order.
#[derive(Clone, Default)]
pub struct EnrichmentChain {
    enrichers: Vec<(i32, Arc<dyn Enricher>)>,
}

impl EnrichmentChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.enrichers.is_empty()
    }

    /// Insert at `order` (default: after everything registered so far).
    pub fn register(&mut self, enricher: Arc<dyn Enricher>, order: Option<i32>) {
        let order = order.unwrap_or_else(|| {
            self.enrichers.last().map(|(o, _)| *o).unwrap_or(0)
        });
        self.enrichers.push((order, enricher));
        self.enrichers.sort_by_key(|(o, _)| *o);
    }

    fn eligible(enricher: &dyn Enricher, record: &Record) -> bool {
        if let Some(layer) = enricher.requires_layer() {
            if record.layer != layer {
                return false;
            }
        }
        if let Some(required) = enricher.requires_content() {
            for (field, expected) in &required {
                if record.content.get(field) != Some(expected) {
                    return false;
                }
            }
        }
        true
    }

    /// Run the chain over one record, persisting each promotion.
    /// Returns the record in its final state.
    pub async fn run(&self, store: &Arc<dyn RecordStore>, record: Record) -> Record {
        let mut current = record;
        for (_, enricher) in &self.enrichers {
            if !Self::eligible(enricher.as_ref(), &current) {
                continue;
            }
            current = self.apply_one(store, enricher, current).await;
        }
        current
    }

    /// Run the chain over a batch, honoring `batch_size` where an
    /// enricher declares one. Record order is preserved.
    pub async fn run_batch(
        &self,
        store: &Arc<dyn RecordStore>,
        records: Vec<Record>,
    ) -> Vec<Record> {
        let mut current = records;
        for (_, enricher) in &self.enrichers {
            let eligible: Vec<usize> = current
                .iter()
                .enumerate()
                .filter(|(_, record)| Self::eligible(enricher.as_ref(), record))
                .map(|(index, _)| index)
                .collect();

            match enricher.batch_size() {
                None => {
                    for index in eligible {
                        let record = current[index].clone();
                        current[index] = self.apply_one(store, enricher, record).await;
                    }
                }
                Some(chunk_size) => {
                    for indices in eligible.chunks(chunk_size.max(1)) {
                        let chunk: Vec<Record> =
                            indices.iter().map(|&index| current[index].clone()).collect();
                        let settled = self.apply_chunk(store, enricher, chunk).await;
                        for (&index, record) in indices.iter().zip(settled) {
                            current[index] = record;
                        }
                    }
                }
            }
        }
        current
    }

    async fn apply_chunk(
        &self,
        store: &Arc<dyn RecordStore>,
        enricher: &Arc<dyn Enricher>,
        chunk: Vec<Record>,
    ) -> Vec<Record> {
        let results = enricher.enrich_batch(&chunk).await;
        let mut out = Vec::with_capacity(chunk.len());
        for (record, result) in chunk.into_iter().zip(results) {
            out.push(self.settle(store, enricher, record, result).await);
        }
        out
    }

    async fn apply_one(
        &self,
        store: &Arc<dyn RecordStore>,
        enricher: &Arc<dyn Enricher>,
        record: Record,
    ) -> Record {
        let result = enricher.enrich(&record).await;
        self.settle(store, enricher, record, result).await
    }

    /// Persist an Applied result; leave the record untouched otherwise.
    async fn settle(
        &self,
        store: &Arc<dyn RecordStore>,
        enricher: &Arc<dyn Enricher>,
        mut record: Record,
        result: EnrichmentResult,
    ) -> Record {
        match result {
            EnrichmentResult::Applied {
                enrichments,
                new_layer,
            } => {
                if new_layer <= record.layer {
                    warn!(
                        enricher = enricher.name(),
                        record_id = %record.record_id,
                        from = %record.layer,
                        to = %new_layer,
                        "non-monotone promotion rejected"
                    );
                    return record;
                }
                let mut merged = record.content.clone();
                for (key, value) in enrichments {
                    merged.insert(key, value);
                }
                let now = Utc::now();
                match store
                    .update_layer(record.record_id, new_layer, merged.clone(), now)
                    .await
                {
                    Ok(()) => {
                        record.layer = new_layer;
                        record.content = merged;
                        if now > record.updated_at {
                            record.updated_at = now;
                        }
                        debug!(
                            enricher = enricher.name(),
                            record_id = %record.record_id,
                            layer = %new_layer,
                            "record promoted"
                        );
                    }
                    Err(err) => {
                        warn!(
                            enricher = enricher.name(),
                            record_id = %record.record_id,
                            error = %err,
                            "promotion failed to persist"
                        );
                    }
                }
                record
            }
            EnrichmentResult::Skipped { reason } => {
                debug!(
                    enricher = enricher.name(),
                    record_id = %record.record_id,
                    reason,
                    "enricher skipped"
                );
                record
            }
            EnrichmentResult::Failed { error } => {
                warn!(
                    enricher = enricher.name(),
                    record_id = %record.record_id,
                    error,
                    "enricher failed"
                );
                record
            }
        }
    }
}
