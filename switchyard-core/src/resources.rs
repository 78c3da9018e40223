//! Resource manager: tracks models resident in host memory and evicts the
//! least recently used ones when a memory budget is exceeded.
//!
//! Records are written only here, in response to adapter-reported load and
//! unload events. Eviction passes are serialized.

use crate::providers::ModelProvider;
use crate::types::{BackendKind, ModelId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// A model currently resident in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedModelRecord {
    pub model_id: ModelId,
    pub backend: BackendKind,
    pub loaded_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub footprint_bytes: u64,
    /// Tie-breakers for events inside the same clock tick.
    #[serde(skip)]
    load_seq: u64,
    #[serde(skip)]
    use_seq: u64,
}

impl LoadedModelRecord {
    /// Sort key for eviction: least recently used first, then oldest load.
    fn lru_key(&self) -> (DateTime<Utc>, DateTime<Utc>, u64, u64) {
        (self.last_used_at, self.loaded_at, self.use_seq, self.load_seq)
    }
}

/// Tracks [`LoadedModelRecord`]s and runs eviction.
#[derive(Debug, Default)]
pub struct ResourceManager {
    records: Mutex<HashMap<ModelId, LoadedModelRecord>>,
    seq: AtomicU64,
    eviction: tokio::sync::Mutex<()>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ModelId, LoadedModelRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a successful load. Reloading an already-resident model
    /// refreshes its footprint and timestamps.
    pub fn record_load(&self, model_id: ModelId, footprint_bytes: u64) {
        let now = Utc::now();
        let seq = self.next_seq();
        debug!(model = %model_id, footprint_bytes, "Recorded model load");
        self.records().insert(
            model_id.clone(),
            LoadedModelRecord {
                backend: model_id.backend,
                model_id,
                loaded_at: now,
                last_used_at: now,
                footprint_bytes,
                load_seq: seq,
                use_seq: seq,
            },
        );
    }

    /// Forget a record. Returns it if it existed.
    pub fn record_unload(&self, model_id: &ModelId) -> Option<LoadedModelRecord> {
        let removed = self.records().remove(model_id);
        if removed.is_some() {
            debug!(model = %model_id, "Recorded model unload");
        }
        removed
    }

    /// Mark a resident model as just used. Returns false if it is not resident.
    pub fn touch(&self, model_id: &ModelId) -> bool {
        let seq = self.next_seq();
        match self.records().get_mut(model_id) {
            Some(record) => {
                record.last_used_at = Utc::now();
                record.use_seq = seq;
                true
            }
            None => false,
        }
    }

    pub fn is_loaded(&self, model_id: &ModelId) -> bool {
        self.records().contains_key(model_id)
    }

    pub fn get(&self, model_id: &ModelId) -> Option<LoadedModelRecord> {
        self.records().get(model_id).cloned()
    }

    /// All records, least recently used first.
    pub fn list(&self) -> Vec<LoadedModelRecord> {
        let mut out: Vec<LoadedModelRecord> = self.records().values().cloned().collect();
        out.sort_by_key(LoadedModelRecord::lru_key);
        out
    }

    pub fn total_footprint(&self) -> u64 {
        self.records().values().map(|r| r.footprint_bytes).sum()
    }

    /// Evict least recently used models until the total footprint is within
    /// `budget_bytes`, unloading each through its owning adapter.
    ///
    /// `protect` is never evicted. A failed unload is logged and skipped; the
    /// record stays since the model is still resident. Returns the evicted ids.
    pub async fn evict_if_needed(
        &self,
        budget_bytes: u64,
        adapters: &[Arc<dyn ModelProvider>],
        protect: Option<&ModelId>,
    ) -> Vec<ModelId> {
        let _pass = self.eviction.lock().await;
        let mut evicted = Vec::new();
        let mut skipped: HashSet<ModelId> = HashSet::new();

        loop {
            let total = self.total_footprint();
            if total <= budget_bytes {
                break;
            }
            let candidate = self
                .list()
                .into_iter()
                .find(|r| Some(&r.model_id) != protect && !skipped.contains(&r.model_id));
            let Some(candidate) = candidate else {
                warn!(
                    total_bytes = total,
                    budget_bytes, "Memory budget exceeded but nothing left to evict"
                );
                break;
            };

            let Some(adapter) = adapters.iter().find(|a| a.backend() == candidate.backend) else {
                warn!(model = %candidate.model_id, "No adapter owns resident model; dropping record");
                self.record_unload(&candidate.model_id);
                evicted.push(candidate.model_id);
                continue;
            };

            match adapter.unload(&candidate.model_id.name).await {
                Ok(()) => {
                    info!(
                        model = %candidate.model_id,
                        freed_bytes = candidate.footprint_bytes,
                        "Evicted least recently used model"
                    );
                    self.record_unload(&candidate.model_id);
                    evicted.push(candidate.model_id);
                }
                Err(e) => {
                    warn!(model = %candidate.model_id, error = %e, "Eviction unload failed; skipping");
                    skipped.insert(candidate.model_id);
                }
            }
        }
        evicted
    }
}
