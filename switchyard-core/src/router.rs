//! Provider manager: one request surface over every backend.
//!
//! Aggregates adapter status, resolves each request to a backend and model,
//! drives host-managed residency through the [`ResourceManager`], and
//! multiplexes pull progress so concurrent pulls of one model share a task.

use crate::config::{ResourceConfig, RouterConfig, WorkbenchConfig};
use crate::error::{ProviderError, ResolutionError, RouterError};
use crate::events::{EventBus, Subscription};
use crate::providers::{
    CloudProvider, DaemonProvider, EmbeddedProvider, InferenceEngine, ModelProvider, Residency,
};
use crate::registry::{ModelFilter, ModelRegistry};
use crate::resources::{LoadedModelRecord, ResourceManager};
use crate::types::{
    AggregateStatus, Availability, AudioOutput, AudioRequest, BackendKind, BackendStatus,
    Capability, ChatOutput, ChatRequest, EmbedOutput, EmbedRequest, GenerateOutput,
    GenerateRequest, ImageGenerateRequest, ImageOutput, ModelDescriptor, ModelId, PullPhase,
    PullProgress, Routed, Target, VisionOutput, VisionRequest,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Pull handles
// ---------------------------------------------------------------------------

/// Handle to an in-flight or finished pull. Clones observe the same task.
#[derive(Debug, Clone)]
pub struct PullHandle {
    task_id: Uuid,
    model_id: ModelId,
    progress: watch::Receiver<PullProgress>,
}

impl PullHandle {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    /// Latest progress without waiting.
    pub fn snapshot(&self) -> PullProgress {
        self.progress.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.progress.borrow().phase.is_terminal()
    }

    /// Wait for the task to reach `complete` or `error`.
    pub async fn wait(mut self) -> PullProgress {
        let done = match self.progress.wait_for(|p| p.phase.is_terminal()).await {
            Ok(progress) => Some(progress.clone()),
            Err(_) => None,
        };
        done.unwrap_or_else(|| self.progress.borrow().clone())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Inner {
    /// Sorted by operating cost, cheapest first.
    adapters: Vec<Arc<dyn ModelProvider>>,
    registry: ModelRegistry,
    resources: ResourceManager,
    status: RwLock<Arc<AggregateStatus>>,
    refreshed_at: Mutex<Option<Instant>>,
    pulls: Mutex<HashMap<ModelId, PullHandle>>,
    /// Serializes first-use loads of each host-managed model.
    load_locks: Mutex<HashMap<ModelId, Arc<tokio::sync::Mutex<()>>>>,
    status_events: EventBus<Arc<AggregateStatus>>,
    pull_events: EventBus<PullProgress>,
    resource_config: ResourceConfig,
    router_config: RouterConfig,
}

/// The router. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ProviderManager {
    inner: Arc<Inner>,
}

impl ProviderManager {
    pub fn new(
        adapters: Vec<Arc<dyn ModelProvider>>,
        registry: ModelRegistry,
        config: &WorkbenchConfig,
    ) -> Self {
        let mut adapters = adapters;
        adapters.sort_by_key(|a| a.backend().cost_rank());
        let kinds: Vec<BackendKind> = adapters.iter().map(|a| a.backend()).collect();
        Self {
            inner: Arc::new(Inner {
                adapters,
                registry,
                resources: ResourceManager::new(),
                status: RwLock::new(Arc::new(AggregateStatus::checking(&kinds))),
                refreshed_at: Mutex::new(None),
                pulls: Mutex::new(HashMap::new()),
                load_locks: Mutex::new(HashMap::new()),
                status_events: EventBus::new(),
                pull_events: EventBus::new(),
                resource_config: config.resources.clone(),
                router_config: config.router.clone(),
            }),
        }
    }

    /// Build the enabled adapters from configuration.
    ///
    /// `engine` backs the embedded runtime; without one that backend probes
    /// as unavailable.
    pub fn from_config(
        config: &WorkbenchConfig,
        engine: Option<Arc<dyn InferenceEngine>>,
    ) -> Result<Self, ProviderError> {
        let ttl = config.router.probe_ttl();
        let mut adapters: Vec<Arc<dyn ModelProvider>> = Vec::new();
        if config.daemon.enabled {
            adapters.push(Arc::new(DaemonProvider::new(&config.daemon, ttl)?));
        }
        if config.embedded.enabled {
            adapters.push(Arc::new(EmbeddedProvider::new(
                config.embedded.resolved_models_dir(),
                engine,
                ttl,
            )?));
        }
        if config.cloud.enabled {
            adapters.push(Arc::new(CloudProvider::new(&config.cloud, ttl)?));
        }
        Ok(Self::new(
            adapters,
            ModelRegistry::with_builtin_catalog(),
            config,
        ))
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.inner.resources
    }

    pub fn backends(&self) -> Vec<BackendKind> {
        self.inner.adapters.iter().map(|a| a.backend()).collect()
    }

    fn adapter(&self, backend: BackendKind) -> Result<&Arc<dyn ModelProvider>, ResolutionError> {
        self.inner
            .adapters
            .iter()
            .find(|a| a.backend() == backend)
            .ok_or(ResolutionError::BackendNotRegistered { backend })
    }

    fn pulls(&self) -> MutexGuard<'_, HashMap<ModelId, PullHandle>> {
        self.inner.pulls.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- status ------------------------------------------------------------

    /// Last published status snapshot.
    pub fn status(&self) -> Arc<AggregateStatus> {
        self.inner
            .status
            .read()
            .map(|s| Arc::clone(&s))
            .unwrap_or_else(|e| Arc::clone(&e.into_inner()))
    }

    /// Probe every adapter concurrently and publish a fresh snapshot.
    pub async fn refresh_status(&self) -> Arc<AggregateStatus> {
        let probes = self.inner.adapters.iter().map(|a| a.probe());
        let mut backends: Vec<BackendStatus> = futures::future::join_all(probes).await;

        {
            let pulls = self.pulls();
            for status in &mut backends {
                let in_flight = pulls
                    .values()
                    .filter(|h| h.model_id.backend == status.backend)
                    .map(PullHandle::snapshot)
                    .find(|p| !p.phase.is_terminal());
                if let Some(progress) = in_flight {
                    if status.availability == Availability::Available {
                        status.availability = Availability::Downloading;
                    }
                    status.download = Some(progress);
                }
            }
        }

        for status in backends.iter().filter(|s| s.availability.is_usable()) {
            self.inner.registry.sync_backend(status.backend, &status.models);
        }

        let recommended = self.recommended_backend(&backends);
        let snapshot = Arc::new(AggregateStatus {
            has_available: backends.iter().any(|b| b.availability.is_usable()),
            recommended,
            backends,
            refreshed_at: chrono::Utc::now(),
        });

        match self.inner.status.write() {
            Ok(mut slot) => *slot = Arc::clone(&snapshot),
            Err(e) => *e.into_inner() = Arc::clone(&snapshot),
        }
        *self
            .inner
            .refreshed_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        debug!(
            available = snapshot.has_available,
            recommended = ?snapshot.recommended,
            "Status refreshed"
        );
        self.inner.status_events.publish(Arc::clone(&snapshot));
        snapshot
    }

    /// Prefer a backend that has the default chat model installed, else the
    /// cheapest usable backend.
    fn recommended_backend(&self, backends: &[BackendStatus]) -> Option<BackendKind> {
        if let Some(default) = self.inner.router_config.default_model(Capability::Chat)
            && let Some(status) = backends.iter().find(|b| b.backend == default.backend)
            && status.availability.is_usable()
            && status.has_installed(&default)
        {
            return Some(default.backend);
        }
        backends
            .iter()
            .filter(|b| b.availability.is_usable())
            .min_by_key(|b| b.backend.cost_rank())
            .map(|b| b.backend)
    }

    /// The last snapshot while it is younger than the probe TTL, else a
    /// fresh one.
    async fn current_status(&self) -> Arc<AggregateStatus> {
        let fresh = self
            .inner
            .refreshed_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|at| at.elapsed() < self.inner.router_config.probe_ttl());
        if fresh {
            self.status()
        } else {
            self.refresh_status().await
        }
    }

    pub fn subscribe_status(&self) -> Subscription<Arc<AggregateStatus>> {
        self.inner.status_events.subscribe()
    }

    pub fn subscribe_pull_progress(&self) -> Subscription<PullProgress> {
        self.inner.pull_events.subscribe()
    }

    // -- catalog -----------------------------------------------------------

    /// Union of every adapter's models, deduplicated by identifier.
    pub async fn list_models(&self) -> Vec<ModelDescriptor> {
        let lists = futures::future::join_all(self.inner.adapters.iter().map(|a| async move {
            match a.list_models().await {
                Ok(models) => models,
                Err(e) => {
                    debug!(backend = %a.backend(), error = %e, "Skipping backend in model listing");
                    Vec::new()
                }
            }
        }))
        .await;
        let mut unique: BTreeMap<ModelId, ModelDescriptor> = BTreeMap::new();
        for descriptor in lists.into_iter().flatten() {
            unique.entry(descriptor.id.clone()).or_insert(descriptor);
        }
        unique.into_values().collect()
    }

    /// Best installed model for `capability`.
    ///
    /// With a preferred backend that has a match, the match on that backend
    /// wins. Otherwise the configured default model wins if eligible, then
    /// the cheapest backend.
    pub fn recommend(
        &self,
        capability: Capability,
        preferred: Option<BackendKind>,
    ) -> Option<ModelDescriptor> {
        let status = self.status();
        let candidates: Vec<ModelDescriptor> = self
            .inner
            .registry
            .list(&ModelFilter::capability(capability).installed())
            .into_iter()
            .filter(|d| status.is_usable(d.backend()))
            .collect();

        let best_on = |backend: Option<BackendKind>| {
            let default = self.inner.router_config.default_model(capability);
            let pool: Vec<&ModelDescriptor> = candidates
                .iter()
                .filter(|d| backend.is_none_or(|b| d.backend() == b))
                .collect();
            if let Some(default) = default
                && let Some(hit) = pool.iter().find(|d| d.id == default)
            {
                return Some((*hit).clone());
            }
            pool.into_iter()
                .min_by(|a, b| {
                    a.backend()
                        .cost_rank()
                        .cmp(&b.backend().cost_rank())
                        .then_with(|| a.id.cmp(&b.id))
                })
                .cloned()
        };

        preferred
            .and_then(|b| best_on(Some(b)))
            .or_else(|| best_on(None))
    }

    // -- resolution & dispatch ---------------------------------------------

    /// Resolve a request target to an adapter and a concrete model.
    pub async fn resolve(
        &self,
        capability: Capability,
        target: &Target,
    ) -> Result<(Arc<dyn ModelProvider>, ModelId), RouterError> {
        let status = self.current_status().await;
        if !status.has_available {
            return Err(ResolutionError::NoAvailableProvider.into());
        }

        // (a) explicit model
        if let Some(reference) = target.model.as_deref() {
            let descriptor = self.inner.registry.resolve(reference)?;
            if !descriptor.supports(capability) {
                return Err(ResolutionError::CapabilityUnsupported {
                    model: descriptor.id,
                    capability,
                }
                .into());
            }
            let adapter = self.adapter(descriptor.backend())?;
            if !status.is_usable(descriptor.backend()) {
                let message = status
                    .backend(descriptor.backend())
                    .and_then(|s| s.error.clone())
                    .unwrap_or_else(|| "backend is not available".to_string());
                return Err(ProviderError::Unavailable {
                    backend: descriptor.backend(),
                    message,
                }
                .into());
            }
            return Ok((Arc::clone(adapter), descriptor.id));
        }

        // (b) preferred backend's recommendation
        if let Some(preferred) = target.preferred_backend
            && status.is_usable(preferred)
            && let Some(found) = self.recommend(capability, Some(preferred))
            && found.backend() == preferred
        {
            let adapter = self.adapter(preferred)?;
            return Ok((Arc::clone(adapter), found.id));
        }

        // (c) globally recommended backend's default model
        let found = self
            .recommend(capability, status.recommended)
            .ok_or(ResolutionError::NoModelForTask { capability })?;
        let adapter = self.adapter(found.backend())?;
        Ok((Arc::clone(adapter), found.id))
    }

    /// Load a host-managed model if needed, account for it, evict under
    /// pressure, and mark it used.
    async fn prepare(
        &self,
        adapter: &Arc<dyn ModelProvider>,
        model: &ModelId,
    ) -> Result<(), RouterError> {
        if adapter.residency() != Residency::HostManaged {
            return Ok(());
        }
        let resources = &self.inner.resources;
        if !resources.is_loaded(model) {
            let lock = self.load_lock(model);
            let _guard = lock.lock().await;
            // Another caller may have finished the load while we waited.
            if !resources.is_loaded(model) {
                let outcome = adapter.load(&model.name).await?;
                resources.record_load(model.clone(), outcome.footprint_bytes);
                if self.inner.resource_config.auto_evict {
                    resources
                        .evict_if_needed(
                            self.inner.resource_config.memory_budget_bytes,
                            &self.inner.adapters,
                            Some(model),
                        )
                        .await;
                }
            }
        }
        resources.touch(model);
        Ok(())
    }

    fn load_lock(&self, model: &ModelId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .load_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(model.clone()).or_default())
    }

    async fn dispatch<T, F, Fut>(
        &self,
        capability: Capability,
        target: &Target,
        call: F,
    ) -> Result<Routed<T>, RouterError>
    where
        F: FnOnce(Arc<dyn ModelProvider>, ModelId) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let (adapter, model) = self.resolve(capability, target).await?;
        self.prepare(&adapter, &model).await?;
        info!(backend = %model.backend, model = %model, capability = %capability, "Dispatching request");
        let output = call(adapter, model.clone()).await.map_err(|e| {
            warn!(backend = %model.backend, model = %model, error = %e, "Dispatch failed");
            e
        })?;
        Ok(Routed {
            backend: model.backend,
            model,
            output,
        })
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<Routed<ChatOutput>, RouterError> {
        self.dispatch(Capability::Chat, &request.target, |a, m| async move {
            a.chat(&m.name, request).await
        })
        .await
    }

    pub async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<Routed<GenerateOutput>, RouterError> {
        let capability = if request.images.is_empty() {
            Capability::Generate
        } else {
            Capability::VisionCaption
        };
        self.dispatch(capability, &request.target, |a, m| async move {
            a.generate(&m.name, request).await
        })
        .await
    }

    pub async fn embed(&self, request: &EmbedRequest) -> Result<Routed<EmbedOutput>, RouterError> {
        self.dispatch(Capability::Embed, &request.target, |a, m| async move {
            a.embed(&m.name, request).await
        })
        .await
    }

    pub async fn vision(
        &self,
        request: &VisionRequest,
    ) -> Result<Routed<VisionOutput>, RouterError> {
        self.dispatch(request.task.capability(), &request.target, |a, m| async move {
            a.vision(&m.name, request).await
        })
        .await
    }

    pub async fn audio(&self, request: &AudioRequest) -> Result<Routed<AudioOutput>, RouterError> {
        self.dispatch(request.task.capability(), &request.target, |a, m| async move {
            a.audio(&m.name, request).await
        })
        .await
    }

    pub async fn image_generate(
        &self,
        request: &ImageGenerateRequest,
    ) -> Result<Routed<ImageOutput>, RouterError> {
        self.dispatch(Capability::ImageGeneration, &request.target, |a, m| async move {
            a.image_generate(&m.name, request).await
        })
        .await
    }

    // -- pulls -------------------------------------------------------------

    /// A composite id, a registered name, or else a new name on the
    /// cheapest usable backend (the cheapest registered one before the
    /// first refresh).
    fn resolve_pull_target(&self, reference: &str) -> Result<ModelId, RouterError> {
        if let Ok(id) = reference.parse::<ModelId>() {
            return Ok(id);
        }
        match self.inner.registry.resolve(reference) {
            Ok(descriptor) => Ok(descriptor.id),
            Err(e) => {
                let status = self.status();
                let backend = self
                    .inner
                    .adapters
                    .iter()
                    .map(|a| a.backend())
                    .find(|b| status.is_usable(*b))
                    .or_else(|| self.inner.adapters.first().map(|a| a.backend()))
                    .ok_or(e)?;
                debug!(model = %reference, backend = %backend, "Pulling unregistered model");
                Ok(ModelId::new(backend, reference))
            }
        }
    }

    /// Start a pull, or join the one already in flight for this model.
    pub fn pull(&self, reference: &str) -> Result<PullHandle, RouterError> {
        let model_id = self.resolve_pull_target(reference)?;
        let adapter = Arc::clone(self.adapter(model_id.backend)?);

        let mut pulls = self.pulls();
        if let Some(existing) = pulls.get(&model_id)
            && !existing.is_finished()
        {
            debug!(model = %model_id, task = %existing.task_id, "Joining in-flight pull");
            return Ok(existing.clone());
        }

        let task_id = Uuid::new_v4();
        let (progress_tx, progress_rx) = watch::channel(PullProgress::new(
            model_id.clone(),
            PullPhase::Downloading,
            0.0,
        ));
        let handle = PullHandle {
            task_id,
            model_id: model_id.clone(),
            progress: progress_rx,
        };
        pulls.insert(model_id.clone(), handle.clone());
        drop(pulls);

        info!(model = %model_id, task = %task_id, "Starting pull");
        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .run_pull(adapter, model_id, task_id, progress_tx)
                .await;
        });
        Ok(handle)
    }

    async fn run_pull(
        &self,
        adapter: Arc<dyn ModelProvider>,
        model_id: ModelId,
        task_id: Uuid,
        progress_tx: watch::Sender<PullProgress>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PullProgress>();
        let events = self.inner.pull_events.clone();

        // Terminal phases are held back until bookkeeping is done, so a
        // waiter that wakes on `complete` sees the refreshed status.
        let forward = async {
            while let Some(update) = rx.recv().await {
                if update.phase.is_terminal() {
                    continue;
                }
                progress_tx.send_replace(update.clone());
                events.publish(update);
            }
        };
        let (result, ()) = tokio::join!(adapter.pull(&model_id.name, tx), forward);

        let terminal = match result {
            Ok(()) => {
                info!(model = %model_id, "Pull complete");
                PullProgress::new(model_id.clone(), PullPhase::Complete, 1.0)
            }
            Err(e) => {
                warn!(model = %model_id, error = %e, "Pull failed");
                PullProgress::failed(model_id.clone(), e.to_string())
            }
        };

        {
            let mut pulls = self.pulls();
            if pulls.get(&model_id).is_some_and(|h| h.task_id == task_id) {
                pulls.remove(&model_id);
            }
        }
        adapter.invalidate_probe();
        self.refresh_status().await;

        events.publish(terminal.clone());
        progress_tx.send_replace(terminal);
    }

    /// Pulls currently in flight.
    pub fn active_pulls(&self) -> Vec<PullHandle> {
        self.pulls()
            .values()
            .filter(|h| !h.is_finished())
            .cloned()
            .collect()
    }

    // -- residency ---------------------------------------------------------

    pub fn loaded_models(&self) -> Vec<LoadedModelRecord> {
        self.inner.resources.list()
    }

    /// Explicitly load a model. A no-op for backends that manage residency.
    pub async fn load_model(&self, reference: &str) -> Result<(), RouterError> {
        let descriptor = self.inner.registry.resolve(reference)?;
        let adapter = Arc::clone(self.adapter(descriptor.backend())?);
        self.prepare(&adapter, &descriptor.id).await
    }

    /// Explicitly unload a model.
    pub async fn unload_model(&self, reference: &str) -> Result<(), RouterError> {
        let descriptor = self.inner.registry.resolve(reference)?;
        let adapter = self.adapter(descriptor.backend())?;
        adapter.unload(&descriptor.id.name).await?;
        self.inner.resources.record_unload(&descriptor.id);
        Ok(())
    }

    /// Unload every resident model. Call once at teardown.
    pub async fn shutdown(&self) {
        for record in self.inner.resources.list() {
            if let Ok(adapter) = self.adapter(record.backend)
                && let Err(e) = adapter.unload(&record.model_id.name).await
            {
                warn!(model = %record.model_id, error = %e, "Unload at shutdown failed");
            }
            self.inner.resources.record_unload(&record.model_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;
    use crate::types::ChatMessage;
    use std::time::Duration;

    fn manager(mocks: Vec<Arc<MockProvider>>) -> ProviderManager {
        let adapters: Vec<Arc<dyn ModelProvider>> = mocks
            .into_iter()
            .map(|m| m as Arc<dyn ModelProvider>)
            .collect();
        ProviderManager::new(adapters, ModelRegistry::new(), &WorkbenchConfig::default())
    }

    fn chat_request(model: Option<&str>, preferred: Option<BackendKind>) -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::user("hello")],
            target: Target {
                model: model.map(str::to_string),
                preferred_backend: preferred,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_no_available_provider() {
        let daemon = Arc::new(MockProvider::new(BackendKind::LocalDaemon).unavailable());
        let pm = manager(vec![daemon]);
        let err = pm.chat(&chat_request(None, None)).await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::Resolution(ResolutionError::NoAvailableProvider)
        ));
    }

    #[tokio::test]
    async fn test_recommended_backend_prefers_cheapest() {
        let cloud = Arc::new(MockProvider::new(BackendKind::Cloud).with_model("gpt", &[Capability::Chat]));
        let daemon = Arc::new(
            MockProvider::new(BackendKind::LocalDaemon).with_model("qwen", &[Capability::Chat]),
        );
        let pm = manager(vec![cloud, daemon]);
        let status = pm.refresh_status().await;
        assert!(status.has_available);
        assert_eq!(status.recommended, Some(BackendKind::LocalDaemon));
        assert_eq!(pm.backends(), vec![BackendKind::LocalDaemon, BackendKind::Cloud]);
    }

    #[tokio::test]
    async fn test_recommended_backend_prefers_default_model_holder() {
        let embedded = Arc::new(
            MockProvider::new(BackendKind::EmbeddedRuntime).with_model("tiny", &[Capability::Chat]),
        );
        let cloud = Arc::new(MockProvider::new(BackendKind::Cloud).with_model("gpt", &[Capability::Chat]));
        let mut config = WorkbenchConfig::default();
        config
            .router
            .default_models
            .insert("chat".into(), "cloud/gpt".into());
        let pm = ProviderManager::new(
            vec![
                embedded as Arc<dyn ModelProvider>,
                cloud as Arc<dyn ModelProvider>,
            ],
            ModelRegistry::new(),
            &config,
        );
        assert_eq!(pm.refresh_status().await.recommended, Some(BackendKind::Cloud));
    }

    #[tokio::test]
    async fn test_explicit_model_wins() {
        let daemon = Arc::new(
            MockProvider::new(BackendKind::LocalDaemon).with_model("qwen", &[Capability::Chat]),
        );
        let cloud = Arc::new(MockProvider::new(BackendKind::Cloud).with_model("gpt", &[Capability::Chat]));
        let pm = manager(vec![daemon.clone(), cloud.clone()]);

        let out = pm.chat(&chat_request(Some("cloud/gpt"), None)).await.unwrap();
        assert_eq!(out.backend, BackendKind::Cloud);
        assert_eq!(out.model.to_string(), "cloud/gpt");
        assert_eq!(cloud.call_count(), 1);
        assert_eq!(daemon.call_count(), 0);

        // Bare names resolve through the registry.
        let out = pm.chat(&chat_request(Some("qwen"), None)).await.unwrap();
        assert_eq!(out.backend, BackendKind::LocalDaemon);
    }

    #[tokio::test]
    async fn test_preferred_backend_then_global() {
        let daemon = Arc::new(
            MockProvider::new(BackendKind::LocalDaemon).with_model("qwen", &[Capability::Chat]),
        );
        let cloud = Arc::new(MockProvider::new(BackendKind::Cloud).with_model("gpt", &[Capability::Chat]));
        let pm = manager(vec![daemon, cloud]);

        let out = pm
            .chat(&chat_request(None, Some(BackendKind::Cloud)))
            .await
            .unwrap();
        assert_eq!(out.backend, BackendKind::Cloud);

        let out = pm
            .chat(&chat_request(None, Some(BackendKind::EmbeddedRuntime)))
            .await
            .unwrap();
        assert_eq!(out.backend, BackendKind::LocalDaemon);
    }

    #[tokio::test]
    async fn test_capability_unsupported() {
        let cloud = Arc::new(
            MockProvider::new(BackendKind::Cloud).with_model("whisper-1", &[Capability::AudioTranscribe]),
        );
        let pm = manager(vec![cloud]);
        let err = pm
            .chat(&chat_request(Some("cloud/whisper-1"), None))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Model 'cloud/whisper-1' does not support chat");
    }

    #[tokio::test]
    async fn test_no_model_for_task() {
        let daemon = Arc::new(
            MockProvider::new(BackendKind::LocalDaemon).with_model("qwen", &[Capability::Chat]),
        );
        let pm = manager(vec![daemon]);
        let err = pm
            .embed(&EmbedRequest {
                text: "x".into(),
                target: Target::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::Resolution(ResolutionError::NoModelForTask {
                capability: Capability::Embed
            })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_error_names_backend() {
        let daemon = Arc::new(
            MockProvider::new(BackendKind::LocalDaemon).with_model("qwen", &[Capability::Chat]),
        );
        daemon.queue_error(ProviderError::Request {
            backend: BackendKind::LocalDaemon,
            message: "model crashed".into(),
        });
        let pm = manager(vec![daemon]);
        let err = pm.chat(&chat_request(None, None)).await.unwrap_err();
        assert_eq!(err.to_string(), "daemon request failed: model crashed");
    }

    #[tokio::test]
    async fn test_host_managed_dispatch_loads_and_evicts() {
        let embedded = Arc::new(
            MockProvider::new(BackendKind::EmbeddedRuntime)
                .host_managed()
                .with_model("a", &[Capability::Chat])
                .with_model("b", &[Capability::Chat])
                .with_footprint("a", 600)
                .with_footprint("b", 600),
        );
        let mut config = WorkbenchConfig::default();
        config.resources.memory_budget_bytes = 1000;
        let pm = ProviderManager::new(
            vec![embedded.clone() as Arc<dyn ModelProvider>],
            ModelRegistry::new(),
            &config,
        );

        pm.chat(&chat_request(Some("embedded/a"), None)).await.unwrap();
        assert_eq!(pm.resources().total_footprint(), 600);
        pm.chat(&chat_request(Some("embedded/b"), None)).await.unwrap();

        let loaded: Vec<String> = pm
            .loaded_models()
            .into_iter()
            .map(|r| r.model_id.name)
            .collect();
        assert_eq!(loaded, vec!["b"]);
        assert_eq!(embedded.loads(), vec!["a", "b"]);
        assert_eq!(embedded.unloads(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_pull_joins_in_flight_task() {
        let daemon = Arc::new(
            MockProvider::new(BackendKind::LocalDaemon).with_pull_delay(Duration::from_millis(50)),
        );
        let pm = manager(vec![daemon.clone()]);

        let first = pm.pull("daemon/phi3").unwrap();
        let second = pm.pull("daemon/phi3").unwrap();
        let first_id = first.task_id();
        assert_eq!(first_id, second.task_id());

        let done = first.wait().await;
        assert_eq!(done.phase, PullPhase::Complete);
        assert_eq!(second.wait().await.phase, PullPhase::Complete);
        assert_eq!(daemon.pull_count(), 1);

        // The refresh after completion registers the new model.
        assert!(pm.registry().find(&"daemon/phi3".parse().unwrap()).unwrap().installed);

        // A finished task leaves the table; a new pull starts a new task.
        let third = pm.pull("daemon/phi3").unwrap();
        assert_ne!(third.task_id(), first_id);
        third.wait().await;
        assert_eq!(daemon.pull_count(), 2);
    }

    #[tokio::test]
    async fn test_pull_failure_reports_error_phase() {
        let daemon = Arc::new(MockProvider::new(BackendKind::LocalDaemon));
        daemon.set_fail_pulls(true);
        let pm = manager(vec![daemon]);
        let mut events = pm.subscribe_pull_progress();

        let done = pm.pull("daemon/phi3").unwrap().wait().await;
        assert_eq!(done.phase, PullPhase::Error);
        assert!(done.error.unwrap().contains("mock download failure"));

        let mut last = None;
        while let Some(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(last.unwrap().phase, PullPhase::Error);
    }

    #[tokio::test]
    async fn test_status_subscription_receives_refresh() {
        let daemon = Arc::new(MockProvider::new(BackendKind::LocalDaemon));
        let pm = manager(vec![daemon]);
        let mut sub = pm.subscribe_status();
        pm.refresh_status().await;
        let event = sub.recv().await.unwrap();
        assert_eq!(event.recommended, Some(BackendKind::LocalDaemon));
    }

    #[tokio::test]
    async fn test_refresh_drops_installed_flag_of_removed_model() {
        let daemon = Arc::new(
            MockProvider::new(BackendKind::LocalDaemon)
                .with_model("qwen", &[Capability::Chat])
                .with_model("phi3", &[Capability::Chat]),
        );
        let pm = manager(vec![daemon.clone()]);
        pm.refresh_status().await;
        let qwen: ModelId = "daemon/qwen".parse().unwrap();
        assert_eq!(
            pm.recommend(Capability::Chat, None).unwrap().id,
            "daemon/phi3".parse::<ModelId>().unwrap()
        );

        daemon.remove_model("phi3");
        pm.refresh_status().await;

        let phi3 = pm.registry().find(&"daemon/phi3".parse().unwrap()).unwrap();
        assert!(!phi3.installed);
        assert_eq!(pm.recommend(Capability::Chat, None).unwrap().id, qwen);
        let out = pm.chat(&chat_request(None, None)).await.unwrap();
        assert_eq!(out.model, qwen);
    }

    #[tokio::test]
    async fn test_unreachable_backend_keeps_registry_entries() {
        let daemon = Arc::new(
            MockProvider::new(BackendKind::LocalDaemon).with_model("qwen", &[Capability::Chat]),
        );
        let pm = manager(vec![daemon.clone()]);
        pm.refresh_status().await;

        daemon.set_available(false);
        pm.refresh_status().await;
        assert!(pm.registry().find(&"daemon/qwen".parse().unwrap()).unwrap().installed);
    }

    #[tokio::test]
    async fn test_status_is_reused_within_ttl() {
        let daemon = Arc::new(
            MockProvider::new(BackendKind::LocalDaemon).with_model("qwen", &[Capability::Chat]),
        );
        let pm = manager(vec![daemon.clone()]);
        pm.chat(&chat_request(None, None)).await.unwrap();
        pm.chat(&chat_request(None, None)).await.unwrap();
        assert_eq!(daemon.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_status_is_refreshed() {
        let daemon = Arc::new(
            MockProvider::new(BackendKind::LocalDaemon)
                .with_model("qwen", &[Capability::Chat])
                .unavailable(),
        );
        let mut config = WorkbenchConfig::default();
        config.router.probe_ttl_secs = 0;
        let pm = ProviderManager::new(
            vec![daemon.clone() as Arc<dyn ModelProvider>],
            ModelRegistry::new(),
            &config,
        );

        let err = pm.chat(&chat_request(None, None)).await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::Resolution(ResolutionError::NoAvailableProvider)
        ));

        // The backend comes up after the process started.
        daemon.set_available(true);
        let out = pm.chat(&chat_request(None, None)).await.unwrap();
        assert_eq!(out.backend, BackendKind::LocalDaemon);
        assert_eq!(daemon.probe_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_loads_once() {
        let embedded = Arc::new(
            MockProvider::new(BackendKind::EmbeddedRuntime)
                .host_managed()
                .with_model("x", &[Capability::Chat])
                .with_footprint("x", 100)
                .with_load_delay(Duration::from_millis(30)),
        );
        let pm = manager(vec![embedded.clone()]);
        pm.refresh_status().await;

        let request = chat_request(Some("embedded/x"), None);
        let (a, b) = tokio::join!(pm.chat(&request), pm.chat(&request));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(embedded.loads(), vec!["x"]);
        assert_eq!(embedded.call_count(), 2);
        assert_eq!(pm.resources().total_footprint(), 100);
    }

    #[tokio::test]
    async fn test_pull_bare_name_targets_cheapest_backend() {
        let daemon = Arc::new(MockProvider::new(BackendKind::LocalDaemon));
        let cloud = Arc::new(MockProvider::new(BackendKind::Cloud));
        let pm = manager(vec![cloud, daemon.clone()]);
        pm.refresh_status().await;

        let handle = pm.pull("phi3").unwrap();
        assert_eq!(handle.model_id(), &ModelId::new(BackendKind::LocalDaemon, "phi3"));
        assert_eq!(handle.wait().await.phase, PullPhase::Complete);
        assert_eq!(daemon.pull_count(), 1);
    }

    #[tokio::test]
    async fn test_list_models_deduplicates() {
        let daemon = Arc::new(
            MockProvider::new(BackendKind::LocalDaemon)
                .with_model("qwen", &[Capability::Chat])
                .with_model("qwen", &[Capability::Chat]),
        );
        let pm = manager(vec![daemon]);
        assert_eq!(pm.list_models().await.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_unloads_resident_models() {
        let embedded = Arc::new(
            MockProvider::new(BackendKind::EmbeddedRuntime)
                .host_managed()
                .with_model("a", &[Capability::Chat]),
        );
        let pm = manager(vec![embedded.clone()]);
        pm.refresh_status().await;
        pm.load_model("embedded/a").await.unwrap();
        assert_eq!(pm.loaded_models().len(), 1);
        pm.shutdown().await;
        assert!(pm.loaded_models().is_empty());
        assert_eq!(embedded.unloads(), vec!["a"]);
    }
}
