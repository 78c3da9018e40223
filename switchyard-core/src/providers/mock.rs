//! A scriptable in-memory adapter for tests and development.

use super::{LoadOutcome, ModelProvider, ProgressSink, Residency};
use crate::error::ProviderError;
use crate::types::{
    AudioOutput, AudioRequest, BackendKind, BackendStatus, Capability, ChatMessage, ChatOutput,
    ChatRequest, EmbedOutput, EmbedRequest, GenerateOutput, GenerateRequest, ImageGenerateRequest,
    ImageOutput, ModelDescriptor, ModelId, PullPhase, PullProgress, Role, VisionOutput,
    VisionRequest,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// One recorded dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub capability: Capability,
    pub model: String,
    /// The text the adapter was asked to process (last user message, prompt,
    /// or embed text). Empty for media-only calls.
    pub input: String,
}

/// A mock adapter that returns queued responses and records every call.
pub struct MockProvider {
    backend: BackendKind,
    residency: Residency,
    available: AtomicBool,
    models: Mutex<Vec<ModelDescriptor>>,
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    default_response: String,
    calls: Mutex<Vec<MockCall>>,
    footprints: HashMap<String, u64>,
    failing_unloads: HashSet<String>,
    pull_delay: Duration,
    load_delay: Duration,
    fail_pulls: AtomicBool,
    pulls: AtomicUsize,
    probes: AtomicUsize,
    loads: Mutex<Vec<String>>,
    unloads: Mutex<Vec<String>>,
}

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockProvider {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            residency: Residency::BackendManaged,
            available: AtomicBool::new(true),
            models: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            default_response: "mock response".to_string(),
            calls: Mutex::new(Vec::new()),
            footprints: HashMap::new(),
            failing_unloads: HashSet::new(),
            pull_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            fail_pulls: AtomicBool::new(false),
            pulls: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            loads: Mutex::new(Vec::new()),
            unloads: Mutex::new(Vec::new()),
        }
    }

    /// Add an installed model with the given capabilities.
    pub fn with_model(self, name: &str, capabilities: &[Capability]) -> Self {
        let descriptor = ModelDescriptor::new(
            ModelId::new(self.backend, name),
            name,
            capabilities.iter().copied(),
        )
        .installed(true);
        self.with_descriptor(descriptor)
    }

    pub fn with_descriptor(self, descriptor: ModelDescriptor) -> Self {
        locked(&self.models).push(descriptor);
        self
    }

    /// Report the backend as unavailable on probe.
    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    /// Make the host responsible for residency, like the embedded runtime.
    pub fn host_managed(mut self) -> Self {
        self.residency = Residency::HostManaged;
        self
    }

    pub fn with_footprint(mut self, model: &str, bytes: u64) -> Self {
        self.footprints.insert(model.to_string(), bytes);
        self
    }

    pub fn with_failing_unload(mut self, model: &str) -> Self {
        self.failing_unloads.insert(model.to_string());
        self
    }

    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_default_response(mut self, text: &str) -> Self {
        self.default_response = text.to_string();
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop a model, as if it were deleted on the backend.
    pub fn remove_model(&self, name: &str) {
        locked(&self.models).retain(|m| m.id.name != name);
    }

    pub fn set_fail_pulls(&self, fail: bool) {
        self.fail_pulls.store(fail, Ordering::SeqCst);
    }

    /// Queue the text returned by the next dispatch.
    pub fn queue_response(&self, text: &str) {
        locked(&self.responses).push_back(Ok(text.to_string()));
    }

    /// Queue an error returned by the next dispatch.
    pub fn queue_error(&self, error: ProviderError) {
        locked(&self.responses).push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        locked(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        locked(&self.calls).len()
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> Vec<String> {
        locked(&self.loads).clone()
    }

    pub fn unloads(&self) -> Vec<String> {
        locked(&self.unloads).clone()
    }

    fn respond(&self, capability: Capability, model: &str, input: &str) -> Result<String, ProviderError> {
        locked(&self.calls).push(MockCall {
            capability,
            model: model.to_string(),
            input: input.to_string(),
        });
        locked(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_response.clone()))
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    fn residency(&self) -> Residency {
        self.residency
    }

    async fn probe(&self) -> BackendStatus {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            BackendStatus::available(self.backend, locked(&self.models).clone())
        } else {
            BackendStatus::unavailable(self.backend, "mock backend offline")
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        Ok(locked(&self.models).clone())
    }

    async fn chat(&self, model: &str, request: &ChatRequest) -> Result<ChatOutput, ProviderError> {
        let input = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let text = self.respond(Capability::Chat, model, input)?;
        Ok(ChatOutput {
            message: ChatMessage::assistant(text),
            done: true,
        })
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateOutput, ProviderError> {
        let response = self.respond(Capability::Generate, model, &request.prompt)?;
        Ok(GenerateOutput {
            response,
            done: true,
        })
    }

    async fn embed(&self, model: &str, request: &EmbedRequest) -> Result<EmbedOutput, ProviderError> {
        self.respond(Capability::Embed, model, &request.text)?;
        Ok(EmbedOutput {
            embeddings: vec![vec![0.1, 0.2, 0.3]],
        })
    }

    async fn vision(
        &self,
        model: &str,
        request: &VisionRequest,
    ) -> Result<VisionOutput, ProviderError> {
        let text = self.respond(request.task.capability(), model, request.instruction())?;
        Ok(VisionOutput {
            task: request.task,
            results: vec![text],
        })
    }

    async fn audio(&self, model: &str, request: &AudioRequest) -> Result<AudioOutput, ProviderError> {
        let result = self.respond(request.task.capability(), model, "")?;
        Ok(AudioOutput {
            task: request.task,
            result,
        })
    }

    async fn image_generate(
        &self,
        model: &str,
        request: &ImageGenerateRequest,
    ) -> Result<ImageOutput, ProviderError> {
        let image = self.respond(Capability::ImageGeneration, model, &request.prompt)?;
        Ok(ImageOutput { image })
    }

    async fn pull(&self, model: &str, progress: ProgressSink) -> Result<(), ProviderError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let id = ModelId::new(self.backend, model);
        let _ = progress.send(PullProgress::new(id.clone(), PullPhase::Downloading, 0.0));
        if !self.pull_delay.is_zero() {
            tokio::time::sleep(self.pull_delay).await;
        }
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(ProviderError::Download {
                backend: self.backend,
                model: model.to_string(),
                message: "mock download failure".into(),
            });
        }
        let _ = progress.send(PullProgress::new(id.clone(), PullPhase::Downloading, 0.5));
        let _ = progress.send(PullProgress::new(id.clone(), PullPhase::Verifying, 1.0));

        {
            let mut models = locked(&self.models);
            match models.iter_mut().find(|m| m.id == id) {
                Some(existing) => existing.installed = true,
                None => models.push(
                    ModelDescriptor::new(id.clone(), model, [Capability::Chat, Capability::Generate])
                        .installed(true),
                ),
            }
        }
        let _ = progress.send(PullProgress::new(id, PullPhase::Complete, 1.0));
        Ok(())
    }

    async fn load(&self, model: &str) -> Result<LoadOutcome, ProviderError> {
        locked(&self.loads).push(model.to_string());
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        Ok(LoadOutcome {
            footprint_bytes: self.footprints.get(model).copied().unwrap_or(1),
        })
    }

    async fn unload(&self, model: &str) -> Result<(), ProviderError> {
        locked(&self.unloads).push(model.to_string());
        if self.failing_unloads.contains(model) {
            return Err(ProviderError::Request {
                backend: self.backend,
                message: format!("cannot unload {model}"),
            });
        }
        Ok(())
    }
}
