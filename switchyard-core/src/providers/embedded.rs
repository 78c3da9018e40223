//! Embedded runtime adapter.
//!
//! Model files live under a local models directory and are downloaded from a
//! curated catalog. Inference runs in-process through an injected
//! [`InferenceEngine`]; with no engine linked the backend reports
//! unavailable. Residency is host-managed: a model must be loaded before use.

use super::{LoadOutcome, ModelProvider, ProbeCache, ProgressSink, Residency, transport_error};
use crate::error::ProviderError;
use crate::types::{
    AudioOutput, AudioRequest, AudioTask, BackendKind, BackendStatus, Capability, ChatMessage,
    ChatOutput, ChatRequest, EmbedOutput, EmbedRequest, GenerateOutput, GenerateRequest,
    HardwareTier, ModelDescriptor, ModelId, PullPhase, PullProgress, Role,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const BACKEND: BackendKind = BackendKind::EmbeddedRuntime;

/// Sampling parameters passed to a resident model.
#[derive(Debug, Clone, Default)]
pub struct SamplingParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Loads model files into memory. The model architecture lives behind this
/// trait; the adapter only manages files and residency.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, path: &Path) -> anyhow::Result<Arc<dyn ResidentModel>>;
}

/// A model resident in host memory.
#[async_trait]
pub trait ResidentModel: Send + Sync {
    /// Estimated memory held by the model.
    fn footprint_bytes(&self) -> u64;

    async fn complete(&self, prompt: &str, params: &SamplingParams) -> anyhow::Result<String>;

    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("model does not produce embeddings")
    }

    async fn transcribe(&self, _audio: &[u8], _language: Option<&str>) -> anyhow::Result<String> {
        anyhow::bail!("model does not transcribe audio")
    }
}

// ---------------------------------------------------------------------------
// Curated catalog
// ---------------------------------------------------------------------------

/// A downloadable model file.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub display_name: &'static str,
    pub file_name: &'static str,
    pub url: &'static str,
    pub size_bytes: u64,
    pub tier: HardwareTier,
    pub capabilities: &'static [Capability],
}

impl CatalogEntry {
    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor::new(
            ModelId::new(BACKEND, self.name),
            self.display_name,
            self.capabilities.iter().copied(),
        )
        .with_size(self.size_bytes)
        .with_tier(self.tier)
    }
}

const TEXT: &[Capability] = &[Capability::Chat, Capability::Generate];

static CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "llama-3.2-1b-instruct",
        display_name: "Llama 3.2 1B Instruct",
        file_name: "Llama-3.2-1B-Instruct-Q4_K_M.gguf",
        url: "https://huggingface.co/bartowski/Llama-3.2-1B-Instruct-GGUF/resolve/main/Llama-3.2-1B-Instruct-Q4_K_M.gguf",
        size_bytes: 807_694_464,
        tier: HardwareTier::Low,
        capabilities: TEXT,
    },
    CatalogEntry {
        name: "llama-3.2-3b-instruct",
        display_name: "Llama 3.2 3B Instruct",
        file_name: "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
        url: "https://huggingface.co/bartowski/Llama-3.2-3B-Instruct-GGUF/resolve/main/Llama-3.2-3B-Instruct-Q4_K_M.gguf",
        size_bytes: 2_019_377_696,
        tier: HardwareTier::Medium,
        capabilities: TEXT,
    },
    CatalogEntry {
        name: "qwen-2.5-7b-instruct",
        display_name: "Qwen 2.5 7B Instruct",
        file_name: "qwen2.5-7b-instruct-q4_k_m.gguf",
        url: "https://huggingface.co/Qwen/Qwen2.5-7B-Instruct-GGUF/resolve/main/qwen2.5-7b-instruct-q4_k_m.gguf",
        size_bytes: 4_683_073_952,
        tier: HardwareTier::High,
        capabilities: TEXT,
    },
    CatalogEntry {
        name: "nomic-embed-text-v1.5",
        display_name: "Nomic Embed Text v1.5",
        file_name: "nomic-embed-text-v1.5.Q8_0.gguf",
        url: "https://huggingface.co/nomic-ai/nomic-embed-text-v1.5-GGUF/resolve/main/nomic-embed-text-v1.5.Q8_0.gguf",
        size_bytes: 146_146_432,
        tier: HardwareTier::Low,
        capabilities: &[Capability::Embed],
    },
    CatalogEntry {
        name: "whisper-base",
        display_name: "Whisper Base",
        file_name: "ggml-base.bin",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin",
        size_bytes: 147_951_465,
        tier: HardwareTier::Low,
        capabilities: &[Capability::AudioTranscribe],
    },
];

/// The curated list of downloadable models.
pub fn curated_catalog() -> &'static [CatalogEntry] {
    CATALOG
}

fn catalog_entry(name: &str) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|e| e.name == name)
}

/// Flatten a chat into a single prompt for completion-style engines.
pub fn render_chat_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let label = match message.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Adapter for the in-process runtime.
pub struct EmbeddedProvider {
    models_dir: PathBuf,
    engine: Option<Arc<dyn InferenceEngine>>,
    download_client: reqwest::Client,
    resident: RwLock<HashMap<String, Arc<dyn ResidentModel>>>,
    cache: ProbeCache,
}

impl EmbeddedProvider {
    pub fn new(
        models_dir: impl Into<PathBuf>,
        engine: Option<Arc<dyn InferenceEngine>>,
        probe_ttl: Duration,
    ) -> Result<Self, ProviderError> {
        let download_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| transport_error(BACKEND, e))?;
        Ok(Self {
            models_dir: models_dir.into(),
            engine,
            download_client,
            resident: RwLock::new(HashMap::new()),
            cache: ProbeCache::new(probe_ttl),
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// On-disk location of a model, whether or not it is installed.
    pub fn model_path(&self, model: &str) -> PathBuf {
        match catalog_entry(model) {
            Some(entry) => self.models_dir.join(entry.file_name),
            None => self.models_dir.join(format!("{model}.gguf")),
        }
    }

    fn engine(&self) -> Result<&Arc<dyn InferenceEngine>, ProviderError> {
        self.engine.as_ref().ok_or_else(|| ProviderError::Unavailable {
            backend: BACKEND,
            message: "no inference engine linked".into(),
        })
    }

    async fn resident(&self, model: &str) -> Result<Arc<dyn ResidentModel>, ProviderError> {
        self.resident
            .read()
            .await
            .get(model)
            .cloned()
            .ok_or_else(|| ProviderError::ModelNotLoaded {
                backend: BACKEND,
                model: model.to_string(),
            })
    }

    fn inference_error(e: anyhow::Error) -> ProviderError {
        ProviderError::Request {
            backend: BACKEND,
            message: format!("{e:#}"),
        }
    }

    /// Models found on disk: catalog files plus loose `*.gguf` files.
    async fn scan_installed(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.models_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(source) => {
                return Err(ProviderError::Io {
                    backend: BACKEND,
                    source,
                });
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| ProviderError::Io {
                backend: BACKEND,
                source,
            })?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.ends_with(".part") {
                continue;
            }
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            if let Some(known) = CATALOG.iter().find(|e| e.file_name == file_name) {
                found.push(known.descriptor().with_size(size).installed(true));
            } else if let Some(stem) = file_name.strip_suffix(".gguf") {
                found.push(
                    ModelDescriptor::new(ModelId::new(BACKEND, stem), stem, TEXT.iter().copied())
                        .with_size(size)
                        .with_tier(super::daemon::tier_for_size(size))
                        .installed(true),
                );
            }
        }
        Ok(found)
    }

    async fn probe_uncached(&self) -> BackendStatus {
        let Some(engine) = &self.engine else {
            return BackendStatus::unavailable(BACKEND, "no inference engine linked");
        };
        match self.list_models().await {
            Ok(models) => {
                debug!(engine = engine.name(), models = models.len(), "Embedded runtime available");
                BackendStatus::available(BACKEND, models)
            }
            Err(e) => BackendStatus::unavailable(BACKEND, e.to_string()),
        }
    }

    async fn download(
        &self,
        entry: &CatalogEntry,
        id: &ModelId,
        progress: &ProgressSink,
    ) -> Result<(), ProviderError> {
        let download_error = |message: String| ProviderError::Download {
            backend: BACKEND,
            model: entry.name.to_string(),
            message,
        };
        let io_error = |source: std::io::Error| ProviderError::Io {
            backend: BACKEND,
            source,
        };

        tokio::fs::create_dir_all(&self.models_dir)
            .await
            .map_err(io_error)?;
        let dest = self.models_dir.join(entry.file_name);
        let temp = self.models_dir.join(format!("{}.part", entry.file_name));

        let _ = progress.send(PullProgress::new(id.clone(), PullPhase::Downloading, 0.0));
        let response = self
            .download_client
            .get(entry.url)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        if !response.status().is_success() {
            return Err(download_error(format!(
                "download failed with status {}",
                response.status()
            )));
        }
        let total = response.content_length().unwrap_or(entry.size_bytes).max(1);

        let mut file = tokio::fs::File::create(&temp).await.map_err(io_error)?;
        let written = async {
            let mut downloaded: u64 = 0;
            let mut last_reported = 0.0_f32;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| download_error(format!("download error: {e}")))?;
                file.write_all(&chunk).await.map_err(io_error)?;
                downloaded += chunk.len() as u64;
                let fraction = downloaded as f32 / total as f32;
                if fraction - last_reported >= 0.01 {
                    last_reported = fraction;
                    let _ = progress.send(PullProgress::new(
                        id.clone(),
                        PullPhase::Downloading,
                        fraction,
                    ));
                }
            }
            file.flush().await.map_err(io_error)?;
            drop(file);

            let _ = progress.send(PullProgress::new(id.clone(), PullPhase::Verifying, 1.0));
            let written = tokio::fs::metadata(&temp).await.map_err(io_error)?.len();
            if written < total / 2 {
                return Err(download_error(format!(
                    "downloaded file too small: {written} bytes (expected ~{total})"
                )));
            }
            Ok(written)
        }
        .await;

        // No partial file survives a failed download.
        let written = match written {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };
        debug!(model = %id, bytes = written, "Download verified");
        tokio::fs::rename(&temp, &dest).await.map_err(io_error)?;
        Ok(())
    }
}

#[async_trait]
impl ModelProvider for EmbeddedProvider {
    fn backend(&self) -> BackendKind {
        BACKEND
    }

    fn residency(&self) -> Residency {
        Residency::HostManaged
    }

    async fn probe(&self) -> BackendStatus {
        self.cache.get_or_probe(|| self.probe_uncached()).await
    }

    fn invalidate_probe(&self) {
        self.cache.invalidate();
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        self.scan_installed().await
    }

    async fn chat(&self, model: &str, request: &ChatRequest) -> Result<ChatOutput, ProviderError> {
        let resident = self.resident(model).await?;
        let params = SamplingParams {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let text = resident
            .complete(&render_chat_prompt(&request.messages), &params)
            .await
            .map_err(Self::inference_error)?;
        Ok(ChatOutput {
            message: ChatMessage::assistant(text.trim()),
            done: true,
        })
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateOutput, ProviderError> {
        if !request.images.is_empty() {
            return Err(self.unsupported(Capability::VisionCaption));
        }
        let resident = self.resident(model).await?;
        let params = SamplingParams {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let response = resident
            .complete(&request.prompt, &params)
            .await
            .map_err(Self::inference_error)?;
        Ok(GenerateOutput {
            response,
            done: true,
        })
    }

    async fn embed(&self, model: &str, request: &EmbedRequest) -> Result<EmbedOutput, ProviderError> {
        let resident = self.resident(model).await?;
        let vector = resident
            .embed(&request.text)
            .await
            .map_err(Self::inference_error)?;
        Ok(EmbedOutput {
            embeddings: vec![vector],
        })
    }

    async fn audio(&self, model: &str, request: &AudioRequest) -> Result<AudioOutput, ProviderError> {
        if request.task == AudioTask::Translate {
            return Err(self.unsupported(Capability::AudioTranslate));
        }
        let resident = self.resident(model).await?;
        let bytes = request.audio.to_bytes().await.map_err(|source| ProviderError::Io {
            backend: BACKEND,
            source,
        })?;
        let result = resident
            .transcribe(&bytes, request.language.as_deref())
            .await
            .map_err(Self::inference_error)?;
        Ok(AudioOutput {
            task: request.task,
            result,
        })
    }

    async fn pull(&self, model: &str, progress: ProgressSink) -> Result<(), ProviderError> {
        let entry = catalog_entry(model).ok_or_else(|| ProviderError::ModelNotFound {
            backend: BACKEND,
            model: model.to_string(),
        })?;
        let id = ModelId::new(BACKEND, model);
        if tokio::fs::try_exists(self.model_path(model))
            .await
            .unwrap_or(false)
        {
            debug!(model = %model, "Model file already present");
        } else {
            info!(model = %model, url = entry.url, "Downloading model");
            self.download(entry, &id, &progress).await?;
        }
        let _ = progress.send(PullProgress::new(id, PullPhase::Complete, 1.0));
        self.cache.invalidate();
        Ok(())
    }

    async fn load(&self, model: &str) -> Result<LoadOutcome, ProviderError> {
        if let Some(existing) = self.resident.read().await.get(model) {
            return Ok(LoadOutcome {
                footprint_bytes: existing.footprint_bytes(),
            });
        }
        let path = self.model_path(model);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ProviderError::ModelNotFound {
                backend: BACKEND,
                model: model.to_string(),
            });
        }
        let engine = self.engine()?;
        info!(model = %model, engine = engine.name(), "Loading model into memory");
        let loaded = engine
            .load(&path)
            .await
            .map_err(Self::inference_error)?;
        let footprint_bytes = match loaded.footprint_bytes() {
            0 => tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0),
            n => n,
        };
        self.resident.write().await.insert(model.to_string(), loaded);
        Ok(LoadOutcome { footprint_bytes })
    }

    async fn unload(&self, model: &str) -> Result<(), ProviderError> {
        if self.resident.write().await.remove(model).is_none() {
            warn!(model = %model, "Unload requested for a model that is not resident");
        }
        Ok(())
    }
}
