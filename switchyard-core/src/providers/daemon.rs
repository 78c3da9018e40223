//! Local inference daemon adapter (Ollama-compatible HTTP API).
//!
//! The daemon manages model residency itself, so `load`/`unload` are no-ops.

use super::{
    ModelProvider, ProbeCache, ProgressSink, http_client, map_http_error, read_json,
    transport_error,
};
use crate::config::DaemonConfig;
use crate::error::ProviderError;
use crate::types::{
    BackendKind, BackendStatus, Capability, ChatMessage, ChatOutput, ChatRequest, EmbedOutput,
    EmbedRequest, GenerateOutput, GenerateRequest, HardwareTier, ModelDescriptor, ModelId,
    PullPhase, PullProgress, Role, VisionOutput, VisionRequest, VisionTask,
};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const BACKEND: BackendKind = BackendKind::LocalDaemon;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Default, Serialize)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl WireOptions {
    fn from_parts(temperature: Option<f32>, num_predict: Option<u32>) -> Option<Self> {
        if temperature.is_none() && num_predict.is_none() {
            None
        } else {
            Some(Self {
                temperature,
                num_predict,
            })
        }
    }
}

#[derive(Debug, Serialize)]
struct WireChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireOptions>,
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    message: WireMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Serialize)]
struct WireGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireOptions>,
}

#[derive(Debug, Deserialize)]
struct WireGenerateResponse {
    response: String,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Serialize)]
struct WireEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct WireTags {
    #[serde(default)]
    models: Vec<WireTag>,
}

#[derive(Debug, Deserialize)]
struct WireTag {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    details: Option<WireTagDetails>,
}

#[derive(Debug, Deserialize)]
struct WireTagDetails {
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    families: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WireVersion {
    version: String,
}

#[derive(Debug, Serialize)]
struct WirePullRequest<'a> {
    name: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WirePullEvent {
    #[serde(default)]
    status: String,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Adapter for a local Ollama-compatible daemon.
pub struct DaemonProvider {
    base_url: String,
    client: reqwest::Client,
    /// Pulls can run for many minutes; this client only bounds connecting.
    pull_client: reqwest::Client,
    cache: ProbeCache,
}

impl DaemonProvider {
    pub fn new(config: &DaemonConfig, probe_ttl: Duration) -> Result<Self, ProviderError> {
        let client = http_client(BACKEND, Duration::from_secs(config.timeout_secs))?;
        let pull_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| transport_error(BACKEND, e))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            pull_client,
            cache: ProbeCache::new(probe_ttl),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn version(&self) -> Result<String, ProviderError> {
        let response = self
            .client
            .get(self.url("/api/version"))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        let version: WireVersion = read_json(BACKEND, "", response).await?;
        Ok(version.version)
    }

    async fn probe_uncached(&self) -> BackendStatus {
        let version = match self.version().await {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Local daemon not reachable");
                return BackendStatus::unavailable(BACKEND, e.to_string());
            }
        };
        match self.list_models().await {
            Ok(models) => {
                debug!(version = %version, models = models.len(), "Local daemon available");
                BackendStatus::available(BACKEND, models)
            }
            Err(e) => BackendStatus::unavailable(BACKEND, e.to_string()),
        }
    }

    async fn post_generate(
        &self,
        model: &str,
        prompt: &str,
        images: Vec<String>,
        options: Option<WireOptions>,
    ) -> Result<WireGenerateResponse, ProviderError> {
        let body = WireGenerateRequest {
            model,
            prompt,
            stream: false,
            images,
            options,
        };
        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        read_json(BACKEND, model, response).await
    }
}

/// Guess capabilities from the model name and family, since the tags
/// listing does not declare them.
pub fn infer_capabilities(name: &str, families: &[String]) -> Vec<Capability> {
    let lower = name.to_ascii_lowercase();
    let is_family = |needle: &str| families.iter().any(|f| f.eq_ignore_ascii_case(needle));

    if lower.contains("embed") || is_family("bert") || is_family("nomic-bert") {
        return vec![Capability::Embed];
    }
    let vision = ["llava", "vision", "moondream", "minicpm-v", "bakllava"]
        .iter()
        .any(|marker| lower.contains(marker))
        || is_family("clip")
        || is_family("mllama");
    if vision {
        return vec![
            Capability::Chat,
            Capability::Generate,
            Capability::VisionCaption,
            Capability::VisionDetect,
            Capability::VisionOcr,
        ];
    }
    vec![Capability::Chat, Capability::Generate]
}

pub(crate) fn tier_for_size(size_bytes: u64) -> HardwareTier {
    const GB: u64 = 1_000_000_000;
    match size_bytes {
        0 => HardwareTier::Any,
        s if s < 2 * GB => HardwareTier::Low,
        s if s < 6 * GB => HardwareTier::Medium,
        _ => HardwareTier::High,
    }
}

fn map_pull_event(id: &ModelId, event: &WirePullEvent) -> PullProgress {
    if event.status == "success" {
        return PullProgress::new(id.clone(), PullPhase::Complete, 1.0);
    }
    if event.status.starts_with("verifying") || event.status.starts_with("writing") {
        return PullProgress::new(id.clone(), PullPhase::Verifying, 1.0);
    }
    let fraction = match (event.completed, event.total) {
        (Some(done), Some(total)) if total > 0 => done as f32 / total as f32,
        _ => 0.0,
    };
    PullProgress::new(id.clone(), PullPhase::Downloading, fraction)
}

#[async_trait]
impl ModelProvider for DaemonProvider {
    fn backend(&self) -> BackendKind {
        BACKEND
    }

    async fn probe(&self) -> BackendStatus {
        self.cache.get_or_probe(|| self.probe_uncached()).await
    }

    fn invalidate_probe(&self) {
        self.cache.invalidate();
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        let tags: WireTags = read_json(BACKEND, "", response).await?;
        Ok(tags
            .models
            .into_iter()
            .map(|tag| {
                let families: Vec<String> = tag
                    .details
                    .map(|d| {
                        let mut all = d.families.unwrap_or_default();
                        all.extend(d.family);
                        all
                    })
                    .unwrap_or_default();
                let capabilities = infer_capabilities(&tag.name, &families);
                ModelDescriptor::new(
                    ModelId::new(BACKEND, tag.name.clone()),
                    tag.name,
                    capabilities,
                )
                .with_size(tag.size)
                .with_tier(tier_for_size(tag.size))
                .installed(true)
            })
            .collect())
    }

    async fn chat(&self, model: &str, request: &ChatRequest) -> Result<ChatOutput, ProviderError> {
        let body = WireChatRequest {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            stream: false,
            options: WireOptions::from_parts(request.temperature, request.max_tokens),
        };
        debug!(model = %model, messages = body.messages.len(), "Sending daemon chat request");
        let response = self
            .client
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        let reply: WireChatResponse = read_json(BACKEND, model, response).await?;
        Ok(ChatOutput {
            message: ChatMessage {
                role: Role::Assistant,
                content: reply.message.content,
            },
            done: reply.done,
        })
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateOutput, ProviderError> {
        let mut images = Vec::with_capacity(request.images.len());
        for media in &request.images {
            images.push(media.to_base64().await.map_err(|source| ProviderError::Io {
                backend: BACKEND,
                source,
            })?);
        }
        let reply = self
            .post_generate(
                model,
                &request.prompt,
                images,
                WireOptions::from_parts(request.temperature, request.max_tokens),
            )
            .await?;
        Ok(GenerateOutput {
            response: reply.response,
            done: reply.done,
        })
    }

    async fn embed(&self, model: &str, request: &EmbedRequest) -> Result<EmbedOutput, ProviderError> {
        let body = WireEmbedRequest {
            model,
            input: &request.text,
        };
        let response = self
            .client
            .post(self.url("/api/embed"))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        let reply: WireEmbedResponse = read_json(BACKEND, model, response).await?;
        Ok(EmbedOutput {
            embeddings: reply.embeddings,
        })
    }

    async fn vision(
        &self,
        model: &str,
        request: &VisionRequest,
    ) -> Result<VisionOutput, ProviderError> {
        let image = request
            .image
            .to_base64()
            .await
            .map_err(|source| ProviderError::Io {
                backend: BACKEND,
                source,
            })?;
        let reply = self
            .post_generate(model, request.instruction(), vec![image], None)
            .await?;
        let results = match request.task {
            VisionTask::Detect => reply
                .response
                .lines()
                .map(|l| l.trim().trim_start_matches(['-', '*', ' ']).to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            VisionTask::Caption | VisionTask::Ocr => vec![reply.response.trim().to_string()],
        };
        Ok(VisionOutput {
            task: request.task,
            results,
        })
    }

    async fn pull(&self, model: &str, progress: ProgressSink) -> Result<(), ProviderError> {
        let id = ModelId::new(BACKEND, model);
        info!(model = %model, "Pulling model through local daemon");
        let response = self
            .pull_client
            .post(self.url("/api/pull"))
            .json(&WirePullRequest {
                name: model,
                stream: true,
            })
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(BACKEND, model, status, &body));
        }

        let download_error = |message: String| ProviderError::Download {
            backend: BACKEND,
            model: model.to_string(),
            message,
        };

        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::new();
        let mut finished = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_error(format!("Stream error: {e}")))?;
            buffer.extend_from_slice(&chunk);

            // NDJSON: one event per line; a chunk may end mid-line.
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let event: WirePullEvent = serde_json::from_str(text).map_err(|e| {
                    ProviderError::ResponseParse {
                        backend: BACKEND,
                        message: format!("Invalid pull event: {e}"),
                    }
                })?;
                if let Some(error) = event.error {
                    return Err(download_error(error));
                }
                let update = map_pull_event(&id, &event);
                finished = update.phase == PullPhase::Complete;
                let _ = progress.send(update);
            }
        }

        if !finished {
            return Err(download_error("stream ended before completion".into()));
        }
        self.cache.invalidate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_capabilities() {
        assert_eq!(
            infer_capabilities("nomic-embed-text:latest", &[]),
            vec![Capability::Embed]
        );
        assert!(infer_capabilities("llava:7b", &[]).contains(&Capability::VisionCaption));
        assert!(
            infer_capabilities("llama3.2-vision:11b", &["mllama".into()])
                .contains(&Capability::VisionOcr)
        );
        assert_eq!(
            infer_capabilities("qwen2.5:7b", &["qwen2".into()]),
            vec![Capability::Chat, Capability::Generate]
        );
        assert_eq!(
            infer_capabilities("all-minilm", &["bert".into()]),
            vec![Capability::Embed]
        );
    }

    #[test]
    fn test_tier_for_size() {
        assert_eq!(tier_for_size(0), HardwareTier::Any);
        assert_eq!(tier_for_size(1_300_000_000), HardwareTier::Low);
        assert_eq!(tier_for_size(4_700_000_000), HardwareTier::Medium);
        assert_eq!(tier_for_size(40_000_000_000), HardwareTier::High);
    }

    #[test]
    fn test_map_pull_events() {
        let id = ModelId::new(BACKEND, "llama3.2:3b");
        let downloading: WirePullEvent = serde_json::from_str(
            r#"{"status":"pulling 6a0746a1ec1a","digest":"sha256:6a07","total":200,"completed":50}"#,
        )
        .unwrap();
        let update = map_pull_event(&id, &downloading);
        assert_eq!(update.phase, PullPhase::Downloading);
        assert!((update.progress - 0.25).abs() < f32::EPSILON);

        let manifest: WirePullEvent =
            serde_json::from_str(r#"{"status":"pulling manifest"}"#).unwrap();
        assert_eq!(map_pull_event(&id, &manifest).progress, 0.0);

        let verifying: WirePullEvent =
            serde_json::from_str(r#"{"status":"verifying sha256 digest"}"#).unwrap();
        assert_eq!(map_pull_event(&id, &verifying).phase, PullPhase::Verifying);

        let success: WirePullEvent = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        let update = map_pull_event(&id, &success);
        assert_eq!(update.phase, PullPhase::Complete);
        assert_eq!(update.backend, BackendKind::LocalDaemon);
    }

    #[test]
    fn test_options_omitted_when_empty() {
        assert!(WireOptions::from_parts(None, None).is_none());
        let body = WireGenerateRequest {
            model: "llama3",
            prompt: "hi",
            stream: false,
            images: Vec::new(),
            options: WireOptions::from_parts(Some(0.2), Some(64)),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["options"]["num_predict"], 64);
        assert!(json.get("images").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_daemon_reports_unavailable() {
        let config = DaemonConfig {
            enabled: true,
            base_url: "http://127.0.0.1:9".into(),
            timeout_secs: 2,
        };
        let provider = DaemonProvider::new(&config, Duration::from_secs(5)).unwrap();
        let status = provider.probe().await;
        assert_eq!(status.availability, crate::types::Availability::Unavailable);
        assert!(status.error.is_some());
    }
}
