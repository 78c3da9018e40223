//! Cloud inference adapter for OpenAI-compatible APIs.
//!
//! The backend is available whenever an API key can be resolved. Nothing is
//! installed locally, so `pull` completes immediately and residency is
//! managed remotely.

use super::{ModelProvider, ProbeCache, ProgressSink, http_client, read_json, transport_error};
use crate::config::CloudConfig;
use crate::error::ProviderError;
use crate::types::{
    AudioOutput, AudioRequest, AudioTask, BackendKind, BackendStatus, Capability, ChatMessage,
    ChatOutput, ChatRequest, EmbedOutput, EmbedRequest, GenerateOutput, GenerateRequest,
    ImageGenerateRequest, ImageOutput, MediaInput, ModelDescriptor, ModelId, PullPhase,
    PullProgress, Role, VisionOutput, VisionRequest, VisionTask,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const BACKEND: BackendKind = BackendKind::Cloud;

const VISION_CHAT: &[Capability] = &[
    Capability::Chat,
    Capability::Generate,
    Capability::VisionCaption,
    Capability::VisionDetect,
    Capability::VisionOcr,
];

/// Models the cloud API is known to serve.
pub fn known_models() -> Vec<ModelDescriptor> {
    let entry = |name: &str, display: &str, caps: &[Capability]| {
        ModelDescriptor::new(ModelId::new(BACKEND, name), display, caps.iter().copied())
            .installed(true)
    };
    vec![
        entry("gpt-4o-mini", "GPT-4o mini", VISION_CHAT),
        entry("gpt-4o", "GPT-4o", VISION_CHAT),
        entry(
            "text-embedding-3-small",
            "Text Embedding 3 Small",
            &[Capability::Embed],
        ),
        entry(
            "whisper-1",
            "Whisper",
            &[Capability::AudioTranscribe, Capability::AudioTranslate],
        ),
        entry("dall-e-3", "DALL·E 3", &[Capability::ImageGeneration]),
    ]
}

/// Adapter for an OpenAI-compatible cloud API.
pub struct CloudProvider {
    base_url: String,
    api_key_env: String,
    api_key: Option<String>,
    client: reqwest::Client,
    cache: ProbeCache,
}

impl CloudProvider {
    pub fn new(config: &CloudConfig, probe_ttl: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key_env: config.api_key_env.clone(),
            api_key: None,
            client: http_client(BACKEND, Duration::from_secs(config.timeout_secs))?,
            cache: ProbeCache::new(probe_ttl),
        })
    }

    /// Use an explicitly provided key instead of the environment.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn api_key(&self) -> Result<String, ProviderError> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::AuthFailed {
                backend: BACKEND,
                message: format!("env var '{}' not set", self.api_key_env),
            })
    }

    async fn post_json(&self, path: &str, model: &str, body: &Value) -> Result<Value, ProviderError> {
        let key = self.api_key()?;
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, model = %model, "Sending cloud request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        read_json(BACKEND, model, response).await
    }

    async fn chat_completion(&self, model: &str, body: Value) -> Result<String, ProviderError> {
        let json = self.post_json("/chat/completions", model, &body).await?;
        Self::parse_completion(&json)
    }

    fn parse_completion(json: &Value) -> Result<String, ProviderError> {
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::ResponseParse {
                backend: BACKEND,
                message: "missing choices[0].message.content".into(),
            })
    }

    fn messages_to_json(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect()
    }

    async fn image_part(media: &MediaInput) -> Result<Value, ProviderError> {
        let data = media.to_base64().await.map_err(|source| ProviderError::Io {
            backend: BACKEND,
            source,
        })?;
        Ok(json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{};base64,{}", media.mime_type(), data) },
        }))
    }

    async fn user_with_images(text: &str, images: &[MediaInput]) -> Result<Value, ProviderError> {
        let mut parts = vec![json!({ "type": "text", "text": text })];
        for image in images {
            parts.push(Self::image_part(image).await?);
        }
        Ok(json!({ "role": Role::User.as_str(), "content": parts }))
    }

    fn size_string(width: Option<u32>, height: Option<u32>) -> String {
        match (width, height) {
            (Some(w), Some(h)) => format!("{w}x{h}"),
            (Some(s), None) | (None, Some(s)) => format!("{s}x{s}"),
            (None, None) => "1024x1024".to_string(),
        }
    }
}

#[async_trait]
impl ModelProvider for CloudProvider {
    fn backend(&self) -> BackendKind {
        BACKEND
    }

    async fn probe(&self) -> BackendStatus {
        self.cache
            .get_or_probe(|| async move {
                match self.api_key() {
                    Ok(_) => BackendStatus::available(BACKEND, known_models()),
                    Err(e) => BackendStatus::unavailable(BACKEND, e.to_string()),
                }
            })
            .await
    }

    fn invalidate_probe(&self) {
        self.cache.invalidate();
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        Ok(known_models())
    }

    async fn chat(&self, model: &str, request: &ChatRequest) -> Result<ChatOutput, ProviderError> {
        let mut body = json!({
            "model": model,
            "messages": Self::messages_to_json(&request.messages),
            "stream": false,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        let content = self.chat_completion(model, body).await?;
        Ok(ChatOutput {
            message: ChatMessage::assistant(content),
            done: true,
        })
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateOutput, ProviderError> {
        let mut body = json!({
            "model": model,
            "messages": [Self::user_with_images(&request.prompt, &request.images).await?],
            "stream": false,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        let response = self.chat_completion(model, body).await?;
        Ok(GenerateOutput {
            response,
            done: true,
        })
    }

    async fn embed(&self, model: &str, request: &EmbedRequest) -> Result<EmbedOutput, ProviderError> {
        let json = self
            .post_json(
                "/embeddings",
                model,
                &json!({ "model": model, "input": request.text }),
            )
            .await?;
        let data = json["data"]
            .as_array()
            .ok_or_else(|| ProviderError::ResponseParse {
                backend: BACKEND,
                message: "missing data array".into(),
            })?;
        let embeddings = data
            .iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|v| v.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
                    .unwrap_or_default()
            })
            .collect();
        Ok(EmbedOutput { embeddings })
    }

    async fn vision(
        &self,
        model: &str,
        request: &VisionRequest,
    ) -> Result<VisionOutput, ProviderError> {
        let body = json!({
            "model": model,
            "messages": [Self::user_with_images(
                request.instruction(),
                std::slice::from_ref(&request.image),
            )
            .await?],
            "stream": false,
        });
        let content = self.chat_completion(model, body).await?;
        let results = match request.task {
            VisionTask::Detect => content
                .lines()
                .map(|l| l.trim().trim_start_matches(['-', '*', ' ']).to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            VisionTask::Caption | VisionTask::Ocr => vec![content.trim().to_string()],
        };
        Ok(VisionOutput {
            task: request.task,
            results,
        })
    }

    async fn audio(&self, model: &str, request: &AudioRequest) -> Result<AudioOutput, ProviderError> {
        let key = self.api_key()?;
        let bytes = request.audio.to_bytes().await.map_err(|source| ProviderError::Io {
            backend: BACKEND,
            source,
        })?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(request.audio.file_name())
            .mime_str(request.audio.mime_type())
            .map_err(|e| ProviderError::Request {
                backend: BACKEND,
                message: format!("MIME error: {e}"),
            })?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model.to_string());
        let path = match request.task {
            AudioTask::Transcribe => {
                if let Some(language) = &request.language {
                    form = form.text("language", language.clone());
                }
                "/audio/transcriptions"
            }
            AudioTask::Translate => "/audio/translations",
        };

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        let json: Value = read_json(BACKEND, model, response).await?;
        Ok(AudioOutput {
            task: request.task,
            result: json["text"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn image_generate(
        &self,
        model: &str,
        request: &ImageGenerateRequest,
    ) -> Result<ImageOutput, ProviderError> {
        let prompt = match &request.negative_prompt {
            Some(negative) if !negative.trim().is_empty() => {
                format!("{}\n\nAvoid: {}", request.prompt, negative)
            }
            _ => request.prompt.clone(),
        };
        let body = json!({
            "model": model,
            "prompt": prompt,
            "n": 1,
            "size": Self::size_string(request.width, request.height),
            "response_format": "b64_json",
        });
        let json = self.post_json("/images/generations", model, &body).await?;
        let image = json["data"][0]["b64_json"]
            .as_str()
            .ok_or_else(|| ProviderError::ResponseParse {
                backend: BACKEND,
                message: "missing data[0].b64_json".into(),
            })?;
        Ok(ImageOutput {
            image: image.to_string(),
        })
    }

    async fn pull(&self, model: &str, progress: ProgressSink) -> Result<(), ProviderError> {
        let _ = progress.send(PullProgress::new(
            ModelId::new(BACKEND, model),
            PullPhase::Complete,
            1.0,
        ));
        Ok(())
    }
}
