//! Core types shared across the orchestration runtime.
//!
//! Identifiers, capabilities, model descriptors, backend status snapshots, and
//! the request/response shapes of the unified request surface.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// One of the three interchangeable inference backends.
///
/// Declaration order is the operating-cost priority used by the router:
/// local daemon first, then the embedded runtime, then the cloud API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "daemon")]
    LocalDaemon,
    #[serde(rename = "embedded")]
    EmbeddedRuntime,
    #[serde(rename = "cloud")]
    Cloud,
}

impl BackendKind {
    /// All backends in priority order.
    pub const ALL: [BackendKind; 3] = [
        BackendKind::LocalDaemon,
        BackendKind::EmbeddedRuntime,
        BackendKind::Cloud,
    ];

    /// Short tag used as the prefix of composite model identifiers.
    pub fn tag(&self) -> &'static str {
        match self {
            BackendKind::LocalDaemon => "daemon",
            BackendKind::EmbeddedRuntime => "embedded",
            BackendKind::Cloud => "cloud",
        }
    }

    /// Relative operating cost; lower is preferred.
    pub fn cost_rank(&self) -> u8 {
        match self {
            BackendKind::LocalDaemon => 0,
            BackendKind::EmbeddedRuntime => 1,
            BackendKind::Cloud => 2,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daemon" | "ollama" | "local" => Ok(BackendKind::LocalDaemon),
            "embedded" | "runtime" => Ok(BackendKind::EmbeddedRuntime),
            "cloud" | "api" => Ok(BackendKind::Cloud),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Composite model identifier: backend tag plus backend-native model name.
///
/// Renders as `<tag>/<name>`, e.g. `daemon/llama3.2:3b`. Parsing splits at the
/// first `/`, so model names may themselves contain slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelId {
    pub backend: BackendKind,
    pub name: String,
}

impl ModelId {
    pub fn new(backend: BackendKind, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.backend.tag(), self.name)
    }
}

impl FromStr for ModelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, name) = s
            .split_once('/')
            .ok_or_else(|| format!("'{s}' has no backend prefix"))?;
        let backend = tag.parse::<BackendKind>()?;
        if name.is_empty() {
            return Err(format!("'{s}' has an empty model name"));
        }
        Ok(ModelId::new(backend, name))
    }
}

impl TryFrom<String> for ModelId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelId> for String {
    fn from(id: ModelId) -> Self {
        id.to_string()
    }
}

/// A task kind a model supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "generate")]
    Generate,
    #[serde(rename = "embed")]
    Embed,
    #[serde(rename = "vision-caption")]
    VisionCaption,
    #[serde(rename = "vision-detect")]
    VisionDetect,
    #[serde(rename = "vision-ocr")]
    VisionOcr,
    #[serde(rename = "audio-transcribe")]
    AudioTranscribe,
    #[serde(rename = "audio-translate")]
    AudioTranslate,
    #[serde(rename = "image-generation")]
    ImageGeneration,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::Generate => "generate",
            Capability::Embed => "embed",
            Capability::VisionCaption => "vision-caption",
            Capability::VisionDetect => "vision-detect",
            Capability::VisionOcr => "vision-ocr",
            Capability::AudioTranscribe => "audio-transcribe",
            Capability::AudioTranslate => "audio-translate",
            Capability::ImageGeneration => "image-generation",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown capability '{s}'"))
    }
}

/// Coarse hint of the hardware a model needs to run comfortably.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareTier {
    #[default]
    Any,
    Low,
    Medium,
    High,
}

/// Whether a model runs on this machine or only behind a remote API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    #[default]
    OnDevice,
    CloudOnly,
}

/// Catalog entry for a known model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: ModelId,
    pub display_name: String,
    pub capabilities: BTreeSet<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub hardware_tier: HardwareTier,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub locality: Locality,
}

impl ModelDescriptor {
    pub fn new(
        id: ModelId,
        display_name: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        let locality = match id.backend {
            BackendKind::Cloud => Locality::CloudOnly,
            _ => Locality::OnDevice,
        };
        Self {
            id,
            display_name: display_name.into(),
            capabilities: capabilities.into_iter().collect(),
            size_bytes: None,
            hardware_tier: HardwareTier::Any,
            installed: false,
            locality,
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn with_tier(mut self, tier: HardwareTier) -> Self {
        self.hardware_tier = tier;
        self
    }

    pub fn installed(mut self, installed: bool) -> Self {
        self.installed = installed;
        self
    }

    pub fn backend(&self) -> BackendKind {
        self.id.backend
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Availability of a backend at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Unavailable,
    Checking,
    Downloading,
}

impl Availability {
    /// Whether requests can be dispatched to the backend.
    pub fn is_usable(&self) -> bool {
        matches!(self, Availability::Available | Availability::Downloading)
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Available => write!(f, "available"),
            Availability::Unavailable => write!(f, "unavailable"),
            Availability::Checking => write!(f, "checking"),
            Availability::Downloading => write!(f, "downloading"),
        }
    }
}

/// Snapshot of one backend. Always replaced wholesale, never patched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub backend: BackendKind,
    pub availability: Availability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<PullProgress>,
}

impl BackendStatus {
    pub fn available(backend: BackendKind, models: Vec<ModelDescriptor>) -> Self {
        Self {
            backend,
            availability: Availability::Available,
            error: None,
            models,
            download: None,
        }
    }

    pub fn unavailable(backend: BackendKind, error: impl Into<String>) -> Self {
        Self {
            backend,
            availability: Availability::Unavailable,
            error: Some(error.into()),
            models: Vec::new(),
            download: None,
        }
    }

    pub fn has_installed(&self, id: &ModelId) -> bool {
        self.models.iter().any(|m| &m.id == id && m.installed)
    }
}

/// Aggregate status published by the router after every refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStatus {
    pub backends: Vec<BackendStatus>,
    pub has_available: bool,
    pub recommended: Option<BackendKind>,
    pub refreshed_at: DateTime<Utc>,
}

impl AggregateStatus {
    /// Status before the first refresh: every backend still being checked.
    pub fn checking(backends: &[BackendKind]) -> Self {
        Self {
            backends: backends
                .iter()
                .map(|b| BackendStatus {
                    backend: *b,
                    availability: Availability::Checking,
                    error: None,
                    models: Vec::new(),
                    download: None,
                })
                .collect(),
            has_available: false,
            recommended: None,
            refreshed_at: Utc::now(),
        }
    }

    pub fn backend(&self, backend: BackendKind) -> Option<&BackendStatus> {
        self.backends.iter().find(|s| s.backend == backend)
    }

    pub fn is_usable(&self, backend: BackendKind) -> bool {
        self.backend(backend)
            .is_some_and(|s| s.availability.is_usable())
    }
}

// ---------------------------------------------------------------------------
// Pull progress
// ---------------------------------------------------------------------------

/// Phase of a model download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPhase {
    Downloading,
    Verifying,
    Complete,
    Error,
}

impl PullPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PullPhase::Complete | PullPhase::Error)
    }
}

/// A progress event for a pull, as emitted on the progress channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullProgress {
    pub model_id: ModelId,
    pub backend: BackendKind,
    /// Fraction complete in `0.0..=1.0`.
    pub progress: f32,
    pub phase: PullPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PullProgress {
    pub fn new(model_id: ModelId, phase: PullPhase, progress: f32) -> Self {
        Self {
            backend: model_id.backend,
            model_id,
            progress: progress.clamp(0.0, 1.0),
            phase,
            error: None,
        }
    }

    pub fn failed(model_id: ModelId, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(model_id, PullPhase::Error, 0.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// An image or audio clip passed to a backend.
///
/// Accepts a filesystem path, a `data:` URL, or raw base64 text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaInput(pub String);

impl MediaInput {
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    /// Resolve to base64-encoded bytes.
    pub async fn to_base64(&self) -> std::io::Result<String> {
        let raw = self.0.trim();
        if let Some(rest) = raw.strip_prefix("data:") {
            return rest
                .split_once(',')
                .map(|(_, data)| data.to_string())
                .ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed data URL")
                });
        }
        let path = Path::new(raw);
        if tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file()) {
            let bytes = tokio::fs::read(path).await?;
            return Ok(BASE64.encode(bytes));
        }
        Ok(raw.to_string())
    }

    /// Resolve to raw bytes.
    pub async fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        let encoded = self.to_base64().await?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Best-effort MIME type from the source's extension or data URL header.
    pub fn mime_type(&self) -> &'static str {
        let raw = self.0.trim();
        if let Some(rest) = raw.strip_prefix("data:") {
            let header = rest.split([';', ',']).next().unwrap_or_default();
            return match header {
                "image/jpeg" => "image/jpeg",
                "image/webp" => "image/webp",
                "audio/wav" | "audio/x-wav" => "audio/wav",
                "audio/mpeg" => "audio/mpeg",
                _ => "image/png",
            };
        }
        let ext = Path::new(raw)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "webp" => "image/webp",
            "wav" => "audio/wav",
            "mp3" => "audio/mpeg",
            "m4a" => "audio/mp4",
            "flac" => "audio/flac",
            _ => "image/png",
        }
    }

    /// File name to use in multipart uploads.
    pub fn file_name(&self) -> String {
        Path::new(self.0.trim())
            .file_name()
            .filter(|_| !self.0.starts_with("data:"))
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.wav".to_string())
    }
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in a chat exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Where to send a request. Both fields are optional; see the router for the
/// resolution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_backend: Option<BackendKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatOutput {
    pub message: ChatMessage,
    pub done: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(flatten)]
    pub target: Target,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<MediaInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOutput {
    pub response: String,
    pub done: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedRequest {
    pub text: String,
    #[serde(flatten)]
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedOutput {
    pub embeddings: Vec<Vec<f32>>,
}

/// Kind of visual analysis requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionTask {
    #[default]
    Caption,
    Detect,
    Ocr,
}

impl VisionTask {
    pub fn capability(&self) -> Capability {
        match self {
            VisionTask::Caption => Capability::VisionCaption,
            VisionTask::Detect => Capability::VisionDetect,
            VisionTask::Ocr => Capability::VisionOcr,
        }
    }

    /// Instruction used when the caller supplies none.
    pub fn default_prompt(&self) -> &'static str {
        match self {
            VisionTask::Caption => "Describe this image in detail.",
            VisionTask::Detect => {
                "List every distinct object visible in this image, one per line."
            }
            VisionTask::Ocr => "Transcribe all text visible in this image exactly.",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionRequest {
    pub image: MediaInput,
    #[serde(default)]
    pub task: VisionTask,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(flatten)]
    pub target: Target,
}

impl VisionRequest {
    pub fn instruction(&self) -> &str {
        self.prompt
            .as_deref()
            .unwrap_or_else(|| self.task.default_prompt())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionOutput {
    pub task: VisionTask,
    pub results: Vec<String>,
}

/// Kind of audio processing requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioTask {
    #[default]
    Transcribe,
    Translate,
}

impl AudioTask {
    pub fn capability(&self) -> Capability {
        match self {
            AudioTask::Transcribe => Capability::AudioTranscribe,
            AudioTask::Translate => Capability::AudioTranslate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioRequest {
    pub audio: MediaInput,
    #[serde(default)]
    pub task: AudioTask,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(flatten)]
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioOutput {
    pub task: AudioTask,
    pub result: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageGenerateRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(flatten)]
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOutput {
    /// Base64-encoded PNG.
    pub image: String,
}

/// An adapter response tagged with the backend and model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routed<T> {
    pub backend: BackendKind,
    pub model: ModelId,
    #[serde(flatten)]
    pub output: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_roundtrip_keeps_slashes_in_name() {
        let id: ModelId = "embedded/bartowski/Llama-3.2-1B".parse().unwrap();
        assert_eq!(id.backend, BackendKind::EmbeddedRuntime);
        assert_eq!(id.name, "bartowski/Llama-3.2-1B");
        assert_eq!(id.to_string(), "embedded/bartowski/Llama-3.2-1B");
    }

    #[test]
    fn test_model_id_rejects_bare_names() {
        assert!("llama3.2".parse::<ModelId>().is_err());
        assert!("nowhere/llama3.2".parse::<ModelId>().is_err());
        assert!("daemon/".parse::<ModelId>().is_err());
    }

    #[test]
    fn test_model_id_serializes_as_string() {
        let id = ModelId::new(BackendKind::LocalDaemon, "llama3.2:3b");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"daemon/llama3.2:3b\"");
        let back: ModelId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_capability_names() {
        assert_eq!(Capability::VisionOcr.to_string(), "vision-ocr");
        assert_eq!(
            "image-generation".parse::<Capability>().unwrap(),
            Capability::ImageGeneration
        );
        assert!("telepathy".parse::<Capability>().is_err());
    }

    #[test]
    fn test_backend_priority_order() {
        let mut kinds = vec![
            BackendKind::Cloud,
            BackendKind::LocalDaemon,
            BackendKind::EmbeddedRuntime,
        ];
        kinds.sort_by_key(|k| k.cost_rank());
        assert_eq!(kinds, BackendKind::ALL.to_vec());
    }

    #[test]
    fn test_descriptor_locality_follows_backend() {
        let cloud = ModelDescriptor::new(
            ModelId::new(BackendKind::Cloud, "gpt-4o-mini"),
            "GPT-4o mini",
            [Capability::Chat],
        );
        assert_eq!(cloud.locality, Locality::CloudOnly);
        assert!(cloud.supports(Capability::Chat));
        assert!(!cloud.supports(Capability::Embed));
    }

    #[tokio::test]
    async fn test_media_input_data_url() {
        let media = MediaInput::new("data:image/jpeg;base64,aGVsbG8=");
        assert_eq!(media.to_base64().await.unwrap(), "aGVsbG8=");
        assert_eq!(media.to_bytes().await.unwrap(), b"hello");
        assert_eq!(media.mime_type(), "image/jpeg");
    }

    #[tokio::test]
    async fn test_media_input_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        std::fs::write(&path, b"RIFF").unwrap();
        let media = MediaInput::new(path.to_string_lossy());
        assert_eq!(media.to_bytes().await.unwrap(), b"RIFF");
        assert_eq!(media.mime_type(), "audio/wav");
        assert_eq!(media.file_name(), "clip.wav");
    }

    #[test]
    fn test_routed_flattens_output() {
        let routed = Routed {
            backend: BackendKind::Cloud,
            model: ModelId::new(BackendKind::Cloud, "gpt-4o-mini"),
            output: GenerateOutput {
                response: "hi".into(),
                done: true,
            },
        };
        let json = serde_json::to_value(&routed).unwrap();
        assert_eq!(json["backend"], "cloud");
        assert_eq!(json["model"], "cloud/gpt-4o-mini");
        assert_eq!(json["response"], "hi");
    }
}
