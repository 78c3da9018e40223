//! Provider adapters.
//!
//! One adapter per backend, all implementing [`ModelProvider`]:
//! - [`daemon::DaemonProvider`] for an Ollama-compatible local daemon
//! - [`embedded::EmbeddedProvider`] for the in-process runtime
//! - [`cloud::CloudProvider`] for an OpenAI-compatible cloud API
//! - [`mock::MockProvider`] for tests
//!
//! Adapters own their connection state exclusively and never share mutable
//! state with each other.

pub mod cloud;
pub mod daemon;
pub mod embedded;
pub mod mock;

use crate::error::ProviderError;
use crate::types::{
    AudioOutput, AudioRequest, BackendKind, BackendStatus, Capability, ChatOutput, ChatRequest,
    EmbedOutput, EmbedRequest, GenerateOutput, GenerateRequest, ImageGenerateRequest, ImageOutput,
    ModelDescriptor, PullProgress, VisionOutput, VisionRequest,
};
use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};

pub use cloud::CloudProvider;
pub use daemon::DaemonProvider;
pub use embedded::{EmbeddedProvider, InferenceEngine, ResidentModel};
pub use mock::MockProvider;

/// Who keeps a backend's models resident in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// The host process holds model weights; the router must load, account
    /// and evict them.
    HostManaged,
    /// The backend manages residency itself; `load`/`unload` are no-ops.
    BackendManaged,
}

/// Result of a successful `load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub footprint_bytes: u64,
}

/// Where an adapter reports pull progress.
pub type ProgressSink = mpsc::UnboundedSender<PullProgress>;

/// The uniform capability contract every backend adapter implements.
///
/// `model` arguments are backend-native names (the part after the backend
/// tag of a `ModelId`). Capabilities a backend lacks default to
/// [`ProviderError::Unsupported`].
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn backend(&self) -> BackendKind;

    fn residency(&self) -> Residency {
        Residency::BackendManaged
    }

    /// Current status. May be served from a short-lived cache.
    async fn probe(&self) -> BackendStatus;

    /// Drop any cached probe so the next `probe` hits the backend.
    fn invalidate_probe(&self) {}

    /// Descriptors currently known to the backend.
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError>;

    async fn chat(
        &self,
        _model: &str,
        _request: &ChatRequest,
    ) -> Result<ChatOutput, ProviderError> {
        Err(self.unsupported(Capability::Chat))
    }

    async fn generate(
        &self,
        _model: &str,
        _request: &GenerateRequest,
    ) -> Result<GenerateOutput, ProviderError> {
        Err(self.unsupported(Capability::Generate))
    }

    async fn embed(
        &self,
        _model: &str,
        _request: &EmbedRequest,
    ) -> Result<EmbedOutput, ProviderError> {
        Err(self.unsupported(Capability::Embed))
    }

    async fn vision(
        &self,
        _model: &str,
        request: &VisionRequest,
    ) -> Result<VisionOutput, ProviderError> {
        Err(self.unsupported(request.task.capability()))
    }

    async fn audio(
        &self,
        _model: &str,
        request: &AudioRequest,
    ) -> Result<AudioOutput, ProviderError> {
        Err(self.unsupported(request.task.capability()))
    }

    async fn image_generate(
        &self,
        _model: &str,
        _request: &ImageGenerateRequest,
    ) -> Result<ImageOutput, ProviderError> {
        Err(self.unsupported(Capability::ImageGeneration))
    }

    /// Download or install a model, reporting progress on `progress`.
    ///
    /// Returns once the model is installed or the pull failed.
    async fn pull(&self, model: &str, progress: ProgressSink) -> Result<(), ProviderError>;

    async fn load(&self, _model: &str) -> Result<LoadOutcome, ProviderError> {
        Ok(LoadOutcome { footprint_bytes: 0 })
    }

    async fn unload(&self, _model: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    fn unsupported(&self, capability: Capability) -> ProviderError {
        ProviderError::Unsupported {
            backend: self.backend(),
            capability,
        }
    }
}

// ---------------------------------------------------------------------------
// Probe cache
// ---------------------------------------------------------------------------

/// Caches an adapter's last probe for a short TTL.
///
/// The lock is held across the probe so concurrent callers share one request.
#[derive(Debug)]
pub struct ProbeCache {
    ttl: Duration,
    slot: Mutex<Option<(Instant, BackendStatus)>>,
}

impl ProbeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Return the cached status if fresh, otherwise run `probe` and cache it.
    pub async fn get_or_probe<F, Fut>(&self, probe: F) -> BackendStatus
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BackendStatus>,
    {
        let mut slot = self.slot.lock().await;
        if let Some((at, status)) = slot.as_ref()
            && at.elapsed() < self.ttl
        {
            return status.clone();
        }
        let status = probe().await;
        *slot = Some((Instant::now(), status.clone()));
        status
    }

    pub fn invalidate(&self) {
        if let Ok(mut slot) = self.slot.try_lock() {
            *slot = None;
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers shared by the HTTP-backed adapters
// ---------------------------------------------------------------------------

pub(crate) fn http_client(
    backend: BackendKind,
    timeout: Duration,
) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Request {
            backend,
            message: format!("Failed to build HTTP client: {e}"),
        })
}

/// Classify a transport error: connection failures mean the backend is down.
pub(crate) fn transport_error(backend: BackendKind, e: reqwest::Error) -> ProviderError {
    if e.is_connect() || e.is_timeout() {
        ProviderError::Unavailable {
            backend,
            message: e.to_string(),
        }
    } else {
        ProviderError::Request {
            backend,
            message: format!("Request failed: {e}"),
        }
    }
}

/// Read a response body, mapping non-success statuses to typed errors.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    backend: BackendKind,
    model: &str,
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = response.status();
    let body = response.text().await.map_err(|e| ProviderError::Request {
        backend,
        message: format!("Failed to read response body: {e}"),
    })?;
    if !status.is_success() {
        return Err(map_http_error(backend, model, status, &body));
    }
    serde_json::from_str(&body).map_err(|e| ProviderError::ResponseParse {
        backend,
        message: format!("Invalid JSON: {e}"),
    })
}

pub(crate) fn map_http_error(
    backend: BackendKind,
    model: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> ProviderError {
    match status.as_u16() {
        401 | 403 => {
            tracing::debug!(backend = %backend, body = %body, "Authentication failed");
            ProviderError::AuthFailed {
                backend,
                message: format!("HTTP {status}"),
            }
        }
        404 => ProviderError::ModelNotFound {
            backend,
            model: model.to_string(),
        },
        code if code >= 500 => ProviderError::Request {
            backend,
            message: format!("Server error ({status}): {body}"),
        },
        _ => ProviderError::Request {
            backend,
            message: format!("HTTP {status}: {body}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Availability;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_probe_cache_serves_fresh_entry() {
        let cache = ProbeCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        for _ in 0..3 {
            let status = cache
                .get_or_probe(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    BackendStatus::available(BackendKind::LocalDaemon, Vec::new())
                })
                .await;
            assert_eq!(status.availability, Availability::Available);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_cache_expires_and_invalidates() {
        let cache = ProbeCache::new(Duration::ZERO);
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let probe = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            BackendStatus::unavailable(BackendKind::Cloud, "no key")
        };
        cache.get_or_probe(probe).await;
        cache.get_or_probe(probe).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let cache = ProbeCache::new(Duration::from_secs(60));
        cache.get_or_probe(probe).await;
        cache.invalidate();
        cache.get_or_probe(probe).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_http_error_mapping() {
        let err = map_http_error(
            BackendKind::Cloud,
            "gpt-4o",
            reqwest::StatusCode::UNAUTHORIZED,
            "",
        );
        assert!(matches!(err, ProviderError::AuthFailed { .. }));

        let err = map_http_error(
            BackendKind::LocalDaemon,
            "llama3",
            reqwest::StatusCode::NOT_FOUND,
            "model not found",
        );
        assert_eq!(err.to_string(), "Model 'llama3' not found on daemon backend");
    }
}
