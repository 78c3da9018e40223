//! Error types for the Switchyard orchestration core.
//!
//! Uses `thiserror` for public API error types with structured variants. Each
//! domain has its own enum; every user-visible variant names the component
//! that failed (backend, model, step) so no failure surfaces as a bare message.

use crate::types::{BackendKind, Capability, ModelId};
use std::path::PathBuf;
use uuid::Uuid;

/// Top-level error type for the Switchyard core library.
#[derive(Debug, thiserror::Error)]
pub enum SwitchyardError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Routing error: {0}")]
    Router(#[from] RouterError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the model registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Model '{id}' declares no capabilities")]
    EmptyCapabilities { id: ModelId },

    #[error("Model not found: {id}")]
    NotFound { id: String },

    #[error("Invalid model identifier '{id}': expected <backend>/<name>")]
    InvalidId { id: String },
}

/// Errors raised by a provider adapter. Every variant names its backend.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{backend} backend unavailable: {message}")]
    Unavailable {
        backend: BackendKind,
        message: String,
    },

    #[error("{backend} request failed: {message}")]
    Request {
        backend: BackendKind,
        message: String,
    },

    #[error("{backend} returned an unreadable response: {message}")]
    ResponseParse {
        backend: BackendKind,
        message: String,
    },

    #[error("Model '{model}' not found on {backend} backend")]
    ModelNotFound { backend: BackendKind, model: String },

    #[error("Model '{model}' is not resident on {backend} backend")]
    ModelNotLoaded { backend: BackendKind, model: String },

    #[error("{backend} backend does not support {capability}")]
    Unsupported {
        backend: BackendKind,
        capability: Capability,
    },

    #[error("Authentication failed for {backend} backend: {message}")]
    AuthFailed {
        backend: BackendKind,
        message: String,
    },

    #[error("Download of '{model}' on {backend} backend failed: {message}")]
    Download {
        backend: BackendKind,
        model: String,
        message: String,
    },

    #[error("{backend} backend IO error: {source}")]
    Io {
        backend: BackendKind,
        #[source]
        source: std::io::Error,
    },
}

impl ProviderError {
    /// The backend this error originated from.
    pub fn backend(&self) -> BackendKind {
        match self {
            ProviderError::Unavailable { backend, .. }
            | ProviderError::Request { backend, .. }
            | ProviderError::ResponseParse { backend, .. }
            | ProviderError::ModelNotFound { backend, .. }
            | ProviderError::ModelNotLoaded { backend, .. }
            | ProviderError::Unsupported { backend, .. }
            | ProviderError::AuthFailed { backend, .. }
            | ProviderError::Download { backend, .. }
            | ProviderError::Io { backend, .. } => *backend,
        }
    }
}

/// Errors from resolving a request to a backend and model.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("No available provider: every backend is unavailable")]
    NoAvailableProvider,

    #[error("Model '{model}' does not support {capability}")]
    CapabilityUnsupported {
        model: ModelId,
        capability: Capability,
    },

    #[error("No installed model supports {capability}")]
    NoModelForTask { capability: Capability },

    #[error("Backend '{backend}' is not registered")]
    BackendNotRegistered { backend: BackendKind },
}

/// Errors surfaced by the provider manager.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors from pipeline parsing, validation and execution.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to parse pipeline: {message}")]
    Parse { message: String },

    #[error("Pipeline validation failed: {message}")]
    Validation { message: String },

    #[error("Step '{step}' references undefined variable '{variable}'")]
    UndefinedVariable { step: String, variable: String },

    #[error("Template error in step '{step}': {message}")]
    Template { step: String, message: String },

    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Run cancelled before step '{step}'")]
    Cancelled { step: String },

    #[error("Pipeline run not found: {run_id}")]
    RunNotFound { run_id: Uuid },

    #[error("Failed to persist run state: {message}")]
    Persistence { message: String },
}

/// Errors from prompt template interpolation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("undefined variable '{name}'")]
    Undefined { name: String },

    #[error("{message}")]
    Syntax { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// A type alias for results using the top-level `SwitchyardError`.
pub type Result<T> = std::result::Result<T, SwitchyardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_names_backend() {
        let err = ProviderError::Request {
            backend: BackendKind::LocalDaemon,
            message: "connection refused".into(),
        };
        assert_eq!(err.to_string(), "daemon request failed: connection refused");
        assert_eq!(err.backend(), BackendKind::LocalDaemon);
    }

    #[test]
    fn test_resolution_error_display() {
        let err = ResolutionError::CapabilityUnsupported {
            model: ModelId::new(BackendKind::Cloud, "whisper-1"),
            capability: Capability::Chat,
        };
        assert_eq!(
            err.to_string(),
            "Model 'cloud/whisper-1' does not support chat"
        );
    }

    #[test]
    fn test_router_error_is_transparent() {
        let err: RouterError = ResolutionError::NoAvailableProvider.into();
        assert_eq!(
            err.to_string(),
            "No available provider: every backend is unavailable"
        );
    }

    #[test]
    fn test_pipeline_error_names_step() {
        let err = PipelineError::StepFailed {
            step: "summarize".into(),
            message: "embedded backend unavailable".into(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'summarize' failed: embedded backend unavailable"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SwitchyardError = io_err.into();
        assert!(matches!(err, SwitchyardError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: SwitchyardError = serde_err.into();
        assert!(matches!(err, SwitchyardError::Serialization(_)));
    }
}
