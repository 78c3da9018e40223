//! # Switchyard Core
//!
//! Core library for the Switchyard local-first AI workbench.
//! Provides the model registry, provider adapters for the local daemon,
//! embedded runtime and cloud API, the resource manager, the provider
//! manager that routes requests between them, and the pipeline engine.

pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod providers;
pub mod registry;
pub mod resources;
pub mod router;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{WorkbenchConfig, config_exists, load_config};
pub use error::{
    ConfigError, PipelineError, ProviderError, RegistryError, ResolutionError, Result,
    RouterError, SwitchyardError,
};
pub use events::{EventBus, Subscription};
pub use pipeline::{ExecutionState, ExecutionStatus, Pipeline, PipelineExecutor, StepDispatcher};
pub use providers::{MockProvider, ModelProvider};
pub use registry::{ModelFilter, ModelRegistry};
pub use resources::{LoadedModelRecord, ResourceManager};
pub use router::{ProviderManager, PullHandle};
pub use types::{
    AggregateStatus, Availability, BackendKind, BackendStatus, Capability, ChatMessage,
    ChatRequest, EmbedRequest, GenerateRequest, ModelDescriptor, ModelId, PullPhase,
    PullProgress, Routed, Target,
};
