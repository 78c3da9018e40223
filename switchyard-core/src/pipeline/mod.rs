//! Pipeline engine.
//!
//! Declarative YAML/JSON pipelines of language, vision and audio steps with
//! `{{name}}` templating, conditional branching and tracked runs.

pub mod builtins;
pub mod executor;
pub mod parser;
pub mod template;
pub mod types;

pub use builtins::{all_builtins, get_builtin, list_builtin_names};
pub use executor::{PipelineExecutor, RunHandle, StepDispatcher};
pub use parser::{
    load_pipelines_dir, parse_pipeline, parse_pipeline_file, resolve_inputs, validate_pipeline,
};
pub use template::{TemplateContext, evaluate_condition, extract_references, interpolate};
pub use types::{
    Condition, ConditionAction, ConditionOperator, ExecutionContext, ExecutionState,
    ExecutionStatus, InputSlot, InputType, OutputFormat, Pipeline, Step, StepModel,
};
