//! Pipeline definitions and run state.
//!
//! Definitions are authored externally (YAML or JSON) and consumed read-only
//! by the executor. Field names follow the camelCase document format.

use crate::types::Capability;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A complete pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<InputSlot>,
    pub steps: Vec<Step>,
    /// Global instruction sent as the system message of language steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl Pipeline {
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn input(&self, name: &str) -> Option<&InputSlot> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Names of inputs that may be left empty.
    pub fn optional_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .filter(|i| !i.required)
            .map(|i| i.name.as_str())
    }
}

/// How the final output should be presented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Markdown,
    Json,
}

/// Kind of form control backing an input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    Text,
    Textarea,
    File,
    Select,
    Toggle,
}

/// A declared pipeline input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSlot {
    pub name: String,
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// File type filter for `file` inputs, e.g. `image/*`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepts: Option<String>,
    #[serde(
        default,
        deserialize_with = "scalar_as_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_value: Option<String>,
}

/// Accept `defaultValue: true` or `defaultValue: 3` as well as strings.
fn scalar_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Which family of model a step runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepModel {
    Language,
    Vision,
    Audio,
}

impl StepModel {
    pub fn capability(self) -> Capability {
        match self {
            Self::Language => Capability::Chat,
            Self::Vision => Capability::VisionCaption,
            Self::Audio => Capability::AudioTranscribe,
        }
    }
}

impl fmt::Display for StepModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Language => write!(f, "language"),
            Self::Vision => write!(f, "vision"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// A single step of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    pub model: StepModel,
    /// Variable reference of the form `$name`.
    pub input: String,
    #[serde(default)]
    pub prompt: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Step {
    /// The variable named by `input`, if it is a well-formed reference.
    pub fn input_variable(&self) -> Option<&str> {
        variable_reference(&self.input)
    }
}

/// Parse a `$name` reference.
pub fn variable_reference(reference: &str) -> Option<&str> {
    reference
        .trim()
        .strip_prefix('$')
        .filter(|name| !name.is_empty() && !name.contains(char::is_whitespace))
}

/// Comparison applied by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Contains,
    Empty,
    NotEmpty,
    Equals,
    NotEquals,
}

impl ConditionOperator {
    pub fn requires_value(self) -> bool {
        matches!(self, Self::Contains | Self::Equals | Self::NotEquals)
    }
}

/// What happens when a condition is satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionAction {
    #[default]
    Continue,
    Skip,
    Stop,
}

/// A guard evaluated before a step is dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Variable reference of the form `$name`.
    pub check: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub action: ConditionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_to: Option<String>,
}

impl Condition {
    pub fn check_variable(&self) -> Option<&str> {
        variable_reference(&self.check)
    }
}

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Running,
    /// Reserved for human-in-the-loop steps.
    Paused,
    Completed,
    Error,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Variable bindings visible to a run. Keys are only ever added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext(BTreeMap<String, String>);

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ExecutionContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// State of one pipeline run, persisted for resumability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub status: ExecutionStatus,
    pub current_step_index: usize,
    /// Step name to result, for dispatched steps only.
    pub step_results: BTreeMap<String, String>,
    /// Dispatched step names in execution order.
    #[serde(default)]
    pub executed_steps: Vec<String>,
    #[serde(default)]
    pub context: ExecutionContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    pub fn new(run_id: Uuid, pipeline_id: impl Into<String>) -> Self {
        Self {
            run_id,
            pipeline_id: pipeline_id.into(),
            status: ExecutionStatus::Idle,
            current_step_index: 0,
            step_results: BTreeMap::new(),
            executed_steps: Vec::new(),
            context: ExecutionContext::new(),
            error: None,
            final_output: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub(crate) fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_reference() {
        assert_eq!(variable_reference("$content"), Some("content"));
        assert_eq!(variable_reference(" $x "), Some("x"));
        assert_eq!(variable_reference("content"), None);
        assert_eq!(variable_reference("$"), None);
        assert_eq!(variable_reference("$a b"), None);
    }

    #[test]
    fn test_condition_deserializes_camel_case() {
        let condition: Condition = serde_json::from_str(
            r#"{"check":"$flag","operator":"not_equals","value":"x","action":"skip","skipTo":"last"}"#,
        )
        .unwrap();
        assert_eq!(condition.operator, ConditionOperator::NotEquals);
        assert_eq!(condition.action, ConditionAction::Skip);
        assert_eq!(condition.skip_to.as_deref(), Some("last"));
        assert_eq!(condition.check_variable(), Some("flag"));
    }

    #[test]
    fn test_default_value_accepts_scalars() {
        let slot: InputSlot =
            serde_json::from_str(r#"{"name":"loud","type":"toggle","defaultValue":true}"#).unwrap();
        assert_eq!(slot.input_type, InputType::Toggle);
        assert_eq!(slot.default_value.as_deref(), Some("true"));
        assert!(!slot.required);
    }

    #[test]
    fn test_status_display_and_terminal() {
        assert_eq!(ExecutionStatus::Completed.to_string(), "completed");
        assert!(ExecutionStatus::Error.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
    }

    #[test]
    fn test_state_serializes_step_results_camel_case() {
        let mut state = ExecutionState::new(Uuid::new_v4(), "p");
        state.step_results.insert("a".into(), "b".into());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["stepResults"]["a"], "b");
        assert_eq!(json["status"], "idle");
    }
}
