//! Pipeline document parser, validator and input resolution.

use crate::error::PipelineError;
use crate::pipeline::template::extract_references;
use crate::pipeline::types::{ConditionAction, ExecutionContext, InputType, Pipeline};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::Validation {
        message: message.into(),
    }
}

/// Parse a pipeline from a YAML or JSON document.
pub fn parse_pipeline(text: &str) -> Result<Pipeline, PipelineError> {
    let parsed = if text.trim_start().starts_with('{') {
        serde_json::from_str::<Pipeline>(text).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str::<Pipeline>(text).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| PipelineError::Parse { message })
}

/// Read and parse a pipeline file.
pub fn parse_pipeline_file(path: &Path) -> Result<Pipeline, PipelineError> {
    let text = std::fs::read_to_string(path).map_err(|e| PipelineError::Parse {
        message: format!("{}: {e}", path.display()),
    })?;
    parse_pipeline(&text)
}

/// Load every `*.yaml`, `*.yml` and `*.json` pipeline in `dir`.
///
/// Files that fail to parse or validate are logged and skipped.
pub fn load_pipelines_dir(dir: &Path) -> Vec<(PathBuf, Pipeline)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!(dir = %dir.display(), "Pipeline directory not readable");
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml" | "json")
            )
        })
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| {
            match parse_pipeline_file(&path).and_then(|p| validate_pipeline(&p).map(|_| p)) {
                Ok(pipeline) => Some((path, pipeline)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid pipeline");
                    None
                }
            }
        })
        .collect()
}

/// Validate a pipeline for structural correctness.
///
/// Checks:
/// - At least one step, with unique names
/// - Unique input names; `select` inputs declare options containing their default
/// - Output names are unique and never shadow an input
/// - `input` and condition `check` are `$name` references to an input or an
///   earlier step's output
/// - Prompt placeholders name an input or an earlier step's output
/// - Comparison operators carry a value; `skip` targets a strictly later step
pub fn validate_pipeline(pipeline: &Pipeline) -> Result<(), PipelineError> {
    if pipeline.id.trim().is_empty() {
        return Err(invalid("Pipeline id must not be empty"));
    }
    if pipeline.steps.is_empty() {
        return Err(invalid(format!(
            "Pipeline '{}' must have at least one step",
            pipeline.id
        )));
    }

    let mut input_names = HashSet::new();
    for input in &pipeline.inputs {
        if !input_names.insert(input.name.as_str()) {
            return Err(invalid(format!("Duplicate input name: '{}'", input.name)));
        }
        if input.input_type == InputType::Select {
            if input.options.is_empty() {
                return Err(invalid(format!(
                    "Select input '{}' declares no options",
                    input.name
                )));
            }
            if let Some(default) = &input.default_value
                && !input.options.contains(default)
            {
                return Err(invalid(format!(
                    "Default '{}' of input '{}' is not one of its options",
                    default, input.name
                )));
            }
        }
    }

    let mut step_names = HashSet::new();
    for step in &pipeline.steps {
        if !step_names.insert(step.name.as_str()) {
            return Err(invalid(format!("Duplicate step name: '{}'", step.name)));
        }
    }

    // Variables bound before the step at each index runs.
    let mut known: HashSet<&str> = input_names.clone();
    let mut outputs = HashSet::new();

    if let Some(system) = &pipeline.system_prompt {
        check_references(system, &input_names, "system prompt")?;
    }

    for (idx, step) in pipeline.steps.iter().enumerate() {
        let Some(input) = step.input_variable() else {
            return Err(invalid(format!(
                "Step '{}' input '{}' must be a $name reference",
                step.name, step.input
            )));
        };
        if !known.contains(input) {
            return Err(invalid(format!(
                "Step '{}' reads '${}', which is neither an input nor an earlier output",
                step.name, input
            )));
        }

        check_references(&step.prompt, &known, &format!("step '{}'", step.name))?;

        if let Some(condition) = &step.condition {
            let Some(checked) = condition.check_variable() else {
                return Err(invalid(format!(
                    "Step '{}' condition check '{}' must be a $name reference",
                    step.name, condition.check
                )));
            };
            if !known.contains(checked) {
                return Err(invalid(format!(
                    "Step '{}' condition checks unknown variable '${}'",
                    step.name, checked
                )));
            }
            if condition.operator.requires_value() && condition.value.is_none() {
                return Err(invalid(format!(
                    "Step '{}' condition operator requires a value",
                    step.name
                )));
            }
            if condition.action == ConditionAction::Skip {
                let Some(target) = &condition.skip_to else {
                    return Err(invalid(format!(
                        "Step '{}' skip action requires skipTo",
                        step.name
                    )));
                };
                match pipeline.step_index(target) {
                    Some(target_idx) if target_idx > idx => {}
                    Some(_) => {
                        return Err(invalid(format!(
                            "Step '{}' may only skip forward, but '{}' is not a later step",
                            step.name, target
                        )));
                    }
                    None => {
                        return Err(invalid(format!(
                            "Step '{}' skips to unknown step '{}'",
                            step.name, target
                        )));
                    }
                }
            }
        }

        let output = step.output.trim();
        if output.is_empty() || output.starts_with('$') {
            return Err(invalid(format!(
                "Step '{}' output must be a plain variable name",
                step.name
            )));
        }
        if input_names.contains(output) {
            return Err(invalid(format!(
                "Step '{}' output '{}' shadows an input",
                step.name, output
            )));
        }
        if !outputs.insert(output) {
            return Err(invalid(format!("Duplicate output name: '{output}'")));
        }
        known.insert(output);
    }

    Ok(())
}

fn check_references(
    template: &str,
    known: &HashSet<&str>,
    context: &str,
) -> Result<(), PipelineError> {
    let refs = extract_references(template)
        .map_err(|e| invalid(format!("Invalid template in {context}: {e}")))?;
    for name in refs {
        if !known.contains(name.as_str()) {
            return Err(invalid(format!(
                "Template in {context} references unknown variable '{name}'"
            )));
        }
    }
    Ok(())
}

/// Turn caller-supplied values into the initial execution context.
///
/// Absent inputs fall back to their default. A required input that is still
/// absent or blank fails validation. Toggles normalize to `"true"`/`"false"`
/// and selects must name one of their options.
pub fn resolve_inputs(
    pipeline: &Pipeline,
    provided: &HashMap<String, String>,
) -> Result<ExecutionContext, PipelineError> {
    let mut context = ExecutionContext::new();

    for slot in &pipeline.inputs {
        let value = provided
            .get(&slot.name)
            .cloned()
            .or_else(|| slot.default_value.clone());
        let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
            if slot.required {
                return Err(invalid(format!(
                    "Missing required input '{}' for pipeline '{}'",
                    slot.name, pipeline.id
                )));
            }
            continue;
        };

        let value = match slot.input_type {
            InputType::Toggle => normalize_toggle(&value).ok_or_else(|| {
                invalid(format!(
                    "Input '{}' expects true or false, got '{}'",
                    slot.name, value
                ))
            })?,
            InputType::Select if !slot.options.contains(&value) => {
                return Err(invalid(format!(
                    "Input '{}' must be one of [{}], got '{}'",
                    slot.name,
                    slot.options.join(", "),
                    value
                )));
            }
            _ => value,
        };
        context.insert(slot.name.clone(), value);
    }

    for name in provided.keys() {
        if pipeline.input(name).is_none() {
            debug!(input = %name, pipeline = %pipeline.id, "Ignoring undeclared input");
        }
    }

    Ok(context)
}

fn normalize_toggle(value: &str) -> Option<String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some("true".to_string()),
        "false" | "no" | "off" | "0" => Some("false".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{ConditionOperator, StepModel};
    use pretty_assertions::assert_eq;

    fn two_step_yaml() -> &'static str {
        r#"
id: review
name: Review
inputs:
  - name: content
    type: textarea
    label: Content
    required: true
  - name: tone
    type: select
    options: [formal, casual]
    defaultValue: formal
steps:
  - name: check
    model: language
    input: $content
    prompt: "Answer LONG or SHORT."
    output: flag
  - name: act
    model: language
    input: $content
    prompt: "Rewrite in a {{tone}} tone."
    output: result
    condition:
      check: $flag
      operator: equals
      value: LONG
      action: continue
"#
    }

    #[test]
    fn test_parse_yaml() {
        let pipeline = parse_pipeline(two_step_yaml()).unwrap();
        assert_eq!(pipeline.id, "review");
        assert_eq!(pipeline.steps.len(), 2);
        assert_eq!(pipeline.steps[0].model, StepModel::Language);
        let condition = pipeline.steps[1].condition.as_ref().unwrap();
        assert_eq!(condition.operator, ConditionOperator::Equals);
        validate_pipeline(&pipeline).unwrap();
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "id": "one", "name": "One",
            "inputs": [{"name": "text", "type": "text", "required": true}],
            "steps": [{"name": "s", "model": "language", "input": "$text", "prompt": "", "output": "out"}],
            "systemPrompt": "Be brief.",
            "outputFormat": "markdown"
        }"#;
        let pipeline = parse_pipeline(json).unwrap();
        assert_eq!(pipeline.system_prompt.as_deref(), Some("Be brief."));
        validate_pipeline(&pipeline).unwrap();
    }

    #[test]
    fn test_parse_error() {
        let err = parse_pipeline("id: [unterminated").unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
    }

    fn assert_invalid(yaml: &str, needle: &str) {
        let pipeline = parse_pipeline(yaml).unwrap();
        match validate_pipeline(&pipeline) {
            Err(PipelineError::Validation { message }) => {
                assert!(message.contains(needle), "{message:?} lacks {needle:?}")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_no_steps() {
        assert_invalid("id: x\nname: x\nsteps: []\n", "at least one step");
    }

    #[test]
    fn test_rejects_duplicate_steps() {
        assert_invalid(
            r#"
id: x
name: x
inputs: [{name: a, required: true}]
steps:
  - {name: s, model: language, input: $a, output: o1}
  - {name: s, model: language, input: $a, output: o2}
"#,
            "Duplicate step name",
        );
    }

    #[test]
    fn test_rejects_bad_input_reference() {
        assert_invalid(
            r#"
id: x
name: x
inputs: [{name: a}]
steps:
  - {name: s, model: language, input: a, output: o}
"#,
            "must be a $name reference",
        );
        assert_invalid(
            r#"
id: x
name: x
inputs: [{name: a}]
steps:
  - {name: s, model: language, input: $later, output: o}
  - {name: t, model: language, input: $a, output: later}
"#,
            "neither an input nor an earlier output",
        );
    }

    #[test]
    fn test_rejects_output_shadowing_input() {
        assert_invalid(
            r#"
id: x
name: x
inputs: [{name: a}]
steps:
  - {name: s, model: language, input: $a, output: a}
"#,
            "shadows an input",
        );
    }

    #[test]
    fn test_rejects_unknown_prompt_placeholder() {
        assert_invalid(
            r#"
id: x
name: x
inputs: [{name: a}]
steps:
  - {name: s, model: language, input: $a, prompt: "Use {{nothing}}", output: o}
"#,
            "unknown variable 'nothing'",
        );
    }

    #[test]
    fn test_rejects_missing_comparison_value() {
        assert_invalid(
            r#"
id: x
name: x
inputs: [{name: a}]
steps:
  - name: s
    model: language
    input: $a
    output: o
    condition: {check: $a, operator: contains, action: stop}
"#,
            "requires a value",
        );
    }

    #[test]
    fn test_rejects_dangling_and_backward_skip() {
        let template = |target: &str| {
            format!(
                r#"
id: x
name: x
inputs: [{{name: a}}]
steps:
  - {{name: first, model: language, input: $a, output: o1}}
  - name: second
    model: language
    input: $a
    output: o2
    condition: {{check: $a, operator: not_empty, action: skip, skipTo: {target}}}
  - {{name: third, model: language, input: $a, output: o3}}
"#
            )
        };
        assert_invalid(&template("missing"), "unknown step 'missing'");
        assert_invalid(&template("first"), "skip forward");
        assert_invalid(&template("second"), "skip forward");
        validate_pipeline(&parse_pipeline(&template("third")).unwrap()).unwrap();
    }

    #[test]
    fn test_rejects_select_without_options() {
        assert_invalid(
            r#"
id: x
name: x
inputs: [{name: a, type: select}]
steps:
  - {name: s, model: language, input: $a, output: o}
"#,
            "declares no options",
        );
    }

    #[test]
    fn test_resolve_inputs_defaults_and_required() {
        let pipeline = parse_pipeline(two_step_yaml()).unwrap();
        let mut provided = HashMap::new();
        let err = resolve_inputs(&pipeline, &provided).unwrap_err();
        assert!(err.to_string().contains("Missing required input 'content'"));

        provided.insert("content".to_string(), "hello".to_string());
        let context = resolve_inputs(&pipeline, &provided).unwrap();
        assert_eq!(context.get("content"), Some("hello"));
        assert_eq!(context.get("tone"), Some("formal"));
    }

    #[test]
    fn test_resolve_inputs_select_and_toggle() {
        let pipeline = parse_pipeline(
            r#"
id: x
name: x
inputs:
  - {name: lang, type: select, options: [en, fr]}
  - {name: loud, type: toggle}
steps:
  - {name: s, model: language, input: $lang, output: o}
"#,
        )
        .unwrap();

        let provided: HashMap<String, String> =
            [("lang".to_string(), "de".to_string())].into_iter().collect();
        assert!(resolve_inputs(&pipeline, &provided).is_err());

        let provided: HashMap<String, String> = [
            ("lang".to_string(), "fr".to_string()),
            ("loud".to_string(), "Yes".to_string()),
        ]
        .into_iter()
        .collect();
        let context = resolve_inputs(&pipeline, &provided).unwrap();
        assert_eq!(context.get("loud"), Some("true"));

        let provided: HashMap<String, String> =
            [("loud".to_string(), "maybe".to_string())].into_iter().collect();
        assert!(resolve_inputs(&pipeline, &provided).is_err());
    }

    #[test]
    fn test_load_pipelines_dir_skips_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.yaml"), two_step_yaml()).unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "id: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let loaded = load_pipelines_dir(dir.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1.id, "review");
    }
}
