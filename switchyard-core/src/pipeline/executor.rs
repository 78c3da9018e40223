//! Pipeline executor: runs steps strictly in order, evaluating conditions,
//! interpolating prompts and dispatching each step through a
//! [`StepDispatcher`]. Runs are tracked by id and may be persisted as JSON.

use crate::error::{PipelineError, RouterError, TemplateError};
use crate::pipeline::parser::{resolve_inputs, validate_pipeline};
use crate::pipeline::template::{TemplateContext, evaluate_condition, interpolate, substitutes};
use crate::pipeline::types::{
    ConditionAction, ExecutionState, ExecutionStatus, Pipeline, Step, StepModel,
};
use crate::router::ProviderManager;
use crate::types::{
    AudioRequest, AudioTask, ChatMessage, ChatRequest, MediaInput, VisionRequest, VisionTask,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Executes one step's model call. Implemented by [`ProviderManager`]; tests
/// substitute their own.
#[async_trait]
pub trait StepDispatcher: Send + Sync {
    /// Run a language model over `prompt` with an optional system message.
    async fn language(&self, system: Option<&str>, prompt: &str) -> Result<String, RouterError>;

    /// Caption an image (path, data URL or base64).
    async fn vision(&self, image: &str, prompt: Option<&str>) -> Result<String, RouterError>;

    /// Transcribe an audio file (path, data URL or base64).
    async fn audio(&self, audio: &str) -> Result<String, RouterError>;
}

#[async_trait]
impl StepDispatcher for ProviderManager {
    async fn language(&self, system: Option<&str>, prompt: &str) -> Result<String, RouterError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        let request = ChatRequest {
            messages,
            ..Default::default()
        };
        let routed = self.chat(&request).await?;
        Ok(routed.output.message.content)
    }

    async fn vision(&self, image: &str, prompt: Option<&str>) -> Result<String, RouterError> {
        let request = VisionRequest {
            image: MediaInput::new(image),
            task: VisionTask::Caption,
            prompt: prompt.map(str::to_string),
            target: Default::default(),
        };
        let routed = ProviderManager::vision(self, &request).await?;
        Ok(routed.output.results.join("\n"))
    }

    async fn audio(&self, audio: &str) -> Result<String, RouterError> {
        let request = AudioRequest {
            audio: MediaInput::new(audio),
            task: AudioTask::Transcribe,
            language: None,
            target: Default::default(),
        };
        let routed = ProviderManager::audio(self, &request).await?;
        Ok(routed.output.result)
    }
}

/// Handle to a run started with [`PipelineExecutor::spawn`].
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    join: JoinHandle<Result<ExecutionState, PipelineError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request cancellation. Takes effect before the next step starts.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<ExecutionState, PipelineError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::StepFailed {
                step: format!("run {}", self.run_id),
                message: e.to_string(),
            }),
        }
    }
}

/// The pipeline executor manages runs and their lifecycle.
#[derive(Clone)]
pub struct PipelineExecutor {
    dispatcher: Arc<dyn StepDispatcher>,
    runs: Arc<Mutex<HashMap<Uuid, ExecutionState>>>,
    cancellations: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    state_path: Option<PathBuf>,
}

impl PipelineExecutor {
    pub fn new(dispatcher: Arc<dyn StepDispatcher>, state_path: Option<PathBuf>) -> Self {
        Self {
            dispatcher,
            runs: Arc::new(Mutex::new(HashMap::new())),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            state_path,
        }
    }

    /// Run a pipeline to completion.
    ///
    /// Run failures (missing inputs, undefined variables, dispatch errors,
    /// cancellation) end in a returned state with status `error`; `Err` is
    /// reserved for failures to persist that state.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        inputs: HashMap<String, String>,
    ) -> Result<ExecutionState, PipelineError> {
        let run_id = Uuid::new_v4();
        let token = self.register(run_id, &pipeline.id).await;
        self.drive(run_id, pipeline, inputs, token).await
    }

    /// Start a run in the background.
    pub async fn spawn(&self, pipeline: Pipeline, inputs: HashMap<String, String>) -> RunHandle {
        let run_id = Uuid::new_v4();
        let token = self.register(run_id, &pipeline.id).await;
        let this = self.clone();
        let run_token = token.clone();
        let join =
            tokio::spawn(async move { this.drive(run_id, &pipeline, inputs, run_token).await });
        RunHandle {
            run_id,
            cancel: token,
            join,
        }
    }

    /// Cancel a run between steps. Returns false if it already finished.
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool, PipelineError> {
        if let Some(token) = self.cancellations.lock().await.get(&run_id) {
            info!(run_id = %run_id, "Cancelling pipeline run");
            token.cancel();
            return Ok(true);
        }
        if self.runs.lock().await.contains_key(&run_id) {
            Ok(false)
        } else {
            Err(PipelineError::RunNotFound { run_id })
        }
    }

    /// Get the current state of a run.
    pub async fn get_status(&self, run_id: Uuid) -> Result<ExecutionState, PipelineError> {
        let runs = self.runs.lock().await;
        runs.get(&run_id)
            .cloned()
            .ok_or(PipelineError::RunNotFound { run_id })
    }

    /// List all runs, oldest first.
    pub async fn list_runs(&self) -> Vec<ExecutionState> {
        let runs = self.runs.lock().await;
        let mut out: Vec<ExecutionState> = runs.values().cloned().collect();
        out.sort_by_key(|s| s.started_at);
        out
    }

    async fn register(&self, run_id: Uuid, pipeline_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.runs
            .lock()
            .await
            .insert(run_id, ExecutionState::new(run_id, pipeline_id));
        self.cancellations.lock().await.insert(run_id, token.clone());
        token
    }

    async fn store(&self, state: &ExecutionState) {
        self.runs.lock().await.insert(state.run_id, state.clone());
    }

    async fn drive(
        &self,
        run_id: Uuid,
        pipeline: &Pipeline,
        inputs: HashMap<String, String>,
        token: CancellationToken,
    ) -> Result<ExecutionState, PipelineError> {
        let mut state = ExecutionState::new(run_id, pipeline.id.clone());
        state.status = ExecutionStatus::Running;
        state.started_at = Some(Utc::now());
        self.store(&state).await;
        info!(pipeline = %pipeline.id, run_id = %run_id, "Pipeline run started");

        match self.run_steps(pipeline, &inputs, &token, &mut state).await {
            Ok(()) => {
                state.finish(ExecutionStatus::Completed, None);
                info!(
                    pipeline = %pipeline.id,
                    run_id = %run_id,
                    steps = state.executed_steps.len(),
                    "Pipeline run completed"
                );
            }
            Err(e) => {
                warn!(pipeline = %pipeline.id, run_id = %run_id, error = %e, "Pipeline run failed");
                state.finish(ExecutionStatus::Error, Some(e.to_string()));
            }
        }

        self.cancellations.lock().await.remove(&run_id);
        self.store(&state).await;

        if let Some(ref path) = self.state_path {
            persist_state(&state, path).await?;
        }
        Ok(state)
    }

    async fn run_steps(
        &self,
        pipeline: &Pipeline,
        inputs: &HashMap<String, String>,
        token: &CancellationToken,
        state: &mut ExecutionState,
    ) -> Result<(), PipelineError> {
        validate_pipeline(pipeline)?;
        state.context = resolve_inputs(pipeline, inputs)?;
        self.store(state).await;

        let optional: Vec<&str> = pipeline.optional_inputs().collect();
        let mut idx = 0;

        while idx < pipeline.steps.len() {
            let step = &pipeline.steps[idx];
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    step: step.name.clone(),
                });
            }
            state.current_step_index = idx;
            self.store(state).await;

            let variable = step
                .input_variable()
                .ok_or_else(|| PipelineError::Validation {
                    message: format!("Step '{}' input is not a $name reference", step.name),
                })?;
            let input = state
                .context
                .get(variable)
                .ok_or_else(|| PipelineError::UndefinedVariable {
                    step: step.name.clone(),
                    variable: variable.to_string(),
                })?
                .to_string();

            let (instruction, system) = {
                let ctx =
                    TemplateContext::new(&state.context).with_optional(optional.iter().copied());
                let render = |template: &str| {
                    interpolate(template, &ctx).map_err(|e| template_error(step, e))
                };
                let instruction = render(&step.prompt)?;
                let system = pipeline.system_prompt.as_deref().map(render).transpose()?;
                (instruction, system)
            };

            if let Some(condition) = &step.condition {
                let checked = condition
                    .check_variable()
                    .and_then(|name| state.context.get(name))
                    .unwrap_or_default();
                if !evaluate_condition(condition, checked) {
                    debug!(step = %step.name, "Condition not met; step skipped");
                    idx += 1;
                    continue;
                }
                match condition.action {
                    ConditionAction::Continue => {}
                    ConditionAction::Stop => {
                        info!(step = %step.name, "Condition requested stop");
                        return Ok(());
                    }
                    ConditionAction::Skip => {
                        let target = condition
                            .skip_to
                            .as_deref()
                            .and_then(|name| pipeline.step_index(name))
                            .filter(|&target| target > idx)
                            .ok_or_else(|| PipelineError::Validation {
                                message: format!("Step '{}' has no later skip target", step.name),
                            })?;
                        debug!(
                            step = %step.name,
                            skip_to = %pipeline.steps[target].name,
                            "Skipping ahead"
                        );
                        idx = target;
                        continue;
                    }
                }
            }

            let output = self
                .dispatch(step, variable, &input, &instruction, system.as_deref())
                .await
                .map_err(|e| PipelineError::StepFailed {
                    step: step.name.clone(),
                    message: e.to_string(),
                })?;

            debug!(step = %step.name, output_len = output.len(), "Step completed");
            state.context.insert(step.output.trim(), output.clone());
            state.step_results.insert(step.name.clone(), output.clone());
            state.executed_steps.push(step.name.clone());
            state.final_output = Some(output);
            idx += 1;
        }

        state.current_step_index = pipeline.steps.len();
        Ok(())
    }

    async fn dispatch(
        &self,
        step: &Step,
        variable: &str,
        input: &str,
        instruction: &str,
        system: Option<&str>,
    ) -> Result<String, RouterError> {
        match step.model {
            StepModel::Language => {
                let prompt = if instruction.trim().is_empty() {
                    input.to_string()
                } else if substitutes(&step.prompt, variable) {
                    instruction.to_string()
                } else {
                    format!("{instruction}\n\n{input}")
                };
                self.dispatcher.language(system, &prompt).await
            }
            StepModel::Vision => {
                let prompt = Some(instruction).filter(|p| !p.trim().is_empty());
                self.dispatcher.vision(input, prompt).await
            }
            StepModel::Audio => self.dispatcher.audio(input).await,
        }
    }

    /// Load a persisted run state.
    pub async fn load_state(base_path: &Path, run_id: Uuid) -> Result<ExecutionState, PipelineError> {
        let file_path = base_path.join(format!("{run_id}.json"));
        let json = tokio::fs::read_to_string(file_path)
            .await
            .map_err(|_| PipelineError::RunNotFound { run_id })?;
        serde_json::from_str(&json).map_err(|e| PipelineError::Persistence {
            message: e.to_string(),
        })
    }
}

fn template_error(step: &Step, error: TemplateError) -> PipelineError {
    match error {
        TemplateError::Undefined { name } => PipelineError::UndefinedVariable {
            step: step.name.clone(),
            variable: name,
        },
        TemplateError::Syntax { message } => PipelineError::Template {
            step: step.name.clone(),
            message,
        },
    }
}

/// Write `<run_id>.json` under `base_path`.
async fn persist_state(state: &ExecutionState, base_path: &Path) -> Result<(), PipelineError> {
    let persistence = |e: &dyn std::fmt::Display| PipelineError::Persistence {
        message: e.to_string(),
    };
    let json = serde_json::to_string_pretty(state).map_err(|e| persistence(&e))?;
    tokio::fs::create_dir_all(base_path)
        .await
        .map_err(|e| persistence(&e))?;
    tokio::fs::write(base_path.join(format!("{}.json", state.run_id)), json)
        .await
        .map_err(|e| persistence(&e))?;
    Ok(())
}
