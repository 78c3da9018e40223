//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, ModelsAction, PipelineAction, TargetArgs};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use switchyard_core::config::{WorkbenchConfig, load_config, load_config_file, write_workspace_config};
use switchyard_core::pipeline::{
    ExecutionStatus, Pipeline, PipelineExecutor, all_builtins, get_builtin, load_pipelines_dir,
    parse_pipeline_file, validate_pipeline,
};
use switchyard_core::registry::ModelFilter;
use switchyard_core::types::{
    Availability, ChatMessage, ChatRequest, EmbedRequest, GenerateRequest, MediaInput, PullPhase,
    Target,
};
use switchyard_core::ProviderManager;
use uuid::Uuid;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => load_config_file(path),
        None => load_config(Some(workspace), None),
    }
    .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    match command {
        Commands::Config { action } => handle_config(action, workspace, &config),
        Commands::Pipeline {
            action: PipelineAction::List,
        } => list_pipelines(&config, workspace),
        Commands::Pipeline {
            action: PipelineAction::Show { name },
        } => show_pipeline(&name, &config, workspace),
        Commands::Pipeline {
            action: PipelineAction::Status { run_id },
        } => pipeline_status(&run_id, &config).await,
        command => {
            let manager = ProviderManager::from_config(&config, None)?;
            let result = handle_routed(command, &manager, &config, workspace).await;
            manager.shutdown().await;
            result
        }
    }
}

async fn handle_routed(
    command: Commands,
    manager: &ProviderManager,
    config: &WorkbenchConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::Status => show_status(manager).await,
        Commands::Models { action } => handle_models(action, manager).await,
        Commands::Chat {
            text,
            target,
            system,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(text));
            let routed = manager
                .chat(&ChatRequest {
                    messages,
                    target: target.into(),
                    ..Default::default()
                })
                .await?;
            tracing::debug!(backend = %routed.backend, model = %routed.model, "Chat answered");
            println!("{}", routed.output.message.content);
            Ok(())
        }
        Commands::Generate {
            text,
            target,
            image,
            max_tokens,
            temperature,
        } => {
            let routed = manager
                .generate(&GenerateRequest {
                    prompt: text,
                    target: target.into(),
                    images: image.into_iter().map(MediaInput::new).collect(),
                    max_tokens,
                    temperature,
                })
                .await?;
            tracing::debug!(backend = %routed.backend, model = %routed.model, "Generation finished");
            println!("{}", routed.output.response);
            Ok(())
        }
        Commands::Embed { text, target } => {
            let routed = manager
                .embed(&EmbedRequest {
                    text,
                    target: target.into(),
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&routed)?);
            Ok(())
        }
        Commands::Pipeline {
            action: PipelineAction::Run { name, input, json },
        } => run_pipeline(&name, &input, json, manager, config, workspace).await,
        other => anyhow::bail!("{:?} does not dispatch to a backend", other),
    }
}

impl From<TargetArgs> for Target {
    fn from(args: TargetArgs) -> Self {
        Target {
            model: args.model,
            preferred_backend: args.backend,
        }
    }
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config: &WorkbenchConfig,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let existing = workspace.join(".switchyard").join("config.toml");
            if existing.exists() {
                println!("Configuration already exists at: {}", existing.display());
                return Ok(());
            }
            let path = write_workspace_config(workspace, &WorkbenchConfig::default())?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
    }
}

async fn show_status(manager: &ProviderManager) -> anyhow::Result<()> {
    let status = manager.refresh_status().await;
    println!("Backends:");
    for backend in &status.backends {
        let installed = backend.models.iter().filter(|m| m.installed).count();
        match backend.availability {
            Availability::Unavailable => println!(
                "  {:<9} unavailable ({})",
                backend.backend.to_string(),
                backend.error.as_deref().unwrap_or("no details")
            ),
            availability => println!(
                "  {:<9} {} ({} installed models)",
                backend.backend.to_string(),
                availability,
                installed
            ),
        }
    }
    match status.recommended {
        Some(backend) => println!("Recommended: {backend}"),
        None if !status.has_available => println!("No backend is available."),
        None => {}
    }
    Ok(())
}

async fn handle_models(action: ModelsAction, manager: &ProviderManager) -> anyhow::Result<()> {
    match action {
        ModelsAction::List {
            capability,
            backend,
            installed,
        } => {
            manager.refresh_status().await;
            let filter = ModelFilter {
                capability,
                backend,
                installed_only: installed,
            };
            let models = manager.registry().list(&filter);
            if models.is_empty() {
                println!("No models match.");
                return Ok(());
            }
            for model in &models {
                let caps: Vec<&str> = model.capabilities.iter().map(|c| c.as_str()).collect();
                let size = model
                    .size_bytes
                    .map(|b| format!("{:.1} GB", b as f64 / 1e9))
                    .unwrap_or_else(|| "-".to_string());
                let mark = if model.installed { "*" } else { " " };
                println!(
                    "{mark} {:<40} {:>9}  {}",
                    model.id.to_string(),
                    size,
                    caps.join(", ")
                );
            }
            println!("\n* installed");
            Ok(())
        }
        ModelsAction::Pull { id } => {
            let mut events = manager.subscribe_pull_progress();
            let handle = manager.pull(&id)?;
            let model_id = handle.model_id().clone();
            println!("Pulling {model_id}...");

            let done = handle.wait();
            tokio::pin!(done);
            let last = loop {
                tokio::select! {
                    progress = &mut done => break progress,
                    Some(event) = events.recv() => {
                        if event.model_id == model_id {
                            eprint!("\r  {:<10} {:>5.1}%", format!("{:?}", event.phase).to_lowercase(), event.progress * 100.0);
                        }
                    }
                }
            };
            eprintln!();

            match last.phase {
                PullPhase::Complete => {
                    println!("Pulled {model_id}");
                    Ok(())
                }
                _ => anyhow::bail!(
                    "Pull of {} failed: {}",
                    model_id,
                    last.error.as_deref().unwrap_or("unknown error")
                ),
            }
        }
        ModelsAction::Loaded => {
            let loaded = manager.loaded_models();
            if loaded.is_empty() {
                println!("No models resident in memory.");
            }
            for record in &loaded {
                println!(
                    "  {:<40} {:>10} bytes  last used {}",
                    record.model_id.to_string(),
                    record.footprint_bytes,
                    record.last_used_at.format("%H:%M:%S")
                );
            }
            Ok(())
        }
        ModelsAction::Load { id } => {
            manager.refresh_status().await;
            manager.load_model(&id).await?;
            println!("Loaded {id}");
            Ok(())
        }
        ModelsAction::Unload { id } => {
            manager.refresh_status().await;
            manager.unload_model(&id).await?;
            println!("Unloaded {id}");
            Ok(())
        }
    }
}

/// Built-ins first, then the workspace pipelines directory.
fn known_pipelines(config: &WorkbenchConfig, workspace: &Path) -> Vec<(String, Pipeline)> {
    let mut pipelines: Vec<(String, Pipeline)> = all_builtins()
        .into_iter()
        .map(|p| ("built-in".to_string(), p))
        .collect();
    let dir = pipelines_dir(config, workspace);
    for (path, pipeline) in load_pipelines_dir(&dir) {
        pipelines.push((path.display().to_string(), pipeline));
    }
    pipelines
}

fn pipelines_dir(config: &WorkbenchConfig, workspace: &Path) -> PathBuf {
    match &config.pipeline.pipelines_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => workspace.join(dir),
        None => workspace.join(".switchyard").join("pipelines"),
    }
}

fn find_pipeline(name: &str, config: &WorkbenchConfig, workspace: &Path) -> anyhow::Result<Pipeline> {
    let path = Path::new(name);
    if path.is_file() {
        let pipeline = parse_pipeline_file(path)?;
        validate_pipeline(&pipeline)?;
        return Ok(pipeline);
    }
    if let Some(pipeline) = get_builtin(name) {
        return Ok(pipeline);
    }
    known_pipelines(config, workspace)
        .into_iter()
        .map(|(_, p)| p)
        .find(|p| p.id == name)
        .ok_or_else(|| anyhow::anyhow!("Pipeline '{}' not found", name))
}

fn list_pipelines(config: &WorkbenchConfig, workspace: &Path) -> anyhow::Result<()> {
    println!("Available pipelines:");
    for (source, pipeline) in known_pipelines(config, workspace) {
        let description = pipeline.description.as_deref().unwrap_or(&pipeline.name);
        println!("  {:<28} {} [{}]", pipeline.id, description, source);
    }
    Ok(())
}

fn show_pipeline(name: &str, config: &WorkbenchConfig, workspace: &Path) -> anyhow::Result<()> {
    let pipeline = find_pipeline(name, config, workspace)?;
    println!("Pipeline: {} ({})", pipeline.name, pipeline.id);
    if let Some(description) = &pipeline.description {
        println!("Description: {description}");
    }
    if !pipeline.inputs.is_empty() {
        println!("\nInputs:");
        for input in &pipeline.inputs {
            let required = if input.required {
                "(required)"
            } else {
                "(optional)"
            };
            let default = input
                .default_value
                .as_deref()
                .map(|d| format!(" default={d}"))
                .unwrap_or_default();
            println!(
                "  {} [{:?}] {}{} {}",
                input.name, input.input_type, required, default, input.label
            );
        }
    }
    println!("\nSteps:");
    for (i, step) in pipeline.steps.iter().enumerate() {
        let condition = if step.condition.is_some() {
            " [conditional]"
        } else {
            ""
        };
        println!(
            "  {}. {} ({}: {} -> {}){}",
            i + 1,
            step.name,
            step.model,
            step.input,
            step.output,
            condition
        );
    }
    Ok(())
}

fn parse_inputs(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut inputs = HashMap::new();
    for kv in pairs {
        let Some((key, value)) = kv.split_once('=') else {
            anyhow::bail!("Invalid input format '{}', expected key=value", kv);
        };
        inputs.insert(key.trim().to_string(), value.to_string());
    }
    Ok(inputs)
}

async fn run_pipeline(
    name: &str,
    input: &[String],
    json: bool,
    manager: &ProviderManager,
    config: &WorkbenchConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    let pipeline = find_pipeline(name, config, workspace)?;
    let inputs = parse_inputs(input)?;

    let executor = PipelineExecutor::new(
        Arc::new(manager.clone()),
        config.pipeline.state_persistence_path.clone(),
    );
    tracing::info!(pipeline = %pipeline.id, "Running pipeline");
    let state = executor.execute(&pipeline, inputs).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else if let Some(output) = &state.final_output {
        println!("{output}");
    }

    match state.status {
        ExecutionStatus::Completed => Ok(()),
        _ => anyhow::bail!(
            "Pipeline '{}' failed: {}",
            pipeline.id,
            state.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

async fn pipeline_status(run_id: &str, config: &WorkbenchConfig) -> anyhow::Result<()> {
    let run_id: Uuid = run_id
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid run id '{}': {}", run_id, e))?;
    let Some(dir) = &config.pipeline.state_persistence_path else {
        anyhow::bail!("Run state persistence is disabled (pipeline.state_persistence_path)");
    };
    let state = PipelineExecutor::load_state(dir, run_id).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
