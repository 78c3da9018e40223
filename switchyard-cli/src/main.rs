//! Switchyard CLI: terminal front end for the Switchyard workbench.
//!
//! Every subcommand maps onto the unified request surface of the core
//! provider manager or the pipeline executor.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use switchyard_core::types::{BackendKind, Capability};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Switchyard: run models and pipelines across local and cloud backends
#[derive(Parser, Debug)]
#[command(name = "switchyard", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (replaces the layered lookup)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Probe every backend and show availability
    Status,
    /// Manage models
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },
    /// Send a single chat message
    Chat {
        /// Message text
        text: String,
        #[command(flatten)]
        target: TargetArgs,
        /// Optional system message
        #[arg(short, long)]
        system: Option<String>,
    },
    /// Complete a prompt
    Generate {
        /// Prompt text
        text: String,
        #[command(flatten)]
        target: TargetArgs,
        /// Image inputs (path, data URL or base64)
        #[arg(long)]
        image: Vec<String>,
        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<u32>,
        /// Sampling temperature
        #[arg(long)]
        temperature: Option<f32>,
    },
    /// Embed text
    Embed {
        /// Text to embed
        text: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Manage and run pipelines
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Explicit model or backend preference for a single request.
#[derive(clap::Args, Debug, Clone, Default)]
struct TargetArgs {
    /// Model id (`backend/name`) or bare model name
    #[arg(short, long)]
    model: Option<String>,
    /// Preferred backend: daemon, embedded or cloud
    #[arg(short, long)]
    backend: Option<BackendKind>,
}

#[derive(clap::Subcommand, Debug)]
enum ModelsAction {
    /// List known models
    List {
        /// Only models with this capability (e.g. chat, embed, vision-caption)
        #[arg(long)]
        capability: Option<Capability>,
        /// Only models owned by this backend
        #[arg(long)]
        backend: Option<BackendKind>,
        /// Only installed models
        #[arg(long)]
        installed: bool,
    },
    /// Download a model, showing progress
    Pull {
        /// Model id (`backend/name`), catalog name, or bare name for the cheapest available backend
        id: String,
    },
    /// Show models resident in memory
    Loaded,
    /// Load a model into memory
    Load {
        /// Model id or name
        id: String,
    },
    /// Unload a model from memory
    Unload {
        /// Model id or name
        id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum PipelineAction {
    /// List built-in and workspace pipelines
    List,
    /// Show a pipeline's inputs and steps
    Show {
        /// Pipeline id or file path
        name: String,
    },
    /// Run a pipeline
    Run {
        /// Pipeline id or file path
        name: String,
        /// Input values as key=value pairs
        #[arg(short, long)]
        input: Vec<String>,
        /// Print the full run state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a persisted run
    Status {
        /// Run ID
        run_id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration to the workspace
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = switchyard_core::config::project_dirs()
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "switchyard.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
