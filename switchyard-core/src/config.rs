//! Configuration system for Switchyard.
//!
//! Uses `figment` for layered configuration: defaults → user config file →
//! workspace config file → environment variables → explicit overrides.

use crate::error::ConfigError;
use crate::types::{Capability, ModelId};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const WORKSPACE_DIR: &str = ".switchyard";
const CONFIG_FILE: &str = "config.toml";

/// Platform directories for Switchyard (config, data, logs).
pub fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "switchyard", "switchyard")
}

/// Top-level configuration for the workbench.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkbenchConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub embedded: EmbeddedConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl WorkbenchConfig {
    /// Check cross-field constraints figment cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resources.memory_budget_bytes == 0 {
            return Err(ConfigError::Invalid {
                message: "resources.memory_budget_bytes must be greater than zero".into(),
            });
        }
        if self.daemon.enabled && !self.daemon.base_url.starts_with("http") {
            return Err(ConfigError::Invalid {
                message: format!("daemon.base_url '{}' is not an http URL", self.daemon.base_url),
            });
        }
        if self.cloud.enabled && !self.cloud.base_url.starts_with("http") {
            return Err(ConfigError::Invalid {
                message: format!("cloud.base_url '{}' is not an http URL", self.cloud.base_url),
            });
        }
        for (capability, model) in &self.router.default_models {
            capability
                .parse::<Capability>()
                .map_err(|message| ConfigError::Invalid { message })?;
            model.parse::<ModelId>().map_err(|e| ConfigError::Invalid {
                message: format!("router.default_models.{capability}: {e}"),
            })?;
        }
        Ok(())
    }
}

/// Local inference daemon (Ollama-compatible) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:11434".to_string(),
            timeout_secs: 120,
        }
    }
}

/// Embedded runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedConfig {
    pub enabled: bool,
    /// Where downloaded model files live. Defaults to `<data dir>/models`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<PathBuf>,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            models_dir: None,
        }
    }
}

impl EmbeddedConfig {
    pub fn resolved_models_dir(&self) -> PathBuf {
        self.models_dir.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.data_dir().join("models"))
                .unwrap_or_else(|| PathBuf::from(WORKSPACE_DIR).join("models"))
        })
    }
}

/// Cloud inference API (OpenAI-compatible) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 120,
        }
    }
}

/// Residency accounting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub memory_budget_bytes: u64,
    pub auto_evict: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 8 * 1024 * 1024 * 1024,
            auto_evict: true,
        }
    }
}

/// Routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub probe_ttl_secs: u64,
    /// Capability name → composite model id, e.g. `chat = "daemon/llama3.2:3b"`.
    #[serde(default)]
    pub default_models: BTreeMap<String, String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut default_models = BTreeMap::new();
        default_models.insert("chat".to_string(), "daemon/llama3.2:3b".to_string());
        default_models.insert("generate".to_string(), "daemon/llama3.2:3b".to_string());
        default_models.insert("embed".to_string(), "daemon/nomic-embed-text".to_string());
        Self {
            probe_ttl_secs: 5,
            default_models,
        }
    }
}

impl RouterConfig {
    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_ttl_secs)
    }

    /// Configured default model for a capability, if any parses.
    pub fn default_model(&self, capability: Capability) -> Option<ModelId> {
        self.default_models
            .get(capability.as_str())
            .and_then(|id| id.parse().ok())
    }
}

/// Pipeline engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory containing user pipeline definitions (`*.yaml`, `*.json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipelines_dir: Option<PathBuf>,
    /// Directory for persisting run state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_persistence_path: Option<PathBuf>,
}

/// Load configuration from all layers.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&WorkbenchConfig>,
) -> Result<WorkbenchConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(WorkbenchConfig::default()));

    // User-level config
    if let Some(dirs) = project_dirs() {
        let user_config = dirs.config_dir().join(CONFIG_FILE);
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_DIR).join(CONFIG_FILE);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (SWITCHYARD_CLOUD__BASE_URL, SWITCHYARD_RESOURCES__AUTO_EVICT, etc.)
    figment = figment.merge(Env::prefixed("SWITCHYARD_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: WorkbenchConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a single explicit file layered over defaults.
pub fn load_config_file(path: &Path) -> Result<WorkbenchConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let config: WorkbenchConfig = Figment::from(Serialized::defaults(WorkbenchConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("SWITCHYARD_").split("__"))
        .extract()
        .map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

/// Check whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(dirs) = project_dirs() {
        if dirs.config_dir().join(CONFIG_FILE).exists() {
            return true;
        }
    }
    workspace.is_some_and(|ws| ws.join(WORKSPACE_DIR).join(CONFIG_FILE).exists())
}

/// Write `config` to `<workspace>/.switchyard/config.toml`, returning the path.
pub fn write_workspace_config(
    workspace: &Path,
    config: &WorkbenchConfig,
) -> Result<PathBuf, ConfigError> {
    let dir = workspace.join(WORKSPACE_DIR);
    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::Invalid {
        message: format!("cannot create {}: {e}", dir.display()),
    })?;
    let path = dir.join(CONFIG_FILE);
    let body = toml::to_string_pretty(config).map_err(|e| ConfigError::Invalid {
        message: e.to_string(),
    })?;
    std::fs::write(&path, body).map_err(|e| ConfigError::Invalid {
        message: format!("cannot write {}: {e}", path.display()),
    })?;
    Ok(path)
}
