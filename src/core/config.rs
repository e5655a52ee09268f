use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::error::ConfigError;
use crate::core::workflow::TenantInfo;

/// Workflow service base URL used when nothing else is configured
const DEFAULT_API_BASE: &str = "http://localhost:8081";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Base URL of the workflow service
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Tenant identifiers sent with every request
    #[serde(default)]
    pub tenant: Option<TenantInfo>,

    #[serde(default)]
    pub chat: ChatSettings,

    #[serde(default)]
    pub debug: bool,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            data_dir: default_data_dir(),
            api_base: default_api_base(),
            tenant: None,
            chat: ChatSettings::default(),
            debug: false,
        }
    }
}

fn default_working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_data_dir() -> String {
    ".workflow-chat".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    /// Stream replies instead of waiting for the full response
    #[serde(default = "default_use_streaming")]
    pub use_streaming: bool,

    /// Seconds; forwarded to the service as the request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Workflow that chat messages are sent to
    #[serde(default = "default_workflow")]
    pub workflow: String,
}

fn default_use_streaming() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    180
}

fn default_workflow() -> String {
    "agent".into()
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            use_streaming: default_use_streaming(),
            timeout_secs: default_timeout_secs(),
            workflow: default_workflow(),
        }
    }
}

pub fn load_config(working_dir: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let wd = working_dir.unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    let mut config = AppConfig {
        working_dir: wd.clone(),
        ..AppConfig::default()
    };

    // Try loading global config
    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("workflow-chat").join("config.json");
        if global_path.exists() {
            let file_config = read_config_file(&global_path)?;
            merge_config(&mut config, file_config);
        }
    }

    // Try loading local project config
    let local_path = wd.join("workflow-chat.json");
    if local_path.exists() {
        let file_config = read_config_file(&local_path)?;
        merge_config(&mut config, file_config);
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

fn read_config_file(path: &std::path::Path) -> Result<AppConfig, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::File(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| ConfigError::Invalid(e.to_string()))
}

fn merge_config(base: &mut AppConfig, overlay: AppConfig) {
    if overlay.data_dir != default_data_dir() {
        base.data_dir = overlay.data_dir;
    }
    if overlay.api_base != default_api_base() {
        base.api_base = overlay.api_base;
    }
    if overlay.tenant.is_some() {
        base.tenant = overlay.tenant;
    }
    if overlay.chat.use_streaming != default_use_streaming() {
        base.chat.use_streaming = overlay.chat.use_streaming;
    }
    if overlay.chat.timeout_secs != default_timeout_secs() {
        base.chat.timeout_secs = overlay.chat.timeout_secs;
    }
    if overlay.chat.workflow != default_workflow() {
        base.chat.workflow = overlay.chat.workflow;
    }
    if overlay.debug {
        base.debug = true;
    }
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Some(url) = non_empty_env("WORKFLOW_API_BASE") {
        config.api_base = url;
    }

    // Tenant only counts when both halves are present
    if let (Some(user), Some(archive)) = (
        non_empty_env("WORKFLOW_USER_ID"),
        non_empty_env("WORKFLOW_ARCHIVE_ID"),
    ) {
        config.tenant = Some(TenantInfo::new(user, archive));
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn data_path(&self) -> PathBuf {
        self.working_dir.join(&self.data_dir)
    }
}
