use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DATA_DIR_ENV: &str = "SUBROUTINES_DATA_DIR";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub engine: LoopConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible API, without the `/chat/completions` suffix.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Upper bound on one HTTP request to the model, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopConfig {
    /// Restart subroutines whose record says `active = true` when the server boots.
    #[serde(default = "default_true")]
    pub resume_active: bool,
    /// Number of trailing turns kept verbatim when a subroutine uses summaries.
    #[serde(default = "default_summary_keep_recent")]
    pub summary_keep_recent: usize,
    /// Owner name written into records this engine creates.
    #[serde(default = "default_user_name")]
    pub user_name: String,
    /// A fired cycle still running after this many seconds is cancelled.
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    17990
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_cycle_timeout_secs() -> u64 {
    600
}
fn default_true() -> bool {
    true
}
fn default_summary_keep_recent() -> usize {
    12
}
fn default_user_name() -> String {
    "User".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            resume_active: true,
            summary_keep_recent: default_summary_keep_recent(),
            user_name: default_user_name(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
        }
    }
}

impl EngineConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join("config.toml");
        if !config_path.exists() {
            info!("No config.toml found, using defaults.");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config at {:?}: {}", config_path, e))?;
        info!("Loaded engine config from {:?}", config_path);
        Ok(config)
    }
}

/// Root data directory: `$SUBROUTINES_DATA_DIR`, else `~/.subroutines`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".subroutines")
}
