use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::brain::{AgentSettings, NoServicesPolicy};
use crate::core::mcp::ConnectionTimeouts;
use crate::core::pool::PoolSettings;
use crate::core::service::{ServiceDefinition, ServiceRegistry};
use crate::platform::{NativePlatform, Platform, resolve_data_dir};

pub const CONFIG_FILE_NAME: &str = "toolhost.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    /// Overridden by `TOOLHOST_DATA_DIR`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
    #[serde(default)]
    pub when_no_services: NoServicesPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_purge_cron")]
    pub purge_cron: String,
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
}

fn default_idle_timeout() -> u64 {
    900
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_handshake_timeout() -> u64 {
    15
}
fn default_call_timeout() -> u64 {
    60
}
fn default_max_iterations() -> usize {
    8
}
fn default_history_window() -> usize {
    10
}
fn default_max_tool_result_chars() -> usize {
    16_000
}
fn default_purge_cron() -> String {
    "0 0 3 * * *".to_string()
}
fn default_purge_after_days() -> i64 {
    30
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            history_window: default_history_window(),
            max_tool_result_chars: default_max_tool_result_chars(),
            when_no_services: NoServicesPolicy::default(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            purge_cron: default_purge_cron(),
            purge_after_days: default_purge_after_days(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_llm_api_key_env(),
        }
    }
}

impl Config {
    /// Load from `path`, or from `<data_dir>/toolhost.toml` when no path is
    /// given. A missing default file yields the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (NativePlatform::data_dir().join(CONFIG_FILE_NAME), false),
        };

        if !config_path.exists() {
            if explicit {
                anyhow::bail!("config file {} does not exist", config_path.display());
            }
            info!("No {} found, using defaults.", CONFIG_FILE_NAME);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("invalid config in {}", config_path.display()))?;
        info!(path = %config_path.display(), services = config.services.len(), "configuration loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if !seen.insert(service.tag.clone()) {
                anyhow::bail!("service '{}' is configured more than once", service.tag);
            }
            if service.command.trim().is_empty() {
                anyhow::bail!("service '{}' has an empty command", service.tag);
            }
        }
        if self.agent.max_iterations == 0 {
            anyhow::bail!("agent.max_iterations must be at least 1");
        }
        if self.pool.sweep_interval_secs == 0 {
            anyhow::bail!("pool.sweep_interval_secs must be at least 1");
        }
        let days = self.maintenance.purge_after_days;
        if days < 0 || chrono::Duration::try_days(days).is_none() {
            anyhow::bail!("maintenance.purge_after_days must be a non-negative number of days, got {}", days);
        }
        Ok(())
    }

    /// `TOOLHOST_DATA_DIR`, then `storage.data_dir`, then the platform default.
    pub fn data_dir(&self) -> PathBuf {
        let fallback = match &self.storage.data_dir {
            Some(dir) => expand_home(dir),
            None => NativePlatform::data_dir(),
        };
        resolve_data_dir(fallback)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("toolhost.db")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.data_dir().join("secrets")
    }

    pub fn registry(&self) -> ServiceRegistry {
        ServiceRegistry::new(self.services.clone())
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.pool.sweep_interval_secs),
        }
    }

    pub fn connection_timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            handshake: Duration::from_secs(self.pool.handshake_timeout_secs),
            call: Duration::from_secs(self.pool.call_timeout_secs),
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            max_iterations: self.agent.max_iterations,
            history_window: self.agent.history_window,
            max_tool_result_chars: self.agent.max_tool_result_chars,
            when_no_services: self.agent.when_no_services,
        }
    }

    /// Out-of-range values saturate, which purges nothing.
    pub fn purge_after(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.maintenance.purge_after_days).unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.pool.idle_timeout_secs, 900);
        assert_eq!(config.pool.call_timeout_secs, 60);
        assert_eq!(config.agent.max_iterations, 8);
        assert_eq!(config.agent.when_no_services, NoServicesPolicy::Converse);
        assert_eq!(config.maintenance.purge_cron, "0 0 3 * * *");
        assert!(config.services.is_empty());
    }

    #[test]
    fn parses_full_file() {
        let config = Config::parse(
            r#"
[pool]
idle_timeout_secs = 120

[agent]
max_iterations = 3
when_no_services = "fail"

[llm]
model = "local-model"
base_url = "http://localhost:8080/v1/chat/completions"

[[services]]
tag = "notes"
description = "Personal notes"
command = "notes-mcp"
args = ["--stdio"]
env = { NOTES_REGION = "eu" }

[[services]]
tag = "mail"
command = "mail-mcp"
secret_env = "MAIL_SECRET"
"#,
        )
        .unwrap();

        assert_eq!(config.pool_settings().idle_timeout, Duration::from_secs(120));
        assert_eq!(config.pool_settings().sweep_interval, Duration::from_secs(60));
        assert_eq!(config.agent_settings().max_iterations, 3);
        assert_eq!(config.agent.when_no_services, NoServicesPolicy::Fail);
        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.llm.api_key_env, "OPENAI_API_KEY");

        let registry = config.registry();
        assert_eq!(registry.len(), 2);
        let notes = registry.all()[1];
        assert_eq!(notes.tag.as_str(), "notes");
        assert_eq!(notes.env.get("NOTES_REGION").map(String::as_str), Some("eu"));
        assert_eq!(registry.all()[0].secret_env, "MAIL_SECRET");
    }

    #[test]
    fn duplicate_services_are_rejected() {
        let err = Config::parse(
            r#"
[[services]]
tag = "notes"
command = "a"

[[services]]
tag = "notes"
command = "b"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn zero_iterations_is_rejected() {
        assert!(Config::parse("[agent]\nmax_iterations = 0\n").is_err());
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(Config::parse("[agent]\nwhen_no_services = \"maybe\"\n").is_err());
    }

    #[test]
    fn storage_dir_expands_home() {
        let expanded = expand_home(Path::new("~/.toolhost-test"));
        assert!(!expanded.starts_with("~"));
        assert_eq!(expand_home(Path::new("/srv/toolhost")), PathBuf::from("/srv/toolhost"));
    }

    #[test]
    fn purge_age_must_be_non_negative_and_in_range() {
        let err = Config::parse("[maintenance]\npurge_after_days = -1\n").unwrap_err();
        assert!(err.to_string().contains("purge_after_days"));
        assert!(Config::parse("[maintenance]\npurge_after_days = 9999999999999\n").is_err());
        assert_eq!(
            Config::parse("[maintenance]\npurge_after_days = 0\n").unwrap().purge_after(),
            chrono::Duration::zero()
        );
    }

    #[test]
    fn unvalidated_purge_age_saturates() {
        let mut config = Config::default();
        config.maintenance.purge_after_days = i64::MAX;
        assert_eq!(config.purge_after(), chrono::Duration::MAX);
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.toml"))).await.is_err());
    }

    #[tokio::test]
    async fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[maintenance]\npurge_after_days = 7\n").unwrap();
        let config = Config::load(Some(&path)).await.unwrap();
        assert_eq!(config.purge_after(), chrono::Duration::days(7));
    }
}
