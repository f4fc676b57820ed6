use crate::global;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub ai: AiConfig,
    pub hubspot: ProviderSettings,
    pub salesforce: ProviderSettings,
    pub refresh: RefreshConfig,
    pub sessions: SessionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

/// Generative text service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Upper bound on how long a rate-limited generation waits before its single retry.
    pub max_retry_wait_seconds: u64,
    /// Delay used when the service rate-limits without saying how long to wait.
    pub default_retry_seconds: u64,
    pub timeout_seconds: u64,
}

/// OAuth client and API endpoint settings for one CRM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub api_base: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// REST API version segment, only used by Salesforce.
    #[serde(default)]
    pub api_version: String,
    /// Token lifetime assumed when the token endpoint omits `expires_in`.
    #[serde(default = "default_session_lifetime")]
    pub session_lifetime_seconds: u64,
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
}

fn default_session_lifetime() -> u64 {
    3600
}

fn default_provider_timeout() -> u64 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Credentials expiring within this window are refreshed by the sweep.
    pub window_seconds: i64,
    pub task_timeout_seconds: u64,
}

/// Idle sessions are closed once nothing has touched them for the timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub idle_timeout_seconds: u64,
    pub reap_interval_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            ai: AiConfig::default(),
            hubspot: ProviderSettings::hubspot(),
            salesforce: ProviderSettings::salesforce(),
            refresh: RefreshConfig::default(),
            sessions: SessionsConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3838,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.0-flash".to_string(),
            max_retry_wait_seconds: 60,
            default_retry_seconds: 30,
            timeout_seconds: 120,
        }
    }
}

impl ProviderSettings {
    pub fn hubspot() -> Self {
        Self {
            api_base: "https://api.hubapi.com".to_string(),
            token_url: "https://api.hubapi.com/oauth/v1/token".to_string(),
            client_id: String::new(),
            client_secret: None,
            api_version: String::new(),
            session_lifetime_seconds: 1800,
            timeout_seconds: 20,
        }
    }

    pub fn salesforce() -> Self {
        Self {
            api_base: "https://login.salesforce.com".to_string(),
            token_url: "https://login.salesforce.com/services/oauth2/token".to_string(),
            client_id: String::new(),
            client_secret: None,
            api_version: "v59.0".to_string(),
            session_lifetime_seconds: 7200,
            timeout_seconds: 20,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            window_seconds: 600,
            task_timeout_seconds: 30,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 30 * 60,
            reap_interval_seconds: 60,
        }
    }
}

impl SessionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds.max(1))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_seconds.max(1))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config.with_env_overrides());
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Loaded config from {:?}", config_path);
        Ok(config.with_env_overrides())
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("CRMLINK_AI_API_KEY") {
            self.ai.api_key = Some(key);
        }
        if let Ok(secret) = std::env::var("CRMLINK_HUBSPOT_CLIENT_SECRET") {
            self.hubspot.client_secret = Some(secret);
        }
        if let Ok(secret) = std::env::var("CRMLINK_SALESFORCE_CLIENT_SECRET") {
            self.salesforce.client_secret = Some(secret);
        }
        self
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}
