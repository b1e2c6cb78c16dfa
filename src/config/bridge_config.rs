//! BugBridge configuration file handling
//!
//! Loads and manages the ~/.config/bugbridge/config.yaml file.

use super::provider_settings::ProvidersConfig;
use crate::mapping::UnmappedStatusPolicy;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_database_path() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("bugbridge");
    path.push("bugbridge.db");
    path
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_token_refresh_buffer_secs() -> u64 {
    300
}

fn default_secret_key_env() -> String {
    "BUGBRIDGE_SECRET_KEY".to_string()
}

/// BugBridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// SQLite database holding integrations, links and field mappings
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Per-request timeout for every provider call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Tokens expiring within this window are refreshed before use
    #[serde(default = "default_token_refresh_buffer_secs")]
    pub token_refresh_buffer_secs: u64,

    /// Environment variable holding the base64 credential encryption key
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,

    /// What to do when a pushed status has no mapping for the provider
    #[serde(default)]
    pub unmapped_status: UnmappedStatusPolicy,

    /// Provider endpoints and OAuth clients
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl BridgeConfig {
    /// Create a configuration with every default
    pub fn new() -> Self {
        Self {
            database_path: default_database_path(),
            request_timeout_secs: default_request_timeout_secs(),
            token_refresh_buffer_secs: default_token_refresh_buffer_secs(),
            secret_key_env: default_secret_key_env(),
            unmapped_status: UnmappedStatusPolicy::default(),
            providers: ProvidersConfig::default(),
        }
    }

    /// Load configuration from the default path (~/.config/bugbridge/config.yaml)
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        Self::load(&path)
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::BridgeError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading BugBridge configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            database = %config.database_path.display(),
            timeout_secs = config.request_timeout_secs,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving BugBridge configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/bugbridge/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("bugbridge");
        path.push("config.yaml");
        path
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_refresh_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_buffer_secs as i64)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProviderType;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let config = BridgeConfig::new();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.token_refresh_buffer(), chrono::Duration::minutes(5));
        assert_eq!(config.secret_key_env, "BUGBRIDGE_SECRET_KEY");
        assert_eq!(config.unmapped_status, UnmappedStatusPolicy::Skip);
        assert!(config.database_path.ends_with("bugbridge/bugbridge.db"));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
request_timeout_secs: 4
providers:
  issue_tracker:
    client_id: abc
    client_secret_env: JIRA_CLIENT_SECRET
    redirect_uri: https://app.example.com/oauth/jira
"#;
        let config: BridgeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.request_timeout_secs, 4);
        assert_eq!(config.token_refresh_buffer_secs, 300);
        let jira = config.providers.get(ProviderType::IssueTracker);
        assert_eq!(jira.client_id.as_deref(), Some("abc"));
        assert_eq!(jira.requests_per_second, 5);
        assert!(config.providers.board.client_id.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let mut config = BridgeConfig::new();
        config.unmapped_status = UnmappedStatusPolicy::UseDefault;
        config.providers.board.client_id = Some("trello-key".to_string());
        config.save(path).unwrap();

        let loaded = BridgeConfig::load(path).unwrap();
        assert_eq!(loaded.unmapped_status, UnmappedStatusPolicy::UseDefault);
        assert_eq!(loaded.providers.board.client_id.as_deref(), Some("trello-key"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = BridgeConfig::load("/nonexistent/config.yaml");
        assert!(result.is_err());
    }

    #[test]
    fn test_default_path() {
        let path = BridgeConfig::default_path();
        assert!(path.ends_with("bugbridge/config.yaml"));
    }
}
