//! Per-provider endpoint and OAuth client settings

use crate::domain::ProviderType;
use crate::Result;
use serde::{Deserialize, Serialize};

fn default_requests_per_second() -> u32 {
    5
}

/// Endpoint, OAuth client and rate settings for one provider
///
/// Every field is optional in the YAML file; unset URLs and scopes fall back
/// to the provider's public defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// REST API base URL (e.g., "https://api.atlassian.com")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    /// OAuth authorization server base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_base_url: Option<String>,

    /// OAuth client id (for the board provider: the Trello API key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Environment variable holding the OAuth client secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_env: Option<String>,

    /// Redirect URI registered with the OAuth app
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,

    /// OAuth scopes to request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,

    /// Client-side request budget per adapter instance
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_base_url: None,
            auth_base_url: None,
            client_id: None,
            client_secret_env: None,
            redirect_uri: None,
            scopes: Vec::new(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

impl ProviderSettings {
    /// Resolved REST API base URL without a trailing slash
    pub fn api_base_url(&self, provider: ProviderType) -> String {
        let url = self.api_base_url.as_deref().unwrap_or(match provider {
            ProviderType::IssueTracker => "https://api.atlassian.com",
            ProviderType::Board => "https://api.trello.com/1",
            ProviderType::WorkItem => "https://dev.azure.com",
        });
        url.trim_end_matches('/').to_string()
    }

    /// Resolved OAuth authorization server base URL without a trailing slash
    ///
    /// For the work-item provider this host also serves the profile API used
    /// by connection tests.
    pub fn auth_base_url(&self, provider: ProviderType) -> String {
        let url = self.auth_base_url.as_deref().unwrap_or(match provider {
            ProviderType::IssueTracker => "https://auth.atlassian.com",
            ProviderType::Board => "https://trello.com/1",
            ProviderType::WorkItem => "https://app.vssps.visualstudio.com",
        });
        url.trim_end_matches('/').to_string()
    }

    /// Requested scopes, falling back to what the adapter needs
    pub fn scopes(&self, provider: ProviderType) -> Vec<String> {
        if !self.scopes.is_empty() {
            return self.scopes.clone();
        }
        let defaults: &[&str] = match provider {
            ProviderType::IssueTracker => &[
                "read:jira-work",
                "write:jira-work",
                "read:jira-user",
                "offline_access",
            ],
            ProviderType::Board => &["read", "write"],
            ProviderType::WorkItem => &["vso.work_write", "vso.profile"],
        };
        defaults.iter().map(|s| s.to_string()).collect()
    }

    /// OAuth client id, required for OAuth providers and for the Trello API key
    pub fn require_client_id(&self, provider: ProviderType) -> Result<&str> {
        self.client_id.as_deref().filter(|id| !id.is_empty()).ok_or_else(|| {
            crate::BridgeError::Config(format!("providers.{}.client_id is not set", provider))
        })
    }

    /// Read the client secret from the configured environment variable
    pub fn client_secret(&self, provider: ProviderType) -> Result<String> {
        let var = self.client_secret_env.as_deref().ok_or_else(|| {
            crate::BridgeError::Config(format!(
                "providers.{}.client_secret_env is not set",
                provider
            ))
        })?;
        std::env::var(var.trim_start_matches('$')).map_err(|_| {
            crate::BridgeError::Config(format!(
                "Environment variable {} for the {} client secret is not set",
                var, provider
            ))
        })
    }

    pub fn require_redirect_uri(&self, provider: ProviderType) -> Result<&str> {
        self.redirect_uri.as_deref().ok_or_else(|| {
            crate::BridgeError::Config(format!("providers.{}.redirect_uri is not set", provider))
        })
    }
}

/// Settings for all three providers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub issue_tracker: ProviderSettings,

    #[serde(default)]
    pub board: ProviderSettings,

    #[serde(default)]
    pub work_item: ProviderSettings,
}

impl ProvidersConfig {
    pub fn get(&self, provider: ProviderType) -> &ProviderSettings {
        match provider {
            ProviderType::IssueTracker => &self.issue_tracker,
            ProviderType::Board => &self.board,
            ProviderType::WorkItem => &self.work_item,
        }
    }

    pub fn get_mut(&mut self, provider: ProviderType) -> &mut ProviderSettings {
        match provider {
            ProviderType::IssueTracker => &mut self.issue_tracker,
            ProviderType::Board => &mut self.board,
            ProviderType::WorkItem => &mut self.work_item,
        }
    }
}
