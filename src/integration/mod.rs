//! Integrations: one connection per (tenant, provider type)
//!
//! - **config**: typed target selectors per provider
//! - **state**: connection lifecycle state machine
//! - **store**: SQLite persistence with encrypted credentials

mod config;
mod state;
mod store;

pub use config::{BoardTarget, IssueTrackerTarget, ProviderConfig, WorkItemTarget};
pub use state::{IntegrationState, StateEvent};
pub use store::{IntegrationStore, PendingHandshake};

use crate::domain::{ProviderType, TenantId};
use crate::{BridgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which way data may flow for an integration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Push,
    Pull,
    #[default]
    Both,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Push => "push",
            SyncDirection::Pull => "pull",
            SyncDirection::Both => "both",
        }
    }

    pub fn allows_push(&self) -> bool {
        matches!(self, SyncDirection::Push | SyncDirection::Both)
    }

    pub fn allows_pull(&self) -> bool {
        matches!(self, SyncDirection::Pull | SyncDirection::Both)
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncDirection {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "push" => Ok(SyncDirection::Push),
            "pull" => Ok(SyncDirection::Pull),
            "both" => Ok(SyncDirection::Both),
            other => Err(BridgeError::Config(format!(
                "Unknown sync direction '{}' (expected push, pull or both)",
                other
            ))),
        }
    }
}

/// Provider credentials, encrypted at rest
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// `None` for static tokens that never expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// A token that never expires and cannot be refreshed
    pub fn static_token(token: impl Into<String>) -> Self {
        Self {
            access_token: token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }
}

// Manual Debug so tokens never reach logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A stored integration, credentials decrypted
#[derive(Debug, Clone)]
pub struct Integration {
    pub tenant_id: TenantId,
    pub provider_type: ProviderType,
    pub is_active: bool,
    pub state: IntegrationState,
    pub credentials: Credentials,
    pub config: ProviderConfig,
    pub sync_direction: SyncDirection,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    /// Credential-free view for display
    pub fn summary(&self) -> IntegrationSummary {
        IntegrationSummary {
            tenant_id: self.tenant_id.clone(),
            provider_type: self.provider_type,
            is_active: self.is_active,
            state: self.state,
            config: Some(self.config.clone()),
            sync_direction: Some(self.sync_direction),
            token_expires_at: self.credentials.expires_at,
            created_at: Some(self.created_at),
            updated_at: Some(self.updated_at),
        }
    }
}

/// What callers may see about an integration; never includes credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrationSummary {
    pub tenant_id: TenantId,
    pub provider_type: ProviderType,
    pub is_active: bool,
    pub state: IntegrationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ProviderConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_direction: Option<SyncDirection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl IntegrationSummary {
    /// Placeholder for a provider with no stored integration
    pub fn absent(tenant_id: TenantId, provider_type: ProviderType, state: IntegrationState) -> Self {
        Self {
            tenant_id,
            provider_type,
            is_active: false,
            state,
            config: None,
            sync_direction: None,
            token_expires_at: None,
            created_at: None,
            updated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_permissions() {
        assert!(SyncDirection::Push.allows_push());
        assert!(!SyncDirection::Push.allows_pull());
        assert!(SyncDirection::Pull.allows_pull());
        assert!(SyncDirection::Both.allows_push() && SyncDirection::Both.allows_pull());
        assert_eq!("PULL".parse::<SyncDirection>().unwrap(), SyncDirection::Pull);
        assert!("sideways".parse::<SyncDirection>().is_err());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials {
            access_token: "at-secret".to_string(),
            refresh_token: Some("rt-secret".to_string()),
            expires_at: None,
        };
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("at-secret"));
        assert!(!debug.contains("rt-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_summary_has_no_credentials() {
        let now = Utc::now();
        let integration = Integration {
            tenant_id: TenantId::new("t1"),
            provider_type: ProviderType::Board,
            is_active: true,
            state: IntegrationState::Connected,
            credentials: Credentials::static_token("trello-token-xyz"),
            config: ProviderConfig::Board(BoardTarget {
                board_id: "b1".to_string(),
                default_list_id: None,
            }),
            sync_direction: SyncDirection::Both,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&integration.summary()).unwrap();
        assert!(!json.contains("trello-token-xyz"));
        assert!(json.contains("\"state\":\"connected\""));
    }
}
