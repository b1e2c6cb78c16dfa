//! Provider adapters
//!
//! One [`ProviderAdapter`] per external tracker. Adapters speak the
//! provider's REST dialect and nothing else: credentials come from the
//! caller, values arrive already translated by the field mapper.
//!
//! | Provider      | Item        | Category        | Status model        |
//! |---------------|-------------|-----------------|---------------------|
//! | Jira          | issue       | issue type      | workflow transition |
//! | Trello        | card        | board list      | list membership     |
//! | Azure DevOps  | work item   | work item type  | `System.State`      |

mod azure_devops;
pub mod http;
mod jira;
pub mod rate_limit;
mod rich_text;
mod trello;

pub use azure_devops::AzureDevOpsAdapter;
pub use jira::JiraAdapter;
pub use rich_text::{adf_to_text, html_to_text, text_to_adf, text_to_html};
pub use trello::TrelloAdapter;

use crate::config::BridgeConfig;
use crate::domain::ProviderType;
use crate::integration::ProviderConfig;
use crate::vault::AccessToken;
use crate::{BridgeError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// An id/name pair as shown in pickers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedRef {
    pub id: String,
    pub name: String,
}

impl NamedRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Fields for a new external item, already in provider vocabulary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewItem {
    pub title: String,
    pub description: Option<String>,
    pub mapped_priority: Option<String>,
    pub mapped_labels: Vec<String>,
    pub mapped_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedItem {
    pub external_id: String,
    pub url: Option<String>,
}

/// Partial update; `None` leaves the provider's value untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub mapped_priority: Option<String>,
    /// Every priority value the mapping knows, so label-based providers can
    /// drop a stale one when `mapped_priority` changes
    pub known_priorities: Vec<String>,
    pub mapped_status: Option<String>,
}

impl ItemPatch {
    pub fn has_field_changes(&self) -> bool {
        self.title.is_some() || self.description.is_some() || self.mapped_priority.is_some()
    }
}

/// What happened to the status part of an update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    NotRequested,
    Applied { to: String },
    /// Already in the requested status
    Unchanged,
    /// No valid transition or list; the rest of the update still applied
    Skipped { requested: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub fields_updated: bool,
    pub status: StatusChange,
}

/// An external item in provider vocabulary
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalItem {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub mapped_status: Option<String>,
    /// Other identifiers of the same status, tried when `mapped_status` is unmapped
    pub status_aliases: Vec<String>,
    /// `None` for providers that carry priority as a label
    pub mapped_priority: Option<String>,
    pub labels: Vec<String>,
    pub url: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConnectionCheck {
    Ok { identity_label: String },
    Failed { error: String },
}

/// REST client for one external tracker
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    async fn list_projects(&self, token: &AccessToken, config: &ProviderConfig) -> Result<Vec<NamedRef>>;

    /// Issue types, board lists or work item types of one project
    async fn list_categories(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        project_id: &str,
    ) -> Result<Vec<NamedRef>>;

    async fn create_item(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        item: &NewItem,
    ) -> Result<CreatedItem>;

    /// Field changes first, then the status change if one was requested
    async fn update_item(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        external_id: &str,
        patch: &ItemPatch,
    ) -> Result<UpdateOutcome>;

    async fn get_item(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        external_id: &str,
    ) -> Result<ExternalItem>;

    /// Rejected credentials are a `Failed` check; outages are errors
    async fn test_connection(&self, token: &AccessToken, config: &ProviderConfig) -> Result<ConnectionCheck>;
}

/// Turn an identity lookup into a connection check
pub(crate) fn connection_check(identity: Result<String>) -> Result<ConnectionCheck> {
    match identity {
        Ok(identity_label) => Ok(ConnectionCheck::Ok { identity_label }),
        Err(e @ BridgeError::TokenInvalid(_)) | Err(e @ BridgeError::ProviderApi { .. }) => {
            Ok(ConnectionCheck::Failed { error: e.to_string() })
        }
        Err(e) => Err(e),
    }
}

/// Adapters by provider type
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderType, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build all three adapters from configuration
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        let providers = &config.providers;

        let mut registry = Self::new();
        registry.register(Arc::new(JiraAdapter::from_settings(
            &providers.issue_tracker,
            timeout,
        )?));
        registry.register(Arc::new(TrelloAdapter::from_settings(&providers.board, timeout)?));
        registry.register(Arc::new(AzureDevOpsAdapter::from_settings(
            &providers.work_item,
            timeout,
        )?));
        Ok(registry)
    }

    /// Replaces any adapter already registered for the same provider
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider_type(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, provider: ProviderType) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned().ok_or_else(|| {
            BridgeError::not_configured(format!("no adapter registered for {}", provider.display_name()))
        })
    }

    pub fn providers(&self) -> Vec<ProviderType> {
        let mut providers: Vec<_> = self.adapters.keys().copied().collect();
        providers.sort();
        providers
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}
