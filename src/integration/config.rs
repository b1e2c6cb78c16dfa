//! Provider-specific integration targets
//!
//! Stored as JSON on the integration row, tagged by provider:
//!
//! ```json
//! {"provider": "board", "board_id": "5f1c...", "default_list_id": null}
//! ```

use crate::domain::ProviderType;
use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};

/// Where Jira issues are created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueTrackerTarget {
    /// Atlassian cloud id (from accessible-resources)
    pub cloud_id: String,
    /// Site URL used to build browse links (e.g., "https://acme.atlassian.net")
    pub site_url: String,
    pub project_key: String,
    pub issue_type_id: String,
    /// Extra labels added to every created issue
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// Where Trello cards are created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardTarget {
    pub board_id: String,
    /// List for new cards when the status has no mapped list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_list_id: Option<String>,
}

/// Where Azure DevOps work items are created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemTarget {
    pub organization: String,
    pub project: String,
    /// Work item type name (e.g., "Bug")
    pub work_item_type: String,
}

/// Target selectors for one integration, keyed by provider type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderConfig {
    IssueTracker(IssueTrackerTarget),
    Board(BoardTarget),
    WorkItem(WorkItemTarget),
}

impl ProviderConfig {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderConfig::IssueTracker(_) => ProviderType::IssueTracker,
            ProviderConfig::Board(_) => ProviderType::Board,
            ProviderConfig::WorkItem(_) => ProviderType::WorkItem,
        }
    }

    /// Check that every required selector is present
    pub fn validate(&self) -> Result<()> {
        match self {
            ProviderConfig::IssueTracker(t) => {
                require("cloud_id", &t.cloud_id)?;
                require("site_url", &t.site_url)?;
                require("project_key", &t.project_key)?;
                require("issue_type_id", &t.issue_type_id)?;
                if !t.site_url.starts_with("https://") && !t.site_url.starts_with("http://") {
                    return Err(BridgeError::not_configured(format!(
                        "site_url must be an http(s) URL, got '{}'",
                        t.site_url
                    )));
                }
            }
            ProviderConfig::Board(t) => {
                require("board_id", &t.board_id)?;
                if let Some(ref list) = t.default_list_id {
                    require("default_list_id", list)?;
                }
            }
            ProviderConfig::WorkItem(t) => {
                require("organization", &t.organization)?;
                require("project", &t.project)?;
                require("work_item_type", &t.work_item_type)?;
            }
        }
        Ok(())
    }

    /// Validate and check the variant belongs to `provider`
    pub fn validate_for(&self, provider: ProviderType) -> Result<()> {
        if self.provider_type() != provider {
            return Err(BridgeError::not_configured(format!(
                "{} configuration supplied for a {} integration",
                self.provider_type(),
                provider
            )));
        }
        self.validate()
    }

    pub fn as_issue_tracker(&self) -> Result<&IssueTrackerTarget> {
        match self {
            ProviderConfig::IssueTracker(t) => Ok(t),
            other => Err(mismatch(other, ProviderType::IssueTracker)),
        }
    }

    pub fn as_board(&self) -> Result<&BoardTarget> {
        match self {
            ProviderConfig::Board(t) => Ok(t),
            other => Err(mismatch(other, ProviderType::Board)),
        }
    }

    pub fn as_work_item(&self) -> Result<&WorkItemTarget> {
        match self {
            ProviderConfig::WorkItem(t) => Ok(t),
            other => Err(mismatch(other, ProviderType::WorkItem)),
        }
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(BridgeError::not_configured(format!(
            "missing required field '{}'",
            field
        )));
    }
    Ok(())
}

fn mismatch(config: &ProviderConfig, expected: ProviderType) -> BridgeError {
    BridgeError::not_configured(format!(
        "expected {} configuration, found {}",
        expected,
        config.provider_type()
    ))
}
