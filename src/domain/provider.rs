//! Supported provider types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the three supported external trackers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// Issue-tracker style (Jira Cloud)
    IssueTracker,
    /// Kanban-board style (Trello)
    Board,
    /// Work-item-tracker style (Azure DevOps Boards)
    WorkItem,
}

impl ProviderType {
    pub const ALL: [ProviderType; 3] = [
        ProviderType::IssueTracker,
        ProviderType::Board,
        ProviderType::WorkItem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::IssueTracker => "issue_tracker",
            ProviderType::Board => "board",
            ProviderType::WorkItem => "work_item",
        }
    }

    /// Human-readable name of the concrete provider
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderType::IssueTracker => "Jira",
            ProviderType::Board => "Trello",
            ProviderType::WorkItem => "Azure DevOps",
        }
    }

    /// Whether credentials come from an OAuth2 authorization-code flow
    ///
    /// The board provider uses a static API key + user token instead.
    pub fn uses_oauth(&self) -> bool {
        !matches!(self, ProviderType::Board)
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = crate::BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "issue_tracker" | "jira" => Ok(ProviderType::IssueTracker),
            "board" | "trello" => Ok(ProviderType::Board),
            "work_item" | "azure_devops" | "ado" => Ok(ProviderType::WorkItem),
            other => Err(crate::BridgeError::Config(format!(
                "Unknown provider type: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trip_names() {
        for provider in ProviderType::ALL {
            assert_eq!(provider.as_str().parse::<ProviderType>().unwrap(), provider);
        }
        assert_eq!("Jira".parse::<ProviderType>().unwrap(), ProviderType::IssueTracker);
        assert_eq!("azure-devops".parse::<ProviderType>().unwrap(), ProviderType::WorkItem);
        assert!("github".parse::<ProviderType>().is_err());
    }

    #[test]
    fn test_only_board_uses_static_tokens() {
        assert!(ProviderType::IssueTracker.uses_oauth());
        assert!(ProviderType::WorkItem.uses_oauth());
        assert!(!ProviderType::Board.uses_oauth());
    }
}
