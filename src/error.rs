//! Error types for BugBridge
//!
//! `BridgeError` covers every failure mode of the engine. Sync operations wrap
//! it in a `SyncError` that also names the provider, bug and external item so
//! callers can render an actionable message.

use crate::domain::{BugId, ProviderType};
use crate::retry::{RetryDecision, RetryableError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for BugBridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Comprehensive error type for BugBridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Integration missing, inactive, or missing required target selectors
    #[error("Integration not configured: {0}")]
    IntegrationNotConfigured(String),

    /// Refresh failed with a non-retryable grant error; the user must reconnect
    #[error("Token invalid, reconnect required: {0}")]
    TokenInvalid(String),

    /// 4xx from the provider, surfaced verbatim
    #[error("Provider API error: HTTP {status}: {body}")]
    ProviderApi { status: u16, body: String },

    /// Network error, timeout, 5xx or 429
    #[error("Provider unavailable: {message}")]
    ProviderUnavailable {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The provider accepted a create but the local link could not be stored
    #[error("External item {external_id} was created but its link could not be stored: {reason}")]
    OrphanedExternalItem {
        external_id: String,
        url: String,
        reason: String,
    },

    /// Integration state machine rejected an event
    #[error("Illegal integration state transition: {event} while {from}")]
    InvalidStateTransition { from: String, event: String },

    /// Bug does not exist in the bug store
    #[error("Bug not found: {0}")]
    BugNotFound(String),

    /// Bug store collaborator failure
    #[error("Bug store error: {0}")]
    BugStore(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential encryption/decryption errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Storage errors that are not SQLite errors (poisoned lock, bad row)
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP client construction errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::IntegrationNotConfigured(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            message: message.into(),
            retry_after: None,
        }
    }
}

impl RetryableError for BridgeError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            BridgeError::ProviderUnavailable {
                retry_after: Some(after),
                ..
            } => RetryDecision::RetryAfter(*after),
            BridgeError::ProviderUnavailable { .. } => RetryDecision::Retry,
            BridgeError::Http(e) if e.is_connect() || e.is_timeout() => RetryDecision::Retry,
            // Database busy/locked is transient under WAL contention
            BridgeError::Database(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                RetryDecision::Retry
            }
            BridgeError::IntegrationNotConfigured(_)
            | BridgeError::TokenInvalid(_)
            | BridgeError::ProviderApi { .. }
            | BridgeError::OrphanedExternalItem { .. }
            | BridgeError::InvalidStateTransition { .. }
            | BridgeError::BugNotFound(_)
            | BridgeError::BugStore(_)
            | BridgeError::Config(_)
            | BridgeError::Crypto(_)
            | BridgeError::Storage(_)
            | BridgeError::Io(_)
            | BridgeError::Json(_)
            | BridgeError::Yaml(_)
            | BridgeError::Database(_)
            | BridgeError::Http(_)
            | BridgeError::Other(_) => RetryDecision::NoRetry,
        }
    }
}

/// Error surfaced from a push or pull, with the context needed to act on it
#[derive(Error, Debug)]
#[error(
    "{provider} sync failed (bug: {bug}, external id: {external}): {source}",
    bug = display_or_unknown(.bug_id.as_ref().map(BugId::as_str)),
    external = display_or_unknown(.external_id.as_deref())
)]
pub struct SyncError {
    pub provider: ProviderType,
    pub bug_id: Option<BugId>,
    pub external_id: Option<String>,
    #[source]
    pub source: BridgeError,
}

fn display_or_unknown(value: Option<&str>) -> &str {
    value.unwrap_or("unknown")
}

impl SyncError {
    /// The underlying error kind
    pub fn kind(&self) -> &BridgeError {
        &self.source
    }

    /// Whether the caller may retry the operation
    pub fn is_retryable(&self) -> bool {
        self.retry_decision() != RetryDecision::NoRetry
    }

    /// Whether the integration needs the user to reconnect
    pub fn requires_reconnect(&self) -> bool {
        matches!(self.source, BridgeError::TokenInvalid(_))
    }
}

impl RetryableError for SyncError {
    fn retry_decision(&self) -> RetryDecision {
        self.source.retry_decision()
    }
}

/// What is known about the item being synced when an error happens
#[derive(Debug, Clone)]
pub(crate) struct ErrorContext {
    provider: ProviderType,
    bug_id: Option<BugId>,
    external_id: Option<String>,
}

impl ErrorContext {
    pub(crate) fn new(provider: ProviderType) -> Self {
        Self {
            provider,
            bug_id: None,
            external_id: None,
        }
    }

    pub(crate) fn with_bug(mut self, bug_id: &BugId) -> Self {
        self.bug_id = Some(bug_id.clone());
        self
    }

    pub(crate) fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub(crate) fn wrap(&self, source: BridgeError) -> SyncError {
        let external_id = match &source {
            BridgeError::OrphanedExternalItem { external_id, .. } => Some(external_id.clone()),
            _ => self.external_id.clone(),
        };
        SyncError {
            provider: self.provider,
            bug_id: self.bug_id.clone(),
            external_id,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_retryable() {
        let err = BridgeError::unavailable("connection reset");
        assert_eq!(err.retry_decision(), RetryDecision::Retry);

        let err = BridgeError::ProviderUnavailable {
            message: "rate limited".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(
            err.retry_decision(),
            RetryDecision::RetryAfter(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_api_errors_are_not_retried() {
        let err = BridgeError::ProviderApi {
            status: 400,
            body: "Field 'priority' cannot be set".to_string(),
        };
        assert_eq!(err.retry_decision(), RetryDecision::NoRetry);
        assert_eq!(
            BridgeError::TokenInvalid("invalid_grant".to_string()).retry_decision(),
            RetryDecision::NoRetry
        );
    }

    #[test]
    fn test_sync_error_carries_context() {
        let ctx = ErrorContext::new(ProviderType::IssueTracker)
            .with_bug(&BugId::new("bug-7"))
            .with_external_id("PROJ-12");
        let err = ctx.wrap(BridgeError::ProviderApi {
            status: 403,
            body: "forbidden".to_string(),
        });

        assert_eq!(err.provider, ProviderType::IssueTracker);
        assert_eq!(err.external_id.as_deref(), Some("PROJ-12"));
        let message = err.to_string();
        assert!(message.contains("bug-7"));
        assert!(message.contains("PROJ-12"));
        assert!(message.contains("forbidden"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_orphan_error_reports_its_external_id() {
        let ctx = ErrorContext::new(ProviderType::Board).with_bug(&BugId::new("bug-1"));
        let err = ctx.wrap(BridgeError::OrphanedExternalItem {
            external_id: "card-9".to_string(),
            url: "https://trello.com/c/card-9".to_string(),
            reason: "disk full".to_string(),
        });
        assert_eq!(err.external_id.as_deref(), Some("card-9"));
    }

    #[test]
    fn test_token_invalid_requires_reconnect() {
        let err = ErrorContext::new(ProviderType::WorkItem)
            .wrap(BridgeError::TokenInvalid("revoked".to_string()));
        assert!(err.requires_reconnect());
        assert!(err.to_string().contains("unknown"));
    }
}
