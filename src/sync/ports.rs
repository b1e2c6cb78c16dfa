//! Collaborators owned by the host platform
//!
//! The engine never stores bugs itself. It reads and writes them through a
//! [`BugStore`] and reports completed syncs to an [`AuditSink`].

use crate::domain::{BugId, BugSnapshot, BugUpdate, ProviderType, TenantId};
use crate::{BridgeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Access to the platform's bugs
#[async_trait]
pub trait BugStore: Send + Sync {
    /// Current fields of a bug; [`BridgeError::BugNotFound`] if it does not exist
    async fn get_bug_snapshot(&self, tenant: &TenantId, bug: &BugId) -> Result<BugSnapshot>;

    /// Overwrite the `Some` fields of `update`
    async fn apply_external_update(&self, tenant: &TenantId, bug: &BugId, update: &BugUpdate) -> Result<()>;

    /// Create a bug from pulled fields under `project_id`
    async fn create_bug(&self, tenant: &TenantId, project_id: &str, fields: &BugUpdate) -> Result<BugId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SyncedToExternal,
}

/// Which way the data moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Push,
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub tenant_id: TenantId,
    pub bug_id: BugId,
    pub action: AuditAction,
    pub operation: SyncOperation,
    pub provider: ProviderType,
    pub external_id: String,
    pub at: DateTime<Utc>,
}

/// Receives an event after every successful push or pull
///
/// Failures are logged by the caller and never fail the sync.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> Result<()>;
}

/// Writes audit events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<()> {
        tracing::info!(
            tenant = %event.tenant_id,
            bug = %event.bug_id,
            provider = %event.provider,
            external_id = %event.external_id,
            operation = ?event.operation,
            "Bug synced"
        );
        Ok(())
    }
}

/// Bug store for hosts that only manage integrations (the CLI)
///
/// Every call fails, so push and pull report a clear error instead of
/// touching a store that is not there.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedBugStore;

fn detached() -> BridgeError {
    BridgeError::BugStore("no bug store is attached to this process".to_string())
}

#[async_trait]
impl BugStore for DetachedBugStore {
    async fn get_bug_snapshot(&self, _tenant: &TenantId, _bug: &BugId) -> Result<BugSnapshot> {
        Err(detached())
    }

    async fn apply_external_update(&self, _tenant: &TenantId, _bug: &BugId, _update: &BugUpdate) -> Result<()> {
        Err(detached())
    }

    async fn create_bug(&self, _tenant: &TenantId, _project_id: &str, _fields: &BugUpdate) -> Result<BugId> {
        Err(detached())
    }
}
