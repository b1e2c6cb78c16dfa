//! Push and pull orchestration
//!
//! A push reads the local bug, translates its fields, and creates or updates
//! the linked external item. A pull reads the external item and creates or
//! updates the linked local bug. Provider writes and the ledger write that
//! follows them run in a spawned task the caller awaits, so dropping the
//! caller's future after the request went out cannot lose the link.

use super::locks::{SyncGuard, SyncKey, SyncLocks};
use super::ports::{AuditAction, AuditEvent, AuditSink, BugStore, SyncOperation};
use crate::clock::{Clock, SystemClock};
use crate::config::BridgeConfig;
use crate::domain::{BugId, BugUpdate, ProviderType, Severity, Status, TenantId};
use crate::error::ErrorContext;
use crate::integration::{Integration, IntegrationStore};
use crate::ledger::{ExternalIdLedger, ExternalLink};
use crate::mapping::{FieldMapper, FieldMapping, MappingKind, MappingStore, StatusPlan};
use crate::providers::{
    AdapterRegistry, ConnectionCheck, ExternalItem, ItemPatch, NamedRef, NewItem, ProviderAdapter,
    StatusChange,
};
use crate::store::Database;
use crate::vault::{OAuthClient, SecretCipher, TokenScope, TokenVault};
use crate::{BridgeError, Result, SyncError};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
}

/// Partial-success details of a sync that otherwise went through
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncWarning {
    /// `value` had no mapping and the default was used
    MappingDefaulted { kind: MappingKind, value: String },
    /// The status change was not applied; the rest of the sync was
    StatusSkipped { requested: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub action: SyncAction,
    pub bug_id: BugId,
    pub external_id: String,
    pub external_url: Option<String>,
    pub warnings: Vec<SyncWarning>,
}

/// Everything the coordinator talks to
pub struct SyncServices {
    pub vault: Arc<TokenVault>,
    pub adapters: AdapterRegistry,
    pub mappings: MappingStore,
    pub mapper: FieldMapper,
    pub ledger: ExternalIdLedger,
    pub bugs: Arc<dyn BugStore>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

/// How long a sync waits for audit delivery before returning
pub const DEFAULT_AUDIT_WAIT: Duration = Duration::from_secs(2);

pub struct SyncCoordinator {
    inner: Arc<Inner>,
    audit_wait: Duration,
}

struct Inner {
    services: SyncServices,
    locks: SyncLocks,
}

impl SyncCoordinator {
    pub fn new(services: SyncServices) -> Self {
        Self {
            inner: Arc::new(Inner {
                services,
                locks: SyncLocks::new(),
            }),
            audit_wait: DEFAULT_AUDIT_WAIT,
        }
    }

    pub fn with_audit_wait(mut self, wait: Duration) -> Self {
        self.audit_wait = wait;
        self
    }

    /// Wire the default stack: SQLite at `database_path`, the encryption key
    /// from `secret_key_env`, HTTP adapters and OAuth clients from settings
    pub fn from_config(
        config: &BridgeConfig,
        bugs: Arc<dyn BugStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let db = Arc::new(Database::open(&config.database_path)?);
        let cipher = Arc::new(SecretCipher::from_env(&config.secret_key_env)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut vault = TokenVault::new(
            IntegrationStore::new(db.clone(), cipher, clock.clone()),
            clock.clone(),
            config.token_refresh_buffer(),
        );
        for provider in ProviderType::ALL {
            let settings = config.providers.get(provider);
            if settings.client_id.is_none() {
                continue;
            }
            if let Some(client) = OAuthClient::from_settings(provider, settings, config.request_timeout())? {
                vault = vault.with_endpoint(provider, Arc::new(client));
            }
        }

        Ok(Self::new(SyncServices {
            vault: Arc::new(vault),
            adapters: AdapterRegistry::from_config(config)?,
            mappings: MappingStore::new(db.clone(), clock.clone()),
            mapper: FieldMapper::new(config.unmapped_status),
            ledger: ExternalIdLedger::new(db, clock.clone()),
            bugs,
            audit,
            clock,
        }))
    }

    pub fn vault(&self) -> &Arc<TokenVault> {
        &self.inner.services.vault
    }

    pub fn mappings(&self) -> &MappingStore {
        &self.inner.services.mappings
    }

    pub fn ledger(&self) -> &ExternalIdLedger {
        &self.inner.services.ledger
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.inner.services.adapters
    }

    /// Create or update the external item for `bug`
    pub async fn push(
        &self,
        tenant: &TenantId,
        bug: &BugId,
        provider: ProviderType,
    ) -> std::result::Result<SyncResult, SyncError> {
        let scope = TokenScope::new(self.vault().clone());
        self.push_in_scope(&scope, tenant, bug, provider).await
    }

    /// Push several bugs to one provider, resolving the token once
    pub async fn push_all(
        &self,
        tenant: &TenantId,
        bugs: &[BugId],
        provider: ProviderType,
    ) -> Vec<std::result::Result<SyncResult, SyncError>> {
        let scope = TokenScope::new(self.vault().clone());
        let mut results = Vec::with_capacity(bugs.len());
        for bug in bugs {
            results.push(self.push_in_scope(&scope, tenant, bug, provider).await);
        }
        results
    }

    async fn push_in_scope(
        &self,
        scope: &TokenScope,
        tenant: &TenantId,
        bug: &BugId,
        provider: ProviderType,
    ) -> std::result::Result<SyncResult, SyncError> {
        let guard = self.inner.locks.acquire(SyncKey::bug(tenant, bug, provider)).await;

        let mut known_external = None;
        self.push_locked(guard, scope, tenant, bug, provider, &mut known_external)
            .await
            .map_err(|e| {
                let mut ctx = ErrorContext::new(provider).with_bug(bug);
                if let Some(id) = known_external {
                    ctx = ctx.with_external_id(id);
                }
                let err = ctx.wrap(e);
                tracing::warn!(tenant = %tenant, error = %err, "Push failed");
                err
            })
    }

    async fn push_locked(
        &self,
        guard: SyncGuard,
        scope: &TokenScope,
        tenant: &TenantId,
        bug: &BugId,
        provider: ProviderType,
        known_external: &mut Option<String>,
    ) -> Result<SyncResult> {
        let services = &self.inner.services;

        let integration = services.vault.active_integration(tenant, provider)?;
        if !integration.sync_direction.allows_push() {
            return Err(direction_error(&integration, "push"));
        }
        let adapter = services.adapters.get(provider)?;
        let snapshot = services.bugs.get_bug_snapshot(tenant, bug).await?;
        let mapping = services.mappings.load(tenant, provider)?;
        let link = services.ledger.find(tenant, bug, provider)?;
        *known_external = link.as_ref().map(|l| l.external_id.clone());
        let token = scope.require(tenant, provider).await?;

        let mut warnings = Vec::new();
        let priority = services.mapper.severity_to_priority(&mapping, snapshot.severity);
        if priority.defaulted {
            warnings.push(SyncWarning::MappingDefaulted {
                kind: MappingKind::Severity,
                value: snapshot.severity.to_string(),
            });
        }

        let inner = self.inner.clone();
        let config = integration.config.clone();
        let (tenant_id, bug_id) = (tenant.clone(), bug.clone());

        let (action, link) = match link {
            Some(link) => {
                let mapped_status = match services.mapper.status_for_update(&mapping, snapshot.status) {
                    StatusPlan::Apply(translation) => {
                        if translation.defaulted {
                            warnings.push(SyncWarning::MappingDefaulted {
                                kind: MappingKind::Status,
                                value: snapshot.status.to_string(),
                            });
                        }
                        translation.value
                    }
                    StatusPlan::Skip { requested, reason } => {
                        warnings.push(SyncWarning::StatusSkipped {
                            requested: requested.to_string(),
                            reason,
                        });
                        None
                    }
                };
                let patch = ItemPatch {
                    title: Some(snapshot.title),
                    description: snapshot.description,
                    mapped_priority: priority.value,
                    known_priorities: known_priorities(&mapping),
                    mapped_status,
                };

                let (outcome, link) = run_to_completion(async move {
                    let _guard = guard;
                    let outcome = adapter
                        .update_item(&token, &config, &link.external_id, &patch)
                        .await?;
                    if !inner.services.ledger.touch(&tenant_id, &bug_id, provider, None)? {
                        tracing::warn!(bug = %bug_id, provider = %provider, "Link removed while the push was running");
                    }
                    Ok::<_, BridgeError>((outcome, link))
                })
                .await?;

                if let StatusChange::Skipped { requested, reason } = outcome.status {
                    warnings.push(SyncWarning::StatusSkipped { requested, reason });
                }
                (SyncAction::Updated, link)
            }
            None => {
                let status = services.mapper.status_to_external(&mapping, snapshot.status);
                if status.defaulted {
                    warnings.push(SyncWarning::MappingDefaulted {
                        kind: MappingKind::Status,
                        value: snapshot.status.to_string(),
                    });
                }
                let item = NewItem {
                    title: snapshot.title,
                    description: snapshot.description,
                    mapped_priority: priority.value,
                    mapped_labels: Vec::new(),
                    mapped_status: status.value,
                };

                let link = run_to_completion(async move {
                    let _guard = guard;
                    let created = adapter.create_item(&token, &config, &item).await?;
                    inner
                        .services
                        .ledger
                        .insert(&tenant_id, &bug_id, provider, &created.external_id, created.url.as_deref())
                        .map_err(|e| {
                            tracing::error!(
                                bug = %bug_id,
                                provider = %provider,
                                external_id = %created.external_id,
                                error = %e,
                                "External item created but its link could not be stored"
                            );
                            BridgeError::OrphanedExternalItem {
                                external_id: created.external_id.clone(),
                                url: created.url.clone().unwrap_or_default(),
                                reason: e.to_string(),
                            }
                        })
                })
                .await?;
                (SyncAction::Created, link)
            }
        };

        tracing::info!(
            tenant = %tenant,
            bug = %bug,
            provider = %provider,
            external_id = %link.external_id,
            action = ?action,
            warnings = warnings.len(),
            "Pushed bug"
        );
        self.emit(tenant, bug, provider, &link.external_id, SyncOperation::Push)
            .await;

        Ok(SyncResult {
            action,
            bug_id: bug.clone(),
            external_id: link.external_id,
            external_url: link.external_url,
            warnings,
        })
    }

    /// Create or update the local bug from an external item
    ///
    /// `target_project_id` is only used when the item is not linked yet.
    pub async fn pull(
        &self,
        tenant: &TenantId,
        provider: ProviderType,
        external_id: &str,
        target_project_id: &str,
    ) -> std::result::Result<SyncResult, SyncError> {
        let scope = TokenScope::new(self.vault().clone());
        let guard = self
            .inner
            .locks
            .acquire(SyncKey::external(tenant, provider, external_id))
            .await;

        let mut known_bug = None;
        self.pull_locked(guard, &scope, tenant, provider, external_id, target_project_id, &mut known_bug)
            .await
            .map_err(|e| {
                let mut ctx = ErrorContext::new(provider).with_external_id(external_id);
                if let Some(ref bug) = known_bug {
                    ctx = ctx.with_bug(bug);
                }
                let err = ctx.wrap(e);
                tracing::warn!(tenant = %tenant, error = %err, "Pull failed");
                err
            })
    }

    #[allow(clippy::too_many_arguments)]
    async fn pull_locked(
        &self,
        guard: SyncGuard,
        scope: &TokenScope,
        tenant: &TenantId,
        provider: ProviderType,
        external_id: &str,
        target_project_id: &str,
        known_bug: &mut Option<BugId>,
    ) -> Result<SyncResult> {
        let services = &self.inner.services;

        let integration = services.vault.active_integration(tenant, provider)?;
        if !integration.sync_direction.allows_pull() {
            return Err(direction_error(&integration, "pull"));
        }
        let adapter = services.adapters.get(provider)?;
        let mapping = services.mappings.load(tenant, provider)?;
        let token = scope.require(tenant, provider).await?;

        let item = adapter.get_item(&token, &integration.config, external_id).await?;
        let (update, warnings) = self.translate_external(&mapping, &item);
        let existing = match services.ledger.find_by_external(tenant, provider, external_id)? {
            Some(link) => {
                let bug_guard = self
                    .inner
                    .locks
                    .acquire(SyncKey::bug(tenant, &link.bug_id, provider))
                    .await;
                // unlink only holds the bug key, so the link may be gone by now
                let current = services
                    .ledger
                    .find_by_external(tenant, provider, external_id)?
                    .filter(|current| current.bug_id == link.bug_id);
                if current.is_none() {
                    tracing::warn!(
                        bug = %link.bug_id,
                        external_id = %external_id,
                        "Link removed while the pull was running, importing as a new bug"
                    );
                }
                current.map(|current| (current, bug_guard))
            }
            None => None,
        };

        let inner = self.inner.clone();
        let tenant_id = tenant.clone();
        let url = item.url.clone();

        let (action, bug_id) = match existing {
            Some((link, bug_guard)) => {
                *known_bug = Some(link.bug_id.clone());

                let bug_id = run_to_completion(async move {
                    let _guards = (guard, bug_guard);
                    inner
                        .services
                        .bugs
                        .apply_external_update(&tenant_id, &link.bug_id, &update)
                        .await?;
                    inner
                        .services
                        .ledger
                        .touch(&tenant_id, &link.bug_id, provider, url.as_deref())?;
                    Ok::<_, BridgeError>(link.bug_id)
                })
                .await?;
                (SyncAction::Updated, bug_id)
            }
            None => {
                if target_project_id.trim().is_empty() {
                    return Err(BridgeError::not_configured(format!(
                        "{} item {} is not linked; a target project is required to import it",
                        provider.display_name(),
                        external_id
                    )));
                }
                let project = target_project_id.to_string();
                let external = external_id.to_string();

                let bug_id = run_to_completion(async move {
                    let _guard = guard;
                    let bug_id = inner
                        .services
                        .bugs
                        .create_bug(&tenant_id, &project, &update)
                        .await?;
                    inner
                        .services
                        .ledger
                        .insert(&tenant_id, &bug_id, provider, &external, url.as_deref())
                        .map_err(|e| {
                            tracing::error!(bug = %bug_id, external_id = %external, error = %e, "Local bug created but its link could not be stored");
                            e
                        })?;
                    Ok::<_, BridgeError>(bug_id)
                })
                .await?;
                *known_bug = Some(bug_id.clone());
                (SyncAction::Created, bug_id)
            }
        };

        tracing::info!(
            tenant = %tenant,
            bug = %bug_id,
            provider = %provider,
            external_id = %external_id,
            action = ?action,
            "Pulled external item"
        );
        self.emit(tenant, &bug_id, provider, external_id, SyncOperation::Pull)
            .await;

        Ok(SyncResult {
            action,
            bug_id,
            external_id: external_id.to_string(),
            external_url: item.url,
            warnings,
        })
    }

    /// Local fields for an external item; external values win
    fn translate_external(&self, mapping: &FieldMapping, item: &ExternalItem) -> (BugUpdate, Vec<SyncWarning>) {
        let mapper = &self.inner.services.mapper;
        let mut warnings = Vec::new();

        let status = match item.mapped_status.as_deref() {
            Some(external) => {
                let known = std::iter::once(external)
                    .chain(item.status_aliases.iter().map(String::as_str))
                    .find(|candidate| mapping.status.reverse(candidate).is_some())
                    .unwrap_or(external);
                let resolved = mapper.external_to_status(mapping, known);
                if resolved.defaulted {
                    warnings.push(SyncWarning::MappingDefaulted {
                        kind: MappingKind::Status,
                        value: external.to_string(),
                    });
                }
                resolved.value
            }
            None => {
                warnings.push(SyncWarning::MappingDefaulted {
                    kind: MappingKind::Status,
                    value: String::new(),
                });
                Status::default()
            }
        };

        let severity = match item.mapped_priority.as_deref() {
            Some(external) => {
                let resolved = mapper.priority_to_severity(mapping, external);
                if resolved.defaulted {
                    warnings.push(SyncWarning::MappingDefaulted {
                        kind: MappingKind::Severity,
                        value: external.to_string(),
                    });
                }
                resolved.value
            }
            // Label-based priorities: the first label the mapping knows
            None => match item.labels.iter().find_map(|l| mapping.severity.reverse(l)) {
                Some(severity) => severity,
                None => {
                    tracing::warn!(external_id = %item.external_id, "No priority label mapped, using default severity");
                    warnings.push(SyncWarning::MappingDefaulted {
                        kind: MappingKind::Severity,
                        value: item.labels.join(","),
                    });
                    Severity::default()
                }
            },
        };

        let update = BugUpdate {
            title: Some(item.title.clone()),
            description: Some(item.description.clone()),
            status: Some(status),
            severity: Some(severity),
        };
        (update, warnings)
    }

    async fn emit(
        &self,
        tenant: &TenantId,
        bug: &BugId,
        provider: ProviderType,
        external_id: &str,
        operation: SyncOperation,
    ) {
        let services = &self.inner.services;
        let audit = services.audit.clone();
        let event = AuditEvent {
            tenant_id: tenant.clone(),
            bug_id: bug.clone(),
            action: AuditAction::SyncedToExternal,
            operation,
            provider,
            external_id: external_id.to_string(),
            at: services.clock.now(),
        };
        let (tenant_id, bug_id) = (tenant.clone(), bug.clone());
        let delivery = tokio::spawn(async move {
            if let Err(e) = audit.emit(event).await {
                tracing::warn!(tenant = %tenant_id, bug = %bug_id, error = %e, "Audit event dropped");
            }
        });

        // The delivery task keeps running after the wait gives up
        match tokio::time::timeout(self.audit_wait, delivery).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(tenant = %tenant, bug = %bug, error = %e, "Audit delivery task failed");
            }
            Err(_) => {
                tracing::warn!(
                    tenant = %tenant,
                    bug = %bug,
                    wait_ms = self.audit_wait.as_millis() as u64,
                    "Audit sink is slow, delivery continues in the background"
                );
            }
        }
    }

    pub fn links_for_bug(&self, tenant: &TenantId, bug: &BugId) -> Result<Vec<ExternalLink>> {
        self.ledger().list_for_bug(tenant, bug)
    }

    /// Forget the link; neither the bug nor the external item is touched
    pub async fn unlink(&self, tenant: &TenantId, bug: &BugId, provider: ProviderType) -> Result<bool> {
        let _guard = self.inner.locks.acquire(SyncKey::bug(tenant, bug, provider)).await;
        self.ledger().unlink(tenant, bug, provider)
    }

    /// Check stored credentials against the provider
    pub async fn test_connection(&self, tenant: &TenantId, provider: ProviderType) -> Result<ConnectionCheck> {
        let (integration, adapter) = self.connected(tenant, provider)?;
        let Some(token) = self.vault().get_valid_access_token(tenant, provider).await? else {
            return Ok(ConnectionCheck::Failed {
                error: "credentials are no longer valid; reconnect the integration".to_string(),
            });
        };
        adapter.test_connection(&token, &integration.config).await
    }

    pub async fn list_projects(&self, tenant: &TenantId, provider: ProviderType) -> Result<Vec<NamedRef>> {
        let (integration, adapter) = self.connected(tenant, provider)?;
        let token = TokenScope::new(self.vault().clone()).require(tenant, provider).await?;
        adapter.list_projects(&token, &integration.config).await
    }

    pub async fn list_categories(
        &self,
        tenant: &TenantId,
        provider: ProviderType,
        project_id: &str,
    ) -> Result<Vec<NamedRef>> {
        let (integration, adapter) = self.connected(tenant, provider)?;
        let token = TokenScope::new(self.vault().clone()).require(tenant, provider).await?;
        adapter
            .list_categories(&token, &integration.config, project_id)
            .await
    }

    /// Stored integration (active or not) and its adapter
    fn connected(
        &self,
        tenant: &TenantId,
        provider: ProviderType,
    ) -> Result<(Integration, Arc<dyn ProviderAdapter>)> {
        let integration = self.vault().store().get(tenant, provider)?.ok_or_else(|| {
            BridgeError::not_configured(format!(
                "no {} integration for tenant {}",
                provider.display_name(),
                tenant
            ))
        })?;
        Ok((integration, self.adapters().get(provider)?))
    }
}

fn direction_error(integration: &Integration, operation: &str) -> BridgeError {
    BridgeError::not_configured(format!(
        "{} integration for tenant {} is {}-only; {} is disabled",
        integration.provider_type.display_name(),
        integration.tenant_id,
        integration.sync_direction,
        operation
    ))
}

fn known_priorities(mapping: &FieldMapping) -> Vec<String> {
    Severity::ALL
        .iter()
        .filter_map(|s| mapping.severity.forward(*s))
        .map(str::to_string)
        .collect()
}

/// Run `task` to completion even if the caller stops waiting
async fn run_to_completion<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(task)
        .await
        .map_err(|e| BridgeError::Other(format!("sync task did not complete: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::domain::BugSnapshot;
    use crate::integration::{BoardTarget, Credentials, IntegrationState, ProviderConfig, SyncDirection};
    use crate::providers::{CreatedItem, UpdateOutcome};
    use crate::vault::AccessToken;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryBugs {
        bugs: Mutex<HashMap<BugId, BugSnapshot>>,
        created: AtomicUsize,
    }

    impl MemoryBugs {
        fn put(&self, id: &str, snapshot: BugSnapshot) {
            self.bugs.lock().unwrap().insert(BugId::new(id), snapshot);
        }

        fn get(&self, id: &BugId) -> BugSnapshot {
            self.bugs.lock().unwrap()[id].clone()
        }
    }

    #[async_trait]
    impl BugStore for MemoryBugs {
        async fn get_bug_snapshot(&self, _tenant: &TenantId, bug: &BugId) -> Result<BugSnapshot> {
            self.bugs
                .lock()
                .unwrap()
                .get(bug)
                .cloned()
                .ok_or_else(|| BridgeError::BugNotFound(bug.to_string()))
        }

        async fn apply_external_update(&self, _tenant: &TenantId, bug: &BugId, update: &BugUpdate) -> Result<()> {
            let mut bugs = self.bugs.lock().unwrap();
            let snapshot = bugs
                .get_mut(bug)
                .ok_or_else(|| BridgeError::BugNotFound(bug.to_string()))?;
            if let Some(ref title) = update.title {
                snapshot.title = title.clone();
            }
            if let Some(ref description) = update.description {
                snapshot.description = Some(description.clone());
            }
            if let Some(status) = update.status {
                snapshot.status = status;
            }
            if let Some(severity) = update.severity {
                snapshot.severity = severity;
            }
            Ok(())
        }

        async fn create_bug(&self, _tenant: &TenantId, _project_id: &str, fields: &BugUpdate) -> Result<BugId> {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            let id = BugId::new(format!("pulled-{}", n));
            self.bugs.lock().unwrap().insert(
                id.clone(),
                BugSnapshot {
                    title: fields.title.clone().unwrap_or_default(),
                    description: fields.description.clone(),
                    status: fields.status.unwrap_or_default(),
                    severity: fields.severity.unwrap_or_default(),
                },
            );
            Ok(id)
        }
    }

    /// Board adapter keeping cards in memory
    #[derive(Default)]
    struct FakeBoard {
        cards: Mutex<HashMap<String, ExternalItem>>,
        creates: AtomicUsize,
        updates: Mutex<Vec<ItemPatch>>,
        fail_creates: AtomicBool,
    }

    impl FakeBoard {
        fn card(&self, id: &str) -> ExternalItem {
            self.cards.lock().unwrap()[id].clone()
        }

        fn seed(&self, id: &str, title: &str, list: &str, labels: &[&str]) {
            self.cards.lock().unwrap().insert(
                id.to_string(),
                ExternalItem {
                    external_id: id.to_string(),
                    title: title.to_string(),
                    description: String::new(),
                    mapped_status: Some(list.to_string()),
                    status_aliases: Vec::new(),
                    mapped_priority: None,
                    labels: labels.iter().map(|l| l.to_string()).collect(),
                    url: Some(format!("https://trello.example/c/{}", id)),
                    raw: serde_json::Value::Null,
                },
            );
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeBoard {
        fn provider_type(&self) -> ProviderType {
            ProviderType::Board
        }

        async fn list_projects(&self, _token: &AccessToken, _config: &ProviderConfig) -> Result<Vec<NamedRef>> {
            Ok(vec![NamedRef::new("board1", "Bugs")])
        }

        async fn list_categories(
            &self,
            _token: &AccessToken,
            _config: &ProviderConfig,
            _project_id: &str,
        ) -> Result<Vec<NamedRef>> {
            Ok(vec![NamedRef::new("list1", "Open"), NamedRef::new("list2", "Done")])
        }

        async fn create_item(
            &self,
            token: &AccessToken,
            _config: &ProviderConfig,
            item: &NewItem,
        ) -> Result<CreatedItem> {
            assert_eq!(token.secret(), "board-token");
            if self.fail_creates.load(Ordering::SeqCst) {
                return Err(BridgeError::ProviderApi {
                    status: 400,
                    body: "invalid list".to_string(),
                });
            }
            let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("card{}", n);
            self.cards.lock().unwrap().insert(
                id.clone(),
                ExternalItem {
                    external_id: id.clone(),
                    title: item.title.clone(),
                    description: item.description.clone().unwrap_or_default(),
                    mapped_status: item.mapped_status.clone(),
                    status_aliases: Vec::new(),
                    mapped_priority: None,
                    labels: item.mapped_priority.iter().cloned().collect(),
                    url: Some(format!("https://trello.example/c/{}", id)),
                    raw: serde_json::Value::Null,
                },
            );
            Ok(CreatedItem {
                url: Some(format!("https://trello.example/c/{}", id)),
                external_id: id,
            })
        }

        async fn update_item(
            &self,
            _token: &AccessToken,
            _config: &ProviderConfig,
            external_id: &str,
            patch: &ItemPatch,
        ) -> Result<UpdateOutcome> {
            self.updates.lock().unwrap().push(patch.clone());
            let mut cards = self.cards.lock().unwrap();
            let card = cards
                .get_mut(external_id)
                .ok_or_else(|| BridgeError::ProviderApi {
                    status: 404,
                    body: "card not found".to_string(),
                })?;
            if let Some(ref title) = patch.title {
                card.title = title.clone();
            }
            let status = match patch.mapped_status {
                Some(ref list) if card.mapped_status.as_deref() == Some(list) => StatusChange::Unchanged,
                Some(ref list) => {
                    card.mapped_status = Some(list.clone());
                    StatusChange::Applied { to: list.clone() }
                }
                None => StatusChange::NotRequested,
            };
            Ok(UpdateOutcome {
                fields_updated: patch.has_field_changes(),
                status,
            })
        }

        async fn get_item(
            &self,
            _token: &AccessToken,
            _config: &ProviderConfig,
            external_id: &str,
        ) -> Result<ExternalItem> {
            self.cards
                .lock()
                .unwrap()
                .get(external_id)
                .cloned()
                .ok_or_else(|| BridgeError::ProviderApi {
                    status: 404,
                    body: "card not found".to_string(),
                })
        }

        async fn test_connection(&self, token: &AccessToken, _config: &ProviderConfig) -> Result<ConnectionCheck> {
            Ok(ConnectionCheck::Ok {
                identity_label: format!("token {}", &token.secret()[..5]),
            })
        }
    }

    #[derive(Default)]
    struct RecordingAudit {
        events: Mutex<Vec<AuditEvent>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl AuditSink for RecordingAudit {
        async fn emit(&self, event: AuditEvent) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BridgeError::Other("audit offline".to_string()));
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// Sink whose delivery never finishes
    struct StalledAudit;

    #[async_trait]
    impl AuditSink for StalledAudit {
        async fn emit(&self, _event: AuditEvent) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Harness {
        coordinator: SyncCoordinator,
        bugs: Arc<MemoryBugs>,
        board: Arc<FakeBoard>,
        audit: Arc<RecordingAudit>,
        tenant: TenantId,
    }

    fn harness(direction: SyncDirection) -> Harness {
        harness_with_sink(direction, None)
    }

    /// `sink` replaces the recording audit sink when given
    fn harness_with_sink(direction: SyncDirection, sink: Option<Arc<dyn AuditSink>>) -> Harness {
        let db = Arc::new(Database::in_memory().unwrap());
        let cipher = Arc::new(SecretCipher::new(&[7u8; 32]).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let store = IntegrationStore::new(db.clone(), cipher, clock.clone());
        let tenant = TenantId::new("acme");

        let now = clock.now();
        store
            .save(&Integration {
                tenant_id: tenant.clone(),
                provider_type: ProviderType::Board,
                is_active: true,
                state: IntegrationState::Connected,
                credentials: Credentials::static_token("board-token"),
                config: ProviderConfig::Board(BoardTarget {
                    board_id: "board1".to_string(),
                    default_list_id: None,
                }),
                sync_direction: direction,
                created_at: now,
                updated_at: now,
            })
            .unwrap();

        let mappings = MappingStore::new(db.clone(), clock.clone());
        mappings
            .replace(
                &tenant,
                ProviderType::Board,
                &FieldMapping::new()
                    .with_status(Status::Open, "list1")
                    .with_status(Status::Resolved, "list2")
                    .with_severity(Severity::High, "label-high")
                    .with_severity(Severity::Medium, "label-med"),
            )
            .unwrap();

        let bugs = Arc::new(MemoryBugs::default());
        let board = Arc::new(FakeBoard::default());
        let audit = Arc::new(RecordingAudit::default());
        let coordinator = SyncCoordinator::new(SyncServices {
            vault: Arc::new(TokenVault::new(store, clock.clone(), chrono::Duration::minutes(5))),
            adapters: AdapterRegistry::new().with(board.clone()),
            mappings,
            mapper: FieldMapper::default(),
            ledger: ExternalIdLedger::new(db, clock.clone()),
            bugs: bugs.clone(),
            audit: sink.unwrap_or_else(|| audit.clone() as Arc<dyn AuditSink>),
            clock,
        });

        Harness {
            coordinator,
            bugs,
            board,
            audit,
            tenant,
        }
    }

    fn bug(title: &str, status: Status, severity: Severity) -> BugSnapshot {
        BugSnapshot {
            title: title.to_string(),
            description: Some("steps".to_string()),
            status,
            severity,
        }
    }

    #[tokio::test]
    async fn test_first_push_creates_then_updates() {
        let h = harness(SyncDirection::Both);
        h.bugs.put("bug-1", bug("Crash on save", Status::Open, Severity::High));
        let id = BugId::new("bug-1");

        let first = h.coordinator.push(&h.tenant, &id, ProviderType::Board).await.unwrap();
        assert_eq!(first.action, SyncAction::Created);
        assert_eq!(first.external_id, "card1");
        assert!(first.warnings.is_empty());
        let card = h.board.card("card1");
        assert_eq!(card.mapped_status.as_deref(), Some("list1"));
        assert_eq!(card.labels, vec!["label-high".to_string()]);

        h.bugs.put("bug-1", bug("Crash on save (v2)", Status::Resolved, Severity::High));
        let second = h.coordinator.push(&h.tenant, &id, ProviderType::Board).await.unwrap();
        assert_eq!(second.action, SyncAction::Updated);
        assert_eq!(second.external_id, "card1");
        assert_eq!(h.board.creates.load(Ordering::SeqCst), 1);
        assert_eq!(h.board.card("card1").title, "Crash on save (v2)");
        assert_eq!(h.board.card("card1").mapped_status.as_deref(), Some("list2"));

        let patch = h.board.updates.lock().unwrap()[0].clone();
        assert_eq!(patch.mapped_priority.as_deref(), Some("label-high"));
        assert_eq!(patch.known_priorities.len(), 2);

        let events = h.audit.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.operation == SyncOperation::Push));
    }

    #[tokio::test]
    async fn test_unmapped_status_on_update_is_skipped() {
        let h = harness(SyncDirection::Both);
        h.bugs.put("bug-1", bug("Flaky test", Status::Open, Severity::Medium));
        let id = BugId::new("bug-1");
        h.coordinator.push(&h.tenant, &id, ProviderType::Board).await.unwrap();

        h.bugs.put("bug-1", bug("Flaky test", Status::InProgress, Severity::Medium));
        let result = h.coordinator.push(&h.tenant, &id, ProviderType::Board).await.unwrap();

        assert_eq!(result.action, SyncAction::Updated);
        assert!(matches!(
            result.warnings.as_slice(),
            [SyncWarning::StatusSkipped { requested, .. }] if requested == "in_progress"
        ));
        assert_eq!(h.board.card("card1").mapped_status.as_deref(), Some("list1"));
    }

    #[tokio::test]
    async fn test_unmapped_severity_defaults_with_warning() {
        let h = harness(SyncDirection::Both);
        h.bugs.put("bug-1", bug("Typo", Status::Open, Severity::Low));

        let result = h
            .coordinator
            .push(&h.tenant, &BugId::new("bug-1"), ProviderType::Board)
            .await
            .unwrap();
        assert_eq!(
            result.warnings,
            vec![SyncWarning::MappingDefaulted {
                kind: MappingKind::Severity,
                value: "low".to_string(),
            }]
        );
        assert_eq!(h.board.card("card1").labels, vec!["label-med".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_link() {
        let h = harness(SyncDirection::Both);
        h.bugs.put("bug-1", bug("Crash", Status::Open, Severity::High));
        h.board.fail_creates.store(true, Ordering::SeqCst);
        let id = BugId::new("bug-1");

        let err = h.coordinator.push(&h.tenant, &id, ProviderType::Board).await.unwrap_err();
        assert_eq!(err.provider, ProviderType::Board);
        assert_eq!(err.bug_id, Some(id.clone()));
        assert!(matches!(err.source, BridgeError::ProviderApi { status: 400, .. }));
        assert!(h.coordinator.links_for_bug(&h.tenant, &id).unwrap().is_empty());
        assert!(h.audit.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_direction_is_enforced() {
        let h = harness(SyncDirection::Pull);
        h.bugs.put("bug-1", bug("Crash", Status::Open, Severity::High));

        let err = h
            .coordinator
            .push(&h.tenant, &BugId::new("bug-1"), ProviderType::Board)
            .await
            .unwrap_err();
        assert!(matches!(err.source, BridgeError::IntegrationNotConfigured(_)));
        assert_eq!(h.board.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_bug_and_missing_integration() {
        let h = harness(SyncDirection::Both);
        let err = h
            .coordinator
            .push(&h.tenant, &BugId::new("nope"), ProviderType::Board)
            .await
            .unwrap_err();
        assert!(matches!(err.source, BridgeError::BugNotFound(_)));

        h.bugs.put("bug-1", bug("Crash", Status::Open, Severity::High));
        let err = h
            .coordinator
            .push(&h.tenant, &BugId::new("bug-1"), ProviderType::IssueTracker)
            .await
            .unwrap_err();
        assert!(matches!(err.source, BridgeError::IntegrationNotConfigured(_)));
    }

    #[tokio::test]
    async fn test_concurrent_first_pushes_create_once() {
        let h = Arc::new(harness(SyncDirection::Both));
        h.bugs.put("bug-1", bug("Race", Status::Open, Severity::High));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let h = h.clone();
                tokio::spawn(async move {
                    h.coordinator
                        .push(&h.tenant, &BugId::new("bug-1"), ProviderType::Board)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().action == SyncAction::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(h.board.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pull_creates_then_updates_idempotently() {
        let h = harness(SyncDirection::Both);
        h.board.seed("c9", "Imported", "list2", &["label-high"]);

        let first = h.coordinator.pull(&h.tenant, ProviderType::Board, "c9", "proj-1").await.unwrap();
        assert_eq!(first.action, SyncAction::Created);
        let pulled = h.bugs.get(&first.bug_id);
        assert_eq!(pulled.status, Status::Resolved);
        assert_eq!(pulled.severity, Severity::High);

        let second = h.coordinator.pull(&h.tenant, ProviderType::Board, "c9", "proj-1").await.unwrap();
        assert_eq!(second.action, SyncAction::Updated);
        assert_eq!(second.bug_id, first.bug_id);
        assert_eq!(h.bugs.get(&first.bug_id), pulled);
        assert_eq!(h.bugs.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pull_of_unlinked_item_needs_project() {
        let h = harness(SyncDirection::Both);
        h.board.seed("c9", "Imported", "list1", &[]);

        let err = h.coordinator.pull(&h.tenant, ProviderType::Board, "c9", " ").await.unwrap_err();
        assert_eq!(err.external_id.as_deref(), Some("c9"));
        assert!(matches!(err.source, BridgeError::IntegrationNotConfigured(_)));
    }

    #[tokio::test]
    async fn test_pull_defaults_unknown_values() {
        let h = harness(SyncDirection::Both);
        h.board.seed("c9", "Imported", "list-unknown", &["other"]);

        let result = h.coordinator.pull(&h.tenant, ProviderType::Board, "c9", "proj-1").await.unwrap();
        assert_eq!(result.warnings.len(), 2);
        let pulled = h.bugs.get(&result.bug_id);
        assert_eq!(pulled.status, Status::Open);
        assert_eq!(pulled.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_sync() {
        let h = harness(SyncDirection::Both);
        h.audit.fail.store(true, Ordering::SeqCst);
        h.bugs.put("bug-1", bug("Crash", Status::Open, Severity::High));

        let result = h
            .coordinator
            .push(&h.tenant, &BugId::new("bug-1"), ProviderType::Board)
            .await
            .unwrap();
        assert_eq!(result.action, SyncAction::Created);
    }

    #[tokio::test]
    async fn test_stalled_audit_sink_does_not_block_sync() {
        let mut h = harness_with_sink(SyncDirection::Both, Some(Arc::new(StalledAudit)));
        h.coordinator = h.coordinator.with_audit_wait(Duration::from_millis(50));
        h.bugs.put("bug-1", bug("Crash", Status::Open, Severity::High));
        let id = BugId::new("bug-1");

        let pushed = tokio::time::timeout(
            Duration::from_secs(2),
            h.coordinator.push(&h.tenant, &id, ProviderType::Board),
        )
        .await
        .expect("push waited on the audit sink")
        .unwrap();
        assert_eq!(pushed.action, SyncAction::Created);
        assert_eq!(h.board.creates.load(Ordering::SeqCst), 1);
        assert_eq!(h.coordinator.links_for_bug(&h.tenant, &id).unwrap().len(), 1);

        let pulled = tokio::time::timeout(
            Duration::from_secs(2),
            h.coordinator.pull(&h.tenant, ProviderType::Board, "card1", "proj-1"),
        )
        .await
        .expect("pull waited on the audit sink")
        .unwrap();
        assert_eq!(pulled.action, SyncAction::Updated);
        assert_eq!(pulled.bug_id, id);
    }

    #[tokio::test]
    async fn test_pull_resolves_status_through_alias() {
        let h = harness(SyncDirection::Both);
        h.board.seed("c9", "Imported", "Done", &["label-high"]);
        // The mapping knows the status by its id only
        h.board.cards.lock().unwrap().get_mut("c9").unwrap().status_aliases = vec!["list2".to_string()];

        let result = h.coordinator.pull(&h.tenant, ProviderType::Board, "c9", "proj-1").await.unwrap();
        assert!(result.warnings.is_empty());
        assert_eq!(h.bugs.get(&result.bug_id).status, Status::Resolved);
    }

    #[tokio::test]
    async fn test_unlink_during_pull_imports_new_bug() {
        let h = Arc::new(harness(SyncDirection::Both));
        h.bugs.put("bug-1", bug("Crash", Status::Open, Severity::High));
        let id = BugId::new("bug-1");
        let pushed = h.coordinator.push(&h.tenant, &id, ProviderType::Board).await.unwrap();

        // Hold the bug key so the pull stops between its link lookup and the update
        let held = h
            .coordinator
            .inner
            .locks
            .acquire(SyncKey::bug(&h.tenant, &id, ProviderType::Board))
            .await;
        let pull = {
            let h = h.clone();
            let external_id = pushed.external_id.clone();
            tokio::spawn(async move {
                h.coordinator
                    .pull(&h.tenant, ProviderType::Board, &external_id, "proj-1")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.coordinator.ledger().unlink(&h.tenant, &id, ProviderType::Board).unwrap());
        drop(held);

        let result = pull.await.unwrap().unwrap();
        assert_eq!(result.action, SyncAction::Created);
        assert_ne!(result.bug_id, id);
        assert!(h.coordinator.links_for_bug(&h.tenant, &id).unwrap().is_empty());
        assert_eq!(h.coordinator.links_for_bug(&h.tenant, &result.bug_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unlink_then_push_creates_again() {
        let h = harness(SyncDirection::Both);
        h.bugs.put("bug-1", bug("Crash", Status::Open, Severity::High));
        let id = BugId::new("bug-1");
        h.coordinator.push(&h.tenant, &id, ProviderType::Board).await.unwrap();

        assert!(h.coordinator.unlink(&h.tenant, &id, ProviderType::Board).await.unwrap());
        let result = h.coordinator.push(&h.tenant, &id, ProviderType::Board).await.unwrap();
        assert_eq!(result.action, SyncAction::Created);
        assert_eq!(result.external_id, "card2");
    }

    #[tokio::test]
    async fn test_connection_and_listing() {
        let h = harness(SyncDirection::Both);
        let check = h.coordinator.test_connection(&h.tenant, ProviderType::Board).await.unwrap();
        assert_eq!(
            check,
            ConnectionCheck::Ok {
                identity_label: "token board".to_string()
            }
        );
        let projects = h.coordinator.list_projects(&h.tenant, ProviderType::Board).await.unwrap();
        assert_eq!(projects[0].id, "board1");
        let lists = h
            .coordinator
            .list_categories(&h.tenant, ProviderType::Board, "board1")
            .await
            .unwrap();
        assert_eq!(lists.len(), 2);
    }

    #[tokio::test]
    async fn test_push_all_reports_each_bug() {
        let h = harness(SyncDirection::Both);
        h.bugs.put("bug-1", bug("One", Status::Open, Severity::High));
        let results = h
            .coordinator
            .push_all(
                &h.tenant,
                &[BugId::new("bug-1"), BugId::new("missing")],
                ProviderType::Board,
            )
            .await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ref e) if matches!(e.source, BridgeError::BugNotFound(_))));
    }
}
