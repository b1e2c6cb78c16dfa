//! Local bug <-> external item associations
//!
//! A bug has at most one external item per provider, and an external item
//! belongs to at most one bug per tenant. Both are enforced by the
//! `external_links` table constraints.

use crate::clock::Clock;
use crate::domain::{BugId, ProviderType, TenantId};
use crate::store::Database;
use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalLink {
    pub tenant_id: TenantId,
    pub bug_id: BugId,
    pub provider_type: ProviderType,
    /// Provider-assigned id (issue key, card id, work item number)
    pub external_id: String,
    pub external_url: Option<String>,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

const LINK_COLUMNS: &str =
    "tenant_id, bug_id, provider_type, external_id, external_url, last_synced_at, created_at";

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<ExternalLink> {
    let provider: String = row.get(2)?;
    let provider_type = provider.parse::<ProviderType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ExternalLink {
        tenant_id: TenantId::new(row.get::<_, String>(0)?),
        bug_id: BugId::new(row.get::<_, String>(1)?),
        provider_type,
        external_id: row.get(3)?,
        external_url: row.get(4)?,
        last_synced_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Persisted external links
pub struct ExternalIdLedger {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl ExternalIdLedger {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn find(&self, tenant: &TenantId, bug: &BugId, provider: ProviderType) -> Result<Option<ExternalLink>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM external_links
                         WHERE tenant_id = ?1 AND bug_id = ?2 AND provider_type = ?3",
                        LINK_COLUMNS
                    ),
                    params![tenant.as_str(), bug.as_str(), provider.as_str()],
                    link_from_row,
                )
                .optional()?)
        })
    }

    pub fn find_by_external(
        &self,
        tenant: &TenantId,
        provider: ProviderType,
        external_id: &str,
    ) -> Result<Option<ExternalLink>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM external_links
                         WHERE tenant_id = ?1 AND provider_type = ?2 AND external_id = ?3",
                        LINK_COLUMNS
                    ),
                    params![tenant.as_str(), provider.as_str(), external_id],
                    link_from_row,
                )
                .optional()?)
        })
    }

    /// Record a new link; fails if the bug or the external item is already linked
    pub fn insert(
        &self,
        tenant: &TenantId,
        bug: &BugId,
        provider: ProviderType,
        external_id: &str,
        external_url: Option<&str>,
    ) -> Result<ExternalLink> {
        let now = self.clock.now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO external_links
                 (tenant_id, bug_id, provider_type, external_id, external_url, last_synced_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    tenant.as_str(),
                    bug.as_str(),
                    provider.as_str(),
                    external_id,
                    external_url,
                    now
                ],
            )?;
            Ok(())
        })?;

        tracing::info!(tenant = %tenant, bug = %bug, provider = %provider, external_id = %external_id, "Linked bug to external item");
        Ok(ExternalLink {
            tenant_id: tenant.clone(),
            bug_id: bug.clone(),
            provider_type: provider,
            external_id: external_id.to_string(),
            external_url: external_url.map(str::to_string),
            last_synced_at: now,
            created_at: now,
        })
    }

    /// Stamp a successful sync; a `Some` url replaces the stored one
    ///
    /// Returns `false` if the link no longer exists.
    pub fn touch(
        &self,
        tenant: &TenantId,
        bug: &BugId,
        provider: ProviderType,
        external_url: Option<&str>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let updated = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE external_links
                 SET last_synced_at = ?4, external_url = COALESCE(?5, external_url)
                 WHERE tenant_id = ?1 AND bug_id = ?2 AND provider_type = ?3",
                params![tenant.as_str(), bug.as_str(), provider.as_str(), now, external_url],
            )?)
        })?;
        Ok(updated > 0)
    }

    /// All links of one bug, ordered by provider
    pub fn list_for_bug(&self, tenant: &TenantId, bug: &BugId) -> Result<Vec<ExternalLink>> {
        self.query_many(
            "WHERE tenant_id = ?1 AND bug_id = ?2 ORDER BY provider_type",
            &[tenant.as_str(), bug.as_str()],
        )
    }

    /// All links of a tenant, optionally for one provider
    pub fn list(&self, tenant: &TenantId, provider: Option<ProviderType>) -> Result<Vec<ExternalLink>> {
        match provider {
            Some(p) => self.query_many(
                "WHERE tenant_id = ?1 AND provider_type = ?2 ORDER BY bug_id",
                &[tenant.as_str(), p.as_str()],
            ),
            None => self.query_many(
                "WHERE tenant_id = ?1 ORDER BY bug_id, provider_type",
                &[tenant.as_str()],
            ),
        }
    }

    /// Forget a link; the external item itself is left alone
    pub fn unlink(&self, tenant: &TenantId, bug: &BugId, provider: ProviderType) -> Result<bool> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM external_links
                 WHERE tenant_id = ?1 AND bug_id = ?2 AND provider_type = ?3",
                params![tenant.as_str(), bug.as_str(), provider.as_str()],
            )?)
        })?;
        if deleted > 0 {
            tracing::info!(tenant = %tenant, bug = %bug, provider = %provider, "Unlinked external item");
        }
        Ok(deleted > 0)
    }

    fn query_many(&self, clause: &str, args: &[&str]) -> Result<Vec<ExternalLink>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {} FROM external_links {}", LINK_COLUMNS, clause))?;
            let links = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), link_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(links)
        })
    }
}
