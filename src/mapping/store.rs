//! Persistence for field mappings
//!
//! One row per dictionary entry in `field_mapping_entries`, plus a version row
//! per (tenant, provider) in `field_mapping_versions`.

use super::{Dictionary, FieldMapping, MappingKind, Vocabulary};
use crate::clock::Clock;
use crate::domain::{ProviderType, TenantId};
use crate::store::Database;
use crate::Result;
use rusqlite::{params, OptionalExtension, Transaction};
use std::sync::Arc;

const FORWARD: &str = "forward";
const REVERSE: &str = "reverse";

/// Loads and replaces per-tenant, per-provider mappings
pub struct MappingStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl MappingStore {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Load the mapping; an empty mapping (version 0) when none is stored
    pub fn load(&self, tenant: &TenantId, provider: ProviderType) -> Result<FieldMapping> {
        self.db.with_conn(|conn| {
            let version: Option<i64> = conn
                .query_row(
                    "SELECT version FROM field_mapping_versions
                     WHERE tenant_id = ?1 AND provider_type = ?2",
                    params![tenant.as_str(), provider.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            let mut stmt = conn.prepare(
                "SELECT kind, direction, lookup_key, value FROM field_mapping_entries
                 WHERE tenant_id = ?1 AND provider_type = ?2",
            )?;
            let rows = stmt
                .query_map(params![tenant.as_str(), provider.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut mapping = FieldMapping {
                version: version.unwrap_or(0),
                ..FieldMapping::default()
            };

            for (kind, direction, key, value) in rows {
                match kind.parse::<MappingKind>() {
                    Ok(MappingKind::Status) => {
                        load_entry(&mut mapping.status, &direction, key, value)
                    }
                    Ok(MappingKind::Severity) => {
                        load_entry(&mut mapping.severity, &direction, key, value)
                    }
                    Err(_) => {
                        tracing::warn!(tenant = %tenant, provider = %provider, kind = %kind, "Ignoring mapping row of unknown kind");
                    }
                }
            }

            tracing::debug!(
                tenant = %tenant,
                provider = %provider,
                version = mapping.version,
                "Loaded field mapping"
            );
            Ok(mapping)
        })
    }

    /// Replace every entry and bump the version, atomically
    ///
    /// Returns the new version.
    pub fn replace(
        &self,
        tenant: &TenantId,
        provider: ProviderType,
        mapping: &FieldMapping,
    ) -> Result<i64> {
        let now = self.clock.now();
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "DELETE FROM field_mapping_entries WHERE tenant_id = ?1 AND provider_type = ?2",
                params![tenant.as_str(), provider.as_str()],
            )?;

            write_dictionary(&tx, tenant, provider, &mapping.status)?;
            write_dictionary(&tx, tenant, provider, &mapping.severity)?;

            tx.execute(
                "INSERT INTO field_mapping_versions (tenant_id, provider_type, version, updated_at)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(tenant_id, provider_type)
                 DO UPDATE SET version = version + 1, updated_at = excluded.updated_at",
                params![tenant.as_str(), provider.as_str(), now],
            )?;

            let version: i64 = tx.query_row(
                "SELECT version FROM field_mapping_versions
                 WHERE tenant_id = ?1 AND provider_type = ?2",
                params![tenant.as_str(), provider.as_str()],
                |row| row.get(0),
            )?;

            tx.commit()?;

            tracing::info!(tenant = %tenant, provider = %provider, version, "Field mapping replaced");
            Ok(version)
        })
    }
}

fn load_entry<T: Vocabulary>(dict: &mut Dictionary<T>, direction: &str, key: String, value: String) {
    match direction {
        FORWARD => match key.parse::<T>() {
            Ok(internal) => {
                dict.forward.insert(internal, value);
            }
            Err(_) => tracing::warn!(kind = %T::KIND, key = %key, "Ignoring forward mapping for unknown value"),
        },
        REVERSE => match value.parse::<T>() {
            Ok(internal) => {
                dict.reverse.insert(key, internal);
            }
            Err(_) => tracing::warn!(kind = %T::KIND, value = %value, "Ignoring reverse mapping to unknown value"),
        },
        other => tracing::warn!(direction = %other, "Ignoring mapping row with unknown direction"),
    }
}

fn write_dictionary<T: Vocabulary>(
    tx: &Transaction<'_>,
    tenant: &TenantId,
    provider: ProviderType,
    dict: &Dictionary<T>,
) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO field_mapping_entries
         (tenant_id, provider_type, kind, direction, lookup_key, value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;

    for (internal, external) in &dict.forward {
        stmt.execute(params![
            tenant.as_str(),
            provider.as_str(),
            T::KIND.as_str(),
            FORWARD,
            internal.to_string(),
            external,
        ])?;
    }
    for (external, internal) in &dict.reverse {
        stmt.execute(params![
            tenant.as_str(),
            provider.as_str(),
            T::KIND.as_str(),
            REVERSE,
            external,
            internal.to_string(),
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::domain::{Severity, Status};

    fn store() -> MappingStore {
        MappingStore::new(
            Arc::new(Database::in_memory().unwrap()),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn test_load_empty() {
        let store = store();
        let mapping = store
            .load(&TenantId::new("t1"), ProviderType::IssueTracker)
            .unwrap();
        assert_eq!(mapping.version, 0);
        assert!(mapping.status.is_empty());
        assert!(mapping.severity.is_empty());
    }

    #[test]
    fn test_replace_and_load() {
        let store = store();
        let tenant = TenantId::new("t1");
        let mut mapping = FieldMapping::new()
            .with_severity(Severity::High, "2")
            .with_severity(Severity::Medium, "3")
            .with_status(Status::Open, "To Do");
        mapping.status.insert_reverse("Backlog", Status::Open);

        let version = store
            .replace(&tenant, ProviderType::IssueTracker, &mapping)
            .unwrap();
        assert_eq!(version, 1);

        let loaded = store.load(&tenant, ProviderType::IssueTracker).unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.severity, mapping.severity);
        assert_eq!(loaded.status.reverse("Backlog"), Some(Status::Open));
        assert_eq!(loaded.status.forward(Status::Open), Some("To Do"));
    }

    #[test]
    fn test_replace_bumps_version_and_drops_old_rows() {
        let store = store();
        let tenant = TenantId::new("t1");

        let first = FieldMapping::new().with_status(Status::Open, "list1");
        store.replace(&tenant, ProviderType::Board, &first).unwrap();

        let second = FieldMapping::new().with_status(Status::Resolved, "list2");
        let version = store.replace(&tenant, ProviderType::Board, &second).unwrap();
        assert_eq!(version, 2);

        let loaded = store.load(&tenant, ProviderType::Board).unwrap();
        assert_eq!(loaded.status.forward(Status::Open), None);
        assert_eq!(loaded.status.forward(Status::Resolved), Some("list2"));
    }

    #[test]
    fn test_mappings_are_scoped_per_tenant_and_provider() {
        let store = store();
        let mapping = FieldMapping::new().with_severity(Severity::Low, "4");
        store
            .replace(&TenantId::new("t1"), ProviderType::IssueTracker, &mapping)
            .unwrap();

        assert!(store
            .load(&TenantId::new("t2"), ProviderType::IssueTracker)
            .unwrap()
            .severity
            .is_empty());
        assert!(store
            .load(&TenantId::new("t1"), ProviderType::WorkItem)
            .unwrap()
            .severity
            .is_empty());
    }
}
