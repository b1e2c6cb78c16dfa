//! SQLite persistence for integrations and pending OAuth handshakes

use super::{
    Credentials, Integration, IntegrationState, IntegrationSummary, ProviderConfig, SyncDirection,
};
use crate::clock::Clock;
use crate::domain::{ProviderType, TenantId};
use crate::store::Database;
use crate::vault::SecretCipher;
use crate::{BridgeError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

/// An authorization-code handshake waiting for its callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHandshake {
    /// Opaque nonce sent as the OAuth `state` parameter
    pub state: String,
    pub tenant_id: TenantId,
    pub provider_type: ProviderType,
    pub config: ProviderConfig,
    pub sync_direction: SyncDirection,
    pub created_at: DateTime<Utc>,
}

/// Raw integration row before decryption and parsing
struct IntegrationRow {
    tenant_id: String,
    provider_type: String,
    is_active: bool,
    state: String,
    credentials: String,
    provider_config: String,
    sync_direction: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl IntegrationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tenant_id: row.get(0)?,
            provider_type: row.get(1)?,
            is_active: row.get(2)?,
            state: row.get(3)?,
            credentials: row.get(4)?,
            provider_config: row.get(5)?,
            sync_direction: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

const INTEGRATION_COLUMNS: &str = "tenant_id, provider_type, is_active, state, credentials, \
     provider_config, sync_direction, created_at, updated_at";

/// Integration records with credentials sealed by [`SecretCipher`]
pub struct IntegrationStore {
    db: Arc<Database>,
    cipher: Arc<SecretCipher>,
    clock: Arc<dyn Clock>,
}

impl IntegrationStore {
    pub fn new(db: Arc<Database>, cipher: Arc<SecretCipher>, clock: Arc<dyn Clock>) -> Self {
        Self { db, cipher, clock }
    }

    /// Load and decrypt one integration
    pub fn get(&self, tenant: &TenantId, provider: ProviderType) -> Result<Option<Integration>> {
        let row = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM integrations WHERE tenant_id = ?1 AND provider_type = ?2",
                        INTEGRATION_COLUMNS
                    ),
                    params![tenant.as_str(), provider.as_str()],
                    IntegrationRow::from_row,
                )
                .optional()?)
        })?;

        row.map(|row| self.decode(row)).transpose()
    }

    /// Current state without touching credentials
    pub fn state(&self, tenant: &TenantId, provider: ProviderType) -> Result<Option<IntegrationState>> {
        let state: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT state FROM integrations WHERE tenant_id = ?1 AND provider_type = ?2",
                    params![tenant.as_str(), provider.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        state.map(|s| s.parse()).transpose()
    }

    /// Insert or fully replace an integration (keeps the original `created_at`)
    pub fn save(&self, integration: &Integration) -> Result<()> {
        let sealed = self.seal(
            &integration.tenant_id,
            integration.provider_type,
            &integration.credentials,
        )?;
        let config = serde_json::to_string(&integration.config)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO integrations
                 (tenant_id, provider_type, is_active, state, credentials, provider_config,
                  sync_direction, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(tenant_id, provider_type) DO UPDATE SET
                    is_active = excluded.is_active,
                    state = excluded.state,
                    credentials = excluded.credentials,
                    provider_config = excluded.provider_config,
                    sync_direction = excluded.sync_direction,
                    updated_at = excluded.updated_at",
                params![
                    integration.tenant_id.as_str(),
                    integration.provider_type.as_str(),
                    integration.is_active,
                    integration.state.as_str(),
                    sealed,
                    config,
                    integration.sync_direction.as_str(),
                    integration.created_at,
                    integration.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Replace credentials and state in one statement
    ///
    /// Returns `false` when the integration no longer exists (disconnected
    /// while a refresh was in flight).
    pub fn update_credentials(
        &self,
        tenant: &TenantId,
        provider: ProviderType,
        credentials: &Credentials,
        state: IntegrationState,
    ) -> Result<bool> {
        let sealed = self.seal(tenant, provider, credentials)?;
        let now = self.clock.now();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE integrations SET credentials = ?3, state = ?4, updated_at = ?5
                 WHERE tenant_id = ?1 AND provider_type = ?2",
                params![tenant.as_str(), provider.as_str(), sealed, state.as_str(), now],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_state(
        &self,
        tenant: &TenantId,
        provider: ProviderType,
        state: IntegrationState,
    ) -> Result<bool> {
        let now = self.clock.now();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE integrations SET state = ?3, updated_at = ?4
                 WHERE tenant_id = ?1 AND provider_type = ?2",
                params![tenant.as_str(), provider.as_str(), state.as_str(), now],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn update_settings(
        &self,
        tenant: &TenantId,
        provider: ProviderType,
        config: &ProviderConfig,
        direction: SyncDirection,
    ) -> Result<bool> {
        let config = serde_json::to_string(config)?;
        let now = self.clock.now();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE integrations SET provider_config = ?3, sync_direction = ?4, updated_at = ?5
                 WHERE tenant_id = ?1 AND provider_type = ?2",
                params![
                    tenant.as_str(),
                    provider.as_str(),
                    config,
                    direction.as_str(),
                    now
                ],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_active(&self, tenant: &TenantId, provider: ProviderType, active: bool) -> Result<bool> {
        let now = self.clock.now();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE integrations SET is_active = ?3, updated_at = ?4
                 WHERE tenant_id = ?1 AND provider_type = ?2",
                params![tenant.as_str(), provider.as_str(), active, now],
            )?;
            Ok(changed > 0)
        })
    }

    /// Delete the row and its credentials; returns whether a row existed
    pub fn delete(&self, tenant: &TenantId, provider: ProviderType) -> Result<bool> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM integrations WHERE tenant_id = ?1 AND provider_type = ?2",
                params![tenant.as_str(), provider.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    /// All stored integrations of a tenant, as summaries
    pub fn list(&self, tenant: &TenantId) -> Result<Vec<IntegrationSummary>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM integrations WHERE tenant_id = ?1 ORDER BY provider_type",
                INTEGRATION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![tenant.as_str()], IntegrationRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|row| self.decode(row).map(|integration| integration.summary()))
            .collect()
    }

    /// Record a handshake; replaces earlier pending handshakes for the same integration
    pub fn insert_pending(&self, pending: &PendingHandshake) -> Result<()> {
        let config = serde_json::to_string(&pending.config)?;
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM oauth_pending WHERE tenant_id = ?1 AND provider_type = ?2",
                params![pending.tenant_id.as_str(), pending.provider_type.as_str()],
            )?;
            tx.execute(
                "INSERT INTO oauth_pending
                 (state, tenant_id, provider_type, provider_config, sync_direction, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    pending.state,
                    pending.tenant_id.as_str(),
                    pending.provider_type.as_str(),
                    config,
                    pending.sync_direction.as_str(),
                    pending.created_at,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Remove and return the handshake for `state`, if any
    pub fn take_pending(&self, state: &str) -> Result<Option<PendingHandshake>> {
        let row = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let row = tx
                .query_row(
                    "SELECT state, tenant_id, provider_type, provider_config, sync_direction, created_at
                     FROM oauth_pending WHERE state = ?1",
                    params![state],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, DateTime<Utc>>(5)?,
                        ))
                    },
                )
                .optional()?;
            if row.is_some() {
                tx.execute("DELETE FROM oauth_pending WHERE state = ?1", params![state])?;
            }
            tx.commit()?;
            Ok(row)
        })?;

        let Some((state, tenant, provider, config, direction, created_at)) = row else {
            return Ok(None);
        };

        Ok(Some(PendingHandshake {
            state,
            tenant_id: TenantId::new(tenant),
            provider_type: provider.parse()?,
            config: serde_json::from_str(&config)?,
            sync_direction: direction.parse()?,
            created_at,
        }))
    }

    /// Whether a handshake newer than `since` is in flight
    pub fn has_pending(
        &self,
        tenant: &TenantId,
        provider: ProviderType,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM oauth_pending
                 WHERE tenant_id = ?1 AND provider_type = ?2 AND created_at >= ?3",
                params![tenant.as_str(), provider.as_str(), since],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Drop handshakes created before `before`
    pub fn purge_pending(&self, before: DateTime<Utc>) -> Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM oauth_pending WHERE created_at < ?1",
                params![before],
            )?)
        })
    }

    fn aad(tenant: &TenantId, provider: ProviderType) -> String {
        format!("{}:{}", tenant, provider)
    }

    fn seal(&self, tenant: &TenantId, provider: ProviderType, credentials: &Credentials) -> Result<String> {
        let json = serde_json::to_string(credentials)?;
        self.cipher.seal(&json, &Self::aad(tenant, provider))
    }

    fn decode(&self, row: IntegrationRow) -> Result<Integration> {
        let tenant_id = TenantId::new(row.tenant_id);
        let provider_type: ProviderType = row.provider_type.parse()?;

        let json = self
            .cipher
            .open(&row.credentials, &Self::aad(&tenant_id, provider_type))?;
        let credentials: Credentials = serde_json::from_str(&json)?;

        let config: ProviderConfig = serde_json::from_str(&row.provider_config).map_err(|e| {
            BridgeError::not_configured(format!(
                "stored {} configuration is invalid: {}",
                provider_type, e
            ))
        })?;

        Ok(Integration {
            tenant_id,
            provider_type,
            is_active: row.is_active,
            state: row.state.parse()?,
            credentials,
            config,
            sync_direction: row.sync_direction.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::integration::BoardTarget;

    fn store() -> (IntegrationStore, Arc<Database>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let cipher =
            Arc::new(SecretCipher::from_base64_key(&SecretCipher::generate_key().unwrap()).unwrap());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        (IntegrationStore::new(db.clone(), cipher, clock), db)
    }

    fn board_integration(tenant: &str) -> Integration {
        let now = Utc::now();
        Integration {
            tenant_id: TenantId::new(tenant),
            provider_type: ProviderType::Board,
            is_active: true,
            state: IntegrationState::Connected,
            credentials: Credentials::static_token("trello-token"),
            config: ProviderConfig::Board(BoardTarget {
                board_id: "b1".to_string(),
                default_list_id: None,
            }),
            sync_direction: SyncDirection::Both,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_save_and_get() {
        let (store, db) = store();
        store.save(&board_integration("t1")).unwrap();

        let loaded = store
            .get(&TenantId::new("t1"), ProviderType::Board)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.credentials.access_token, "trello-token");
        assert_eq!(loaded.state, IntegrationState::Connected);

        // The token is not stored in the clear
        let raw: String = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT credentials FROM integrations", [], |row| row.get(0))?)
            })
            .unwrap();
        assert!(!raw.contains("trello-token"));
    }

    #[test]
    fn test_one_row_per_tenant_and_provider() {
        let (store, _db) = store();
        store.save(&board_integration("t1")).unwrap();

        let mut second = board_integration("t1");
        second.credentials = Credentials::static_token("newer-token");
        store.save(&second).unwrap();

        let summaries = store.list(&TenantId::new("t1")).unwrap();
        assert_eq!(summaries.len(), 1);
        let loaded = store
            .get(&TenantId::new("t1"), ProviderType::Board)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.credentials.access_token, "newer-token");
    }

    #[test]
    fn test_update_credentials_and_delete() {
        let (store, _db) = store();
        let tenant = TenantId::new("t1");
        store.save(&board_integration("t1")).unwrap();

        let creds = Credentials {
            access_token: "at2".to_string(),
            refresh_token: Some("rt2".to_string()),
            expires_at: Some(Utc::now()),
        };
        assert!(store
            .update_credentials(&tenant, ProviderType::Board, &creds, IntegrationState::Connected)
            .unwrap());
        assert_eq!(
            store
                .get(&tenant, ProviderType::Board)
                .unwrap()
                .unwrap()
                .credentials,
            creds
        );

        assert!(store.delete(&tenant, ProviderType::Board).unwrap());
        assert!(store.get(&tenant, ProviderType::Board).unwrap().is_none());
        assert!(!store
            .update_credentials(&tenant, ProviderType::Board, &creds, IntegrationState::Connected)
            .unwrap());
    }

    #[test]
    fn test_pending_handshake_is_taken_once() {
        let (store, _db) = store();
        let pending = PendingHandshake {
            state: "nonce-1".to_string(),
            tenant_id: TenantId::new("t1"),
            provider_type: ProviderType::Board,
            config: board_integration("t1").config,
            sync_direction: SyncDirection::Push,
            created_at: Utc::now(),
        };
        store.insert_pending(&pending).unwrap();
        assert!(store
            .has_pending(
                &pending.tenant_id,
                ProviderType::Board,
                pending.created_at - chrono::Duration::minutes(1)
            )
            .unwrap());

        let taken = store.take_pending("nonce-1").unwrap().unwrap();
        assert_eq!(taken, pending);
        assert!(store.take_pending("nonce-1").unwrap().is_none());
    }

    #[test]
    fn test_purge_pending() {
        let (store, _db) = store();
        let old = PendingHandshake {
            state: "old".to_string(),
            tenant_id: TenantId::new("t1"),
            provider_type: ProviderType::WorkItem,
            config: ProviderConfig::WorkItem(crate::integration::WorkItemTarget {
                organization: "acme".to_string(),
                project: "Web".to_string(),
                work_item_type: "Bug".to_string(),
            }),
            sync_direction: SyncDirection::Both,
            created_at: Utc::now() - chrono::Duration::hours(1),
        };
        store.insert_pending(&old).unwrap();
        assert_eq!(store.purge_pending(Utc::now()).unwrap(), 1);
    }
}
