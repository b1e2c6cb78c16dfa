//! Credential lifecycle per (tenant, provider)
//!
//! The vault is the only component that reads or writes credentials. It runs
//! the OAuth handshake, validates static tokens, refreshes tokens before they
//! expire and records revoked grants on the integration's state.

mod cipher;
pub mod oauth;
mod scope;

pub use cipher::SecretCipher;
pub use oauth::{OAuthClient, OAuthFlavor, TokenEndpoint, TokenGrant};
pub use scope::TokenScope;

use crate::clock::Clock;
use crate::domain::{ProviderType, TenantId};
use crate::integration::{
    Credentials, Integration, IntegrationState, IntegrationStore, IntegrationSummary,
    PendingHandshake, ProviderConfig, StateEvent, SyncDirection,
};
use crate::providers::{ConnectionCheck, ProviderAdapter};
use crate::{BridgeError, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Pending handshakes older than this are rejected and purged
const HANDSHAKE_TTL_MINUTES: i64 = 10;

/// A bearer token handed to provider adapters
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// `None` for static tokens
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

impl From<&Credentials> for AccessToken {
    fn from(creds: &Credentials) -> Self {
        Self::new(creds.access_token.clone(), creds.expires_at)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Where to send the user to start an OAuth handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: String,
    /// Nonce the callback must echo back
    pub state: String,
}

/// Token storage, refresh and handshake orchestration
pub struct TokenVault {
    store: IntegrationStore,
    endpoints: HashMap<ProviderType, Arc<dyn TokenEndpoint>>,
    clock: Arc<dyn Clock>,
    refresh_buffer: Duration,
}

impl TokenVault {
    pub fn new(store: IntegrationStore, clock: Arc<dyn Clock>, refresh_buffer: Duration) -> Self {
        Self {
            store,
            endpoints: HashMap::new(),
            clock,
            refresh_buffer,
        }
    }

    /// Register the token endpoint for an OAuth provider
    pub fn with_endpoint(mut self, provider: ProviderType, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        self.endpoints.insert(provider, endpoint);
        self
    }

    pub fn store(&self) -> &IntegrationStore {
        &self.store
    }

    fn endpoint(&self, provider: ProviderType) -> Result<&Arc<dyn TokenEndpoint>> {
        self.endpoints.get(&provider).ok_or_else(|| {
            BridgeError::Config(format!(
                "No OAuth client configured for {} (set providers.{}.client_id)",
                provider.display_name(),
                provider
            ))
        })
    }

    fn is_fresh(&self, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match expires_at {
            None => true,
            Some(at) => at > now + self.refresh_buffer,
        }
    }

    /// A token valid for longer than the refresh buffer, refreshing if needed
    ///
    /// - `Ok(Some(token))`: usable token
    /// - `Ok(None)`: the grant is gone (revoked, no refresh token, or the
    ///   provider issued a token that is already near expiry); the user must
    ///   reconnect
    /// - `Err(ProviderUnavailable)`: transient refresh failure; nothing changed
    pub async fn get_valid_access_token(
        &self,
        tenant: &TenantId,
        provider: ProviderType,
    ) -> Result<Option<AccessToken>> {
        let integration = self.store.get(tenant, provider)?.ok_or_else(|| {
            BridgeError::not_configured(format!(
                "no {} integration for tenant {}",
                provider.display_name(),
                tenant
            ))
        })?;

        if integration.state == IntegrationState::TokenRevoked {
            tracing::debug!(tenant = %tenant, provider = %provider, "Grant revoked, reconnect required");
            return Ok(None);
        }

        let now = self.clock.now();
        let credentials = &integration.credentials;
        if self.is_fresh(credentials.expires_at, now) {
            return Ok(Some(AccessToken::from(credentials)));
        }

        tracing::debug!(
            tenant = %tenant,
            provider = %provider,
            expires_at = ?credentials.expires_at,
            "Access token expiring, refreshing"
        );
        let mut state = integration.state;
        if state != IntegrationState::TokenExpired {
            if let Ok(next) = state.transition(StateEvent::TokenExpired) {
                self.store.set_state(tenant, provider, next)?;
                state = next;
            }
        }

        let Some(refresh_token) = credentials.refresh_token.clone() else {
            tracing::warn!(tenant = %tenant, provider = %provider, "Token expired and no refresh token stored");
            self.mark_revoked(tenant, provider, state)?;
            return Ok(None);
        };

        let endpoint = self.endpoint(provider)?;
        match endpoint.refresh(&refresh_token).await {
            Ok(grant) => {
                let now = self.clock.now();
                let refreshed = grant.into_credentials(now, Some(refresh_token));
                let next = state.transition(StateEvent::TokenRefreshed)?;

                if !self.store.update_credentials(tenant, provider, &refreshed, next)? {
                    return Err(BridgeError::not_configured(format!(
                        "{} integration for tenant {} was disconnected during refresh",
                        provider.display_name(),
                        tenant
                    )));
                }
                tracing::info!(
                    tenant = %tenant,
                    provider = %provider,
                    expires_at = ?refreshed.expires_at,
                    "Access token refreshed"
                );

                if !self.is_fresh(refreshed.expires_at, now) {
                    tracing::warn!(
                        tenant = %tenant,
                        provider = %provider,
                        expires_at = ?refreshed.expires_at,
                        "Refreshed token already expires within the refresh buffer"
                    );
                    return Ok(None);
                }
                Ok(Some(AccessToken::from(&refreshed)))
            }
            Err(BridgeError::TokenInvalid(reason)) => {
                tracing::warn!(tenant = %tenant, provider = %provider, reason = %reason, "Refresh grant rejected");
                self.mark_revoked(tenant, provider, state)?;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(tenant = %tenant, provider = %provider, error = %e, "Token refresh failed");
                Err(e)
            }
        }
    }

    fn mark_revoked(&self, tenant: &TenantId, provider: ProviderType, state: IntegrationState) -> Result<()> {
        let next = state.transition(StateEvent::GrantRevoked)?;
        self.store.set_state(tenant, provider, next)?;
        Ok(())
    }

    /// Start an OAuth handshake; the integration reads as `connecting` until completed
    pub fn begin_authorization(
        &self,
        tenant: &TenantId,
        config: ProviderConfig,
        direction: SyncDirection,
    ) -> Result<AuthorizationRequest> {
        let provider = config.provider_type();
        if !provider.uses_oauth() {
            return Err(BridgeError::not_configured(format!(
                "{} uses a static API token, not OAuth",
                provider.display_name()
            )));
        }
        config.validate()?;
        let endpoint = self.endpoint(provider)?;

        let now = self.clock.now();
        self.store
            .purge_pending(now - Duration::minutes(HANDSHAKE_TTL_MINUTES))?;

        let state = uuid::Uuid::new_v4().simple().to_string();
        self.store.insert_pending(&PendingHandshake {
            state: state.clone(),
            tenant_id: tenant.clone(),
            provider_type: provider,
            config,
            sync_direction: direction,
            created_at: now,
        })?;

        let url = endpoint.authorize_url(&state)?;
        tracing::info!(tenant = %tenant, provider = %provider, "OAuth handshake started");
        Ok(AuthorizationRequest { url, state })
    }

    /// Finish a handshake with the code from the provider's callback
    pub async fn complete_authorization(&self, state: &str, code: &str) -> Result<IntegrationSummary> {
        let pending = self.store.take_pending(state)?.ok_or_else(|| {
            BridgeError::not_configured("unknown or already used authorization state")
        })?;

        let now = self.clock.now();
        if pending.created_at < now - Duration::minutes(HANDSHAKE_TTL_MINUTES) {
            return Err(BridgeError::not_configured(
                "authorization state expired; start the handshake again",
            ));
        }

        let provider = pending.provider_type;
        let connecting = IntegrationState::Connecting;
        let grant = match self.endpoint(provider)?.exchange_code(code).await {
            Ok(grant) => grant,
            Err(e) => {
                tracing::warn!(tenant = %pending.tenant_id, provider = %provider, error = %e, "OAuth code exchange failed");
                return Err(e);
            }
        };

        let integration = Integration {
            tenant_id: pending.tenant_id,
            provider_type: provider,
            is_active: true,
            state: connecting.transition(StateEvent::HandshakeCompleted)?,
            credentials: grant.into_credentials(now, None),
            config: pending.config,
            sync_direction: pending.sync_direction,
            created_at: now,
            updated_at: now,
        };
        self.store.save(&integration)?;

        tracing::info!(tenant = %integration.tenant_id, provider = %provider, "Integration connected");
        Ok(integration.summary())
    }

    /// Validate a static token against the provider and store it
    pub async fn connect_static_token(
        &self,
        tenant: &TenantId,
        config: ProviderConfig,
        token: &str,
        direction: SyncDirection,
        validator: &dyn ProviderAdapter,
    ) -> Result<IntegrationSummary> {
        let provider = config.provider_type();
        if provider.uses_oauth() {
            return Err(BridgeError::not_configured(format!(
                "{} connects through OAuth; use the authorization flow",
                provider.display_name()
            )));
        }
        if validator.provider_type() != provider {
            return Err(BridgeError::Config(format!(
                "{} adapter cannot validate a {} token",
                validator.provider_type(),
                provider
            )));
        }
        config.validate()?;

        let credentials = Credentials::static_token(token);
        let connecting = IntegrationState::Unconfigured.transition(StateEvent::BeginHandshake)?;
        let identity = match validator
            .test_connection(&AccessToken::from(&credentials), &config)
            .await?
        {
            ConnectionCheck::Ok { identity_label } => identity_label,
            ConnectionCheck::Failed { error } => {
                return Err(BridgeError::TokenInvalid(format!(
                    "{} rejected the token: {}",
                    provider.display_name(),
                    error
                )));
            }
        };

        let now = self.clock.now();
        let integration = Integration {
            tenant_id: tenant.clone(),
            provider_type: provider,
            is_active: true,
            state: connecting.transition(StateEvent::HandshakeCompleted)?,
            credentials,
            config,
            sync_direction: direction,
            created_at: now,
            updated_at: now,
        };
        self.store.save(&integration)?;

        tracing::info!(tenant = %tenant, provider = %provider, identity = %identity, "Integration connected");
        Ok(integration.summary())
    }

    /// Delete the integration and its credentials; links are kept
    pub fn disconnect(&self, tenant: &TenantId, provider: ProviderType) -> Result<bool> {
        let Some(state) = self.store.state(tenant, provider)? else {
            return Ok(false);
        };
        // Rejected only for rows that never finished a handshake
        if let Err(e) = state.transition(StateEvent::Disconnect) {
            tracing::debug!(error = %e, "Disconnecting integration in unexpected state");
        }
        let deleted = self.store.delete(tenant, provider)?;
        tracing::info!(tenant = %tenant, provider = %provider, "Integration disconnected");
        Ok(deleted)
    }

    /// Change target selectors or sync direction of a stored integration
    pub fn reconfigure(
        &self,
        tenant: &TenantId,
        config: ProviderConfig,
        direction: SyncDirection,
    ) -> Result<IntegrationSummary> {
        let provider = config.provider_type();
        config.validate()?;
        if !self.store.update_settings(tenant, provider, &config, direction)? {
            return Err(not_found(tenant, provider));
        }
        tracing::info!(tenant = %tenant, provider = %provider, direction = %direction, "Integration reconfigured");
        self.summary(tenant, provider)
    }

    pub fn set_active(&self, tenant: &TenantId, provider: ProviderType, active: bool) -> Result<IntegrationSummary> {
        if !self.store.set_active(tenant, provider, active)? {
            return Err(not_found(tenant, provider));
        }
        self.summary(tenant, provider)
    }

    /// Credential-free view of one integration (present or not)
    pub fn summary(&self, tenant: &TenantId, provider: ProviderType) -> Result<IntegrationSummary> {
        if let Some(integration) = self.store.get(tenant, provider)? {
            return Ok(integration.summary());
        }
        let since = self.clock.now() - Duration::minutes(HANDSHAKE_TTL_MINUTES);
        let state = if self.store.has_pending(tenant, provider, since)? {
            IntegrationState::Connecting
        } else {
            IntegrationState::Unconfigured
        };
        Ok(IntegrationSummary::absent(tenant.clone(), provider, state))
    }

    /// One summary per provider type
    pub fn list_integrations(&self, tenant: &TenantId) -> Result<Vec<IntegrationSummary>> {
        ProviderType::ALL
            .into_iter()
            .map(|provider| self.summary(tenant, provider))
            .collect()
    }

    /// The integration a sync runs against; missing or inactive is an error
    pub fn active_integration(&self, tenant: &TenantId, provider: ProviderType) -> Result<Integration> {
        let integration = self
            .store
            .get(tenant, provider)?
            .ok_or_else(|| not_found(tenant, provider))?;

        if !integration.is_active {
            return Err(BridgeError::not_configured(format!(
                "{} integration for tenant {} is inactive",
                provider.display_name(),
                tenant
            )));
        }
        integration.config.validate_for(provider)?;
        Ok(integration)
    }
}

fn not_found(tenant: &TenantId, provider: ProviderType) -> BridgeError {
    BridgeError::not_configured(format!(
        "no {} integration for tenant {}",
        provider.display_name(),
        tenant
    ))
}

impl fmt::Debug for TokenVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVault")
            .field("providers", &self.endpoints.keys().collect::<Vec<_>>())
            .field("refresh_buffer", &self.refresh_buffer)
            .finish_non_exhaustive()
    }
}
