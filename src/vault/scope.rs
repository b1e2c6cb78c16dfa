//! Request-scoped token cache
//!
//! One logical operation (a push, a pull, a batch of pushes) resolves each
//! provider token at most once, so it never refreshes twice.

use super::{AccessToken, TokenVault};
use crate::domain::{ProviderType, TenantId};
use crate::{BridgeError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct TokenScope {
    vault: Arc<TokenVault>,
    cache: Mutex<HashMap<(TenantId, ProviderType), Option<AccessToken>>>,
}

impl TokenScope {
    pub fn new(vault: Arc<TokenVault>) -> Self {
        Self {
            vault,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Same contract as [`TokenVault::get_valid_access_token`], memoized
    pub async fn token(&self, tenant: &TenantId, provider: ProviderType) -> Result<Option<AccessToken>> {
        // Held across the vault call so concurrent users of one scope share a refresh
        let mut cache = self.cache.lock().await;
        let key = (tenant.clone(), provider);
        if let Some(cached) = cache.get(&key) {
            return Ok(cached.clone());
        }

        let token = self.vault.get_valid_access_token(tenant, provider).await?;
        cache.insert(key, token.clone());
        Ok(token)
    }

    /// A usable token or [`BridgeError::TokenInvalid`]
    pub async fn require(&self, tenant: &TenantId, provider: ProviderType) -> Result<AccessToken> {
        self.token(tenant, provider).await?.ok_or_else(|| {
            BridgeError::TokenInvalid(format!(
                "{} credentials for tenant {} are no longer valid; reconnect the integration",
                provider.display_name(),
                tenant
            ))
        })
    }
}
