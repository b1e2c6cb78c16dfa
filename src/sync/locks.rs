//! Per-item serialization of sync operations
//!
//! Two pushes of the same bug to the same provider must not both see "no
//! link" and create two external items; two first pulls of the same external
//! item must not create two local bugs. Each operation holds the async mutex
//! for its key until its writes are done.

use crate::domain::{BugId, ProviderType, TenantId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncKey {
    Bug {
        tenant: TenantId,
        bug: BugId,
        provider: ProviderType,
    },
    External {
        tenant: TenantId,
        provider: ProviderType,
        external_id: String,
    },
}

impl SyncKey {
    pub fn bug(tenant: &TenantId, bug: &BugId, provider: ProviderType) -> Self {
        SyncKey::Bug {
            tenant: tenant.clone(),
            bug: bug.clone(),
            provider,
        }
    }

    pub fn external(tenant: &TenantId, provider: ProviderType, external_id: &str) -> Self {
        SyncKey::External {
            tenant: tenant.clone(),
            provider,
            external_id: external_id.to_string(),
        }
    }
}

/// Held while an operation owns its key
pub type SyncGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct SyncLocks {
    locks: Mutex<HashMap<SyncKey, Arc<AsyncMutex<()>>>>,
}

impl SyncLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`
    pub async fn acquire(&self, key: SyncKey) -> SyncGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Entries only referenced by the map have no holder and no waiter
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Keys currently held or awaited
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|lock| Arc::strong_count(lock) > 1).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(bug: &str) -> SyncKey {
        SyncKey::bug(&TenantId::new("acme"), &BugId::new(bug), ProviderType::Board)
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(SyncLocks::new());
        let guard = locks.acquire(key("b1")).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(key("b1")).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = SyncLocks::new();
        let _a = locks.acquire(key("b1")).await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.acquire(key("b2")))
            .await
            .unwrap();
        let _c = tokio::time::timeout(
            Duration::from_secs(1),
            locks.acquire(SyncKey::external(&TenantId::new("acme"), ProviderType::Board, "b1")),
        )
        .await
        .unwrap();
        assert_eq!(locks.active(), 3);
    }

    #[tokio::test]
    async fn test_released_keys_are_pruned() {
        let locks = SyncLocks::new();
        drop(locks.acquire(key("b1")).await);
        drop(locks.acquire(key("b2")).await);
        assert_eq!(locks.active(), 0);

        let _held = locks.acquire(key("b3")).await;
        assert_eq!(locks.locks.lock().unwrap().len(), 1);
    }
}
