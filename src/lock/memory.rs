use super::{LockError, LockLease, LockStore};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lock store living in this process.
///
/// Entry-level locking in the map gives atomic acquire-if-absent. Only
/// executions sharing this store instance are excluded from each other.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockStore {
    leases: Arc<DashMap<String, LockLease>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockLease, LockError> {
        match self.leases.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                let lease = LockLease::new(key, holder, ttl);
                slot.insert(lease.clone());
                Ok(lease)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired_at(Utc::now()) {
                    debug!(key, previous = %slot.get().holder, "Reclaiming expired lease");
                    let lease = LockLease::new(key, holder, ttl);
                    slot.insert(lease.clone());
                    Ok(lease)
                } else {
                    Err(LockError::Contention {
                        key: key.to_string(),
                        holder: slot.get().holder.clone(),
                    })
                }
            }
        }
    }

    async fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<LockLease, LockError> {
        if let Some(mut current) = self.leases.get_mut(&lease.key) {
            if current.owner == lease.owner {
                *current = current.renewed(ttl);
                return Ok(current.clone());
            }
        }
        Err(LockError::LeaseLost {
            key: lease.key.clone(),
        })
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        if self
            .leases
            .remove_if(&lease.key, |_, current| current.owner == lease.owner)
            .is_none()
        {
            warn!(key = %lease.key, "Released a lease that was no longer held");
        }
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<Option<LockLease>, LockError> {
        Ok(self.leases.get(key).map(|lease| lease.clone()))
    }
}
