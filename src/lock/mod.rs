//! Distributed execution locks
//!
//! A [`LockStore`] hands out leased mutual-exclusion tokens keyed by remote
//! state identity. Atomicity comes from the store, never from an in-process
//! mutex: holders may live in other processes. Leases expire after a TTL so a
//! crashed holder's lock becomes reclaimable.

pub mod memory;
pub mod sqlite_store;

pub use memory::InMemoryLockStore;
pub use sqlite_store::SqliteLockStore;

use crate::core::cancel::CancelSignal;
use crate::core::config::{LockConfig, LockStoreKind};
use crate::core::errors::StackError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A held lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub key: String,
    /// Unique token of this acquisition; release and renewal match on it
    pub owner: String,
    /// Human-readable description of who holds the lock
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    pub fn new(key: &str, holder: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            owner: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl_delta(ttl),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Same lease with its expiry pushed out by `ttl` from now
    pub fn renewed(&self, ttl: Duration) -> Self {
        Self {
            expires_at: Utc::now() + ttl_delta(ttl),
            ..self.clone()
        }
    }
}

/// Leases longer than this are clamped so expiry arithmetic cannot overflow
const MAX_LEASE: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

fn ttl_delta(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl.min(MAX_LEASE)).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

/// Lock store errors
#[derive(Debug, Error)]
pub enum LockError {
    /// Someone else holds an unexpired lease
    #[error("lock {key} is held by {holder}")]
    Contention { key: String, holder: String },

    /// Our lease was reclaimed or released by someone else
    #[error("lease on {key} is no longer held")]
    LeaseLost { key: String },

    /// The store itself failed
    #[error("lock store operation failed: {operation}")]
    Store {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl LockError {
    pub fn store<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

impl From<LockError> for StackError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Contention { key, holder } => StackError::LockContention {
                key,
                attempts: 1,
                holder,
            },
            LockError::Store { operation, source } => StackError::LockStore { operation, source },
            LockError::LeaseLost { key } => {
                StackError::lock_store(format!("hold lease on {key}"), LockError::LeaseLost { key })
            }
        }
    }
}

/// A durable store offering atomic acquire-if-absent with leases
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lock if it is free or its lease expired, else report contention
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration)
        -> Result<LockLease, LockError>;

    /// Extend a lease we still own
    async fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<LockLease, LockError>;

    /// Drop a lease. Releasing a lease someone else has since reclaimed is a no-op.
    async fn release(&self, lease: &LockLease) -> Result<(), LockError>;

    /// Current lease on a key, expired or not
    async fn current(&self, key: &str) -> Result<Option<LockLease>, LockError>;
}

/// Open the store selected by the run configuration
pub async fn open_store(kind: &LockStoreKind) -> Result<Arc<dyn LockStore>, LockError> {
    match kind {
        LockStoreKind::Memory => Ok(Arc::new(InMemoryLockStore::new())),
        LockStoreKind::Sqlite { path } => Ok(Arc::new(SqliteLockStore::open(path).await?)),
    }
}

/// Holds a lease for the duration of a critical section.
///
/// Call [`LockGuard::release`] on the normal path; it reports
/// [`LockError::LeaseLost`] if the lease stopped being ours at any point while
/// it was held. If the guard is dropped instead (panic, cancelled future) the
/// release is spawned onto the runtime; outside a runtime the lease is left
/// to expire.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    lease: Option<LockLease>,
    keepalive: Option<JoinHandle<()>>,
    lost: watch::Receiver<bool>,
}

impl LockGuard {
    fn new(store: Arc<dyn LockStore>, lease: LockLease, ttl: Duration) -> Self {
        let (lost_tx, lost) = watch::channel(false);
        let keepalive = spawn_keepalive(store.clone(), lease.clone(), ttl, lost_tx);
        Self {
            store,
            lease: Some(lease),
            keepalive: Some(keepalive),
            lost,
        }
    }

    pub fn lease(&self) -> Option<&LockLease> {
        self.lease.as_ref()
    }

    /// True once renewal found the lease reclaimed by someone else
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
            let _ = handle.await;
        }
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };

        let still_ours = matches!(
            self.store.current(&lease.key).await?,
            Some(current) if current.owner == lease.owner
        );
        if self.is_lost() || !still_ours {
            warn!(key = %lease.key, "Lease was lost while the lock was held");
            return Err(LockError::LeaseLost { key: lease.key });
        }

        self.store.release(&lease).await?;
        debug!(key = %lease.key, "Released lock");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let store = self.store.clone();
                runtime.spawn(async move {
                    if let Err(e) = store.release(&lease).await {
                        warn!(key = %lease.key, error = %e, "Failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                warn!(key = %lease.key, "Lock dropped outside a runtime; lease will expire after its TTL");
            }
        }
    }
}

fn spawn_keepalive(
    store: Arc<dyn LockStore>,
    lease: LockLease,
    ttl: Duration,
    lost: watch::Sender<bool>,
) -> JoinHandle<()> {
    let interval = (ttl / 3).max(Duration::from_millis(10));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match store.renew(&lease, ttl).await {
                Ok(renewed) => {
                    debug!(key = %renewed.key, expires_at = %renewed.expires_at, "Renewed lock lease");
                }
                Err(LockError::LeaseLost { key }) => {
                    warn!(key = %key, "Lock lease was reclaimed by another holder");
                    lost.send_replace(true);
                    return;
                }
                // The lease may still be valid; try again next interval
                Err(e) => {
                    warn!(key = %lease.key, error = %e, "Failed to renew lock lease");
                }
            }
        }
    })
}

/// Acquire `key`, retrying on contention with the configured backoff.
///
/// Exhausting `max_attempts` yields [`StackError::LockContention`]; store
/// failures are returned at once. Cancellation stops the wait without taking
/// the lock.
pub async fn acquire_with_retry(
    store: Arc<dyn LockStore>,
    key: &str,
    holder: &str,
    config: &LockConfig,
    cancel: &CancelSignal,
) -> Result<LockGuard, StackError> {
    let ttl = config.lease_ttl();
    let mut last_holder = String::from("unknown");

    for attempt in 0..config.max_attempts {
        if cancel.is_cancelled() {
            return Err(StackError::cancelled(format!("acquire lock {key}")));
        }

        match store.acquire(key, holder, ttl).await {
            Ok(lease) => {
                info!(key, attempt = attempt + 1, "Acquired lock");
                return Ok(LockGuard::new(store, lease, ttl));
            }
            Err(LockError::Contention { holder, .. }) => {
                debug!(key, attempt = attempt + 1, holder = %holder, "Lock is held, retrying");
                last_holder = holder;
            }
            Err(e) => return Err(e.into()),
        }

        if attempt + 1 < config.max_attempts {
            let delay = config.backoff(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(StackError::cancelled(format!("acquire lock {key}")));
                }
            }
        }
    }

    Err(StackError::LockContention {
        key: key.to_string(),
        attempts: config.max_attempts,
        holder: last_holder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::cancel_pair;
    use crate::core::config::RetryStrategy;

    fn fast_config(max_attempts: u32) -> LockConfig {
        LockConfig {
            max_attempts,
            retry_strategy: RetryStrategy::Linear { delay_ms: 5 },
            jitter: false,
            lease_ttl_secs: 60,
            store: LockStoreKind::Memory,
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
        let guard = acquire_with_retry(
            store.clone(),
            "s3:bucket=a,key=b",
            "test",
            &fast_config(1),
            &CancelSignal::never(),
        )
        .await
        .unwrap();
        assert!(store.current("s3:bucket=a,key=b").await.unwrap().is_some());

        guard.release().await.unwrap();
        assert!(store.current("s3:bucket=a,key=b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_contention_exhausts_budget() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
        let _held = store
            .acquire("key", "other-process", Duration::from_secs(60))
            .await
            .unwrap();

        let err = acquire_with_retry(store, "key", "me", &fast_config(3), &CancelSignal::never())
            .await
            .err()
            .unwrap();
        match err {
            StackError::LockContention {
                key,
                attempts,
                holder,
            } => {
                assert_eq!(key, "key");
                assert_eq!(attempts, 3);
                assert_eq!(holder, "other-process");
            }
            other => panic!("expected contention, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_waits_for_release() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
        let first = acquire_with_retry(
            store.clone(),
            "key",
            "first",
            &fast_config(1),
            &CancelSignal::never(),
        )
        .await
        .unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                acquire_with_retry(store, "key", "second", &fast_config(200), &CancelSignal::never())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        first.release().await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.lease().unwrap().holder, "second");
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
        let _held = store
            .acquire("key", "other", Duration::from_secs(60))
            .await
            .unwrap();
        let (handle, signal) = cancel_pair();

        let waiter = tokio::spawn({
            let store = store.clone();
            async move {
                acquire_with_retry(store, "key", "me", &fast_config(10_000), &signal).await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let err = waiter.await.unwrap().err().unwrap();
        assert!(matches!(err, StackError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
        let guard = acquire_with_retry(
            store.clone(),
            "key",
            "dropper",
            &fast_config(1),
            &CancelSignal::never(),
        )
        .await
        .unwrap();
        drop(guard);

        for _ in 0..50 {
            if store.current("key").await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dropped guard did not release its lease");
    }

    #[tokio::test]
    async fn test_keepalive_extends_lease() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
        let config = LockConfig {
            lease_ttl_secs: 1,
            ..fast_config(1)
        };
        let guard = acquire_with_retry(store.clone(), "key", "me", &config, &CancelSignal::never())
            .await
            .unwrap();
        let initial_expiry = guard.lease().unwrap().expires_at;

        tokio::time::sleep(Duration::from_millis(450)).await;
        let current = store.current("key").await.unwrap().unwrap();
        assert!(current.expires_at > initial_expiry);
        guard.release().await.unwrap();
    }

    /// Store whose renewals always find the lease gone
    struct NoRenewStore(InMemoryLockStore);

    #[async_trait]
    impl LockStore for NoRenewStore {
        async fn acquire(
            &self,
            key: &str,
            holder: &str,
            ttl: Duration,
        ) -> Result<LockLease, LockError> {
            self.0.acquire(key, holder, ttl).await
        }

        async fn renew(&self, lease: &LockLease, _ttl: Duration) -> Result<LockLease, LockError> {
            Err(LockError::LeaseLost {
                key: lease.key.clone(),
            })
        }

        async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
            self.0.release(lease).await
        }

        async fn current(&self, key: &str) -> Result<Option<LockLease>, LockError> {
            self.0.current(key).await
        }
    }

    #[tokio::test]
    async fn test_reclaimed_lease_is_reported_on_release() {
        let store: Arc<dyn LockStore> = Arc::new(NoRenewStore(InMemoryLockStore::new()));
        let config = LockConfig {
            lease_ttl_secs: 1,
            ..fast_config(1)
        };
        let guard = acquire_with_retry(store.clone(), "key", "slow", &config, &CancelSignal::never())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(guard.is_lost());
        let thief = store
            .acquire("key", "other", Duration::from_secs(60))
            .await
            .unwrap();

        let err = guard.release().await.unwrap_err();
        assert!(matches!(err, LockError::LeaseLost { .. }));
        // The new holder keeps its lease
        assert_eq!(store.current("key").await.unwrap(), Some(thief));
    }

    #[tokio::test]
    async fn test_lease_taken_over_without_renewal_failure_is_reported() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
        let config = LockConfig {
            lease_ttl_secs: 60,
            ..fast_config(1)
        };
        let guard = acquire_with_retry(store.clone(), "key", "me", &config, &CancelSignal::never())
            .await
            .unwrap();
        let ours = guard.lease().unwrap().clone();
        store.release(&ours).await.unwrap();
        store
            .acquire("key", "other", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!guard.is_lost());
        assert!(matches!(
            guard.release().await,
            Err(LockError::LeaseLost { .. })
        ));
    }
}
