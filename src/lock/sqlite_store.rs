use super::{LockError, LockLease, LockStore};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a statement waits on another process's write lock before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Durable lock store on a SQLite database file.
///
/// Every process opening the same file shares the lease table. Acquisition
/// is a single conditional upsert, so it is atomic across processes; renewal
/// and release match on the lease's owner token. Leases are stored as JSON
/// next to the columns the conditions need.
#[derive(Debug, Clone)]
pub struct SqliteLockStore {
    pool: SqlitePool,
}

impl SqliteLockStore {
    /// Open (creating if needed) the lease database at `path`
    pub async fn open(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LockError::store(format!("create {}", parent.display()), e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| LockError::store(format!("open {}", path.display()), e))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS locks (
                key TEXT PRIMARY KEY NOT NULL,
                owner TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                lease TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| LockError::store("create lock table", e))?;

        Ok(Self { pool })
    }

    /// Number of lease records, expired or not
    pub async fn len(&self) -> Result<usize, LockError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM locks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LockError::store("count leases", e))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn encode(lease: &LockLease) -> Result<String, LockError> {
    serde_json::to_string(lease).map_err(|e| LockError::store(format!("encode {}", lease.key), e))
}

fn decode(key: &str, raw: &str) -> Result<LockLease, LockError> {
    serde_json::from_str(raw).map_err(|e| LockError::store(format!("decode {key}"), e))
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockLease, LockError> {
        let lease = LockLease::new(key, holder, ttl);
        let encoded = encode(&lease)?;

        // Inserts when free, overwrites only an expired lease
        let result = sqlx::query(
            "INSERT INTO locks (key, owner, expires_at_ms, lease) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                owner = excluded.owner,
                expires_at_ms = excluded.expires_at_ms,
                lease = excluded.lease
             WHERE locks.expires_at_ms <= ?5",
        )
        .bind(key)
        .bind(&lease.owner)
        .bind(lease.expires_at.timestamp_millis())
        .bind(&encoded)
        .bind(lease.acquired_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::store(format!("acquire {key}"), e))?;

        if result.rows_affected() == 1 {
            debug!(key, owner = %lease.owner, "Stored lease");
            return Ok(lease);
        }

        let holder = match self.current(key).await? {
            Some(existing) => existing.holder,
            None => "unknown".to_string(),
        };
        Err(LockError::Contention {
            key: key.to_string(),
            holder,
        })
    }

    async fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<LockLease, LockError> {
        let renewed = lease.renewed(ttl);
        let encoded = encode(&renewed)?;

        let result = sqlx::query(
            "UPDATE locks SET expires_at_ms = ?1, lease = ?2 WHERE key = ?3 AND owner = ?4",
        )
        .bind(renewed.expires_at.timestamp_millis())
        .bind(&encoded)
        .bind(&lease.key)
        .bind(&lease.owner)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::store(format!("renew {}", lease.key), e))?;

        if result.rows_affected() == 1 {
            Ok(renewed)
        } else {
            Err(LockError::LeaseLost {
                key: lease.key.clone(),
            })
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let result = sqlx::query("DELETE FROM locks WHERE key = ?1 AND owner = ?2")
            .bind(&lease.key)
            .bind(&lease.owner)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::store(format!("release {}", lease.key), e))?;

        if result.rows_affected() == 0 {
            warn!(key = %lease.key, "Released a lease that was no longer held");
        }
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<Option<LockLease>, LockError> {
        let raw: Option<String> = sqlx::query_scalar("SELECT lease FROM locks WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LockError::store(format!("read {key}"), e))?;
        raw.map(|raw| decode(key, &raw)).transpose()
    }
}
