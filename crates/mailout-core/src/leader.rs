//! Leader lock - At most one scheduler per deployment
//!
//! The scheduler starts only after winning the lock. With PostgreSQL the
//! lock is a session advisory lock held on a dedicated connection, so it is
//! released by the database as soon as the process dies.

use async_trait::async_trait;
use mailout_common::{Error, Result};
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Connection;
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tracing::{info, warn};

/// Exclusive lock guarding the scheduler
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Try once to become leader; true if the lock is now held
    async fn try_acquire(&self) -> Result<bool>;

    /// Give up leadership
    async fn release(&self) -> Result<()>;
}

/// Block until `lock` is acquired, retrying every `retry`
pub async fn acquire_leadership(lock: &dyn LeaderLock, retry: Duration) -> Result<()> {
    loop {
        if lock.try_acquire().await? {
            info!("Scheduler leadership acquired");
            return Ok(());
        }
        info!(retry_secs = retry.as_secs(), "Another scheduler holds the lock, waiting");
        tokio::time::sleep(retry).await;
    }
}

/// PostgreSQL session advisory lock
pub struct AdvisoryLeaderLock {
    pool: PgPool,
    key: i64,
    held: tokio::sync::Mutex<Option<PgConnection>>,
}

impl AdvisoryLeaderLock {
    pub fn new(pool: PgPool, key: i64) -> Self {
        Self {
            pool,
            key,
            held: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl LeaderLock for AdvisoryLeaderLock {
    async fn try_acquire(&self) -> Result<bool> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            return Ok(true);
        }

        // Detached so the session, and the lock with it, never returns to the pool.
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Error::Lease(format!("Failed to open lock connection: {}", e)))?
            .detach();

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.key)
            .fetch_one(&mut conn)
            .await
            .map_err(|e| Error::Lease(format!("Advisory lock query failed: {}", e)))?;

        if acquired {
            *held = Some(conn);
        } else if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close lock connection");
        }
        Ok(acquired)
    }

    async fn release(&self) -> Result<()> {
        let Some(mut conn) = self.held.lock().await.take() else {
            return Ok(());
        };
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut conn)
            .await
            .map_err(|e| Error::Lease(format!("Advisory unlock failed: {}", e)))?;
        conn.close()
            .await
            .map_err(|e| Error::Lease(format!("Failed to close lock connection: {}", e)))?;
        info!(key = self.key, "Scheduler leadership released");
        Ok(())
    }
}

fn local_registry() -> &'static Mutex<HashSet<i64>> {
    static REGISTRY: OnceLock<Mutex<HashSet<i64>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// In-process lock for deployments without a shared database
pub struct LocalLeaderLock {
    key: i64,
    held: Mutex<bool>,
}

impl LocalLeaderLock {
    pub fn new(key: i64) -> Self {
        Self {
            key,
            held: Mutex::new(false),
        }
    }

    fn poisoned<T>(_: T) -> Error {
        Error::Lease("Local lock registry poisoned".to_string())
    }

    fn release_sync(&self) -> Result<()> {
        let mut held = self.held.lock().map_err(Self::poisoned)?;
        if *held {
            local_registry().lock().map_err(Self::poisoned)?.remove(&self.key);
            *held = false;
        }
        Ok(())
    }
}

#[async_trait]
impl LeaderLock for LocalLeaderLock {
    async fn try_acquire(&self) -> Result<bool> {
        let mut held = self.held.lock().map_err(Self::poisoned)?;
        if *held {
            return Ok(true);
        }
        let acquired = local_registry().lock().map_err(Self::poisoned)?.insert(self.key);
        *held = acquired;
        Ok(acquired)
    }

    async fn release(&self) -> Result<()> {
        self.release_sync()
    }
}

impl Drop for LocalLeaderLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_sync() {
            warn!(error = %e, "Failed to release local leader lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_lock_is_exclusive() {
        let first = LocalLeaderLock::new(9_001);
        let second = LocalLeaderLock::new(9_001);

        assert!(first.try_acquire().await.unwrap());
        assert!(first.try_acquire().await.unwrap());
        assert!(!second.try_acquire().await.unwrap());

        first.release().await.unwrap();
        assert!(second.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_local_lock_released_on_drop() {
        {
            let lock = LocalLeaderLock::new(9_002);
            assert!(lock.try_acquire().await.unwrap());
        }
        let next = LocalLeaderLock::new(9_002);
        assert!(next.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_leadership_returns_once_free() {
        let lock = LocalLeaderLock::new(9_003);
        acquire_leadership(&lock, Duration::from_millis(1)).await.unwrap();
        assert!(lock.try_acquire().await.unwrap());
    }
}
