//! Distributed locking: one lock per scaling group guards a scheduler tick,
//! one lock per session guards concurrent lifecycle operations on it.
//! Acquisition fails fast rather than waiting — a scaling group whose lock
//! is held skips this tick rather than queuing behind it.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::types::{Error, Result};

/// A released guard drops the lock. Implementors hold whatever connection
/// or session is needed to keep the lock alive until drop.
#[async_trait]
pub trait LockGuard: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Attempts to acquire the named lock without blocking. Returns `Ok(None)`
    /// if it's already held elsewhere — callers must treat that as "skip this
    /// tick", never retry-in-a-loop on the same tick.
    async fn try_acquire(&self, name: &str) -> Result<Option<Box<dyn LockGuard>>>;
}

/// Postgres session-level advisory lock (`pg_advisory_lock`/`pg_advisory_unlock`),
/// keyed by the 64-bit hash of the lock name. Requires a dedicated connection
/// held for the duration of the critical section, since advisory locks are
/// connection-scoped.
pub struct PgAdvisoryLock {
    pool: PgPool,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn lock_key(name: &str) -> i64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        name.hash(&mut hasher);
        hasher.finish() as i64
    }
}

#[async_trait]
impl DistributedLock for PgAdvisoryLock {
    async fn try_acquire(&self, name: &str) -> Result<Option<Box<dyn LockGuard>>> {
        let mut conn = self.pool.acquire().await?;
        let key = Self::lock_key(name);
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            return Ok(None);
        }
        Ok(Some(Box::new(PgAdvisoryLockGuard { conn, key })))
    }
}

struct PgAdvisoryLockGuard {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
    key: i64,
}

#[async_trait]
impl LockGuard for PgAdvisoryLockGuard {
    async fn release(mut self: Box<Self>) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }
}

struct MemoryLockGuard {
    name: String,
    held: std::sync::Arc<std::sync::Mutex<std::collections::HashSet<String>>>,
}

#[async_trait]
impl LockGuard for MemoryLockGuard {
    async fn release(self: Box<Self>) -> Result<()> {
        self.held
            .lock()
            .map_err(|_| Error::lock("memory lock poisoned"))?
            .remove(&self.name);
        Ok(())
    }
}

/// Test-only `DistributedLock` sharable across tasks; wrap in `Arc`.
#[derive(Debug, Default)]
pub struct SharedMemoryLock {
    held: std::sync::Arc<std::sync::Mutex<std::collections::HashSet<String>>>,
}

impl SharedMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for SharedMemoryLock {
    async fn try_acquire(&self, name: &str) -> Result<Option<Box<dyn LockGuard>>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| Error::lock("memory lock poisoned"))?;
        if !held.insert(name.to_string()) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLockGuard {
            name: name.to_string(),
            held: self.held.clone(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_fast_while_held() {
        let lock = SharedMemoryLock::new();
        let guard = lock.try_acquire("sg-default").await.unwrap();
        assert!(guard.is_some());
        assert!(lock.try_acquire("sg-default").await.unwrap().is_none());

        guard.unwrap().release().await.unwrap();
        assert!(lock.try_acquire("sg-default").await.unwrap().is_some());
    }
}
