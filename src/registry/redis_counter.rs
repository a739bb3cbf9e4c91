//! Redis-backed fast concurrency counter.
//!
//! Tracks "how many non-terminal sessions does this access_key currently
//! occupy" as a plain integer key, avoiding a Postgres round-trip on every
//! admission check. `rescan` overwrites the key with the authoritative count
//! the reconciler computed from `Registry::active_sessions`, bounding how far
//! this cache can drift from Postgres truth (see the resolved Open Question
//! in `DESIGN.md`).

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::types::{AccessKey, Result};

use super::ConcurrencyCounter;

#[derive(Debug, Clone)]
pub struct RedisConcurrencyCounter {
    client: redis::Client,
    namespace: String,
}

impl RedisConcurrencyCounter {
    pub fn new(url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    fn key(&self, access_key: &AccessKey) -> String {
        format!("{}:concurrency:{}", self.namespace, access_key.as_str())
    }
}

#[async_trait]
impl ConcurrencyCounter for RedisConcurrencyCounter {
    async fn increment(&self, access_key: &AccessKey) -> Result<u32> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: i64 = conn.incr(self.key(access_key), 1).await?;
        Ok(value.max(0) as u32)
    }

    async fn decrement(&self, access_key: &AccessKey) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.key(access_key);
        let value: i64 = conn.decr(&key, 1).await?;
        if value <= 0 {
            // Clamp at zero rather than letting the counter drift negative
            // if decrement races ahead of a matching increment.
            let _: () = conn.set(&key, 0).await?;
        }
        Ok(())
    }

    async fn current(&self, access_key: &AccessKey) -> Result<u32> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<i64> = conn.get(self.key(access_key)).await?;
        Ok(value.unwrap_or(0).max(0) as u32)
    }

    async fn rescan(&self, access_key: &AccessKey, authoritative: u32) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.set(self.key(access_key), authoritative).await?;
        Ok(())
    }
}
