//! KV store: the configuration + runtime namespaces backed by Redis.
//!
//! Shares the same Redis deployment as the fast concurrency counter
//! (`registry::RedisConcurrencyCounter`) but under a distinct key prefix, the
//! way the original manager uses a single Redis for both concerns.

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::types::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;
    async fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;
}

pub struct RedisKvStore {
    client: redis::Client,
    prefix: String,
}

impl RedisKvStore {
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: prefix.into(),
        })
    }

    fn full_key(&self, namespace: &str, key: &str) -> String {
        format!("{}:{namespace}:{key}", self.prefix)
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(self.full_key(namespace, key)).await?;
        Ok(value)
    }

    async fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.set(self.full_key(namespace, key), value).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(self.full_key(namespace, key)).await?;
        Ok(())
    }
}
