//! Redis-backed [`Backend`] shared by every worker process.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use tracing::info;

use super::backend::{Backend, Batch, BatchOp, ttl_seconds};
use super::error::CacheError;

pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    /// Build a connection pool. No connection is opened until first use, so a
    /// store that is down at startup only shows up as an unavailable cache.
    pub fn connect(url: &str, pool_size: usize, timeout: Duration) -> Result<Self, CacheError> {
        let mut redis_config = deadpool_redis::Config::from_url(url);
        if let Some(ref mut pool_config) = redis_config.pool {
            pool_config.max_size = pool_size;
            pool_config.timeouts.wait = Some(timeout);
            pool_config.timeouts.create = Some(timeout);
            pool_config.timeouts.recycle = Some(timeout);
        } else {
            let mut pool_config = deadpool_redis::PoolConfig::new(pool_size);
            pool_config.timeouts.wait = Some(timeout);
            pool_config.timeouts.create = Some(timeout);
            pool_config.timeouts.recycle = Some(timeout);
            redis_config.pool = Some(pool_config);
        }

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|err| CacheError::configuration("store.url", err.to_string()))?;

        info!(
            target = "tagcache::cache::redis",
            pool_size, "Redis connection pool created"
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|err| CacheError::connection(err.to_string()))
    }
}

fn store_error(err: redis::RedisError) -> CacheError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        CacheError::connection(err.to_string())
    } else if err.is_timeout() {
        CacheError::connection(format!("redis timed out: {err}"))
    } else {
        CacheError::serialization(err.to_string())
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection().await?;
        conn.get::<_, Option<Vec<u8>>>(key).await.map_err(store_error)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        conn.exists::<_, bool>(key).await.map_err(store_error)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(values)
    }

    async fn mset(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<(), CacheError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::new();
        for (key, value) in pairs {
            batch.set(key, value, ttl);
        }
        self.apply(batch).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        conn.del::<_, u64>(keys).await.map_err(store_error)
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection().await?;
        conn.smembers::<_, Vec<String>>(set_key)
            .await
            .map_err(store_error)
    }

    async fn members_many(&self, set_keys: &[String]) -> Result<Vec<Vec<String>>, CacheError> {
        if set_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for key in set_keys {
            pipe.cmd("SMEMBERS").arg(key);
        }
        let members: Vec<Vec<String>> = pipe.query_async(&mut conn).await.map_err(store_error)?;
        Ok(members)
    }

    async fn union(&self, set_keys: &[String]) -> Result<Vec<String>, CacheError> {
        if set_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        conn.sunion::<_, Vec<String>>(set_keys)
            .await
            .map_err(store_error)
    }

    async fn apply(&self, batch: Batch) -> Result<(), CacheError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.into_ops() {
            match op {
                BatchOp::Set { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("EX")
                        .arg(ttl_seconds(ttl))
                        .ignore();
                }
                BatchOp::SetAdd { key, members } => {
                    pipe.cmd("SADD").arg(key).arg(members).ignore();
                }
                BatchOp::SetRemove { key, members } => {
                    pipe.cmd("SREM").arg(key).arg(members).ignore();
                }
                BatchOp::Expire { key, ttl } => {
                    pipe.cmd("EXPIRE").arg(key).arg(ttl_seconds(ttl)).ignore();
                }
                BatchOp::ExtendExpire { key, ttl } => {
                    // NX covers a set without expiry, GT only ever extends (Redis 7+).
                    let seconds = ttl_seconds(ttl);
                    pipe.cmd("EXPIRE").arg(&key).arg(seconds).arg("NX").ignore();
                    pipe.cmd("EXPIRE").arg(key).arg(seconds).arg("GT").ignore();
                }
                BatchOp::Delete { keys } => {
                    pipe.cmd("DEL").arg(keys).ignore();
                }
            }
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(store_error)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
