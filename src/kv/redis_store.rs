use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::config::settings::RedisConfig;
use crate::error::{AppError, AppResult};
use crate::kv::{DecrementOutcome, KvStore};

/// Lua script mirroring a Redis `EVAL` check-and-decrement: only mutates the
/// counter when the current balance covers the requested amount, so a batch
/// of concurrent callers never drives the ledger negative (P6).
const CHECK_AND_DECREMENT_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
if current >= amount then
    redis.call('DECRBY', KEYS[1], amount)
    return {1, current - amount}
else
    return {0, current}
end
"#;

pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(config: &RedisConfig) -> AppResult<Self> {
        let client = redis::Client::open(config.url.clone())
            .map_err(|e| AppError::Configuration(format!("invalid REDIS_URL: {}", e)))?;
        let conn = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            client.get_connection_manager(),
        )
        .await
        .map_err(|_| AppError::StorageUnavailable("timed out connecting to redis".to_string()))?
        .map_err(AppError::from)?;
        Ok(Self { conn })
    }

    /// Retries a transient redis operation up to three times with a short
    /// fixed backoff, matching the storage layer's `_with_retry` convention.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < 2 && e.is_io_error() => {
                    attempt += 1;
                    warn!("redis operation failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => return Err(AppError::from(e)),
            }
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        self.with_retry(move || {
            let mut conn = conn.clone();
            let key = key.to_string();
            async move { conn.get(key).await }
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8]) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await.map_err(AppError::from)
    }

    async fn setex(&self, key: &str, ttl_seconds: u64, value: &[u8]) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds)
            .await
            .map_err(AppError::from)
    }

    async fn del(&self, key: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(AppError::from)
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(AppError::from)
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(AppError::from)
    }

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let pairs: Vec<(String, String)> = fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        conn.hset_multiple::<_, _, _, ()>(key, &pairs)
            .await
            .map_err(AppError::from)
    }

    async fn hget(&self, key: &str, field: &str) -> AppResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(AppError::from)
    }

    async fn hgetall(&self, key: &str) -> AppResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(AppError::from)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        conn.hincr(key, field, delta).await.map_err(AppError::from)
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &[u8]) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        conn.hset_nx(key, field, value).await.map_err(AppError::from)
    }

    async fn sadd(&self, key: &str, member: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await.map_err(AppError::from)
    }

    async fn srem(&self, key: &str, member: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await.map_err(AppError::from)
    }

    async fn smembers(&self, key: &str) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(AppError::from)
    }

    async fn sismember(&self, key: &str, member: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(key, member).await.map_err(AppError::from)
    }

    async fn lpush(&self, key: &str, value: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key, value).await.map_err(AppError::from)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange(key, start, stop).await.map_err(AppError::from)
    }

    async fn lrem(&self, key: &str, value: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(key, 0, value).await.map_err(AppError::from)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl_seconds as i64)
            .await
            .map_err(AppError::from)
    }

    async fn ttl(&self, key: &str) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        conn.ttl(key).await.map_err(AppError::from)
    }

    async fn scan(&self, pattern: &str) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(pattern)
            .await
            .map_err(AppError::from)?;
        let mut out = Vec::new();
        while let Some(key) = futures_util::StreamExt::next(&mut iter).await {
            out.push(key);
        }
        Ok(out)
    }

    async fn check_and_decrement(&self, key: &str, amount: i64) -> AppResult<DecrementOutcome> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(CHECK_AND_DECREMENT_SCRIPT);
        let (applied, value): (i64, i64) = script
            .key(key)
            .arg(amount)
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::from)?;
        Ok(if applied == 1 {
            DecrementOutcome::Applied { remaining: value }
        } else {
            DecrementOutcome::Insufficient { available: value }
        })
    }

    async fn expire_many(&self, keys: &[String], ttl_seconds: u64) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.expire(key, ttl_seconds as i64).ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(AppError::from)
    }
}
