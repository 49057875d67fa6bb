//! Key-Value/Blob Store Adapter.
//!
//! Abstracts the Redis-like primitives the rest of the crate is built on:
//! strings, hashes, sets, lists, TTL management, scan, and a Lua-style
//! atomic script for check-and-decrement token consumption. Two
//! implementations exist behind the [`KvStore`] trait: [`redis_store::RedisKv`]
//! for production and [`memory_store::MemoryKv`] for tests, so Storage
//! Service / Token Accountant / Credential cooldown logic never needs a
//! live Redis instance to be exercised.

pub mod memory_store;
pub mod redis_store;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::AppResult;

/// Outcome of an atomic check-and-decrement against an integer counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// The balance was >= the requested amount; it was decremented.
    Applied { remaining: i64 },
    /// The balance was insufficient; no mutation occurred.
    Insufficient { available: i64 },
}

#[async_trait]
pub trait KvStore: Send + Sync {
    // -- strings --
    async fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> AppResult<()>;
    async fn setex(&self, key: &str, ttl_seconds: u64, value: &[u8]) -> AppResult<()>;
    async fn del(&self, key: &str) -> AppResult<()>;
    async fn exists(&self, key: &str) -> AppResult<bool>;

    // -- hashes --
    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> AppResult<()>;
    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> AppResult<()>;
    async fn hget(&self, key: &str, field: &str) -> AppResult<Option<Vec<u8>>>;
    async fn hgetall(&self, key: &str) -> AppResult<HashMap<String, String>>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> AppResult<i64>;
    async fn hsetnx(&self, key: &str, field: &str, value: &[u8]) -> AppResult<bool>;

    // -- sets --
    async fn sadd(&self, key: &str, member: &str) -> AppResult<()>;
    async fn srem(&self, key: &str, member: &str) -> AppResult<()>;
    async fn smembers(&self, key: &str) -> AppResult<Vec<String>>;
    async fn sismember(&self, key: &str, member: &str) -> AppResult<bool>;

    // -- lists --
    async fn lpush(&self, key: &str, value: &str) -> AppResult<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> AppResult<Vec<String>>;
    async fn lrem(&self, key: &str, value: &str) -> AppResult<()>;

    // -- TTL / scan --
    async fn expire(&self, key: &str, ttl_seconds: u64) -> AppResult<()>;
    /// Redis semantics: -2 if the key does not exist, -1 if it has no TTL,
    /// otherwise the remaining seconds.
    async fn ttl(&self, key: &str) -> AppResult<i64>;
    async fn scan(&self, pattern: &str) -> AppResult<Vec<String>>;

    /// Atomic check-and-decrement, equivalent to a Lua `EVAL` script:
    /// reads the integer at `key` (defaulting to 0 if absent), and if it is
    /// >= `amount`, decrements it and returns `Applied`; otherwise leaves it
    /// untouched and returns `Insufficient`. Used by the Token Accountant
    /// to guarantee P6 (ledger never goes negative) under concurrent callers.
    async fn check_and_decrement(&self, key: &str, amount: i64) -> AppResult<DecrementOutcome>;

    /// Pipeline-style batch of TTL refreshes, issued as a single round trip
    /// where the backend supports it.
    async fn expire_many(&self, keys: &[String], ttl_seconds: u64) -> AppResult<()>;
}
