use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::AppResult;
use crate::kv::{DecrementOutcome, KvStore};

struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn fresh(value: T) -> Self {
        Self { value, expires_at: None }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

/// In-memory stand-in for the Redis-backed adapter, used by tests so Storage
/// Service / Token Accountant / Credential cooldown logic can be exercised
/// without a live Redis instance (see §10.4).
#[derive(Default)]
pub struct MemoryKv {
    strings: DashMap<String, Entry<Vec<u8>>>,
    hashes: DashMap<String, Entry<HashMap<String, String>>>,
    sets: DashMap<String, Entry<HashSet<String>>>,
    lists: DashMap<String, Entry<VecDeque<String>>>,
    decrement_lock: Mutex<()>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep_string(&self, key: &str) {
        if let Some(e) = self.strings.get(key) {
            if !e.is_live() {
                drop(e);
                self.strings.remove(key);
            }
        }
    }

    fn sweep_hash(&self, key: &str) {
        if let Some(e) = self.hashes.get(key) {
            if !e.is_live() {
                drop(e);
                self.hashes.remove(key);
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>> {
        self.sweep_string(key);
        Ok(self.strings.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> AppResult<()> {
        self.strings
            .insert(key.to_string(), Entry::fresh(value.to_vec()));
        Ok(())
    }

    async fn setex(&self, key: &str, ttl_seconds: u64, value: &[u8]) -> AppResult<()> {
        self.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> AppResult<()> {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.sets.remove(key);
        self.lists.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        self.sweep_string(key);
        Ok(self.strings.contains_key(key) || self.hashes.contains_key(key))
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> AppResult<()> {
        let mut entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Entry::fresh(HashMap::new()));
        entry
            .value
            .insert(field.to_string(), String::from_utf8_lossy(value).to_string());
        Ok(())
    }

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> AppResult<()> {
        let mut entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Entry::fresh(HashMap::new()));
        for (k, v) in fields {
            entry.value.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> AppResult<Option<Vec<u8>>> {
        self.sweep_hash(key);
        Ok(self
            .hashes
            .get(key)
            .and_then(|e| e.value.get(field).cloned())
            .map(|s| s.into_bytes()))
    }

    async fn hgetall(&self, key: &str) -> AppResult<HashMap<String, String>> {
        self.sweep_hash(key);
        Ok(self
            .hashes
            .get(key)
            .map(|e| e.value.clone())
            .unwrap_or_default())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> AppResult<i64> {
        let mut entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Entry::fresh(HashMap::new()));
        let current = entry
            .value
            .get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        entry.value.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &[u8]) -> AppResult<bool> {
        let mut entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Entry::fresh(HashMap::new()));
        if entry.value.contains_key(field) {
            Ok(false)
        } else {
            entry
                .value
                .insert(field.to_string(), String::from_utf8_lossy(value).to_string());
            Ok(true)
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> AppResult<()> {
        let mut entry = self
            .sets
            .entry(key.to_string())
            .or_insert_with(|| Entry::fresh(HashSet::new()));
        entry.value.insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> AppResult<()> {
        if let Some(mut entry) = self.sets.get_mut(key) {
            entry.value.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> AppResult<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|e| e.value.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> AppResult<bool> {
        Ok(self
            .sets
            .get(key)
            .map(|e| e.value.contains(member))
            .unwrap_or(false))
    }

    async fn lpush(&self, key: &str, value: &str) -> AppResult<()> {
        let mut entry = self
            .lists
            .entry(key.to_string())
            .or_insert_with(|| Entry::fresh(VecDeque::new()));
        entry.value.push_front(value.to_string());
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> AppResult<Vec<String>> {
        let Some(entry) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = entry.value.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 { (len + i).max(0) } else { i.min(len) }
        };
        let (s, e) = (norm(start), norm(stop) + 1);
        if s >= e {
            return Ok(Vec::new());
        }
        Ok(entry
            .value
            .iter()
            .skip(s as usize)
            .take((e - s) as usize)
            .cloned()
            .collect())
    }

    async fn lrem(&self, key: &str, value: &str) -> AppResult<()> {
        if let Some(mut entry) = self.lists.get_mut(key) {
            entry.value.retain(|v| v != value);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> AppResult<()> {
        let deadline = Some(Instant::now() + Duration::from_secs(ttl_seconds));
        if let Some(mut e) = self.strings.get_mut(key) {
            e.expires_at = deadline;
        }
        if let Some(mut e) = self.hashes.get_mut(key) {
            e.expires_at = deadline;
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> AppResult<i64> {
        self.sweep_string(key);
        self.sweep_hash(key);
        let deadline = self
            .strings
            .get(key)
            .and_then(|e| e.expires_at)
            .or_else(|| self.hashes.get(key).and_then(|e| e.expires_at));
        Ok(match deadline {
            Some(d) => (d.saturating_duration_since(Instant::now())).as_secs() as i64,
            None => {
                if self.strings.contains_key(key) || self.hashes.contains_key(key) {
                    -1
                } else {
                    -2
                }
            }
        })
    }

    async fn scan(&self, pattern: &str) -> AppResult<Vec<String>> {
        let glob = glob_to_prefix_suffix(pattern);
        let mut out: Vec<String> = self
            .strings
            .iter()
            .map(|e| e.key().clone())
            .chain(self.hashes.iter().map(|e| e.key().clone()))
            .filter(|k| glob.matches(k))
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn check_and_decrement(&self, key: &str, amount: i64) -> AppResult<DecrementOutcome> {
        let _guard = self.decrement_lock.lock().unwrap();
        self.sweep_string(key);
        let current = self
            .strings
            .get(key)
            .and_then(|e| std::str::from_utf8(&e.value).ok().and_then(|s| s.parse::<i64>().ok()))
            .unwrap_or(0);
        if current >= amount {
            let remaining = current - amount;
            self.strings
                .insert(key.to_string(), Entry::fresh(remaining.to_string().into_bytes()));
            Ok(DecrementOutcome::Applied { remaining })
        } else {
            Ok(DecrementOutcome::Insufficient { available: current })
        }
    }

    async fn expire_many(&self, keys: &[String], ttl_seconds: u64) -> AppResult<()> {
        for key in keys {
            self.expire(key, ttl_seconds).await?;
        }
        Ok(())
    }
}

/// Minimal `*`-only glob matcher, sufficient for the `kind:*` scan patterns
/// this crate issues (no character classes, no `?`).
struct SimpleGlob {
    parts: Vec<String>,
}

fn glob_to_prefix_suffix(pattern: &str) -> SimpleGlob {
    SimpleGlob {
        parts: pattern.split('*').map(|s| s.to_string()).collect(),
    }
}

impl SimpleGlob {
    fn matches(&self, candidate: &str) -> bool {
        if self.parts.len() == 1 {
            return candidate == self.parts[0];
        }
        let mut rest = candidate;
        for (i, part) in self.parts.iter().enumerate() {
            if i == 0 {
                if !rest.starts_with(part.as_str()) {
                    return false;
                }
                rest = &rest[part.len()..];
            } else if i == self.parts.len() - 1 {
                return rest.ends_with(part.as_str());
            } else if let Some(pos) = rest.find(part.as_str()) {
                rest = &rest[pos + part.len()..];
            } else {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hincrby_accumulates() {
        let kv = MemoryKv::new();
        kv.hincrby("progress:job1", "completed_chunks", 1).await.unwrap();
        let n = kv.hincrby("progress:job1", "completed_chunks", 1).await.unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn check_and_decrement_never_goes_negative() {
        let kv = MemoryKv::new();
        kv.set("user:u1:tokens", b"5").await.unwrap();
        let first = kv.check_and_decrement("user:u1:tokens", 3).await.unwrap();
        assert_eq!(first, DecrementOutcome::Applied { remaining: 2 });
        let second = kv.check_and_decrement("user:u1:tokens", 3).await.unwrap();
        assert_eq!(second, DecrementOutcome::Insufficient { available: 2 });
    }

    #[tokio::test]
    async fn scan_matches_prefix_and_suffix_pattern() {
        let kv = MemoryKv::new();
        kv.set("result:job1:a.pdf", b"x").await.unwrap();
        kv.set("result:job1:b.pdf", b"y").await.unwrap();
        kv.set("result:job2:c.pdf", b"z").await.unwrap();
        let mut keys = kv.scan("result:job1:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["result:job1:a.pdf", "result:job1:b.pdf"]);
    }

    #[tokio::test]
    async fn ttl_reports_absent_and_persistent_keys() {
        let kv = MemoryKv::new();
        assert_eq!(kv.ttl("missing").await.unwrap(), -2);
        kv.set("present", b"v").await.unwrap();
        assert_eq!(kv.ttl("present").await.unwrap(), -1);
    }
}
