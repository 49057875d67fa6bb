use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::instrument;

use crate::config::settings::StorageConfig;
use crate::error::AppResult;
use crate::kv::KvStore;

/// Progress Record (§3): a single hash per job, hosting both chunk-progress
/// fields and the job-scoped token budget fields the Token Accountant reads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub started_at: u64,
    pub progress: u32,
    pub message: String,
    pub avg_chunk_seconds: f64,
    pub eta_seconds: f64,
    pub job_token_budget: Option<i64>,
    pub job_tokens_spent: i64,
}

impl Default for ProgressRecord {
    fn default() -> Self {
        Self {
            total_chunks: 0,
            completed_chunks: 0,
            started_at: now_unix(),
            progress: 0,
            message: String::new(),
            avg_chunk_seconds: 0.0,
            eta_seconds: 0.0,
            job_token_budget: None,
            job_tokens_spent: 0,
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Progress sub-responsibility of the Storage Service.
pub struct ProgressStore {
    kv: Arc<dyn KvStore>,
    config: StorageConfig,
}

impl ProgressStore {
    pub fn new(kv: Arc<dyn KvStore>, config: StorageConfig) -> Self {
        Self { kv, config }
    }

    fn key(job_id: &str) -> String {
        format!("progress:{}", job_id)
    }

    /// `init` never shrinks `total_chunks` or `completed_chunks` on
    /// reinitialization (P2).
    #[instrument(skip(self))]
    pub async fn init(&self, job_id: &str, total: u32, message: &str) -> AppResult<()> {
        let key = Self::key(job_id);
        let existing = self.get(job_id).await?;
        let total_chunks = existing.as_ref().map(|p| p.total_chunks.max(total)).unwrap_or(total);
        let completed_chunks = existing.as_ref().map(|p| p.completed_chunks).unwrap_or(0);
        let started_at = existing.as_ref().map(|p| p.started_at).unwrap_or_else(now_unix);
        let progress = compute_progress(completed_chunks, total_chunks);

        let record = ProgressRecord {
            total_chunks,
            completed_chunks,
            started_at,
            progress,
            message: message.to_string(),
            avg_chunk_seconds: existing.as_ref().map(|p| p.avg_chunk_seconds).unwrap_or(0.0),
            eta_seconds: existing.as_ref().map(|p| p.eta_seconds).unwrap_or(0.0),
            job_token_budget: existing.as_ref().and_then(|p| p.job_token_budget),
            job_tokens_spent: existing.as_ref().map(|p| p.job_tokens_spent).unwrap_or(0),
        };
        self.write(&key, &record).await?;
        self.kv.expire(&key, self.config.progress_ttl_seconds).await
    }

    /// Atomically bumps `completed_chunks`, recomputes `progress` (capped at
    /// 99 until `finalize`) and `eta_seconds` from the running mean of
    /// completed-chunk duration (§9 "intentionally naive" ETA).
    #[instrument(skip(self))]
    pub async fn tick(&self, job_id: &str, inc: u32, message: Option<&str>) -> AppResult<ProgressRecord> {
        let key = Self::key(job_id);
        let completed = self.kv.hincrby(&key, "completed_chunks", inc as i64).await?.max(0) as u32;
        let mut record = self.get(job_id).await?.unwrap_or_default();
        record.completed_chunks = completed.min(record.total_chunks.max(completed));
        if record.total_chunks == 0 {
            record.total_chunks = record.completed_chunks;
        }

        let elapsed = now_unix().saturating_sub(record.started_at).max(0) as f64;
        if record.completed_chunks > 0 {
            record.avg_chunk_seconds = elapsed / record.completed_chunks as f64;
        }
        let remaining = record.total_chunks.saturating_sub(record.completed_chunks) as f64;
        record.eta_seconds = record.avg_chunk_seconds * remaining;
        record.progress = compute_progress(record.completed_chunks, record.total_chunks);
        if let Some(msg) = message {
            record.message = msg.to_string();
        }
        self.write(&key, &record).await?;
        self.kv.expire(&key, self.config.progress_ttl_seconds).await?;
        Ok(record)
    }

    /// Sets `completed := total`, `progress := 100`. Idempotent (R2).
    #[instrument(skip(self))]
    pub async fn finalize(&self, job_id: &str, message: &str) -> AppResult<()> {
        let key = Self::key(job_id);
        let mut record = self.get(job_id).await?.unwrap_or_default();
        record.completed_chunks = record.total_chunks;
        record.progress = 100;
        record.eta_seconds = 0.0;
        record.message = message.to_string();
        self.write(&key, &record).await?;
        self.kv.expire(&key, self.config.progress_ttl_seconds).await
    }

    pub async fn get(&self, job_id: &str) -> AppResult<Option<ProgressRecord>> {
        let fields = self.kv.hgetall(&Self::key(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(ProgressRecord {
            total_chunks: parse_or(&fields, "total_chunks", 0),
            completed_chunks: parse_or(&fields, "completed_chunks", 0),
            started_at: parse_or(&fields, "started_at", now_unix()),
            progress: parse_or(&fields, "progress", 0),
            message: fields.get("message").cloned().unwrap_or_default(),
            avg_chunk_seconds: parse_or(&fields, "avg_chunk_seconds", 0.0),
            eta_seconds: parse_or(&fields, "eta_seconds", 0.0),
            job_token_budget: fields.get("job_token_budget").and_then(|v| v.parse().ok()),
            job_tokens_spent: parse_or(&fields, "job_tokens_spent", 0),
        }))
    }

    async fn write(&self, key: &str, record: &ProgressRecord) -> AppResult<()> {
        let mut fields = HashMap::new();
        fields.insert("total_chunks".to_string(), record.total_chunks.to_string());
        fields.insert("completed_chunks".to_string(), record.completed_chunks.to_string());
        fields.insert("started_at".to_string(), record.started_at.to_string());
        fields.insert("progress".to_string(), record.progress.to_string());
        fields.insert("message".to_string(), record.message.clone());
        fields.insert("avg_chunk_seconds".to_string(), record.avg_chunk_seconds.to_string());
        fields.insert("eta_seconds".to_string(), record.eta_seconds.to_string());
        if let Some(budget) = record.job_token_budget {
            fields.insert("job_token_budget".to_string(), budget.to_string());
        }
        fields.insert("job_tokens_spent".to_string(), record.job_tokens_spent.to_string());
        self.kv.hset_all(key, &fields).await
    }

    pub async fn set_job_token_budget(&self, job_id: &str, budget_tokens: i64) -> AppResult<()> {
        let key = Self::key(job_id);
        let mut record = self.get(job_id).await?.unwrap_or_default();
        record.job_token_budget = Some(budget_tokens);
        self.write(&key, &record).await?;
        self.kv.expire(&key, self.config.progress_ttl_seconds).await
    }

    /// Debits the job-scoped spend counter; returns the new spend total.
    /// Does not touch the user ledger — that is the Token Accountant's job.
    pub async fn record_job_tokens_spent(&self, job_id: &str, amount: i64) -> AppResult<i64> {
        self.kv.hincrby(&Self::key(job_id), "job_tokens_spent", amount).await
    }
}

/// `progress = floor(100 * completed / total)` capped at 99 until finalize.
fn compute_progress(completed: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let raw = (100 * completed as u64) / total as u64;
    raw.min(99) as u32
}

fn parse_or<T: std::str::FromStr>(fields: &HashMap<String, String>, key: &str, default: T) -> T {
    fields.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory_store::MemoryKv;

    fn config() -> StorageConfig {
        StorageConfig {
            storage_root: "/tmp".to_string(),
            file_ttl_seconds: 86400,
            job_metadata_ttl_seconds: 172800,
            result_ttl_seconds: 172800,
            progress_ttl_seconds: 172800,
        }
    }

    #[tokio::test]
    async fn init_is_monotonic_across_reinitializations() {
        let store = ProgressStore::new(Arc::new(MemoryKv::new()), config());
        store.init("job1", 10, "start").await.unwrap();
        store.tick("job1", 3, None).await.unwrap();
        store.init("job1", 5, "re-init with smaller total").await.unwrap();
        let record = store.get("job1").await.unwrap().unwrap();
        assert_eq!(record.total_chunks, 10);
        assert_eq!(record.completed_chunks, 3);
    }

    #[tokio::test]
    async fn progress_caps_at_99_until_finalize() {
        let store = ProgressStore::new(Arc::new(MemoryKv::new()), config());
        store.init("job1", 4, "start").await.unwrap();
        store.tick("job1", 4, None).await.unwrap();
        let record = store.get("job1").await.unwrap().unwrap();
        assert_eq!(record.completed_chunks, 4);
        assert_eq!(record.progress, 99);

        store.finalize("job1", "완료").await.unwrap();
        let record = store.get("job1").await.unwrap().unwrap();
        assert_eq!(record.progress, 100);
        assert_eq!(record.completed_chunks, record.total_chunks);
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let store = ProgressStore::new(Arc::new(MemoryKv::new()), config());
        store.init("job1", 2, "start").await.unwrap();
        store.finalize("job1", "완료").await.unwrap();
        store.finalize("job1", "완료").await.unwrap();
        let record = store.get("job1").await.unwrap().unwrap();
        assert_eq!(record.progress, 100);
        assert_eq!(record.completed_chunks, 2);
    }
}
