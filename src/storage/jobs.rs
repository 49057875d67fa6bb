use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

use crate::config::settings::StorageConfig;
use crate::error::AppResult;
use crate::kv::KvStore;

/// The `mode` a job was submitted with (§3).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JobMode {
    JokboCentric,
    LessonCentric,
    PartialJokbo,
    ExamOnly,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Flash,
    Pro,
}

/// Job metadata, persisted as a single JSON string at `job:<job>:metadata`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: String,
    pub mode: JobMode,
    pub user_id: String,
    pub model_tier: ModelTier,
    pub multi_api: bool,
    pub min_relevance: i32,
    pub jokbo_keys: Vec<String>,
    pub lesson_keys: Vec<String>,
}

/// Jobs sub-responsibility of the Storage Service: metadata, ownership, and
/// the per-user job index.
pub struct JobStore {
    kv: Arc<dyn KvStore>,
    config: StorageConfig,
}

impl JobStore {
    pub fn new(kv: Arc<dyn KvStore>, config: StorageConfig) -> Self {
        Self { kv, config }
    }

    fn metadata_key(job_id: &str) -> String {
        format!("job:{}:metadata", job_id)
    }

    fn owner_key(job_id: &str) -> String {
        format!("job:{}:user", job_id)
    }

    fn user_jobs_key(user_id: &str) -> String {
        format!("user:{}:jobs", user_id)
    }

    #[instrument(skip(self, metadata))]
    pub async fn store_metadata(&self, metadata: &JobMetadata) -> AppResult<()> {
        let payload = serde_json::to_vec(metadata)?;
        self.kv
            .setex(&Self::metadata_key(&metadata.job_id), self.config.job_metadata_ttl_seconds, &payload)
            .await?;
        self.set_owner(&metadata.job_id, &metadata.user_id).await
    }

    pub async fn get_metadata(&self, job_id: &str) -> AppResult<Option<JobMetadata>> {
        let Some(raw) = self.kv.get(&Self::metadata_key(job_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    pub async fn set_owner(&self, job_id: &str, user_id: &str) -> AppResult<()> {
        self.kv.set(&Self::owner_key(job_id), user_id.as_bytes()).await?;
        self.kv.lpush(&Self::user_jobs_key(user_id), job_id).await
    }

    pub async fn get_owner(&self, job_id: &str) -> AppResult<Option<String>> {
        let raw = self.kv.get(&Self::owner_key(job_id)).await?;
        Ok(raw.map(|b| String::from_utf8_lossy(&b).to_string()))
    }

    pub async fn list_user_jobs(&self, user_id: &str, limit: isize) -> AppResult<Vec<String>> {
        self.kv.lrange(&Self::user_jobs_key(user_id), 0, limit.max(1) - 1).await
    }

    pub async fn remove_user_job(&self, user_id: &str, job_id: &str) -> AppResult<()> {
        self.kv.lrem(&Self::user_jobs_key(user_id), job_id).await
    }
}
