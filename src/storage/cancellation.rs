use std::sync::Arc;
use tracing::instrument;

use crate::error::AppResult;
use crate::kv::KvStore;

/// How long a cancellation flag survives — long enough for any worker that
/// polls only occasionally to still observe it before the job's other state
/// expires (§4.1 Cancellation Flag).
const CANCEL_FLAG_TTL_SECONDS: u64 = 172_800;

/// Cancellation sub-responsibility of the Storage Service: a single flag per
/// job that workers poll between chunks.
pub struct CancellationStore {
    kv: Arc<dyn KvStore>,
}

impl CancellationStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(job_id: &str) -> String {
        format!("job:{}:cancelled", job_id)
    }

    #[instrument(skip(self))]
    pub async fn request_cancel(&self, job_id: &str) -> AppResult<()> {
        let key = Self::key(job_id);
        self.kv.set(&key, b"1").await?;
        self.kv.expire(&key, CANCEL_FLAG_TTL_SECONDS).await
    }

    pub async fn is_cancelled(&self, job_id: &str) -> AppResult<bool> {
        self.kv.exists(&Self::key(job_id)).await
    }

    pub async fn clear(&self, job_id: &str) -> AppResult<()> {
        self.kv.del(&Self::key(job_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory_store::MemoryKv;

    #[tokio::test]
    async fn request_cancel_is_observable_and_clearable() {
        let store = CancellationStore::new(Arc::new(MemoryKv::new()));
        assert!(!store.is_cancelled("job1").await.unwrap());
        store.request_cancel("job1").await.unwrap();
        assert!(store.is_cancelled("job1").await.unwrap());
        store.clear("job1").await.unwrap();
        assert!(!store.is_cancelled("job1").await.unwrap());
    }
}
