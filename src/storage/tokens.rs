use std::sync::Arc;
use tracing::{instrument, warn};

use crate::error::{AppError, AppResult};
use crate::kv::{DecrementOutcome, KvStore};
use crate::storage::cancellation::CancellationStore;
use crate::storage::progress::ProgressStore;

/// Token Accountant (§4.1): a per-user token ledger plus per-job spend
/// tracking, backed by the KV adapter's atomic check-and-decrement so
/// concurrent chunk workers can never drive a user's balance negative (P6).
pub struct TokenAccountant {
    kv: Arc<dyn KvStore>,
    progress: Arc<ProgressStore>,
    cancellation: Arc<CancellationStore>,
}

impl TokenAccountant {
    pub fn new(kv: Arc<dyn KvStore>, progress: Arc<ProgressStore>, cancellation: Arc<CancellationStore>) -> Self {
        Self { kv, progress, cancellation }
    }

    fn user_key(user_id: &str) -> String {
        format!("user:{}:tokens", user_id)
    }

    pub async fn get(&self, user_id: &str) -> AppResult<i64> {
        let raw = self.kv.get(&Self::user_key(user_id)).await?;
        Ok(raw
            .and_then(|b| String::from_utf8(b).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    pub async fn set(&self, user_id: &str, amount: i64) -> AppResult<()> {
        self.kv.set(&Self::user_key(user_id), amount.to_string().as_bytes()).await
    }

    pub async fn add(&self, user_id: &str, amount: i64) -> AppResult<()> {
        let current = self.get(user_id).await?;
        self.set(user_id, current + amount).await
    }

    pub async fn set_job_token_budget(&self, job_id: &str, budget_tokens: i64) -> AppResult<()> {
        self.progress.set_job_token_budget(job_id, budget_tokens).await
    }

    /// Debits `amount` from the user's ledger atomically and records the
    /// spend against the job's progress hash. On insufficient balance, the
    /// job is flagged for cancellation and `InsufficientTokens` is returned
    /// so the caller aborts the current unit of work without starting any
    /// further chunk (P6).
    #[instrument(skip(self))]
    pub async fn consume_tokens_for_job(&self, job_id: &str, user_id: &str, amount: i64) -> AppResult<i64> {
        match self.kv.check_and_decrement(&Self::user_key(user_id), amount).await? {
            DecrementOutcome::Applied { remaining } => {
                self.progress.record_job_tokens_spent(job_id, amount).await?;
                Ok(remaining)
            }
            DecrementOutcome::Insufficient { available } => {
                warn!(job_id, user_id, amount, available, "insufficient tokens, cancelling job");
                self.cancellation.request_cancel(job_id).await?;
                Err(AppError::InsufficientTokens(format!(
                    "user {} has {} tokens, needed {}",
                    user_id, available, amount
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::StorageConfig;
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

    fn accountant() -> TokenAccountant {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let progress = Arc::new(ProgressStore::new(kv.clone(), config()));
        let cancellation = Arc::new(CancellationStore::new(kv.clone()));
        TokenAccountant::new(kv, progress, cancellation)
    }

    #[tokio::test]
    async fn consume_never_goes_negative_and_cancels_job() {
        let accountant = accountant();
        accountant.set("u1", 100).await.unwrap();
        accountant.progress.init("job1", 1, "start").await.unwrap();

        let remaining = accountant.consume_tokens_for_job("job1", "u1", 60).await.unwrap();
        assert_eq!(remaining, 40);

        let err = accountant.consume_tokens_for_job("job1", "u1", 60).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientTokens(_)));
        assert!(accountant.cancellation.is_cancelled("job1").await.unwrap());
        assert_eq!(accountant.get("u1").await.unwrap(), 40);
    }

    #[tokio::test]
    async fn add_accumulates_on_top_of_existing_balance() {
        let accountant = accountant();
        accountant.set("u1", 10).await.unwrap();
        accountant.add("u1", 5).await.unwrap();
        assert_eq!(accountant.get("u1").await.unwrap(), 15);
    }
}
