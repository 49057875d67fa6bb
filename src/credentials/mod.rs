//! API Credential Pool (§4.2): round-robin dispatch across several vendor
//! credentials with a flat cooldown after repeated failures. A success-rate
//! ranking scheme was considered and deliberately not used; round robin is
//! the authoritative policy here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::error::{AppError, AppResult};
use crate::llm::LlmClient;

const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const COOLDOWN_DURATION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct CredentialStatus {
    pub index: usize,
    pub available: bool,
    pub cooldown_remaining_secs: u64,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

struct Credential {
    client: Arc<dyn LlmClient>,
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
    total_requests: u64,
    total_failures: u64,
    last_error: Option<String>,
}

impl Credential {
    fn is_available(&self) -> bool {
        match self.cooldown_until {
            Some(deadline) => Instant::now() >= deadline,
            None => true,
        }
    }
}

/// Round-robin pool of vendor credentials with failure-driven cooldowns.
pub struct CredentialPool {
    credentials: Mutex<Vec<Credential>>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    pub fn new(clients: Vec<Arc<dyn LlmClient>>) -> Self {
        let credentials = clients
            .into_iter()
            .map(|client| Credential {
                client,
                cooldown_until: None,
                consecutive_failures: 0,
                total_requests: 0,
                total_failures: 0,
                last_error: None,
            })
            .collect();
        Self { credentials: Mutex::new(credentials), cursor: AtomicUsize::new(0) }
    }

    /// Returns the next available credential's index and client, advancing
    /// the round-robin cursor regardless of whether this call finds one.
    async fn next_available(&self) -> Option<(usize, Arc<dyn LlmClient>)> {
        let credentials = self.credentials.lock().await;
        if credentials.is_empty() {
            return None;
        }
        let n = credentials.len();
        let start = self.cursor.fetch_add(1, Ordering::SeqCst) % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if credentials[idx].is_available() {
                return Some((idx, credentials[idx].client.clone()));
            }
        }
        None
    }

    async fn mark_success(&self, index: usize) {
        let mut credentials = self.credentials.lock().await;
        if let Some(cred) = credentials.get_mut(index) {
            cred.total_requests += 1;
            cred.consecutive_failures = 0;
            cred.cooldown_until = None;
        }
    }

    async fn mark_failure(&self, index: usize, error: &AppError) {
        let mut credentials = self.credentials.lock().await;
        if let Some(cred) = credentials.get_mut(index) {
            cred.total_requests += 1;
            cred.total_failures += 1;
            cred.last_error = Some(error.to_string());
            if error.is_credential_failure() {
                cred.consecutive_failures += 1;
                if cred.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    cred.cooldown_until = Some(Instant::now() + COOLDOWN_DURATION);
                    warn!(index, "credential entering cooldown after repeated failures");
                }
            }
        }
    }

    /// Runs `operation` against the next available credential, retrying on
    /// a fresh credential up to `max_retries` times. Sleeps and retries the
    /// whole pool when every credential is in cooldown, mirroring the
    /// original's blocking wait rather than failing fast.
    #[instrument(skip(self, operation))]
    pub async fn execute_with_failover<F, Fut, T>(&self, max_retries: u32, operation: F) -> AppResult<T>
    where
        F: Fn(Arc<dyn LlmClient>) -> Fut,
        Fut: std::future::Future<Output = AppResult<T>>,
    {
        let mut attempts = 0;
        loop {
            let Some((index, client)) = self.next_available().await else {
                if attempts >= max_retries {
                    return Err(AppError::NoCredentialsAvailable(
                        "all credentials are in cooldown".to_string(),
                    ));
                }
                warn!("no credentials available, sleeping before retry");
                sleep(Duration::from_secs(30)).await;
                attempts += 1;
                continue;
            };

            match operation(client).await {
                Ok(value) => {
                    self.mark_success(index).await;
                    return Ok(value);
                }
                Err(error) => {
                    self.mark_failure(index, &error).await;
                    if error.is_permanent() || attempts >= max_retries {
                        return Err(error);
                    }
                    info!(index, attempts, "retrying operation on a different credential");
                    attempts += 1;
                }
            }
        }
    }

    /// Fans `tasks` out across a worker pool sized
    /// `min(max_workers, pool_size * per_key_limit, tasks.len())`. Each task's `operation`
    /// result is collected in submission order; a task that exhausts
    /// failover is folded into the output as an `Err` rather than aborting
    /// the whole batch, and `on_progress` is invoked after every task
    /// regardless of outcome.
    #[instrument(skip(self, tasks, operation, on_progress), fields(task_count = tasks.len()))]
    pub async fn distribute<T, R, F, Fut>(
        self: &Arc<Self>,
        tasks: Vec<T>,
        per_key_limit: usize,
        max_workers: usize,
        operation: F,
        on_progress: impl Fn(usize, usize) + Send + Sync + 'static,
    ) -> Vec<AppResult<R>>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(Arc<dyn LlmClient>, T) -> Fut + Send + Sync + 'static + Clone,
        Fut: std::future::Future<Output = AppResult<R>> + Send,
    {
        let pool_size = self.pool_size().await.max(1);
        let safe_workers = max_workers.min(pool_size * per_key_limit.max(1)).min(tasks.len().max(1)).max(1);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(safe_workers));
        let on_progress = Arc::new(on_progress);
        let total = tasks.len();
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let pool = self.clone();
            let permit = semaphore.clone();
            let op = operation.clone();
            let on_progress = on_progress.clone();
            let completed = completed.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore closed");
                let result = pool
                    .execute_with_failover(3, move |client| {
                        let task = task.clone();
                        let op = op.clone();
                        async move { op(client, task).await }
                    })
                    .await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                on_progress(done, total);
                result
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|e| Err(AppError::Internal(format!("task panicked: {}", e)))));
        }
        results
    }

    pub async fn status_report(&self) -> Vec<CredentialStatus> {
        let credentials = self.credentials.lock().await;
        credentials
            .iter()
            .enumerate()
            .map(|(index, cred)| CredentialStatus {
                index,
                available: cred.is_available(),
                cooldown_remaining_secs: cred
                    .cooldown_until
                    .map(|d| d.saturating_duration_since(Instant::now()).as_secs())
                    .unwrap_or(0),
                consecutive_failures: cred.consecutive_failures,
                total_requests: cred.total_requests,
                total_failures: cred.total_failures,
                last_error: cred.last_error.clone(),
            })
            .collect()
    }

    pub async fn pool_size(&self) -> usize {
        self.credentials.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerationRequest, GenerationResponse, UploadedFile};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FlakyClient {
        failures_before_success: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn upload_file(&self, _bytes: &[u8], _display_name: &str, _mime_type: &str) -> AppResult<UploadedFile> {
            unimplemented!()
        }
        async fn delete_file(&self, _name: &str) -> AppResult<()> {
            unimplemented!()
        }
        async fn list_files(&self) -> AppResult<Vec<UploadedFile>> {
            unimplemented!()
        }
        async fn generate_content(&self, _request: &GenerationRequest) -> AppResult<GenerationResponse> {
            let remaining = self.failures_before_success.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                Err(AppError::QuotaExceeded("simulated".to_string()))
            } else {
                Ok(GenerationResponse { text: "ok".to_string(), finish_reason: None, prompt_tokens: 1, output_tokens: 1 })
            }
        }
    }

    #[tokio::test]
    async fn failover_moves_to_next_credential_on_failure() {
        let always_fails: Arc<dyn LlmClient> =
            Arc::new(FlakyClient { failures_before_success: AtomicU32::new(100) });
        let always_succeeds: Arc<dyn LlmClient> =
            Arc::new(FlakyClient { failures_before_success: AtomicU32::new(0) });
        let pool = CredentialPool::new(vec![always_fails, always_succeeds]);

        let request = GenerationRequest { system_prompt: None, file_uris: vec![], prompt: "hi".to_string() };
        let result = pool
            .execute_with_failover(3, |client| {
                let request = request.clone();
                async move { client.generate_content(&request).await }
            })
            .await
            .unwrap();
        assert_eq!(result.text, "ok");
    }

    #[tokio::test]
    async fn three_consecutive_failures_trigger_cooldown() {
        let flaky: Arc<dyn LlmClient> = Arc::new(FlakyClient { failures_before_success: AtomicU32::new(100) });
        let pool = CredentialPool::new(vec![flaky]);
        let request = GenerationRequest { system_prompt: None, file_uris: vec![], prompt: "hi".to_string() };

        for _ in 0..3 {
            let _ = pool
                .execute_with_failover(0, |client| {
                    let request = request.clone();
                    async move { client.generate_content(&request).await }
                })
                .await;
        }

        let status = pool.status_report().await;
        assert_eq!(status[0].consecutive_failures, 3);
        assert!(!status[0].available);
    }
}
