//! Job Runner (§4.7): the top-level entrypoints `run_jokbo_analysis`,
//! `run_lesson_analysis`, `generate_partial_jokbo`, `batch_analyze_single`,
//! and `aggregate_batch`. Visual PDF layout is explicitly out of scope (a
//! Non-goal); [`ResultBuilder`] is the seam an external PDF builder would
//! plug into, and [`JsonResultBuilder`] simply persists the merged analysis.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::analyzers::partial_jokbo::PartialJokboAnalyzer;
use crate::analyzers::AnalysisContext;
use crate::config::settings::AppSettings;
use crate::credentials::CredentialPool;
use crate::error::{AppError, AppResult};
use crate::llm::{google_client::GoogleLlmClient, LlmClient};
use crate::merger;
use crate::orchestrator::{self, ChunkedExamOnlyRequest, ChunkedJokboRequest, ChunkedLessonRequest};
use crate::parser::ParseMode;
use crate::pdf;
use crate::storage::{JobMetadata, JobMode, ModelTier, StorageService};

/// The seam where an external PDF builder would plug in (Non-goal: this
/// crate has no opinion on visual layout). Given the merged, filtered
/// analysis for one primary file, produces the bytes to persist as that
/// file's result artifact.
pub trait ResultBuilder: Send + Sync {
    fn build(&self, primary_filename: &str, analysis: &Value) -> AppResult<Vec<u8>>;
    fn output_filename(&self, primary_stem: &str) -> String;
}

/// Persists the merged analysis document as pretty JSON, unchanged.
pub struct JsonResultBuilder;

impl ResultBuilder for JsonResultBuilder {
    fn build(&self, _primary_filename: &str, analysis: &Value) -> AppResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(analysis)?)
    }
    fn output_filename(&self, primary_stem: &str) -> String {
        format!("{}_result.json", primary_stem)
    }
}

/// Aggregated per-file warnings normalized into the final job payload.
#[derive(Default)]
struct AggregatedWarnings {
    failed_files: Vec<String>,
    failed_chunks: usize,
}

impl AggregatedWarnings {
    fn extend(&mut self, filename: &str, outcome: &orchestrator::ChunkedAnalysisOutcome) {
        if !outcome.failed_chunks.is_empty() {
            self.failed_chunks += outcome.failed_chunks.len();
            self.failed_files.push(filename.to_string());
        }
    }

    fn into_payload(self, base: Value) -> Value {
        let mut payload = base;
        if !self.failed_files.is_empty() || self.failed_chunks > 0 {
            let mut seen = std::collections::HashSet::new();
            let unique: Vec<String> = self.failed_files.into_iter().filter(|f| seen.insert(f.clone())).collect();
            payload["warnings"] = json!({
                "partial": true,
                "failed_files": unique,
                "failed_chunks": self.failed_chunks,
            });
        }
        payload
    }
}

fn model_name(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Flash => "gemini-1.5-flash",
        ModelTier::Pro => "gemini-1.5-pro",
    }
}

/// Extracts the filename segment from a `file:<job>:<kind>:<name>:<hash>` key.
fn filename_from_key(key: &str) -> AppResult<String> {
    let parts: Vec<&str> = key.split(':').collect();
    parts
        .len()
        .checked_sub(2)
        .and_then(|i| parts.get(i))
        .map(|s| s.to_string())
        .ok_or_else(|| AppError::Validation(format!("malformed file key: {}", key)))
}

/// Orchestrates the full lifecycle of a job: metadata lookup, file download,
/// progress accounting, dispatch to the Multi-API Orchestrator, and result
/// persistence. One instance is shared across every job the task layer runs.
pub struct JobRunner {
    storage: Arc<StorageService>,
    settings: AppSettings,
    result_builder: Arc<dyn ResultBuilder>,
}

impl JobRunner {
    pub fn new(storage: Arc<StorageService>, settings: AppSettings) -> Self {
        Self { storage, settings, result_builder: Arc::new(JsonResultBuilder) }
    }

    fn credential_pool(&self, tier: ModelTier) -> Arc<CredentialPool> {
        let model = model_name(tier);
        let clients: Vec<Arc<dyn LlmClient>> = self
            .settings
            .credentials
            .iter()
            .map(|key| Arc::new(GoogleLlmClient::new(key.clone(), model.to_string())) as Arc<dyn LlmClient>)
            .collect();
        Arc::new(CredentialPool::new(clients))
    }

    async fn guard_not_cancelled(&self, job_id: &str) -> AppResult<()> {
        if self.storage.cancellation.is_cancelled(job_id).await? {
            warn!(job_id, "job cancelled before start");
            return Err(AppError::Cancelled("취소됨".to_string()));
        }
        Ok(())
    }

    async fn load_metadata(&self, job_id: &str) -> AppResult<JobMetadata> {
        self.storage
            .jobs
            .get_metadata(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job metadata not found for {}", job_id)))
    }

    async fn download(&self, key: &str, dest_dir: &Path) -> AppResult<(String, Vec<u8>)> {
        self.storage.files.refresh_ttl(key, None).await?;
        let filename = filename_from_key(key)?;
        let dest = dest_dir.join(&filename);
        let path = self.storage.files.save_locally(key, &dest).await?;
        let bytes = tokio::fs::read(&path).await?;
        Ok((filename, bytes))
    }

    async fn download_all(&self, keys: &[String], dest_dir: &Path) -> AppResult<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.download(key, dest_dir).await?);
        }
        Ok(out)
    }

    fn stem(filename: &str) -> String {
        Path::new(filename).file_stem().and_then(|s| s.to_str()).unwrap_or(filename).to_string()
    }

    /// The per-chunk token price for a tier (§4.1), read from
    /// [`crate::config::settings::OrchestratorConfig`] and multiplied out
    /// into a whole-job budget before the first chunk is dispatched.
    fn token_cost_per_chunk(&self, tier: ModelTier) -> i64 {
        match tier {
            ModelTier::Flash => self.settings.orchestrator.flash_tokens_per_chunk,
            ModelTier::Pro => self.settings.orchestrator.pro_tokens_per_chunk,
        }
    }

    /// Runs `body`, and on any error (including cancellation) first records
    /// the failure message against progress and finalizes with the
    /// matching Korean status before propagating the error, mirroring the
    /// original's blanket `except` clauses around each task. A `Cancelled`
    /// reason is used verbatim as the user-facing message, since it may be
    /// the generic "취소됨" or a specific one like the token-exhaustion
    /// notice the Token Accountant raises (S5).
    async fn run_guarded<Fut>(&self, job_id: &str, body: Fut) -> AppResult<Value>
    where
        Fut: std::future::Future<Output = AppResult<Value>>,
    {
        match body.await {
            Ok(value) => Ok(value),
            Err(AppError::Cancelled(reason)) => {
                warn!(job_id, %reason, "job cancelled");
                let _ = self.storage.progress.tick(job_id, 0, Some(&reason)).await;
                let _ = self.storage.progress.finalize(job_id, &reason).await;
                Err(AppError::Cancelled(reason))
            }
            Err(error) => {
                warn!(job_id, %error, "job failed");
                let _ = self.storage.progress.tick(job_id, 0, Some(&error.to_string())).await;
                let _ = self.storage.progress.finalize(job_id, "실패").await;
                Err(error)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn run_jokbo_analysis(&self, job_id: &str) -> AppResult<Value> {
        self.run_guarded(job_id, self.run_jokbo_analysis_inner(job_id)).await
    }

    async fn run_jokbo_analysis_inner(&self, job_id: &str) -> AppResult<Value> {
        self.guard_not_cancelled(job_id).await?;
        let metadata = self.load_metadata(job_id).await?;
        let min_relevance = metadata.min_relevance as i64;

        let temp_dir = tempfile::tempdir()?;
        let jokbo_files = self.download_all(&metadata.jokbo_keys, &temp_dir.path().join("jokbo")).await?;
        let lesson_files = self.download_all(&metadata.lesson_keys, &temp_dir.path().join("lesson")).await?;

        let lesson_chunk_total: u32 = lesson_files
            .iter()
            .map(|(_, bytes)| pdf::split_for_chunks(bytes, self.settings.orchestrator.max_pages_per_chunk).map(|c| c.len() as u32))
            .collect::<AppResult<Vec<_>>>()?
            .into_iter()
            .sum();
        let total_chunks = (jokbo_files.len() as u32 * lesson_chunk_total + jokbo_files.len() as u32).max(1);
        self.storage.progress.init(job_id, total_chunks, &format!("총 청크: {}", total_chunks)).await?;
        let token_cost_per_chunk = self.token_cost_per_chunk(metadata.model_tier);
        self.storage.tokens.set_job_token_budget(job_id, total_chunks as i64 * token_cost_per_chunk).await?;

        let credentials = self.credential_pool(metadata.model_tier);
        let mut warnings = AggregatedWarnings::default();
        let mut generated_files = Vec::new();

        for (jokbo_filename, jokbo_bytes) in &jokbo_files {
            if self.storage.cancellation.is_cancelled(job_id).await? {
                warn!(job_id, "job cancelled mid-run");
                return Err(AppError::Cancelled("취소됨".to_string()));
            }
            self.storage.progress.tick(job_id, 0, Some(&format!("분석 중: {}", jokbo_filename))).await?;

            let mut per_lesson_results = Vec::with_capacity(lesson_files.len());
            for (lesson_filename, lesson_bytes) in &lesson_files {
                let req = ChunkedJokboRequest {
                    job_id: job_id.to_string(),
                    jokbo_bytes: jokbo_bytes.clone(),
                    jokbo_filename: jokbo_filename.clone(),
                    lesson_bytes: lesson_bytes.clone(),
                    lesson_filename: lesson_filename.clone(),
                    min_relevance,
                    max_pages_per_chunk: self.settings.orchestrator.max_pages_per_chunk,
                    per_key_limit: self.settings.orchestrator.per_key_concurrency_limit,
                    tokens: self.storage.tokens.clone(),
                    user_id: metadata.user_id.clone(),
                    token_cost_per_chunk,
                };
                let outcome = orchestrator::run_jokbo_centric_chunked(
                    req,
                    credentials.clone(),
                    self.storage.cancellation.clone(),
                    self.storage.progress.clone(),
                    &self.settings.storage.storage_root,
                )
                .await?;
                warnings.extend(lesson_filename, &outcome);
                per_lesson_results.push(outcome.merged);
            }

            let merged = merger::merge_chunk_results(&per_lesson_results, ParseMode::JokboCentric);
            let merged = merger::apply_final_filtering_and_sorting(merged, min_relevance, ParseMode::JokboCentric);

            self.storage.progress.tick(job_id, 0, Some(&format!("결과 저장 중: {}", jokbo_filename))).await?;
            let stem = Self::stem(jokbo_filename);
            let output_filename = format!("jokbo_centric_{}_all_lessons.json", stem);
            let content = self.result_builder.build(jokbo_filename, &merged)?;
            self.storage.results.store(job_id, &output_filename, &content).await?;
            self.storage.progress.tick(job_id, 1, Some(&format!("완료: {}", jokbo_filename))).await?;
            generated_files.push(output_filename);
        }

        self.storage.progress.finalize(job_id, "완료").await?;
        info!(job_id, files = generated_files.len(), "jokbo-centric analysis complete");
        let payload = json!({"status": "Complete", "job_id": job_id, "files_generated": generated_files});
        Ok(warnings.into_payload(payload))
    }

    #[instrument(skip(self))]
    pub async fn run_lesson_analysis(&self, job_id: &str) -> AppResult<Value> {
        self.run_guarded(job_id, self.run_lesson_analysis_inner(job_id)).await
    }

    async fn run_lesson_analysis_inner(&self, job_id: &str) -> AppResult<Value> {
        self.guard_not_cancelled(job_id).await?;
        let metadata = self.load_metadata(job_id).await?;
        let min_relevance = metadata.min_relevance as i64;

        let temp_dir = tempfile::tempdir()?;
        let jokbo_files = self.download_all(&metadata.jokbo_keys, &temp_dir.path().join("jokbo")).await?;
        let lesson_files = self.download_all(&metadata.lesson_keys, &temp_dir.path().join("lesson")).await?;

        let lesson_chunk_total: u32 = lesson_files
            .iter()
            .map(|(_, bytes)| pdf::split_for_chunks(bytes, self.settings.orchestrator.max_pages_per_chunk).map(|c| c.len() as u32))
            .collect::<AppResult<Vec<_>>>()?
            .into_iter()
            .sum();
        let total_chunks = (lesson_chunk_total * jokbo_files.len().max(1) as u32 + lesson_files.len() as u32).max(1);
        self.storage.progress.init(job_id, total_chunks, &format!("총 청크: {}", total_chunks)).await?;
        let token_cost_per_chunk = self.token_cost_per_chunk(metadata.model_tier);
        self.storage.tokens.set_job_token_budget(job_id, total_chunks as i64 * token_cost_per_chunk).await?;

        let credentials = self.credential_pool(metadata.model_tier);
        let mut warnings = AggregatedWarnings::default();
        let mut generated_files = Vec::new();

        for (lesson_filename, lesson_bytes) in &lesson_files {
            if self.storage.cancellation.is_cancelled(job_id).await? {
                warn!(job_id, "job cancelled mid-run");
                return Err(AppError::Cancelled("취소됨".to_string()));
            }
            self.storage.progress.tick(job_id, 0, Some(&format!("분석 중: {}", lesson_filename))).await?;

            let mut per_jokbo_results = Vec::with_capacity(jokbo_files.len());
            for (jokbo_filename, jokbo_bytes) in &jokbo_files {
                let req = ChunkedLessonRequest {
                    job_id: job_id.to_string(),
                    jokbo_bytes: jokbo_bytes.clone(),
                    jokbo_filename: jokbo_filename.clone(),
                    lesson_bytes: lesson_bytes.clone(),
                    lesson_filename: lesson_filename.clone(),
                    min_relevance,
                    max_pages_per_chunk: self.settings.orchestrator.max_pages_per_chunk,
                    per_key_limit: self.settings.orchestrator.per_key_concurrency_limit,
                    tokens: self.storage.tokens.clone(),
                    user_id: metadata.user_id.clone(),
                    token_cost_per_chunk,
                };
                let outcome = orchestrator::run_lesson_centric_chunked(
                    req,
                    credentials.clone(),
                    self.storage.cancellation.clone(),
                    self.storage.progress.clone(),
                    &self.settings.storage.storage_root,
                )
                .await?;
                warnings.extend(jokbo_filename, &outcome);
                per_jokbo_results.push(outcome.merged);
            }

            let merged = merger::merge_chunk_results(&per_jokbo_results, ParseMode::LessonCentric);
            let merged = merger::apply_final_filtering_and_sorting(merged, min_relevance, ParseMode::LessonCentric);

            self.storage.progress.tick(job_id, 0, Some(&format!("결과 저장 중: {}", lesson_filename))).await?;
            let stem = Self::stem(lesson_filename);
            let output_filename = format!("lesson_centric_{}_all_jokbos.json", stem);
            let content = self.result_builder.build(lesson_filename, &merged)?;
            self.storage.results.store(job_id, &output_filename, &content).await?;
            self.storage.progress.tick(job_id, 1, Some(&format!("완료: {}", lesson_filename))).await?;
            generated_files.push(output_filename);
        }

        self.storage.progress.finalize(job_id, "완료").await?;
        info!(job_id, files = generated_files.len(), "lesson-centric analysis complete");
        let payload = json!({"status": "Complete", "job_id": job_id, "files_generated": generated_files});
        Ok(warnings.into_payload(payload))
    }

    #[instrument(skip(self))]
    pub async fn run_exam_only_analysis(&self, job_id: &str) -> AppResult<Value> {
        self.run_guarded(job_id, self.run_exam_only_analysis_inner(job_id)).await
    }

    async fn run_exam_only_analysis_inner(&self, job_id: &str) -> AppResult<Value> {
        self.guard_not_cancelled(job_id).await?;
        let metadata = self.load_metadata(job_id).await?;

        let temp_dir = tempfile::tempdir()?;
        let jokbo_files = self.download_all(&metadata.jokbo_keys, &temp_dir.path().join("jokbo")).await?;

        let chunk_total: u32 = jokbo_files
            .iter()
            .map(|(_, bytes)| pdf::split_for_chunks(bytes, self.settings.orchestrator.max_pages_per_chunk).map(|c| c.len() as u32))
            .collect::<AppResult<Vec<_>>>()?
            .into_iter()
            .sum();
        let total_chunks = (chunk_total + jokbo_files.len() as u32).max(1);
        self.storage.progress.init(job_id, total_chunks, &format!("총 청크: {}", total_chunks)).await?;
        let token_cost_per_chunk = self.token_cost_per_chunk(metadata.model_tier);
        self.storage.tokens.set_job_token_budget(job_id, total_chunks as i64 * token_cost_per_chunk).await?;

        let credentials = self.credential_pool(metadata.model_tier);
        let mut warnings = AggregatedWarnings::default();
        let mut generated_files = Vec::new();

        for (jokbo_filename, jokbo_bytes) in &jokbo_files {
            if self.storage.cancellation.is_cancelled(job_id).await? {
                warn!(job_id, "job cancelled mid-run");
                return Err(AppError::Cancelled("취소됨".to_string()));
            }
            self.storage.progress.tick(job_id, 0, Some(&format!("분석 중: {}", jokbo_filename))).await?;

            let req = ChunkedExamOnlyRequest {
                job_id: job_id.to_string(),
                jokbo_bytes: jokbo_bytes.clone(),
                jokbo_filename: jokbo_filename.clone(),
                max_pages_per_chunk: self.settings.orchestrator.max_pages_per_chunk,
                per_key_limit: self.settings.orchestrator.per_key_concurrency_limit,
                tokens: self.storage.tokens.clone(),
                user_id: metadata.user_id.clone(),
                token_cost_per_chunk,
            };
            let outcome = orchestrator::run_exam_only_chunked(
                req,
                credentials.clone(),
                self.storage.cancellation.clone(),
                self.storage.progress.clone(),
                &self.settings.storage.storage_root,
            )
            .await?;
            warnings.extend(jokbo_filename, &outcome);

            self.storage.progress.tick(job_id, 0, Some(&format!("결과 저장 중: {}", jokbo_filename))).await?;
            let stem = Self::stem(jokbo_filename);
            let output_filename = format!("exam_only_{}.json", stem);
            let content = self.result_builder.build(jokbo_filename, &outcome.merged)?;
            self.storage.results.store(job_id, &output_filename, &content).await?;
            self.storage.progress.tick(job_id, 1, Some(&format!("완료: {}", jokbo_filename))).await?;
            generated_files.push(output_filename);
        }

        self.storage.progress.finalize(job_id, "완료").await?;
        info!(job_id, files = generated_files.len(), "exam-only analysis complete");
        let payload = json!({"status": "Complete", "job_id": job_id, "files_generated": generated_files});
        Ok(warnings.into_payload(payload))
    }

    #[instrument(skip(self))]
    pub async fn generate_partial_jokbo(&self, job_id: &str) -> AppResult<Value> {
        self.run_guarded(job_id, self.generate_partial_jokbo_inner(job_id)).await
    }

    async fn generate_partial_jokbo_inner(&self, job_id: &str) -> AppResult<Value> {
        self.guard_not_cancelled(job_id).await?;
        let metadata = self.load_metadata(job_id).await?;

        let temp_dir = tempfile::tempdir()?;
        let jokbo_files = self.download_all(&metadata.jokbo_keys, &temp_dir.path().join("jokbo")).await?;
        let lesson_files = self.download_all(&metadata.lesson_keys, &temp_dir.path().join("lesson")).await?;
        self.storage.progress.init(job_id, jokbo_files.len().max(1) as u32, "부분 족보 분석 시작").await?;
        let token_cost_per_chunk = self.token_cost_per_chunk(metadata.model_tier);
        self.storage
            .tokens
            .set_job_token_budget(job_id, jokbo_files.len().max(1) as i64 * token_cost_per_chunk)
            .await?;

        let credentials = self.credential_pool(metadata.model_tier);
        let min_relevance = metadata.min_relevance as i64;
        let lessons: Vec<(Vec<u8>, String)> = lesson_files.iter().map(|(name, bytes)| (bytes.clone(), name.clone())).collect();

        let mut all_questions = Vec::new();
        for (jokbo_filename, jokbo_bytes) in &jokbo_files {
            if self.storage.cancellation.is_cancelled(job_id).await? {
                warn!(job_id, "job cancelled mid-run");
                return Err(AppError::Cancelled("취소됨".to_string()));
            }
            if let Err(AppError::InsufficientTokens(_)) =
                self.storage.tokens.consume_tokens_for_job(job_id, &metadata.user_id, token_cost_per_chunk).await
            {
                return Err(AppError::Cancelled(orchestrator::INSUFFICIENT_TOKENS_MESSAGE.to_string()));
            }
            let jokbo_bytes = jokbo_bytes.clone();
            let jokbo_filename_owned = jokbo_filename.clone();
            let lessons = lessons.clone();
            let cancellation = self.storage.cancellation.clone();
            let job_id_owned = job_id.to_string();
            let result = orchestrator::run_single_with_failover(&credentials, move |client| {
                let jokbo_bytes = jokbo_bytes.clone();
                let jokbo_filename_owned = jokbo_filename_owned.clone();
                let lessons = lessons.clone();
                let cancellation = cancellation.clone();
                let job_id_owned = job_id_owned.clone();
                async move {
                    let ctx = AnalysisContext {
                        client,
                        cancellation,
                        job_id: job_id_owned,
                        min_relevance_score: min_relevance,
                        prefer_single_attempt: true,
                    };
                    PartialJokboAnalyzer.analyze(&ctx, &jokbo_bytes, &jokbo_filename_owned, &lessons).await
                }
            })
            .await?;

            if let Some(questions) = result.get("questions").and_then(|v| v.as_array()) {
                for question in questions {
                    let mut question = question.clone();
                    question["_jokbo_filename"] = json!(jokbo_filename);
                    all_questions.push(question);
                }
            }
            self.storage.progress.tick(job_id, 1, Some(&format!("완료: {}", jokbo_filename))).await?;
        }

        let analysis = json!({"questions": all_questions});
        let content = self.result_builder.build("partial_jokbo", &analysis)?;
        self.storage.results.store(job_id, "partial_jokbo.json", &content).await?;
        self.storage.progress.finalize(job_id, "완료").await?;

        Ok(json!({"status": "OK", "job_id": job_id, "output": "partial_jokbo.json"}))
    }

    #[instrument(skip(self, other_keys))]
    pub async fn batch_analyze_single(
        &self,
        job_id: &str,
        mode: JobMode,
        sub_index: usize,
        primary_key: &str,
        other_keys: &[String],
    ) -> AppResult<Value> {
        self.run_guarded(job_id, self.batch_analyze_single_inner(job_id, mode, sub_index, primary_key, other_keys)).await
    }

    async fn batch_analyze_single_inner(
        &self,
        job_id: &str,
        mode: JobMode,
        sub_index: usize,
        primary_key: &str,
        other_keys: &[String],
    ) -> AppResult<Value> {
        self.guard_not_cancelled(job_id).await?;
        let metadata = self.load_metadata(job_id).await?;
        let min_relevance = metadata.min_relevance as i64;

        let temp_dir = tempfile::tempdir()?;
        let (primary_filename, primary_bytes) = self.download(primary_key, &temp_dir.path().join("primary")).await?;
        let others = self.download_all(other_keys, &temp_dir.path().join("others")).await?;
        let credentials = self.credential_pool(metadata.model_tier);
        let token_cost_per_chunk = self.token_cost_per_chunk(metadata.model_tier);

        let (merged, output_filename) = match mode {
            JobMode::JokboCentric => {
                let mut per_lesson_results = Vec::with_capacity(others.len());
                for (lesson_filename, lesson_bytes) in &others {
                    let req = ChunkedJokboRequest {
                        job_id: job_id.to_string(),
                        jokbo_bytes: primary_bytes.clone(),
                        jokbo_filename: primary_filename.clone(),
                        lesson_bytes: lesson_bytes.clone(),
                        lesson_filename: lesson_filename.clone(),
                        min_relevance,
                        max_pages_per_chunk: self.settings.orchestrator.max_pages_per_chunk,
                        per_key_limit: self.settings.orchestrator.per_key_concurrency_limit,
                        tokens: self.storage.tokens.clone(),
                        user_id: metadata.user_id.clone(),
                        token_cost_per_chunk,
                    };
                    let outcome = orchestrator::run_jokbo_centric_chunked(
                        req,
                        credentials.clone(),
                        self.storage.cancellation.clone(),
                        self.storage.progress.clone(),
                        &self.settings.storage.storage_root,
                    )
                    .await?;
                    per_lesson_results.push(outcome.merged);
                }
                let merged = merger::merge_chunk_results(&per_lesson_results, ParseMode::JokboCentric);
                let merged = merger::apply_final_filtering_and_sorting(merged, min_relevance, ParseMode::JokboCentric);
                (merged, format!("jokbo_centric_{}_all_lessons.json", Self::stem(&primary_filename)))
            }
            JobMode::LessonCentric => {
                let mut per_jokbo_results = Vec::with_capacity(others.len());
                for (jokbo_filename, jokbo_bytes) in &others {
                    let req = ChunkedLessonRequest {
                        job_id: job_id.to_string(),
                        jokbo_bytes: jokbo_bytes.clone(),
                        jokbo_filename: jokbo_filename.clone(),
                        lesson_bytes: primary_bytes.clone(),
                        lesson_filename: primary_filename.clone(),
                        min_relevance,
                        max_pages_per_chunk: self.settings.orchestrator.max_pages_per_chunk,
                        per_key_limit: self.settings.orchestrator.per_key_concurrency_limit,
                        tokens: self.storage.tokens.clone(),
                        user_id: metadata.user_id.clone(),
                        token_cost_per_chunk,
                    };
                    let outcome = orchestrator::run_lesson_centric_chunked(
                        req,
                        credentials.clone(),
                        self.storage.cancellation.clone(),
                        self.storage.progress.clone(),
                        &self.settings.storage.storage_root,
                    )
                    .await?;
                    per_jokbo_results.push(outcome.merged);
                }
                let merged = merger::merge_chunk_results(&per_jokbo_results, ParseMode::LessonCentric);
                let merged = merger::apply_final_filtering_and_sorting(merged, min_relevance, ParseMode::LessonCentric);
                (merged, format!("lesson_centric_{}_all_jokbos.json", Self::stem(&primary_filename)))
            }
            other => return Err(AppError::Validation(format!("batch_analyze_single does not support mode {:?}", other))),
        };

        let content = self.result_builder.build(&primary_filename, &merged)?;
        self.storage.results.store(job_id, &output_filename, &content).await?;
        info!(job_id, sub_index, "batch sub-analysis complete");
        Ok(json!({"status": "OK", "job_id": job_id, "sub_index": sub_index, "output": output_filename}))
    }

    /// Finalizes a batch job after every sub-analysis has completed:
    /// marks progress complete and writes a manifest listing what was
    /// generated.
    #[instrument(skip(self, generated_files))]
    pub async fn aggregate_batch(&self, job_id: &str, generated_files: &[String]) -> AppResult<Value> {
        self.storage.progress.finalize(job_id, "완료").await?;
        let manifest = json!({
            "job_id": job_id,
            "generated": generated_files,
            "count": generated_files.len(),
        });
        let content = serde_json::to_vec_pretty(&manifest)?;
        self.storage.results.store(job_id, "manifest.json", &content).await?;
        Ok(json!({"job_id": job_id, "subtask_results": generated_files}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_from_key_extracts_name_segment() {
        let key = "file:job1:jokbo:exam.pdf:abc12345";
        assert_eq!(filename_from_key(key).unwrap(), "exam.pdf");
    }

    #[test]
    fn filename_from_key_rejects_malformed_key() {
        assert!(filename_from_key("not-a-key").is_err());
    }

    #[test]
    fn aggregated_warnings_dedupes_failed_files() {
        let mut warnings = AggregatedWarnings::default();
        let outcome_a = orchestrator::ChunkedAnalysisOutcome { merged: json!({}), failed_chunks: vec!["x".to_string()] };
        let outcome_b = orchestrator::ChunkedAnalysisOutcome { merged: json!({}), failed_chunks: vec!["y".to_string()] };
        warnings.extend("lesson.pdf", &outcome_a);
        warnings.extend("lesson.pdf", &outcome_b);
        let payload = warnings.into_payload(json!({"status": "Complete"}));
        assert_eq!(payload["warnings"]["failed_files"], json!(["lesson.pdf"]));
        assert_eq!(payload["warnings"]["failed_chunks"], json!(2));
    }
}
