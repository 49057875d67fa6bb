//! Multi-API Orchestrator (§4.5): fans a chunked analysis out across the
//! Credential Pool, resumes from disk after a restart, adaptively splits a
//! chunk that fails for a non-permanent reason, and merges whatever
//! survives. The bounded single-split retry is a deliberate simplification
//! of a fuller per-error-type retry taxonomy: one split, no recursive
//! re-split budget.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::analyzers::exam_only::ExamOnlyAnalyzer;
use crate::analyzers::jokbo_centric::JokboCentricAnalyzer;
use crate::analyzers::lesson_centric::LessonCentricAnalyzer;
use crate::analyzers::AnalysisContext;
use crate::credentials::CredentialPool;
use crate::error::{AppError, AppResult};
use crate::merger;
use crate::parser::ParseMode;
use crate::pdf::{self, PdfChunk};
use crate::storage::{CancellationStore, ProgressStore, TokenAccountant};

/// Result of running a chunked analysis to completion: the merged document
/// plus a human-readable note per chunk that never produced a result.
pub struct ChunkedAnalysisOutcome {
    pub merged: Value,
    pub failed_chunks: Vec<String>,
}

/// The Korean notice finalized as a job's progress message when a chunk's
/// token debit comes back `InsufficientTokens` (S5); threaded through as the
/// `Cancelled` reason so [`crate::jobs::JobRunner::run_guarded`] surfaces it
/// verbatim rather than the generic cancellation message.
pub const INSUFFICIENT_TOKENS_MESSAGE: &str = "토큰 잔액 부족으로 작업이 중지되었습니다";

/// Extracts the filename segment from a path, matching
/// [`crate::jobs::JobRunner::stem`]'s fallback-to-whole-string behavior.
fn file_stem(name: &str) -> String {
    Path::new(name).file_stem().and_then(|s| s.to_str()).unwrap_or(name).to_string()
}

/// On-disk chunk ledger path: `sessions/<job_id>/chunks/<mode>-<stem>/chunk_<label>.json`.
/// `stem` disambiguates multiple secondary files processed against the same
/// primary file within one job; without it, two lessons chunked against the
/// same jokbo would collide on `chunk_000.json`.
fn chunk_path(storage_root: &str, job_id: &str, mode: &str, stem: &str, label: &str) -> PathBuf {
    Path::new(storage_root)
        .join("sessions")
        .join(job_id)
        .join("chunks")
        .join(format!("{}-{}", mode, stem))
        .join(format!("chunk_{}.json", label))
}

async fn load_chunk_result(path: &Path) -> Option<Value> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn persist_chunk_result(path: &Path, value: &Value) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec(value)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// If every original chunk's result file is present on disk, reloads the
/// whole set from there so the merge is identical regardless of what
/// survived in memory (§4.5 step 7); `None` means at least one is missing
/// (a permanent failure, or a chunk that only exists as split halves) and
/// the caller should merge from its in-memory collection instead.
async fn try_deterministic_disk_merge(storage_root: &str, job_id: &str, mode: &str, stem: &str, count: usize) -> Option<Vec<Value>> {
    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let path = chunk_path(storage_root, job_id, mode, stem, &format!("{:03}", i));
        values.push(load_chunk_result(&path).await?);
    }
    Some(values)
}

/// Ticks progress by one completed unit, fire-and-forget so the sync
/// `on_progress` callback `distribute` expects doesn't have to block on I/O.
fn spawn_progress_tick(progress: Arc<ProgressStore>, job_id: String) {
    tokio::spawn(async move {
        if let Err(error) = progress.tick(&job_id, 1, None).await {
            warn!(%error, "failed to record chunk progress tick");
        }
    });
}

/// Splits a chunk that failed for a non-permanent reason into two halves of
/// its own page range and reruns each with failover across every
/// credential. Never recurses: a half that fails again is recorded as a
/// permanent loss for that half rather than split further (bounded retry).
async fn retry_split<Fut>(
    credentials: &Arc<CredentialPool>,
    chunk: &PdfChunk,
    label: &str,
    failed_chunks: &mut Vec<String>,
    analyze_half: impl Fn(Arc<dyn crate::llm::LlmClient>, PdfChunk) -> Fut + Send + Sync + Clone + 'static,
) -> Vec<(String, Value)>
where
    Fut: std::future::Future<Output = AppResult<Value>> + Send,
{
    let total_local_pages = chunk.end_page - chunk.start_page + 1;
    if total_local_pages <= 1 {
        failed_chunks.push(format!("페이지 {}: 분할 불가, 처리 실패", chunk.start_page));
        return Vec::new();
    }
    let mid = total_local_pages / 2;
    let halves = [
        (1, mid, chunk.start_page, chunk.start_page + mid - 1),
        (mid + 1, total_local_pages, chunk.start_page + mid, chunk.end_page),
    ];

    let mut survivors = Vec::new();
    for (local_start, local_end, abs_start, abs_end) in halves {
        let half_label = format!("{}_{}-{}", label, abs_start, abs_end);
        let bytes = match pdf::extract_pages(&chunk.bytes, local_start, local_end) {
            Ok(b) => b,
            Err(error) => {
                warn!(%error, "failed to extract split half");
                failed_chunks.push(format!("페이지 {}-{}: {}", abs_start, abs_end, error));
                continue;
            }
        };
        let half_chunk = PdfChunk { start_page: abs_start, end_page: abs_end, bytes };
        let pool_size = credentials.pool_size().await.max(1) as u32;
        let result = credentials
            .execute_with_failover(pool_size, {
                let half_chunk = half_chunk.clone();
                let analyze_half = analyze_half.clone();
                move |client| analyze_half(client, half_chunk.clone())
            })
            .await;
        match result {
            Ok(value) => survivors.push((half_label, value)),
            Err(error) => {
                warn!(%error, label = %half_label, "split half failed, giving up on it");
                failed_chunks.push(format!("페이지 {}-{}: {}", abs_start, abs_end, error));
            }
        }
    }
    survivors
}

/// Offsets `related_slides[*].lesson_page` by `start_page - 1`, the
/// lesson-centric analogue of [`crate::analyzers::offset_lesson_pages`]: the
/// analyzer itself never sees chunk boundaries, so the orchestrator applies
/// this once per chunk before merging. A page number already greater than
/// `chunk_page_count` is already absolute and is left untouched.
fn offset_related_slides_pages(result: &mut Value, start_page: i64, chunk_page_count: i64) {
    let offset = start_page - 1;
    if offset == 0 {
        return;
    }
    let Some(slides) = result.get_mut("related_slides").and_then(|v| v.as_array_mut()) else { return };
    for slide in slides {
        if let Some(page) = slide.get("lesson_page").and_then(|v| v.as_i64()) {
            if page <= chunk_page_count {
                slide["lesson_page"] = Value::from(page + offset);
            }
        }
    }
}

/// Everything a chunked jokbo-centric run needs: the fixed jokbo side, the
/// lesson side to be split into chunks, and the job it belongs to.
pub struct ChunkedJokboRequest {
    pub job_id: String,
    pub jokbo_bytes: Vec<u8>,
    pub jokbo_filename: String,
    pub lesson_bytes: Vec<u8>,
    pub lesson_filename: String,
    pub min_relevance: i64,
    pub max_pages_per_chunk: u32,
    pub per_key_limit: usize,
    pub tokens: Arc<TokenAccountant>,
    pub user_id: String,
    pub token_cost_per_chunk: i64,
}

/// Runs one jokbo against one (possibly multi-chunk) lesson across the
/// credential pool and returns the merged, filtered jokbo-centric result.
#[instrument(skip(req, credentials, cancellation, progress), fields(job_id = %req.job_id))]
pub async fn run_jokbo_centric_chunked(
    req: ChunkedJokboRequest,
    credentials: Arc<CredentialPool>,
    cancellation: Arc<CancellationStore>,
    progress: Arc<ProgressStore>,
    storage_root: &str,
) -> AppResult<ChunkedAnalysisOutcome> {
    const MODE: &str = "jokbo-centric";
    let stem = file_stem(&req.lesson_filename);
    let chunks = pdf::split_for_chunks(&req.lesson_bytes, req.max_pages_per_chunk)?;

    let mut resumed: HashMap<usize, Value> = HashMap::new();
    let mut remaining: Vec<(usize, PdfChunk)> = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let path = chunk_path(storage_root, &req.job_id, MODE, &stem, &format!("{:03}", i));
        match load_chunk_result(&path).await {
            Some(value) => {
                resumed.insert(i, value);
            }
            None => remaining.push((i, chunk.clone())),
        }
    }
    info!(job_id = %req.job_id, resumed = resumed.len(), remaining = remaining.len(), "jokbo-centric chunk resume check");
    if !resumed.is_empty() {
        progress.tick(&req.job_id, resumed.len() as u32, Some("이어서 분석 중")).await?;
    }

    let originals: HashMap<usize, PdfChunk> = remaining.iter().cloned().collect();
    let indices: Vec<usize> = remaining.iter().map(|(i, _)| *i).collect();

    let jokbo_bytes = Arc::new(req.jokbo_bytes.clone());
    let jokbo_filename = Arc::new(req.jokbo_filename.clone());
    let lesson_filename = Arc::new(req.lesson_filename.clone());
    let job_id = Arc::new(req.job_id.clone());
    let min_relevance = req.min_relevance;
    let cancellation_for_op = cancellation.clone();
    let tokens = req.tokens.clone();
    let user_id = Arc::new(req.user_id.clone());
    let token_cost = req.token_cost_per_chunk;

    let op = {
        let jokbo_bytes = jokbo_bytes.clone();
        let jokbo_filename = jokbo_filename.clone();
        let lesson_filename = lesson_filename.clone();
        let job_id = job_id.clone();
        let tokens = tokens.clone();
        let user_id = user_id.clone();
        move |client: Arc<dyn crate::llm::LlmClient>, task: (usize, PdfChunk)| {
            let jokbo_bytes = jokbo_bytes.clone();
            let jokbo_filename = jokbo_filename.clone();
            let lesson_filename = lesson_filename.clone();
            let cancellation = cancellation_for_op.clone();
            let job_id = job_id.clone();
            let tokens = tokens.clone();
            let user_id = user_id.clone();
            async move {
                let (_, chunk) = task;
                tokens.consume_tokens_for_job(&job_id, &user_id, token_cost).await?;
                let ctx = AnalysisContext {
                    client,
                    cancellation,
                    job_id: (*job_id).clone(),
                    min_relevance_score: min_relevance,
                    prefer_single_attempt: true,
                };
                JokboCentricAnalyzer
                    .analyze(
                        &ctx,
                        &jokbo_bytes,
                        &jokbo_filename,
                        &chunk.bytes,
                        &lesson_filename,
                        chunk.start_page as i64,
                        (chunk.end_page - chunk.start_page + 1) as i64,
                    )
                    .await
            }
        }
    };

    let progress_for_cb = progress.clone();
    let job_id_for_cb = req.job_id.clone();
    let on_progress = move |_done: usize, _total: usize| {
        spawn_progress_tick(progress_for_cb.clone(), job_id_for_cb.clone());
    };

    let worker_cap = remaining.len().max(1);
    let results = credentials.distribute(remaining, req.per_key_limit, worker_cap, op, on_progress).await;

    let mut failed_chunks = Vec::new();
    let mut fresh: HashMap<usize, Value> = HashMap::new();
    let mut split_survivors: Vec<(String, Value)> = Vec::new();

    for (idx, outcome) in indices.into_iter().zip(results) {
        match outcome {
            Ok(value) => {
                let path = chunk_path(storage_root, &req.job_id, MODE, &stem, &format!("{:03}", idx));
                persist_chunk_result(&path, &value).await?;
                fresh.insert(idx, value);
            }
            Err(error @ AppError::InsufficientTokens(_)) => {
                warn!(job_id = %req.job_id, idx, %error, "insufficient tokens, aborting job");
                return Err(AppError::Cancelled(INSUFFICIENT_TOKENS_MESSAGE.to_string()));
            }
            Err(error) if error.is_permanent() => {
                warn!(job_id = %req.job_id, idx, %error, "chunk failed permanently, not retrying (P7)");
                failed_chunks.push(format!("청크 {}: {}", idx, error));
            }
            Err(error) => {
                warn!(job_id = %req.job_id, idx, %error, "chunk failed, attempting bounded split retry");
                let Some(chunk) = originals.get(&idx).cloned() else { continue };
                let credentials_for_retry = credentials.clone();
                let jokbo_bytes = jokbo_bytes.clone();
                let jokbo_filename = jokbo_filename.clone();
                let lesson_filename = lesson_filename.clone();
                let cancellation = cancellation.clone();
                let job_id_str = req.job_id.clone();
                let tokens = tokens.clone();
                let user_id = user_id.clone();
                let survivors = retry_split(
                    &credentials_for_retry,
                    &chunk,
                    &format!("{:03}", idx),
                    &mut failed_chunks,
                    move |client, half_chunk| {
                        let jokbo_bytes = jokbo_bytes.clone();
                        let jokbo_filename = jokbo_filename.clone();
                        let lesson_filename = lesson_filename.clone();
                        let cancellation = cancellation.clone();
                        let job_id_str = job_id_str.clone();
                        let tokens = tokens.clone();
                        let user_id = user_id.clone();
                        async move {
                            tokens.consume_tokens_for_job(&job_id_str, &user_id, token_cost).await?;
                            let ctx = AnalysisContext {
                                client,
                                cancellation,
                                job_id: job_id_str,
                                min_relevance_score: min_relevance,
                                prefer_single_attempt: true,
                            };
                            JokboCentricAnalyzer
                                .analyze(
                                    &ctx,
                                    &jokbo_bytes,
                                    &jokbo_filename,
                                    &half_chunk.bytes,
                                    &lesson_filename,
                                    half_chunk.start_page as i64,
                                    (half_chunk.end_page - half_chunk.start_page + 1) as i64,
                                )
                                .await
                        }
                    },
                )
                .await;
                for (label, value) in survivors {
                    let path = chunk_path(storage_root, &req.job_id, MODE, &stem, &label);
                    persist_chunk_result(&path, &value).await?;
                    split_survivors.push((label, value));
                }
            }
        }
    }

    let all_values: Vec<Value> = match try_deterministic_disk_merge(storage_root, &req.job_id, MODE, &stem, chunks.len()).await {
        Some(values) => values,
        None => resumed.into_values().chain(fresh.into_values()).chain(split_survivors.into_iter().map(|(_, v)| v)).collect(),
    };

    let merged = merger::merge_chunk_results(&all_values, ParseMode::JokboCentric);
    let merged = merger::apply_final_filtering_and_sorting(merged, req.min_relevance, ParseMode::JokboCentric);
    Ok(ChunkedAnalysisOutcome { merged, failed_chunks })
}

/// Everything a chunked lesson-centric run needs: the fixed jokbo side and
/// the lesson side to be split into chunks.
pub struct ChunkedLessonRequest {
    pub job_id: String,
    pub jokbo_bytes: Vec<u8>,
    pub jokbo_filename: String,
    pub lesson_bytes: Vec<u8>,
    pub lesson_filename: String,
    pub min_relevance: i64,
    pub max_pages_per_chunk: u32,
    pub per_key_limit: usize,
    pub tokens: Arc<TokenAccountant>,
    pub user_id: String,
    pub token_cost_per_chunk: i64,
}

/// Runs one lesson against one jokbo across the credential pool and
/// returns the merged, filtered lesson-centric result.
#[instrument(skip(req, credentials, cancellation, progress), fields(job_id = %req.job_id))]
pub async fn run_lesson_centric_chunked(
    req: ChunkedLessonRequest,
    credentials: Arc<CredentialPool>,
    cancellation: Arc<CancellationStore>,
    progress: Arc<ProgressStore>,
    storage_root: &str,
) -> AppResult<ChunkedAnalysisOutcome> {
    const MODE: &str = "lesson-centric";
    let stem = file_stem(&req.jokbo_filename);
    let chunks = pdf::split_for_chunks(&req.lesson_bytes, req.max_pages_per_chunk)?;

    let mut resumed: HashMap<usize, Value> = HashMap::new();
    let mut remaining: Vec<(usize, PdfChunk)> = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let path = chunk_path(storage_root, &req.job_id, MODE, &stem, &format!("{:03}", i));
        match load_chunk_result(&path).await {
            Some(value) => {
                resumed.insert(i, value);
            }
            None => remaining.push((i, chunk.clone())),
        }
    }
    info!(job_id = %req.job_id, resumed = resumed.len(), remaining = remaining.len(), "lesson-centric chunk resume check");
    if !resumed.is_empty() {
        progress.tick(&req.job_id, resumed.len() as u32, Some("이어서 분석 중")).await?;
    }

    let originals: HashMap<usize, PdfChunk> = remaining.iter().cloned().collect();
    let indices: Vec<usize> = remaining.iter().map(|(i, _)| *i).collect();

    let jokbo_bytes = Arc::new(req.jokbo_bytes.clone());
    let jokbo_filename = Arc::new(req.jokbo_filename.clone());
    let job_id = Arc::new(req.job_id.clone());
    let min_relevance = req.min_relevance;
    let cancellation_for_op = cancellation.clone();
    let tokens = req.tokens.clone();
    let user_id = Arc::new(req.user_id.clone());
    let token_cost = req.token_cost_per_chunk;

    let op = {
        let jokbo_bytes = jokbo_bytes.clone();
        let jokbo_filename = jokbo_filename.clone();
        let job_id = job_id.clone();
        let tokens = tokens.clone();
        let user_id = user_id.clone();
        move |client: Arc<dyn crate::llm::LlmClient>, task: (usize, PdfChunk)| {
            let jokbo_bytes = jokbo_bytes.clone();
            let jokbo_filename = jokbo_filename.clone();
            let cancellation = cancellation_for_op.clone();
            let job_id = job_id.clone();
            let tokens = tokens.clone();
            let user_id = user_id.clone();
            async move {
                let (_, chunk) = task;
                tokens.consume_tokens_for_job(&job_id, &user_id, token_cost).await?;
                let ctx = AnalysisContext {
                    client,
                    cancellation,
                    job_id: (*job_id).clone(),
                    min_relevance_score: min_relevance,
                    prefer_single_attempt: true,
                };
                let mut result = LessonCentricAnalyzer.analyze(&ctx, &jokbo_bytes, &jokbo_filename, &chunk.bytes, "lesson_chunk.pdf").await?;
                offset_related_slides_pages(&mut result, chunk.start_page as i64, (chunk.end_page - chunk.start_page + 1) as i64);
                Ok(result)
            }
        }
    };

    let progress_for_cb = progress.clone();
    let job_id_for_cb = req.job_id.clone();
    let on_progress = move |_done: usize, _total: usize| {
        spawn_progress_tick(progress_for_cb.clone(), job_id_for_cb.clone());
    };

    let worker_cap = remaining.len().max(1);
    let results = credentials.distribute(remaining, req.per_key_limit, worker_cap, op, on_progress).await;

    let mut failed_chunks = Vec::new();
    let mut fresh: HashMap<usize, Value> = HashMap::new();
    let mut split_survivors: Vec<(String, Value)> = Vec::new();

    for (idx, outcome) in indices.into_iter().zip(results) {
        match outcome {
            Ok(value) => {
                let path = chunk_path(storage_root, &req.job_id, MODE, &stem, &format!("{:03}", idx));
                persist_chunk_result(&path, &value).await?;
                fresh.insert(idx, value);
            }
            Err(error @ AppError::InsufficientTokens(_)) => {
                warn!(job_id = %req.job_id, idx, %error, "insufficient tokens, aborting job");
                return Err(AppError::Cancelled(INSUFFICIENT_TOKENS_MESSAGE.to_string()));
            }
            Err(error) if error.is_permanent() => {
                warn!(job_id = %req.job_id, idx, %error, "chunk failed permanently, not retrying (P7)");
                failed_chunks.push(format!("청크 {}: {}", idx, error));
            }
            Err(error) => {
                warn!(job_id = %req.job_id, idx, %error, "chunk failed, attempting bounded split retry");
                let Some(chunk) = originals.get(&idx).cloned() else { continue };
                let credentials_for_retry = credentials.clone();
                let jokbo_bytes = jokbo_bytes.clone();
                let jokbo_filename = jokbo_filename.clone();
                let cancellation = cancellation.clone();
                let job_id_str = req.job_id.clone();
                let tokens = tokens.clone();
                let user_id = user_id.clone();
                let survivors = retry_split(
                    &credentials_for_retry,
                    &chunk,
                    &format!("{:03}", idx),
                    &mut failed_chunks,
                    move |client, half_chunk| {
                        let jokbo_bytes = jokbo_bytes.clone();
                        let jokbo_filename = jokbo_filename.clone();
                        let cancellation = cancellation.clone();
                        let job_id_str = job_id_str.clone();
                        let tokens = tokens.clone();
                        let user_id = user_id.clone();
                        async move {
                            tokens.consume_tokens_for_job(&job_id_str, &user_id, token_cost).await?;
                            let ctx = AnalysisContext {
                                client,
                                cancellation,
                                job_id: job_id_str,
                                min_relevance_score: min_relevance,
                                prefer_single_attempt: true,
                            };
                            let mut result = LessonCentricAnalyzer.analyze(&ctx, &jokbo_bytes, &jokbo_filename, &half_chunk.bytes, "lesson_chunk.pdf").await?;
                            offset_related_slides_pages(&mut result, half_chunk.start_page as i64, (half_chunk.end_page - half_chunk.start_page + 1) as i64);
                            Ok(result)
                        }
                    },
                )
                .await;
                for (label, value) in survivors {
                    let path = chunk_path(storage_root, &req.job_id, MODE, &stem, &label);
                    persist_chunk_result(&path, &value).await?;
                    split_survivors.push((label, value));
                }
            }
        }
    }

    let all_values: Vec<Value> = match try_deterministic_disk_merge(storage_root, &req.job_id, MODE, &stem, chunks.len()).await {
        Some(values) => values,
        None => resumed.into_values().chain(fresh.into_values()).chain(split_survivors.into_iter().map(|(_, v)| v)).collect(),
    };

    let merged = merger::merge_chunk_results(&all_values, ParseMode::LessonCentric);
    let merged = merger::apply_final_filtering_and_sorting(merged, req.min_relevance, ParseMode::LessonCentric);
    Ok(ChunkedAnalysisOutcome { merged, failed_chunks })
}

/// Everything a chunked exam-only run needs: only a jokbo, split by page
/// range and treated as a proxy for question range (no concrete source for
/// deriving question numbers ahead of parsing was found, so this reuses the
/// same page-based chunker as the other two modes; see DESIGN.md).
pub struct ChunkedExamOnlyRequest {
    pub job_id: String,
    pub jokbo_bytes: Vec<u8>,
    pub jokbo_filename: String,
    pub max_pages_per_chunk: u32,
    pub per_key_limit: usize,
    pub tokens: Arc<TokenAccountant>,
    pub user_id: String,
    pub token_cost_per_chunk: i64,
}

/// Runs one jokbo through the exam-only analyzer across the credential pool
/// and returns the concatenated `{"questions": [...]}` result. No Result
/// Merger involvement: the flat questions shape has no `lesson_page`/score
/// fields to reconcile across chunks, just chunk-ordered concatenation.
#[instrument(skip(req, credentials, cancellation, progress), fields(job_id = %req.job_id))]
pub async fn run_exam_only_chunked(
    req: ChunkedExamOnlyRequest,
    credentials: Arc<CredentialPool>,
    cancellation: Arc<CancellationStore>,
    progress: Arc<ProgressStore>,
    storage_root: &str,
) -> AppResult<ChunkedAnalysisOutcome> {
    const MODE: &str = "exam-only";
    let stem = file_stem(&req.jokbo_filename);
    let chunks = pdf::split_for_chunks(&req.jokbo_bytes, req.max_pages_per_chunk)?;

    let mut resumed: HashMap<usize, Value> = HashMap::new();
    let mut remaining: Vec<(usize, PdfChunk)> = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let path = chunk_path(storage_root, &req.job_id, MODE, &stem, &format!("{:03}", i));
        match load_chunk_result(&path).await {
            Some(value) => {
                resumed.insert(i, value);
            }
            None => remaining.push((i, chunk.clone())),
        }
    }
    info!(job_id = %req.job_id, resumed = resumed.len(), remaining = remaining.len(), "exam-only chunk resume check");
    if !resumed.is_empty() {
        progress.tick(&req.job_id, resumed.len() as u32, Some("이어서 분석 중")).await?;
    }

    let originals: HashMap<usize, PdfChunk> = remaining.iter().cloned().collect();
    let indices: Vec<usize> = remaining.iter().map(|(i, _)| *i).collect();

    let jokbo_bytes = Arc::new(req.jokbo_bytes.clone());
    let jokbo_filename = Arc::new(req.jokbo_filename.clone());
    let job_id = Arc::new(req.job_id.clone());
    let cancellation_for_op = cancellation.clone();
    let tokens = req.tokens.clone();
    let user_id = Arc::new(req.user_id.clone());
    let token_cost = req.token_cost_per_chunk;

    let op = {
        let jokbo_bytes = jokbo_bytes.clone();
        let jokbo_filename = jokbo_filename.clone();
        let job_id = job_id.clone();
        let tokens = tokens.clone();
        let user_id = user_id.clone();
        move |client: Arc<dyn crate::llm::LlmClient>, task: (usize, PdfChunk)| {
            let jokbo_bytes = jokbo_bytes.clone();
            let jokbo_filename = jokbo_filename.clone();
            let cancellation = cancellation_for_op.clone();
            let job_id = job_id.clone();
            let tokens = tokens.clone();
            let user_id = user_id.clone();
            async move {
                let (idx, chunk) = task;
                tokens.consume_tokens_for_job(&job_id, &user_id, token_cost).await?;
                let ctx = AnalysisContext {
                    client,
                    cancellation,
                    job_id: (*job_id).clone(),
                    min_relevance_score: 0,
                    prefer_single_attempt: true,
                };
                let chunk_page_count = (chunk.end_page - chunk.start_page + 1) as i64;
                ExamOnlyAnalyzer
                    .analyze_chunk(
                        &ctx,
                        &chunk.bytes,
                        &jokbo_filename,
                        idx as i64 + 1,
                        idx as i64 + 1,
                        chunk.start_page as i64,
                        chunk_page_count,
                    )
                    .await
            }
        }
    };

    let progress_for_cb = progress.clone();
    let job_id_for_cb = req.job_id.clone();
    let on_progress = move |_done: usize, _total: usize| {
        spawn_progress_tick(progress_for_cb.clone(), job_id_for_cb.clone());
    };

    let worker_cap = remaining.len().max(1);
    let results = credentials.distribute(remaining, req.per_key_limit, worker_cap, op, on_progress).await;

    let mut failed_chunks = Vec::new();
    let mut fresh: HashMap<usize, Value> = HashMap::new();

    for (idx, outcome) in indices.into_iter().zip(results) {
        match outcome {
            Ok(value) => {
                let path = chunk_path(storage_root, &req.job_id, MODE, &stem, &format!("{:03}", idx));
                persist_chunk_result(&path, &value).await?;
                fresh.insert(idx, value);
            }
            Err(error @ AppError::InsufficientTokens(_)) => {
                warn!(job_id = %req.job_id, idx, %error, "insufficient tokens, aborting job");
                return Err(AppError::Cancelled(INSUFFICIENT_TOKENS_MESSAGE.to_string()));
            }
            Err(error) => {
                // No bounded split retry here: a chunk already covers a single
                // page range with no further page-range halving that maps
                // meaningfully onto "a question range", so a failure here is
                // recorded directly rather than attempted again.
                warn!(job_id = %req.job_id, idx, %error, "exam-only chunk failed");
                failed_chunks.push(format!("청크 {}: {}", idx, error));
                let _ = originals.get(&idx);
            }
        }
    }

    let all_values: Vec<Value> = match try_deterministic_disk_merge(storage_root, &req.job_id, MODE, &stem, chunks.len()).await {
        Some(values) => values,
        None => {
            let mut ordered: Vec<(usize, Value)> = resumed.into_iter().chain(fresh.into_iter()).collect();
            ordered.sort_by_key(|(i, _)| *i);
            ordered.into_iter().map(|(_, v)| v).collect()
        }
    };

    let mut questions = Vec::new();
    for value in &all_values {
        if let Some(array) = value.get("questions").and_then(|v| v.as_array()) {
            questions.extend(array.iter().cloned());
        }
    }
    let merged = serde_json::json!({ "questions": questions });
    Ok(ChunkedAnalysisOutcome { merged, failed_chunks })
}

/// A single non-chunked call (partial-jokbo) driven by the credential
/// pool's own failover rather than this module's chunk bookkeeping: no
/// disk resume, no split retry, just "try every credential once before
/// giving up".
#[instrument(skip(credentials, operation))]
pub async fn run_single_with_failover<F, Fut>(credentials: &Arc<CredentialPool>, operation: F) -> AppResult<Value>
where
    F: Fn(Arc<dyn crate::llm::LlmClient>) -> Fut,
    Fut: std::future::Future<Output = AppResult<Value>>,
{
    let pool_size = credentials.pool_size().await.max(1) as u32;
    if pool_size == 0 {
        return Err(AppError::NoCredentialsAvailable("no credentials configured".to_string()));
    }
    credentials.execute_with_failover(pool_size, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offset_related_slides_pages_shifts_lesson_page() {
        let mut result = json!({"related_slides": [{"lesson_page": 2, "related_jokbo_questions": []}]});
        offset_related_slides_pages(&mut result, 11, 5);
        assert_eq!(result["related_slides"][0]["lesson_page"], 12);
    }

    #[test]
    fn offset_related_slides_pages_is_noop_for_first_chunk() {
        let mut result = json!({"related_slides": [{"lesson_page": 2, "related_jokbo_questions": []}]});
        offset_related_slides_pages(&mut result, 1, 5);
        assert_eq!(result["related_slides"][0]["lesson_page"], 2);
    }

    #[test]
    fn offset_related_slides_pages_leaves_already_absolute_numbers_untouched() {
        let mut result = json!({"related_slides": [{"lesson_page": 40, "related_jokbo_questions": []}]});
        // Chunk spans pages 11..=15 (5 pages); 40 is already absolute.
        offset_related_slides_pages(&mut result, 11, 5);
        assert_eq!(result["related_slides"][0]["lesson_page"], 40);
    }

    #[test]
    fn chunk_path_keys_by_mode_and_stem() {
        let path = chunk_path("/tmp/storage", "job1", "jokbo-centric", "anatomy", "000");
        assert_eq!(path, Path::new("/tmp/storage/sessions/job1/chunks/jokbo-centric-anatomy/chunk_000.json"));
    }

    #[test]
    fn file_stem_strips_extension() {
        assert_eq!(file_stem("강의자료_anatomy.pdf"), "강의자료_anatomy");
        assert_eq!(file_stem("no_extension"), "no_extension");
    }
}
