//! Analyzer Family (§4.4): mode-specific analysis strategies. Every analyzer
//! shares the upload-generate-delete fresh-slate policy and the
//! quality-aware retry loop; only `build_prompt`/`analyze`/the output shape
//! differ.

pub mod exam_only;
pub mod jokbo_centric;
pub mod lesson_centric;
pub mod partial_jokbo;

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::llm::{GenerationRequest, LlmClient};
use crate::parser::{self, ParseMode};
use crate::storage::cancellation::CancellationStore;

pub const MAX_SCORE: i64 = 110;
pub const MAX_CONNECTIONS_PER_QUESTION: usize = 2;

/// Mirrors `mode()`, shared across all four analyzers.
pub trait Analyzer {
    fn mode(&self) -> ParseMode;
    fn mode_name(&self) -> &'static str;
}

/// Which response shape a call expects: the two [`ParseMode`] shapes, plus
/// the flat `questions` root shared by partial-jokbo and exam-only (outside
/// `ParseMode` because Result Merger never touches either).
#[derive(Clone, Copy, Debug)]
pub enum ResponseSchema {
    Jokbo,
    Lesson,
    Questions,
}

fn parse_by_schema(text: &str, schema: ResponseSchema) -> AppResult<Value> {
    match schema {
        ResponseSchema::Jokbo => parser::parse_response(text, ParseMode::JokboCentric),
        ResponseSchema::Lesson => parser::parse_response(text, ParseMode::LessonCentric),
        ResponseSchema::Questions => parser::parse_questions_response(text),
    }
}

fn is_empty_for_schema(data: &Value, schema: ResponseSchema) -> bool {
    match schema {
        ResponseSchema::Jokbo => is_empty_result(data, ParseMode::JokboCentric),
        ResponseSchema::Lesson => is_empty_result(data, ParseMode::LessonCentric),
        ResponseSchema::Questions => data.get("questions").and_then(|v| v.as_array()).map(|a| a.is_empty()).unwrap_or(true),
    }
}

/// Bundles what every analyzer needs to upload, generate, and clean up:
/// one credential's client, the job's cancellation flag, and the job's
/// minimum relevance threshold. Built fresh per credential per task by the
/// orchestrator (P5: file visibility never crosses credentials).
pub struct AnalysisContext {
    pub client: Arc<dyn LlmClient>,
    pub cancellation: Arc<CancellationStore>,
    pub job_id: String,
    pub min_relevance_score: i64,
    /// Single attempt when the multi-API orchestrator is driving failover
    /// (it owns retry-on-different-credential); otherwise up to 3 attempts
    /// locally against the same credential.
    pub prefer_single_attempt: bool,
}

impl AnalysisContext {
    async fn check_cancelled(&self) -> AppResult<()> {
        if self.cancellation.is_cancelled(&self.job_id).await? {
            return Err(AppError::Cancelled("취소됨".to_string()));
        }
        Ok(())
    }

    /// Uploads each `(bytes, display_name, mime_type)`, generates once
    /// `prompt` plus every uploaded file, then deletes all uploads
    /// regardless of outcome (fresh-slate policy; no center-file retention).
    pub async fn upload_and_analyze(
        &self,
        files: &[(Vec<u8>, String, String)],
        system_prompt: Option<String>,
        prompt: String,
        schema: ResponseSchema,
    ) -> AppResult<String> {
        self.check_cancelled().await?;

        let mut uploaded = Vec::new();
        let result: AppResult<String> = async {
            for (bytes, display_name, mime_type) in files {
                self.check_cancelled().await?;
                let file = self.client.upload_file(bytes, display_name, mime_type).await?;
                uploaded.push(file);
            }
            self.check_cancelled().await?;

            let file_uris = uploaded.iter().map(|f| (f.mime_type.clone(), f.uri.clone())).collect();
            let request = GenerationRequest { system_prompt, file_uris, prompt };
            self.generate_with_quality_retry(&request, schema).await
        }
        .await;

        for file in &uploaded {
            if let Err(e) = self.client.delete_file(&file.name).await {
                warn!(name = %file.name, error = %e, "failed to delete uploaded file");
            }
        }
        result
    }

    /// Generates content, parsing and quality-checking each attempt. Empty
    /// results are valid "no matches" and returned immediately (never
    /// retried); suspicious parses retry within the same credential up to
    /// the attempt budget; prompt-block errors propagate without retry.
    async fn generate_with_quality_retry(&self, request: &GenerationRequest, schema: ResponseSchema) -> AppResult<String> {
        let attempts = if self.prefer_single_attempt { 1 } else { 3 };
        let mut last_error = None;

        for attempt in 1..=attempts {
            self.check_cancelled().await?;
            match self.client.generate_content(request).await {
                Ok(response) => match parse_by_schema(&response.text, schema) {
                    Ok(parsed) => {
                        if is_empty_for_schema(&parsed, schema) {
                            info!(attempt, "empty result treated as valid no-match");
                            return Ok(serde_json::to_string(&parsed)?);
                        }
                        return Ok(response.text);
                    }
                    Err(error) => {
                        warn!(attempt, attempts, %error, "parse failed, considering retry");
                        last_error = Some(error);
                        if attempt < attempts {
                            continue;
                        }
                    }
                },
                Err(error @ AppError::PromptBlocked(_)) => return Err(error),
                Err(error) => {
                    warn!(attempt, attempts, %error, "generation failed");
                    last_error = Some(error);
                    if attempt < attempts {
                        continue;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| AppError::Internal("generation exhausted retries".to_string())))
    }
}

fn is_empty_result(data: &Value, mode: ParseMode) -> bool {
    match mode {
        ParseMode::JokboCentric => {
            let pages = data.get("jokbo_pages").and_then(|v| v.as_array());
            match pages {
                None => true,
                Some(pages) if pages.is_empty() => true,
                Some(pages) => pages
                    .iter()
                    .flat_map(|p| p.get("questions").and_then(|q| q.as_array()).cloned().unwrap_or_default())
                    .count()
                    == 0,
            }
        }
        ParseMode::LessonCentric => {
            let slides = data.get("related_slides").and_then(|v| v.as_array());
            match slides {
                None => true,
                Some(slides) if slides.is_empty() => true,
                Some(slides) => slides
                    .iter()
                    .flat_map(|s| s.get("related_jokbo_questions").and_then(|q| q.as_array()).cloned().unwrap_or_default())
                    .count()
                    == 0,
            }
        }
    }
}

/// Offsets every `lesson_page` in a jokbo-centric result by `start_page - 1`,
/// used when a chunk's pages are chunk-relative rather than already
/// absolute (§4.4 chunking rule). A model occasionally echoes back an
/// already-absolute page number even from a chunked request; `lesson_page`
/// values greater than `chunk_page_count` are left untouched since offsetting
/// them would push them past the source PDF.
pub fn offset_lesson_pages(result: &mut Value, start_page: i64, chunk_page_count: i64) {
    let offset = start_page - 1;
    if offset == 0 {
        return;
    }
    let Some(pages) = result.get_mut("jokbo_pages").and_then(|v| v.as_array_mut()) else { return };
    for page in pages {
        let Some(questions) = page.get_mut("questions").and_then(|v| v.as_array_mut()) else { continue };
        for question in questions {
            let Some(slides) = question.get_mut("related_lesson_slides").and_then(|v| v.as_array_mut()) else { continue };
            for slide in slides {
                if let Some(page_num) = slide.get("lesson_page").and_then(|v| v.as_i64()) {
                    if page_num <= chunk_page_count {
                        slide["lesson_page"] = Value::from(page_num + offset);
                    }
                }
            }
        }
    }
}

/// Normalizes `lesson_filename` fields to `basename`, overriding whatever
/// display name the LLM echoed back from the upload call (P9).
pub fn normalize_lesson_filenames(result: &mut Value, display_name: &str, basename: &str) {
    let Some(pages) = result.get_mut("jokbo_pages").and_then(|v| v.as_array_mut()) else { return };
    for page in pages {
        let Some(questions) = page.get_mut("questions").and_then(|v| v.as_array_mut()) else { continue };
        for question in questions {
            let Some(slides) = question.get_mut("related_lesson_slides").and_then(|v| v.as_array_mut()) else { continue };
            for slide in slides {
                let matches = slide.get("lesson_filename").and_then(|v| v.as_str()) == Some(display_name);
                if matches {
                    slide["lesson_filename"] = Value::from(basename);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_jokbo_result_is_detected() {
        let empty = json!({"jokbo_pages": []});
        assert!(is_empty_result(&empty, ParseMode::JokboCentric));
        let non_empty = json!({"jokbo_pages": [{"jokbo_page": 1, "questions": [{"question_number": "1"}]}]});
        assert!(!is_empty_result(&non_empty, ParseMode::JokboCentric));
    }

    #[test]
    fn offset_lesson_pages_shifts_chunk_relative_numbers() {
        let mut result = json!({
            "jokbo_pages": [{
                "jokbo_page": 1,
                "questions": [{"related_lesson_slides": [{"lesson_page": 3}]}]
            }]
        });
        offset_lesson_pages(&mut result, 11, 5);
        assert_eq!(result["jokbo_pages"][0]["questions"][0]["related_lesson_slides"][0]["lesson_page"], 13);
    }

    #[test]
    fn offset_lesson_pages_leaves_already_absolute_numbers_untouched() {
        let mut result = json!({
            "jokbo_pages": [{
                "jokbo_page": 1,
                "questions": [{"related_lesson_slides": [{"lesson_page": 42}]}]
            }]
        });
        // Chunk spans pages 11..=15 (5 pages); a reported page of 42 is already
        // absolute and must not be shifted further.
        offset_lesson_pages(&mut result, 11, 5);
        assert_eq!(result["jokbo_pages"][0]["questions"][0]["related_lesson_slides"][0]["lesson_page"], 42);
    }

    #[test]
    fn normalize_lesson_filenames_rewrites_display_name_to_basename() {
        let mut result = json!({
            "jokbo_pages": [{
                "jokbo_page": 1,
                "questions": [{"related_lesson_slides": [{"lesson_filename": "강의자료_anatomy.pdf", "lesson_page": 1}]}]
            }]
        });
        normalize_lesson_filenames(&mut result, "강의자료_anatomy.pdf", "anatomy.pdf");
        assert_eq!(result["jokbo_pages"][0]["questions"][0]["related_lesson_slides"][0]["lesson_filename"], "anatomy.pdf");
    }
}
