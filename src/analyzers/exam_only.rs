//! Exam-only analyzer (§4.4): explanation-focused, takes a jokbo chunk
//! covering a question range and produces per-question answers with
//! background knowledge. Does not relate to lesson slides.

use serde_json::Value;

use super::{AnalysisContext, ResponseSchema};
use crate::error::AppResult;

pub struct ExamOnlyAnalyzer;

impl ExamOnlyAnalyzer {
    pub fn mode_name(&self) -> &'static str {
        "exam-only"
    }

    pub fn build_prompt(&self, jokbo_filename: &str, q_start: i64, q_end: i64) -> String {
        format!(
            "다음은 족보 PDF 일부({}~{}번)입니다. 원본 파일명: {}\n\n\
             각 문제의 정답, 해설, 배경지식, 오답 해설을 questions 형식으로 답하세요.",
            q_start, q_end, jokbo_filename
        )
    }

    /// Analyzes one chunk covering questions `q_start..=q_end`. `chunk_info`
    /// is the chunk's 1-based `(start_page, end_page)` within the full
    /// jokbo, used to offset `page_start`/`next_question_start` back to
    /// absolute page numbers when the model reports chunk-relative pages.
    /// `chunk_page_count` is the chunk's page count, used to tell an
    /// already-absolute page number apart from a chunk-relative one.
    pub async fn analyze_chunk(
        &self,
        ctx: &AnalysisContext,
        jokbo_chunk_bytes: &[u8],
        jokbo_original_filename: &str,
        q_start: i64,
        q_end: i64,
        chunk_start_page: i64,
        chunk_page_count: i64,
    ) -> AppResult<Value> {
        let prompt = self.build_prompt(jokbo_original_filename, q_start, q_end);
        let files = vec![(
            jokbo_chunk_bytes.to_vec(),
            format!("족보_{}", jokbo_original_filename),
            "application/pdf".to_string(),
        )];

        let response_text = ctx.upload_and_analyze(&files, None, prompt, ResponseSchema::Questions).await?;
        let mut result = crate::parser::parse_questions_response(&response_text)?;
        offset_question_pages(&mut result, chunk_start_page, chunk_page_count);
        Ok(result)
    }
}

/// Offsets `page_start`/`next_question_start` by `start_page - 1` when a
/// chunk's page numbers are chunk-relative, mirroring the jokbo-centric
/// lesson-page offset rule for the same chunking scheme. A value greater
/// than `chunk_page_count` is already absolute and is left alone.
fn offset_question_pages(result: &mut Value, start_page: i64, chunk_page_count: i64) {
    let offset = start_page - 1;
    if offset == 0 {
        return;
    }
    let Some(questions) = result.get_mut("questions").and_then(|v| v.as_array_mut()) else { return };
    for question in questions {
        if let Some(page) = question.get("page_start").and_then(|v| v.as_i64()) {
            if page <= chunk_page_count {
                question["page_start"] = Value::from(page + offset);
            }
        }
        if let Some(page) = question.get("next_question_start").and_then(|v| v.as_i64()) {
            if page <= chunk_page_count {
                question["next_question_start"] = Value::from(page + offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offset_question_pages_shifts_both_fields() {
        let mut result = json!({"questions": [{"page_start": 2, "next_question_start": 4}]});
        offset_question_pages(&mut result, 11, 5);
        assert_eq!(result["questions"][0]["page_start"], 12);
        assert_eq!(result["questions"][0]["next_question_start"], 14);
    }

    #[test]
    fn offset_question_pages_leaves_already_absolute_numbers_untouched() {
        let mut result = json!({"questions": [{"page_start": 30, "next_question_start": 31}]});
        // Chunk spans 5 pages starting at 11; 30/31 are already absolute.
        offset_question_pages(&mut result, 11, 5);
        assert_eq!(result["questions"][0]["page_start"], 30);
        assert_eq!(result["questions"][0]["next_question_start"], 31);
    }
}
