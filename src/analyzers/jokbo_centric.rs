//! Jokbo-centric analyzer (§4.4): one jokbo against one lesson (chunk).

use serde_json::Value;

use super::{normalize_lesson_filenames, offset_lesson_pages, AnalysisContext, Analyzer, ResponseSchema, MAX_CONNECTIONS_PER_QUESTION, MAX_SCORE};
use crate::error::AppResult;
use crate::parser::ParseMode;

pub struct JokboCentricAnalyzer;

impl Analyzer for JokboCentricAnalyzer {
    fn mode(&self) -> ParseMode {
        ParseMode::JokboCentric
    }
    fn mode_name(&self) -> &'static str {
        "jokbo-centric"
    }
}

impl JokboCentricAnalyzer {
    pub fn build_prompt(&self, lesson_filename: &str) -> String {
        format!(
            "강의자료 파일: {}\n\n족보의 각 문제에 대해 이 강의자료에서 근거가 되는 슬라이드를 찾아 \
             jokbo_pages 형식으로 답하세요. 관련도는 0~110 사이 점수로 표시하세요.",
            lesson_filename
        )
    }

    /// Analyzes one jokbo/lesson(-chunk) pair. `chunk_start_page` is the
    /// 1-based start page of the lesson chunk within the full lesson,
    /// used to offset chunk-relative `lesson_page` values back to absolute
    /// page numbers (§4.4 chunking rule); pass `1` for an unchunked lesson.
    /// `chunk_page_count` is the number of pages in the chunk, used to tell
    /// an already-absolute page number apart from a chunk-relative one.
    pub async fn analyze(
        &self,
        ctx: &AnalysisContext,
        jokbo_bytes: &[u8],
        jokbo_filename: &str,
        lesson_bytes: &[u8],
        lesson_filename: &str,
        chunk_start_page: i64,
        chunk_page_count: i64,
    ) -> AppResult<Value> {
        let prompt = self.build_prompt(lesson_filename);
        let jokbo_display = format!("족보_{}", jokbo_filename);
        let lesson_display = format!("강의자료_{}", lesson_filename);

        let files = vec![
            (jokbo_bytes.to_vec(), jokbo_display, "application/pdf".to_string()),
            (lesson_bytes.to_vec(), lesson_display.clone(), "application/pdf".to_string()),
        ];

        let response_text = ctx.upload_and_analyze(&files, None, prompt, ResponseSchema::Jokbo).await?;
        let mut result = crate::parser::parse_response(&response_text, ParseMode::JokboCentric)?;

        offset_lesson_pages(&mut result, chunk_start_page, chunk_page_count);
        normalize_lesson_filenames(&mut result, &lesson_display, lesson_filename);
        cap_and_filter(&mut result, ctx.min_relevance_score);
        Ok(result)
    }
}

/// Post-processing (§4.4): clamp scores to [0, 110], keep top-2 slides per
/// question by score, drop slides below `min_relevance`.
fn cap_and_filter(result: &mut Value, min_relevance: i64) {
    let Some(pages) = result.get_mut("jokbo_pages").and_then(|v| v.as_array_mut()) else { return };
    for page in pages.iter_mut() {
        let Some(questions) = page.get_mut("questions").and_then(|v| v.as_array_mut()) else { continue };
        for question in questions.iter_mut() {
            let Some(slides) = question.get_mut("related_lesson_slides").and_then(|v| v.as_array_mut()) else { continue };
            for slide in slides.iter_mut() {
                if let Some(score) = slide.get("relevance_score").and_then(|v| v.as_i64()) {
                    slide["relevance_score"] = Value::from(score.clamp(0, MAX_SCORE));
                }
            }
            slides.retain(|s| s.get("relevance_score").and_then(|v| v.as_i64()).unwrap_or(0) >= min_relevance);
            slides.sort_by_key(|s| std::cmp::Reverse(s.get("relevance_score").and_then(|v| v.as_i64()).unwrap_or(0)));
            slides.truncate(MAX_CONNECTIONS_PER_QUESTION);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cap_and_filter_clamps_and_keeps_top_two() {
        let mut result = json!({
            "jokbo_pages": [{
                "jokbo_page": 1,
                "questions": [{
                    "question_number": "1",
                    "related_lesson_slides": [
                        {"lesson_page": 1, "relevance_score": 200},
                        {"lesson_page": 2, "relevance_score": 90},
                        {"lesson_page": 3, "relevance_score": 85},
                        {"lesson_page": 4, "relevance_score": 10}
                    ]
                }]
            }]
        });
        cap_and_filter(&mut result, 80);
        let slides = result["jokbo_pages"][0]["questions"][0]["related_lesson_slides"].as_array().unwrap();
        assert_eq!(slides.len(), 2);
        assert_eq!(slides[0]["relevance_score"], 110);
        assert_eq!(slides[1]["relevance_score"], 90);
    }
}
