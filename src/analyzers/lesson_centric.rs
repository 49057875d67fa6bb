//! Lesson-centric analyzer (§4.4): one lesson against one or more jokbos.

use serde_json::Value;

use super::{AnalysisContext, Analyzer, ResponseSchema, MAX_CONNECTIONS_PER_QUESTION, MAX_SCORE};
use crate::error::AppResult;
use crate::parser::ParseMode;

pub struct LessonCentricAnalyzer;

impl Analyzer for LessonCentricAnalyzer {
    fn mode(&self) -> ParseMode {
        ParseMode::LessonCentric
    }
    fn mode_name(&self) -> &'static str {
        "lesson-centric"
    }
}

impl LessonCentricAnalyzer {
    pub fn build_prompt(&self, jokbo_filename: &str) -> String {
        format!(
            "족보 파일: {}\n\n이 강의자료의 각 슬라이드에 대해 족보에서 관련된 문제를 찾아 \
             related_slides 형식으로 답하세요. 관련도는 0~110 사이 점수로 표시하세요.",
            jokbo_filename
        )
    }

    pub async fn analyze(
        &self,
        ctx: &AnalysisContext,
        jokbo_bytes: &[u8],
        jokbo_filename: &str,
        lesson_bytes: &[u8],
        lesson_filename: &str,
    ) -> AppResult<Value> {
        let prompt = self.build_prompt(jokbo_filename);
        let lesson_display = format!("강의자료_{}", lesson_filename);
        let jokbo_display = format!("족보_{}", jokbo_filename);

        let files = vec![
            (lesson_bytes.to_vec(), lesson_display, "application/pdf".to_string()),
            (jokbo_bytes.to_vec(), jokbo_display, "application/pdf".to_string()),
        ];

        let response_text = ctx.upload_and_analyze(&files, None, prompt, ResponseSchema::Lesson).await?;
        let mut result = crate::parser::parse_response(&response_text, ParseMode::LessonCentric)?;
        cap_and_filter(&mut result, ctx.min_relevance_score);
        Ok(result)
    }
}

/// Clamp importance/relevance scores, keep top-2 questions per slide by
/// score, and drop slides left with no valid linked questions (§4.4).
fn cap_and_filter(result: &mut Value, min_relevance: i64) {
    let Some(slides) = result.get_mut("related_slides").and_then(|v| v.as_array_mut()) else { return };
    slides.retain_mut(|slide| {
        let Some(questions) = slide.get_mut("related_jokbo_questions").and_then(|v| v.as_array_mut()) else {
            return false;
        };
        for question in questions.iter_mut() {
            if let Some(score) = question.get("relevance_score").and_then(|v| v.as_i64()) {
                question["relevance_score"] = Value::from(score.clamp(0, MAX_SCORE));
            }
        }
        questions.retain(|q| q.get("relevance_score").and_then(|v| v.as_i64()).unwrap_or(0) >= min_relevance);
        questions.sort_by_key(|q| std::cmp::Reverse(q.get("relevance_score").and_then(|v| v.as_i64()).unwrap_or(0)));
        questions.truncate(MAX_CONNECTIONS_PER_QUESTION);
        !questions.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slides_with_no_surviving_questions_are_dropped() {
        let mut result = json!({
            "related_slides": [
                {"lesson_page": 1, "related_jokbo_questions": [{"question_number": "1", "relevance_score": 30}]},
                {"lesson_page": 2, "related_jokbo_questions": [{"question_number": "2", "relevance_score": 95}]}
            ]
        });
        cap_and_filter(&mut result, 80);
        let slides = result["related_slides"].as_array().unwrap();
        assert_eq!(slides.len(), 1);
        assert_eq!(slides[0]["lesson_page"], 2);
    }
}
