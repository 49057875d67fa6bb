//! Partial-jokbo analyzer (§4.4): generates per-question page ranges and
//! short explanations.
//! Unlike the other modes, it uploads one jokbo plus several reference
//! lessons in a single call rather than pairing one jokbo with one lesson,
//! and its output is the flat `questions` root rather than `jokbo_pages`.

use serde_json::Value;

use super::{AnalysisContext, ResponseSchema};
use crate::error::AppResult;

pub struct PartialJokboAnalyzer;

impl PartialJokboAnalyzer {
    pub fn mode_name(&self) -> &'static str {
        "partial-jokbo"
    }

    pub fn build_prompt(&self, jokbo_filename: &str, lesson_filenames: &[String]) -> String {
        let lessons_str = lesson_filenames.join(", ");
        format!(
            "분석 대상 족보 파일명: {}\n참조 강의자료 파일들: {}\n\n\
             족보의 각 문제가 시작하는 페이지와 다음 문제가 시작하는 페이지를 찾고, \
             간단한 해설을 questions 형식으로 답하세요.",
            jokbo_filename, lessons_str
        )
    }

    pub async fn analyze(
        &self,
        ctx: &AnalysisContext,
        jokbo_bytes: &[u8],
        jokbo_filename: &str,
        lessons: &[(Vec<u8>, String)],
    ) -> AppResult<Value> {
        let lesson_filenames: Vec<String> = lessons.iter().map(|(_, name)| name.clone()).collect();
        let prompt = self.build_prompt(jokbo_filename, &lesson_filenames);

        let mut files = vec![(jokbo_bytes.to_vec(), format!("족보_{}", jokbo_filename), "application/pdf".to_string())];
        for (bytes, name) in lessons {
            files.push((bytes.clone(), format!("강의자료_{}", name), "application/pdf".to_string()));
        }

        let response_text = ctx.upload_and_analyze(&files, None, prompt, ResponseSchema::Questions).await?;
        crate::parser::parse_questions_response(&response_text)
    }
}
