//! Response Parser (§4.4): turns a raw LLM completion into validated,
//! sanitized JSON.
//! Pipeline: preprocess -> direct parse -> repair -> extract -> partial
//! recovery -> sanitize. Each stage only runs if the previous one failed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::error::{AppError, AppResult};

/// Which shape the model was asked to produce; sanitization differs per mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseMode {
    JokboCentric,
    LessonCentric,
}

/// Upper bound a relevance/importance score is clamped into (§ GLOSSARY).
const MAX_SCORE: i64 = 110;
/// At most this many related slides/questions survive sanitization per item.
const MAX_CONNECTIONS_PER_QUESTION: usize = 2;

static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)```(?:json)?\s*(.*?)```").unwrap());
static TRAILING_COMMA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());
static NON_FINITE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bNaN\b|\bInfinity\b|-Infinity").unwrap());
static JOKBO_PAGE_ANCHOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""jokbo_page"\s*:\s*(\d+)"#).unwrap());
static FIRST_INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static ANSWER_KEY_DIGIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d").unwrap());

/// Runs the full pipeline against one completion and returns sanitized JSON.
#[instrument(skip(raw_response))]
pub fn parse_response(raw_response: &str, mode: ParseMode) -> AppResult<Value> {
    let cleaned = preprocess(raw_response);

    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return Ok(sanitize(value, mode));
    }

    let repaired = repair_common_issues(&cleaned);
    if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
        return Ok(sanitize(value, mode));
    }

    if let Some(extracted) = extract_top_level_json(raw_response) {
        if let Ok(value) = serde_json::from_str::<Value>(&extracted) {
            return Ok(sanitize(value, mode));
        }
    }

    info!("direct parse, repair, and extraction all failed; attempting partial recovery");
    match mode {
        ParseMode::JokboCentric => parse_partial_jokbo(raw_response).map(|v| sanitize(v, mode)),
        ParseMode::LessonCentric => parse_partial_lesson(raw_response).map(|v| sanitize(v, mode)),
    }
}

// -- preprocessing --

fn preprocess(text: &str) -> String {
    let trimmed = text.trim().trim_start_matches('\u{feff}');

    for cap in FENCE_RE.captures_iter(trimmed) {
        let block = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        if block.contains('{') {
            return block.trim().to_string();
        }
    }

    if let (Some(first), Some(last)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if last > first {
            return trimmed[first..=last].trim().to_string();
        }
    }

    trimmed.to_string()
}

fn repair_common_issues(text: &str) -> String {
    let s = text
        .replace('\u{201c}', "\"")
        .replace('\u{201d}', "\"")
        .replace('\u{2019}', "'")
        .replace('\u{2018}', "'");
    let s = TRAILING_COMMA_RE.replace_all(&s, "$1").to_string();
    NON_FINITE_RE.replace_all(&s, "null").to_string()
}

/// Scans for the first balanced top-level `{...}` object, tolerant of
/// explanatory text surrounding the JSON.
fn extract_top_level_json(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.iter().position(|&c| c == '{')?;
    let mut brace = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (offset, &ch) in chars[start..].iter().enumerate() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => brace += 1,
            '}' if !in_string => {
                brace -= 1;
                if brace == 0 {
                    let end = start + offset + 1;
                    return Some(chars[start..end].iter().collect());
                }
            }
            _ => {}
        }
    }
    None
}

/// Same balanced-brace scan as [`extract_top_level_json`] but anchored at a
/// specific byte offset and bounded by `next_anchor`, used to pull out one
/// page object at a time during partial recovery.
fn extract_json_object_near(text: &str, anchor: usize, next_anchor: usize) -> Option<Value> {
    let chars: Vec<char> = text.chars().collect();
    let char_anchor = text[..anchor].chars().count();
    let obj_start = chars[..char_anchor].iter().rposition(|&c| c == '{')?;

    let char_next = text[..next_anchor.min(text.len())].chars().count().min(chars.len());
    let mut brace = 0i32;
    let mut in_string = false;
    let mut escape = false;
    let mut obj_end = None;

    for i in obj_start..char_next {
        let ch = chars[i];
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => brace += 1,
            '}' if !in_string => {
                brace -= 1;
                if brace == 0 {
                    obj_end = Some(i + 1);
                    break;
                }
            }
            _ => {}
        }
    }

    let end = obj_end?;
    let candidate: String = chars[obj_start..end].iter().collect();
    let repaired = repair_common_issues(&candidate);
    serde_json::from_str(&repaired).ok()
}

fn parse_partial_jokbo(text: &str) -> AppResult<Value> {
    if !text.contains("\"jokbo_pages\"") {
        return Err(AppError::ParseError("no jokbo_pages found in response".to_string()));
    }

    let anchors: Vec<(usize, &str)> = JOKBO_PAGE_ANCHOR_RE
        .captures_iter(text)
        .map(|c| (c.get(0).unwrap().start(), c.get(1).unwrap().as_str()))
        .collect();

    let mut recovered = Vec::new();
    for (i, (start, page_num)) in anchors.iter().enumerate() {
        let next = anchors.get(i + 1).map(|(n, _)| *n).unwrap_or(text.len());
        if let Some(page_obj) = extract_json_object_near(text, *start, next) {
            if validate_jokbo_page(&page_obj) {
                warn!(page_num, "recovered partial jokbo page");
                recovered.push(page_obj);
            }
        }
    }

    if recovered.is_empty() {
        return Err(AppError::ParseError("no complete jokbo pages could be recovered".to_string()));
    }

    let mut out = Map::new();
    out.insert("jokbo_pages".to_string(), Value::Array(recovered));
    Ok(Value::Object(out))
}

fn validate_jokbo_page(page: &Value) -> bool {
    let Some(obj) = page.as_object() else { return false };
    if !obj.contains_key("jokbo_page") || !obj.contains_key("questions") {
        return false;
    }
    obj.get("questions")
        .and_then(|q| q.as_array())
        .map(|questions| {
            questions.iter().any(|q| {
                q.get("question_number").is_some()
                    && q.get("question_text").is_some()
                    && !is_placeholder(q.get("answer"))
            })
        })
        .unwrap_or(false)
}

/// Progressive bracket-closing recovery: repeatedly trims the tail of the
/// text found at/after `"related_slides"` and force-closes any open
/// braces/brackets, accepting the first attempt that parses and yields a
/// non-empty `related_slides` array.
fn parse_partial_lesson(text: &str) -> AppResult<Value> {
    let Some(start) = text.find("\"related_slides\"") else {
        return Err(AppError::ParseError("no related_slides found in response".to_string()));
    };
    let tail = &text[start..];
    let tail_chars: Vec<char> = tail.chars().collect();
    let len = tail_chars.len();

    let mut cut = len;
    while cut > 0 {
        let slice: String = tail_chars[..cut].iter().collect();
        let mut candidate = format!("{{{}", slice);
        let open_braces = candidate.matches('{').count() as i64 - candidate.matches('}').count() as i64;
        let open_brackets = candidate.matches('[').count() as i64 - candidate.matches(']').count() as i64;
        for _ in 0..open_brackets.max(0) {
            candidate.push(']');
        }
        for _ in 0..open_braces.max(0) {
            candidate.push('}');
        }

        if let Ok(parsed) = serde_json::from_str::<Value>(&candidate) {
            if parsed
                .get("related_slides")
                .and_then(|s| s.as_array())
                .map(|a| !a.is_empty())
                .unwrap_or(false)
            {
                warn!("recovered partial lesson response via progressive bracket closing");
                return Ok(parsed);
            }
        }
        cut = cut.saturating_sub(100);
    }

    Err(AppError::ParseError("failed to partially recover lesson response".to_string()))
}

/// Parses a partial-jokbo or exam-only completion, both of which share a
/// flat `questions` root rather than the jokbo-centric `jokbo_pages`
/// nesting. Runs the same preprocess/repair/extract stages as
/// [`parse_response`] but sanitizes against the flatter shape; has no
/// partial-recovery stage since these modes are only ever used for small,
/// single-chunk calls in practice.
#[instrument(skip(raw_response))]
pub fn parse_questions_response(raw_response: &str) -> AppResult<Value> {
    let cleaned = preprocess(raw_response);

    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return Ok(sanitize_questions(value));
    }
    let repaired = repair_common_issues(&cleaned);
    if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
        return Ok(sanitize_questions(value));
    }
    if let Some(extracted) = extract_top_level_json(raw_response) {
        if let Ok(value) = serde_json::from_str::<Value>(&extracted) {
            return Ok(sanitize_questions(value));
        }
    }
    Err(AppError::ParseError("could not recover a questions response".to_string()))
}

fn sanitize_questions(data: Value) -> Value {
    let empty = || {
        let mut m = Map::new();
        m.insert("questions".to_string(), Value::Array(vec![]));
        Value::Object(m)
    };
    let Value::Object(data) = data else { return empty() };
    let Some(Value::Array(questions)) = data.get("questions") else { return empty() };

    let mut cleaned_questions = Vec::new();
    for q in questions {
        let Some(q_obj) = q.as_object() else { continue };
        let qnum = q_obj.get("question_number").map(value_to_trimmed_string).unwrap_or_default();
        let page_start = to_int_safe(q_obj.get("page_start"), 0);
        if qnum.is_empty() || page_start <= 0 {
            continue;
        }

        let mut cleaned = Map::new();
        cleaned.insert("question_number".to_string(), Value::String(qnum));
        cleaned.insert("page_start".to_string(), Value::Number(page_start.into()));
        if let Some(next) = q_obj.get("next_question_start") {
            cleaned.insert("next_question_start".to_string(), Value::Number(to_int_safe(Some(next), 0).into()));
        }
        let mut explanation = q_obj.get("explanation").map(value_to_trimmed_string).unwrap_or_default();
        if is_placeholder(q_obj.get("explanation")) {
            explanation.clear();
        }
        cleaned.insert("explanation".to_string(), Value::String(explanation));
        if let Some(answer) = q_obj.get("answer") {
            if !is_placeholder(Some(answer)) {
                cleaned.insert("answer".to_string(), Value::String(value_to_trimmed_string(answer)));
            }
        }
        if let Some(bg) = q_obj.get("background_knowledge") {
            if !is_placeholder(Some(bg)) {
                cleaned.insert("background_knowledge".to_string(), Value::String(value_to_trimmed_string(bg)));
            }
        }
        if q_obj.contains_key("wrong_answer_explanations") {
            cleaned.insert(
                "wrong_answer_explanations".to_string(),
                Value::Object(normalize_wrong_answer_explanations(q_obj.get("wrong_answer_explanations"))),
            );
        }
        cleaned_questions.push(Value::Object(cleaned));
    }

    cleaned_questions.sort_by_key(|q| q.get("page_start").and_then(|v| v.as_i64()).unwrap_or(0));
    let mut out = Map::new();
    out.insert("questions".to_string(), Value::Array(cleaned_questions));
    Value::Object(out)
}

// -- sanitization --

fn is_placeholder(value: Option<&Value>) -> bool {
    let Some(value) = value else { return true };
    if value.is_null() {
        return true;
    }
    let s = value_to_trimmed_string(value).to_lowercase();
    matches!(
        s.as_str(),
        "" | "n/a" | "na" | "none" | "null" | "not provided" | "not provided in jokbo" | "없음" | "제공되지 않음" | "정보 없음"
    )
}

fn value_to_trimmed_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

fn to_int_safe(value: Option<&Value>, default: i64) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(default),
        Some(Value::String(s)) => FIRST_INT_RE
            .find(s)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(default),
        _ => default,
    }
}

/// Normalizes wrong-answer-explanation keys to `"N번"` form, dropping
/// placeholder values.
fn normalize_wrong_answer_explanations(value: Option<&Value>) -> Map<String, Value> {
    let mut out = Map::new();
    let Some(Value::Object(obj)) = value else { return out };
    for (key, value) in obj {
        let normalized_key = match ANSWER_KEY_DIGIT_RE.find(key) {
            Some(m) => format!("{}번", m.as_str()),
            None => key.trim().to_string(),
        };
        if !is_placeholder(Some(value)) {
            out.insert(normalized_key, Value::String(value_to_trimmed_string(value)));
        }
    }
    out
}

fn sanitize(data: Value, mode: ParseMode) -> Value {
    let Value::Object(data) = data else { return data };

    match mode {
        ParseMode::JokboCentric => sanitize_jokbo(&data),
        ParseMode::LessonCentric => sanitize_lesson(&data),
    }
}

fn sanitize_jokbo(data: &Map<String, Value>) -> Value {
    let empty = || {
        let mut m = Map::new();
        m.insert("jokbo_pages".to_string(), Value::Array(vec![]));
        Value::Object(m)
    };
    let Some(Value::Array(pages)) = data.get("jokbo_pages") else { return empty() };

    let mut cleaned_pages = Vec::new();
    for page in pages {
        let Some(page_obj) = page.as_object() else { continue };
        let page_no = to_int_safe(page_obj.get("jokbo_page"), 0);
        let questions = page_obj.get("questions").and_then(|q| q.as_array()).cloned().unwrap_or_default();

        let mut cleaned_questions = Vec::new();
        for q in &questions {
            let Some(q_obj) = q.as_object() else { continue };
            let qnum = q_obj.get("question_number").map(value_to_trimmed_string).unwrap_or_default();
            let qtext = q_obj.get("question_text").map(value_to_trimmed_string).unwrap_or_default();
            let answer = q_obj.get("answer").map(value_to_trimmed_string).unwrap_or_default();
            if qnum.is_empty() || qtext.is_empty() || is_placeholder(q_obj.get("answer")) {
                continue;
            }

            let wae = normalize_wrong_answer_explanations(q_obj.get("wrong_answer_explanations"));

            let slides = q_obj.get("related_lesson_slides").and_then(|s| s.as_array()).cloned().unwrap_or_default();
            let mut norm_slides: Vec<(i64, Value)> = Vec::new();
            for slide in &slides {
                let Some(slide_obj) = slide.as_object() else { continue };
                let lesson_filename = slide_obj.get("lesson_filename").map(value_to_trimmed_string).unwrap_or_default();
                let lesson_page = to_int_safe(slide_obj.get("lesson_page"), 0);
                if lesson_filename.is_empty() || lesson_page <= 0 {
                    continue;
                }
                let score = to_int_safe(slide_obj.get("relevance_score"), 0).clamp(0, MAX_SCORE);
                let reason = slide_obj
                    .get("relevance_reason")
                    .or_else(|| slide_obj.get("reason"))
                    .map(value_to_trimmed_string)
                    .unwrap_or_default();
                let mut m = Map::new();
                m.insert("lesson_filename".to_string(), Value::String(lesson_filename));
                m.insert("lesson_page".to_string(), Value::Number(lesson_page.into()));
                m.insert("relevance_score".to_string(), Value::Number(score.into()));
                m.insert("relevance_reason".to_string(), Value::String(reason));
                norm_slides.push((score, Value::Object(m)));
            }
            norm_slides.sort_by(|a, b| b.0.cmp(&a.0));
            norm_slides.truncate(MAX_CONNECTIONS_PER_QUESTION);

            let qn_on_page: Vec<Value> = q_obj
                .get("question_numbers_on_page")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .map(value_to_trimmed_string)
                        .filter(|s| !s.is_empty())
                        .map(Value::String)
                        .collect()
                })
                .unwrap_or_default();

            let mut explanation = q_obj.get("explanation").map(value_to_trimmed_string).unwrap_or_default();
            if is_placeholder(q_obj.get("explanation")) {
                explanation.clear();
            }

            let mut cleaned = Map::new();
            cleaned.insert("jokbo_page".to_string(), Value::Number(page_no.into()));
            cleaned.insert("question_number".to_string(), Value::String(qnum));
            cleaned.insert("question_text".to_string(), Value::String(qtext));
            cleaned.insert("answer".to_string(), Value::String(answer));
            cleaned.insert("explanation".to_string(), Value::String(explanation));
            cleaned.insert("wrong_answer_explanations".to_string(), Value::Object(wae));
            cleaned.insert(
                "related_lesson_slides".to_string(),
                Value::Array(norm_slides.into_iter().map(|(_, v)| v).collect()),
            );
            cleaned.insert("question_numbers_on_page".to_string(), Value::Array(qn_on_page));
            cleaned_questions.push(Value::Object(cleaned));
        }

        if !cleaned_questions.is_empty() {
            let mut page_out = Map::new();
            page_out.insert("jokbo_page".to_string(), Value::Number(page_no.into()));
            page_out.insert("questions".to_string(), Value::Array(cleaned_questions));
            cleaned_pages.push(page_out);
        }
    }

    cleaned_pages.sort_by_key(|p| p.get("jokbo_page").and_then(|v| v.as_i64()).unwrap_or(0));
    info!(
        pages = cleaned_pages.len(),
        questions = cleaned_pages.iter().map(|p| p.get("questions").and_then(|q| q.as_array()).map(|a| a.len()).unwrap_or(0)).sum::<usize>(),
        "sanitized jokbo-centric response"
    );

    let mut out = Map::new();
    out.insert(
        "jokbo_pages".to_string(),
        Value::Array(cleaned_pages.into_iter().map(Value::Object).collect()),
    );
    Value::Object(out)
}

fn sanitize_lesson(data: &Map<String, Value>) -> Value {
    let empty = || {
        let mut m = Map::new();
        m.insert("related_slides".to_string(), Value::Array(vec![]));
        Value::Object(m)
    };
    let Some(Value::Array(slides)) = data.get("related_slides") else { return empty() };

    let mut cleaned_slides = Vec::new();
    for slide in slides {
        let Some(slide_obj) = slide.as_object() else { continue };
        let lesson_page = to_int_safe(slide_obj.get("lesson_page"), 0);
        if lesson_page <= 0 {
            continue;
        }

        let questions = slide_obj.get("related_jokbo_questions").and_then(|q| q.as_array()).cloned().unwrap_or_default();
        let mut norm_qs = Vec::new();
        for q in &questions {
            let Some(q_obj) = q.as_object() else { continue };
            let qnum = q_obj.get("question_number").map(value_to_trimmed_string).unwrap_or_default();
            let qtext = q_obj.get("question_text").map(value_to_trimmed_string).unwrap_or_default();
            if qnum.is_empty() || qtext.is_empty() || is_placeholder(q_obj.get("answer")) {
                continue;
            }
            let answer = q_obj.get("answer").map(value_to_trimmed_string).unwrap_or_default();
            let mut explanation = q_obj.get("explanation").map(value_to_trimmed_string).unwrap_or_default();
            if is_placeholder(q_obj.get("explanation")) {
                explanation.clear();
            }
            let qn_on_page: Vec<Value> = q_obj
                .get("question_numbers_on_page")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().map(value_to_trimmed_string).filter(|s| !s.is_empty()).map(Value::String).collect())
                .unwrap_or_default();

            let mut m = Map::new();
            m.insert("jokbo_filename".to_string(), Value::String(q_obj.get("jokbo_filename").map(value_to_trimmed_string).unwrap_or_default()));
            m.insert("jokbo_page".to_string(), Value::Number(to_int_safe(q_obj.get("jokbo_page"), 0).into()));
            if q_obj.get("jokbo_end_page").is_some() {
                m.insert("jokbo_end_page".to_string(), Value::Number(to_int_safe(q_obj.get("jokbo_end_page"), 0).into()));
            }
            m.insert("question_number".to_string(), Value::String(qnum));
            m.insert("question_numbers_on_page".to_string(), Value::Array(qn_on_page));
            m.insert("question_text".to_string(), Value::String(qtext));
            m.insert("answer".to_string(), Value::String(answer));
            m.insert("explanation".to_string(), Value::String(explanation));
            m.insert(
                "wrong_answer_explanations".to_string(),
                Value::Object(normalize_wrong_answer_explanations(q_obj.get("wrong_answer_explanations"))),
            );
            m.insert(
                "relevance_score".to_string(),
                Value::Number(to_int_safe(q_obj.get("relevance_score"), 0).clamp(0, MAX_SCORE).into()),
            );
            m.insert(
                "relevance_reason".to_string(),
                Value::String(
                    q_obj
                        .get("relevance_reason")
                        .or_else(|| q_obj.get("reason"))
                        .map(value_to_trimmed_string)
                        .unwrap_or_default(),
                ),
            );
            norm_qs.push(Value::Object(m));
        }

        if !norm_qs.is_empty() {
            let mut slide_out = Map::new();
            slide_out.insert("lesson_page".to_string(), Value::Number(lesson_page.into()));
            slide_out.insert("related_jokbo_questions".to_string(), Value::Array(norm_qs));
            if let Some(importance) = slide_obj.get("importance_score") {
                slide_out.insert(
                    "importance_score".to_string(),
                    Value::Number(to_int_safe(Some(importance), 0).clamp(0, MAX_SCORE).into()),
                );
            }
            if let Some(Value::Array(concepts)) = slide_obj.get("key_concepts") {
                slide_out.insert("key_concepts".to_string(), Value::Array(concepts.clone()));
            }
            cleaned_slides.push(slide_out);
        }
    }

    cleaned_slides.sort_by_key(|s| s.get("lesson_page").and_then(|v| v.as_i64()).unwrap_or(0));
    info!(
        slides = cleaned_slides.len(),
        "sanitized lesson-centric response"
    );

    let mut out = Map::new();
    out.insert(
        "related_slides".to_string(),
        Value::Array(cleaned_slides.into_iter().map(Value::Object).collect()),
    );
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_code_fence_and_parses_directly() {
        let raw = "Here is the result:\n```json\n{\"jokbo_pages\": []}\n```\nThanks!";
        let result = parse_response(raw, ParseMode::JokboCentric).unwrap();
        assert_eq!(result, serde_json::json!({"jokbo_pages": []}));
    }

    #[test]
    fn repairs_trailing_comma_and_smart_quotes() {
        let raw = "{\u{201c}jokbo_pages\u{201d}: [],}";
        let result = parse_response(raw, ParseMode::JokboCentric).unwrap();
        assert_eq!(result, serde_json::json!({"jokbo_pages": []}));
    }

    #[test]
    fn drops_questions_with_placeholder_answers() {
        let raw = serde_json::json!({
            "jokbo_pages": [
                {
                    "jokbo_page": 3,
                    "questions": [
                        {"question_number": "1", "question_text": "what is x", "answer": "없음"},
                        {"question_number": "2", "question_text": "what is y", "answer": "b"}
                    ]
                }
            ]
        })
        .to_string();
        let result = parse_response(&raw, ParseMode::JokboCentric).unwrap();
        let questions = result["jokbo_pages"][0]["questions"].as_array().unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0]["question_number"], "2");
    }

    #[test]
    fn caps_related_slides_at_two_sorted_by_score() {
        let raw = serde_json::json!({
            "jokbo_pages": [{
                "jokbo_page": 1,
                "questions": [{
                    "question_number": "1",
                    "question_text": "q",
                    "answer": "a",
                    "related_lesson_slides": [
                        {"lesson_filename": "l1.pdf", "lesson_page": 1, "relevance_score": 90},
                        {"lesson_filename": "l2.pdf", "lesson_page": 2, "relevance_score": 30},
                        {"lesson_filename": "l3.pdf", "lesson_page": 3, "relevance_score": 60}
                    ]
                }]
            }]
        })
        .to_string();
        let result = parse_response(&raw, ParseMode::JokboCentric).unwrap();
        let slides = result["jokbo_pages"][0]["questions"][0]["related_lesson_slides"].as_array().unwrap();
        assert_eq!(slides.len(), 2);
        assert_eq!(slides[0]["relevance_score"], 90);
        assert_eq!(slides[1]["relevance_score"], 60);
    }

    #[test]
    fn clamps_relevance_score_above_110() {
        let raw = serde_json::json!({
            "jokbo_pages": [{
                "jokbo_page": 1,
                "questions": [{
                    "question_number": "1", "question_text": "q", "answer": "a",
                    "related_lesson_slides": [
                        {"lesson_filename": "l1.pdf", "lesson_page": 1, "relevance_score": 999}
                    ]
                }]
            }]
        })
        .to_string();
        let result = parse_response(&raw, ParseMode::JokboCentric).unwrap();
        let slides = result["jokbo_pages"][0]["questions"][0]["related_lesson_slides"].as_array().unwrap();
        assert_eq!(slides[0]["relevance_score"], 110);
    }

    #[test]
    fn recovers_partial_jokbo_response_from_truncated_text() {
        let raw = r#"{"jokbo_pages": [{"jokbo_page": 5, "questions": [{"question_number": "1", "question_text": "q", "answer": "a"}]}, {"jokbo_page": 6, "questions": [{"question_number"#;
        let result = parse_response(raw, ParseMode::JokboCentric).unwrap();
        let pages = result["jokbo_pages"].as_array().unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0]["jokbo_page"], 5);
    }

    #[test]
    fn normalizes_wrong_answer_explanation_keys() {
        let raw = serde_json::json!({
            "jokbo_pages": [{
                "jokbo_page": 1,
                "questions": [{
                    "question_number": "1", "question_text": "q", "answer": "a",
                    "wrong_answer_explanations": {"answer 3": "because", "4번": "없음"}
                }]
            }]
        })
        .to_string();
        let result = parse_response(&raw, ParseMode::JokboCentric).unwrap();
        let wae = result["jokbo_pages"][0]["questions"][0]["wrong_answer_explanations"].as_object().unwrap();
        assert_eq!(wae.get("3번").unwrap(), "because");
        assert!(!wae.contains_key("4번"));
    }

    #[test]
    fn questions_response_drops_entries_missing_page_start() {
        let raw = serde_json::json!({
            "questions": [
                {"question_number": "1", "page_start": 3, "explanation": "e"},
                {"question_number": "2", "explanation": "missing page"}
            ]
        })
        .to_string();
        let result = parse_questions_response(&raw).unwrap();
        let questions = result["questions"].as_array().unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0]["question_number"], "1");
    }

    proptest::proptest! {
        /// R1: sanitization is a fixed point. Re-running a sanitized jokbo-centric
        /// document back through the full parse pipeline must reproduce it exactly,
        /// since every field is already clamped/deduped/truncated on the first pass.
        #[test]
        fn sanitize_jokbo_is_idempotent(
            score in 0i64..200,
            page in 1i64..50,
            qnum in "[1-9]",
        ) {
            let raw = serde_json::json!({
                "jokbo_pages": [{
                    "jokbo_page": page,
                    "questions": [{
                        "question_number": qnum,
                        "question_text": "q",
                        "answer": "a",
                        "related_lesson_slides": [
                            {"lesson_filename": "l.pdf", "lesson_page": 1, "relevance_score": score}
                        ]
                    }]
                }]
            })
            .to_string();

            let once = parse_response(&raw, ParseMode::JokboCentric).unwrap();
            let twice = parse_response(&once.to_string(), ParseMode::JokboCentric).unwrap();
            prop_assert_eq!(once, twice);
        }
    }

    #[test]
    fn lesson_centric_drops_slides_with_no_surviving_questions() {
        let raw = serde_json::json!({
            "related_slides": [
                {"lesson_page": 1, "related_jokbo_questions": [
                    {"question_number": "1", "question_text": "q", "answer": "없음"}
                ]},
                {"lesson_page": 2, "related_jokbo_questions": [
                    {"question_number": "1", "question_text": "q", "answer": "a"}
                ]}
            ]
        })
        .to_string();
        let result = parse_response(&raw, ParseMode::LessonCentric).unwrap();
        let slides = result["related_slides"].as_array().unwrap();
        assert_eq!(slides.len(), 1);
        assert_eq!(slides[0]["lesson_page"], 2);
    }
}
