//! Result Merger (§4.5): combines chunk-level parse results into one
//! document per job and applies the final relevance filter: questions union by
//! `(jokbo_page, question_number)`, and `related_lesson_slides` union by
//! `(lesson_filename, lesson_page)` keeping whichever chunk scored it
//! higher, since the same question can appear in more than one chunk with
//! different, partially-overlapping slide matches.

use serde_json::{Map, Value};
use tracing::info;

use crate::parser::ParseMode;

const MAX_CONNECTIONS_PER_QUESTION: usize = 2;

/// Merges a job's chunk results (already sanitized by the Response Parser)
/// into a single document in the requested mode's shape.
pub fn merge_chunk_results(results: &[Value], mode: ParseMode) -> Value {
    match mode {
        ParseMode::JokboCentric => merge_jokbo_centric(results),
        ParseMode::LessonCentric => merge_lesson_centric(results),
    }
}

fn merge_jokbo_centric(results: &[Value]) -> Value {
    if results.is_empty() {
        return empty_jokbo();
    }
    if results.len() == 1 {
        return results[0].clone();
    }

    // page -> question_number -> merged question object
    let mut pages: std::collections::BTreeMap<i64, std::collections::HashMap<String, Value>> = Default::default();

    for result in results {
        let Some(Value::Array(result_pages)) = result.get("jokbo_pages") else { continue };
        for page in result_pages {
            let Some(page_obj) = page.as_object() else { continue };
            let page_no = page_obj.get("jokbo_page").and_then(|v| v.as_i64()).unwrap_or(0);
            let questions = page_obj.get("questions").and_then(|q| q.as_array()).cloned().unwrap_or_default();
            let by_qnum = pages.entry(page_no).or_default();

            for q in questions {
                let Some(q_obj) = q.as_object() else { continue };
                let qnum = q_obj.get("question_number").map(|v| v.as_str().unwrap_or_default().to_string()).unwrap_or_default();
                if qnum.is_empty() {
                    continue;
                }
                match by_qnum.get_mut(&qnum) {
                    Some(existing) => merge_question_slides(existing, &q),
                    None => {
                        by_qnum.insert(qnum, q.clone());
                    }
                }
            }
        }
    }

    let mut merged_pages = Vec::new();
    for (page_no, by_qnum) in pages {
        let mut questions: Vec<Value> = by_qnum.into_values().collect();
        questions.sort_by(|a, b| {
            a.get("question_number").and_then(|v| v.as_str()).unwrap_or("")
                .cmp(b.get("question_number").and_then(|v| v.as_str()).unwrap_or(""))
        });
        let mut page_out = Map::new();
        page_out.insert("jokbo_page".to_string(), Value::Number(page_no.into()));
        page_out.insert("questions".to_string(), Value::Array(questions));
        merged_pages.push(Value::Object(page_out));
    }

    let mut out = Map::new();
    out.insert("jokbo_pages".to_string(), Value::Array(merged_pages));
    Value::Object(out)
}

/// Unions `existing`'s `related_lesson_slides` with `incoming`'s by
/// `(lesson_filename, lesson_page)`, keeping the higher `relevance_score`
/// per slide, then re-caps to [`MAX_CONNECTIONS_PER_QUESTION`].
fn merge_question_slides(existing: &mut Value, incoming: &Value) {
    let Some(existing_obj) = existing.as_object_mut() else { return };
    let existing_slides = existing_obj
        .get("related_lesson_slides")
        .and_then(|s| s.as_array())
        .cloned()
        .unwrap_or_default();
    let incoming_slides = incoming
        .get("related_lesson_slides")
        .and_then(|s| s.as_array())
        .cloned()
        .unwrap_or_default();

    let mut by_key: std::collections::HashMap<(String, i64), Value> = Default::default();
    for slide in existing_slides.into_iter().chain(incoming_slides) {
        let Some(slide_obj) = slide.as_object() else { continue };
        let filename = slide_obj.get("lesson_filename").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let page = slide_obj.get("lesson_page").and_then(|v| v.as_i64()).unwrap_or(0);
        let score = slide_obj.get("relevance_score").and_then(|v| v.as_i64()).unwrap_or(0);
        let key = (filename, page);
        match by_key.get(&key) {
            Some(current) if current.get("relevance_score").and_then(|v| v.as_i64()).unwrap_or(0) >= score => {}
            _ => {
                by_key.insert(key, slide);
            }
        }
    }

    let mut merged: Vec<Value> = by_key.into_values().collect();
    merged.sort_by_key(|s| std::cmp::Reverse(s.get("relevance_score").and_then(|v| v.as_i64()).unwrap_or(0)));
    merged.truncate(MAX_CONNECTIONS_PER_QUESTION);
    existing_obj.insert("related_lesson_slides".to_string(), Value::Array(merged));
}

fn merge_lesson_centric(results: &[Value]) -> Value {
    if results.is_empty() {
        return empty_lesson();
    }
    if results.len() == 1 {
        return results[0].clone();
    }

    let mut slides_by_page: std::collections::BTreeMap<i64, Value> = Default::default();

    for result in results {
        let Some(Value::Array(slides)) = result.get("related_slides") else { continue };
        for slide in slides {
            let Some(slide_obj) = slide.as_object() else { continue };
            let page = slide_obj.get("lesson_page").and_then(|v| v.as_i64()).unwrap_or(0);
            match slides_by_page.get_mut(&page) {
                Some(existing) => merge_lesson_questions(existing, slide),
                None => {
                    slides_by_page.insert(page, slide.clone());
                }
            }
        }
    }

    let mut out = Map::new();
    out.insert("related_slides".to_string(), Value::Array(slides_by_page.into_values().collect()));
    Value::Object(out)
}

/// Unions `related_jokbo_questions` by `(jokbo_filename, question_number)`
/// keeping the higher `relevance_score`, maxes `importance_score`, and
/// set-unions `key_concepts` across the two chunks' views of the same slide.
fn merge_lesson_questions(existing: &mut Value, incoming: &Value) {
    let incoming_importance = incoming.get("importance_score").and_then(|v| v.as_i64());
    let incoming_concepts: Vec<String> = incoming
        .get("key_concepts")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|c| c.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let Some(existing_obj) = existing.as_object_mut() else { return };
    let existing_qs = existing_obj.get("related_jokbo_questions").and_then(|q| q.as_array()).cloned().unwrap_or_default();
    let incoming_qs = incoming.get("related_jokbo_questions").and_then(|q| q.as_array()).cloned().unwrap_or_default();

    let mut by_key: std::collections::HashMap<(String, String), Value> = Default::default();
    for q in existing_qs.into_iter().chain(incoming_qs) {
        let Some(q_obj) = q.as_object() else { continue };
        let filename = q_obj.get("jokbo_filename").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let qnum = q_obj.get("question_number").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let score = q_obj.get("relevance_score").and_then(|v| v.as_i64()).unwrap_or(0);
        let key = (filename, qnum);
        match by_key.get(&key) {
            Some(current) if current.get("relevance_score").and_then(|v| v.as_i64()).unwrap_or(0) >= score => {}
            _ => {
                by_key.insert(key, q);
            }
        }
    }
    existing_obj.insert("related_jokbo_questions".to_string(), Value::Array(by_key.into_values().collect()));

    if let Some(incoming_score) = incoming_importance {
        let existing_score = existing_obj.get("importance_score").and_then(|v| v.as_i64());
        if existing_score.map(|s| incoming_score > s).unwrap_or(true) {
            existing_obj.insert("importance_score".to_string(), Value::Number(incoming_score.into()));
        }
    }

    if !incoming_concepts.is_empty() {
        let mut concepts: std::collections::BTreeSet<String> = existing_obj
            .get("key_concepts")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|c| c.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        concepts.extend(incoming_concepts);
        existing_obj.insert("key_concepts".to_string(), Value::Array(concepts.into_iter().map(Value::String).collect()));
    }
}

fn empty_jokbo() -> Value {
    let mut m = Map::new();
    m.insert("jokbo_pages".to_string(), Value::Array(vec![]));
    Value::Object(m)
}

fn empty_lesson() -> Value {
    let mut m = Map::new();
    m.insert("related_slides".to_string(), Value::Array(vec![]));
    Value::Object(m)
}

/// Drops any `related_lesson_slides`/`related_jokbo_questions` entry below
/// `min_relevance`, then drops questions/slides left with no surviving
/// connections, then drops pages left with no surviving questions. Applied
/// once after all chunks are merged (§ GLOSSARY `min_relevance`).
pub fn apply_final_filtering_and_sorting(merged: Value, min_relevance: i64, mode: ParseMode) -> Value {
    match mode {
        ParseMode::JokboCentric => filter_jokbo(merged, min_relevance),
        ParseMode::LessonCentric => filter_lesson(merged, min_relevance),
    }
}

fn filter_jokbo(merged: Value, min_relevance: i64) -> Value {
    let Some(Value::Object(data)) = merged.as_object().cloned().map(Value::Object) else { return merged };
    let Some(Value::Array(pages)) = data.get("jokbo_pages") else { return empty_jokbo() };

    let mut out_pages = Vec::new();
    for page in pages {
        let Some(page_obj) = page.as_object() else { continue };
        let questions = page_obj.get("questions").and_then(|q| q.as_array()).cloned().unwrap_or_default();

        let mut out_questions = Vec::new();
        for q in questions {
            let Some(q_obj) = q.as_object() else { continue };
            let slides = q_obj.get("related_lesson_slides").and_then(|s| s.as_array()).cloned().unwrap_or_default();
            let filtered: Vec<Value> = slides
                .into_iter()
                .filter(|s| s.get("relevance_score").and_then(|v| v.as_i64()).unwrap_or(0) >= min_relevance)
                .collect();
            if filtered.is_empty() {
                continue;
            }
            let mut q_out = q_obj.clone();
            q_out.insert("related_lesson_slides".to_string(), Value::Array(filtered));
            out_questions.push(Value::Object(q_out));
        }
        if out_questions.is_empty() {
            continue;
        }
        out_questions.sort_by(|a, b| {
            a.get("question_number").and_then(|v| v.as_str()).unwrap_or("")
                .cmp(b.get("question_number").and_then(|v| v.as_str()).unwrap_or(""))
        });
        let mut page_out = page_obj.clone();
        page_out.insert("questions".to_string(), Value::Array(out_questions));
        out_pages.push(Value::Object(page_out));
    }

    out_pages.sort_by_key(|p| p.get("jokbo_page").and_then(|v| v.as_i64()).unwrap_or(0));
    let total_questions: usize = out_pages.iter().map(|p| p.get("questions").and_then(|q| q.as_array()).map(|a| a.len()).unwrap_or(0)).sum();
    info!(pages = out_pages.len(), questions = total_questions, min_relevance, "applied final filtering");

    let mut out = Map::new();
    out.insert("jokbo_pages".to_string(), Value::Array(out_pages));
    Value::Object(out)
}

fn filter_lesson(merged: Value, min_relevance: i64) -> Value {
    let Some(Value::Object(data)) = merged.as_object().cloned().map(Value::Object) else { return merged };
    let Some(Value::Array(slides)) = data.get("related_slides") else { return empty_lesson() };

    let mut out_slides = Vec::new();
    for slide in slides {
        let Some(slide_obj) = slide.as_object() else { continue };
        let questions = slide_obj.get("related_jokbo_questions").and_then(|q| q.as_array()).cloned().unwrap_or_default();
        let filtered: Vec<Value> = questions
            .into_iter()
            .filter(|q| q.get("relevance_score").and_then(|v| v.as_i64()).unwrap_or(0) >= min_relevance)
            .collect();
        if filtered.is_empty() {
            continue;
        }
        let mut slide_out = slide_obj.clone();
        slide_out.insert("related_jokbo_questions".to_string(), Value::Array(filtered));
        out_slides.push(Value::Object(slide_out));
    }

    out_slides.sort_by_key(|s| s.get("lesson_page").and_then(|v| v.as_i64()).unwrap_or(0));
    let mut out = Map::new();
    out.insert("related_slides".to_string(), Value::Array(out_slides));
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_unions_slides_by_lesson_key_keeping_higher_score() {
        let chunk_a = json!({
            "jokbo_pages": [{
                "jokbo_page": 1,
                "questions": [{
                    "question_number": "1", "question_text": "q", "answer": "a",
                    "related_lesson_slides": [
                        {"lesson_filename": "l1.pdf", "lesson_page": 1, "relevance_score": 40}
                    ]
                }]
            }]
        });
        let chunk_b = json!({
            "jokbo_pages": [{
                "jokbo_page": 1,
                "questions": [{
                    "question_number": "1", "question_text": "q", "answer": "a",
                    "related_lesson_slides": [
                        {"lesson_filename": "l1.pdf", "lesson_page": 1, "relevance_score": 90},
                        {"lesson_filename": "l2.pdf", "lesson_page": 5, "relevance_score": 50}
                    ]
                }]
            }]
        });
        let merged = merge_chunk_results(&[chunk_a, chunk_b], ParseMode::JokboCentric);
        let slides = merged["jokbo_pages"][0]["questions"][0]["related_lesson_slides"].as_array().unwrap();
        assert_eq!(slides.len(), 2);
        let l1 = slides.iter().find(|s| s["lesson_filename"] == "l1.pdf").unwrap();
        assert_eq!(l1["relevance_score"], 90);
    }

    #[test]
    fn filtering_drops_questions_below_threshold_and_empty_pages() {
        let merged = json!({
            "jokbo_pages": [{
                "jokbo_page": 1,
                "questions": [{
                    "question_number": "1", "question_text": "q", "answer": "a",
                    "related_lesson_slides": [{"lesson_filename": "l.pdf", "lesson_page": 1, "relevance_score": 40}]
                }]
            }]
        });
        let filtered = apply_final_filtering_and_sorting(merged, 80, ParseMode::JokboCentric);
        assert_eq!(filtered["jokbo_pages"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn single_chunk_is_returned_unchanged() {
        let chunk = json!({"jokbo_pages": [{"jokbo_page": 1, "questions": []}]});
        let merged = merge_chunk_results(std::slice::from_ref(&chunk), ParseMode::JokboCentric);
        assert_eq!(merged, chunk);
    }

    #[test]
    fn merge_lesson_centric_maxes_importance_and_unions_key_concepts() {
        let chunk_a = json!({
            "related_slides": [{
                "lesson_filename": "l1.pdf", "lesson_page": 3,
                "importance_score": 40, "key_concepts": ["a", "b"],
                "related_jokbo_questions": []
            }]
        });
        let chunk_b = json!({
            "related_slides": [{
                "lesson_filename": "l1.pdf", "lesson_page": 3,
                "importance_score": 90, "key_concepts": ["b", "c"],
                "related_jokbo_questions": []
            }]
        });
        let merged = merge_chunk_results(&[chunk_a, chunk_b], ParseMode::LessonCentric);
        let slide = &merged["related_slides"][0];
        assert_eq!(slide["importance_score"], 90);
        let mut concepts: Vec<&str> = slide["key_concepts"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
        concepts.sort();
        assert_eq!(concepts, vec!["a", "b", "c"]);
    }

    proptest::proptest! {
        /// P3: merging a job's chunk results must not depend on the order the
        /// chunks were produced/collected in — every permutation of the same
        /// set of per-slide scores merges to the same surviving relevance
        /// scores for each `(lesson_filename, lesson_page)` key.
        #[test]
        fn merge_lesson_centric_is_order_independent(scores in proptest::collection::vec(0i64..100, 2..6)) {
            let chunks: Vec<Value> = scores.iter().map(|score| json!({
                "related_slides": [{
                    "lesson_filename": "l.pdf", "lesson_page": 1,
                    "importance_score": *score,
                    "key_concepts": [format!("concept-{score}")],
                    "related_jokbo_questions": [{
                        "jokbo_filename": "j.pdf", "question_number": "1", "relevance_score": *score
                    }]
                }]
            })).collect();

            let forward = merge_lesson_centric(&chunks);
            let mut reversed_chunks = chunks.clone();
            reversed_chunks.reverse();
            let backward = merge_lesson_centric(&reversed_chunks);

            let max_score = *scores.iter().max().unwrap();
            prop_assert_eq!(forward["related_slides"][0]["importance_score"].as_i64().unwrap(), max_score);
            prop_assert_eq!(
                forward["related_slides"][0]["importance_score"],
                backward["related_slides"][0]["importance_score"]
            );
            prop_assert_eq!(
                forward["related_slides"][0]["related_jokbo_questions"][0]["relevance_score"].as_i64().unwrap(),
                max_score
            );
        }
    }
}
