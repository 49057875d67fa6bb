//! PDF Operations (§4.3): page counting, chunk splitting, and page-range
//! extraction. Built on `lopdf` rather than a `pymupdf`/fitz-style binding;
//! it is pure Rust, so this crate carries no native PDF rendering dependency.

use lopdf::Document;
use tracing::{debug, info, instrument};

use crate::error::{AppError, AppResult};

/// A single unit of work handed to the orchestrator: a page range sliced
/// out of a larger source PDF.
#[derive(Clone, Debug)]
pub struct PdfChunk {
    pub start_page: u32,
    pub end_page: u32,
    pub bytes: Vec<u8>,
}

#[instrument(skip(bytes))]
pub fn get_page_count(bytes: &[u8]) -> AppResult<u32> {
    let doc = load(bytes)?;
    Ok(doc.get_pages().len() as u32)
}

/// Validates that `bytes` parses as a PDF with at least one readable page
/// (mirrors `validate_pdf`).
pub fn validate_pdf(bytes: &[u8]) -> bool {
    match load(bytes) {
        Ok(doc) => !doc.get_pages().is_empty(),
        Err(_) => false,
    }
}

/// Splits a source PDF into chunks of at most `max_pages` pages each,
/// mirroring `split_pdf_for_chunks`: a PDF that already fits within
/// `max_pages` is returned as a single chunk, never split further.
#[instrument(skip(bytes))]
pub fn split_for_chunks(bytes: &[u8], max_pages: u32) -> AppResult<Vec<PdfChunk>> {
    let total_pages = get_page_count(bytes)?;
    if total_pages <= max_pages {
        debug!(total_pages, "pdf fits in a single chunk");
        return Ok(vec![PdfChunk { start_page: 1, end_page: total_pages, bytes: bytes.to_vec() }]);
    }

    let mut chunks = Vec::new();
    let mut start = 1;
    while start <= total_pages {
        let end = (start + max_pages - 1).min(total_pages);
        let extracted = extract_pages(bytes, start, end)?;
        chunks.push(PdfChunk { start_page: start, end_page: end, bytes: extracted });
        start = end + 1;
    }
    info!(chunk_count = chunks.len(), total_pages, "split pdf into chunks");
    Ok(chunks)
}

/// Extracts `start_page..=end_page` (1-based, inclusive) into a new PDF
/// document, returned as bytes rather than written to a temp file (the
/// caller decides whether/where to persist it, via the Storage Service).
#[instrument(skip(bytes))]
pub fn extract_pages(bytes: &[u8], start_page: u32, end_page: u32) -> AppResult<Vec<u8>> {
    let mut doc = load(bytes)?;
    let total_pages = doc.get_pages().len() as u32;
    if start_page < 1 || start_page > total_pages {
        return Err(AppError::PdfInvalid(format!(
            "invalid start page {} (total pages: {})",
            start_page, total_pages
        )));
    }
    if end_page < start_page || end_page > total_pages {
        return Err(AppError::PdfInvalid(format!(
            "invalid end page {} (total pages: {})",
            end_page, total_pages
        )));
    }

    let pages = doc.get_pages();
    let keep: std::collections::HashSet<u32> = (start_page..=end_page).collect();
    let to_delete: Vec<u32> = pages
        .keys()
        .filter(|page_num| !keep.contains(page_num))
        .copied()
        .collect();
    for page_num in to_delete {
        doc.delete_pages(&[page_num]);
    }
    doc.prune_objects();

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| AppError::PdfInvalid(format!("failed to save extracted pages: {}", e)))?;
    Ok(out)
}

/// Extracts raw text from a single page (mirrors `get_page_text`); returns
/// an empty string on any extraction failure rather than propagating, since
/// this is used for best-effort logging/preview, not parsing.
pub fn get_page_text(bytes: &[u8], page_num: u32) -> String {
    let Ok(doc) = load(bytes) else {
        return String::new();
    };
    let pages = doc.get_pages();
    let Some(object_id) = pages.get(&page_num) else {
        return String::new();
    };
    doc.extract_text(&[object_id.0]).unwrap_or_default()
}

/// Merges multiple PDFs into one by concatenating their pages in order.
#[instrument(skip(documents))]
pub fn merge_pdfs(documents: &[Vec<u8>]) -> AppResult<Vec<u8>> {
    if documents.is_empty() {
        return Err(AppError::PdfInvalid("cannot merge zero documents".to_string()));
    }
    let loaded: Vec<Document> = documents
        .iter()
        .map(|bytes| load(bytes))
        .collect::<AppResult<Vec<_>>>()?;
    let merged = Document::merge(loaded);
    let mut out = Vec::new();
    let mut merged = merged;
    merged
        .save_to(&mut out)
        .map_err(|e| AppError::PdfInvalid(format!("failed to save merged pdf: {}", e)))?;
    Ok(out)
}

fn load(bytes: &[u8]) -> AppResult<Document> {
    Document::load_mem(bytes).map_err(|e| AppError::PdfInvalid(format!("cannot open pdf: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_pdf(pages: usize) -> Vec<u8> {
        use lopdf::dictionary;
        use lopdf::{Document, Object};

        let mut doc = Document::with_version("1.5");
        let mut page_ids = Vec::new();
        for _ in 0..pages {
            let page_id = doc.add_object(dictionary! { "Type" => "Page" });
            page_ids.push(page_id);
        }
        let pages_id = doc.add_object(dictionary! {
            "Type" => "Pages",
            "Kids" => page_ids.iter().map(|id| Object::Reference(*id)).collect::<Vec<_>>(),
            "Count" => page_ids.len() as i64,
        });
        for page_id in &page_ids {
            if let Ok(page) = doc.get_object_mut(*page_id) {
                if let Ok(dict) = page.as_dict_mut() {
                    dict.set("Parent", Object::Reference(pages_id));
                }
            }
        }
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => Object::Reference(pages_id) });
        doc.trailer.set("Root", Object::Reference(catalog_id));
        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    #[test]
    fn page_count_matches_constructed_document() {
        let bytes = tiny_pdf(5);
        assert_eq!(get_page_count(&bytes).unwrap(), 5);
    }

    #[test]
    fn split_for_chunks_respects_max_pages() {
        let bytes = tiny_pdf(10);
        let chunks = split_for_chunks(&bytes, 4).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].start_page, 1);
        assert_eq!(chunks[0].end_page, 4);
        assert_eq!(chunks[2].start_page, 9);
        assert_eq!(chunks[2].end_page, 10);
    }

    #[test]
    fn split_for_chunks_returns_single_chunk_when_it_fits() {
        let bytes = tiny_pdf(3);
        let chunks = split_for_chunks(&bytes, 40).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_page, 1);
        assert_eq!(chunks[0].end_page, 3);
    }

    #[test]
    fn extract_pages_rejects_out_of_range_request() {
        let bytes = tiny_pdf(3);
        let err = extract_pages(&bytes, 2, 5).unwrap_err();
        assert!(matches!(err, AppError::PdfInvalid(_)));
    }

    #[test]
    fn validate_pdf_false_for_garbage_bytes() {
        assert!(!validate_pdf(b"not a pdf"));
    }
}
