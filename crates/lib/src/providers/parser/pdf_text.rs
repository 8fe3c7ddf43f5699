//! Local text-only PDF parser.
//!
//! Extracts the text operations of every page and emits one element per
//! line on a synthetic line grid: line `i` of page `p` occupies the box
//! `(0, i)..(1, i+1)`. There is no real layout recovery here, so the
//! coordinate space is tagged `"line-grid"` and positional patterns
//! learned from it only ever match other line-grid documents.

use crate::errors::ExtractError;
use crate::providers::parser::DocumentParser;
use crate::types::{BoundingBox, Element, ElementKind, ParsedDocument};
use async_trait::async_trait;
use tracing::{info, warn};

pub const LINE_GRID_SPACE: &str = "line-grid";

#[derive(Clone, Debug, Default)]
pub struct PdfTextParser;

impl PdfTextParser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DocumentParser for PdfTextParser {
    async fn parse(&self, pdf_bytes: &[u8]) -> Result<ParsedDocument, ExtractError> {
        let data = pdf_bytes.to_vec();

        // PDF decoding is CPU-bound; keep it off the async workers.
        let pages = tokio::task::spawn_blocking(move || extract_page_texts(&data))
            .await
            .map_err(|e| ExtractError::Internal(format!("join error during PDF parsing: {e}")))??;

        let mut elements = Vec::new();
        for (page_index, page_text) in pages.iter().enumerate() {
            for (line_index, line) in page_text.lines().enumerate() {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                elements.push(Element {
                    text: text.to_string(),
                    page: page_index as u32,
                    bbox: BoundingBox::new(
                        0.0,
                        line_index as f64,
                        1.0,
                        line_index as f64 + 1.0,
                    ),
                    kind: ElementKind::Paragraph,
                });
            }
        }

        info!(
            pages = pages.len(),
            elements = elements.len(),
            "Parsed PDF into line-grid elements"
        );
        Ok(ParsedDocument::new(LINE_GRID_SPACE, elements))
    }
}

fn extract_page_texts(data: &[u8]) -> Result<Vec<String>, ExtractError> {
    let file = pdf::file::FileOptions::cached()
        .load(data)
        .map_err(|e| ExtractError::Parse(e.to_string()))?;

    let resolver = file.resolver();
    let mut pages = Vec::new();

    for page_num in 0..file.num_pages() {
        let page = file
            .get_page(page_num)
            .map_err(|e| ExtractError::Parse(e.to_string()))?;

        let mut page_text = String::new();
        if let Some(content) = &page.contents {
            let operations = content
                .operations(&resolver)
                .map_err(|e| ExtractError::Parse(e.to_string()))?;
            for op in operations.iter() {
                match op {
                    pdf::content::Op::TextDraw { text } => {
                        page_text.push_str(&text.to_string_lossy());
                        page_text.push('\n');
                    }
                    pdf::content::Op::TextDrawAdjusted { array } => {
                        for item in array.iter() {
                            if let pdf::content::TextDrawAdjusted::Text(text) = item {
                                page_text.push_str(&text.to_string_lossy());
                            }
                        }
                        page_text.push('\n');
                    }
                    _ => {}
                }
            }
        } else {
            warn!("Page {page_num} has no content stream");
        }
        pages.push(page_text);
    }

    if pages.is_empty() {
        return Err(ExtractError::Parse("document has no pages".to_string()));
    }
    Ok(pages)
}
