//! The local line-grid parser against freshly generated PDFs.

mod common;

use anyhow::Result;
use common::{init_tracing, pdf_helper::generate_test_pdf};
use extrato::{DocumentParser, ExtractError, PdfTextParser};

#[tokio::test]
async fn extracts_text_into_line_grid_elements() -> Result<()> {
    init_tracing();
    let pdf_data = generate_test_pdf("Nome: Joao Silva")?;

    let parser = PdfTextParser::new();
    let doc = parser.parse(&pdf_data).await?;

    assert_eq!(doc.coord_space, "line-grid");
    assert!(!doc.elements.is_empty());
    assert!(
        doc.full_text().contains("Joao Silva"),
        "parsed text was: {:?}",
        doc.full_text()
    );
    assert!(doc.elements.iter().all(|e| e.page == 0));
    Ok(())
}

#[tokio::test]
async fn garbage_bytes_are_a_parse_error() {
    init_tracing();
    let parser = PdfTextParser::new();
    let err = parser.parse(b"%PDF-1.4 but not really").await.unwrap_err();
    assert!(matches!(err, ExtractError::Parse(_)));
}
