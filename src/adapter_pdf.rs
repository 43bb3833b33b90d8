//! PDF adapter: per-page text blocks, document-info metadata, OCR fallback
//! for scanned pages.
//!
//! Embedded text is taken from the content streams page by page. A page
//! whose text coverage (characters per point² of page area) falls below
//! [`MIN_TEXT_COVERAGE`] is treated as a scan candidate and routed through
//! the optional OCR toolchain; OCR problems degrade to the sparse embedded
//! text and never fail the extraction.

use std::path::Path;
use std::sync::LazyLock;

use encoding_rs::{UTF_16BE, WINDOWS_1252};
use regex::Regex;
use tracing::debug;

use crate::extract::{extension_of, title_from_stem, DocumentAdapter, ExtractionError};
use crate::models::{DocumentBlock, ExtractedDocument, ExtractedMetadata, SourceRef};
use crate::ocr::{self, OcrStatus};

/// Pages with fewer embedded characters per point² are OCR candidates.
/// On a US-Letter page this is roughly 490 characters.
const MIN_TEXT_COVERAGE: f64 = 0.001;

/// 612 × 792 points, used when a page carries no MediaBox.
const US_LETTER_AREA: f64 = 612.0 * 792.0;

static PARAGRAPH_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

pub struct PdfAdapter;

impl DocumentAdapter for PdfAdapter {
    fn format(&self) -> &'static str {
        "pdf"
    }

    fn supports(&self, path: &Path, sniff: &[u8]) -> bool {
        sniff.starts_with(b"%PDF-") || extension_of(path).as_deref() == Some("pdf")
    }

    fn extract(&self, path: &Path, raw: &[u8]) -> Result<ExtractedDocument, ExtractionError> {
        let pages = pdf_extract::extract_text_from_mem_by_pages(raw)
            .map_err(|e| ExtractionError::parse("pdf", path, e.to_string()))?;

        // lopdf gives us Info metadata and page geometry; pdf-extract has
        // already validated the file, so a secondary failure only loses
        // metadata.
        let parsed = lopdf::Document::load_mem(raw).ok();
        let (title, author) = parsed
            .as_ref()
            .map(document_info)
            .unwrap_or((None, None));
        let areas: Vec<f64> = parsed.as_ref().map(page_areas).unwrap_or_default();

        let mut blocks = Vec::new();
        for (idx, embedded) in pages.iter().enumerate() {
            let page_no = idx as i64 + 1;
            let area = areas.get(idx).copied().unwrap_or(US_LETTER_AREA);
            let text = resolve_page_text(path, page_no, embedded, area);
            blocks.extend(page_blocks(page_no, &text));
        }
        if blocks.is_empty() {
            return Err(ExtractionError::parse("pdf", path, "no extractable text"));
        }

        Ok(ExtractedDocument {
            source_path: crate::extract::path_string(path),
            metadata: ExtractedMetadata {
                title: title.or_else(|| Some(title_from_stem(path))),
                author,
                language: None,
                format: "pdf".to_string(),
            },
            blocks,
        })
    }
}

fn needs_ocr(embedded_chars: usize, page_area: f64) -> bool {
    page_area > 0.0 && (embedded_chars as f64) / page_area < MIN_TEXT_COVERAGE
}

fn resolve_page_text(path: &Path, page_no: i64, embedded: &str, area: f64) -> String {
    let embedded_chars = embedded.trim().chars().count();
    if !needs_ocr(embedded_chars, area) {
        return embedded.to_string();
    }
    let (status, ocr_text) = ocr::ocr_pdf_page(path, page_no);
    debug!(
        page = page_no,
        status = status.as_str(),
        embedded_chars,
        "sparse page routed through OCR"
    );
    match (status, ocr_text) {
        (OcrStatus::OcrSuccess, Some(text)) => text,
        _ => embedded.to_string(),
    }
}

/// Split one page into paragraph blocks. Offsets restart at 0 per page and
/// advance by block length + 1.
fn page_blocks(page_no: i64, text: &str) -> Vec<DocumentBlock> {
    let mut blocks = Vec::new();
    let mut offset = 0i64;
    for paragraph in PARAGRAPH_SPLIT_RE.split(text) {
        let trimmed = paragraph.trim();
        if trimmed.is_empty() {
            continue;
        }
        let len = trimmed.chars().count() as i64;
        blocks.push(DocumentBlock {
            text: trimmed.to_string(),
            source: SourceRef {
                page: Some(page_no),
                chapter: None,
                item_id: None,
                char_start: Some(offset),
                char_end: Some(offset + len),
            },
        });
        offset += len + 1;
    }
    blocks
}

fn document_info(doc: &lopdf::Document) -> (Option<String>, Option<String>) {
    let Some(info) = info_dictionary(doc) else {
        return (None, None);
    };
    (
        info_string(doc, info, b"Title"),
        info_string(doc, info, b"Author"),
    )
}

fn info_dictionary(doc: &lopdf::Document) -> Option<&lopdf::Dictionary> {
    let obj = doc.trailer.get(b"Info").ok()?;
    match obj {
        lopdf::Object::Reference(id) => doc.get_object(*id).ok()?.as_dict().ok(),
        lopdf::Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn info_string(doc: &lopdf::Document, dict: &lopdf::Dictionary, key: &[u8]) -> Option<String> {
    let obj = dict.get(key).ok()?;
    let obj = match obj {
        lopdf::Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    match obj {
        lopdf::Object::String(bytes, _) => {
            let decoded = decode_pdf_string(bytes);
            let trimmed = decoded.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        _ => None,
    }
}

/// PDF text strings are UTF-16BE when they carry a BOM, otherwise treated
/// as UTF-8 when valid and as Latin-1-compatible bytes when not.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let (text, _, _) = UTF_16BE.decode(bytes);
        return text.into_owned();
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

/// MediaBox area in points² per page, honoring inheritance from the page
/// tree.
fn page_areas(doc: &lopdf::Document) -> Vec<f64> {
    doc.get_pages()
        .values()
        .map(|&page_id| media_box_area(doc, page_id).unwrap_or(US_LETTER_AREA))
        .collect()
}

fn media_box_area(doc: &lopdf::Document, page_id: lopdf::ObjectId) -> Option<f64> {
    let mut current = page_id;
    for _ in 0..8 {
        let dict = doc.get_object(current).ok()?.as_dict().ok()?;
        if let Ok(obj) = dict.get(b"MediaBox") {
            let rect = match obj {
                lopdf::Object::Reference(id) => doc.get_object(*id).ok()?.as_array().ok()?,
                lopdf::Object::Array(arr) => arr,
                _ => return None,
            };
            if rect.len() == 4 {
                let nums: Vec<f64> = rect.iter().filter_map(as_number).collect();
                if nums.len() == 4 {
                    return Some(((nums[2] - nums[0]) * (nums[3] - nums[1])).abs());
                }
            }
            return None;
        }
        match dict.get(b"Parent") {
            Ok(lopdf::Object::Reference(parent)) => current = *parent,
            _ => return None,
        }
    }
    None
}

fn as_number(obj: &lopdf::Object) -> Option<f64> {
    match obj {
        lopdf::Object::Integer(i) => Some(*i as f64),
        lopdf::Object::Real(f) => Some(*f as f64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};

    fn generated_pdf(body: &str, title: &str, author: &str) -> Vec<u8> {
        let mut doc = lopdf::Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(body)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().unwrap(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        let info_id = doc.add_object(dictionary! {
            "Title" => Object::string_literal(title),
            "Author" => Object::string_literal(author),
        });
        doc.trailer.set("Root", catalog_id);
        doc.trailer.set("Info", info_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn extracts_generated_document_with_metadata() {
        // Long enough that the page is not an OCR candidate.
        let body = "The quick brown fox jumps over the lazy dog near the riverbank. "
            .repeat(10);
        let raw = generated_pdf(&body, "Generated Fixture", "Test Author");

        let doc = PdfAdapter.extract(Path::new("fixture.pdf"), &raw).unwrap();
        assert_eq!(doc.metadata.format, "pdf");
        assert_eq!(doc.metadata.title.as_deref(), Some("Generated Fixture"));
        assert_eq!(doc.metadata.author.as_deref(), Some("Test Author"));
        assert!(!doc.blocks.is_empty());
        assert_eq!(doc.blocks[0].source.page, Some(1));
        assert!(doc.blocks[0].text.contains("quick brown fox"));
    }

    #[test]
    fn invalid_bytes_report_parse_error() {
        let err = PdfAdapter.extract(Path::new("bad.pdf"), b"not a pdf").unwrap_err();
        assert!(matches!(err, ExtractionError::Parse { format: "pdf", .. }));
    }

    #[test]
    fn supports_by_magic_and_extension() {
        let adapter = PdfAdapter;
        assert!(adapter.supports(Path::new("x.bin"), b"%PDF-1.4"));
        assert!(adapter.supports(Path::new("x.pdf"), b""));
        assert!(!adapter.supports(Path::new("x.txt"), b"plain"));
    }

    #[test]
    fn page_offsets_restart_and_advance_by_len_plus_one() {
        let blocks = page_blocks(2, "First paragraph.\n\nSecond one.");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].source.char_start, Some(0));
        assert_eq!(blocks[0].source.char_end, Some(16));
        assert_eq!(blocks[1].source.char_start, Some(17));
        assert_eq!(blocks[1].source.page, Some(2));
    }

    #[test]
    fn coverage_threshold_flags_sparse_pages() {
        assert!(needs_ocr(10, US_LETTER_AREA));
        assert!(!needs_ocr(600, US_LETTER_AREA));
    }

    #[test]
    fn pdf_strings_decode_utf16_and_latin() {
        let utf16 = [0xFE, 0xFF, 0x04, 0x12, 0x04, 0x3E]; // "Во"
        assert_eq!(decode_pdf_string(&utf16), "Во");
        assert_eq!(decode_pdf_string(b"Plain title"), "Plain title");
    }
}
