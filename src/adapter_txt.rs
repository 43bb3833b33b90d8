//! Plain-text adapter: charset detection, header metadata, per-line blocks.
//!
//! TXT is the permissive fallback format. `supports` accepts `.txt` files
//! outright and otherwise rejects anything that looks like a known binary
//! container, leaving the rest to be treated as text.

use std::path::Path;
use std::sync::LazyLock;

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, WINDOWS_1251};
use regex::Regex;
use tracing::debug;

use crate::extract::{extension_of, DocumentAdapter, ExtractionError};
use crate::models::{DocumentBlock, ExtractedDocument, ExtractedMetadata, SourceRef};

/// Lines scanned for `Title:`/`Author:` style metadata headers.
const HEADER_SCAN_LINES: usize = 20;

static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(title|название|author|автор)\s*:\s*(.+)$").unwrap());

pub struct TxtAdapter;

impl DocumentAdapter for TxtAdapter {
    fn format(&self) -> &'static str {
        "txt"
    }

    fn supports(&self, path: &Path, sniff: &[u8]) -> bool {
        match extension_of(path).as_deref() {
            Some("txt") => return true,
            Some("pdf" | "epub" | "fb2" | "fbz" | "zip") => return false,
            _ => {}
        }
        if sniff.contains(&0) {
            return false;
        }
        let head = sniff.trim_ascii_start();
        !(head.starts_with(b"%PDF-")
            || head.starts_with(b"PK\x03\x04")
            || head.starts_with(b"<?xml")
            || head.starts_with(b"<FictionBook"))
    }

    fn extract(&self, path: &Path, raw: &[u8]) -> Result<ExtractedDocument, ExtractionError> {
        let (text, encoding) = decode_bytes(raw);
        debug!(path = %path.display(), encoding, "decoded text file");

        let (title, author) = scan_header(&text);
        let blocks = line_blocks(&text);
        if blocks.is_empty() {
            return Err(ExtractionError::parse("txt", path, "no extractable text"));
        }

        Ok(ExtractedDocument {
            source_path: crate::extract::path_string(path),
            metadata: ExtractedMetadata {
                title,
                author,
                language: None,
                format: "txt".to_string(),
            },
            blocks,
        })
    }
}

/// Decode with BOM honor, then strict UTF-8, then a confidence-based
/// detector, with cp1251 as the hard fallback for mojibake.
fn decode_bytes(raw: &[u8]) -> (String, &'static str) {
    if let Some((encoding, _)) = Encoding::for_bom(raw) {
        let (text, _, _) = encoding.decode(raw);
        return (text.into_owned(), encoding.name());
    }
    if let Ok(text) = std::str::from_utf8(raw) {
        return (text.to_string(), "UTF-8");
    }
    let mut detector = EncodingDetector::new();
    detector.feed(raw, true);
    let guessed = detector.guess(None, true);
    let (text, used, had_errors) = guessed.decode(raw);
    if had_errors && used != WINDOWS_1251 {
        let (retry, _, _) = WINDOWS_1251.decode(raw);
        return (retry.into_owned(), WINDOWS_1251.name());
    }
    (text.into_owned(), used.name())
}

/// First `Title:`/`Название:` and `Author:`/`Автор:` lines win.
fn scan_header(text: &str) -> (Option<String>, Option<String>) {
    let mut title = None;
    let mut author = None;
    for line in text.lines().take(HEADER_SCAN_LINES) {
        if let Some(caps) = HEADER_RE.captures(line.trim()) {
            let key = caps[1].to_lowercase();
            let value = caps[2].trim().to_string();
            if value.is_empty() {
                continue;
            }
            if (key == "title" || key == "название") && title.is_none() {
                title = Some(value);
            } else if (key == "author" || key == "автор") && author.is_none() {
                author = Some(value);
            }
        }
    }
    (title, author)
}

/// One block per non-empty line. Offsets are character positions in the
/// decoded text; positions advance by the raw line length including its
/// terminator.
fn line_blocks(text: &str) -> Vec<DocumentBlock> {
    let mut blocks = Vec::new();
    let mut char_pos = 0i64;
    let mut line_no = 0i64;

    for raw_line in text.split_inclusive('\n') {
        line_no += 1;
        let line_chars = raw_line.chars().count() as i64;
        let content = raw_line.trim_end_matches(['\n', '\r']);
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            let leading_ws = content.chars().take_while(|c| c.is_whitespace()).count() as i64;
            let start = char_pos + leading_ws;
            blocks.push(DocumentBlock {
                text: trimmed.to_string(),
                source: SourceRef {
                    page: None,
                    chapter: None,
                    item_id: Some(format!("line-{line_no}")),
                    char_start: Some(start),
                    char_end: Some(start + trimmed.chars().count() as i64),
                },
            });
        }
        char_pos += line_chars;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(path: &str, raw: &[u8]) -> ExtractedDocument {
        TxtAdapter.extract(Path::new(path), raw).unwrap()
    }

    #[test]
    fn parses_bilingual_headers_and_line_blocks() {
        let text = "Название: Война и мир\nАвтор: Лев Толстой\n\nПервая строка текста.\n";
        let doc = extract("tolstoy.txt", text.as_bytes());

        assert_eq!(doc.metadata.title.as_deref(), Some("Война и мир"));
        assert_eq!(doc.metadata.author.as_deref(), Some("Лев Толстой"));
        assert_eq!(doc.blocks.len(), 3);
        assert_eq!(doc.blocks[0].source.item_id.as_deref(), Some("line-1"));
        assert_eq!(doc.blocks[2].source.item_id.as_deref(), Some("line-4"));
        assert_eq!(doc.blocks[2].text, "Первая строка текста.");
    }

    #[test]
    fn first_header_occurrence_wins() {
        let text = "Title: First\nTitle: Second\nAuthor: Someone\n";
        let doc = extract("a.txt", text.as_bytes());
        assert_eq!(doc.metadata.title.as_deref(), Some("First"));
    }

    #[test]
    fn offsets_track_raw_line_lengths() {
        let text = "A line.\n\n  Indented.\n";
        let doc = extract("b.txt", text.as_bytes());

        assert_eq!(doc.blocks.len(), 2);
        assert_eq!(doc.blocks[0].source.char_start, Some(0));
        assert_eq!(doc.blocks[0].source.char_end, Some(7));
        assert_eq!(doc.blocks[1].source.item_id.as_deref(), Some("line-3"));
        assert_eq!(doc.blocks[1].source.char_start, Some(11));
        assert_eq!(doc.blocks[1].source.char_end, Some(20));
    }

    #[test]
    fn decodes_cp1251_content() {
        let text = "Привет, мир! Это проверка кодировки и детектора для русского текста.";
        let (encoded, _, _) = WINDOWS_1251.encode(text);
        let doc = extract("cp1251.txt", &encoded);
        assert!(doc.blocks[0].text.contains("Привет, мир"));
    }

    #[test]
    fn honors_utf8_bom() {
        let doc = extract("bom.txt", b"\xEF\xBB\xBFHello world line.");
        assert_eq!(doc.blocks[0].text, "Hello world line.");
        assert_eq!(doc.blocks[0].source.char_start, Some(0));
    }

    #[test]
    fn rejects_binary_lookalikes_but_accepts_txt_extension() {
        let adapter = TxtAdapter;
        assert!(!adapter.supports(Path::new("data.bin"), b"ab\x00cd"));
        assert!(!adapter.supports(Path::new("doc.unknown"), b"  %PDF-1.4"));
        assert!(!adapter.supports(Path::new("book.fb2"), b"plain"));
        assert!(adapter.supports(Path::new("notes.txt"), b"anything"));
        assert!(adapter.supports(Path::new("README"), b"plain text"));
    }

    #[test]
    fn empty_file_is_an_error() {
        let err = TxtAdapter.extract(Path::new("empty.txt"), b"  \n \n").unwrap_err();
        assert!(matches!(err, ExtractionError::Parse { format: "txt", .. }));
    }
}
