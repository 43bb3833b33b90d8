//! Core data models used throughout Librarium.
//!
//! These types represent the extracted documents, locator metadata, and
//! chunks that flow through the ingestion and retrieval pipeline.

use serde::Serialize;

/// Document-level metadata produced once per file by a format adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    /// ISO 639-1 code when known ("ru", "kk", "tt", "en").
    pub language: Option<String>,
    /// Format tag: "pdf", "epub", "fb2", "txt".
    pub format: String,
}

/// Locator pointing back into the original document.
///
/// `page` is 1-based for paginated formats; `chapter` is a human-readable
/// label; `item_id` identifies the container unit (spine item, section,
/// line). `char_start`/`char_end` are character offsets within the item's
/// coordinate space as defined by each adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceRef {
    pub page: Option<i64>,
    pub chapter: Option<String>,
    pub item_id: Option<String>,
    pub char_start: Option<i64>,
    pub char_end: Option<i64>,
}

/// A contiguous unit of extracted text plus its locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentBlock {
    pub text: String,
    pub source: SourceRef,
}

/// Canonical adapter output: ordered blocks in reading order.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub source_path: String,
    pub metadata: ExtractedMetadata,
    pub blocks: Vec<DocumentBlock>,
}

/// A chunk of document text spanning one or more blocks of a single
/// locator domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub source: SourceRef,
}

impl SourceRef {
    /// Locator domain key: chunks never cross a (page, chapter, item_id)
    /// boundary.
    pub fn domain_key(&self) -> (Option<i64>, Option<&str>, Option<&str>) {
        (self.page, self.chapter.as_deref(), self.item_id.as_deref())
    }
}

impl ExtractedDocument {
    /// Full text of the document, blocks joined by newlines. Used for
    /// language detection and fingerprinting.
    pub fn joined_text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
