//! Document fingerprinting and duplicate detection.
//!
//! Every ingested document gets a dual fingerprint: a hash of the raw bytes
//! (catches exact re-uploads) and a hash of the normalized block text
//! (catches the same content re-encoded or converted to another format).
//! Metadata header blocks are excluded from the text hash so a TXT export
//! with a `Title:` line still matches its EPUB twin.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::models::ExtractedDocument;

static METADATA_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(title|author|название|автор)\s*:\s*").unwrap());

/// Dual fingerprint for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFingerprint {
    pub binary_hash: String,
    pub normalized_text_hash: String,
}

/// Result of duplicate evaluation for one document.
#[derive(Debug, Clone)]
pub struct DedupeDecision {
    pub is_duplicate: bool,
    pub reason: Option<DuplicateReason>,
    pub fingerprint: DocumentFingerprint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateReason {
    BinaryMatch,
    NormalizedContentMatch,
}

impl DuplicateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateReason::BinaryMatch => "binary-match",
            DuplicateReason::NormalizedContentMatch => "normalized-content-match",
        }
    }
}

/// JSON-persistable registry state: two sorted hex digest lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupeSnapshot {
    #[serde(default)]
    pub binary_hashes: Vec<String>,
    #[serde(default)]
    pub normalized_text_hashes: Vec<String>,
}

/// In-memory fingerprint registry for duplicate checks.
#[derive(Debug, Default)]
pub struct FingerprintRegistry {
    binary_hashes: HashSet<String>,
    normalized_text_hashes: HashSet<String>,
}

impl FingerprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore registry state from a persisted snapshot.
    pub fn seed(&mut self, snapshot: &DedupeSnapshot) {
        self.binary_hashes
            .extend(snapshot.binary_hashes.iter().cloned());
        self.normalized_text_hashes
            .extend(snapshot.normalized_text_hashes.iter().cloned());
    }

    /// Export registry state for persistence between runs.
    pub fn snapshot(&self) -> DedupeSnapshot {
        let mut binary_hashes: Vec<String> = self.binary_hashes.iter().cloned().collect();
        let mut normalized_text_hashes: Vec<String> =
            self.normalized_text_hashes.iter().cloned().collect();
        binary_hashes.sort();
        normalized_text_hashes.sort();
        DedupeSnapshot {
            binary_hashes,
            normalized_text_hashes,
        }
    }

    /// Check a fingerprint against the registry. Binary match wins over
    /// normalized match; a first sighting registers both hashes.
    pub fn evaluate(&mut self, fingerprint: DocumentFingerprint) -> DedupeDecision {
        if self.binary_hashes.contains(&fingerprint.binary_hash) {
            return DedupeDecision {
                is_duplicate: true,
                reason: Some(DuplicateReason::BinaryMatch),
                fingerprint,
            };
        }
        if self
            .normalized_text_hashes
            .contains(&fingerprint.normalized_text_hash)
        {
            return DedupeDecision {
                is_duplicate: true,
                reason: Some(DuplicateReason::NormalizedContentMatch),
                fingerprint,
            };
        }

        self.binary_hashes.insert(fingerprint.binary_hash.clone());
        self.normalized_text_hashes
            .insert(fingerprint.normalized_text_hash.clone());
        DedupeDecision {
            is_duplicate: false,
            reason: None,
            fingerprint,
        }
    }
}

/// Build binary and normalized-text fingerprints for a document.
pub fn fingerprint_document(raw_bytes: &[u8], document: &ExtractedDocument) -> DocumentFingerprint {
    let binary_hash = hash_bytes(raw_bytes);

    let text_payload = document
        .blocks
        .iter()
        .filter(|block| !block.text.is_empty() && !METADATA_LINE_RE.is_match(&block.text))
        .map(|block| block.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let normalized_text_hash = hash_bytes(normalize_for_fingerprint(&text_payload).as_bytes());

    DocumentFingerprint {
        binary_hash,
        normalized_text_hash,
    }
}

/// Stable text for comparisons: NFKC, case folded, whitespace collapsed.
pub fn normalize_for_fingerprint(text: &str) -> String {
    let composed: String = text.nfkc().collect();
    composed
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentBlock, ExtractedMetadata, SourceRef};

    fn doc(blocks: &[&str]) -> ExtractedDocument {
        ExtractedDocument {
            source_path: "test.txt".to_string(),
            metadata: ExtractedMetadata {
                format: "txt".to_string(),
                ..Default::default()
            },
            blocks: blocks
                .iter()
                .map(|text| DocumentBlock {
                    text: text.to_string(),
                    source: SourceRef::default(),
                })
                .collect(),
        }
    }

    #[test]
    fn byte_identical_content_is_binary_match() {
        let mut registry = FingerprintRegistry::new();
        let document = doc(&["Первая строка", "Вторая строка"]);
        let bytes = b"identical bytes";

        let first = registry.evaluate(fingerprint_document(bytes, &document));
        assert!(!first.is_duplicate);
        assert_eq!(first.reason, None);

        let second = registry.evaluate(fingerprint_document(bytes, &document));
        assert!(second.is_duplicate);
        assert_eq!(second.reason, Some(DuplicateReason::BinaryMatch));
    }

    #[test]
    fn reencoded_content_is_normalized_match() {
        let mut registry = FingerprintRegistry::new();
        let original = doc(&["Какой-то   текст", "ещё строка"]);
        let reencoded = doc(&["КАКОЙ-ТО ТЕКСТ", "ЕЩЁ СТРОКА"]);

        registry.evaluate(fingerprint_document(b"bytes one", &original));
        let decision = registry.evaluate(fingerprint_document(b"bytes two", &reencoded));
        assert!(decision.is_duplicate);
        assert_eq!(decision.reason, Some(DuplicateReason::NormalizedContentMatch));
    }

    #[test]
    fn metadata_header_blocks_are_excluded() {
        let mut registry = FingerprintRegistry::new();
        let plain = doc(&["Основной текст документа"]);
        let with_headers = doc(&[
            "Название: Экспорт",
            "Автор: Кто-то",
            "Основной текст документа",
        ]);

        registry.evaluate(fingerprint_document(b"a", &plain));
        let decision = registry.evaluate(fingerprint_document(b"b", &with_headers));
        assert!(decision.is_duplicate);
        assert_eq!(decision.reason, Some(DuplicateReason::NormalizedContentMatch));
    }

    #[test]
    fn distinct_documents_are_not_duplicates() {
        let mut registry = FingerprintRegistry::new();
        let first = registry.evaluate(fingerprint_document(b"a", &doc(&["Один текст"])));
        let second = registry.evaluate(fingerprint_document(b"b", &doc(&["Совсем другой"])));
        assert!(!first.is_duplicate);
        assert!(!second.is_duplicate);
    }

    #[test]
    fn snapshot_round_trip_preserves_decisions() {
        let mut registry = FingerprintRegistry::new();
        let fingerprint = fingerprint_document(b"payload", &doc(&["Текст"]));
        registry.evaluate(fingerprint.clone());

        let snapshot = registry.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: DedupeSnapshot = serde_json::from_str(&json).unwrap();

        let mut seeded = FingerprintRegistry::new();
        seeded.seed(&restored);
        let decision = seeded.evaluate(fingerprint);
        assert!(decision.is_duplicate);
        assert_eq!(decision.reason, Some(DuplicateReason::BinaryMatch));
    }
}
