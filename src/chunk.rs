//! Sentence-aware document chunking with locator propagation.
//!
//! Blocks are grouped into locator domains (maximal runs sharing page,
//! chapter, and item id), each domain's text is split into sentence units,
//! and sentences are greedily packed into overlapping windows. Chunk
//! boundaries always fall on sentence boundaries, never mid-sentence, and
//! a chunk never crosses into another locator domain.

use unicode_segmentation::UnicodeSegmentation;

use crate::config::ConfigError;
use crate::models::{DocumentBlock, ExtractedDocument, SourceRef, TextChunk};

/// Validate chunking parameters.
pub fn validate_chunking(max_chars: usize, overlap_chars: usize) -> Result<(), ConfigError> {
    if max_chars == 0 {
        return Err(ConfigError::NonPositiveMaxChars);
    }
    if overlap_chars >= max_chars {
        return Err(ConfigError::OverlapTooLarge {
            overlap: overlap_chars,
            max: max_chars,
        });
    }
    Ok(())
}

/// Split a document into overlapping sentence-bounded chunks.
///
/// Identical input always yields identical chunk boundaries.
pub fn chunk_document(
    document: &ExtractedDocument,
    max_chars: usize,
    overlap_chars: usize,
) -> Result<Vec<TextChunk>, ConfigError> {
    validate_chunking(max_chars, overlap_chars)?;

    let mut chunks = Vec::new();
    for domain in group_domains(document) {
        chunk_domain(&domain, max_chars, overlap_chars, &mut chunks);
    }
    Ok(chunks)
}

struct Domain {
    page: Option<i64>,
    chapter: Option<String>,
    item_id: Option<String>,
    text: String,
    char_start: i64,
    char_end: i64,
}

fn group_domains(document: &ExtractedDocument) -> Vec<Domain> {
    let mut domains: Vec<Domain> = Vec::new();
    let mut run: Vec<&DocumentBlock> = Vec::new();

    for block in &document.blocks {
        if block.text.trim().is_empty() {
            continue;
        }
        if let Some(last) = run.last() {
            if last.source.domain_key() != block.source.domain_key() {
                domains.push(build_domain(&run));
                run.clear();
            }
        }
        run.push(block);
    }
    if !run.is_empty() {
        domains.push(build_domain(&run));
    }
    domains
}

fn build_domain(blocks: &[&DocumentBlock]) -> Domain {
    let first = blocks[0];
    let text = blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let char_start = first.source.char_start.unwrap_or(0);
    let char_end = blocks
        .iter()
        .filter_map(|b| b.source.char_end)
        .max()
        .unwrap_or_else(|| char_start + text.chars().count() as i64);

    Domain {
        page: first.source.page,
        chapter: first.source.chapter.clone(),
        item_id: first.source.item_id.clone(),
        text,
        char_start,
        char_end,
    }
}

/// One sentence unit: trimmed text plus its character offset and length
/// within the domain text.
struct Sentence<'a> {
    text: &'a str,
    char_offset: usize,
    char_len: usize,
}

fn split_sentences(domain_text: &str) -> Vec<Sentence<'_>> {
    let mut sentences = Vec::new();
    let mut char_pos = 0usize;

    for (_, segment) in domain_text.split_sentence_bound_indices() {
        let trimmed = segment.trim();
        let segment_chars = segment.chars().count();
        if !trimmed.is_empty() {
            let leading_ws = segment.chars().take_while(|c| c.is_whitespace()).count();
            sentences.push(Sentence {
                text: trimmed,
                char_offset: char_pos + leading_ws,
                char_len: trimmed.chars().count(),
            });
        }
        char_pos += segment_chars;
    }
    sentences
}

fn chunk_domain(domain: &Domain, max_chars: usize, overlap_chars: usize, out: &mut Vec<TextChunk>) {
    let sentences = split_sentences(&domain.text);
    if sentences.is_empty() {
        return;
    }

    let mut start = 0usize;
    loop {
        // Greedy pack: joined length (single-space joins) stays within
        // max_chars; an oversized lone sentence is its own window.
        let mut end = start;
        let mut joined_len = sentences[start].char_len;
        while end + 1 < sentences.len() {
            let candidate = joined_len + 1 + sentences[end + 1].char_len;
            if candidate > max_chars {
                break;
            }
            joined_len = candidate;
            end += 1;
        }

        let text = sentences[start..=end]
            .iter()
            .map(|s| s.text)
            .collect::<Vec<_>>()
            .join(" ");
        let abs_start =
            (domain.char_start + sentences[start].char_offset as i64).max(domain.char_start);
        let abs_end = (abs_start + joined_len as i64).min(domain.char_end.max(abs_start));

        out.push(TextChunk {
            text,
            source: SourceRef {
                page: domain.page,
                chapter: domain.chapter.clone(),
                item_id: domain.item_id.clone(),
                char_start: Some(abs_start),
                char_end: Some(abs_end),
            },
        });

        if end + 1 >= sentences.len() {
            break;
        }

        // Step back over whole trailing sentences until the accumulated
        // length reaches overlap_chars (the crossing sentence is included);
        // never back to the window's own first sentence.
        let mut next = end + 1;
        if overlap_chars > 0 && end > start {
            let mut accumulated = 0usize;
            for j in ((start + 1)..=end).rev() {
                accumulated += sentences[j].char_len;
                next = j;
                if accumulated >= overlap_chars {
                    break;
                }
            }
        }
        start = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractedMetadata;

    fn doc_with_blocks(blocks: Vec<DocumentBlock>) -> ExtractedDocument {
        ExtractedDocument {
            source_path: "book.txt".to_string(),
            metadata: ExtractedMetadata {
                format: "txt".to_string(),
                ..Default::default()
            },
            blocks,
        }
    }

    fn block(
        text: &str,
        page: Option<i64>,
        chapter: Option<&str>,
        start: i64,
        end: i64,
    ) -> DocumentBlock {
        DocumentBlock {
            text: text.to_string(),
            source: SourceRef {
                page,
                chapter: chapter.map(|c| c.to_string()),
                item_id: None,
                char_start: Some(start),
                char_end: Some(end),
            },
        }
    }

    #[test]
    fn packs_sentences_with_sentence_granular_overlap() {
        let text = "Alpha one. Beta two is longer. Gamma three. Delta four.";
        let doc = doc_with_blocks(vec![block(text, Some(1), None, 10, 65)]);

        let chunks = chunk_document(&doc, 40, 12).unwrap();

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "Alpha one. Beta two is longer.",
                "Beta two is longer. Gamma three.",
                "Gamma three. Delta four.",
            ]
        );
        let starts: Vec<i64> = chunks.iter().filter_map(|c| c.source.char_start).collect();
        assert_eq!(starts, vec![10, 21, 41]);
        for chunk in &chunks {
            assert!(chunk.text.ends_with('.'));
        }
    }

    #[test]
    fn chunks_never_cross_domain_boundaries() {
        let doc = doc_with_blocks(vec![
            block(
                "First chapter sentence one. First chapter sentence two.",
                None,
                Some("One"),
                0,
                55,
            ),
            block("Second chapter text starts here.", None, Some("Two"), 0, 32),
        ]);

        let chunks = chunk_document(&doc, 600, 120).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].source.chapter.as_deref(), Some("One"));
        assert_eq!(chunks[1].source.chapter.as_deref(), Some("Two"));
        assert!(!chunks[0].text.contains("Second"));
        assert!(!chunks[1].text.contains("First"));
    }

    #[test]
    fn oversized_sentence_becomes_its_own_window() {
        let long = "Это предложение намного длиннее любого разумного окна и не делится.";
        let doc = doc_with_blocks(vec![block(long, None, None, 0, long.chars().count() as i64)]);

        let chunks = chunk_document(&doc, 20, 5).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, long);
    }

    #[test]
    fn char_ranges_are_ordered_and_clamped() {
        let text = "One sentence here. Another sentence follows. A third one closes.";
        let len = text.chars().count() as i64;
        let doc = doc_with_blocks(vec![block(text, Some(3), None, 100, 100 + len)]);

        let chunks = chunk_document(&doc, 45, 10).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let start = chunk.source.char_start.unwrap();
            let end = chunk.source.char_end.unwrap();
            assert!(start <= end);
            assert!(start >= 100);
            assert!(end <= 100 + len);
            assert_eq!(chunk.source.page, Some(3));
        }
    }

    #[test]
    fn identical_input_is_deterministic() {
        let text = "Alpha one. Beta two is longer. Gamma three. Delta four.";
        let doc = doc_with_blocks(vec![block(text, Some(1), None, 10, 65)]);

        let first = chunk_document(&doc, 40, 12).unwrap();
        let second = chunk_document(&doc, 40, 12).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_invalid_parameters() {
        let doc = doc_with_blocks(vec![block("Text.", None, None, 0, 5)]);
        assert_eq!(
            chunk_document(&doc, 0, 0).unwrap_err(),
            ConfigError::NonPositiveMaxChars
        );
        assert!(matches!(
            chunk_document(&doc, 100, 100).unwrap_err(),
            ConfigError::OverlapTooLarge { .. }
        ));
        assert!(matches!(
            chunk_document(&doc, 100, 150).unwrap_err(),
            ConfigError::OverlapTooLarge { .. }
        ));
    }

    #[test]
    fn empty_document_yields_no_chunks() {
        let doc = doc_with_blocks(vec![]);
        assert!(chunk_document(&doc, 600, 120).unwrap().is_empty());
    }
}
