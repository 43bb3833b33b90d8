//! Ingestion reporting: extract, chunk, and dedupe-check documents
//! without touching the index.
//!
//! This is the dry pass over a file or directory. It routes each file
//! through the format adapters, chunks the result, and evaluates the
//! dual-fingerprint duplicate check against an optional persisted cache.
//! Writing to the index is `index`'s job.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::warn;

use crate::chunk;
use crate::config::Config;
use crate::dedupe::{self, DedupeSnapshot, FingerprintRegistry};
use crate::extract;
use crate::indexer;

#[derive(Debug, Serialize)]
pub struct IngestReport {
    pub path: String,
    pub processed: usize,
    pub results: Vec<DocumentReport>,
    pub errors: Vec<IngestErrorDetail>,
}

#[derive(Debug, Serialize)]
pub struct DocumentReport {
    pub source_path: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub format: String,
    pub chunk_count: usize,
    pub is_duplicate: bool,
    pub duplicate_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestErrorDetail {
    pub source_path: String,
    pub error: String,
}

/// Resolve the ingest target to a worklist. A file is taken as-is; its
/// suitability is decided by adapter routing, not the extension.
pub fn collect_inputs(target: &Path, exclude_globs: &[String]) -> Result<Vec<PathBuf>> {
    if target.is_file() {
        return Ok(vec![target.to_path_buf()]);
    }
    if target.is_dir() {
        return indexer::scan_library(target, exclude_globs);
    }
    bail!("Ingest target does not exist: {}", target.display());
}

/// Extract, chunk, and dedupe-check one document.
pub fn ingest_document(
    path: &Path,
    config: &Config,
    registry: &mut FingerprintRegistry,
) -> Result<DocumentReport> {
    let (raw, document) = extract::extract_document(path)?;
    let chunks = chunk::chunk_document(
        &document,
        config.chunking.max_chars,
        config.chunking.overlap_chars,
    )?;
    let fingerprint = dedupe::fingerprint_document(&raw, &document);
    let decision = registry.evaluate(fingerprint);

    Ok(DocumentReport {
        source_path: document.source_path.clone(),
        title: document.metadata.title.clone(),
        author: document.metadata.author.clone(),
        format: document.metadata.format.clone(),
        chunk_count: chunks.len(),
        is_duplicate: decision.is_duplicate,
        duplicate_reason: decision.reason.map(|r| r.as_str().to_string()),
    })
}

fn load_snapshot(path: &Path) -> Result<DedupeSnapshot> {
    if !path.exists() {
        return Ok(DedupeSnapshot::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read dedupe cache {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse dedupe cache {}", path.display()))
}

fn save_snapshot(path: &Path, snapshot: &DedupeSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(snapshot)?)
        .with_context(|| format!("Failed to write dedupe cache {}", path.display()))?;
    Ok(())
}

/// CLI entry point for `ingest`.
pub fn run_ingest(config: &Config, path: &Path, use_cache: bool, json: bool) -> Result<()> {
    let cache_path = &config.storage.dedupe_cache_path;
    let mut registry = FingerprintRegistry::new();
    if use_cache {
        let snapshot = load_snapshot(cache_path)?;
        registry.seed(&snapshot);
    }

    let files = collect_inputs(path, &config.ingest.exclude)?;
    if !json {
        println!("ingest {}", path.display());
    }

    let mut results: Vec<DocumentReport> = Vec::new();
    let mut errors: Vec<IngestErrorDetail> = Vec::new();
    for file in &files {
        match ingest_document(file, config, &mut registry) {
            Ok(report) => {
                if !json {
                    if report.is_duplicate {
                        let reason = report.duplicate_reason.as_deref().unwrap_or("duplicate");
                        println!("  {}: duplicate ({reason})", file.display());
                    } else {
                        println!("  {}: {} chunks", file.display(), report.chunk_count);
                    }
                }
                results.push(report);
            }
            Err(e) => {
                warn!(path = %file.display(), "ingest failed: {e:#}");
                if !json {
                    println!("  {}: failed: {e:#}", file.display());
                }
                errors.push(IngestErrorDetail {
                    source_path: file.display().to_string(),
                    error: format!("{e:#}"),
                });
            }
        }
    }

    if use_cache {
        save_snapshot(cache_path, &registry.snapshot())?;
    }

    let report = IngestReport {
        path: path.display().to_string(),
        processed: results.len(),
        results,
        errors,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let duplicates = report.results.iter().filter(|r| r.is_duplicate).count();
        println!(
            "processed: {}, duplicates: {}, errors: {}",
            report.processed,
            duplicates,
            report.errors.len()
        );
        println!("ok");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn reports_metadata_and_chunk_count() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "kniga.txt",
            "Название: Тишина\nАвтор: Иванов\n\nПервый абзац о практике внимания.",
        );

        let config = Config::default();
        let mut registry = FingerprintRegistry::new();
        let report = ingest_document(&path, &config, &mut registry).unwrap();

        assert_eq!(report.title.as_deref(), Some("Тишина"));
        assert_eq!(report.author.as_deref(), Some("Иванов"));
        assert_eq!(report.format, "txt");
        assert!(report.chunk_count >= 1);
        assert!(!report.is_duplicate);
        assert!(report.duplicate_reason.is_none());
    }

    #[test]
    fn identical_bytes_flag_a_binary_duplicate() {
        let dir = TempDir::new().unwrap();
        let text = "Название: Река\n\nВода течёт на юг.";
        let first = write_file(&dir, "a.txt", text);
        let second = write_file(&dir, "b.txt", text);

        let config = Config::default();
        let mut registry = FingerprintRegistry::new();
        ingest_document(&first, &config, &mut registry).unwrap();
        let report = ingest_document(&second, &config, &mut registry).unwrap();

        assert!(report.is_duplicate);
        assert_eq!(report.duplicate_reason.as_deref(), Some("binary-match"));
    }

    #[test]
    fn reflowed_text_flags_a_normalized_duplicate() {
        let dir = TempDir::new().unwrap();
        let first = write_file(&dir, "a.txt", "Название: Река\n\nВода течёт на юг.");
        // Same content, different byte stream: reflowed whitespace, case,
        // and a changed header line.
        let second = write_file(&dir, "b.txt", "Название: Река (копия)\n\nВОДА   течёт на юг.");

        let config = Config::default();
        let mut registry = FingerprintRegistry::new();
        ingest_document(&first, &config, &mut registry).unwrap();
        let report = ingest_document(&second, &config, &mut registry).unwrap();

        assert!(report.is_duplicate);
        assert_eq!(
            report.duplicate_reason.as_deref(),
            Some("normalized-content-match")
        );
    }

    #[test]
    fn distinct_documents_are_not_flagged() {
        let dir = TempDir::new().unwrap();
        let first = write_file(&dir, "a.txt", "Вода течёт на юг.");
        let second = write_file(&dir, "b.txt", "Горы стоят на севере.");

        let config = Config::default();
        let mut registry = FingerprintRegistry::new();
        ingest_document(&first, &config, &mut registry).unwrap();
        let report = ingest_document(&second, &config, &mut registry).unwrap();

        assert!(!report.is_duplicate);
    }

    #[test]
    fn snapshot_roundtrip_preserves_fingerprints() {
        let dir = TempDir::new().unwrap();
        let book = write_file(&dir, "a.txt", "Вода течёт на юг.");
        let cache = dir.path().join("cache/dedupe.json");

        let config = Config::default();
        let mut registry = FingerprintRegistry::new();
        ingest_document(&book, &config, &mut registry).unwrap();
        save_snapshot(&cache, &registry.snapshot()).unwrap();

        // A fresh registry seeded from disk still knows the document.
        let mut reloaded = FingerprintRegistry::new();
        reloaded.seed(&load_snapshot(&cache).unwrap());
        let report = ingest_document(&book, &config, &mut reloaded).unwrap();
        assert!(report.is_duplicate);
        assert_eq!(report.duplicate_reason.as_deref(), Some("binary-match"));
    }

    #[test]
    fn missing_cache_loads_empty() {
        let dir = TempDir::new().unwrap();
        let snapshot = load_snapshot(&dir.path().join("absent.json")).unwrap();
        assert!(snapshot.binary_hashes.is_empty());
        assert!(snapshot.normalized_text_hashes.is_empty());
    }

    #[test]
    fn collects_a_single_file_and_walks_directories() {
        let dir = TempDir::new().unwrap();
        let single = write_file(&dir, "one.txt", "Текст.");
        assert_eq!(collect_inputs(&single, &[]).unwrap(), vec![single.clone()]);

        fs::create_dir_all(dir.path().join("inner")).unwrap();
        write_file(&dir, "inner/two.txt", "Ещё текст.");
        write_file(&dir, "notes.md", "пропустить");
        let found = collect_inputs(dir.path(), &[]).unwrap();
        assert_eq!(found.len(), 2);

        assert!(collect_inputs(&dir.path().join("missing"), &[]).is_err());
    }

    #[test]
    fn unsupported_content_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob.bin");
        fs::write(&path, [0u8, 159, 146, 150]).unwrap();

        let config = Config::default();
        let mut registry = FingerprintRegistry::new();
        assert!(ingest_document(&path, &config, &mut registry).is_err());
    }
}
