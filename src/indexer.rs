//! Library indexing: walk a directory of books, extract whatever changed,
//! chunk and normalize the text, and store it for retrieval.
//!
//! Change detection is two-tiered. A file whose mtime matches the stored
//! state is skipped without being read; a file whose content hash matches
//! is skipped after a read. Everything else is re-extracted and its chunks
//! replaced in one transaction. Per-file failures are recorded in the run
//! stats and never abort the run.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::chunk::chunk_document;
use crate::config::Config;
use crate::db;
use crate::extract;
use crate::lang;
use crate::migrate;
use crate::models::{ExtractedDocument, TextChunk};
use crate::normalize;

/// Extensions the format adapters can handle.
const SUPPORTED_EXTENSIONS: [&str; 5] = ["pdf", "epub", "fb2", "fbz", "txt"];

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexRunStats {
    pub scanned: u64,
    pub indexed: u64,
    pub skipped_unchanged: u64,
    pub errors: u64,
    pub duration_ms: u64,
    pub error_details: Vec<IndexErrorDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexErrorDetail {
    pub source_path: String,
    pub error: String,
}

enum FileOutcome {
    Indexed { chunks: usize },
    Skipped,
}

/// True for files the adapters can open, including `.fb2.zip` doubles.
pub fn is_candidate(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.ends_with(".fb2.zip") {
        return true;
    }
    match path.extension().map(|e| e.to_string_lossy().to_lowercase()) {
        Some(ext) => SUPPORTED_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

/// Collect candidate files under `root` in deterministic order.
pub fn scan_library(root: &Path, exclude_globs: &[String]) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        bail!("Library root does not exist: {}", root.display());
    }
    let exclude_set = build_globset(exclude_globs)?;

    let mut paths = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if exclude_set.is_match(relative) {
            continue;
        }
        if !is_candidate(path) {
            continue;
        }
        paths.push(path.to_path_buf());
    }

    paths.sort();
    Ok(paths)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Index every candidate file under `root` into the given database.
pub async fn index_directory(
    pool: &SqlitePool,
    config: &Config,
    root: &Path,
) -> Result<IndexRunStats> {
    let started = Instant::now();
    let paths = scan_library(root, &config.ingest.exclude)?;

    let mut stats = IndexRunStats {
        scanned: paths.len() as u64,
        ..IndexRunStats::default()
    };

    for path in &paths {
        match index_file(pool, config, path).await {
            Ok(FileOutcome::Indexed { chunks }) => {
                stats.indexed += 1;
                info!(path = %path.display(), chunks, "indexed");
            }
            Ok(FileOutcome::Skipped) => stats.skipped_unchanged += 1,
            Err(e) => {
                stats.errors += 1;
                warn!(path = %path.display(), error = %format!("{e:#}"), "indexing failed");
                stats.error_details.push(IndexErrorDetail {
                    source_path: path.display().to_string(),
                    error: format!("{e:#}"),
                });
            }
        }
    }

    stats.duration_ms = started.elapsed().as_millis() as u64;
    Ok(stats)
}

async fn index_file(pool: &SqlitePool, config: &Config, path: &Path) -> Result<FileOutcome> {
    let source_path = canonical_string(path);
    let mtime = mtime_ns(path);

    let state: Option<(String, i64)> =
        sqlx::query_as("SELECT fingerprint, mtime_ns FROM index_state WHERE source_path = ?")
            .bind(&source_path)
            .fetch_optional(pool)
            .await?;

    if let Some((_, stored_mtime)) = &state {
        if mtime != 0 && *stored_mtime == mtime {
            return Ok(FileOutcome::Skipped);
        }
    }

    let raw = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let fingerprint = hash_bytes(&raw);

    if let Some((stored_fingerprint, _)) = &state {
        if *stored_fingerprint == fingerprint {
            // Content unchanged; remember the new mtime for the fast path.
            upsert_index_state(pool, &source_path, &fingerprint, mtime).await?;
            return Ok(FileOutcome::Skipped);
        }
    }

    let document = extract::extract_from_bytes(path, &raw)?;
    let language = match &config.ingest.language_override {
        Some(code) => code.to_lowercase(),
        None => lang::resolve_language(
            document.metadata.language.as_deref(),
            &document.joined_text(),
        ),
    };
    let chunks = chunk_document(
        &document,
        config.chunking.max_chars,
        config.chunking.overlap_chars,
    )?;

    store_book(pool, &source_path, &document, &language, &chunks).await?;
    upsert_index_state(pool, &source_path, &fingerprint, mtime).await?;
    Ok(FileOutcome::Indexed {
        chunks: chunks.len(),
    })
}

/// Upsert the book row and replace its chunks in one transaction.
async fn store_book(
    pool: &SqlitePool,
    source_path: &str,
    document: &ExtractedDocument,
    language: &str,
    chunks: &[TextChunk],
) -> Result<i64> {
    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO books (source_path, title, author, format, language, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_path) DO UPDATE SET
            title = excluded.title,
            author = excluded.author,
            format = excluded.format,
            language = excluded.language,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(source_path)
    .bind(&document.metadata.title)
    .bind(&document.metadata.author)
    .bind(&document.metadata.format)
    .bind(language)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let book_id: i64 = sqlx::query_scalar("SELECT id FROM books WHERE source_path = ?")
        .bind(source_path)
        .fetch_one(&mut *tx)
        .await?;

    // Old rows go first; the FTS triggers keep chunks_fts in step.
    sqlx::query("DELETE FROM chunks WHERE book_id = ?")
        .bind(book_id)
        .execute(&mut *tx)
        .await?;

    for (i, chunk) in chunks.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO chunks (book_id, chunk_no, raw_text, lemma_text, page, chapter, item_id,
                                char_start, char_end)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(book_id)
        .bind(i as i64)
        .bind(&chunk.text)
        .bind(normalize::normalize_text(&chunk.text, language))
        .bind(chunk.source.page)
        .bind(&chunk.source.chapter)
        .bind(&chunk.source.item_id)
        .bind(chunk.source.char_start)
        .bind(chunk.source.char_end)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(book_id)
}

async fn upsert_index_state(
    pool: &SqlitePool,
    source_path: &str,
    fingerprint: &str,
    mtime_ns: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO index_state (source_path, fingerprint, mtime_ns, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(source_path) DO UPDATE SET
            fingerprint = excluded.fingerprint,
            mtime_ns = excluded.mtime_ns,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(source_path)
    .bind(fingerprint)
    .bind(mtime_ns)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

fn canonical_string(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

fn mtime_ns(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// CLI entry point for `index`.
pub async fn run_index(config: &Config, dir: &Path, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let stats = index_directory(&pool, config, dir).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("index {}", dir.display());
        println!("  scanned: {}", stats.scanned);
        println!("  indexed: {}", stats.indexed);
        println!("  skipped (unchanged): {}", stats.skipped_unchanged);
        println!("  errors: {}", stats.errors);
        for detail in &stats.error_details {
            println!("    {}: {}", detail.source_path, detail.error);
        }
        println!("  took: {} ms", stats.duration_ms);
        println!("ok");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::Row;
    use tempfile::TempDir;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::ensure_schema(&pool).await.unwrap();
        pool
    }

    #[test]
    fn candidates_match_supported_extensions() {
        assert!(is_candidate(Path::new("a.txt")));
        assert!(is_candidate(Path::new("b.PDF")));
        assert!(is_candidate(Path::new("c.fb2")));
        assert!(is_candidate(Path::new("d.fbz")));
        assert!(is_candidate(Path::new("roman.fb2.zip")));
        assert!(!is_candidate(Path::new("archive.zip")));
        assert!(!is_candidate(Path::new("notes.md")));
        assert!(!is_candidate(Path::new("README")));
    }

    #[test]
    fn scan_respects_excludes_and_sorts() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("drafts")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("drafts/c.txt"), "c").unwrap();
        std::fs::write(dir.path().join("notes.md"), "skip").unwrap();

        let paths = scan_library(dir.path(), &["drafts/**".to_string()]).unwrap();
        let names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn scan_of_missing_root_fails() {
        assert!(scan_library(Path::new("/no/such/library"), &[]).is_err());
    }

    #[tokio::test]
    async fn indexes_then_skips_unchanged_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("kniga.txt"),
            "Название: Тишина\nПрактика внимания начинается с дыхания. Наблюдение за мыслями приходит позже.",
        )
        .unwrap();

        let pool = memory_pool().await;
        let config = Config::default();

        let first = index_directory(&pool, &config, dir.path()).await.unwrap();
        assert_eq!(first.scanned, 1);
        assert_eq!(first.indexed, 1);
        assert_eq!(first.errors, 0);

        let row = sqlx::query("SELECT title, format, language FROM books")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("title"), "Тишина");
        assert_eq!(row.get::<String, _>("format"), "txt");
        assert_eq!(row.get::<String, _>("language"), "ru");

        let lemma: String =
            sqlx::query_scalar("SELECT lemma_text FROM chunks ORDER BY chunk_no DESC LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(lemma.contains("практик"));

        let fts_hits: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'lemma_text : \"практик\"'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(fts_hits, 1);

        // Unchanged file hits the mtime fast path.
        let second = index_directory(&pool, &config, dir.path()).await.unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(second.skipped_unchanged, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn changed_content_replaces_chunks() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("kniga.txt");
        std::fs::write(&file, "Старое слово наблюдение.").unwrap();

        let pool = memory_pool().await;
        let config = Config::default();
        index_directory(&pool, &config, dir.path()).await.unwrap();

        // Force the slow path regardless of filesystem mtime granularity.
        sqlx::query("UPDATE index_state SET mtime_ns = 0")
            .execute(&pool)
            .await
            .unwrap();
        std::fs::write(&file, "Новое слово созерцание.").unwrap();

        let rerun = index_directory(&pool, &config, dir.path()).await.unwrap();
        assert_eq!(rerun.indexed, 1);

        let books: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM books")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(books, 1);

        let stale: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'наблюдение'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(stale, 0);
        let fresh: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'созерцание'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(fresh, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn per_file_failures_do_not_abort_the_run() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("good.txt"), "Хорошая книга о практике.").unwrap();
        std::fs::write(dir.path().join("broken.pdf"), b"not a pdf at all").unwrap();

        let pool = memory_pool().await;
        let config = Config::default();
        let stats = index_directory(&pool, &config, dir.path()).await.unwrap();

        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.indexed, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.error_details.len(), 1);
        assert!(stats.error_details[0].source_path.ends_with("broken.pdf"));
        pool.close().await;
    }

    #[tokio::test]
    async fn language_override_bypasses_detection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("kniga.txt"), "Практика внимания и тишины.").unwrap();

        let pool = memory_pool().await;
        let mut config = Config::default();
        config.ingest.language_override = Some("en".to_string());
        index_directory(&pool, &config, dir.path()).await.unwrap();

        let language: String = sqlx::query_scalar("SELECT language FROM books")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(language, "en");

        // The English pipeline lowercases without stemming.
        let lemma: String = sqlx::query_scalar("SELECT lemma_text FROM chunks LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(lemma.contains("практика"));
        pool.close().await;
    }
}
