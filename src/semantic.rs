//! Semantic indexing and retrieval over the flat vector store.
//!
//! The index run is incremental: each chunk's fingerprint covers the
//! embedding model and the raw text, so edits and model switches both
//! re-embed exactly what changed. A failed batch is recorded in the run
//! stats and never aborts the run. State rows for chunks that no longer
//! exist are pruned together with their vectors.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::embedding::{EmbeddingProvider, OpenRouterClient};
use crate::migrate;
use crate::vector_store::{Metric, VectorStore};

/// Longest excerpt returned by semantic search, in characters.
pub const EXCERPT_MAX_CHARS: usize = 300;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SemanticIndexStats {
    pub scanned_chunks: u64,
    pub embedded_chunks: u64,
    pub skipped_unchanged: u64,
    pub errors: u64,
    pub duration_ms: u64,
    pub model: String,
    pub error_details: Vec<SemanticErrorDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticErrorDetail {
    pub stage: String,
    pub chunk_ids: Vec<i64>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticSearchHit {
    pub chunk_id: i64,
    pub book_id: i64,
    pub title: Option<String>,
    pub author: Option<String>,
    pub format: String,
    pub language: Option<String>,
    pub source_path: String,
    pub chunk_no: i64,
    pub page: Option<i64>,
    pub chapter: Option<String>,
    pub char_start: Option<i64>,
    pub char_end: Option<i64>,
    pub excerpt: String,
    pub score: f64,
}

/// Fingerprint binding a chunk's text to the model that embedded it.
pub fn chunk_fingerprint(model: &str, raw_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"\n");
    hasher.update(raw_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn excerpt_of(raw_text: &str) -> String {
    if raw_text.chars().count() <= EXCERPT_MAX_CHARS {
        return raw_text.to_string();
    }
    let cut: String = raw_text.chars().take(EXCERPT_MAX_CHARS - 3).collect();
    format!("{}...", cut.trim_end())
}

fn metric_from_config(config: &Config) -> Result<Metric> {
    Metric::parse(&config.embedding.metric).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown embedding.metric: '{}'. Must be ip or l2.",
            config.embedding.metric
        )
    })
}

/// Embed every new or changed chunk and persist the vector index.
pub async fn semantic_index(
    pool: &SqlitePool,
    config: &Config,
    provider: &dyn EmbeddingProvider,
) -> Result<SemanticIndexStats> {
    let started = Instant::now();
    let model = provider.model().to_string();
    let metric = metric_from_config(config)?;
    let index_path = &config.storage.vector_index_path;

    let mut store = VectorStore::load_or_new(index_path, provider.dimension(), metric)?;
    let present: HashSet<i64> = store.ids().iter().copied().collect();

    let rows = sqlx::query("SELECT id, raw_text FROM chunks ORDER BY id")
        .fetch_all(pool)
        .await?;

    let states: HashMap<i64, String> =
        sqlx::query("SELECT chunk_id, fingerprint FROM semantic_chunk_state WHERE model = ?")
            .bind(&model)
            .fetch_all(pool)
            .await?
            .iter()
            .map(|row| (row.get("chunk_id"), row.get("fingerprint")))
            .collect();

    let mut stats = SemanticIndexStats {
        scanned_chunks: rows.len() as u64,
        model: model.clone(),
        ..SemanticIndexStats::default()
    };

    let mut pending: Vec<(i64, String, String)> = Vec::new();
    for row in &rows {
        let id: i64 = row.get("id");
        let raw_text: String = row.get("raw_text");
        let fingerprint = chunk_fingerprint(&model, &raw_text);
        if states.get(&id) == Some(&fingerprint) && present.contains(&id) {
            stats.skipped_unchanged += 1;
        } else {
            pending.push((id, raw_text, fingerprint));
        }
    }

    for batch in pending.chunks(config.embedding.batch_size.max(1)) {
        let ids: Vec<i64> = batch.iter().map(|(id, _, _)| *id).collect();
        let texts: Vec<String> = batch.iter().map(|(_, text, _)| text.clone()).collect();

        match provider.embed_texts(&texts).await {
            Ok(vectors) => {
                store.add_or_replace(&ids, &vectors)?;
                let now = Utc::now().timestamp();
                for (id, _, fingerprint) in batch {
                    sqlx::query(
                        r#"
                        INSERT INTO semantic_chunk_state (chunk_id, vector_id, model, fingerprint, updated_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(chunk_id) DO UPDATE SET
                            vector_id = excluded.vector_id,
                            model = excluded.model,
                            fingerprint = excluded.fingerprint,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(id)
                    .bind(id)
                    .bind(&model)
                    .bind(fingerprint)
                    .bind(now)
                    .execute(pool)
                    .await?;
                }
                stats.embedded_chunks += ids.len() as u64;
            }
            Err(e) => {
                stats.errors += ids.len() as u64;
                warn!(chunks = ids.len(), error = %e, "embedding batch failed");
                stats.error_details.push(SemanticErrorDetail {
                    stage: "embedding".to_string(),
                    chunk_ids: ids,
                    error: e.to_string(),
                });
            }
        }
    }

    // Drop state rows and vectors for chunks removed by reingestion.
    let orphaned: Vec<i64> = sqlx::query_scalar(
        "SELECT chunk_id FROM semantic_chunk_state WHERE chunk_id NOT IN (SELECT id FROM chunks)",
    )
    .fetch_all(pool)
    .await?;
    if !orphaned.is_empty() {
        store.remove(&orphaned);
        for chunk_id in &orphaned {
            sqlx::query("DELETE FROM semantic_chunk_state WHERE chunk_id = ?")
                .bind(chunk_id)
                .execute(pool)
                .await?;
        }
        info!(removed = orphaned.len(), "pruned orphaned vectors");
    }

    store.save(index_path)?;
    sqlx::query(
        r#"
        INSERT INTO semantic_index_state (id, model, dimension, metric, index_path, updated_at)
        VALUES (1, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            model = excluded.model,
            dimension = excluded.dimension,
            metric = excluded.metric,
            index_path = excluded.index_path,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&model)
    .bind(provider.dimension() as i64)
    .bind(metric.as_str())
    .bind(index_path.display().to_string())
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    stats.duration_ms = started.elapsed().as_millis() as u64;
    Ok(stats)
}

/// Nearest-neighbour search with metadata post-filters.
///
/// Fails when the semantic index was never built or was built with a
/// different model than the one configured now.
pub async fn semantic_search(
    pool: &SqlitePool,
    config: &Config,
    provider: &dyn EmbeddingProvider,
    query: &str,
    limit: usize,
    author_filter: Option<&str>,
    format_filter: Option<&str>,
) -> Result<Vec<SemanticSearchHit>> {
    if query.trim().is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let state = sqlx::query("SELECT model FROM semantic_index_state WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    let stored_model: String = match state {
        Some(row) => row.get("model"),
        None => bail!("Semantic index is not initialized. Run the embed command first."),
    };
    if stored_model != provider.model() {
        bail!(
            "Semantic index was built with model '{}' but the configured model is '{}'. Re-run embed to rebuild it.",
            stored_model,
            provider.model()
        );
    }

    let metric = metric_from_config(config)?;
    let store = VectorStore::load_or_new(
        &config.storage.vector_index_path,
        provider.dimension(),
        metric,
    )?;
    if store.ntotal() == 0 {
        return Ok(Vec::new());
    }

    let query_vec = provider.embed_query(query).await?;
    // Post-filters discard candidates, so over-fetch when any is active.
    let fetch = if author_filter.is_some() || format_filter.is_some() {
        limit.saturating_mul(4).max(32)
    } else {
        limit
    };
    let matches = store.search(&query_vec, fetch)?;
    if matches.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; matches.len()].join(", ");
    let sql = format!(
        "SELECT c.id AS chunk_id, c.book_id, b.title, b.author, b.format, b.language, \
         b.source_path, c.chunk_no, c.raw_text, c.page, c.chapter, c.char_start, c.char_end \
         FROM chunks c JOIN books b ON b.id = c.book_id WHERE c.id IN ({placeholders})"
    );
    let mut db_query = sqlx::query(&sql);
    for (id, _) in &matches {
        db_query = db_query.bind(id);
    }
    let rows = db_query.fetch_all(pool).await?;
    let by_id: HashMap<i64, &sqlx::sqlite::SqliteRow> = rows
        .iter()
        .map(|row| (row.get::<i64, _>("chunk_id"), row))
        .collect();

    let mut hits = Vec::new();
    for (id, score) in &matches {
        // Vectors can outlive their chunks until the next index run.
        let Some(row) = by_id.get(id) else { continue };

        let author: Option<String> = row.get("author");
        if let Some(filter) = author_filter {
            let haystack = author.clone().unwrap_or_default().to_lowercase();
            if !haystack.contains(&filter.to_lowercase()) {
                continue;
            }
        }
        let format: String = row.get("format");
        if let Some(filter) = format_filter {
            if !format.eq_ignore_ascii_case(filter) {
                continue;
            }
        }

        let raw_text: String = row.get("raw_text");
        hits.push(SemanticSearchHit {
            chunk_id: *id,
            book_id: row.get("book_id"),
            title: row.get("title"),
            author,
            format,
            language: row.get("language"),
            source_path: row.get("source_path"),
            chunk_no: row.get("chunk_no"),
            page: row.get("page"),
            chapter: row.get("chapter"),
            char_start: row.get("char_start"),
            char_end: row.get("char_end"),
            excerpt: excerpt_of(&raw_text),
            score: *score as f64,
        });
        if hits.len() >= limit {
            break;
        }
    }
    Ok(hits)
}

/// CLI entry point for `embed`.
pub async fn run_embed(config: &Config, json: bool) -> Result<()> {
    let provider = OpenRouterClient::from_config(&config.embedding, &config.generation)?;
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let stats = semantic_index(&pool, config, &provider).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("embed {}", stats.model);
        println!("  scanned chunks: {}", stats.scanned_chunks);
        println!("  embedded: {}", stats.embedded_chunks);
        println!("  skipped (unchanged): {}", stats.skipped_unchanged);
        println!("  errors: {}", stats.errors);
        for detail in &stats.error_details {
            println!(
                "    [{}] {} chunk(s): {}",
                detail.stage,
                detail.chunk_ids.len(),
                detail.error
            );
        }
        println!("  took: {} ms", stats.duration_ms);
        println!("ok");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingError;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    struct KeywordProvider {
        model: String,
        fail_marker: Option<String>,
    }

    impl KeywordProvider {
        fn new(model: &str) -> Self {
            Self {
                model: model.to_string(),
                fail_marker: None,
            }
        }
    }

    fn keyword_vector(text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        let mut v = vec![0.0f32; 4];
        if lowered.contains("тишин") {
            v[0] = 1.0;
        }
        if lowered.contains("гор") {
            v[1] = 1.0;
        }
        if lowered.contains("рек") {
            v[2] = 1.0;
        }
        if v.iter().all(|x| *x == 0.0) {
            v[3] = 1.0;
        }
        v
    }

    #[async_trait]
    impl EmbeddingProvider for KeywordProvider {
        fn model(&self) -> &str {
            &self.model
        }

        fn dimension(&self) -> usize {
            4
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if let Some(marker) = &self.fail_marker {
                if texts.iter().any(|t| t.contains(marker.as_str())) {
                    return Err(EmbeddingError {
                        model: self.model.clone(),
                        stage: "request".to_string(),
                        message: "forced failure".to_string(),
                    });
                }
            }
            Ok(texts.iter().map(|t| keyword_vector(t)).collect())
        }
    }

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::ensure_schema(&pool).await.unwrap();
        pool
    }

    async fn seed_chunk(pool: &SqlitePool, book_id: i64, chunk_no: i64, text: &str) -> i64 {
        sqlx::query_scalar(
            "INSERT INTO chunks (book_id, chunk_no, raw_text, lemma_text) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(book_id)
        .bind(chunk_no)
        .bind(text)
        .bind(text.to_lowercase())
        .fetch_one(pool)
        .await
        .unwrap()
    }

    async fn seed_book(pool: &SqlitePool, source_path: &str, author: Option<&str>) -> i64 {
        sqlx::query_scalar(
            "INSERT INTO books (source_path, title, author, format, language, created_at, updated_at)
             VALUES (?, 'Книга', ?, 'txt', 'ru', 0, 0) RETURNING id",
        )
        .bind(source_path)
        .bind(author)
        .fetch_one(pool)
        .await
        .unwrap()
    }

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.vector_index_path = dir.path().join("vectors.bin");
        config
    }

    #[test]
    fn long_excerpts_are_trimmed_with_ellipsis() {
        let long: String = "я".repeat(400);
        let excerpt = excerpt_of(&long);
        assert!(excerpt.ends_with("..."));
        assert_eq!(excerpt.chars().count(), EXCERPT_MAX_CHARS);

        let short = "короткий текст";
        assert_eq!(excerpt_of(short), short);
    }

    #[tokio::test]
    async fn index_embeds_new_chunks_then_skips_unchanged() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let pool = memory_pool().await;
        let provider = KeywordProvider::new("mock-embed");

        let book = seed_book(&pool, "/lib/a.txt", None).await;
        seed_chunk(&pool, book, 0, "Тишина в доме.").await;
        seed_chunk(&pool, book, 1, "Горы на горизонте.").await;
        seed_chunk(&pool, book, 2, "Река течет на юг.").await;

        let first = semantic_index(&pool, &config, &provider).await.unwrap();
        assert_eq!(first.scanned_chunks, 3);
        assert_eq!(first.embedded_chunks, 3);
        assert_eq!(first.skipped_unchanged, 0);
        assert_eq!(first.errors, 0);
        assert!(config.storage.vector_index_path.exists());

        let second = semantic_index(&pool, &config, &provider).await.unwrap();
        assert_eq!(second.embedded_chunks, 0);
        assert_eq!(second.skipped_unchanged, 3);
        pool.close().await;
    }

    #[tokio::test]
    async fn changed_text_and_changed_model_are_reembedded() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let pool = memory_pool().await;
        let provider = KeywordProvider::new("mock-embed");

        let book = seed_book(&pool, "/lib/a.txt", None).await;
        let chunk = seed_chunk(&pool, book, 0, "Тишина в доме.").await;
        seed_chunk(&pool, book, 1, "Горы на горизонте.").await;
        semantic_index(&pool, &config, &provider).await.unwrap();

        sqlx::query("UPDATE chunks SET raw_text = 'Тишина в лесу.' WHERE id = ?")
            .bind(chunk)
            .execute(&pool)
            .await
            .unwrap();
        let after_edit = semantic_index(&pool, &config, &provider).await.unwrap();
        assert_eq!(after_edit.embedded_chunks, 1);
        assert_eq!(after_edit.skipped_unchanged, 1);

        // A different model invalidates every fingerprint.
        let other = KeywordProvider::new("mock-embed-v2");
        let after_switch = semantic_index(&pool, &config, &other).await.unwrap();
        assert_eq!(after_switch.embedded_chunks, 2);
        assert_eq!(after_switch.skipped_unchanged, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn deleted_chunks_are_pruned_from_store_and_state() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let pool = memory_pool().await;
        let provider = KeywordProvider::new("mock-embed");

        let keep = seed_book(&pool, "/lib/keep.txt", None).await;
        let gone = seed_book(&pool, "/lib/gone.txt", None).await;
        seed_chunk(&pool, keep, 0, "Тишина в доме.").await;
        seed_chunk(&pool, gone, 0, "Горы на горизонте.").await;
        semantic_index(&pool, &config, &provider).await.unwrap();

        sqlx::query("DELETE FROM chunks WHERE book_id = ?")
            .bind(gone)
            .execute(&pool)
            .await
            .unwrap();
        semantic_index(&pool, &config, &provider).await.unwrap();

        let state_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM semantic_chunk_state")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(state_rows, 1);

        let store = VectorStore::load(&config.storage.vector_index_path, 4).unwrap();
        assert_eq!(store.ntotal(), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn failed_batches_are_recorded_and_retried_next_run() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.embedding.batch_size = 1;
        let pool = memory_pool().await;

        let book = seed_book(&pool, "/lib/a.txt", None).await;
        seed_chunk(&pool, book, 0, "Тишина в доме.").await;
        seed_chunk(&pool, book, 1, "Горы на горизонте.").await;

        let mut provider = KeywordProvider::new("mock-embed");
        provider.fail_marker = Some("Горы".to_string());
        let stats = semantic_index(&pool, &config, &provider).await.unwrap();
        assert_eq!(stats.embedded_chunks, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.error_details.len(), 1);
        assert_eq!(stats.error_details[0].stage, "embedding");
        assert_eq!(stats.error_details[0].chunk_ids.len(), 1);
        assert!(stats.error_details[0].error.contains("forced failure"));

        provider.fail_marker = None;
        let retry = semantic_index(&pool, &config, &provider).await.unwrap();
        assert_eq!(retry.embedded_chunks, 1);
        assert_eq!(retry.skipped_unchanged, 1);
        assert_eq!(retry.errors, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn search_requires_a_matching_index() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let pool = memory_pool().await;
        let provider = KeywordProvider::new("mock-embed");

        let err = semantic_search(&pool, &config, &provider, "тишина", 5, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not initialized"));

        let book = seed_book(&pool, "/lib/a.txt", None).await;
        seed_chunk(&pool, book, 0, "Тишина в доме.").await;
        semantic_index(&pool, &config, &provider).await.unwrap();

        let other = KeywordProvider::new("mock-embed-v2");
        let err = semantic_search(&pool, &config, &other, "тишина", 5, None, None)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("mock-embed"));
        assert!(message.contains("mock-embed-v2"));
        pool.close().await;
    }

    #[tokio::test]
    async fn search_ranks_by_similarity_and_applies_filters() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let pool = memory_pool().await;
        let provider = KeywordProvider::new("mock-embed");

        let quiet = seed_book(&pool, "/lib/quiet.txt", Some("Анна Серова")).await;
        let hills = seed_book(&pool, "/lib/hills.txt", Some("Борис Климов")).await;
        let long_text = format!("Тишина {}", "и покой ".repeat(60));
        seed_chunk(&pool, quiet, 0, &long_text).await;
        seed_chunk(&pool, hills, 0, "Горы на горизонте.").await;
        semantic_index(&pool, &config, &provider).await.unwrap();

        let hits = semantic_search(&pool, &config, &provider, "тишина", 5, None, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].book_id, quiet);
        assert!(hits[0].score > hits[1].score);
        assert!(hits[0].excerpt.ends_with("..."));
        assert!(hits[0].excerpt.chars().count() <= EXCERPT_MAX_CHARS);

        let filtered = semantic_search(
            &pool,
            &config,
            &provider,
            "тишина",
            5,
            Some("климов"),
            None,
        )
        .await
        .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].book_id, hills);
        pool.close().await;
    }
}
