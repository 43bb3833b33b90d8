use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Validation error for chunking and fusion parameters.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_chars must be > 0")]
    NonPositiveMaxChars,
    #[error("overlap_chars must be < max_chars (got overlap {overlap}, max {max})")]
    OverlapTooLarge { overlap: usize, max: usize },
    #[error("alpha must be between 0.0 and 1.0 (got {0})")]
    AlphaOutOfRange(f64),
    #[error("exact_match_boost cannot be negative (got {0})")]
    NegativeBoost(f64),
    #[error("min_score cannot be negative (got {0})")]
    NegativeMinScore(f64),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rag: RagConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_vector_index_path")]
    pub vector_index_path: PathBuf,
    #[serde(default = "default_dedupe_cache_path")]
    pub dedupe_cache_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            vector_index_path: default_vector_index_path(),
            dedupe_cache_path: default_dedupe_cache_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".librarium/library.db")
}
fn default_vector_index_path() -> PathBuf {
    PathBuf::from(".librarium/vectors.bin")
}
fn default_dedupe_cache_path() -> PathBuf {
    PathBuf::from(".librarium/dedupe.json")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IngestConfig {
    /// Glob patterns excluded from directory scans.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Force a language for every ingested document instead of detecting.
    #[serde(default)]
    pub language_override: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    600
}
fn default_overlap_chars() -> usize {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// "ip" (cosine-equivalent over normalized vectors) or "l2".
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_embedding_model(),
            dimension: default_dimension(),
            metric: default_metric(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            timeout_secs: default_embed_timeout_secs(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".to_string()
}
fn default_dimension() -> usize {
    1536
}
fn default_metric() -> String {
    "ip".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_base_ms() -> u64 {
    250
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_generation_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_model() -> String {
    "openai/gpt-4o-mini".to_string()
}
fn default_temperature() -> f64 {
    0.2
}
fn default_max_tokens() -> u32 {
    600
}
fn default_generation_timeout_secs() -> u64 {
    25
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: i64,
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,
    #[serde(default = "default_exact_match_boost")]
    pub exact_match_boost: f64,
    #[serde(default = "default_rerank_query_weight")]
    pub rerank_query_weight: f64,
    #[serde(default = "default_rerank_key_weight")]
    pub rerank_key_weight: f64,
    #[serde(default = "default_long_question_words")]
    pub long_question_words: usize,
    #[serde(default = "default_long_question_chars")]
    pub long_question_chars: usize,
    #[serde(default = "default_short_query_terms")]
    pub short_query_terms: usize,
    #[serde(default = "default_max_key_terms")]
    pub max_key_terms: usize,
    #[serde(default = "default_min_term_chars")]
    pub min_term_chars: usize,
    /// Empty means the built-in Russian stopword list.
    #[serde(default)]
    pub stopwords: Vec<String>,
    /// Empty means the built-in domain stem list.
    #[serde(default)]
    pub domain_stems: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            candidate_limit: default_candidate_limit(),
            min_relevance: default_min_relevance(),
            exact_match_boost: default_exact_match_boost(),
            rerank_query_weight: default_rerank_query_weight(),
            rerank_key_weight: default_rerank_key_weight(),
            long_question_words: default_long_question_words(),
            long_question_chars: default_long_question_chars(),
            short_query_terms: default_short_query_terms(),
            max_key_terms: default_max_key_terms(),
            min_term_chars: default_min_term_chars(),
            stopwords: Vec::new(),
            domain_stems: Vec::new(),
        }
    }
}

fn default_alpha() -> f64 {
    0.7
}
fn default_candidate_limit() -> i64 {
    64
}
fn default_min_relevance() -> f64 {
    0.2
}
fn default_exact_match_boost() -> f64 {
    0.45
}
fn default_rerank_query_weight() -> f64 {
    0.2
}
fn default_rerank_key_weight() -> f64 {
    0.25
}
fn default_long_question_words() -> usize {
    18
}
fn default_long_question_chars() -> usize {
    170
}
fn default_short_query_terms() -> usize {
    3
}
fn default_max_key_terms() -> usize {
    8
}
fn default_min_term_chars() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RagConfig {
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_max_per_source")]
    pub max_per_source: usize,
    #[serde(default = "default_min_chunks")]
    pub min_chunks: usize,
    #[serde(default = "default_min_total_relevance")]
    pub min_total_relevance: f64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_heavy_search_permits")]
    pub heavy_search_permits: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            max_chunks: default_max_chunks(),
            max_per_source: default_max_per_source(),
            min_chunks: default_min_chunks(),
            min_total_relevance: default_min_total_relevance(),
            max_context_chars: default_max_context_chars(),
            search_timeout_secs: default_search_timeout_secs(),
            heavy_search_permits: default_heavy_search_permits(),
        }
    }
}

fn default_max_chunks() -> usize {
    8
}
fn default_max_per_source() -> usize {
    2
}
fn default_min_chunks() -> usize {
    2
}
fn default_min_total_relevance() -> f64 {
    0.7
}
fn default_max_context_chars() -> usize {
    3500
}
fn default_search_timeout_secs() -> u64 {
    25
}
fn default_heavy_search_permits() -> usize {
    2
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.max_chars");
    }

    // Validate embedding
    if config.embedding.dimension == 0 {
        anyhow::bail!("embedding.dimension must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.metric.as_str() {
        "ip" | "l2" => {}
        other => anyhow::bail!("Unknown embedding.metric: '{}'. Must be ip or l2.", other),
    }

    // Validate retrieval
    if !(0.0..=1.0).contains(&config.retrieval.alpha) {
        anyhow::bail!("retrieval.alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.candidate_limit < 1 {
        anyhow::bail!("retrieval.candidate_limit must be >= 1");
    }
    if config.retrieval.min_relevance < 0.0 {
        anyhow::bail!("retrieval.min_relevance cannot be negative");
    }
    if config.retrieval.exact_match_boost < 0.0 {
        anyhow::bail!("retrieval.exact_match_boost cannot be negative");
    }

    // Validate rag
    if config.rag.min_chunks == 0 {
        anyhow::bail!("rag.min_chunks must be >= 1");
    }
    if config.rag.min_total_relevance < 0.0 {
        anyhow::bail!("rag.min_total_relevance cannot be negative");
    }
    if config.rag.heavy_search_permits == 0 {
        anyhow::bail!("rag.heavy_search_permits must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.chunking.max_chars, 600);
        assert_eq!(config.chunking.overlap_chars, 120);
        assert_eq!(config.retrieval.alpha, 0.7);
        assert_eq!(config.retrieval.candidate_limit, 64);
        assert_eq!(config.rag.max_chunks, 8);
        assert_eq!(config.embedding.metric, "ip");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [chunking]
            max_chars = 400

            [retrieval]
            alpha = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.max_chars, 400);
        assert_eq!(config.chunking.overlap_chars, 120);
        assert_eq!(config.retrieval.alpha, 0.5);
        assert_eq!(config.retrieval.exact_match_boost, 0.45);
    }
}
