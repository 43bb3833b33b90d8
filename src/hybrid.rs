//! Hybrid retrieval: query rewriting, lexical/semantic score fusion,
//! exact-match boosting, and metadata-aware reranking.
//!
//! Long conversational questions are rewritten down to their key terms
//! before hitting either branch. Branch scores are min-max normalized and
//! blended with a single weight; candidates whose excerpt carries the
//! query verbatim earn a fixed boost, weak candidates fall below the
//! relevance floor, and the survivors are reranked by term overlap with
//! their title, chapter, and excerpt. Ordering is fully deterministic.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::config::{Config, ConfigError, RetrievalConfig};
use crate::db;
use crate::embedding::{EmbeddingProvider, OpenRouterClient};
use crate::migrate;
use crate::normalize;
use crate::scoring;
use crate::search::{self, SearchFilters, SearchHit};
use crate::semantic::{self, SemanticSearchHit};

/// Conversational filler dropped from queries when no custom list is set.
const BUILTIN_STOPWORDS: [&str; 62] = [
    "а",
    "без",
    "был",
    "была",
    "были",
    "быть",
    "в",
    "во",
    "вы",
    "где",
    "да",
    "для",
    "до",
    "его",
    "ее",
    "если",
    "же",
    "за",
    "и",
    "из",
    "или",
    "как",
    "когда",
    "кто",
    "ли",
    "мне",
    "мы",
    "на",
    "не",
    "но",
    "о",
    "об",
    "от",
    "по",
    "при",
    "про",
    "с",
    "со",
    "так",
    "то",
    "только",
    "ты",
    "у",
    "уже",
    "что",
    "чтобы",
    "я",
    "здравствуйте",
    "подскажите",
    "пожалуйста",
    "давно",
    "пытаюсь",
    "понять",
    "можете",
    "помочь",
    "найти",
    "книге",
    "книгу",
    "автор",
    "подробно",
    "обычной",
    "ежедневной",
];

/// Word stems that mark a term as central to the library's subject area.
const BUILTIN_DOMAIN_STEMS: [&str; 7] = [
    "практ", "вниман", "наблюд", "мысл", "тишин", "медитац", "внутрен",
];

#[derive(Debug, Clone, Default)]
pub struct QueryRewrite {
    /// The query with whitespace collapsed.
    pub original: String,
    /// What actually goes to the search branches.
    pub search_query: String,
    /// Deduplicated content words, domain terms first.
    pub key_terms: Vec<String>,
    pub is_long_question: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HybridSearchHit {
    pub chunk_id: i64,
    pub book_id: i64,
    pub title: Option<String>,
    pub author: Option<String>,
    pub format: String,
    pub source_path: String,
    pub chunk_no: i64,
    pub page: Option<i64>,
    pub chapter: Option<String>,
    pub char_start: Option<i64>,
    pub char_end: Option<i64>,
    pub excerpt: String,
    pub lexical_score: f64,
    pub semantic_score: f64,
    pub fused_score: f64,
    pub final_score: f64,
    pub exact_match: bool,
}

impl HybridSearchHit {
    /// One-line form: "{title or file name} — {location} — {excerpt}".
    pub fn display(&self) -> String {
        let title = search::display_title(self.title.as_deref(), &self.source_path);
        let location = search::format_location(
            self.page,
            self.chapter.as_deref(),
            self.char_start,
            self.char_end,
        );
        let excerpt = self.excerpt.replace('\n', " ");
        format!("{} — {} — {}", title, location, excerpt.trim())
    }
}

/// Casefold with `ё` collapsed to `е`, the form used for term matching.
pub(crate) fn fold_term(text: &str) -> String {
    text.to_lowercase().replace('ё', "е")
}

fn effective_stopwords(retrieval: &RetrievalConfig) -> HashSet<String> {
    if retrieval.stopwords.is_empty() {
        BUILTIN_STOPWORDS.iter().map(|s| s.to_string()).collect()
    } else {
        retrieval.stopwords.iter().map(|s| fold_term(s)).collect()
    }
}

fn effective_domain_stems(retrieval: &RetrievalConfig) -> Vec<String> {
    if retrieval.domain_stems.is_empty() {
        BUILTIN_DOMAIN_STEMS.iter().map(|s| s.to_string()).collect()
    } else {
        retrieval.domain_stems.iter().map(|s| fold_term(s)).collect()
    }
}

/// Rewrite a user query for retrieval.
///
/// Key terms keep their query form (no stemming): they are matched
/// against raw text later. A long question is reduced to its leading key
/// terms so conversational framing does not drown the FTS match.
pub fn rewrite_query(query: &str, retrieval: &RetrievalConfig) -> QueryRewrite {
    let collapsed = query.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return QueryRewrite::default();
    }

    let stopwords = effective_stopwords(retrieval);
    let domain_stems = effective_domain_stems(retrieval);
    let folded = fold_term(&collapsed);

    let mut seen = HashSet::new();
    let mut domain_terms = Vec::new();
    let mut other_terms = Vec::new();
    for token in normalize::WORD_RE.find_iter(&folded) {
        let token = token.as_str();
        if token.chars().count() < retrieval.min_term_chars || stopwords.contains(token) {
            continue;
        }
        if !seen.insert(token.to_string()) {
            continue;
        }
        if domain_stems.iter().any(|stem| token.starts_with(stem.as_str())) {
            domain_terms.push(token.to_string());
        } else {
            other_terms.push(token.to_string());
        }
    }
    let mut key_terms = domain_terms;
    key_terms.extend(other_terms);
    key_terms.truncate(retrieval.max_key_terms);

    let is_long_question = collapsed.split_whitespace().count() >= retrieval.long_question_words
        || collapsed.chars().count() >= retrieval.long_question_chars;

    let search_query = if is_long_question && !key_terms.is_empty() {
        key_terms
            .iter()
            .take(retrieval.short_query_terms)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        collapsed.clone()
    };

    QueryRewrite {
        original: collapsed,
        search_query,
        key_terms,
        is_long_question,
    }
}

fn query_terms(rewrite: &QueryRewrite) -> Vec<String> {
    normalize::WORD_RE
        .find_iter(&fold_term(&rewrite.search_query))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Does the excerpt carry the query verbatim (all terms, or the phrase)?
fn is_exact_match(excerpt: &str, rewrite: &QueryRewrite, phrase_mode: bool) -> bool {
    let haystack = fold_term(excerpt);
    if phrase_mode {
        let phrase = fold_term(&rewrite.search_query);
        return !phrase.is_empty() && haystack.contains(&phrase);
    }
    let terms = query_terms(rewrite);
    !terms.is_empty() && terms.iter().all(|t| haystack.contains(t.as_str()))
}

fn overlap_ratio(terms: &[String], words: &HashSet<String>) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let matched = terms.iter().filter(|t| words.contains(t.as_str())).count();
    matched as f64 / terms.len() as f64
}

/// Secondary score: fused score plus weighted term overlap against the
/// hit's title, chapter, and excerpt. A hit with no usable words keeps
/// its fused score.
fn rerank_secondary(
    hit: &HybridSearchHit,
    rewrite: &QueryRewrite,
    stopwords: &HashSet<String>,
    retrieval: &RetrievalConfig,
) -> f64 {
    let mut haystack = String::new();
    if let Some(title) = &hit.title {
        haystack.push_str(title);
        haystack.push(' ');
    }
    if let Some(chapter) = &hit.chapter {
        haystack.push_str(chapter);
        haystack.push(' ');
    }
    haystack.push_str(&hit.excerpt);

    let words: HashSet<String> = normalize::WORD_RE
        .find_iter(&fold_term(&haystack))
        .map(|m| m.as_str().to_string())
        .filter(|w| !stopwords.contains(w))
        .collect();
    if words.is_empty() {
        return hit.fused_score;
    }

    let query_overlap = overlap_ratio(&query_terms(rewrite), &words);
    let key_overlap = overlap_ratio(&rewrite.key_terms, &words);
    hit.fused_score
        + retrieval.rerank_query_weight * query_overlap
        + retrieval.rerank_key_weight * key_overlap
}

/// Case-insensitive path key with a fixed separator, so ordering does not
/// depend on the platform the library was indexed on.
pub(crate) fn path_sort_key(source_path: &str) -> String {
    source_path.to_lowercase().replace('/', "\\")
}

fn order_hits(hits: &mut [HybridSearchHit]) {
    hits.sort_by(|a, b| {
        b.final_score
            .total_cmp(&a.final_score)
            .then_with(|| path_sort_key(&a.source_path).cmp(&path_sort_key(&b.source_path)))
            .then(a.chunk_no.cmp(&b.chunk_no))
            .then(a.char_start.unwrap_or(-1).cmp(&b.char_start.unwrap_or(-1)))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
}

fn hit_from_lexical(hit: &SearchHit) -> HybridSearchHit {
    HybridSearchHit {
        chunk_id: hit.chunk_id,
        book_id: hit.book_id,
        title: hit.title.clone(),
        author: hit.author.clone(),
        format: hit.format.clone(),
        source_path: hit.source_path.clone(),
        chunk_no: hit.chunk_no,
        page: hit.page,
        chapter: hit.chapter.clone(),
        char_start: hit.char_start,
        char_end: hit.char_end,
        excerpt: hit.excerpt.clone(),
        lexical_score: 0.0,
        semantic_score: 0.0,
        fused_score: 0.0,
        final_score: 0.0,
        exact_match: false,
    }
}

fn hit_from_semantic(hit: &SemanticSearchHit) -> HybridSearchHit {
    HybridSearchHit {
        chunk_id: hit.chunk_id,
        book_id: hit.book_id,
        title: hit.title.clone(),
        author: hit.author.clone(),
        format: hit.format.clone(),
        source_path: hit.source_path.clone(),
        chunk_no: hit.chunk_no,
        page: hit.page,
        chapter: hit.chapter.clone(),
        char_start: hit.char_start,
        char_end: hit.char_end,
        excerpt: hit.excerpt.clone(),
        lexical_score: 0.0,
        semantic_score: 0.0,
        fused_score: 0.0,
        final_score: 0.0,
        exact_match: false,
    }
}

/// Fused lexical and semantic retrieval.
///
/// Runs without the semantic branch when no provider is given or the
/// semantic index was never built; a stale model in the semantic index is
/// an error rather than a silent downgrade.
#[allow(clippy::too_many_arguments)]
pub async fn hybrid_search(
    pool: &SqlitePool,
    config: &Config,
    provider: Option<&dyn EmbeddingProvider>,
    query: &str,
    limit: i64,
    alpha: f64,
    author_filter: Option<&str>,
    format_filter: Option<&str>,
    phrase_mode: bool,
    candidate_limit: i64,
) -> Result<Vec<HybridSearchHit>> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(ConfigError::AlphaOutOfRange(alpha).into());
    }
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let retrieval = &config.retrieval;
    let boost = retrieval.exact_match_boost;
    if boost < 0.0 {
        return Err(ConfigError::NegativeBoost(boost).into());
    }

    let rewrite = rewrite_query(query, retrieval);
    let candidate_limit = candidate_limit.max(1);

    let filters = SearchFilters {
        author: author_filter.map(str::to_string),
        format: format_filter.map(str::to_string),
        ..SearchFilters::default()
    };
    let lexical_hits = search::search_chunks(
        pool,
        &rewrite.search_query,
        &filters,
        phrase_mode,
        candidate_limit,
    )
    .await?;

    let semantic_hits = match provider {
        Some(provider) => {
            let initialized: Option<i64> =
                sqlx::query_scalar("SELECT id FROM semantic_index_state WHERE id = 1")
                    .fetch_optional(pool)
                    .await?;
            if initialized.is_some() {
                semantic::semantic_search(
                    pool,
                    config,
                    provider,
                    &rewrite.search_query,
                    candidate_limit as usize,
                    author_filter,
                    format_filter,
                )
                .await?
            } else {
                debug!("semantic index absent, lexical branch only");
                Vec::new()
            }
        }
        None => Vec::new(),
    };

    let lexical_ranks: HashMap<i64, f64> =
        lexical_hits.iter().map(|h| (h.chunk_id, h.rank)).collect();
    let semantic_scores: HashMap<i64, f64> =
        semantic_hits.iter().map(|h| (h.chunk_id, h.score)).collect();

    let lexical_norm = scoring::normalize_keyword_ranks(&lexical_ranks);
    let semantic_norm = scoring::normalize_semantic_scores(&semantic_scores);
    let mut fused = scoring::fuse_normalized_scores(&lexical_norm, &semantic_norm, alpha)?;

    let lexical_by_id: HashMap<i64, &SearchHit> =
        lexical_hits.iter().map(|h| (h.chunk_id, h)).collect();
    let semantic_by_id: HashMap<i64, &SemanticSearchHit> =
        semantic_hits.iter().map(|h| (h.chunk_id, h)).collect();

    // Exact wording earns a fixed bonus on top of the blend.
    let mut exact_ids: HashSet<i64> = HashSet::new();
    for (id, hit) in &lexical_by_id {
        let lexical_score = lexical_norm.get(id).copied().unwrap_or(0.0);
        if lexical_score > 0.0 && is_exact_match(&hit.excerpt, &rewrite, phrase_mode) {
            exact_ids.insert(*id);
            if let Some(score) = fused.get_mut(id) {
                *score += boost;
            }
        }
    }

    let ordered = scoring::order_fused_scores(&fused);
    let kept = scoring::filter_relevant_scores(ordered, retrieval.min_relevance)?;

    let stopwords = effective_stopwords(retrieval);
    let mut hits: Vec<HybridSearchHit> = Vec::with_capacity(kept.len());
    for (id, fused_score) in &kept {
        let mut hit = if let Some(lexical) = lexical_by_id.get(id) {
            hit_from_lexical(lexical)
        } else if let Some(semantic) = semantic_by_id.get(id) {
            hit_from_semantic(semantic)
        } else {
            continue;
        };
        hit.lexical_score = lexical_norm.get(id).copied().unwrap_or(0.0);
        hit.semantic_score = semantic_norm.get(id).copied().unwrap_or(0.0);
        hit.fused_score = *fused_score;
        hit.exact_match = exact_ids.contains(id);
        hit.final_score = rerank_secondary(&hit, &rewrite, &stopwords, retrieval);
        hits.push(hit);
    }

    order_hits(&mut hits);
    hits.truncate(limit.clamp(1, 100) as usize);
    Ok(hits)
}

/// CLI entry point for `hybrid`.
#[allow(clippy::too_many_arguments)]
pub async fn run_hybrid(
    config: &Config,
    query: &str,
    limit: Option<i64>,
    alpha: Option<f64>,
    author: Option<String>,
    format: Option<String>,
    phrase: bool,
    candidates: Option<i64>,
    json: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;

    // Without credentials the semantic branch silently stays empty.
    let provider = match OpenRouterClient::from_config(&config.embedding, &config.generation) {
        Ok(client) => Some(client),
        Err(e) => {
            debug!(error = %e, "embedding provider unavailable, lexical branch only");
            None
        }
    };

    let hits = hybrid_search(
        &pool,
        config,
        provider.as_ref().map(|c| c as &dyn EmbeddingProvider),
        query,
        limit.unwrap_or(10),
        alpha.unwrap_or(config.retrieval.alpha),
        author.as_deref(),
        format.as_deref(),
        phrase,
        candidates.unwrap_or(config.retrieval.candidate_limit),
    )
    .await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else if hits.is_empty() {
        println!("No results.");
    } else {
        for (i, hit) in hits.iter().enumerate() {
            println!("{}. [{:.2}] {}", i + 1, hit.final_score, hit.display());
        }
    }
    Ok(())
}
