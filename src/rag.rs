//! Retrieval-augmented answering on top of hybrid search.
//!
//! The flow is: bounded hybrid search, diverse context selection under a
//! character budget, a relevance sufficiency gate, prompt assembly, and a
//! generation call with an explicit timeout. Every degraded outcome maps
//! to a fixed Russian user-facing answer instead of an error.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::Config;
use crate::db;
use crate::embedding::{ChatMessage, EmbeddingProvider, GenerationProvider, OpenRouterClient};
use crate::hybrid::{self, HybridSearchHit};
use crate::migrate;

pub const INSUFFICIENT_DATA_ANSWER: &str =
    "В библиотеке нет достаточных данных по вопросу. Пожалуйста, переформулируйте запрос.";
pub const GENERATION_TIMEOUT_ANSWER: &str =
    "Не удалось вовремя сгенерировать ответ по найденным источникам. \
     Пожалуйста, попробуйте повторить запрос или немного сократить его.";

/// Flat per-fragment cost added to the excerpt length when budgeting:
/// the citation header plus separators.
const CITATION_OVERHEAD_CHARS: usize = 140;

/// How many trailing dialogue turns are carried into the prompt.
const HISTORY_TURNS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnswerSource {
    pub title: String,
    pub author: String,
    pub source_path: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResult {
    pub answer: String,
    pub sources: Vec<AnswerSource>,
    pub is_confirmed: bool,
    pub prompt: String,
}

/// Outcome of a bounded hybrid search. A timeout is a result, not an
/// error, so callers can render a distinct message.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<HybridSearchHit>,
    pub error: Option<String>,
    pub timed_out: bool,
}

/// Russian-facing location string used in answer sources.
fn location_of(page: Option<i64>, chunk_no: i64) -> String {
    match page {
        Some(page) => format!("стр. {page}"),
        None => format!("позиция {}", chunk_no.max(0) + 1),
    }
}

/// Select context chunks with source diversity under a character budget.
///
/// Hits are bucketed per source in first-seen order, capped per source,
/// and drawn round-robin by rank within each source. The budget is never
/// exceeded once at least one chunk is selected.
pub fn build_llm_context<'a>(
    hits: &'a [HybridSearchHit],
    max_context_chars: usize,
    max_chunks: usize,
    max_per_source: usize,
) -> Vec<&'a HybridSearchHit> {
    if max_context_chars == 0 || max_chunks == 0 || max_per_source == 0 {
        return Vec::new();
    }

    let mut source_order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Vec<&HybridSearchHit>> = HashMap::new();
    for hit in hits {
        let key = hybrid::path_sort_key(&hit.source_path);
        let bucket = buckets.entry(key.clone()).or_insert_with(|| {
            source_order.push(key);
            Vec::new()
        });
        if bucket.len() < max_per_source {
            bucket.push(hit);
        }
    }

    let mut selected: Vec<&HybridSearchHit> = Vec::new();
    let mut used_chars = 0usize;
    for round in 0..max_per_source {
        for key in &source_order {
            let Some(candidate) = buckets.get(key).and_then(|bucket| bucket.get(round).copied())
            else {
                continue;
            };
            let cost = candidate.excerpt.trim().chars().count() + CITATION_OVERHEAD_CHARS;
            if !selected.is_empty() && used_chars + cost > max_context_chars {
                return selected;
            }
            selected.push(candidate);
            used_chars += cost;
            if selected.len() >= max_chunks {
                return selected;
            }
        }
    }
    selected
}

/// Does the selection carry enough evidence to generate from?
pub fn has_sufficient_relevance(
    selected: &[&HybridSearchHit],
    min_chunks: usize,
    min_total_relevance: f64,
) -> Result<bool> {
    if min_chunks < 1 {
        bail!("min_chunks must be positive");
    }
    if min_total_relevance < 0.0 {
        bail!("min_total_relevance cannot be negative");
    }
    if selected.len() < min_chunks {
        return Ok(false);
    }
    let total: f64 = selected
        .iter()
        .take(min_chunks)
        .map(|hit| hit.fused_score)
        .sum();
    Ok(total >= min_total_relevance)
}

/// Assemble the generation prompt: a fixed system instruction, optional
/// recent dialogue history, the question, and numbered context fragments.
/// Fragments past the first are dropped once the budget is exceeded.
pub fn build_prompt(
    query: &str,
    selected: &[&HybridSearchHit],
    max_context_chars: usize,
    history: &[ChatMessage],
) -> String {
    let mut fragments: Vec<String> = Vec::new();
    let mut current_chars = 0usize;
    for (idx, hit) in selected.iter().enumerate() {
        let fragment = format!(
            "[{}] title={}; author={}; source_path={}; location={}\nФрагмент: {}",
            idx + 1,
            hit.title.as_deref().unwrap_or("Без названия"),
            hit.author.as_deref().unwrap_or("Неизвестный автор"),
            hit.source_path,
            location_of(hit.page, hit.chunk_no),
            hit.excerpt,
        );
        let cost = fragment.chars().count();
        if !fragments.is_empty() && current_chars + cost > max_context_chars {
            break;
        }
        current_chars += cost;
        fragments.push(fragment);
    }
    let context_block = fragments.join("\n\n");

    let start = history.len().saturating_sub(HISTORY_TURNS);
    let history_block = history[start..]
        .iter()
        .filter(|message| !message.content.trim().is_empty())
        .map(|message| format!("- {}: {}", message.role, message.content))
        .collect::<Vec<_>>()
        .join("\n");
    let history_section = if history_block.is_empty() {
        String::new()
    } else {
        format!("История диалога (последние релевантные реплики):\n{history_block}\n\n")
    };

    format!(
        "Системная инструкция:\n\
         Ты помощник библиотечного бота. Отвечай только на основе контекста ниже \
         и никогда не используй внешние знания. \
         Если контекста недостаточно, прямо напиши: 'Недостаточно данных в источниках'. \
         Каждое утверждение подтверждай ссылками на фрагменты в формате [n].\n\n\
         {history_section}Вопрос пользователя: {query}\n\nКонтекст:\n{context_block}"
    )
}

/// Deduplicated citation list with display defaults filled in.
pub fn build_sources(selected: &[&HybridSearchHit]) -> Vec<AnswerSource> {
    let mut seen: HashSet<(String, String, String, String)> = HashSet::new();
    let mut sources = Vec::new();
    for hit in selected {
        let source = AnswerSource {
            title: hit
                .title
                .clone()
                .unwrap_or_else(|| "Без названия".to_string()),
            author: hit
                .author
                .clone()
                .unwrap_or_else(|| "Неизвестный автор".to_string()),
            source_path: hit.source_path.clone(),
            location: location_of(hit.page, hit.chunk_no),
        };
        let key = (
            source.title.clone(),
            source.author.clone(),
            source.source_path.clone(),
            source.location.clone(),
        );
        if seen.insert(key) {
            sources.push(source);
        }
    }
    sources
}

fn insufficient(prompt: String) -> AnswerResult {
    AnswerResult {
        answer: INSUFFICIENT_DATA_ANSWER.to_string(),
        sources: Vec::new(),
        is_confirmed: false,
        prompt,
    }
}

/// When generation fails outright, quote the lead fragment instead of
/// dropping the evidence on the floor.
fn fallback_answer(prompt: String, selected: &[&HybridSearchHit]) -> AnswerResult {
    let sources = build_sources(selected);
    if sources.is_empty() {
        return insufficient(prompt);
    }
    let lead = selected
        .first()
        .map(|hit| hit.excerpt.trim())
        .unwrap_or_default();
    if lead.is_empty() {
        return AnswerResult {
            answer: INSUFFICIENT_DATA_ANSWER.to_string(),
            sources,
            is_confirmed: false,
            prompt,
        };
    }
    AnswerResult {
        answer: format!("{lead} [1]"),
        sources,
        is_confirmed: true,
        prompt,
    }
}

/// Hybrid search bounded by the heavy-search semaphore and a wall-clock
/// timeout.
pub async fn timed_hybrid_search(
    pool: &SqlitePool,
    config: &Config,
    provider: Option<&dyn EmbeddingProvider>,
    query: &str,
    limit: i64,
    semaphore: &Semaphore,
) -> SearchResponse {
    let _permit = match semaphore.acquire().await {
        Ok(permit) => permit,
        Err(_) => {
            return SearchResponse {
                results: Vec::new(),
                error: Some("Search unavailable".to_string()),
                timed_out: false,
            }
        }
    };

    let deadline = Duration::from_secs(config.rag.search_timeout_secs);
    let search = hybrid::hybrid_search(
        pool,
        config,
        provider,
        query,
        limit,
        config.retrieval.alpha,
        None,
        None,
        false,
        config.retrieval.candidate_limit,
    );
    match tokio::time::timeout(deadline, search).await {
        Err(_) => {
            warn!(query, timeout_secs = config.rag.search_timeout_secs, "hybrid search timed out");
            SearchResponse {
                results: Vec::new(),
                error: Some("Search timed out".to_string()),
                timed_out: true,
            }
        }
        Ok(Err(e)) => SearchResponse {
            results: Vec::new(),
            error: Some(format!("{e:#}")),
            timed_out: false,
        },
        Ok(Ok(results)) => SearchResponse {
            results,
            error: None,
            timed_out: false,
        },
    }
}

/// Answer a question from the library, or say why it cannot be answered.
#[allow(clippy::too_many_arguments)]
pub async fn answer_question(
    pool: &SqlitePool,
    config: &Config,
    embedder: Option<&dyn EmbeddingProvider>,
    generator: &dyn GenerationProvider,
    query: &str,
    top_k: usize,
    max_context_chars: usize,
    history: &[ChatMessage],
    semaphore: &Semaphore,
) -> Result<AnswerResult> {
    let response =
        timed_hybrid_search(pool, config, embedder, query, top_k.max(1) as i64, semaphore).await;
    if response.error.is_some() || response.results.is_empty() {
        return Ok(insufficient(String::new()));
    }

    let candidates: Vec<HybridSearchHit> =
        response.results.into_iter().take(top_k).collect();
    let selected = build_llm_context(
        &candidates,
        max_context_chars,
        top_k.min(config.rag.max_chunks),
        config.rag.max_per_source,
    );
    if !has_sufficient_relevance(&selected, config.rag.min_chunks, config.rag.min_total_relevance)? {
        return Ok(insufficient(String::new()));
    }

    // History rides inside the prompt; the provider only sees one user turn.
    let prompt = build_prompt(query, &selected, max_context_chars, history);
    let deadline = Duration::from_secs(config.generation.timeout_secs);
    match tokio::time::timeout(deadline, generator.generate(&prompt, &[])).await {
        Err(_) => Ok(AnswerResult {
            answer: GENERATION_TIMEOUT_ANSWER.to_string(),
            sources: build_sources(&selected),
            is_confirmed: false,
            prompt,
        }),
        Ok(Err(e)) => {
            warn!(error = %e, "generation failed, quoting the lead fragment");
            Ok(fallback_answer(prompt, &selected))
        }
        Ok(Ok(answer)) => {
            let sources = build_sources(&selected);
            if sources.is_empty() {
                return Ok(insufficient(prompt));
            }
            Ok(AnswerResult {
                answer,
                sources,
                is_confirmed: true,
                prompt,
            })
        }
    }
}

/// CLI entry point for `ask`.
pub async fn run_ask(
    config: &Config,
    question: &str,
    top_k: Option<usize>,
    context_chars: Option<usize>,
    json: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;

    let client = OpenRouterClient::from_config(&config.embedding, &config.generation)?;
    let semaphore = Semaphore::new(config.rag.heavy_search_permits.max(1));
    let result = answer_question(
        &pool,
        config,
        Some(&client),
        &client,
        question,
        top_k.unwrap_or(config.rag.max_chunks),
        context_chars.unwrap_or(config.rag.max_context_chars),
        &[],
        &semaphore,
    )
    .await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    println!("{}", result.answer);
    if !result.sources.is_empty() {
        println!();
        println!("Sources:");
        for (i, source) in result.sources.iter().enumerate() {
            println!(
                "{}. {} — {} — {}",
                i + 1,
                source.title,
                source.author,
                source.location
            );
        }
    }
    Ok(())
}
