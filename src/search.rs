use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::normalize;

/// Optional metadata filters applied on top of the FTS match.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub author: Option<String>,
    pub format: Option<String>,
    pub language: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub year_from: Option<i64>,
    pub year_to: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
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
    pub item_id: Option<String>,
    pub char_start: Option<i64>,
    pub char_end: Option<i64>,
    pub excerpt: String,
    pub rank: f64,
}

impl SearchHit {
    /// One-line form: "{title or file name} — {location} — {excerpt}".
    pub fn display(&self) -> String {
        let title = display_title(self.title.as_deref(), &self.source_path);
        let location = format_location(
            self.page,
            self.chapter.as_deref(),
            self.char_start,
            self.char_end,
        );
        let excerpt = self.excerpt.replace('\n', " ");
        format!("{} — {} — {}", title, location, excerpt.trim())
    }
}

pub(crate) fn display_title(title: Option<&str>, source_path: &str) -> String {
    match title {
        Some(t) if !t.trim().is_empty() => t.trim().to_string(),
        _ => Path::new(source_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_path.to_string()),
    }
}

/// Human-readable chunk location, preferring page over chapter over offsets.
pub(crate) fn format_location(
    page: Option<i64>,
    chapter: Option<&str>,
    char_start: Option<i64>,
    char_end: Option<i64>,
) -> String {
    if let Some(page) = page {
        return format!("page {page}");
    }
    if let Some(chapter) = chapter {
        if !chapter.trim().is_empty() {
            return chapter.trim().to_string();
        }
    }
    match (char_start, char_end) {
        (Some(start), Some(end)) => format!("position {start}-{end}"),
        _ => "position unknown".to_string(),
    }
}

// ============ MATCH expression ============

/// Double internal quotes so the term is safe inside an FTS5 string.
fn fts_quote(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

/// Build the FTS5 MATCH expression for a user query.
///
/// Phrase mode matches the query verbatim against the raw column and its
/// normalized form against the lemma column. Term mode requires every
/// word on one column or every lemma on the other, so inflected text is
/// still found while exact wording ranks via the raw column's weight.
pub fn build_match_expression(query: &str, phrase_mode: bool, language: &str) -> Option<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return None;
    }

    if phrase_mode {
        let raw = fts_quote(trimmed);
        let lemma_phrase = normalize::normalize_query(trimmed, language);
        let mut expr = format!("(raw_text : {raw})");
        if !lemma_phrase.is_empty() && lemma_phrase != trimmed.to_lowercase() {
            expr.push_str(&format!(" OR (lemma_text : {})", fts_quote(&lemma_phrase)));
        }
        return Some(expr);
    }

    let raw_terms: Vec<String> = normalize::WORD_RE
        .find_iter(trimmed)
        .map(|m| m.as_str().to_lowercase())
        .collect();
    if raw_terms.is_empty() {
        return None;
    }
    let raw_group = raw_terms
        .iter()
        .map(|t| format!("raw_text : {}", fts_quote(t)))
        .collect::<Vec<_>>()
        .join(" AND ");

    let normalized = normalize::normalize_query(trimmed, language);
    let lemma_terms: Vec<String> = normalized.split_whitespace().map(str::to_string).collect();
    let lemma_group = lemma_terms
        .iter()
        .map(|t| format!("lemma_text : {}", fts_quote(t)))
        .collect::<Vec<_>>()
        .join(" AND ");

    if lemma_terms.is_empty() || lemma_terms == raw_terms {
        Some(format!("({raw_group})"))
    } else {
        Some(format!("({raw_group}) OR ({lemma_group})"))
    }
}

// ============ Query execution ============

/// Run an FTS query with optional metadata filters.
///
/// Results come back ordered by BM25 rank (raw text weighted 1.5 against
/// 1.0 for lemmas) with chunk id as the tie-break. Callers clamp the
/// limit; a non-positive limit short-circuits to no results.
pub async fn search_chunks(
    pool: &SqlitePool,
    query: &str,
    filters: &SearchFilters,
    phrase_mode: bool,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }
    let language = filters.language.as_deref().unwrap_or("ru");
    let match_expr = match build_match_expression(query, phrase_mode, language) {
        Some(expr) => expr,
        None => return Ok(Vec::new()),
    };

    let mut sql = String::from(
        r#"
        SELECT c.id AS chunk_id, c.book_id, b.title, b.author, b.format, b.language,
               b.source_path, c.chunk_no, c.page, c.chapter, c.item_id,
               c.char_start, c.char_end,
               snippet(chunks_fts, 0, '«', '»', ' … ', 24) AS excerpt,
               bm25(chunks_fts, 1.5, 1.0) AS rank
        FROM chunks_fts
        JOIN chunks c ON c.id = chunks_fts.rowid
        JOIN books b ON b.id = c.book_id
        WHERE chunks_fts MATCH ?
        "#,
    );

    if filters.author.is_some() {
        sql.push_str(" AND LOWER(COALESCE(b.author, '')) LIKE ?");
    }
    if filters.format.is_some() {
        sql.push_str(" AND LOWER(b.format) = LOWER(?)");
    }
    if filters.language.is_some() {
        sql.push_str(" AND b.language = ?");
    }
    if filters.category.is_some() {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM book_categories bc \
             JOIN categories cat ON cat.id = bc.category_id \
             WHERE bc.book_id = b.id AND LOWER(cat.name) = LOWER(?))",
        );
    }
    if filters.tag.is_some() {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM book_tags bt \
             JOIN tags t ON t.id = bt.tag_id \
             WHERE bt.book_id = b.id AND LOWER(t.name) = LOWER(?))",
        );
    }
    if filters.year_from.is_some() || filters.year_to.is_some() {
        let mut inner =
            String::from("SELECT 1 FROM timeline_events te WHERE te.book_id = b.id");
        if filters.year_from.is_some() {
            inner.push_str(" AND COALESCE(te.year_to, te.year_from) >= ?");
        }
        if filters.year_to.is_some() {
            inner.push_str(" AND COALESCE(te.year_from, te.year_to) <= ?");
        }
        sql.push_str(&format!(" AND EXISTS ({inner})"));
    }

    sql.push_str(" ORDER BY rank, c.id LIMIT ?");

    let mut db_query = sqlx::query(&sql).bind(match_expr);
    if let Some(author) = &filters.author {
        db_query = db_query.bind(format!("%{}%", author.to_lowercase()));
    }
    if let Some(format) = &filters.format {
        db_query = db_query.bind(format);
    }
    if let Some(language) = &filters.language {
        db_query = db_query.bind(language.to_lowercase());
    }
    if let Some(category) = &filters.category {
        db_query = db_query.bind(category);
    }
    if let Some(tag) = &filters.tag {
        db_query = db_query.bind(tag);
    }
    if let Some(year_from) = filters.year_from {
        db_query = db_query.bind(year_from);
    }
    if let Some(year_to) = filters.year_to {
        db_query = db_query.bind(year_to);
    }
    db_query = db_query.bind(limit);

    let rows = db_query.fetch_all(pool).await?;
    let hits = rows
        .iter()
        .map(|row| SearchHit {
            chunk_id: row.get("chunk_id"),
            book_id: row.get("book_id"),
            title: row.get("title"),
            author: row.get("author"),
            format: row.get("format"),
            language: row.get("language"),
            source_path: row.get("source_path"),
            chunk_no: row.get("chunk_no"),
            page: row.get("page"),
            chapter: row.get("chapter"),
            item_id: row.get("item_id"),
            char_start: row.get("char_start"),
            char_end: row.get("char_end"),
            excerpt: row.get("excerpt"),
            rank: row.get("rank"),
        })
        .collect();
    Ok(hits)
}

/// CLI entry point for keyword search.
pub async fn run_search(
    config: &Config,
    query: &str,
    limit: Option<i64>,
    filters: SearchFilters,
    phrase_mode: bool,
    json: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;

    let limit = limit.unwrap_or(10).clamp(1, 100);
    let hits = search_chunks(&pool, query, &filters, phrase_mode, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else if hits.is_empty() {
        println!("No results.");
    } else {
        for (i, hit) in hits.iter().enumerate() {
            println!("{}. [{:.2}] {}", i + 1, hit.rank, hit.display());
        }
    }

    pool.close().await;
    Ok(())
}
