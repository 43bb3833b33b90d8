//! Library statistics and health overview.
//!
//! Gives a quick summary of what's indexed: book and chunk counts,
//! embedding coverage, per-format and per-language breakdowns. Used by
//! `libr stats` to confirm that indexing and embedding runs are keeping
//! up with the library.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::migrate;

/// Per-format breakdown of book and chunk counts.
struct FormatStats {
    format: String,
    book_count: i64,
    chunk_count: i64,
    embedded_count: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;

    let total_books: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM books")
        .fetch_one(&pool)
        .await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;

    let total_embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM semantic_chunk_state")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.storage.db_path)
        .map(|m| m.len())
        .unwrap_or(0);
    let vector_size = std::fs::metadata(&config.storage.vector_index_path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Librarium — Library Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.storage.db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Vectors:     {} ({})",
        config.storage.vector_index_path.display(),
        format_bytes(vector_size)
    );
    println!();
    println!("  Books:       {}", total_books);
    println!("  Chunks:      {}", total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        total_embedded,
        total_chunks,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );

    let last_indexed: Option<i64> = sqlx::query_scalar("SELECT MAX(updated_at) FROM index_state")
        .fetch_one(&pool)
        .await?;
    println!(
        "  Last index:  {}",
        match last_indexed {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        }
    );

    let semantic_state =
        sqlx::query("SELECT model, dimension, metric, updated_at FROM semantic_index_state WHERE id = 1")
            .fetch_optional(&pool)
            .await?;
    if let Some(row) = &semantic_state {
        println!();
        println!(
            "  Semantic:    {} ({} dims, {})",
            row.get::<String, _>("model"),
            row.get::<i64, _>("dimension"),
            row.get::<String, _>("metric")
        );
        println!(
            "  Embedded at: {}",
            format_ts_relative(row.get::<i64, _>("updated_at"))
        );
    }

    // Per-format breakdown
    let format_rows = sqlx::query(
        r#"
        SELECT
            b.format,
            COUNT(DISTINCT b.id) AS book_count,
            COUNT(DISTINCT c.id) AS chunk_count,
            COUNT(DISTINCT s.chunk_id) AS embedded_count
        FROM books b
        LEFT JOIN chunks c ON c.book_id = b.id
        LEFT JOIN semantic_chunk_state s ON s.chunk_id = c.id
        GROUP BY b.format
        ORDER BY book_count DESC, b.format
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let format_stats: Vec<FormatStats> = format_rows
        .iter()
        .map(|row| FormatStats {
            format: row.get("format"),
            book_count: row.get("book_count"),
            chunk_count: row.get("chunk_count"),
            embedded_count: row.get("embedded_count"),
        })
        .collect();

    if !format_stats.is_empty() {
        println!();
        println!("  By format:");
        println!(
            "  {:<10} {:>6} {:>8} {:>10}",
            "FORMAT", "BOOKS", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(38));
        for s in &format_stats {
            println!(
                "  {:<10} {:>6} {:>8} {:>10}",
                s.format, s.book_count, s.chunk_count, s.embedded_count
            );
        }
    }

    // Per-language breakdown
    let language_rows = sqlx::query(
        r#"
        SELECT COALESCE(language, 'unknown') AS language, COUNT(*) AS book_count
        FROM books
        GROUP BY COALESCE(language, 'unknown')
        ORDER BY book_count DESC, language
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if !language_rows.is_empty() {
        println!();
        println!("  By language:");
        for row in &language_rows {
            println!(
                "  {:<10} {:>6}",
                row.get::<String, _>("language"),
                row.get::<i64, _>("book_count")
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
