use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create or migrate the database named by the config, then close the pool.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema idempotently. Every command that opens the database
/// runs this first, so older databases pick up additive changes in place.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS books (
            id INTEGER PRIMARY KEY,
            source_path TEXT NOT NULL UNIQUE,
            title TEXT,
            author TEXT,
            format TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // language arrived after the first release; add it to older databases.
    let has_language: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('books') WHERE name = 'language'",
    )
    .fetch_one(pool)
    .await?;
    if !has_language {
        sqlx::query("ALTER TABLE books ADD COLUMN language TEXT")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY,
            book_id INTEGER NOT NULL,
            chunk_no INTEGER NOT NULL,
            raw_text TEXT NOT NULL,
            lemma_text TEXT NOT NULL,
            page INTEGER,
            chapter TEXT,
            item_id TEXT,
            char_start INTEGER,
            char_end INTEGER,
            UNIQUE(book_id, chunk_no),
            FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;
    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                raw_text,
                lemma_text,
                content='chunks',
                content_rowid='id',
                tokenize='unicode61 remove_diacritics 2'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // External-content FTS moves in the same transaction as chunk rows.
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, raw_text, lemma_text)
            VALUES (new.id, new.raw_text, new.lemma_text);
        END
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, raw_text, lemma_text)
            VALUES ('delete', old.id, old.raw_text, old.lemma_text);
        END
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, raw_text, lemma_text)
            VALUES ('delete', old.id, old.raw_text, old.lemma_text);
            INSERT INTO chunks_fts(rowid, raw_text, lemma_text)
            VALUES (new.id, new.raw_text, new.lemma_text);
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_state (
            source_path TEXT PRIMARY KEY,
            fingerprint TEXT NOT NULL,
            mtime_ns INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS semantic_index_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            model TEXT NOT NULL,
            dimension INTEGER NOT NULL,
            metric TEXT NOT NULL DEFAULT 'ip',
            index_path TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // No foreign key: rows outlive their chunks on reingestion and are
    // pruned by the semantic index run.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS semantic_chunk_state (
            chunk_id INTEGER PRIMARY KEY,
            vector_id INTEGER NOT NULL,
            model TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Classification tables are populated by external tooling; the search
    // filters compile against them.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS book_categories (
            book_id INTEGER NOT NULL,
            category_id INTEGER NOT NULL,
            PRIMARY KEY (book_id, category_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            tag_type TEXT NOT NULL CHECK (tag_type IN ('topic', 'region', 'period', 'entity')),
            UNIQUE(name, tag_type)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS book_tags (
            book_id INTEGER NOT NULL,
            tag_id INTEGER NOT NULL,
            PRIMARY KEY (book_id, tag_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS timeline_events (
            id INTEGER PRIMARY KEY,
            book_id INTEGER NOT NULL,
            chunk_id INTEGER,
            year_from INTEGER,
            year_to INTEGER,
            decade INTEGER,
            century INTEGER,
            event_text TEXT,
            source_fragment TEXT,
            is_approximate INTEGER NOT NULL DEFAULT 0,
            confidence REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_book_id ON chunks(book_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_timeline_book ON timeline_events(book_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_timeline_years ON timeline_events(year_from, year_to)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_book_tags_tag ON book_tags(tag_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_book_categories_category ON book_categories(category_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
