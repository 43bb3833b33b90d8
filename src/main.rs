//! # Librarium CLI (`libr`)
//!
//! The `libr` binary is the interface to the library engine: database
//! initialization, ingestion reports, lexical and semantic indexing,
//! search, and retrieval-augmented answering.
//!
//! ## Usage
//!
//! ```bash
//! libr --config ./librarium.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `libr init` | Create the SQLite database and run schema migrations |
//! | `libr ingest <path>` | Extract, chunk, and dedupe-check without indexing |
//! | `libr index <dir>` | Build or refresh the lexical index |
//! | `libr embed` | Build or refresh the semantic index |
//! | `libr search "<query>"` | Lexical search with metadata filters |
//! | `libr hybrid "<query>"` | Fused lexical + semantic search |
//! | `libr ask "<question>"` | Retrieval-augmented answer with citations |
//! | `libr stats` | Library overview |
//! | `libr completions <shell>` | Shell completion script |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! libr init
//!
//! # Report what a directory would contribute, keeping the dedupe cache
//! libr ingest ./books --cache
//!
//! # Index the library, then embed it
//! libr index ./books
//! libr embed
//!
//! # Lexical search with filters
//! libr search "практика" --author Иванов --year-from 1900 --year-to 1930
//!
//! # Hybrid search with a custom blend
//! libr hybrid "наблюдение за мыслями" --alpha 0.8 --limit 5
//!
//! # Ask a question against the library
//! libr ask "Где автор описывает наблюдение за мыслями?"
//! ```

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use librarium::config::{self, Config, ConfigError};
use librarium::search::SearchFilters;
use librarium::{hybrid, indexer, ingest, migrate, rag, search, semantic, stats};

/// Librarium CLI — a local-first ingestion and hybrid retrieval engine
/// for multilingual book libraries.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file; a missing file falls back to built-in defaults.
#[derive(Parser)]
#[command(
    name = "libr",
    about = "Librarium — local-first ingestion and hybrid retrieval for book libraries",
    version,
    long_about = "Librarium routes PDF, EPUB, FB2, and TXT files into a canonical block model, \
    chunks them along sentence boundaries, and serves queries from a fused lexical (FTS5) and \
    semantic (embedding) index, with a retrieval-augmented answer pipeline on top."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./librarium.toml`. Storage paths, chunking, embedding,
    /// retrieval, and generation settings are read from this file.
    #[arg(long, global = true, default_value = "./librarium.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (books,
    /// chunks, chunks_fts, index state, classification tables). This
    /// command is idempotent; running it multiple times is safe.
    Init,

    /// Extract, chunk, and dedupe-check documents without indexing.
    ///
    /// Routes each file through the format adapters and reports title,
    /// author, chunk count, and duplicate status per document. No index
    /// is written; use `index` for that.
    Ingest {
        /// Source file or directory.
        path: PathBuf,

        /// Load and persist the dedupe fingerprint cache across runs.
        #[arg(long)]
        cache: bool,

        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Build or refresh the lexical index for a directory.
    ///
    /// Scans recursively for supported formats, skips files whose stored
    /// fingerprint is unchanged, and replaces book chunks atomically.
    Index {
        /// Library root directory.
        dir: PathBuf,

        /// Print run statistics as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Build or refresh the semantic index.
    ///
    /// Embeds chunks whose fingerprint changed since the last run, prunes
    /// vectors for deleted chunks, and records the model used. Requires
    /// the embedding provider API key in the environment.
    Embed {
        /// Print run statistics as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Lexical search over the indexed library.
    ///
    /// Matches both the raw text and the lemmatized text, and supports
    /// metadata filters over author, format, language, category, tag,
    /// and timeline years.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results (clamped to 1..=100).
        #[arg(long)]
        limit: Option<i64>,

        /// Match the query as one exact phrase.
        #[arg(long)]
        phrase: bool,

        /// Filter by author substring (case-insensitive).
        #[arg(long)]
        author: Option<String>,

        /// Filter by format tag (pdf, epub, fb2, txt).
        #[arg(long)]
        format: Option<String>,

        /// Filter by detected language code (ru, kk, tt, en).
        #[arg(long)]
        language: Option<String>,

        /// Filter by assigned category name.
        #[arg(long)]
        category: Option<String>,

        /// Filter by assigned tag name.
        #[arg(long)]
        tag: Option<String>,

        /// Only books with timeline events ending in or after this year.
        #[arg(long)]
        year_from: Option<i64>,

        /// Only books with timeline events starting in or before this year.
        #[arg(long)]
        year_to: Option<i64>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Fused lexical + semantic search.
    ///
    /// Runs both branches, normalizes and blends their scores, boosts
    /// exact wording, and reranks by term overlap. Falls back to the
    /// lexical branch alone when no semantic index is available.
    Hybrid {
        /// The search query string.
        query: String,

        /// Maximum number of results (clamped to 1..=100).
        #[arg(long)]
        limit: Option<i64>,

        /// Semantic weight in [0, 1]; 0 is lexical-only, 1 semantic-only.
        #[arg(long)]
        alpha: Option<f64>,

        /// Filter by author substring (case-insensitive).
        #[arg(long)]
        author: Option<String>,

        /// Filter by format tag (pdf, epub, fb2, txt).
        #[arg(long)]
        format: Option<String>,

        /// Match the query as one exact phrase.
        #[arg(long)]
        phrase: bool,

        /// Candidate pool size fetched from each branch before fusion.
        #[arg(long)]
        candidates: Option<i64>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ask a question and get a cited answer from the library.
    ///
    /// Retrieves hybrid context, checks that the evidence is sufficient,
    /// and generates an answer with `[n]` citations. Requires the
    /// provider API key in the environment.
    Ask {
        /// The question to answer.
        question: String,

        /// How many hits to retrieve for context selection.
        #[arg(long)]
        top_k: Option<usize>,

        /// Character budget for the generation context.
        #[arg(long)]
        context_chars: Option<usize>,

        /// Print the full answer structure as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show library statistics.
    ///
    /// Prints book and chunk counts, embedding coverage, and per-format
    /// and per-language breakdowns.
    Stats,

    /// Generate a shell completion script.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

fn load_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Completions don't need config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "libr", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = load_or_default(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path, cache, json } => {
            ingest::run_ingest(&cfg, &path, cache, json)?;
        }
        Commands::Index { dir, json } => {
            indexer::run_index(&cfg, &dir, json).await?;
        }
        Commands::Embed { json } => {
            semantic::run_embed(&cfg, json).await?;
        }
        Commands::Search {
            query,
            limit,
            phrase,
            author,
            format,
            language,
            category,
            tag,
            year_from,
            year_to,
            json,
        } => {
            let filters = SearchFilters {
                author,
                format,
                language,
                category,
                tag,
                year_from,
                year_to,
            };
            search::run_search(&cfg, &query, limit, filters, phrase, json).await?;
        }
        Commands::Hybrid {
            query,
            limit,
            alpha,
            author,
            format,
            phrase,
            candidates,
            json,
        } => {
            if let Err(e) = hybrid::run_hybrid(
                &cfg, &query, limit, alpha, author, format, phrase, candidates, json,
            )
            .await
            {
                // Invalid parameters are the caller's fault, not ours.
                if let Some(config_err) = e.downcast_ref::<ConfigError>() {
                    if json {
                        println!(
                            "{}",
                            serde_json::json!({ "error": config_err.to_string() })
                        );
                    } else {
                        eprintln!("error: {config_err}");
                    }
                    std::process::exit(2);
                }
                return Err(e);
            }
        }
        Commands::Ask {
            question,
            top_k,
            context_chars,
            json,
        } => {
            rag::run_ask(&cfg, &question, top_k, context_chars, json).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
