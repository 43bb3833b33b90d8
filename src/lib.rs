//! # Librarium
//!
//! A local-first ingestion and hybrid retrieval engine for multilingual
//! book libraries.
//!
//! Librarium routes PDF, EPUB, FB2, and TXT files through format adapters
//! into a canonical block model, chunks them along sentence boundaries,
//! and maintains two indexes over the result: an FTS5 lexical index with
//! per-language lemmatization and a vector index fed by an embedding
//! provider. Queries fuse both signals into one ranked list, and an
//! answer pipeline selects diverse context from the hits for
//! retrieval-augmented generation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Adapters   │──▶│ Chunk+Dedupe │──▶│    SQLite     │
//! │ PDF/EPUB/   │   │  Normalize   │   │ FTS5 + state  │
//! │ FB2/TXT     │   └──────────────┘   └──────┬────────┘
//! └─────────────┘                             │
//!                      ┌───────────────┐      │
//!                      │ Vector index  │◀─────┤
//!                      │ (embeddings)  │      │
//!                      └───────┬───────┘      │
//!                              ▼              ▼
//!                        ┌──────────────────────┐
//!                        │  Hybrid fusion + RAG │
//!                        │       (libr)         │
//!                        └──────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! libr init                        # create database
//! libr ingest ./books --cache     # extraction + dedupe report
//! libr index ./books              # build the lexical index
//! libr embed                      # build the semantic index
//! libr search "тишина" --limit 5
//! libr hybrid "практика внимания" --alpha 0.7
//! libr ask "Где автор описывает наблюдение за мыслями?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Canonical document model |
//! | [`extract`] | Adapter routing and dispatch |
//! | [`adapter_pdf`] | PDF extraction with OCR fallback |
//! | [`adapter_epub`] | EPUB extraction |
//! | [`adapter_fb2`] | FB2 / FB2.ZIP extraction |
//! | [`adapter_txt`] | Plain-text extraction with charset detection |
//! | [`chunk`] | Sentence-aware chunking |
//! | [`dedupe`] | Dual-fingerprint duplicate detection |
//! | [`lang`] | Language detection |
//! | [`normalize`] | Per-language lemmatization |
//! | [`indexer`] | Lexical index runs |
//! | [`search`] | FTS5 search with metadata filters |
//! | [`embedding`] | Embedding and generation providers |
//! | [`vector_store`] | Flat vector index file |
//! | [`semantic`] | Semantic index runs and search |
//! | [`scoring`] | Score normalization and fusion |
//! | [`hybrid`] | Hybrid retrieval and reranking |
//! | [`rag`] | Context selection and answer generation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod adapter_epub;
pub mod adapter_fb2;
pub mod adapter_pdf;
pub mod adapter_txt;
pub mod chunk;
pub mod config;
pub mod db;
pub mod dedupe;
pub mod embedding;
pub mod extract;
pub mod hybrid;
pub mod indexer;
pub mod ingest;
pub mod lang;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod ocr;
pub mod rag;
pub mod scoring;
pub mod search;
pub mod semantic;
pub mod stats;
pub mod vector_store;
