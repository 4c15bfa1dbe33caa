//! # docchat
//!
//! A retrieval-augmented chat backend over a local folder of documents.
//!
//! For every user turn the model first decides, in a strict JSON format,
//! whether the documents need to be searched. If so, the question is answered
//! from retrieved snippets; otherwise the model's own reply is used.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌─────────────────┐
//! │ Folder       │──▶│  Extract    │──▶│ Document cache   │
//! │ pdf/docx/... │   │ (blocking)  │   │ RwLock<Arc<_>>   │
//! └──────────────┘   └─────────────┘   └────────┬────────┘
//!                                              │ chunk + embed
//!                                              ▼
//!  question ──▶ Negotiation ──search?──▶ Embedding index ──empty?──▶ Lexical
//!                   │                          │                      │
//!                   └────── reply ──────▶ Synthesis ◀─────────────────┘
//!                                              │
//!                                    ┌─────────┴────────┐
//!                                    ▼                  ▼
//!                               ┌────────┐        ┌──────────┐
//!                               │  CLI   │        │   HTTP   │
//!                               └────────┘        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docchat init                         # write ./config/docchat.toml
//! docchat refresh                      # extract, chunk, and embed the folder
//! docchat search "refund policy" --mode loose
//! docchat ask "What is our refund policy?"
//! docchat serve                        # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | PDF, DOCX, XLSX, and plain-text extraction |
//! | [`scan`] | Document folder enumeration |
//! | [`cache`] | Document cache with atomic snapshot swaps |
//! | [`chunk`] | Word-window chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Chunk and embedding index |
//! | [`lexical`] | Exact and keyword fallback search |
//! | [`knowledge`] | Cache, index, and background refresher |
//! | [`llm`] | Chat model backend client |
//! | [`negotiation`] | Structured search decision protocol |
//! | [`synthesis`] | Turn orchestration and retries |
//! | [`conversations`] | JSON file conversation store |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command implementations |
//! | [`logging`] | Tracing subscriber setup |

pub mod cache;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod conversations;
pub mod embedding;
pub mod extract;
pub mod index;
pub mod knowledge;
pub mod lexical;
pub mod llm;
pub mod logging;
pub mod models;
pub mod negotiation;
pub mod scan;
pub mod server;
pub mod synthesis;
