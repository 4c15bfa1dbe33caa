//! The document knowledge base: cache, index, and background refresher.
//!
//! [`KnowledgeBase`] is the one owner of the document cache and the chunk
//! index. The HTTP server, the CLI, and the chat engine share it through an
//! `Arc`. A refresh re-reads the folder and rebuilds the index from the new
//! snapshot. Refreshes are serialized by an async gate, so a manual trigger
//! and the periodic task never interleave. Each refresh depends only on what
//! is on disk, so the last one to finish wins.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::DocumentCache;
use crate::config::{ChunkingConfig, Config, FilesConfig, RetrievalConfig};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::index::EmbeddingIndex;
use crate::lexical::{exact_search, loose_search};

/// Counts from one completed refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub files: usize,
    pub chunks: usize,
    pub skipped: usize,
    pub failed: usize,
    pub generation: u64,
}

/// Text retrieved for a query, tagged by the stage that found it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retrieval {
    Semantic(Vec<String>),
    Lexical(Vec<String>),
    Miss,
}

impl Retrieval {
    /// Snippets joined into one context block, or `None` on a miss.
    pub fn context(&self) -> Option<String> {
        match self {
            Retrieval::Semantic(s) => Some(s.join("\n")),
            Retrieval::Lexical(s) => Some(s.join("\n\n")),
            Retrieval::Miss => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Retrieval::Semantic(_) => "semantic",
            Retrieval::Lexical(_) => "lexical",
            Retrieval::Miss => "none",
        }
    }
}

/// Search strategy for direct searches from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Semantic,
    Exact,
    Loose,
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "exact" => Ok(SearchMode::Exact),
            "loose" => Ok(SearchMode::Loose),
            other => bail!(
                "Unknown search mode: {}. Use semantic, exact, or loose.",
                other
            ),
        }
    }
}

pub struct KnowledgeBase {
    cache: DocumentCache,
    index: EmbeddingIndex,
    embedder: Box<dyn EmbeddingProvider>,
    files: FilesConfig,
    chunking: ChunkingConfig,
    retrieval: RetrievalConfig,
    batch_size: usize,
    gate: Mutex<()>,
}

impl KnowledgeBase {
    /// Builds an empty knowledge base with the configured embedding provider.
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        Ok(Self::new(config, embedder))
    }

    /// Builds an empty knowledge base around an explicit embedding provider.
    pub fn new(config: &Config, embedder: Box<dyn EmbeddingProvider>) -> Self {
        Self {
            cache: DocumentCache::new(),
            index: EmbeddingIndex::new(),
            embedder,
            files: config.files.clone(),
            chunking: config.chunking.clone(),
            retrieval: config.retrieval.clone(),
            batch_size: config.embedding.batch_size,
            gate: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    /// Re-reads the folder, then rebuilds the index from the new snapshot.
    ///
    /// If the folder cannot be read the cache and index keep their previous
    /// contents.
    pub async fn refresh(&self) -> Result<RefreshSummary> {
        let _gate = self.gate.lock().await;

        let (snapshot, report) = self.cache.refresh(&self.files).await?;
        let index = self
            .index
            .rebuild(&snapshot, self.embedder.as_ref(), &self.chunking, self.batch_size)
            .await;

        let summary = RefreshSummary {
            files: snapshot.len(),
            chunks: index.chunk_count(),
            skipped: report.skipped,
            failed: report.failed,
            generation: snapshot.generation,
        };
        info!(
            files = summary.files,
            chunks = summary.chunks,
            generation = summary.generation,
            "knowledge base refreshed"
        );
        Ok(summary)
    }

    /// Manual refresh, as requested through the API.
    pub async fn trigger_refresh(&self) -> Result<RefreshSummary> {
        info!("manual refresh requested");
        self.refresh().await
    }

    /// Finds context for `query`: semantic search first, then the loose
    /// lexical fallback.
    ///
    /// An embedding failure is logged and treated as an empty semantic result.
    pub async fn retrieve(&self, query: &str) -> Retrieval {
        let semantic = match self
            .index
            .query(
                query,
                self.embedder.as_ref(),
                self.retrieval.top_k,
                self.retrieval.min_score,
            )
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "semantic search failed, falling back to lexical search");
                Vec::new()
            }
        };

        if !semantic.is_empty() {
            debug!(hits = semantic.len(), "semantic search hit");
            return Retrieval::Semantic(semantic.into_iter().map(|h| h.snippet).collect());
        }

        match loose_search(&self.cache.snapshot(), query, self.retrieval.snippet_chars) {
            Some(snippets) => {
                debug!(hits = snippets.len(), "lexical search hit");
                Retrieval::Lexical(snippets)
            }
            None => Retrieval::Miss,
        }
    }

    /// Runs one search strategy directly, returning at most `limit` snippets.
    pub async fn search(&self, query: &str, mode: SearchMode, limit: usize) -> Result<Vec<String>> {
        let snippets = match mode {
            SearchMode::Semantic => self
                .index
                .query(query, self.embedder.as_ref(), limit, self.retrieval.min_score)
                .await?
                .into_iter()
                .map(|h| format!("[{:.3}] {} #{}: {}", h.score, h.path, h.chunk_index, h.snippet))
                .collect(),
            SearchMode::Exact => {
                exact_search(&self.cache.snapshot(), query, self.retrieval.snippet_chars)
                    .unwrap_or_default()
            }
            SearchMode::Loose => {
                loose_search(&self.cache.snapshot(), query, self.retrieval.snippet_chars)
                    .unwrap_or_default()
            }
        };
        Ok(snippets.into_iter().take(limit).collect())
    }

    /// Paths of every cached document, in path order.
    pub fn files(&self) -> Vec<String> {
        self.cache.snapshot().paths()
    }

    /// Starts the periodic refresher: one refresh right away, then one per
    /// `interval`.
    pub fn spawn_refresher(self: Arc<Self>, interval: Duration) -> RefresherHandle {
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                tokio::select! {
                    result = self.refresh() => {
                        if let Err(e) = result {
                            warn!(error = %e, "background refresh failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("refresher stopped");
        });

        RefresherHandle { shutdown, task }
    }
}

/// Stop handle for the background refresher.
pub struct RefresherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    /// Signals the refresher and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "refresher task ended abnormally");
        }
    }
}
