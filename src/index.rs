//! In-memory chunk and embedding index.
//!
//! The index maps each document path to its chunks in reading order, each
//! chunk carrying one embedding vector. It is rebuilt from scratch from a
//! [`DocumentSnapshot`] on every refresh and swapped in as a whole, the same
//! way the document cache is, so a search sees either the complete old index
//! or the complete new one.
//!
//! Search is brute-force cosine similarity over every chunk. The index is
//! sized for a folder of documents, not a corpus.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cache::DocumentSnapshot;
use crate::chunk::chunk_words;
use crate::config::ChunkingConfig;
use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::models::ChunkRecord;

/// A chunk returned by a similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSnippet {
    pub path: String,
    pub chunk_index: usize,
    pub score: f32,
    /// Chunk text formatted as `...{text}...`.
    pub snippet: String,
}

/// One complete, immutable index build.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    chunks: BTreeMap<String, Vec<ChunkRecord>>,
    /// Vector length shared by every chunk; 0 while empty.
    pub dims: usize,
    /// Generation of the document snapshot this was built from.
    pub generation: u64,
}

impl IndexSnapshot {
    /// Builds a snapshot from ready-made chunk records.
    ///
    /// Records whose vector length differs from the first record's are
    /// dropped.
    pub fn from_chunks(records: impl IntoIterator<Item = ChunkRecord>, generation: u64) -> Self {
        let mut snapshot = Self {
            generation,
            ..Self::default()
        };
        for record in records {
            snapshot.insert(record);
        }
        snapshot
    }

    fn insert(&mut self, record: ChunkRecord) -> bool {
        if record.embedding.is_empty() {
            return false;
        }
        if self.dims == 0 {
            self.dims = record.embedding.len();
        } else if record.embedding.len() != self.dims {
            return false;
        }
        self.chunks.entry(record.path.clone()).or_default().push(record);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }

    pub fn paths(&self) -> Vec<String> {
        self.chunks.keys().cloned().collect()
    }

    /// Chunks of one document in reading order.
    pub fn chunks_for(&self, path: &str) -> &[ChunkRecord] {
        self.chunks.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ranks every chunk against `query` by cosine similarity.
    ///
    /// Keeps scores strictly above `min_score`, so a chunk sharing nothing
    /// with the query (score 0) is never a hit. Sorts by descending score
    /// with ties broken by path then chunk position, and returns at most
    /// `top_k`.
    pub fn search(&self, query: &[f32], top_k: usize, min_score: f32) -> Vec<ScoredSnippet> {
        if top_k == 0 || query.len() != self.dims {
            return Vec::new();
        }

        let mut scored: Vec<ScoredSnippet> = self
            .chunks
            .values()
            .flatten()
            .filter_map(|chunk| {
                let score = cosine_similarity(query, &chunk.embedding);
                (score > min_score).then(|| ScoredSnippet {
                    path: chunk.path.clone(),
                    chunk_index: chunk.chunk_index,
                    score,
                    snippet: format!("...{}...", chunk.text.trim()),
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        scored.truncate(top_k);
        scored
    }
}

/// The process-wide chunk index.
pub struct EmbeddingIndex {
    current: RwLock<Arc<IndexSnapshot>>,
}

impl EmbeddingIndex {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(IndexSnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, snapshot: IndexSnapshot) -> Arc<IndexSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.clone();
        snapshot
    }

    pub fn chunk_count(&self) -> usize {
        self.snapshot().chunk_count()
    }

    /// Chunks and embeds every document, then swaps in the new index.
    ///
    /// A document whose embedding fails is left out of the new index. No lock
    /// is held while embedding.
    pub async fn rebuild(
        &self,
        documents: &DocumentSnapshot,
        provider: &dyn EmbeddingProvider,
        chunking: &ChunkingConfig,
        batch_size: usize,
    ) -> Arc<IndexSnapshot> {
        let batch_size = batch_size.max(1);
        let mut next = IndexSnapshot {
            generation: documents.generation,
            ..IndexSnapshot::default()
        };
        let mut failed_docs = 0usize;
        let mut dropped_chunks = 0usize;

        for (path, text) in documents.iter() {
            let texts = chunk_words(text, chunking.window_words, chunking.overlap_words);
            if texts.is_empty() {
                continue;
            }

            let vectors = match embed_in_batches(provider, &texts, batch_size).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(path, error = %e, "embedding failed, document left out of index");
                    failed_docs += 1;
                    continue;
                }
            };

            for (chunk_index, (text, embedding)) in texts.into_iter().zip(vectors).enumerate() {
                let record = ChunkRecord {
                    path: path.to_string(),
                    chunk_index,
                    text,
                    embedding,
                };
                if !next.insert(record) {
                    dropped_chunks += 1;
                }
            }
        }

        if dropped_chunks > 0 {
            warn!(
                dropped = dropped_chunks,
                dims = next.dims,
                "dropped chunks with mismatched embedding dimensions"
            );
        }

        let snapshot = self.replace(next);
        info!(
            files = snapshot.chunks.len(),
            chunks = snapshot.chunk_count(),
            failed = failed_docs,
            generation = snapshot.generation,
            "embedding index rebuilt"
        );
        snapshot
    }

    /// Embeds `text` and searches the current index.
    ///
    /// An empty index returns no results without calling the provider.
    pub async fn query(
        &self,
        text: &str,
        provider: &dyn EmbeddingProvider,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredSnippet>> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            debug!("embedding index empty, skipping semantic search");
            return Ok(Vec::new());
        }
        let query_vec = provider.embed_query(text).await?;
        Ok(snapshot.search(&query_vec, top_k, min_score))
    }
}

impl Default for EmbeddingIndex {
    fn default() -> Self {
        Self::new()
    }
}

async fn embed_in_batches(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size) {
        let vectors = provider.embed(batch).await?;
        if vectors.len() != batch.len() {
            anyhow::bail!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            );
        }
        out.extend(vectors);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use async_trait::async_trait;

    fn small_chunks() -> ChunkingConfig {
        ChunkingConfig {
            window_words: 4,
            overlap_words: 1,
        }
    }

    fn record(path: &str, chunk_index: usize, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            path: path.to_string(),
            chunk_index,
            text: format!("{} #{}", path, chunk_index),
            embedding,
        }
    }

    /// Fails for any batch containing the word "poison".
    struct FlakyProvider(HashingProvider);

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            self.0.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("poison")) {
                anyhow::bail!("provider unavailable");
            }
            self.0.embed(texts).await
        }
    }

    /// Refuses every call, to prove the provider was never reached.
    struct Unreachable;

    #[async_trait]
    impl EmbeddingProvider for Unreachable {
        fn model_name(&self) -> &str {
            "unreachable"
        }
        fn dims(&self) -> usize {
            0
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            panic!("provider must not be called");
        }
    }

    #[tokio::test]
    async fn fox_document_ranks_first() {
        let docs = DocumentSnapshot::from_documents([
            ("fox.txt", "The quick fox jumps. The fox is quick."),
            ("tax.txt", "Quarterly tax filing deadlines and forms."),
            ("garden.txt", "Tomatoes need sun and regular watering."),
        ]);
        let provider = HashingProvider::new(256);
        let index = EmbeddingIndex::new();
        index
            .rebuild(&docs, &provider, &ChunkingConfig::default(), 8)
            .await;

        let hits = index.query("fox", &provider, 3, 0.0).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].path, "fox.txt");
        assert_eq!(hits[0].snippet, "...The quick fox jumps. The fox is quick....");
    }

    #[tokio::test]
    async fn chunks_keep_reading_order() {
        let docs = DocumentSnapshot::from_documents([("a", "one two three four five six seven")]);
        let index = EmbeddingIndex::new();
        let snap = index
            .rebuild(&docs, &HashingProvider::new(32), &small_chunks(), 1)
            .await;
        let chunks = snap.chunks_for("a");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "one two three four");
        assert_eq!(chunks[1].text, "four five six seven");
        assert!(chunks.iter().enumerate().all(|(i, c)| c.chunk_index == i));
    }

    #[tokio::test]
    async fn failing_document_is_left_out() {
        let docs = DocumentSnapshot::from_documents([
            ("bad.txt", "this one is poison"),
            ("good.txt", "this one is fine"),
        ]);
        let index = EmbeddingIndex::new();
        let snap = index
            .rebuild(&docs, &FlakyProvider(HashingProvider::new(32)), &small_chunks(), 4)
            .await;
        assert_eq!(snap.paths(), vec!["good.txt"]);
    }

    #[tokio::test]
    async fn empty_index_skips_provider() {
        let index = EmbeddingIndex::new();
        let hits = index.query("anything", &Unreachable, 3, 0.0).await.unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn mismatched_dimensions_are_dropped() {
        let snap = IndexSnapshot::from_chunks(
            vec![
                record("a", 0, vec![1.0, 0.0]),
                record("a", 1, vec![1.0, 0.0, 0.0]),
                record("b", 0, vec![0.0, 1.0]),
            ],
            1,
        );
        assert_eq!(snap.dims, 2);
        assert_eq!(snap.chunk_count(), 2);
    }

    #[test]
    fn results_sorted_with_deterministic_ties() {
        let snap = IndexSnapshot::from_chunks(
            vec![
                record("b", 0, vec![1.0, 0.0]),
                record("a", 1, vec![1.0, 0.0]),
                record("a", 0, vec![1.0, 0.0]),
                record("c", 0, vec![0.6, 0.8]),
                record("d", 0, vec![-1.0, 0.0]),
            ],
            1,
        );
        let hits = snap.search(&[1.0, 0.0], 10, 0.0);
        let order: Vec<(&str, usize)> = hits.iter().map(|h| (h.path.as_str(), h.chunk_index)).collect();
        assert_eq!(order, vec![("a", 0), ("a", 1), ("b", 0), ("c", 0)]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

        let orthogonal = snap.search(&[0.0, 1.0], 10, 0.0);
        let order: Vec<&str> = orthogonal.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(order, vec!["c"]);

        let top2 = snap.search(&[1.0, 0.0], 2, 0.0);
        assert_eq!(top2.len(), 2);
        assert_eq!(top2[1].path, "a");
    }

    #[test]
    fn scores_never_increase_down_the_list() {
        let provider = HashingProvider::new(16);
        let words = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta"];
        let records: Vec<ChunkRecord> = (0..40)
            .map(|i| {
                let text = format!("{} {} {}", words[i % 7], words[(i * 3) % 7], words[(i * 5 + 1) % 7]);
                ChunkRecord {
                    path: format!("doc{:02}", i / 4),
                    chunk_index: i % 4,
                    embedding: provider.embed_one(&text),
                    text,
                }
            })
            .collect();
        let snap = IndexSnapshot::from_chunks(records, 1);
        for q in words {
            let hits = snap.search(&provider.embed_one(q), 40, -1.0);
            assert!(hits.windows(2).all(|w| w[0].score >= w[1].score), "query {}", q);
            assert_eq!(hits, snap.search(&provider.embed_one(q), 40, -1.0));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn searches_see_whole_old_or_whole_new_index() {
        let old_docs = DocumentSnapshot::from_documents(
            (0..20).map(|i| (format!("old{:02}", i), format!("shared marker old generation text {}", i))),
        );
        let new_docs = DocumentSnapshot::from_documents(
            (0..20).map(|i| (format!("new{:02}", i), format!("shared marker new generation text {}", i))),
        );
        let index = Arc::new(EmbeddingIndex::new());
        let provider = Arc::new(HashingProvider::new(64));
        index
            .rebuild(&old_docs, provider.as_ref(), &ChunkingConfig::default(), 4)
            .await;

        let writer = {
            let index = index.clone();
            let provider = provider.clone();
            tokio::spawn(async move {
                for round in 0..30 {
                    let docs = if round % 2 == 0 { &new_docs } else { &old_docs };
                    index
                        .rebuild(docs, provider.as_ref(), &ChunkingConfig::default(), 4)
                        .await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let index = index.clone();
            let provider = provider.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let hits = index.query("shared marker", provider.as_ref(), 40, -1.0).await.unwrap();
                    assert_eq!(hits.len(), 20);
                    let olds = hits.iter().filter(|h| h.path.starts_with("old")).count();
                    assert!(olds == 0 || olds == hits.len(), "mixed generations: {} old", olds);
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for r in readers {
            r.await.unwrap();
        }
    }
}
