//! Chunk and query embedding with content-addressed caching, request
//! batching, and per-item failure isolation.
//!
//! Embedding raw code alone gives poor retrieval quality. Prepending file
//! path, language tag, and trimmed imports noticeably improves results for
//! conceptual queries like "where is auth handled?", and doubles as the
//! cache key text.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use moka::sync::Cache;

use crate::chunker::CodeChunk;
use quarry_llm::{LlmError, LlmProvider};
use quarry_store::estimate_tokens;

/// Maximum number of import lines included in the embedding text.
const MAX_IMPORT_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    /// Texts per embedding service call (the service amortizes cost across
    /// a batch; useful range roughly 20–100).
    pub batch_size: usize,
    /// Entry cap for the embedding cache; least-recently-used entries are
    /// evicted beyond it.
    pub cache_capacity: u64,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            cache_capacity: 50_000,
        }
    }
}

#[derive(Debug, Default)]
struct EmbedCounters {
    service_calls: AtomicU64,
    cache_hits: AtomicU64,
    texts_embedded: AtomicU64,
    failed_items: AtomicU64,
    estimated_tokens: AtomicU64,
}

/// Point-in-time view of the embedder's cost counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbedStats {
    pub service_calls: u64,
    pub cache_hits: u64,
    pub texts_embedded: u64,
    pub failed_items: u64,
    pub estimated_tokens: u64,
}

impl EmbedStats {
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.texts_embedded;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }
}

/// Generate text optimized for embedding (not for display).
#[must_use]
pub fn contextualize(chunk: &CodeChunk) -> String {
    let mut text = String::with_capacity(chunk.text.len() + 256);

    text.push_str("# ");
    text.push_str(&chunk.file_path);
    text.push('\n');

    if let Some(ref symbol) = chunk.symbol_name {
        text.push_str("# Symbol: ");
        text.push_str(symbol);
        text.push('\n');
    }

    text.push_str("# Language: ");
    text.push_str(chunk.language.id());
    text.push('\n');

    if !chunk.imports_context.is_empty() {
        let trimmed: String = chunk
            .imports_context
            .lines()
            .take(MAX_IMPORT_LINES)
            .collect::<Vec<_>>()
            .join("\n");
        text.push_str(&trimmed);
        text.push('\n');
    }

    text.push_str(&chunk.text);
    text
}

/// Embeds chunk and query texts through an [`LlmProvider`], deduplicating
/// identical text across files and repositories via a bounded cache.
pub struct Embedder<P> {
    provider: Arc<P>,
    cache: Cache<String, Arc<Vec<f32>>>,
    config: EmbedderConfig,
    counters: Arc<EmbedCounters>,
}

impl<P> Clone for Embedder<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            cache: self.cache.clone(),
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<P> std::fmt::Debug for Embedder<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("config", &self.config)
            .field("cached_entries", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider> Embedder<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, config: EmbedderConfig) -> Self {
        let cache = Cache::new(config.cache_capacity);
        Self {
            provider,
            cache,
            config,
            counters: Arc::new(EmbedCounters::default()),
        }
    }

    fn cache_key(&self, input: &str) -> String {
        let hash = blake3::hash(input.as_bytes()).to_hex();
        format!("{hash}:{}", self.provider.embedding_model())
    }

    /// Embed chunks, returning one vector per chunk in input order.
    ///
    /// Cached texts cost nothing. Uncached texts go out in batches; a failing
    /// batch retries with halved size to isolate the offending item, and an
    /// item that still fails alone is returned as `None` (unembeddable)
    /// rather than failing the run.
    ///
    /// # Errors
    ///
    /// Transient embedding failures never surface here (they degrade to
    /// `None` items); only configuration-class errors — missing credentials,
    /// embeddings unsupported — propagate, since retrying cannot fix them.
    pub async fn embed_chunks(
        &self,
        chunks: &[CodeChunk],
    ) -> Result<Vec<Option<Vec<f32>>>, LlmError> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; chunks.len()];
        // key -> indices awaiting that vector (first index owns the fetch).
        let mut pending: HashMap<String, Vec<usize>> = HashMap::new();
        let mut to_embed: Vec<(String, String)> = Vec::new();

        for (i, chunk) in chunks.iter().enumerate() {
            let input = contextualize(chunk);
            let key = self.cache_key(&input);
            if let Some(hit) = self.cache.get(&key) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                results[i] = Some((*hit).clone());
            } else if let Some(waiting) = pending.get_mut(&key) {
                // Duplicate text within this run: one fetch serves all.
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                waiting.push(i);
            } else {
                pending.insert(key.clone(), vec![i]);
                to_embed.push((key, input));
            }
        }

        if to_embed.is_empty() {
            return Ok(results);
        }

        let batch_size = self.config.batch_size.max(1);
        let mut queue: VecDeque<Vec<(String, String)>> = to_embed
            .chunks(batch_size)
            .map(<[(String, String)]>::to_vec)
            .collect();

        while let Some(batch) = queue.pop_front() {
            let inputs: Vec<String> = batch.iter().map(|(_, input)| input.clone()).collect();
            self.counters.service_calls.fetch_add(1, Ordering::Relaxed);

            match self.provider.embed_batch(&inputs).await {
                Ok(vectors) => {
                    for ((key, input), vector) in batch.into_iter().zip(vectors) {
                        let tokens = estimate_tokens(&input) as u64;
                        self.counters
                            .estimated_tokens
                            .fetch_add(tokens, Ordering::Relaxed);
                        self.counters.texts_embedded.fetch_add(1, Ordering::Relaxed);
                        let vector = Arc::new(vector);
                        self.cache.insert(key.clone(), Arc::clone(&vector));
                        if let Some(indices) = pending.get(&key) {
                            for &i in indices {
                                results[i] = Some((*vector).clone());
                            }
                        }
                    }
                }
                Err(
                    e @ (LlmError::MissingCredentials(_) | LlmError::EmbedUnsupported { .. }),
                ) => return Err(e),
                Err(e) if batch.len() == 1 => {
                    tracing::warn!("marking item unembeddable after retries: {e}");
                    self.counters.failed_items.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let mid = batch.len() / 2;
                    tracing::warn!(
                        "embedding batch of {} failed ({e}), splitting in half",
                        batch.len()
                    );
                    let (left, right) = batch.split_at(mid);
                    queue.push_front(right.to_vec());
                    queue.push_front(left.to_vec());
                }
            }
        }

        Ok(results)
    }

    /// Embed a single query text, using the same cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding service fails; a query has no
    /// skip-and-continue fallback.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let key = self.cache_key(text);
        if let Some(hit) = self.cache.get(&key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((*hit).clone());
        }

        self.counters.service_calls.fetch_add(1, Ordering::Relaxed);
        let vector = self.provider.embed(text).await?;
        self.counters
            .estimated_tokens
            .fetch_add(estimate_tokens(text) as u64, Ordering::Relaxed);
        self.counters.texts_embedded.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(key, Arc::new(vector.clone()));
        Ok(vector)
    }

    #[must_use]
    pub fn stats(&self) -> EmbedStats {
        EmbedStats {
            service_calls: self.counters.service_calls.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            texts_embedded: self.counters.texts_embedded.load(Ordering::Relaxed),
            failed_items: self.counters.failed_items.load(Ordering::Relaxed),
            estimated_tokens: self.counters.estimated_tokens.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::Lang;
    use quarry_llm::mock::MockProvider;

    fn chunk(path: &str, text: &str) -> CodeChunk {
        CodeChunk {
            file_path: path.to_owned(),
            language: Lang::Rust,
            symbol_name: Some("item".to_owned()),
            start_line: 1,
            end_line: 3,
            text: text.to_owned(),
            imports_context: "use std::io;\n".to_owned(),
            token_count: estimate_tokens(text),
            content_hash: blake3::hash(text.as_bytes()).to_hex().to_string(),
        }
    }

    fn embedder(provider: MockProvider) -> Embedder<MockProvider> {
        Embedder::new(Arc::new(provider), EmbedderConfig::default())
    }

    #[test]
    fn contextualize_includes_metadata() {
        let c = chunk("src/lib.rs", "fn hello() {}");
        let text = contextualize(&c);
        assert!(text.contains("# src/lib.rs"));
        assert!(text.contains("# Symbol: item"));
        assert!(text.contains("# Language: rust"));
        assert!(text.contains("use std::io;"));
        assert!(text.contains("fn hello() {}"));
    }

    #[test]
    fn contextualize_trims_imports() {
        let mut c = chunk("src/lib.rs", "fn f() {}");
        c.imports_context = (0..10)
            .map(|i| format!("use dep_{i};"))
            .collect::<Vec<_>>()
            .join("\n");
        let text = contextualize(&c);
        let import_lines = text.lines().filter(|l| l.starts_with("use ")).count();
        assert_eq!(import_lines, MAX_IMPORT_LINES);
    }

    #[tokio::test]
    async fn identical_text_one_call_two_hits() {
        let provider = MockProvider::default();
        let e = embedder(provider.clone());

        // Same content twice in one run, then once more: one service call,
        // the duplicate and the re-run are both cache hits.
        let a = chunk("src/a.rs", "fn add(a, b) { a + b }");
        let results = e.embed_chunks(&[a.clone(), a.clone()]).await.unwrap();
        assert!(results.iter().all(Option::is_some));

        let results = e.embed_chunks(&[a]).await.unwrap();
        assert!(results[0].is_some());

        let stats = e.stats();
        assert_eq!(provider.embed_calls(), 1);
        assert_eq!(stats.service_calls, 1);
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.texts_embedded, 1);
    }

    #[tokio::test]
    async fn halved_batches_isolate_poisoned_item() {
        let provider = MockProvider::default().with_poison("POISON");
        let e = embedder(provider.clone());

        let chunks = vec![
            chunk("src/a.rs", "fn a() {}"),
            chunk("src/b.rs", "fn b() { POISON }"),
            chunk("src/c.rs", "fn c() {}"),
            chunk("src/d.rs", "fn d() {}"),
        ];
        let results = e.embed_chunks(&chunks).await.unwrap();

        assert!(results[0].is_some());
        assert!(results[1].is_none(), "poisoned item must be excluded");
        assert!(results[2].is_some());
        assert!(results[3].is_some());

        let stats = e.stats();
        assert_eq!(stats.failed_items, 1);
        assert_eq!(stats.texts_embedded, 3);
        assert!(stats.service_calls > 1, "halving requires extra calls");
    }

    #[tokio::test]
    async fn batches_split_by_configured_size() {
        let provider = MockProvider::default();
        let e = Embedder::new(
            Arc::new(provider.clone()),
            EmbedderConfig {
                batch_size: 2,
                cache_capacity: 100,
            },
        );

        let chunks: Vec<CodeChunk> = (0..5)
            .map(|i| chunk(&format!("src/f{i}.rs"), &format!("fn f{i}() {{}}")))
            .collect();
        let results = e.embed_chunks(&chunks).await.unwrap();
        assert!(results.iter().all(Option::is_some));
        // 5 texts at batch size 2 -> 3 calls.
        assert_eq!(provider.embed_calls(), 3);
    }

    #[tokio::test]
    async fn query_embedding_cached() {
        let provider = MockProvider::default();
        let e = embedder(provider.clone());

        let first = e.embed_query("how does auth work").await.unwrap();
        let second = e.embed_query("how does auth work").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.embed_calls(), 1);
        assert_eq!(e.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn empty_input_no_calls() {
        let provider = MockProvider::default();
        let e = embedder(provider.clone());
        let results = e.embed_chunks(&[]).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(provider.embed_calls(), 0);
    }
}
