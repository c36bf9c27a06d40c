//! Semantic query: embed the question, rank chunks from the committed
//! index, and synthesize a cited prose answer with the generative model.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::embedder::Embedder;
use crate::error::Result;
use quarry_llm::provider::Message;
use quarry_llm::LlmProvider;
use quarry_store::chunk_store::{ChunkHit, ChunkStore, SearchOutcome};
use quarry_store::RepoId;

/// Best-similarity thresholds for answer confidence.
const HIGH_CONFIDENCE: f32 = 0.8;
const MEDIUM_CONFIDENCE: f32 = 0.6;

const SYSTEM_PROMPT: &str = "You are a code analysis assistant. Answer questions about the \
    repository using only the provided code context. Write plain prose for a business \
    audience: no code snippets, no markdown. Refer to code by file path and line range. \
    If the context does not contain the answer, say so plainly.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => f.write_str("high"),
            Self::Medium => f.write_str("medium"),
            Self::Low => f.write_str("low"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Chunks to retrieve; 0 means the default (10), capped at 50.
    pub top_k: usize,
    /// Restrict retrieval to one language identifier.
    pub language: Option<String>,
}

/// A cited code location backing the answer, in prompt order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub confidence: Confidence,
    pub sources: Vec<SourceRef>,
    pub processing_time_ms: u64,
}

/// Answers natural-language questions against an indexed repository.
pub struct QueryEngine<P> {
    store: ChunkStore,
    embedder: Embedder<P>,
    provider: Arc<P>,
}

impl<P> Clone for QueryEngine<P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            embedder: self.embedder.clone(),
            provider: Arc::clone(&self.provider),
        }
    }
}

impl<P> std::fmt::Debug for QueryEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine").finish_non_exhaustive()
    }
}

/// Derive confidence from the single best similarity score.
#[must_use]
pub fn confidence_for(best_similarity: Option<f32>) -> Confidence {
    match best_similarity {
        Some(s) if s >= HIGH_CONFIDENCE => Confidence::High,
        Some(s) if s >= MEDIUM_CONFIDENCE => Confidence::Medium,
        _ => Confidence::Low,
    }
}

/// Format retrieved chunks plus the question into the grounding prompt.
#[must_use]
pub fn build_prompt(repo: &RepoId, question: &str, hits: &[ChunkHit]) -> String {
    let mut prompt = format!(
        "Question about the {}/{} repository (branch {}):\n\n<code_context>\n",
        repo.owner, repo.name, repo.branch
    );

    for hit in hits {
        let symbol = hit.symbol_name.as_deref().unwrap_or("-");
        let _ = writeln!(
            prompt,
            "  <chunk file=\"{}\" lines=\"{}-{}\" symbol=\"{symbol}\" similarity=\"{:.2}\">",
            hit.file_path, hit.start_line, hit.end_line, hit.similarity,
        );
        prompt.push_str(&hit.text);
        prompt.push_str("\n  </chunk>\n");
    }

    prompt.push_str("</code_context>\n\nQuestion: ");
    prompt.push_str(question);
    prompt.push_str("\n\nAnswer in plain prose, citing files by path and line range.");
    prompt
}

impl<P: LlmProvider> QueryEngine<P> {
    #[must_use]
    pub fn new(store: ChunkStore, embedder: Embedder<P>, provider: Arc<P>) -> Self {
        Self {
            store,
            embedder,
            provider,
        }
    }

    /// Answer a question about a repository.
    ///
    /// An unindexed repository or an empty match set yields a low-confidence
    /// explicit answer without calling the generative model — never an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding service, vector store, or
    /// generative model fails.
    pub async fn query(
        &self,
        question: &str,
        repo: &RepoId,
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        let started = Instant::now();

        let query_vector = self.embedder.embed_query(question).await?;
        let outcome = self
            .store
            .search(
                repo,
                query_vector,
                options.top_k,
                options.language.as_deref(),
            )
            .await?;

        let hits = match outcome {
            SearchOutcome::NotIndexed => {
                tracing::debug!(repo = %repo, "query against unindexed repository");
                return Ok(QueryResult {
                    answer: format!(
                        "The repository {repo} has not been indexed yet, so there is no code \
                         to search. Start an index run and ask again once it completes."
                    ),
                    confidence: Confidence::Low,
                    sources: vec![],
                    processing_time_ms: elapsed_ms(started),
                });
            }
            SearchOutcome::Hits(hits) if hits.is_empty() => {
                return Ok(QueryResult {
                    answer: format!(
                        "No relevant code was found in {repo} for this question. Try \
                         rephrasing it or broadening the language filter."
                    ),
                    confidence: Confidence::Low,
                    sources: vec![],
                    processing_time_ms: elapsed_ms(started),
                });
            }
            SearchOutcome::Hits(hits) => hits,
        };

        let best = hits.first().map(|h| h.similarity);
        let prompt = build_prompt(repo, question, &hits);
        let messages = [Message::system(SYSTEM_PROMPT), Message::user(prompt)];
        let answer = self.provider.chat(&messages).await?;

        let sources = hits
            .iter()
            .map(|h| SourceRef {
                file_path: h.file_path.clone(),
                start_line: h.start_line,
                end_line: h.end_line,
                similarity: h.similarity,
            })
            .collect();

        Ok(QueryResult {
            answer,
            confidence: confidence_for(best),
            sources,
            processing_time_ms: elapsed_ms(started),
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_llm::mock::MockProvider;
    use quarry_store::chunk_store::ChunkRecord;
    use quarry_store::in_memory_store::InMemoryVectorStore;
    use quarry_store::sqlite::open_pool;

    fn repo() -> RepoId {
        RepoId::new("acme", "widgets", None)
    }

    fn hit(path: &str, similarity: f32) -> ChunkHit {
        ChunkHit {
            file_path: path.to_owned(),
            language: "rust".to_owned(),
            symbol_name: Some("handler".to_owned()),
            start_line: 10,
            end_line: 24,
            text: "fn handler() {}".to_owned(),
            similarity,
        }
    }

    async fn engine(provider: MockProvider) -> (QueryEngine<MockProvider>, ChunkStore) {
        let pool = open_pool(":memory:").await.unwrap();
        let store = ChunkStore::new(std::sync::Arc::new(InMemoryVectorStore::new()), pool);
        store.ensure_collection(16).await.unwrap();
        let provider = Arc::new(provider);
        let embedder = Embedder::new(Arc::clone(&provider), crate::embedder::EmbedderConfig::default());
        (
            QueryEngine::new(store.clone(), embedder, provider),
            store,
        )
    }

    async fn seed(store: &ChunkStore, repo: &RepoId, records: Vec<(ChunkRecord, Vec<f32>)>) {
        let generation = store.begin_generation(repo).await.unwrap();
        store.upsert_chunks(repo, generation, records).await.unwrap();
        store.commit_generation(repo, generation).await.unwrap();
    }

    fn record(path: &str, text: &str) -> ChunkRecord {
        ChunkRecord {
            file_path: path.to_owned(),
            language: "rust".to_owned(),
            symbol_name: Some("item".to_owned()),
            start_line: 1,
            end_line: 5,
            text: text.to_owned(),
            imports_context: String::new(),
            token_count: 10,
            content_hash: format!("hash-{path}"),
        }
    }

    #[test]
    fn confidence_thresholds() {
        assert_eq!(confidence_for(Some(0.95)), Confidence::High);
        assert_eq!(confidence_for(Some(0.8)), Confidence::High);
        assert_eq!(confidence_for(Some(0.79)), Confidence::Medium);
        assert_eq!(confidence_for(Some(0.6)), Confidence::Medium);
        assert_eq!(confidence_for(Some(0.59)), Confidence::Low);
        assert_eq!(confidence_for(None), Confidence::Low);
    }

    #[test]
    fn prompt_labels_chunks() {
        let prompt = build_prompt(
            &repo(),
            "where is the request handled?",
            &[hit("src/server.rs", 0.91)],
        );
        assert!(prompt.contains("acme/widgets"));
        assert!(prompt.contains("file=\"src/server.rs\""));
        assert!(prompt.contains("lines=\"10-24\""));
        assert!(prompt.contains("symbol=\"handler\""));
        assert!(prompt.contains("similarity=\"0.91\""));
        assert!(prompt.contains("fn handler() {}"));
        assert!(prompt.contains("Question: where is the request handled?"));
    }

    #[test]
    fn prompt_missing_symbol_uses_dash() {
        let mut h = hit("src/server.rs", 0.5);
        h.symbol_name = None;
        let prompt = build_prompt(&repo(), "q", &[h]);
        assert!(prompt.contains("symbol=\"-\""));
    }

    #[tokio::test]
    async fn unindexed_repository_low_confidence_no_model_call() {
        let provider = MockProvider::default();
        let (engine, _store) = engine(provider.clone()).await;

        let result = engine
            .query("how does auth work?", &repo(), &QueryOptions::default())
            .await
            .unwrap();

        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.answer.contains("has not been indexed"));
        assert!(result.sources.is_empty());
        assert_eq!(provider.chat_calls(), 0, "generative call must be skipped");
    }

    #[tokio::test]
    async fn answer_with_sources_and_confidence() {
        let provider = MockProvider::with_responses(vec![
            "Addition lives in the add function.".to_owned(),
        ])
            .with_embedding_fn(|text| {
                if text.contains("add") {
                    vec![1.0, 0.0]
                } else {
                    vec![0.0, 1.0]
                }
            });
        let (engine, store) = engine(provider.clone()).await;
        let r = repo();

        seed(
            &store,
            &r,
            vec![
                (record("src/math.rs", "fn add(a, b) { a + b }"), vec![1.0, 0.0]),
                (record("src/other.rs", "fn noop() {}"), vec![0.0, 1.0]),
            ],
        )
        .await;

        let result = engine
            .query("how do I add numbers?", &r, &QueryOptions::default())
            .await
            .unwrap();

        assert_eq!(result.answer, "Addition lives in the add function.");
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.sources[0].file_path, "src/math.rs");
        assert!((result.sources[0].similarity - 1.0).abs() < 1e-5);
        assert_eq!(provider.chat_calls(), 1);
    }

    #[tokio::test]
    async fn language_filter_passes_through() {
        let provider = MockProvider::default().with_embedding_fn(|_| vec![1.0, 0.0]);
        let (engine, store) = engine(provider.clone()).await;
        let r = repo();

        let mut python = record("app.py", "def add(a, b): return a + b");
        python.language = "python".to_owned();
        seed(
            &store,
            &r,
            vec![
                (record("src/math.rs", "fn add() {}"), vec![1.0, 0.0]),
                (python, vec![1.0, 0.0]),
            ],
        )
        .await;

        let options = QueryOptions {
            top_k: 10,
            language: Some("python".to_owned()),
        };
        let result = engine.query("add numbers", &r, &options).await.unwrap();
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.sources[0].file_path, "app.py");
    }

    #[tokio::test]
    async fn processing_time_recorded() {
        let provider = MockProvider::default();
        let (engine, _store) = engine(provider).await;
        let result = engine
            .query("anything", &repo(), &QueryOptions::default())
            .await
            .unwrap();
        // Sub-millisecond runs legitimately report 0; just confirm the field
        // is populated without panicking.
        assert!(result.processing_time_ms < 10_000);
    }
}
