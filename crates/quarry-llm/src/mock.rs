//! Test-only mock provider for the embedding and generative services.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::LlmError;
use crate::provider::{LlmProvider, Message};

type EmbedFn = dyn Fn(&str) -> Vec<f32> + Send + Sync;

const MOCK_DIMENSIONS: usize = 16;

/// Deterministic bag-of-words embedding: each token hashes to a dimension
/// bucket, counts are L2-normalized. Identical text always yields an
/// identical vector; texts sharing tokens score higher cosine similarity.
#[must_use]
pub fn hash_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0_f32; MOCK_DIMENSIONS];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
    {
        let bucket = token
            .bytes()
            .fold(0_usize, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(usize::from(b))
            })
            % MOCK_DIMENSIONS;
        vector[bucket] += 1.0;
    }
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

#[derive(Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<String>>>,
    pub default_response: String,
    embed_fn: Arc<EmbedFn>,
    /// Inputs containing this marker make embedding calls fail, for
    /// exercising partial-failure isolation.
    pub poison: Option<String>,
    pub fail_chat: bool,
    chat_calls: Arc<AtomicUsize>,
    embed_calls: Arc<AtomicUsize>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            default_response: "mock response".into(),
            embed_fn: Arc::new(hash_embedding),
            poison: None,
            fail_chat: false,
            chat_calls: Arc::new(AtomicUsize::new(0)),
            embed_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("default_response", &self.default_response)
            .field("poison", &self.poison)
            .field("fail_chat", &self.fail_chat)
            .finish_non_exhaustive()
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_chat: true,
            ..Self::default()
        }
    }

    /// Replace the embedding function, e.g. to pin texts to fixed axes so
    /// retrieval order is fully controlled by the test.
    #[must_use]
    pub fn with_embedding_fn(
        mut self,
        f: impl Fn(&str) -> Vec<f32> + Send + Sync + 'static,
    ) -> Self {
        self.embed_fn = Arc::new(f);
        self
    }

    #[must_use]
    pub fn with_poison(mut self, marker: impl Into<String>) -> Self {
        self.poison = Some(marker.into());
        self
    }

    #[must_use]
    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::Relaxed)
    }

    /// Number of embedding service calls (batch and single combined).
    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::Relaxed)
    }

    fn check_poison(&self, text: &str) -> Result<(), LlmError> {
        if let Some(ref marker) = self.poison
            && text.contains(marker.as_str())
        {
            return Err(LlmError::Other("mock embedding failure".into()));
        }
        Ok(())
    }
}

impl LlmProvider for MockProvider {
    async fn chat(&self, _messages: &[Message]) -> Result<String, LlmError> {
        self.chat_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_chat {
            return Err(LlmError::Other("mock LLM error".into()));
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(self.default_response.clone())
        } else {
            Ok(responses.remove(0))
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::Relaxed);
        self.check_poison(text)?;
        Ok((self.embed_fn)(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::Relaxed);
        for text in texts {
            self.check_poison(text)?;
        }
        Ok(texts.iter().map(|t| (self.embed_fn)(t)).collect())
    }

    fn supports_embeddings(&self) -> bool {
        true
    }

    fn embedding_model(&self) -> &str {
        "mock-embedding"
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
