//! Bootstrap: build the provider, stores, indexer, and query engine from
//! configuration.

use std::sync::Arc;

use anyhow::Context;

use crate::config::{Config, StoreBackend};
use quarry_index::chunker::ChunkerConfig;
use quarry_index::collector::{Collector, CollectorConfig};
use quarry_index::embedder::{Embedder, EmbedderConfig};
use quarry_index::host::{CodeHost, GithubHost};
use quarry_index::indexer::{Indexer, IndexerConfig};
use quarry_index::query::QueryEngine;
use quarry_llm::openai::OpenAiProvider;
use quarry_store::chunk_store::ChunkStore;
use quarry_store::in_memory_store::InMemoryVectorStore;
use quarry_store::qdrant::QdrantStore;
use quarry_store::vector_store::VectorStore;

pub struct App {
    pub indexer: Indexer<OpenAiProvider>,
    pub query: QueryEngine<OpenAiProvider>,
}

/// Wire up the full pipeline.
///
/// # Errors
///
/// Fails fast on missing credentials or an unreachable store; these are
/// configuration errors and are never retried.
pub async fn build(config: &Config) -> anyhow::Result<App> {
    let api_key = std::env::var(&config.llm.api_key_env).with_context(|| {
        format!(
            "missing credentials: {} is not set in the environment",
            config.llm.api_key_env
        )
    })?;
    let provider = Arc::new(OpenAiProvider::new(
        api_key,
        config.llm.base_url.clone(),
        config.llm.chat_model.clone(),
        config.llm.embedding_model.clone(),
        config.llm.max_tokens,
    ));

    let token = std::env::var(&config.host.token_env).ok();
    if token.is_none() {
        tracing::debug!(
            "{} not set; using anonymous code-host access",
            config.host.token_env
        );
    }
    let host: Arc<dyn CodeHost> = Arc::new(GithubHost::with_base_url(
        config.host.base_url.clone(),
        token,
    ));

    let vector: Arc<dyn VectorStore> = match config.store.backend {
        StoreBackend::Qdrant => Arc::new(
            QdrantStore::new(&config.store.qdrant_url).context("failed to connect to Qdrant")?,
        ),
        StoreBackend::Memory => Arc::new(InMemoryVectorStore::new()),
    };
    let pool = quarry_store::sqlite::open_pool(&config.store.sqlite_path)
        .await
        .context("failed to open metadata database")?;
    let store = ChunkStore::new(vector, pool);

    let recovered = store.recover_stale_jobs().await?;
    if recovered > 0 {
        tracing::warn!("marked {recovered} interrupted index jobs as failed");
    }

    let collector = Collector::new(
        host,
        CollectorConfig {
            max_file_size: config.index.max_file_size,
            max_concurrent_fetches: config.index.max_concurrent_fetches,
        },
    );
    let embedder = Embedder::new(
        Arc::clone(&provider),
        EmbedderConfig {
            batch_size: config.index.embed_batch_size,
            cache_capacity: config.index.embed_cache_capacity,
        },
    );
    let indexer = Indexer::new(
        collector,
        embedder.clone(),
        store.clone(),
        IndexerConfig {
            chunker: ChunkerConfig {
                min_tokens: config.index.chunk_min_tokens,
                max_tokens: config.index.chunk_max_tokens,
                ..ChunkerConfig::default()
            },
            max_concurrent_jobs: config.index.max_concurrent_jobs,
        },
    );
    let query = QueryEngine::new(store, embedder, provider);

    Ok(App { indexer, query })
}
