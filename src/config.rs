//! Configuration: `quarry.toml` with environment variable overrides.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub host: HostConfig,
    pub llm: LlmConfig,
    pub store: StoreConfig,
    pub index: IndexConfig,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    pub base_url: String,
    /// Environment variable holding the code-host token; optional at runtime
    /// (anonymous access works for public repositories).
    pub token_env: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_owned(),
            token_env: "GITHUB_TOKEN".to_owned(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub max_tokens: u32,
    /// Environment variable holding the API key; required.
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_owned(),
            chat_model: "gpt-4o-mini".to_owned(),
            embedding_model: "text-embedding-3-small".to_owned(),
            max_tokens: 1024,
            api_key_env: "OPENAI_API_KEY".to_owned(),
        }
    }
}

/// Vector store backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Qdrant,
    Memory,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub qdrant_url: String,
    pub sqlite_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Qdrant,
            qdrant_url: "http://localhost:6334".to_owned(),
            sqlite_path: "quarry.db".to_owned(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexConfig {
    pub max_file_size: u64,
    pub max_concurrent_fetches: usize,
    pub embed_batch_size: usize,
    pub embed_cache_capacity: u64,
    pub max_concurrent_jobs: usize,
    pub chunk_min_tokens: usize,
    pub chunk_max_tokens: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_file_size: 500_000,
            max_concurrent_fetches: 8,
            embed_batch_size: 64,
            embed_cache_capacity: 50_000,
            max_concurrent_jobs: 2,
            chunk_min_tokens: 30,
            chunk_max_tokens: 480,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_HOST_BASE_URL") {
            self.host.base_url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_CHAT_MODEL") {
            self.llm.chat_model = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Ok(v) = std::env::var("QUARRY_STORE_BACKEND") {
            match v.as_str() {
                "qdrant" => self.store.backend = StoreBackend::Qdrant,
                "memory" => self.store.backend = StoreBackend::Memory,
                other => tracing::warn!("ignoring invalid QUARRY_STORE_BACKEND value: {other}"),
            }
        }
        if let Ok(v) = std::env::var("QUARRY_QDRANT_URL") {
            self.store.qdrant_url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_SQLITE_PATH") {
            self.store.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("QUARRY_EMBED_BATCH_SIZE")
            && let Ok(size) = v.parse::<usize>()
        {
            self.index.embed_batch_size = size;
        }
        if let Ok(v) = std::env::var("QUARRY_MAX_CONCURRENT_JOBS")
            && let Ok(jobs) = v.parse::<usize>()
        {
            self.index.max_concurrent_jobs = jobs;
        }
    }
}
