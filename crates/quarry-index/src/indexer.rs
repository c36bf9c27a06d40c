//! Indexing orchestrator: collect → chunk → embed → store per repository,
//! one job per repository at a time, with progress published on a broadcast
//! channel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::broadcast;

use crate::chunker::{self, ChunkerConfig, CodeChunk};
use crate::collector::Collector;
use crate::embedder::{EmbedStats, Embedder};
use crate::error::{IndexError, Result};
use quarry_llm::LlmProvider;
use quarry_store::chunk_store::{ChunkRecord, ChunkStore, RepoSummary};
use quarry_store::{IndexJob, JobState, RepoId};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Progress event published during an index run. Subscribers (a UI, a log
/// sink) attach via [`Indexer::subscribe`]; the pipeline itself has no
/// presentation dependency.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    Started {
        repository: String,
    },
    Stage {
        repository: String,
        state: JobState,
    },
    FileProcessed {
        repository: String,
        files_processed: u64,
        files_total: u64,
    },
    Completed {
        repository: String,
        chunks_written: u64,
    },
    Failed {
        repository: String,
        error: String,
    },
}

/// Outcome of a non-blocking start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted,
    AlreadyInProgress,
}

/// Summary of an indexing run.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub files_listed: usize,
    pub files_indexed: usize,
    pub chunks_created: usize,
    pub chunks_embedded: usize,
    pub chunks_failed: usize,
    pub chunks_written: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub chunker: ChunkerConfig,
    /// Concurrent jobs in a batch; composes with the collector's and
    /// embedder's own caps rather than multiplying external pressure.
    pub max_concurrent_jobs: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            max_concurrent_jobs: 2,
        }
    }
}

/// Drives the indexing pipeline end to end per repository.
pub struct Indexer<P> {
    collector: Collector,
    embedder: Embedder<P>,
    store: ChunkStore,
    config: IndexerConfig,
    active: Arc<Mutex<HashSet<String>>>,
    events: broadcast::Sender<IndexEvent>,
}

impl<P> Clone for Indexer<P> {
    fn clone(&self) -> Self {
        Self {
            collector: self.collector.clone(),
            embedder: self.embedder.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            active: Arc::clone(&self.active),
            events: self.events.clone(),
        }
    }
}

impl<P> std::fmt::Debug for Indexer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider + Send + Sync + 'static> Indexer<P> {
    #[must_use]
    pub fn new(
        collector: Collector,
        embedder: Embedder<P>,
        store: ChunkStore,
        config: IndexerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            collector,
            embedder,
            store,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
            events,
        }
    }

    /// Subscribe to progress events for all jobs on this indexer.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Whether a job is currently running for the repository.
    #[must_use]
    pub fn is_indexing(&self, repo: &RepoId) -> bool {
        self.registry().contains(&repo.key())
    }

    /// Atomically claim the repository; `false` means a job already runs.
    fn try_begin(&self, key: &str) -> bool {
        self.registry().insert(key.to_owned())
    }

    fn release(&self, key: &str) {
        self.registry().remove(key);
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active.lock().expect("job registry lock poisoned")
    }

    fn emit(&self, event: IndexEvent) {
        let _ = self.events.send(event);
    }

    /// Run a full index job and wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::AlreadyIndexing`] when a job for the repository
    /// is in flight, or the stage error that failed the job.
    pub async fn index(&self, repo: &RepoId) -> Result<IndexReport> {
        let key = repo.key();
        if !self.try_begin(&key) {
            return Err(IndexError::AlreadyIndexing(key));
        }
        let result = self.run_job(repo).await;
        self.release(&key);
        result
    }

    /// Begin a job in the background; rejected immediately (no queueing)
    /// when the repository is already being indexed.
    pub fn start_index(&self, repo: &RepoId) -> StartOutcome {
        let key = repo.key();
        if !self.try_begin(&key) {
            return StartOutcome::AlreadyInProgress;
        }
        let this = self.clone();
        let repo = repo.clone();
        tokio::spawn(async move {
            let key = repo.key();
            if let Err(e) = this.run_job(&repo).await {
                tracing::error!("index job for {key} failed: {e}");
            }
            this.release(&key);
        });
        StartOutcome::Accepted
    }

    /// Index several repositories with bounded concurrency, aggregating
    /// per-repository outcomes; one failure never aborts the batch.
    pub async fn batch_index(&self, repos: &[RepoId]) -> Vec<(RepoId, Result<IndexReport>)> {
        futures::stream::iter(repos.iter().cloned().map(|repo| {
            let this = self.clone();
            async move {
                let result = this.index(&repo).await;
                (repo, result)
            }
        }))
        .buffered(self.config.max_concurrent_jobs.max(1))
        .collect()
        .await
    }

    /// Latest job snapshot for a repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn get_status(&self, repo: &RepoId) -> Result<Option<IndexJob>> {
        Ok(self.store.get_status(repo).await?)
    }

    /// Known repositories with their last successful index time.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn list_repositories(&self) -> Result<Vec<RepoSummary>> {
        Ok(self.store.list_repositories().await?)
    }

    /// Embedding cost counters accumulated across jobs.
    #[must_use]
    pub fn embed_stats(&self) -> EmbedStats {
        self.embedder.stats()
    }

    async fn run_job(&self, repo: &RepoId) -> Result<IndexReport> {
        let key = repo.key();
        let job_id = self.store.begin_job(repo).await?;
        self.emit(IndexEvent::Started {
            repository: key.clone(),
        });

        match self.run_stages(repo, job_id).await {
            Ok(report) => {
                self.store
                    .finish_job(
                        job_id,
                        JobState::Completed,
                        u64::try_from(report.chunks_written)?,
                        None,
                    )
                    .await?;
                self.emit(IndexEvent::Completed {
                    repository: key,
                    chunks_written: u64::try_from(report.chunks_written).unwrap_or(u64::MAX),
                });
                Ok(report)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(persist) = self
                    .store
                    .finish_job(job_id, JobState::Failed, 0, Some(&message))
                    .await
                {
                    tracing::error!("recording job failure for {key} also failed: {persist}");
                }
                self.emit(IndexEvent::Failed {
                    repository: key,
                    error: message,
                });
                Err(e)
            }
        }
    }

    async fn set_stage(&self, job_id: i64, key: &str, state: JobState) -> Result<()> {
        self.store.update_job_state(job_id, state).await?;
        self.emit(IndexEvent::Stage {
            repository: key.to_owned(),
            state,
        });
        Ok(())
    }

    async fn run_stages(&self, repo: &RepoId, job_id: i64) -> Result<IndexReport> {
        let start = Instant::now();
        let mut report = IndexReport::default();
        let key = repo.key();

        // Probe the embedding dimension before touching the collection.
        let probe = self.embedder.embed_query("dimension probe").await?;
        self.store
            .ensure_collection(u64::try_from(probe.len())?)
            .await?;

        self.set_stage(job_id, &key, JobState::Collecting).await?;
        let (files, collect_report) = self.collector.collect(repo).await?;
        report.files_listed = collect_report.files_listed;
        report.errors.extend(collect_report.errors);
        let files_total = u64::try_from(files.len())?;
        self.store.update_job_progress(job_id, 0, files_total).await?;

        self.set_stage(job_id, &key, JobState::Chunking).await?;
        let mut chunks: Vec<CodeChunk> = Vec::new();
        for (i, file) in files.iter().enumerate() {
            let file_chunks = chunker::chunk_file(file, &self.config.chunker);
            if !file_chunks.is_empty() {
                report.files_indexed += 1;
            }
            chunks.extend(file_chunks);

            let processed = u64::try_from(i + 1)?;
            self.store
                .update_job_progress(job_id, processed, files_total)
                .await?;
            self.emit(IndexEvent::FileProcessed {
                repository: key.clone(),
                files_processed: processed,
                files_total,
            });
        }
        report.chunks_created = chunks.len();

        self.set_stage(job_id, &key, JobState::Embedding).await?;
        let vectors = self.embedder.embed_chunks(&chunks).await?;

        self.set_stage(job_id, &key, JobState::Storing).await?;
        let mut items = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            match vector {
                Some(v) => items.push((to_record(chunk), v)),
                None => {
                    report.chunks_failed += 1;
                    report.errors.push(format!(
                        "{}:{} could not be embedded",
                        chunk_label(&chunk),
                        chunk.start_line
                    ));
                }
            }
        }
        report.chunks_embedded = items.len();

        let generation = self.store.begin_generation(repo).await?;
        report.chunks_written = self.store.upsert_chunks(repo, generation, items).await?;
        self.store.commit_generation(repo, generation).await?;

        report.duration_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        let stats = self.embedder.stats();
        tracing::info!(
            repo = %key,
            files = report.files_indexed,
            chunks = report.chunks_written,
            skipped = report.chunks_failed,
            cache_hits = stats.cache_hits,
            duration_ms = report.duration_ms,
            "indexing completed"
        );
        Ok(report)
    }
}

fn chunk_label(chunk: &CodeChunk) -> String {
    match &chunk.symbol_name {
        Some(symbol) => format!("{} ({symbol})", chunk.file_path),
        None => chunk.file_path.clone(),
    }
}

fn to_record(chunk: CodeChunk) -> ChunkRecord {
    ChunkRecord {
        file_path: chunk.file_path,
        language: chunk.language.id().to_owned(),
        symbol_name: chunk.symbol_name,
        start_line: chunk.start_line,
        end_line: chunk.end_line,
        text: chunk.text,
        imports_context: chunk.imports_context,
        token_count: chunk.token_count,
        content_hash: chunk.content_hash,
    }
}
