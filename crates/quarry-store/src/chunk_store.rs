//! Dual-write chunk persistence: vectors in the [`VectorStore`], metadata in
//! SQLite. Re-indexing writes a new generation that becomes visible to
//! readers only at commit, then supersedes the previous one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::{Result, StoreError};
use crate::types::{IndexJob, JobState, RepoId};
use crate::vector_store::{FieldCondition, VectorFilter, VectorPoint, VectorStore};

const CHUNK_COLLECTION: &str = "quarry_code_chunks";

pub const DEFAULT_TOP_K: usize = 10;
pub const MAX_TOP_K: usize = 50;

/// A chunk ready for persistence, paired with its embedding by the caller.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub file_path: String,
    pub language: String,
    pub symbol_name: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub imports_context: String,
    pub token_count: usize,
    pub content_hash: String,
}

/// A ranked search hit with decoded payload.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub file_path: String,
    pub language: String,
    pub symbol_name: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub similarity: f32,
}

/// Search result distinguishing "no completed index" from an empty match set.
#[derive(Debug)]
pub enum SearchOutcome {
    NotIndexed,
    Hits(Vec<ChunkHit>),
}

#[derive(Debug, Clone)]
pub struct RepoSummary {
    pub owner: String,
    pub name: String,
    pub branch: String,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

/// Vector store + SQLite dual-write store for code chunks and index jobs.
#[derive(Clone)]
pub struct ChunkStore {
    vector: Arc<dyn VectorStore>,
    pool: SqlitePool,
    collection: String,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Clamp a requested result count into the supported range.
#[must_use]
pub fn clamp_top_k(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_TOP_K
    } else {
        requested.min(MAX_TOP_K)
    }
}

impl ChunkStore {
    #[must_use]
    pub fn new(vector: Arc<dyn VectorStore>, pool: SqlitePool) -> Self {
        Self {
            vector,
            pool,
            collection: CHUNK_COLLECTION.into(),
        }
    }

    /// Ensure the chunk collection exists with the given vector size.
    ///
    /// # Errors
    ///
    /// Returns an error if the vector store cannot be reached.
    pub async fn ensure_collection(&self, vector_size: u64) -> Result<()> {
        self.vector
            .ensure_collection(&self.collection, vector_size)
            .await?;
        Ok(())
    }

    /// Register the repository row if it is not known yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn ensure_repository(&self, repo: &RepoId) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO repositories (repo_key, owner, name, branch) VALUES (?, ?, ?, ?)",
        )
        .bind(repo.key())
        .bind(&repo.owner)
        .bind(&repo.name)
        .bind(&repo.branch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The committed generation for a repository, if any index has completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn current_generation(&self, repo: &RepoId) -> Result<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT current_generation FROM repositories WHERE repo_key = ?")
                .bind(repo.key())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(g,)| (g > 0).then_some(g)))
    }

    /// Reserve the next generation number for a re-index run.
    ///
    /// The prior generation stays searchable until [`Self::commit_generation`].
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn begin_generation(&self, repo: &RepoId) -> Result<i64> {
        self.ensure_repository(repo).await?;
        let row: (i64,) =
            sqlx::query_as("SELECT current_generation FROM repositories WHERE repo_key = ?")
                .bind(repo.key())
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0 + 1)
    }

    /// Idempotent bulk write of chunks with vectors into a staged generation.
    ///
    /// Point IDs derive from repo/generation/content so replaying the same
    /// write cannot duplicate points. Returns the number of chunks written.
    ///
    /// # Errors
    ///
    /// Returns an error if the vector upsert or metadata insert fails.
    pub async fn upsert_chunks(
        &self,
        repo: &RepoId,
        generation: i64,
        items: Vec<(ChunkRecord, Vec<f32>)>,
    ) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        let repo_key = repo.key();
        let mut points = Vec::with_capacity(items.len());
        let mut rows = Vec::with_capacity(items.len());

        for (record, vector) in items {
            let point_id = chunk_point_id(&repo_key, generation, &record);
            let payload: HashMap<String, serde_json::Value> =
                serde_json::from_value(serde_json::json!({
                    "repo": repo_key,
                    "generation": generation,
                    "file_path": record.file_path,
                    "language": record.language,
                    "symbol_name": record.symbol_name,
                    "line_start": record.start_line,
                    "line_end": record.end_line,
                    "text": record.text,
                    "imports_context": record.imports_context,
                    "token_count": record.token_count,
                    "content_hash": record.content_hash,
                }))?;
            points.push(VectorPoint {
                id: point_id.clone(),
                vector,
                payload,
            });
            rows.push((point_id, record));
        }

        let written = points.len();
        self.vector.upsert(&self.collection, points).await?;

        for (point_id, record) in rows {
            let line_start = i64::try_from(record.start_line)?;
            let line_end = i64::try_from(record.end_line)?;
            sqlx::query(
                "INSERT OR REPLACE INTO chunk_metadata \
                 (point_id, repo_key, generation, file_path, content_hash, line_start, line_end) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&point_id)
            .bind(&repo_key)
            .bind(generation)
            .bind(&record.file_path)
            .bind(&record.content_hash)
            .bind(line_start)
            .bind(line_end)
            .execute(&self.pool)
            .await?;
        }

        Ok(written)
    }

    /// Make a staged generation the one visible to readers, then delete the
    /// superseded chunks from both stores.
    ///
    /// # Errors
    ///
    /// Returns an error if the flip or the cleanup fails.
    pub async fn commit_generation(&self, repo: &RepoId, generation: i64) -> Result<()> {
        let repo_key = repo.key();
        sqlx::query(
            "UPDATE repositories SET current_generation = ?, last_indexed_at = ? WHERE repo_key = ?",
        )
        .bind(generation)
        .bind(now_rfc3339())
        .bind(&repo_key)
        .execute(&self.pool)
        .await?;

        let stale: Vec<(String,)> = sqlx::query_as(
            "SELECT point_id FROM chunk_metadata WHERE repo_key = ? AND generation < ?",
        )
        .bind(&repo_key)
        .bind(generation)
        .fetch_all(&self.pool)
        .await?;

        if !stale.is_empty() {
            let ids = stale.into_iter().map(|(id,)| id).collect::<Vec<_>>();
            let removed = ids.len();
            self.vector.delete_by_ids(&self.collection, ids).await?;
            sqlx::query("DELETE FROM chunk_metadata WHERE repo_key = ? AND generation < ?")
                .bind(&repo_key)
                .bind(generation)
                .execute(&self.pool)
                .await?;
            tracing::debug!(repo = %repo_key, removed, "superseded generation cleaned up");
        }

        Ok(())
    }

    /// Remove every trace of a repository from both stores.
    ///
    /// # Errors
    ///
    /// Returns an error if a delete fails.
    pub async fn remove_repository(&self, repo: &RepoId) -> Result<()> {
        let repo_key = repo.key();
        let filter = VectorFilter {
            must: vec![FieldCondition::text("repo", repo_key.clone())],
            must_not: vec![],
        };
        self.vector.delete_by_filter(&self.collection, filter).await?;
        sqlx::query("DELETE FROM chunk_metadata WHERE repo_key = ?")
            .bind(&repo_key)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM index_jobs WHERE repo_key = ?")
            .bind(&repo_key)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM repositories WHERE repo_key = ?")
            .bind(&repo_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Top-K similarity search over the committed generation.
    ///
    /// Ranks by similarity descending; ties break on shorter file path, then
    /// lower start line. A repository with no completed index yields
    /// [`SearchOutcome::NotIndexed`], never an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the vector search itself fails.
    pub async fn search(
        &self,
        repo: &RepoId,
        query_vector: Vec<f32>,
        top_k: usize,
        language: Option<&str>,
    ) -> Result<SearchOutcome> {
        let Some(generation) = self.current_generation(repo).await? else {
            return Ok(SearchOutcome::NotIndexed);
        };

        let limit = clamp_top_k(top_k);
        let mut must = vec![
            FieldCondition::text("repo", repo.key()),
            FieldCondition::integer("generation", generation),
        ];
        if let Some(lang) = language {
            must.push(FieldCondition::text("language", lang));
        }
        let filter = VectorFilter {
            must,
            must_not: vec![],
        };

        let points = self
            .vector
            .search(
                &self.collection,
                query_vector,
                limit as u64,
                Some(filter),
            )
            .await?;

        let mut hits: Vec<ChunkHit> = points
            .into_iter()
            .filter_map(|p| chunk_hit_from_payload(p.score, &p.payload))
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.file_path.len().cmp(&b.file_path.len()))
                .then_with(|| a.start_line.cmp(&b.start_line))
        });
        hits.truncate(limit);

        Ok(SearchOutcome::Hits(hits))
    }

    /// Mark any leftover non-terminal jobs as failed, e.g. after a restart.
    ///
    /// Keeps the one-non-terminal-job-per-repository invariant honest when a
    /// previous process died mid-run.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn recover_stale_jobs(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE index_jobs SET state = 'failed', error = 'interrupted', finished_at = ? \
             WHERE state NOT IN ('completed', 'failed')",
        )
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Create a pending job row for a repository.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::JobActive`] if a non-terminal job already exists
    /// for the repository, or the underlying SQLite error.
    pub async fn begin_job(&self, repo: &RepoId) -> Result<i64> {
        self.ensure_repository(repo).await?;
        let repo_key = repo.key();

        let active: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM index_jobs \
             WHERE repo_key = ? AND state NOT IN ('completed', 'failed')",
        )
        .bind(&repo_key)
        .fetch_one(&self.pool)
        .await?;
        if active.0 > 0 {
            return Err(StoreError::JobActive(repo_key));
        }

        let row: (i64,) = sqlx::query_as(
            "INSERT INTO index_jobs (repo_key, state, started_at) VALUES (?, 'pending', ?) \
             RETURNING id",
        )
        .bind(&repo_key)
        .bind(now_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Record a stage transition for a job.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_job_state(&self, job_id: i64, state: JobState) -> Result<()> {
        sqlx::query("UPDATE index_jobs SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record file progress for a job.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_job_progress(
        &self,
        job_id: i64,
        files_processed: u64,
        files_total: u64,
    ) -> Result<()> {
        let processed = i64::try_from(files_processed)?;
        let total = i64::try_from(files_total)?;
        sqlx::query("UPDATE index_jobs SET files_processed = ?, files_total = ? WHERE id = ?")
            .bind(processed)
            .bind(total)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a job to a terminal state with its final counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn finish_job(
        &self,
        job_id: i64,
        state: JobState,
        chunks_written: u64,
        error: Option<&str>,
    ) -> Result<()> {
        let chunks = i64::try_from(chunks_written)?;
        sqlx::query(
            "UPDATE index_jobs SET state = ?, chunks_written = ?, finished_at = ?, error = ? \
             WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(chunks)
        .bind(now_rfc3339())
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The most recent job snapshot for a repository, if any exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_status(&self, repo: &RepoId) -> Result<Option<IndexJob>> {
        type JobRow = (
            String,
            String,
            i64,
            i64,
            i64,
            String,
            Option<String>,
            Option<String>,
        );
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT repo_key, state, files_total, files_processed, chunks_written, \
                    started_at, finished_at, error \
             FROM index_jobs WHERE repo_key = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(repo.key())
        .fetch_optional(&self.pool)
        .await?;

        let Some((repo_key, state, total, processed, chunks, started, finished, error)) = row
        else {
            return Ok(None);
        };

        let state = JobState::parse(&state)
            .ok_or_else(|| StoreError::Other(format!("unknown job state: {state}")))?;
        let started_at = parse_timestamp(&started)
            .ok_or_else(|| StoreError::Other(format!("bad started_at: {started}")))?;

        Ok(Some(IndexJob {
            repository: repo_key,
            state,
            files_total: u64::try_from(total)?,
            files_processed: u64::try_from(processed)?,
            chunks_written: u64::try_from(chunks)?,
            started_at,
            finished_at: finished.as_deref().and_then(parse_timestamp),
            error,
        }))
    }

    /// Every known repository with its last successful index time.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_repositories(&self) -> Result<Vec<RepoSummary>> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT owner, name, branch, last_indexed_at FROM repositories ORDER BY owner, name, branch",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(owner, name, branch, indexed)| RepoSummary {
                owner,
                name,
                branch,
                last_indexed_at: indexed.as_deref().and_then(parse_timestamp),
            })
            .collect())
    }
}

/// Deterministic point ID so replayed writes overwrite instead of duplicating.
fn chunk_point_id(repo_key: &str, generation: i64, record: &ChunkRecord) -> String {
    let key = format!(
        "{repo_key}:{generation}:{}:{}:{}",
        record.content_hash, record.file_path, record.start_line
    );
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

fn chunk_hit_from_payload(
    score: f32,
    payload: &HashMap<String, serde_json::Value>,
) -> Option<ChunkHit> {
    let get_str = |key: &str| payload.get(key).and_then(|v| v.as_str()).map(str::to_owned);
    let get_line = |key: &str| {
        payload
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
    };

    Some(ChunkHit {
        file_path: get_str("file_path")?,
        language: get_str("language")?,
        symbol_name: get_str("symbol_name"),
        start_line: get_line("line_start")?,
        end_line: get_line("line_end")?,
        text: get_str("text")?,
        similarity: score,
    })
}
