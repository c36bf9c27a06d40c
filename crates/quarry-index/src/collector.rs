//! Source file collection: one tree listing, filtered, then blob fetches
//! with bounded concurrency.

use std::sync::Arc;

use futures::StreamExt;

use crate::error::Result;
use crate::host::{CodeHost, TreeEntry};
use crate::languages::{Lang, detect_language};
use quarry_store::RepoId;

/// Path components that never contain first-party source.
const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    "vendor",
    "target",
    "dist",
    "build",
    "out",
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    "third_party",
];

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Files larger than this are skipped outright.
    pub max_file_size: u64,
    /// Blob fetches in flight at once.
    pub max_concurrent_fetches: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_file_size: 500_000,
            max_concurrent_fetches: 8,
        }
    }
}

/// One source file held in memory for the duration of an indexing run.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: String,
    pub language: Lang,
    pub size: u64,
    pub content: String,
    pub blob_hash: String,
}

/// Counters for one collection run.
#[derive(Debug, Default)]
pub struct CollectReport {
    pub files_listed: usize,
    pub files_eligible: usize,
    pub files_fetched: usize,
    pub files_skipped: usize,
    pub errors: Vec<String>,
}

/// Fetches a repository's source files through a [`CodeHost`].
#[derive(Clone)]
pub struct Collector {
    host: Arc<dyn CodeHost>,
    config: CollectorConfig,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Whether any path component is a dependency/build/vendored directory.
#[must_use]
pub fn is_excluded_path(path: &str) -> bool {
    path.split('/').any(|component| {
        EXCLUDED_DIRS.contains(&component) || (component.starts_with('.') && component.len() > 1)
    })
}

fn is_eligible(entry: &TreeEntry, max_file_size: u64) -> Option<Lang> {
    if entry.size > max_file_size || is_excluded_path(&entry.path) {
        return None;
    }
    detect_language(&entry.path)
}

impl Collector {
    #[must_use]
    pub fn new(host: Arc<dyn CodeHost>, config: CollectorConfig) -> Self {
        Self { host, config }
    }

    /// Collect the repository's eligible source files.
    ///
    /// The tree is listed once; blob fetches run with bounded concurrency.
    /// Per-file fetch and decode failures are logged and skipped; only the
    /// tree listing (or exhausted rate-limit retries) fails the run.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree listing fails.
    pub async fn collect(&self, repo: &RepoId) -> Result<(Vec<SourceFile>, CollectReport)> {
        let mut report = CollectReport::default();

        let entries = self.host.list_tree(repo).await?;
        report.files_listed = entries.len();

        let eligible: Vec<(TreeEntry, Lang)> = entries
            .into_iter()
            .filter_map(|entry| {
                is_eligible(&entry, self.config.max_file_size).map(|lang| (entry, lang))
            })
            .collect();
        report.files_eligible = eligible.len();

        tracing::info!(
            repo = %repo,
            listed = report.files_listed,
            eligible = report.files_eligible,
            "tree listed"
        );

        let fetched: Vec<std::result::Result<SourceFile, String>> =
            futures::stream::iter(eligible.into_iter().map(|(entry, lang)| {
                let host = Arc::clone(&self.host);
                let repo = repo.clone();
                async move {
                    let bytes = host
                        .fetch_blob(&repo, &entry.sha)
                        .await
                        .map_err(|e| format!("{}: {e}", entry.path))?;
                    let content = String::from_utf8(bytes)
                        .map_err(|_| format!("{}: not valid UTF-8", entry.path))?;
                    Ok(SourceFile {
                        path: entry.path,
                        language: lang,
                        size: entry.size,
                        content,
                        blob_hash: entry.sha,
                    })
                }
            }))
            .buffer_unordered(self.config.max_concurrent_fetches.max(1))
            .collect()
            .await;

        let mut files = Vec::with_capacity(fetched.len());
        for result in fetched {
            match result {
                Ok(file) => files.push(file),
                Err(msg) => {
                    tracing::warn!("skipping file: {msg}");
                    report.files_skipped += 1;
                    report.errors.push(msg);
                }
            }
        }

        // Fetches complete out of order; sort for a deterministic pipeline.
        files.sort_by(|a, b| a.path.cmp(&b.path));
        report.files_fetched = files.len();

        Ok((files, report))
    }
}
