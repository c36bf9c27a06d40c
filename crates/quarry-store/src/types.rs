use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a remote repository: owner, name, and branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
    pub branch: String,
}

impl RepoId {
    /// Build an identity; the branch defaults to `main` when omitted.
    #[must_use]
    pub fn new(owner: impl Into<String>, name: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            branch: branch.unwrap_or_else(|| "main".to_owned()),
        }
    }

    /// Canonical key used in SQLite rows and vector payloads.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}@{}", self.owner, self.name, self.branch)
    }
}

impl std::fmt::Display for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.name, self.branch)
    }
}

impl std::str::FromStr for RepoId {
    type Err = String;

    /// Parse `owner/name` or `owner/name@branch`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (repo_part, branch) = match s.split_once('@') {
            Some((r, b)) if !b.is_empty() => (r, Some(b.to_owned())),
            Some(_) => return Err(format!("empty branch in repository spec: {s}")),
            None => (s, None),
        };
        let Some((owner, name)) = repo_part.split_once('/') else {
            return Err(format!("expected owner/name, got: {s}"));
        };
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(format!("expected owner/name, got: {s}"));
        }
        Ok(Self::new(owner, name, branch))
    }
}

/// Lifecycle state of an index job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Collecting,
    Chunking,
    Embedding,
    Storing,
    Completed,
    Failed,
}

impl JobState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Collecting => "collecting",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Storing => "storing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "collecting" => Some(Self::Collecting),
            "chunking" => Some(Self::Chunking),
            "embedding" => Some(Self::Embedding),
            "storing" => Some(Self::Storing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one indexing run for a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJob {
    pub repository: String,
    pub state: JobState,
    pub files_total: u64,
    pub files_processed: u64,
    pub chunks_written: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
