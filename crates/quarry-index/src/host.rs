//! Code host access: authenticated tree listing and blob fetch.

use std::future::Future;
use std::pin::Pin;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;

use quarry_llm::LlmError;
use quarry_llm::retry::send_with_retry;
use quarry_store::RepoId;

const MAX_RETRIES: u32 = 3;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blob decode failed: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

/// One blob entry from a repository tree listing.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: String,
    pub size: u64,
    pub sha: String,
}

/// Remote code host: one tree listing, per-blob content fetch.
///
/// Object-safe so the collector can run against GitHub in production and a
/// scripted host in tests.
pub trait CodeHost: Send + Sync {
    fn list_tree(&self, repo: &RepoId) -> BoxFuture<'_, Result<Vec<TreeEntry>, HostError>>;

    fn fetch_blob(&self, repo: &RepoId, sha: &str) -> BoxFuture<'_, Result<Vec<u8>, HostError>>;
}

/// GitHub REST v3 client for tree listing and blob content.
pub struct GithubHost {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for GithubHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubHost")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl GithubHost {
    /// Client against the public GitHub API; `token` enables private
    /// repositories and higher rate limits.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self::with_base_url("https://api.github.com".to_owned(), token)
    }

    #[must_use]
    pub fn with_base_url(mut base_url: String, token: Option<String>) -> Self {
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: quarry_llm::http::default_client(),
            base_url,
            token,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        context: &str,
    ) -> Result<T, HostError> {
        let response = send_with_retry("github", MAX_RETRIES, || {
            let mut req = self
                .client
                .get(url)
                .header("Accept", "application/vnd.github+json");
            if let Some(ref token) = self.token {
                req = req.header("Authorization", format!("Bearer {token}"));
            }
            req.send()
        })
        .await
        .map_err(map_retry_error)?;

        let status = response.status();
        let text = response.text().await.map_err(HostError::Http)?;

        match status {
            s if s.is_success() => Ok(serde_json::from_str(&text)?),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(HostError::Auth(format!("{context}: {text}")))
            }
            reqwest::StatusCode::NOT_FOUND => Err(HostError::NotFound(context.to_owned())),
            s => Err(HostError::Other(format!(
                "{context}: unexpected status {s}"
            ))),
        }
    }
}

fn map_retry_error(err: LlmError) -> HostError {
    match err {
        LlmError::RateLimited => HostError::RateLimited,
        LlmError::Http(e) => HostError::Http(e),
        other => HostError::Other(other.to_string()),
    }
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeNode>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeNode {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: u64,
    sha: String,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

impl CodeHost for GithubHost {
    fn list_tree(&self, repo: &RepoId) -> BoxFuture<'_, Result<Vec<TreeEntry>, HostError>> {
        let url = format!(
            "{}/repos/{}/{}/git/trees/{}?recursive=1",
            self.base_url, repo.owner, repo.name, repo.branch
        );
        let context = format!("tree listing for {repo}");
        Box::pin(async move {
            let resp: TreeResponse = self.get_json(&url, &context).await?;
            if resp.truncated {
                tracing::warn!("{context}: listing truncated by the host");
            }
            Ok(resp
                .tree
                .into_iter()
                .filter(|node| node.kind == "blob")
                .map(|node| TreeEntry {
                    path: node.path,
                    size: node.size,
                    sha: node.sha,
                })
                .collect())
        })
    }

    fn fetch_blob(&self, repo: &RepoId, sha: &str) -> BoxFuture<'_, Result<Vec<u8>, HostError>> {
        let url = format!(
            "{}/repos/{}/{}/git/blobs/{sha}",
            self.base_url, repo.owner, repo.name
        );
        let context = format!("blob {sha} in {repo}");
        Box::pin(async move {
            let resp: BlobResponse = self.get_json(&url, &context).await?;
            if resp.encoding != "base64" {
                return Err(HostError::Decode(format!(
                    "{context}: unexpected encoding {}",
                    resp.encoding
                )));
            }
            let compact: String = resp
                .content
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            STANDARD
                .decode(compact)
                .map_err(|e| HostError::Decode(format!("{context}: {e}")))
        })
    }
}

#[cfg(any(test, feature = "mock"))]
pub mod static_host {
    //! Scripted in-memory host for tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::{BoxFuture, CodeHost, HostError, TreeEntry};
    use quarry_store::RepoId;

    /// Serves a fixed set of `path -> content` files per repository key.
    #[derive(Debug, Default)]
    pub struct StaticHost {
        repos: Mutex<HashMap<String, Vec<(String, String)>>>,
        /// Repository keys whose tree listing should fail.
        pub fail_listing: Mutex<Vec<String>>,
        /// Paths whose blob fetch should fail.
        pub fail_blobs: Mutex<Vec<String>>,
        /// Milliseconds to sleep inside `list_tree`, for concurrency tests.
        pub listing_delay_ms: u64,
    }

    impl StaticHost {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        #[must_use]
        pub fn with_listing_delay(mut self, ms: u64) -> Self {
            self.listing_delay_ms = ms;
            self
        }

        pub fn set_files(&self, repo: &RepoId, files: Vec<(&str, &str)>) {
            self.repos.lock().unwrap().insert(
                repo.key(),
                files
                    .into_iter()
                    .map(|(p, c)| (p.to_owned(), c.to_owned()))
                    .collect(),
            );
        }

        pub fn fail_listing_for(&self, repo: &RepoId) {
            self.fail_listing.lock().unwrap().push(repo.key());
        }

        pub fn fail_blob_at(&self, path: &str) {
            self.fail_blobs.lock().unwrap().push(path.to_owned());
        }

        fn blob_sha(repo_key: &str, path: &str) -> String {
            format!("{repo_key}:{path}")
        }
    }

    impl CodeHost for StaticHost {
        fn list_tree(&self, repo: &RepoId) -> BoxFuture<'_, Result<Vec<TreeEntry>, HostError>> {
            let key = repo.key();
            Box::pin(async move {
                if self.listing_delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(self.listing_delay_ms))
                        .await;
                }
                if self.fail_listing.lock().unwrap().contains(&key) {
                    return Err(HostError::Other(format!("listing failed for {key}")));
                }
                let repos = self.repos.lock().unwrap();
                let files = repos
                    .get(&key)
                    .ok_or_else(|| HostError::NotFound(key.clone()))?;
                Ok(files
                    .iter()
                    .map(|(path, content)| TreeEntry {
                        path: path.clone(),
                        size: content.len() as u64,
                        sha: Self::blob_sha(&key, path),
                    })
                    .collect())
            })
        }

        fn fetch_blob(
            &self,
            repo: &RepoId,
            sha: &str,
        ) -> BoxFuture<'_, Result<Vec<u8>, HostError>> {
            let key = repo.key();
            let sha = sha.to_owned();
            Box::pin(async move {
                let repos = self.repos.lock().unwrap();
                let files = repos
                    .get(&key)
                    .ok_or_else(|| HostError::NotFound(key.clone()))?;
                for (path, content) in files {
                    if Self::blob_sha(&key, path) == sha {
                        if self.fail_blobs.lock().unwrap().contains(path) {
                            return Err(HostError::Other(format!("blob fetch failed: {path}")));
                        }
                        return Ok(content.clone().into_bytes());
                    }
                }
                Err(HostError::NotFound(sha))
            })
        }
    }
}
