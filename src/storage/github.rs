//! GitHub Contents API backed object store.
//!
//! Artifacts are mirrored into a repository under a fixed `storage/`
//! prefix. Uploads go through the Contents API (base64 body, blob SHA
//! required for updates); reads of public repos go through
//! raw.githubusercontent.com.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

pub const STORAGE_PREFIX: &str = "storage";

/// The Contents API rejects blobs over 100 MB.
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

const DEFAULT_API_BASE: &str = "https://api.github.com/repos";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("file is {size} bytes, over the {limit} byte remote limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("remote API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub token: String,
    /// `owner/name` form.
    pub repo: String,
    pub branch: String,
}

#[derive(Deserialize)]
struct ContentEntry {
    name: String,
    path: String,
    size: u64,
    #[serde(rename = "type")]
    entry_type: String,
}

#[derive(Deserialize)]
struct FileContent {
    sha: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct RepoInfo {
    /// Repository size in kilobytes, as the API reports it.
    size: u64,
}

/// One mirrored file, as returned by [`GitHubStore::list`].
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    /// Path relative to the downloads root (prefix stripped).
    pub path: String,
    pub size: u64,
}

pub struct GitHubStore {
    client: reqwest::Client,
    config: GitHubConfig,
    api_base: String,
}

impl GitHubStore {
    pub fn new(config: GitHubConfig) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("stemforge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            config,
            api_base: DEFAULT_API_BASE.to_string(),
        })
    }

    /// Point the store at a different API root. Test hook.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn contents_url(&self, repo_path: &str) -> String {
        format!(
            "{}/{}/contents/{}",
            self.api_base, self.config.repo, repo_path
        )
    }

    fn prefixed(path: &str) -> String {
        format!("{}/{}", STORAGE_PREFIX, path.trim_start_matches('/'))
    }

    fn auth_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("token {}", self.config.token))
            .header("Accept", "application/vnd.github.v3+json")
    }

    /// Public raw URL for a mirrored path.
    pub fn raw_url(&self, path: &str) -> String {
        format!(
            "https://raw.githubusercontent.com/{}/{}/{}",
            self.config.repo,
            self.config.branch,
            Self::prefixed(path)
        )
    }

    /// Blob SHA of an existing remote file, or `None` if absent.
    async fn file_sha(&self, repo_path: &str) -> Result<Option<String>, StorageError> {
        let url = self.contents_url(repo_path);
        let response = self
            .auth_request(self.client.get(&url))
            .query(&[("ref", self.config.branch.as_str())])
            .send()
            .await?;
        match response.status().as_u16() {
            200 => {
                let content: FileContent = response.json().await?;
                Ok(Some(content.sha))
            }
            404 => Ok(None),
            status => Err(StorageError::Api {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Upload a local file to `path` (relative to the downloads root).
    ///
    /// Existing files are updated in place. Returns the public raw URL.
    pub async fn upload(&self, local: &Path, path: &str) -> Result<String, StorageError> {
        let size = tokio::fs::metadata(local).await?.len();
        if size > MAX_FILE_SIZE {
            return Err(StorageError::TooLarge {
                size,
                limit: MAX_FILE_SIZE,
            });
        }

        let repo_path = Self::prefixed(path);
        let existing_sha = self.file_sha(&repo_path).await?;
        let bytes = tokio::fs::read(local).await?;

        let mut body = serde_json::json!({
            "message": format!("Upload {path}"),
            "content": BASE64.encode(&bytes),
            "branch": self.config.branch,
        });
        if let Some(sha) = &existing_sha {
            body["message"] = serde_json::json!(format!("Update {path}"));
            body["sha"] = serde_json::json!(sha);
        }

        let url = self.contents_url(&repo_path);
        let response = self
            .auth_request(self.client.put(&url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        info!(path, size, updated = existing_sha.is_some(), "uploaded to remote storage");
        Ok(self.raw_url(path))
    }

    /// Fetch a remote file's bytes through the Contents API.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let repo_path = Self::prefixed(path);
        let url = self.contents_url(&repo_path);
        let response = self
            .auth_request(self.client.get(&url))
            .query(&[("ref", self.config.branch.as_str())])
            .send()
            .await?;
        match response.status().as_u16() {
            200 => {
                let content: FileContent = response.json().await?;
                let encoded: String = content
                    .content
                    .ok_or_else(|| StorageError::NotFound(path.to_string()))?
                    .split_whitespace()
                    .collect();
                BASE64.decode(encoded).map_err(|e| StorageError::Api {
                    status: 200,
                    body: format!("undecodable content payload: {e}"),
                })
            }
            404 => Err(StorageError::NotFound(path.to_string())),
            status => Err(StorageError::Api {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.file_sha(&Self::prefixed(path)).await?.is_some())
    }

    /// Delete a remote file. `Ok(false)` when it was already absent.
    pub async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        let repo_path = Self::prefixed(path);
        let sha = match self.file_sha(&repo_path).await? {
            Some(sha) => sha,
            None => {
                debug!(path, "remote delete skipped, not found");
                return Ok(false);
            }
        };
        let body = serde_json::json!({
            "message": format!("Delete {path}"),
            "sha": sha,
            "branch": self.config.branch,
        });
        let url = self.contents_url(&repo_path);
        let response = self
            .auth_request(self.client.delete(&url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        info!(path, "deleted from remote storage");
        Ok(true)
    }

    /// All mirrored files under `prefix` (relative to the downloads
    /// root; empty string lists everything). Directories are walked
    /// iteratively.
    pub async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, StorageError> {
        let mut results = Vec::new();
        let mut pending = vec![if prefix.is_empty() {
            STORAGE_PREFIX.to_string()
        } else {
            Self::prefixed(prefix)
        }];

        while let Some(dir) = pending.pop() {
            let url = self.contents_url(&dir);
            let response = self
                .auth_request(self.client.get(&url))
                .query(&[("ref", self.config.branch.as_str())])
                .send()
                .await?;
            match response.status().as_u16() {
                200 => {}
                404 => continue,
                status => {
                    return Err(StorageError::Api {
                        status,
                        body: response.text().await.unwrap_or_default(),
                    })
                }
            }
            let entries: Vec<ContentEntry> = response.json().await?;
            for entry in entries {
                match entry.entry_type.as_str() {
                    "dir" => pending.push(entry.path),
                    "file" => {
                        let relative = entry
                            .path
                            .strip_prefix(STORAGE_PREFIX)
                            .map(|p| p.trim_start_matches('/'))
                            .unwrap_or(&entry.path)
                            .to_string();
                        results.push(RemoteEntry {
                            name: entry.name,
                            path: relative,
                            size: entry.size,
                        });
                    }
                    other => warn!(kind = other, path = %entry.path, "unexpected remote entry"),
                }
            }
        }
        Ok(results)
    }

    /// Repository size in kilobytes as reported by the API.
    pub async fn repo_size_kb(&self) -> Result<u64, StorageError> {
        let url = format!("{}/{}", self.api_base, self.config.repo);
        let response = self.auth_request(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(StorageError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let info: RepoInfo = response.json().await?;
        Ok(info.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> GitHubStore {
        GitHubStore::new(GitHubConfig {
            token: "test-token".to_string(),
            repo: "owner/beats".to_string(),
            branch: "main".to_string(),
        })
        .unwrap()
        .with_api_base(server.uri())
    }

    #[test]
    fn test_raw_url_includes_prefix() {
        let store = GitHubStore::new(GitHubConfig {
            token: "t".to_string(),
            repo: "owner/beats".to_string(),
            branch: "main".to_string(),
        })
        .unwrap();
        assert_eq!(
            store.raw_url("chan/beat/beat.mp3"),
            "https://raw.githubusercontent.com/owner/beats/main/storage/chan/beat/beat.mp3"
        );
    }

    #[tokio::test]
    async fn test_upload_new_file_sends_no_sha() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owner/beats/contents/storage/c/b/b.mp3"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/owner/beats/contents/storage/c/b/b.mp3"))
            .and(body_partial_json(serde_json::json!({"branch": "main"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "content": {"path": "storage/c/b/b.mp3"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("b.mp3");
        std::fs::write(&local, b"audio-bytes").unwrap();

        let url = store(&server).upload(&local, "c/b/b.mp3").await.unwrap();
        assert_eq!(
            url,
            "https://raw.githubusercontent.com/owner/beats/main/storage/c/b/b.mp3"
        );
    }

    #[tokio::test]
    async fn test_upload_existing_file_sends_sha() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owner/beats/contents/storage/c/b/b.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sha": "abc123"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/owner/beats/contents/storage/c/b/b.mp3"))
            .and(body_partial_json(serde_json::json!({"sha": "abc123"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("b.mp3");
        std::fs::write(&local, b"newer-bytes").unwrap();

        store(&server).upload(&local, "c/b/b.mp3").await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected_without_api_call() {
        let server = MockServer::start().await;
        // No mocks mounted: any request would 404 and the wiremock
        // verification below would not matter, but the size check must
        // trip before any request is made.
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("huge.mp3");
        let file = std::fs::File::create(&local).unwrap();
        file.set_len(MAX_FILE_SIZE + 1).unwrap();

        let err = store(&server).upload(&local, "c/b/huge.mp3").await.unwrap_err();
        assert!(matches!(err, StorageError::TooLarge { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_false() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owner/beats/contents/storage/c/b/b.mp3"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let removed = store(&server).delete("c/b/b.mp3").await.unwrap();
        assert!(!removed);
    }

    #[tokio::test]
    async fn test_delete_existing_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owner/beats/contents/storage/c/b/b.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sha": "def456"
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/owner/beats/contents/storage/c/b/b.mp3"))
            .and(body_partial_json(serde_json::json!({"sha": "def456"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        assert!(store(&server).delete("c/b/b.mp3").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_decodes_base64_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owner/beats/contents/storage/c/b/b.mp3"))
            .and(query_param("ref", "main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sha": "abc",
                "content": "aGVs\nbG8=\n"
            })))
            .mount(&server)
            .await;

        let bytes = store(&server).download("c/b/b.mp3").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_list_walks_directories() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owner/beats/contents/storage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "chan", "path": "storage/chan", "sha": "s1", "size": 0, "type": "dir"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/owner/beats/contents/storage/chan"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "b.mp3", "path": "storage/chan/b.mp3", "sha": "s2", "size": 42, "type": "file"}
            ])))
            .mount(&server)
            .await;

        let entries = store(&server).list("").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "chan/b.mp3");
        assert_eq!(entries[0].size, 42);
    }
}
