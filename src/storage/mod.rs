//! Local/remote artifact synchronization.
//!
//! Produced files live under the downloads root and are mirrored to an
//! optional [`RemoteStore`]. Keys on the remote side are paths relative
//! to the root, forward-slashed. Deletion scopes remove local files and
//! optionally their remote mirrors, returning removal counts.
//!
//! Deletion is not serialized against jobs writing to the same beat;
//! callers issue deletes only for beats with no job in flight.

pub mod github;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub use github::{GitHubConfig, GitHubStore, RemoteEntry, StorageError};

use crate::catalog::{ISOLATED_DIR, LEGACY_SUBDIR};

/// Remote mirror of the downloads tree.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upload(&self, local: &Path, path: &str) -> Result<String, StorageError>;
    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;
    async fn delete(&self, path: &str) -> Result<bool, StorageError>;
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, StorageError>;
    async fn total_size_kb(&self) -> Result<u64, StorageError>;
    fn public_url(&self, path: &str) -> String;
}

#[async_trait]
impl RemoteStore for GitHubStore {
    async fn upload(&self, local: &Path, path: &str) -> Result<String, StorageError> {
        GitHubStore::upload(self, local, path).await
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        GitHubStore::download(self, path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        GitHubStore::exists(self, path).await
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        GitHubStore::delete(self, path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, StorageError> {
        GitHubStore::list(self, prefix).await
    }

    async fn total_size_kb(&self) -> Result<u64, StorageError> {
        self.repo_size_kb().await
    }

    fn public_url(&self, path: &str) -> String {
        self.raw_url(path)
    }
}

/// Which files a delete request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteSelector {
    /// Everything under the beat (or the whole channel).
    All,
    /// Only separated stems; the original audio stays.
    Stems,
}

#[derive(Debug, Clone)]
pub struct DeleteScope {
    pub channel: String,
    pub beat: Option<String>,
    pub selector: DeleteSelector,
    pub delete_remote: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub local_removed: usize,
    pub remote_removed: usize,
}

pub struct StorageSync {
    root: PathBuf,
    remote: Option<Arc<dyn RemoteStore>>,
}

impl StorageSync {
    pub fn new(root: PathBuf, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        Self { root, remote }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn remote(&self) -> Option<&Arc<dyn RemoteStore>> {
        self.remote.as_ref()
    }

    /// Remote key for a local path, or `None` when the path is outside
    /// the downloads root.
    pub fn remote_key(&self, local: &Path) -> Option<String> {
        let relative = local.strip_prefix(&self.root).ok()?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        (!key.is_empty()).then_some(key)
    }

    /// Mirror a produced file to the remote store.
    ///
    /// `Ok(None)` when no remote is configured.
    pub async fn mirror(&self, local: &Path) -> Result<Option<String>, StorageError> {
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let Some(key) = self.remote_key(local) else {
            warn!(path = %local.display(), "mirror skipped, path outside downloads root");
            return Ok(None);
        };
        let url = remote.upload(local, &key).await?;
        Ok(Some(url))
    }

    /// Restore a file from the remote mirror when it is locally absent.
    ///
    /// Returns whether the file is present locally afterwards.
    pub async fn fetch_missing(&self, key: &str) -> Result<bool, StorageError> {
        let local = self.root.join(key);
        if local.exists() {
            return Ok(true);
        }
        let Some(remote) = &self.remote else {
            return Ok(false);
        };
        if !remote.exists(key).await? {
            return Ok(false);
        }
        let bytes = remote.download(key).await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, bytes).await?;
        debug!(%key, "restored local file from remote mirror");
        Ok(true)
    }

    /// Remove the files a scope covers, locally and (optionally) on the
    /// remote mirror. Remote failures are tolerated per file.
    pub async fn delete(&self, scope: &DeleteScope) -> Result<DeleteOutcome, StorageError> {
        let mut outcome = DeleteOutcome::default();
        outcome.local_removed = self.delete_local(scope).await?;

        if scope.delete_remote {
            if let Some(remote) = &self.remote {
                outcome.remote_removed = Self::delete_remote(remote, scope).await?;
            }
        }
        Ok(outcome)
    }

    async fn delete_local(&self, scope: &DeleteScope) -> Result<usize, StorageError> {
        let channel_dir = self.root.join(&scope.channel);
        if !channel_dir.is_dir() {
            return Ok(0);
        }

        let beat_dirs: Vec<PathBuf> = match &scope.beat {
            Some(beat) => vec![channel_dir.join(beat)],
            None => {
                let mut dirs = Vec::new();
                let mut entries = tokio::fs::read_dir(&channel_dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if path.is_dir()
                        && entry.file_name().to_string_lossy() != LEGACY_SUBDIR
                    {
                        dirs.push(path);
                    }
                }
                dirs
            }
        };

        let mut removed = 0;
        for beat_dir in beat_dirs {
            if !beat_dir.is_dir() {
                continue;
            }
            match scope.selector {
                DeleteSelector::All => {
                    removed += count_files(&beat_dir);
                    tokio::fs::remove_dir_all(&beat_dir).await?;
                }
                DeleteSelector::Stems => {
                    let iso_dir = beat_dir.join(ISOLATED_DIR);
                    if !iso_dir.is_dir() {
                        continue;
                    }
                    let mut entries = tokio::fs::read_dir(&iso_dir).await?;
                    while let Some(entry) = entries.next_entry().await? {
                        let path = entry.path();
                        if path.is_file() {
                            tokio::fs::remove_file(&path).await?;
                            removed += 1;
                        }
                    }
                }
            }
        }

        // A channel-wide full delete drops the now-empty channel dir.
        if scope.beat.is_none() && scope.selector == DeleteSelector::All {
            let _ = tokio::fs::remove_dir(&channel_dir).await;
        }
        Ok(removed)
    }

    async fn delete_remote(
        remote: &Arc<dyn RemoteStore>,
        scope: &DeleteScope,
    ) -> Result<usize, StorageError> {
        let prefix = match &scope.beat {
            Some(beat) => format!("{}/{}", scope.channel, beat),
            None => scope.channel.clone(),
        };
        let entries = remote.list(&prefix).await?;
        let mut removed = 0;
        for entry in entries {
            if scope.selector == DeleteSelector::Stems
                && !entry.path.contains(&format!("/{ISOLATED_DIR}/"))
            {
                continue;
            }
            match remote.delete(&entry.path).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %entry.path, "remote delete failed: {e}"),
            }
        }
        Ok(removed)
    }
}

fn count_files(dir: &Path) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .count()
}
