//! Job launching, admission control and the worker contract.
//!
//! A job request is validated synchronously; a bad request never gets a
//! progress channel. Accepted jobs run on a bounded slot pool and report
//! through their [`ProgressSender`]. Whatever happens inside a worker,
//! the stream ends with exactly one terminal event.

pub mod cover;
pub mod download;
pub mod isolate;
pub mod naming;

use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::catalog::{valid_name, Catalog};
use crate::events::{progress_channel, ProgressEvent, ProgressReceiver, ProgressSender};
use crate::storage::{StorageError, StorageSync};

pub use cover::CoverDeps;

pub const DEFAULT_JOB_SLOTS: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Validation(String),
    /// An external tool misbehaved (bad exit status, unusable output).
    #[error("{0}")]
    Tool(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// One video or track only.
    #[serde(alias = "video")]
    Single,
    Playlist,
    #[default]
    Channel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default = "default_true")]
    pub to_mp3: bool,
    #[serde(default)]
    pub mode: DownloadMode,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct IsolateRequest {
    /// Channel folder to separate.
    pub folder: String,
    /// A single beat inside the folder; all beats when absent.
    #[serde(default)]
    pub beat: Option<String>,
}

/// One requested stem, by name or by type.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StemSelector {
    Name(String),
    Detailed {
        #[serde(default)]
        name: Option<String>,
        #[serde(default, rename = "type")]
        stem_type: Option<String>,
    },
}

impl StemSelector {
    pub fn name(&self) -> Option<&str> {
        match self {
            StemSelector::Name(n) => Some(n),
            StemSelector::Detailed { name, .. } => name.as_deref(),
        }
    }

    pub fn type_hint(&self) -> Option<&str> {
        match self {
            StemSelector::Name(_) => None,
            StemSelector::Detailed { stem_type, .. } => stem_type.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoverRequest {
    pub channel: String,
    pub beat: String,
    #[serde(default)]
    pub stems: Vec<StemSelector>,
    #[serde(default)]
    pub genre: Option<String>,
}

#[derive(Debug, Clone)]
pub enum JobRequest {
    Download(DownloadRequest),
    Isolate(IsolateRequest),
    Cover(CoverRequest),
}

impl JobRequest {
    fn kind(&self) -> &'static str {
        match self {
            JobRequest::Download(_) => "download",
            JobRequest::Isolate(_) => "isolate",
            JobRequest::Cover(_) => "cover",
        }
    }
}

/// Everything a running worker needs, owned for the job's lifetime.
pub struct JobContext {
    pub job_id: Uuid,
    pub progress: ProgressSender,
    pub cancellation: CancellationToken,
    pub catalog: Catalog,
    pub sync: Arc<StorageSync>,
}

pub struct JobLauncher {
    catalog: Catalog,
    sync: Arc<StorageSync>,
    cover_deps: CoverDeps,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl JobLauncher {
    pub fn new(
        catalog: Catalog,
        sync: Arc<StorageSync>,
        cover_deps: CoverDeps,
        max_concurrent_jobs: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            sync,
            cover_deps,
            slots: Arc::new(Semaphore::new(max_concurrent_jobs)),
            shutdown,
        }
    }

    /// Validate a request and, when it is acceptable, spawn its worker.
    ///
    /// Returns the consumer half of the job's progress channel. A
    /// validation failure returns synchronously; nothing was spawned.
    pub fn start(&self, request: JobRequest) -> Result<ProgressReceiver, JobError> {
        self.validate(&request)?;

        let job_id = Uuid::new_v4();
        let (progress, receiver) = progress_channel();
        let ctx = JobContext {
            job_id,
            progress: progress.clone(),
            cancellation: self.shutdown.child_token(),
            catalog: self.catalog.clone(),
            sync: self.sync.clone(),
        };
        let slots = self.slots.clone();
        let cover_deps = self.cover_deps.clone();
        let kind = request.kind();
        info!(%job_id, kind, "job accepted");

        tokio::spawn(async move {
            let _permit = match slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    ctx.progress.push(ProgressEvent::status("queued"));
                    match slots.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            ctx.progress.push(ProgressEvent::failed("server shutting down"));
                            return;
                        }
                    }
                }
            };

            let outcome = tokio::select! {
                result = run_worker(&ctx, request, &cover_deps) => result,
                _ = ctx.cancellation.cancelled() => {
                    Err(JobError::Tool("server shutting down".to_string()))
                }
            };
            if let Err(e) = outcome {
                error!(%job_id, kind, "job failed: {e}");
                ctx.progress.push(ProgressEvent::failed(e.to_string()));
            } else {
                info!(%job_id, kind, "job finished");
            }
        });

        Ok(receiver)
    }

    fn validate(&self, request: &JobRequest) -> Result<(), JobError> {
        match request {
            JobRequest::Download(req) => {
                let url = req.url.trim();
                if url.is_empty() {
                    return Err(JobError::Validation("No URL provided".to_string()));
                }
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(JobError::Validation(format!("Invalid URL: {url}")));
                }
            }
            JobRequest::Isolate(req) => {
                if req.folder.trim().is_empty() {
                    return Err(JobError::Validation("No folder provided".to_string()));
                }
                if !valid_name(&req.folder) {
                    return Err(JobError::Validation(format!(
                        "Invalid folder name: {}",
                        req.folder
                    )));
                }
                if !self.catalog.channel_dir(&req.folder).is_dir() {
                    return Err(JobError::Validation(format!(
                        "Folder not found: {}",
                        req.folder
                    )));
                }
                if let Some(beat) = &req.beat {
                    if !valid_name(beat) {
                        return Err(JobError::Validation(format!("Invalid beat name: {beat}")));
                    }
                    if !self.catalog.beat_dir(&req.folder, beat).is_dir() {
                        return Err(JobError::Validation(format!("Beat not found: {beat}")));
                    }
                }
            }
            JobRequest::Cover(req) => {
                if self.cover_deps.kie.is_none() {
                    return Err(JobError::Validation(
                        "Cover generation is not configured (missing API key)".to_string(),
                    ));
                }
                if req.channel.trim().is_empty() || req.beat.trim().is_empty() {
                    return Err(JobError::Validation(
                        "Channel and beat are required".to_string(),
                    ));
                }
                if !valid_name(&req.channel) || !valid_name(&req.beat) {
                    return Err(JobError::Validation(
                        "Invalid channel or beat name".to_string(),
                    ));
                }
                if req.stems.is_empty() {
                    return Err(JobError::Validation("No stems selected".to_string()));
                }
            }
        }
        Ok(())
    }
}

async fn run_worker(
    ctx: &JobContext,
    request: JobRequest,
    cover_deps: &CoverDeps,
) -> Result<(), JobError> {
    match request {
        JobRequest::Download(req) => download::run(ctx, req).await,
        JobRequest::Isolate(req) => isolate::run(ctx, req).await,
        JobRequest::Cover(req) => cover::run(ctx, req, cover_deps).await,
    }
}
