use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tower_http::services::ServeDir;
use tracing::{info, warn};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::catalog::{valid_name, Catalog, StorageInfo};
use crate::jobs::{
    CoverRequest, DownloadRequest, IsolateRequest, JobError, JobLauncher, JobRequest,
};
use crate::storage::{DeleteScope, DeleteSelector, StorageSync};

use super::state::*;
use super::stream::sse_response;
use super::{log_requests, ServerConfig};

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub version: String,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn job_error_response(err: JobError) -> Response {
    let status = match &err {
        JobError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    Json(stats)
}

async fn start_download(
    State(launcher): State<GuardedJobLauncher>,
    Json(request): Json<DownloadRequest>,
) -> Response {
    match launcher.start(JobRequest::Download(request)) {
        Ok(rx) => sse_response(rx).into_response(),
        Err(err) => job_error_response(err),
    }
}

async fn start_isolate(
    State(launcher): State<GuardedJobLauncher>,
    Json(request): Json<IsolateRequest>,
) -> Response {
    match launcher.start(JobRequest::Isolate(request)) {
        Ok(rx) => sse_response(rx).into_response(),
        Err(err) => job_error_response(err),
    }
}

async fn start_cover(
    State(launcher): State<GuardedJobLauncher>,
    Json(request): Json<CoverRequest>,
) -> Response {
    match launcher.start(JobRequest::Cover(request)) {
        Ok(rx) => sse_response(rx).into_response(),
        Err(err) => job_error_response(err),
    }
}

async fn list_downloads(State(catalog): State<Catalog>) -> impl IntoResponse {
    Json(catalog.list_channels())
}

fn bad_name_response(name: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: format!("Invalid name: {name}"),
        }),
    )
        .into_response()
}

async fn list_beats(State(catalog): State<Catalog>, Path(channel): Path<String>) -> Response {
    if !valid_name(&channel) {
        return bad_name_response(&channel);
    }
    Json(catalog.list_beats(&channel)).into_response()
}

async fn list_stems(
    State(catalog): State<Catalog>,
    State(sync): State<GuardedStorageSync>,
    Path((channel, beat)): Path<(String, String)>,
) -> Response {
    if !valid_name(&channel) {
        return bad_name_response(&channel);
    }
    if !valid_name(&beat) {
        return bad_name_response(&beat);
    }
    let mut stems = catalog.list_stems(&channel, &beat);
    if let Some(remote) = sync.remote() {
        for stem in &mut stems {
            stem.remote_url = Some(remote.public_url(&stem.path));
        }
    }
    Json(stems).into_response()
}

async fn list_samples(State(catalog): State<Catalog>) -> impl IntoResponse {
    Json(catalog.list_samples())
}

#[derive(Deserialize, Debug)]
struct DeleteRequest {
    pub channel: String,
    #[serde(default)]
    pub beat: Option<String>,
    #[serde(default = "default_delete_type", rename = "type")]
    pub delete_type: String,
    #[serde(default = "default_true", rename = "deleteFromGithub")]
    pub delete_remote: bool,
}

fn default_delete_type() -> String {
    "all".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    local_removed: usize,
    remote_removed: usize,
}

async fn delete_files(
    State(sync): State<GuardedStorageSync>,
    Json(request): Json<DeleteRequest>,
) -> Response {
    let selector = match request.delete_type.as_str() {
        "all" => DeleteSelector::All,
        "stems" => DeleteSelector::Stems,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: format!("Unknown delete type: {other}"),
                }),
            )
                .into_response()
        }
    };
    if request.channel.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "Channel is required".to_string(),
            }),
        )
            .into_response();
    }
    if !valid_name(&request.channel) {
        return bad_name_response(&request.channel);
    }
    if let Some(beat) = &request.beat {
        if !valid_name(beat) {
            return bad_name_response(beat);
        }
    }

    let scope = DeleteScope {
        channel: request.channel,
        beat: request.beat,
        selector,
        delete_remote: request.delete_remote,
    };
    match sync.delete(&scope).await {
        Ok(outcome) => Json(DeleteResponse {
            local_removed: outcome.local_removed,
            remote_removed: outcome.remote_removed,
        })
        .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: err.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn storage_info(
    State(catalog): State<Catalog>,
    State(sync): State<GuardedStorageSync>,
) -> impl IntoResponse {
    let remote_kb = match sync.remote() {
        Some(remote) => match remote.total_size_kb().await {
            Ok(kb) => Some(kb),
            Err(e) => {
                warn!("remote size lookup failed: {e}");
                None
            }
        },
        None => None,
    };
    Json(StorageInfo {
        local_bytes: catalog.local_size_bytes(),
        remote_kb,
        remote_enabled: sync.remote().is_some(),
    })
}

pub fn make_app(
    config: ServerConfig,
    catalog: Catalog,
    sync: Arc<StorageSync>,
    launcher: Arc<JobLauncher>,
) -> Router {
    let state = ServerState {
        config: config.clone(),
        start_time: Instant::now(),
        launcher,
        catalog: catalog.clone(),
        sync,
    };

    let api_routes: Router = Router::new()
        .route("/download", post(start_download))
        .route("/isolate", post(start_isolate))
        .route("/cover", post(start_cover))
        .route("/downloads", get(list_downloads))
        .route("/beats/{channel}", get(list_beats))
        .route("/stems/{channel}/{beat}", get(list_stems))
        .route("/samples", get(list_samples))
        .route("/delete", post(delete_files))
        .route("/storage-info", get(storage_info))
        .with_state(state.clone());

    let home_router: Router = match config.frontend_dir_path {
        Some(frontend_path) => {
            let static_files_service =
                ServeDir::new(frontend_path).append_index_html_on_directories(true);
            Router::new().fallback_service(static_files_service)
        }
        None => Router::new()
            .route("/", get(home))
            .with_state(state.clone()),
    };

    home_router
        .merge(api_routes)
        .nest_service("/serve-audio", ServeDir::new(catalog.root().to_path_buf()))
        .layer(middleware::from_fn_with_state(state, log_requests))
}

pub async fn run_server(
    config: ServerConfig,
    catalog: Catalog,
    sync: Arc<StorageSync>,
    launcher: Arc<JobLauncher>,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = config.port;
    let app = make_app(config, catalog, sync, launcher);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("listening on port {port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.cancelled() => {}
            }
            shutdown.cancel();
            info!("shutting down");
        })
        .await?;
    Ok(())
}
