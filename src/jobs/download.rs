//! Content download worker built on yt-dlp.
//!
//! The URL is probed first for channel metadata and an item count, then
//! the actual download streams into a staging directory inside the
//! channel folder. Finished files are organized one-beat-per-folder and
//! mirrored to remote storage.

use regex::Regex;
use serde_json::Value as JsonValue;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::catalog::ISOLATED_DIR;
use crate::events::ProgressEvent;

use super::naming::{resolve_channel_name, sanitize_name};
use super::{DownloadMode, DownloadRequest, JobContext, JobError};

const YTDLP_BIN: &str = "yt-dlp";
const MEDIA_EXTENSIONS: &[&str] = &["mp3", "mp4", "m4a", "webm", "opus", "wav"];

struct ProbeInfo {
    channel: String,
    /// Expected item count; at least 1.
    total: usize,
}

pub async fn run(ctx: &JobContext, request: DownloadRequest) -> Result<(), JobError> {
    ctx.progress.push(ProgressEvent::status("Fetching metadata..."));
    let probe = probe(&request).await?;
    debug!(channel = %probe.channel, total = probe.total, "probe finished");

    let staging = ctx.catalog.staging_dir(&probe.channel);
    tokio::fs::create_dir_all(&staging)
        .await
        .map_err(|e| JobError::Tool(format!("cannot create staging dir: {e}")))?;

    ctx.progress.push(
        ProgressEvent::status(format!("Downloading from {}...", probe.channel))
            .with("channel", serde_json::json!(probe.channel)),
    );
    let exit_ok = stream_download(ctx, &request, &staging, probe.total).await?;

    let organized = organize(ctx, &probe.channel, &staging).await?;
    let _ = tokio::fs::remove_dir_all(&staging).await;

    if organized == 0 {
        return Err(JobError::Tool(if exit_ok {
            "No files were downloaded".to_string()
        } else {
            "Download tool failed before producing any files".to_string()
        }));
    }

    let message = if exit_ok {
        format!("{organized} videos downloaded!")
    } else {
        format!("{organized} videos downloaded, some items failed")
    };
    ctx.progress.push(
        ProgressEvent::done(message)
            .with("count", serde_json::json!(organized))
            .with("channel", serde_json::json!(probe.channel)),
    );
    Ok(())
}

/// Ask yt-dlp for metadata without downloading anything.
async fn probe(request: &DownloadRequest) -> Result<ProbeInfo, JobError> {
    let mut cmd = Command::new(YTDLP_BIN);
    cmd.arg("-J").arg("--no-warnings");
    match request.mode {
        DownloadMode::Single => {
            cmd.arg("--no-playlist");
        }
        DownloadMode::Playlist | DownloadMode::Channel => {
            cmd.arg("--flat-playlist");
        }
    }
    cmd.arg(&request.url);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = cmd
        .output()
        .await
        .map_err(|e| JobError::Tool(format!("cannot run {YTDLP_BIN}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(JobError::Tool(format!(
            "metadata probe failed: {}",
            stderr.lines().last().unwrap_or("unknown error")
        )));
    }

    let metadata: JsonValue = serde_json::from_slice(&output.stdout)
        .map_err(|e| JobError::Tool(format!("unreadable metadata: {e}")))?;
    let channel = resolve_channel_name([
        metadata.get("uploader").and_then(JsonValue::as_str),
        metadata.get("channel").and_then(JsonValue::as_str),
    ]);
    let total = metadata
        .get("entries")
        .and_then(JsonValue::as_array)
        .map(Vec::len)
        .or_else(|| {
            metadata
                .get("playlist_count")
                .and_then(JsonValue::as_u64)
                .map(|n| n as usize)
        })
        .unwrap_or(1)
        .max(1);
    Ok(ProbeInfo { channel, total })
}

/// Run the download subprocess and translate its stdout into progress
/// events. Returns whether the tool exited cleanly.
async fn stream_download(
    ctx: &JobContext,
    request: &DownloadRequest,
    staging: &Path,
    total: usize,
) -> Result<bool, JobError> {
    let mut cmd = Command::new(YTDLP_BIN);
    if request.to_mp3 {
        cmd.args(["-x", "--audio-format", "mp3", "--audio-quality", "0"]);
    } else {
        cmd.args([
            "-f",
            "bestvideo+bestaudio/best",
            "--merge-output-format",
            "mp4",
        ]);
    }
    if request.mode == DownloadMode::Single {
        cmd.arg("--no-playlist");
    }
    cmd.args(["--no-warnings", "--ignore-errors", "--progress", "--newline"]);
    cmd.arg("-o");
    cmd.arg(staging.join("%(title)s.%(ext)s"));
    cmd.arg(&request.url);
    cmd.stdout(Stdio::piped()).stderr(Stdio::null());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| JobError::Tool(format!("cannot run {YTDLP_BIN}: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| JobError::Tool("no stdout from download tool".to_string()))?;

    let mut lines = BufReader::new(stdout).lines();
    let mut tally = ProgressTally::new(total);

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| JobError::Tool(format!("download output unreadable: {e}")))?
    {
        if let Some(name) = parse_destination_line(&line) {
            tally.on_destination(&name);
            ctx.progress.push(
                ProgressEvent::status("Downloading...")
                    .with("download", serde_json::json!(name)),
            );
        } else if let Some(item_pct) = parse_progress_line(&line) {
            if let Some(overall) = tally.on_percent(item_pct) {
                ctx.progress.push(ProgressEvent::progress(overall));
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| JobError::Tool(format!("download tool lost: {e}")))?;
    Ok(status.success())
}

/// Move each staged media file into its own beat folder and mirror it.
async fn organize(ctx: &JobContext, channel: &str, staging: &Path) -> Result<usize, JobError> {
    let mut organized = 0usize;
    let mut entries = tokio::fs::read_dir(staging)
        .await
        .map_err(|e| JobError::Tool(format!("staging dir unreadable: {e}")))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| JobError::Tool(format!("staging dir unreadable: {e}")))?
    {
        let path = entry.path();
        if !is_media_file(&path) {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let title = sanitize_name(
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name.clone())
                .as_str(),
        );
        if title.is_empty() {
            warn!(file = %file_name, "skipping file with unusable title");
            continue;
        }
        // Folder and file share the sanitized title; yt-dlp output may
        // keep characters the layout strips.
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let stored_name = format!("{title}.{ext}");

        let beat_dir = ctx.catalog.beat_dir(channel, &title);
        tokio::fs::create_dir_all(beat_dir.join(ISOLATED_DIR))
            .await
            .map_err(|e| JobError::Tool(format!("cannot create beat folder: {e}")))?;
        let dest = beat_dir.join(&stored_name);
        move_file(&path, &dest)
            .await
            .map_err(|e| JobError::Tool(format!("cannot place {stored_name}: {e}")))?;
        organized += 1;

        // Mirror failures do not sink the job; the file is on disk.
        if let Err(e) = ctx.sync.mirror(&dest).await {
            warn!(file = %stored_name, "mirror failed: {e}");
            ctx.progress
                .push(ProgressEvent::error(format!("Remote upload failed for {stored_name}: {e}")));
        }
        ctx.progress.push(
            ProgressEvent::status("Organizing...")
                .with("download", serde_json::json!(title))
                .with("count", serde_json::json!(organized)),
        );
    }
    Ok(organized)
}

/// Completion tracking across a multi-item download.
///
/// Fragment destinations of one item (`Title.f137.mp4` then
/// `Title.f140.m4a`) share an item key, so a merged video+audio pair
/// counts once.
struct ProgressTally {
    total: usize,
    completed: usize,
    current_item: Option<String>,
    last_overall: f32,
}

impl ProgressTally {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            current_item: None,
            last_overall: 0.0,
        }
    }

    /// A changed item key marks the previous item as finished.
    fn on_destination(&mut self, file_name: &str) {
        let key = item_key(file_name);
        if self
            .current_item
            .as_deref()
            .is_some_and(|current| current != key)
        {
            self.completed += 1;
        }
        self.current_item = Some(key);
    }

    /// Composite percentage for a per-item update, `None` when it would
    /// not move forward.
    fn on_percent(&mut self, item_pct: f32) -> Option<f32> {
        let overall = overall_progress(self.completed.min(self.total), self.total, item_pct);
        if overall > self.last_overall {
            self.last_overall = overall;
            Some(overall)
        } else {
            None
        }
    }
}

/// Item key of a destination filename, with yt-dlp's format-id fragment
/// suffix (`.f137`) stripped.
fn item_key(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    match stem.rsplit_once('.') {
        Some((base, suffix))
            if suffix.len() > 1
                && suffix.starts_with('f')
                && suffix[1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            base.to_string()
        }
        _ => stem,
    }
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

fn is_media_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                MEDIA_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

fn progress_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+\.?\d*)%").expect("hardcoded pattern"))
}

/// Percentage out of a `[download]  42.3% of ...` line.
pub fn parse_progress_line(line: &str) -> Option<f32> {
    if !line.starts_with("[download]") {
        return None;
    }
    progress_regex()
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
}

/// Target filename out of a `[download] Destination: ...` line.
pub fn parse_destination_line(line: &str) -> Option<String> {
    let rest = line.strip_prefix("[download] Destination: ")?;
    Path::new(rest.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Composite percentage over a multi-item download.
///
/// Stays non-decreasing as long as `completed` only grows, even though
/// the per-item percentage resets to zero for each new item.
pub fn overall_progress(completed: usize, total: usize, item_pct: f32) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let fraction = completed as f32 + (item_pct / 100.0).clamp(0.0, 1.0);
    (fraction / total as f32 * 100.0).min(100.0)
}
