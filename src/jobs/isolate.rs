//! Stem separation worker built on audio-separator.
//!
//! Separates one beat or every beat of a channel. A failing beat is
//! reported and skipped; the job only fails outright when nothing could
//! be separated at all.

use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::catalog::{classify, StemMatch};
use crate::events::{ProgressEvent, ProgressSender};

use super::{IsolateRequest, JobContext, JobError};

const SEPARATOR_BIN: &str = "audio-separator";
const SEPARATOR_MODEL: &str = "htdemucs.yaml";
const BEAT_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn run(ctx: &JobContext, request: IsolateRequest) -> Result<(), JobError> {
    // A beat that only lives on the remote mirror is restored first.
    if let Some(beat) = &request.beat {
        let key = format!("{}/{}/{}.mp3", request.folder, beat, beat);
        if let Err(e) = ctx.sync.fetch_missing(&key).await {
            warn!(%key, "remote restore failed: {e}");
        }
    }

    let targets = ctx
        .catalog
        .beats_with_audio(&request.folder, request.beat.as_deref());
    if targets.is_empty() {
        return Err(JobError::Validation("No MP3 files found".to_string()));
    }

    let total = targets.len();
    let single = total == 1;
    ctx.progress.push(
        ProgressEvent::status(format!("Isolating stems for {total} beat(s)..."))
            .with("count", serde_json::json!(total)),
    );

    let mut succeeded = 0usize;
    for (completed, (beat, audio)) in targets.into_iter().enumerate() {
        if !single {
            let overall = completed as f32 / total as f32 * 100.0;
            ctx.progress.push(ProgressEvent::progress(overall));
        }
        ctx.progress.push(
            ProgressEvent::status(format!("Separating {beat}..."))
                .with("beat", serde_json::json!(beat)),
        );

        let iso_dir = ctx.catalog.isolated_dir(&request.folder, &beat);
        tokio::fs::create_dir_all(&iso_dir)
            .await
            .map_err(|e| JobError::Tool(format!("cannot create stems folder: {e}")))?;

        match separate_beat(&ctx.progress, &audio, &iso_dir, single).await {
            Ok(()) => {}
            Err(e) => {
                warn!(%beat, "separation failed: {e}");
                ctx.progress
                    .push(ProgressEvent::error(format!("Separation failed for {beat}: {e}")));
                continue;
            }
        }

        mirror_stems(ctx, &request.folder, &beat).await;
        succeeded += 1;
    }

    if succeeded == 0 {
        return Err(JobError::Tool(
            "Stem separation failed for every beat".to_string(),
        ));
    }
    ctx.progress.push(ProgressEvent::progress(100.0));
    ctx.progress.push(
        ProgressEvent::done(format!("Isolated stems for {succeeded} beat(s)!"))
            .with("count", serde_json::json!(succeeded)),
    );
    Ok(())
}

/// Run the separator on one audio file with a hard per-beat timeout.
async fn separate_beat(
    progress: &ProgressSender,
    audio: &Path,
    iso_dir: &Path,
    report_tool_progress: bool,
) -> Result<(), JobError> {
    let mut cmd = Command::new(SEPARATOR_BIN);
    cmd.arg(audio)
        .args(["-m", SEPARATOR_MODEL])
        .arg("--output_dir")
        .arg(iso_dir)
        .args(["--output_format", "mp3"]);
    cmd.stdout(Stdio::piped()).stderr(Stdio::null());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| JobError::Tool(format!("cannot run {SEPARATOR_BIN}: {e}")))?;

    let outcome = tokio::time::timeout(
        BEAT_TIMEOUT,
        drive_separator(&mut child, progress, report_tool_progress),
    )
    .await;
    match outcome {
        Ok(result) => result,
        Err(_) => {
            let _ = child.kill().await;
            Err(JobError::Tool(format!(
                "timed out after {}s",
                BEAT_TIMEOUT.as_secs()
            )))
        }
    }
}

async fn drive_separator(
    child: &mut Child,
    progress: &ProgressSender,
    report_tool_progress: bool,
) -> Result<(), JobError> {
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        let mut last_pct = 0.0f32;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| JobError::Tool(format!("separator output unreadable: {e}")))?
        {
            if !report_tool_progress {
                continue;
            }
            if let Some(pct) = parse_percent(&line) {
                if pct > last_pct {
                    last_pct = pct;
                    progress.push(ProgressEvent::progress(pct));
                }
            }
        }
    }
    let status = child
        .wait()
        .await
        .map_err(|e| JobError::Tool(format!("separator lost: {e}")))?;
    if !status.success() {
        return Err(JobError::Tool(format!("separator exited with {status}")));
    }
    Ok(())
}

/// Push produced stems to the remote mirror. Failures are reported but
/// never abort the beat.
async fn mirror_stems(ctx: &JobContext, channel: &str, beat: &str) {
    for stem in ctx.catalog.list_stems(channel, beat) {
        let local = ctx.catalog.root().join(&stem.path);
        if let Err(e) = ctx.sync.mirror(&local).await {
            warn!(stem = %stem.name, "stem mirror failed: {e}");
            ctx.progress
                .push(ProgressEvent::error(format!("Remote upload failed for {}: {e}", stem.name)));
        }
    }
    // Files the suffix table does not know stay on disk but out of the
    // typed listings.
    let iso_dir = ctx.catalog.isolated_dir(channel, beat);
    if let Ok(entries) = std::fs::read_dir(&iso_dir) {
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let StemMatch::Unrecognized(tag) = classify(&name) {
                debug!(%beat, file = %name, %tag, "unrecognized separator output");
            }
        }
    }
}

fn percent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)%").expect("hardcoded pattern"))
}

fn parse_percent(line: &str) -> Option<f32> {
    percent_regex()
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
        .filter(|pct| (0.0..=100.0).contains(pct))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("  37%|████      | 112/300"), Some(37.0));
        assert_eq!(parse_percent("no numbers here"), None);
        assert_eq!(parse_percent("999% nonsense"), None);
        assert_eq!(parse_percent("100% done"), Some(100.0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_channel_run_reports_stepped_progress() {
        use crate::catalog::{Catalog, ISOLATED_DIR};
        use crate::events::{progress_channel, NextEvent};
        use crate::storage::StorageSync;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("downloads");
        for beat in ["one", "three", "two"] {
            let beat_dir = root.join("chan").join(beat);
            std::fs::create_dir_all(&beat_dir).unwrap();
            std::fs::write(beat_dir.join(format!("{beat}.mp3")), b"audio").unwrap();
        }

        // Stand-in separator: emits tool-style output and drops one
        // stem file into the requested output directory.
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let fake = bin.join(SEPARATOR_BIN);
        std::fs::write(
            &fake,
            concat!(
                "#!/bin/sh\n",
                "src=\"$1\"\n",
                "out=\"\"\n",
                "prev=\"\"\n",
                "for arg in \"$@\"; do\n",
                "  [ \"$prev\" = \"--output_dir\" ] && out=\"$arg\"\n",
                "  prev=\"$arg\"\n",
                "done\n",
                "base=$(basename \"$src\" .mp3)\n",
                "echo \" 50%|#####     |\"\n",
                "echo \"100%|##########|\"\n",
                "touch \"$out/${base}_(Vocals).mp3\"\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        let old_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{old_path}", bin.display()));

        let (progress, mut rx) = progress_channel();
        let ctx = JobContext {
            job_id: uuid::Uuid::new_v4(),
            progress,
            cancellation: CancellationToken::new(),
            catalog: Catalog::new(root.clone()),
            sync: Arc::new(StorageSync::new(root.clone(), None)),
        };
        run(
            &ctx,
            IsolateRequest {
                folder: "chan".to_string(),
                beat: None,
            },
        )
        .await
        .unwrap();
        drop(ctx);

        let mut progress_values = Vec::new();
        let mut terminal = None;
        loop {
            match rx.next(Duration::from_millis(200)).await {
                NextEvent::Event(e) => {
                    if let Some(p) = e.progress {
                        progress_values.push(p);
                    }
                    if e.is_terminal() {
                        terminal = Some(e);
                    }
                }
                NextEvent::KeepAlive | NextEvent::Closed => break,
            }
        }

        assert_eq!(progress_values.len(), 4);
        assert!(progress_values[0].abs() < 0.5);
        assert!((progress_values[1] - 33.3).abs() < 0.5);
        assert!((progress_values[2] - 66.7).abs() < 0.5);
        assert_eq!(progress_values[3], 100.0);
        let terminal = terminal.unwrap();
        assert!(terminal.error.is_none());
        for beat in ["one", "two", "three"] {
            let stem = root
                .join("chan")
                .join(beat)
                .join(ISOLATED_DIR)
                .join(format!("{beat}_(Vocals).mp3"));
            assert!(stem.is_file());
        }
    }
}
