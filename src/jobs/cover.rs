//! AI cover generation worker.
//!
//! Takes a set of isolated stems, hands one of them to the remote
//! generation API as source audio, polls until a track is ready and
//! stores the result under the beat's `ai_covers/` folder. Progress is
//! coarse milestones; the remote API exposes no percentage.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::catalog::{StemFile, StemType};
use crate::events::ProgressEvent;
use crate::kie::{CoverTask, KieClient, TaskState};

use super::naming::sanitize_name;
use super::{CoverRequest, JobContext, JobError, StemSelector};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const POLL_DEADLINE: Duration = Duration::from_secs(600);
const STYLE_TAG_MAX: usize = 30;

/// External collaborators of the cover worker.
#[derive(Clone, Default)]
pub struct CoverDeps {
    pub kie: Option<Arc<KieClient>>,
    /// Base URL this server is reachable at, for the serve-audio
    /// fallback when no remote mirror exists.
    pub public_base_url: Option<String>,
}

pub async fn run(ctx: &JobContext, request: CoverRequest, deps: &CoverDeps) -> Result<(), JobError> {
    let kie = deps
        .kie
        .as_ref()
        .ok_or_else(|| JobError::Validation("Cover generation is not configured".to_string()))?;

    ctx.progress.push(ProgressEvent::status("Validating stems..."));
    ctx.progress.push(ProgressEvent::progress(5.0));

    let available = ctx.catalog.list_stems(&request.channel, &request.beat);
    if available.is_empty() {
        return Err(JobError::Validation(format!(
            "No stems found for {}",
            request.beat
        )));
    }
    let selected =
        resolve_selectors(&available, &request.stems).map_err(JobError::Validation)?;

    let instrumental = !selected.iter().any(|s| s.stem_type == StemType::Vocals);
    let source = pick_prompt_stem(&selected);

    ctx.progress.push(ProgressEvent::status("Preparing source audio..."));
    ctx.progress.push(ProgressEvent::progress(10.0));
    let upload_url = public_audio_url(ctx, deps, source).await?;

    let style = request.genre.as_deref().unwrap_or("creative");
    let prompt = format!("A {style} cover version of this track");

    ctx.progress.push(ProgressEvent::status("Submitting generation task..."));
    ctx.progress.push(ProgressEvent::progress(25.0));
    let task_id = kie
        .start_cover(&CoverTask {
            upload_url: &upload_url,
            prompt: &prompt,
            instrumental,
            callback_url: None,
        })
        .await?;
    info!(%ctx.job_id, task_id, "generation task submitted");

    ctx.progress.push(ProgressEvent::status("Generating cover..."));
    ctx.progress.push(ProgressEvent::progress(50.0));
    let audio_url = poll_until_ready(kie, &task_id).await?;

    ctx.progress.push(ProgressEvent::status("Retrieving result..."));
    ctx.progress.push(ProgressEvent::progress(90.0));
    let file_name = cover_file_name(request.genre.as_deref(), chrono::Utc::now().timestamp());
    let dest: PathBuf = ctx
        .catalog
        .covers_dir(&request.channel, &request.beat)
        .join(&file_name);
    kie.download_audio(&audio_url, &dest).await?;

    if let Err(e) = ctx.sync.mirror(&dest).await {
        warn!(file = %file_name, "cover mirror failed: {e}");
        ctx.progress
            .push(ProgressEvent::error(format!("Remote upload failed for {file_name}: {e}")));
    }

    ctx.progress.push(ProgressEvent::progress(100.0));
    ctx.progress.push(
        ProgressEvent::done("AI cover generated!").with(
            "file",
            serde_json::json!(format!(
                "{}/{}/ai_covers/{}",
                request.channel, request.beat, file_name
            )),
        ),
    );
    Ok(())
}

async fn poll_until_ready(kie: &KieClient, task_id: &str) -> Result<String, JobError> {
    let deadline = Instant::now() + POLL_DEADLINE;
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        if Instant::now() >= deadline {
            return Err(JobError::Tool(format!(
                "generation timed out after {}s",
                POLL_DEADLINE.as_secs()
            )));
        }
        match kie.record_info(task_id).await? {
            TaskState::Pending => continue,
            TaskState::Ready { audio_url } => return Ok(audio_url),
            TaskState::Failed(reason) => return Err(JobError::Tool(reason)),
        }
    }
}

/// A URL the generation API can fetch the source stem from.
///
/// With a remote mirror the stem is uploaded (if missing) and its raw
/// URL used. Otherwise the server's own serve-audio route is offered,
/// which requires a publicly reachable base URL.
async fn public_audio_url(
    ctx: &JobContext,
    deps: &CoverDeps,
    stem: &StemFile,
) -> Result<String, JobError> {
    if let Some(remote) = ctx.sync.remote() {
        if remote.exists(&stem.path).await? {
            return Ok(remote.public_url(&stem.path));
        }
        let local = ctx.catalog.root().join(&stem.path);
        return Ok(remote.upload(&local, &stem.path).await?);
    }

    let base = deps.public_base_url.as_deref().ok_or_else(|| {
        JobError::Tool(
            "No remote storage and no public base URL; the generation API cannot reach the audio"
                .to_string(),
        )
    })?;
    if base.contains("localhost") || base.contains("127.0.0.1") {
        return Err(JobError::Tool(format!(
            "Public base URL {base} is not reachable from outside; configure a public address or remote storage"
        )));
    }
    Ok(serve_audio_url(base, &stem.path))
}

fn serve_audio_url(base: &str, path: &str) -> String {
    let encoded = path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/serve-audio/{}", base.trim_end_matches('/'), encoded)
}

/// Match each requested selector against the live stem listing.
fn resolve_selectors(
    available: &[StemFile],
    selectors: &[StemSelector],
) -> Result<Vec<StemFile>, String> {
    let mut selected = Vec::new();
    for selector in selectors {
        let found = available.iter().find(|stem| {
            if let Some(name) = selector.name() {
                return stem.name == name;
            }
            if let Some(hint) = selector.type_hint() {
                return stem.stem_type.as_str().eq_ignore_ascii_case(hint);
            }
            false
        });
        match found {
            Some(stem) => {
                if !selected.iter().any(|s: &StemFile| s.name == stem.name) {
                    selected.push(stem.clone());
                }
            }
            None => {
                let wanted = selector
                    .name()
                    .or_else(|| selector.type_hint())
                    .unwrap_or("<unspecified>");
                return Err(format!("Requested stem not found: {wanted}"));
            }
        }
    }
    Ok(selected)
}

/// The stem whose audio seeds the generation, by musical usefulness.
fn pick_prompt_stem(selected: &[StemFile]) -> &StemFile {
    const PRIORITY: [StemType; 4] = [
        StemType::Vocals,
        StemType::Drums,
        StemType::Bass,
        StemType::Sample,
    ];
    for wanted in PRIORITY {
        if let Some(stem) = selected.iter().find(|s| s.stem_type == wanted) {
            return stem;
        }
    }
    // resolve_selectors never yields an empty set for a non-empty
    // request, so index 0 exists.
    &selected[0]
}

fn cover_file_name(genre: Option<&str>, timestamp: i64) -> String {
    let tag = genre.unwrap_or("Cover");
    let tag = sanitize_name(tag).replace(' ', "_");
    let tag: String = tag.chars().take(STYLE_TAG_MAX).collect();
    let tag = if tag.is_empty() { "Cover".to_string() } else { tag };
    format!("AI_Cover_{tag}_{timestamp}.mp3")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stem(name: &str, stem_type: StemType) -> StemFile {
        StemFile {
            name: name.to_string(),
            stem_type,
            path: format!("chan/beat/isolated_samples/{name}"),
            remote_url: None,
        }
    }

    #[test]
    fn test_resolve_by_name_and_type() {
        let available = vec![
            stem("b_(Vocals).mp3", StemType::Vocals),
            stem("b_(Drums).mp3", StemType::Drums),
        ];
        let selected = resolve_selectors(
            &available,
            &[
                StemSelector::Name("b_(Vocals).mp3".to_string()),
                StemSelector::Detailed {
                    name: None,
                    stem_type: Some("drums".to_string()),
                },
            ],
        )
        .unwrap();
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_missing_stem_is_an_error() {
        let available = vec![stem("b_(Drums).mp3", StemType::Drums)];
        let err = resolve_selectors(
            &available,
            &[StemSelector::Name("b_(Vocals).mp3".to_string())],
        )
        .unwrap_err();
        assert!(err.contains("b_(Vocals).mp3"));
    }

    #[test]
    fn test_prompt_stem_priority() {
        let selected = vec![
            stem("b_(Other).mp3", StemType::Sample),
            stem("b_(Bass).mp3", StemType::Bass),
            stem("b_(Drums).mp3", StemType::Drums),
        ];
        assert_eq!(pick_prompt_stem(&selected).stem_type, StemType::Drums);

        let with_vocals = vec![
            stem("b_(Drums).mp3", StemType::Drums),
            stem("b_(Vocals).mp3", StemType::Vocals),
        ];
        assert_eq!(pick_prompt_stem(&with_vocals).stem_type, StemType::Vocals);
    }

    #[test]
    fn test_cover_file_name_shape() {
        assert_eq!(
            cover_file_name(Some("lofi hip hop"), 1700000000),
            "AI_Cover_lofi_hip_hop_1700000000.mp3"
        );
        assert_eq!(cover_file_name(None, 5), "AI_Cover_Cover_5.mp3");
        let long = "x".repeat(60);
        let name = cover_file_name(Some(&long), 1);
        assert_eq!(name, format!("AI_Cover_{}_1.mp3", "x".repeat(30)));
    }

    #[test]
    fn test_serve_audio_url_encodes_segments() {
        let url = serve_audio_url(
            "https://beats.example.com/",
            "chan/My Beat/isolated_samples/My Beat_(Vocals).mp3",
        );
        assert_eq!(
            url,
            "https://beats.example.com/serve-audio/chan/My%20Beat/isolated_samples/My%20Beat_%28Vocals%29.mp3"
        );
    }
}
