//! Client for the kie.ai Suno-compatible generation API.

use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::path::Path;

const DEFAULT_BASE_URL: &str = "https://api.kie.ai/api/v1";
const COVER_MODEL: &str = "V4_5";

/// What a generation task is currently doing.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Pending,
    /// At least one generated track is available.
    Ready { audio_url: String },
    Failed(String),
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskHandle {
    task_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordInfo {
    status: String,
    #[serde(default)]
    response: Option<RecordResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordResponse {
    #[serde(default)]
    suno_data: Vec<SunoTrack>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SunoTrack {
    #[serde(default)]
    audio_url: Option<String>,
}

/// Parameters for one upload-cover request.
pub struct CoverTask<'a> {
    /// Publicly reachable URL of the source audio.
    pub upload_url: &'a str,
    pub prompt: &'a str,
    pub instrumental: bool,
    pub callback_url: Option<&'a str>,
}

pub struct KieClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl KieClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
        }
    }

    /// Point the client at a different API root. Test hook.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Submit a cover-generation task. Returns the task id to poll.
    pub async fn start_cover(&self, task: &CoverTask<'_>) -> anyhow::Result<String> {
        let mut body = serde_json::json!({
            "uploadUrl": task.upload_url,
            "prompt": task.prompt,
            "customMode": false,
            "instrumental": task.instrumental,
            "model": COVER_MODEL,
        });
        if let Some(cb) = task.callback_url {
            body["callBackUrl"] = serde_json::json!(cb);
        }

        let envelope: ApiEnvelope<TaskHandle> = self
            .client
            .post(format!("{}/generate/upload-cover", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("cover generation request failed")?
            .error_for_status()
            .context("cover generation request rejected")?
            .json()
            .await
            .context("undecodable cover generation response")?;

        if envelope.code != 200 {
            return Err(anyhow!(
                "generation API error {}: {}",
                envelope.code,
                envelope.msg.unwrap_or_default()
            ));
        }
        envelope
            .data
            .map(|d| d.task_id)
            .ok_or_else(|| anyhow!("generation API returned no task id"))
    }

    /// Poll a task's state.
    pub async fn record_info(&self, task_id: &str) -> anyhow::Result<TaskState> {
        let envelope: ApiEnvelope<RecordInfo> = self
            .client
            .get(format!("{}/generate/record-info", self.base_url))
            .query(&[("taskId", task_id)])
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("task status request failed")?
            .error_for_status()
            .context("task status request rejected")?
            .json()
            .await
            .context("undecodable task status response")?;

        let info = envelope
            .data
            .ok_or_else(|| anyhow!("task status response carried no data"))?;

        let state = match info.status.as_str() {
            "SUCCESS" | "FIRST_SUCCESS" => {
                let audio_url = info
                    .response
                    .and_then(|r| r.suno_data.into_iter().find_map(|t| t.audio_url));
                match audio_url {
                    Some(audio_url) => TaskState::Ready { audio_url },
                    None => TaskState::Failed("task succeeded without audio".to_string()),
                }
            }
            "CREATE_TASK_FAILED" | "GENERATE_AUDIO_FAILED" => {
                TaskState::Failed(format!("generation failed ({})", info.status))
            }
            "SENSITIVE_WORD_ERROR" => {
                TaskState::Failed("prompt rejected by content filter".to_string())
            }
            _ => TaskState::Pending,
        };
        Ok(state)
    }

    /// Fetch a generated track to a local file.
    pub async fn download_audio(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .context("audio download failed")?
            .error_for_status()
            .context("audio download rejected")?
            .bytes()
            .await
            .context("audio download interrupted")?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("cannot write {}", dest.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> KieClient {
        KieClient::new("key".to_string()).with_base_url(server.uri())
    }

    #[tokio::test]
    async fn test_start_cover_returns_task_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate/upload-cover"))
            .and(body_partial_json(serde_json::json!({
                "customMode": false,
                "model": "V4_5",
                "instrumental": true,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 200,
                "msg": "success",
                "data": {"taskId": "task-1"}
            })))
            .mount(&server)
            .await;

        let task_id = client(&server)
            .start_cover(&CoverTask {
                upload_url: "https://example.com/a.mp3",
                prompt: "lofi hip hop",
                instrumental: true,
                callback_url: None,
            })
            .await
            .unwrap();
        assert_eq!(task_id, "task-1");
    }

    #[tokio::test]
    async fn test_start_cover_surfaces_api_error_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate/upload-cover"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 430,
                "msg": "insufficient credits"
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .start_cover(&CoverTask {
                upload_url: "https://example.com/a.mp3",
                prompt: "jazz",
                instrumental: false,
                callback_url: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("430"));
    }

    #[tokio::test]
    async fn test_start_cover_handles_bare_error_envelope() {
        // Some API errors come back with code only, neither msg nor data.
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate/upload-cover"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"code": 500})),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .start_cover(&CoverTask {
                upload_url: "https://example.com/a.mp3",
                prompt: "rock",
                instrumental: true,
                callback_url: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_record_info_state_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/generate/record-info"))
            .and(query_param("taskId", "t-pending"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 200, "data": {"status": "PENDING"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/generate/record-info"))
            .and(query_param("taskId", "t-done"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 200,
                "data": {
                    "status": "SUCCESS",
                    "response": {"sunoData": [{"audioUrl": "https://cdn/x.mp3"}]}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/generate/record-info"))
            .and(query_param("taskId", "t-filtered"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 200, "data": {"status": "SENSITIVE_WORD_ERROR"}
            })))
            .mount(&server)
            .await;

        let kie = client(&server);
        assert_eq!(kie.record_info("t-pending").await.unwrap(), TaskState::Pending);
        assert_eq!(
            kie.record_info("t-done").await.unwrap(),
            TaskState::Ready {
                audio_url: "https://cdn/x.mp3".to_string()
            }
        );
        assert!(matches!(
            kie.record_info("t-filtered").await.unwrap(),
            TaskState::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_download_audio_writes_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/track.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"mp3-bytes".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("covers/out.mp3");
        client(&server)
            .download_audio(&format!("{}/track.mp3", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"mp3-bytes");
    }
}
