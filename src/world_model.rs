use crate::config::WorldModelConfig;
use crate::frame::Frame;
use crate::models::Action;
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

/// Errors reported by a world-model adapter
#[derive(Debug, thiserror::Error)]
pub enum WorldModelError {
    /// Connection problems or server-side errors worth retrying
    #[error("transient world model error: {0}")]
    Transient(String),

    /// The service refused the request
    #[error("world model rejected request: {0}")]
    Rejected(String),

    /// The service answered with something we could not interpret
    #[error("invalid world model response: {0}")]
    InvalidResponse(String),
}

impl WorldModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WorldModelError::Transient(_))
    }
}

/// Opaque identifier of a clip generation job
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(pub String);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Ready,
    Failed(String),
}

/// Image the clip starts from
#[derive(Debug, Clone)]
pub enum Seed {
    /// URL or data URL supplied by the scenario author
    Reference(String),
    /// Last frame of the previous clip
    Frame(Arc<Frame>),
}

/// Everything the world model needs to render one clip
#[derive(Debug, Clone)]
pub struct ClipRequest {
    pub prompt: String,
    /// Action chosen at the previous step, absent for the first clip
    pub prior_action: Option<Action>,
    pub seed: Option<Seed>,
    pub portrait: Option<bool>,
}

impl ClipRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            prior_action: None,
            seed: None,
            portrait: None,
        }
    }
}

/// Simulate / poll / download API of a world-model service
#[async_trait]
pub trait WorldModel: Send + Sync {
    async fn start_clip(&self, request: &ClipRequest) -> Result<JobHandle, WorldModelError>;

    async fn poll_status(&self, job: &JobHandle) -> Result<JobStatus, WorldModelError>;

    async fn fetch_clip(&self, job: &JobHandle) -> Result<Vec<u8>, WorldModelError>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobStream {
    video_url: String,
}

#[derive(Debug, Deserialize)]
struct JobDetail {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    streams: Vec<JobStream>,
}

/// HTTP client for a job-based video simulation service.
///
/// Clips are submitted as a two-event script (start with prompt and seed
/// image, end after `clip_ms`), then polled until the job completes and
/// downloaded from the first stream URL.
#[derive(Debug, Clone)]
pub struct SimulationClient {
    base_url: String,
    api_key: Option<String>,
    clip_ms: u64,
    default_portrait: bool,
    client: reqwest::Client,
}

impl SimulationClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            clip_ms: 5000,
            default_portrait: true,
            client: reqwest::Client::new(),
        }
    }

    /// Build a client from configuration, reading the API key from the environment
    pub fn from_config(config: &WorldModelConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.env_var_api_key).with_context(|| {
            format!("Environment variable {} not found", config.env_var_api_key)
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build world model HTTP client")?;

        Ok(Self {
            base_url: config.api_endpoint.trim_end_matches('/').to_string(),
            api_key: Some(api_key),
            clip_ms: config.clip_ms,
            default_portrait: config.portrait,
            client,
        })
    }

    pub fn with_clip_ms(mut self, clip_ms: u64) -> Self {
        self.clip_ms = clip_ms;
        self
    }

    fn build_script(&self, request: &ClipRequest) -> Result<Value, WorldModelError> {
        let mut start = json!({ "prompt": request.prompt });
        let image = match &request.seed {
            Some(Seed::Reference(reference)) => Some(reference.clone()),
            Some(Seed::Frame(frame)) => Some(
                frame
                    .to_data_url()
                    .map_err(|e| WorldModelError::InvalidResponse(e.to_string()))?,
            ),
            None => None,
        };
        if let Some(image) = image {
            start["image"] = json!(image);
        }
        if let Some(action) = &request.prior_action {
            start["action"] = json!(action.to_interact_prompt());
        }

        Ok(json!({
            "script": [
                { "timestamp_ms": 0, "start": start },
                { "timestamp_ms": self.clip_ms, "end": {} },
            ],
            "portrait": request.portrait.unwrap_or(self.default_portrait),
        }))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn get_job(&self, job: &JobHandle) -> Result<JobDetail, WorldModelError> {
        let url = format!("{}/simulations/{}", self.base_url, job);
        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;
        resp.json::<JobDetail>()
            .await
            .map_err(|e| WorldModelError::InvalidResponse(e.to_string()))
    }
}

fn transport_error(err: reqwest::Error) -> WorldModelError {
    WorldModelError::Transient(err.to_string())
}

/// 5xx and 429 are retryable, other 4xx are not
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, WorldModelError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(WorldModelError::Transient(message))
    } else {
        Err(WorldModelError::Rejected(message))
    }
}

#[async_trait]
impl WorldModel for SimulationClient {
    async fn start_clip(&self, request: &ClipRequest) -> Result<JobHandle, WorldModelError> {
        let body = self.build_script(request)?;
        let url = format!("{}/simulations", self.base_url);
        let resp = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;
        let submitted: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| WorldModelError::InvalidResponse(e.to_string()))?;

        debug!(job_id = %submitted.job_id, "submitted simulation job");
        Ok(JobHandle(submitted.job_id))
    }

    async fn poll_status(&self, job: &JobHandle) -> Result<JobStatus, WorldModelError> {
        let detail = self.get_job(job).await?;
        match detail.status.to_ascii_lowercase().as_str() {
            "completed" => Ok(JobStatus::Ready),
            "failed" => Ok(JobStatus::Failed(
                detail
                    .error_message
                    .unwrap_or_else(|| "Simulation job failed".to_string()),
            )),
            "pending" | "queued" | "running" => Ok(JobStatus::Pending),
            other => Err(WorldModelError::InvalidResponse(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }

    async fn fetch_clip(&self, job: &JobHandle) -> Result<Vec<u8>, WorldModelError> {
        let detail = self.get_job(job).await?;
        let stream = detail.streams.first().ok_or_else(|| {
            WorldModelError::InvalidResponse(format!("job {} has no video streams", job))
        })?;

        let resp = self
            .client
            .get(&stream.video_url)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;
        let bytes = resp.bytes().await.map_err(transport_error)?;
        debug!(job_id = %job, bytes = bytes.len(), "downloaded clip");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_start_clip_posts_script() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/simulations")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::PartialJson(json!({
                "script": [
                    { "timestamp_ms": 0, "start": { "prompt": "a kitchen", "image": "https://img/seed.png" } },
                    { "timestamp_ms": 3000, "end": {} }
                ],
                "portrait": false
            })))
            .with_status(200)
            .with_body(r#"{"job_id": "job-1", "status": "pending"}"#)
            .create_async()
            .await;

        let client = SimulationClient::new(server.url(), Some("secret".to_string())).with_clip_ms(3000);
        let mut request = ClipRequest::new("a kitchen");
        request.seed = Some(Seed::Reference("https://img/seed.png".to_string()));
        request.portrait = Some(false);

        let job = client.start_clip(&request).await.unwrap();
        assert_eq!(job, JobHandle("job-1".to_string()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_poll_status_maps_states() {
        let mut server = mockito::Server::new_async().await;
        let _running = server
            .mock("GET", "/simulations/a")
            .with_body(r#"{"status": "running"}"#)
            .create_async()
            .await;
        let _done = server
            .mock("GET", "/simulations/b")
            .with_body(r#"{"status": "completed", "streams": [{"video_url": "http://x"}]}"#)
            .create_async()
            .await;
        let _failed = server
            .mock("GET", "/simulations/c")
            .with_body(r#"{"status": "failed", "error_message": "GPU fell over"}"#)
            .create_async()
            .await;

        let client = SimulationClient::new(server.url(), None);
        let status = |id: &str| JobHandle(id.to_string());
        assert_eq!(client.poll_status(&status("a")).await.unwrap(), JobStatus::Pending);
        assert_eq!(client.poll_status(&status("b")).await.unwrap(), JobStatus::Ready);
        assert_eq!(
            client.poll_status(&status("c")).await.unwrap(),
            JobStatus::Failed("GPU fell over".to_string())
        );
    }

    #[tokio::test]
    async fn test_server_errors_are_transient_client_errors_are_not() {
        let mut server = mockito::Server::new_async().await;
        let _busy = server
            .mock("GET", "/simulations/busy")
            .with_status(503)
            .create_async()
            .await;
        let _gone = server
            .mock("GET", "/simulations/gone")
            .with_status(404)
            .create_async()
            .await;

        let client = SimulationClient::new(server.url(), None);
        let busy = client.poll_status(&JobHandle("busy".to_string())).await.unwrap_err();
        assert!(busy.is_transient());
        let gone = client.poll_status(&JobHandle("gone".to_string())).await.unwrap_err();
        assert!(matches!(gone, WorldModelError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_fetch_clip_downloads_first_stream() {
        let mut server = mockito::Server::new_async().await;
        let video_url = format!("{}/videos/j.mp4", server.url());
        let _detail = server
            .mock("GET", "/simulations/j")
            .with_body(json!({"status": "completed", "streams": [{"video_url": video_url}]}).to_string())
            .create_async()
            .await;
        let _video = server
            .mock("GET", "/videos/j.mp4")
            .with_body(vec![1u8, 2, 3])
            .create_async()
            .await;

        let client = SimulationClient::new(server.url(), None);
        let bytes = client.fetch_clip(&JobHandle("j".to_string())).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fetch_clip_without_streams_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        let _detail = server
            .mock("GET", "/simulations/j")
            .with_body(r#"{"status": "completed", "streams": []}"#)
            .create_async()
            .await;

        let client = SimulationClient::new(server.url(), None);
        let err = client.fetch_clip(&JobHandle("j".to_string())).await.unwrap_err();
        assert!(matches!(err, WorldModelError::InvalidResponse(_)));
    }

    #[test]
    fn test_frame_seed_becomes_data_url() {
        let client = SimulationClient::new("http://localhost", None);
        let mut request = ClipRequest::new("next");
        request.seed = Some(Seed::Frame(Arc::new(Frame::solid(2, 2, [1, 2, 3]))));
        let script = client.build_script(&request).unwrap();
        let image = script["script"][0]["start"]["image"].as_str().unwrap();
        assert!(image.starts_with("data:image/png;base64,"));
        assert_eq!(script["portrait"], true);
    }

    #[test]
    fn test_from_config_requires_api_key() {
        let config = WorldModelConfig {
            env_var_api_key: "VLM_SIM_EVAL_TEST_MISSING_WM_KEY".to_string(),
            ..WorldModelConfig::default()
        };
        unsafe {
            std::env::remove_var(&config.env_var_api_key);
        }
        let err = SimulationClient::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_from_config_negative_timeout() {
        let config = WorldModelConfig {
            env_var_api_key: "VLM_SIM_EVAL_TEST_WM_KEY_NEGATIVE_TIMEOUT".to_string(),
            request_timeout_secs: -1.0,
            ..WorldModelConfig::default()
        };
        unsafe {
            std::env::set_var(&config.env_var_api_key, "test-key");
        }
        assert!(SimulationClient::from_config(&config).is_ok());
    }
}
