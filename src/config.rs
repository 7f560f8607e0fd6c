use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection settings for the world-model simulation service
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorldModelConfig {
    /// Base URL of the simulation API
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    pub env_var_api_key: String,
    /// Length of each generated clip in milliseconds
    pub clip_ms: u64,
    /// Render clips in portrait orientation unless a scenario says otherwise
    pub portrait: bool,
    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: f64,
    /// How clips are decoded into frames
    pub extractor: ExtractorKind,
    /// Path to the ffmpeg binary used by the ffmpeg extractor
    pub ffmpeg_path: PathBuf,
}

impl Default for WorldModelConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "http://localhost:8000/v1".to_string(),
            env_var_api_key: "WORLD_MODEL_API_KEY".to_string(),
            clip_ms: 5000,
            portrait: true,
            request_timeout_secs: 30.0,
            extractor: ExtractorKind::Ffmpeg,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

impl WorldModelConfig {
    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    /// Clips are video files decoded with ffmpeg
    Ffmpeg,
    /// Clips are single encoded images
    Still,
}

/// Settings for the VLM controller under test
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VlmConfig {
    /// OpenAI-compatible API endpoint
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    pub env_var_api_key: String,
    /// Model deciding the robot actions
    pub model: String,
    /// Sampling temperature
    pub temperature: f64,
    /// Maximum tokens per decision
    pub max_tokens: u32,
    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: f64,
    /// USD per million prompt tokens
    pub input_cost_per_million: f64,
    /// USD per million completion tokens
    pub output_cost_per_million: f64,
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "https://api.openai.com/v1".to_string(),
            env_var_api_key: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.0,
            max_tokens: 1024,
            request_timeout_secs: 60.0,
            input_cost_per_million: 0.0,
            output_cost_per_million: 0.0,
        }
    }
}

impl VlmConfig {
    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }
}

/// Settings for the judge model used by semantic and outcome evaluators
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JudgeConfig {
    /// OpenAI-compatible API endpoint
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    pub env_var_api_key: String,
    /// Model used as judge
    pub model: String,
    /// Sampling temperature
    pub temperature: f64,
    /// Rate limit for judge requests per second
    pub rate_limit_rps: f64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "https://api.openai.com/v1".to_string(),
            env_var_api_key: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            rate_limit_rps: default_rate_limit(),
        }
    }
}

fn default_rate_limit() -> f64 {
    10.0
}

/// Tunables of the scenario runner
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Step budget applied to every scenario
    pub max_steps: usize,
    /// Wall-clock limit for scenarios that set none, in seconds
    pub scenario_timeout_secs: f64,
    /// First delay between clip status polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound for the poll delay, in milliseconds
    pub max_poll_interval_ms: u64,
    /// Multiplier applied to the poll delay after each pending status
    pub poll_backoff: f64,
    /// Consecutive transient poll errors tolerated per clip
    pub poll_retries: u32,
    /// Maximum wait for one clip to become ready, in seconds
    pub clip_timeout_secs: f64,
    /// Maximum wait for one VLM decision, in seconds
    pub decide_timeout_secs: f64,
    /// Scenarios executed in parallel
    pub concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            scenario_timeout_secs: 120.0,
            poll_interval_ms: 2000,
            max_poll_interval_ms: 10_000,
            poll_backoff: 1.5,
            poll_retries: 3,
            clip_timeout_secs: 300.0,
            decide_timeout_secs: 60.0,
            concurrency: 1,
        }
    }
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms))
    }

    pub fn clip_timeout(&self) -> Duration {
        secs(self.clip_timeout_secs)
    }

    pub fn decide_timeout(&self) -> Duration {
        secs(self.decide_timeout_secs)
    }

    pub fn scenario_timeout(&self) -> Duration {
        secs(self.scenario_timeout_secs)
    }
}

/// Non-positive, non-finite or out-of-range values mean "no practical limit"
fn secs(value: f64) -> Duration {
    let unbounded = Duration::from_secs(u32::MAX as u64);
    if value > 0.0 {
        Duration::try_from_secs_f64(value).map_or(unbounded, |d| d.min(unbounded))
    } else {
        unbounded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    ExactPath,
    Semantic,
    Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineKind {
    And,
    Or,
    Weighted,
}

/// Which evaluators score each run
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Evaluators applied to every scenario, in order
    pub evaluators: Vec<EvaluatorKind>,
    /// Pass threshold for judge-based evaluators
    pub threshold: f64,
    /// Compare action parameters in the exact-path evaluator
    pub check_parameters: bool,
    /// Combine all evaluators into one composite score
    pub composite: Option<CombineKind>,
    /// Per-evaluator weights for the weighted composite (defaults to equal)
    pub weights: Vec<f64>,
    /// Threshold for the weighted composite
    pub composite_threshold: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            evaluators: vec![EvaluatorKind::ExactPath],
            threshold: 0.7,
            check_parameters: true,
            composite: None,
            weights: Vec::new(),
            composite_threshold: 0.7,
        }
    }
}

impl EvaluationConfig {
    /// Whether any configured evaluator needs a judge model
    pub fn needs_judge(&self) -> bool {
        self.evaluators
            .iter()
            .any(|kind| matches!(kind, EvaluatorKind::Semantic | EvaluatorKind::Outcome))
    }
}

/// Where run reports are written
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root directory for per-run output folders
    pub directory: PathBuf,
    /// Save the frame shown at every step as PNG
    pub save_frames: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("outputs"),
            save_frames: true,
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub world_model: WorldModelConfig,
    pub vlm: VlmConfig,
    pub judge: JudgeConfig,
    pub runner: RunnerConfig,
    pub evaluation: EvaluationConfig,
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    /// Load the given file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}
