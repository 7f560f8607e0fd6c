use crate::error::StepError;
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A robot action expressed as a tool call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    /// Tool name (e.g. "move_forward")
    pub name: String,
    /// Tool arguments by parameter name
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Free text returned instead of a tool call, if any
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_text: String,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Action for a model reply that carried no tool call
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            name: "unknown".to_string(),
            parameters: BTreeMap::new(),
            raw_text: text.into(),
        }
    }

    /// `done` and `stop` end a run instead of driving the world model
    pub fn is_terminal(&self) -> bool {
        matches!(self.name.to_ascii_lowercase().as_str(), "done" | "stop")
    }

    /// Instruction text sent to the world model for this action
    pub fn to_interact_prompt(&self) -> String {
        if !self.raw_text.is_empty() {
            return self.raw_text.clone();
        }
        let mut parts = vec![self.name.clone()];
        for (key, value) in &self.parameters {
            parts.push(format!("{}={}", key, format_value(value)));
        }
        parts.join(" ")
    }

    /// Compact call notation, e.g. `pick_up(object=cup)`
    pub fn describe(&self) -> String {
        let args: Vec<String> = self
            .parameters
            .iter()
            .map(|(key, value)| format!("{}={}", key, format_value(value)))
            .collect();
        format!("{}({})", self.name, args.join(", "))
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && params_match(&self.parameters, &other.parameters)
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn params_match(a: &BTreeMap<String, Value>, b: &BTreeMap<String, Value>) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(key, value)| b.get(key).is_some_and(|other| values_match(value, other)))
}

/// JSON equality where `10` and `10.0` compare equal
fn values_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_match(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| values_match(x, y)))
        }
        _ => a == b,
    }
}

/// Tool definition offered to the VLM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool arguments
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// A test case for the VLM controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique scenario name
    pub name: String,
    /// Scene description used for the first clip and as the task text
    pub prompt: String,
    /// Ground-truth action sequence
    #[serde(default)]
    pub expected_actions: Vec<Action>,
    /// Natural-language success criteria for judge-based evaluators
    #[serde(default)]
    pub success_criteria: String,
    /// Upper bound on recorded steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
    /// Wall-clock limit for the whole run, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    /// Seed image reference (URL or data URL) for the first clip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Render clips in portrait orientation (world model default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portrait: Option<bool>,
    /// System instruction for the VLM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Tools offered to the VLM; the default robot vocabulary when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            expected_actions: Vec::new(),
            success_criteria: String::new(),
            max_steps: None,
            timeout_secs: None,
            image: None,
            portrait: None,
            system_prompt: None,
            tags: Vec::new(),
            tools: None,
        }
    }

    pub fn with_expected_actions(mut self, actions: Vec<Action>) -> Self {
        self.expected_actions = actions;
        self
    }

    pub fn with_success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = criteria.into();
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    /// Effective step bound given a caller budget
    pub fn step_bound(&self, budget: usize) -> usize {
        self.max_steps.map_or(budget, |max| max.min(budget))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// One decision returned by a VLM backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlmResponse {
    pub action: Action,
    /// The backend considers the task finished
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl VlmResponse {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            done: false,
            rationale: None,
            latency_ms: 0.0,
            cost_usd: 0.0,
        }
    }

    /// A response that also ends the run
    pub fn finished(action: Action) -> Self {
        Self {
            done: true,
            ..Self::new(action)
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}

/// Record of one iteration of the control loop
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Zero-based, contiguous within a trajectory
    pub step_index: usize,
    /// Prompt sent to the world model for this step's clip
    pub prompt: String,
    /// Last frame of the clip, as shown to the VLM
    #[serde(skip)]
    pub frame: Arc<Frame>,
    /// Frame dimensions as [width, height]
    pub frame_size: [u32; 2],
    pub response: VlmResponse,
    /// Transient errors recovered while producing this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn new(step_index: usize, prompt: String, frame: Arc<Frame>, response: VlmResponse) -> Self {
        let frame_size = [frame.width(), frame.height()];
        Self {
            step_index,
            prompt,
            frame,
            frame_size,
            response,
            error: None,
        }
    }

    pub fn action(&self) -> &Action {
        &self.response.action
    }
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Done,
    MaxSteps,
    Timeout,
    Error,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Done => "done",
            TerminationReason::MaxSteps => "max_steps",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Error => "error",
        }
    }
}

/// Terminal state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// The step at which a run failed and why
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFailure {
    pub step_index: usize,
    pub error: StepError,
}

/// Score produced by one evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalScore {
    /// Name of the evaluator that produced this score
    pub evaluator: String,
    /// Normalized score in [0, 1]; absent when the evaluator itself failed
    pub score: Option<f64>,
    pub passed: bool,
    pub explanation: String,
    #[serde(default)]
    pub details: Value,
}

impl EvalScore {
    pub fn new(evaluator: impl Into<String>, score: f64, passed: bool, explanation: impl Into<String>) -> Self {
        Self {
            evaluator: evaluator.into(),
            score: Some(score.clamp(0.0, 1.0)),
            passed,
            explanation: explanation.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Placeholder for an evaluator that could not produce a score
    pub fn errored(evaluator: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            evaluator: evaluator.into(),
            score: None,
            passed: false,
            explanation: format!("evaluator failed: {:#}", error),
            details: Value::Null,
        }
    }

    /// Numeric score, counting a missing score as 0
    pub fn value(&self) -> f64 {
        self.score.unwrap_or(0.0)
    }
}

/// Full trajectory and verdict of one scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: Scenario,
    pub steps: Vec<StepResult>,
    pub status: RunStatus,
    pub termination: TerminationReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    pub scores: Vec<EvalScore>,
    passed: bool,
    /// Wall time of the run, evaluation excluded
    pub wall_time_ms: f64,
    /// Sum of VLM call latencies
    pub total_latency_ms: f64,
    pub total_cost_usd: f64,
    /// Most recent frame observed, if any clip was rendered
    #[serde(skip)]
    pub final_frame: Option<Arc<Frame>>,
}

impl ScenarioResult {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            steps: Vec::new(),
            status: RunStatus::Completed,
            termination: TerminationReason::Done,
            failure: None,
            scores: Vec::new(),
            passed: false,
            wall_time_ms: 0.0,
            total_latency_ms: 0.0,
            total_cost_usd: 0.0,
            final_frame: None,
        }
    }

    /// Append the next step; indices must stay contiguous
    pub fn push_step(&mut self, mut step: StepResult) {
        step.step_index = self.steps.len();
        self.steps.push(step);
    }

    /// Count a VLM call toward the run totals
    pub fn add_usage(&mut self, response: &VlmResponse) {
        self.total_latency_ms += response.latency_ms;
        self.total_cost_usd += response.cost_usd;
    }

    /// Mark the run as failed at `step_index`
    pub fn fail(&mut self, step_index: usize, error: StepError) {
        self.status = RunStatus::Failed;
        self.termination = if error.is_timeout() {
            TerminationReason::Timeout
        } else {
            TerminationReason::Error
        };
        self.failure = Some(StepFailure { step_index, error });
    }

    pub fn actions(&self) -> Vec<&Action> {
        self.steps.iter().map(|s| s.action()).collect()
    }

    /// Attach evaluator scores and derive the verdict from them.
    ///
    /// Without evaluators a run passes iff it completed.
    pub fn record_scores(&mut self, scores: Vec<EvalScore>) {
        self.passed = if scores.is_empty() {
            self.status == RunStatus::Completed
        } else {
            scores.iter().all(|s| s.passed)
        };
        self.scores = scores;
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn score(&self, evaluator: &str) -> Option<&EvalScore> {
        self.scores.iter().find(|s| s.evaluator == evaluator)
    }

    pub fn error_message(&self) -> Option<String> {
        self.failure.as_ref().map(|f| f.error.to_string())
    }
}
