use crate::config::VlmConfig;
use crate::frame::Frame;
use crate::models::{Action, Scenario, ToolSpec, VlmResponse};
use anyhow::Context;
use async_openai::types::{
    ChatCompletionToolArgs, ChatCompletionToolType, CreateChatCompletionResponse, FunctionObjectArgs,
};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_SYSTEM_PROMPT: &str = "You control a robot inside a simulated scene. \
Each turn you see the latest camera frame. Choose exactly one tool call for the next action, \
and call `done` once the task is complete.";

/// Errors returned by a VLM backend
#[derive(Debug, thiserror::Error)]
pub enum VlmError {
    #[error("VLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection to VLM failed: {0}")]
    ConnectionFailed(String),

    #[error("VLM API error: {0}")]
    Api(String),

    #[error("invalid VLM response: {0}")]
    InvalidResponse(String),

    #[error("could not build VLM request: {0}")]
    InvalidRequest(String),
}

/// A controller that picks the next action from the current frame.
///
/// One instance serves one scenario run; backends may keep conversation
/// state between calls but never share it across instances.
#[async_trait]
pub trait VlmBackend: Send {
    async fn decide(
        &mut self,
        frame: &Frame,
        step_index: usize,
        scenario: &Scenario,
        history: &[Action],
    ) -> Result<VlmResponse, VlmError>;

    /// Release network resources and conversation state
    async fn close(&mut self) {}
}

/// Robot vocabulary offered when a scenario does not define its own tools
pub fn default_tools() -> Vec<ToolSpec> {
    let tool = |name: &str, description: &str, properties: Value| ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        parameters: json!({ "type": "object", "properties": properties }),
    };
    vec![
        tool(
            "move_forward",
            "Move the robot forward by a specified distance.",
            json!({ "distance": { "type": "number", "description": "Distance in meters" } }),
        ),
        tool(
            "turn",
            "Turn the robot by a specified angle.",
            json!({ "angle": { "type": "number", "description": "Angle in degrees (positive=left, negative=right)" } }),
        ),
        tool(
            "pick_up",
            "Pick up an object.",
            json!({ "object": { "type": "string", "description": "Name of the object to pick up" } }),
        ),
        tool(
            "place",
            "Place the held object at a location.",
            json!({ "location": { "type": "string", "description": "Where to place the object" } }),
        ),
        tool("done", "Signal that the task is complete.", json!({})),
    ]
}

/// Convert tool specs into OpenAI function-tool definitions
fn tool_definitions(tools: &[ToolSpec]) -> Result<Vec<Value>, VlmError> {
    tools
        .iter()
        .map(|tool| {
            let function = FunctionObjectArgs::default()
                .name(tool.name.clone())
                .description(tool.description.clone())
                .parameters(tool.parameters.clone())
                .build()
                .map_err(|e| VlmError::InvalidRequest(e.to_string()))?;
            let definition = ChatCompletionToolArgs::default()
                .r#type(ChatCompletionToolType::Function)
                .function(function)
                .build()
                .map_err(|e| VlmError::InvalidRequest(e.to_string()))?;
            serde_json::to_value(definition).map_err(|e| VlmError::InvalidRequest(e.to_string()))
        })
        .collect()
}

/// VLM backend for any OpenAI-compatible chat completions endpoint.
///
/// Sends the frame as a PNG data URL with the tool list and keeps the
/// conversation across steps, so the model sees its earlier decisions.
pub struct OpenAiVlmBackend {
    api_endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    /// USD per million prompt tokens
    input_cost_per_million: f64,
    /// USD per million completion tokens
    output_cost_per_million: f64,
    request_timeout: Duration,
    client: reqwest::Client,
    /// Prior turns, excluding the system message
    conversation: Vec<Value>,
}

impl OpenAiVlmBackend {
    pub fn new(api_endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_endpoint: api_endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.0,
            max_tokens: 1024,
            input_cost_per_million: 0.0,
            output_cost_per_million: 0.0,
            request_timeout: Duration::from_secs(60),
            client: reqwest::Client::new(),
            conversation: Vec::new(),
        }
    }

    /// Create a backend from configuration, reading the API key from the environment
    pub fn from_config(config: &VlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.env_var_api_key)
            .with_context(|| format!("Environment variable {} not found", config.env_var_api_key))?;
        let request_timeout = config.request_timeout();
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build VLM HTTP client")?;

        Ok(Self {
            api_endpoint: config.api_endpoint.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature as f32,
            max_tokens: config.max_tokens,
            input_cost_per_million: config.input_cost_per_million,
            output_cost_per_million: config.output_cost_per_million,
            request_timeout,
            client,
            conversation: Vec::new(),
        })
    }

    pub fn with_pricing(mut self, input_per_million: f64, output_per_million: f64) -> Self {
        self.input_cost_per_million = input_per_million;
        self.output_cost_per_million = output_per_million;
        self
    }

    fn user_turn(frame: &Frame, step_index: usize, scenario: &Scenario) -> Result<Value, VlmError> {
        let data_url = frame
            .to_data_url()
            .map_err(|e| VlmError::InvalidRequest(e.to_string()))?;
        let text = if step_index == 0 {
            format!(
                "Task: {}\nObserve the scene and decide the next robot action.",
                scenario.prompt
            )
        } else {
            "Observe the updated scene and decide the next robot action.".to_string()
        };

        Ok(json!({
            "role": "user",
            "content": [
                { "type": "image_url", "image_url": { "url": data_url } },
                { "type": "text", "text": text },
            ],
        }))
    }

    fn build_request(&self, scenario: &Scenario, user_turn: &Value) -> Result<Value, VlmError> {
        let tools = match &scenario.tools {
            Some(tools) if !tools.is_empty() => tool_definitions(tools)?,
            _ => tool_definitions(&default_tools())?,
        };
        let system = scenario
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        let mut messages = Vec::with_capacity(self.conversation.len() + 2);
        messages.push(json!({ "role": "system", "content": system }));
        messages.extend(self.conversation.iter().cloned());
        messages.push(user_turn.clone());

        Ok(json!({
            "model": self.model,
            "messages": messages,
            "tools": tools,
            "tool_choice": "auto",
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        }))
    }

    async fn send(&self, body: &Value) -> Result<CreateChatCompletionResponse, VlmError> {
        let url = format!("{}/chat/completions", self.api_endpoint);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VlmError::Timeout(self.request_timeout)
                } else {
                    VlmError::ConnectionFailed(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(VlmError::Api(format!("HTTP {}: {}", status.as_u16(), error_text.trim())));
        }

        resp.json::<CreateChatCompletionResponse>()
            .await
            .map_err(|e| VlmError::InvalidResponse(e.to_string()))
    }

    fn cost_of(&self, response: &CreateChatCompletionResponse) -> f64 {
        match &response.usage {
            Some(usage) => {
                (usage.prompt_tokens as f64 * self.input_cost_per_million
                    + usage.completion_tokens as f64 * self.output_cost_per_million)
                    / 1_000_000.0
            }
            None => 0.0,
        }
    }
}

/// Parse tool-call arguments; malformed or non-object arguments become an empty map
fn parse_arguments(arguments: &str) -> BTreeMap<String, Value> {
    match serde_json::from_str::<Map<String, Value>>(arguments) {
        Ok(map) => map.into_iter().collect(),
        Err(e) => {
            if !arguments.trim().is_empty() {
                warn!(error = %e, arguments, "ignoring malformed tool arguments");
            }
            BTreeMap::new()
        }
    }
}

#[async_trait]
impl VlmBackend for OpenAiVlmBackend {
    async fn decide(
        &mut self,
        frame: &Frame,
        step_index: usize,
        scenario: &Scenario,
        _history: &[Action],
    ) -> Result<VlmResponse, VlmError> {
        let user_turn = Self::user_turn(frame, step_index, scenario)?;
        let body = self.build_request(scenario, &user_turn)?;

        let started = Instant::now();
        let response = self.send(&body).await?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let cost_usd = self.cost_of(&response);

        let choice = response
            .choices
            .first()
            .ok_or_else(|| VlmError::InvalidResponse("response has no choices".to_string()))?;
        let content = choice.message.content.clone().unwrap_or_default();

        let mut assistant_turn = json!({ "role": "assistant", "content": content });
        let mut tool_replies = Vec::new();

        let vlm_response = match choice.message.tool_calls.as_ref().and_then(|calls| calls.first()) {
            Some(call) => {
                let mut action = Action::new(call.function.name.clone());
                action.parameters = parse_arguments(&call.function.arguments);
                assistant_turn["tool_calls"] = json!([{
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.function.name, "arguments": call.function.arguments },
                }]);
                tool_replies.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": "executed",
                }));

                let done = action.is_terminal();
                let mut decided = VlmResponse::new(action);
                decided.done = done;
                if !content.is_empty() {
                    decided = decided.with_rationale(content.clone());
                }
                decided
            }
            None => VlmResponse::new(Action::from_text(content.clone())).with_rationale(content.clone()),
        };

        debug!(
            step = step_index,
            action = %vlm_response.action.describe(),
            latency_ms,
            cost_usd,
            "VLM decided"
        );

        self.conversation.push(user_turn);
        self.conversation.push(assistant_turn);
        self.conversation.extend(tool_replies);

        Ok(vlm_response.with_latency_ms(latency_ms).with_cost(cost_usd))
    }

    async fn close(&mut self) {
        self.conversation.clear();
    }
}

/// Deterministic backend that replays a fixed sequence of responses.
///
/// Once the sequence is exhausted every further call answers `done`.
#[derive(Debug, Clone, Default)]
pub struct ReplayBackend {
    responses: VecDeque<VlmResponse>,
    delay: Option<Duration>,
    calls: usize,
    closed: bool,
}

impl ReplayBackend {
    pub fn new(responses: Vec<VlmResponse>) -> Self {
        Self {
            responses: responses.into(),
            ..Default::default()
        }
    }

    pub fn from_actions(actions: Vec<Action>) -> Self {
        Self::new(actions.into_iter().map(VlmResponse::new).collect())
    }

    /// Sleep before every answer
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `decide` calls received
    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl VlmBackend for ReplayBackend {
    async fn decide(
        &mut self,
        _frame: &Frame,
        _step_index: usize,
        _scenario: &Scenario,
        _history: &[Action],
    ) -> Result<VlmResponse, VlmError> {
        self.calls += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .responses
            .pop_front()
            .unwrap_or_else(|| VlmResponse::finished(Action::new("done"))))
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
