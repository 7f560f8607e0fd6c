use crate::config::JudgeConfig;
use crate::frame::Frame;
use anyhow::{Context, Result};
use async_openai::types::{
    ChatCompletionRequestMessageContentPartImageArgs, ChatCompletionRequestMessageContentPartTextArgs,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs,
};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

const JUDGE_SYSTEM_PROMPT: &str =
    "You are a strict evaluator of robot behaviour. Respond with a single JSON object and nothing else.";

/// A judge's verdict on one question
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Confidence in [0, 1]
    pub score: f64,
    pub reasoning: String,
}

/// External model that scores a trajectory description against criteria
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, prompt: &str, image: Option<&Frame>) -> Result<Verdict>;
}

/// Judge backed by an OpenAI-compatible chat completions API
pub struct OpenAiJudge {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    rate_limit_rps: f64,
    /// Last request time, shared by every evaluator using this judge
    last_request: Mutex<Option<Instant>>,
}

impl OpenAiJudge {
    /// Create a judge from configuration, reading the API key from the environment
    pub fn from_config(config: &JudgeConfig) -> Result<Self> {
        let api_key = std::env::var(&config.env_var_api_key)
            .with_context(|| format!("Environment variable {} not found", config.env_var_api_key))?;

        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(&config.api_endpoint);

        Ok(Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            temperature: config.temperature as f32,
            rate_limit_rps: config.rate_limit_rps,
            last_request: Mutex::new(None),
        })
    }

    /// Build the chat completion request, attaching the frame when given
    fn build_request(&self, prompt: &str, image: Option<&Frame>) -> Result<CreateChatCompletionRequest> {
        let system_message = ChatCompletionRequestSystemMessageArgs::default()
            .content(JUDGE_SYSTEM_PROMPT.to_string())
            .build()
            .context("Failed to build judge system message")?
            .into();

        let user_message = match image {
            Some(frame) => {
                let data_url = frame.to_data_url().context("Failed to encode frame for judge")?;
                ChatCompletionRequestUserMessageArgs::default()
                    .content(vec![
                        ChatCompletionRequestMessageContentPartTextArgs::default()
                            .text(prompt.to_string())
                            .build()
                            .context("Failed to build judge text part")?
                            .into(),
                        ChatCompletionRequestMessageContentPartImageArgs::default()
                            .image_url(
                                ImageUrlArgs::default()
                                    .url(data_url)
                                    .detail(ImageDetail::Auto)
                                    .build()
                                    .context("Failed to build judge image url")?,
                            )
                            .build()
                            .context("Failed to build judge image part")?
                            .into(),
                    ])
                    .build()
                    .context("Failed to build judge user message")?
                    .into()
            }
            None => ChatCompletionRequestUserMessageArgs::default()
                .content(prompt.to_string())
                .build()
                .context("Failed to build judge user message")?
                .into(),
        };

        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([system_message, user_message])
            .temperature(self.temperature)
            .build()
            .context("Failed to build judge completion request")
    }
}

#[async_trait]
impl Judge for OpenAiJudge {
    async fn judge(&self, prompt: &str, image: Option<&Frame>) -> Result<Verdict> {
        {
            let mut last_request = self.last_request.lock().await;
            enforce_rate_limit(&mut last_request, self.rate_limit_rps).await;
        }

        let request = self.build_request(prompt, image)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .context("Failed to get judge response")?;

        let content = match response.choices.first() {
            Some(choice) => choice.message.content.clone().unwrap_or_default(),
            None => String::new(),
        };
        debug!(model = %self.model, chars = content.len(), "judge responded");
        parse_verdict(&content)
    }
}

/// Sleep until at least `1 / rate_limit_rps` seconds have passed since the last request
pub async fn enforce_rate_limit(last_request: &mut Option<Instant>, rate_limit_rps: f64) {
    if rate_limit_rps <= 0.0 {
        return;
    }

    let Ok(min_interval) = Duration::try_from_secs_f64(1.0 / rate_limit_rps) else {
        return;
    };

    if let Some(last_time) = *last_request {
        let elapsed = last_time.elapsed();
        if elapsed < min_interval {
            sleep(min_interval - elapsed).await;
        }
    }

    *last_request = Some(Instant::now());
}

/// Remove a surrounding markdown code fence, if any
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let body = match trimmed.split_once('\n') {
        Some((_, rest)) => rest,
        None => return trimmed.trim_matches('`').trim(),
    };
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Parse JSON from the response, handling fenced or embedded JSON
fn parse_json_response(response: &str) -> Result<Value> {
    let text = strip_code_fence(response);
    match serde_json::from_str(text) {
        Ok(parsed) => Ok(parsed),
        Err(_) => try_extract_embedded_json(text),
    }
}

/// Try to extract JSON that might be embedded in text
fn try_extract_embedded_json(response: &str) -> Result<Value> {
    match response.find('{') {
        Some(start) => match response.rfind('}') {
            Some(end) if end > start => serde_json::from_str(&response[start..=end])
                .context("Failed to parse extracted JSON"),
            _ => anyhow::bail!("Found opening brace but no closing brace in response"),
        },
        None => anyhow::bail!("No JSON found in response"),
    }
}

/// Parse a `{"score": .., "reasoning": ..}` judge reply
pub fn parse_verdict(response: &str) -> Result<Verdict> {
    let parsed = parse_json_response(response)?;
    let score = match parsed.get("score") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .with_context(|| format!("Judge response has no numeric score: {}", response.trim()))?;

    let reasoning = match parsed.get("reasoning").and_then(|r| r.as_str()) {
        Some(reasoning) => reasoning.to_string(),
        None => "No reasoning provided".to_string(),
    };

    Ok(Verdict {
        score: score.clamp(0.0, 1.0),
        reasoning,
    })
}
