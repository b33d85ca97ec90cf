use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::PipelineConfig;

static JSON_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid json fence regex"));
static ANY_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\s*(.*?)\s*```").expect("valid fence regex"));

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no API key configured for the judge model")]
    MissingApiKey,
    #[error("judge request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("judge API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("judge returned no content")]
    EmptyResponse,
}

impl LlmError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "missing_api_key",
            Self::Transport(err) if err.is_timeout() => "timeout",
            Self::Transport(_) => "transport",
            Self::Status { .. } => "http_status",
            Self::EmptyResponse => "empty_response",
        }
    }
}

/// A single-turn chat model used by both the validation and the quality judge.
pub trait ChatModel: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

pub struct SolarClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl SolarClient {
    pub fn new(config: &PipelineConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key.clone().ok_or(LlmError::MissingApiKey)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.llm_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

impl ChatModel for SolarClient {
    fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let parsed: ChatResponse = response.json()?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)?;

        debug!(chars = content.chars().count(), "judge reply received");
        Ok(content)
    }
}

/// Pulls the JSON object out of a model reply that may be wrapped in a
/// markdown code fence or surrounded by prose.
pub fn extract_json_block(reply: &str) -> &str {
    let trimmed = reply.trim();

    if trimmed.contains("```json") {
        if let Some(inner) = JSON_FENCE_RE.captures(trimmed).and_then(|caps| caps.get(1)) {
            return inner.as_str();
        }
    } else if trimmed.contains("```") {
        if let Some(inner) = ANY_FENCE_RE.captures(trimmed).and_then(|caps| caps.get(1)) {
            return inner.as_str();
        }
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}
