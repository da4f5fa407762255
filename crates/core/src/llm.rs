//! Chat model seam — single-prompt chat completions behind a trait.
//!
//! The agent treats the model as an untrusted collaborator: everything that
//! comes back goes through the tolerant JSON layer before use, and every
//! repo/file name it produces is resolved against known entities.

use crate::config::LlmConfig;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// A single completion request. One user prompt, plain text back.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        ChatRequest { prompt: prompt.into(), temperature: 0.2, max_tokens: None }
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = Some(n);
        self
    }
}

pub trait ChatModel: Send + Sync {
    fn complete(&self, request: &ChatRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

/// Blocking chat-completions client with bounded retry.
pub struct HttpChatModel {
    config: LlmConfig,
    api_key: String,
    client: reqwest::blocking::Client,
}

impl HttpChatModel {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            CoreError::LlmFailure(format!("missing environment variable {}", config.api_key_env))
        })?;
        if api_key.trim().is_empty() {
            return Err(CoreError::LlmFailure(format!("{} is empty", config.api_key_env)));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CoreError::LlmFailure(format!("http client init failed: {e}")))?;
        Ok(HttpChatModel { config, api_key, client })
    }

    fn attempt(&self, request: &ChatRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));
        let body = CompletionRequest {
            model: &self.config.model,
            messages: vec![WireMessage { role: "user", content: &request.prompt }],
            temperature: request.temperature,
            max_tokens: request.max_tokens.or(self.config.max_tokens),
            stream: false,
        };
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| CoreError::LlmFailure(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(CoreError::LlmFailure(format!("http {status}: {text}")));
        }

        let parsed: CompletionResponse = response
            .json()
            .map_err(|e| CoreError::LlmFailure(format!("bad response body: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CoreError::LlmFailure("empty choices".into()))
    }
}

impl ChatModel for HttpChatModel {
    fn complete(&self, request: &ChatRequest) -> Result<String> {
        let mut last_error = None;
        for attempt in 0..self.config.max_retries.max(1) {
            match self.attempt(request) {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!("llm attempt {} failed: {e}", attempt + 1);
                    last_error = Some(e);
                    if attempt + 1 < self.config.max_retries {
                        std::thread::sleep(Duration::from_millis(self.config.retry_delay_ms));
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CoreError::LlmFailure("no attempts made".into())))
    }
}

// ---------------------------------------------------------------------------
// Scripted model (tests, offline runs)
// ---------------------------------------------------------------------------

/// Returns canned responses in order and records every prompt it saw.
/// When the script runs dry it fails like a dead endpoint.
#[derive(Default)]
pub struct ScriptedChat {
    responses: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedChat {
    pub fn new(responses: Vec<&str>) -> Self {
        ScriptedChat {
            responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl ChatModel for ScriptedChat {
    fn complete(&self, request: &ChatRequest) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        self.responses
            .lock()
            .ok()
            .and_then(|mut r| r.pop())
            .ok_or_else(|| CoreError::LlmFailure("scripted responses exhausted".into()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
