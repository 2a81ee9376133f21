//! Language-model boundary.
//!
//! Callers never treat an [`LlmError`] as fatal: extraction degrades to an
//! empty result and summaries fall back to the deterministic formatter.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use parley_core::config::{LlmConfig, LlmProvider};

#[derive(Clone, Debug, PartialEq)]
pub struct LlmRequest {
    pub prompt: String,
    pub system: Option<String>,
    /// JSON schema the reply must satisfy. Switches the call into
    /// schema-constrained mode.
    pub schema: Option<Value>,
    pub max_tokens: u32,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), system: None, schema: None, max_tokens: 1024 }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LlmResponse {
    Text(String),
    Structured(Map<String, Value>),
}

impl LlmResponse {
    /// Structured replies pass through; text replies are searched for the
    /// first JSON object.
    pub fn into_object(self) -> Option<Map<String, Value>> {
        match self {
            Self::Structured(object) => Some(object),
            Self::Text(text) => parse_json_object(&text),
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Structured(object) => Value::Object(object).to_string(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("language model is not configured: {0}")]
    NotConfigured(String),
    #[error("language model unreachable: {0}")]
    Unreachable(String),
    #[error("language model timed out")]
    Timeout,
    #[error("language model returned status {status}")]
    Status { status: u16 },
    #[error("language model reply could not be parsed: {0}")]
    Unparsable(String),
    #[error("language model returned an empty reply")]
    Empty,
}

impl LlmError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) => "llm.not_configured",
            Self::Unreachable(_) => "llm.unreachable",
            Self::Timeout => "llm.timeout",
            Self::Status { .. } => "llm.status",
            Self::Unparsable(_) => "llm.unparsable",
            Self::Empty => "llm.empty",
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Client used when no model is wired in; every call fails softly.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledLlmClient;

#[async_trait]
impl LlmClient for DisabledLlmClient {
    async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        Err(LlmError::NotConfigured("no language model client installed".to_string()))
    }
}

/// OpenAI-compatible `/v1/chat/completions` client. Ollama and Anthropic both
/// expose that surface, so the provider only changes the default host.
pub struct HttpLlmClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretString>,
    max_tokens: u32,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| default_base_url(config.provider).to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| LlmError::NotConfigured(error.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn body(&self, request: &LlmRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "temperature": 0,
        });
        if let Some(schema) = &request.schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {"name": "parameters", "schema": schema, "strict": false},
            });
        }
        body
    }
}

fn default_base_url(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "https://api.openai.com",
        LlmProvider::Anthropic => "https://api.anthropic.com",
        LlmProvider::Ollama => "http://localhost:11434",
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut call = self.client.post(&self.endpoint).json(&self.body(request));
        if let Some(api_key) = &self.api_key {
            call = call.bearer_auth(api_key.expose_secret());
        }

        let response = call.send().await.map_err(|error| {
            if error.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Unreachable(error.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Status { status: status.as_u16() });
        }

        let payload: Value =
            response.json().await.map_err(|error| LlmError::Unparsable(error.to_string()))?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|content| !content.is_empty())
            .ok_or(LlmError::Empty)?;

        debug!(
            event_name = "agent.llm.completed",
            model = %self.model,
            structured = request.schema.is_some(),
            chars = content.len(),
            "language model call finished"
        );

        if request.schema.is_some() {
            return parse_json_object(content)
                .map(LlmResponse::Structured)
                .ok_or_else(|| LlmError::Unparsable("expected a JSON object".to_string()));
        }
        Ok(LlmResponse::Text(content.to_string()))
    }
}

/// Finds the first JSON object in free text, tolerating code fences and
/// surrounding prose.
pub fn parse_json_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

#[derive(Clone, Debug)]
enum ScriptedReply {
    Reply(LlmResponse),
    Fail(LlmError),
}

/// Deterministic client that answers by substring match on the prompt.
///
/// Rules are checked in insertion order; a prompt no rule matches fails with
/// [`LlmError::Unreachable`], which exercises the degrade paths.
#[derive(Clone, Default)]
pub struct ScriptedLlmClient {
    rules: Arc<Mutex<Vec<(String, ScriptedReply)>>>,
    requests: Arc<Mutex<Vec<LlmRequest>>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_json(self, needle: impl Into<String>, reply: Value) -> Self {
        let reply = match reply {
            Value::Object(object) => LlmResponse::Structured(object),
            other => LlmResponse::Text(other.to_string()),
        };
        self.push(needle.into(), ScriptedReply::Reply(reply))
    }

    pub fn on_text(self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.push(needle.into(), ScriptedReply::Reply(LlmResponse::Text(reply.into())))
    }

    pub fn on_error(self, needle: impl Into<String>, error: LlmError) -> Self {
        self.push(needle.into(), ScriptedReply::Fail(error))
    }

    fn push(self, needle: String, reply: ScriptedReply) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push((needle, reply));
        }
        self
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().map(|requests| requests.clone()).unwrap_or_default()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|request| request.prompt).collect()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|requests| requests.len()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let reply = self.rules.lock().ok().and_then(|rules| {
            rules
                .iter()
                .find(|(needle, _)| request.prompt.contains(needle.as_str()))
                .map(|(_, reply)| reply.clone())
        });
        match reply {
            Some(ScriptedReply::Reply(response)) => Ok(response),
            Some(ScriptedReply::Fail(error)) => Err(error),
            None => Err(LlmError::Unreachable("no scripted reply".to_string())),
        }
    }
}
