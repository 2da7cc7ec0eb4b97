use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::agents::descriptor::DescriptorTable;
use crate::cli::Provider;
use crate::config::RuntimeConfig;

const HTTP_TIMEOUT_SECS: u64 = 120;
const MAX_RESPONSE_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

impl ContextMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("authentication rejected (HTTP {status})")]
    Auth { status: u16 },
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Network failures, rate limits and server errors are worth another
    /// attempt. Auth and other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport(_) => true,
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Auth { .. } | ProviderError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        system_prompt: &str,
        context: &[ContextMessage],
    ) -> Result<String, ProviderError>;
}

async fn read_success_json(resp: reqwest::Response) -> Result<Value, ProviderError> {
    let status = resp.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(ProviderError::Auth {
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let (body, _) = crate::tools::execute_bash::truncate_text(&body, 512);
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp.json::<Value>().await?)
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .context("failed to build provider HTTP client")
}

/// Anthropic Messages API.
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        Ok(Self {
            api_key,
            model,
            base_url: "https://api.anthropic.com".to_string(),
            http: http_client()?,
        })
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn invoke(
        &self,
        system_prompt: &str,
        context: &[ContextMessage],
    ) -> Result<String, ProviderError> {
        let messages = context
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect::<Vec<Value>>();
        let body = json!({
            "model": &self.model,
            "max_tokens": MAX_RESPONSE_TOKENS,
            "system": system_prompt,
            "messages": messages,
        });

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;
        let value = read_success_json(resp).await?;

        let blocks = value
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Malformed("missing content blocks".to_string()))?;
        let text = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("");
        Ok(text)
    }
}

/// Chat-completions client shared by OpenAI, Groq and Ollama.
pub struct OpenAiCompatibleProvider {
    label: &'static str,
    api_key: Option<String>,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        label: &'static str,
        base_url: String,
        api_key: Option<String>,
        model: String,
    ) -> Result<Self> {
        Ok(Self {
            label,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: http_client()?,
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        self.label
    }

    async fn invoke(
        &self,
        system_prompt: &str,
        context: &[ContextMessage],
    ) -> Result<String, ProviderError> {
        let mut messages = vec![json!({ "role": "system", "content": system_prompt })];
        messages.extend(
            context
                .iter()
                .map(|m| json!({ "role": m.role.as_str(), "content": m.content })),
        );
        let body = json!({
            "model": &self.model,
            "messages": messages,
        });

        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let value = read_success_json(req.send().await?).await?;

        value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Malformed("missing choices[0].message.content".to_string()))
    }
}

/// Offline provider. Replies with a short digest of the last user message so a
/// pipeline can be exercised without credentials.
#[derive(Debug, Default)]
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(
        &self,
        system_prompt: &str,
        context: &[ContextMessage],
    ) -> Result<String, ProviderError> {
        let role = system_prompt.lines().next().unwrap_or_default().trim();
        let last = context
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let first_line = last.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let (digest, _) = crate::tools::execute_bash::truncate_text(first_line.trim(), 160);
        Ok(format!("[echo] {role}\n{digest}"))
    }
}

/// Replays queued replies in order and records every prompt it receives.
/// Once the queue is drained it keeps answering with the fallback reply.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: String,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, Vec<ContextMessage>)>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            fallback: "done".to_string(),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_results(replies: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: "done".to_string(),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn calls(&self) -> Vec<(String, Vec<ContextMessage>)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        system_prompt: &str,
        context: &[ContextMessage],
    ) -> Result<String, ProviderError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((system_prompt.to_string(), context.to_vec()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Maps agent names to the provider that serves them. Agents without an
/// explicit entry share the default provider.
#[derive(Clone)]
pub struct ProviderRegistry {
    default: Arc<dyn ModelProvider>,
    by_agent: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    pub fn new(default: Arc<dyn ModelProvider>) -> Self {
        Self {
            default,
            by_agent: HashMap::new(),
        }
    }

    pub fn with_agent(mut self, name: impl Into<String>, provider: Arc<dyn ModelProvider>) -> Self {
        self.by_agent.insert(name.into(), provider);
        self
    }

    pub fn for_agent(&self, name: &str) -> Arc<dyn ModelProvider> {
        self.by_agent
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn from_config(cfg: &RuntimeConfig, table: &DescriptorTable) -> Result<Self> {
        let default = build_provider(cfg.provider, cfg.model.clone())?;
        let mut registry = Self::new(default);

        for descriptor in table.all() {
            if descriptor.provider.is_none() && descriptor.model.is_none() {
                continue;
            }
            let provider = descriptor.provider.unwrap_or(cfg.provider);
            let model = descriptor.model.clone().or_else(|| cfg.model.clone());
            let built = build_provider(provider, model).with_context(|| {
                format!("failed to build provider for agent '{}'", descriptor.name)
            })?;
            registry = registry.with_agent(descriptor.name.clone(), built);
        }

        Ok(registry)
    }
}

pub fn build_provider(provider: Provider, model: Option<String>) -> Result<Arc<dyn ModelProvider>> {
    let provider = resolve_provider(provider)?;

    match provider {
        Provider::Anthropic => {
            let api_key = std::env::var("ANTHROPIC_API_KEY")
                .context("ANTHROPIC_API_KEY is required for Anthropic provider")?;
            let model = model.unwrap_or_else(|| "claude-sonnet-4-20250514".to_string());
            Ok(Arc::new(AnthropicProvider::new(api_key, model)?))
        }
        Provider::Openai => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY is required for OpenAI provider")?;
            let model = model.unwrap_or_else(|| "gpt-5-mini".to_string());
            Ok(Arc::new(OpenAiCompatibleProvider::new(
                "openai",
                "https://api.openai.com/v1".to_string(),
                Some(api_key),
                model,
            )?))
        }
        Provider::Groq => {
            let api_key = std::env::var("GROQ_API_KEY")
                .context("GROQ_API_KEY is required for Groq provider")?;
            let model = model.unwrap_or_else(|| "llama-3.3-70b-versatile".to_string());
            Ok(Arc::new(OpenAiCompatibleProvider::new(
                "groq",
                "https://api.groq.com/openai/v1".to_string(),
                Some(api_key),
                model,
            )?))
        }
        Provider::Ollama => {
            let host = std::env::var("OLLAMA_HOST")
                .unwrap_or_else(|_| "http://localhost:11434".to_string());
            let model = model.unwrap_or_else(|| "llama3.1".to_string());
            Ok(Arc::new(OpenAiCompatibleProvider::new(
                "ollama",
                format!("{}/v1", host.trim_end_matches('/')),
                None,
                model,
            )?))
        }
        Provider::Echo => Ok(Arc::new(EchoProvider)),
        Provider::Auto => Err(anyhow::anyhow!(
            "auto provider must be resolved before building a client"
        )),
    }
}

pub fn resolve_provider(provider: Provider) -> Result<Provider> {
    match provider {
        Provider::Auto => detect_provider().context(
            "no provider could be auto-detected. Set one of ANTHROPIC_API_KEY, OPENAI_API_KEY, \
             GROQ_API_KEY, OLLAMA_HOST, or use --provider echo",
        ),
        p => Ok(p),
    }
}

pub fn detect_provider() -> Option<Provider> {
    if env_present("ANTHROPIC_API_KEY") {
        return Some(Provider::Anthropic);
    }
    if env_present("OPENAI_API_KEY") {
        return Some(Provider::Openai);
    }
    if env_present("GROQ_API_KEY") {
        return Some(Provider::Groq);
    }
    if env_present("OLLAMA_HOST") {
        return Some(Provider::Ollama);
    }
    None
}

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}
