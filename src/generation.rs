//! Text generation backends for the chat services.
//!
//! Defines the [`Generator`] trait and two implementations:
//! - **[`GeminiGenerator`]** — the hosted Gemini `generateContent` API.
//! - **[`LocalGenerator`]** — a causal language model served locally over
//!   HTTP by a text-generation server (`POST /generate`).
//!
//! Both share the retry policy in [`crate::retry`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::{AssistantConfig, ChatConfig};
use crate::retry::send_with_retry;

/// A language model that completes a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Model identifier, for logging.
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String>;
}

// ============ Gemini ============

pub struct GeminiGenerator {
    client: reqwest::Client,
    api_url: String,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl GeminiGenerator {
    /// Builds the generator from `[chat]` and `GEMINI_API_KEY`.
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        Self::with_key(config, api_key)
    }

    pub fn with_key(config: &ChatConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: api_key.into(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.api_url, self.model);
        let body = json!({
            "contents": [{
                "parts": [{ "text": prompt }]
            }]
        });

        let response = send_with_retry("gemini", self.max_retries, || {
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
        })
        .await?;

        let json: Value = response.json().await?;
        parse_gemini_response(&json)
    }
}

/// Extracts `candidates[0].content.parts[0].text`.
pub fn parse_gemini_response(json: &Value) -> Result<String> {
    json.pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid Gemini response: missing candidate text"))
}

// ============ Local model ============

/// A locally served causal language model.
///
/// Sampling parameters mirror the usual `generate()` settings: sampling
/// enabled, temperature and nucleus (`top_p`) from config, and a cap on new
/// tokens.
pub struct LocalGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_new_tokens: u32,
    temperature: f64,
    top_p: f64,
}

impl LocalGenerator {
    pub fn new(config: &AssistantConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "inputs": prompt,
            "parameters": {
                "max_new_tokens": self.max_new_tokens,
                "do_sample": true,
                "temperature": self.temperature,
                "top_p": self.top_p,
                "return_full_text": false,
            }
        })
    }
}

#[async_trait]
impl Generator for LocalGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/generate", self.endpoint);
        let body = self.request_body(prompt);

        // local server: no retry, failures surface immediately
        let response = send_with_retry("local model", 0, || self.client.post(&url).json(&body)).await?;
        let json: Value = response.json().await?;
        let text = parse_local_response(&json)?;
        Ok(strip_prompt(&text, prompt))
    }
}

/// Accepts both `{"generated_text": ..}` and `[{"generated_text": ..}]`.
pub fn parse_local_response(json: &Value) -> Result<String> {
    let item = match json {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    };
    match item.get("generated_text").and_then(Value::as_str) {
        Some(text) => Ok(text.to_string()),
        None => bail!("Invalid model response: missing generated_text"),
    }
}

/// Removes an echoed prompt from the start of `text` and trims it.
pub fn strip_prompt(text: &str, prompt: &str) -> String {
    text.strip_prefix(prompt).unwrap_or(text).trim().to_string()
}
