//! OpenRouter rewriter using the OpenAI-compatible chat completions API
//!
//! The API key comes from `remote_filter.api_key` or, failing that, the
//! environment variable named by `remote_filter.api_key_env`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ChatMessage, ContentRewriter, build_messages};
use crate::config::RemoteFilterConfig;
use crate::error::{Result, SubtractError};
use crate::proxy::ProxyContext;

pub const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";

const REFERER: &str = "https://github.com/watzon/subtract";
const TITLE: &str = "SubtractProxy";
const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 1000;
/// Retries after the first attempt when rate limited
const MAX_RATE_LIMIT_RETRIES: u32 = 2;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Rewriter backed by OpenRouter
#[derive(Debug)]
pub struct OpenRouterRewriter {
    client: Client,
    config: RemoteFilterConfig,
    base_url: String,
    api_key: String,
    initial_backoff: Duration,
}

impl OpenRouterRewriter {
    /// Fails with a configuration error when no API key is available
    pub fn new(config: &RemoteFilterConfig) -> Result<Self> {
        let api_key = match &config.api_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => env::var(&config.api_key_env).map_err(|_| {
                SubtractError::Config(format!(
                    "OpenRouter filter requires an API key: set remote_filter.api_key or {}",
                    config.api_key_env
                ))
            })?,
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SubtractError::RemoteFilter(e.to_string()))?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENROUTER_URL.to_string());

        info!(
            "OpenRouter filter initialized with model: {}, api_url: {}",
            config.model, base_url
        );

        Ok(Self {
            client,
            config: config.clone(),
            base_url,
            api_key,
            initial_backoff: Duration::from_secs(1),
        })
    }

    /// Override the first rate-limit backoff delay
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }
}

#[async_trait]
impl ContentRewriter for OpenRouterRewriter {
    async fn rewrite(&self, content: &str, ctx: &ProxyContext) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: build_messages(&self.config, content, ctx),
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!("Calling OpenRouter at: {}", url);

        let mut delay = self.initial_backoff;
        let mut attempt = 0;

        loop {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .header("HTTP-Referer", REFERER)
                .header("X-Title", TITLE)
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    SubtractError::RemoteFilter(format!("OpenRouter request failed: {e}"))
                })?;

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                attempt += 1;
                warn!(
                    "Rate limited on attempt {}/{}, waiting {:?}",
                    attempt,
                    MAX_RATE_LIMIT_RETRIES + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                continue;
            }

            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(SubtractError::RemoteFilter(format!(
                    "OpenRouter returned {status}: {error_text}"
                )));
            }

            let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
                SubtractError::RemoteFilter(format!("Invalid OpenRouter response: {e}"))
            })?;

            // An empty reply keeps the original body
            return Ok(completion
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| content.to_string()));
        }
    }

    fn name(&self) -> &'static str {
        "OpenRouterFilter"
    }
}
