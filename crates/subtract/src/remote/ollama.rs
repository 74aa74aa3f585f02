//! Ollama chat API rewriter

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{ChatMessage, ContentRewriter, build_messages};
use crate::config::RemoteFilterConfig;
use crate::error::{Result, SubtractError};
use crate::proxy::ProxyContext;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

/// Rewriter backed by a local or remote Ollama server
#[derive(Debug)]
pub struct OllamaRewriter {
    client: Client,
    config: RemoteFilterConfig,
    base_url: String,
}

impl OllamaRewriter {
    pub fn new(config: &RemoteFilterConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SubtractError::RemoteFilter(e.to_string()))?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        Ok(Self {
            client,
            config: config.clone(),
            base_url,
        })
    }
}

#[async_trait]
impl ContentRewriter for OllamaRewriter {
    async fn rewrite(&self, content: &str, ctx: &ProxyContext) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.config.model,
            messages: build_messages(&self.config, content, ctx),
            stream: false,
        };

        debug!("Calling Ollama at: {}", url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SubtractError::RemoteFilter(format!("Ollama request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SubtractError::RemoteFilter(format!(
                "Ollama returned {status}: {error_text}"
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| SubtractError::RemoteFilter(format!("Invalid Ollama response: {e}")))?;

        Ok(chat.message.content)
    }

    fn name(&self) -> &'static str {
        "OllamaFilter"
    }
}
