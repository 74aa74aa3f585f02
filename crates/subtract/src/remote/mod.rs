//! Remote model content filters
//!
//! A remote filter sends the body to a chat model and uses the reply as the
//! new body. Every failure resolves to the original content.

pub mod ollama;
pub mod openrouter;
pub mod prompt;

pub use ollama::OllamaRewriter;
pub use openrouter::OpenRouterRewriter;
pub use prompt::{RenderedPrompt, render, replace_variables, validate_prompt_template};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RemoteFilterConfig;
use crate::error::{Result, SubtractError};
use crate::proxy::ProxyContext;

/// A backend able to rewrite content with a model
#[async_trait]
pub trait ContentRewriter: Send + Sync {
    /// Rewritten content, or an error the caller falls back from
    async fn rewrite(&self, content: &str, ctx: &ProxyContext) -> Result<String>;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// Chat message shared by both providers' wire formats
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// System and user messages for `content`; the user message is the raw
/// content when no user template is configured
pub fn build_messages(
    config: &RemoteFilterConfig,
    content: &str,
    ctx: &ProxyContext,
) -> Vec<ChatMessage> {
    let rendered = render(&config.prompt, content, ctx);
    vec![
        ChatMessage::system(rendered.system),
        ChatMessage::user(rendered.user.unwrap_or_else(|| content.to_string())),
    ]
}

/// Chain stage wrapping a rewriter; never fails
pub struct RemoteFilter {
    rewriter: Box<dyn ContentRewriter>,
}

impl RemoteFilter {
    pub fn new(rewriter: Box<dyn ContentRewriter>) -> Self {
        Self { rewriter }
    }

    pub fn name(&self) -> &'static str {
        self.rewriter.name()
    }

    /// Rewrite `content`, returning it unchanged on any failure
    pub async fn apply(&self, content: &str, ctx: &ProxyContext) -> String {
        if content.trim().is_empty() {
            return content.to_string();
        }

        match self.rewriter.rewrite(content, ctx).await {
            Ok(rewritten) if !rewritten.is_empty() => {
                debug!(
                    filter = self.name(),
                    before = content.len(),
                    after = rewritten.len(),
                    "Remote filter rewrote content"
                );
                rewritten
            }
            Ok(_) => {
                debug!(filter = self.name(), "Remote filter returned empty content");
                content.to_string()
            }
            Err(e) => {
                warn!(filter = self.name(), "Remote filter failed: {e}");
                content.to_string()
            }
        }
    }
}

/// Build the configured remote filter
pub fn build_remote_filter(config: &RemoteFilterConfig) -> Result<RemoteFilter> {
    validate_prompt_template(&config.prompt)?;

    let rewriter: Box<dyn ContentRewriter> = match config.provider.to_lowercase().as_str() {
        "ollama" => Box::new(OllamaRewriter::new(config)?),
        "openrouter" => Box::new(OpenRouterRewriter::new(config)?),
        other => {
            return Err(SubtractError::Config(format!(
                "Unsupported remote filter provider: {other}"
            )));
        }
    };

    info!(
        "Remote filter initialized: provider={}, model={}",
        rewriter.name(),
        config.model
    );
    Ok(RemoteFilter::new(rewriter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    struct Fixed(Result<String>);

    #[async_trait]
    impl ContentRewriter for Fixed {
        async fn rewrite(&self, _content: &str, _ctx: &ProxyContext) -> Result<String> {
            match &self.0 {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(SubtractError::RemoteFilter(e.to_string())),
            }
        }

        fn name(&self) -> &'static str {
            "FixedFilter"
        }
    }

    fn ctx() -> ProxyContext {
        ProxyContext::new("/", Method::GET).with_content_type("text/plain")
    }

    #[tokio::test]
    async fn test_failure_returns_original() {
        let filter = RemoteFilter::new(Box::new(Fixed(Err(SubtractError::RemoteFilter(
            "down".into(),
        )))));
        assert_eq!(filter.apply("original", &ctx()).await, "original");
    }

    #[tokio::test]
    async fn test_empty_reply_returns_original() {
        let filter = RemoteFilter::new(Box::new(Fixed(Ok(String::new()))));
        assert_eq!(filter.apply("original", &ctx()).await, "original");
    }

    #[tokio::test]
    async fn test_reply_replaces_content() {
        let filter = RemoteFilter::new(Box::new(Fixed(Ok("short".into()))));
        assert_eq!(filter.name(), "FixedFilter");
        assert_eq!(filter.apply("long original", &ctx()).await, "short");
        assert_eq!(filter.apply("   ", &ctx()).await, "   ");
    }

    #[test]
    fn test_build_messages_defaults_to_raw_content() {
        let config = RemoteFilterConfig::default();
        let messages = build_messages(&config, "BODY", &ctx());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, config.prompt.system);
        assert_eq!(messages[1], ChatMessage::user("BODY"));
    }

    #[test]
    fn test_build_remote_filter_rejects_unknown_provider() {
        let config = RemoteFilterConfig {
            provider: "nope".into(),
            ..Default::default()
        };
        assert!(build_remote_filter(&config).is_err());
    }
}
