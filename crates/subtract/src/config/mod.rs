use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Result, SubtractError};

/// Remote providers the proxy knows how to talk to
pub const SUPPORTED_PROVIDERS: &[&str] = &["ollama", "openrouter"];

/// Main configuration structure for Subtract
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Listener and upstream forwarding settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Outbound User-Agent rewriting
    #[serde(default)]
    pub user_agent: UserAgentConfig,
    /// Remote model content filter
    #[serde(default)]
    pub remote_filter: RemoteFilterConfig,
    /// Log level and optional log file
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Rule-based content filtering
    #[serde(default)]
    pub filtering: FilteringConfig,
    /// robots.txt policy cache
    #[serde(default)]
    pub robots: RobotsConfig,
}

impl Config {
    /// Address the proxy binds to, rendered as `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Reject settings the proxy cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(SubtractError::Config("server.port must be non-zero".into()));
        }
        if self.server.timeout_ms == 0 {
            return Err(SubtractError::Config(
                "server.timeout_ms must be non-zero".into(),
            ));
        }

        let provider = self.remote_filter.provider.to_lowercase();
        if !SUPPORTED_PROVIDERS.contains(&provider.as_str()) {
            return Err(SubtractError::Config(format!(
                "Unsupported remote filter provider '{}': expected one of {}",
                self.remote_filter.provider,
                SUPPORTED_PROVIDERS.join(", ")
            )));
        }

        if self.remote_filter.prompt.system.trim().is_empty() {
            return Err(SubtractError::Config(
                "remote_filter.prompt.system must not be empty".into(),
            ));
        }

        Ok(())
    }
}

/// HTTP listener and upstream forwarding configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upstream request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Skip robots.txt enforcement and identify as the proxy itself
    #[serde(default)]
    pub ignore_robots_txt: bool,
    /// Include error detail chains in error responses
    #[serde(default)]
    pub development: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            ignore_robots_txt: false,
            development: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// User-Agent rotation configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UserAgentConfig {
    /// Rewrite the outbound User-Agent at all
    #[serde(default)]
    pub enabled: bool,
    /// Fixed value that always wins over the pool
    #[serde(default)]
    pub value: Option<String>,
    /// Cycle through the pool instead of always using its first entry
    #[serde(default)]
    pub rotate: bool,
    /// Pool to use instead of the built-in browser strings
    #[serde(default)]
    pub presets: Option<Vec<String>>,
}

/// Remote model filter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFilterConfig {
    /// Enable the remote filter stage
    #[serde(default)]
    pub enabled: bool,
    /// Provider type: ollama or openrouter
    #[serde(default = "default_remote_provider")]
    pub provider: String,
    /// Model identifier passed to the provider
    #[serde(default = "default_remote_model")]
    pub model: String,
    /// API key given inline (takes precedence over `api_key_env`)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable name for the API key
    #[serde(default = "default_remote_api_key_env")]
    pub api_key_env: String,
    /// Provider base URL override
    #[serde(default)]
    pub base_url: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
    /// Prompt sent alongside the content
    #[serde(default)]
    pub prompt: PromptTemplate,
}

impl Default for RemoteFilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_remote_provider(),
            model: default_remote_model(),
            api_key: None,
            api_key_env: default_remote_api_key_env(),
            base_url: None,
            timeout_secs: default_remote_timeout_secs(),
            prompt: PromptTemplate::default(),
        }
    }
}

fn default_remote_provider() -> String {
    "ollama".to_string()
}

fn default_remote_model() -> String {
    "gemma".to_string()
}

fn default_remote_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_remote_timeout_secs() -> u64 {
    30
}

/// Prompt template with `{{variable}}` placeholders
#[derive(Debug, Clone, Deserialize)]
pub struct PromptTemplate {
    /// System prompt (required)
    #[serde(default = "default_system_prompt")]
    pub system: String,
    /// User prompt; the raw content is sent when absent
    #[serde(default)]
    pub user: Option<String>,
    /// User-declared variables
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system: default_system_prompt(),
            user: None,
            variables: HashMap::new(),
        }
    }
}

fn default_system_prompt() -> String {
    "You are a web content filter. Analyze the following content and remove or summarize unnecessary information."
        .to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rule-based filtering configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilteringConfig {
    /// Enable the rule and param filters
    #[serde(default)]
    pub enabled: bool,
    /// Path to the JSON rule file
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

/// robots.txt cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RobotsConfig {
    /// How long a fetched policy stays fresh
    #[serde(default = "default_robots_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_robots_cache_ttl_secs(),
        }
    }
}

fn default_robots_cache_ttl_secs() -> u64 {
    3600
}
