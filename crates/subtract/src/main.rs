//! Subtract - forward HTTP proxy that subtracts unwanted content from responses

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use subtract::SubtractError;
use subtract::config::{Config, LoggingConfig};
use subtract::error::Result;
use subtract::proxy::{ProxyServer, UpstreamTarget};
use subtract::robots::RobotsPolicyEngine;
use subtract::user_agent::PROXY_USER_AGENT;

/// Subtract - a forward proxy that filters the web before you see it
#[derive(Parser)]
#[command(name = "subtract")]
#[command(about = "A forward HTTP proxy that subtracts unwanted content from responses")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the proxy server (default command)
    #[command(name = "serve")]
    Serve,

    /// Check whether a URL may be fetched according to its robots.txt
    #[command(name = "robots")]
    Robots {
        /// URL to check
        url: String,

        /// User-Agent to evaluate the rules for
        #[arg(long, short = 'u', default_value = PROXY_USER_AGENT)]
        user_agent: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let _guard = init_logging(&config.logging);

    match cli.command {
        None | Some(Command::Serve) => serve(config).await,
        Some(Command::Robots { url, user_agent }) => check_robots(&config, &url, &user_agent).await,
    }
}

/// Install the subscriber; the returned guard flushes the log file on drop
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{level},subtract={level}", level = config.level))
    });

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "subtract.log".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

fn read_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SubtractError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    toml::from_str(&content)
        .map_err(|e| SubtractError::Config(format!("Failed to parse config: {e}")))
}

fn load_config(config_path: Option<&Path>) -> Result<Config> {
    // Logging is not up yet, so discovery notes go to stderr
    let config = if let Some(path) = config_path {
        read_config(path)?
    } else {
        let default_paths = [
            dirs::home_dir().map(|h| h.join(".subtract").join("config.toml")),
            dirs::config_dir().map(|c| c.join("subtract").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        match default_paths.iter().flatten().find(|p| p.exists()) {
            Some(path) => {
                eprintln!("Loading config from: {}", path.display());
                read_config(path)?
            }
            None => Config::default(),
        }
    };

    config.validate()?;
    Ok(config)
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting Subtract proxy");
    tracing::debug!("Config loaded: {:?}", config);

    ProxyServer::new(config).serve().await?;

    tracing::info!("Subtract proxy stopped");
    Ok(())
}

async fn check_robots(config: &Config, url: &str, user_agent: &str) -> Result<()> {
    let target = UpstreamTarget::from_path(&format!("/p/{url}"), None)?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.server.timeout_ms))
        .build()
        .map_err(|e| SubtractError::Network(format!("Failed to create HTTP client: {e}")))?;
    let engine = RobotsPolicyEngine::new(client).with_scheme(target.url.scheme());

    let domain = target.authority();
    let path = target.path_and_query();
    let blocked = engine.is_blocked(&domain, &path, user_agent).await?;

    let verdict = if blocked { "blocked" } else { "allowed" };
    println!("{} for {}: {}", target.url, user_agent, verdict);
    if let Some(delay) = engine.crawl_delay(&domain, user_agent).await? {
        println!("crawl-delay: {delay}s");
    }
    Ok(())
}
