//! Forward proxy server
//!
//! Implements a forward proxy that supports:
//! - Absolute-form and Host-header requests from clients configured to use it
//! - Dynamic passthrough via `/p/{url}` routes
//! - robots.txt enforcement and User-Agent rewriting on the way out
//! - Response filtering on the way back

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Response, StatusCode, Uri, header},
    response::IntoResponse,
    routing::{any, get},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Mutex as TokioMutex;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{Result, SubtractError};
use crate::filter::{FilterChain, build_chain};
use crate::robots::RobotsPolicyEngine;
use crate::user_agent::{PROXY_USER_AGENT, UserAgentRotator};

use super::error::{create_error_response, error_response};
use super::intercept::{Intercepted, Interceptor};
use super::{ProxyContext, UpstreamTarget};

/// Hop-by-hop headers that are never forwarded in either direction
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "te",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Full proxy configuration
    pub config: Config,
    /// HTTP client for upstream requests, redirects are passed through
    pub client: reqwest::Client,
    /// Response filters in application order
    pub chain: Arc<FilterChain>,
    /// robots.txt policy cache
    pub robots: Arc<RobotsPolicyEngine>,
    /// Outbound User-Agent pool
    pub user_agents: Arc<TokioMutex<UserAgentRotator>>,
}

impl AppState {
    /// Build every component the handlers need from `config`
    pub fn new(config: Config) -> Result<Self> {
        let timeout = Duration::from_millis(config.server.timeout_ms);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SubtractError::Proxy(format!("Failed to create HTTP client: {e}")))?;

        let robots_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SubtractError::Proxy(format!("Failed to create HTTP client: {e}")))?;
        let robots = RobotsPolicyEngine::new(robots_client)
            .with_ttl(Duration::from_secs(config.robots.cache_ttl_secs));

        let chain = build_chain(&config);
        let user_agents = UserAgentRotator::new(config.user_agent.clone());

        Ok(Self {
            config,
            client,
            chain: Arc::new(chain),
            robots: Arc::new(robots),
            user_agents: Arc::new(TokioMutex::new(user_agents)),
        })
    }

    /// Replace the filter chain built from config
    pub fn with_chain(mut self, chain: FilterChain) -> Self {
        self.chain = Arc::new(chain);
        self
    }

    /// Replace the robots.txt engine
    pub fn with_robots(mut self, robots: RobotsPolicyEngine) -> Self {
        self.robots = Arc::new(robots);
        self
    }

    /// User-Agent to send upstream
    ///
    /// The rotator wins; with robots.txt ignored the proxy names itself;
    /// otherwise the client's own header is kept.
    async fn outbound_user_agent(&self, client_headers: &HeaderMap) -> Option<String> {
        if let Some(user_agent) = self.user_agents.lock().await.current_user_agent() {
            return Some(user_agent);
        }
        if self.config.server.ignore_robots_txt {
            return Some(PROXY_USER_AGENT.to_string());
        }
        client_headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// The main proxy server
pub struct ProxyServer {
    config: Config,
}

impl ProxyServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Start the proxy server and listen for requests
    pub async fn serve(&self) -> Result<()> {
        let state = AppState::new(self.config.clone())?;

        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .map_err(|e| SubtractError::Config(format!("Invalid listen address: {e}")))?;

        tracing::info!("Starting proxy server on {addr}");
        tracing::info!("Dynamic passthrough enabled via /p/{{url}}");
        if state.chain.is_empty() {
            tracing::info!("No response filters configured");
        } else {
            tracing::info!("Response filters: {}", state.chain.names().join(", "));
        }
        if self.config.server.ignore_robots_txt {
            tracing::info!("robots.txt enforcement: disabled");
        } else {
            tracing::info!("robots.txt enforcement: enabled");
        }

        let app = create_router(Arc::new(state));

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SubtractError::Proxy(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| SubtractError::Proxy(format!("Server error: {e}")))?;

        tracing::info!("Proxy server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/favicon.ico", any(favicon_handler))
        .route("/p/{*upstream_url}", any(dynamic_proxy_handler))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint, unless the request is aimed at another host
async fn health_handler(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response<Body> {
    if request.uri().authority().is_some() {
        return proxy_handler(State(state), request).await;
    }
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn favicon_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Handle dynamic passthrough requests via /p/{url}
async fn dynamic_proxy_handler(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response<Body> {
    // Raw path, so percent-encoded targets are decoded exactly once
    let uri = request.uri().clone();
    let target = match UpstreamTarget::from_path(uri.path(), uri.query()) {
        Ok(t) => t,
        Err(e) => return invalid_target(&e),
    };

    tracing::debug!("Proxying dynamic request to: {}", target.url);
    forward_or_error(&state, target, request).await
}

/// Handle regular forward-proxy requests
async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response<Body> {
    let target = match UpstreamTarget::from_request(request.uri(), request.headers()) {
        Ok(t) => t,
        Err(e) => return invalid_target(&e),
    };

    tracing::debug!("Proxying request to: {}", target.url);
    forward_or_error(&state, target, request).await
}

fn invalid_target(err: &SubtractError) -> Response<Body> {
    tracing::warn!("Invalid proxy target: {err}");
    create_error_response(
        StatusCode::BAD_REQUEST,
        "INVALID_TARGET",
        &format!("Invalid upstream URL: {err}"),
    )
}

async fn forward_or_error(
    state: &AppState,
    target: UpstreamTarget,
    request: Request<Body>,
) -> Response<Body> {
    match forward_request(state, &target, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(url = %target.url, "Proxy request failed: {e}");
            error_response(&e, state.config.server.development)
        }
    }
}

/// Forward a request upstream and run the response through the filter chain
async fn forward_request(
    state: &AppState,
    target: &UpstreamTarget,
    request: Request<Body>,
) -> Result<Response<Body>> {
    let (parts, body) = request.into_parts();
    let original_url = original_url(&parts.uri);
    let user_agent = state.outbound_user_agent(&parts.headers).await;

    if !state.config.server.ignore_robots_txt {
        let agent = user_agent.as_deref().unwrap_or("*");
        match state
            .robots
            .is_blocked(&target.authority(), &target.path_and_query(), agent)
            .await
        {
            Ok(true) => {
                tracing::info!(url = %target.url, user_agent = agent, "Blocked by robots.txt");
                return Ok(create_error_response(
                    StatusCode::FORBIDDEN,
                    "ROBOTS_DISALLOWED",
                    &format!("Access to {} is disallowed by robots.txt", target.url),
                ));
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("robots.txt check failed for {}, allowing: {e}", target.host);
            }
        }
    }

    let headers = outbound_headers(&parts.headers, user_agent.as_deref());

    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| SubtractError::Proxy(format!("Failed to read request body: {e}")))?;

    let response = state
        .client
        .request(parts.method.clone(), target.url.clone())
        .headers(headers)
        .body(body_bytes)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                SubtractError::Proxy(format!("Upstream request timed out: {e}"))
            } else if e.is_connect() {
                SubtractError::Network(format!("Failed to connect to upstream: {e}"))
            } else {
                SubtractError::Proxy(format!("Upstream request failed: {e}"))
            }
        })?;

    let status = response.status();
    let upstream_headers = response.headers().clone();
    tracing::debug!(url = %target.url, %status, "Upstream responded");

    let ctx = ProxyContext::new(original_url, parts.method)
        .with_response(status, upstream_headers.clone())
        .with_user_agent(user_agent);

    let mut interceptor = Interceptor::new(Arc::clone(&state.chain));
    match interceptor
        .intercept(status, &upstream_headers, response.bytes_stream(), &ctx)
        .await?
    {
        Intercepted::Buffer(buffer) => Ok(buffer.into_response()),
        Intercepted::Redirect(location) => redirect(&location),
    }
}

/// Request URI as the client sent it
fn original_url(uri: &Uri) -> String {
    if uri.authority().is_some() {
        uri.to_string()
    } else {
        uri.path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    }
}

/// Client headers minus hop-by-hop and encoding negotiation, with the outbound User-Agent
fn outbound_headers(client_headers: &HeaderMap, user_agent: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(client_headers.len());
    for (name, value) in client_headers {
        if is_hop_by_hop(name.as_str())
            || name == header::ACCEPT_ENCODING
            || name == header::CONTENT_LENGTH
            || name == header::USER_AGENT
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(value) = user_agent.and_then(|ua| HeaderValue::from_str(ua).ok()) {
        headers.insert(header::USER_AGENT, value);
    }
    headers
}

fn redirect(location: &str) -> Result<Response<Body>> {
    let value = HeaderValue::from_str(location)
        .map_err(|e| SubtractError::General(format!("Invalid redirect location '{location}': {e}")))?;

    tracing::debug!("Redirecting to {location}");
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(header::LOCATION, value);
    Ok(response)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
