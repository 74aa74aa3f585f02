//! robots.txt compliance
//!
//! Policies are fetched from `{scheme}://{domain}/robots.txt`, parsed, and
//! cached per domain until their expiry. A 404 means the site has no policy
//! and nothing is blocked.

pub mod parser;

pub use parser::{PathPattern, PolicyBlock, RobotsPolicy, parse_robots_txt, path_matches};

use chrono::Utc;
use dashmap::DashMap;
use reqwest::{Client, StatusCode, header};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, SubtractError};
use crate::user_agent::PROXY_USER_AGENT;

/// Default policy lifetime
pub const DEFAULT_ROBOTS_TTL: Duration = Duration::from_secs(3600);

/// Fetches, caches and queries robots.txt policies
#[derive(Debug)]
pub struct RobotsPolicyEngine {
    client: Client,
    cache: DashMap<String, Arc<RobotsPolicy>>,
    ttl: Duration,
    scheme: String,
}

impl RobotsPolicyEngine {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: DashMap::new(),
            ttl: DEFAULT_ROBOTS_TTL,
            scheme: "https".to_string(),
        }
    }

    /// Set how long fetched policies stay fresh
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the scheme used to fetch robots.txt
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Policy for `domain`, fetching it unless a fresh one is cached
    ///
    /// Returns `Ok(None)` when the site answers 404. Any other non-2xx status
    /// is a `RobotsFetch` error; transport failures are `Network` errors.
    pub async fn get_policy(
        &self,
        domain: &str,
        force_refresh: bool,
    ) -> Result<Option<Arc<RobotsPolicy>>> {
        if !force_refresh {
            // Clone out so no map guard is held across the fetch below
            let cached = self.cache.get(domain).map(|entry| Arc::clone(entry.value()));
            if let Some(policy) = cached {
                if policy.is_valid(Utc::now()) {
                    debug!("robots.txt cache hit for {}", domain);
                    return Ok(Some(policy));
                }
            }
        }

        let url = format!("{}://{}/robots.txt", self.scheme, domain);
        debug!("Fetching {}", url);

        let response = self
            .client
            .get(&url)
            .header(header::USER_AGENT, PROXY_USER_AGENT)
            .send()
            .await
            .map_err(|e| {
                SubtractError::Network(format!("Failed to fetch robots.txt for {domain}: {e}"))
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            info!("robots.txt not found for {}", domain);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SubtractError::RobotsFetch {
                domain: domain.to_string(),
                status: status.as_u16(),
            });
        }

        let content = response.text().await.map_err(|e| {
            SubtractError::Network(format!("Failed to read robots.txt for {domain}: {e}"))
        })?;

        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1));
        let policy = Arc::new(RobotsPolicy::new(domain, content, ttl));
        self.cache.insert(domain.to_string(), Arc::clone(&policy));
        debug!(
            "robots.txt cached for {} ({} blocks)",
            domain,
            policy.blocks.len()
        );

        Ok(Some(policy))
    }

    /// Whether `path` on `domain` is off limits for `user_agent`
    pub async fn is_blocked(&self, domain: &str, path: &str, user_agent: &str) -> Result<bool> {
        Ok(self
            .get_policy(domain, false)
            .await?
            .is_some_and(|policy| policy.is_blocked(path, user_agent)))
    }

    /// Crawl delay in seconds requested for `user_agent`
    pub async fn crawl_delay(&self, domain: &str, user_agent: &str) -> Result<Option<f64>> {
        Ok(self
            .get_policy(domain, false)
            .await?
            .and_then(|policy| policy.crawl_delay(user_agent)))
    }

    /// Evict one domain, or everything when `domain` is `None`
    pub fn clear_cache(&self, domain: Option<&str>) {
        match domain {
            Some(domain) => {
                self.cache.remove(domain);
                debug!("robots.txt cache cleared for {}", domain);
            }
            None => {
                self.cache.clear();
                debug!("All robots.txt cache cleared");
            }
        }
    }

    pub fn is_cached(&self, domain: &str) -> bool {
        self.cache.contains_key(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine() -> RobotsPolicyEngine {
        RobotsPolicyEngine::new(Client::new()).with_scheme("http")
    }

    fn domain(server: &MockServer) -> String {
        server.address().to_string()
    }

    #[tokio::test]
    async fn test_fetch_sends_proxy_user_agent_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .and(header_eq("user-agent", PROXY_USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /x"))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine();
        let d = domain(&server);
        let policy = engine.get_policy(&d, false).await.unwrap().unwrap();
        assert_eq!(policy.content, "User-agent: *\nDisallow: /x");
        assert!(engine.is_cached(&d));
        assert!(engine.is_blocked(&d, "/x/y", "bot").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *"))
            .expect(2)
            .mount(&server)
            .await;

        let engine = engine().with_ttl(Duration::ZERO);
        let d = domain(&server);
        engine.get_policy(&d, false).await.unwrap();
        engine.get_policy(&d, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *"))
            .mount(&server)
            .await;

        let engine = engine();
        let d = domain(&server);
        engine.get_policy(&d, false).await.unwrap();
        engine.clear_cache(Some(&d));
        assert!(!engine.is_cached(&d));

        engine.get_policy(&d, false).await.unwrap();
        engine.clear_cache(None);
        assert!(!engine.is_cached(&d));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let engine = engine();
        let err = engine.get_policy("127.0.0.1:1", false).await.unwrap_err();
        assert_eq!(err.code(), "NETWORK_ERROR");
    }
}
