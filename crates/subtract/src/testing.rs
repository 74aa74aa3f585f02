//! Test utilities for subtract - shared fixtures
//!
//! Builders for rules and contexts plus an `AppState` wired for local mock
//! servers (plain-HTTP robots.txt, rotation off).

use std::sync::Arc;

use axum::http::{Method, StatusCode};

use crate::config::Config;
use crate::filter::{FilterChain, FilterRule, RuleAction, RuleSet};
use crate::proxy::{AppState, ProxyContext};
use crate::robots::RobotsPolicyEngine;

/// Regex rule with an optional replacement and priority
pub fn pattern_rule(
    name: &str,
    pattern: &str,
    action: RuleAction,
    replacement: Option<&str>,
    priority: i64,
) -> FilterRule {
    let rule = FilterRule::regex(name, pattern, action).with_priority(priority);
    match replacement {
        Some(r) => rule.with_replacement(r),
        None => rule,
    }
}

/// Unconditional, enabled rule set
pub fn rule_set(name: &str, rules: Vec<FilterRule>) -> RuleSet {
    RuleSet::new(name, rules)
}

/// Context for a 200 response of the given content type
pub fn context(url: &str, content_type: &str) -> ProxyContext {
    let mut ctx = ProxyContext::new(url, Method::GET).with_content_type(content_type);
    ctx.status_code = StatusCode::OK;
    ctx
}

/// Shorthand for an HTML response context
pub fn html_context(url: &str) -> ProxyContext {
    context(url, "text/html; charset=utf-8")
}

/// Application state whose robots.txt lookups use plain HTTP
///
/// Suitable for `wiremock` upstreams, which only speak HTTP.
pub fn test_state(config: Config, chain: FilterChain) -> Arc<AppState> {
    let state = AppState::new(config)
        .unwrap_or_else(|e| panic!("Failed to build test state: {e}"))
        .with_chain(chain);
    let robots = RobotsPolicyEngine::new(reqwest::Client::new()).with_scheme("http");
    Arc::new(state.with_robots(robots))
}
