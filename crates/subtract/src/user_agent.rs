//! Outbound User-Agent selection
//!
//! Behavior by configuration:
//! - disabled: no value, the client's own header is used
//! - fixed `value`: always that value
//! - `rotate`: round robin over a pool shuffled whenever it is rebuilt
//! - otherwise: the first pool entry

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::config::UserAgentConfig;

/// User-Agent the proxy identifies itself with
pub const PROXY_USER_AGENT: &str = "SubtractProxy/1.0";

/// Built-in pool of desktop and mobile browser strings
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_3_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.6261.90 Mobile Safari/537.36",
];

/// Hands out User-Agent strings according to the rotation policy
#[derive(Debug)]
pub struct UserAgentRotator {
    config: UserAgentConfig,
    pool: Vec<String>,
    index: usize,
    rng: StdRng,
}

impl UserAgentRotator {
    pub fn new(config: UserAgentConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Rotator with deterministic shuffling
    pub fn with_seed(config: UserAgentConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: UserAgentConfig, rng: StdRng) -> Self {
        let mut rotator = Self {
            config,
            pool: Vec::new(),
            index: 0,
            rng,
        };
        rotator.reset();
        rotator
    }

    /// Value to send upstream, `None` when rewriting is disabled
    pub fn current_user_agent(&mut self) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        if let Some(value) = self.config.value.as_ref().filter(|v| !v.is_empty()) {
            return Some(value.clone());
        }

        if self.pool.is_empty() {
            return None;
        }

        if self.config.rotate {
            let user_agent = self.pool[self.index % self.pool.len()].clone();
            self.index = (self.index + 1) % self.pool.len();
            return Some(user_agent);
        }

        self.pool.first().cloned()
    }

    /// Append `user_agent` unless already pooled; never reshuffles
    pub fn add_user_agent(&mut self, user_agent: impl Into<String>) {
        let user_agent = user_agent.into();
        if !self.pool.contains(&user_agent) {
            debug!("Added user agent to pool: {}", user_agent);
            self.pool.push(user_agent);
        }
    }

    /// Rebuild the pool from presets or the defaults, dropping added entries
    pub fn reset(&mut self) {
        let base: Vec<String> = match &self.config.presets {
            Some(presets) => presets.clone(),
            None => DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
        };

        self.pool.clear();
        for user_agent in base {
            if !self.pool.contains(&user_agent) {
                self.pool.push(user_agent);
            }
        }
        self.index = 0;

        if self.config.rotate {
            self.pool.shuffle(&mut self.rng);
        }
    }

    /// Current pool order
    pub fn pool(&self) -> &[String] {
        &self.pool
    }
}
