//! robots.txt parsing and path matching

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};

/// Directives for one `User-agent` group
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyBlock {
    /// Lower-cased agent name, `*` for the wildcard group
    pub user_agent: String,
    pub allow: Vec<PathPattern>,
    pub disallow: Vec<PathPattern>,
    pub crawl_delay: Option<f64>,
}

impl PolicyBlock {
    fn new(user_agent: &str) -> Self {
        Self {
            user_agent: user_agent.to_lowercase(),
            allow: Vec::new(),
            disallow: Vec::new(),
            crawl_delay: None,
        }
    }

    /// Allow rules win over disallow rules
    pub fn is_blocked(&self, path: &str) -> bool {
        if self.allow.iter().any(|p| p.matches(path)) {
            return false;
        }
        self.disallow.iter().any(|p| p.matches(path))
    }
}

/// A compiled `Allow` or `Disallow` value
///
/// `*` matches any run of characters and a trailing `$` anchors the end.
/// Everything else is literal, case-insensitive and anchored at the start.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    regex: Regex,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Option<Self> {
        let (body, anchored) = match pattern.strip_suffix('$') {
            Some(body) => (body, true),
            None => (pattern, false),
        };

        let mut source = String::from("^");
        source.push_str(
            &body
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*"),
        );
        if anchored {
            source.push('$');
        }

        let regex = RegexBuilder::new(&source)
            .case_insensitive(true)
            .build()
            .ok()?;
        Some(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

/// Parse robots.txt into policy blocks, in file order
///
/// Each `User-agent` line opens a new block. Directives before the first
/// `User-agent`, unknown directives and empty values are ignored.
pub fn parse_robots_txt(content: &str) -> Vec<PolicyBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<PolicyBlock> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_lowercase();
        let value = value.trim();

        if field == "user-agent" {
            if let Some(done) = current.take() {
                blocks.push(done);
            }
            current = Some(PolicyBlock::new(value));
            continue;
        }

        let Some(block) = current.as_mut() else {
            continue;
        };
        match field.as_str() {
            "allow" if !value.is_empty() => block.allow.extend(PathPattern::new(value)),
            "disallow" if !value.is_empty() => block.disallow.extend(PathPattern::new(value)),
            "crawl-delay" => {
                if let Ok(delay) = value.parse::<f64>() {
                    block.crawl_delay = Some(delay);
                }
            }
            _ => {}
        }
    }

    if let Some(done) = current {
        blocks.push(done);
    }
    blocks
}

/// Match a request path against a single robots.txt pattern
pub fn path_matches(path: &str, pattern: &str) -> bool {
    PathPattern::new(pattern).is_some_and(|p| p.matches(path))
}

/// A fetched and parsed robots.txt
#[derive(Debug, Clone)]
pub struct RobotsPolicy {
    pub domain: String,
    pub blocks: Vec<PolicyBlock>,
    /// Raw robots.txt text
    pub content: String,
    pub fetched_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

impl RobotsPolicy {
    pub fn new(domain: &str, content: String, ttl: chrono::Duration) -> Self {
        let fetched_at = Utc::now();
        Self {
            domain: domain.to_string(),
            blocks: parse_robots_txt(&content),
            content,
            fetched_at,
            expiry: fetched_at + ttl,
        }
    }

    /// Cache entry validity
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry
    }

    /// Block for `user_agent`, falling back to the `*` block
    pub fn find_block(&self, user_agent: &str) -> Option<&PolicyBlock> {
        let user_agent = user_agent.to_lowercase();
        self.blocks
            .iter()
            .find(|b| b.user_agent == user_agent)
            .or_else(|| self.blocks.iter().find(|b| b.user_agent == "*"))
    }

    pub fn is_blocked(&self, path: &str, user_agent: &str) -> bool {
        self.find_block(user_agent)
            .is_some_and(|block| block.is_blocked(path))
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<f64> {
        self.find_block(user_agent).and_then(|b| b.crawl_delay)
    }
}
