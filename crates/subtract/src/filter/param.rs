//! Query parameter stripping
//!
//! When a request URL carries parameters matched by a param rule the
//! response body is dropped and the client is redirected to the same path
//! without them.

use regex::Regex;
use tracing::debug;
use url::Url;

use super::FilterOutcome;
use super::rules::ParamRule;
use crate::error::{Result, SubtractError};
use crate::proxy::ProxyContext;

/// Base used to resolve origin-form request URLs
const RELATIVE_BASE: &str = "http://localhost";

/// Removes query parameters whose names match any enabled rule
#[derive(Debug)]
pub struct ParamFilter {
    patterns: Vec<(String, Regex)>,
}

impl ParamFilter {
    /// Compile the enabled rules, in order
    pub fn new(rules: &[ParamRule]) -> Result<Self> {
        let patterns = rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| {
                Regex::new(&r.pattern)
                    .map(|re| (r.name.clone(), re))
                    .map_err(|e| {
                        SubtractError::Config(format!(
                            "Param rule '{}' has an invalid pattern: {e}",
                            r.name
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    /// Redirect target with matching parameters removed, `None` when nothing matched
    ///
    /// The target is path plus query, with no scheme or host.
    pub fn strip(&self, original_url: &str) -> Option<String> {
        let mut url = Url::parse(original_url)
            .or_else(|_| Url::parse(RELATIVE_BASE).and_then(|base| base.join(original_url)))
            .ok()?;

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let kept: Vec<&(String, String)> = pairs
            .iter()
            .filter(|(key, _)| {
                let hit = self.patterns.iter().find(|(_, re)| re.is_match(key));
                if let Some((rule, _)) = hit {
                    debug!(param = %key, rule = %rule, "Stripping query parameter");
                }
                hit.is_none()
            })
            .collect();

        if kept.len() == pairs.len() {
            return None;
        }

        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut()
                .clear()
                .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        Some(match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        })
    }

    /// Pass `content` through, or redirect when the URL had parameters to strip
    pub fn apply(&self, content: &str, ctx: &ProxyContext) -> FilterOutcome {
        match self.strip(&ctx.original_url) {
            Some(location) => FilterOutcome::Redirect(location),
            None => FilterOutcome::Content(content.to_string()),
        }
    }
}
