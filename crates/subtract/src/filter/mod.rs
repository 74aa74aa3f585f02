//! Response filter chain
//!
//! Filters run strictly in registration order. Each one sees the output of
//! the previous stage. A failing stage is skipped and the previous content
//! carried forward; the param filter may end the chain early by asking the
//! proxy to redirect instead of returning a body.

pub mod engine;
pub mod html;
pub mod param;
pub mod rules;

pub use engine::RuleFilterEngine;
pub use html::HtmlDocument;
pub use param::ParamFilter;
pub use rules::{
    FilterRule, HeaderPattern, MatchType, ParamRule, RuleAction, RuleCondition, RuleFileConfig,
    RuleSet, load_filter_config, parse_filter_config, validate_rule,
};

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::proxy::ProxyContext;
use crate::remote::{RemoteFilter, build_remote_filter};

/// Transformation strategy selected by the response content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCategory {
    Html,
    Json,
    PlainText,
    Other,
}

impl ContentCategory {
    /// Classify a `content-type` header value
    pub fn from_content_type(content_type: &str) -> Self {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("text/html") {
            ContentCategory::Html
        } else if content_type.contains("application/json") {
            ContentCategory::Json
        } else if content_type.contains("text/plain") {
            ContentCategory::PlainText
        } else {
            ContentCategory::Other
        }
    }

    /// Whether bodies of this category go through the chain at all
    pub fn is_filterable(&self) -> bool {
        !matches!(self, ContentCategory::Other)
    }
}

/// What a filter hands back to the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Continue with this content
    Content(String),
    /// Stop the chain and redirect the client to this location
    Redirect(String),
}

/// The closed set of filters the chain can hold
pub enum ContentFilter {
    Rule(RuleFilterEngine),
    Param(ParamFilter),
    Remote(RemoteFilter),
}

impl ContentFilter {
    /// Filter name for logging
    pub fn name(&self) -> &str {
        match self {
            ContentFilter::Rule(_) => "CustomRuleFilter",
            ContentFilter::Param(_) => "UrlParamFilter",
            ContentFilter::Remote(filter) => filter.name(),
        }
    }

    /// Run this filter over `content`
    pub async fn apply(&self, content: &str, ctx: &ProxyContext) -> Result<FilterOutcome> {
        match self {
            ContentFilter::Rule(engine) => Ok(FilterOutcome::Content(engine.filter(content, ctx))),
            ContentFilter::Param(filter) => Ok(filter.apply(content, ctx)),
            ContentFilter::Remote(filter) => {
                Ok(FilterOutcome::Content(filter.apply(content, ctx).await))
            }
        }
    }
}

impl std::fmt::Debug for ContentFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContentFilter").field(&self.name()).finish()
    }
}

/// Ordered composition of content filters
#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<ContentFilter>,
}

impl FilterChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter; it runs after every filter already registered
    pub fn push(&mut self, filter: ContentFilter) {
        info!("Filter added: {}", filter.name());
        self.filters.push(filter);
    }

    /// Builder-style `push`
    pub fn with(mut self, filter: ContentFilter) -> Self {
        self.push(filter);
        self
    }

    /// Registered filter names in execution order
    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Thread `content` through every filter
    pub async fn run(&self, content: &str, ctx: &ProxyContext) -> FilterOutcome {
        let mut current = content.to_string();

        for filter in &self.filters {
            match filter.apply(&current, ctx).await {
                Ok(FilterOutcome::Content(next)) => current = next,
                Ok(FilterOutcome::Redirect(location)) => {
                    debug!(filter = filter.name(), %location, "Filter requested redirect");
                    return FilterOutcome::Redirect(location);
                }
                Err(e) => {
                    warn!(
                        filter = filter.name(),
                        error_message = %e,
                        "Filter failed, keeping previous content"
                    );
                }
            }
        }

        FilterOutcome::Content(current)
    }
}

/// Assemble the chain described by the configuration
///
/// Order: rule filter, param filter, remote filter. A rule file that fails
/// to load only disables the rule and param filters.
pub fn build_chain(config: &Config) -> FilterChain {
    let mut chain = FilterChain::new();

    if config.filtering.enabled {
        match &config.filtering.config_path {
            Some(path) => match load_rule_filters(path) {
                Ok(filters) => filters.into_iter().for_each(|f| chain.push(f)),
                Err(e) => error!("Rule filters disabled: {e}"),
            },
            None => warn!("Filtering enabled but no filtering.config_path configured"),
        }
    }

    if config.remote_filter.enabled {
        match build_remote_filter(&config.remote_filter) {
            Ok(filter) => chain.push(ContentFilter::Remote(filter)),
            Err(e) => error!("Remote filter disabled: {e}"),
        }
    }

    chain
}

/// Load a rule file and build the rule filter plus, when needed, the param filter
pub fn load_rule_filters(path: &std::path::Path) -> Result<Vec<ContentFilter>> {
    let config = load_filter_config(path)?;
    create_rule_filters(&config)
}

/// Build the rule-derived filters for an already parsed rule file
pub fn create_rule_filters(config: &RuleFileConfig) -> Result<Vec<ContentFilter>> {
    if !config.enabled {
        return Ok(Vec::new());
    }

    let engine = RuleFilterEngine::new(config)?;
    let param_rules = config.collect_param_rules();

    let mut filters = vec![ContentFilter::Rule(engine)];
    if !param_rules.is_empty() {
        filters.push(ContentFilter::Param(ParamFilter::new(&param_rules)?));
    }
    Ok(filters)
}
