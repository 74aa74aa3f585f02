//! Rule-based content rewriting
//!
//! Rule sets are compiled once. Per request the engine picks the rule sets
//! whose condition matches, then rewrites the body according to its content
//! category:
//!
//! - HTML: selector rules on the DOM first, then pattern rules on text nodes
//! - JSON: pattern rules on every string leaf
//! - plain text: pattern rules on the raw body
//! - anything else: untouched
//!
//! Any failure returns the original content.

use regex::{NoExpand, Regex, RegexBuilder};
use scraper::Selector;
use std::borrow::Cow;
use tracing::{debug, warn};

use super::html::HtmlDocument;
use super::rules::{FilterRule, MatchType, RuleAction, RuleFileConfig, RuleSet, validate_rule};
use super::ContentCategory;
use crate::error::{Result, SubtractError};
use crate::proxy::ProxyContext;

enum Matcher {
    Pattern(Regex),
    Selector(Selector),
    /// Handled by the param filter, skipped here
    Param,
}

struct CompiledRule {
    rule: FilterRule,
    matcher: Matcher,
    /// Replacement rewritten into regex expansion syntax
    template: Option<String>,
}

impl CompiledRule {
    fn compile(rule: FilterRule) -> Result<Self> {
        validate_rule(&rule)?;

        let matcher = match rule.match_type {
            MatchType::Regex => Matcher::Pattern(
                RegexBuilder::new(&rule.pattern)
                    .case_insensitive(!rule.case_sensitive)
                    .build()
                    .map_err(|e| {
                        SubtractError::Config(format!(
                            "Rule '{}' has an invalid pattern: {e}",
                            rule.name
                        ))
                    })?,
            ),
            MatchType::Selector => Matcher::Selector(Selector::parse(&rule.pattern).map_err(
                |e| {
                    SubtractError::Config(format!(
                        "Rule '{}' has an invalid selector '{}': {e:?}",
                        rule.name, rule.pattern
                    ))
                },
            )?),
            MatchType::RemoveParam => Matcher::Param,
        };

        let template = match (&matcher, &rule.replacement) {
            (Matcher::Pattern(regex), Some(replacement)) => {
                Some(expansion_template(replacement, regex))
            }
            _ => None,
        };

        Ok(Self {
            rule,
            matcher,
            template,
        })
    }

    /// Rewrite `text` with this pattern rule, `None` when nothing changed
    fn rewrite(&self, text: &str) -> Option<String> {
        let Matcher::Pattern(regex) = &self.matcher else {
            return None;
        };

        let replaced = match (self.rule.action, &self.template) {
            (RuleAction::Remove, _) => regex.replace_all(text, NoExpand("")),
            (RuleAction::Replace, Some(template)) => regex.replace_all(text, template.as_str()),
            _ => return None,
        };

        match replaced {
            Cow::Borrowed(_) => None,
            Cow::Owned(s) => Some(s),
        }
    }

    fn is_pattern(&self) -> bool {
        matches!(self.matcher, Matcher::Pattern(_))
    }
}

/// Rewrite a replacement string into `regex` expansion syntax
///
/// `$n` and `$nn` refer to a group only when the pattern has it, `$&` is the
/// whole match, `$<name>` a named group and `$$` a literal dollar. Any other
/// `$` is kept as written.
fn expansion_template(replacement: &str, regex: &Regex) -> String {
    let groups = regex.captures_len();
    let mut out = String::with_capacity(replacement.len());
    let mut rest = replacement;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        let bytes = tail.as_bytes();

        rest = match bytes.first() {
            Some(b'$') => {
                out.push_str("$$");
                &tail[1..]
            }
            Some(b'&') => {
                out.push_str("${0}");
                &tail[1..]
            }
            Some(b'<') => match tail[1..].find('>') {
                Some(end) if regex.capture_names().flatten().any(|n| n == &tail[1..=end]) => {
                    out.push_str("${");
                    out.push_str(&tail[1..=end]);
                    out.push('}');
                    &tail[end + 2..]
                }
                _ => {
                    out.push_str("$$");
                    tail
                }
            },
            Some(&first) if first.is_ascii_digit() => {
                let one = usize::from(first - b'0');
                let two = bytes
                    .get(1)
                    .filter(|b| b.is_ascii_digit())
                    .map(|&second| one * 10 + usize::from(second - b'0'));

                match two {
                    Some(n) if (1..groups).contains(&n) => {
                        out.push_str(&format!("${{{n}}}"));
                        &tail[2..]
                    }
                    _ if (1..groups).contains(&one) => {
                        out.push_str(&format!("${{{one}}}"));
                        &tail[1..]
                    }
                    _ => {
                        out.push_str("$$");
                        tail
                    }
                }
            }
            _ => {
                out.push_str("$$");
                tail
            }
        };
    }

    out.push_str(rest);
    out
}

struct CompiledCondition {
    url: Option<Regex>,
    content_type: Option<Regex>,
    header: Option<(String, Regex)>,
}

impl CompiledCondition {
    fn matches(&self, ctx: &ProxyContext) -> bool {
        if let Some(url) = &self.url {
            if !url.is_match(&ctx.original_url) {
                return false;
            }
        }
        if let Some(content_type) = &self.content_type {
            if !content_type.is_match(&ctx.content_type) {
                return false;
            }
        }
        if let Some((name, value)) = &self.header {
            if !value.is_match(ctx.header(name)) {
                return false;
            }
        }
        true
    }
}

struct CompiledRuleSet {
    name: String,
    enabled: bool,
    condition: Option<CompiledCondition>,
    /// Enabled rules, highest priority first
    rules: Vec<CompiledRule>,
    /// Priority of the first rule as written in the rule file
    order_key: i64,
}

impl CompiledRuleSet {
    fn compile(set: RuleSet) -> Result<Self> {
        let order_key = set.rules.first().map(|r| r.priority).unwrap_or(0);

        let condition = set
            .condition
            .map(|c| -> Result<CompiledCondition> {
                let compile = |what: &str, pattern: &str| {
                    Regex::new(pattern).map_err(|e| {
                        SubtractError::Config(format!(
                            "Rule set '{}' has an invalid {what} pattern: {e}",
                            set.name
                        ))
                    })
                };
                Ok(CompiledCondition {
                    url: c.url_pattern.as_deref().map(|p| compile("url", p)).transpose()?,
                    content_type: c
                        .content_type_pattern
                        .as_deref()
                        .map(|p| compile("content type", p))
                        .transpose()?,
                    header: c
                        .header_pattern
                        .map(|h| compile("header", &h.value).map(|re| (h.name, re)))
                        .transpose()?,
                })
            })
            .transpose()?;

        let mut rules = set
            .rules
            .into_iter()
            .filter(|r| r.enabled)
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        rules.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));

        Ok(Self {
            name: set.name,
            enabled: set.enabled,
            condition,
            rules,
            order_key,
        })
    }

    fn applies_to(&self, ctx: &ProxyContext) -> bool {
        self.enabled && self.condition.as_ref().is_none_or(|c| c.matches(ctx))
    }
}

/// Applies rule sets to response bodies
pub struct RuleFilterEngine {
    rule_sets: Vec<CompiledRuleSet>,
}

impl RuleFilterEngine {
    /// Compile every rule set of a rule file
    pub fn new(config: &RuleFileConfig) -> Result<Self> {
        Self::from_rule_sets(config.rule_sets.clone())
    }

    /// Compile rule sets; an invalid regex or selector is a configuration error
    pub fn from_rule_sets(rule_sets: Vec<RuleSet>) -> Result<Self> {
        let mut compiled = rule_sets
            .into_iter()
            .map(CompiledRuleSet::compile)
            .collect::<Result<Vec<_>>>()?;

        // Stable, so equal keys keep file order
        compiled.sort_by(|a, b| b.order_key.cmp(&a.order_key));

        debug!(rule_sets = compiled.len(), "Rule filter engine compiled");
        Ok(Self {
            rule_sets: compiled,
        })
    }

    /// Names of the rule sets that apply to `ctx`, in application order
    pub fn applicable_rule_sets<'a>(&'a self, ctx: &'a ProxyContext) -> Vec<&'a str> {
        self.applicable(ctx).map(|s| s.name.as_str()).collect()
    }

    fn applicable<'a>(
        &'a self,
        ctx: &'a ProxyContext,
    ) -> impl Iterator<Item = &'a CompiledRuleSet> + 'a {
        self.rule_sets.iter().filter(move |s| s.applies_to(ctx))
    }

    /// Rewrite `content`; never fails, returning the input on any problem
    pub fn filter(&self, content: &str, ctx: &ProxyContext) -> String {
        let sets: Vec<&CompiledRuleSet> = self.applicable(ctx).collect();
        if sets.is_empty() {
            debug!(url = %ctx.original_url, "No applicable rule sets");
            return content.to_string();
        }

        let result = match ctx.category() {
            ContentCategory::Html => Ok(Self::filter_html(content, &sets)),
            ContentCategory::Json => Self::filter_json(content, &sets),
            ContentCategory::PlainText => Ok(Self::filter_text(content, &sets)),
            ContentCategory::Other => {
                debug!(content_type = %ctx.content_type, "Unsupported content type, passing through");
                Ok(None)
            }
        };

        match result {
            Ok(Some(filtered)) => filtered,
            Ok(None) => content.to_string(),
            Err(e) => {
                warn!(url = %ctx.original_url, "Rule filtering failed: {e}");
                content.to_string()
            }
        }
    }

    fn pattern_rules<'a>(
        sets: &'a [&'a CompiledRuleSet],
    ) -> impl Iterator<Item = &'a CompiledRule> + 'a {
        sets.iter()
            .flat_map(|s| s.rules.iter())
            .filter(|r| r.is_pattern())
    }

    fn filter_html(content: &str, sets: &[&CompiledRuleSet]) -> Option<String> {
        let mut doc = HtmlDocument::parse(content);

        for rule in sets.iter().flat_map(|s| s.rules.iter()) {
            let Matcher::Selector(selector) = &rule.matcher else {
                continue;
            };
            let matched = match (rule.rule.action, &rule.rule.replacement) {
                (RuleAction::Remove, _) => doc.remove_matching(selector),
                (RuleAction::Replace, Some(replacement)) => {
                    doc.replace_matching(selector, replacement)
                }
                _ => 0,
            };
            if matched > 0 {
                debug!(rule = %rule.rule.name, matched, "Selector rule applied");
            }
        }

        for rule in Self::pattern_rules(sets) {
            doc.rewrite_text_nodes(|text| rule.rewrite(text));
        }

        doc.is_modified().then(|| doc.serialize())
    }

    fn filter_json(content: &str, sets: &[&CompiledRuleSet]) -> Result<Option<String>> {
        let mut value: serde_json::Value = serde_json::from_str(content)?;

        let mut changed = false;
        for rule in Self::pattern_rules(sets) {
            changed |= rewrite_strings(&mut value, rule);
        }

        if !changed {
            return Ok(None);
        }
        Ok(Some(serde_json::to_string(&value)?))
    }

    fn filter_text(content: &str, sets: &[&CompiledRuleSet]) -> Option<String> {
        let mut current: Option<String> = None;
        for rule in Self::pattern_rules(sets) {
            let input = current.as_deref().unwrap_or(content);
            if let Some(next) = rule.rewrite(input) {
                current = Some(next);
            }
        }
        current.filter(|s| s != content)
    }
}

impl std::fmt::Debug for RuleFilterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleFilterEngine")
            .field(
                "rule_sets",
                &self.rule_sets.iter().map(|s| &s.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Apply `rule` to every string leaf, returning whether any changed
fn rewrite_strings(value: &mut serde_json::Value, rule: &CompiledRule) -> bool {
    match value {
        serde_json::Value::String(s) => match rule.rewrite(s) {
            Some(next) if next != *s => {
                *s = next;
                true
            }
            _ => false,
        },
        serde_json::Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| rewrite_strings(item, rule) | changed),
        serde_json::Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, item| rewrite_strings(item, rule) | changed),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::rules::{HeaderPattern, RuleCondition};
    use axum::http::{HeaderMap, Method, StatusCode};

    fn ctx(url: &str, content_type: &str) -> ProxyContext {
        ProxyContext::new(url, Method::GET).with_content_type(content_type)
    }

    fn engine(sets: Vec<RuleSet>) -> RuleFilterEngine {
        RuleFilterEngine::from_rule_sets(sets).unwrap()
    }

    #[test]
    fn test_pattern_rules_are_case_insensitive_by_default() {
        let e = engine(vec![RuleSet::new(
            "s",
            vec![FilterRule::regex("r", "foo", RuleAction::Replace).with_replacement("bar")],
        )]);
        assert_eq!(e.filter("Foo foo FOO", &ctx("/", "text/plain")), "bar bar bar");
    }

    #[test]
    fn test_case_sensitive_flag() {
        let e = engine(vec![RuleSet::new(
            "s",
            vec![
                FilterRule::regex("r", "foo", RuleAction::Remove).with_case_sensitive(true),
            ],
        )]);
        assert_eq!(e.filter("Foo foo", &ctx("/", "text/plain")), "Foo ");
    }

    #[test]
    fn test_replace_without_replacement_is_noop() {
        let e = engine(vec![RuleSet::new(
            "s",
            vec![FilterRule::regex("r", "foo", RuleAction::Replace)],
        )]);
        assert_eq!(e.filter("foo", &ctx("/", "text/plain")), "foo");
    }

    #[test]
    fn test_empty_replacement_deletes() {
        let e = engine(vec![RuleSet::new(
            "s",
            vec![FilterRule::regex("r", "o", RuleAction::Replace).with_replacement("")],
        )]);
        assert_eq!(e.filter("foo", &ctx("/", "text/plain")), "f");
    }

    #[test]
    fn test_rule_priority_within_set() {
        let e = engine(vec![RuleSet::new(
            "s",
            vec![
                FilterRule::regex("b", "bar", RuleAction::Replace)
                    .with_replacement("baz")
                    .with_priority(1),
                FilterRule::regex("a", "foo", RuleAction::Replace)
                    .with_replacement("bar")
                    .with_priority(10),
            ],
        )]);
        assert_eq!(e.filter("foo", &ctx("/", "text/plain")), "baz");
    }

    #[test]
    fn test_rule_sets_ordered_by_first_rule_priority() {
        let low = RuleSet::new(
            "low",
            vec![
                FilterRule::regex("l", "bar", RuleAction::Replace)
                    .with_replacement("baz")
                    .with_priority(1),
            ],
        );
        let high = RuleSet::new(
            "high",
            vec![
                FilterRule::regex("h", "foo", RuleAction::Replace)
                    .with_replacement("bar")
                    .with_priority(5),
            ],
        );
        let e = engine(vec![low, high]);
        let c = ctx("/", "text/plain");
        assert_eq!(e.applicable_rule_sets(&c), vec!["high", "low"]);
        assert_eq!(e.filter("foo", &c), "baz");
    }

    #[test]
    fn test_conditions() {
        let set = RuleSet::new(
            "cond",
            vec![FilterRule::regex("r", "x", RuleAction::Remove)],
        )
        .with_condition(RuleCondition {
            url_pattern: Some("example\\.com".into()),
            content_type_pattern: Some("text/".into()),
            header_pattern: Some(HeaderPattern {
                name: "x-mode".into(),
                value: "^strict$".into(),
            }),
        });
        let e = engine(vec![set]);

        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        headers.insert("x-mode", "strict".parse().unwrap());
        let matching = ProxyContext::new("http://example.com/a", Method::GET)
            .with_response(StatusCode::OK, headers.clone());
        assert_eq!(e.filter("xyx", &matching), "y");

        let wrong_url = ProxyContext::new("http://other.org/a", Method::GET)
            .with_response(StatusCode::OK, headers.clone());
        assert_eq!(e.filter("xyx", &wrong_url), "xyx");

        headers.remove("x-mode");
        let missing_header = ProxyContext::new("http://example.com/a", Method::GET)
            .with_response(StatusCode::OK, headers);
        assert_eq!(e.filter("xyx", &missing_header), "xyx");
    }

    #[test]
    fn test_disabled_set_and_rules_are_identity() {
        let mut off = RuleSet::new("off", vec![FilterRule::regex("r", "a", RuleAction::Remove)]);
        off.enabled = false;
        let disabled_rules = RuleSet::new(
            "rules-off",
            vec![FilterRule::regex("r", "a", RuleAction::Remove).disabled()],
        );
        let e = engine(vec![off, disabled_rules]);
        assert_eq!(e.filter("banana", &ctx("/", "text/plain")), "banana");
    }

    #[test]
    fn test_html_selectors_then_text_patterns() {
        let e = engine(vec![RuleSet::new(
            "html",
            vec![
                FilterRule::regex("word", "sponsored", RuleAction::Replace)
                    .with_replacement("[x]")
                    .with_priority(10),
                FilterRule::selector("ads", ".ad", RuleAction::Remove),
                FilterRule::selector("swap", "aside", RuleAction::Replace)
                    .with_replacement("<p>gone</p>"),
            ],
        )]);
        let html = "<html><head></head><body><div class=\"ad\">sponsored</div>\
                    <aside>x</aside><p class=\"sponsored\">Sponsored post</p></body></html>";

        let out = e.filter(html, &ctx("/", "text/html"));
        assert!(!out.contains("class=\"ad\""));
        assert!(out.contains("<p>gone</p>"));
        assert!(out.contains("class=\"sponsored\""));
        assert!(out.contains("[x] post"));
    }

    #[test]
    fn test_html_without_changes_is_returned_verbatim() {
        let e = engine(vec![RuleSet::new(
            "s",
            vec![FilterRule::selector("none", ".absent", RuleAction::Remove)],
        )]);
        let html = "<p>not a full document</p>";
        assert_eq!(e.filter(html, &ctx("/", "text/html")), html);
    }

    #[test]
    fn test_json_string_leaves_rewritten() {
        let e = engine(vec![RuleSet::new(
            "pii",
            vec![
                FilterRule::regex("email", r"[\w.+-]+@[\w-]+\.[\w.]+", RuleAction::Replace)
                    .with_replacement("[email]"),
            ],
        )]);
        let json = r#"{"a":"me@x.io","n":1,"list":[{"b":"you@y.org"},["deep@z.net"]]}"#;
        let out = e.filter(json, &ctx("/", "application/json"));
        assert_eq!(
            out,
            r#"{"a":"[email]","n":1,"list":[{"b":"[email]"},["[email]"]]}"#
        );
    }

    #[test]
    fn test_malformed_json_returns_original() {
        let e = engine(vec![RuleSet::new(
            "s",
            vec![FilterRule::regex("r", "a", RuleAction::Remove)],
        )]);
        assert_eq!(e.filter("{not json", &ctx("/", "application/json")), "{not json");
    }

    #[test]
    fn test_other_content_types_pass_through() {
        let e = engine(vec![RuleSet::new(
            "s",
            vec![FilterRule::regex("r", "a", RuleAction::Remove)],
        )]);
        assert_eq!(e.filter("aaa", &ctx("/", "image/png")), "aaa");
    }

    #[test]
    fn test_invalid_patterns_fail_construction() {
        let bad_regex = RuleFilterEngine::from_rule_sets(vec![RuleSet::new(
            "s",
            vec![FilterRule::regex("bad", "(", RuleAction::Remove)],
        )]);
        assert!(bad_regex.unwrap_err().to_string().contains("bad"));

        let bad_selector = RuleFilterEngine::from_rule_sets(vec![RuleSet::new(
            "s",
            vec![FilterRule::selector("sel", "::::", RuleAction::Remove)],
        )]);
        assert!(bad_selector.is_err());
    }

    #[test]
    fn test_unknown_group_references_stay_literal() {
        let e = engine(vec![RuleSet::new(
            "s",
            vec![FilterRule::regex("price", "price", RuleAction::Replace).with_replacement("$5 off")],
        )]);
        assert_eq!(e.filter("price today", &ctx("/", "text/plain")), "$5 off today");
    }

    #[test]
    fn test_replacement_expansion() {
        let regex = Regex::new(r"(\w+)@(?<host>\w+)").unwrap();
        assert_eq!(expansion_template("$2 at $1", &regex), "${2} at ${1}");
        assert_eq!(expansion_template("$1a", &regex), "${1}a");
        assert_eq!(expansion_template("[$&]", &regex), "[${0}]");
        assert_eq!(expansion_template("$<host>", &regex), "${host}");
        assert_eq!(expansion_template("$<nope> $9 $0", &regex), "$$<nope> $$9 $$0");
        assert_eq!(expansion_template("$$ and $", &regex), "$$ and $$");

        let e = engine(vec![RuleSet::new(
            "s",
            vec![
                FilterRule::regex("swap", r"(\w+)@(\w+)", RuleAction::Replace)
                    .with_replacement("$2 at $1 ($$)"),
            ],
        )]);
        assert_eq!(e.filter("ann@home", &ctx("/", "text/plain")), "home at ann ($)");
    }
}
