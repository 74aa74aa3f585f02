//! Rule file model and loader
//!
//! The rule file is JSON in camelCase:
//!
//! ```json
//! {
//!   "enabled": true,
//!   "ruleSets": [{
//!     "name": "ads",
//!     "enabled": true,
//!     "condition": { "urlPattern": "example\\.com" },
//!     "rules": [
//!       { "name": "banner", "selector": ".ad", "action": "remove", "priority": 10 },
//!       { "name": "tracking", "pattern": "utm_.*", "action": "remove-param" }
//!     ]
//!   }],
//!   "paramRules": [{ "name": "fbclid", "pattern": "^fbclid$" }]
//! }
//! ```

use serde::Deserialize;
use std::path::Path;
use uuid::Uuid;

use crate::error::{Result, SubtractError};

/// How a rule locates what it acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum MatchType {
    #[serde(rename = "regex")]
    Regex,
    #[serde(rename = "selector", alias = "css")]
    Selector,
    #[serde(rename = "removeParam", alias = "remove-param")]
    RemoveParam,
}

/// What a rule does with a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Remove,
    Replace,
    #[serde(rename = "remove-param", alias = "removeParam")]
    RemoveParam,
    /// Reserved, applies nothing
    Modify,
    /// Reserved, applies nothing
    Block,
    /// Any other action loads but applies nothing
    #[serde(other)]
    Unknown,
}

/// A single content rule
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawRule")]
pub struct FilterRule {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub match_type: MatchType,
    /// Regex for pattern and param rules, CSS selector for selector rules
    pub pattern: String,
    pub action: RuleAction,
    /// Higher runs earlier
    pub priority: i64,
    pub enabled: bool,
    pub replacement: Option<String>,
    pub case_sensitive: bool,
}

impl FilterRule {
    /// Regex rule with default settings
    pub fn regex(name: &str, pattern: &str, action: RuleAction) -> Self {
        Self::build(name, MatchType::Regex, pattern, action)
    }

    /// CSS selector rule with default settings
    pub fn selector(name: &str, selector: &str, action: RuleAction) -> Self {
        Self::build(name, MatchType::Selector, selector, action)
    }

    fn build(name: &str, match_type: MatchType, pattern: &str, action: RuleAction) -> Self {
        Self {
            id: generate_rule_id(),
            name: name.to_string(),
            description: None,
            match_type,
            pattern: pattern.to_string(),
            action,
            priority: 0,
            enabled: true,
            replacement: None,
            case_sensitive: false,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = Some(replacement.into());
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

fn generate_rule_id() -> String {
    format!("rule_{}", Uuid::new_v4().simple())
}

fn default_true() -> bool {
    true
}

/// On-disk rule shape before the match type is settled
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRule {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    match_type: Option<MatchType>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    selector: Option<String>,
    action: RuleAction,
    #[serde(default)]
    priority: i64,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    replacement: Option<String>,
    #[serde(default)]
    case_sensitive: bool,
}

impl TryFrom<RawRule> for FilterRule {
    type Error = String;

    fn try_from(raw: RawRule) -> std::result::Result<Self, Self::Error> {
        let match_type = match (raw.match_type, raw.action) {
            (Some(explicit), _) => explicit,
            (None, RuleAction::RemoveParam) => MatchType::RemoveParam,
            (None, _) if raw.selector.is_some() => MatchType::Selector,
            (None, _) if raw.pattern.is_some() => MatchType::Regex,
            (None, _) => {
                return Err(format!(
                    "rule '{}' needs a selector or a pattern",
                    raw.name
                ));
            }
        };

        let pattern = match match_type {
            MatchType::Selector => raw.selector.or(raw.pattern),
            MatchType::Regex | MatchType::RemoveParam => raw.pattern.or(raw.selector),
        }
        .unwrap_or_default();

        Ok(FilterRule {
            id: raw.id.unwrap_or_else(generate_rule_id),
            name: raw.name,
            description: raw.description,
            match_type,
            pattern,
            action: raw.action,
            priority: raw.priority,
            enabled: raw.enabled,
            replacement: raw.replacement,
            case_sensitive: raw.case_sensitive,
        })
    }
}

/// Header predicate of a rule set condition
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeaderPattern {
    pub name: String,
    pub value: String,
}

/// Gate deciding whether a rule set applies to a request
///
/// Every present predicate must match.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    #[serde(default)]
    pub url_pattern: Option<String>,
    #[serde(default)]
    pub content_type_pattern: Option<String>,
    #[serde(default)]
    pub header_pattern: Option<HeaderPattern>,
}

/// A named, conditionally gated group of rules
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuleSet {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub condition: Option<RuleCondition>,
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

impl RuleSet {
    pub fn new(name: impl Into<String>, rules: Vec<FilterRule>) -> Self {
        Self {
            name: name.into(),
            description: None,
            enabled: true,
            condition: None,
            rules,
        }
    }

    pub fn with_condition(mut self, condition: RuleCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Query parameter removal rule
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParamRule {
    pub name: String,
    /// Regex over parameter names, unanchored
    pub pattern: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ParamRule {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            enabled: true,
        }
    }
}

/// Parsed rule file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleFileConfig {
    pub enabled: bool,
    pub rule_sets: Vec<RuleSet>,
    #[serde(default)]
    pub param_rules: Vec<ParamRule>,
}

impl RuleFileConfig {
    /// Param rules drawn from enabled rule sets, followed by top-level `paramRules`
    pub fn collect_param_rules(&self) -> Vec<ParamRule> {
        let from_sets = self
            .rule_sets
            .iter()
            .filter(|set| set.enabled)
            .flat_map(|set| set.rules.iter())
            .filter(|rule| rule.enabled && rule.action == RuleAction::RemoveParam)
            .map(|rule| ParamRule::new(rule.name.clone(), rule.pattern.clone()));

        let top_level = self.param_rules.iter().filter(|rule| rule.enabled).cloned();

        from_sets.chain(top_level).collect()
    }
}

/// Check the fields every rule needs
pub fn validate_rule(rule: &FilterRule) -> Result<()> {
    if rule.name.trim().is_empty() {
        return Err(SubtractError::Config(format!(
            "Rule {} has an empty name",
            rule.id
        )));
    }
    if rule.pattern.is_empty() {
        return Err(SubtractError::Config(format!(
            "Rule '{}' has an empty pattern",
            rule.name
        )));
    }
    Ok(())
}

/// Parse rule file contents
///
/// `enabled` must be a boolean and `ruleSets` an array; anything else is a
/// configuration error.
pub fn parse_filter_config(json: &str) -> Result<RuleFileConfig> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| SubtractError::Config(format!("Invalid filter config JSON: {e}")))?;

    if !value.get("enabled").is_some_and(|v| v.is_boolean()) {
        return Err(SubtractError::Config(
            "Filter config 'enabled' must be a boolean".into(),
        ));
    }
    if !value.get("ruleSets").is_some_and(|v| v.is_array()) {
        return Err(SubtractError::Config(
            "Filter config 'ruleSets' must be an array".into(),
        ));
    }

    let config: RuleFileConfig = serde_json::from_value(value)
        .map_err(|e| SubtractError::Config(format!("Invalid filter config: {e}")))?;

    for rule in config.rule_sets.iter().flat_map(|set| set.rules.iter()) {
        validate_rule(rule)?;
    }
    for param in &config.param_rules {
        if param.pattern.is_empty() {
            return Err(SubtractError::Config(format!(
                "Param rule '{}' has an empty pattern",
                param.name
            )));
        }
    }

    Ok(config)
}

/// Read and parse a rule file from disk
pub fn load_filter_config(path: &Path) -> Result<RuleFileConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        SubtractError::Config(format!(
            "Failed to read filter config {}: {e}",
            path.display()
        ))
    })?;
    parse_filter_config(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_rule_file() {
        let json = r#"{
            "enabled": true,
            "ruleSets": [{
                "name": "ads",
                "enabled": true,
                "condition": {
                    "urlPattern": "example\\.com",
                    "headerPattern": { "name": "x-mode", "value": "strict" }
                },
                "rules": [
                    { "name": "banner", "enabled": true, "selector": ".ad", "action": "remove", "priority": 10 },
                    { "name": "swear", "enabled": true, "pattern": "darn", "action": "replace", "replacement": "d**n", "caseSensitive": true },
                    { "id": "keep-me", "name": "tracking", "enabled": true, "pattern": "utm_.*", "action": "remove-param" }
                ]
            }],
            "paramRules": [{ "name": "fbclid", "pattern": "^fbclid$", "enabled": true }]
        }"#;

        let config = parse_filter_config(json).unwrap();
        assert!(config.enabled);
        let set = &config.rule_sets[0];
        assert_eq!(
            set.condition.as_ref().unwrap().url_pattern.as_deref(),
            Some("example\\.com")
        );

        let banner = &set.rules[0];
        assert_eq!(banner.match_type, MatchType::Selector);
        assert_eq!(banner.pattern, ".ad");
        assert_eq!(banner.priority, 10);
        assert!(banner.id.starts_with("rule_"));

        let swear = &set.rules[1];
        assert_eq!(swear.match_type, MatchType::Regex);
        assert!(swear.case_sensitive);
        assert_eq!(swear.replacement.as_deref(), Some("d**n"));

        let tracking = &set.rules[2];
        assert_eq!(tracking.id, "keep-me");
        assert_eq!(tracking.match_type, MatchType::RemoveParam);
        assert_eq!(tracking.action, RuleAction::RemoveParam);

        let params = config.collect_param_rules();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].pattern, "utm_.*");
        assert_eq!(params[1].pattern, "^fbclid$");
    }

    #[test]
    fn test_explicit_match_type_and_defaults() {
        let json = r#"{
            "enabled": true,
            "ruleSets": [{
                "name": "s",
                "rules": [
                    { "name": "r", "matchType": "css", "pattern": "nav", "action": "remove" },
                    { "name": "p", "matchType": "removeParam", "pattern": "ref", "action": "removeParam" }
                ]
            }]
        }"#;

        let config = parse_filter_config(json).unwrap();
        let set = &config.rule_sets[0];
        assert!(set.enabled);
        assert_eq!(set.rules[0].match_type, MatchType::Selector);
        assert_eq!(set.rules[0].pattern, "nav");
        assert_eq!(set.rules[0].priority, 0);
        assert!(set.rules[0].enabled);
        assert_eq!(set.rules[1].action, RuleAction::RemoveParam);
    }

    #[test]
    fn test_enabled_must_be_boolean() {
        let err = parse_filter_config(r#"{"enabled": "yes", "ruleSets": []}"#).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(err.to_string().contains("enabled"));

        assert!(parse_filter_config(r#"{"ruleSets": []}"#).is_err());
    }

    #[test]
    fn test_rule_sets_must_be_array() {
        let err = parse_filter_config(r#"{"enabled": true, "ruleSets": {}}"#).unwrap_err();
        assert!(err.to_string().contains("ruleSets"));
    }

    #[test]
    fn test_rule_without_locator_is_rejected() {
        let json = r#"{
            "enabled": true,
            "ruleSets": [{ "name": "s", "rules": [{ "name": "r", "action": "remove" }] }]
        }"#;
        assert!(parse_filter_config(json).is_err());
    }

    #[test]
    fn test_validate_rule() {
        assert!(validate_rule(&FilterRule::regex("ok", "x", RuleAction::Remove)).is_ok());
        assert!(validate_rule(&FilterRule::regex(" ", "x", RuleAction::Remove)).is_err());
        assert!(validate_rule(&FilterRule::regex("empty", "", RuleAction::Remove)).is_err());
    }

    #[test]
    fn test_disabled_sets_contribute_no_param_rules() {
        let mut set = RuleSet::new(
            "off",
            vec![FilterRule {
                match_type: MatchType::RemoveParam,
                ..FilterRule::regex("utm", "utm_", RuleAction::RemoveParam)
            }],
        );
        set.enabled = false;

        let config = RuleFileConfig {
            enabled: true,
            rule_sets: vec![set],
            param_rules: vec![],
        };
        assert!(config.collect_param_rules().is_empty());
    }

    #[test]
    fn test_load_filter_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"{"enabled": false, "ruleSets": []}"#).unwrap();

        let config = load_filter_config(&path).unwrap();
        assert!(!config.enabled);

        let missing = load_filter_config(&dir.path().join("nope.json")).unwrap_err();
        assert_eq!(missing.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_unsupported_actions_still_load() {
        let json = r#"{
            "enabled": true,
            "ruleSets": [{
                "name": "s",
                "rules": [
                    { "name": "keep", "pattern": "a", "action": "replace", "replacement": "b" },
                    { "name": "stop", "pattern": "x", "action": "block" },
                    { "name": "later", "pattern": "y", "action": "quarantine" }
                ]
            }]
        }"#;

        let config = parse_filter_config(json).unwrap();
        let actions: Vec<RuleAction> = config.rule_sets[0].rules.iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            [RuleAction::Replace, RuleAction::Block, RuleAction::Unknown]
        );
    }

    #[test]
    fn test_param_rules_are_selected_by_action() {
        let json = r#"{
            "enabled": true,
            "ruleSets": [{
                "name": "s",
                "rules": [
                    { "name": "explicit", "matchType": "regex", "pattern": "^ref$", "action": "remove-param" },
                    { "name": "text", "pattern": "utm", "action": "remove" }
                ]
            }]
        }"#;

        let params = parse_filter_config(json).unwrap().collect_param_rules();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "explicit");
        assert_eq!(params[0].pattern, "^ref$");
    }
}
