//! Prompt templating for remote filters
//!
//! Templates reference variables as `{{name}}`; whitespace inside the
//! braces is ignored. Unknown variables are left in place.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::config::PromptTemplate;
use crate::error::{Result, SubtractError};
use crate::proxy::ProxyContext;

/// Matches `{{ name }}` placeholders
static VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("hardcoded regex pattern is valid"));

/// Variables always available to a template
pub const BUILTIN_VARIABLES: &[&str] = &[
    "content",
    "timestamp",
    "url",
    "method",
    "contentType",
    "userAgent",
];

/// Prompt ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: Option<String>,
}

/// Request metadata exposed to templates
pub fn request_variables(ctx: &ProxyContext) -> HashMap<String, String> {
    HashMap::from([
        ("url".to_string(), ctx.original_url.clone()),
        ("method".to_string(), ctx.method.to_string()),
        ("contentType".to_string(), ctx.content_type.clone()),
        (
            "userAgent".to_string(),
            ctx.user_agent.clone().unwrap_or_default(),
        ),
    ])
}

/// Render both templates
///
/// Precedence, lowest first: `content` and `timestamp`, declared
/// variables, request metadata.
pub fn render(template: &PromptTemplate, content: &str, ctx: &ProxyContext) -> RenderedPrompt {
    let mut vars = HashMap::from([
        ("content".to_string(), content.to_string()),
        ("timestamp".to_string(), chrono::Utc::now().to_rfc3339()),
    ]);
    vars.extend(template.variables.clone());
    vars.extend(request_variables(ctx));

    RenderedPrompt {
        system: replace_variables(&template.system, &vars),
        user: template.user.as_deref().map(|u| replace_variables(u, &vars)),
    }
}

/// Substitute `{{name}}` placeholders from `vars`
pub fn replace_variables(text: &str, vars: &HashMap<String, String>) -> String {
    VAR_REGEX
        .replace_all(text, |caps: &Captures| {
            let name = caps[1].trim();
            match vars.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Names referenced by a template, in order of appearance
pub fn variable_references(text: &str) -> Vec<String> {
    VAR_REGEX
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

/// A template needs a system prompt, and may only reference known variables
pub fn validate_prompt_template(template: &PromptTemplate) -> Result<()> {
    if template.system.trim().is_empty() {
        return Err(SubtractError::Config(
            "Prompt template requires a system prompt".into(),
        ));
    }

    let texts = std::iter::once(template.system.as_str()).chain(template.user.as_deref());
    for text in texts {
        for name in variable_references(text) {
            if !BUILTIN_VARIABLES.contains(&name.as_str()) && !template.variables.contains_key(&name)
            {
                return Err(SubtractError::Config(format!(
                    "Prompt template references undefined variable '{name}'"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    fn template(system: &str, user: Option<&str>) -> PromptTemplate {
        PromptTemplate {
            system: system.to_string(),
            user: user.map(str::to_string),
            variables: HashMap::from([("lang".to_string(), "English".to_string())]),
        }
    }

    #[test]
    fn test_replace_variables() {
        let vars = HashMap::from([("name".to_string(), "world".to_string())]);
        assert_eq!(replace_variables("hello {{name}}", &vars), "hello world");
        assert_eq!(replace_variables("hello {{ name }}", &vars), "hello world");
        assert_eq!(
            replace_variables("keep {{unknown}} as is", &vars),
            "keep {{unknown}} as is"
        );
    }

    #[test]
    fn test_render_with_context() {
        let ctx = ProxyContext::new("http://example.com/a", Method::POST)
            .with_content_type("text/html")
            .with_user_agent(Some("Bot/1".into()));
        let t = template(
            "Summarize in {{lang}} for {{userAgent}}",
            Some("{{method}} {{url}} ({{contentType}}): {{content}}"),
        );

        let rendered = render(&t, "BODY", &ctx);
        assert_eq!(rendered.system, "Summarize in English for Bot/1");
        assert_eq!(
            rendered.user.as_deref(),
            Some("POST http://example.com/a (text/html): BODY")
        );
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let ctx = ProxyContext::new("/", Method::GET);
        let rendered = render(&template("{{timestamp}}", None), "", &ctx);
        assert!(chrono::DateTime::parse_from_rfc3339(&rendered.system).is_ok());
        assert!(rendered.user.is_none());
    }

    #[test]
    fn test_validate_prompt_template() {
        assert!(validate_prompt_template(&template("Use {{lang}} on {{content}}", None)).is_ok());
        assert!(validate_prompt_template(&template("  ", None)).is_err());

        let err = validate_prompt_template(&template("ok", Some("{{missing}}"))).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
