//! Per-request context handed to every filter
//!
//! A `ProxyContext` is built once the upstream response headers arrive and
//! is owned by the handler task serving that request. Filters only read it.

use axum::http::{HeaderMap, Method, StatusCode, header};

use crate::filter::ContentCategory;

/// Read-mostly bag of request/response metadata for one proxied request
#[derive(Debug, Clone)]
pub struct ProxyContext {
    /// The request URI exactly as the client sent it
    pub original_url: String,
    /// Client request method
    pub method: Method,
    /// Upstream response headers
    pub headers: HeaderMap,
    /// Upstream `content-type`, empty when absent
    pub content_type: String,
    /// Upstream response status
    pub status_code: StatusCode,
    /// User-Agent sent upstream, if any
    pub user_agent: Option<String>,
}

impl ProxyContext {
    /// Create a context for a request that has not been answered yet
    pub fn new(original_url: impl Into<String>, method: Method) -> Self {
        Self {
            original_url: original_url.into(),
            method,
            headers: HeaderMap::new(),
            content_type: String::new(),
            status_code: StatusCode::OK,
            user_agent: None,
        }
    }

    /// Attach the upstream response status and headers
    pub fn with_response(mut self, status: StatusCode, headers: HeaderMap) -> Self {
        self.content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.status_code = status;
        self.headers = headers;
        self
    }

    /// Record the User-Agent that was sent upstream
    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Shorthand for building a context around a bare content type
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        if let Ok(value) = content_type.parse() {
            self.headers.insert(header::CONTENT_TYPE, value);
        }
        self.content_type = content_type.to_string();
        self
    }

    /// Value of a response header, empty string when missing or not UTF-8
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    /// Content category of the upstream body
    pub fn category(&self) -> ContentCategory {
        ContentCategory::from_content_type(&self.content_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_response_extracts_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "text/html; charset=utf-8".parse().unwrap());
        headers.insert("x-mode", "strict".parse().unwrap());

        let ctx = ProxyContext::new("http://example.com/", Method::GET)
            .with_response(StatusCode::OK, headers);

        assert_eq!(ctx.content_type, "text/html; charset=utf-8");
        assert_eq!(ctx.category(), ContentCategory::Html);
        assert_eq!(ctx.header("x-mode"), "strict");
        assert_eq!(ctx.header("x-missing"), "");
    }

    #[test]
    fn test_missing_content_type_is_other() {
        let ctx = ProxyContext::new("/", Method::GET).with_response(StatusCode::OK, HeaderMap::new());
        assert_eq!(ctx.content_type, "");
        assert_eq!(ctx.category(), ContentCategory::Other);
    }
}
