//! JSON error responses
//!
//! Transport failures reach the client as
//! `{"error": {"message", "code", "metadata"?, "stack"?}}`. Filter failures
//! never get here; the chain swallows them.

use axum::{
    body::Body,
    http::{HeaderValue, Response, StatusCode, header},
};
use std::error::Error as _;

use crate::error::SubtractError;

/// Build a JSON error response
pub fn create_error_response(status: StatusCode, code: &str, message: &str) -> Response<Body> {
    json_error(
        status,
        serde_json::json!({
            "error": {
                "message": message,
                "code": code,
            }
        }),
    )
}

/// Response for an error that ended a request
///
/// `development` adds a `stack` field with the debug rendering and source chain.
pub fn error_response(err: &SubtractError, development: bool) -> Response<Body> {
    let mut body = serde_json::json!({
        "message": err.to_string(),
        "code": err.code(),
    });

    if let Some(metadata) = err.metadata() {
        body["metadata"] = metadata;
    }

    if development {
        let mut stack = vec![format!("{err:?}")];
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push(cause.to_string());
            source = cause.source();
        }
        body["stack"] = serde_json::Value::from(stack.join("\n"));
    }

    json_error(err.status_code(), serde_json::json!({ "error": body }))
}

fn json_error(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_error_response() {
        let response =
            create_error_response(StatusCode::BAD_REQUEST, "INVALID_TARGET", "no target");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "INVALID_TARGET");
        assert_eq!(json["error"]["message"], "no target");
    }

    #[tokio::test]
    async fn test_error_response_hides_stack_outside_development() {
        let err = SubtractError::Proxy("upstream timed out".into());
        let response = error_response(&err, false);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "PROXY_ERROR");
        assert!(json["error"].get("stack").is_none());
        assert!(json["error"].get("metadata").is_none());
    }

    #[tokio::test]
    async fn test_error_response_development_mode() {
        let err = SubtractError::RobotsFetch {
            domain: "example.com".into(),
            status: 500,
        };
        let json = body_json(error_response(&err, true)).await;
        assert_eq!(json["error"]["metadata"]["status"], 500);
        assert!(json["error"]["stack"].as_str().unwrap().contains("RobotsFetch"));
    }
}
