//! Upstream response interception
//!
//! The interceptor buffers the upstream body, runs the filter chain over
//! it, and frames the final response with a recomputed `content-length`.
//!
//! States: `Idle -> Streaming -> Filtering -> Flushing -> Done`. An upstream
//! stream error ends in `Aborted(Upstream)` (502); a failure inside the
//! proxy ends in `Aborted(Handler)` (500).

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, Response, StatusCode, header},
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, error};

use super::{ProxyContext, is_hop_by_hop};
use crate::error::{Result, SubtractError};
use crate::filter::{FilterChain, FilterOutcome};

/// Where the body lives while a response is being produced
///
/// Bytes may only be written or replaced while `Buffering`.
#[derive(Debug)]
pub enum ResponseWriter {
    Buffering(BytesMut),
    Flushed,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::Buffering(BytesMut::new())
    }
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append upstream bytes
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        match self {
            Self::Buffering(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            Self::Flushed => Err(SubtractError::General(
                "Write after response was flushed".into(),
            )),
        }
    }

    /// Bytes buffered so far, empty once flushed
    pub fn buffered(&self) -> &[u8] {
        match self {
            Self::Buffering(buf) => buf,
            Self::Flushed => &[],
        }
    }

    /// Swap the buffered body for filtered content
    pub fn replace(&mut self, body: impl AsRef<[u8]>) -> Result<()> {
        match self {
            Self::Buffering(buf) => {
                buf.clear();
                buf.extend_from_slice(body.as_ref());
                Ok(())
            }
            Self::Flushed => Err(SubtractError::General(
                "Replace after response was flushed".into(),
            )),
        }
    }

    /// Take the final body; no writes are accepted afterwards
    pub fn flush(&mut self) -> Result<Bytes> {
        match std::mem::replace(self, Self::Flushed) {
            Self::Buffering(buf) => Ok(buf.freeze()),
            Self::Flushed => Err(SubtractError::General("Response already flushed".into())),
        }
    }

    pub fn is_flushed(&self) -> bool {
        matches!(self, Self::Flushed)
    }
}

/// Why an interception stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Upstream,
    Handler,
}

impl AbortReason {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AbortReason::Upstream => StatusCode::BAD_GATEWAY,
            AbortReason::Handler => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptState {
    Idle,
    Streaming,
    Filtering,
    Flushing,
    Done,
    Aborted(AbortReason),
}

/// Fully framed response ready to send
#[derive(Debug)]
pub struct FinalBuffer {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FinalBuffer {
    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Result of intercepting one response
#[derive(Debug)]
pub enum Intercepted {
    Buffer(FinalBuffer),
    /// A filter asked for a redirect to this location instead of a body
    Redirect(String),
}

/// Drives one upstream response through the filter chain
pub struct Interceptor {
    chain: Arc<FilterChain>,
    state: InterceptState,
}

impl Interceptor {
    pub fn new(chain: Arc<FilterChain>) -> Self {
        Self {
            chain,
            state: InterceptState::Idle,
        }
    }

    pub fn state(&self) -> InterceptState {
        self.state
    }

    /// Buffer `stream`, filter it, and frame the result
    pub async fn intercept<S, E>(
        &mut self,
        status: StatusCode,
        upstream_headers: &HeaderMap,
        stream: S,
        ctx: &ProxyContext,
    ) -> Result<Intercepted>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let mut stream = std::pin::pin!(stream);
        let mut writer = ResponseWriter::new();

        self.state = InterceptState::Streaming;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => writer
                    .write(&bytes)
                    .map_err(|e| self.abort(AbortReason::Handler, e))?,
                Err(e) => {
                    let err = SubtractError::Proxy(format!("Upstream stream failed: {e}"));
                    return Err(self.abort(AbortReason::Upstream, err));
                }
            }
        }

        self.state = InterceptState::Filtering;
        if let Some(location) = self.apply_chain(&mut writer, ctx).await? {
            self.state = InterceptState::Done;
            return Ok(Intercepted::Redirect(location));
        }

        self.state = InterceptState::Flushing;
        let body = writer
            .flush()
            .map_err(|e| self.abort(AbortReason::Handler, e))?;
        let keep_upstream_length = ctx.method == Method::HEAD;
        let headers = frame_headers(upstream_headers, body.len(), keep_upstream_length);

        self.state = InterceptState::Done;
        Ok(Intercepted::Buffer(FinalBuffer {
            status,
            headers,
            body,
        }))
    }

    /// Run the chain over the buffered body, returning a redirect location if one was requested
    async fn apply_chain(
        &mut self,
        writer: &mut ResponseWriter,
        ctx: &ProxyContext,
    ) -> Result<Option<String>> {
        if self.chain.is_empty() || !ctx.category().is_filterable() {
            return Ok(None);
        }

        let outcome = match std::str::from_utf8(writer.buffered()) {
            Ok(text) => self.chain.run(text, ctx).await,
            Err(_) => {
                debug!(url = %ctx.original_url, "Body is not valid UTF-8, skipping filters");
                return Ok(None);
            }
        };

        match outcome {
            FilterOutcome::Content(filtered) => {
                if filtered.as_bytes() != writer.buffered() {
                    writer
                        .replace(filtered)
                        .map_err(|e| self.abort(AbortReason::Handler, e))?;
                }
                Ok(None)
            }
            FilterOutcome::Redirect(location) => Ok(Some(location)),
        }
    }

    fn abort(&mut self, reason: AbortReason, err: SubtractError) -> SubtractError {
        error!(?reason, "Response interception aborted: {err}");
        self.state = InterceptState::Aborted(reason);
        err
    }
}

/// Copy upstream headers for the client and set `content-length` to `body_len`
///
/// Hop-by-hop headers are dropped and repeated headers keep every value.
/// With `keep_upstream_length` (HEAD responses) the upstream length is kept.
pub fn frame_headers(upstream: &HeaderMap, body_len: usize, keep_upstream_length: bool) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if name == header::CONTENT_LENGTH || is_hop_by_hop(name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let upstream_length = upstream
        .get(header::CONTENT_LENGTH)
        .filter(|_| keep_upstream_length)
        .cloned();
    headers.insert(
        header::CONTENT_LENGTH,
        upstream_length.unwrap_or_else(|| HeaderValue::from(body_len)),
    );
    headers
}
