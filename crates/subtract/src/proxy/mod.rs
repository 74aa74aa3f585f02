//! Forward proxy surface: routing, upstream forwarding, and response interception

mod context;
mod error;
mod intercept;
mod passthrough;
mod server;

pub use context::ProxyContext;
pub use error::{create_error_response, error_response};
pub use intercept::{
    AbortReason, FinalBuffer, InterceptState, Intercepted, Interceptor, ResponseWriter,
    frame_headers,
};
pub use passthrough::UpstreamTarget;
pub use server::{AppState, HOP_BY_HOP_HEADERS, ProxyServer, create_router, is_hop_by_hop};
