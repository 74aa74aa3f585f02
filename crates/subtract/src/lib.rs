//! Subtract - a forward HTTP proxy that filters what comes back
//!
//! Responses are buffered, threaded through rule-based, remote-model, and
//! URL-parameter filters, and re-framed before they reach the client.
//! Outbound requests honor robots.txt and can rotate their User-Agent.

pub mod config;
pub mod error;
pub mod filter;
pub mod proxy;
pub mod remote;
pub mod robots;
pub mod testing;
pub mod user_agent;

pub use error::SubtractError;
